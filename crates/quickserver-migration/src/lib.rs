use sea_orm_migration::prelude::*;

mod m0001_create_owners;
mod m0002_create_instances;
mod m0003_create_instance_activity;
mod m0004_create_fleet_events;
mod m0005_create_guild_parameters;
mod m0006_create_owner_bans;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m0001_create_owners::Migration),
            Box::new(m0002_create_instances::Migration),
            Box::new(m0003_create_instance_activity::Migration),
            Box::new(m0004_create_fleet_events::Migration),
            Box::new(m0005_create_guild_parameters::Migration),
            Box::new(m0006_create_owner_bans::Migration),
        ]
    }
}
