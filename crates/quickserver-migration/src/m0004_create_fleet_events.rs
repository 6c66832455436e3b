use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(FleetEvents::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(FleetEvents::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(FleetEvents::ActorId).string().not_null())
                    .col(ColumnDef::new(FleetEvents::Message).text().not_null())
                    .col(
                        ColumnDef::new(FleetEvents::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_fleet_events_created_at")
                    .table(FleetEvents::Table)
                    .col(FleetEvents::CreatedAt)
                    .if_not_exists()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_fleet_events_actor_id")
                    .table(FleetEvents::Table)
                    .col(FleetEvents::ActorId)
                    .if_not_exists()
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(FleetEvents::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum FleetEvents {
    Table,
    Id,
    ActorId,
    Message,
    CreatedAt,
}
