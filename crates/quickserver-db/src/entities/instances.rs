use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "instances")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub owner_id: String,
    pub status: String,
    pub region: String,
    pub variant: String,
    pub guild_id: Option<String>,
    pub game_host: Option<String>,
    pub game_port: Option<i32>,
    pub tv_host: Option<String>,
    pub tv_port: Option<i32>,
    pub rcon_host: Option<String>,
    pub rcon_port: Option<i32>,
    pub server_password: Option<String>,
    pub rcon_password: Option<String>,
    pub tv_password: Option<String>,
    pub created_at: DateTimeWithTimeZone,
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_one = "super::instance_activity::Entity")]
    InstanceActivity,
}

impl Related<super::instance_activity::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::InstanceActivity.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
