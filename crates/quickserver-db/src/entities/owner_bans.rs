use sea_orm::entity::prelude::*;

/// A ban matches on the game-platform identity or, when set, the owner id.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "owner_bans")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub external_identity: String,
    pub owner_id: Option<String>,
    #[sea_orm(column_type = "Text", nullable)]
    pub reason: Option<String>,
    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
