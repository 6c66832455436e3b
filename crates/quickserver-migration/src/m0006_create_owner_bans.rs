use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(OwnerBans::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(OwnerBans::ExternalIdentity)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(OwnerBans::OwnerId).string().null())
                    .col(ColumnDef::new(OwnerBans::Reason).text().null())
                    .col(
                        ColumnDef::new(OwnerBans::CreatedAt)
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
                    .name("idx_owner_bans_owner_id")
                    .table(OwnerBans::Table)
                    .col(OwnerBans::OwnerId)
                    .if_not_exists()
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(OwnerBans::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum OwnerBans {
    Table,
    ExternalIdentity,
    OwnerId,
    Reason,
    CreatedAt,
}
