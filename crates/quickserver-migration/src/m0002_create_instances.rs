use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Instances::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Instances::Id).uuid().not_null().primary_key())
                    .col(ColumnDef::new(Instances::OwnerId).string().not_null())
                    .col(ColumnDef::new(Instances::Status).string().not_null())
                    .col(ColumnDef::new(Instances::Region).string().not_null())
                    .col(ColumnDef::new(Instances::Variant).string().not_null())
                    .col(ColumnDef::new(Instances::GuildId).string().null())
                    .col(ColumnDef::new(Instances::GameHost).string().null())
                    .col(ColumnDef::new(Instances::GamePort).integer().null())
                    .col(ColumnDef::new(Instances::TvHost).string().null())
                    .col(ColumnDef::new(Instances::TvPort).integer().null())
                    .col(ColumnDef::new(Instances::RconHost).string().null())
                    .col(ColumnDef::new(Instances::RconPort).integer().null())
                    .col(ColumnDef::new(Instances::ServerPassword).string().null())
                    .col(ColumnDef::new(Instances::RconPassword).string().null())
                    .col(ColumnDef::new(Instances::TvPassword).string().null())
                    .col(
                        ColumnDef::new(Instances::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Instances::UpdatedAt)
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
                    .name("idx_instances_owner_id")
                    .table(Instances::Table)
                    .col(Instances::OwnerId)
                    .if_not_exists()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_instances_status_created_at")
                    .table(Instances::Table)
                    .col(Instances::Status)
                    .col(Instances::CreatedAt)
                    .if_not_exists()
                    .to_owned(),
            )
            .await?;

        // At most one active instance per owner, enforced by the store itself so that
        // admissions running on different control processes cannot both win.
        manager
            .get_connection()
            .execute_unprepared(
                "CREATE UNIQUE INDEX IF NOT EXISTS idx_instances_one_active_per_owner \
                 ON instances (owner_id) WHERE status IN ('pending', 'ready')",
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Instances::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Instances {
    Table,
    Id,
    OwnerId,
    Status,
    Region,
    Variant,
    GuildId,
    GameHost,
    GamePort,
    TvHost,
    TvPort,
    RconHost,
    RconPort,
    ServerPassword,
    RconPassword,
    TvPassword,
    CreatedAt,
    UpdatedAt,
}
