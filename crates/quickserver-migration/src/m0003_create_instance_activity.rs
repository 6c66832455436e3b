use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(InstanceActivity::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(InstanceActivity::InstanceId)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(InstanceActivity::EmptySince)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(InstanceActivity::LastCheckedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_instance_activity_instance")
                            .from(InstanceActivity::Table, InstanceActivity::InstanceId)
                            .to(Instances::Table, Instances::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(InstanceActivity::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum InstanceActivity {
    Table,
    InstanceId,
    EmptySince,
    LastCheckedAt,
}

#[derive(DeriveIden)]
enum Instances {
    Table,
    Id,
}
