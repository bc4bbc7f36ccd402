use sea_orm_migration::prelude::*;

use super::m20250301_000001_initial_schema::Users;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(UploadedArtifacts::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(UploadedArtifacts::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(UploadedArtifacts::UserId).big_integer().not_null())
                    .col(ColumnDef::new(UploadedArtifacts::VolumeId).integer().not_null())
                    .col(ColumnDef::new(UploadedArtifacts::Format).string().not_null())
                    .col(ColumnDef::new(UploadedArtifacts::Url).string().not_null())
                    .col(ColumnDef::new(UploadedArtifacts::DeleteToken).string())
                    .col(
                        ColumnDef::new(UploadedArtifacts::UploadedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_uploaded_artifacts_user_id")
                            .from(UploadedArtifacts::Table, UploadedArtifacts::UserId)
                            .to(Users::Table, Users::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        // Purge scans by age
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_uploaded_artifacts_uploaded_at")
                    .table(UploadedArtifacts::Table)
                    .col(UploadedArtifacts::UploadedAt)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(UploadedArtifacts::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum UploadedArtifacts {
    Table,
    Id,
    UserId,
    VolumeId,
    Format,
    Url,
    DeleteToken,
    UploadedAt,
}
