use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // Create tables in order of dependencies
        self.create_users_table(manager).await?;
        self.create_series_table(manager).await?;
        self.create_volumes_table(manager).await?;
        self.create_user_volumes_table(manager).await?;

        self.create_indexes(manager).await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // Drop tables in reverse order
        manager
            .drop_table(Table::drop().table(UserVolumes::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Volumes::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Series::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Users::Table).to_owned())
            .await?;

        Ok(())
    }
}

impl Migration {
    async fn create_users_table(&self, manager: &SchemaManager<'_>) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Users::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Users::Id).big_integer().not_null().primary_key())
                    .col(ColumnDef::new(Users::Language).string().not_null().default("en"))
                    .col(ColumnDef::new(Users::Email).string())
                    .col(ColumnDef::new(Users::Password).string())
                    .col(
                        ColumnDef::new(Users::SaveCredentials)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(ColumnDef::new(Users::FileFormat).string().not_null().default("pdf"))
                    .col(ColumnDef::new(Users::CacheExpireDate).timestamp_with_time_zone())
                    .col(
                        ColumnDef::new(Users::NowCaching)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(Users::CacheBuilt)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(Users::LoginError)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(ColumnDef::new(Users::CreatedAt).timestamp_with_time_zone().not_null())
                    .col(ColumnDef::new(Users::UpdatedAt).timestamp_with_time_zone().not_null())
                    .to_owned(),
            )
            .await
    }

    async fn create_series_table(&self, manager: &SchemaManager<'_>) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Series::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Series::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Series::Title).string().not_null())
                    .col(ColumnDef::new(Series::Url).string().not_null().unique_key())
                    .col(ColumnDef::new(Series::ThumbnailUrl).string())
                    .col(ColumnDef::new(Series::ThumbnailLocal).string())
                    .col(ColumnDef::new(Series::CreatedAt).timestamp_with_time_zone().not_null())
                    .to_owned(),
            )
            .await
    }

    async fn create_volumes_table(&self, manager: &SchemaManager<'_>) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Volumes::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Volumes::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Volumes::Title).string().not_null())
                    .col(ColumnDef::new(Volumes::Url).string().not_null().unique_key())
                    .col(ColumnDef::new(Volumes::ThumbnailUrl).string())
                    .col(ColumnDef::new(Volumes::ThumbnailLocal).string())
                    .col(ColumnDef::new(Volumes::Description).text())
                    .col(ColumnDef::new(Volumes::Pages).integer().not_null().default(0))
                    .col(ColumnDef::new(Volumes::SeriesId).integer())
                    .col(
                        ColumnDef::new(Volumes::NowDownloading)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(ColumnDef::new(Volumes::CreatedAt).timestamp_with_time_zone().not_null())
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_volumes_series_id")
                            .from(Volumes::Table, Volumes::SeriesId)
                            .to(Series::Table, Series::Id)
                            .on_delete(ForeignKeyAction::SetNull),
                    )
                    .to_owned(),
            )
            .await
    }

    async fn create_user_volumes_table(&self, manager: &SchemaManager<'_>) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(UserVolumes::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(UserVolumes::UserId).big_integer().not_null())
                    .col(ColumnDef::new(UserVolumes::VolumeId).integer().not_null())
                    .col(
                        ColumnDef::new(UserVolumes::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .primary_key(
                        Index::create()
                            .col(UserVolumes::UserId)
                            .col(UserVolumes::VolumeId),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_user_volumes_user_id")
                            .from(UserVolumes::Table, UserVolumes::UserId)
                            .to(Users::Table, Users::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_user_volumes_volume_id")
                            .from(UserVolumes::Table, UserVolumes::VolumeId)
                            .to(Volumes::Table, Volumes::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await
    }

    async fn create_indexes(&self, manager: &SchemaManager<'_>) -> Result<(), DbErr> {
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_volumes_series_id")
                    .table(Volumes::Table)
                    .col(Volumes::SeriesId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_user_volumes_volume_id")
                    .table(UserVolumes::Table)
                    .col(UserVolumes::VolumeId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }
}

#[derive(DeriveIden)]
pub(crate) enum Users {
    Table,
    Id,
    Language,
    Email,
    Password,
    SaveCredentials,
    FileFormat,
    CacheExpireDate,
    NowCaching,
    CacheBuilt,
    LoginError,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum Series {
    Table,
    Id,
    Title,
    Url,
    ThumbnailUrl,
    ThumbnailLocal,
    CreatedAt,
}

#[derive(DeriveIden)]
enum Volumes {
    Table,
    Id,
    Title,
    Url,
    ThumbnailUrl,
    ThumbnailLocal,
    Description,
    Pages,
    SeriesId,
    NowDownloading,
    CreatedAt,
}

#[derive(DeriveIden)]
enum UserVolumes {
    Table,
    UserId,
    VolumeId,
    CreatedAt,
}
