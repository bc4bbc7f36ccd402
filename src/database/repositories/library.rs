//! SeaORM-based library repository implementation

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, IntoActiveModel, QueryFilter,
    QueryOrder, QuerySelect, RelationTrait, Set,
};
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

use super::LibraryRepository;
use crate::entities::prelude::{Series as SeriesEntity, UploadedArtifacts, UserVolumes, Users, Volumes};
use crate::entities::{series, uploaded_artifacts, user_volumes, users, volumes};
use crate::errors::{RepositoryError, RepositoryResult};
use crate::models::{
    FileFormat, Language, NewSeries, NewUploadedArtifact, NewVolume, Series, UploadedArtifact,
    User, UserUpdate, Volume,
};

/// SeaORM-based repository for users, series, volumes and uploads
#[derive(Clone)]
pub struct SeaOrmLibraryRepository {
    connection: Arc<DatabaseConnection>,
}

impl SeaOrmLibraryRepository {
    /// Create a new repository instance
    pub fn new(connection: Arc<DatabaseConnection>) -> Self {
        Self { connection }
    }

    fn user_to_domain(model: users::Model) -> RepositoryResult<User> {
        let language = Language::from_str(&model.language)
            .map_err(|_| RepositoryError::invalid_value("users.language", &model.language))?;
        let file_format = FileFormat::from_str(&model.file_format)
            .map_err(|_| RepositoryError::invalid_value("users.file_format", &model.file_format))?;

        Ok(User {
            id: model.id,
            language,
            email: model.email,
            password: model.password,
            save_credentials: model.save_credentials,
            file_format,
            cache_expire_date: model.cache_expire_date,
            now_caching: model.now_caching,
            cache_built: model.cache_built,
            login_error: model.login_error,
        })
    }

    fn series_to_domain(model: series::Model) -> Series {
        Series {
            id: model.id,
            title: model.title,
            url: model.url,
            thumbnail_url: model.thumbnail_url,
            thumbnail_local: model.thumbnail_local,
        }
    }

    fn volume_to_domain(model: volumes::Model) -> RepositoryResult<Volume> {
        let pages = u32::try_from(model.pages)
            .map_err(|_| RepositoryError::invalid_value("volumes.pages", model.pages))?;

        Ok(Volume {
            id: model.id,
            title: model.title,
            url: model.url,
            thumbnail_url: model.thumbnail_url,
            thumbnail_local: model.thumbnail_local,
            description: model.description,
            pages,
            series_id: model.series_id,
            now_downloading: model.now_downloading,
        })
    }

    fn upload_to_domain(model: uploaded_artifacts::Model) -> RepositoryResult<UploadedArtifact> {
        let format = FileFormat::from_str(&model.format)
            .map_err(|_| RepositoryError::invalid_value("uploaded_artifacts.format", &model.format))?;

        Ok(UploadedArtifact {
            id: model.id,
            user_id: model.user_id,
            volume_id: model.volume_id,
            format,
            url: model.url,
            delete_token: model.delete_token,
            uploaded_at: model.uploaded_at,
        })
    }

    async fn find_user_model(&self, user_id: i64) -> RepositoryResult<users::Model> {
        Users::find_by_id(user_id)
            .one(&*self.connection)
            .await?
            .ok_or_else(|| RepositoryError::not_found("users", "id", user_id))
    }
}

#[async_trait]
impl LibraryRepository for SeaOrmLibraryRepository {
    async fn get_user(&self, user_id: i64) -> RepositoryResult<Option<User>> {
        Users::find_by_id(user_id)
            .one(&*self.connection)
            .await?
            .map(Self::user_to_domain)
            .transpose()
    }

    async fn get_or_create_user(&self, user_id: i64, language: Language) -> RepositoryResult<User> {
        if let Some(user) = self.get_user(user_id).await? {
            return Ok(user);
        }

        let now = Utc::now();
        let active_model = users::ActiveModel {
            id: Set(user_id),
            language: Set(language.to_string()),
            email: Set(None),
            password: Set(None),
            save_credentials: Set(false),
            file_format: Set(FileFormat::default().to_string()),
            cache_expire_date: Set(None),
            now_caching: Set(false),
            cache_built: Set(false),
            login_error: Set(false),
            created_at: Set(now),
            updated_at: Set(now),
        };

        let model = active_model.insert(&*self.connection).await?;
        debug!("Created user {}", user_id);
        Self::user_to_domain(model)
    }

    async fn update_user(&self, user_id: i64, update: UserUpdate) -> RepositoryResult<User> {
        let model = self.find_user_model(user_id).await?;
        let mut active_model = model.into_active_model();

        if let Some(language) = update.language {
            active_model.language = Set(language.to_string());
        }
        if let Some(email) = update.email {
            active_model.email = Set(email);
        }
        if let Some(password) = update.password {
            active_model.password = Set(password);
        }
        if let Some(save_credentials) = update.save_credentials {
            active_model.save_credentials = Set(save_credentials);
        }
        if let Some(file_format) = update.file_format {
            active_model.file_format = Set(file_format.to_string());
        }
        if let Some(cache_expire_date) = update.cache_expire_date {
            active_model.cache_expire_date = Set(cache_expire_date);
        }
        if let Some(now_caching) = update.now_caching {
            active_model.now_caching = Set(now_caching);
        }
        if let Some(cache_built) = update.cache_built {
            active_model.cache_built = Set(cache_built);
        }
        if let Some(login_error) = update.login_error {
            active_model.login_error = Set(login_error);
        }
        active_model.updated_at = Set(Utc::now());

        let model = active_model.update(&*self.connection).await?;
        Self::user_to_domain(model)
    }

    async fn list_auto_sync_users(&self) -> RepositoryResult<Vec<User>> {
        let models = Users::find()
            .filter(users::Column::Password.is_not_null())
            .filter(users::Column::Email.is_not_null())
            .filter(users::Column::SaveCredentials.eq(true))
            .order_by_asc(users::Column::Id)
            .all(&*self.connection)
            .await?;

        models.into_iter().map(Self::user_to_domain).collect()
    }

    async fn get_series(&self, series_id: i32) -> RepositoryResult<Option<Series>> {
        let model = SeriesEntity::find_by_id(series_id)
            .one(&*self.connection)
            .await?;
        Ok(model.map(Self::series_to_domain))
    }

    async fn find_series_by_url(&self, url: &str) -> RepositoryResult<Option<Series>> {
        let model = SeriesEntity::find()
            .filter(series::Column::Url.eq(url))
            .one(&*self.connection)
            .await?;
        Ok(model.map(Self::series_to_domain))
    }

    async fn create_series(&self, new_series: NewSeries) -> RepositoryResult<Series> {
        let active_model = series::ActiveModel {
            title: Set(new_series.title),
            url: Set(new_series.url),
            thumbnail_url: Set(new_series.thumbnail_url),
            thumbnail_local: Set(None),
            created_at: Set(Utc::now()),
            ..Default::default()
        };

        let model = active_model.insert(&*self.connection).await?;
        Ok(Self::series_to_domain(model))
    }

    async fn set_series_thumbnail(&self, series_id: i32, path: &str) -> RepositoryResult<()> {
        let result = SeriesEntity::update_many()
            .col_expr(series::Column::ThumbnailLocal, Expr::value(path))
            .filter(series::Column::Id.eq(series_id))
            .exec(&*self.connection)
            .await?;

        if result.rows_affected == 0 {
            return Err(RepositoryError::not_found("series", "id", series_id));
        }
        Ok(())
    }

    async fn get_volume(&self, volume_id: i32) -> RepositoryResult<Option<Volume>> {
        Volumes::find_by_id(volume_id)
            .one(&*self.connection)
            .await?
            .map(Self::volume_to_domain)
            .transpose()
    }

    async fn find_volume_by_url(&self, url: &str) -> RepositoryResult<Option<Volume>> {
        Volumes::find()
            .filter(volumes::Column::Url.eq(url))
            .one(&*self.connection)
            .await?
            .map(Self::volume_to_domain)
            .transpose()
    }

    async fn create_volume(&self, new_volume: NewVolume) -> RepositoryResult<Volume> {
        let pages = i32::try_from(new_volume.pages)
            .map_err(|_| RepositoryError::invalid_value("volumes.pages", new_volume.pages))?;

        let active_model = volumes::ActiveModel {
            title: Set(new_volume.title),
            url: Set(new_volume.url),
            thumbnail_url: Set(new_volume.thumbnail_url),
            thumbnail_local: Set(None),
            description: Set(new_volume.description),
            pages: Set(pages),
            series_id: Set(new_volume.series_id),
            now_downloading: Set(false),
            created_at: Set(Utc::now()),
            ..Default::default()
        };

        let model = active_model.insert(&*self.connection).await?;
        Self::volume_to_domain(model)
    }

    async fn set_volume_thumbnail(&self, volume_id: i32, path: &str) -> RepositoryResult<()> {
        let result = Volumes::update_many()
            .col_expr(volumes::Column::ThumbnailLocal, Expr::value(path))
            .filter(volumes::Column::Id.eq(volume_id))
            .exec(&*self.connection)
            .await?;

        if result.rows_affected == 0 {
            return Err(RepositoryError::not_found("volumes", "id", volume_id));
        }
        Ok(())
    }

    async fn set_volume_now_downloading(
        &self,
        volume_id: i32,
        value: bool,
    ) -> RepositoryResult<()> {
        let result = Volumes::update_many()
            .col_expr(volumes::Column::NowDownloading, Expr::value(value))
            .filter(volumes::Column::Id.eq(volume_id))
            .exec(&*self.connection)
            .await?;

        if result.rows_affected == 0 {
            return Err(RepositoryError::not_found("volumes", "id", volume_id));
        }
        Ok(())
    }

    async fn user_owns_volume(&self, user_id: i64, volume_url: &str) -> RepositoryResult<bool> {
        let edge = UserVolumes::find()
            .join(
                sea_orm::JoinType::InnerJoin,
                user_volumes::Relation::Volumes.def(),
            )
            .filter(user_volumes::Column::UserId.eq(user_id))
            .filter(volumes::Column::Url.eq(volume_url))
            .one(&*self.connection)
            .await?;
        Ok(edge.is_some())
    }

    async fn add_ownership(&self, user_id: i64, volume_id: i32) -> RepositoryResult<()> {
        let existing = UserVolumes::find_by_id((user_id, volume_id))
            .one(&*self.connection)
            .await?;
        if existing.is_some() {
            return Ok(());
        }

        user_volumes::ActiveModel {
            user_id: Set(user_id),
            volume_id: Set(volume_id),
            created_at: Set(Utc::now()),
        }
        .insert(&*self.connection)
        .await?;

        debug!("Added volume {} to user {}", volume_id, user_id);
        Ok(())
    }

    async fn list_owned_volumes(&self, user_id: i64) -> RepositoryResult<Vec<Volume>> {
        let models = Volumes::find()
            .join(
                sea_orm::JoinType::InnerJoin,
                volumes::Relation::UserVolumes.def(),
            )
            .filter(user_volumes::Column::UserId.eq(user_id))
            .order_by_asc(volumes::Column::Title)
            .all(&*self.connection)
            .await?;

        models.into_iter().map(Self::volume_to_domain).collect()
    }

    async fn reset_transient_flags(&self) -> RepositoryResult<u64> {
        let users = Users::update_many()
            .col_expr(users::Column::NowCaching, Expr::value(false))
            .filter(users::Column::NowCaching.eq(true))
            .exec(&*self.connection)
            .await?;
        let volumes = Volumes::update_many()
            .col_expr(volumes::Column::NowDownloading, Expr::value(false))
            .filter(volumes::Column::NowDownloading.eq(true))
            .exec(&*self.connection)
            .await?;

        Ok(users.rows_affected + volumes.rows_affected)
    }

    async fn record_upload(
        &self,
        upload: NewUploadedArtifact,
    ) -> RepositoryResult<UploadedArtifact> {
        let active_model = uploaded_artifacts::ActiveModel {
            user_id: Set(upload.user_id),
            volume_id: Set(upload.volume_id),
            format: Set(upload.format.to_string()),
            url: Set(upload.url),
            delete_token: Set(upload.delete_token),
            uploaded_at: Set(Utc::now()),
            ..Default::default()
        };

        let model = active_model.insert(&*self.connection).await?;
        Self::upload_to_domain(model)
    }

    async fn list_uploads_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> RepositoryResult<Vec<UploadedArtifact>> {
        let models = UploadedArtifacts::find()
            .filter(uploaded_artifacts::Column::UploadedAt.lt(cutoff))
            .order_by_asc(uploaded_artifacts::Column::UploadedAt)
            .all(&*self.connection)
            .await?;

        models.into_iter().map(Self::upload_to_domain).collect()
    }

    async fn delete_upload(&self, upload_id: i32) -> RepositoryResult<()> {
        UploadedArtifacts::delete_by_id(upload_id)
            .exec(&*self.connection)
            .await?;
        Ok(())
    }
}
