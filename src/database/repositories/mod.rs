//! Repository layer over the SeaORM entities
//!
//! The scheduler only talks to [`LibraryRepository`]; every call commits on
//! its own so a failing step never rolls back earlier progress.

pub mod library;

pub use library::SeaOrmLibraryRepository;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::errors::RepositoryResult;
use crate::models::{
    Language, NewSeries, NewUploadedArtifact, NewVolume, Series, UploadedArtifact, User,
    UserUpdate, Volume,
};

/// Persistence contract consumed by the job scheduler
#[async_trait]
pub trait LibraryRepository: Send + Sync {
    async fn get_user(&self, user_id: i64) -> RepositoryResult<Option<User>>;

    /// Fetch a user, creating a default record on first interaction
    async fn get_or_create_user(&self, user_id: i64, language: Language) -> RepositoryResult<User>;

    async fn update_user(&self, user_id: i64, update: UserUpdate) -> RepositoryResult<User>;

    /// Users with a stored password and email who opted into auto-sync
    async fn list_auto_sync_users(&self) -> RepositoryResult<Vec<User>>;

    async fn get_series(&self, series_id: i32) -> RepositoryResult<Option<Series>>;

    async fn find_series_by_url(&self, url: &str) -> RepositoryResult<Option<Series>>;

    async fn create_series(&self, series: NewSeries) -> RepositoryResult<Series>;

    async fn set_series_thumbnail(&self, series_id: i32, path: &str) -> RepositoryResult<()>;

    async fn get_volume(&self, volume_id: i32) -> RepositoryResult<Option<Volume>>;

    async fn find_volume_by_url(&self, url: &str) -> RepositoryResult<Option<Volume>>;

    async fn create_volume(&self, volume: NewVolume) -> RepositoryResult<Volume>;

    async fn set_volume_thumbnail(&self, volume_id: i32, path: &str) -> RepositoryResult<()>;

    async fn set_volume_now_downloading(&self, volume_id: i32, value: bool)
    -> RepositoryResult<()>;

    async fn user_owns_volume(&self, user_id: i64, volume_url: &str) -> RepositoryResult<bool>;

    /// Record an ownership edge; adding an existing edge is a no-op
    async fn add_ownership(&self, user_id: i64, volume_id: i32) -> RepositoryResult<()>;

    async fn list_owned_volumes(&self, user_id: i64) -> RepositoryResult<Vec<Volume>>;

    /// Clear now_caching / now_downloading flags left behind by a previous process.
    /// Returns the number of rows touched.
    async fn reset_transient_flags(&self) -> RepositoryResult<u64>;

    async fn record_upload(&self, upload: NewUploadedArtifact)
    -> RepositoryResult<UploadedArtifact>;

    async fn list_uploads_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> RepositoryResult<Vec<UploadedArtifact>>;

    async fn delete_upload(&self, upload_id: i32) -> RepositoryResult<()>;
}
