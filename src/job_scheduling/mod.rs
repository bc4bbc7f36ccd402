//! Job scheduling subsystem for the library bot
//!
//! This module provides a unified job queue system that handles:
//! - Recurring per-user library sync anchored to a daily local time
//! - Deduplicated volume downloads shared by every requester
//! - Deduplicated artifact conversions per volume and format
//! - Uploads of artifacts too large for the chat transport
//! - Maintenance tasks such as purging expired uploads
//!
//! The system is built around four main components:
//! - `JobQueue`: Thread-safe job storage with deduplication
//! - `JobScheduler`: Process-wide owner of the queue, timers and coordinators
//! - `JobQueueRunner`: Job execution coordination service
//! - `JobExecutor`: Dispatch of queued jobs to the services doing the work

pub mod anchor;
pub mod context;
pub mod conversion;
pub mod download;
pub mod job_executor;
pub mod job_queue;
pub mod job_queue_runner;
pub mod job_scheduler;
pub mod library_sync;
pub mod types;

pub use anchor::SyncAnchor;
pub use context::JobContext;
pub use conversion::ConversionCoordinator;
pub use download::{DownloadCoordinator, VolumeRequest};
pub use job_executor::JobExecutor;
pub use job_queue::JobQueue;
pub use job_queue_runner::JobQueueRunner;
pub use job_scheduler::JobScheduler;
pub use library_sync::{LibrarySyncService, SyncCredentials, SyncReport};
pub use types::*;

#[cfg(test)]
pub(crate) mod test_support {
    use sea_orm::{ConnectOptions, Database};
    use sea_orm_migration::MigratorTrait;
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;

    use super::JobContext;
    use crate::config::Config;
    use crate::convert::MockArtifactConverter;
    use crate::database::migrations::Migrator;
    use crate::database::repositories::{LibraryRepository, SeaOrmLibraryRepository};
    use crate::delivery::blob_store::MockBlobStore;
    use crate::delivery::notifier::MockNotifier;
    use crate::models::{FileFormat, Language, NewVolume, UserUpdate, Volume};
    use crate::remote::MockRemoteLibraryClient;
    use crate::storage::LibraryLayout;

    /// Real in-memory repository plus mocked collaborators, set up before
    /// being frozen into a [`JobContext`]
    pub struct TestContext {
        pub repository: Arc<SeaOrmLibraryRepository>,
        pub remote: MockRemoteLibraryClient,
        pub converter: MockArtifactConverter,
        pub blob_store: MockBlobStore,
        pub notifier: MockNotifier,
        pub config: Config,
    }

    impl TestContext {
        pub async fn new(root: &Path) -> Self {
            let mut options = ConnectOptions::new("sqlite::memory:");
            options.max_connections(1).sqlx_logging(false);
            let connection = Database::connect(options).await.unwrap();
            Migrator::up(&connection, None).await.unwrap();

            let mut config = Config::default();
            config.storage.download_root = root.to_path_buf();
            config.remote.retry_backoff = Duration::from_millis(1);

            Self {
                repository: Arc::new(SeaOrmLibraryRepository::new(Arc::new(connection))),
                remote: MockRemoteLibraryClient::new(),
                converter: MockArtifactConverter::new(),
                blob_store: MockBlobStore::new(),
                notifier: MockNotifier::new(),
                config,
            }
        }

        pub fn layout(&self) -> LibraryLayout {
            LibraryLayout::new(self.config.storage.download_root.clone())
        }

        pub fn build(self) -> JobContext {
            JobContext::new(
                self.repository,
                Arc::new(self.remote),
                Arc::new(self.converter),
                Arc::new(self.blob_store),
                Arc::new(self.notifier),
                self.config,
            )
        }
    }

    pub async fn seed_user(
        context: &TestContext,
        user_id: i64,
        password: Option<&str>,
        format: FileFormat,
    ) {
        let repository = &context.repository;
        repository
            .get_or_create_user(user_id, Language::En)
            .await
            .unwrap();
        repository
            .update_user(
                user_id,
                UserUpdate::credentials(
                    "reader@example.com".into(),
                    password.map(str::to_string),
                    true,
                ),
            )
            .await
            .unwrap();
        repository
            .update_user(
                user_id,
                UserUpdate {
                    file_format: Some(format),
                    ..UserUpdate::default()
                },
            )
            .await
            .unwrap();
    }

    pub async fn seed_volume(context: &TestContext, pages: u32) -> Volume {
        context
            .repository
            .create_volume(NewVolume {
                title: "Volume".into(),
                url: format!("https://book.example.com/volume/{}", uuid::Uuid::new_v4()),
                thumbnail_url: None,
                description: None,
                pages,
                series_id: None,
            })
            .await
            .unwrap()
    }
}
