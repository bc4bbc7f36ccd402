//! Collaborators shared by every job body

use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::Config;
use crate::convert::ArtifactConverter;
use crate::database::repositories::LibraryRepository;
use crate::delivery::{BlobStore, Notifier};
use crate::errors::{AppResult, RemoteError, RemoteResult};
use crate::i18n::Message;
use crate::models::{Language, Session, Volume};
use crate::remote::RemoteLibraryClient;
use crate::storage::LibraryLayout;

/// Everything a job needs to reach the outside world
#[derive(Clone)]
pub struct JobContext {
    pub repository: Arc<dyn LibraryRepository>,
    pub remote: Arc<dyn RemoteLibraryClient>,
    pub converter: Arc<dyn ArtifactConverter>,
    pub blob_store: Arc<dyn BlobStore>,
    pub notifier: Arc<dyn Notifier>,
    pub layout: LibraryLayout,
    pub config: Config,
}

impl JobContext {
    pub fn new(
        repository: Arc<dyn LibraryRepository>,
        remote: Arc<dyn RemoteLibraryClient>,
        converter: Arc<dyn ArtifactConverter>,
        blob_store: Arc<dyn BlobStore>,
        notifier: Arc<dyn Notifier>,
        config: Config,
    ) -> Self {
        Self {
            repository,
            remote,
            converter,
            blob_store,
            notifier,
            layout: LibraryLayout::new(config.storage.download_root.clone()),
            config,
        }
    }

    /// Language for messages to `user_id`; unknown users get the default
    pub async fn language_of(&self, user_id: i64) -> Language {
        match self.repository.get_user(user_id).await {
            Ok(Some(user)) => user.language,
            Ok(None) => Language::default(),
            Err(e) => {
                debug!("Could not load language of user {}: {}", user_id, e);
                Language::default()
            }
        }
    }

    /// Send a one-off message; delivery failures are logged and dropped
    pub async fn notify(&self, requester: i64, message: Message) {
        let text = message.render(self.language_of(requester).await);
        if let Err(e) = self.notifier.send_completion(requester, &text).await {
            warn!("Failed to notify {}: {}", requester, e);
        }
    }

    /// Log in within the configured login timeout
    pub async fn authenticate(
        &self,
        email: &str,
        password: &str,
        fast_login: bool,
    ) -> RemoteResult<Session> {
        let limit = self.config.remote.login_timeout;
        match tokio::time::timeout(limit, self.remote.authenticate(email, password, fast_login))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(RemoteError::timeout("login", limit)),
        }
    }

    /// Directory holding the pages and artifacts of `volume`
    pub async fn volume_dir(&self, volume: &Volume) -> AppResult<PathBuf> {
        let series = match volume.series_id {
            Some(series_id) => self.repository.get_series(series_id).await?,
            None => None,
        };
        Ok(self.layout.volume_dir(volume, series.as_ref()))
    }
}
