//! Shared fixtures for the integration tests: scripted collaborators around a
//! real scheduler, repository and converter.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Semaphore;

use dmm_bookbot::config::{Config, DatabaseConfig};
use dmm_bookbot::convert::LocalArtifactConverter;
use dmm_bookbot::database::{Database, LibraryRepository, SeaOrmLibraryRepository};
use dmm_bookbot::delivery::{BlobStore, DeleteOutcome, Notifier, UploadedBlob};
use dmm_bookbot::errors::{DeliveryResult, RemoteError, RemoteResult};
use dmm_bookbot::job_scheduling::{JobContext, JobScheduler};
use dmm_bookbot::models::{
    FileFormat, Language, MessageHandle, NewVolume, PurchaseItem, Session, UserUpdate, Volume,
    VolumeDetails, VolumeListing,
};

pub const EMAIL: &str = "reader@example.com";
pub const PASSWORD: &str = "correct horse";
const PAGE_HOST: &str = "https://pages.example.com";

/// Small but real JPEG, so converters can embed it
pub fn jpeg_bytes(shade: u8) -> Vec<u8> {
    let mut image = image::RgbImage::new(8, 12);
    for pixel in image.pixels_mut() {
        *pixel = image::Rgb([shade, 90, 180]);
    }
    let mut buffer = Cursor::new(Vec::new());
    image
        .write_to(&mut buffer, image::ImageFormat::Jpeg)
        .unwrap();
    buffer.into_inner()
}

/// Storefront double with a fixed catalogue and a single valid password.
/// Page downloads wait on `page_gate`.
pub struct ScriptedRemote {
    pub purchases: Mutex<Vec<PurchaseItem>>,
    pub series_volumes: Mutex<HashMap<String, Vec<VolumeListing>>>,
    pub pages_per_volume: u32,
    pub page_gate: Semaphore,
    pub logins: AtomicUsize,
    pub page_fetches: AtomicUsize,
}

impl ScriptedRemote {
    pub fn new() -> Self {
        Self {
            purchases: Mutex::new(Vec::new()),
            series_volumes: Mutex::new(HashMap::new()),
            pages_per_volume: 3,
            page_gate: Semaphore::new(Semaphore::MAX_PERMITS),
            logins: AtomicUsize::new(0),
            page_fetches: AtomicUsize::new(0),
        }
    }

    /// Hold every page download until [`ScriptedRemote::open_gate`]
    pub fn gated() -> Self {
        Self {
            page_gate: Semaphore::new(0),
            ..Self::new()
        }
    }

    pub fn open_gate(&self) {
        self.page_gate.add_permits(1024);
    }

    /// One series with two volumes plus one standalone volume
    pub fn with_catalogue(self) -> Self {
        let series_url = "https://book.example.com/series/saga".to_string();
        *self.purchases.lock().unwrap() = vec![
            PurchaseItem {
                name: "Saga".into(),
                url: series_url.clone(),
                details_url: "https://book.example.com/details/saga".into(),
                thumbnail_url: Some("https://img.example.com/saga.jpg".into()),
                is_series: true,
            },
            PurchaseItem {
                name: "One Shot".into(),
                url: "https://book.example.com/product/one-shot".into(),
                details_url: "https://book.example.com/details/one-shot".into(),
                thumbnail_url: None,
                is_series: false,
            },
        ];
        self.series_volumes.lock().unwrap().insert(
            series_url,
            (1..=2)
                .map(|n| VolumeListing {
                    name: format!("Saga {n}"),
                    url: format!("https://book.example.com/product/saga-{n}"),
                    details_url: format!("https://book.example.com/details/saga-{n}"),
                    thumbnail_url: Some(format!("https://img.example.com/saga-{n}.jpg")),
                })
                .collect(),
        );
        self
    }
}

#[async_trait]
impl dmm_bookbot::remote::RemoteLibraryClient for ScriptedRemote {
    async fn authenticate(
        &self,
        email: &str,
        password: &str,
        _fast_login: bool,
    ) -> RemoteResult<Session> {
        self.logins.fetch_add(1, Ordering::SeqCst);
        if password == PASSWORD {
            Ok(Session::from_cookies([("session", "valid")]))
        } else {
            Err(RemoteError::authentication(email, "invalid credentials"))
        }
    }

    async fn list_purchases(&self, _session: &Session) -> RemoteResult<Vec<PurchaseItem>> {
        Ok(self.purchases.lock().unwrap().clone())
    }

    async fn list_series_volumes(
        &self,
        _session: &Session,
        series: &PurchaseItem,
    ) -> RemoteResult<Vec<VolumeListing>> {
        Ok(self
            .series_volumes
            .lock()
            .unwrap()
            .get(&series.url)
            .cloned()
            .unwrap_or_default())
    }

    async fn fetch_details(
        &self,
        _session: &Session,
        _details_url: &str,
    ) -> RemoteResult<VolumeDetails> {
        Ok(VolumeDetails {
            description: "A story".into(),
            pages: self.pages_per_volume,
        })
    }

    async fn derive_page_url(
        &self,
        _session: &Session,
        volume: &Volume,
        page: u32,
    ) -> RemoteResult<String> {
        Ok(format!("{PAGE_HOST}/{}/{page}.jpg", volume.id))
    }

    async fn fetch_bytes(&self, url: &str) -> RemoteResult<Bytes> {
        if url.starts_with(PAGE_HOST) {
            let _permit = self
                .page_gate
                .acquire()
                .await
                .map_err(|e| RemoteError::fetch(url, e.to_string()))?;
            self.page_fetches.fetch_add(1, Ordering::SeqCst);
        }
        Ok(Bytes::from(jpeg_bytes(120)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivered {
    Progress { requester: i64, text: String },
    ProgressUpdate { requester: i64, text: String },
    Completion { requester: i64, text: String },
    File { requester: i64, path: PathBuf },
    Url { requester: i64, text: String, url: String },
}

impl Delivered {
    pub fn requester(&self) -> i64 {
        match self {
            Self::Progress { requester, .. }
            | Self::ProgressUpdate { requester, .. }
            | Self::Completion { requester, .. }
            | Self::File { requester, .. }
            | Self::Url { requester, .. } => *requester,
        }
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<Delivered>>,
    next_message_id: AtomicI64,
}

impl RecordingNotifier {
    pub fn events(&self) -> Vec<Delivered> {
        self.events.lock().unwrap().clone()
    }

    pub fn events_for(&self, requester: i64) -> Vec<Delivered> {
        self.events()
            .into_iter()
            .filter(|event| event.requester() == requester)
            .collect()
    }

    pub fn completions_for(&self, requester: i64) -> Vec<String> {
        self.events_for(requester)
            .into_iter()
            .filter_map(|event| match event {
                Delivered::Completion { text, .. } => Some(text),
                _ => None,
            })
            .collect()
    }

    fn record(&self, event: Delivered) {
        self.events.lock().unwrap().push(event);
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send_progress(&self, requester: i64, text: &str) -> DeliveryResult<MessageHandle> {
        self.record(Delivered::Progress {
            requester,
            text: text.to_string(),
        });
        Ok(MessageHandle {
            chat_id: requester,
            message_id: self.next_message_id.fetch_add(1, Ordering::SeqCst),
        })
    }

    async fn update_progress(&self, handle: &MessageHandle, text: &str) -> DeliveryResult<()> {
        self.record(Delivered::ProgressUpdate {
            requester: handle.chat_id,
            text: text.to_string(),
        });
        Ok(())
    }

    async fn send_completion(&self, requester: i64, text: &str) -> DeliveryResult<()> {
        self.record(Delivered::Completion {
            requester,
            text: text.to_string(),
        });
        Ok(())
    }

    async fn send_file(&self, requester: i64, path: &Path) -> DeliveryResult<()> {
        self.record(Delivered::File {
            requester,
            path: path.to_path_buf(),
        });
        Ok(())
    }

    async fn send_url(&self, requester: i64, text: &str, url: &str) -> DeliveryResult<()> {
        self.record(Delivered::Url {
            requester,
            text: text.to_string(),
            url: url.to_string(),
        });
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryBlobStore {
    pub uploaded: Mutex<Vec<String>>,
    pub deleted: Mutex<Vec<String>>,
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn upload(&self, path: &Path, desired_name: &str) -> DeliveryResult<UploadedBlob> {
        assert!(path.exists(), "uploading a missing artifact");
        let url = format!("https://blob.example.com/{desired_name}");
        self.uploaded.lock().unwrap().push(url.clone());
        Ok(UploadedBlob {
            url,
            delete_token: Some(format!("token-{desired_name}")),
        })
    }

    async fn delete(&self, url: &str, _delete_token: &str) -> DeliveryResult<DeleteOutcome> {
        self.deleted.lock().unwrap().push(url.to_string());
        Ok(DeleteOutcome::Deleted)
    }
}

pub struct Harness {
    pub scheduler: Arc<JobScheduler>,
    pub repository: Arc<SeaOrmLibraryRepository>,
    pub remote: Arc<ScriptedRemote>,
    pub notifier: Arc<RecordingNotifier>,
    pub blob_store: Arc<InMemoryBlobStore>,
    pub root: TempDir,
}

impl Harness {
    pub async fn start(remote: ScriptedRemote) -> Self {
        Self::start_with(remote, |_| {}).await
    }

    pub async fn start_with(remote: ScriptedRemote, configure: impl FnOnce(&mut Config)) -> Self {
        let root = tempfile::tempdir().unwrap();
        let database = Database::new(&DatabaseConfig {
            url: "sqlite::memory:".into(),
            max_connections: None,
        })
        .await
        .unwrap();
        database.migrate().await.unwrap();
        let repository = Arc::new(database.library_repository());

        let mut config = Config::default();
        config.storage.download_root = root.path().to_path_buf();
        config.remote.retry_backoff = Duration::from_millis(1);
        config.job_scheduling.poll_interval = Duration::from_millis(50);
        configure(&mut config);

        let remote = Arc::new(remote);
        let notifier = Arc::new(RecordingNotifier::default());
        let blob_store = Arc::new(InMemoryBlobStore::default());
        let context = JobContext::new(
            repository.clone(),
            remote.clone(),
            Arc::new(LocalArtifactConverter::new()),
            blob_store.clone(),
            notifier.clone(),
            config,
        );

        let scheduler = JobScheduler::new(context).unwrap();
        scheduler.start().await.unwrap();

        Self {
            scheduler,
            repository,
            remote,
            notifier,
            blob_store,
            root,
        }
    }

    pub async fn seed_user(&self, user_id: i64, password: Option<&str>, format: FileFormat) {
        self.repository
            .get_or_create_user(user_id, Language::En)
            .await
            .unwrap();
        self.repository
            .update_user(
                user_id,
                UserUpdate {
                    file_format: Some(format),
                    ..UserUpdate::credentials(EMAIL.into(), password.map(str::to_string), true)
                },
            )
            .await
            .unwrap();
    }

    pub async fn seed_volume(&self, pages: u32) -> Volume {
        self.repository
            .create_volume(NewVolume {
                title: "Standalone".into(),
                url: format!("https://book.example.com/product/{}", uuid::Uuid::new_v4()),
                thumbnail_url: None,
                description: None,
                pages,
                series_id: None,
            })
            .await
            .unwrap()
    }

    pub async fn wait_idle(&self) {
        assert!(
            self.scheduler.wait_idle(Duration::from_secs(20)).await,
            "jobs did not finish in time"
        );
    }

    /// Poll until `condition` holds over the delivered messages
    pub async fn wait_for_events(&self, condition: impl Fn(&[Delivered]) -> bool) {
        for _ in 0..400 {
            if condition(&self.notifier.events()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected notifications never arrived: {:?}", self.notifier.events());
    }
}
