//! Multi-subscriber page download jobs
//!
//! One job per volume at a time. Requesters arriving while a job is queued
//! or running join its subscriber list and are served by its outcome; the
//! entry is removed atomically when the job finishes, so a later request
//! starts a fresh job.

use futures::future::join_all;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::context::JobContext;
use super::conversion::ConversionCoordinator;
use super::job_queue::JobQueue;
use super::types::{JobPriority, JobType, ScheduledJob, SubscribeOutcome};
use crate::errors::{AppError, AppResult, JobSchedulingError, RemoteError, RemoteResult};
use crate::i18n::Message;
use crate::models::{MessageHandle, Session, Volume};
use crate::storage::{LibraryLayout, book_missing_pages, present_pages, progress_bar};
use crate::utils::jitter::retry_delay;

/// What a volume request turned into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeRequest {
    /// Pages are missing; the requester waits on the download job
    Download(SubscribeOutcome),
    /// Every page is on disk; the requester waits on the conversion job
    Conversion(SubscribeOutcome),
}

#[derive(Clone)]
struct DownloadSubscriber {
    requester: i64,
    password_override: Option<String>,
    progress: Option<MessageHandle>,
}

struct DownloadEntry {
    generation: u64,
    subscribers: Vec<DownloadSubscriber>,
}

pub struct DownloadCoordinator {
    context: JobContext,
    queue: Arc<JobQueue>,
    conversions: Arc<ConversionCoordinator>,
    registry: Mutex<HashMap<i32, DownloadEntry>>,
    generations: AtomicU64,
}

impl DownloadCoordinator {
    pub fn new(
        context: JobContext,
        queue: Arc<JobQueue>,
        conversions: Arc<ConversionCoordinator>,
    ) -> Self {
        Self {
            context,
            queue,
            conversions,
            registry: Mutex::new(HashMap::new()),
            generations: AtomicU64::new(0),
        }
    }

    /// Entry point of a book request: download what is missing, or go
    /// straight to conversion when the page set is complete
    pub async fn request_volume(
        &self,
        user_id: i64,
        volume_id: i32,
        password_override: Option<String>,
    ) -> AppResult<VolumeRequest> {
        let volume = self
            .context
            .repository
            .get_volume(volume_id)
            .await?
            .ok_or_else(|| AppError::not_found("volume", volume_id))?;

        let dir = self.context.volume_dir(&volume).await?;
        let present = present_pages(&dir).await?;

        if book_missing_pages(1, volume.pages, &present).is_empty() {
            let format = self
                .context
                .repository
                .get_user(user_id)
                .await?
                .map(|user| user.file_format)
                .unwrap_or_default();
            let outcome = self
                .conversions
                .subscribe(volume_id, format, user_id, false)
                .await?;
            return Ok(VolumeRequest::Conversion(outcome));
        }

        let outcome = self
            .subscribe(volume_id, user_id, password_override)
            .await?;
        Ok(VolumeRequest::Download(outcome))
    }

    /// Register `requester` for the download of `volume_id`, starting the job
    /// if nobody is waiting yet
    pub async fn subscribe(
        &self,
        volume_id: i32,
        requester: i64,
        password_override: Option<String>,
    ) -> Result<SubscribeOutcome, JobSchedulingError> {
        let mut registry = self.registry.lock().await;

        if let Some(entry) = registry.get_mut(&volume_id) {
            if entry.subscribers.iter().any(|s| s.requester == requester) {
                debug!(
                    "User {} already waits on the download of volume {}",
                    requester, volume_id
                );
                return Ok(SubscribeOutcome::AlreadySubscribed);
            }
            entry.subscribers.push(DownloadSubscriber {
                requester,
                password_override,
                progress: None,
            });
            info!(
                "Subscribed user {} to download job of volume {}",
                requester, volume_id
            );
            return Ok(SubscribeOutcome::Joined);
        }

        let generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;
        let job = ScheduledJob::new(
            JobType::VolumeDownload {
                volume_id,
                generation,
            },
            JobPriority::High,
        );
        // Enqueued under the registry lock so two first subscribers cannot both trigger
        self.queue.enqueue(job).await?;
        registry.insert(
            volume_id,
            DownloadEntry {
                generation,
                subscribers: vec![DownloadSubscriber {
                    requester,
                    password_override,
                    progress: None,
                }],
            },
        );

        info!(
            "Subscribed user {} to new download job of volume {}",
            requester, volume_id
        );
        Ok(SubscribeOutcome::Triggered)
    }

    /// Requesters currently waiting on the download of `volume_id`
    pub async fn subscribers(&self, volume_id: i32) -> Vec<i64> {
        self.registry
            .lock()
            .await
            .get(&volume_id)
            .map(|entry| entry.subscribers.iter().map(|s| s.requester).collect())
            .unwrap_or_default()
    }

    pub async fn is_active(&self, volume_id: i32) -> bool {
        self.registry.lock().await.contains_key(&volume_id)
    }

    /// Job body: fetch the missing pages, then serve every subscriber
    pub async fn execute(&self, volume_id: i32, generation: u64) -> AppResult<()> {
        if !self.is_current(volume_id, generation).await {
            debug!(
                "Download job {} of volume {} has no subscribers left, skipping",
                generation, volume_id
            );
            return Ok(());
        }

        info!("Starting download job of volume {}", volume_id);
        let result = self.download(volume_id).await;

        if let Err(e) = self
            .context
            .repository
            .set_volume_now_downloading(volume_id, false)
            .await
        {
            error!(
                "Failed to clear downloading flag of volume {}: {}",
                volume_id, e
            );
        }
        let subscribers = self.take_subscribers(volume_id, generation).await;
        debug!(
            "Removed download registration of volume {} ({} subscribers)",
            volume_id,
            subscribers.len()
        );

        match &result {
            Ok(()) => {
                info!("Download of volume {} has finished", volume_id);
                for subscriber in &subscribers {
                    self.hand_off_to_conversion(volume_id, subscriber.requester)
                        .await;
                }
            }
            Err(e) => {
                warn!("Download of volume {} failed: {}", volume_id, e);
                join_all(subscribers.iter().map(|subscriber| {
                    self.context
                        .notify(subscriber.requester, Message::DownloadError)
                }))
                .await;
            }
        }

        result
    }

    async fn download(&self, volume_id: i32) -> AppResult<()> {
        let repository = &self.context.repository;
        let volume = repository
            .get_volume(volume_id)
            .await?
            .ok_or_else(|| AppError::not_found("volume", volume_id))?;
        repository
            .set_volume_now_downloading(volume_id, true)
            .await?;

        let dir = self.context.volume_dir(&volume).await?;
        let present = present_pages(&dir).await?;
        let missing = book_missing_pages(1, volume.pages, &present);
        let mut done = volume.pages - missing.len() as u32;

        self.report_progress(volume_id, done, volume.pages).await;
        if missing.is_empty() {
            return Ok(());
        }

        let session = self.acquire_session(volume_id).await.ok_or_else(|| {
            RemoteError::authentication(
                format!("subscribers of volume {volume_id}"),
                "no subscriber credentials were accepted",
            )
        })?;

        tokio::fs::create_dir_all(&dir).await?;
        for page in missing {
            self.fetch_page(&session, &volume, page, &dir).await?;
            done += 1;
            self.report_progress(volume_id, done, volume.pages).await;
        }

        Ok(())
    }

    /// First session any subscriber's credentials yield, in registration order
    async fn acquire_session(&self, volume_id: i32) -> Option<Session> {
        let candidates: Vec<(i64, Option<String>)> = self
            .registry
            .lock()
            .await
            .get(&volume_id)
            .map(|entry| {
                entry
                    .subscribers
                    .iter()
                    .map(|s| (s.requester, s.password_override.clone()))
                    .collect()
            })
            .unwrap_or_default();
        let total = candidates.len();

        for (index, (requester, password_override)) in candidates.into_iter().enumerate() {
            let user = match self.context.repository.get_user(requester).await {
                Ok(Some(user)) => user,
                Ok(None) => continue,
                Err(e) => {
                    warn!("Failed to load subscriber {}: {}", requester, e);
                    continue;
                }
            };
            let Some(email) = user.email.as_deref() else {
                continue;
            };
            let Some(password) = password_override.as_deref().or(user.stored_password()) else {
                debug!("Subscriber {} has no usable password", requester);
                continue;
            };

            match self.context.authenticate(email, password, false).await {
                Ok(session) => {
                    info!(
                        "Using the session of subscriber {} for volume {}",
                        requester, volume_id
                    );
                    return Some(session);
                }
                Err(e) => info!(
                    "Unable to log in as subscriber {} (attempt {} of {}): {}",
                    requester,
                    index + 1,
                    total,
                    e
                ),
            }
        }

        None
    }

    async fn fetch_page(
        &self,
        session: &Session,
        volume: &Volume,
        page: u32,
        dir: &Path,
    ) -> AppResult<()> {
        let remote = &self.context.remote;
        let attempts = self.context.config.remote.page_retry_attempts.max(1);
        let backoff = self.context.config.remote.retry_backoff;
        let mut attempt = 0;

        loop {
            attempt += 1;
            // Page URLs carry a short-lived token; derive a new one every attempt
            let result: RemoteResult<bytes::Bytes> = async {
                let url = remote.derive_page_url(session, volume, page).await?;
                remote.fetch_bytes(&url).await
            }
            .await;

            match result {
                Ok(bytes) => {
                    let target = LibraryLayout::page_path(dir, page);
                    let partial = target.with_extension("jpg.part");
                    tokio::fs::write(&partial, &bytes).await?;
                    tokio::fs::rename(&partial, &target).await?;
                    debug!("Stored page {} of volume {}", page, volume.id);
                    return Ok(());
                }
                Err(e) if e.is_authentication() || attempt >= attempts => {
                    return Err(e.into());
                }
                Err(e) => {
                    let delay = retry_delay(backoff, attempt);
                    warn!(
                        "Page {} of volume {} failed (attempt {}/{}), retrying in {:?}: {}",
                        page, volume.id, attempt, attempts, delay, e
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Update every subscriber's progress message. Subscribers without one
    /// (the first report, or late joiners) get a fresh message.
    async fn report_progress(&self, volume_id: i32, current: u32, total: u32) {
        let bar = progress_bar(current, total);
        let subscribers: Vec<(i64, Option<MessageHandle>)> = self
            .registry
            .lock()
            .await
            .get(&volume_id)
            .map(|entry| {
                entry
                    .subscribers
                    .iter()
                    .map(|s| (s.requester, s.progress))
                    .collect()
            })
            .unwrap_or_default();

        for (requester, handle) in subscribers {
            let language = self.context.language_of(requester).await;
            let text = Message::Downloading { bar: bar.clone() }.render(language);
            match handle {
                Some(handle) => {
                    if let Err(e) = self.context.notifier.update_progress(&handle, &text).await {
                        debug!("Ignoring progress update failure for {}: {}", requester, e);
                    }
                }
                None => match self.context.notifier.send_progress(requester, &text).await {
                    Ok(handle) => self.store_progress_handle(volume_id, requester, handle).await,
                    Err(e) => debug!("Ignoring progress message failure for {}: {}", requester, e),
                },
            }
        }
    }

    async fn store_progress_handle(&self, volume_id: i32, requester: i64, handle: MessageHandle) {
        if let Some(subscriber) = self
            .registry
            .lock()
            .await
            .get_mut(&volume_id)
            .and_then(|entry| {
                entry
                    .subscribers
                    .iter_mut()
                    .find(|s| s.requester == requester)
            })
        {
            subscriber.progress = Some(handle);
        }
    }

    async fn hand_off_to_conversion(&self, volume_id: i32, requester: i64) {
        let format = match self.context.repository.get_user(requester).await {
            Ok(Some(user)) => user.file_format,
            Ok(None) => Default::default(),
            Err(e) => {
                warn!("Failed to load subscriber {}: {}", requester, e);
                Default::default()
            }
        };

        self.context
            .notify(requester, Message::DownloadFinished { format })
            .await;

        if let Err(e) = self
            .conversions
            .subscribe(volume_id, format, requester, true)
            .await
        {
            error!(
                "Failed to queue {} conversion of volume {} for user {}: {}",
                format, volume_id, requester, e
            );
            self.context
                .notify(requester, Message::ConversionError)
                .await;
        }
    }

    async fn is_current(&self, volume_id: i32, generation: u64) -> bool {
        self.registry
            .lock()
            .await
            .get(&volume_id)
            .is_some_and(|entry| entry.generation == generation)
    }

    async fn take_subscribers(&self, volume_id: i32, generation: u64) -> Vec<DownloadSubscriber> {
        let mut registry = self.registry.lock().await;
        match registry.get(&volume_id) {
            Some(entry) if entry.generation == generation => registry
                .remove(&volume_id)
                .map(|entry| entry.subscribers)
                .unwrap_or_default(),
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::repositories::LibraryRepository;
    use crate::job_scheduling::test_support::{TestContext, seed_user, seed_volume};
    use crate::models::FileFormat;
    use bytes::Bytes;
    use std::sync::Mutex as StdMutex;

    fn coordinator(context: JobContext) -> (DownloadCoordinator, Arc<JobQueue>) {
        let queue = Arc::new(JobQueue::new());
        let conversions = Arc::new(ConversionCoordinator::new(context.clone(), queue.clone()));
        (
            DownloadCoordinator::new(context, queue.clone(), conversions),
            queue,
        )
    }

    fn expect_progress(context: &mut TestContext) {
        context
            .notifier
            .expect_send_progress()
            .returning(|requester, _| {
                Ok(MessageHandle {
                    chat_id: requester,
                    message_id: 1,
                })
            });
        context
            .notifier
            .expect_update_progress()
            .returning(|_, _| Ok(()));
    }

    fn record_completions(context: &mut TestContext) -> Arc<StdMutex<Vec<(i64, String)>>> {
        let sent = Arc::new(StdMutex::new(Vec::new()));
        let log = sent.clone();
        context
            .notifier
            .expect_send_completion()
            .returning(move |requester, text| {
                log.lock().unwrap().push((requester, text.to_string()));
                Ok(())
            });
        sent
    }

    #[tokio::test]
    async fn subscribe_triggers_once_and_dedups_requesters() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, queue) = coordinator(TestContext::new(dir.path()).await.build());

        assert_eq!(
            coordinator.subscribe(7, 1, None).await.unwrap(),
            SubscribeOutcome::Triggered
        );
        assert_eq!(
            coordinator.subscribe(7, 2, Some("pw".into())).await.unwrap(),
            SubscribeOutcome::Joined
        );
        assert_eq!(
            coordinator.subscribe(7, 1, None).await.unwrap(),
            SubscribeOutcome::AlreadySubscribed
        );

        assert_eq!(queue.pending_count().await, 1);
        assert_eq!(coordinator.subscribers(7).await, vec![1, 2]);
    }

    #[tokio::test]
    async fn execute_fetches_missing_pages_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut context = TestContext::new(dir.path()).await;
        seed_user(&context, 1, Some("secret"), FileFormat::Epub).await;
        seed_user(&context, 2, Some("other"), FileFormat::Pdf).await;
        let volume = seed_volume(&context, 4).await;

        let page_dir = context.layout().volume_dir(&volume, None);
        tokio::fs::create_dir_all(&page_dir).await.unwrap();
        tokio::fs::write(page_dir.join("2.jpg"), b"old").await.unwrap();

        let fetched = Arc::new(StdMutex::new(Vec::new()));
        let log = fetched.clone();
        context
            .remote
            .expect_authenticate()
            .times(1)
            .returning(|_, _, _| Ok(Session::from_cookies([("sid", "1")])));
        context
            .remote
            .expect_derive_page_url()
            .returning(|_, _, page| Ok(format!("https://cdn.example.com/{page}.jpg")));
        context.remote.expect_fetch_bytes().returning(move |url| {
            log.lock().unwrap().push(url.to_string());
            Ok(Bytes::from_static(b"page"))
        });
        expect_progress(&mut context);
        let sent = record_completions(&mut context);

        let repository = context.repository.clone();
        let (coordinator, queue) = coordinator(context.build());
        coordinator.subscribe(volume.id, 1, None).await.unwrap();
        coordinator.subscribe(volume.id, 2, None).await.unwrap();

        coordinator.execute(volume.id, 1).await.unwrap();

        assert_eq!(
            *fetched.lock().unwrap(),
            vec![
                "https://cdn.example.com/1.jpg",
                "https://cdn.example.com/3.jpg",
                "https://cdn.example.com/4.jpg",
            ]
        );
        assert_eq!(present_pages(&page_dir).await.unwrap(), vec![1, 2, 3, 4]);

        let sent = sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 2);
        assert!(sent[0].1.contains("EPUB"));
        assert!(sent[1].1.contains("PDF"));

        assert!(!coordinator.is_active(volume.id).await);
        let stored = repository.get_volume(volume.id).await.unwrap().unwrap();
        assert!(!stored.now_downloading);
        assert!(
            queue
                .contains_job_key(&format!("conversion:{}:epub:1", volume.id))
                .await
        );
        assert!(
            queue
                .contains_job_key(&format!("conversion:{}:pdf:2", volume.id))
                .await
        );
    }

    #[tokio::test]
    async fn failed_logins_notify_every_subscriber() {
        let dir = tempfile::tempdir().unwrap();
        let mut context = TestContext::new(dir.path()).await;
        seed_user(&context, 1, Some("wrong"), FileFormat::Pdf).await;
        seed_user(&context, 2, None, FileFormat::Pdf).await;
        let volume = seed_volume(&context, 3).await;

        let tried = Arc::new(StdMutex::new(Vec::new()));
        let log = tried.clone();
        context
            .remote
            .expect_authenticate()
            .returning(move |email, password, _| {
                log.lock().unwrap().push(password.to_string());
                Err(RemoteError::authentication(email, "rejected"))
            });
        expect_progress(&mut context);
        let sent = record_completions(&mut context);

        let repository = context.repository.clone();
        let (coordinator, _) = coordinator(context.build());
        coordinator.subscribe(volume.id, 1, None).await.unwrap();
        coordinator
            .subscribe(volume.id, 2, Some("override".into()))
            .await
            .unwrap();

        assert!(coordinator.execute(volume.id, 1).await.is_err());

        assert_eq!(*tried.lock().unwrap(), vec!["wrong", "override"]);
        let sent = sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|(_, text)| text.contains("could not be downloaded")));

        assert!(!coordinator.is_active(volume.id).await);
        let stored = repository.get_volume(volume.id).await.unwrap().unwrap();
        assert!(!stored.now_downloading);
    }

    #[tokio::test]
    async fn page_recovers_within_retry_budget() {
        let dir = tempfile::tempdir().unwrap();
        let mut context = TestContext::new(dir.path()).await;
        seed_user(&context, 1, Some("secret"), FileFormat::Pdf).await;
        let volume = seed_volume(&context, 1).await;

        let calls = Arc::new(StdMutex::new(0));
        let counter = calls.clone();
        context
            .remote
            .expect_authenticate()
            .returning(|_, _, _| Ok(Session::from_cookies([("sid", "1")])));
        context
            .remote
            .expect_derive_page_url()
            .times(2)
            .returning(|_, _, page| Ok(format!("https://cdn.example.com/{page}.jpg")));
        context.remote.expect_fetch_bytes().returning(move |url| {
            let mut calls = counter.lock().unwrap();
            *calls += 1;
            if *calls == 1 {
                Err(RemoteError::fetch(url, "connection reset"))
            } else {
                Ok(Bytes::from_static(b"page"))
            }
        });
        expect_progress(&mut context);
        record_completions(&mut context);

        let layout = context.layout();
        let (coordinator, _) = coordinator(context.build());
        coordinator.subscribe(volume.id, 1, None).await.unwrap();
        coordinator.execute(volume.id, 1).await.unwrap();

        let page_dir = layout.volume_dir(&volume, None);
        assert_eq!(present_pages(&page_dir).await.unwrap(), vec![1]);
        assert!(!page_dir.join("1.jpg.part").exists());
    }

    #[tokio::test]
    async fn page_exhausting_retries_fails_the_download() {
        let dir = tempfile::tempdir().unwrap();
        let mut context = TestContext::new(dir.path()).await;
        seed_user(&context, 1, Some("secret"), FileFormat::Pdf).await;
        let volume = seed_volume(&context, 2).await;

        context
            .remote
            .expect_authenticate()
            .returning(|_, _, _| Ok(Session::from_cookies([("sid", "1")])));
        context
            .remote
            .expect_derive_page_url()
            .returning(|_, _, page| Ok(format!("https://cdn.example.com/{page}.jpg")));
        context
            .remote
            .expect_fetch_bytes()
            .times(3)
            .returning(|url| Err(RemoteError::fetch(url, "503")));
        expect_progress(&mut context);
        let sent = record_completions(&mut context);

        let repository = context.repository.clone();
        let (coordinator, queue) = coordinator(context.build());
        coordinator.subscribe(volume.id, 1, None).await.unwrap();
        assert!(coordinator.execute(volume.id, 1).await.is_err());

        assert_eq!(sent.lock().unwrap().len(), 1);
        assert!(!coordinator.is_active(volume.id).await);
        let stored = repository.get_volume(volume.id).await.unwrap().unwrap();
        assert!(!stored.now_downloading);
        // Only the original download job; no conversion follows a failure
        assert_eq!(queue.stats().await.total_tracked_keys, 1);
    }

    #[tokio::test]
    async fn complete_volume_goes_straight_to_conversion() {
        let dir = tempfile::tempdir().unwrap();
        let context = TestContext::new(dir.path()).await;
        seed_user(&context, 1, Some("secret"), FileFormat::Jpg).await;
        let volume = seed_volume(&context, 2).await;

        let page_dir = context.layout().volume_dir(&volume, None);
        tokio::fs::create_dir_all(&page_dir).await.unwrap();
        for page in 1..=2 {
            tokio::fs::write(page_dir.join(format!("{page}.jpg")), b"p")
                .await
                .unwrap();
        }

        let (coordinator, queue) = coordinator(context.build());
        let request = coordinator.request_volume(1, volume.id, None).await.unwrap();

        assert_eq!(
            request,
            VolumeRequest::Conversion(SubscribeOutcome::Triggered)
        );
        assert!(!coordinator.is_active(volume.id).await);
        assert!(
            queue
                .contains_job_key(&format!("conversion:{}:jpg:1", volume.id))
                .await
        );
    }

    #[tokio::test]
    async fn stale_generation_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, _) = coordinator(TestContext::new(dir.path()).await.build());

        // No registry entry and no remote expectations: nothing may run
        coordinator.execute(11, 42).await.unwrap();
    }
}
