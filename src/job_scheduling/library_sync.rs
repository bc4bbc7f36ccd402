//! Per-user library sync: recurring anchored schedule, one-shot triggers and
//! the sync job body itself.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::anchor::SyncAnchor;
use super::context::JobContext;
use super::job_queue::JobQueue;
use super::types::{JobPriority, JobType, ScheduledJob, SyncOrigin, SyncRequest};
use crate::errors::{AppError, AppResult, JobSchedulingError, RemoteError};
use crate::i18n::Message;
use crate::models::{
    NewSeries, NewVolume, PurchaseItem, Series, Session, User, UserUpdate, VolumeListing,
};
use crate::storage::LibraryLayout;

/// Credentials handed to a one-shot sync instead of the stored ones
#[derive(Clone, Default)]
pub struct SyncCredentials {
    /// Already authenticated session; skips login entirely
    pub session: Option<Session>,
    /// Password to log in with when the user did not store one
    pub password: Option<String>,
    pub fast_login: bool,
}

impl fmt::Debug for SyncCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncCredentials")
            .field("session", &self.session)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("fast_login", &self.fast_login)
            .finish()
    }
}

/// Counts of what one sync run changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub purchases: usize,
    pub series_created: usize,
    pub volumes_created: usize,
    pub ownerships_added: usize,
    /// Items dropped because a store write failed
    pub skipped: usize,
}

/// Outcome of startup reconciliation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub immediate_syncs: usize,
    pub recurring_installed: usize,
}

/// Live recurring sync of one user
struct RecurringJobHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl RecurringJobHandle {
    fn cancel(self) {
        self.token.cancel();
        drop(self.task);
    }
}

/// Latest manual sync queued for a user
struct ManualTrigger {
    generation: u64,
    started: bool,
}

pub struct LibrarySyncService {
    context: JobContext,
    queue: Arc<JobQueue>,
    anchor: SyncAnchor,
    recurring: Mutex<HashMap<i64, RecurringJobHandle>>,
    manual_triggers: Mutex<HashMap<i64, ManualTrigger>>,
    manual_generation: AtomicU64,
    pending_credentials: Mutex<HashMap<i64, SyncCredentials>>,
    /// Serializes the runs of one user
    run_locks: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
    shutdown: CancellationToken,
}

impl LibrarySyncService {
    pub fn new(
        context: JobContext,
        queue: Arc<JobQueue>,
        anchor: SyncAnchor,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            context,
            queue,
            anchor,
            recurring: Mutex::new(HashMap::new()),
            manual_triggers: Mutex::new(HashMap::new()),
            manual_generation: AtomicU64::new(0),
            pending_credentials: Mutex::new(HashMap::new()),
            run_locks: Mutex::new(HashMap::new()),
            shutdown,
        }
    }

    pub fn anchor(&self) -> &SyncAnchor {
        &self.anchor
    }

    /// Install the daily sync of `user_id`, replacing any existing one.
    /// Returns the first run time.
    pub async fn schedule_recurring(&self, user_id: i64) -> DateTime<Utc> {
        let first_run = self.anchor.next_after(Utc::now());
        let token = self.shutdown.child_token();

        let mut recurring = self.recurring.lock().await;
        if let Some(previous) = recurring.remove(&user_id) {
            debug!("Replacing recurring library sync of user {}", user_id);
            previous.cancel();
        }

        let task = tokio::spawn(run_recurring(
            user_id,
            first_run,
            self.anchor.clone(),
            self.queue.clone(),
            token.clone(),
        ));
        recurring.insert(user_id, RecurringJobHandle { token, task });
        drop(recurring);

        info!(
            "Scheduled recurring library sync for user {} (anchor: {}, next run: {})",
            user_id,
            self.anchor,
            first_run.format("%Y-%m-%d %H:%M:%S UTC")
        );
        first_run
    }

    /// Stop the recurring sync of `user_id`. Returns false if none was installed.
    pub async fn cancel_recurring(&self, user_id: i64) -> bool {
        match self.recurring.lock().await.remove(&user_id) {
            Some(handle) => {
                handle.cancel();
                info!("Cancelled recurring library sync for user {}", user_id);
                true
            }
            None => false,
        }
    }

    pub async fn cancel_all(&self) {
        let handles: Vec<_> = self.recurring.lock().await.drain().collect();
        for (_, handle) in handles {
            handle.cancel();
        }
    }

    pub async fn has_recurring(&self, user_id: i64) -> bool {
        self.recurring.lock().await.contains_key(&user_id)
    }

    pub async fn recurring_users(&self) -> Vec<i64> {
        let mut users: Vec<i64> = self.recurring.lock().await.keys().copied().collect();
        users.sort_unstable();
        users
    }

    /// Next fire time of the recurring sync of `user_id`, if one is installed
    pub async fn next_recurring_run(&self, user_id: i64) -> Option<DateTime<Utc>> {
        if self.has_recurring(user_id).await {
            Some(self.anchor.next_after(Utc::now()))
        } else {
            None
        }
    }

    /// Queue an immediate sync outside the recurring schedule.
    ///
    /// A trigger that arrives while a manual sync of the user is still queued
    /// folds into it (its credentials replace the queued ones) and returns
    /// `Ok(false)`. One that arrives while a run is in flight queues a
    /// follow-up run. Credentials are consumed by the next manual run.
    pub async fn trigger_once(
        &self,
        user_id: i64,
        credentials: Option<SyncCredentials>,
    ) -> Result<bool, JobSchedulingError> {
        let fast_login = credentials.as_ref().is_some_and(|c| c.fast_login);
        let mut triggers = self.manual_triggers.lock().await;
        if let Some(credentials) = credentials {
            self.pending_credentials
                .lock()
                .await
                .insert(user_id, credentials);
        }

        if triggers.get(&user_id).is_some_and(|t| !t.started) {
            debug!("Manual library sync for user {} already queued", user_id);
            return Ok(false);
        }

        let generation = self.manual_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let queued = self
            .enqueue_sync(
                user_id,
                SyncOrigin::Manual,
                generation,
                fast_login,
                JobPriority::High,
            )
            .await;
        match queued {
            Ok(true) => {
                triggers.insert(
                    user_id,
                    ManualTrigger {
                        generation,
                        started: false,
                    },
                );
                Ok(true)
            }
            other => {
                self.pending_credentials.lock().await.remove(&user_id);
                other
            }
        }
    }

    /// One-shot sync followed by the recurring schedule, used once a user saved credentials
    pub async fn add_user_auto_sync(
        &self,
        user_id: i64,
        session: Option<Session>,
    ) -> Result<DateTime<Utc>, JobSchedulingError> {
        let credentials = SyncCredentials {
            session,
            password: None,
            fast_login: true,
        };
        // Must exist before the sync runs; a login failure cancels it
        let next_run = self.schedule_recurring(user_id).await;
        if let Err(e) = self.trigger_once(user_id, Some(credentials)).await {
            self.cancel_recurring(user_id).await;
            return Err(e);
        }
        Ok(next_run)
    }

    async fn enqueue_sync(
        &self,
        user_id: i64,
        origin: SyncOrigin,
        generation: u64,
        fast_login: bool,
        priority: JobPriority,
    ) -> Result<bool, JobSchedulingError> {
        let job = ScheduledJob::new(
            JobType::LibrarySync(SyncRequest {
                user_id,
                origin,
                fast_login,
                generation,
            }),
            priority,
        );

        match self.queue.enqueue(job).await {
            Ok(true) => {
                info!("Queued {} library sync for user {}", origin, user_id);
                Ok(true)
            }
            Ok(false) => {
                debug!(
                    "{} library sync for user {} already scheduled",
                    origin, user_id
                );
                Ok(false)
            }
            Err(e) => {
                warn!("Failed to queue library sync for user {}: {}", user_id, e);
                Err(e)
            }
        }
    }

    /// Rebuild schedules from persisted users: run overdue syncs now and
    /// install the recurring sync of every eligible user.
    pub async fn reconcile(&self) -> AppResult<ReconcileReport> {
        let now = Utc::now();
        let users = self.context.repository.list_auto_sync_users().await?;
        let mut report = ReconcileReport::default();

        for user in users {
            if user.login_error {
                debug!(
                    "User {} has a login error, not restoring automatic sync",
                    user.id
                );
                continue;
            }

            if user.cache_expired(now)
                && self
                    .enqueue_sync(
                        user.id,
                        SyncOrigin::Scheduled,
                        0,
                        false,
                        JobPriority::Critical,
                    )
                    .await
                    .unwrap_or(false)
            {
                report.immediate_syncs += 1;
            }

            self.schedule_recurring(user.id).await;
            report.recurring_installed += 1;
        }

        info!(
            "Library sync reconciliation: {} immediate syncs, {} recurring schedules",
            report.immediate_syncs, report.recurring_installed
        );
        Ok(report)
    }

    /// Job body of a queued sync
    pub async fn execute(&self, request: SyncRequest) -> AppResult<SyncReport> {
        let run_lock = self
            .run_locks
            .lock()
            .await
            .entry(request.user_id)
            .or_default()
            .clone();
        let _running = run_lock.lock().await;

        match request.origin {
            SyncOrigin::Manual => {
                let credentials = self.begin_manual_run(&request).await;
                let result = self.execute_with(request, credentials).await;
                self.finish_manual_run(&request).await;
                result
            }
            SyncOrigin::Scheduled => {
                self.execute_with(request, SyncCredentials::default())
                    .await
            }
        }
    }

    /// Take the credentials left for this run; later triggers queue a new run
    async fn begin_manual_run(&self, request: &SyncRequest) -> SyncCredentials {
        let mut triggers = self.manual_triggers.lock().await;
        if let Some(trigger) = triggers
            .get_mut(&request.user_id)
            .filter(|t| t.generation == request.generation)
        {
            trigger.started = true;
        }
        self.pending_credentials
            .lock()
            .await
            .remove(&request.user_id)
            .unwrap_or_default()
    }

    async fn finish_manual_run(&self, request: &SyncRequest) {
        let mut triggers = self.manual_triggers.lock().await;
        if triggers
            .get(&request.user_id)
            .is_some_and(|t| t.generation == request.generation)
        {
            triggers.remove(&request.user_id);
        }
    }

    async fn execute_with(
        &self,
        request: SyncRequest,
        credentials: SyncCredentials,
    ) -> AppResult<SyncReport> {

        let user = self
            .context
            .repository
            .get_user(request.user_id)
            .await?
            .ok_or_else(|| AppError::not_found("user", request.user_id))?;

        if request.origin == SyncOrigin::Scheduled
            && (!user.is_auto_sync_eligible() || user.login_error)
        {
            info!(
                "Skipping scheduled library sync of user {}: automatic sync is disabled",
                user.id
            );
            return Ok(SyncReport::default());
        }

        self.run_sync(
            &user,
            credentials.session,
            credentials.password,
            request.fast_login || credentials.fast_login,
        )
        .await
    }

    /// Reconcile the user's remote purchases into the library store
    pub async fn run_sync(
        &self,
        user: &User,
        session: Option<Session>,
        password: Option<String>,
        fast_login: bool,
    ) -> AppResult<SyncReport> {
        let repository = &self.context.repository;

        if let Err(e) = repository
            .update_user(user.id, UserUpdate::now_caching(true))
            .await
        {
            warn!("Failed to mark user {} as caching: {}", user.id, e);
        }

        let result = self
            .sync_library(user, session, password.as_deref(), fast_login)
            .await;

        match &result {
            Ok(report) => {
                let expires = self.anchor.next_after(Utc::now());
                if let Err(e) = repository
                    .update_user(user.id, UserUpdate::sync_succeeded(expires))
                    .await
                {
                    error!("Failed to record library sync of user {}: {}", user.id, e);
                }
                info!(
                    "Library sync of user {} finished: {} purchases, {} new series, {} new volumes, {} new ownerships, {} skipped",
                    user.id,
                    report.purchases,
                    report.series_created,
                    report.volumes_created,
                    report.ownerships_added,
                    report.skipped
                );
            }
            Err(e) if e.is_authentication() => {
                self.handle_login_failure(user, e).await;
            }
            Err(e) => {
                warn!("Library sync of user {} failed: {}", user.id, e);
            }
        }

        if let Err(e) = repository
            .update_user(user.id, UserUpdate::now_caching(false))
            .await
        {
            error!("Failed to clear caching flag of user {}: {}", user.id, e);
        }

        result
    }

    async fn sync_library(
        &self,
        user: &User,
        session: Option<Session>,
        password: Option<&str>,
        fast_login: bool,
    ) -> AppResult<SyncReport> {
        let remote = &self.context.remote;

        let session = match session {
            Some(session) => session,
            None => {
                let email = user.email.as_deref().ok_or_else(|| {
                    RemoteError::authentication(format!("user {}", user.id), "no email on file")
                })?;
                let password = password
                    .or(user.stored_password())
                    .ok_or_else(|| RemoteError::authentication(email, "no password available"))?;
                self.context
                    .authenticate(email, password, fast_login)
                    .await?
            }
        };

        let purchases = remote.list_purchases(&session).await?;
        let mut report = SyncReport {
            purchases: purchases.len(),
            ..SyncReport::default()
        };
        debug!("User {} has {} purchases", user.id, purchases.len());

        for item in &purchases {
            if item.is_series {
                let series = match self.ensure_series(item, &mut report).await {
                    Ok(series) => series,
                    Err(e) => {
                        warn!("Skipping series {} for user {}: {}", item.url, user.id, e);
                        report.skipped += 1;
                        continue;
                    }
                };

                let listings = remote.list_series_volumes(&session, item).await?;
                for listing in &listings {
                    self.record_purchase(user.id, &session, listing, Some(&series), &mut report)
                        .await?;
                }
            } else {
                self.record_purchase(
                    user.id,
                    &session,
                    &item.as_volume_listing(),
                    None,
                    &mut report,
                )
                .await?;
            }
        }

        Ok(report)
    }

    /// Store writes are skipped on failure; remote failures abort the run
    async fn record_purchase(
        &self,
        user_id: i64,
        session: &Session,
        listing: &VolumeListing,
        series: Option<&Series>,
        report: &mut SyncReport,
    ) -> AppResult<()> {
        match self
            .ensure_owned(user_id, session, listing, series, report)
            .await
        {
            Err(e @ (AppError::Repository(_) | AppError::Database(_))) => {
                warn!("Skipping volume {} for user {}: {}", listing.url, user_id, e);
                report.skipped += 1;
                Ok(())
            }
            other => other,
        }
    }

    async fn ensure_series(
        &self,
        item: &PurchaseItem,
        report: &mut SyncReport,
    ) -> AppResult<Series> {
        let repository = &self.context.repository;

        if let Some(series) = repository.find_series_by_url(&item.url).await? {
            return Ok(series);
        }

        let mut series = repository
            .create_series(NewSeries {
                title: item.name.clone(),
                url: item.url.clone(),
                thumbnail_url: item.thumbnail_url.clone(),
            })
            .await?;
        report.series_created += 1;
        debug!("Created series {} ({})", series.id, series.title);

        // Needs the persisted id for its directory name
        if let Some(thumbnail_url) = series.thumbnail_url.clone() {
            let dir = self.context.layout.series_dir(&series);
            if let Some(path) = self.store_thumbnail(&thumbnail_url, &dir).await {
                let path = path.to_string_lossy().into_owned();
                match repository.set_series_thumbnail(series.id, &path).await {
                    Ok(()) => series.thumbnail_local = Some(path),
                    Err(e) => warn!("Failed to record thumbnail of series {}: {}", series.id, e),
                }
            }
        }

        Ok(series)
    }

    async fn ensure_owned(
        &self,
        user_id: i64,
        session: &Session,
        listing: &VolumeListing,
        series: Option<&Series>,
        report: &mut SyncReport,
    ) -> AppResult<()> {
        let repository = &self.context.repository;

        if repository.user_owns_volume(user_id, &listing.url).await? {
            return Ok(());
        }

        let volume = match repository.find_volume_by_url(&listing.url).await? {
            Some(volume) => volume,
            None => {
                let details = self
                    .context
                    .remote
                    .fetch_details(session, &listing.details_url)
                    .await?;
                let volume = repository
                    .create_volume(NewVolume {
                        title: listing.name.clone(),
                        url: listing.url.clone(),
                        thumbnail_url: listing.thumbnail_url.clone(),
                        description: Some(details.description),
                        pages: details.pages,
                        series_id: series.map(|s| s.id),
                    })
                    .await?;
                report.volumes_created += 1;
                debug!("Created volume {} ({})", volume.id, volume.title);

                if let Some(thumbnail_url) = &volume.thumbnail_url {
                    let dir = self.context.layout.volume_dir(&volume, series);
                    if let Some(path) = self.store_thumbnail(thumbnail_url, &dir).await {
                        if let Err(e) = repository
                            .set_volume_thumbnail(volume.id, &path.to_string_lossy())
                            .await
                        {
                            warn!("Failed to record thumbnail of volume {}: {}", volume.id, e);
                        }
                    }
                }
                volume
            }
        };

        repository.add_ownership(user_id, volume.id).await?;
        report.ownerships_added += 1;
        Ok(())
    }

    /// Cover images are best effort
    async fn store_thumbnail(&self, url: &str, dir: &Path) -> Option<PathBuf> {
        let result: AppResult<PathBuf> = async {
            let bytes = self.context.remote.fetch_bytes(url).await?;
            tokio::fs::create_dir_all(dir).await?;
            let path = LibraryLayout::thumbnail_path(dir);
            tokio::fs::write(&path, &bytes).await?;
            Ok(path)
        }
        .await;

        match result {
            Ok(path) => Some(path),
            Err(e) => {
                warn!("Failed to store thumbnail {}: {}", url, e);
                None
            }
        }
    }

    async fn handle_login_failure(&self, user: &User, error: &AppError) {
        warn!(
            "Login failed for user {}, disabling automatic library sync: {}",
            user.id, error
        );

        if let Err(e) = self
            .context
            .repository
            .update_user(user.id, UserUpdate::login_error(true))
            .await
        {
            error!("Failed to record login error of user {}: {}", user.id, e);
        }
        self.cancel_recurring(user.id).await;

        let message = if user.cache_built {
            Message::UpdateLibraryError
        } else {
            Message::BuildLibraryError
        };
        self.context.notify(user.id, message).await;
    }
}

/// Body of a recurring schedule: enqueue a sync at every anchor occurrence
async fn run_recurring(
    user_id: i64,
    mut next_run: DateTime<Utc>,
    anchor: SyncAnchor,
    queue: Arc<JobQueue>,
    token: CancellationToken,
) {
    loop {
        let wait = (next_run - Utc::now()).to_std().unwrap_or_default();
        tokio::select! {
            _ = token.cancelled() => {
                debug!("Recurring library sync of user {} stopped", user_id);
                return;
            }
            _ = tokio::time::sleep(wait) => {}
        }

        let job = ScheduledJob::new(
            JobType::LibrarySync(SyncRequest {
                user_id,
                origin: SyncOrigin::Scheduled,
                fast_login: false,
                generation: 0,
            }),
            JobPriority::Normal,
        );
        match queue.enqueue(job).await {
            Ok(true) => info!("Recurring library sync of user {} is due", user_id),
            Ok(false) => debug!("Library sync of user {} already scheduled", user_id),
            Err(e) => {
                warn!(
                    "Stopping recurring library sync of user {}: {}",
                    user_id, e
                );
                return;
            }
        }

        next_run = anchor.next_after(next_run.max(Utc::now()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulingConfig;
    use crate::database::repositories::LibraryRepository;
    use crate::job_scheduling::test_support::TestContext;
    use crate::models::{Language, VolumeDetails};
    use bytes::Bytes;
    use tracing_test::traced_test;

    fn anchor() -> SyncAnchor {
        SyncAnchor::from_config(&SchedulingConfig::default()).unwrap()
    }

    fn service(context: JobContext) -> (LibrarySyncService, Arc<JobQueue>) {
        let queue = Arc::new(JobQueue::new());
        let service =
            LibrarySyncService::new(context, queue.clone(), anchor(), CancellationToken::new());
        (service, queue)
    }

    fn purchases() -> Vec<PurchaseItem> {
        vec![
            PurchaseItem {
                name: "Saga".into(),
                url: "https://book.example.com/series/1".into(),
                details_url: "https://book.example.com/details/series-1".into(),
                thumbnail_url: Some("https://img.example.com/saga.jpg".into()),
                is_series: true,
            },
            PurchaseItem {
                name: "Oneshot".into(),
                url: "https://book.example.com/product/9".into(),
                details_url: "https://book.example.com/details/9".into(),
                thumbnail_url: None,
                is_series: false,
            },
        ]
    }

    fn saga_volumes() -> Vec<VolumeListing> {
        (1..=2)
            .map(|n| VolumeListing {
                name: format!("Saga {n}"),
                url: format!("https://book.example.com/product/saga-{n}"),
                details_url: format!("https://book.example.com/details/saga-{n}"),
                thumbnail_url: None,
            })
            .collect()
    }

    async fn stored_user(context: &TestContext, id: i64) -> User {
        context
            .repository
            .get_or_create_user(id, Language::En)
            .await
            .unwrap();
        context
            .repository
            .update_user(
                id,
                UserUpdate::credentials("reader@example.com".into(), Some("secret".into()), true),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn schedule_recurring_twice_keeps_one_handle() {
        let dir = tempfile::tempdir().unwrap();
        let (service, _) = service(TestContext::new(dir.path()).await.build());

        let first = service.schedule_recurring(5).await;
        let second = service.schedule_recurring(5).await;

        assert_eq!(first, second);
        assert_eq!(service.recurring_users().await, vec![5]);
        assert!(first > Utc::now());

        assert!(service.cancel_recurring(5).await);
        assert!(!service.has_recurring(5).await);
        assert!(service.next_recurring_run(5).await.is_none());
    }

    #[tokio::test]
    async fn cancel_unknown_user_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let (service, _) = service(TestContext::new(dir.path()).await.build());

        service.schedule_recurring(1).await;
        assert!(!service.cancel_recurring(99).await);
        assert_eq!(service.recurring_users().await, vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn recurring_task_enqueues_scheduled_sync_when_due() {
        let queue = Arc::new(JobQueue::new());
        let token = CancellationToken::new();
        let due = Utc::now() + chrono::Duration::minutes(30);

        let task = tokio::spawn(run_recurring(
            3,
            due,
            anchor(),
            queue.clone(),
            token.clone(),
        ));

        tokio::time::sleep(std::time::Duration::from_secs(10 * 60)).await;
        assert!(!queue.contains_job_key("sync:3:scheduled").await);

        tokio::time::sleep(std::time::Duration::from_secs(25 * 60)).await;
        assert!(queue.contains_job_key("sync:3:scheduled").await);

        token.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn run_sync_records_series_volumes_and_ownership() {
        let dir = tempfile::tempdir().unwrap();
        let mut context = TestContext::new(dir.path()).await;
        let user = stored_user(&context, 1).await;

        context
            .remote
            .expect_authenticate()
            .times(1)
            .returning(|_, password, _| {
                assert_eq!(password, "secret");
                Ok(Session::from_cookies([("sid", "1")]))
            });
        context
            .remote
            .expect_list_purchases()
            .returning(|_| Ok(purchases()));
        context
            .remote
            .expect_list_series_volumes()
            .returning(|_, _| Ok(saga_volumes()));
        context
            .remote
            .expect_fetch_details()
            .times(3)
            .returning(|_, _| {
                Ok(VolumeDetails {
                    description: "story".into(),
                    pages: 20,
                })
            });
        context
            .remote
            .expect_fetch_bytes()
            .returning(|_| Ok(Bytes::from_static(b"jpeg")));

        let repository = context.repository.clone();
        let (service, _) = service(context.build());

        let report = service.run_sync(&user, None, None, false).await.unwrap();
        assert_eq!(
            report,
            SyncReport {
                purchases: 2,
                series_created: 1,
                volumes_created: 3,
                ownerships_added: 3,
                skipped: 0,
            }
        );

        let stored = repository.get_user(1).await.unwrap().unwrap();
        assert!(stored.cache_built);
        assert!(!stored.now_caching);
        assert!(!stored.login_error);
        assert!(stored.cache_expire_date.unwrap() > Utc::now());

        let owned = repository.list_owned_volumes(1).await.unwrap();
        assert_eq!(owned.len(), 3);

        let series = repository
            .find_series_by_url("https://book.example.com/series/1")
            .await
            .unwrap()
            .unwrap();
        let thumbnail = series.thumbnail_local.unwrap();
        assert!(thumbnail.ends_with(&format!("Saga-{}/thumbnail.jpg", series.id)));
        assert!(Path::new(&thumbnail).exists());
    }

    #[tokio::test]
    async fn second_sync_only_adds_new_purchases() {
        let dir = tempfile::tempdir().unwrap();
        let mut context = TestContext::new(dir.path()).await;
        let user = stored_user(&context, 1).await;

        context
            .remote
            .expect_list_purchases()
            .returning(|_| Ok(purchases()));
        context
            .remote
            .expect_list_series_volumes()
            .returning(|_, _| Ok(saga_volumes()));
        // Details are only fetched on first sight of a volume
        context
            .remote
            .expect_fetch_details()
            .times(3)
            .returning(|_, _| {
                Ok(VolumeDetails {
                    description: String::new(),
                    pages: 4,
                })
            });
        context
            .remote
            .expect_fetch_bytes()
            .returning(|_| Ok(Bytes::from_static(b"jpeg")));

        let (service, _) = service(context.build());
        let session = Session::from_cookies([("sid", "1")]);

        service
            .run_sync(&user, Some(session.clone()), None, false)
            .await
            .unwrap();
        let report = service
            .run_sync(&user, Some(session), None, false)
            .await
            .unwrap();

        assert_eq!(report.ownerships_added, 0);
        assert_eq!(report.volumes_created, 0);
        assert_eq!(report.series_created, 0);
    }

    #[tokio::test]
    #[traced_test]
    async fn authentication_failure_disables_auto_sync() {
        let dir = tempfile::tempdir().unwrap();
        let mut context = TestContext::new(dir.path()).await;
        let user = stored_user(&context, 8).await;

        context
            .remote
            .expect_authenticate()
            .returning(|email, _, _| Err(RemoteError::authentication(email, "rejected")));
        context
            .notifier
            .expect_send_completion()
            .times(1)
            .returning(|requester, text| {
                assert_eq!(requester, 8);
                assert!(text.contains("credentials"));
                Ok(())
            });

        let repository = context.repository.clone();
        let (service, _) = service(context.build());
        service.schedule_recurring(8).await;

        let err = service.run_sync(&user, None, None, false).await.unwrap_err();
        assert!(err.is_authentication());

        let stored = repository.get_user(8).await.unwrap().unwrap();
        assert!(stored.login_error);
        assert!(!stored.now_caching);
        assert!(!service.has_recurring(8).await);
        assert!(logs_contain("disabling automatic library sync"));
    }

    #[tokio::test]
    async fn fetch_failure_keeps_credentials_and_schedule() {
        let dir = tempfile::tempdir().unwrap();
        let mut context = TestContext::new(dir.path()).await;
        let user = stored_user(&context, 2).await;

        context
            .remote
            .expect_authenticate()
            .returning(|_, _, _| Ok(Session::from_cookies([("sid", "1")])));
        context.remote.expect_list_purchases().returning(|_| {
            Err(RemoteError::fetch(
                "https://book.example.com/library/",
                "503",
            ))
        });
        context.notifier.expect_send_completion().never();

        let repository = context.repository.clone();
        let (service, _) = service(context.build());
        service.schedule_recurring(2).await;

        let err = service.run_sync(&user, None, None, false).await.unwrap_err();
        assert!(!err.is_authentication());

        let stored = repository.get_user(2).await.unwrap().unwrap();
        assert!(!stored.login_error);
        assert!(!stored.now_caching);
        assert!(!stored.cache_built);
        assert!(service.has_recurring(2).await);
    }

    #[tokio::test]
    async fn manual_trigger_uses_supplied_password_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut context = TestContext::new(dir.path()).await;
        context
            .repository
            .get_or_create_user(4, Language::Ja)
            .await
            .unwrap();
        context
            .repository
            .update_user(
                4,
                UserUpdate::credentials("reader@example.com".into(), None, false),
            )
            .await
            .unwrap();

        context
            .remote
            .expect_authenticate()
            .times(1)
            .returning(|_, password, _| {
                assert_eq!(password, "typed-in");
                Ok(Session::from_cookies([("sid", "1")]))
            });
        context
            .remote
            .expect_list_purchases()
            .returning(|_| Ok(Vec::new()));

        let (service, queue) = service(context.build());
        let credentials = SyncCredentials {
            password: Some("typed-in".into()),
            ..SyncCredentials::default()
        };

        assert!(service.trigger_once(4, Some(credentials)).await.unwrap());
        assert!(queue.contains_job_key("sync:4:manual:1").await);

        let request = SyncRequest {
            user_id: 4,
            origin: SyncOrigin::Manual,
            fast_login: false,
            generation: 1,
        };
        service.execute(request).await.unwrap();
        assert!(service.pending_credentials.lock().await.is_empty());
        assert!(service.manual_triggers.lock().await.is_empty());
    }

    #[tokio::test]
    async fn trigger_during_a_run_queues_a_follow_up() {
        let dir = tempfile::tempdir().unwrap();
        let mut context = TestContext::new(dir.path()).await;
        context
            .repository
            .get_or_create_user(4, Language::Ja)
            .await
            .unwrap();
        context
            .repository
            .update_user(
                4,
                UserUpdate::credentials("reader@example.com".into(), None, false),
            )
            .await
            .unwrap();

        context
            .remote
            .expect_authenticate()
            .times(1)
            .returning(|_, password, _| {
                assert_eq!(password, "latest");
                Ok(Session::from_cookies([("sid", "1")]))
            });
        context
            .remote
            .expect_list_purchases()
            .returning(|_| Ok(Vec::new()));

        let (service, queue) = service(context.build());
        let typed = |password: &str| SyncCredentials {
            password: Some(password.into()),
            ..SyncCredentials::default()
        };
        let next_job = || {
            let queue = queue.clone();
            async move {
                let mut jobs = queue
                    .get_executable_jobs(Utc::now(), 10, &HashMap::new(), &HashMap::new())
                    .await;
                assert_eq!(jobs.len(), 1);
                let job = jobs.remove(0);
                queue.mark_running(job.id, job.job_type.job_key()).await;
                job
            }
        };

        assert!(service.trigger_once(4, Some(typed("old"))).await.unwrap());
        let first = next_job().await;
        let JobType::LibrarySync(first_request) = first.job_type else {
            panic!("expected a library sync, got {:?}", first.job_type);
        };
        let taken = service.begin_manual_run(&first_request).await;
        assert_eq!(taken.password.as_deref(), Some("old"));

        // The first run already consumed its credentials
        assert!(service.trigger_once(4, Some(typed("corrected"))).await.unwrap());
        assert!(queue.contains_job_key("sync:4:manual:2").await);
        // Folds into the queued follow-up
        assert!(!service.trigger_once(4, Some(typed("latest"))).await.unwrap());

        service.finish_manual_run(&first_request).await;
        queue.mark_completed(first.id).await;
        assert!(!queue.is_idle().await);

        let follow_up = next_job().await;
        let JobType::LibrarySync(request) = follow_up.job_type else {
            panic!("expected a library sync, got {:?}", follow_up.job_type);
        };
        assert_eq!(request.generation, 2);
        service.execute(request).await.unwrap();
        queue.mark_completed(follow_up.id).await;

        assert!(queue.is_idle().await);
        assert!(service.pending_credentials.lock().await.is_empty());
    }

    #[tokio::test]
    async fn remote_failure_mid_sync_keeps_what_was_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let mut context = TestContext::new(dir.path()).await;
        let user = stored_user(&context, 9).await;

        context
            .remote
            .expect_list_purchases()
            .returning(|_| Ok(purchases()));
        context
            .remote
            .expect_list_series_volumes()
            .returning(|_, _| Ok(saga_volumes()));
        let mut calls = 0;
        context
            .remote
            .expect_fetch_details()
            .times(2)
            .returning(move |_, url| {
                calls += 1;
                if calls == 1 {
                    Ok(VolumeDetails {
                        description: String::new(),
                        pages: 8,
                    })
                } else {
                    Err(RemoteError::fetch(url, "503"))
                }
            });
        context
            .remote
            .expect_fetch_bytes()
            .returning(|_| Ok(Bytes::from_static(b"jpeg")));
        context.notifier.expect_send_completion().never();

        let repository = context.repository.clone();
        let (service, _) = service(context.build());

        let session = Session::from_cookies([("sid", "1")]);
        let err = service
            .run_sync(&user, Some(session), None, false)
            .await
            .unwrap_err();
        assert!(!err.is_authentication());

        let owned = repository.list_owned_volumes(9).await.unwrap();
        assert_eq!(owned.len(), 1);
        assert_eq!(owned[0].url, "https://book.example.com/product/saga-1");
        assert!(
            repository
                .find_volume_by_url("https://book.example.com/product/saga-2")
                .await
                .unwrap()
                .is_none()
        );

        let stored = repository.get_user(9).await.unwrap().unwrap();
        assert!(!stored.now_caching);
        assert!(!stored.cache_built);
        assert!(!stored.login_error);
    }

    #[tokio::test]
    #[traced_test]
    async fn store_failure_skips_the_item_and_continues() {
        let dir = tempfile::tempdir().unwrap();
        let mut context = TestContext::new(dir.path()).await;
        let user = stored_user(&context, 10).await;

        context
            .remote
            .expect_list_purchases()
            .returning(|_| Ok(purchases()));
        context
            .remote
            .expect_list_series_volumes()
            .returning(|_, _| Ok(saga_volumes()));
        // A page count the store cannot hold fails the volume insert
        context
            .remote
            .expect_fetch_details()
            .times(3)
            .returning(|_, url| {
                let pages = if url.ends_with("saga-1") { u32::MAX } else { 12 };
                Ok(VolumeDetails {
                    description: String::new(),
                    pages,
                })
            });
        context
            .remote
            .expect_fetch_bytes()
            .returning(|_| Ok(Bytes::from_static(b"jpeg")));

        let repository = context.repository.clone();
        let (service, _) = service(context.build());

        let session = Session::from_cookies([("sid", "1")]);
        let report = service
            .run_sync(&user, Some(session), None, false)
            .await
            .unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(report.volumes_created, 2);
        assert_eq!(report.ownerships_added, 2);

        let mut owned: Vec<String> = repository
            .list_owned_volumes(10)
            .await
            .unwrap()
            .into_iter()
            .map(|v| v.url)
            .collect();
        owned.sort();
        assert_eq!(
            owned,
            vec![
                "https://book.example.com/product/9".to_string(),
                "https://book.example.com/product/saga-2".to_string(),
            ]
        );

        let stored = repository.get_user(10).await.unwrap().unwrap();
        assert!(stored.cache_built);
        assert!(!stored.now_caching);
        assert!(logs_contain("Skipping volume"));
    }

    #[tokio::test]
    async fn scheduled_run_skips_users_with_login_error() {
        let dir = tempfile::tempdir().unwrap();
        let context = TestContext::new(dir.path()).await;
        stored_user(&context, 6).await;
        context
            .repository
            .update_user(6, UserUpdate::login_error(true))
            .await
            .unwrap();

        // No remote expectations: any call would panic
        let (service, _) = service(context.build());
        let report = service
            .execute(SyncRequest {
                user_id: 6,
                origin: SyncOrigin::Scheduled,
                fast_login: false,
                generation: 0,
            })
            .await
            .unwrap();
        assert_eq!(report, SyncReport::default());
    }

    #[tokio::test]
    async fn reconcile_restores_schedules_and_runs_overdue_syncs() {
        let dir = tempfile::tempdir().unwrap();
        let context = TestContext::new(dir.path()).await;

        // Overdue: never synced
        stored_user(&context, 1).await;
        // Fresh cache
        stored_user(&context, 2).await;
        context
            .repository
            .update_user(
                2,
                UserUpdate::sync_succeeded(Utc::now() + chrono::Duration::hours(5)),
            )
            .await
            .unwrap();
        // Disabled after a login error
        stored_user(&context, 3).await;
        context
            .repository
            .update_user(3, UserUpdate::login_error(true))
            .await
            .unwrap();

        let (service, queue) = service(context.build());
        let report = service.reconcile().await.unwrap();

        assert_eq!(
            report,
            ReconcileReport {
                immediate_syncs: 1,
                recurring_installed: 2,
            }
        );
        assert_eq!(service.recurring_users().await, vec![1, 2]);
        assert!(queue.contains_job_key("sync:1:scheduled").await);
        assert!(!queue.contains_job_key("sync:2:scheduled").await);
    }
}
