//! Process-wide job scheduler: owns the queue, the runner, the coordinators
//! and the recurring sync registry.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OnceCell};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::anchor::SyncAnchor;
use super::context::JobContext;
use super::conversion::ConversionCoordinator;
use super::download::{DownloadCoordinator, VolumeRequest};
use super::job_executor::{JobExecutor, PURGE_EXPIRED_UPLOADS};
use super::job_queue::{JobQueue, JobQueueStats};
use super::job_queue_runner::{ExecutionStats, JobQueueRunner};
use super::library_sync::{LibrarySyncService, ReconcileReport, SyncCredentials};
use super::types::{JobPriority, JobType, ScheduledJob, SubscribeOutcome};
use crate::errors::{AppResult, JobSchedulingError};
use crate::models::{FileFormat, Session};

static INSTANCE: OnceCell<Arc<JobScheduler>> = OnceCell::const_new();

pub struct JobScheduler {
    context: JobContext,
    queue: Arc<JobQueue>,
    runner: Arc<JobQueueRunner>,
    library_sync: Arc<LibrarySyncService>,
    downloads: Arc<DownloadCoordinator>,
    conversions: Arc<ConversionCoordinator>,
    shutdown: CancellationToken,
    started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl JobScheduler {
    /// Build an unshared scheduler. Nothing runs until [`JobScheduler::start`].
    pub fn new(context: JobContext) -> AppResult<Arc<Self>> {
        let anchor = SyncAnchor::from_config(&context.config.scheduling)?;
        let shutdown = CancellationToken::new();
        let queue = Arc::new(JobQueue::new());

        let library_sync = Arc::new(LibrarySyncService::new(
            context.clone(),
            queue.clone(),
            anchor,
            shutdown.clone(),
        ));
        let conversions = Arc::new(ConversionCoordinator::new(context.clone(), queue.clone()));
        let downloads = Arc::new(DownloadCoordinator::new(
            context.clone(),
            queue.clone(),
            conversions.clone(),
        ));
        let executor = Arc::new(JobExecutor::new(
            context.clone(),
            library_sync.clone(),
            downloads.clone(),
            conversions.clone(),
        ));
        let runner = Arc::new(JobQueueRunner::new(
            queue.clone(),
            executor,
            &context.config.job_scheduling,
        ));

        Ok(Arc::new(Self {
            context,
            queue,
            runner,
            library_sync,
            downloads,
            conversions,
            shutdown,
            started: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }))
    }

    /// The process-wide scheduler, built and started on first call.
    /// Later calls return the existing instance and ignore `context`.
    pub async fn instance(context: JobContext) -> AppResult<Arc<Self>> {
        let (scheduler, created) = Self::get_or_create(context).await?;
        if !created {
            info!("Job scheduler already initialized, reusing the existing instance");
        }
        Ok(scheduler)
    }

    /// Like [`JobScheduler::instance`], but a second construction attempt fails
    pub async fn install(context: JobContext) -> AppResult<Arc<Self>> {
        let (scheduler, created) = Self::get_or_create(context).await?;
        if !created {
            warn!("Refusing to construct a second job scheduler");
            return Err(JobSchedulingError::AlreadyInitialized.into());
        }
        Ok(scheduler)
    }

    /// The process-wide scheduler, if one was created
    pub fn get() -> Option<Arc<Self>> {
        INSTANCE.get().cloned()
    }

    async fn get_or_create(context: JobContext) -> AppResult<(Arc<Self>, bool)> {
        let created = AtomicBool::new(false);
        let created_flag = &created;

        let scheduler = INSTANCE
            .get_or_try_init(|| async move {
                let scheduler = Self::new(context)?;
                scheduler.start().await?;
                created_flag.store(true, Ordering::Release);
                info!("Job scheduler singleton instantiated");
                AppResult::Ok(scheduler)
            })
            .await?
            .clone();

        Ok((scheduler, created.load(Ordering::Acquire)))
    }

    /// Start the runner and the maintenance timer, then reconcile persisted
    /// state. Calling it again is a no-op.
    pub async fn start(self: &Arc<Self>) -> AppResult<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            debug!("Job scheduler already started");
            return Ok(());
        }
        if self.shutdown.is_cancelled() {
            return Err(JobSchedulingError::ShutDown.into());
        }

        let runner = self.runner.clone();
        let token = self.shutdown.clone();
        let runner_task = tokio::spawn(async move {
            if let Err(e) = runner.run(token).await {
                error!("Job queue runner stopped with error: {}", e);
            }
        });

        let mut tasks = self.tasks.lock().await;
        tasks.push(runner_task);
        tasks.push(self.spawn_maintenance());
        drop(tasks);

        if self.context.config.scheduling.reconcile_on_startup {
            self.reconcile().await?;
        }

        info!(
            "Job scheduler started (anchor: {})",
            self.library_sync.anchor()
        );
        Ok(())
    }

    fn spawn_maintenance(&self) -> JoinHandle<()> {
        let queue = self.queue.clone();
        let token = self.shutdown.clone();
        let period = self.context.config.delivery.upload_purge_interval;

        tokio::spawn(async move {
            let mut maintenance_check = interval(period);
            // Skip the first immediate tick
            maintenance_check.tick().await;

            loop {
                tokio::select! {
                    _ = maintenance_check.tick() => {
                        let job = ScheduledJob::new(
                            JobType::Maintenance(PURGE_EXPIRED_UPLOADS.to_string()),
                            JobPriority::Maintenance,
                        );
                        match queue.enqueue(job).await {
                            Ok(true) => info!("Scheduled maintenance: {}", PURGE_EXPIRED_UPLOADS),
                            Ok(false) => debug!("Maintenance {} already scheduled, skipping", PURGE_EXPIRED_UPLOADS),
                            Err(e) => {
                                warn!("Failed to enqueue maintenance {}: {}", PURGE_EXPIRED_UPLOADS, e);
                                break;
                            }
                        }
                    }
                    _ = token.cancelled() => break,
                }
            }
        })
    }

    /// Clear flags left by a previous process, run overdue syncs and
    /// reinstall recurring schedules
    pub async fn reconcile(&self) -> AppResult<ReconcileReport> {
        let reset = self.context.repository.reset_transient_flags().await?;
        if reset > 0 {
            info!("Cleared {} stale caching/downloading flags", reset);
        }
        self.library_sync.reconcile().await
    }

    /// Download handler entry point
    pub async fn request_volume(
        &self,
        user_id: i64,
        volume_id: i32,
        password_override: Option<String>,
    ) -> AppResult<VolumeRequest> {
        self.downloads
            .request_volume(user_id, volume_id, password_override)
            .await
    }

    pub async fn subscribe_download(
        &self,
        volume_id: i32,
        requester: i64,
        password_override: Option<String>,
    ) -> AppResult<SubscribeOutcome> {
        Ok(self
            .downloads
            .subscribe(volume_id, requester, password_override)
            .await?)
    }

    pub async fn subscribe_conversion(
        &self,
        volume_id: i32,
        format: FileFormat,
        requester: i64,
    ) -> AppResult<SubscribeOutcome> {
        Ok(self
            .conversions
            .subscribe(volume_id, format, requester, false)
            .await?)
    }

    pub async fn trigger_once(
        &self,
        user_id: i64,
        credentials: Option<SyncCredentials>,
    ) -> AppResult<bool> {
        Ok(self.library_sync.trigger_once(user_id, credentials).await?)
    }

    pub async fn add_user_auto_sync(
        &self,
        user_id: i64,
        session: Option<Session>,
    ) -> AppResult<DateTime<Utc>> {
        Ok(self
            .library_sync
            .add_user_auto_sync(user_id, session)
            .await?)
    }

    pub async fn schedule_recurring(&self, user_id: i64) -> DateTime<Utc> {
        self.library_sync.schedule_recurring(user_id).await
    }

    pub async fn cancel_recurring(&self, user_id: i64) -> bool {
        self.library_sync.cancel_recurring(user_id).await
    }

    pub fn library_sync(&self) -> &LibrarySyncService {
        &self.library_sync
    }

    pub fn downloads(&self) -> &DownloadCoordinator {
        &self.downloads
    }

    pub fn conversions(&self) -> &ConversionCoordinator {
        &self.conversions
    }

    pub async fn queue_stats(&self) -> JobQueueStats {
        self.queue.stats().await
    }

    pub async fn execution_stats(&self) -> ExecutionStats {
        self.runner.get_execution_stats().await
    }

    /// Wait until no job is pending or running. Returns false on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let started = Instant::now();
        loop {
            if self.queue.is_idle().await {
                return true;
            }
            if started.elapsed() >= timeout {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Stop accepting jobs, cancel recurring syncs and wait (bounded by
    /// `job_scheduling.shutdown_grace`) for running jobs
    pub async fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        info!("Shutting down job scheduler");

        self.queue.close();
        self.library_sync.cancel_all().await;
        self.shutdown.cancel();

        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Job scheduler task ended abnormally: {}", e);
            }
        }

        info!("Job scheduler stopped");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}
