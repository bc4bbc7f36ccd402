//! Job queue runner service for executing scheduled jobs

use super::job_executor::JobExecutor;
use super::job_queue::JobQueue;
use super::types::{JobType, ScheduledJob};
use crate::config::JobSchedulingConfig;
use anyhow::Result;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::RwLock as TokioRwLock;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Service responsible for executing jobs from the queue
pub struct JobQueueRunner {
    job_queue: Arc<JobQueue>,
    job_executor: Arc<JobExecutor>,
    max_concurrent: Arc<AtomicUsize>,
    concurrent_limits: Arc<TokioRwLock<HashMap<JobTypeCategory, usize>>>,
    poll_interval: Duration,
    shutdown_grace: Duration,
}

/// Category of job types for concurrency limiting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobTypeCategory {
    LibrarySync,
    Download,
    /// Heavy pool: conversions run on the blocking thread pool
    Conversion,
    Upload,
    Maintenance,
}

impl From<&JobType> for JobTypeCategory {
    fn from(job_type: &JobType) -> Self {
        match job_type {
            JobType::LibrarySync(_) => JobTypeCategory::LibrarySync,
            JobType::VolumeDownload { .. } => JobTypeCategory::Download,
            JobType::VolumeConversion { .. } => JobTypeCategory::Conversion,
            JobType::ArtifactUpload(_) => JobTypeCategory::Upload,
            JobType::Maintenance(_) => JobTypeCategory::Maintenance,
        }
    }
}

impl JobQueueRunner {
    /// Create a new job queue runner with configuration
    pub fn new(
        job_queue: Arc<JobQueue>,
        job_executor: Arc<JobExecutor>,
        config: &JobSchedulingConfig,
    ) -> Self {
        let mut concurrent_limits = HashMap::new();

        concurrent_limits.insert(JobTypeCategory::LibrarySync, config.sync_limit);
        concurrent_limits.insert(JobTypeCategory::Download, config.download_limit);
        concurrent_limits.insert(JobTypeCategory::Conversion, config.conversion_limit);
        concurrent_limits.insert(JobTypeCategory::Upload, config.upload_limit);
        concurrent_limits.insert(JobTypeCategory::Maintenance, config.maintenance_limit);

        Self {
            job_queue,
            job_executor,
            max_concurrent: Arc::new(AtomicUsize::new(config.global_max_jobs)),
            concurrent_limits: Arc::new(TokioRwLock::new(concurrent_limits)),
            poll_interval: config.poll_interval,
            shutdown_grace: config.shutdown_grace,
        }
    }

    /// Run the job queue runner service
    pub async fn run(&self, cancellation_token: CancellationToken) -> Result<()> {
        info!(
            "Starting job queue runner service (max concurrent: {})",
            self.max_concurrent.load(Ordering::Relaxed)
        );
        // The poll picks up jobs scheduled for a later time; wake-ups cover the rest
        let mut execution_check = interval(self.poll_interval);
        execution_check.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancellation_token.cancelled() => {
                    info!("Job queue runner received cancellation signal");
                    self.wait_for_running_jobs_to_complete().await;
                    break;
                }
                _ = execution_check.tick() => {
                    if let Err(e) = self.process_pending_jobs().await {
                        error!("Error processing pending jobs: {}", e);
                    }
                }
                _ = self.job_queue.work_available() => {
                    if let Err(e) = self.process_pending_jobs().await {
                        error!("Error processing pending jobs: {}", e);
                    }
                }
            }
        }

        info!("Job queue runner service stopped");
        Ok(())
    }

    /// Process jobs that are ready to run
    async fn process_pending_jobs(&self) -> Result<()> {
        let now = Utc::now();
        let current_running = self.job_queue.running_count().await;

        let max_concurrent = self.max_concurrent.load(Ordering::Relaxed);

        if current_running >= max_concurrent {
            debug!("At maximum concurrent jobs ({}), waiting", max_concurrent);
            return Ok(());
        }

        let available_slots = max_concurrent - current_running;

        let running_job_keys = self.job_queue.get_running_job_keys().await;
        let type_counts = Self::count_jobs_by_type(&running_job_keys);

        let concurrent_limits = self.concurrent_limits.read().await;
        let jobs_to_execute = self
            .job_queue
            .get_executable_jobs(now, available_slots, &type_counts, &concurrent_limits)
            .await;
        drop(concurrent_limits);

        if jobs_to_execute.is_empty() {
            return Ok(());
        }

        debug!("Found {} jobs ready for execution", jobs_to_execute.len());

        for job in jobs_to_execute {
            self.execute_job_async(job).await;
        }

        Ok(())
    }

    /// Execute a job asynchronously
    async fn execute_job_async(&self, job: ScheduledJob) {
        let job_key = job.job_key();
        let job_id = job.id;

        self.job_queue.mark_running(job_id, job_key.clone()).await;

        info!(
            "Starting execution of job: {} (priority: {:?})",
            job_key, job.priority
        );

        let job_queue = self.job_queue.clone();
        let job_executor = self.job_executor.clone();

        tokio::spawn(async move {
            let start_time = std::time::Instant::now();
            // A panicking job body must not leak its job key
            let result = tokio::spawn(async move { job_executor.execute(job).await }).await;
            let duration = start_time.elapsed();

            // Always mark job as completed, regardless of success/failure
            job_queue.mark_completed(job_id).await;

            match result {
                Ok(Ok(())) => {
                    info!("Job {} completed successfully in {:?}", job_key, duration);
                }
                Ok(Err(e)) => {
                    error!("Job {} failed after {:?}: {}", job_key, duration, e);
                }
                Err(e) => {
                    error!("Job {} aborted after {:?}: {}", job_key, duration, e);
                }
            }
        });
    }

    /// Static helper for counting jobs by type - separated for easier testing
    fn count_jobs_by_type(running_job_keys: &[String]) -> HashMap<JobTypeCategory, usize> {
        let mut counts = HashMap::new();

        for job_key in running_job_keys {
            let category = if job_key.starts_with("sync:") {
                JobTypeCategory::LibrarySync
            } else if job_key.starts_with("download:") {
                JobTypeCategory::Download
            } else if job_key.starts_with("conversion:") {
                JobTypeCategory::Conversion
            } else if job_key.starts_with("upload:") {
                JobTypeCategory::Upload
            } else if job_key.starts_with("maintenance:") {
                JobTypeCategory::Maintenance
            } else {
                continue;
            };

            *counts.entry(category).or_insert(0) += 1;
        }

        counts
    }

    /// Wait for all running jobs to complete during shutdown
    async fn wait_for_running_jobs_to_complete(&self) {
        info!("Waiting for running jobs to complete...");

        self.dump_job_status().await;

        let mut check_interval = interval(Duration::from_millis(500));
        let start_time = std::time::Instant::now();

        loop {
            let running_count = self.job_queue.running_count().await;

            if running_count == 0 {
                info!("All jobs completed successfully");
                break;
            }

            if start_time.elapsed() > self.shutdown_grace {
                warn!(
                    "Timeout waiting for {} jobs to complete, proceeding with shutdown",
                    running_count
                );
                self.dump_job_status().await;
                break;
            }

            debug!("Still waiting for {} jobs to complete...", running_count);
            check_interval.tick().await;
        }
    }

    /// Dump current job status for debugging
    async fn dump_job_status(&self) {
        let stats = self.get_execution_stats().await;
        let running_keys = self.job_queue.get_running_job_keys().await;

        info!("=== JOB STATUS DUMP ===");
        info!(
            "Queue Stats - Pending: {}, Running: {}, Max Concurrent: {}",
            stats.total_pending, stats.total_running, stats.max_concurrent
        );
        info!("Running jobs by type: {:?}", stats.running_by_type);

        if !running_keys.is_empty() {
            info!("Currently running jobs:");
            for job_key in &running_keys {
                info!("  - {}", job_key);
            }
        }

        info!("=== END JOB STATUS DUMP ===");
    }

    /// Get current execution statistics
    pub async fn get_execution_stats(&self) -> ExecutionStats {
        let queue_stats = self.job_queue.stats().await;
        let running_job_keys = self.job_queue.get_running_job_keys().await;

        ExecutionStats {
            total_pending: queue_stats.pending_jobs,
            total_running: queue_stats.running_jobs,
            max_concurrent: self.max_concurrent.load(Ordering::Relaxed),
            running_by_type: Self::count_jobs_by_type(&running_job_keys),
        }
    }

    /// Update the global maximum concurrent jobs limit at runtime
    pub fn update_global_limit(&self, new_limit: usize) {
        let old_limit = self.max_concurrent.swap(new_limit, Ordering::Relaxed);
        info!(
            "Updated global concurrent jobs limit from {} to {}",
            old_limit, new_limit
        );
    }

    /// Update a specific job type concurrency limit at runtime
    pub async fn update_type_limit(&self, job_type: JobTypeCategory, new_limit: usize) {
        let mut limits = self.concurrent_limits.write().await;
        let old_limit = limits.insert(job_type, new_limit);

        match old_limit {
            Some(old) => info!(
                "Updated {:?} job limit from {} to {}",
                job_type, old, new_limit
            ),
            None => info!("Set {:?} job limit to {}", job_type, new_limit),
        }
    }
}

/// Statistics about job execution
#[derive(Debug, Clone)]
pub struct ExecutionStats {
    pub total_pending: usize,
    pub total_running: usize,
    pub max_concurrent: usize,
    pub running_by_type: HashMap<JobTypeCategory, usize>,
}
