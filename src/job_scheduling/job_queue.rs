//! Job queue with deduplication and priority ordering

use super::job_queue_runner::JobTypeCategory;
use super::types::ScheduledJob;
use crate::errors::JobSchedulingError;
use chrono::{DateTime, Utc};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Notify, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Thread-safe job queue with deduplication and priority ordering
#[derive(Debug)]
pub struct JobQueue {
    /// Pending jobs ordered by priority and time (min-heap using Reverse)
    pending: Arc<RwLock<BinaryHeap<Reverse<ScheduledJob>>>>,
    /// Currently running jobs (job_id -> job_key mapping)
    running: Arc<RwLock<HashMap<Uuid, String>>>,
    /// Active job keys for deduplication (both pending and running)
    job_keys: Arc<RwLock<HashSet<String>>>,
    /// Wakes the runner when work is added or a slot frees up
    work_available: Arc<Notify>,
    closed: AtomicBool,
}

impl JobQueue {
    /// Create a new empty job queue
    pub fn new() -> Self {
        Self {
            pending: Arc::new(RwLock::new(BinaryHeap::new())),
            running: Arc::new(RwLock::new(HashMap::new())),
            job_keys: Arc::new(RwLock::new(HashSet::new())),
            work_available: Arc::new(Notify::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Enqueue a job if it doesn't already exist
    /// Returns Ok(true) if job was enqueued, Ok(false) if duplicate was skipped
    pub async fn enqueue(&self, job: ScheduledJob) -> Result<bool, JobSchedulingError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(JobSchedulingError::ShutDown);
        }

        let job_key = job.job_key();
        let mut job_keys = self.job_keys.write().await;

        if job_keys.contains(&job_key) {
            debug!("Skipping duplicate job for key: {}", job_key);
            return Ok(false);
        }

        // Key and heap entry are published under the key lock so a concurrent
        // stats() never sees the key without its job
        job_keys.insert(job_key.clone());
        let mut pending = self.pending.write().await;
        pending.push(Reverse(job.clone()));
        drop(pending);
        drop(job_keys);

        info!(
            "Enqueued job {} (type: {:?}, priority: {:?}, scheduled: {})",
            job_key,
            job.job_type,
            job.priority,
            job.scheduled_time.format("%Y-%m-%d %H:%M:%S UTC")
        );

        self.work_available.notify_one();
        Ok(true)
    }

    /// Get jobs that can be executed considering both time readiness and concurrency limits
    pub async fn get_executable_jobs(
        &self,
        now: DateTime<Utc>,
        available_slots: usize,
        current_type_counts: &HashMap<JobTypeCategory, usize>,
        type_limits: &HashMap<JobTypeCategory, usize>,
    ) -> Vec<ScheduledJob> {
        let mut pending = self.pending.write().await;
        let mut executable_jobs = Vec::new();
        let mut remaining_jobs = BinaryHeap::new();
        let mut local_type_counts = current_type_counts.clone();

        while let Some(Reverse(job)) = pending.pop() {
            if job.is_ready(now) && executable_jobs.len() < available_slots {
                let job_category = JobTypeCategory::from(&job.job_type);
                let current_count = local_type_counts.get(&job_category).unwrap_or(&0);
                let type_limit = type_limits.get(&job_category).unwrap_or(&1);

                if current_count < type_limit {
                    executable_jobs.push(job);
                    *local_type_counts.entry(job_category).or_insert(0) += 1;
                } else {
                    // At concurrency limit for this type, put it back
                    remaining_jobs.push(Reverse(job));
                }
            } else {
                remaining_jobs.push(Reverse(job));
            }
        }

        *pending = remaining_jobs;

        if !executable_jobs.is_empty() {
            debug!(
                "Retrieved {} executable jobs from queue",
                executable_jobs.len()
            );
        }

        executable_jobs
    }

    /// Mark a job as running
    pub async fn mark_running(&self, job_id: Uuid, job_key: String) {
        let mut running = self.running.write().await;
        running.insert(job_id, job_key.clone());

        debug!("Marked job {} as running", job_key);
    }

    /// Mark a job as completed and remove from tracking
    pub async fn mark_completed(&self, job_id: Uuid) {
        let mut running = self.running.write().await;

        if let Some(job_key) = running.remove(&job_id) {
            drop(running);

            let mut job_keys = self.job_keys.write().await;
            job_keys.remove(&job_key);
            drop(job_keys);

            debug!("Job {} completed and removed from tracking", job_key);
            self.work_available.notify_one();
        } else {
            warn!("Attempted to mark unknown job {} as completed", job_id);
        }
    }

    /// Resolves once a job was enqueued or completed since the last call
    pub async fn work_available(&self) {
        self.work_available.notified().await;
    }

    /// Refuse further jobs; already queued jobs are left in place
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Get the number of currently running jobs
    pub async fn running_count(&self) -> usize {
        self.running.read().await.len()
    }

    /// Get the number of pending jobs
    pub async fn pending_count(&self) -> usize {
        self.pending.read().await.len()
    }

    /// Get queue statistics
    pub async fn stats(&self) -> JobQueueStats {
        let job_keys = self.job_keys.read().await;
        let pending = self.pending.read().await;
        let running = self.running.read().await;

        JobQueueStats {
            pending_jobs: pending.len(),
            running_jobs: running.len(),
            total_tracked_keys: job_keys.len(),
        }
    }

    /// True when nothing is pending or running
    pub async fn is_idle(&self) -> bool {
        self.job_keys.read().await.is_empty()
    }

    /// Check if a specific job key is already tracked (pending or running)
    pub async fn contains_job_key(&self, job_key: &str) -> bool {
        self.job_keys.read().await.contains(job_key)
    }

    /// Get all running job keys for debugging
    pub async fn get_running_job_keys(&self) -> Vec<String> {
        self.running.read().await.values().cloned().collect()
    }

    /// Clear all jobs (for testing)
    #[cfg(test)]
    pub async fn clear(&self) {
        let mut job_keys = self.job_keys.write().await;
        let mut pending = self.pending.write().await;
        let mut running = self.running.write().await;

        pending.clear();
        running.clear();
        job_keys.clear();
    }
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Statistics about the job queue state
#[derive(Debug, Clone)]
pub struct JobQueueStats {
    /// Number of jobs waiting to be executed
    pub pending_jobs: usize,
    /// Number of jobs currently being executed
    pub running_jobs: usize,
    /// Total number of tracked job keys (should equal pending + running)
    pub total_tracked_keys: usize,
}
