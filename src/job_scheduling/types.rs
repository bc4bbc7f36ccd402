//! Job scheduling type definitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use uuid::Uuid;

use crate::models::FileFormat;

/// Priority levels for job execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobPriority {
    /// Startup reconciliation of expired caches
    Critical = 0,
    /// User-facing requests: manual syncs, downloads, conversions
    High = 1,
    /// Recurring anchored syncs
    Normal = 2,
    /// Follow-up work such as oversized artifact uploads
    Low = 3,
    /// Background maintenance tasks
    Maintenance = 4,
}

impl PartialOrd for JobPriority {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for JobPriority {
    fn cmp(&self, other: &Self) -> Ordering {
        (*self as u8).cmp(&(*other as u8))
    }
}

/// Why a library sync was started
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncOrigin {
    /// Fired by the recurring anchor schedule or startup reconciliation
    Scheduled,
    /// Triggered by the user or right after credentials were saved
    Manual,
}

impl fmt::Display for SyncOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncOrigin::Scheduled => write!(f, "scheduled"),
            SyncOrigin::Manual => write!(f, "manual"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SyncRequest {
    pub user_id: i64,
    pub origin: SyncOrigin,
    /// Skip login endpoint discovery
    pub fast_login: bool,
    /// Distinguishes successive manual runs for one user; always 0 for scheduled runs
    pub generation: u64,
}

/// Type of job to be executed
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobType {
    /// Reconcile a user's purchases into the library store
    LibrarySync(SyncRequest),
    /// Fetch the missing pages of a volume for its current subscribers.
    /// `generation` identifies the subscription registry entry that triggered it.
    VolumeDownload { volume_id: i32, generation: u64 },
    /// Build one artifact format of a volume for its current subscribers
    VolumeConversion {
        volume_id: i32,
        format: FileFormat,
        generation: u64,
        skip_start_notice: bool,
    },
    /// Upload an oversized artifact and send its link
    ArtifactUpload(Uuid),
    /// Maintenance job with operation name
    Maintenance(String),
}

impl JobType {
    /// Generate a unique key for deduplication
    /// Jobs with the same key will be deduplicated
    pub fn job_key(&self) -> String {
        match self {
            JobType::LibrarySync(request) => match request.origin {
                SyncOrigin::Scheduled => format!("sync:{}:scheduled", request.user_id),
                SyncOrigin::Manual => {
                    format!("sync:{}:manual:{}", request.user_id, request.generation)
                }
            },
            JobType::VolumeDownload {
                volume_id,
                generation,
            } => format!("download:{volume_id}:{generation}"),
            JobType::VolumeConversion {
                volume_id,
                format,
                generation,
                ..
            } => format!("conversion:{volume_id}:{format}:{generation}"),
            JobType::ArtifactUpload(upload_id) => format!("upload:{upload_id}"),
            JobType::Maintenance(operation) => format!("maintenance:{operation}"),
        }
    }
}

/// A scheduled job ready for execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledJob {
    /// Unique job instance identifier
    pub id: Uuid,
    /// Type of job to execute
    pub job_type: JobType,
    /// When this job should be executed
    pub scheduled_time: DateTime<Utc>,
    /// Priority level for execution ordering
    pub priority: JobPriority,
}

impl ScheduledJob {
    /// Create a new scheduled job
    pub fn new(job_type: JobType, priority: JobPriority) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_type,
            scheduled_time: Utc::now(),
            priority,
        }
    }

    /// Create a new scheduled job with specific time
    pub fn new_scheduled(
        job_type: JobType,
        priority: JobPriority,
        scheduled_time: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_type,
            scheduled_time,
            priority,
        }
    }

    /// Get the deduplication key for this job
    pub fn job_key(&self) -> String {
        self.job_type.job_key()
    }

    /// Check if this job is ready to run
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_time <= now
    }
}

impl PartialEq for ScheduledJob {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ScheduledJob {}

impl PartialOrd for ScheduledJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledJob {
    /// Jobs are ordered by priority first, then by scheduled time
    fn cmp(&self, other: &Self) -> Ordering {
        match self.priority.cmp(&other.priority) {
            Ordering::Equal => self.scheduled_time.cmp(&other.scheduled_time),
            priority_order => priority_order,
        }
    }
}

/// Result of registering a requester with a download or conversion job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOutcome {
    /// First subscriber; a new job was enqueued
    Triggered,
    /// Appended to a job that is already queued or running
    Joined,
    /// The requester was already waiting on this job
    AlreadySubscribed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_job_priority_ordering() {
        assert!(JobPriority::Critical < JobPriority::High);
        assert!(JobPriority::High < JobPriority::Normal);
        assert!(JobPriority::Normal < JobPriority::Low);
        assert!(JobPriority::Low < JobPriority::Maintenance);
    }

    #[test]
    fn test_job_type_key_generation() {
        let upload_id = Uuid::new_v4();
        let sync = JobType::LibrarySync(SyncRequest {
            user_id: 42,
            origin: SyncOrigin::Manual,
            fast_login: true,
            generation: 5,
        });
        let download = JobType::VolumeDownload {
            volume_id: 7,
            generation: 3,
        };
        let conversion = JobType::VolumeConversion {
            volume_id: 7,
            format: FileFormat::Epub,
            generation: 1,
            skip_start_notice: true,
        };

        assert_eq!(sync.job_key(), "sync:42:manual:5");
        assert_eq!(download.job_key(), "download:7:3");
        assert_eq!(conversion.job_key(), "conversion:7:epub:1");
        assert_eq!(
            JobType::ArtifactUpload(upload_id).job_key(),
            format!("upload:{upload_id}")
        );
        assert_eq!(
            JobType::Maintenance("purge_expired_uploads".to_string()).job_key(),
            "maintenance:purge_expired_uploads"
        );
    }

    #[test]
    fn test_scheduled_and_manual_syncs_do_not_collide() {
        let key = |origin| {
            JobType::LibrarySync(SyncRequest {
                user_id: 1,
                origin,
                fast_login: false,
                generation: 0,
            })
            .job_key()
        };
        assert_ne!(key(SyncOrigin::Scheduled), key(SyncOrigin::Manual));
    }

    #[test]
    fn test_scheduled_job_ordering() {
        let now = Utc::now();

        let critical_job = ScheduledJob::new_scheduled(
            JobType::Maintenance("test".to_string()),
            JobPriority::Critical,
            now + Duration::hours(1),
        );
        let normal_job = ScheduledJob::new_scheduled(
            JobType::Maintenance("test2".to_string()),
            JobPriority::Normal,
            now,
        );
        assert!(critical_job < normal_job);

        let earlier_job = ScheduledJob::new_scheduled(
            JobType::Maintenance("earlier".to_string()),
            JobPriority::Normal,
            now,
        );
        let later_job = ScheduledJob::new_scheduled(
            JobType::Maintenance("later".to_string()),
            JobPriority::Normal,
            now + Duration::minutes(10),
        );
        assert!(earlier_job < later_job);
    }

    #[test]
    fn test_job_is_ready() {
        let now = Utc::now();

        let ready_job = ScheduledJob::new_scheduled(
            JobType::Maintenance("ready".to_string()),
            JobPriority::Normal,
            now - Duration::minutes(1),
        );
        let future_job = ScheduledJob::new_scheduled(
            JobType::Maintenance("future".to_string()),
            JobPriority::Normal,
            now + Duration::minutes(1),
        );

        assert!(ready_job.is_ready(now));
        assert!(!future_job.is_ready(now));
    }
}
