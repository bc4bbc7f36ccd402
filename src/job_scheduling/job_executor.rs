//! Job executor service for performing the actual work

use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::context::JobContext;
use super::conversion::ConversionCoordinator;
use super::download::DownloadCoordinator;
use super::library_sync::LibrarySyncService;
use super::types::{JobType, ScheduledJob};
use crate::delivery::DeleteOutcome;

/// Maintenance operation removing expired artifact uploads
pub const PURGE_EXPIRED_UPLOADS: &str = "purge_expired_uploads";

/// Service responsible for executing the actual work of jobs
pub struct JobExecutor {
    context: JobContext,
    library_sync: Arc<LibrarySyncService>,
    downloads: Arc<DownloadCoordinator>,
    conversions: Arc<ConversionCoordinator>,
}

impl JobExecutor {
    pub fn new(
        context: JobContext,
        library_sync: Arc<LibrarySyncService>,
        downloads: Arc<DownloadCoordinator>,
        conversions: Arc<ConversionCoordinator>,
    ) -> Self {
        Self {
            context,
            library_sync,
            downloads,
            conversions,
        }
    }

    /// Execute a single job
    pub async fn execute(&self, job: ScheduledJob) -> Result<()> {
        match job.job_type {
            JobType::LibrarySync(request) => {
                info!(
                    "Executing {} library sync for user {}",
                    request.origin, request.user_id
                );
                self.library_sync.execute(request).await?;
                Ok(())
            }

            JobType::VolumeDownload {
                volume_id,
                generation,
            } => Ok(self.downloads.execute(volume_id, generation).await?),

            JobType::VolumeConversion {
                volume_id,
                format,
                generation,
                skip_start_notice,
            } => Ok(self
                .conversions
                .execute(volume_id, format, generation, skip_start_notice)
                .await?),

            JobType::ArtifactUpload(upload_id) => {
                Ok(self.conversions.execute_upload(upload_id).await?)
            }

            JobType::Maintenance(operation) => self.execute_maintenance(&operation).await,
        }
    }

    pub async fn execute_maintenance(&self, operation: &str) -> Result<()> {
        info!("Executing maintenance operation: {}", operation);

        match operation {
            PURGE_EXPIRED_UPLOADS => self.purge_expired_uploads().await.map(|_| ()),
            _ => {
                warn!("Unknown maintenance operation: {}", operation);
                Err(anyhow::anyhow!(
                    "Unknown maintenance operation: {}",
                    operation
                ))
            }
        }
    }

    /// Revoke uploads past the retention window. Returns how many records were removed.
    async fn purge_expired_uploads(&self) -> Result<usize> {
        let retention = chrono::Duration::from_std(self.context.config.delivery.upload_retention)?;
        let cutoff = Utc::now() - retention;
        let expired = self.context.repository.list_uploads_before(cutoff).await?;

        if expired.is_empty() {
            debug!("No uploads older than {}", cutoff);
            return Ok(0);
        }

        let mut purged = 0;
        for upload in expired {
            if let Some(token) = upload.delete_token.as_deref() {
                match self.context.blob_store.delete(&upload.url, token).await {
                    Ok(DeleteOutcome::Deleted) => debug!("Deleted upload {}", upload.url),
                    Ok(DeleteOutcome::AlreadyDeleted) => {
                        debug!("Upload {} was already gone", upload.url)
                    }
                    Err(e) => {
                        // Keep the record so the next run retries
                        warn!("Failed to delete upload {}: {}", upload.url, e);
                        continue;
                    }
                }
            }

            self.context.repository.delete_upload(upload.id).await?;
            purged += 1;
        }

        info!("Purged {} expired uploads", purged);
        Ok(purged)
    }
}
