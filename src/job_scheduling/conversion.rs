//! Per-(volume, format) conversion jobs and oversized artifact uploads

use futures::future::join_all;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::context::JobContext;
use super::job_queue::JobQueue;
use super::types::{JobPriority, JobType, ScheduledJob, SubscribeOutcome};
use crate::errors::{AppError, AppResult, JobSchedulingError};
use crate::i18n::Message;
use crate::models::{FileFormat, NewUploadedArtifact};
use crate::utils::random_name;

/// Length of the randomized name oversized artifacts are uploaded under
const UPLOAD_NAME_LEN: usize = 32;

struct ConversionEntry {
    generation: u64,
    requesters: Vec<i64>,
}

#[derive(Debug, Clone)]
struct PendingUpload {
    volume_id: i32,
    format: FileFormat,
    path: PathBuf,
    requester: i64,
}

pub struct ConversionCoordinator {
    context: JobContext,
    queue: Arc<JobQueue>,
    registry: Mutex<HashMap<(i32, FileFormat), ConversionEntry>>,
    pending_uploads: Mutex<HashMap<Uuid, PendingUpload>>,
    generations: AtomicU64,
}

impl ConversionCoordinator {
    pub fn new(context: JobContext, queue: Arc<JobQueue>) -> Self {
        Self {
            context,
            queue,
            registry: Mutex::new(HashMap::new()),
            pending_uploads: Mutex::new(HashMap::new()),
            generations: AtomicU64::new(0),
        }
    }

    /// Register `requester` for the `format` artifact of `volume_id`.
    ///
    /// `skip_start_notice` is honoured only when this call triggers the job.
    pub async fn subscribe(
        &self,
        volume_id: i32,
        format: FileFormat,
        requester: i64,
        skip_start_notice: bool,
    ) -> Result<SubscribeOutcome, JobSchedulingError> {
        let mut registry = self.registry.lock().await;

        if let Some(entry) = registry.get_mut(&(volume_id, format)) {
            if entry.requesters.contains(&requester) {
                return Ok(SubscribeOutcome::AlreadySubscribed);
            }
            entry.requesters.push(requester);
            info!(
                "Subscribed user {} to {} conversion job of volume {}",
                requester, format, volume_id
            );
            return Ok(SubscribeOutcome::Joined);
        }

        let generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;
        let job = ScheduledJob::new(
            JobType::VolumeConversion {
                volume_id,
                format,
                generation,
                skip_start_notice,
            },
            JobPriority::High,
        );
        self.queue.enqueue(job).await?;
        registry.insert(
            (volume_id, format),
            ConversionEntry {
                generation,
                requesters: vec![requester],
            },
        );

        info!(
            "Subscribed user {} to new {} conversion job of volume {}",
            requester, format, volume_id
        );
        Ok(SubscribeOutcome::Triggered)
    }

    pub async fn subscribers(&self, volume_id: i32, format: FileFormat) -> Vec<i64> {
        self.registry
            .lock()
            .await
            .get(&(volume_id, format))
            .map(|entry| entry.requesters.clone())
            .unwrap_or_default()
    }

    pub async fn is_active(&self, volume_id: i32, format: FileFormat) -> bool {
        self.registry.lock().await.contains_key(&(volume_id, format))
    }

    /// Job body: build the artifact once and deliver it to every subscriber
    pub async fn execute(
        &self,
        volume_id: i32,
        format: FileFormat,
        generation: u64,
        skip_start_notice: bool,
    ) -> AppResult<()> {
        if !self.is_current(volume_id, format, generation).await {
            debug!(
                "{} conversion job {} of volume {} is stale, skipping",
                format, generation, volume_id
            );
            return Ok(());
        }

        info!("Starting {} conversion job of volume {}", format, volume_id);
        let result = self.convert(volume_id, format, skip_start_notice).await;
        let requesters = self.take_requesters(volume_id, format, generation).await;

        match result {
            Ok((path, size)) => {
                self.deliver(volume_id, format, &path, size, requesters)
                    .await
            }
            Err(e) => {
                error!(
                    "{} conversion of volume {} failed: {}",
                    format, volume_id, e
                );
                join_all(
                    requesters
                        .into_iter()
                        .map(|requester| self.context.notify(requester, Message::ConversionError)),
                )
                .await;
                Err(e)
            }
        }
    }

    async fn convert(
        &self,
        volume_id: i32,
        format: FileFormat,
        skip_start_notice: bool,
    ) -> AppResult<(PathBuf, u64)> {
        let volume = self
            .context
            .repository
            .get_volume(volume_id)
            .await?
            .ok_or_else(|| AppError::not_found("volume", volume_id))?;

        if !skip_start_notice {
            for requester in self.subscribers(volume_id, format).await {
                self.context
                    .notify(
                        requester,
                        Message::StartConversion {
                            title: volume.title.clone(),
                            format,
                        },
                    )
                    .await;
            }
        }

        let dir = self.context.volume_dir(&volume).await?;
        let started = Instant::now();
        let path = self.context.converter.convert(format, &dir, &volume).await?;
        let size = tokio::fs::metadata(&path).await?.len();
        debug!(
            "Converted volume {} to {} ({} bytes) in {:?}",
            volume_id,
            format,
            size,
            started.elapsed()
        );
        Ok((path, size))
    }

    /// Send small artifacts directly; queue an upload per requester otherwise
    async fn deliver(
        &self,
        volume_id: i32,
        format: FileFormat,
        path: &Path,
        size: u64,
        requesters: Vec<i64>,
    ) -> AppResult<()> {
        let limit = self.context.config.delivery.max_upload_size;

        if size < limit {
            for requester in requesters {
                self.context
                    .notify(requester, Message::ConversionAndSend)
                    .await;
                info!(
                    "Sending volume {} in {} format to user {}",
                    volume_id, format, requester
                );
                if let Err(e) = self.context.notifier.send_file(requester, path).await {
                    warn!("Failed to send {} to user {}: {}", path.display(), requester, e);
                }
            }
            return Ok(());
        }

        info!(
            "Artifact {} is {} bytes (limit {}), uploading instead",
            path.display(),
            size,
            limit
        );
        for requester in requesters {
            self.context.notify(requester, Message::GenerateUrl).await;

            let upload_id = Uuid::new_v4();
            self.pending_uploads.lock().await.insert(
                upload_id,
                PendingUpload {
                    volume_id,
                    format,
                    path: path.to_path_buf(),
                    requester,
                },
            );
            let job = ScheduledJob::new(JobType::ArtifactUpload(upload_id), JobPriority::Low);
            if let Err(e) = self.queue.enqueue(job).await {
                self.pending_uploads.lock().await.remove(&upload_id);
                error!("Failed to queue upload for user {}: {}", requester, e);
                self.context
                    .notify(requester, Message::ConversionError)
                    .await;
            }
        }

        Ok(())
    }

    /// Job body of an upload: push the artifact to the blob store and send the link
    pub async fn execute_upload(&self, upload_id: Uuid) -> AppResult<()> {
        let Some(upload) = self.pending_uploads.lock().await.remove(&upload_id) else {
            warn!("Upload {} is unknown, skipping", upload_id);
            return Ok(());
        };

        let desired_name = format!(
            "{}.{}",
            random_name(UPLOAD_NAME_LEN),
            upload.format.extension()
        );
        let blob = match self
            .context
            .blob_store
            .upload(&upload.path, &desired_name)
            .await
        {
            Ok(blob) => blob,
            Err(e) => {
                error!(
                    "Upload of {} for user {} failed: {}",
                    upload.path.display(),
                    upload.requester,
                    e
                );
                self.context
                    .notify(upload.requester, Message::ConversionError)
                    .await;
                return Err(e.into());
            }
        };

        if let Err(e) = self
            .context
            .repository
            .record_upload(NewUploadedArtifact {
                user_id: upload.requester,
                volume_id: upload.volume_id,
                format: upload.format,
                url: blob.url.clone(),
                delete_token: blob.delete_token.clone(),
            })
            .await
        {
            warn!("Failed to record upload {}: {}", blob.url, e);
        }

        let language = self.context.language_of(upload.requester).await;
        let text = Message::UrlSend {
            url: blob.url.clone(),
        }
        .render(language);
        if let Err(e) = self
            .context
            .notifier
            .send_url(upload.requester, &text, &blob.url)
            .await
        {
            warn!("Failed to send link to user {}: {}", upload.requester, e);
        }

        info!(
            "Uploaded volume {} in {} format for user {}",
            upload.volume_id, upload.format, upload.requester
        );
        Ok(())
    }

    async fn is_current(&self, volume_id: i32, format: FileFormat, generation: u64) -> bool {
        self.registry
            .lock()
            .await
            .get(&(volume_id, format))
            .is_some_and(|entry| entry.generation == generation)
    }

    async fn take_requesters(
        &self,
        volume_id: i32,
        format: FileFormat,
        generation: u64,
    ) -> Vec<i64> {
        let mut registry = self.registry.lock().await;
        match registry.get(&(volume_id, format)) {
            Some(entry) if entry.generation == generation => registry
                .remove(&(volume_id, format))
                .map(|entry| entry.requesters)
                .unwrap_or_default(),
            _ => Vec::new(),
        }
    }
}
