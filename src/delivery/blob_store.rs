//! Temporary cloud storage for artifacts too large for the chat transport

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::path::Path;
use strum::IntoEnumIterator;
use tracing::{debug, info, warn};

use crate::config::DeliveryConfig;
use crate::errors::{DeliveryError, DeliveryResult};
use crate::models::FileFormat;
use crate::utils::jitter::retry_delay;

/// Multipart field the upload endpoint reads files from
const UPLOAD_FIELD: &str = "files[]";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedBlob {
    pub url: String,
    /// Token needed to revoke the upload, when the store issues one
    pub delete_token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    AlreadyDeleted,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn upload(&self, path: &Path, desired_name: &str) -> DeliveryResult<UploadedBlob>;

    async fn delete(&self, url: &str, delete_token: &str) -> DeliveryResult<DeleteOutcome>;
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    #[serde(default)]
    files: Vec<UploadedFile>,
}

#[derive(Debug, Deserialize)]
struct UploadedFile {
    url: String,
    #[serde(default, alias = "deletion_token", alias = "delete_token")]
    token: Option<String>,
}

/// Multipart upload client for uguu-style file hosts
pub struct HttpBlobStore {
    client: Client,
    config: DeliveryConfig,
}

impl HttpBlobStore {
    pub fn new(config: &DeliveryConfig) -> DeliveryResult<Self> {
        Ok(Self {
            client: Client::builder().build()?,
            config: config.clone(),
        })
    }

    async fn post_upload(&self, data: Vec<u8>, name: &str) -> Result<reqwest::Response, reqwest::Error> {
        let part = Part::bytes(data)
            .file_name(name.to_string())
            .mime_str(mime_for(name))?;
        let form = Form::new().part(UPLOAD_FIELD, part);

        self.client
            .post(&self.config.blob_upload_url)
            .multipart(form)
            .send()
            .await
    }
}

#[async_trait]
impl BlobStore for HttpBlobStore {
    async fn upload(&self, path: &Path, desired_name: &str) -> DeliveryResult<UploadedBlob> {
        let data = tokio::fs::read(path).await?;
        let attempts = self.config.blob_upload_retries.max(1);
        let upload_error = |message: String| DeliveryError::Upload {
            file: desired_name.to_string(),
            message,
        };

        for attempt in 1..=attempts {
            info!(
                "Uploading {} ({} bytes), attempt {} out of {}",
                desired_name,
                data.len(),
                attempt,
                attempts
            );

            let response = match self.post_upload(data.clone(), desired_name).await {
                Ok(response) => response,
                Err(e) if (e.is_connect() || e.is_timeout()) && attempt < attempts => {
                    warn!("Upload of {} failed: {}, retrying", desired_name, e);
                    tokio::time::sleep(retry_delay(std::time::Duration::from_secs(1), attempt))
                        .await;
                    continue;
                }
                Err(e) => return Err(upload_error(e.to_string())),
            };

            let status = response.status();
            let body = response.text().await?;
            if !status.is_success() {
                return Err(upload_error(format!("status {status}")));
            }

            return parse_upload_response(&body)
                .ok_or_else(|| upload_error(format!("unexpected response '{}'", body.trim())));
        }

        Err(upload_error("retries exhausted".to_string()))
    }

    async fn delete(&self, url: &str, delete_token: &str) -> DeliveryResult<DeleteOutcome> {
        let Some(delete_url) = &self.config.blob_delete_url else {
            debug!("Blob store has no delete endpoint, {} expires on its own", url);
            return Ok(DeleteOutcome::AlreadyDeleted);
        };

        let response = self
            .client
            .post(delete_url)
            .form(&[("url", url), ("token", delete_token)])
            .send()
            .await?;

        match response.status() {
            status if status.is_success() => Ok(DeleteOutcome::Deleted),
            StatusCode::NOT_FOUND | StatusCode::GONE => Ok(DeleteOutcome::AlreadyDeleted),
            status => Err(DeliveryError::Delete {
                url: url.to_string(),
                message: format!("status {status}"),
            }),
        }
    }
}

/// Accepts the JSON file listing or a bare URL body
fn parse_upload_response(body: &str) -> Option<UploadedBlob> {
    if let Ok(response) = serde_json::from_str::<UploadResponse>(body) {
        return response.files.into_iter().next().map(|file| UploadedBlob {
            url: file.url,
            delete_token: file.token,
        });
    }

    let trimmed = body.trim();
    url::Url::parse(trimmed).ok().map(|_| UploadedBlob {
        url: trimmed.to_string(),
        delete_token: None,
    })
}

fn mime_for(name: &str) -> &'static str {
    let extension = name.rsplit_once('.').map(|(_, ext)| ext).unwrap_or_default();
    FileFormat::iter()
        .find(|format| format.extension().eq_ignore_ascii_case(extension))
        .map(|format| format.mime_type())
        .unwrap_or("application/octet-stream")
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn parses_json_listing() {
        let body = r#"{"success":true,"files":[{"hash":"x","name":"AB.pdf","url":"https://a.example/AB.pdf","size":10,"deletion_token":"tok"}]}"#;
        assert_eq!(
            parse_upload_response(body),
            Some(UploadedBlob {
                url: "https://a.example/AB.pdf".into(),
                delete_token: Some("tok".into()),
            })
        );
    }

    #[test]
    fn parses_plain_url() {
        assert_eq!(
            parse_upload_response("https://a.example/AB.epub\n"),
            Some(UploadedBlob {
                url: "https://a.example/AB.epub".into(),
                delete_token: None,
            })
        );
        assert_eq!(parse_upload_response("error"), None);
        assert_eq!(parse_upload_response(r#"{"files":[]}"#), None);
    }

    #[rstest]
    #[case("A.pdf", "application/pdf")]
    #[case("A.EPUB", "application/epub+zip")]
    #[case("A.zip", "application/zip")]
    #[case("A.bin", "application/octet-stream")]
    fn mime_types(#[case] name: &str, #[case] mime: &str) {
        assert_eq!(mime_for(name), mime);
    }

    #[tokio::test]
    async fn delete_without_endpoint_counts_as_deleted() {
        let store = HttpBlobStore::new(&DeliveryConfig::default()).unwrap();
        assert_eq!(
            store.delete("https://a.example/AB.pdf", "tok").await.unwrap(),
            DeleteOutcome::AlreadyDeleted
        );
    }
}
