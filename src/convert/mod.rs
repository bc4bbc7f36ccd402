//! Packaging of stored page images into deliverable artifacts
//!
//! Page images are embedded as-is; nothing is re-encoded.

mod archive;
mod epub;
mod pdf;

use async_trait::async_trait;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::info;

use crate::errors::{ConversionError, ConversionResult};
use crate::models::{FileFormat, Volume};
use crate::storage::{LibraryLayout, present_pages};

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ArtifactConverter: Send + Sync {
    /// Build the artifact for `format` from the pages in `page_dir` and return its path
    async fn convert(
        &self,
        format: FileFormat,
        page_dir: &Path,
        volume: &Volume,
    ) -> ConversionResult<PathBuf>;
}

/// Converter writing artifacts next to the page images
#[derive(Debug, Clone, Default)]
pub struct LocalArtifactConverter;

impl LocalArtifactConverter {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ArtifactConverter for LocalArtifactConverter {
    async fn convert(
        &self,
        format: FileFormat,
        page_dir: &Path,
        volume: &Volume,
    ) -> ConversionResult<PathBuf> {
        let pages: Vec<PathBuf> = present_pages(page_dir)
            .await?
            .into_iter()
            .map(|page| LibraryLayout::page_path(page_dir, page))
            .collect();
        if pages.is_empty() {
            return Err(ConversionError::NoPages {
                path: page_dir.display().to_string(),
            });
        }

        info!(
            "Creating {} from {} pages of volume {}",
            format,
            pages.len(),
            volume.id
        );
        let started = Instant::now();
        let output = LibraryLayout::artifact_path(page_dir, &volume.title, format);
        let target = output.clone();
        let title = volume.title.clone();
        let dir = page_dir.to_path_buf();

        tokio::task::spawn_blocking(move || {
            write_atomically(&target, |file| match format {
                FileFormat::Jpg => archive::write_image_archive(&pages, file),
                FileFormat::Pdf => {
                    let outline = pdf::read_outline(&dir)?;
                    pdf::write_pdf(&pages, &title, &outline, file)
                }
                FileFormat::Epub => epub::write_epub(&pages, &title, file),
            })
        })
        .await??;

        info!(
            "Created {} in {:?}",
            output.display(),
            started.elapsed()
        );
        Ok(output)
    }
}

/// Write through a temporary file so a failed conversion never leaves a partial artifact
fn write_atomically<F>(target: &Path, write: F) -> ConversionResult<()>
where
    F: FnOnce(&mut File) -> ConversionResult<()>,
{
    let dir = target.parent().unwrap_or_else(|| Path::new("."));
    let mut temp = tempfile::NamedTempFile::new_in(dir)?;
    write(temp.as_file_mut())?;
    temp.as_file_mut().flush()?;
    temp.persist(target).map_err(|e| e.error)?;
    Ok(())
}
