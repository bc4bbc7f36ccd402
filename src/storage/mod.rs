//! On-disk library layout
//!
//! Page images live at `<root>/<series>-<seriesId>/<title>-<volumeId>/<page>.jpg`
//! (the series segment is omitted for standalone volumes). Converted artifacts,
//! the volume thumbnail and an optional `toc.txt` sit next to the pages.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::models::{FileFormat, Series, Volume};

/// File name used for series and volume cover images
pub const THUMBNAIL_FILE: &str = "thumbnail.jpg";

/// Table of contents, one `<title>\t<page>` entry per line
pub const TOC_FILE: &str = "toc.txt";

const PROGRESS_CELLS: u32 = 15;

#[derive(Debug, Clone)]
pub struct LibraryLayout {
    root: PathBuf,
}

impl LibraryLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn series_dir(&self, series: &Series) -> PathBuf {
        self.root
            .join(format!("{}-{}", sanitize_segment(&series.title), series.id))
    }

    pub fn volume_dir(&self, volume: &Volume, series: Option<&Series>) -> PathBuf {
        let base = match series {
            Some(series) => self.series_dir(series),
            None => self.root.clone(),
        };
        base.join(format!("{}-{}", sanitize_segment(&volume.title), volume.id))
    }

    pub fn page_path(dir: &Path, page: u32) -> PathBuf {
        dir.join(format!("{page}.jpg"))
    }

    pub fn thumbnail_path(dir: &Path) -> PathBuf {
        dir.join(THUMBNAIL_FILE)
    }

    pub fn toc_path(dir: &Path) -> PathBuf {
        dir.join(TOC_FILE)
    }

    pub fn artifact_path(dir: &Path, title: &str, format: FileFormat) -> PathBuf {
        dir.join(format!("{}.{}", sanitize_segment(title), format.extension()))
    }
}

/// Replace characters that would split or truncate a path segment
pub fn sanitize_segment(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | '\0' => '_',
            other => other,
        })
        .collect()
}

/// Page numbers already stored in `dir`, ascending. A missing directory has no pages.
pub async fn present_pages(dir: &Path) -> std::io::Result<Vec<u32>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut pages = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if name == THUMBNAIL_FILE {
            continue;
        }
        if let Some(page) = name
            .strip_suffix(".jpg")
            .and_then(|stem| stem.parse::<u32>().ok())
        {
            pages.push(page);
        }
    }

    pages.sort_unstable();
    Ok(pages)
}

/// Sorted complement of `present` within `[start, end]`
pub fn book_missing_pages(start: u32, end: u32, present: &[u32]) -> Vec<u32> {
    let present: HashSet<u32> = present.iter().copied().collect();
    (start..=end).filter(|page| !present.contains(page)).collect()
}

/// Text progress bar, e.g. `[=======　　　　　　　　] 50%`
pub fn progress_bar(current: u32, total: u32) -> String {
    let ratio = if total == 0 {
        1.0
    } else {
        (f64::from(current) / f64::from(total)).clamp(0.0, 1.0)
    };
    let filled = (f64::from(PROGRESS_CELLS) * ratio) as usize;
    let empty = PROGRESS_CELLS as usize - filled;

    format!(
        "[{}{}] {}%",
        "=".repeat(filled),
        "\u{3000}".repeat(empty),
        (ratio * 100.0) as u32
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn series() -> Series {
        Series {
            id: 4,
            title: "Saga".into(),
            url: "https://example.com/s/4".into(),
            thumbnail_url: None,
            thumbnail_local: None,
        }
    }

    fn volume(series_id: Option<i32>) -> Volume {
        Volume {
            id: 12,
            title: "Saga 1/2".into(),
            url: "https://example.com/v/12".into(),
            thumbnail_url: None,
            thumbnail_local: None,
            description: None,
            pages: 5,
            series_id,
            now_downloading: false,
        }
    }

    #[test]
    fn volume_dir_nests_under_series() {
        let layout = LibraryLayout::new("/books");
        let series = series();

        assert_eq!(
            layout.volume_dir(&volume(Some(4)), Some(&series)),
            PathBuf::from("/books/Saga-4/Saga 1_2-12")
        );
        assert_eq!(
            layout.volume_dir(&volume(None), None),
            PathBuf::from("/books/Saga 1_2-12")
        );
    }

    #[test]
    fn artifact_uses_format_extension() {
        let dir = Path::new("/books/v-1");
        assert_eq!(
            LibraryLayout::artifact_path(dir, "Title", FileFormat::Jpg),
            PathBuf::from("/books/v-1/Title.zip")
        );
        assert_eq!(
            LibraryLayout::page_path(dir, 7),
            PathBuf::from("/books/v-1/7.jpg")
        );
    }

    #[rstest]
    #[case(1, 5, vec![1, 3, 5], vec![2, 4])]
    #[case(1, 3, vec![], vec![1, 2, 3])]
    #[case(1, 3, vec![3, 2, 1], vec![])]
    #[case(1, 0, vec![], vec![])]
    #[case(2, 4, vec![1, 9], vec![2, 3, 4])]
    fn missing_pages(
        #[case] start: u32,
        #[case] end: u32,
        #[case] present: Vec<u32>,
        #[case] expected: Vec<u32>,
    ) {
        assert_eq!(book_missing_pages(start, end, &present), expected);
    }

    #[tokio::test]
    async fn present_pages_ignores_thumbnail_and_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["1.jpg", "3.jpg", "10.jpg", "thumbnail.jpg", "Title.pdf"] {
            tokio::fs::write(dir.path().join(name), b"x").await.unwrap();
        }

        assert_eq!(present_pages(dir.path()).await.unwrap(), vec![1, 3, 10]);
        assert!(
            present_pages(&dir.path().join("missing"))
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[test]
    fn progress_bar_bounds() {
        assert_eq!(progress_bar(0, 10), format!("[{}] 0%", "\u{3000}".repeat(15)));
        assert_eq!(progress_bar(10, 10), format!("[{}] 100%", "=".repeat(15)));
        assert!(progress_bar(5, 10).ends_with(" 50%"));
    }

    #[test]
    fn progress_is_monotonic() {
        let percent = |bar: String| -> u32 {
            bar.rsplit(' ')
                .next()
                .and_then(|p| p.trim_end_matches('%').parse().ok())
                .unwrap()
        };
        let mut last = 0;
        for page in 0..=37 {
            let current = percent(progress_bar(page, 37));
            assert!(current >= last);
            last = current;
        }
        assert_eq!(last, 100);
    }
}
