//! Library domain models: users, series, volumes and uploaded artifacts

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use strum::{Display, EnumIter, EnumString};

/// Output format a user receives converted volumes in
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Display, EnumString,
    EnumIter,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum FileFormat {
    /// Zip archive of the page images
    Jpg,
    #[default]
    Pdf,
    Epub,
}

impl FileFormat {
    /// File extension of the produced artifact
    pub fn extension(&self) -> &'static str {
        match self {
            FileFormat::Jpg => "zip",
            FileFormat::Pdf => "pdf",
            FileFormat::Epub => "epub",
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            FileFormat::Jpg => "application/zip",
            FileFormat::Pdf => "application/pdf",
            FileFormat::Epub => "application/epub+zip",
        }
    }
}

/// Language used for every message sent to a user
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Language {
    #[default]
    En,
    Ja,
}

/// Bot user and their storefront account state
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Chat identifier
    pub id: i64,
    pub language: Language,
    pub email: Option<String>,
    pub password: Option<String>,
    pub save_credentials: bool,
    pub file_format: FileFormat,
    pub cache_expire_date: Option<DateTime<Utc>>,
    pub now_caching: bool,
    pub cache_built: bool,
    pub login_error: bool,
}

impl User {
    /// Users with stored credentials who opted into automatic library sync
    pub fn is_auto_sync_eligible(&self) -> bool {
        self.save_credentials && self.password.is_some() && self.email.is_some()
    }

    /// A cache that was never built counts as expired
    pub fn cache_expired(&self, now: DateTime<Utc>) -> bool {
        self.cache_expire_date.is_none_or(|expires| expires <= now)
    }

    /// Password kept on file, only when the user allowed storing it
    pub fn stored_password(&self) -> Option<&str> {
        if self.save_credentials {
            self.password.as_deref()
        } else {
            None
        }
    }
}

impl fmt::Debug for User {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("User")
            .field("id", &self.id)
            .field("language", &self.language)
            .field("email", &self.email)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("save_credentials", &self.save_credentials)
            .field("file_format", &self.file_format)
            .field("cache_expire_date", &self.cache_expire_date)
            .field("now_caching", &self.now_caching)
            .field("cache_built", &self.cache_built)
            .field("login_error", &self.login_error)
            .finish()
    }
}

/// Partial update of user fields; `None` leaves the column untouched
#[derive(Debug, Clone, Default)]
pub struct UserUpdate {
    pub language: Option<Language>,
    pub email: Option<Option<String>>,
    pub password: Option<Option<String>>,
    pub save_credentials: Option<bool>,
    pub file_format: Option<FileFormat>,
    pub cache_expire_date: Option<Option<DateTime<Utc>>>,
    pub now_caching: Option<bool>,
    pub cache_built: Option<bool>,
    pub login_error: Option<bool>,
}

impl UserUpdate {
    pub fn now_caching(value: bool) -> Self {
        Self {
            now_caching: Some(value),
            ..Default::default()
        }
    }

    pub fn login_error(value: bool) -> Self {
        Self {
            login_error: Some(value),
            ..Default::default()
        }
    }

    /// Fields written after a successful library sync
    pub fn sync_succeeded(expires: DateTime<Utc>) -> Self {
        Self {
            cache_expire_date: Some(Some(expires)),
            cache_built: Some(true),
            login_error: Some(false),
            ..Default::default()
        }
    }

    /// Account details saved by the configuration wizard
    pub fn credentials(email: String, password: Option<String>, save_credentials: bool) -> Self {
        Self {
            email: Some(Some(email)),
            password: Some(password),
            save_credentials: Some(save_credentials),
            ..Default::default()
        }
    }
}

/// Named ordered collection of volumes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Series {
    pub id: i32,
    pub title: String,
    pub url: String,
    pub thumbnail_url: Option<String>,
    pub thumbnail_local: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewSeries {
    pub title: String,
    pub url: String,
    pub thumbnail_url: Option<String>,
}

/// Single purchased book or issue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    pub id: i32,
    pub title: String,
    pub url: String,
    pub thumbnail_url: Option<String>,
    pub thumbnail_local: Option<String>,
    pub description: Option<String>,
    pub pages: u32,
    pub series_id: Option<i32>,
    pub now_downloading: bool,
}

#[derive(Debug, Clone)]
pub struct NewVolume {
    pub title: String,
    pub url: String,
    pub thumbnail_url: Option<String>,
    pub description: Option<String>,
    pub pages: u32,
    pub series_id: Option<i32>,
}

/// Oversized artifact placed on the blob store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadedArtifact {
    pub id: i32,
    pub user_id: i64,
    pub volume_id: i32,
    pub format: FileFormat,
    pub url: String,
    pub delete_token: Option<String>,
    pub uploaded_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewUploadedArtifact {
    pub user_id: i64,
    pub volume_id: i32,
    pub format: FileFormat,
    pub url: String,
    pub delete_token: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::str::FromStr;

    fn user() -> User {
        User {
            id: 1,
            language: Language::En,
            email: Some("reader@example.com".into()),
            password: Some("secret".into()),
            save_credentials: true,
            file_format: FileFormat::Pdf,
            cache_expire_date: None,
            now_caching: false,
            cache_built: false,
            login_error: false,
        }
    }

    #[rstest]
    #[case(FileFormat::Jpg, "zip")]
    #[case(FileFormat::Pdf, "pdf")]
    #[case(FileFormat::Epub, "epub")]
    fn extensions(#[case] format: FileFormat, #[case] ext: &str) {
        assert_eq!(format.extension(), ext);
    }

    #[test]
    fn format_parses_case_insensitively() {
        assert_eq!(FileFormat::from_str("EPUB").unwrap(), FileFormat::Epub);
        assert_eq!(FileFormat::Jpg.to_string(), "jpg");
        assert!(FileFormat::from_str("mobi").is_err());
    }

    #[test]
    fn eligibility_requires_all_credentials() {
        assert!(user().is_auto_sync_eligible());

        let mut no_save = user();
        no_save.save_credentials = false;
        assert!(!no_save.is_auto_sync_eligible());
        assert_eq!(no_save.stored_password(), None);

        let mut no_email = user();
        no_email.email = None;
        assert!(!no_email.is_auto_sync_eligible());
    }

    #[test]
    fn cache_expiry() {
        let now = Utc::now();
        let mut u = user();
        assert!(u.cache_expired(now));

        u.cache_expire_date = Some(now + chrono::Duration::hours(1));
        assert!(!u.cache_expired(now));

        u.cache_expire_date = Some(now);
        assert!(u.cache_expired(now));
    }

    #[test]
    fn debug_redacts_password() {
        let rendered = format!("{:?}", user());
        assert!(!rendered.contains("secret"));
        assert!(rendered.contains("<redacted>"));
    }
}
