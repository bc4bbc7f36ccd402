/// Configuration default values
///
/// This module contains all the default values for configuration options,
/// making them easily changeable in one central location.
// Database defaults
pub const DEFAULT_DATABASE_URL: &str = "sqlite://./data/dmm-bookbot.db";
pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;

// Storage defaults
pub const DEFAULT_DOWNLOAD_ROOT: &str = "./books/images";

// Library sync defaults
pub const DEFAULT_ANCHOR_TIME: &str = "03:00";
pub const DEFAULT_TIMEZONE: &str = "Asia/Tokyo";
pub const DEFAULT_RECONCILE_ON_STARTUP: bool = true;

// Job runner defaults
pub const DEFAULT_GLOBAL_MAX_JOBS: usize = 20;
pub const DEFAULT_SYNC_LIMIT: usize = 10;
pub const DEFAULT_DOWNLOAD_LIMIT: usize = 10;
// Conversions are the heavy pool
pub const DEFAULT_CONVERSION_LIMIT: usize = 5;
pub const DEFAULT_UPLOAD_LIMIT: usize = 5;
pub const DEFAULT_MAINTENANCE_LIMIT: usize = 1;
pub const DEFAULT_POLL_INTERVAL: &str = "1s";
pub const DEFAULT_SHUTDOWN_GRACE: &str = "30s";

// Remote library defaults
pub const DEFAULT_STORE_URL: &str = "https://book.dmm.com";
pub const DEFAULT_LIBRARY_URL: &str = "https://book.dmm.com/library/";
pub const DEFAULT_LOGIN_URL: &str =
    "https://www.dmm.com/my/-/login/=/path=DRVESRUMTh1aCl5THVILWk8GWVsf/channel=book";
pub const DEFAULT_LOGIN_REDIRECT_MARKER: &str = "/my/-/redirect/=/rurl=";
pub const DEFAULT_REQUEST_TIMEOUT: &str = "30s";
pub const DEFAULT_LOGIN_TIMEOUT: &str = "60s";
pub const DEFAULT_MAX_LISTING_ATTEMPTS: u32 = 5;
pub const DEFAULT_PAGE_RETRY_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_BACKOFF: &str = "2s";
pub const DEFAULT_USER_AGENT: &str = "dmm-bookbot/0.1";

// Delivery defaults
pub const DEFAULT_MAX_UPLOAD_SIZE: u64 = 50 * 1024 * 1024; // 50MB
pub const DEFAULT_BLOB_UPLOAD_URL: &str = "https://uguu.se/upload";
pub const DEFAULT_BLOB_UPLOAD_RETRIES: u32 = 3;
pub const DEFAULT_UPLOAD_RETENTION: &str = "24h";
pub const DEFAULT_UPLOAD_PURGE_INTERVAL: &str = "1h";
