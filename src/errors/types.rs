//! Error type definitions for the bookbot engine
//!
//! Each layer owns an error enum; `AppError` aggregates them so job bodies
//! can propagate with `?` and branch on the kind at the job boundary.

use thiserror::Error;

/// Top-level application error type
#[derive(Error, Debug)]
pub enum AppError {
    /// Database-related errors (SeaORM)
    #[error("Database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    /// Repository layer errors
    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),

    /// Remote storefront errors
    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    /// Artifact conversion errors
    #[error("Conversion error: {0}")]
    Conversion(#[from] ConversionError),

    /// Blob store and notifier errors
    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    /// Queue and scheduler lifecycle errors
    #[error("Scheduling error: {0}")]
    Scheduling(#[from] JobSchedulingError),

    /// Resource not found errors
    #[error("Not found: {resource} with id {id}")]
    NotFound { resource: String, id: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Filesystem errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Repository layer specific errors
#[derive(Error, Debug)]
pub enum RepositoryError {
    /// Database errors from SeaORM
    #[error("Database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    /// Record not found
    #[error("Record not found: {table} with {field} = {value}")]
    RecordNotFound {
        table: String,
        field: String,
        value: String,
    },

    /// Stored value could not be mapped onto the domain model
    #[error("Invalid stored value: {field} = {value}")]
    InvalidValue { field: String, value: String },
}

/// Errors raised while talking to the remote storefront
#[derive(Error, Debug)]
pub enum RemoteError {
    /// Bad or stale credentials; never retried automatically
    #[error("Authentication failed for {account}: {message}")]
    Authentication { account: String, message: String },

    /// Transient site failure after the retry budget was spent
    #[error("Fetch failed: {url} - {message}")]
    Fetch { url: String, message: String },

    /// Non-success HTTP status
    #[error("HTTP error: {status} - {url}")]
    Http { status: u16, url: String },

    /// Call exceeded its time budget
    #[error("Timed out after {seconds}s: {operation}")]
    Timeout { operation: String, seconds: u64 },

    /// Markup did not contain what the parser expected
    #[error("Parse error: {context} - {message}")]
    Parse { context: String, message: String },

    /// Transport errors from reqwest
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

/// Errors raised while packaging a page set
#[derive(Error, Debug)]
pub enum ConversionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("PDF error: {0}")]
    Pdf(#[from] lopdf::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    /// Volume directory holds no page images
    #[error("No pages found in {path}")]
    NoPages { path: String },

    /// Conversion task panicked or was cancelled
    #[error("Conversion task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Errors from outbound delivery collaborators
#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("Upload of {file} failed: {message}")]
    Upload { file: String, message: String },

    #[error("Delete of {url} failed: {message}")]
    Delete { url: String, message: String },

    #[error("Notification to {requester} failed: {message}")]
    Notifier { requester: i64, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Errors that can occur in the job scheduling system
#[derive(Error, Debug)]
pub enum JobSchedulingError {
    /// A process-wide scheduler already exists
    #[error("Job scheduler is already initialized")]
    AlreadyInitialized,

    /// Invalid job configuration
    #[error("Invalid job configuration: {reason}")]
    InvalidJob { reason: String },

    /// Invalid anchor time or timezone
    #[error("Invalid schedule: {reason}")]
    InvalidSchedule { reason: String },

    /// Scheduler has been shut down
    #[error("Job scheduler is shut down")]
    ShutDown,
}

impl AppError {
    pub fn not_found(resource: impl Into<String>, id: impl ToString) -> Self {
        Self::NotFound {
            resource: resource.into(),
            id: id.to_string(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// True for failures caused by bad or missing credentials
    pub fn is_authentication(&self) -> bool {
        matches!(self, AppError::Remote(e) if e.is_authentication())
    }
}

impl RemoteError {
    pub fn authentication(account: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Authentication {
            account: account.into(),
            message: message.into(),
        }
    }

    pub fn fetch(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Fetch {
            url: url.into(),
            message: message.into(),
        }
    }

    pub fn parse(context: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Parse {
            context: context.into(),
            message: message.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, limit: std::time::Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            seconds: limit.as_secs(),
        }
    }

    pub fn is_authentication(&self) -> bool {
        matches!(self, RemoteError::Authentication { .. })
    }
}

impl RepositoryError {
    pub fn not_found(table: &str, field: &str, value: impl ToString) -> Self {
        Self::RecordNotFound {
            table: table.to_string(),
            field: field.to_string(),
            value: value.to_string(),
        }
    }

    pub fn invalid_value(field: &str, value: impl ToString) -> Self {
        Self::InvalidValue {
            field: field.to_string(),
            value: value.to_string(),
        }
    }
}

impl DeliveryError {
    pub fn notifier(requester: i64, message: impl Into<String>) -> Self {
        Self::Notifier {
            requester,
            message: message.into(),
        }
    }
}
