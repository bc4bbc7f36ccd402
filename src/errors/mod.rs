//! Centralized error handling for the bookbot engine
//!
//! # Error Categories
//!
//! - **Repository Errors**: persistence failures (logged, sync continues)
//! - **Remote Errors**: authentication vs transient fetch failures
//! - **Conversion Errors**: artifact packaging failures
//! - **Delivery Errors**: blob store and notifier failures
//! - **Scheduling Errors**: queue and singleton lifecycle
//!
//! # Usage
//!
//! ```rust
//! use dmm_bookbot::errors::{AppError, AppResult};
//!
//! async fn example_function() -> AppResult<String> {
//!     Ok("success".to_string())
//! }
//! ```

pub mod types;

pub use types::*;

/// Convenience type alias for Results using AppError
pub type AppResult<T> = Result<T, AppError>;

/// Convenience type alias for Repository Results
pub type RepositoryResult<T> = Result<T, RepositoryError>;

/// Convenience type alias for remote storefront Results
pub type RemoteResult<T> = Result<T, RemoteError>;

/// Convenience type alias for conversion Results
pub type ConversionResult<T> = Result<T, ConversionError>;

/// Convenience type alias for delivery Results
pub type DeliveryResult<T> = Result<T, DeliveryError>;
