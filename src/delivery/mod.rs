//! Outbound delivery: chat notifications and temporary cloud storage

pub mod blob_store;
pub mod notifier;

pub use blob_store::{BlobStore, DeleteOutcome, HttpBlobStore, UploadedBlob};
pub use notifier::{LogNotifier, Notifier};
