//! Chat-side notifications
//!
//! The scheduler never talks to a chat transport directly; a bot front-end
//! implements [`Notifier`] and hands it to the scheduler.

use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use tracing::info;

use crate::errors::DeliveryResult;
use crate::models::MessageHandle;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Send a message that can later be edited in place
    async fn send_progress(&self, requester: i64, text: &str) -> DeliveryResult<MessageHandle>;

    /// Edit a progress message. Callers ignore failures.
    async fn update_progress(&self, handle: &MessageHandle, text: &str) -> DeliveryResult<()>;

    async fn send_completion(&self, requester: i64, text: &str) -> DeliveryResult<()>;

    async fn send_file(&self, requester: i64, path: &Path) -> DeliveryResult<()>;

    async fn send_url(&self, requester: i64, text: &str, url: &str) -> DeliveryResult<()>;
}

/// Notifier that only writes to the log, for headless runs
#[derive(Debug, Default)]
pub struct LogNotifier {
    next_message_id: AtomicI64,
}

impl LogNotifier {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Notifier for LogNotifier {
    async fn send_progress(&self, requester: i64, text: &str) -> DeliveryResult<MessageHandle> {
        let message_id = self.next_message_id.fetch_add(1, Ordering::Relaxed) + 1;
        info!("[{}#{}] {}", requester, message_id, text);
        Ok(MessageHandle {
            chat_id: requester,
            message_id,
        })
    }

    async fn update_progress(&self, handle: &MessageHandle, text: &str) -> DeliveryResult<()> {
        info!("[{}#{}] {}", handle.chat_id, handle.message_id, text);
        Ok(())
    }

    async fn send_completion(&self, requester: i64, text: &str) -> DeliveryResult<()> {
        info!("[{}] {}", requester, text);
        Ok(())
    }

    async fn send_file(&self, requester: i64, path: &Path) -> DeliveryResult<()> {
        info!("[{}] file ready at {}", requester, path.display());
        Ok(())
    }

    async fn send_url(&self, requester: i64, text: &str, url: &str) -> DeliveryResult<()> {
        info!("[{}] {} ({})", requester, text, url);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn log_notifier_hands_out_distinct_handles() {
        let notifier = LogNotifier::new();
        let first = notifier.send_progress(7, "a").await.unwrap();
        let second = notifier.send_progress(7, "b").await.unwrap();

        assert_eq!(first.chat_id, 7);
        assert_ne!(first.message_id, second.message_id);
        notifier.update_progress(&first, "c").await.unwrap();
    }
}
