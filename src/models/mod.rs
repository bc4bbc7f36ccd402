//! Domain models shared by the repository, remote client and scheduler

pub mod library;
pub mod remote;

pub use library::*;
pub use remote::*;

use serde::{Deserialize, Serialize};

/// Identifier of a chat-side progress message that can later be edited
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageHandle {
    pub chat_id: i64,
    pub message_id: i64,
}
