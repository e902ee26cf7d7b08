//! Message storage
//!
//! The single source of truth for message state. Every component reads and
//! writes through [`MsgStorage`]; two backends are provided:
//! - [`MemoryStorage`] for single-process deployments and tests
//! - [`PostgresStorage`] when messages must survive a restart
//!
//! Writes to one identifier are last-writer-wins. Callers must not mutate the
//! same message from two tasks at once.

mod memory;
mod postgres;

pub use memory::MemoryStorage;
pub use postgres::PostgresStorage;

use crate::error::DeliveryResult;
use crate::message::{Message, MsgId, MsgStatus, Receipt, Request, Response};

use async_trait::async_trait;
use serde::Serialize;

#[async_trait]
pub trait MsgStorage: Send + Sync {
    /// Store a new request with status `Pending`. Fails if the id is taken.
    async fn add_msg(&self, request: Request) -> DeliveryResult<()>;

    async fn get_msg(&self, id: &MsgId) -> DeliveryResult<Message>;

    /// Overwrite the whole message
    async fn update_msg(&self, msg: Message) -> DeliveryResult<()>;

    async fn update_response(&self, response: Response) -> DeliveryResult<()>;

    async fn update_receipt(&self, receipt: Receipt) -> DeliveryResult<()>;

    /// Move a message to `status`, rejecting regressions
    async fn update_msg_status(&self, id: &MsgId, status: MsgStatus) -> DeliveryResult<()>;

    async fn has_msg(&self, id: &MsgId) -> DeliveryResult<bool>;

    async fn status_counts(&self) -> DeliveryResult<StatusCounts>;
}

/// Number of stored messages per status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: u64,
    pub queued: u64,
    pub nonce_assigned: u64,
    pub inflight: u64,
    pub on_chain: u64,
    pub finalized: u64,
}

impl StatusCounts {
    pub fn add(&mut self, status: MsgStatus, count: u64) {
        let slot = match status {
            MsgStatus::Pending => &mut self.pending,
            MsgStatus::Queued => &mut self.queued,
            MsgStatus::NonceAssigned => &mut self.nonce_assigned,
            MsgStatus::Inflight => &mut self.inflight,
            MsgStatus::OnChain => &mut self.on_chain,
            MsgStatus::Finalized => &mut self.finalized,
        };
        *slot += count;
    }

    pub fn total(&self) -> u64 {
        self.pending
            + self.queued
            + self.nonce_assigned
            + self.inflight
            + self.on_chain
            + self.finalized
    }
}
