//! Ordered, nonce-managed transaction delivery for EVM chains
//!
//! Requests are queued through a dependency-aware sequencer, sent with
//! gap-free per-account nonces and protected until confirmed. A transaction
//! that stalls is replaced at the same nonce with a higher gas price.

pub mod api;
pub mod chain;
pub mod config;
pub mod coordination;
pub mod error;
pub mod message;
pub mod metrics;
pub mod storage;
pub mod tx;

pub use coordination::{DeliveryEngine, Sequencer};
pub use error::{DeliveryError, DeliveryResult};
pub use message::{Message, MsgId, MsgStatus, Receipt, Request, Response, SignedTx};
pub use tx::{Broadcaster, TransactionManager};
