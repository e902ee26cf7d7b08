//! Error types for the delivery engine

use ethers::types::{Address, U256};
use thiserror::Error;

use crate::message::MsgId;

const NODE_REJECTIONS: &[&str] = &[
    "underpriced",
    "nonce too low",
    "insufficient funds",
    "intrinsic gas too low",
    "exceeds block gas limit",
];

/// Main error type for the delivery engine
#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("RPC call {method} failed: {message}")]
    Rpc { method: &'static str, message: String },

    #[error("Gas estimation error: {0}")]
    GasEstimation(String),

    #[error("Nonce error for account {account:?}: {message}")]
    Nonce { account: Address, message: String },

    #[error("No signer registered")]
    NoSigner,

    #[error("Sender {0:?} is not authorized by any registered signer")]
    NotAuthorized(Address),

    #[error("Signing error: {0}")]
    Signing(String),

    #[error("Broadcast error: {0}")]
    Broadcast(String),

    #[error("Message {0} not found")]
    MsgNotFound(MsgId),

    #[error("Message {0} already exists")]
    DuplicateMsg(MsgId),

    #[error("Message {0} cannot depend on itself")]
    SelfDependency(MsgId),

    #[error("Message {0} has no prior broadcast to replace")]
    NoPriorBroadcast(MsgId),

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Message queue closed")]
    QueueClosed,

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("Escalated gas price {price} exceeds cap {cap}")]
    GasPriceCapExceeded { price: U256, cap: U256 },

    #[error("Message {id} reached the replacement limit of {attempts}")]
    EscalationLimit { id: MsgId, attempts: u32 },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DeliveryError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DeliveryError::Rpc { .. }
                | DeliveryError::Nonce { .. }
                | DeliveryError::GasEstimation(_)
                | DeliveryError::Broadcast(_)
                | DeliveryError::Timeout { .. }
        )
    }

    /// Errors that will fail the same way on every attempt until the
    /// operator fixes the setup
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            DeliveryError::Config(_) | DeliveryError::NoSigner | DeliveryError::NotAuthorized(_)
        )
    }

    /// Broadcast refused by the node for a reason that resending the same
    /// transaction will not change
    pub fn is_node_rejection(&self) -> bool {
        match self {
            DeliveryError::Broadcast(message) => {
                let message = message.to_lowercase();
                NODE_REJECTIONS.iter().any(|r| message.contains(r))
            }
            _ => false,
        }
    }

    pub(crate) fn rpc(method: &'static str, err: impl std::fmt::Display) -> Self {
        DeliveryError::Rpc {
            method,
            message: err.to_string(),
        }
    }
}

/// Result type for delivery operations
pub type DeliveryResult<T> = Result<T, DeliveryError>;
