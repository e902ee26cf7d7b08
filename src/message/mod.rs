//! Message types shared by every component
//!
//! A [`Message`] aggregates the caller's [`Request`], the latest broadcast
//! [`Response`], the confirmed [`Receipt`] and the lifecycle [`MsgStatus`].

mod id;

pub use id::MsgId;

use crate::error::{DeliveryError, DeliveryResult};

use chrono::{DateTime, Utc};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::transaction::eip2930::AccessList;
use ethers::types::{Address, Bytes, Signature, TransactionReceipt, H256, U256, U64};
use ethers::utils::keccak256;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A state-changing call the caller wants on chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    #[serde(default = "MsgId::random")]
    pub id: MsgId,
    pub from: Address,
    /// `None` deploys a contract
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<Address>,
    #[serde(default)]
    pub value: U256,
    /// Gas limit, 0 = estimate
    #[serde(default)]
    pub gas: u64,
    /// Gas price, 0 = ask the node
    #[serde(default)]
    pub gas_price: U256,
    #[serde(default)]
    pub data: Bytes,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_list: Option<AccessList>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after_msg: Option<MsgId>,
}

impl Request {
    pub fn new(from: Address) -> Self {
        Self {
            id: MsgId::random(),
            from,
            to: None,
            value: U256::zero(),
            gas: 0,
            gas_price: U256::zero(),
            data: Bytes::default(),
            access_list: None,
            after_msg: None,
        }
    }

    pub fn with_id(mut self, id: MsgId) -> Self {
        self.id = id;
        self
    }

    pub fn to(mut self, to: Address) -> Self {
        self.to = Some(to);
        self
    }

    pub fn value(mut self, value: impl Into<U256>) -> Self {
        self.value = value.into();
        self
    }

    pub fn gas(mut self, gas: u64) -> Self {
        self.gas = gas;
        self
    }

    pub fn gas_price(mut self, gas_price: impl Into<U256>) -> Self {
        self.gas_price = gas_price.into();
        self
    }

    pub fn data(mut self, data: impl Into<Bytes>) -> Self {
        self.data = data.into();
        self
    }

    pub fn access_list(mut self, access_list: AccessList) -> Self {
        self.access_list = Some(access_list);
        self
    }

    /// Hold this request back until `predecessor` has been released
    pub fn after(mut self, predecessor: MsgId) -> Self {
        self.after_msg = Some(predecessor);
        self
    }

    pub fn is_contract_creation(&self) -> bool {
        self.to.is_none()
    }
}

/// A signed transaction as it was handed to the node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedTx {
    pub hash: H256,
    pub tx: TypedTransaction,
    pub signature: Signature,
    pub raw: Bytes,
}

impl SignedTx {
    pub fn new(tx: TypedTransaction, signature: Signature) -> Self {
        let raw = tx.rlp_signed(&signature);
        let hash = H256::from(keccak256(&raw));
        Self {
            hash,
            tx,
            signature,
            raw,
        }
    }

    pub fn nonce(&self) -> Option<U256> {
        self.tx.nonce().copied()
    }

    pub fn gas(&self) -> Option<U256> {
        self.tx.gas().copied()
    }

    pub fn gas_price(&self) -> Option<U256> {
        self.tx.gas_price()
    }
}

/// Outcome of one send attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub id: MsgId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx: Option<SignedTx>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_data: Option<Bytes>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
}

impl Response {
    pub fn sent(id: MsgId, tx: SignedTx) -> Self {
        Self {
            id,
            tx: Some(tx),
            return_data: None,
            err: None,
        }
    }

    pub fn failed(id: MsgId, tx: Option<SignedTx>, err: &DeliveryError) -> Self {
        Self {
            id,
            tx,
            return_data: None,
            err: Some(err.to_string()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.err.is_none()
    }

    pub fn tx_hash(&self) -> Option<H256> {
        self.tx.as_ref().map(|tx| tx.hash)
    }
}

/// On-chain execution result at the required depth
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
    pub id: MsgId,
    pub tx_receipt: TransactionReceipt,
}

impl Receipt {
    /// Whether execution succeeded; a reverted transaction is still a receipt
    pub fn succeeded(&self) -> bool {
        self.tx_receipt.status == Some(U64::from(1))
    }
}

/// Lifecycle of a message, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MsgStatus {
    Pending,
    Queued,
    NonceAssigned,
    Inflight,
    OnChain,
    Finalized,
}

impl MsgStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MsgStatus::Pending => "pending",
            MsgStatus::Queued => "queued",
            MsgStatus::NonceAssigned => "nonce_assigned",
            MsgStatus::Inflight => "inflight",
            MsgStatus::OnChain => "on_chain",
            MsgStatus::Finalized => "finalized",
        }
    }

    /// Forward moves are always allowed. The only way back is a broadcast
    /// redo, which returns an in-flight message to `NonceAssigned`.
    pub fn can_transition_to(self, next: MsgStatus) -> bool {
        next >= self || (self == MsgStatus::Inflight && next == MsgStatus::NonceAssigned)
    }
}

impl fmt::Display for MsgStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MsgStatus {
    type Err = DeliveryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(MsgStatus::Pending),
            "queued" => Ok(MsgStatus::Queued),
            "nonce_assigned" => Ok(MsgStatus::NonceAssigned),
            "inflight" => Ok(MsgStatus::Inflight),
            "on_chain" => Ok(MsgStatus::OnChain),
            "finalized" => Ok(MsgStatus::Finalized),
            other => Err(DeliveryError::Internal(format!("unknown status {}", other))),
        }
    }
}

/// Everything known about one request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub request: Request,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Response>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receipt: Option<Receipt>,
    pub status: MsgStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Message {
    pub fn new(request: Request) -> Self {
        let now = Utc::now();
        Self {
            request,
            response: None,
            receipt: None,
            status: MsgStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn id(&self) -> MsgId {
        self.request.id
    }

    pub fn set_status(&mut self, next: MsgStatus) -> DeliveryResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(DeliveryError::InvalidStateTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        self.touch();
        Ok(())
    }

    pub fn set_response(&mut self, response: Response) {
        self.response = Some(response);
        self.touch();
    }

    pub fn set_receipt(&mut self, receipt: Receipt) {
        self.receipt = Some(receipt);
        self.touch();
    }

    /// The latest signed transaction, if one was produced
    pub fn latest_tx(&self) -> Option<&SignedTx> {
        self.response.as_ref().and_then(|r| r.tx.as_ref())
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
