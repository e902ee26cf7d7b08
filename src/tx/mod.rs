//! Transaction submission: nonce allocation, gas resolution, signing,
//! broadcasting and fee escalation

mod broadcaster;
mod gas;
mod manager;
mod nonce;
mod signer;

pub use broadcaster::{Broadcaster, BroadcasterSettings};
pub use gas::{escalate_gas_price, GasEstimator};
pub use manager::{ManagerSettings, ReceiptWait, TransactionManager};
pub use nonce::NonceAllocator;
pub use signer::{TxSigner, WalletSigner};
