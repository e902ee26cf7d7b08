//! Signing capabilities
//!
//! The manager keeps an ordered list of [`TxSigner`]s and uses the first one
//! that does not reject the sender with [`DeliveryError::NotAuthorized`].

use crate::error::{DeliveryError, DeliveryResult};

use async_trait::async_trait;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Signature};

#[async_trait]
pub trait TxSigner: Send + Sync {
    /// Sign `tx` on behalf of `from`, or reject with `NotAuthorized`
    async fn sign(&self, from: Address, tx: &TypedTransaction) -> DeliveryResult<Signature>;
}

/// Signs for the single address of a local private key
pub struct WalletSigner {
    wallet: LocalWallet,
}

impl WalletSigner {
    pub fn new(wallet: LocalWallet) -> Self {
        Self { wallet }
    }

    /// Load a hex private key from an environment variable
    pub fn from_env(var: &str) -> DeliveryResult<Self> {
        let key = std::env::var(var)
            .map_err(|_| DeliveryError::Config(format!("Signing key env {} is not set", var)))?;
        let bytes = hex::decode(key.trim().trim_start_matches("0x"))
            .map_err(|e| DeliveryError::Config(format!("Private key in {} is not hex: {}", var, e)))?;
        let wallet = LocalWallet::from_bytes(&bytes)
            .map_err(|e| DeliveryError::Config(format!("Invalid private key in {}: {}", var, e)))?;
        Ok(Self::new(wallet))
    }

    pub fn address(&self) -> Address {
        self.wallet.address()
    }
}

#[async_trait]
impl TxSigner for WalletSigner {
    async fn sign(&self, from: Address, tx: &TypedTransaction) -> DeliveryResult<Signature> {
        if from != self.wallet.address() {
            return Err(DeliveryError::NotAuthorized(from));
        }

        self.wallet
            .sign_transaction(tx)
            .await
            .map_err(|e| DeliveryError::Signing(e.to_string()))
    }
}
