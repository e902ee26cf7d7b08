use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Globally unique message identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MsgId(Uuid);

impl MsgId {
    /// Draw a fresh random identifier
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Derive a stable identifier from arbitrary seed bytes.
    ///
    /// Uses the first 16 bytes of `keccak256(seed)`, so the same seed always
    /// yields the same id.
    pub fn derive(seed: impl AsRef<[u8]>) -> Self {
        let digest = Keccak256::digest(seed.as_ref());
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&digest[..16]);
        Self(Uuid::from_bytes(bytes))
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl From<Uuid> for MsgId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl FromStr for MsgId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl fmt::Display for MsgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
