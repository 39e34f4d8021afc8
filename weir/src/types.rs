//! Shared primitive types used across the protocol core.

use std::{
    collections::BTreeMap,
    fmt::{self, Display},
};

use alloy::primitives::{B256, U256};
use serde::{Deserialize, Serialize};

pub use alloy::primitives::Address;

/// A `Destination` identifies a party capable of holding channel funds: either a channel
/// (by its 32-byte id) or an external account (a 20-byte address left-padded with zeros).
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Destination(pub B256);

impl Destination {
    pub const ZERO: Destination = Destination(B256::ZERO);

    /// Converts an external address into a destination by left-padding it to 32 bytes.
    pub fn from_address(address: Address) -> Destination {
        let mut bytes = [0u8; 32];
        bytes[12..].copy_from_slice(address.as_slice());
        Destination(B256::new(bytes))
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0.0
    }
}

impl From<B256> for Destination {
    fn from(value: B256) -> Self {
        Destination(value)
    }
}

impl Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-asset amounts, keyed by the asset's token contract address. The native asset is keyed
/// by the zero address.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Funds(pub BTreeMap<Address, U256>);

impl Funds {
    pub fn new() -> Funds {
        Funds(BTreeMap::new())
    }

    /// Returns true if any asset holds a non-zero amount.
    pub fn is_non_zero(&self) -> bool {
        self.0.values().any(|amount| !amount.is_zero())
    }

    pub fn amount(&self, asset: &Address) -> U256 {
        self.0.get(asset).copied().unwrap_or(U256::ZERO)
    }

    pub fn insert(&mut self, asset: Address, amount: U256) {
        self.0.insert(asset, amount);
    }
}

impl Display for Funds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut entries = self.0.iter().peekable();
        write!(f, "{{")?;
        while let Some((asset, amount)) = entries.next() {
            write!(f, "{asset}: {amount}")?;
            if entries.peek().is_some() {
                write!(f, ", ")?;
            }
        }
        write!(f, "}}")
    }
}
