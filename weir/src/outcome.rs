//! The outcome model: who gets what when a channel is liquidated on chain.
//!
//! An [`Exit`] describes, per asset, an ordered list of allocations. Order matters: on-chain
//! payouts are made in allocation order against whatever funds the channel actually holds, so
//! an underfunded channel pays earlier allocations first.

use alloy::{
    primitives::{Bytes, U256},
    sol_types::SolValue,
};
use anyhow::{Result, anyhow, bail};
use serde::{Deserialize, Serialize};

use crate::types::{Address, Destination, Funds};

/// Distinguishes plain payouts from guarantees, which earmark funds for another channel
/// rather than an external account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum AllocationType {
    Normal,
    Guarantee,
}

impl From<AllocationType> for u8 {
    fn from(value: AllocationType) -> u8 {
        match value {
            AllocationType::Normal => 0,
            AllocationType::Guarantee => 2,
        }
    }
}

impl TryFrom<u8> for AllocationType {
    type Error = String;

    fn try_from(value: u8) -> Result<AllocationType, String> {
        match value {
            0 => Ok(AllocationType::Normal),
            2 => Ok(AllocationType::Guarantee),
            other => Err(format!("unknown allocation type {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub destination: Destination,
    pub amount: U256,
    pub allocation_type: AllocationType,
    #[serde(with = "hex::serde")]
    pub metadata: Vec<u8>,
}

impl Allocation {
    /// A plain payout to `destination`.
    pub fn normal(destination: Destination, amount: U256) -> Allocation {
        Allocation {
            destination,
            amount,
            allocation_type: AllocationType::Normal,
            metadata: Vec::new(),
        }
    }

    /// An allocation earmarking `amount` for the channel `target`, recoverable by the pair
    /// of destinations recorded in the metadata.
    pub fn guarantee(
        target: Destination,
        amount: U256,
        metadata: GuaranteeMetadata,
    ) -> Allocation {
        Allocation {
            destination: target,
            amount,
            allocation_type: AllocationType::Guarantee,
            metadata: metadata.encode(),
        }
    }
}

/// The two destinations a guarantee can be reclaimed towards, ABI-encoded into the
/// allocation's metadata field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuaranteeMetadata {
    pub left: Destination,
    pub right: Destination,
}

impl GuaranteeMetadata {
    pub fn encode(&self) -> Vec<u8> {
        (self.left.0, self.right.0).abi_encode()
    }

    pub fn decode(bytes: &[u8]) -> Result<GuaranteeMetadata> {
        let (left, right) = <(alloy::primitives::B256, alloy::primitives::B256)>::abi_decode(
            bytes, true,
        )
        .map_err(|e| anyhow!("could not decode guarantee metadata: {e}"))?;
        Ok(GuaranteeMetadata {
            left: Destination(left),
            right: Destination(right),
        })
    }
}

/// The allocations for a single asset. The zero address denotes the chain's native asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SingleAssetExit {
    pub asset: Address,
    #[serde(with = "hex::serde")]
    pub asset_metadata: Vec<u8>,
    pub allocations: Vec<Allocation>,
}

impl SingleAssetExit {
    pub fn total_allocated(&self) -> U256 {
        self.allocations
            .iter()
            .fold(U256::ZERO, |acc, a| acc.saturating_add(a.amount))
    }

    pub fn total_allocated_for(&self, destination: Destination) -> U256 {
        self.allocations
            .iter()
            .filter(|a| a.destination == destination)
            .fold(U256::ZERO, |acc, a| acc.saturating_add(a.amount))
    }
}

/// An ordered list of [`SingleAssetExit`]s, one per asset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Exit(pub Vec<SingleAssetExit>);

impl Exit {
    /// Sums all allocations per asset.
    pub fn total_allocated(&self) -> Funds {
        let mut funds = Funds::new();
        for asset_exit in &self.0 {
            let amount = funds.amount(&asset_exit.asset);
            funds.insert(
                asset_exit.asset,
                amount.saturating_add(asset_exit.total_allocated()),
            );
        }
        funds
    }

    /// Sums the allocations made to `destination`, per asset.
    pub fn total_allocated_for(&self, destination: Destination) -> Funds {
        let mut funds = Funds::new();
        for asset_exit in &self.0 {
            let amount = funds.amount(&asset_exit.asset);
            funds.insert(
                asset_exit.asset,
                amount.saturating_add(asset_exit.total_allocated_for(destination)),
            );
        }
        funds
    }

    /// Returns true if, for each asset keyed by `allocations`, the given funding covers every
    /// allocation up to and including the queried one, in payout order.
    pub fn affords(&self, allocations: &[(Address, Allocation)], funding: &Funds) -> bool {
        for (asset, allocation) in allocations {
            let mut surplus = funding.amount(asset);
            let Some(asset_exit) = self.0.iter().find(|e| &e.asset == asset) else {
                return false;
            };
            let mut found = false;
            for candidate in &asset_exit.allocations {
                if candidate == allocation {
                    found = surplus >= allocation.amount;
                    break;
                }
                surplus = surplus.saturating_sub(candidate.amount);
            }
            if !found {
                return false;
            }
        }
        true
    }

    /// ABI-encodes the exit the way the adjudicator contract expects it, for hashing and for
    /// on-chain transaction witnesses.
    pub fn abi_encode(&self) -> Vec<u8> {
        let encoded: Vec<(Address, Bytes, Vec<(alloy::primitives::B256, U256, U256, Bytes)>)> = self
            .0
            .iter()
            .map(|asset_exit| {
                (
                    asset_exit.asset,
                    Bytes::from(asset_exit.asset_metadata.clone()),
                    asset_exit
                        .allocations
                        .iter()
                        .map(|a| {
                            (
                                a.destination.0,
                                a.amount,
                                U256::from(u8::from(a.allocation_type)),
                                Bytes::from(a.metadata.clone()),
                            )
                        })
                        .collect(),
                )
            })
            .collect();
        encoded.abi_encode()
    }

    /// Ensures every asset section is non-empty; an empty section would make payout order
    /// ambiguous on chain.
    pub fn validate(&self) -> Result<()> {
        for asset_exit in &self.0 {
            if asset_exit.allocations.is_empty() {
                bail!("asset {} has no allocations", asset_exit.asset);
            }
        }
        Ok(())
    }
}
