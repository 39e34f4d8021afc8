//! Signed, content-addressed swap records exchanged through a swap channel.

use alloy::{primitives::U256, sol_types::SolValue};
use anyhow::Result;
use serde::{Deserialize, Serialize, Serializer, de};
use std::collections::BTreeMap;

use crate::{
    crypto::{Hash, SecretKey, Signature, recover_ethereum_message_signer, sign_ethereum_message},
    fixed_queue::FixedQueue,
    types::{Address, Destination},
};

use crate::channel::MAX_SWAP_STORAGE_LIMIT;

/// Where a proposed swap stands with its receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SwapStatus {
    PendingConfirmation,
    Accepted,
    Rejected,
}

/// The terms of an exchange: the proposer gives `amount_in` of `token_in` for `amount_out`
/// of `token_out`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exchange {
    pub token_in: Address,
    pub token_out: Address,
    pub amount_in: U256,
    pub amount_out: U256,
}

/// A proposed exchange within a swap channel, identified by the hash of its terms and
/// signed incrementally by both parties.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Swap {
    pub id: Destination,
    pub channel_id: Destination,
    pub exchange: Exchange,
    /// Keyed by participant index in the swap channel.
    pub sigs: BTreeMap<usize, Signature>,
    pub nonce: u64,
}

impl Swap {
    pub fn new(
        channel_id: Destination,
        token_in: Address,
        token_out: Address,
        amount_in: U256,
        amount_out: U256,
        nonce: u64,
    ) -> Swap {
        let mut swap = Swap {
            id: Destination::ZERO,
            channel_id,
            exchange: Exchange {
                token_in,
                token_out,
                amount_in,
                amount_out,
            },
            sigs: BTreeMap::new(),
            nonce,
        };
        swap.id = swap.swap_id();
        swap
    }

    fn encode(&self) -> Vec<u8> {
        (
            self.channel_id.0,
            self.exchange.token_in,
            self.exchange.token_out,
            self.exchange.amount_in,
            self.exchange.amount_out,
            U256::from(self.nonce),
        )
            .abi_encode()
    }

    /// The keccak256 hash of the swap's terms.
    pub fn hash(&self) -> Hash {
        Hash::compute([&self.encode()])
    }

    pub fn swap_id(&self) -> Destination {
        Destination(self.hash().0.into())
    }

    /// Two swaps are the same exchange if they agree on everything except signatures.
    pub fn equal(&self, target: &Swap) -> bool {
        self.channel_id == target.channel_id
            && self.exchange == target.exchange
            && self.nonce == target.nonce
    }

    /// Generates an ECDSA signature on the swap using the supplied key.
    pub fn sign(&self, key: &SecretKey) -> Result<Signature> {
        sign_ethereum_message(self.hash().as_bytes(), key)
    }

    pub fn add_signature(&mut self, signature: Signature, participant_index: usize) {
        self.sigs.insert(participant_index, signature);
    }

    /// Computes the address which generated `signature` on this swap.
    pub fn recover_signer(&self, signature: &Signature) -> Result<Address> {
        recover_ethereum_message_signer(self.hash().as_bytes(), signature)
    }
}

/// A swap bound to the address which proposed it, hashed for receipts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapWithSender {
    pub swap: Swap,
    pub sender: Address,
}

impl SwapWithSender {
    pub fn hash(&self) -> Hash {
        let encoded = (
            self.swap.channel_id.0,
            self.swap.exchange.token_in,
            self.swap.exchange.token_out,
            self.swap.exchange.amount_in,
            self.swap.exchange.amount_out,
            U256::from(self.swap.nonce),
            self.sender,
        )
            .abi_encode();
        Hash::compute([&encoded])
    }
}

/// The bounded history of finalized swaps. Persists only swap ids; rehydrating full records
/// is the store's concern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapsQueue(pub FixedQueue<Swap>);

impl SwapsQueue {
    pub fn new() -> SwapsQueue {
        SwapsQueue(FixedQueue::new(MAX_SWAP_STORAGE_LIMIT))
    }
}

impl Default for SwapsQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Serialize for SwapsQueue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let ids: Vec<Destination> = self.0.values().map(|s| s.id).collect();
        ids.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for SwapsQueue {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: de::Deserializer<'de>,
    {
        let ids = <Vec<Destination>>::deserialize(deserializer)?;
        let mut queue = SwapsQueue::new();
        for id in ids {
            let mut swap = Swap::new(
                Destination::ZERO,
                Address::ZERO,
                Address::ZERO,
                U256::ZERO,
                U256::ZERO,
                0,
            );
            swap.id = id;
            queue.0.enqueue(swap);
        }
        Ok(queue)
    }
}
