//! Channel states and the signatures that support them.
//!
//! A state is split into a [`FixedPart`], which never changes for the lifetime of a channel
//! and determines the channel's id, and a [`VariablePart`], which evolves turn by turn. A
//! [`SignedState`] collects participant signatures over one state; once every participant has
//! signed, the state is "supported" and supersedes everything before it.

use std::collections::BTreeMap;

use alloy::{
    primitives::{Bytes, U256},
    sol_types::SolValue,
};
use anyhow::{Result, anyhow, bail};
use serde::{Deserialize, Serialize};

use crate::{
    crypto::{Hash, SecretKey, Signature, recover_ethereum_message_signer, sign_ethereum_message},
    outcome::Exit,
    types::{Address, Destination},
};

/// The immutable parameters of a channel. Their hash is the channel's id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixedPart {
    pub participants: Vec<Address>,
    pub channel_nonce: u64,
    pub app_definition: Address,
    pub challenge_duration: u32,
}

impl FixedPart {
    /// The channel id: the keccak256 hash of the ABI-encoded fixed part.
    pub fn channel_id(&self) -> Destination {
        let encoded = (
            self.participants.clone(),
            U256::from(self.channel_nonce),
            self.app_definition,
            U256::from(self.challenge_duration),
        )
            .abi_encode();
        Destination(Hash::compute([&encoded]).0.into())
    }

    pub fn validate(&self) -> Result<()> {
        if self.participants.len() < 2 {
            bail!("a channel requires at least two participants");
        }
        for (i, p) in self.participants.iter().enumerate() {
            if self.participants[i + 1..].contains(p) {
                bail!("duplicate participant {p}");
            }
        }
        Ok(())
    }
}

/// The mutable portion of a state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariablePart {
    #[serde(with = "hex::serde")]
    pub app_data: Vec<u8>,
    pub outcome: Exit,
    pub turn_num: u64,
    pub is_final: bool,
}

/// A complete channel state: fixed and variable parts flattened together.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    pub participants: Vec<Address>,
    pub channel_nonce: u64,
    pub app_definition: Address,
    pub challenge_duration: u32,
    #[serde(with = "hex::serde")]
    pub app_data: Vec<u8>,
    pub outcome: Exit,
    pub turn_num: u64,
    pub is_final: bool,
}

impl State {
    pub fn from_fixed_and_variable_part(fixed: FixedPart, variable: VariablePart) -> State {
        State {
            participants: fixed.participants,
            channel_nonce: fixed.channel_nonce,
            app_definition: fixed.app_definition,
            challenge_duration: fixed.challenge_duration,
            app_data: variable.app_data,
            outcome: variable.outcome,
            turn_num: variable.turn_num,
            is_final: variable.is_final,
        }
    }

    pub fn fixed_part(&self) -> FixedPart {
        FixedPart {
            participants: self.participants.clone(),
            channel_nonce: self.channel_nonce,
            app_definition: self.app_definition,
            challenge_duration: self.challenge_duration,
        }
    }

    pub fn variable_part(&self) -> VariablePart {
        VariablePart {
            app_data: self.app_data.clone(),
            outcome: self.outcome.clone(),
            turn_num: self.turn_num,
            is_final: self.is_final,
        }
    }

    pub fn channel_id(&self) -> Destination {
        self.fixed_part().channel_id()
    }

    pub fn validate(&self) -> Result<()> {
        self.fixed_part().validate()?;
        self.outcome.validate()
    }

    /// The keccak256 hash of the state: the channel id bound together with the ABI-encoded
    /// variable part.
    pub fn hash(&self) -> Hash {
        let encoded = (
            self.channel_id().0,
            Bytes::from(self.app_data.clone()),
            Bytes::from(self.outcome.abi_encode()),
            U256::from(self.turn_num),
            self.is_final,
        )
            .abi_encode();
        Hash::compute([&encoded])
    }

    /// Signs the state hash with `key`, producing a signature any participant can attribute
    /// by recovery.
    pub fn sign(&self, key: &SecretKey) -> Result<Signature> {
        sign_ethereum_message(self.hash().as_bytes(), key)
    }

    /// Recovers the address which produced `signature` over this state.
    pub fn recover_signer(&self, signature: &Signature) -> Result<Address> {
        recover_ethereum_message_signer(self.hash().as_bytes(), signature)
    }
}

/// A state plus the signatures collected for it, keyed by participant index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedState {
    state: State,
    signatures: BTreeMap<usize, Signature>,
}

impl SignedState {
    pub fn new(state: State) -> SignedState {
        SignedState {
            state,
            signatures: BTreeMap::new(),
        }
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn channel_id(&self) -> Destination {
        self.state.channel_id()
    }

    /// Attributes `signature` by recovery and records it against the signer's participant
    /// index. Fails if the signer is not a participant or conflicts with a recorded
    /// signature.
    pub fn add_signature(&mut self, signature: Signature) -> Result<()> {
        let signer = self.state.recover_signer(&signature)?;
        let index = self
            .state
            .participants
            .iter()
            .position(|p| *p == signer)
            .ok_or_else(|| anyhow!("signature from non-participant {signer}"))?;
        match self.signatures.get(&index) {
            Some(existing) if *existing != signature => {
                bail!("conflicting signature for participant {index}")
            }
            _ => {
                self.signatures.insert(index, signature);
                Ok(())
            }
        }
    }

    /// Folds the signatures of `other` into this signed state. Both must wrap an identical
    /// state.
    pub fn merge(&mut self, other: &SignedState) -> Result<()> {
        if self.state != other.state {
            bail!("cannot merge signatures for distinct states");
        }
        for signature in other.signatures.values() {
            self.add_signature(*signature)?;
        }
        Ok(())
    }

    pub fn has_signature_for(&self, participant_index: usize) -> bool {
        self.signatures.contains_key(&participant_index)
    }

    pub fn has_all_signatures(&self) -> bool {
        self.signatures.len() == self.state.participants.len()
    }

    pub fn participant_signature(&self, participant_index: usize) -> Result<Signature> {
        self.signatures
            .get(&participant_index)
            .copied()
            .ok_or_else(|| anyhow!("no signature for participant {participant_index}"))
    }

    /// The recorded signatures in participant order.
    pub fn signatures(&self) -> Vec<(usize, Signature)> {
        self.signatures.iter().map(|(i, s)| (*i, *s)).collect()
    }

    pub fn signature_count(&self) -> usize {
        self.signatures.len()
    }
}

#[cfg(test)]
mod tests {
    use alloy::primitives::B256;

    use super::*;
    use crate::outcome::{Allocation, SingleAssetExit};

    fn keys() -> (SecretKey, SecretKey) {
        (
            SecretKey::from_hex(
                "0000000000000000000000000000000000000000000000000000000000000001",
            )
            .unwrap(),
            SecretKey::from_hex(
                "0000000000000000000000000000000000000000000000000000000000000002",
            )
            .unwrap(),
        )
    }

    fn test_state() -> State {
        let (alice, bob) = keys();
        State {
            participants: vec![alice.address(), bob.address()],
            channel_nonce: 7,
            app_definition: Address::ZERO,
            challenge_duration: 100,
            app_data: Vec::new(),
            outcome: Exit(vec![SingleAssetExit {
                asset: Address::ZERO,
                asset_metadata: Vec::new(),
                allocations: vec![
                    Allocation::normal(Destination::from_address(alice.address()), U256::from(5)),
                    Allocation::normal(Destination::from_address(bob.address()), U256::from(5)),
                ],
            }]),
            turn_num: 0,
            is_final: false,
        }
    }

    #[test]
    fn channel_id_depends_on_fixed_part_only() {
        let state = test_state();
        let mut later = state.clone();
        later.turn_num = 5;
        assert_eq!(state.channel_id(), later.channel_id());

        let mut other = state.clone();
        other.channel_nonce += 1;
        assert_ne!(state.channel_id(), other.channel_id());
        assert_ne!(state.channel_id(), Destination(B256::ZERO));
    }

    #[test]
    fn signatures_are_attributed_by_recovery() {
        let (alice, bob) = keys();
        let state = test_state();
        let mut ss = SignedState::new(state.clone());

        ss.add_signature(state.sign(&alice).unwrap()).unwrap();
        assert!(ss.has_signature_for(0));
        assert!(!ss.has_signature_for(1));
        assert!(!ss.has_all_signatures());

        ss.add_signature(state.sign(&bob).unwrap()).unwrap();
        assert!(ss.has_all_signatures());
    }

    #[test]
    fn non_participant_signature_is_rejected() {
        let state = test_state();
        let outsider = SecretKey::from_hex(
            "0000000000000000000000000000000000000000000000000000000000000003",
        )
        .unwrap();
        let mut ss = SignedState::new(state.clone());
        assert!(ss.add_signature(state.sign(&outsider).unwrap()).is_err());
    }

    #[test]
    fn merge_unions_signature_sets() {
        let (alice, bob) = keys();
        let state = test_state();

        let mut mine = SignedState::new(state.clone());
        mine.add_signature(state.sign(&alice).unwrap()).unwrap();

        let mut theirs = SignedState::new(state.clone());
        theirs.add_signature(state.sign(&bob).unwrap()).unwrap();

        mine.merge(&theirs).unwrap();
        assert!(mine.has_all_signatures());

        let mut different = SignedState::new({
            let mut s = state;
            s.turn_num = 1;
            s
        });
        different
            .add_signature(different.state().clone().sign(&bob).unwrap())
            .unwrap();
        assert!(mine.merge(&different).is_err());
    }
}
