//! The off-chain ledger of a single channel: signed states keyed by turn number, plus the
//! on-chain holdings and adjudication data observed by the chain watcher.

use std::{collections::BTreeMap, ops::{Deref, DerefMut}};

use alloy::primitives::U256;
use anyhow::{Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{
    consensus_channel::ConsensusChannel,
    crypto::{Hash, SecretKey},
    fixed_queue::FixedQueue,
    outcome::Exit,
    payments::Swap,
    state::{FixedPart, SignedState, State},
    types::{Address, Destination, Funds},
};

pub const PRE_FUND_TURN_NUM: u64 = 0;
pub const POST_FUND_TURN_NUM: u64 = 1;
/// Reserved turn number meaning "there is not yet a supported state".
pub const MAX_TURN_NUM: u64 = u64::MAX;

/// How many finalized swaps a swap channel remembers.
pub const MAX_SWAP_STORAGE_LIMIT: usize = 5;

/// The adjudication mode of a channel as observed on chain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelMode {
    #[default]
    Open,
    Challenge,
    Finalized,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelType {
    Ledger,
    Virtual,
    Swap,
}

/// The chain's view of a channel: holdings per asset plus the adjudicator's challenge
/// record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnChainData {
    pub holdings: Funds,
    pub outcome: Exit,
    pub state_hash: Hash,
    pub finalizes_at: U256,
    pub is_challenge_initiated_by_me: bool,
    pub channel_mode: ChannelMode,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffChainData {
    /// At most one signed state per turn number; signatures for the same turn are merged.
    pub signed_state_for_turn_num: BTreeMap<u64, SignedState>,
    pub latest_supported_state_turn_num: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainUpdateData {
    pub block_num: u64,
    pub tx_index: u64,
}

/// A chain-watcher observation concerning one channel. Only the data the off-chain core
/// needs crosses this boundary; confirmation tracking stays with the chain service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainEvent {
    pub channel_id: Destination,
    pub block_num: u64,
    pub tx_index: u64,
    pub kind: ChainEventKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChainEventKind {
    Deposited {
        asset: Address,
        now_held: U256,
    },
    AllocationUpdated {
        asset: Address,
        now_held: U256,
    },
    ChallengeRegistered {
        candidate: SignedState,
        finalizes_at: U256,
        is_initiated_by_me: bool,
    },
    ChallengeCleared,
    Concluded,
}

/// Contains states and metadata and exposes convenience methods.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub fixed_part: FixedPart,
    pub id: Destination,
    pub my_index: usize,
    pub channel_type: ChannelType,
    pub on_chain: OnChainData,
    pub off_chain: OffChainData,
    pub last_chain_update: ChainUpdateData,
}

impl Channel {
    /// Constructs a new `Channel` from the supplied prefund state.
    pub fn new(state: State, my_index: usize, channel_type: ChannelType) -> Result<Channel> {
        state.validate()?;
        if my_index >= state.participants.len() {
            bail!("my_index {} not in range of the supplied participants", my_index);
        }
        if state.turn_num != PRE_FUND_TURN_NUM {
            bail!("a channel must be constructed from a prefund state");
        }

        let mut holdings = Funds::new();
        for asset in state.outcome.total_allocated().0.keys() {
            holdings.insert(*asset, U256::ZERO);
        }

        let mut post_fund = state.clone();
        post_fund.turn_num = POST_FUND_TURN_NUM;

        let mut signed_state_for_turn_num = BTreeMap::new();
        signed_state_for_turn_num.insert(PRE_FUND_TURN_NUM, SignedState::new(state.clone()));
        signed_state_for_turn_num.insert(POST_FUND_TURN_NUM, SignedState::new(post_fund));

        Ok(Channel {
            id: state.channel_id(),
            fixed_part: state.fixed_part(),
            my_index,
            channel_type,
            on_chain: OnChainData {
                holdings,
                ..OnChainData::default()
            },
            off_chain: OffChainData {
                signed_state_for_turn_num,
                latest_supported_state_turn_num: MAX_TURN_NUM,
            },
            last_chain_update: ChainUpdateData::default(),
        })
    }

    pub fn participants(&self) -> &[Address] {
        &self.fixed_part.participants
    }

    pub fn my_address(&self) -> Address {
        self.fixed_part.participants[self.my_index]
    }

    pub fn my_destination(&self) -> Destination {
        Destination::from_address(self.my_address())
    }

    pub fn pre_fund_state(&self) -> State {
        self.off_chain.signed_state_for_turn_num[&PRE_FUND_TURN_NUM]
            .state()
            .clone()
    }

    pub fn signed_pre_fund_state(&self) -> SignedState {
        self.off_chain.signed_state_for_turn_num[&PRE_FUND_TURN_NUM].clone()
    }

    pub fn post_fund_state(&self) -> State {
        self.off_chain.signed_state_for_turn_num[&POST_FUND_TURN_NUM]
            .state()
            .clone()
    }

    pub fn signed_post_fund_state(&self) -> SignedState {
        self.off_chain.signed_state_for_turn_num[&POST_FUND_TURN_NUM].clone()
    }

    pub fn pre_fund_signed_by_me(&self) -> bool {
        self.off_chain
            .signed_state_for_turn_num
            .get(&PRE_FUND_TURN_NUM)
            .is_some_and(|ss| ss.has_signature_for(self.my_index))
    }

    pub fn post_fund_signed_by_me(&self) -> bool {
        self.off_chain
            .signed_state_for_turn_num
            .get(&POST_FUND_TURN_NUM)
            .is_some_and(|ss| ss.has_signature_for(self.my_index))
    }

    pub fn pre_fund_complete(&self) -> bool {
        self.off_chain.signed_state_for_turn_num[&PRE_FUND_TURN_NUM].has_all_signatures()
    }

    pub fn post_fund_complete(&self) -> bool {
        self.off_chain.signed_state_for_turn_num[&POST_FUND_TURN_NUM].has_all_signatures()
    }

    /// Returns true if I have signed any final state for this channel.
    pub fn final_signed_by_me(&self) -> bool {
        self.off_chain
            .signed_state_for_turn_num
            .values()
            .any(|ss| ss.has_signature_for(self.my_index) && ss.state().is_final)
    }

    /// Returns true if a final state is supported by every participant.
    pub fn final_completed(&self) -> bool {
        if self.off_chain.latest_supported_state_turn_num == MAX_TURN_NUM {
            return false;
        }
        self.off_chain.signed_state_for_turn_num
            [&self.off_chain.latest_supported_state_turn_num]
            .state()
            .is_final
    }

    pub fn has_supported_state(&self) -> bool {
        self.off_chain.latest_supported_state_turn_num != MAX_TURN_NUM
    }

    /// The latest state signed by all participants.
    pub fn latest_supported_state(&self) -> Result<State> {
        Ok(self.latest_supported_signed_state()?.state().clone())
    }

    pub fn latest_supported_signed_state(&self) -> Result<SignedState> {
        if self.off_chain.latest_supported_state_turn_num == MAX_TURN_NUM {
            bail!("no state is yet supported");
        }
        Ok(self.off_chain.signed_state_for_turn_num
            [&self.off_chain.latest_supported_state_turn_num]
            .clone())
    }

    /// The state with the largest turn number signed by at least one participant.
    pub fn latest_signed_state(&self) -> Result<SignedState> {
        self.off_chain
            .signed_state_for_turn_num
            .iter()
            .filter(|(_, ss)| ss.signature_count() > 0)
            .max_by_key(|(turn, _)| **turn)
            .map(|(_, ss)| ss.clone())
            .ok_or_else(|| anyhow!("no states are signed"))
    }

    /// The total of each asset allocated by the prefund state.
    pub fn total(&self) -> Funds {
        self.pre_fund_state().outcome.total_allocated()
    }

    /// Returns true if, for each asset keying the queried allocations, the channel can
    /// afford them given `funding`. The decision is made against the latest supported state.
    pub fn affords(
        &self,
        allocations: &[(Address, crate::outcome::Allocation)],
        funding: &Funds,
    ) -> bool {
        match self.latest_supported_state() {
            Ok(state) => state.outcome.affords(allocations, funding),
            Err(_) => false,
        }
    }

    /// Adds a signed state to the channel, updating the latest supported state when a turn
    /// gathers every signature. Returns false and leaves the channel unchanged if the state
    /// is stale, belongs to a different channel, or carries an invalid signature.
    pub fn add_signed_state(&mut self, ss: SignedState) -> bool {
        if ss.channel_id() != self.id {
            warn!(channel = %self.id, "discarding signed state for a different channel");
            return false;
        }

        let turn_num = ss.state().turn_num;
        if self.off_chain.latest_supported_state_turn_num != MAX_TURN_NUM
            && turn_num < self.off_chain.latest_supported_state_turn_num
        {
            // Stale state.
            return false;
        }

        match self.off_chain.signed_state_for_turn_num.get_mut(&turn_num) {
            None => {
                self.off_chain.signed_state_for_turn_num.insert(turn_num, ss);
            }
            Some(existing) => {
                if existing.merge(&ss).is_err() {
                    return false;
                }
            }
        }

        if self.off_chain.signed_state_for_turn_num[&turn_num].has_all_signatures() {
            self.off_chain.latest_supported_state_turn_num = turn_num;
        }

        true
    }

    /// Constructs a `SignedState` from the passed state and signature and adds it.
    pub fn add_state_with_signature(
        &mut self,
        state: State,
        signature: crate::crypto::Signature,
    ) -> bool {
        let mut ss = SignedState::new(state);
        if ss.add_signature(signature).is_err() {
            return false;
        }
        self.add_signed_state(ss)
    }

    /// Signs and adds the prefund state, returning a `SignedState` suitable for sending to
    /// peers.
    pub fn sign_and_add_prefund(&mut self, key: &SecretKey) -> Result<SignedState> {
        self.sign_and_add_state(self.pre_fund_state(), key)
    }

    /// Signs and adds the postfund state, returning a `SignedState` suitable for sending to
    /// peers.
    pub fn sign_and_add_postfund(&mut self, key: &SecretKey) -> Result<SignedState> {
        self.sign_and_add_state(self.post_fund_state(), key)
    }

    pub fn sign_and_add_state(&mut self, state: State, key: &SecretKey) -> Result<SignedState> {
        let signature = state.sign(key)?;
        let mut ss = SignedState::new(state);
        ss.add_signature(signature)?;
        if !self.add_signed_state(ss.clone()) {
            bail!("could not add signed state to channel {}", self.id);
        }
        Ok(ss)
    }

    fn is_new_chain_event(&self, event: &ChainEvent) -> bool {
        event.block_num > self.last_chain_update.block_num
            || (event.block_num == self.last_chain_update.block_num
                && event.tx_index > self.last_chain_update.tx_index)
    }

    /// Applies a chain-watcher observation, replacing the relevant on-chain data fields.
    /// Events at or before the last applied block/tx are rejected.
    pub fn update_with_chain_event(&mut self, event: &ChainEvent) -> Result<()> {
        if !self.is_new_chain_event(event) {
            bail!("chain event older than channel's last update");
        }

        match &event.kind {
            ChainEventKind::Deposited { asset, now_held }
            | ChainEventKind::AllocationUpdated { asset, now_held } => {
                self.on_chain.holdings.insert(*asset, *now_held);
            }
            ChainEventKind::ChallengeRegistered {
                candidate,
                finalizes_at,
                is_initiated_by_me,
            } => {
                self.on_chain.state_hash = candidate.state().hash();
                self.on_chain.outcome = candidate.state().outcome.clone();
                self.on_chain.finalizes_at = *finalizes_at;
                self.on_chain.is_challenge_initiated_by_me = *is_initiated_by_me;
                if self.id == event.channel_id {
                    self.add_signed_state(candidate.clone());
                }
            }
            ChainEventKind::ChallengeCleared => {
                self.on_chain.state_hash = Hash::ZERO;
                self.on_chain.outcome = Exit::default();
                self.on_chain.finalizes_at = U256::ZERO;
            }
            ChainEventKind::Concluded => {}
        }

        self.last_chain_update.block_num = event.block_num;
        self.last_chain_update.tx_index = event.tx_index;
        Ok(())
    }

    /// Derives the channel mode from the challenge deadline and the latest block timestamp.
    pub fn update_channel_mode(&mut self, latest_block_time: u64) {
        if self.on_chain.finalizes_at.is_zero() {
            self.on_chain.channel_mode = ChannelMode::Open;
        } else if self.on_chain.finalizes_at <= U256::from(latest_block_time) {
            self.on_chain.channel_mode = ChannelMode::Finalized;
        } else {
            self.on_chain.channel_mode = ChannelMode::Challenge;
        }
    }

    /// Returns true if the channel holds no assets on chain.
    pub fn fully_withdrawn(&self) -> bool {
        !self.on_chain.holdings.is_non_zero()
    }

    /// A stub carrying only an id, produced when deserializing an objective's lossy JSON
    /// projection; the store re-attaches full channel data on rehydration.
    pub fn stub(id: Destination) -> Channel {
        Channel {
            fixed_part: FixedPart::default(),
            id,
            my_index: 0,
            channel_type: ChannelType::Ledger,
            on_chain: OnChainData::default(),
            off_chain: OffChainData {
                signed_state_for_turn_num: BTreeMap::new(),
                latest_supported_state_turn_num: MAX_TURN_NUM,
            },
            last_chain_update: ChainUpdateData::default(),
        }
    }

    /// Materializes a plain channel from a consensus channel, seeded with the consensus
    /// state as its only (and supported) signed state and the ledger's on-chain funding.
    pub fn from_consensus_channel(cc: &ConsensusChannel) -> Result<Channel> {
        let supported = cc.supported_signed_state();
        let mut channel = Channel {
            fixed_part: cc.fixed_part().clone(),
            id: cc.id,
            my_index: cc.my_index,
            channel_type: ChannelType::Ledger,
            on_chain: OnChainData {
                holdings: cc.on_chain_funding.clone(),
                ..OnChainData::default()
            },
            off_chain: OffChainData {
                signed_state_for_turn_num: BTreeMap::new(),
                latest_supported_state_turn_num: MAX_TURN_NUM,
            },
            last_chain_update: ChainUpdateData::default(),
        };
        if !channel.add_signed_state(supported) {
            bail!("could not seed channel {} with its consensus state", cc.id);
        }
        Ok(channel)
    }
}

/// A channel restricted to two allocations per asset, with a bounded history of the swaps
/// executed through it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapChannel {
    pub channel: Channel,
    pub swaps: FixedQueue<Swap>,
}

impl SwapChannel {
    pub fn new(state: State, my_index: usize) -> Result<SwapChannel> {
        for asset_exit in &state.outcome.0 {
            if asset_exit.allocations.len() != 2 {
                bail!("a swap channel's initial state should only have two allocations");
            }
        }
        let channel = Channel::new(state, my_index, ChannelType::Swap)?;
        Ok(SwapChannel {
            channel,
            swaps: FixedQueue::new(MAX_SWAP_STORAGE_LIMIT),
        })
    }

    pub fn from_channel(channel: Channel) -> SwapChannel {
        SwapChannel {
            channel,
            swaps: FixedQueue::new(MAX_SWAP_STORAGE_LIMIT),
        }
    }
}

impl Deref for SwapChannel {
    type Target = Channel;

    fn deref(&self) -> &Channel {
        &self.channel
    }
}

impl DerefMut for SwapChannel {
    fn deref_mut(&mut self) -> &mut Channel {
        &mut self.channel
    }
}

#[cfg(test)]
mod tests {
    use alloy::primitives::U256;

    use super::*;
    use crate::{
        outcome::{Allocation, SingleAssetExit},
        state::State,
    };

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

    fn prefund_state() -> State {
        let (alice, bob) = keys();
        State {
            participants: vec![alice.address(), bob.address()],
            channel_nonce: 1,
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
    fn new_channel_tracks_prefund_and_postfund() {
        let channel = Channel::new(prefund_state(), 0, ChannelType::Ledger).unwrap();
        assert_eq!(channel.pre_fund_state().turn_num, PRE_FUND_TURN_NUM);
        assert_eq!(channel.post_fund_state().turn_num, POST_FUND_TURN_NUM);
        assert!(!channel.has_supported_state());
        assert_eq!(channel.on_chain.holdings.amount(&Address::ZERO), U256::ZERO);
    }

    #[test]
    fn prefund_becomes_supported_once_everyone_signs() {
        let (alice, bob) = keys();
        let mut a = Channel::new(prefund_state(), 0, ChannelType::Ledger).unwrap();
        let ss = a.sign_and_add_prefund(&alice).unwrap();
        assert!(a.pre_fund_signed_by_me());
        assert!(!a.pre_fund_complete());

        let mut b = Channel::new(prefund_state(), 1, ChannelType::Ledger).unwrap();
        assert!(b.add_signed_state(ss));
        let ss_b = b.sign_and_add_prefund(&bob).unwrap();
        assert!(b.pre_fund_complete());

        assert!(a.add_signed_state(ss_b));
        assert!(a.pre_fund_complete());
        assert_eq!(
            a.latest_supported_state().unwrap().turn_num,
            PRE_FUND_TURN_NUM
        );
    }

    #[test]
    fn stale_states_are_rejected() {
        let (alice, bob) = keys();
        let mut channel = Channel::new(prefund_state(), 0, ChannelType::Ledger).unwrap();
        let prefund = channel.sign_and_add_prefund(&alice).unwrap();
        let mut counterparty_view = SignedState::new(channel.pre_fund_state());
        counterparty_view
            .add_signature(channel.pre_fund_state().sign(&bob).unwrap())
            .unwrap();
        assert!(channel.add_signed_state(counterparty_view));

        channel.sign_and_add_postfund(&alice).unwrap();
        let mut postfund_b = SignedState::new(channel.post_fund_state());
        postfund_b
            .add_signature(channel.post_fund_state().sign(&bob).unwrap())
            .unwrap();
        assert!(channel.add_signed_state(postfund_b));
        assert_eq!(
            channel.off_chain.latest_supported_state_turn_num,
            POST_FUND_TURN_NUM
        );

        // A fully-signed state below the supported turn is stale.
        assert!(!channel.add_signed_state(prefund));
    }

    #[test]
    fn chain_events_must_be_newer_than_the_last_applied() {
        let mut channel = Channel::new(prefund_state(), 0, ChannelType::Ledger).unwrap();
        let event = ChainEvent {
            channel_id: channel.id,
            block_num: 5,
            tx_index: 0,
            kind: ChainEventKind::Deposited {
                asset: Address::ZERO,
                now_held: U256::from(10),
            },
        };
        channel.update_with_chain_event(&event).unwrap();
        assert_eq!(
            channel.on_chain.holdings.amount(&Address::ZERO),
            U256::from(10)
        );
        assert!(channel.update_with_chain_event(&event).is_err());
    }

    #[test]
    fn channel_mode_follows_finalizes_at() {
        let mut channel = Channel::new(prefund_state(), 0, ChannelType::Ledger).unwrap();
        channel.update_channel_mode(50);
        assert_eq!(channel.on_chain.channel_mode, ChannelMode::Open);

        channel.on_chain.finalizes_at = U256::from(100);
        channel.update_channel_mode(50);
        assert_eq!(channel.on_chain.channel_mode, ChannelMode::Challenge);

        channel.update_channel_mode(100);
        assert_eq!(channel.on_chain.channel_mode, ChannelMode::Finalized);
    }
}
