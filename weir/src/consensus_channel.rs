//! The two-party ledger consensus protocol.
//!
//! A consensus channel replaces free-form state updates with a constrained proposal protocol
//! over a single agreed-upon outcome. The leader (participant 0) proposes changes (adding or
//! removing guarantees that fund dependent channels) at strictly increasing turn numbers and
//! sends its entire outstanding proposal queue, so a follower that missed earlier messages
//! can catch up from one payload. The follower countersigns exactly the next expected turn;
//! anything stale or out of order is rejected with [`InvalidTurnNum`], which callers treat as
//! a no-op since unreliable delivery routinely produces duplicates and reorderings.

use std::{collections::BTreeMap, error::Error, fmt::Display};

use alloy::primitives::U256;
use anyhow::{Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::{
    crypto::{SecretKey, Signature},
    outcome::{Allocation, AllocationType, Exit, GuaranteeMetadata, SingleAssetExit},
    state::{FixedPart, SignedState, State},
    types::{Address, Destination, Funds},
};

pub const LEADER_INDEX: usize = 0;
pub const FOLLOWER_INDEX: usize = 1;

/// Returned when a received proposal's turn number is not the immediate successor of the
/// last accepted one. Callers must treat this as a no-op, not a protocol abort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTurnNum;

impl Display for InvalidTurnNum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "proposal turn number did not match the expected turn number")
    }
}

impl Error for InvalidTurnNum {}

/// A plain payout within the ledger outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub destination: Destination,
    pub amount: U256,
}

impl Balance {
    pub fn as_allocation(&self) -> Allocation {
        Allocation::normal(self.destination, self.amount)
    }
}

/// An amount earmarked within the ledger outcome for a dependent channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Guarantee {
    pub amount: U256,
    pub target: Destination,
    pub left: Destination,
    pub right: Destination,
}

impl Guarantee {
    pub fn as_allocation(&self) -> Allocation {
        Allocation::guarantee(
            self.target,
            self.amount,
            GuaranteeMetadata {
                left: self.left,
                right: self.right,
            },
        )
    }
}

/// The single-asset outcome a consensus channel maintains: the two parties' balances plus
/// the guarantees currently carved out of them, keyed by target channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerOutcome {
    pub asset_address: Address,
    pub leader: Balance,
    pub follower: Balance,
    pub guarantees: BTreeMap<Destination, Guarantee>,
}

impl LedgerOutcome {
    pub fn new(asset_address: Address, leader: Balance, follower: Balance) -> LedgerOutcome {
        LedgerOutcome {
            asset_address,
            leader,
            follower,
            guarantees: BTreeMap::new(),
        }
    }

    pub fn includes_target(&self, target: Destination) -> bool {
        self.guarantees.contains_key(&target)
    }

    pub fn funding_targets(&self) -> Vec<Destination> {
        self.guarantees.keys().copied().collect()
    }

    /// Renders the outcome as an exit: the leader's balance, the follower's balance, then
    /// the guarantees in target order.
    pub fn as_exit(&self) -> Exit {
        let mut allocations = vec![self.leader.as_allocation(), self.follower.as_allocation()];
        allocations.extend(self.guarantees.values().map(Guarantee::as_allocation));
        Exit(vec![SingleAssetExit {
            asset: self.asset_address,
            asset_metadata: Vec::new(),
            allocations,
        }])
    }

    /// Parses an exit produced by [`LedgerOutcome::as_exit`] (or the postfund state of a
    /// freshly funded ledger channel) back into a ledger outcome. Fails if the exit spans
    /// more than one asset or does not lead with the two party balances.
    pub fn from_exit(exit: &Exit) -> Result<LedgerOutcome> {
        let [asset_exit] = exit.0.as_slice() else {
            bail!("a consensus channel only supports a single asset");
        };
        let (balances, guarantees): (Vec<_>, Vec<_>) = asset_exit
            .allocations
            .iter()
            .partition(|a| a.allocation_type == AllocationType::Normal);
        let [leader, follower] = balances.as_slice() else {
            bail!("a consensus channel outcome must hold exactly two party balances");
        };

        let mut outcome = LedgerOutcome::new(
            asset_exit.asset,
            Balance {
                destination: leader.destination,
                amount: leader.amount,
            },
            Balance {
                destination: follower.destination,
                amount: follower.amount,
            },
        );
        for allocation in guarantees {
            let metadata = GuaranteeMetadata::decode(&allocation.metadata)?;
            outcome.guarantees.insert(
                allocation.destination,
                Guarantee {
                    amount: allocation.amount,
                    target: allocation.destination,
                    left: metadata.left,
                    right: metadata.right,
                },
            );
        }
        Ok(outcome)
    }
}

/// A guarantee to add, funded by `left_deposit` from the leader's balance and the remainder
/// from the follower's.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Add {
    pub guarantee: Guarantee,
    pub left_deposit: U256,
}

/// Removal of the guarantee for `target`, paying `left_amount` back to the leader and the
/// remainder to the follower.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Remove {
    pub target: Destination,
    pub left_amount: U256,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProposalChange {
    Add(Add),
    Remove(Remove),
}

/// A single change to the consensus outcome, bound to the ledger channel it applies to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    pub ledger_id: Destination,
    pub change: ProposalChange,
}

impl Proposal {
    pub fn new_add(ledger_id: Destination, guarantee: Guarantee, left_deposit: U256) -> Proposal {
        Proposal {
            ledger_id,
            change: ProposalChange::Add(Add {
                guarantee,
                left_deposit,
            }),
        }
    }

    pub fn new_remove(ledger_id: Destination, target: Destination, left_amount: U256) -> Proposal {
        Proposal {
            ledger_id,
            change: ProposalChange::Remove(Remove {
                target,
                left_amount,
            }),
        }
    }

    /// The channel whose funding this proposal changes.
    pub fn target(&self) -> Destination {
        match &self.change {
            ProposalChange::Add(add) => add.guarantee.target,
            ProposalChange::Remove(remove) => remove.target,
        }
    }
}

/// A proposal signed by one party over the ledger state that results from applying it at
/// `turn_num`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedProposal {
    pub proposal: Proposal,
    pub turn_num: u64,
    pub signature: Signature,
}

/// The mutable consensus data: a turn number and the outcome agreed at that turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vars {
    pub turn_num: u64,
    pub outcome: LedgerOutcome,
}

impl Vars {
    /// Applies `proposal`, advancing the turn number. Fails on duplicate or missing targets
    /// and on balances that cannot fund the change; the receiver is left partially advanced
    /// only on error paths the caller discards.
    pub fn handle_proposal(&mut self, proposal: &Proposal) -> Result<()> {
        self.turn_num += 1;
        match &proposal.change {
            ProposalChange::Add(add) => self.add(add),
            ProposalChange::Remove(remove) => self.remove(remove),
        }
    }

    fn add(&mut self, add: &Add) -> Result<()> {
        let guarantee = &add.guarantee;
        if self.outcome.guarantees.contains_key(&guarantee.target) {
            bail!("duplicate guarantee for target {}", guarantee.target);
        }
        if add.left_deposit > guarantee.amount {
            bail!("left deposit exceeds the guarantee amount");
        }
        let right_deposit = guarantee.amount - add.left_deposit;

        self.outcome.leader.amount = self
            .outcome
            .leader
            .amount
            .checked_sub(add.left_deposit)
            .ok_or_else(|| anyhow!("leader cannot afford the deposit"))?;
        self.outcome.follower.amount = self
            .outcome
            .follower
            .amount
            .checked_sub(right_deposit)
            .ok_or_else(|| anyhow!("follower cannot afford the deposit"))?;
        self.outcome
            .guarantees
            .insert(guarantee.target, guarantee.clone());
        Ok(())
    }

    fn remove(&mut self, remove: &Remove) -> Result<()> {
        let guarantee = self
            .outcome
            .guarantees
            .remove(&remove.target)
            .ok_or_else(|| anyhow!("no guarantee found for target {}", remove.target))?;
        if remove.left_amount > guarantee.amount {
            bail!("left amount exceeds the guarantee amount");
        }
        let right_amount = guarantee.amount - remove.left_amount;

        self.outcome.leader.amount = self.outcome.leader.amount.saturating_add(remove.left_amount);
        self.outcome.follower.amount = self.outcome.follower.amount.saturating_add(right_amount);
        Ok(())
    }

    /// Renders the consensus data as a full channel state under the given fixed part, the
    /// form both parties actually sign.
    pub fn as_state(&self, fixed: &FixedPart) -> State {
        State {
            participants: fixed.participants.clone(),
            channel_nonce: fixed.channel_nonce,
            app_definition: fixed.app_definition,
            challenge_duration: fixed.challenge_duration,
            app_data: Vec::new(),
            outcome: self.outcome.as_exit(),
            turn_num: self.turn_num,
            is_final: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedVars {
    pub vars: Vars,
    /// Leader's then follower's signature over `vars` rendered as a state.
    pub signatures: [Signature; 2],
}

/// A two-party ledger channel restricted to leader-proposed, follower-accepted updates of a
/// single consensus outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusChannel {
    pub id: Destination,
    pub my_index: usize,
    pub on_chain_funding: Funds,
    fp: FixedPart,
    current: SignedVars,
    proposal_queue: Vec<SignedProposal>,
}

impl ConsensusChannel {
    fn new(
        fp: FixedPart,
        my_index: usize,
        turn_num: u64,
        outcome: LedgerOutcome,
        signatures: [Signature; 2],
    ) -> Result<ConsensusChannel> {
        fp.validate()?;
        if fp.participants.len() != 2 {
            bail!("a consensus channel has exactly two participants");
        }

        let vars = Vars { turn_num, outcome };
        let state = vars.as_state(&fp);
        for (index, signature) in signatures.iter().enumerate() {
            let signer = state.recover_signer(signature)?;
            if signer != fp.participants[index] {
                bail!(
                    "signature {index} recovers to {signer}, not participant {}",
                    fp.participants[index]
                );
            }
        }

        Ok(ConsensusChannel {
            id: fp.channel_id(),
            my_index,
            on_chain_funding: Funds::new(),
            fp,
            current: SignedVars { vars, signatures },
            proposal_queue: Vec::new(),
        })
    }

    pub fn new_leader_channel(
        fp: FixedPart,
        turn_num: u64,
        outcome: LedgerOutcome,
        signatures: [Signature; 2],
    ) -> Result<ConsensusChannel> {
        Self::new(fp, LEADER_INDEX, turn_num, outcome, signatures)
    }

    pub fn new_follower_channel(
        fp: FixedPart,
        turn_num: u64,
        outcome: LedgerOutcome,
        signatures: [Signature; 2],
    ) -> Result<ConsensusChannel> {
        Self::new(fp, FOLLOWER_INDEX, turn_num, outcome, signatures)
    }

    /// A stub carrying only an id, produced when deserializing an objective's lossy JSON
    /// projection; the store re-attaches full ledger data on rehydration.
    pub fn stub(id: Destination) -> ConsensusChannel {
        ConsensusChannel {
            id,
            my_index: LEADER_INDEX,
            on_chain_funding: Funds::new(),
            fp: FixedPart::default(),
            current: SignedVars {
                vars: Vars {
                    turn_num: 0,
                    outcome: LedgerOutcome::new(
                        Address::ZERO,
                        Balance {
                            destination: Destination::ZERO,
                            amount: U256::ZERO,
                        },
                        Balance {
                            destination: Destination::ZERO,
                            amount: U256::ZERO,
                        },
                    ),
                },
                signatures: [Signature::default(), Signature::default()],
            },
            proposal_queue: Vec::new(),
        }
    }

    pub fn is_leader(&self) -> bool {
        self.my_index == LEADER_INDEX
    }

    pub fn is_follower(&self) -> bool {
        self.my_index == FOLLOWER_INDEX
    }

    pub fn leader(&self) -> Address {
        self.fp.participants[LEADER_INDEX]
    }

    pub fn follower(&self) -> Address {
        self.fp.participants[FOLLOWER_INDEX]
    }

    pub fn my_address(&self) -> Address {
        self.fp.participants[self.my_index]
    }

    pub fn fixed_part(&self) -> &FixedPart {
        &self.fp
    }

    /// The latest consensus data, signed by both parties.
    pub fn consensus_vars(&self) -> &Vars {
        &self.current.vars
    }

    pub fn consensus_turn_num(&self) -> u64 {
        self.current.vars.turn_num
    }

    /// The outstanding proposals, in turn order. The leader sends this whole queue so a
    /// follower can catch up from a single message.
    pub fn proposal_queue(&self) -> &[SignedProposal] {
        &self.proposal_queue
    }

    /// True until the guarantee funding `target` has actually been removed from the
    /// consensus outcome.
    pub fn includes_target(&self, target: Destination) -> bool {
        self.current.vars.outcome.includes_target(target)
    }

    /// The channels currently funded by this ledger.
    pub fn funding_targets(&self) -> Vec<Destination> {
        self.current.vars.outcome.funding_targets()
    }

    /// Whether a removal for `target` sits anywhere in the proposal queue.
    pub fn has_removal_been_proposed(&self, target: Destination) -> bool {
        self.proposal_queue.iter().any(|sp| {
            matches!(&sp.proposal.change, ProposalChange::Remove(r) if r.target == target)
        })
    }

    /// Whether a removal for `target` is the next proposal to be countersigned.
    pub fn has_removal_been_proposed_next(&self, target: Destination) -> bool {
        self.proposal_queue.first().is_some_and(|sp| {
            matches!(&sp.proposal.change, ProposalChange::Remove(r) if r.target == target)
        })
    }

    /// The consensus state as a fully-signed [`SignedState`].
    pub fn supported_signed_state(&self) -> SignedState {
        let mut ss = SignedState::new(self.current.vars.as_state(&self.fp));
        for signature in &self.current.signatures {
            // Signatures were verified against the participants on construction and on every
            // consensus update, so re-attribution cannot fail.
            ss.add_signature(*signature)
                .expect("consensus signatures are valid by construction");
        }
        ss
    }

    fn latest_proposed_vars(&self) -> Result<Vars> {
        let mut vars = self.current.vars.clone();
        for sp in &self.proposal_queue {
            vars.handle_proposal(&sp.proposal)?;
        }
        Ok(vars)
    }

    fn sign_vars(&self, vars: &Vars, key: &SecretKey) -> Result<Signature> {
        vars.as_state(&self.fp).sign(key)
    }

    /// Leader only: applies `proposal` on top of everything already proposed, signs the
    /// result at the next turn number and appends it to the queue.
    pub fn propose(&mut self, proposal: Proposal, key: &SecretKey) -> Result<SignedProposal> {
        if !self.is_leader() {
            bail!("only the leader may propose");
        }
        if proposal.ledger_id != self.id {
            bail!("proposal is addressed to ledger {}, not {}", proposal.ledger_id, self.id);
        }

        let mut vars = self.latest_proposed_vars()?;
        vars.handle_proposal(&proposal)?;
        let signature = self.sign_vars(&vars, key)?;
        let signed = SignedProposal {
            proposal,
            turn_num: vars.turn_num,
            signature,
        };
        trace!(ledger = %self.id, turn = signed.turn_num, "proposed ledger update");
        self.proposal_queue.push(signed.clone());
        Ok(signed)
    }

    /// Incorporates a signed proposal from the counterparty. For a follower this validates
    /// and enqueues a leader proposal; for a leader it folds in the follower's
    /// countersignature, advancing consensus. Either way, a turn number that is not the
    /// expected successor fails with [`InvalidTurnNum`].
    pub fn receive(&mut self, sp: SignedProposal) -> Result<()> {
        if sp.proposal.ledger_id != self.id {
            bail!("proposal is addressed to ledger {}, not {}", sp.proposal.ledger_id, self.id);
        }
        if self.is_follower() {
            self.follower_receive(sp)
        } else {
            self.leader_receive(sp)
        }
    }

    fn follower_receive(&mut self, sp: SignedProposal) -> Result<()> {
        let expected = self
            .proposal_queue
            .last()
            .map(|last| last.turn_num + 1)
            .unwrap_or(self.current.vars.turn_num + 1);
        if sp.turn_num != expected {
            return Err(InvalidTurnNum.into());
        }

        let mut vars = self.latest_proposed_vars()?;
        vars.handle_proposal(&sp.proposal)?;
        let signer = vars.as_state(&self.fp).recover_signer(&sp.signature)?;
        if signer != self.leader() {
            bail!("proposal signed by {signer}, not the leader {}", self.leader());
        }

        trace!(ledger = %self.id, turn = sp.turn_num, "enqueued leader proposal");
        self.proposal_queue.push(sp);
        Ok(())
    }

    fn leader_receive(&mut self, sp: SignedProposal) -> Result<()> {
        if sp.turn_num <= self.current.vars.turn_num {
            return Err(InvalidTurnNum.into());
        }
        let Some(position) = self
            .proposal_queue
            .iter()
            .position(|queued| queued.turn_num == sp.turn_num)
        else {
            return Err(InvalidTurnNum.into());
        };
        if self.proposal_queue[position].proposal != sp.proposal {
            bail!("countersigned proposal does not match the proposal at turn {}", sp.turn_num);
        }

        let mut vars = self.current.vars.clone();
        for queued in &self.proposal_queue[..=position] {
            vars.handle_proposal(&queued.proposal)?;
        }
        let signer = vars.as_state(&self.fp).recover_signer(&sp.signature)?;
        if signer != self.follower() {
            bail!("countersignature from {signer}, not the follower {}", self.follower());
        }

        let leader_signature = self.proposal_queue[position].signature;
        self.current = SignedVars {
            vars,
            signatures: [leader_signature, sp.signature],
        };
        self.proposal_queue.drain(..=position);
        trace!(ledger = %self.id, turn = self.current.vars.turn_num, "consensus advanced");
        Ok(())
    }

    /// Follower only: countersigns the proposal at the front of the queue, which must match
    /// `expected`, advancing consensus to it.
    pub fn sign_next_proposal(
        &mut self,
        expected: &Proposal,
        key: &SecretKey,
    ) -> Result<SignedProposal> {
        if !self.is_follower() {
            bail!("only the follower countersigns proposals");
        }
        let Some(first) = self.proposal_queue.first().cloned() else {
            bail!("no proposals are queued");
        };
        if first.proposal != *expected {
            bail!("next queued proposal does not match the expected proposal");
        }

        let mut vars = self.current.vars.clone();
        vars.handle_proposal(&first.proposal)?;
        if vars.turn_num != first.turn_num {
            return Err(InvalidTurnNum.into());
        }
        let signature = self.sign_vars(&vars, key)?;
        self.current = SignedVars {
            vars,
            signatures: [first.signature, signature],
        };
        self.proposal_queue.remove(0);
        trace!(ledger = %self.id, turn = first.turn_num, "countersigned proposal");
        Ok(SignedProposal {
            proposal: first.proposal,
            turn_num: first.turn_num,
            signature,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SecretKey;

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

    fn channel_pair() -> (ConsensusChannel, ConsensusChannel) {
        let (leader_key, follower_key) = keys();
        let fp = FixedPart {
            participants: vec![leader_key.address(), follower_key.address()],
            channel_nonce: 1,
            app_definition: Address::ZERO,
            challenge_duration: 100,
        };
        let outcome = LedgerOutcome::new(
            Address::ZERO,
            Balance {
                destination: Destination::from_address(leader_key.address()),
                amount: U256::from(100),
            },
            Balance {
                destination: Destination::from_address(follower_key.address()),
                amount: U256::from(100),
            },
        );
        let vars = Vars {
            turn_num: 1,
            outcome: outcome.clone(),
        };
        let state = vars.as_state(&fp);
        let signatures = [
            state.sign(&leader_key).unwrap(),
            state.sign(&follower_key).unwrap(),
        ];

        let leader =
            ConsensusChannel::new_leader_channel(fp.clone(), 1, outcome.clone(), signatures)
                .unwrap();
        let follower =
            ConsensusChannel::new_follower_channel(fp, 1, outcome, signatures).unwrap();
        (leader, follower)
    }

    fn guarantee_for(target: Destination, leader: &ConsensusChannel) -> Guarantee {
        Guarantee {
            amount: U256::from(20),
            target,
            left: leader.consensus_vars().outcome.leader.destination,
            right: leader.consensus_vars().outcome.follower.destination,
        }
    }

    #[test]
    fn propose_and_countersign_converge() {
        let (mut leader, mut follower) = channel_pair();
        let (leader_key, follower_key) = keys();
        let target = Destination(alloy::primitives::B256::repeat_byte(7));

        let proposal =
            Proposal::new_add(leader.id, guarantee_for(target, &leader), U256::from(10));
        leader.propose(proposal.clone(), &leader_key).unwrap();
        assert!(!leader.has_removal_been_proposed(target));

        // Serialize the queue and hand it to the follower, as the engine would.
        let wire = serde_json::to_vec(&leader.proposal_queue().to_vec()).unwrap();
        let queue: Vec<SignedProposal> = serde_json::from_slice(&wire).unwrap();
        for sp in queue {
            follower.receive(sp).unwrap();
        }

        let countersigned = follower.sign_next_proposal(&proposal, &follower_key).unwrap();
        leader.receive(countersigned).unwrap();

        assert_eq!(leader.consensus_vars(), follower.consensus_vars());
        assert_eq!(leader.consensus_turn_num(), 2);
        assert!(leader.includes_target(target));
        assert_eq!(
            leader.consensus_vars().outcome.leader.amount,
            U256::from(90)
        );
        assert_eq!(
            leader.consensus_vars().outcome.follower.amount,
            U256::from(90)
        );
        assert!(leader.proposal_queue().is_empty());
        assert!(follower.proposal_queue().is_empty());
    }

    #[test]
    fn stale_proposal_is_rejected_without_changing_consensus() {
        let (mut leader, mut follower) = channel_pair();
        let (leader_key, follower_key) = keys();
        let target = Destination(alloy::primitives::B256::repeat_byte(7));

        let proposal =
            Proposal::new_add(leader.id, guarantee_for(target, &leader), U256::from(10));
        let signed = leader.propose(proposal.clone(), &leader_key).unwrap();
        follower.receive(signed.clone()).unwrap();
        let countersigned = follower.sign_next_proposal(&proposal, &follower_key).unwrap();
        leader.receive(countersigned).unwrap();

        // Duplicate network delivery of the already-accepted proposal.
        let before = serde_json::to_vec(follower.consensus_vars()).unwrap();
        let err = follower.receive(signed).unwrap_err();
        assert!(err.downcast_ref::<InvalidTurnNum>().is_some());
        let after = serde_json::to_vec(follower.consensus_vars()).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn out_of_order_proposal_is_rejected() {
        let (mut leader, mut follower) = channel_pair();
        let (leader_key, _) = keys();
        let target_a = Destination(alloy::primitives::B256::repeat_byte(7));
        let target_b = Destination(alloy::primitives::B256::repeat_byte(8));

        leader
            .propose(
                Proposal::new_add(leader.id, guarantee_for(target_a, &leader), U256::from(10)),
                &leader_key,
            )
            .unwrap();
        let second = leader
            .propose(
                Proposal::new_add(leader.id, guarantee_for(target_b, &leader), U256::from(10)),
                &leader_key,
            )
            .unwrap();

        // The follower sees only the second proposal: its turn number skips ahead.
        let err = follower.receive(second).unwrap_err();
        assert!(err.downcast_ref::<InvalidTurnNum>().is_some());
        assert!(follower.proposal_queue().is_empty());
    }

    #[test]
    fn removal_restores_balances() {
        let (mut leader, mut follower) = channel_pair();
        let (leader_key, follower_key) = keys();
        let target = Destination(alloy::primitives::B256::repeat_byte(7));

        let add = Proposal::new_add(leader.id, guarantee_for(target, &leader), U256::from(10));
        let signed = leader.propose(add.clone(), &leader_key).unwrap();
        follower.receive(signed).unwrap();
        leader
            .receive(follower.sign_next_proposal(&add, &follower_key).unwrap())
            .unwrap();

        let remove = Proposal::new_remove(leader.id, target, U256::from(10));
        assert!(!leader.has_removal_been_proposed(target));
        let signed = leader.propose(remove.clone(), &leader_key).unwrap();
        assert!(leader.has_removal_been_proposed(target));
        follower.receive(signed).unwrap();
        assert!(follower.has_removal_been_proposed_next(target));
        leader
            .receive(follower.sign_next_proposal(&remove, &follower_key).unwrap())
            .unwrap();

        assert!(!leader.includes_target(target));
        assert_eq!(
            leader.consensus_vars().outcome.leader.amount,
            U256::from(100)
        );
        assert_eq!(
            leader.consensus_vars().outcome.follower.amount,
            U256::from(100)
        );
        assert_eq!(leader.consensus_vars(), follower.consensus_vars());
    }

    #[test]
    fn follower_catches_up_from_full_queue_resend() {
        let (mut leader, mut follower) = channel_pair();
        let (leader_key, _) = keys();
        let target_a = Destination(alloy::primitives::B256::repeat_byte(7));
        let target_b = Destination(alloy::primitives::B256::repeat_byte(8));

        leader
            .propose(
                Proposal::new_add(leader.id, guarantee_for(target_a, &leader), U256::from(10)),
                &leader_key,
            )
            .unwrap();
        leader
            .propose(
                Proposal::new_add(leader.id, guarantee_for(target_b, &leader), U256::from(10)),
                &leader_key,
            )
            .unwrap();

        // The first message was lost; the leader's resend carries the whole queue.
        for sp in leader.proposal_queue().to_vec() {
            follower.receive(sp).unwrap();
        }
        assert_eq!(follower.proposal_queue().len(), 2);
    }
}
