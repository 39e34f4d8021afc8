//! Defunds a directly-funded ledger channel.
//!
//! The cooperative path finalizes the channel off chain and withdraws everything in one
//! transaction. When the counterparty stops responding, liveness is preserved by escalating
//! to the chain: challenge the latest supported state (and any dependent channels riding on
//! the ledger), wait for finalization, then liquidate.

use std::{collections::BTreeMap, error::Error, fmt::Display};

use anyhow::{Result, anyhow, bail};
use serde::{Deserialize, Serialize, Serializer, de};

use crate::{
    channel::{Channel, ChannelMode},
    consensus_channel::ConsensusChannel,
    crypto::SecretKey,
    protocols::{
        ChainTransaction, NotApproved, ObjectiveId, ObjectivePayload, ObjectiveStatus,
        PayloadType, SideEffects, StartSignal, Storable, WaitingFor,
        create_objective_payload_message, create_rejection_notice_message,
        sign_challenge_message,
    },
    state::{SignedState, State},
    types::{Address, Destination},
};

pub const OBJECTIVE_PREFIX: &str = "DirectDefunding-";

pub const WAITING_FOR_FINALIZATION: WaitingFor = WaitingFor("WaitingForFinalization");
pub const WAITING_FOR_WITHDRAW: WaitingFor = WaitingFor("WaitingForWithdraw");
pub const WAITING_FOR_CHALLENGE: WaitingFor = WaitingFor("WaitingForChallenge");
pub const WAITING_FOR_CHALLENGE_CLEARED: WaitingFor = WaitingFor("WaitingForChallengeCleared");
pub const WAITING_FOR_NOTHING: WaitingFor = WaitingFor("WaitingForNothing");

/// A channel can only be defunded when its latest state is supported or final.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelUpdateInProgress;

impl Display for ChannelUpdateInProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "can only defund a channel when the latest state is supported or when the channel has a final state"
        )
    }
}

impl Error for ChannelUpdateInProgress {}

/// The ledger still has guarantees funding dependent channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerNotEmpty;

impl Display for LedgerNotEmpty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ledger channel has running guarantees")
    }
}

impl Error for LedgerNotEmpty {}

/// A defund objective can only be constructed from a final state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NoFinalState;

impl Display for NoFinalState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cannot spawn direct defund objective without a final state")
    }
}

impl Error for NoFinalState {}

#[derive(Debug, Clone, PartialEq)]
pub struct Objective {
    pub status: ObjectiveStatus,
    pub c: Channel,
    final_turn_num: u64,

    /// Whether a withdraw transaction has been declared as a side effect in a previous crank.
    withdraw_transaction_submitted: bool,

    pub is_challenge: bool,
    challenge_transaction_submitted: bool,
    virtual_channel_challenge_submitted: bool,

    pub is_checkpoint: bool,
    checkpoint_transaction_submitted: bool,

    /// Dependent channels still funded by a guarantee in the ledger, challenged alongside it.
    pub funded_channels: BTreeMap<Destination, Channel>,
}

/// Returns true if the channel has a final state or its latest signed state is the supported
/// one.
fn is_in_consensus_or_final_state(c: &Channel) -> Result<bool> {
    let latest = match c.latest_signed_state() {
        // There are no signed states. We consider this as consensus.
        Err(_) => return Ok(true),
        Ok(latest) => latest,
    };
    if latest.state().is_final {
        return Ok(true);
    }
    let latest_supported = c.latest_supported_state()?;
    Ok(*latest.state() == latest_supported)
}

/// Initiates an objective for the ledger behind `request.channel_id`. Fails if the ledger
/// still funds dependent channels (unless an on-chain challenge forces the issue) or has an
/// update in progress.
pub fn new_objective(
    request: &ObjectiveRequest,
    pre_approve: bool,
    get_consensus_channel: impl Fn(Destination) -> Result<ConsensusChannel>,
    get_channel_by_id: impl Fn(Destination) -> Option<Channel>,
    is_on_chain_challenge_registered: bool,
) -> Result<Objective> {
    let cc = get_consensus_channel(request.channel_id)
        .map_err(|e| anyhow!("could not find channel {}: {e}", request.channel_id))?;

    let c = Channel::from_consensus_channel(&cc)
        .map_err(|e| anyhow!("could not create channel from consensus channel: {e}"))?;

    // Disallow creating an objective if the channel has an in-progress update. Final states
    // are allowed, since only defunding adds them.
    if !is_in_consensus_or_final_state(&c)? {
        return Err(ChannelUpdateInProgress.into());
    }

    let mut funded_channels = BTreeMap::new();
    let funding_targets = cc.funding_targets();
    if !funding_targets.is_empty() {
        if !request.is_challenge && !is_on_chain_challenge_registered {
            return Err(LedgerNotEmpty.into());
        }
        for target in funding_targets {
            if let Some(channel) = get_channel_by_id(target) {
                funded_channels.insert(target, channel);
            }
        }
    }

    let latest_supported = c.latest_supported_state()?;
    let final_turn_num = if latest_supported.is_final {
        latest_supported.turn_num
    } else {
        latest_supported.turn_num + 1
    };

    Ok(Objective {
        status: if pre_approve {
            ObjectiveStatus::Approved
        } else {
            ObjectiveStatus::Unapproved
        },
        c,
        final_turn_num,
        withdraw_transaction_submitted: false,
        is_challenge: request.is_challenge,
        challenge_transaction_submitted: false,
        virtual_channel_challenge_submitted: false,
        is_checkpoint: request.is_checkpoint,
        checkpoint_transaction_submitted: false,
        funded_channels,
    })
}

/// Constructs an objective from an inbound final-state payload.
pub fn construct_objective_from_payload(
    payload: &ObjectivePayload,
    pre_approve: bool,
    get_consensus_channel: impl Fn(Destination) -> Result<ConsensusChannel>,
    get_channel_by_id: impl Fn(Destination) -> Option<Channel>,
) -> Result<Objective> {
    let ss = get_signed_state_payload(&payload.payload_data)?;
    let state = ss.state();

    // Implicit in the wire protocol is that the message signalling closure of a channel
    // carries a final state.
    if !state.is_final {
        return Err(NoFinalState.into());
    }
    state.fixed_part().validate()?;

    let request = ObjectiveRequest::new(state.channel_id(), false);
    new_objective(
        &request,
        pre_approve,
        get_consensus_channel,
        get_channel_by_id,
        request.is_challenge,
    )
}

impl Objective {
    pub fn id(&self) -> ObjectiveId {
        format!("{OBJECTIVE_PREFIX}{}", self.c.id)
    }

    pub fn owns_channel(&self) -> Destination {
        self.c.id
    }

    pub fn approve(&self) -> Objective {
        let mut updated = self.clone();
        updated.status = ObjectiveStatus::Approved;
        updated
    }

    pub fn reject(&self) -> (Objective, SideEffects) {
        let mut updated = self.clone();
        updated.status = ObjectiveStatus::Rejected;
        let peer = self.c.participants()[1 - self.c.my_index];
        let effects = SideEffects {
            messages_to_send: create_rejection_notice_message(self.id(), &[peer]),
            ..SideEffects::default()
        };
        (updated, effects)
    }

    pub fn related(&self) -> Vec<Storable> {
        vec![Storable::Channel(self.c.clone())]
    }

    /// Applies an inbound final state. Only final states at the agreed turn number are
    /// accepted.
    pub fn update(&self, payload: &ObjectivePayload) -> Result<Objective> {
        if self.id() != payload.objective_id {
            bail!(
                "event and objective ids do not match: {} and {} respectively",
                payload.objective_id,
                self.id()
            );
        }
        let ss = get_signed_state_payload(&payload.payload_data)?;
        if ss.signature_count() == 0 {
            bail!("event does not contain a signed state");
        }
        if !ss.state().is_final {
            bail!("direct defund objective can only be updated with final states");
        }
        if self.final_turn_num != ss.state().turn_num {
            bail!(
                "expected state with turn number {}, received turn number {}",
                self.final_turn_num,
                ss.state().turn_num
            );
        }

        let mut updated = self.clone();
        updated.c.add_signed_state(ss);
        Ok(updated)
    }

    /// Inspects the extended state and declares a list of effects to be executed.
    pub fn crank(&self, key: &SecretKey) -> Result<(Objective, SideEffects, WaitingFor)> {
        let updated = self.clone();
        let side_effects = SideEffects::default();

        if updated.status != ObjectiveStatus::Approved {
            return Err(NotApproved.into());
        }

        if updated.is_challenge
            || updated.is_checkpoint
            || updated.c.on_chain.channel_mode != ChannelMode::Open
        {
            self.crank_with_challenge(updated, side_effects, key)
        } else {
            self.crank_cooperative(updated, side_effects, key)
        }
    }

    fn crank_with_challenge(
        &self,
        mut updated: Objective,
        mut side_effects: SideEffects,
        key: &SecretKey,
    ) -> Result<(Objective, SideEffects, WaitingFor)> {
        // Challenge every dependent channel before the ledger itself, so their outcomes
        // finalize and can be folded into the liquidation.
        if updated.is_challenge
            && !updated.funded_channels.is_empty()
            && !updated.virtual_channel_challenge_submitted
        {
            for channel in updated.funded_channels.values() {
                let candidate = channel.latest_supported_signed_state()?;
                let challenger_sig = sign_challenge_message(candidate.state(), key)?;
                side_effects
                    .transactions_to_submit
                    .push(ChainTransaction::Challenge {
                        channel_id: channel.id,
                        candidate,
                        proof: Vec::new(),
                        challenger_sig,
                    });
            }
            updated.virtual_channel_challenge_submitted = true;
            return Ok((updated, side_effects, WAITING_FOR_CHALLENGE));
        }

        // Wait until every dependent channel's challenge has registered on chain.
        if updated.is_challenge
            && !updated.funded_channels.is_empty()
            && updated
                .funded_channels
                .values()
                .any(|c| c.on_chain.channel_mode == ChannelMode::Open)
        {
            return Ok((updated, side_effects, WAITING_FOR_CHALLENGE));
        }

        if updated.is_challenge && !updated.challenge_transaction_submitted {
            let candidate = updated.c.latest_supported_signed_state()?;
            let challenger_sig = sign_challenge_message(candidate.state(), key)?;
            side_effects
                .transactions_to_submit
                .push(ChainTransaction::Challenge {
                    channel_id: updated.c.id,
                    candidate,
                    proof: Vec::new(),
                    challenger_sig,
                });
            updated.challenge_transaction_submitted = true;
            return Ok((updated, side_effects, WAITING_FOR_CHALLENGE));
        }

        if updated.is_checkpoint && !updated.checkpoint_transaction_submitted {
            let candidate = updated.c.latest_supported_signed_state()?;
            side_effects
                .transactions_to_submit
                .push(ChainTransaction::Checkpoint {
                    channel_id: updated.c.id,
                    candidate,
                    proof: Vec::new(),
                });
            updated.checkpoint_transaction_submitted = true;
            return Ok((updated, side_effects, WAITING_FOR_CHALLENGE_CLEARED));
        }

        // Wait for the channel to finalize.
        if updated.c.on_chain.channel_mode == ChannelMode::Challenge {
            return Ok((updated, side_effects, WAITING_FOR_FINALIZATION));
        }

        // Liquidate the finalized outcome, folding the finalized outcomes of dependent
        // channels back into the parties' allocations.
        if updated.is_challenge
            && updated.c.on_chain.channel_mode == ChannelMode::Finalized
            && !updated.withdraw_transaction_submitted
            && !updated.c.fully_withdrawn()
        {
            let signed_state = if updated.funded_channels.is_empty() {
                updated.c.latest_supported_signed_state()?
            } else {
                SignedState::new(updated.settlement_state()?)
            };
            side_effects
                .transactions_to_submit
                .push(ChainTransaction::TransferAll {
                    channel_id: updated.c.id,
                    signed_state,
                });
            updated.withdraw_transaction_submitted = true;
            return Ok((updated, side_effects, WAITING_FOR_WITHDRAW));
        }

        // Complete after asset liquidation.
        if updated.c.on_chain.channel_mode == ChannelMode::Finalized
            && updated.c.fully_withdrawn()
        {
            updated.status = ObjectiveStatus::Completed;
            return Ok((updated, side_effects, WAITING_FOR_NOTHING));
        }

        // Complete once a checkpoint has cleared the challenge.
        if updated.c.on_chain.channel_mode == ChannelMode::Open {
            updated.status = ObjectiveStatus::Completed;
            return Ok((updated, side_effects, WAITING_FOR_NOTHING));
        }

        // The non-challenging party just waits for the withdrawal.
        if updated.c.on_chain.channel_mode == ChannelMode::Finalized {
            return Ok((updated, side_effects, WAITING_FOR_WITHDRAW));
        }

        bail!("objective {} in invalid state", updated.id());
    }

    /// The ledger's latest supported outcome with each dependent channel's finalized
    /// allocations folded back into the matching party balances.
    fn settlement_state(&self) -> Result<State> {
        let mut state = self.c.latest_supported_state()?;
        let [asset_exit] = state.outcome.0.as_mut_slice() else {
            bail!("expected a single-asset ledger outcome");
        };
        let (mut alice, mut bob) = match asset_exit.allocations.as_slice() {
            [a, b, ..] => (a.clone(), b.clone()),
            _ => bail!("expected at least two ledger allocations"),
        };

        for channel in self.funded_channels.values() {
            let latest = channel.latest_signed_state()?;
            for allocation in latest
                .state()
                .outcome
                .0
                .first()
                .map(|e| e.allocations.as_slice())
                .unwrap_or_default()
            {
                if alice.destination == allocation.destination {
                    alice.amount = alice.amount.saturating_add(allocation.amount);
                }
                if bob.destination == allocation.destination {
                    bob.amount = bob.amount.saturating_add(allocation.amount);
                }
            }
        }

        asset_exit.allocations = vec![alice, bob];
        Ok(state)
    }

    fn crank_cooperative(
        &self,
        mut updated: Objective,
        mut side_effects: SideEffects,
        key: &SecretKey,
    ) -> Result<(Objective, SideEffects, WaitingFor)> {
        let latest_signed_state = updated.c.latest_signed_state().map_err(|_| {
            anyhow!("the channel must contain at least one signed state to crank the defund objective")
        })?;

        // Sign a final state if no supported final state exists yet.
        if !latest_signed_state.state().is_final
            || !latest_signed_state.has_signature_for(updated.c.my_index)
        {
            let mut state_to_sign = latest_signed_state.state().clone();
            if !state_to_sign.is_final {
                state_to_sign.turn_num += 1;
                state_to_sign.is_final = true;
            }
            let ss = updated
                .c
                .sign_and_add_state(state_to_sign, key)
                .map_err(|e| anyhow!("could not sign final state: {e}"))?;
            let messages = create_objective_payload_message(
                updated.id(),
                &ss,
                PayloadType::SignedState,
                &updated.other_participants(),
            )?;
            side_effects.messages_to_send.extend(messages);
        }

        let latest_supported = updated
            .c
            .latest_supported_state()
            .map_err(|e| anyhow!("error finding a supported state: {e}"))?;
        if !latest_supported.is_final {
            return Ok((updated, side_effects, WAITING_FOR_FINALIZATION));
        }

        // Withdrawal of funds.
        if !updated.c.fully_withdrawn() {
            // The first participant in the channel submits the withdraw-all transaction.
            if updated.c.my_index == 0 && !updated.withdraw_transaction_submitted {
                let signed_state = updated.c.latest_supported_signed_state()?;
                side_effects
                    .transactions_to_submit
                    .push(ChainTransaction::WithdrawAll {
                        channel_id: updated.c.id,
                        signed_state,
                    });
                updated.withdraw_transaction_submitted = true;
            }
            // Every participant waits for all channel funds to be distributed, even with no
            // funds of their own in the channel.
            return Ok((updated, side_effects, WAITING_FOR_WITHDRAW));
        }

        updated.status = ObjectiveStatus::Completed;
        Ok((updated, side_effects, WAITING_FOR_NOTHING))
    }

    fn other_participants(&self) -> Vec<Address> {
        self.c
            .participants()
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != self.c.my_index)
            .map(|(_, p)| *p)
            .collect()
    }
}

/// Inspects an objective id and returns true if it belongs to a direct defund objective.
pub fn is_direct_defund_objective(id: &ObjectiveId) -> bool {
    id.starts_with(OBJECTIVE_PREFIX)
}

#[derive(Serialize, Deserialize)]
struct JsonObjective {
    status: ObjectiveStatus,
    c: Destination,
    final_turn_num: u64,
    withdraw_transaction_submitted: bool,
    is_challenge: bool,
    challenge_transaction_submitted: bool,
    virtual_channel_challenge_submitted: bool,
    is_checkpoint: bool,
    checkpoint_transaction_submitted: bool,
    funded_channels: BTreeMap<Destination, Channel>,
}

impl Serialize for Objective {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        JsonObjective {
            status: self.status,
            c: self.c.id,
            final_turn_num: self.final_turn_num,
            withdraw_transaction_submitted: self.withdraw_transaction_submitted,
            is_challenge: self.is_challenge,
            challenge_transaction_submitted: self.challenge_transaction_submitted,
            virtual_channel_challenge_submitted: self.virtual_channel_challenge_submitted,
            is_checkpoint: self.is_checkpoint,
            checkpoint_transaction_submitted: self.checkpoint_transaction_submitted,
            funded_channels: self.funded_channels.clone(),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Objective {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: de::Deserializer<'de>,
    {
        let json = JsonObjective::deserialize(deserializer)?;
        Ok(Objective {
            status: json.status,
            c: Channel::stub(json.c),
            final_turn_num: json.final_turn_num,
            withdraw_transaction_submitted: json.withdraw_transaction_submitted,
            is_challenge: json.is_challenge,
            challenge_transaction_submitted: json.challenge_transaction_submitted,
            virtual_channel_challenge_submitted: json.virtual_channel_challenge_submitted,
            is_checkpoint: json.is_checkpoint,
            checkpoint_transaction_submitted: json.checkpoint_transaction_submitted,
            funded_channels: json.funded_channels,
        })
    }
}

/// A request to create a new direct defund objective.
#[derive(Debug)]
pub struct ObjectiveRequest {
    pub channel_id: Destination,
    pub is_challenge: bool,
    pub is_checkpoint: bool,
    pub objective_started: StartSignal,
}

impl ObjectiveRequest {
    pub fn new(channel_id: Destination, is_challenge: bool) -> ObjectiveRequest {
        ObjectiveRequest {
            channel_id,
            is_challenge,
            is_checkpoint: false,
            objective_started: StartSignal::new(),
        }
    }

    pub fn id(&self) -> ObjectiveId {
        format!("{OBJECTIVE_PREFIX}{}", self.channel_id)
    }
}

fn get_signed_state_payload(bytes: &[u8]) -> Result<SignedState> {
    serde_json::from_slice(bytes).map_err(|e| anyhow!("could not unmarshal signed state: {e}"))
}
