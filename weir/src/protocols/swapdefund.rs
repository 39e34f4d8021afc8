//! Defunds a swap channel running between Alice (participant 0), any number of
//! intermediaries, and Bob (the last participant).
//!
//! Only Alice knows the authoritative final outcome, so everyone else first requests the
//! final state from her. Once the final state is signed by all participants, each adjacent
//! pair removes the guarantee funding the swap channel from their shared ledger via the
//! leader/follower proposal protocol; the objective completes when neither adjacent ledger
//! still targets the swap channel.

use anyhow::{Result, anyhow, bail};
use serde::{Deserialize, Serialize, Serializer, de};
use tracing::debug;

use crate::{
    channel::SwapChannel,
    consensus_channel::{ConsensusChannel, InvalidTurnNum, Proposal, SignedProposal},
    crypto::SecretKey,
    protocols::{
        NotApproved, ObjectiveId, ObjectivePayload, ObjectiveStatus, PayloadType, SideEffects,
        StartSignal, Storable, WaitingFor, create_objective_payload_message,
        create_rejection_notice_message, create_signed_proposal_message,
    },
    state::{SignedState, State, VariablePart},
    types::{Address, Destination},
};

pub const OBJECTIVE_PREFIX: &str = "SwapDefund-";

pub const WAITING_FOR_FINAL_STATE_FROM_ALICE: WaitingFor =
    WaitingFor("WaitingForFinalStateFromAlice");
pub const WAITING_FOR_SUPPORTED_FINAL_STATE: WaitingFor =
    WaitingFor("WaitingForSupportedFinalState");
pub const WAITING_FOR_DEFUNDING_ON_MY_LEFT: WaitingFor =
    WaitingFor("WaitingForDefundingOnMyLeft");
pub const WAITING_FOR_DEFUNDING_ON_MY_RIGHT: WaitingFor =
    WaitingFor("WaitingForDefundingOnMyRight");
pub const WAITING_FOR_NOTHING: WaitingFor = WaitingFor("WaitingForNothing");

#[derive(Debug, Clone, PartialEq)]
pub struct Objective {
    pub status: ObjectiveStatus,

    pub s: SwapChannel,

    pub to_my_left: Option<ConsensusChannel>,
    pub to_my_right: Option<ConsensusChannel>,

    /// My index in the participants list: 0 is Alice, the last index is Bob, everything in
    /// between is an intermediary.
    pub my_role: usize,

    /// The turn number the final state will carry, fixed at construction.
    final_turn_num: u64,
}

/// Constructs a new swap defund objective, resolving the adjacent ledgers for my role.
pub fn new_objective(
    request: &ObjectiveRequest,
    pre_approve: bool,
    my_address: Address,
    get_channel: impl Fn(Destination) -> Option<SwapChannel>,
    get_consensus_channel: impl Fn(Address) -> Option<ConsensusChannel>,
) -> Result<Objective> {
    let s = get_channel(request.channel_id)
        .ok_or_else(|| anyhow!("could not find channel {}", request.channel_id))?;

    let final_turn_num = s.latest_supported_signed_state()?.state().turn_num + 1;

    let participants = s.participants().to_vec();
    if participants.len() < 2 {
        bail!("a swap channel requires at least two participants");
    }
    let alice = participants[0];
    let bob = participants[participants.len() - 1];

    let mut left_ledger = None;
    let mut right_ledger = None;

    if my_address == alice {
        let right_of_alice = participants[1];
        right_ledger = Some(get_consensus_channel(right_of_alice).ok_or_else(|| {
            anyhow!("could not find a ledger channel between {alice} and {right_of_alice}")
        })?);
    } else if my_address == bob {
        let left_of_bob = participants[participants.len() - 2];
        left_ledger = Some(get_consensus_channel(left_of_bob).ok_or_else(|| {
            anyhow!("could not find a ledger channel between {left_of_bob} and {bob}")
        })?);
    } else {
        let position = participants[1..participants.len() - 1]
            .iter()
            .position(|p| *p == my_address)
            .map(|i| i + 1)
            .ok_or_else(|| anyhow!("client address not found in an expected participant index"))?;
        let left_of_me = participants[position - 1];
        let right_of_me = participants[position + 1];
        left_ledger = Some(get_consensus_channel(left_of_me).ok_or_else(|| {
            anyhow!("could not find a ledger channel between {left_of_me} and {my_address}")
        })?);
        right_ledger = Some(get_consensus_channel(right_of_me).ok_or_else(|| {
            anyhow!("could not find a ledger channel between {my_address} and {right_of_me}")
        })?);
    }

    let my_role = s.my_index;
    Ok(Objective {
        status: if pre_approve {
            ObjectiveStatus::Approved
        } else {
            ObjectiveStatus::Unapproved
        },
        s,
        to_my_left: left_ledger,
        to_my_right: right_ledger,
        my_role,
        final_turn_num,
    })
}

/// Constructs an objective from an inbound payload: either a request for the final state
/// (carrying the channel id) or a signed state.
pub fn construct_objective_from_payload(
    payload: &ObjectivePayload,
    pre_approve: bool,
    my_address: Address,
    get_channel: impl Fn(Destination) -> Option<SwapChannel>,
    get_consensus_channel: impl Fn(Address) -> Option<ConsensusChannel>,
) -> Result<Objective> {
    let channel_id = match payload.payload_type {
        PayloadType::RequestFinalState => serde_json::from_slice(&payload.payload_data)
            .map_err(|e| anyhow!("could not unmarshal channel id: {e}"))?,
        PayloadType::SignedState => {
            let ss: SignedState = serde_json::from_slice(&payload.payload_data)
                .map_err(|e| anyhow!("could not unmarshal signed state: {e}"))?;
            ss.channel_id()
        }
        other => bail!("unknown payload type {other:?}"),
    };
    let request = ObjectiveRequest::new(channel_id);
    new_objective(
        &request,
        pre_approve,
        my_address,
        get_channel,
        get_consensus_channel,
    )
}

impl Objective {
    pub fn id(&self) -> ObjectiveId {
        format!("{OBJECTIVE_PREFIX}{}", self.vid())
    }

    /// The channel id of the swap channel.
    pub fn vid(&self) -> Destination {
        self.s.id
    }

    pub fn owns_channel(&self) -> Destination {
        self.vid()
    }

    pub fn approve(&self) -> Objective {
        let mut updated = self.clone();
        updated.status = ObjectiveStatus::Approved;
        updated
    }

    pub fn reject(&self) -> (Objective, SideEffects) {
        let mut updated = self.clone();
        updated.status = ObjectiveStatus::Rejected;
        let effects = SideEffects {
            messages_to_send: create_rejection_notice_message(
                self.id(),
                &self.other_participants(),
            ),
            ..SideEffects::default()
        };
        (updated, effects)
    }

    pub fn related(&self) -> Vec<Storable> {
        let mut related = vec![Storable::SwapChannel(self.s.clone())];
        if let Some(left) = &self.to_my_left {
            related.push(Storable::ConsensusChannel(left.clone()));
        }
        if let Some(right) = &self.to_my_right {
            related.push(Storable::ConsensusChannel(right.clone()));
        }
        related
    }

    fn is_alice(&self) -> bool {
        self.my_role == 0
    }

    fn is_bob(&self) -> bool {
        self.my_role == self.s.participants().len() - 1
    }

    /// The final state for the swap channel, as received from Alice.
    fn final_state(&self) -> Result<State> {
        self.s
            .off_chain
            .signed_state_for_turn_num
            .get(&self.final_turn_num)
            .map(|ss| ss.state().clone())
            .ok_or_else(|| anyhow!("no final state for turn {}", self.final_turn_num))
    }

    /// Alice generates the final state from the latest supported outcome.
    fn generate_final_state(&self) -> Result<State> {
        let latest_supported = self.s.latest_supported_state()?;
        Ok(State::from_fixed_and_variable_part(
            self.s.fixed_part.clone(),
            VariablePart {
                app_data: Vec::new(),
                outcome: latest_supported.outcome,
                turn_num: self.final_turn_num,
                is_final: true,
            },
        ))
    }

    /// True once a final, Alice-signed state for the agreed turn number is present in the
    /// swap channel's signed-state map.
    fn has_final_state_from_alice(&self) -> bool {
        self.s
            .off_chain
            .signed_state_for_turn_num
            .get(&self.final_turn_num)
            .is_some_and(|ss| ss.state().is_final && ss.has_signature_for(0))
    }

    /// Applies an inbound payload, returning the updated objective.
    pub fn update(&self, payload: &ObjectivePayload) -> Result<Objective> {
        if self.id() != payload.objective_id {
            bail!(
                "event and objective ids do not match: {} and {} respectively",
                payload.objective_id,
                self.id()
            );
        }

        match payload.payload_type {
            PayloadType::SignedState => {
                let ss: SignedState = serde_json::from_slice(&payload.payload_data)
                    .map_err(|e| anyhow!("could not unmarshal signed state: {e}"))?;
                let mut updated = self.clone();
                if !updated.s.add_signed_state(ss) {
                    bail!("could not add signed state to channel {}", self.vid());
                }
                Ok(updated)
            }
            // The objective already exists; nothing else to do with the request itself.
            PayloadType::RequestFinalState => Ok(self.clone()),
            other => bail!("unknown payload type {other:?}"),
        }
    }

    /// Inspects the extended state and declares a list of effects to be executed.
    pub fn crank(&self, key: &SecretKey) -> Result<(Objective, SideEffects, WaitingFor)> {
        let mut updated = self.clone();
        let mut side_effects = SideEffects::default();

        if updated.status != ObjectiveStatus::Approved {
            return Err(NotApproved.into());
        }

        // If we don't know the final outcome yet, ask Alice for it.
        if !updated.is_alice() && !updated.has_final_state_from_alice() {
            let alice = updated.s.participants()[0];
            let messages = create_objective_payload_message(
                updated.id(),
                &updated.vid(),
                PayloadType::RequestFinalState,
                &[alice],
            )?;
            side_effects.messages_to_send.extend(messages);
            return Ok((updated, side_effects, WAITING_FOR_FINAL_STATE_FROM_ALICE));
        }

        // Signing of the final state.
        if !updated.s.final_signed_by_me() {
            let state = if updated.is_alice() {
                updated
                    .generate_final_state()
                    .map_err(|e| anyhow!("could not generate final state: {e}"))?
            } else {
                updated.final_state()?
            };
            let ss = updated
                .s
                .sign_and_add_state(state, key)
                .map_err(|e| anyhow!("could not sign final state: {e}"))?;
            let messages = create_objective_payload_message(
                updated.id(),
                &ss,
                PayloadType::SignedState,
                &updated.other_participants(),
            )?;
            side_effects.messages_to_send.extend(messages);
        }

        // Check if all participants have signed the final state.
        if !updated.s.final_completed() {
            return Ok((updated, side_effects, WAITING_FOR_SUPPORTED_FINAL_STATE));
        }

        // Remove the guarantee from each adjacent ledger via the proposal protocol.
        if !updated.is_alice() && !updated.left_has_defunded() {
            let effects = updated.update_ledger_to_remove_guarantee(Side::Left, key)?;
            side_effects.merge(effects);
        }
        if !updated.is_bob() && !updated.right_has_defunded() {
            let effects = updated.update_ledger_to_remove_guarantee(Side::Right, key)?;
            side_effects.merge(effects);
        }

        if !updated.left_has_defunded() {
            return Ok((updated, side_effects, WAITING_FOR_DEFUNDING_ON_MY_LEFT));
        }
        if !updated.right_has_defunded() {
            return Ok((updated, side_effects, WAITING_FOR_DEFUNDING_ON_MY_RIGHT));
        }

        debug!(objective = %updated.id(), "swap channel defunded on both sides");
        updated.status = ObjectiveStatus::Completed;
        Ok((updated, side_effects, WAITING_FOR_NOTHING))
    }

    /// Updates the given adjacent ledger to remove the guarantee funding the swap channel,
    /// idempotently across repeated cranks.
    fn update_ledger_to_remove_guarantee(
        &mut self,
        side: Side,
        key: &SecretKey,
    ) -> Result<SideEffects> {
        let target = self.vid();
        let final_state = self.final_state()?;
        let ledger = match side {
            Side::Left => self.to_my_left.as_mut(),
            Side::Right => self.to_my_right.as_mut(),
        }
        .ok_or_else(|| anyhow!("no ledger on this side"))?;

        let mut side_effects = SideEffects::default();
        if ledger.is_leader() {
            // If we've already proposed the removal we have nothing new to declare.
            if ledger.has_removal_been_proposed(target) {
                return Ok(side_effects);
            }
            let proposal = proposal_for(ledger, target, &final_state)?;
            ledger
                .propose(proposal, key)
                .map_err(|e| anyhow!("error proposing ledger update: {e}"))?;

            // The proposal queue is constructed with consecutive turn numbers, so the whole
            // queue forms a valid catch-up message.
            let recipient = ledger.follower();
            let message =
                create_signed_proposal_message(recipient, ledger.proposal_queue().to_vec());
            side_effects.messages_to_send.push(message);
        } else if ledger.has_removal_been_proposed_next(target) {
            let proposal = proposal_for(ledger, target, &final_state)?;
            let signed = ledger
                .sign_next_proposal(&proposal, key)
                .map_err(|e| anyhow!("could not sign proposal: {e}"))?;

            // Any proposal still queued behind the one just accepted must be processed next.
            if let Some(next) = ledger.proposal_queue().first() {
                side_effects
                    .proposals_to_process
                    .push(next.proposal.clone());
            }

            let recipient = ledger.leader();
            let message = create_signed_proposal_message(recipient, vec![signed]);
            side_effects.messages_to_send.push(message);
        }

        Ok(side_effects)
    }

    /// Folds a signed proposal into the matching adjacent ledger. Stale or out-of-order
    /// proposals are silently dropped, since unreliable transport routinely redelivers.
    pub fn receive_proposal(&self, sp: SignedProposal) -> Result<Objective> {
        if sp.proposal.target() != self.vid() {
            return Ok(self.clone());
        }
        if sp.proposal.ledger_id == Destination::ZERO {
            bail!("signed proposal is for a zero-addressed ledger channel");
        }

        let mut updated = self.clone();
        let receive_result = match (&mut updated.to_my_left, &mut updated.to_my_right) {
            (Some(left), _) if left.id == sp.proposal.ledger_id => left.receive(sp),
            (_, Some(right)) if right.id == sp.proposal.ledger_id => right.receive(sp),
            _ => bail!("signed proposal is not addressed to a known ledger connection"),
        };

        match receive_result {
            Ok(()) => Ok(updated),
            // Ignore stale or future proposals.
            Err(e) if e.downcast_ref::<InvalidTurnNum>().is_some() => Ok(updated),
            Err(e) => Err(anyhow!("error incorporating signed proposal into objective: {e}")),
        }
    }

    /// Whether the ledger to my right has removed its funding for the swap channel. Vacuously
    /// true when there is no ledger on that side.
    fn right_has_defunded(&self) -> bool {
        self.to_my_right
            .as_ref()
            .is_none_or(|ledger| !ledger.includes_target(self.vid()))
    }

    fn left_has_defunded(&self) -> bool {
        self.to_my_left
            .as_ref()
            .is_none_or(|ledger| !ledger.includes_target(self.vid()))
    }

    fn other_participants(&self) -> Vec<Address> {
        self.s
            .participants()
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != self.my_role)
            .map(|(_, p)| *p)
            .collect()
    }
}

enum Side {
    Left,
    Right,
}

fn proposal_for(
    ledger: &ConsensusChannel,
    target: Destination,
    final_state: &State,
) -> Result<Proposal> {
    let ledger_asset = ledger.consensus_vars().outcome.asset_address;
    let asset_exit = final_state
        .outcome
        .0
        .iter()
        .find(|e| e.asset == ledger_asset)
        .ok_or_else(|| anyhow!("final outcome has no entry for the ledger asset {ledger_asset}"))?;
    let left_amount = asset_exit
        .allocations
        .first()
        .map(|a| a.amount)
        .ok_or_else(|| anyhow!("final outcome has no allocations"))?;
    Ok(Proposal::new_remove(ledger.id, target, left_amount))
}

/// Inspects an objective id and returns true if it belongs to a swap defund objective.
pub fn is_swap_defund_objective(id: &ObjectiveId) -> bool {
    id.starts_with(OBJECTIVE_PREFIX)
}

/// Extracts the swap channel id from a swap defund objective id.
pub fn swap_channel_id_from_objective_id(id: &ObjectiveId) -> Result<Destination> {
    let raw = id
        .strip_prefix(OBJECTIVE_PREFIX)
        .ok_or_else(|| anyhow!("id {id} does not have prefix {OBJECTIVE_PREFIX}"))?;
    let bytes: alloy::primitives::B256 = raw
        .parse()
        .map_err(|e| anyhow!("could not parse channel id from {id}: {e}"))?;
    Ok(Destination(bytes))
}

#[derive(Serialize, Deserialize)]
struct JsonObjective {
    status: ObjectiveStatus,
    s: Destination,
    to_my_left: Option<Destination>,
    to_my_right: Option<Destination>,
    my_role: usize,
    final_turn_num: u64,
}

impl Serialize for Objective {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        JsonObjective {
            status: self.status,
            s: self.vid(),
            to_my_left: self.to_my_left.as_ref().map(|l| l.id),
            to_my_right: self.to_my_right.as_ref().map(|l| l.id),
            my_role: self.my_role,
            final_turn_num: self.final_turn_num,
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
            s: SwapChannel::from_channel(crate::channel::Channel::stub(json.s)),
            to_my_left: json.to_my_left.map(ConsensusChannel::stub),
            to_my_right: json.to_my_right.map(ConsensusChannel::stub),
            my_role: json.my_role,
            final_turn_num: json.final_turn_num,
        })
    }
}

/// A request to create a new swap defund objective.
#[derive(Debug)]
pub struct ObjectiveRequest {
    pub channel_id: Destination,
    pub objective_started: StartSignal,
}

impl ObjectiveRequest {
    pub fn new(channel_id: Destination) -> ObjectiveRequest {
        ObjectiveRequest {
            channel_id,
            objective_started: StartSignal::new(),
        }
    }

    pub fn id(&self) -> ObjectiveId {
        format!("{OBJECTIVE_PREFIX}{}", self.channel_id)
    }
}
