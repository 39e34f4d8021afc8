//! Funds a mirror ledger channel on the bridged chain. The bridge seeds the mirror's
//! holdings, so the protocol is pure signature exchange: prefund, then postfund.

use anyhow::{Result, anyhow, bail};
use serde::{Deserialize, Serialize, Serializer, de};
use tracing::debug;

use crate::{
    channel::{Channel, ChannelType},
    consensus_channel::{ConsensusChannel, FOLLOWER_INDEX, LEADER_INDEX, LedgerOutcome},
    crypto::SecretKey,
    outcome::Exit,
    protocols::{
        NotApproved, ObjectiveId, ObjectivePayload, ObjectiveResponse, ObjectiveStatus,
        PayloadType, SideEffects, StartSignal, Storable, WaitingFor,
        create_objective_payload_message, create_rejection_notice_message,
    },
    state::{FixedPart, SignedState, State},
    types::{Address, Destination},
};

use super::directfund::channels_exist_with_counterparty;

pub const OBJECTIVE_PREFIX: &str = "BridgedFunding-";

pub const WAITING_FOR_COMPLETE_PREFUND: WaitingFor = WaitingFor("WaitingForCompletePrefund");
pub const WAITING_FOR_COMPLETE_POST_FUND: WaitingFor = WaitingFor("WaitingForCompletePostFund");
pub const WAITING_FOR_NOTHING: WaitingFor = WaitingFor("WaitingForNothing");

#[derive(Debug, Clone, PartialEq)]
pub struct Objective {
    pub status: ObjectiveStatus,
    pub c: Channel,
}

/// Creates a new bridged funding objective from a given request. Fails if a ledger channel
/// with the counterparty already exists.
pub fn new_objective(
    request: &ObjectiveRequest,
    pre_approve: bool,
    my_address: Address,
    get_channels: impl Fn(Address) -> Result<Vec<Channel>>,
    get_two_party_consensus_ledger: impl Fn(Address) -> Option<ConsensusChannel>,
) -> Result<Objective> {
    let exists = channels_exist_with_counterparty(
        request.counter_party,
        get_channels,
        get_two_party_consensus_ledger,
    )
    .map_err(|e| anyhow!("counterparty check failed: {e}"))?;
    if exists {
        bail!("ledger channel already exists with counterparty {}", request.counter_party);
    }

    let initial_state = State {
        participants: vec![my_address, request.counter_party],
        channel_nonce: request.nonce,
        app_definition: request.app_definition,
        challenge_duration: request.challenge_duration,
        app_data: request.app_data.clone(),
        outcome: request.outcome.clone(),
        turn_num: 0,
        is_final: false,
    };

    let payload = ObjectivePayload {
        objective_id: request.id(my_address),
        payload_data: serde_json::to_vec(&SignedState::new(initial_state))?,
        payload_type: PayloadType::SignedState,
    };
    construct_from_payload(&payload, pre_approve, my_address)
        .map_err(|e| anyhow!("could not create new objective: {e}"))
}

/// Initiates an objective with data calculated from the supplied prefund state.
pub fn construct_from_payload(
    payload: &ObjectivePayload,
    pre_approve: bool,
    my_address: Address,
) -> Result<Objective> {
    let initial_signed_state = get_signed_state_payload(&payload.payload_data)?;
    let initial_state = initial_signed_state.state().clone();
    initial_state.fixed_part().validate()?;
    if initial_state.turn_num != 0 {
        bail!("cannot construct bridged fund objective without prefund state");
    }
    if initial_state.is_final {
        bail!("attempted to initiate new bridged-funding objective with is_final == true");
    }

    let my_index = initial_state
        .participants
        .iter()
        .position(|p| *p == my_address)
        .ok_or_else(|| anyhow!("my address not found in participants"))?;

    let c = Channel::new(initial_state, my_index, ChannelType::Ledger)
        .map_err(|e| anyhow!("failed to initialize channel for bridged-fund objective: {e}"))?;

    Ok(Objective {
        status: if pre_approve {
            ObjectiveStatus::Approved
        } else {
            ObjectiveStatus::Unapproved
        },
        c,
    })
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

    /// Applies an inbound signed state, returning the updated objective.
    pub fn update(&self, payload: &ObjectivePayload) -> Result<Objective> {
        if self.id() != payload.objective_id {
            bail!(
                "event and objective ids do not match: {} and {} respectively",
                payload.objective_id,
                self.id()
            );
        }
        let ss = get_signed_state_payload(&payload.payload_data)?;
        let mut updated = self.clone();
        updated.c.add_signed_state(ss);
        Ok(updated)
    }

    /// Inspects the extended state and declares a list of effects to be executed. It is a
    /// state machine transition function where the finite state is computed from the
    /// extended state, and the only event is the crank itself.
    pub fn crank(&self, key: &SecretKey) -> Result<(Objective, SideEffects, WaitingFor)> {
        let mut updated = self.clone();
        let mut side_effects = SideEffects::default();

        if updated.status != ObjectiveStatus::Approved {
            return Err(NotApproved.into());
        }

        // Prefunding.
        if !updated.c.pre_fund_signed_by_me() {
            let ss = updated
                .c
                .sign_and_add_prefund(key)
                .map_err(|e| anyhow!("could not sign prefund: {e}"))?;
            let messages = create_objective_payload_message(
                updated.id(),
                &ss,
                PayloadType::SignedState,
                &updated.other_participants(),
            )?;
            side_effects.messages_to_send.extend(messages);
        }
        if !updated.c.pre_fund_complete() {
            return Ok((updated, side_effects, WAITING_FOR_COMPLETE_PREFUND));
        }

        // Postfunding.
        if !updated.c.post_fund_signed_by_me() {
            let ss = updated
                .c
                .sign_and_add_postfund(key)
                .map_err(|e| anyhow!("could not sign postfund: {e}"))?;
            let messages = create_objective_payload_message(
                updated.id(),
                &ss,
                PayloadType::SignedState,
                &updated.other_participants(),
            )?;
            side_effects.messages_to_send.extend(messages);
        }
        if !updated.c.post_fund_complete() {
            return Ok((updated, side_effects, WAITING_FOR_COMPLETE_POST_FUND));
        }

        // Completion.
        debug!(objective = %updated.id(), "bridged funding complete");
        updated.status = ObjectiveStatus::Completed;
        Ok((updated, side_effects, WAITING_FOR_NOTHING))
    }

    pub fn related(&self) -> Vec<Storable> {
        vec![Storable::Channel(self.c.clone())]
    }

    /// Creates a `ConsensusChannel` by extracting signatures and a single-asset outcome from
    /// the postfund state.
    pub fn create_consensus_channel(&self) -> Result<ConsensusChannel> {
        let ledger = &self.c;
        if !ledger.post_fund_complete() {
            bail!("expected funding for channel {} to be complete", ledger.id);
        }
        let signed_post_fund = ledger.signed_post_fund_state();
        let leader_sig = signed_post_fund
            .participant_signature(LEADER_INDEX)
            .map_err(|e| anyhow!("could not get leader signature: {e}"))?;
        let follower_sig = signed_post_fund
            .participant_signature(FOLLOWER_INDEX)
            .map_err(|e| anyhow!("could not get follower signature: {e}"))?;
        let signatures = [leader_sig, follower_sig];

        let outcome = LedgerOutcome::from_exit(&signed_post_fund.state().outcome)?;
        let turn_num = signed_post_fund.state().turn_num;

        let mut consensus = if ledger.my_index == LEADER_INDEX {
            ConsensusChannel::new_leader_channel(
                ledger.fixed_part.clone(),
                turn_num,
                outcome,
                signatures,
            )?
        } else {
            ConsensusChannel::new_follower_channel(
                ledger.fixed_part.clone(),
                turn_num,
                outcome,
                signatures,
            )?
        };
        consensus.on_chain_funding = ledger.on_chain.holdings.clone();
        Ok(consensus)
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

/// Inspects an objective id and returns true if it belongs to a bridged fund objective.
pub fn is_bridged_fund_objective(id: &ObjectiveId) -> bool {
    id.starts_with(OBJECTIVE_PREFIX)
}

#[derive(Serialize, Deserialize)]
struct JsonObjective {
    status: ObjectiveStatus,
    c: Destination,
}

impl Serialize for Objective {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        JsonObjective {
            status: self.status,
            c: self.c.id,
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
        })
    }
}

/// A request to create a new bridged funding objective.
#[derive(Debug)]
pub struct ObjectiveRequest {
    pub counter_party: Address,
    pub challenge_duration: u32,
    pub outcome: Exit,
    pub app_definition: Address,
    pub app_data: Vec<u8>,
    pub nonce: u64,
    pub objective_started: StartSignal,
}

impl ObjectiveRequest {
    pub fn new(
        counter_party: Address,
        challenge_duration: u32,
        outcome: Exit,
        nonce: u64,
        app_definition: Address,
    ) -> ObjectiveRequest {
        ObjectiveRequest {
            counter_party,
            challenge_duration,
            outcome,
            app_definition,
            app_data: Vec::new(),
            nonce,
            objective_started: StartSignal::new(),
        }
    }

    fn fixed_part(&self, my_address: Address) -> FixedPart {
        FixedPart {
            participants: vec![my_address, self.counter_party],
            channel_nonce: self.nonce,
            app_definition: self.app_definition,
            challenge_duration: self.challenge_duration,
        }
    }

    pub fn id(&self, my_address: Address) -> ObjectiveId {
        format!("{OBJECTIVE_PREFIX}{}", self.fixed_part(my_address).channel_id())
    }

    pub fn response(&self, my_address: Address) -> ObjectiveResponse {
        let channel_id = self.fixed_part(my_address).channel_id();
        ObjectiveResponse {
            id: format!("{OBJECTIVE_PREFIX}{channel_id}"),
            channel_id,
        }
    }
}

fn get_signed_state_payload(bytes: &[u8]) -> Result<SignedState> {
    serde_json::from_slice(bytes).map_err(|e| anyhow!("could not unmarshal signed state: {e}"))
}
