//! Defunds a bridged (mirror) ledger channel cooperatively: finalize the channel off chain
//! and hand the supported final state to the bridge. Withdrawal on the home chain is the
//! mirror objective's concern.

use anyhow::{Result, anyhow, bail};
use serde::{Deserialize, Serialize, Serializer, de};

use crate::{
    channel::Channel,
    consensus_channel::ConsensusChannel,
    crypto::SecretKey,
    protocols::{
        NotApproved, ObjectiveId, ObjectivePayload, ObjectiveStatus, PayloadType, SideEffects,
        StartSignal, Storable, WaitingFor, create_objective_payload_message,
        create_rejection_notice_message,
    },
    state::SignedState,
    types::{Address, Destination},
};

use super::directdefund::NoFinalState;

pub const OBJECTIVE_PREFIX: &str = "BridgedDefunding-";

pub const WAITING_FOR_FINALIZATION: WaitingFor = WaitingFor("WaitingForFinalization");
pub const WAITING_FOR_NOTHING: WaitingFor = WaitingFor("WaitingForNothing");

#[derive(Debug, Clone, PartialEq)]
pub struct Objective {
    pub status: ObjectiveStatus,
    pub c: Channel,
}

/// Initiates an objective for the mirror ledger behind `request.channel_id`.
pub fn new_objective(
    request: &ObjectiveRequest,
    pre_approve: bool,
    get_consensus_channel: impl Fn(Destination) -> Result<ConsensusChannel>,
) -> Result<Objective> {
    let cc = get_consensus_channel(request.channel_id)
        .map_err(|e| anyhow!("could not find channel {}: {e}", request.channel_id))?;

    let c = Channel::from_consensus_channel(&cc)
        .map_err(|e| anyhow!("could not create channel from consensus channel: {e}"))?;

    Ok(Objective {
        status: if pre_approve {
            ObjectiveStatus::Approved
        } else {
            ObjectiveStatus::Unapproved
        },
        c,
    })
}

/// Constructs an objective from an inbound final-state payload.
pub fn construct_objective_from_payload(
    payload: &ObjectivePayload,
    pre_approve: bool,
    get_consensus_channel: impl Fn(Destination) -> Result<ConsensusChannel>,
) -> Result<Objective> {
    let ss = get_signed_state_payload(&payload.payload_data)?;
    let state = ss.state();

    // Implicit in the wire protocol is that the message signalling closure of a channel
    // carries a final state.
    if !state.is_final {
        return Err(NoFinalState.into());
    }
    state.fixed_part().validate()?;

    let request = ObjectiveRequest::new(state.channel_id());
    new_objective(&request, pre_approve, get_consensus_channel)
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

    /// Inspects the extended state and declares a list of effects to be executed.
    pub fn crank(&self, key: &SecretKey) -> Result<(Objective, SideEffects, WaitingFor)> {
        let mut updated = self.clone();
        let mut side_effects = SideEffects::default();

        if updated.status != ObjectiveStatus::Approved {
            return Err(NotApproved.into());
        }

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

/// Inspects an objective id and returns true if it belongs to a bridged defund objective.
pub fn is_bridged_defund_objective(id: &ObjectiveId) -> bool {
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

/// A request to create a new bridged defund objective.
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

fn get_signed_state_payload(bytes: &[u8]) -> Result<SignedState> {
    serde_json::from_slice(bytes).map_err(|e| anyhow!("could not unmarshal signed state: {e}"))
}
