//! Mirrors a bridged defund back onto the home chain: once the bridged (L2) ledger has a
//! supported final state, release the funds locked in the home-chain (L1) ledger with a
//! single mirror-withdraw transaction.

use anyhow::{Result, anyhow, bail};
use serde::{Deserialize, Serialize, Serializer, de};

use crate::{
    channel::Channel,
    consensus_channel::ConsensusChannel,
    crypto::SecretKey,
    protocols::{
        ChainTransaction, NotApproved, ObjectiveId, ObjectivePayload, ObjectiveStatus,
        PayloadType, SideEffects, StartSignal, Storable, WaitingFor,
        create_objective_payload_message, create_rejection_notice_message,
    },
    state::SignedState,
    types::{Address, Destination},
};

pub const OBJECTIVE_PREFIX: &str = "MirrorBridgedDefunding-";

pub const WAITING_FOR_FINALIZATION: WaitingFor = WaitingFor("WaitingForFinalization");
pub const WAITING_FOR_NOTHING: WaitingFor = WaitingFor("WaitingForNothing");

#[derive(Debug, Clone, PartialEq)]
pub struct Objective {
    pub status: ObjectiveStatus,
    pub c: Channel,
    l2_signed_state: SignedState,
    mirror_transaction_submitted: bool,
}

/// Initiates an objective for the home-chain ledger behind `request.l1_channel_id`,
/// carrying the bridged ledger's signed final state as the withdrawal witness.
pub fn new_objective(
    request: &ObjectiveRequest,
    pre_approve: bool,
    get_consensus_channel: impl Fn(Destination) -> Result<ConsensusChannel>,
) -> Result<Objective> {
    let cc = get_consensus_channel(request.l1_channel_id)
        .map_err(|e| anyhow!("could not find channel {}: {e}", request.l1_channel_id))?;

    let c = Channel::from_consensus_channel(&cc)
        .map_err(|e| anyhow!("could not create channel from consensus channel: {e}"))?;

    Ok(Objective {
        status: if pre_approve {
            ObjectiveStatus::Approved
        } else {
            ObjectiveStatus::Unapproved
        },
        c,
        l2_signed_state: request.l2_signed_state.clone(),
        mirror_transaction_submitted: false,
    })
}

/// Constructs an objective from an inbound signed-state payload.
pub fn construct_objective_from_payload(
    payload: &ObjectivePayload,
    pre_approve: bool,
    get_consensus_channel: impl Fn(Destination) -> Result<ConsensusChannel>,
) -> Result<Objective> {
    let ss = get_signed_state_payload(&payload.payload_data)?;
    ss.state().fixed_part().validate()?;

    let request = ObjectiveRequest::new(ss.channel_id(), SignedState::default());
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

    /// Inspects the extended state and declares a list of effects to be executed. The
    /// mirror-withdraw transaction is declared exactly once, when an L2 witness is present.
    pub fn crank(&self, _key: &SecretKey) -> Result<(Objective, SideEffects, WaitingFor)> {
        let mut updated = self.clone();
        let mut side_effects = SideEffects::default();

        if updated.status != ObjectiveStatus::Approved {
            return Err(NotApproved.into());
        }

        if updated.l2_signed_state.signature_count() != 0 && !updated.mirror_transaction_submitted
        {
            // Share the latest supported home-chain state with the counterparty.
            let ss = updated
                .c
                .latest_supported_signed_state()
                .map_err(|e| anyhow!("could not retrieve latest signed state: {e}"))?;
            let messages = create_objective_payload_message(
                updated.id(),
                &ss,
                PayloadType::SignedState,
                &updated.other_participants(),
            )?;
            side_effects.messages_to_send.extend(messages);

            side_effects
                .transactions_to_submit
                .push(ChainTransaction::MirrorWithdrawAll {
                    channel_id: updated.c.id,
                    signed_state: updated.l2_signed_state.clone(),
                });
            updated.mirror_transaction_submitted = true;
            return Ok((updated, side_effects, WAITING_FOR_FINALIZATION));
        }

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

/// Inspects an objective id and returns true if it belongs to a mirror bridged defund
/// objective.
pub fn is_mirror_bridged_defund_objective(id: &ObjectiveId) -> bool {
    id.starts_with(OBJECTIVE_PREFIX)
}

#[derive(Serialize, Deserialize)]
struct JsonObjective {
    status: ObjectiveStatus,
    c: Destination,
    l2_signed_state: SignedState,
    mirror_transaction_submitted: bool,
}

impl Serialize for Objective {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        JsonObjective {
            status: self.status,
            c: self.c.id,
            l2_signed_state: self.l2_signed_state.clone(),
            mirror_transaction_submitted: self.mirror_transaction_submitted,
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
            l2_signed_state: json.l2_signed_state,
            mirror_transaction_submitted: json.mirror_transaction_submitted,
        })
    }
}

/// A request to create a mirror bridged defund objective.
#[derive(Debug)]
pub struct ObjectiveRequest {
    pub l1_channel_id: Destination,
    pub l2_signed_state: SignedState,
    pub objective_started: StartSignal,
}

impl ObjectiveRequest {
    pub fn new(l1_channel_id: Destination, l2_signed_state: SignedState) -> ObjectiveRequest {
        ObjectiveRequest {
            l1_channel_id,
            l2_signed_state,
            objective_started: StartSignal::new(),
        }
    }

    pub fn id(&self) -> ObjectiveId {
        format!("{OBJECTIVE_PREFIX}{}", self.l1_channel_id)
    }
}

fn get_signed_state_payload(bytes: &[u8]) -> Result<SignedState> {
    serde_json::from_slice(bytes).map_err(|e| anyhow!("could not unmarshal signed state: {e}"))
}
