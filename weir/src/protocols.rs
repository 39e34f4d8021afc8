//! The objective contract shared by every off-chain protocol.
//!
//! The lifecycle of an objective:
//!   - it is initialized by a single node (implicitly approved there) and communicated to the
//!     other participants, who store it and then approve or reject it;
//!   - it is updated with signed artifacts arriving from peers;
//!   - after each update it is cranked, producing side effects for the engine to execute;
//!   - eventually it completes, or stalls forever with a `WaitingFor` label saying why.
//!
//! Transition functions never perform I/O and never mutate their receiver: they return a new
//! value plus the [`SideEffects`] the engine must deliver.

pub mod bridgeddefund;
pub mod bridgedfund;
pub mod directdefund;
pub mod directfund;
pub mod mirrorbridgeddefund;
pub mod swap;
pub mod swapdefund;

use std::{error::Error, fmt::Display};

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::{
    channel::{Channel, SwapChannel},
    consensus_channel::{ConsensusChannel, Proposal, SignedProposal},
    crypto::{Hash, SecretKey, Signature, sign_ethereum_message},
    payments::Swap,
    state::{SignedState, State},
    types::{Address, Destination, Funds},
};

pub type ObjectiveId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectiveStatus {
    Unapproved,
    Approved,
    Rejected,
    Completed,
}

/// Returned by `crank` when the objective has not been approved yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotApproved;

impl Display for NotApproved {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "objective not approved")
    }
}

impl Error for NotApproved {}

/// An enumerable "pause point" computed from an objective: what external event would let it
/// make further progress. Observability only; never branched on internally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitingFor(pub &'static str);

impl Display for WaitingFor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The tag describing how an [`ObjectivePayload`]'s opaque bytes should be decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PayloadType {
    /// A JSON-serialized [`SignedState`].
    #[serde(rename = "SignedStatePayload")]
    SignedState,
    /// A request for a channel's final state; the bytes hold the channel id.
    #[serde(rename = "RequestFinalStatePayload")]
    RequestFinalState,
    /// A JSON-serialized swap payload.
    #[serde(rename = "SwapPayload")]
    Swap,
}

/// One signed artifact addressed to an objective.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectivePayload {
    pub objective_id: ObjectiveId,
    #[serde(with = "hex::serde")]
    pub payload_data: Vec<u8>,
    pub payload_type: PayloadType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessagePayload {
    Objective(ObjectivePayload),
    /// A suffix of a leader's proposal queue, in turn order.
    LedgerProposals(Vec<SignedProposal>),
    RejectionNotice(ObjectiveId),
}

/// An envelope addressed to exactly one participant. Delivery is the transport's concern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub to: Address,
    pub payload: MessagePayload,
}

/// Builds one message per recipient carrying `payload` serialized as opaque JSON bytes.
pub fn create_objective_payload_message<P: Serialize>(
    objective_id: ObjectiveId,
    payload: &P,
    payload_type: PayloadType,
    recipients: &[Address],
) -> Result<Vec<Message>> {
    let payload_data =
        serde_json::to_vec(payload).map_err(|e| anyhow!("could not serialize payload: {e}"))?;
    Ok(recipients
        .iter()
        .map(|to| Message {
            to: *to,
            payload: MessagePayload::Objective(ObjectivePayload {
                objective_id: objective_id.clone(),
                payload_data: payload_data.clone(),
                payload_type,
            }),
        })
        .collect())
}

/// Wraps a leader's proposal queue (or a follower's single countersigned proposal) for one
/// recipient. Sending the whole queue lets a peer that missed earlier messages catch up.
pub fn create_signed_proposal_message(to: Address, proposals: Vec<SignedProposal>) -> Message {
    Message {
        to,
        payload: MessagePayload::LedgerProposals(proposals),
    }
}

pub fn create_rejection_notice_message(
    objective_id: ObjectiveId,
    peers: &[Address],
) -> Vec<Message> {
    peers
        .iter()
        .map(|to| Message {
            to: *to,
            payload: MessagePayload::RejectionNotice(objective_id.clone()),
        })
        .collect()
}

/// An on-chain intent declared by a crank. The chain service owns submission, confirmation
/// and retry; the core only guarantees each intent is declared at most once per distinct
/// crank opportunity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChainTransaction {
    Deposit {
        channel_id: Destination,
        deposit: Funds,
    },
    Challenge {
        channel_id: Destination,
        candidate: SignedState,
        proof: Vec<SignedState>,
        challenger_sig: Signature,
    },
    Checkpoint {
        channel_id: Destination,
        candidate: SignedState,
        proof: Vec<SignedState>,
    },
    TransferAll {
        channel_id: Destination,
        signed_state: SignedState,
    },
    WithdrawAll {
        channel_id: Destination,
        signed_state: SignedState,
    },
    MirrorWithdrawAll {
        channel_id: Destination,
        signed_state: SignedState,
    },
}

impl ChainTransaction {
    pub fn channel_id(&self) -> Destination {
        match self {
            ChainTransaction::Deposit { channel_id, .. }
            | ChainTransaction::Challenge { channel_id, .. }
            | ChainTransaction::Checkpoint { channel_id, .. }
            | ChainTransaction::TransferAll { channel_id, .. }
            | ChainTransaction::WithdrawAll { channel_id, .. }
            | ChainTransaction::MirrorWithdrawAll { channel_id, .. } => *channel_id,
        }
    }
}

/// Signs the digest the adjudicator expects from a challenger: the state hash bound to the
/// challenge intent.
pub fn sign_challenge_message(state: &State, key: &SecretKey) -> Result<Signature> {
    let digest = Hash::compute([state.hash().as_bytes(), b"forceMove".as_slice()]);
    sign_ethereum_message(digest.as_bytes(), key)
}

/// Effects to be executed by an imperative shell. Sub-step effects are concatenated, never
/// deduplicated; idempotency is the responsibility of the objectives' submission guards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SideEffects {
    pub messages_to_send: Vec<Message>,
    pub transactions_to_submit: Vec<ChainTransaction>,
    pub proposals_to_process: Vec<Proposal>,
}

impl SideEffects {
    pub fn merge(&mut self, other: SideEffects) {
        self.messages_to_send.extend(other.messages_to_send);
        self.transactions_to_submit
            .extend(other.transactions_to_submit);
        self.proposals_to_process.extend(other.proposals_to_process);
    }

    pub fn is_empty(&self) -> bool {
        self.messages_to_send.is_empty()
            && self.transactions_to_submit.is_empty()
            && self.proposals_to_process.is_empty()
    }
}

/// An entity the caller must persist alongside an objective.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Storable {
    Channel(Channel),
    SwapChannel(SwapChannel),
    ConsensusChannel(ConsensusChannel),
    Swap(Swap),
}

/// A one-shot start signal: the engine signals once after registering an objective, and any
/// number of waiters observe it.
#[derive(Debug)]
pub struct StartSignal {
    tx: watch::Sender<bool>,
}

impl StartSignal {
    pub fn new() -> StartSignal {
        StartSignal {
            tx: watch::channel(false).0,
        }
    }

    /// Signals that the objective has been registered. Idempotent.
    pub fn signal(&self) {
        self.tx.send_replace(true);
    }

    /// Completes once the objective has been registered, immediately if it already was.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|started| *started).await;
    }
}

impl Default for StartSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// The type returned across the API in response to a fund-style objective request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectiveResponse {
    pub id: ObjectiveId,
    pub channel_id: Destination,
}

/// Every off-chain protocol, as a closed set. The variant set is fixed and small, so
/// dispatch is an exhaustive match rather than dynamic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Objective {
    DirectFund(directfund::Objective),
    DirectDefund(directdefund::Objective),
    BridgedFund(bridgedfund::Objective),
    BridgedDefund(bridgeddefund::Objective),
    MirrorBridgedDefund(mirrorbridgeddefund::Objective),
    Swap(swap::Objective),
    SwapDefund(swapdefund::Objective),
}

impl Objective {
    /// The unique id: a protocol prefix joined to the channel (or swap) id. Stable for the
    /// objective's lifetime.
    pub fn id(&self) -> ObjectiveId {
        match self {
            Objective::DirectFund(o) => o.id(),
            Objective::DirectDefund(o) => o.id(),
            Objective::BridgedFund(o) => o.id(),
            Objective::BridgedDefund(o) => o.id(),
            Objective::MirrorBridgedDefund(o) => o.id(),
            Objective::Swap(o) => o.id(),
            Objective::SwapDefund(o) => o.id(),
        }
    }

    pub fn get_status(&self) -> ObjectiveStatus {
        match self {
            Objective::DirectFund(o) => o.status,
            Objective::DirectDefund(o) => o.status,
            Objective::BridgedFund(o) => o.status,
            Objective::BridgedDefund(o) => o.status,
            Objective::MirrorBridgedDefund(o) => o.status,
            Objective::Swap(o) => o.status,
            Objective::SwapDefund(o) => o.status,
        }
    }

    /// The channel the objective exclusively owns.
    pub fn owns_channel(&self) -> Destination {
        match self {
            Objective::DirectFund(o) => o.owns_channel(),
            Objective::DirectDefund(o) => o.owns_channel(),
            Objective::BridgedFund(o) => o.owns_channel(),
            Objective::BridgedDefund(o) => o.owns_channel(),
            Objective::MirrorBridgedDefund(o) => o.owns_channel(),
            Objective::Swap(o) => o.owns_channel(),
            Objective::SwapDefund(o) => o.owns_channel(),
        }
    }

    /// Returns a copy with status forced to Approved. Declares no effects.
    pub fn approve(&self) -> Objective {
        match self {
            Objective::DirectFund(o) => Objective::DirectFund(o.approve()),
            Objective::DirectDefund(o) => Objective::DirectDefund(o.approve()),
            Objective::BridgedFund(o) => Objective::BridgedFund(o.approve()),
            Objective::BridgedDefund(o) => Objective::BridgedDefund(o.approve()),
            Objective::MirrorBridgedDefund(o) => Objective::MirrorBridgedDefund(o.approve()),
            Objective::Swap(o) => Objective::Swap(o.approve()),
            Objective::SwapDefund(o) => Objective::SwapDefund(o.approve()),
        }
    }

    /// Returns a rejected copy plus rejection notices addressed to every other participant.
    pub fn reject(&self) -> (Objective, SideEffects) {
        match self {
            Objective::DirectFund(o) => {
                let (o, effects) = o.reject();
                (Objective::DirectFund(o), effects)
            }
            Objective::DirectDefund(o) => {
                let (o, effects) = o.reject();
                (Objective::DirectDefund(o), effects)
            }
            Objective::BridgedFund(o) => {
                let (o, effects) = o.reject();
                (Objective::BridgedFund(o), effects)
            }
            Objective::BridgedDefund(o) => {
                let (o, effects) = o.reject();
                (Objective::BridgedDefund(o), effects)
            }
            Objective::MirrorBridgedDefund(o) => {
                let (o, effects) = o.reject();
                (Objective::MirrorBridgedDefund(o), effects)
            }
            Objective::Swap(o) => {
                let (o, effects) = o.reject();
                (Objective::Swap(o), effects)
            }
            Objective::SwapDefund(o) => {
                let (o, effects) = o.reject();
                (Objective::SwapDefund(o), effects)
            }
        }
    }

    /// Incorporates one inbound signed artifact, returning a new value. The receiver is
    /// never partially updated: on error the caller keeps the original.
    pub fn update(&self, payload: &ObjectivePayload) -> Result<Objective> {
        match self {
            Objective::DirectFund(o) => o.update(payload).map(Objective::DirectFund),
            Objective::DirectDefund(o) => o.update(payload).map(Objective::DirectDefund),
            Objective::BridgedFund(o) => o.update(payload).map(Objective::BridgedFund),
            Objective::BridgedDefund(o) => o.update(payload).map(Objective::BridgedDefund),
            Objective::MirrorBridgedDefund(o) => {
                o.update(payload).map(Objective::MirrorBridgedDefund)
            }
            Objective::Swap(o) => o.update(payload).map(Objective::Swap),
            Objective::SwapDefund(o) => o.update(payload).map(Objective::SwapDefund),
        }
    }

    /// The core state-transition function: deterministic in the receiver and the signing
    /// key, idempotent in effect. On error the caller keeps the original objective and
    /// retries later; failures at this layer are retryable by design.
    pub fn crank(&self, key: &SecretKey) -> Result<(Objective, SideEffects, WaitingFor)> {
        match self {
            Objective::DirectFund(o) => o
                .crank(key)
                .map(|(o, se, w)| (Objective::DirectFund(o), se, w)),
            Objective::DirectDefund(o) => o
                .crank(key)
                .map(|(o, se, w)| (Objective::DirectDefund(o), se, w)),
            Objective::BridgedFund(o) => o
                .crank(key)
                .map(|(o, se, w)| (Objective::BridgedFund(o), se, w)),
            Objective::BridgedDefund(o) => o
                .crank(key)
                .map(|(o, se, w)| (Objective::BridgedDefund(o), se, w)),
            Objective::MirrorBridgedDefund(o) => o
                .crank(key)
                .map(|(o, se, w)| (Objective::MirrorBridgedDefund(o), se, w)),
            Objective::Swap(o) => o.crank(key).map(|(o, se, w)| (Objective::Swap(o), se, w)),
            Objective::SwapDefund(o) => o
                .crank(key)
                .map(|(o, se, w)| (Objective::SwapDefund(o), se, w)),
        }
    }

    /// Auxiliary entities the caller must persist alongside the objective.
    pub fn related(&self) -> Vec<Storable> {
        match self {
            Objective::DirectFund(o) => o.related(),
            Objective::DirectDefund(o) => o.related(),
            Objective::BridgedFund(o) => o.related(),
            Objective::BridgedDefund(o) => o.related(),
            Objective::MirrorBridgedDefund(o) => o.related(),
            Objective::Swap(o) => o.related(),
            Objective::SwapDefund(o) => o.related(),
        }
    }

    /// Folds a consensus proposal back into the objective's ledger channels, for the
    /// variants that take part in the proposal protocol.
    pub fn receive_proposal(&self, sp: SignedProposal) -> Result<Objective> {
        match self {
            Objective::SwapDefund(o) => o.receive_proposal(sp).map(Objective::SwapDefund),
            _ => Err(anyhow!("objective {} does not receive proposals", self.id())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn start_signal_wakes_early_and_late_waiters() {
        // A waiter subscribing before the signal is woken by it.
        let signal = StartSignal::new();
        let waiter = signal.wait();
        signal.signal();
        waiter.await;

        // A waiter subscribing after the signal observes it immediately, and signalling
        // again is harmless.
        signal.signal();
        signal.wait().await;
    }

    #[test]
    fn side_effects_merge_concatenates_in_order() {
        let to = Address::ZERO;
        let mut first = SideEffects {
            messages_to_send: vec![Message {
                to,
                payload: MessagePayload::RejectionNotice("a".into()),
            }],
            ..SideEffects::default()
        };
        let second = SideEffects {
            messages_to_send: vec![Message {
                to,
                payload: MessagePayload::RejectionNotice("b".into()),
            }],
            ..SideEffects::default()
        };

        first.merge(second);
        assert_eq!(first.messages_to_send.len(), 2);
        assert!(matches!(
            &first.messages_to_send[1].payload,
            MessagePayload::RejectionNotice(id) if id == "b"
        ));
    }
}
