//! Executes one asset exchange inside a swap channel.
//!
//! The sender proposes a [`Swap`], signing both the swap record and the channel state that
//! results from applying it. The receiver confirms or rejects; once both parties' signatures
//! are in, each side applies the exchange to the channel's latest supported state and files
//! the swap into the channel's bounded history.

use std::collections::BTreeMap;

use alloy::primitives::U256;
use anyhow::{Result, anyhow, bail};
use serde::{Deserialize, Serialize, Serializer, de};

use crate::{
    channel::SwapChannel,
    crypto::{SecretKey, Signature},
    payments::{Swap, SwapStatus},
    protocols::{
        NotApproved, ObjectiveId, ObjectivePayload, ObjectiveResponse, ObjectiveStatus,
        PayloadType, SideEffects, StartSignal, Storable, WaitingFor,
        create_objective_payload_message, create_rejection_notice_message,
    },
    state::{SignedState, State},
    types::{Address, Destination},
};

pub const OBJECTIVE_PREFIX: &str = "Swap-";

pub const WAITING_FOR_CONSENSUS: WaitingFor = WaitingFor("WaitingForConsensus");
pub const WAITING_FOR_CONFIRMATION: WaitingFor = WaitingFor("WaitingForConfirmation");
pub const WAITING_FOR_NOTHING: WaitingFor = WaitingFor("WaitingForNothing");

/// The wire payload: the swap record plus signatures over the post-swap channel state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapPayload {
    pub swap: Swap,
    pub state_sigs: BTreeMap<usize, Signature>,
    pub swap_status: SwapStatus,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Objective {
    pub status: ObjectiveStatus,
    pub c: SwapChannel,
    pub swap: Swap,
    pub state_sigs: BTreeMap<usize, Signature>,
    pub swap_status: SwapStatus,
    /// Index of the participant who initiated the swap in the allocations array.
    pub swap_sender_index: usize,
}

/// Creates a new swap objective from a given request. Fails if the channel is unknown or
/// the channel cannot afford the exchange.
pub fn new_objective(
    request: &ObjectiveRequest,
    pre_approve: bool,
    is_swap_sender: bool,
    get_channel: impl Fn(Destination) -> Option<SwapChannel>,
) -> Result<Objective> {
    let c = get_channel(request.swap.channel_id)
        .ok_or_else(|| anyhow!("swap objective creation failed, swap channel not found"))?;

    let my_allocation_index = my_index_in_allocations(&c)?;
    let swap_sender_index = if is_swap_sender {
        my_allocation_index
    } else {
        1 - my_allocation_index
    };

    let supported = c.latest_supported_state()?;
    if !is_valid_swap(&supported, &request.swap, swap_sender_index) {
        bail!("swap objective creation failed: invalid swap");
    }

    Ok(Objective {
        status: if pre_approve {
            ObjectiveStatus::Approved
        } else {
            ObjectiveStatus::Unapproved
        },
        c,
        swap: request.swap.clone(),
        state_sigs: BTreeMap::new(),
        swap_status: SwapStatus::PendingConfirmation,
        swap_sender_index,
    })
}

/// Constructs an objective from an inbound swap payload.
pub fn construct_objective_from_payload(
    payload: &ObjectivePayload,
    pre_approve: bool,
    get_channel: impl Fn(Destination) -> Option<SwapChannel>,
) -> Result<Objective> {
    let swap_payload = get_swap_payload(&payload.payload_data)?;
    let request = ObjectiveRequest {
        swap: swap_payload.swap,
        objective_started: StartSignal::new(),
    };
    new_objective(&request, pre_approve, false, get_channel)
        .map_err(|e| anyhow!("unable to construct swap objective from payload: {e}"))
}

/// Returns false if either party's balance cannot cover its side of the exchange against
/// the given state.
pub fn is_valid_swap(state: &State, swap: &Swap, swap_sender_index: usize) -> bool {
    for asset_exit in &state.outcome.0 {
        let Some(sender) = asset_exit.allocations.get(swap_sender_index) else {
            return false;
        };
        let Some(receiver) = asset_exit.allocations.get(1 - swap_sender_index) else {
            return false;
        };
        if asset_exit.asset == swap.exchange.token_in
            && sender.amount.checked_sub(swap.exchange.amount_in).is_none()
        {
            return false;
        }
        if asset_exit.asset == swap.exchange.token_out
            && receiver
                .amount
                .checked_sub(swap.exchange.amount_out)
                .is_none()
        {
            return false;
        }
    }
    true
}

impl Objective {
    pub fn id(&self) -> ObjectiveId {
        format!("{OBJECTIVE_PREFIX}{}", self.swap.id)
    }

    /// A swap objective does not own any channel.
    pub fn owns_channel(&self) -> Destination {
        Destination::ZERO
    }

    pub fn approve(&self) -> Objective {
        let mut updated = self.clone();
        updated.status = ObjectiveStatus::Approved;
        updated
    }

    pub fn reject(&self) -> (Objective, SideEffects) {
        let mut updated = self.clone();
        updated.status = ObjectiveStatus::Rejected;
        updated.swap_status = SwapStatus::Rejected;
        let effects = SideEffects {
            messages_to_send: create_rejection_notice_message(
                self.id(),
                &[self.counter_party_address()],
            ),
            ..SideEffects::default()
        };
        (updated, effects)
    }

    /// Marks the proposed swap as accepted by the receiver.
    pub fn accept_swap(&self) -> Objective {
        let mut updated = self.clone();
        updated.swap_status = SwapStatus::Accepted;
        updated
    }

    pub fn related(&self) -> Vec<Storable> {
        vec![
            Storable::SwapChannel(self.c.clone()),
            Storable::Swap(self.swap.clone()),
        ]
    }

    /// Applies an inbound swap payload after verifying the counterparty's signatures over
    /// both the swap and the post-swap state.
    pub fn update(&self, payload: &ObjectivePayload) -> Result<Objective> {
        if self.id() != payload.objective_id {
            bail!(
                "event and objective ids do not match: {} and {} respectively",
                payload.objective_id,
                self.id()
            );
        }
        let swap_payload = get_swap_payload(&payload.payload_data)?;
        if !self.swap.equal(&swap_payload.swap) {
            bail!("swap does not match");
        }

        let counter_party_index = self.counter_party_index_in_participants()?;
        let counter_party = self.counter_party_address();

        let swap_sig = swap_payload
            .swap
            .sigs
            .get(&counter_party_index)
            .ok_or_else(|| anyhow!("swap lacks counterparty's signature"))?;
        if self.swap.recover_signer(swap_sig)? != counter_party {
            bail!("swap lacks counterparty's signature");
        }

        let state_sig = swap_payload
            .state_sigs
            .get(&counter_party_index)
            .ok_or_else(|| anyhow!("missing counterparty's signature in state signatures"))?;
        let updated_state = self.updated_swap_state()?;
        if updated_state.recover_signer(state_sig)? != counter_party {
            bail!("missing counterparty's signature in state signatures");
        }

        let mut updated = self.clone();
        updated.swap = swap_payload.swap;
        updated.state_sigs = swap_payload.state_sigs;
        updated.swap_status = swap_payload.swap_status;
        Ok(updated)
    }

    /// Inspects the extended state and declares a list of effects to be executed.
    pub fn crank(&self, key: &SecretKey) -> Result<(Objective, SideEffects, WaitingFor)> {
        let mut updated = self.clone();
        let mut side_effects = SideEffects::default();

        if updated.status != ObjectiveStatus::Approved {
            return Err(NotApproved.into());
        }

        let my_allocation_index = my_index_in_allocations(&updated.c)?;

        // The receiver decides whether to accept before anyone signs.
        if updated.swap_sender_index != my_allocation_index
            && updated.swap_status != SwapStatus::Accepted
        {
            return match updated.swap_status {
                SwapStatus::PendingConfirmation => {
                    Ok((updated, side_effects, WAITING_FOR_CONFIRMATION))
                }
                _ => {
                    let (rejected, effects) = updated.reject();
                    Ok((rejected, effects, WAITING_FOR_NOTHING))
                }
            };
        }

        // Sign the swap and the post-swap state, and hand both to the counterparty.
        if !updated.swap.sigs.contains_key(&updated.c.my_index) {
            let swap_sig = updated.swap.sign(key)?;
            let my_index = updated.c.my_index;
            updated.swap.add_signature(swap_sig, my_index);

            let updated_state = updated
                .updated_swap_state()
                .map_err(|e| anyhow!("error creating updated swap channel state: {e}"))?;
            let state_sig = updated_state
                .sign(key)
                .map_err(|e| anyhow!("error signing swap channel state: {e}"))?;
            updated.state_sigs.insert(my_index, state_sig);

            let messages = create_objective_payload_message(
                updated.id(),
                &SwapPayload {
                    swap: updated.swap.clone(),
                    state_sigs: updated.state_sigs.clone(),
                    swap_status: updated.swap_status,
                },
                PayloadType::Swap,
                &[updated.counter_party_address()],
            )?;
            side_effects.messages_to_send.extend(messages);
        }

        // Wait until every signature is available.
        if updated.swap.sigs.len() != 2 {
            return Ok((updated, side_effects, WAITING_FOR_CONSENSUS));
        }

        updated
            .apply_swap_to_channel()
            .map_err(|e| anyhow!("error updating swap channel state: {e}"))?;

        updated.status = ObjectiveStatus::Completed;
        Ok((updated, side_effects, WAITING_FOR_NOTHING))
    }

    /// The channel state that results from applying the exchange to the latest supported
    /// state, at the next turn number.
    pub fn updated_swap_state(&self) -> Result<State> {
        let mut state = self.c.latest_supported_state()?;
        for asset_exit in &mut state.outcome.0 {
            let token_in = asset_exit.asset == self.swap.exchange.token_in;
            let token_out = asset_exit.asset == self.swap.exchange.token_out;
            if !token_in && !token_out {
                continue;
            }
            let receiver_index = 1 - self.swap_sender_index;
            if token_in {
                let sender = &mut asset_exit.allocations[self.swap_sender_index];
                sender.amount = sender
                    .amount
                    .checked_sub(self.swap.exchange.amount_in)
                    .ok_or_else(|| anyhow!("sender cannot afford the swap"))?;
                let receiver = &mut asset_exit.allocations[receiver_index];
                receiver.amount = receiver.amount.saturating_add(self.swap.exchange.amount_in);
            }
            if token_out {
                let receiver = &mut asset_exit.allocations[receiver_index];
                receiver.amount = receiver
                    .amount
                    .checked_sub(self.swap.exchange.amount_out)
                    .ok_or_else(|| anyhow!("receiver cannot afford the swap"))?;
                let sender = &mut asset_exit.allocations[self.swap_sender_index];
                sender.amount = sender.amount.saturating_add(self.swap.exchange.amount_out);
            }
        }
        state.turn_num += 1;
        Ok(state)
    }

    /// Installs the fully-signed post-swap state into the channel and files the swap into
    /// its history.
    fn apply_swap_to_channel(&mut self) -> Result<()> {
        let updated_state = self.updated_swap_state()?;
        let mut signed = SignedState::new(updated_state);
        for sig in self.state_sigs.values() {
            signed
                .add_signature(*sig)
                .map_err(|e| anyhow!("error adding signature to signed swap channel state: {e}"))?;
        }
        if !self.c.add_signed_state(signed) {
            bail!("error adding signed state to swap channel");
        }
        self.c.swaps.enqueue(self.swap.clone());
        Ok(())
    }

    fn counter_party_index_in_participants(&self) -> Result<usize> {
        let length = self.c.participants().len();
        if self.c.my_index == 0 {
            Ok(length - 1)
        } else if self.c.my_index == length - 1 {
            Ok(0)
        } else {
            bail!("intermediaries do not take part in swaps")
        }
    }

    fn counter_party_address(&self) -> Address {
        match self.counter_party_index_in_participants() {
            Ok(index) => self.c.participants()[index],
            Err(_) => Address::ZERO,
        }
    }
}

/// Finds the caller's index in the allocations of the channel's latest supported state.
pub fn my_index_in_allocations(c: &SwapChannel) -> Result<usize> {
    let my_destination = c.my_destination();
    let state = c.latest_supported_state()?;
    let asset_exit = state
        .outcome
        .0
        .first()
        .ok_or_else(|| anyhow!("swap channel has an empty outcome"))?;
    asset_exit
        .allocations
        .iter()
        .position(|a| a.destination == my_destination)
        .ok_or_else(|| {
            anyhow!(
                "unable to find participant's address ({}) in the allocations",
                c.my_address()
            )
        })
}

/// Inspects an objective id and returns true if it belongs to a swap objective.
pub fn is_swap_objective(id: &ObjectiveId) -> bool {
    id.starts_with(OBJECTIVE_PREFIX)
}

#[derive(Serialize, Deserialize)]
struct JsonObjective {
    status: ObjectiveStatus,
    c: Destination,
    swap: Destination,
    swap_sender_index: usize,
    swap_status: SwapStatus,
    state_sigs: BTreeMap<usize, Signature>,
}

impl Serialize for Objective {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        JsonObjective {
            status: self.status,
            c: self.c.id,
            swap: self.swap.id,
            swap_sender_index: self.swap_sender_index,
            swap_status: self.swap_status,
            state_sigs: self.state_sigs.clone(),
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
        let mut swap = Swap::new(
            Destination::ZERO,
            Address::ZERO,
            Address::ZERO,
            U256::ZERO,
            U256::ZERO,
            0,
        );
        swap.id = json.swap;
        Ok(Objective {
            status: json.status,
            c: SwapChannel::from_channel(crate::channel::Channel::stub(json.c)),
            swap,
            state_sigs: json.state_sigs,
            swap_status: json.swap_status,
            swap_sender_index: json.swap_sender_index,
        })
    }
}

/// A request to create a new swap objective.
#[derive(Debug)]
pub struct ObjectiveRequest {
    pub swap: Swap,
    pub objective_started: StartSignal,
}

impl ObjectiveRequest {
    pub fn new(
        channel_id: Destination,
        token_in: Address,
        token_out: Address,
        amount_in: U256,
        amount_out: U256,
        nonce: u64,
    ) -> ObjectiveRequest {
        ObjectiveRequest {
            swap: Swap::new(channel_id, token_in, token_out, amount_in, amount_out, nonce),
            objective_started: StartSignal::new(),
        }
    }

    pub fn id(&self) -> ObjectiveId {
        format!("{OBJECTIVE_PREFIX}{}", self.swap.id)
    }

    pub fn response(&self) -> ObjectiveResponse {
        ObjectiveResponse {
            id: format!("{OBJECTIVE_PREFIX}{}", self.swap.id),
            channel_id: self.swap.channel_id,
        }
    }
}

fn get_swap_payload(bytes: &[u8]) -> Result<SwapPayload> {
    serde_json::from_slice(bytes).map_err(|e| anyhow!("could not unmarshal swap: {e}"))
}
