//! End-to-end objective tests: two nodes drive their objectives by delivering each other's
//! declared side effects, the way the engine would.

use alloy::primitives::{B256, U256};
use weir::{
    channel::{ChainEvent, ChainEventKind, SwapChannel},
    consensus_channel::{Balance, ConsensusChannel, Guarantee, LedgerOutcome, Vars},
    crypto::SecretKey,
    outcome::{Allocation, Exit, SingleAssetExit},
    protocols::{
        ChainTransaction, Message, MessagePayload, Objective, ObjectivePayload, ObjectiveStatus,
        SideEffects, directdefund, directfund, swapdefund,
    },
    state::{FixedPart, State},
    types::{Address, Destination},
};

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn alice_key() -> SecretKey {
    SecretKey::from_hex("0000000000000000000000000000000000000000000000000000000000000001")
        .unwrap()
}

fn bob_key() -> SecretKey {
    SecretKey::from_hex("0000000000000000000000000000000000000000000000000000000000000002")
        .unwrap()
}

fn split_equally_outcome(alice: Address, bob: Address, amount: u64) -> Exit {
    Exit(vec![SingleAssetExit {
        asset: Address::ZERO,
        asset_metadata: Vec::new(),
        allocations: vec![
            Allocation::normal(Destination::from_address(alice), U256::from(amount)),
            Allocation::normal(Destination::from_address(bob), U256::from(amount)),
        ],
    }])
}

/// Pulls the objective payloads out of a batch of messages, dropping the envelopes.
fn objective_payloads(effects: &SideEffects) -> Vec<ObjectivePayload> {
    effects
        .messages_to_send
        .iter()
        .filter_map(|m| match &m.payload {
            MessagePayload::Objective(p) => Some(p.clone()),
            _ => None,
        })
        .collect()
}

fn deposited(channel_id: Destination, block_num: u64, amount: u64) -> ChainEvent {
    ChainEvent {
        channel_id,
        block_num,
        tx_index: 0,
        kind: ChainEventKind::Deposited {
            asset: Address::ZERO,
            now_held: U256::from(amount),
        },
    }
}

#[test]
fn direct_funding_happy_path() {
    init_logging();
    let (alice, bob) = (alice_key(), bob_key());
    let request = directfund::ObjectiveRequest::new(
        bob.address(),
        100,
        split_equally_outcome(alice.address(), bob.address(), 10),
        0,
        Address::ZERO,
    );
    let response = request.response(alice.address());

    // No pre-existing channel with the counterparty on either side.
    let mut a = directfund::new_objective(
        &request,
        true,
        alice.address(),
        |_| Ok(Vec::new()),
        |_| None,
    )
    .unwrap();
    assert_eq!(a.id(), response.id);
    assert_eq!(a.owns_channel(), response.channel_id);

    // Alice cranks, emitting her prefund signature; Bob boots his objective from it.
    let (next, effects, waiting) = a.crank(&alice).unwrap();
    a = next;
    assert_eq!(waiting, directfund::WAITING_FOR_COMPLETE_PREFUND);
    let payloads = objective_payloads(&effects);
    assert_eq!(payloads.len(), 1);
    let mut b = directfund::construct_from_payload(&payloads[0], true, bob.address()).unwrap();
    b = b.update(&payloads[0]).unwrap();

    // Bob countersigns the prefund; Alice ingests it.
    let (next, effects, _) = b.crank(&bob).unwrap();
    b = next;
    for payload in objective_payloads(&effects) {
        a = a.update(&payload).unwrap();
    }

    // Prefund complete. Alice (participant 0) deposits first.
    let (next, effects, waiting) = a.crank(&alice).unwrap();
    a = next;
    assert_eq!(waiting, directfund::WAITING_FOR_COMPLETE_FUNDING);
    assert!(matches!(
        effects.transactions_to_submit.as_slice(),
        [ChainTransaction::Deposit { .. }]
    ));

    // Bob must wait for Alice's deposit before his own.
    let (next, _, waiting) = b.crank(&bob).unwrap();
    b = next;
    assert_eq!(waiting, directfund::WAITING_FOR_MY_TURN_TO_FUND);

    // Alice's deposit lands on chain.
    let event = deposited(a.owns_channel(), 1, 10);
    a.c.update_with_chain_event(&event).unwrap();
    b.c.update_with_chain_event(&event).unwrap();

    let (next, effects, waiting) = b.crank(&bob).unwrap();
    b = next;
    assert_eq!(waiting, directfund::WAITING_FOR_COMPLETE_FUNDING);
    assert!(matches!(
        effects.transactions_to_submit.as_slice(),
        [ChainTransaction::Deposit { .. }]
    ));

    // Bob's deposit lands; the channel is fully funded.
    let event = deposited(a.owns_channel(), 2, 20);
    a.c.update_with_chain_event(&event).unwrap();
    b.c.update_with_chain_event(&event).unwrap();

    // Postfund exchange.
    let (next, effects, waiting) = a.crank(&alice).unwrap();
    a = next;
    assert_eq!(waiting, directfund::WAITING_FOR_COMPLETE_POST_FUND);
    let to_bob = objective_payloads(&effects);
    let (next, effects, _) = b.crank(&bob).unwrap();
    b = next;
    let to_alice = objective_payloads(&effects);
    for payload in to_bob {
        b = b.update(&payload).unwrap();
    }
    for payload in to_alice {
        a = a.update(&payload).unwrap();
    }

    // Both sides crank to completion.
    let (next, _, waiting) = a.crank(&alice).unwrap();
    a = next;
    assert_eq!(waiting, directfund::WAITING_FOR_NOTHING);
    assert_eq!(a.status, ObjectiveStatus::Completed);
    let (next, _, waiting) = b.crank(&bob).unwrap();
    b = next;
    assert_eq!(waiting, directfund::WAITING_FOR_NOTHING);
    assert_eq!(b.status, ObjectiveStatus::Completed);

    // Complementary consensus channels with a matching outcome.
    let cc_a = a.create_consensus_channel().unwrap();
    let cc_b = b.create_consensus_channel().unwrap();
    assert!(cc_a.is_leader());
    assert!(cc_b.is_follower());
    assert_eq!(cc_a.consensus_vars(), cc_b.consensus_vars());
    assert_eq!(
        cc_a.on_chain_funding.amount(&Address::ZERO),
        U256::from(20)
    );
}

#[test]
fn second_crank_emits_no_new_effects() {
    let (alice, bob) = (alice_key(), bob_key());
    let request = directfund::ObjectiveRequest::new(
        bob.address(),
        100,
        split_equally_outcome(alice.address(), bob.address(), 10),
        1,
        Address::ZERO,
    );
    let a = directfund::new_objective(
        &request,
        true,
        alice.address(),
        |_| Ok(Vec::new()),
        |_| None,
    )
    .unwrap();

    let (a, first_effects, _) = a.crank(&alice).unwrap();
    assert!(!first_effects.messages_to_send.is_empty());

    // No new inbound data: the prefund signature must not be re-sent.
    let (_, second_effects, waiting) = a.crank(&alice).unwrap();
    assert!(second_effects.is_empty());
    assert_eq!(waiting, directfund::WAITING_FOR_COMPLETE_PREFUND);
}

#[test]
fn completed_objective_is_terminal() {
    let (alice, bob) = (alice_key(), bob_key());
    let request = directfund::ObjectiveRequest::new(
        bob.address(),
        100,
        split_equally_outcome(alice.address(), bob.address(), 10),
        2,
        Address::ZERO,
    );
    let mut a = directfund::new_objective(
        &request,
        true,
        alice.address(),
        |_| Ok(Vec::new()),
        |_| None,
    )
    .unwrap();
    let mut b = {
        let (next, effects, _) = a.crank(&alice).unwrap();
        a = next;
        let payloads = objective_payloads(&effects);
        let b = directfund::construct_from_payload(&payloads[0], true, bob.address()).unwrap();
        b.update(&payloads[0]).unwrap()
    };
    let (next, effects, _) = b.crank(&bob).unwrap();
    b = next;
    for payload in objective_payloads(&effects) {
        a = a.update(&payload).unwrap();
    }
    let event = deposited(a.owns_channel(), 1, 20);
    a.c.update_with_chain_event(&event).unwrap();
    b.c.update_with_chain_event(&event).unwrap();
    let (next, effects, _) = a.crank(&alice).unwrap();
    a = next;
    let to_bob = objective_payloads(&effects);
    let (next, effects, _) = b.crank(&bob).unwrap();
    b = next;
    for payload in to_bob {
        b = b.update(&payload).unwrap();
    }
    for payload in objective_payloads(&effects) {
        a = a.update(&payload).unwrap();
    }
    let (a, _, _) = a.crank(&alice).unwrap();
    assert_eq!(a.status, ObjectiveStatus::Completed);

    // Terminality: a completed objective refuses further cranks, so no transaction or
    // message can ever be emitted again and the status cannot move.
    let err = a.crank(&alice).unwrap_err();
    assert!(err.downcast_ref::<weir::protocols::NotApproved>().is_some());
    assert_eq!(a.status, ObjectiveStatus::Completed);
    let _ = b;
}

/// Builds a leader/follower consensus channel pair over a 100/100 outcome, optionally
/// carrying a guarantee for `target`.
fn consensus_pair(
    leader_key: &SecretKey,
    follower_key: &SecretKey,
    nonce: u64,
    guarantee: Option<Guarantee>,
) -> (ConsensusChannel, ConsensusChannel) {
    let fp = FixedPart {
        participants: vec![leader_key.address(), follower_key.address()],
        channel_nonce: nonce,
        app_definition: Address::ZERO,
        challenge_duration: 100,
    };
    let mut outcome = LedgerOutcome::new(
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
    if let Some(guarantee) = guarantee {
        outcome.guarantees.insert(guarantee.target, guarantee);
    }
    let vars = Vars {
        turn_num: 1,
        outcome: outcome.clone(),
    };
    let state = vars.as_state(&fp);
    let signatures = [
        state.sign(leader_key).unwrap(),
        state.sign(follower_key).unwrap(),
    ];
    let mut leader =
        ConsensusChannel::new_leader_channel(fp.clone(), 1, outcome.clone(), signatures).unwrap();
    let mut follower =
        ConsensusChannel::new_follower_channel(fp, 1, outcome, signatures).unwrap();
    leader.on_chain_funding.insert(Address::ZERO, U256::from(200));
    follower.on_chain_funding.insert(Address::ZERO, U256::from(200));
    (leader, follower)
}

#[test]
fn defund_with_running_guarantees_is_refused() {
    let (alice, bob) = (alice_key(), bob_key());
    let target = Destination(B256::repeat_byte(9));
    let guarantee = Guarantee {
        amount: U256::from(20),
        target,
        left: Destination::from_address(alice.address()),
        right: Destination::from_address(bob.address()),
    };
    let (leader, _) = consensus_pair(&alice, &bob, 3, Some(guarantee));

    let request = directdefund::ObjectiveRequest::new(leader.id, false);
    let err = directdefund::new_objective(
        &request,
        true,
        |_| Ok(leader.clone()),
        |_| None,
        false,
    )
    .unwrap_err();
    assert!(err.downcast_ref::<directdefund::LedgerNotEmpty>().is_some());
}

#[test]
fn cooperative_defund_runs_to_completion() {
    let (alice, bob) = (alice_key(), bob_key());
    let (leader, follower) = consensus_pair(&alice, &bob, 4, None);

    let request = directdefund::ObjectiveRequest::new(leader.id, false);
    let mut a =
        directdefund::new_objective(&request, true, |_| Ok(leader.clone()), |_| None, false)
            .unwrap();
    let mut b =
        directdefund::new_objective(&request, true, |_| Ok(follower.clone()), |_| None, false)
            .unwrap();

    // Both sides sign and exchange the final state.
    let (next, effects, waiting) = a.crank(&alice).unwrap();
    a = next;
    assert_eq!(waiting, directdefund::WAITING_FOR_FINALIZATION);
    let to_bob = objective_payloads(&effects);
    let (next, effects, _) = b.crank(&bob).unwrap();
    b = next;
    for payload in to_bob {
        b = b.update(&payload).unwrap();
    }
    for payload in objective_payloads(&effects) {
        a = a.update(&payload).unwrap();
    }

    // The lowest-indexed participant submits the withdrawal; everyone else just waits.
    let (next, effects, waiting) = a.crank(&alice).unwrap();
    a = next;
    assert_eq!(waiting, directdefund::WAITING_FOR_WITHDRAW);
    assert!(matches!(
        effects.transactions_to_submit.as_slice(),
        [ChainTransaction::WithdrawAll { .. }]
    ));
    let (next, effects, waiting) = b.crank(&bob).unwrap();
    b = next;
    assert_eq!(waiting, directdefund::WAITING_FOR_WITHDRAW);
    assert!(effects.transactions_to_submit.is_empty());

    // A repeated crank must not resubmit the withdrawal.
    let (next, effects, _) = a.crank(&alice).unwrap();
    a = next;
    assert!(effects.transactions_to_submit.is_empty());

    // The withdrawal empties the channel on chain.
    let drained = ChainEvent {
        channel_id: a.owns_channel(),
        block_num: 3,
        tx_index: 0,
        kind: ChainEventKind::AllocationUpdated {
            asset: Address::ZERO,
            now_held: U256::ZERO,
        },
    };
    a.c.update_with_chain_event(&drained).unwrap();
    b.c.update_with_chain_event(&drained).unwrap();

    let (a, _, waiting) = a.crank(&alice).unwrap();
    assert_eq!(waiting, directdefund::WAITING_FOR_NOTHING);
    assert_eq!(a.status, ObjectiveStatus::Completed);
    let (b, _, _) = b.crank(&bob).unwrap();
    assert_eq!(b.status, ObjectiveStatus::Completed);
}

#[test]
fn challenge_defund_escalates_to_chain() {
    let (alice, bob) = (alice_key(), bob_key());
    let (leader, _follower) = consensus_pair(&alice, &bob, 10, None);

    let request = directdefund::ObjectiveRequest::new(leader.id, true);
    let mut a =
        directdefund::new_objective(&request, true, |_| Ok(leader.clone()), |_| None, false)
            .unwrap();
    assert!(a.is_challenge);

    // The challenge transaction is declared exactly once.
    let (next, effects, waiting) = a.crank(&alice).unwrap();
    a = next;
    assert_eq!(waiting, directdefund::WAITING_FOR_CHALLENGE);
    let [ChainTransaction::Challenge { candidate, .. }] = effects.transactions_to_submit.as_slice()
    else {
        panic!("expected a challenge transaction");
    };

    // The challenge registers on chain; the channel enters challenge mode.
    let event = ChainEvent {
        channel_id: a.owns_channel(),
        block_num: 1,
        tx_index: 0,
        kind: ChainEventKind::ChallengeRegistered {
            candidate: candidate.clone(),
            finalizes_at: U256::from(100),
            is_initiated_by_me: true,
        },
    };
    a.c.update_with_chain_event(&event).unwrap();
    a.c.update_channel_mode(50);

    let (next, effects, waiting) = a.crank(&alice).unwrap();
    a = next;
    assert_eq!(waiting, directdefund::WAITING_FOR_FINALIZATION);
    assert!(effects.transactions_to_submit.is_empty());

    // The challenge window lapses; the outcome is liquidated in one transfer.
    a.c.update_channel_mode(100);
    let (next, effects, waiting) = a.crank(&alice).unwrap();
    a = next;
    assert_eq!(waiting, directdefund::WAITING_FOR_WITHDRAW);
    assert!(matches!(
        effects.transactions_to_submit.as_slice(),
        [ChainTransaction::TransferAll { .. }]
    ));

    // Funds leave the chain; the objective completes.
    let drained = ChainEvent {
        channel_id: a.owns_channel(),
        block_num: 2,
        tx_index: 0,
        kind: ChainEventKind::AllocationUpdated {
            asset: Address::ZERO,
            now_held: U256::ZERO,
        },
    };
    a.c.update_with_chain_event(&drained).unwrap();
    let (a, _, waiting) = a.crank(&alice).unwrap();
    assert_eq!(waiting, directdefund::WAITING_FOR_NOTHING);
    assert_eq!(a.status, ObjectiveStatus::Completed);
}

#[test]
fn unapproved_objective_refuses_to_crank() {
    let (alice, bob) = (alice_key(), bob_key());
    let request = directfund::ObjectiveRequest::new(
        bob.address(),
        100,
        split_equally_outcome(alice.address(), bob.address(), 10),
        5,
        Address::ZERO,
    );
    let a = directfund::new_objective(
        &request,
        false,
        alice.address(),
        |_| Ok(Vec::new()),
        |_| None,
    )
    .unwrap();
    let err = a.crank(&alice).unwrap_err();
    assert!(err.downcast_ref::<weir::protocols::NotApproved>().is_some());

    // Approval unblocks it.
    let approved = a.approve();
    assert!(approved.crank(&alice).is_ok());
}

#[test]
fn objective_json_round_trip_preserves_status_and_channel_id() {
    let (alice, bob) = (alice_key(), bob_key());
    let request = directfund::ObjectiveRequest::new(
        bob.address(),
        100,
        split_equally_outcome(alice.address(), bob.address(), 10),
        6,
        Address::ZERO,
    );
    let inner = directfund::new_objective(
        &request,
        true,
        alice.address(),
        |_| Ok(Vec::new()),
        |_| None,
    )
    .unwrap();
    let objective = Objective::DirectFund(inner);

    let encoded = serde_json::to_vec(&objective).unwrap();
    let decoded: Objective = serde_json::from_slice(&encoded).unwrap();

    // The projection is lossy by contract: status and channel id survive, channel history
    // does not, so only the preserved fields are compared.
    assert_eq!(decoded.get_status(), objective.get_status());
    assert_eq!(decoded.owns_channel(), objective.owns_channel());
    assert_eq!(decoded.id(), objective.id());
}

/// Builds a fully funded two-party swap channel between Alice and Bob, supported at the
/// postfund state.
fn swap_channel_pair(alice: &SecretKey, bob: &SecretKey, nonce: u64) -> (SwapChannel, SwapChannel) {
    let state = State {
        participants: vec![alice.address(), bob.address()],
        channel_nonce: nonce,
        app_definition: Address::ZERO,
        challenge_duration: 100,
        app_data: Vec::new(),
        outcome: split_equally_outcome(alice.address(), bob.address(), 10),
        turn_num: 0,
        is_final: false,
    };
    let mut a = SwapChannel::new(state.clone(), 0).unwrap();
    let mut b = SwapChannel::new(state, 1).unwrap();
    let ss_a = a.sign_and_add_prefund(alice).unwrap();
    let ss_b = b.sign_and_add_prefund(bob).unwrap();
    assert!(a.add_signed_state(ss_b));
    assert!(b.add_signed_state(ss_a));
    let ss_a = a.sign_and_add_postfund(alice).unwrap();
    let ss_b = b.sign_and_add_postfund(bob).unwrap();
    assert!(a.add_signed_state(ss_b));
    assert!(b.add_signed_state(ss_a));
    assert!(a.post_fund_complete());
    (a, b)
}

fn deliver_swapdefund_payloads(
    effects: &SideEffects,
    to: &swapdefund::Objective,
) -> swapdefund::Objective {
    let mut updated = to.clone();
    for payload in objective_payloads(effects) {
        updated = updated.update(&payload).unwrap();
    }
    updated
}

fn deliver_swapdefund_proposals(
    effects: &SideEffects,
    to: &swapdefund::Objective,
) -> swapdefund::Objective {
    let mut updated = to.clone();
    for message in &effects.messages_to_send {
        if let MessagePayload::LedgerProposals(proposals) = &message.payload {
            for sp in proposals {
                updated = updated.receive_proposal(sp.clone()).unwrap();
            }
        }
    }
    updated
}

#[test]
fn swap_exchange_runs_to_completion() {
    use weir::protocols::swap;

    let (alice, bob) = (alice_key(), bob_key());
    let asset_one = Address::repeat_byte(1);

    // A two-asset swap channel, fully funded and supported at the postfund state.
    let state = State {
        participants: vec![alice.address(), bob.address()],
        channel_nonce: 11,
        app_definition: Address::ZERO,
        challenge_duration: 100,
        app_data: Vec::new(),
        outcome: Exit(vec![
            SingleAssetExit {
                asset: Address::ZERO,
                asset_metadata: Vec::new(),
                allocations: vec![
                    Allocation::normal(Destination::from_address(alice.address()), U256::from(10)),
                    Allocation::normal(Destination::from_address(bob.address()), U256::from(10)),
                ],
            },
            SingleAssetExit {
                asset: asset_one,
                asset_metadata: Vec::new(),
                allocations: vec![
                    Allocation::normal(Destination::from_address(alice.address()), U256::from(10)),
                    Allocation::normal(Destination::from_address(bob.address()), U256::from(10)),
                ],
            },
        ]),
        turn_num: 0,
        is_final: false,
    };
    let mut swap_a = SwapChannel::new(state.clone(), 0).unwrap();
    let mut swap_b = SwapChannel::new(state, 1).unwrap();
    let ss_a = swap_a.sign_and_add_prefund(&alice).unwrap();
    let ss_b = swap_b.sign_and_add_prefund(&bob).unwrap();
    assert!(swap_a.add_signed_state(ss_b));
    assert!(swap_b.add_signed_state(ss_a));
    let ss_a = swap_a.sign_and_add_postfund(&alice).unwrap();
    let ss_b = swap_b.sign_and_add_postfund(&bob).unwrap();
    assert!(swap_a.add_signed_state(ss_b));
    assert!(swap_b.add_signed_state(ss_a));

    // Alice offers 2 of the native asset for 3 of asset one.
    let request = swap::ObjectiveRequest::new(
        swap_a.id,
        Address::ZERO,
        asset_one,
        U256::from(2),
        U256::from(3),
        1,
    );
    let mut a = swap::new_objective(&request, true, true, |_| Some(swap_a.clone())).unwrap();

    let (next, effects, waiting) = a.crank(&alice).unwrap();
    a = next;
    assert_eq!(waiting, swap::WAITING_FOR_CONSENSUS);
    let payloads = objective_payloads(&effects);
    assert_eq!(payloads.len(), 1);

    // Bob boots his objective from the proposal and must confirm before signing.
    let mut b =
        swap::construct_objective_from_payload(&payloads[0], true, |_| Some(swap_b.clone()))
            .unwrap();
    b = b.update(&payloads[0]).unwrap();
    let (next, _, waiting) = b.crank(&bob).unwrap();
    b = next;
    assert_eq!(waiting, swap::WAITING_FOR_CONFIRMATION);

    // Bob accepts, signs, applies the exchange and completes.
    b = b.accept_swap();
    let (next, effects, waiting) = b.crank(&bob).unwrap();
    b = next;
    assert_eq!(waiting, swap::WAITING_FOR_NOTHING);
    assert_eq!(b.status, ObjectiveStatus::Completed);
    assert_eq!(b.c.swaps.len(), 1);

    // Alice ingests Bob's signatures and completes too.
    for payload in objective_payloads(&effects) {
        a = a.update(&payload).unwrap();
    }
    let (a, _, waiting) = a.crank(&alice).unwrap();
    assert_eq!(waiting, swap::WAITING_FOR_NOTHING);
    assert_eq!(a.status, ObjectiveStatus::Completed);

    // Both sides agree on the post-swap outcome.
    let outcome_a = a.c.latest_supported_state().unwrap();
    let outcome_b = b.c.latest_supported_state().unwrap();
    assert_eq!(outcome_a, outcome_b);
    assert_eq!(outcome_a.turn_num, 2);
    let native = &outcome_a.outcome.0[0].allocations;
    assert_eq!(native[0].amount, U256::from(8));
    assert_eq!(native[1].amount, U256::from(12));
    let other = &outcome_a.outcome.0[1].allocations;
    assert_eq!(other[0].amount, U256::from(13));
    assert_eq!(other[1].amount, U256::from(7));
}

#[test]
fn swap_defund_runs_to_completion() {
    let (alice, bob) = (alice_key(), bob_key());
    let (swap_a, swap_b) = swap_channel_pair(&alice, &bob, 7);
    let target = swap_a.id;

    let guarantee = Guarantee {
        amount: U256::from(20),
        target,
        left: Destination::from_address(alice.address()),
        right: Destination::from_address(bob.address()),
    };
    let (ledger_leader, ledger_follower) = consensus_pair(&alice, &bob, 8, Some(guarantee));

    let request = swapdefund::ObjectiveRequest::new(target);
    let mut a = swapdefund::new_objective(
        &request,
        true,
        alice.address(),
        |_| Some(swap_a.clone()),
        |_| Some(ledger_leader.clone()),
    )
    .unwrap();
    let mut b = swapdefund::new_objective(
        &request,
        true,
        bob.address(),
        |_| Some(swap_b.clone()),
        |_| Some(ledger_follower.clone()),
    )
    .unwrap();

    // Bob does not know the final outcome: he must ask Alice and wait.
    let (next, effects, waiting) = b.crank(&bob).unwrap();
    b = next;
    assert_eq!(waiting, swapdefund::WAITING_FOR_FINAL_STATE_FROM_ALICE);
    let request_messages: Vec<&Message> = effects
        .messages_to_send
        .iter()
        .filter(|m| m.to == alice.address())
        .collect();
    assert_eq!(request_messages.len(), 1);

    // Alice generates and signs the final state.
    let (next, effects, waiting) = a.crank(&alice).unwrap();
    a = next;
    assert_eq!(waiting, swapdefund::WAITING_FOR_SUPPORTED_FINAL_STATE);
    b = deliver_swapdefund_payloads(&effects, &b);

    // Bob countersigns the final state and waits for the ledger update.
    let (next, effects, waiting) = b.crank(&bob).unwrap();
    b = next;
    assert_eq!(waiting, swapdefund::WAITING_FOR_DEFUNDING_ON_MY_LEFT);
    a = deliver_swapdefund_payloads(&effects, &a);

    // Alice (ledger leader) proposes removing the guarantee.
    let (next, effects, waiting) = a.crank(&alice).unwrap();
    a = next;
    assert_eq!(waiting, swapdefund::WAITING_FOR_DEFUNDING_ON_MY_RIGHT);
    b = deliver_swapdefund_proposals(&effects, &b);

    // Bob countersigns the removal and completes.
    let (next, effects, waiting) = b.crank(&bob).unwrap();
    b = next;
    assert_eq!(waiting, swapdefund::WAITING_FOR_NOTHING);
    assert_eq!(b.status, ObjectiveStatus::Completed);
    a = deliver_swapdefund_proposals(&effects, &a);

    // Alice folds the countersignature in and completes too.
    let (next, _, waiting) = a.crank(&alice).unwrap();
    a = next;
    assert_eq!(waiting, swapdefund::WAITING_FOR_NOTHING);
    assert_eq!(a.status, ObjectiveStatus::Completed);

    assert!(
        !a.to_my_right
            .as_ref()
            .map(|l| l.includes_target(target))
            .unwrap_or(false)
    );
}
