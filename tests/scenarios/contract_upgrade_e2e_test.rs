//! End-to-end contract upgrade between two nodes
//!
//! Covers the authorised and unauthorised paths, a participant that never
//! answers, and a state owned by the instigator alone.

use std::sync::Arc;
use std::time::Duration;

use accord_core::{
    SecureHash, SessionMessage, SignedTransaction, StateAndRef, StateMachineConfig, StateRef,
};
use accord_flows::{authorise_contract_upgrade, ContractUpgrade};
use accord_monitoring::MetricsEventHandler;
use accord_tests::{fast_timeouts, flow_registry, upgraded_contract, TwoParties};
use accord_test_utils::{
    assert_exception, await_flow, dummy_state, expect_flow_exception, wait_until, MockNetwork,
    TestError, DEFAULT_FLOW_TIMEOUT,
};

#[tokio::test]
async fn test_authorised_upgrade_is_recorded_by_both_parties() -> Result<(), TestError> {
    let parties = TwoParties::new(StateMachineConfig::default()).await?;
    let TwoParties {
        alice, bob, state, ..
    } = &parties;

    authorise_contract_upgrade(bob.services()?, state, &upgraded_contract()).await?;
    let handle = alice
        .manager()?
        .start_flow(ContractUpgrade::instigator(state.clone(), upgraded_contract()))
        .await?;
    let stx: SignedTransaction = await_flow(handle, DEFAULT_FLOW_TIMEOUT).await?;

    assert_eq!(stx.tx.inputs, vec![state.state_ref]);
    assert_eq!(stx.tx.outputs.len(), 1);
    assert_eq!(stx.tx.outputs[0].contract, upgraded_contract());
    assert_eq!(stx.tx.outputs[0].data["magic_number"], 7);
    assert_eq!(stx.sigs.len(), 2);
    stx.verify_required_signatures()?;

    let id = stx.id()?;
    wait_until(DEFAULT_FLOW_TIMEOUT, || async move {
        bob.recorded_transactions()
            .await
            .map(|txs| txs.iter().any(|tx| tx.id().ok() == Some(id)))
            .unwrap_or(false)
    })
    .await?;

    for node in [alice, bob] {
        let unconsumed = node.services()?.vault().unconsumed_states().await?;
        assert_eq!(unconsumed.len(), 1, "{:?} holds one state", node);
        assert_eq!(unconsumed[0].state.contract, upgraded_contract());
        assert_eq!(unconsumed[0].state_ref.txhash, id);
    }
    Ok(())
}

#[tokio::test]
async fn test_unauthorised_upgrade_is_rejected() -> Result<(), TestError> {
    let parties = TwoParties::new(StateMachineConfig::default()).await?;
    let TwoParties {
        alice, bob, state, ..
    } = &parties;

    let handle = alice
        .manager()?
        .start_flow(ContractUpgrade::instigator(state.clone(), upgraded_contract()))
        .await?;
    let exception = expect_flow_exception(handle, DEFAULT_FLOW_TIMEOUT).await;

    assert_exception(&exception, "state_replacement.rejected", "unauthorised");
    assert!(exception.message.contains(&state.state_ref.to_string()));
    assert_eq!(alice.recorded_transactions().await?.len(), 1);
    assert_eq!(bob.recorded_transactions().await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_silent_participant_times_out() -> Result<(), TestError> {
    let mut parties = TwoParties::new(fast_timeouts(Duration::from_millis(150))).await?;
    authorise_contract_upgrade(parties.bob.services()?, &parties.state, &upgraded_contract())
        .await?;
    parties.bob.stop()?;

    let handle = parties
        .alice
        .manager()?
        .start_flow(ContractUpgrade::instigator(
            parties.state.clone(),
            upgraded_contract(),
        ))
        .await?;
    let exception = expect_flow_exception(handle, DEFAULT_FLOW_TIMEOUT).await;

    assert_exception(&exception, "state_replacement.timeout", "Bob");
    let alice = &parties.alice;
    wait_until(DEFAULT_FLOW_TIMEOUT, || async move {
        alice.provider().checkpoint_count() == 0
    })
    .await?;
    assert!(parties.network.network().pending(parties.bob.party()) >= 1);
    Ok(())
}

#[tokio::test]
async fn test_sole_participant_upgrades_without_sessions() -> Result<(), TestError> {
    let mut network = MockNetwork::new(flow_registry());
    let alice = network.create_node("Alice").await?;
    network.create_node("Bob").await?;
    let state = network
        .issue(dummy_state(3, &[alice.party().owning_key]), &[&alice])
        .await?;

    let handle = alice
        .manager()?
        .start_flow(ContractUpgrade::instigator(state, upgraded_contract()))
        .await?;
    let stx = await_flow(handle, DEFAULT_FLOW_TIMEOUT).await?;

    assert_eq!(stx.sigs.len(), 1);
    assert_eq!(stx.tx.outputs[0].contract, upgraded_contract());
    assert!(network.network().sent_messages().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_sole_participant_upgrade_is_verified_before_recording() -> Result<(), TestError> {
    let mut network = MockNetwork::new(flow_registry());
    let alice = network.create_node("Alice").await?;
    let issued = network
        .issue(dummy_state(3, &[alice.party().owning_key]), &[&alice])
        .await?;

    // Same state, but pointing at a transaction Alice never recorded
    let unknown = StateAndRef {
        state: issued.state.clone(),
        state_ref: StateRef {
            txhash: SecureHash::sha256(b"never recorded"),
            index: 0,
        },
    };
    let handle = alice
        .manager()?
        .start_flow(ContractUpgrade::instigator(unknown, upgraded_contract()))
        .await?;
    let exception = expect_flow_exception(handle, DEFAULT_FLOW_TIMEOUT).await;

    assert_exception(
        &exception,
        "state_replacement.invalid_final_transaction",
        "Transaction not found",
    );
    assert_eq!(alice.recorded_transactions().await?.len(), 1);
    let unconsumed = alice.services()?.vault().unconsumed_states().await?;
    assert_eq!(unconsumed, vec![issued]);
    Ok(())
}

#[tokio::test]
async fn test_flow_events_reach_metrics_handler() -> Result<(), TestError> {
    let metrics = Arc::new(MetricsEventHandler::new());
    let mut network = MockNetwork::new(flow_registry()).with_event_handler(metrics.clone());
    let alice = network.create_node("Alice").await?;
    let bob = network.create_node("Bob").await?;
    let state = network
        .issue(
            dummy_state(1, &[alice.party().owning_key, bob.party().owning_key]),
            &[&alice, &bob],
        )
        .await?;
    authorise_contract_upgrade(bob.services()?, &state, &upgraded_contract()).await?;

    let handle = alice
        .manager()?
        .start_flow(ContractUpgrade::instigator(state, upgraded_contract()))
        .await?;
    await_flow(handle, DEFAULT_FLOW_TIMEOUT).await?;

    let handler = &metrics;
    wait_until(DEFAULT_FLOW_TIMEOUT, || async move {
        handler.count("flow.completed") == 2
    })
    .await?;
    assert_eq!(handler.count("flow.created"), 2);
    assert_eq!(handler.count("flow.failed"), 0);

    let inits = network
        .network()
        .sent_messages()
        .into_iter()
        .filter(|m| matches!(m.body, SessionMessage::Init { .. }))
        .count();
    assert_eq!(inits, 1);
    Ok(())
}

#[tokio::test]
async fn test_one_refusal_blocks_the_upgrade_for_everyone() -> Result<(), TestError> {
    let mut network = MockNetwork::new(flow_registry());
    let alice = network.create_node("Alice").await?;
    let bob = network.create_node("Bob").await?;
    let charlie = network.create_node("Charlie").await?;
    let participants = [
        alice.party().owning_key,
        bob.party().owning_key,
        charlie.party().owning_key,
    ];
    let state = network
        .issue(dummy_state(5, &participants), &[&alice, &bob, &charlie])
        .await?;
    authorise_contract_upgrade(bob.services()?, &state, &upgraded_contract()).await?;

    let handle = alice
        .manager()?
        .start_flow(ContractUpgrade::instigator(state, upgraded_contract()))
        .await?;
    let exception = expect_flow_exception(handle, DEFAULT_FLOW_TIMEOUT).await;
    assert_exception(&exception, "state_replacement.rejected", "Charlie");

    let finals = network
        .network()
        .sent_messages()
        .into_iter()
        .filter(|m| m.sender == *alice.party())
        .filter(|m| matches!(m.body, SessionMessage::Data { .. }))
        .count();
    assert_eq!(finals, 0, "no final transaction is distributed");
    for node in [&alice, &bob, &charlie] {
        assert_eq!(node.recorded_transactions().await?.len(), 1);
    }
    Ok(())
}
