//! Crash recovery and at-least-once delivery during a contract upgrade

use accord_core::{NetworkMessage, SessionMessage, SignedTransaction, StateMachineConfig};
use accord_flows::{authorise_contract_upgrade, ContractUpgrade};
use accord_tests::{upgraded_contract, TwoParties};
use accord_test_utils::{await_flow, wait_until, MockNode, TestError, DEFAULT_FLOW_TIMEOUT};

fn inits_from(messages: &[NetworkMessage], node: &MockNode) -> Vec<NetworkMessage> {
    messages
        .iter()
        .filter(|m| m.sender == *node.party())
        .filter(|m| matches!(m.body, SessionMessage::Init { .. }))
        .cloned()
        .collect()
}

fn confirms_from(messages: &[NetworkMessage], node: &MockNode) -> usize {
    messages
        .iter()
        .filter(|m| m.sender == *node.party())
        .filter(|m| matches!(m.body, SessionMessage::Confirm { .. }))
        .count()
}

#[tokio::test]
async fn test_instigator_resumes_after_restart() -> Result<(), TestError> {
    let mut parties = TwoParties::new(StateMachineConfig::default()).await?;
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
    let flow_id = handle.flow_id().clone();
    drop(handle);

    let network = parties.network.network().clone();
    let bob_party = parties.bob.party().clone();
    wait_until(DEFAULT_FLOW_TIMEOUT, || {
        let queued = network.pending(&bob_party);
        async move { queued == 1 }
    })
    .await?;

    let report = parties.alice.restart().await?;
    assert_eq!(report.restored, vec![flow_id.clone()]);
    assert!(report.failed.is_empty());

    let handle = parties
        .alice
        .manager()?
        .track::<SignedTransaction>(&flow_id)?;
    parties.bob.start().await?;
    let stx = await_flow(handle, DEFAULT_FLOW_TIMEOUT).await?;
    assert_eq!(stx.sigs.len(), 2);

    let sent = network.sent_messages();
    let inits = inits_from(&sent, &parties.alice);
    assert_eq!(inits.len(), 2, "the restored flow re-sends its init");
    assert_eq!(inits[0].message_id, inits[1].message_id);
    assert_eq!(confirms_from(&sent, &parties.bob), 1, "Bob runs a single acceptor");

    let bob = &parties.bob;
    let id = stx.id()?;
    wait_until(DEFAULT_FLOW_TIMEOUT, || async move {
        bob.recorded_transactions()
            .await
            .map(|txs| txs.iter().any(|tx| tx.id().ok() == Some(id)))
            .unwrap_or(false)
    })
    .await?;
    assert_eq!(parties.alice.provider().checkpoint_count(), 0);
    Ok(())
}

#[tokio::test]
async fn test_duplicate_deliveries_are_idempotent() -> Result<(), TestError> {
    let parties = TwoParties::new(StateMachineConfig::default()).await?;
    let TwoParties {
        network,
        alice,
        bob,
        state,
    } = &parties;
    let transport = network.network();
    authorise_contract_upgrade(bob.services()?, state, &upgraded_contract()).await?;

    transport.set_online(bob.party(), false)?;
    let handle = alice
        .manager()?
        .start_flow(ContractUpgrade::instigator(state.clone(), upgraded_contract()))
        .await?;
    wait_until(DEFAULT_FLOW_TIMEOUT, || {
        let queued = transport.pending(bob.party());
        async move { queued == 1 }
    })
    .await?;

    let init = inits_from(&transport.sent_messages(), alice)
        .pop()
        .ok_or_else(|| TestError::TestSetupFailed("no init was sent".to_string()))?;
    transport.redeliver(init)?;
    transport.set_online(bob.party(), true)?;

    let stx = await_flow(handle, DEFAULT_FLOW_TIMEOUT).await?;
    let id = stx.id()?;
    wait_until(DEFAULT_FLOW_TIMEOUT, || async move {
        bob.recorded_transactions()
            .await
            .map(|txs| txs.len() == 2)
            .unwrap_or(false)
    })
    .await?;
    assert_eq!(confirms_from(&transport.sent_messages(), bob), 1);

    // replay the whole conversation to both sides once it is over
    let sent_before = transport.sent_messages().len();
    for message in transport.sent_messages() {
        transport.redeliver(message)?;
    }
    wait_until(DEFAULT_FLOW_TIMEOUT, || {
        let drained = transport.pending(alice.party()) + transport.pending(bob.party()) == 0;
        async move { drained }
    })
    .await?;

    assert_eq!(transport.sent_messages().len(), sent_before);
    for node in [alice, bob] {
        let txs = node.recorded_transactions().await?;
        assert_eq!(txs.len(), 2);
        assert!(txs.iter().any(|tx| tx.id().ok() == Some(id)));
        assert!(node.manager()?.live_flows().is_empty());
    }
    Ok(())
}
