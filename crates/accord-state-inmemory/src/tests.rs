use crate::{InMemoryNetwork, InMemoryStateStoreProvider};
use accord_core::{
    ContractRegistry, CoreError, FlowId, FlowRegistry, KeyPair, MessageId, MessagingService,
    NetworkMessage, Party, ServiceHub, SessionId, SessionMessage, StateMachineConfig,
    StateMachineManager, TracingEventHandler,
};
use std::sync::Arc;
use std::time::Duration;

fn party(name: &str) -> Party {
    Party {
        name: name.to_string(),
        owning_key: KeyPair::from_seed(name).public_key(),
    }
}

fn node(network: &InMemoryNetwork, name: &str) -> StateMachineManager {
    let me = party(name);
    let provider = InMemoryStateStoreProvider::new(me.owning_key);
    let repositories = provider.create_repositories();
    let hub = ServiceHub::new(
        me.clone(),
        Arc::new(KeyPair::from_seed(name)),
        repositories.transactions,
        repositories.vault,
        repositories.identities,
        Arc::new(ContractRegistry::new()),
    )
    .unwrap();

    StateMachineManager::new(
        hub,
        repositories.checkpoints,
        Arc::new(network.register(me)),
        FlowRegistry::new(),
        StateMachineConfig::default(),
        Arc::new(TracingEventHandler),
    )
    .unwrap()
}

fn unknown_init(from: &Party, to: &Party) -> NetworkMessage {
    NetworkMessage {
        message_id: MessageId::random(),
        sender: from.clone(),
        recipient: to.clone(),
        body: SessionMessage::Init {
            session_id: SessionId::random(),
            initiator_flow_id: FlowId::random(),
            flow_name: "demo.unknown".to_string(),
            payload: None,
        },
    }
}

async fn wait_until(condition: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn rejects(network: &InMemoryNetwork) -> usize {
    network
        .sent_messages()
        .iter()
        .filter(|m| matches!(m.body, SessionMessage::Reject { .. }))
        .count()
}

#[tokio::test]
async fn test_provider_shares_stores_across_repositories() -> Result<(), CoreError> {
    let provider = InMemoryStateStoreProvider::new(party("Alice").owning_key);
    let first = provider.create_repositories();
    first
        .checkpoints
        .save(&FlowId("f1".to_string()), b"{}".to_vec())
        .await?;
    first.identities.register(party("Bob")).await?;

    let second = provider.clone().create_repositories();
    assert_eq!(second.checkpoints.load_all().await?.len(), 1);
    assert_eq!(
        second
            .identities
            .party_from_key(&party("Bob").owning_key)
            .await?,
        Some(party("Bob"))
    );
    assert_eq!(provider.checkpoint_count(), 1);
    Ok(())
}

#[tokio::test]
async fn test_offline_sender_cannot_send() {
    let network = InMemoryNetwork::new();
    let alice = party("Alice");
    let bob = party("Bob");
    let transport = network.register(alice.clone());
    network.register(bob.clone());

    network.set_online(&alice, false).unwrap();
    assert!(matches!(
        transport.send(unknown_init(&alice, &bob)).await,
        Err(CoreError::MessagingError(_))
    ));
    assert!(network.sent_messages().is_empty());

    network.set_online(&alice, true).unwrap();
    transport.send(unknown_init(&alice, &bob)).await.unwrap();
    assert_eq!(network.pending(&bob), 1);
}

#[tokio::test]
async fn test_cannot_send_as_another_party() {
    let network = InMemoryNetwork::new();
    let alice = party("Alice");
    let bob = party("Bob");
    network.register(alice.clone());
    let transport = network.register(bob.clone());

    assert!(transport.send(unknown_init(&alice, &bob)).await.is_err());
}

#[tokio::test]
async fn test_messages_wait_for_offline_recipient() {
    let network = InMemoryNetwork::new();
    let alice = party("Alice");
    let bob = party("Bob");
    let transport = network.register(alice.clone());
    let bob_node = node(&network, "Bob");
    bob_node.start().await.unwrap();

    network.set_online(&bob, false).unwrap();
    network.attach(&bob, bob_node).unwrap();
    transport.send(unknown_init(&alice, &bob)).await.unwrap();

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(network.pending(&bob), 1);
    assert_eq!(rejects(&network), 0);

    network.set_online(&bob, true).unwrap();
    wait_until(|| rejects(&network) == 1).await;
    assert_eq!(network.pending(&bob), 0);
    assert_eq!(network.pending(&alice), 1);
}

#[tokio::test]
async fn test_pump_retries_until_node_started() {
    let network = InMemoryNetwork::with_redelivery_delay(Duration::from_millis(5));
    let alice = party("Alice");
    let bob = party("Bob");
    let transport = network.register(alice.clone());
    let bob_node = node(&network, "Bob");

    network.attach(&bob, bob_node.clone()).unwrap();
    transport.send(unknown_init(&alice, &bob)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(network.pending(&bob), 1);

    bob_node.start().await.unwrap();
    wait_until(|| network.pending(&bob) == 0).await;
    assert_eq!(rejects(&network), 1);
}

#[tokio::test]
async fn test_detached_node_keeps_queue() {
    let network = InMemoryNetwork::new();
    let alice = party("Alice");
    let bob = party("Bob");
    let transport = network.register(alice.clone());
    let bob_node = node(&network, "Bob");
    bob_node.start().await.unwrap();

    network.attach(&bob, bob_node.clone()).unwrap();
    network.detach(&bob).unwrap();
    transport.send(unknown_init(&alice, &bob)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(network.pending(&bob), 1);

    network.attach(&bob, bob_node).unwrap();
    wait_until(|| network.pending(&bob) == 0).await;
}
