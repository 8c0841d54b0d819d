//! Multi-node harness over the in-memory network.
//!
//! Every node gets deterministic keys derived from its name, its own store
//! provider, and knows the identity of every other node in the network.

use std::sync::Arc;

use accord_core::{
    ContractRegistry, ContractState, CoreError, DomainEventHandler, FlowRegistry, KeyPair, Party,
    RestoreReport, ServiceHub, SignedTransaction, StateAndRef, StateMachineConfig,
    StateMachineManager, TracingEventHandler,
};
use accord_state_inmemory::{InMemoryNetwork, InMemoryStateStoreProvider};
use tracing::info;

use crate::contracts::{dummy_contracts, issue_transaction};

/// A set of nodes sharing one in-memory network
pub struct MockNetwork {
    network: InMemoryNetwork,
    flows: FlowRegistry,
    contracts: Arc<ContractRegistry>,
    config: StateMachineConfig,
    event_handler: Arc<dyn DomainEventHandler>,
    nodes: Vec<(Party, InMemoryStateStoreProvider)>,
}

impl MockNetwork {
    /// Network whose nodes run the flows in `flows` and the dummy contracts
    pub fn new(flows: FlowRegistry) -> Self {
        Self {
            network: InMemoryNetwork::new(),
            flows,
            contracts: Arc::new(dummy_contracts()),
            config: StateMachineConfig::default(),
            event_handler: Arc::new(TracingEventHandler),
            nodes: Vec::new(),
        }
    }

    /// Use `config` for nodes created from now on
    pub fn with_config(mut self, config: StateMachineConfig) -> Self {
        self.config = config;
        self
    }

    /// Install `contracts` on nodes created from now on
    pub fn with_contracts(mut self, contracts: ContractRegistry) -> Self {
        self.contracts = Arc::new(contracts);
        self
    }

    /// Report domain events of nodes created from now on to `handler`
    pub fn with_event_handler(mut self, handler: Arc<dyn DomainEventHandler>) -> Self {
        self.event_handler = handler;
        self
    }

    /// The underlying transport
    pub fn network(&self) -> &InMemoryNetwork {
        &self.network
    }

    /// Create, start and attach a node named `name`
    pub async fn create_node(&mut self, name: &str) -> Result<MockNode, CoreError> {
        let keys = KeyPair::from_seed(name);
        let party = Party {
            name: name.to_string(),
            owning_key: keys.public_key(),
        };
        let provider = InMemoryStateStoreProvider::new(party.owning_key);

        let identities = provider.create_repositories().identities;
        for (other, other_provider) in &self.nodes {
            identities.register(other.clone()).await?;
            other_provider
                .create_repositories()
                .identities
                .register(party.clone())
                .await?;
        }
        self.nodes.push((party.clone(), provider.clone()));

        let mut node = MockNode {
            party,
            keys,
            provider,
            network: self.network.clone(),
            flows: self.flows.clone(),
            contracts: self.contracts.clone(),
            config: self.config.clone(),
            event_handler: self.event_handler.clone(),
            manager: None,
        };
        node.start().await?;
        info!(party = %node.party, "Created mock node");
        Ok(node)
    }

    /// Issue a dummy state to `owners` and record it on each of them
    pub async fn issue(
        &self,
        state: ContractState,
        owners: &[&MockNode],
    ) -> Result<StateAndRef, CoreError> {
        let signers: Vec<&KeyPair> = owners.iter().map(|node| &node.keys).collect();
        let stx = issue_transaction(state, &signers)?;
        for owner in owners {
            owner.services()?.record_transaction(&stx).await?;
        }
        stx.tx.out_ref(0)
    }

    /// Stop delivering messages to every node
    pub fn shutdown(&self) {
        self.network.shutdown();
    }
}

/// A node of a [`MockNetwork`]
pub struct MockNode {
    party: Party,
    keys: KeyPair,
    provider: InMemoryStateStoreProvider,
    network: InMemoryNetwork,
    flows: FlowRegistry,
    contracts: Arc<ContractRegistry>,
    config: StateMachineConfig,
    event_handler: Arc<dyn DomainEventHandler>,
    manager: Option<StateMachineManager>,
}

impl MockNode {
    /// This node's identity
    pub fn party(&self) -> &Party {
        &self.party
    }

    /// The node's stores, which survive restarts
    pub fn provider(&self) -> &InMemoryStateStoreProvider {
        &self.provider
    }

    /// The running state machine manager
    pub fn manager(&self) -> Result<&StateMachineManager, CoreError> {
        self.manager
            .as_ref()
            .ok_or(CoreError::NotStarted)
    }

    /// Services of the running node
    pub fn services(&self) -> Result<&ServiceHub, CoreError> {
        Ok(self.manager()?.services())
    }

    /// Whether the node is running
    pub fn is_running(&self) -> bool {
        self.manager.is_some()
    }

    /// Build a fresh manager over the node's stores, restore its
    /// checkpoints, and reconnect it to the network
    pub async fn start(&mut self) -> Result<RestoreReport, CoreError> {
        let repositories = self.provider.create_repositories();
        let hub = ServiceHub::new(
            self.party.clone(),
            Arc::new(self.keys.clone()),
            repositories.transactions,
            repositories.vault,
            repositories.identities,
            self.contracts.clone(),
        )?;
        let manager = StateMachineManager::new(
            hub,
            repositories.checkpoints,
            Arc::new(self.network.register(self.party.clone())),
            self.flows.clone(),
            self.config.clone(),
            self.event_handler.clone(),
        )?;

        let report = manager.start().await?;
        self.network.attach(&self.party, manager.clone())?;
        self.manager = Some(manager);
        info!(
            party = %self.party,
            restored = report.restored.len(),
            failed = report.failed.len(),
            "Started mock node"
        );
        Ok(report)
    }

    /// Simulate a crash: drop the in-memory flows, keep the stores and the
    /// queued messages
    pub fn stop(&mut self) -> Result<(), CoreError> {
        self.network.detach(&self.party)?;
        if let Some(manager) = self.manager.take() {
            manager.stop();
        }
        info!(party = %self.party, "Stopped mock node");
        Ok(())
    }

    /// Stop and start again
    pub async fn restart(&mut self) -> Result<RestoreReport, CoreError> {
        self.stop()?;
        self.start().await
    }

    /// Transactions this node has recorded
    pub async fn recorded_transactions(&self) -> Result<Vec<SignedTransaction>, CoreError> {
        self.services()?.transactions().list().await
    }
}

impl std::fmt::Debug for MockNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockNode")
            .field("party", &self.party)
            .field("running", &self.is_running())
            .finish()
    }
}
