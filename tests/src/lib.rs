//! Shared setup for the Accord end-to-end scenarios.

use std::time::Duration;

use accord_core::{ContractId, FlowRegistry, StateAndRef, StateMachineConfig};
use accord_test_utils::{dummy_state, MockNetwork, MockNode, TestError, DUMMY_V2_ID};

/// Flow registry with every protocol of `accord-flows`
pub fn flow_registry() -> FlowRegistry {
    let mut registry = FlowRegistry::new();
    accord_flows::register_flows(&mut registry);
    registry
}

/// Engine settings with a short session timeout and a fast sweep
pub fn fast_timeouts(session_timeout: Duration) -> StateMachineConfig {
    StateMachineConfig {
        timeout_sweep_interval_ms: 10,
        ..StateMachineConfig::default()
    }
    .with_session_timeout(session_timeout)
}

/// The contract every scenario upgrades to
pub fn upgraded_contract() -> ContractId {
    ContractId(DUMMY_V2_ID.to_string())
}

/// Two nodes, Alice and Bob, sharing a freshly issued legacy state
pub struct TwoParties {
    /// The network both nodes run on
    pub network: MockNetwork,
    /// Instigating node
    pub alice: MockNode,
    /// Counterparty
    pub bob: MockNode,
    /// State shared by both
    pub state: StateAndRef,
}

impl TwoParties {
    /// Set up the nodes with `config` and issue the shared state
    pub async fn new(config: StateMachineConfig) -> Result<Self, TestError> {
        accord_test_utils::init_test_logging();
        let mut network = MockNetwork::new(flow_registry()).with_config(config);
        let alice = network.create_node("Alice").await?;
        let bob = network.create_node("Bob").await?;

        let participants = [alice.party().owning_key, bob.party().owning_key];
        let state = network
            .issue(dummy_state(7, &participants), &[&alice, &bob])
            .await?;
        Ok(Self {
            network,
            alice,
            bob,
            state,
        })
    }
}
