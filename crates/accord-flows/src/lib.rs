//!
//! Accord Flows - Multi-party protocols built on the Accord flow engine
//!
//! [`state_replacement`] implements the generic instigator/acceptor protocol
//! for replacing a state with the consent of all its participants, and
//! [`contract_upgrade`] specialises it to move states to a newer contract.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Generic state replacement protocol
pub mod state_replacement;

/// Contract upgrade strategy and authorisation helpers
pub mod contract_upgrade;

pub use contract_upgrade::{
    authorise_contract_upgrade, deauthorise_contract_upgrade, ContractUpgrade,
    ContractUpgradeAcceptor, ContractUpgradeInstigator,
};
pub use state_replacement::{
    Acceptor, Instigator, Proposal, ProposalResponse, ReplacementStrategy,
    StateReplacementError,
};

use accord_core::FlowRegistry;

/// Register every flow of this crate, initiating and responding
pub fn register_flows(registry: &mut FlowRegistry) -> &mut FlowRegistry {
    ContractUpgrade::register_flows(registry);
    registry
}
