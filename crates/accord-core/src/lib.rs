//!
//! Accord Core - Flow runtime for the Accord ledger
//!
//! This crate defines the checkpointed flow engine, the session protocol
//! between nodes, and the ledger types flows operate on. Transports, stores
//! and concrete protocols live in the other Accord crates.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Domain layer - ledger, session and checkpoint models
pub mod domain;

/// Application services - flows and the state machine manager
pub mod application;

/// Core types and traits
pub mod types;

/// Error types
pub mod error;

/// Runtime configuration
pub mod config;

// Re-export key types
pub use config::StateMachineConfig;
pub use error::{CoreError, FlowError, FlowException};
pub use types::{FlowMessage, Payload};

// Re-export main API types for easy use
pub use application::flow::{Flow, FlowContext, FlowEvent, FlowStep};
pub use application::registry::FlowRegistry;
pub use application::service_hub::{ServiceHub, SigningService};
pub use application::state_machine_manager::{
    CommitOutcome, DomainEventHandler, FlowHandle, FlowUpdate, RestoreReport,
    StateMachineManager, TracingEventHandler,
};
pub use domain::contract::{Contract, ContractRegistry, LedgerTransaction, UpgradedContract};
pub use domain::flow_instance::{FlowId, FlowStatus};
pub use domain::identity::{DigitalSignature, KeyPair, Party, PartyKey, SecureHash};
pub use domain::messaging::{MessageId, MessagingService, NetworkMessage, SessionMessage};
pub use domain::repository::{
    CheckpointRepository, IdentityRepository, TransactionRepository, VaultRepository,
};
pub use domain::session::SessionId;
pub use domain::transaction::{
    Command, CommandData, ContractId, ContractState, SignedTransaction, StateAndRef, StateRef,
    TransactionBuilder, WireTransaction,
};
