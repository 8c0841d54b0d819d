//! In-memory state store and transport for the Accord platform
//!
//! This crate wires the in-memory repositories of `accord-core` into a
//! per-node provider and supplies a process-local network. It is primarily
//! useful for development, testing, and simulated multi-node deployments.

use std::sync::Arc;

use accord_core::domain::repository::memory::{
    MemoryCheckpointRepository, MemoryIdentityRepository, MemoryTransactionRepository,
    MemoryVaultRepository,
};
use accord_core::{
    CheckpointRepository, IdentityRepository, PartyKey, TransactionRepository, VaultRepository,
};

pub mod network;
pub use network::{InMemoryMessagingService, InMemoryNetwork};

#[cfg(test)]
mod tests;

/// Repositories a node runs with
#[derive(Clone)]
pub struct NodeRepositories {
    /// Flow checkpoints
    pub checkpoints: Arc<dyn CheckpointRepository>,
    /// Validated transactions
    pub transactions: Arc<dyn TransactionRepository>,
    /// Vault of relevant states and authorised upgrades
    pub vault: Arc<dyn VaultRepository>,
    /// Known parties
    pub identities: Arc<dyn IdentityRepository>,
}

/// Provider for the in-memory stores of one node
///
/// Every call to [`create_repositories`](Self::create_repositories) hands out
/// views over the same maps, so a node rebuilt from the same provider after a
/// simulated crash finds its checkpoints, transactions and vault intact.
#[derive(Clone)]
pub struct InMemoryStateStoreProvider {
    checkpoints: MemoryCheckpointRepository,
    transactions: MemoryTransactionRepository,
    vault: MemoryVaultRepository,
    identities: MemoryIdentityRepository,
}

impl InMemoryStateStoreProvider {
    /// Create stores for the node owning `owner`
    pub fn new(owner: PartyKey) -> Self {
        Self {
            checkpoints: MemoryCheckpointRepository::new(),
            transactions: MemoryTransactionRepository::new(),
            vault: MemoryVaultRepository::new(owner),
            identities: MemoryIdentityRepository::new(),
        }
    }

    /// Create repositories for use with the state machine manager
    pub fn create_repositories(&self) -> NodeRepositories {
        NodeRepositories {
            checkpoints: Arc::new(self.checkpoints.clone()),
            transactions: Arc::new(self.transactions.clone()),
            vault: Arc::new(self.vault.clone()),
            identities: Arc::new(self.identities.clone()),
        }
    }

    /// Number of checkpoints currently stored
    pub fn checkpoint_count(&self) -> usize {
        self.checkpoints.len()
    }
}
