//! Repository traits for the Accord runtime
//!
//! This module defines the storage seams used by the state-machine manager
//! and by flows. External crates can implement these traits to provide
//! different persistence mechanisms.

use async_trait::async_trait;

use super::flow_instance::FlowId;
use super::identity::{Party, PartyKey, SecureHash};
use super::session::SessionId;
use super::transaction::{ContractId, SignedTransaction, StateAndRef, StateRef};
use crate::CoreError;

/// Durable store of flow checkpoints
#[async_trait]
pub trait CheckpointRepository: Send + Sync {
    /// Insert or replace the checkpoint of a flow
    async fn save(&self, flow_id: &FlowId, checkpoint: Vec<u8>) -> Result<(), CoreError>;

    /// Remove the checkpoint of a finished flow
    async fn delete(&self, flow_id: &FlowId) -> Result<(), CoreError>;

    /// All stored checkpoints, undecoded
    async fn load_all(&self) -> Result<Vec<(FlowId, Vec<u8>)>, CoreError>;

    /// Whether a session initiation from `sender` was already turned into a flow
    async fn initiation_seen(
        &self,
        sender: &PartyKey,
        session_id: &SessionId,
    ) -> Result<bool, CoreError>;

    /// Remember that a session initiation was turned into a flow
    async fn record_initiation(
        &self,
        sender: &PartyKey,
        session_id: &SessionId,
    ) -> Result<(), CoreError>;
}

/// Validated transactions by hash
#[async_trait]
pub trait TransactionRepository: Send + Sync {
    /// Store a transaction, returning `false` if it was already present
    async fn add(&self, tx: &SignedTransaction) -> Result<bool, CoreError>;

    /// Find a transaction by hash
    async fn get(&self, hash: &SecureHash) -> Result<Option<SignedTransaction>, CoreError>;

    /// All stored transactions
    async fn list(&self) -> Result<Vec<SignedTransaction>, CoreError>;
}

/// States relevant to this node and the upgrades it has agreed to
#[async_trait]
pub trait VaultRepository: Send + Sync {
    /// Agree in advance to upgrade one state to the given contract
    async fn authorise_contract_upgrade(
        &self,
        state_ref: &StateRef,
        upgraded_contract: &ContractId,
    ) -> Result<(), CoreError>;

    /// Withdraw a previous authorisation
    async fn deauthorise_contract_upgrade(&self, state_ref: &StateRef) -> Result<(), CoreError>;

    /// The upgrade this node agreed to for a state, if any
    async fn get_authorised_contract_upgrade(
        &self,
        state_ref: &StateRef,
    ) -> Result<Option<ContractId>, CoreError>;

    /// Apply a recorded transaction: consume its inputs and track relevant outputs
    async fn notify(&self, tx: &SignedTransaction) -> Result<(), CoreError>;

    /// States not yet consumed by any recorded transaction
    async fn unconsumed_states(&self) -> Result<Vec<StateAndRef>, CoreError>;
}

/// Well-known parties by key
#[async_trait]
pub trait IdentityRepository: Send + Sync {
    /// Register a party
    async fn register(&self, party: Party) -> Result<(), CoreError>;

    /// Find the party owning a key
    async fn party_from_key(&self, key: &PartyKey) -> Result<Option<Party>, CoreError>;
}

/// Memory implementations for testing
#[cfg(feature = "testing")]
pub mod memory {
    use super::*;
    use crate::domain::transaction::ContractState;
    use dashmap::DashMap;
    use std::sync::Arc;

    /// In-memory checkpoint store
    ///
    /// Clones share the same maps, so a clone handed to a fresh manager sees
    /// everything the previous one wrote.
    #[derive(Clone, Default)]
    pub struct MemoryCheckpointRepository {
        checkpoints: Arc<DashMap<FlowId, Vec<u8>>>,
        initiations: Arc<DashMap<(PartyKey, SessionId), ()>>,
    }

    impl MemoryCheckpointRepository {
        /// Create a new memory checkpoint repository
        pub fn new() -> Self {
            Self::default()
        }

        /// Number of stored checkpoints
        pub fn len(&self) -> usize {
            self.checkpoints.len()
        }

        /// Whether no checkpoints are stored
        pub fn is_empty(&self) -> bool {
            self.checkpoints.is_empty()
        }

        /// Raw checkpoint bytes of a flow
        pub fn get(&self, flow_id: &FlowId) -> Option<Vec<u8>> {
            self.checkpoints.get(flow_id).map(|bytes| bytes.clone())
        }
    }

    #[async_trait]
    impl CheckpointRepository for MemoryCheckpointRepository {
        async fn save(&self, flow_id: &FlowId, checkpoint: Vec<u8>) -> Result<(), CoreError> {
            self.checkpoints.insert(flow_id.clone(), checkpoint);
            Ok(())
        }

        async fn delete(&self, flow_id: &FlowId) -> Result<(), CoreError> {
            self.checkpoints.remove(flow_id);
            Ok(())
        }

        async fn load_all(&self) -> Result<Vec<(FlowId, Vec<u8>)>, CoreError> {
            let mut all: Vec<(FlowId, Vec<u8>)> = self
                .checkpoints
                .iter()
                .map(|entry| (entry.key().clone(), entry.value().clone()))
                .collect();
            all.sort_by(|a, b| a.0.cmp(&b.0));
            Ok(all)
        }

        async fn initiation_seen(
            &self,
            sender: &PartyKey,
            session_id: &SessionId,
        ) -> Result<bool, CoreError> {
            Ok(self
                .initiations
                .contains_key(&(*sender, session_id.clone())))
        }

        async fn record_initiation(
            &self,
            sender: &PartyKey,
            session_id: &SessionId,
        ) -> Result<(), CoreError> {
            self.initiations.insert((*sender, session_id.clone()), ());
            Ok(())
        }
    }

    /// In-memory transaction storage
    #[derive(Clone, Default)]
    pub struct MemoryTransactionRepository {
        transactions: Arc<DashMap<SecureHash, SignedTransaction>>,
    }

    impl MemoryTransactionRepository {
        /// Create a new memory transaction repository
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl TransactionRepository for MemoryTransactionRepository {
        async fn add(&self, tx: &SignedTransaction) -> Result<bool, CoreError> {
            let id = tx.id()?;
            if self.transactions.contains_key(&id) {
                return Ok(false);
            }
            self.transactions.insert(id, tx.clone());
            Ok(true)
        }

        async fn get(&self, hash: &SecureHash) -> Result<Option<SignedTransaction>, CoreError> {
            Ok(self.transactions.get(hash).map(|tx| tx.clone()))
        }

        async fn list(&self) -> Result<Vec<SignedTransaction>, CoreError> {
            Ok(self
                .transactions
                .iter()
                .map(|entry| entry.value().clone())
                .collect())
        }
    }

    /// In-memory vault tracking the states of one owner
    #[derive(Clone)]
    pub struct MemoryVaultRepository {
        owner: PartyKey,
        states: Arc<DashMap<StateRef, ContractState>>,
        authorisations: Arc<DashMap<StateRef, ContractId>>,
    }

    impl MemoryVaultRepository {
        /// Create a vault for the states `owner` participates in
        pub fn new(owner: PartyKey) -> Self {
            Self {
                owner,
                states: Arc::new(DashMap::new()),
                authorisations: Arc::new(DashMap::new()),
            }
        }
    }

    #[async_trait]
    impl VaultRepository for MemoryVaultRepository {
        async fn authorise_contract_upgrade(
            &self,
            state_ref: &StateRef,
            upgraded_contract: &ContractId,
        ) -> Result<(), CoreError> {
            self.authorisations
                .insert(*state_ref, upgraded_contract.clone());
            Ok(())
        }

        async fn deauthorise_contract_upgrade(
            &self,
            state_ref: &StateRef,
        ) -> Result<(), CoreError> {
            self.authorisations.remove(state_ref);
            Ok(())
        }

        async fn get_authorised_contract_upgrade(
            &self,
            state_ref: &StateRef,
        ) -> Result<Option<ContractId>, CoreError> {
            Ok(self
                .authorisations
                .get(state_ref)
                .map(|contract| contract.clone()))
        }

        async fn notify(&self, tx: &SignedTransaction) -> Result<(), CoreError> {
            for input in &tx.tx.inputs {
                self.states.remove(input);
                self.authorisations.remove(input);
            }

            let txhash = tx.id()?;
            for (index, output) in tx.tx.outputs.iter().enumerate() {
                if output.participants.contains(&self.owner) {
                    self.states.insert(
                        StateRef {
                            txhash,
                            index: index as u32,
                        },
                        output.clone(),
                    );
                }
            }
            Ok(())
        }

        async fn unconsumed_states(&self) -> Result<Vec<StateAndRef>, CoreError> {
            let mut states: Vec<StateAndRef> = self
                .states
                .iter()
                .map(|entry| StateAndRef {
                    state: entry.value().clone(),
                    state_ref: *entry.key(),
                })
                .collect();
            states.sort_by(|a, b| a.state_ref.cmp(&b.state_ref));
            Ok(states)
        }
    }

    /// In-memory identity service
    #[derive(Clone, Default)]
    pub struct MemoryIdentityRepository {
        parties: Arc<DashMap<PartyKey, Party>>,
    }

    impl MemoryIdentityRepository {
        /// Create a new memory identity repository
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl IdentityRepository for MemoryIdentityRepository {
        async fn register(&self, party: Party) -> Result<(), CoreError> {
            self.parties.insert(party.owning_key, party);
            Ok(())
        }

        async fn party_from_key(&self, key: &PartyKey) -> Result<Option<Party>, CoreError> {
            Ok(self.parties.get(key).map(|party| party.clone()))
        }
    }

}
