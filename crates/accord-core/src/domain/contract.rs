//! Contract code and ledger verification
//!
//! Contracts are installed locally in a [`ContractRegistry`]. A transaction is
//! valid when every contract it touches accepts it; transactions carrying an
//! upgrade command are instead checked by the [`UpgradeClause`].

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use thiserror::Error;

use super::clauses::UpgradeClause;
use super::repository::TransactionRepository;
use super::transaction::{
    Command, CommandData, ContractId, ContractState, StateAndRef, WireTransaction,
};
use super::identity::SecureHash;
use crate::CoreError;

/// A requirement of a contract that the transaction does not meet
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Failed requirement: {requirement}")]
pub struct ContractViolation {
    /// Description of the requirement
    pub requirement: String,
}

impl ContractViolation {
    /// Create a violation for the given requirement
    pub fn new(requirement: impl Into<String>) -> Self {
        Self {
            requirement: requirement.into(),
        }
    }
}

impl From<ContractViolation> for CoreError {
    fn from(violation: ContractViolation) -> Self {
        CoreError::VerificationError(violation.requirement)
    }
}

/// Fail with `description` unless `condition` holds
#[inline]
pub fn require(description: &str, condition: bool) -> Result<(), ContractViolation> {
    if condition {
        Ok(())
    } else {
        Err(ContractViolation::new(description))
    }
}

/// Contract code governing a kind of state
pub trait Contract: Send + Sync {
    /// Identifier of this contract
    fn id(&self) -> ContractId;

    /// Accept or reject a transaction touching states of this contract
    fn verify(&self, tx: &LedgerTransaction) -> Result<(), ContractViolation>;
}

/// A contract that can replace states of an older contract
pub trait UpgradedContract: Contract {
    /// Contract whose states this one replaces
    fn legacy_contract(&self) -> ContractId;

    /// Deterministically derive the upgraded state from a legacy state
    fn upgrade(&self, state: &ContractState) -> Result<ContractState, ContractViolation>;
}

/// Contracts installed on a node
#[derive(Default, Clone)]
pub struct ContractRegistry {
    contracts: HashMap<ContractId, Arc<dyn Contract>>,
    upgrades: HashMap<ContractId, Arc<dyn UpgradedContract>>,
}

impl ContractRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a contract
    pub fn register<C: Contract + 'static>(&mut self, contract: C) {
        self.contracts.insert(contract.id(), Arc::new(contract));
    }

    /// Install a contract that upgrades another one
    pub fn register_upgrade<C: UpgradedContract + 'static>(&mut self, contract: C) {
        let id = contract.id();
        let contract = Arc::new(contract);
        self.contracts
            .insert(id.clone(), contract.clone() as Arc<dyn Contract>);
        self.upgrades.insert(id, contract as Arc<dyn UpgradedContract>);
    }

    /// Find an installed contract
    pub fn contract(&self, id: &ContractId) -> Option<Arc<dyn Contract>> {
        self.contracts.get(id).cloned()
    }

    /// Find an installed upgraded contract
    pub fn upgrade(&self, id: &ContractId) -> Option<Arc<dyn UpgradedContract>> {
        self.upgrades.get(id).cloned()
    }
}

impl std::fmt::Debug for ContractRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut ids: Vec<&ContractId> = self.contracts.keys().collect();
        ids.sort();
        f.debug_struct("ContractRegistry")
            .field("contracts", &ids)
            .finish()
    }
}

/// A transaction with its inputs resolved to the states they point at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerTransaction {
    /// Transaction id
    pub id: SecureHash,
    /// Resolved inputs
    pub inputs: Vec<StateAndRef>,
    /// Outputs
    pub outputs: Vec<ContractState>,
    /// Commands
    pub commands: Vec<Command>,
}

impl LedgerTransaction {
    /// Resolve the inputs of `tx` against validated transactions in storage
    pub async fn resolve(
        tx: &WireTransaction,
        storage: &dyn TransactionRepository,
    ) -> Result<Self, CoreError> {
        let mut inputs = Vec::with_capacity(tx.inputs.len());
        for state_ref in &tx.inputs {
            let source = storage
                .get(&state_ref.txhash)
                .await?
                .ok_or_else(|| CoreError::TransactionNotFound(state_ref.txhash.to_string()))?;
            inputs.push(source.tx.out_ref(state_ref.index)?);
        }

        Ok(Self {
            id: tx.id()?,
            inputs,
            outputs: tx.outputs.clone(),
            commands: tx.commands.clone(),
        })
    }

    /// Commands carrying an upgrade
    pub fn upgrade_commands(&self) -> Vec<&Command> {
        self.commands
            .iter()
            .filter(|command| matches!(command.value, CommandData::Upgrade { .. }))
            .collect()
    }

    /// Run the ledger rules against this transaction
    pub fn verify(&self, contracts: &ContractRegistry) -> Result<(), ContractViolation> {
        if !self.upgrade_commands().is_empty() {
            return UpgradeClause::verify(self, contracts);
        }

        let ids: BTreeSet<&ContractId> = self
            .inputs
            .iter()
            .map(|input| &input.state.contract)
            .chain(self.outputs.iter().map(|output| &output.contract))
            .collect();

        for id in ids {
            let contract = contracts
                .contract(id)
                .ok_or_else(|| ContractViolation::new(format!("Contract {} is not installed", id)))?;
            contract.verify(self)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::identity::KeyPair;
    use crate::domain::repository::memory::MemoryTransactionRepository;
    use crate::domain::transaction::TransactionBuilder;
    use serde_json::json;

    struct Counter;

    impl Contract for Counter {
        fn id(&self) -> ContractId {
            ContractId("test.counter".to_string())
        }

        fn verify(&self, tx: &LedgerTransaction) -> Result<(), ContractViolation> {
            require(
                "Counter values are non-negative",
                tx.outputs
                    .iter()
                    .all(|output| output.data["value"].as_i64().unwrap_or(-1) >= 0),
            )
        }
    }

    fn counter(owner: &KeyPair, value: i64) -> ContractState {
        ContractState {
            contract: Counter.id(),
            participants: vec![owner.public_key()],
            data: json!({ "value": value }),
        }
    }

    #[tokio::test]
    async fn test_resolve_inputs_from_storage() {
        let alice = KeyPair::from_seed("alice");
        let storage = MemoryTransactionRepository::new();
        let issue = TransactionBuilder::new()
            .with_output(counter(&alice, 1))
            .to_signed_transaction(false)
            .unwrap();
        storage.add(&issue).await.unwrap();

        let input = issue.tx.out_ref(0).unwrap();
        let spend = TransactionBuilder::new()
            .with_input(&input)
            .with_output(counter(&alice, 2))
            .to_wire_transaction();

        let ltx = LedgerTransaction::resolve(&spend, &storage).await.unwrap();
        assert_eq!(ltx.inputs, vec![input]);
        assert_eq!(ltx.id, spend.id().unwrap());
    }

    #[tokio::test]
    async fn test_resolve_unknown_input_fails() {
        let alice = KeyPair::from_seed("alice");
        let storage = MemoryTransactionRepository::new();
        let phantom = TransactionBuilder::new()
            .with_output(counter(&alice, 1))
            .to_wire_transaction()
            .out_ref(0)
            .unwrap();
        let spend = TransactionBuilder::new()
            .with_input(&phantom)
            .to_wire_transaction();

        let err = LedgerTransaction::resolve(&spend, &storage).await.unwrap_err();
        assert!(matches!(err, CoreError::TransactionNotFound(_)));
    }

    #[test]
    fn test_verify_dispatches_to_contract() {
        let alice = KeyPair::from_seed("alice");
        let mut contracts = ContractRegistry::new();
        contracts.register(Counter);

        let tx = |value| LedgerTransaction {
            id: SecureHash::sha256(b"tx"),
            inputs: vec![],
            outputs: vec![counter(&alice, value)],
            commands: vec![],
        };

        assert!(tx(3).verify(&contracts).is_ok());
        assert_eq!(
            tx(-3).verify(&contracts).unwrap_err().requirement,
            "Counter values are non-negative"
        );
        assert!(tx(3).verify(&ContractRegistry::new()).is_err());
    }
}
