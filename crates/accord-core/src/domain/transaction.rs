//! Ledger states and transactions

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use super::identity::{DigitalSignature, KeyPair, PartyKey, SecureHash};
use crate::types::FlowMessage;
use crate::CoreError;

/// Value object: identifier of a contract (its code and version)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContractId(pub String);

impl fmt::Display for ContractId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A state on the ledger, governed by a contract
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractState {
    /// Contract governing this state
    pub contract: ContractId,
    /// Keys whose owners must agree to any change of this state
    pub participants: Vec<PartyKey>,
    /// Contract-specific data
    pub data: serde_json::Value,
}

/// Pointer to an output of a recorded transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StateRef {
    /// Hash of the transaction that created the state
    pub txhash: SecureHash,
    /// Index of the output within that transaction
    pub index: u32,
}

impl fmt::Display for StateRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.txhash, self.index)
    }
}

/// A state together with the reference it was created at
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateAndRef {
    /// The state
    pub state: ContractState,
    /// Where it was created
    #[serde(rename = "ref")]
    pub state_ref: StateRef,
}

/// Data carried by a command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CommandData {
    /// Authorises replacing states of a legacy contract with states of an upgraded one
    Upgrade {
        /// Contract the outputs are upgraded to
        upgraded_contract: ContractId,
    },
    /// Contract-specific command
    Contract {
        /// Contract the command belongs to
        contract: ContractId,
        /// Command name, e.g. `create`
        name: String,
    },
}

/// A command together with the keys required to sign it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    /// Command data
    pub value: CommandData,
    /// Required signers
    pub signers: Vec<PartyKey>,
}

/// An unsigned transaction
///
/// The id is the SHA-256 of the canonical JSON encoding, so two structurally
/// equal transactions always share an id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireTransaction {
    /// Consumed states
    pub inputs: Vec<StateRef>,
    /// Created states
    pub outputs: Vec<ContractState>,
    /// Commands
    pub commands: Vec<Command>,
}

impl WireTransaction {
    /// Content-addressed transaction id
    pub fn id(&self) -> Result<SecureHash, CoreError> {
        let bytes = serde_json::to_vec(self)?;
        Ok(SecureHash::sha256(&bytes))
    }

    /// Reference to one of this transaction's outputs
    pub fn out_ref(&self, index: u32) -> Result<StateAndRef, CoreError> {
        let state = self.outputs.get(index as usize).cloned().ok_or_else(|| {
            CoreError::StateStoreError(format!("Transaction has no output {}", index))
        })?;
        Ok(StateAndRef {
            state,
            state_ref: StateRef {
                txhash: self.id()?,
                index,
            },
        })
    }

    /// Union of all command signers
    pub fn required_signers(&self) -> BTreeSet<PartyKey> {
        self.commands
            .iter()
            .flat_map(|command| command.signers.iter().copied())
            .collect()
    }
}

/// A transaction with the signatures collected so far
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedTransaction {
    /// The transaction
    pub tx: WireTransaction,
    /// Signatures over the transaction id
    pub sigs: Vec<DigitalSignature>,
}

impl FlowMessage for SignedTransaction {
    const TYPE_TAG: &'static str = "ledger.signed_transaction";
}

impl SignedTransaction {
    /// Transaction id
    pub fn id(&self) -> Result<SecureHash, CoreError> {
        self.tx.id()
    }

    /// Copy with one more signature
    pub fn with_additional_signature(&self, signature: DigitalSignature) -> Self {
        let mut signed = self.clone();
        signed.sigs.push(signature);
        signed
    }

    /// Keys that have signed
    pub fn signing_keys(&self) -> BTreeSet<PartyKey> {
        self.sigs.iter().map(|sig| sig.by).collect()
    }

    /// Required signers that have not signed yet
    pub fn missing_signers(&self) -> BTreeSet<PartyKey> {
        let signed = self.signing_keys();
        self.tx
            .required_signers()
            .into_iter()
            .filter(|key| !signed.contains(key))
            .collect()
    }

    /// Check every attached signature against the transaction id
    pub fn verify_signatures(&self) -> Result<(), CoreError> {
        let id = self.id()?;
        for sig in &self.sigs {
            sig.verify(id.as_bytes())?;
        }
        Ok(())
    }

    /// Check every attached signature and that no required signer is missing
    pub fn verify_required_signatures(&self) -> Result<(), CoreError> {
        self.verify_signatures()?;
        let missing = self.missing_signers();
        if !missing.is_empty() {
            let names: Vec<String> = missing.iter().map(|key| key.to_string()).collect();
            return Err(CoreError::SignatureError(format!(
                "Missing signatures from: {}",
                names.join(", ")
            )));
        }
        Ok(())
    }
}

/// Incrementally assembles a transaction
#[derive(Debug, Clone, Default)]
pub struct TransactionBuilder {
    inputs: Vec<StateRef>,
    outputs: Vec<ContractState>,
    commands: Vec<Command>,
    sigs: Vec<DigitalSignature>,
}

impl TransactionBuilder {
    /// Create an empty builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an input state
    pub fn with_input(mut self, state: &StateAndRef) -> Self {
        self.inputs.push(state.state_ref);
        self
    }

    /// Add an output state
    pub fn with_output(mut self, state: ContractState) -> Self {
        self.outputs.push(state);
        self
    }

    /// Add a command
    pub fn with_command(mut self, value: CommandData, signers: Vec<PartyKey>) -> Self {
        self.commands.push(Command { value, signers });
        self
    }

    /// Snapshot of the transaction built so far
    pub fn to_wire_transaction(&self) -> WireTransaction {
        WireTransaction {
            inputs: self.inputs.clone(),
            outputs: self.outputs.clone(),
            commands: self.commands.clone(),
        }
    }

    /// Sign the current transaction content
    pub fn sign_with(mut self, keys: &KeyPair) -> Result<Self, CoreError> {
        let id = self.to_wire_transaction().id()?;
        self.sigs.push(keys.sign(id.as_bytes()));
        Ok(self)
    }

    /// Finish the transaction, optionally requiring every signer to have signed
    pub fn to_signed_transaction(
        &self,
        check_sufficient_signatures: bool,
    ) -> Result<SignedTransaction, CoreError> {
        let signed = SignedTransaction {
            tx: self.to_wire_transaction(),
            sigs: self.sigs.clone(),
        };
        if check_sufficient_signatures {
            signed.verify_required_signatures()?;
        } else {
            signed.verify_signatures()?;
        }
        Ok(signed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state(owner: &KeyPair) -> ContractState {
        ContractState {
            contract: ContractId("test.v1".to_string()),
            participants: vec![owner.public_key()],
            data: json!({"magic": 1}),
        }
    }

    #[test]
    fn test_id_is_structural() {
        let alice = KeyPair::from_seed("alice");
        let a = TransactionBuilder::new().with_output(state(&alice));
        let b = TransactionBuilder::new().with_output(state(&alice));
        assert_eq!(
            a.to_wire_transaction().id().unwrap(),
            b.to_wire_transaction().id().unwrap()
        );

        let mut changed = state(&alice);
        changed.data = json!({"magic": 2});
        let c = TransactionBuilder::new().with_output(changed);
        assert_ne!(
            a.to_wire_transaction().id().unwrap(),
            c.to_wire_transaction().id().unwrap()
        );
    }

    #[test]
    fn test_missing_signers() {
        let alice = KeyPair::from_seed("alice");
        let bob = KeyPair::from_seed("bob");
        let builder = TransactionBuilder::new()
            .with_output(state(&alice))
            .with_command(
                CommandData::Contract {
                    contract: ContractId("test.v1".to_string()),
                    name: "create".to_string(),
                },
                vec![alice.public_key(), bob.public_key()],
            )
            .sign_with(&alice)
            .unwrap();

        let partial = builder.to_signed_transaction(false).unwrap();
        assert_eq!(
            partial.missing_signers().into_iter().collect::<Vec<_>>(),
            vec![bob.public_key()]
        );
        assert!(builder.to_signed_transaction(true).is_err());

        let full = builder.sign_with(&bob).unwrap().to_signed_transaction(true).unwrap();
        assert!(full.missing_signers().is_empty());
    }

    #[test]
    fn test_signature_over_other_transaction_is_rejected() {
        let alice = KeyPair::from_seed("alice");
        let signed = TransactionBuilder::new()
            .with_output(state(&alice))
            .sign_with(&alice)
            .unwrap()
            .to_signed_transaction(false)
            .unwrap();

        let mut forged = signed.clone();
        forged.tx.outputs[0].data = json!({"magic": 99});
        assert!(forged.verify_signatures().is_err());
    }

    #[test]
    fn test_out_ref_points_at_transaction() {
        let alice = KeyPair::from_seed("alice");
        let tx = TransactionBuilder::new()
            .with_output(state(&alice))
            .to_wire_transaction();

        let out = tx.out_ref(0).unwrap();
        assert_eq!(out.state_ref.txhash, tx.id().unwrap());
        assert!(tx.out_ref(1).is_err());
    }
}
