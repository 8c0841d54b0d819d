//! Dummy contracts with an upgrade path from v1 to v2.

use accord_core::{
    CommandData, Contract, ContractId, ContractRegistry, ContractState, CoreError, KeyPair,
    LedgerTransaction, PartyKey, SignedTransaction, TransactionBuilder, UpgradedContract,
};
use accord_core::domain::contract::{require, ContractViolation};
use serde_json::json;

/// Id of the legacy dummy contract
pub const DUMMY_V1_ID: &str = "dummy.v1";

/// Id of the upgraded dummy contract
pub const DUMMY_V2_ID: &str = "dummy.v2";

fn magic_number(state: &ContractState) -> Result<i64, ContractViolation> {
    state
        .data
        .get("magic_number")
        .and_then(|value| value.as_i64())
        .ok_or_else(|| ContractViolation::new("State carries a magic number"))
}

/// Legacy contract: states carry a magic number and are created by a
/// `create` command signed by their participants
#[derive(Debug, Default, Clone, Copy)]
pub struct DummyContract;

impl Contract for DummyContract {
    fn id(&self) -> ContractId {
        ContractId(DUMMY_V1_ID.to_string())
    }

    fn verify(&self, tx: &LedgerTransaction) -> Result<(), ContractViolation> {
        let create = tx.commands.iter().find(|command| {
            matches!(&command.value, CommandData::Contract { contract, name }
                if *contract == self.id() && name == "create")
        });
        let create = create.ok_or_else(|| ContractViolation::new("A create command is present"))?;

        require("Creation consumes no states", tx.inputs.is_empty())?;
        for output in &tx.outputs {
            magic_number(output)?;
            require(
                "Every participant signs the creation",
                output
                    .participants
                    .iter()
                    .all(|key| create.signers.contains(key)),
            )?;
        }
        Ok(())
    }
}

/// Upgraded contract: same magic number, tagged with its version
#[derive(Debug, Default, Clone, Copy)]
pub struct DummyContractV2;

impl Contract for DummyContractV2 {
    fn id(&self) -> ContractId {
        ContractId(DUMMY_V2_ID.to_string())
    }

    fn verify(&self, tx: &LedgerTransaction) -> Result<(), ContractViolation> {
        for output in tx.outputs.iter().filter(|output| output.contract == self.id()) {
            require("Magic number is not negative", magic_number(output)? >= 0)?;
        }
        Ok(())
    }
}

impl UpgradedContract for DummyContractV2 {
    fn legacy_contract(&self) -> ContractId {
        ContractId(DUMMY_V1_ID.to_string())
    }

    fn upgrade(&self, state: &ContractState) -> Result<ContractState, ContractViolation> {
        require(
            "State belongs to the legacy contract",
            state.contract == self.legacy_contract(),
        )?;
        Ok(ContractState {
            contract: self.id(),
            participants: state.participants.clone(),
            data: json!({ "magic_number": magic_number(state)?, "version": 2 }),
        })
    }
}

/// Registry with both dummy contracts installed
pub fn dummy_contracts() -> ContractRegistry {
    let mut registry = ContractRegistry::new();
    registry.register(DummyContract);
    registry.register_upgrade(DummyContractV2);
    registry
}

/// A legacy dummy state shared by `participants`
pub fn dummy_state(magic_number: i64, participants: &[PartyKey]) -> ContractState {
    ContractState {
        contract: ContractId(DUMMY_V1_ID.to_string()),
        participants: participants.to_vec(),
        data: json!({ "magic_number": magic_number }),
    }
}

/// Transaction creating `state`, signed by `signers`
pub fn issue_transaction(
    state: ContractState,
    signers: &[&KeyPair],
) -> Result<SignedTransaction, CoreError> {
    let participants = state.participants.clone();
    let mut builder = TransactionBuilder::new().with_output(state).with_command(
        CommandData::Contract {
            contract: ContractId(DUMMY_V1_ID.to_string()),
            name: "create".to_string(),
        },
        participants,
    );
    for keys in signers {
        builder = builder.sign_with(keys)?;
    }
    builder.to_signed_transaction(true)
}
