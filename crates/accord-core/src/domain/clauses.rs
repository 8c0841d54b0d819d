//! Verification clause for contract upgrade transactions

use std::collections::BTreeSet;

use super::contract::{require, ContractRegistry, ContractViolation, LedgerTransaction};
use super::identity::PartyKey;
use super::transaction::CommandData;

/// Ledger rule for transactions that replace legacy states with upgraded ones.
///
/// The clause only looks at the transaction and the locally installed
/// contract code, so any node can run it without talking to anybody.
pub struct UpgradeClause;

impl UpgradeClause {
    /// Verify an upgrade transaction
    pub fn verify(
        tx: &LedgerTransaction,
        contracts: &ContractRegistry,
    ) -> Result<(), ContractViolation> {
        let commands = tx.upgrade_commands();
        require("Exactly one upgrade command", commands.len() == 1)?;
        let command = commands[0];

        let upgraded_id = match &command.value {
            CommandData::Upgrade { upgraded_contract } => upgraded_contract,
            CommandData::Contract { .. } => {
                return Err(ContractViolation::new("Exactly one upgrade command"))
            }
        };
        let upgraded = contracts.upgrade(upgraded_id).ok_or_else(|| {
            ContractViolation::new(format!("Upgraded contract {} is not installed", upgraded_id))
        })?;

        let participants: BTreeSet<PartyKey> = tx
            .inputs
            .iter()
            .flat_map(|input| input.state.participants.iter().copied())
            .collect();
        let signers: BTreeSet<PartyKey> = command.signers.iter().copied().collect();
        require(
            "The signing keys include all participant keys",
            participants.is_subset(&signers),
        )?;

        require("Upgrade must consume at least one state", !tx.inputs.is_empty())?;
        require(
            "Inputs and outputs must be paired one to one",
            tx.inputs.len() == tx.outputs.len(),
        )?;

        let legacy = upgraded.legacy_contract();
        require(
            "Input states must be of the legacy contract",
            tx.inputs.iter().all(|input| input.state.contract == legacy),
        )?;
        require(
            "Output states must be of the upgraded contract",
            tx.outputs.iter().all(|output| output.contract == *upgraded_id),
        )?;

        for (input, output) in tx.inputs.iter().zip(&tx.outputs) {
            let expected = upgraded.upgrade(&input.state)?;
            require(
                "Output state must be an upgraded version of the input state",
                expected == *output,
            )?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::contract::{Contract, UpgradedContract};
    use crate::domain::identity::{KeyPair, SecureHash};
    use crate::domain::transaction::{
        Command, ContractId, ContractState, StateAndRef, StateRef,
    };
    use serde_json::json;

    fn v1() -> ContractId {
        ContractId("dummy.v1".to_string())
    }

    fn v2() -> ContractId {
        ContractId("dummy.v2".to_string())
    }

    struct DummyV1;

    impl Contract for DummyV1 {
        fn id(&self) -> ContractId {
            v1()
        }

        fn verify(&self, _tx: &LedgerTransaction) -> Result<(), ContractViolation> {
            Ok(())
        }
    }

    struct DummyV2;

    impl Contract for DummyV2 {
        fn id(&self) -> ContractId {
            v2()
        }

        fn verify(&self, _tx: &LedgerTransaction) -> Result<(), ContractViolation> {
            Ok(())
        }
    }

    impl UpgradedContract for DummyV2 {
        fn legacy_contract(&self) -> ContractId {
            v1()
        }

        fn upgrade(&self, state: &ContractState) -> Result<ContractState, ContractViolation> {
            Ok(ContractState {
                contract: v2(),
                participants: state.participants.clone(),
                data: json!({ "magic": state.data["magic"], "upgraded": true }),
            })
        }
    }

    fn contracts() -> ContractRegistry {
        let mut contracts = ContractRegistry::new();
        contracts.register(DummyV1);
        contracts.register_upgrade(DummyV2);
        contracts
    }

    fn legacy_input(owners: &[&KeyPair], index: u32) -> StateAndRef {
        StateAndRef {
            state: ContractState {
                contract: v1(),
                participants: owners.iter().map(|k| k.public_key()).collect(),
                data: json!({ "magic": index }),
            },
            state_ref: StateRef {
                txhash: SecureHash::sha256(b"issue"),
                index,
            },
        }
    }

    fn upgrade_command(signers: &[&KeyPair]) -> Command {
        Command {
            value: CommandData::Upgrade {
                upgraded_contract: v2(),
            },
            signers: signers.iter().map(|k| k.public_key()).collect(),
        }
    }

    /// A valid two-party upgrade of a single state
    fn valid_tx() -> LedgerTransaction {
        let alice = KeyPair::from_seed("alice");
        let bob = KeyPair::from_seed("bob");
        let input = legacy_input(&[&alice, &bob], 0);
        let output = DummyV2.upgrade(&input.state).unwrap();
        LedgerTransaction {
            id: SecureHash::sha256(b"upgrade"),
            inputs: vec![input],
            outputs: vec![output],
            commands: vec![upgrade_command(&[&alice, &bob])],
        }
    }

    fn violation(tx: &LedgerTransaction) -> String {
        UpgradeClause::verify(tx, &contracts())
            .expect_err("clause should reject")
            .requirement
    }

    #[test]
    fn test_valid_upgrade_passes() {
        assert!(UpgradeClause::verify(&valid_tx(), &contracts()).is_ok());
        // Ledger verification routes upgrade transactions through the clause
        assert!(valid_tx().verify(&contracts()).is_ok());
    }

    #[test]
    fn test_multiple_inputs_upgrade_positionally() {
        let alice = KeyPair::from_seed("alice");
        let inputs = vec![legacy_input(&[&alice], 0), legacy_input(&[&alice], 1)];
        let outputs = inputs
            .iter()
            .map(|input| DummyV2.upgrade(&input.state).unwrap())
            .collect::<Vec<_>>();
        let mut tx = LedgerTransaction {
            id: SecureHash::sha256(b"multi"),
            inputs,
            outputs,
            commands: vec![upgrade_command(&[&alice])],
        };
        assert!(UpgradeClause::verify(&tx, &contracts()).is_ok());

        tx.outputs.swap(0, 1);
        assert_eq!(
            violation(&tx),
            "Output state must be an upgraded version of the input state"
        );
    }

    #[test]
    fn test_rejects_missing_participant_signer() {
        let mut tx = valid_tx();
        let alice = KeyPair::from_seed("alice");
        tx.commands = vec![upgrade_command(&[&alice])];
        assert_eq!(violation(&tx), "The signing keys include all participant keys");
    }

    #[test]
    fn test_extra_signers_are_allowed() {
        let mut tx = valid_tx();
        let alice = KeyPair::from_seed("alice");
        let bob = KeyPair::from_seed("bob");
        let carol = KeyPair::from_seed("carol");
        tx.commands = vec![upgrade_command(&[&alice, &bob, &carol])];
        assert!(UpgradeClause::verify(&tx, &contracts()).is_ok());
    }

    #[test]
    fn test_rejects_no_inputs() {
        let mut tx = valid_tx();
        tx.inputs.clear();
        tx.outputs.clear();
        assert_eq!(violation(&tx), "Upgrade must consume at least one state");
    }

    #[test]
    fn test_rejects_unpaired_outputs() {
        let mut tx = valid_tx();
        let extra = tx.outputs[0].clone();
        tx.outputs.push(extra);
        assert_eq!(violation(&tx), "Inputs and outputs must be paired one to one");
    }

    #[test]
    fn test_rejects_input_of_other_contract() {
        let mut tx = valid_tx();
        tx.inputs[0].state.contract = ContractId("other.v1".to_string());
        assert_eq!(violation(&tx), "Input states must be of the legacy contract");
    }

    #[test]
    fn test_rejects_output_of_other_contract() {
        let mut tx = valid_tx();
        tx.outputs[0].contract = v1();
        assert_eq!(violation(&tx), "Output states must be of the upgraded contract");
    }

    #[test]
    fn test_rejects_tampered_output() {
        let mut tx = valid_tx();
        tx.outputs[0].data = json!({ "magic": 1000, "upgraded": true });
        assert_eq!(
            violation(&tx),
            "Output state must be an upgraded version of the input state"
        );
    }

    #[test]
    fn test_rejects_two_upgrade_commands() {
        let mut tx = valid_tx();
        let duplicate = tx.commands[0].clone();
        tx.commands.push(duplicate);
        assert_eq!(violation(&tx), "Exactly one upgrade command");
    }

    #[test]
    fn test_rejects_unknown_upgraded_contract() {
        let mut tx = valid_tx();
        tx.commands[0].value = CommandData::Upgrade {
            upgraded_contract: ContractId("dummy.v3".to_string()),
        };
        assert_eq!(violation(&tx), "Upgraded contract dummy.v3 is not installed");
    }
}
