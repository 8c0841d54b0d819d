//! Upgrading states to a new version of their contract
//!
//! Every participant of a state must first authorise the upgrade of that
//! specific state in its vault. The instigator then runs
//! [`ContractUpgradeInstigator`]; each participant's
//! [`ContractUpgradeAcceptor`] countersigns only an upgrade it authorised.

use accord_core::{
    CommandData, ContractId, CoreError, FlowError, FlowRegistry, Party, ServiceHub, StateAndRef,
    TransactionBuilder,
};
use async_trait::async_trait;
use tracing::info;

use crate::state_replacement::{
    require_that, Acceptor, Instigator, Proposal, ReplacementStrategy, StateReplacementError,
};

/// Replacement strategy moving a state to an upgraded contract
#[derive(Debug, Clone, Copy, Default)]
pub struct ContractUpgrade;

/// Instigating side of a contract upgrade
pub type ContractUpgradeInstigator = Instigator<ContractUpgrade>;

/// Accepting side of a contract upgrade
pub type ContractUpgradeAcceptor = Acceptor<ContractUpgrade>;

impl ContractUpgrade {
    /// Flow upgrading `state` to `upgraded_contract`
    pub fn instigator(state: StateAndRef, upgraded_contract: ContractId) -> ContractUpgradeInstigator {
        Instigator::new(state, upgraded_contract)
    }

    /// Register both sides of the contract upgrade protocol
    pub fn register_flows(registry: &mut FlowRegistry) {
        registry.register::<ContractUpgradeInstigator>();
        registry.register_responder::<ContractUpgradeInstigator, ContractUpgradeAcceptor, _>(
            |_party, session| Acceptor::new(session),
        );
    }
}

/// Agree in advance to upgrade `state` to `upgraded_contract`.
///
/// The upgrade must be installed locally and must upgrade from the state's
/// current contract.
pub async fn authorise_contract_upgrade(
    services: &ServiceHub,
    state: &StateAndRef,
    upgraded_contract: &ContractId,
) -> Result<(), CoreError> {
    let upgrade = services.contracts().upgrade(upgraded_contract).ok_or_else(|| {
        CoreError::ConfigurationError(format!(
            "Upgraded contract {} is not installed",
            upgraded_contract
        ))
    })?;
    if upgrade.legacy_contract() != state.state.contract {
        return Err(CoreError::ConfigurationError(format!(
            "{} does not upgrade {}",
            upgraded_contract, state.state.contract
        )));
    }

    services
        .vault()
        .authorise_contract_upgrade(&state.state_ref, upgraded_contract)
        .await?;
    info!(
        state_ref = %state.state_ref,
        upgraded_contract = %upgraded_contract,
        "Authorised contract upgrade"
    );
    Ok(())
}

/// Withdraw the authorisation to upgrade `state`
pub async fn deauthorise_contract_upgrade(
    services: &ServiceHub,
    state: &StateAndRef,
) -> Result<(), CoreError> {
    services
        .vault()
        .deauthorise_contract_upgrade(&state.state_ref)
        .await?;
    info!(state_ref = %state.state_ref, "Withdrew contract upgrade authorisation");
    Ok(())
}

#[async_trait]
impl ReplacementStrategy for ContractUpgrade {
    type Modification = ContractId;

    const INSTIGATOR_NAME: &'static str = "contract_upgrade.instigator";
    const ACCEPTOR_NAME: &'static str = "contract_upgrade.acceptor";

    fn assemble_bare_tx(
        services: &ServiceHub,
        state: &StateAndRef,
        modification: &ContractId,
    ) -> Result<TransactionBuilder, FlowError> {
        let upgrade = services.contracts().upgrade(modification).ok_or_else(|| {
            StateReplacementError::InvalidModification(format!(
                "Upgraded contract {} is not installed",
                modification
            ))
        })?;
        let output = upgrade
            .upgrade(&state.state)
            .map_err(|violation| StateReplacementError::InvalidModification(violation.requirement))?;

        Ok(TransactionBuilder::new()
            .with_input(state)
            .with_output(output)
            .with_command(
                CommandData::Upgrade {
                    upgraded_contract: modification.clone(),
                },
                state.state.participants.clone(),
            ))
    }

    async fn verify_proposal(
        services: &ServiceHub,
        sender: &Party,
        proposal: &Proposal<ContractId>,
    ) -> Result<(), FlowError> {
        let state_ref = proposal.state_ref;
        let source = services
            .transactions()
            .get(&state_ref.txhash)
            .await?
            .ok_or_else(|| StateReplacementError::UnknownState {
                state_ref: state_ref.to_string(),
            })?;
        let state = source
            .tx
            .out_ref(state_ref.index)
            .map_err(|_| StateReplacementError::UnknownState {
                state_ref: state_ref.to_string(),
            })?;

        let authorised = services
            .vault()
            .get_authorised_contract_upgrade(&state.state_ref)
            .await?
            .ok_or_else(|| StateReplacementError::Unauthorised {
                state_ref: state.state_ref.to_string(),
            })?;

        require_that(
            "the instigator is one of the participants",
            state.state.participants.contains(&sender.owning_key),
        )?;
        require_that(
            format!(
                "the proposed upgrade {} is a trusted upgrade path",
                proposal.modification
            ),
            proposal.modification == authorised,
        )?;

        let expected = Self::assemble_bare_tx(services, &state, &proposal.modification)?
            .to_wire_transaction();
        let actual = &proposal.stx.tx;
        require_that(
            "the proposed tx matches the expected tx for this upgrade",
            *actual == expected,
        )?;
        require_that(
            "number of inputs and outputs match",
            actual.inputs.len() == actual.outputs.len(),
        )?;

        let upgrade = services
            .contracts()
            .upgrade(&proposal.modification)
            .ok_or_else(|| {
                StateReplacementError::InvalidModification(format!(
                    "Upgraded contract {} is not installed",
                    proposal.modification
                ))
            })?;
        require_that(
            "input belongs to the legacy contract",
            state.state.contract == upgrade.legacy_contract(),
        )?;
        require_that(
            "output belongs to the upgraded contract",
            actual
                .outputs
                .iter()
                .all(|output| output.contract == proposal.modification),
        )?;
        Ok(())
    }
}
