//! Generic protocol for replacing a ledger state with the agreement of every
//! participant
//!
//! The [`Instigator`] assembles a transaction consuming the state and
//! producing its replacement, signs it, and asks every other participant for
//! a signature. Each [`Acceptor`] independently re-derives the transaction,
//! checks it against local policy, and either countersigns or rejects. Once
//! every participant has signed, the instigator distributes and records the
//! final transaction.
//!
//! What is replaced and how is decided by a [`ReplacementStrategy`].

use std::collections::BTreeSet;
use std::fmt::Debug;
use std::marker::PhantomData;

use accord_core::{
    DigitalSignature, Flow, FlowContext, FlowError, FlowEvent, FlowException, FlowMessage,
    FlowStep, Party, PartyKey, SecureHash, ServiceHub, SessionId, SignedTransaction,
    StateAndRef, StateRef, TransactionBuilder, WireTransaction,
};
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Failure of the state replacement protocol.
///
/// Every variant is a deliberate protocol outcome: it is reported to the
/// flow's waiters as a [`FlowException`] carrying [`code`](Self::code) and
/// signalled to counterparties, and is never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateReplacementError {
    /// A participant refused the proposal
    #[error("State replacement rejected by {party}: {reason}")]
    Rejected {
        /// Participant name
        party: String,
        /// Reason given by the participant
        reason: String,
    },

    /// A participant answered with a signature that does not check out
    #[error("Invalid signature from {party}: {reason}")]
    InvalidSignature {
        /// Participant name
        party: String,
        /// What is wrong with the signature
        reason: String,
    },

    /// A participant key does not resolve to a known party
    #[error("Cannot resolve participant {key} to a party")]
    UnknownParticipant {
        /// The key
        key: String,
    },

    /// A participant ended its session before answering
    #[error("Participant {party} ended the session before answering")]
    SessionEnded {
        /// Participant name
        party: String,
    },

    /// A participant did not answer in time
    #[error("Participant {party} did not answer within {timeout_ms}ms")]
    Timeout {
        /// Participant name
        party: String,
        /// Session timeout in effect
        timeout_ms: u64,
    },

    /// The proposal refers to a state this node has never seen
    #[error("We don't have a copy of the referenced state {state_ref}")]
    UnknownState {
        /// The state reference
        state_ref: String,
    },

    /// This node has not agreed to the proposed upgrade of the state
    #[error("Contract state upgrade is unauthorised. State hash : {state_ref}")]
    Unauthorised {
        /// The state reference
        state_ref: String,
    },

    /// A proposal check failed
    #[error("Failed requirement: {0}")]
    Verification(String),

    /// The modification cannot be applied to the state
    #[error("Invalid modification: {0}")]
    InvalidModification(String),

    /// The final transaction is not the agreed one or is not valid
    #[error("Invalid final transaction: {0}")]
    InvalidFinalTransaction(String),
}

impl StateReplacementError {
    /// Stable code identifying the failure
    pub fn code(&self) -> &'static str {
        match self {
            StateReplacementError::Rejected { .. } => "state_replacement.rejected",
            StateReplacementError::InvalidSignature { .. } => "state_replacement.invalid_signature",
            StateReplacementError::UnknownParticipant { .. } => {
                "state_replacement.unknown_participant"
            }
            StateReplacementError::SessionEnded { .. } => "state_replacement.session_ended",
            StateReplacementError::Timeout { .. } => "state_replacement.timeout",
            StateReplacementError::UnknownState { .. } => "state_replacement.unknown_state",
            StateReplacementError::Unauthorised { .. } => "state_replacement.unauthorised",
            StateReplacementError::Verification(_) => "state_replacement.verification_failed",
            StateReplacementError::InvalidModification(_) => {
                "state_replacement.invalid_modification"
            }
            StateReplacementError::InvalidFinalTransaction(_) => {
                "state_replacement.invalid_final_transaction"
            }
        }
    }
}

impl From<StateReplacementError> for FlowException {
    fn from(error: StateReplacementError) -> Self {
        FlowException::new(error.code(), error.to_string())
    }
}

impl From<StateReplacementError> for FlowError {
    fn from(error: StateReplacementError) -> Self {
        FlowError::Protocol(error.into())
    }
}

/// Fail with a verification error unless `condition` holds
pub fn require_that(description: impl Into<String>, condition: bool) -> Result<(), FlowError> {
    if condition {
        Ok(())
    } else {
        Err(StateReplacementError::Verification(description.into()).into())
    }
}

/// Decides what replaces a state and when a proposal is acceptable
#[async_trait]
pub trait ReplacementStrategy: Send + Sync + 'static {
    /// Describes the replacement, e.g. the contract to upgrade to
    type Modification: Serialize + DeserializeOwned + Clone + PartialEq + Debug + Send + Sync;

    /// Flow name of the instigating side
    const INSTIGATOR_NAME: &'static str;

    /// Flow name of the accepting side
    const ACCEPTOR_NAME: &'static str;

    /// Build the unsigned transaction replacing `state`
    fn assemble_bare_tx(
        services: &ServiceHub,
        state: &StateAndRef,
        modification: &Self::Modification,
    ) -> Result<TransactionBuilder, FlowError>;

    /// Check a proposal received from `sender` against local state and policy
    async fn verify_proposal(
        services: &ServiceHub,
        sender: &Party,
        proposal: &Proposal<Self::Modification>,
    ) -> Result<(), FlowError>;
}

/// Request to sign a replacement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal<M> {
    /// The state being replaced
    pub state_ref: StateRef,
    /// The replacement descriptor
    pub modification: M,
    /// Transaction signed by the instigator
    pub stx: SignedTransaction,
}

impl<M: Serialize + DeserializeOwned + Send> FlowMessage for Proposal<M> {
    const TYPE_TAG: &'static str = "state_replacement.proposal";
}

/// Answer of a participant to a proposal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProposalResponse {
    /// The participant countersigned
    Accepted {
        /// Signature over the proposed transaction
        signature: DigitalSignature,
    },
    /// The participant refused
    Rejected {
        /// Failure code
        code: String,
        /// Failure description
        reason: String,
    },
}

impl FlowMessage for ProposalResponse {
    const TYPE_TAG: &'static str = "state_replacement.response";
}

/// Turn a session failure while talking to `party` into a protocol error
fn participant_error(error: FlowError, party: &Party) -> FlowError {
    let party = party.name.clone();
    match error {
        FlowError::SessionTimeout { timeout_ms, .. } => {
            StateReplacementError::Timeout { party, timeout_ms }.into()
        }
        FlowError::SessionEnded { .. } | FlowError::CounterpartyFailed { .. } => {
            StateReplacementError::SessionEnded { party }.into()
        }
        FlowError::SessionRejected { reason, .. } => {
            StateReplacementError::Rejected { party, reason }.into()
        }
        FlowError::Protocol(exception) => StateReplacementError::Rejected {
            party,
            reason: exception.message,
        }
        .into(),
        other => other,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Participant {
    session: SessionId,
    key: PartyKey,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum InstigatorStage {
    Start,
    Collecting {
        proposal: SignedTransaction,
        stx: SignedTransaction,
        participants: Vec<Participant>,
        next: usize,
    },
    Distributing {
        stx: SignedTransaction,
        participants: Vec<Participant>,
        next: usize,
    },
    Committing {
        stx: SignedTransaction,
        hash: SecureHash,
    },
}

/// Proposes a replacement and gathers every participant's signature
#[derive(Serialize, Deserialize)]
#[serde(bound = "")]
pub struct Instigator<S: ReplacementStrategy> {
    original_state: StateAndRef,
    modification: S::Modification,
    stage: InstigatorStage,
    #[serde(skip)]
    _strategy: PhantomData<fn() -> S>,
}

impl<S: ReplacementStrategy> Instigator<S> {
    /// Replace `original_state` according to `modification`
    pub fn new(original_state: StateAndRef, modification: S::Modification) -> Self {
        Self {
            original_state,
            modification,
            stage: InstigatorStage::Start,
            _strategy: PhantomData,
        }
    }

    fn proposal(&self, stx: &SignedTransaction) -> Proposal<S::Modification> {
        Proposal {
            state_ref: self.original_state.state_ref,
            modification: self.modification.clone(),
            stx: stx.clone(),
        }
    }

    fn request_signature(
        &mut self,
        ctx: &mut FlowContext<'_>,
        proposal: SignedTransaction,
        stx: SignedTransaction,
        participants: Vec<Participant>,
        next: usize,
    ) -> Result<FlowStep<SignedTransaction>, FlowError> {
        let session = participants[next].session.clone();
        let request = ctx.send_and_receive::<_, ProposalResponse>(
            &session,
            &self.proposal(&proposal),
            "collect signatures",
        )?;
        self.stage = InstigatorStage::Collecting {
            proposal,
            stx,
            participants,
            next,
        };
        Ok(FlowStep::Suspend(request))
    }

    fn distribute(
        &mut self,
        ctx: &mut FlowContext<'_>,
        stx: SignedTransaction,
        participants: Vec<Participant>,
        next: usize,
    ) -> Result<FlowStep<SignedTransaction>, FlowError> {
        let request = ctx.send(&participants[next].session, &stx, "distribute final transaction")?;
        self.stage = InstigatorStage::Distributing {
            stx,
            participants,
            next,
        };
        Ok(FlowStep::Suspend(request))
    }

    async fn verify_final(
        ctx: &FlowContext<'_>,
        stx: &SignedTransaction,
    ) -> Result<(), FlowError> {
        ctx.services()
            .verify_transaction(stx, true)
            .await
            .map_err(|e| StateReplacementError::InvalidFinalTransaction(e.to_string()).into())
    }

    async fn finalise(
        &mut self,
        ctx: &mut FlowContext<'_>,
        stx: SignedTransaction,
    ) -> Result<FlowStep<SignedTransaction>, FlowError> {
        let hash = stx.id()?;
        ctx.record_transaction(&stx).await?;
        info!(flow_id = %ctx.flow_id(), tx = %hash, "Replacement transaction recorded");
        let request = ctx.wait_for_ledger_commit(hash, "await commit");
        self.stage = InstigatorStage::Committing { stx, hash };
        Ok(FlowStep::Suspend(request))
    }
}

#[async_trait]
impl<S: ReplacementStrategy> Flow for Instigator<S> {
    type Output = SignedTransaction;
    const NAME: &'static str = S::INSTIGATOR_NAME;

    async fn step(
        &mut self,
        ctx: &mut FlowContext<'_>,
        event: FlowEvent,
    ) -> Result<FlowStep<SignedTransaction>, FlowError> {
        match self.stage.clone() {
            InstigatorStage::Start => {
                let builder =
                    S::assemble_bare_tx(ctx.services(), &self.original_state, &self.modification)?;
                let tx = builder.to_wire_transaction();
                let signature = ctx.services().sign(tx.id()?.as_bytes())?;
                let stx = SignedTransaction {
                    tx,
                    sigs: vec![signature],
                };

                let me = ctx.our_identity().owning_key;
                let mut seen = BTreeSet::new();
                let mut participants = Vec::new();
                for key in &self.original_state.state.participants {
                    if *key == me || !seen.insert(*key) {
                        continue;
                    }
                    let party = ctx.services().party_from_key(key).await?.ok_or_else(|| {
                        StateReplacementError::UnknownParticipant {
                            key: key.to_string(),
                        }
                    })?;
                    let session = ctx.initiate_flow(party);
                    participants.push(Participant { session, key: *key });
                }

                debug!(
                    flow_id = %ctx.flow_id(),
                    state_ref = %self.original_state.state_ref,
                    participants = participants.len(),
                    "Proposing state replacement"
                );
                if participants.is_empty() {
                    Self::verify_final(ctx, &stx).await?;
                    return self.finalise(ctx, stx).await;
                }
                self.request_signature(ctx, stx.clone(), stx, participants, 0)
            }
            InstigatorStage::Collecting {
                proposal,
                stx,
                participants,
                next,
            } => {
                let participant = &participants[next];
                let party = ctx.counterparty(&participant.session)?.clone();
                let response = event
                    .into_message::<ProposalResponse>(&participant.session)
                    .map_err(|e| participant_error(e, &party))?;

                let signature = match response {
                    ProposalResponse::Accepted { signature } => signature,
                    ProposalResponse::Rejected { code, reason } => {
                        warn!(
                            flow_id = %ctx.flow_id(),
                            party = %party,
                            code = %code,
                            reason = %reason,
                            "Replacement rejected"
                        );
                        return Err(StateReplacementError::Rejected {
                            party: party.name,
                            reason,
                        }
                        .into());
                    }
                };

                if signature.by != participant.key {
                    return Err(StateReplacementError::InvalidSignature {
                        party: party.name,
                        reason: format!("signed with key {} instead", signature.by),
                    }
                    .into());
                }
                if let Err(err) = signature.verify(stx.id()?.as_bytes()) {
                    return Err(StateReplacementError::InvalidSignature {
                        party: party.name,
                        reason: err.to_string(),
                    }
                    .into());
                }
                debug!(flow_id = %ctx.flow_id(), party = %party, "Collected signature");

                let stx = stx.with_additional_signature(signature);
                let next = next + 1;
                if next < participants.len() {
                    return self.request_signature(ctx, proposal, stx, participants, next);
                }

                Self::verify_final(ctx, &stx).await?;
                self.distribute(ctx, stx, participants, 0)
            }
            InstigatorStage::Distributing {
                stx,
                participants,
                next,
            } => {
                let participant = &participants[next];
                let party = ctx.counterparty(&participant.session)?.clone();
                event
                    .into_sent(&participant.session)
                    .map_err(|e| participant_error(e, &party))?;

                let next = next + 1;
                if next < participants.len() {
                    return self.distribute(ctx, stx, participants, next);
                }
                self.finalise(ctx, stx).await
            }
            InstigatorStage::Committing { stx, hash } => {
                event.into_committed(&hash)?;
                Ok(FlowStep::Complete(stx))
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum AcceptorStage {
    Start,
    Receiving,
    Rejecting { error: FlowError },
    AwaitingFinal { proposed: WireTransaction },
    Committing { stx: SignedTransaction, hash: SecureHash },
}

/// Checks a proposal and countersigns it if acceptable
#[derive(Serialize, Deserialize)]
#[serde(bound = "")]
pub struct Acceptor<S: ReplacementStrategy> {
    session: SessionId,
    stage: AcceptorStage,
    #[serde(skip)]
    _strategy: PhantomData<fn() -> S>,
}

impl<S: ReplacementStrategy> Acceptor<S> {
    /// Answer the proposal arriving on `session`
    pub fn new(session: SessionId) -> Self {
        Self {
            session,
            stage: AcceptorStage::Start,
            _strategy: PhantomData,
        }
    }

    async fn verify(
        ctx: &FlowContext<'_>,
        sender: &Party,
        proposal: &Proposal<S::Modification>,
    ) -> Result<(), FlowError> {
        S::verify_proposal(ctx.services(), sender, proposal).await?;

        require_that(
            "the proposal is signed by the instigator",
            proposal.stx.signing_keys().contains(&sender.owning_key),
        )?;
        proposal.stx.verify_signatures().map_err(|e| {
            StateReplacementError::InvalidSignature {
                party: sender.name.clone(),
                reason: e.to_string(),
            }
        })?;
        Ok(())
    }
}

#[async_trait]
impl<S: ReplacementStrategy> Flow for Acceptor<S> {
    type Output = SignedTransaction;
    const NAME: &'static str = S::ACCEPTOR_NAME;

    async fn step(
        &mut self,
        ctx: &mut FlowContext<'_>,
        event: FlowEvent,
    ) -> Result<FlowStep<SignedTransaction>, FlowError> {
        match self.stage.clone() {
            AcceptorStage::Start => {
                let request =
                    ctx.receive::<Proposal<S::Modification>>(&self.session, "receive proposal")?;
                self.stage = AcceptorStage::Receiving;
                Ok(FlowStep::Suspend(request))
            }
            AcceptorStage::Receiving => {
                let proposal: Proposal<S::Modification> = event.into_message(&self.session)?;
                let sender = ctx.counterparty(&self.session)?.clone();

                match Self::verify(ctx, &sender, &proposal).await {
                    Ok(()) => {
                        let signature = ctx.services().sign(proposal.stx.id()?.as_bytes())?;
                        info!(
                            flow_id = %ctx.flow_id(),
                            party = %sender,
                            state_ref = %proposal.state_ref,
                            "Accepted replacement proposal"
                        );
                        let request = ctx.send_and_receive::<_, SignedTransaction>(
                            &self.session,
                            &ProposalResponse::Accepted { signature },
                            "await final transaction",
                        )?;
                        self.stage = AcceptorStage::AwaitingFinal {
                            proposed: proposal.stx.tx,
                        };
                        Ok(FlowStep::Suspend(request))
                    }
                    Err(error) => {
                        warn!(
                            flow_id = %ctx.flow_id(),
                            party = %sender,
                            state_ref = %proposal.state_ref,
                            error = %error,
                            "Rejecting replacement proposal"
                        );
                        let (code, reason) = match &error {
                            FlowError::Protocol(exception) => {
                                (exception.code.clone(), exception.message.clone())
                            }
                            other => ("state_replacement.rejected".to_string(), other.to_string()),
                        };
                        let request = ctx.send(
                            &self.session,
                            &ProposalResponse::Rejected { code, reason },
                            "send rejection",
                        )?;
                        self.stage = AcceptorStage::Rejecting { error };
                        Ok(FlowStep::Suspend(request))
                    }
                }
            }
            AcceptorStage::Rejecting { error } => {
                event.into_sent(&self.session)?;
                Err(error)
            }
            AcceptorStage::AwaitingFinal { proposed } => {
                let party = ctx.counterparty(&self.session)?.clone();
                let stx: SignedTransaction = event
                    .into_message(&self.session)
                    .map_err(|e| participant_error(e, &party))?;

                if stx.tx != proposed {
                    return Err(StateReplacementError::InvalidFinalTransaction(
                        "it differs from the proposed transaction".to_string(),
                    )
                    .into());
                }
                ctx.services()
                    .verify_transaction(&stx, true)
                    .await
                    .map_err(|e| StateReplacementError::InvalidFinalTransaction(e.to_string()))?;

                let hash = stx.id()?;
                ctx.record_transaction(&stx).await?;
                info!(flow_id = %ctx.flow_id(), tx = %hash, "Replacement transaction recorded");
                let request = ctx.wait_for_ledger_commit(hash, "await commit");
                self.stage = AcceptorStage::Committing { stx, hash };
                Ok(FlowStep::Suspend(request))
            }
            AcceptorStage::Committing { stx, hash } => {
                event.into_committed(&hash)?;
                Ok(FlowStep::Complete(stx))
            }
        }
    }
}
