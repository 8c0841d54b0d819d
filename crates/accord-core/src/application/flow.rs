//! Flow logic and the context it runs in
//!
//! A flow is a serializable state machine. Each call to [`Flow::step`] runs
//! the logic up to its next I/O request and returns it; the manager satisfies
//! the request and calls `step` again with the result. Between steps the flow
//! value itself is the continuation and is stored in the checkpoint.

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};

use super::service_hub::ServiceHub;
use crate::domain::flow_instance::{FlowId, FlowInstance};
use crate::domain::identity::{Party, SecureHash};
use crate::domain::io_request::{FlowIORequest, SuspensionSite};
use crate::domain::messaging::MessageId;
use crate::domain::session::{FlowSession, SessionId};
use crate::domain::transaction::SignedTransaction;
use crate::error::FlowError;
use crate::types::{FlowMessage, Payload};
use crate::CoreError;

/// What a flow step produced
#[derive(Debug, Clone, PartialEq)]
pub enum FlowStep<O> {
    /// Suspend until the request is satisfied
    Suspend(FlowIORequest),
    /// Finish with a result
    Complete(O),
}

/// The event a flow is resumed with
#[derive(Debug, Clone, PartialEq)]
pub enum FlowEvent {
    /// First step of a new flow
    Start,
    /// A payload arrived on a session
    Received {
        /// Session the payload arrived on
        session: SessionId,
        /// The payload
        payload: Payload,
    },
    /// A send was handed to the transport
    Sent {
        /// Session the payload was sent on
        session: SessionId,
    },
    /// An awaited transaction was committed
    Committed {
        /// Transaction hash
        hash: SecureHash,
    },
    /// The request failed
    Failed(FlowError),
}

impl FlowEvent {
    /// Short name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            FlowEvent::Start => "start",
            FlowEvent::Received { .. } => "received",
            FlowEvent::Sent { .. } => "sent",
            FlowEvent::Committed { .. } => "committed",
            FlowEvent::Failed(_) => "failed",
        }
    }

    /// Decode the message received on `session`
    pub fn into_message<T: FlowMessage>(self, session: &SessionId) -> Result<T, FlowError> {
        match self {
            FlowEvent::Received {
                session: received_on,
                payload,
            } if received_on == *session => payload.decode::<T>().map_err(|e| {
                FlowError::Logic(format!("Malformed {} payload: {}", T::TYPE_TAG, e))
            }),
            FlowEvent::Failed(error) => Err(error),
            other => Err(unexpected_event(&other, "a message")),
        }
    }

    /// Confirm that a send on `session` went out
    pub fn into_sent(self, session: &SessionId) -> Result<(), FlowError> {
        match self {
            FlowEvent::Sent { session: sent_on } if sent_on == *session => Ok(()),
            FlowEvent::Failed(error) => Err(error),
            other => Err(unexpected_event(&other, "a send confirmation")),
        }
    }

    /// Confirm that the transaction `hash` was committed
    pub fn into_committed(self, hash: &SecureHash) -> Result<(), FlowError> {
        match self {
            FlowEvent::Committed { hash: committed } if committed == *hash => Ok(()),
            FlowEvent::Failed(error) => Err(error),
            other => Err(unexpected_event(&other, "a ledger commit")),
        }
    }
}

fn unexpected_event(event: &FlowEvent, expected: &str) -> FlowError {
    FlowError::Logic(format!(
        "Expected {} but the flow was resumed with {}",
        expected,
        event.kind()
    ))
}

/// A long-running protocol instance
#[async_trait]
pub trait Flow: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Result of the flow
    type Output: Serialize + DeserializeOwned + Send + 'static;

    /// Stable name used in checkpoints and session initiation
    const NAME: &'static str;

    /// Run until the next I/O request or completion
    async fn step(
        &mut self,
        ctx: &mut FlowContext<'_>,
        event: FlowEvent,
    ) -> Result<FlowStep<Self::Output>, FlowError>;
}

/// Object-safe view of a flow used by the manager
#[async_trait]
pub trait ErasedFlow: Send + Sync {
    /// Registered name
    fn name(&self) -> &'static str;

    /// Serialize the flow for a checkpoint
    fn snapshot(&self) -> Result<serde_json::Value, CoreError>;

    /// Run one step, with the output serialized
    async fn step(
        &mut self,
        ctx: &mut FlowContext<'_>,
        event: FlowEvent,
    ) -> Result<FlowStep<serde_json::Value>, FlowError>;
}

struct ErasedLogic<F>(F);

#[async_trait]
impl<F: Flow> ErasedFlow for ErasedLogic<F> {
    fn name(&self) -> &'static str {
        F::NAME
    }

    fn snapshot(&self) -> Result<serde_json::Value, CoreError> {
        Ok(serde_json::to_value(&self.0)?)
    }

    async fn step(
        &mut self,
        ctx: &mut FlowContext<'_>,
        event: FlowEvent,
    ) -> Result<FlowStep<serde_json::Value>, FlowError> {
        match self.0.step(ctx, event).await? {
            FlowStep::Suspend(request) => Ok(FlowStep::Suspend(request)),
            FlowStep::Complete(output) => Ok(FlowStep::Complete(serde_json::to_value(output)?)),
        }
    }
}

/// Box a flow for the manager
pub fn erase<F: Flow>(flow: F) -> Box<dyn ErasedFlow> {
    Box::new(ErasedLogic(flow))
}

/// Rebuild a boxed flow from its checkpointed value
pub fn restore<F: Flow>(continuation: serde_json::Value) -> Result<Box<dyn ErasedFlow>, CoreError> {
    let flow: F = serde_json::from_value(continuation).map_err(|e| {
        CoreError::CheckpointError(format!("Cannot restore flow {}: {}", F::NAME, e))
    })?;
    Ok(erase(flow))
}

/// What a flow can see and do during a step
pub struct FlowContext<'a> {
    instance: &'a mut FlowInstance,
    hub: &'a ServiceHub,
    recorded: Vec<SecureHash>,
}

impl<'a> FlowContext<'a> {
    pub(crate) fn new(instance: &'a mut FlowInstance, hub: &'a ServiceHub) -> Self {
        Self {
            instance,
            hub,
            recorded: Vec::new(),
        }
    }

    /// Id of the running flow
    pub fn flow_id(&self) -> &FlowId {
        &self.instance.id
    }

    /// Node services
    pub fn services(&self) -> &ServiceHub {
        self.hub
    }

    /// This node's identity
    pub fn our_identity(&self) -> &Party {
        self.hub.my_identity()
    }

    /// Open a new session with `party`; nothing is sent until the first send
    pub fn initiate_flow(&mut self, party: Party) -> SessionId {
        self.instance.open_session(FlowSession::initiating(party))
    }

    /// Counterparty of a session
    pub fn counterparty(&self, session: &SessionId) -> Result<&Party, FlowError> {
        self.instance
            .session(session)
            .map(|s| &s.counterparty)
            .ok_or_else(|| FlowError::Logic(format!("Unknown session {}", session)))
    }

    /// Request to send a message
    #[track_caller]
    pub fn send<T: FlowMessage>(
        &self,
        session: &SessionId,
        message: &T,
        step: &str,
    ) -> Result<FlowIORequest, FlowError> {
        self.counterparty(session)?;
        Ok(FlowIORequest::SendOnly {
            session: session.clone(),
            payload: Payload::encode(message)?,
            message_id: MessageId::random(),
            site: SuspensionSite::here(step),
        })
    }

    /// Request to receive a message of type `R`
    #[track_caller]
    pub fn receive<R: FlowMessage>(
        &self,
        session: &SessionId,
        step: &str,
    ) -> Result<FlowIORequest, FlowError> {
        self.counterparty(session)?;
        Ok(FlowIORequest::ReceiveOnly {
            session: session.clone(),
            receive_type: R::TYPE_TAG.to_string(),
            site: SuspensionSite::here(step),
        })
    }

    /// Request to send a message and receive a reply of type `R`
    #[track_caller]
    pub fn send_and_receive<T: FlowMessage, R: FlowMessage>(
        &self,
        session: &SessionId,
        message: &T,
        step: &str,
    ) -> Result<FlowIORequest, FlowError> {
        self.counterparty(session)?;
        Ok(FlowIORequest::SendAndReceive {
            session: session.clone(),
            payload: Payload::encode(message)?,
            message_id: MessageId::random(),
            receive_type: R::TYPE_TAG.to_string(),
            site: SuspensionSite::here(step),
        })
    }

    /// Request to wait until `hash` is committed to the local ledger
    #[track_caller]
    pub fn wait_for_ledger_commit(&self, hash: SecureHash, step: &str) -> FlowIORequest {
        FlowIORequest::WaitForLedgerCommit {
            hash,
            flow_id: self.instance.id.clone(),
            site: SuspensionSite::here(step),
        }
    }

    /// Record a validated transaction in local storage and the vault
    pub async fn record_transaction(&mut self, stx: &SignedTransaction) -> Result<(), FlowError> {
        let hash = stx.id()?;
        if self.hub.record_transaction(stx).await? {
            self.recorded.push(hash);
        }
        Ok(())
    }

    pub(crate) fn take_recorded(&mut self) -> Vec<SecureHash> {
        std::mem::take(&mut self.recorded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Ping(u32);

    impl FlowMessage for Ping {
        const TYPE_TAG: &'static str = "test.ping";
    }

    #[test]
    fn test_into_message_checks_session() {
        let session = SessionId("s1".to_string());
        let event = FlowEvent::Received {
            session: session.clone(),
            payload: Payload::encode(&Ping(3)).unwrap(),
        };
        assert_eq!(event.clone().into_message::<Ping>(&session).unwrap(), Ping(3));

        let other = SessionId("s2".to_string());
        assert!(matches!(
            event.into_message::<Ping>(&other),
            Err(FlowError::Logic(_))
        ));
    }

    #[test]
    fn test_failed_event_propagates_error() {
        let session = SessionId("s1".to_string());
        let error = FlowError::SessionTimeout {
            session: "s1".to_string(),
            party: "Bob".to_string(),
            timeout_ms: 5,
        };
        assert_eq!(
            FlowEvent::Failed(error.clone())
                .into_message::<Ping>(&session)
                .unwrap_err(),
            error
        );
        assert_eq!(
            FlowEvent::Failed(error.clone()).into_sent(&session).unwrap_err(),
            error
        );
    }

    #[test]
    fn test_into_committed_requires_matching_hash() {
        let hash = SecureHash::sha256(b"tx");
        assert!(FlowEvent::Committed { hash }.into_committed(&hash).is_ok());
        assert!(FlowEvent::Committed {
            hash: SecureHash::sha256(b"other")
        }
        .into_committed(&hash)
        .is_err());
        assert!(FlowEvent::Start.into_committed(&hash).is_err());
    }
}
