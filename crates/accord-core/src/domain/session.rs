//! Sessions between a local flow and one counterparty flow

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use uuid::Uuid;

use super::flow_instance::FlowId;
use super::identity::Party;
use super::messaging::MessageId;
use crate::error::{FlowError, FlowException};
use crate::types::Payload;

/// Value object: Session ID
///
/// Chosen by the initiating side and shared by both ends of the session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    /// Generate a fresh session id
    pub fn random() -> Self {
        SessionId(Uuid::new_v4().to_string())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Delivery state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// Created locally, nothing sent yet
    Uninitiated,
    /// Initiation sent, no confirmation received
    Initiating,
    /// Both ends know each other
    Initiated,
    /// No further messages will arrive
    Closed,
}

/// How the counterparty closed a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionEnd {
    /// The counterparty flow completed
    Completed,
    /// The counterparty flow failed with a protocol exception
    Exception {
        /// Exception raised by the counterparty
        exception: FlowException,
    },
    /// The counterparty flow failed with an undisclosed error
    Failed,
    /// The counterparty refused to start a flow for this session
    Rejected {
        /// Reason given
        reason: String,
    },
}

/// A session as seen from one flow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowSession {
    /// Session id shared with the counterparty
    pub id: SessionId,
    /// The other party
    pub counterparty: Party,
    /// Id of the counterparty flow, once known
    pub counterparty_flow_id: Option<FlowId>,
    /// Delivery state
    pub state: SessionState,
    /// Whether the local flow opened this session
    pub initiator: bool,
    /// Id of the message that carried the session initiation
    #[serde(default)]
    pub init_message_id: Option<MessageId>,
    /// Payloads received but not yet consumed by the flow
    pub inbox: VecDeque<Payload>,
    /// Set once the counterparty has closed the session
    pub remote_end: Option<SessionEnd>,
}

impl FlowSession {
    /// A session opened by the local flow
    pub fn initiating(counterparty: Party) -> Self {
        Self {
            id: SessionId::random(),
            counterparty,
            counterparty_flow_id: None,
            state: SessionState::Uninitiated,
            initiator: true,
            init_message_id: None,
            inbox: VecDeque::new(),
            remote_end: None,
        }
    }

    /// A session opened by a counterparty flow
    pub fn initiated(id: SessionId, counterparty: Party, counterparty_flow_id: FlowId) -> Self {
        Self {
            id,
            counterparty,
            counterparty_flow_id: Some(counterparty_flow_id),
            state: SessionState::Initiated,
            initiator: false,
            init_message_id: None,
            inbox: VecDeque::new(),
            remote_end: None,
        }
    }

    /// Whether a send with `message_id` must carry the session initiation
    pub fn needs_init(&self, message_id: &MessageId) -> bool {
        match self.state {
            SessionState::Uninitiated => true,
            SessionState::Initiating => self.init_message_id.as_ref() == Some(message_id),
            SessionState::Initiated | SessionState::Closed => false,
        }
    }

    /// Whether the local side may still send on this session
    #[inline]
    pub fn is_open(&self) -> bool {
        self.state != SessionState::Closed
    }

    /// Record the counterparty's confirmation
    pub fn confirm(&mut self, counterparty_flow_id: FlowId) {
        self.counterparty_flow_id = Some(counterparty_flow_id);
        if self.state == SessionState::Initiating || self.state == SessionState::Uninitiated {
            self.state = SessionState::Initiated;
        }
    }

    /// Record that the counterparty closed the session
    pub fn close_remotely(&mut self, end: SessionEnd) {
        self.state = SessionState::Closed;
        self.remote_end = Some(end);
    }

    /// Error a flow sees when waiting on this session after it was closed
    pub fn end_error(&self) -> Option<FlowError> {
        let party = self.counterparty.name.clone();
        let session = self.id.to_string();
        self.remote_end.as_ref().map(|end| match end {
            SessionEnd::Completed => FlowError::SessionEnded { session, party },
            SessionEnd::Exception { exception } => FlowError::Protocol(exception.clone()),
            SessionEnd::Failed => FlowError::CounterpartyFailed { party },
            SessionEnd::Rejected { reason } => FlowError::SessionRejected {
                session,
                party,
                reason: reason.clone(),
            },
        })
    }
}
