//! Session protocol messages and the transport seam

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::flow_instance::FlowId;
use super::identity::Party;
use super::session::{SessionEnd, SessionId};
use crate::types::Payload;
use crate::CoreError;

/// Value object: Message ID
///
/// Stable across re-sends so that receivers can drop duplicates.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(pub String);

impl MessageId {
    /// Generate a fresh message id
    pub fn random() -> Self {
        MessageId(Uuid::new_v4().to_string())
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Messages exchanged between the two ends of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionMessage {
    /// Open a session and start the responder flow
    Init {
        /// Session being opened
        session_id: SessionId,
        /// Id of the initiating flow
        initiator_flow_id: FlowId,
        /// Name of the initiating flow, used to pick the responder
        flow_name: String,
        /// First payload, if the initiator sent one straight away
        payload: Option<Payload>,
    },
    /// Responder flow started
    Confirm {
        /// Session being confirmed
        session_id: SessionId,
        /// Id of the responder flow
        initiated_flow_id: FlowId,
    },
    /// No responder could be started
    Reject {
        /// Session being rejected
        session_id: SessionId,
        /// Why the session was rejected
        reason: String,
    },
    /// Payload on an open session
    Data {
        /// Session the payload belongs to
        session_id: SessionId,
        /// The payload
        payload: Payload,
    },
    /// The sending flow finished
    End {
        /// Session being closed
        session_id: SessionId,
        /// How the sender finished
        end: SessionEnd,
    },
}

impl SessionMessage {
    /// Session this message belongs to
    pub fn session_id(&self) -> &SessionId {
        match self {
            SessionMessage::Init { session_id, .. }
            | SessionMessage::Confirm { session_id, .. }
            | SessionMessage::Reject { session_id, .. }
            | SessionMessage::Data { session_id, .. }
            | SessionMessage::End { session_id, .. } => session_id,
        }
    }

    /// Short name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            SessionMessage::Init { .. } => "init",
            SessionMessage::Confirm { .. } => "confirm",
            SessionMessage::Reject { .. } => "reject",
            SessionMessage::Data { .. } => "data",
            SessionMessage::End { .. } => "end",
        }
    }
}

/// Envelope handed to the transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkMessage {
    /// Deduplication id
    pub message_id: MessageId,
    /// Authenticated sender
    pub sender: Party,
    /// Recipient
    pub recipient: Party,
    /// Session message
    pub body: SessionMessage,
}

/// Point-to-point transport with at-least-once delivery
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessagingService: Send + Sync {
    /// Hand a message to the transport
    async fn send(&self, message: NetworkMessage) -> Result<(), CoreError>;
}
