//! What a suspended flow is waiting for

use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::Location;

use super::flow_instance::FlowId;
use super::identity::SecureHash;
use super::messaging::MessageId;
use super::session::SessionId;
use crate::types::Payload;

/// Where a flow suspended: the flow step plus the source location that issued
/// the request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuspensionSite {
    /// Flow step name
    pub step: String,
    /// Source file
    pub file: String,
    /// Source line
    pub line: u32,
}

impl SuspensionSite {
    /// Capture the caller's location
    #[track_caller]
    pub fn here(step: impl Into<String>) -> Self {
        let location = Location::caller();
        Self {
            step: step.into(),
            file: location.file().to_string(),
            line: location.line(),
        }
    }
}

impl fmt::Display for SuspensionSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}:{})", self.step, self.file, self.line)
    }
}

/// An I/O request issued by a flow; the flow stays suspended until the
/// manager can satisfy it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FlowIORequest {
    /// Send a payload and continue once it is handed to the transport
    SendOnly {
        /// Target session
        session: SessionId,
        /// Payload to send
        payload: Payload,
        /// Id reused for every re-send of this payload
        message_id: MessageId,
        /// Suspension site
        site: SuspensionSite,
    },
    /// Wait for the next payload on a session
    ReceiveOnly {
        /// Session to receive on
        session: SessionId,
        /// Declared type tag of the expected payload
        receive_type: String,
        /// Suspension site
        site: SuspensionSite,
    },
    /// Send a payload and wait for the reply
    SendAndReceive {
        /// Target session
        session: SessionId,
        /// Payload to send
        payload: Payload,
        /// Id reused for every re-send of this payload
        message_id: MessageId,
        /// Declared type tag of the expected reply
        receive_type: String,
        /// Suspension site
        site: SuspensionSite,
    },
    /// Wait until a transaction is committed to the local ledger
    WaitForLedgerCommit {
        /// Hash of the awaited transaction
        hash: SecureHash,
        /// Flow doing the waiting
        flow_id: FlowId,
        /// Suspension site
        site: SuspensionSite,
    },
}

impl FlowIORequest {
    /// Short name for logging and events
    pub fn kind(&self) -> &'static str {
        match self {
            FlowIORequest::SendOnly { .. } => "send",
            FlowIORequest::ReceiveOnly { .. } => "receive",
            FlowIORequest::SendAndReceive { .. } => "send_and_receive",
            FlowIORequest::WaitForLedgerCommit { .. } => "wait_for_ledger_commit",
        }
    }

    /// Session this request concerns, if any
    pub fn session(&self) -> Option<&SessionId> {
        match self {
            FlowIORequest::SendOnly { session, .. }
            | FlowIORequest::ReceiveOnly { session, .. }
            | FlowIORequest::SendAndReceive { session, .. } => Some(session),
            FlowIORequest::WaitForLedgerCommit { .. } => None,
        }
    }

    /// Type tag the flow expects to receive, if any
    pub fn receive_type(&self) -> Option<&str> {
        match self {
            FlowIORequest::ReceiveOnly { receive_type, .. }
            | FlowIORequest::SendAndReceive { receive_type, .. } => Some(receive_type),
            _ => None,
        }
    }

    /// Outbound payload and its message id, if any
    pub fn outbound(&self) -> Option<(&SessionId, &Payload, &MessageId)> {
        match self {
            FlowIORequest::SendOnly {
                session,
                payload,
                message_id,
                ..
            }
            | FlowIORequest::SendAndReceive {
                session,
                payload,
                message_id,
                ..
            } => Some((session, payload, message_id)),
            _ => None,
        }
    }

    /// Suspension site
    pub fn site(&self) -> &SuspensionSite {
        match self {
            FlowIORequest::SendOnly { site, .. }
            | FlowIORequest::ReceiveOnly { site, .. }
            | FlowIORequest::SendAndReceive { site, .. }
            | FlowIORequest::WaitForLedgerCommit { site, .. } => site,
        }
    }
}
