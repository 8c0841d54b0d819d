use crate::domain::flow_instance::FlowId;
use crate::domain::session::SessionId;
use chrono::{DateTime, Utc};
use std::fmt::Debug;

/// Domain event trait for all events in the system
pub trait DomainEvent: Debug + Send + Sync {
    /// Returns the type of the event as a string
    fn event_type(&self) -> &'static str;

    /// Returns the flow this event is associated with
    fn flow_id(&self) -> &FlowId;

    /// Returns the timestamp when the event occurred
    fn timestamp(&self) -> DateTime<Utc>;
}

macro_rules! impl_domain_event {
    ($event:ty, $name:expr) => {
        impl DomainEvent for $event {
            fn event_type(&self) -> &'static str {
                $name
            }

            fn flow_id(&self) -> &FlowId {
                &self.flow_id
            }

            fn timestamp(&self) -> DateTime<Utc> {
                self.timestamp
            }
        }
    };
}

/// Event: Flow created
#[derive(Debug)]
pub struct FlowCreated {
    /// The unique identifier of the flow
    pub flow_id: FlowId,

    /// Registered name of the flow logic
    pub flow_name: String,

    /// The timestamp when the flow was created
    pub timestamp: DateTime<Utc>,
}

impl_domain_event!(FlowCreated, "flow.created");

/// Event: Flow suspended on an I/O request
#[derive(Debug)]
pub struct FlowSuspended {
    /// The unique identifier of the flow
    pub flow_id: FlowId,

    /// Kind of request the flow is waiting on
    pub request: &'static str,

    /// Where the flow suspended
    pub site: String,

    /// The timestamp when the flow was suspended
    pub timestamp: DateTime<Utc>,
}

impl_domain_event!(FlowSuspended, "flow.suspended");

/// Event: Flow resumed
#[derive(Debug)]
pub struct FlowResumed {
    /// The unique identifier of the flow
    pub flow_id: FlowId,
    /// The timestamp when the event occurred
    pub timestamp: DateTime<Utc>,
}

impl_domain_event!(FlowResumed, "flow.resumed");

/// Event: Flow completed
#[derive(Debug)]
pub struct FlowCompleted {
    /// The unique identifier of the flow
    pub flow_id: FlowId,
    /// The timestamp when the event occurred
    pub timestamp: DateTime<Utc>,
}

impl_domain_event!(FlowCompleted, "flow.completed");

/// Event: Flow failed
#[derive(Debug)]
pub struct FlowFailed {
    /// The unique identifier of the flow
    pub flow_id: FlowId,
    /// Error description
    pub error: String,
    /// Protocol exception code, if the failure was deliberate
    pub code: Option<String>,
    /// The timestamp when the event occurred
    pub timestamp: DateTime<Utc>,
}

impl_domain_event!(FlowFailed, "flow.failed");

/// Event: Session opened
#[derive(Debug)]
pub struct SessionOpened {
    /// The flow owning the session
    pub flow_id: FlowId,
    /// The session
    pub session_id: SessionId,
    /// Counterparty name
    pub party: String,
    /// The timestamp when the event occurred
    pub timestamp: DateTime<Utc>,
}

impl_domain_event!(SessionOpened, "session.opened");

/// Event: Session closed by the counterparty
#[derive(Debug)]
pub struct SessionClosed {
    /// The flow owning the session
    pub flow_id: FlowId,
    /// The session
    pub session_id: SessionId,
    /// The timestamp when the event occurred
    pub timestamp: DateTime<Utc>,
}

impl_domain_event!(SessionClosed, "session.closed");

/// Event: Session receive timed out
#[derive(Debug)]
pub struct SessionTimedOut {
    /// The flow owning the session
    pub flow_id: FlowId,
    /// The session
    pub session_id: SessionId,
    /// The timestamp when the event occurred
    pub timestamp: DateTime<Utc>,
}

impl_domain_event!(SessionTimedOut, "session.timed_out");

/// Event: Inbound message dropped as a duplicate
#[derive(Debug)]
pub struct MessageDeduplicated {
    /// The flow the message was addressed to
    pub flow_id: FlowId,
    /// The message id
    pub message_id: String,
    /// The timestamp when the event occurred
    pub timestamp: DateTime<Utc>,
}

impl_domain_event!(MessageDeduplicated, "message.deduplicated");
