use crate::{
    domain::events::{
        DomainEvent, FlowCompleted, FlowCreated, FlowFailed, FlowResumed, FlowSuspended,
        SessionOpened,
    },
    domain::io_request::FlowIORequest,
    domain::messaging::MessageId,
    domain::session::{FlowSession, SessionId},
    error::FlowError,
    CoreError,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

/// Flow status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowStatus {
    /// Flow is created but has not run yet
    Created,

    /// Flow logic is currently executing
    Running,

    /// Flow is parked on an I/O request
    Suspended,

    /// Flow has completed successfully
    Completed,

    /// Flow failed
    Failed,
}

/// Value object: Flow ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FlowId(pub String);

impl FlowId {
    /// Generate a fresh flow id
    pub fn random() -> Self {
        FlowId(Uuid::new_v4().to_string())
    }
}

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The request a suspended flow is parked on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingRequest {
    /// The request
    pub request: FlowIORequest,

    /// When the flow suspended
    pub suspended_at: DateTime<Utc>,

    /// When a receive gives up waiting
    pub deadline: Option<DateTime<Utc>>,

    /// Whether the outbound part, if any, reached the transport
    #[serde(default)]
    pub dispatched: bool,
}

/// Aggregate: Flow instance
///
/// Holds everything about a running flow except its logic: sessions,
/// the pending request, and the ids of inbound messages already applied.
#[derive(Debug, Serialize, Deserialize)]
pub struct FlowInstance {
    /// Unique identifier
    pub id: FlowId,

    /// Registered name of the flow logic
    pub flow_name: String,

    /// Current status
    pub status: FlowStatus,

    /// Open sessions in creation order
    pub sessions: Vec<FlowSession>,

    /// Request the flow is suspended on
    pub pending: Option<PendingRequest>,

    /// Inbound message ids already applied to this flow
    pub processed_messages: BTreeSet<MessageId>,

    /// Error if the flow failed
    pub error: Option<FlowError>,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last updated timestamp
    pub updated_at: DateTime<Utc>,

    /// Domain events
    #[serde(skip)]
    pub events: Vec<Box<dyn DomainEvent>>,
}

impl Clone for FlowInstance {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            flow_name: self.flow_name.clone(),
            status: self.status,
            sessions: self.sessions.clone(),
            pending: self.pending.clone(),
            processed_messages: self.processed_messages.clone(),
            error: self.error.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            events: Vec::new(), // domain events are not cloned
        }
    }
}

impl FlowInstance {
    /// Create a new flow instance
    pub fn new(flow_name: impl Into<String>) -> Self {
        let id = FlowId::random();
        let flow_name = flow_name.into();
        let now = Utc::now();

        let mut instance = Self {
            id: id.clone(),
            flow_name: flow_name.clone(),
            status: FlowStatus::Created,
            sessions: Vec::with_capacity(4),
            pending: None,
            processed_messages: BTreeSet::new(),
            error: None,
            created_at: now,
            updated_at: now,
            events: Vec::with_capacity(8),
        };

        instance.record_event(Box::new(FlowCreated {
            flow_id: id,
            flow_name,
            timestamp: now,
        }));

        instance
    }

    /// Start running the flow logic
    #[inline]
    pub fn start(&mut self) -> Result<(), CoreError> {
        if self.status != FlowStatus::Created {
            return Err(CoreError::FlowStateError(format!(
                "Cannot start flow in state: {:?}",
                self.status
            )));
        }

        self.status = FlowStatus::Running;
        self.update_timestamp();
        Ok(())
    }

    /// Update the timestamp
    #[inline]
    pub fn update_timestamp(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Park the flow on an I/O request
    pub fn suspend(
        &mut self,
        request: FlowIORequest,
        deadline: Option<DateTime<Utc>>,
    ) -> Result<(), CoreError> {
        if self.status != FlowStatus::Running {
            return Err(CoreError::FlowStateError(format!(
                "Cannot suspend flow in state: {:?}",
                self.status
            )));
        }

        self.record_event(Box::new(FlowSuspended {
            flow_id: self.id.clone(),
            request: request.kind(),
            site: request.site().to_string(),
            timestamp: Utc::now(),
        }));

        self.pending = Some(PendingRequest {
            request,
            suspended_at: Utc::now(),
            deadline,
            dispatched: false,
        });
        self.status = FlowStatus::Suspended;
        self.update_timestamp();
        Ok(())
    }

    /// Resume a suspended flow, returning the request it was parked on
    pub fn resume(&mut self) -> Result<PendingRequest, CoreError> {
        if self.status != FlowStatus::Suspended {
            return Err(CoreError::FlowStateError(format!(
                "Cannot resume flow in state: {:?}",
                self.status
            )));
        }
        let pending = self.pending.take().ok_or_else(|| {
            CoreError::FlowStateError(format!("Suspended flow {} has no pending request", self.id))
        })?;

        self.status = FlowStatus::Running;
        self.record_event(Box::new(FlowResumed {
            flow_id: self.id.clone(),
            timestamp: Utc::now(),
        }));

        self.update_timestamp();
        Ok(pending)
    }

    /// Complete the flow successfully
    pub fn complete(&mut self) -> Result<(), CoreError> {
        if self.status != FlowStatus::Running {
            return Err(CoreError::FlowStateError(format!(
                "Cannot complete flow in state: {:?}",
                self.status
            )));
        }

        self.status = FlowStatus::Completed;
        self.record_event(Box::new(FlowCompleted {
            flow_id: self.id.clone(),
            timestamp: Utc::now(),
        }));

        self.update_timestamp();
        Ok(())
    }

    /// Set the flow as failed
    pub fn fail(&mut self, error: FlowError) -> Result<(), CoreError> {
        if self.is_terminal() {
            return Err(CoreError::FlowStateError(format!(
                "Cannot fail flow in state: {:?}",
                self.status
            )));
        }

        self.status = FlowStatus::Failed;
        self.pending = None;
        self.record_event(Box::new(FlowFailed {
            flow_id: self.id.clone(),
            error: error.to_string(),
            code: error.exception_code().map(str::to_string),
            timestamp: Utc::now(),
        }));
        self.error = Some(error);

        self.update_timestamp();
        Ok(())
    }

    /// Whether the flow has finished, successfully or not
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self.status, FlowStatus::Completed | FlowStatus::Failed)
    }

    /// Add a session to the flow
    pub fn open_session(&mut self, session: FlowSession) -> SessionId {
        let id = session.id.clone();
        self.record_event(Box::new(SessionOpened {
            flow_id: self.id.clone(),
            session_id: id.clone(),
            party: session.counterparty.name.clone(),
            timestamp: Utc::now(),
        }));
        self.sessions.push(session);
        id
    }

    /// Find a session by id
    pub fn session(&self, id: &SessionId) -> Option<&FlowSession> {
        self.sessions.iter().find(|session| &session.id == id)
    }

    /// Find a session by id for modification
    pub fn session_mut(&mut self, id: &SessionId) -> Option<&mut FlowSession> {
        self.sessions.iter_mut().find(|session| &session.id == id)
    }

    /// Remember an inbound message id, returning `false` if it was seen before
    #[inline]
    pub fn mark_processed(&mut self, message_id: &MessageId) -> bool {
        self.processed_messages.insert(message_id.clone())
    }

    /// Whether an inbound message id was already applied
    #[inline]
    pub fn is_processed(&self, message_id: &MessageId) -> bool {
        self.processed_messages.contains(message_id)
    }

    /// Record a domain event
    pub fn record_event(&mut self, event: Box<dyn DomainEvent>) {
        self.events.push(event);
    }

    /// Get and clear all domain events
    pub fn take_events(&mut self) -> Vec<Box<dyn DomainEvent>> {
        std::mem::take(&mut self.events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::identity::{KeyPair, Party};
    use crate::domain::io_request::SuspensionSite;
    use crate::error::FlowException;

    fn receive_request(session: &SessionId) -> FlowIORequest {
        FlowIORequest::ReceiveOnly {
            session: session.clone(),
            receive_type: "test.ping".to_string(),
            site: SuspensionSite::here("wait"),
        }
    }

    fn running_instance() -> FlowInstance {
        let mut instance = FlowInstance::new("test.flow");
        instance.start().unwrap();
        instance.take_events();
        instance
    }

    fn bob() -> Party {
        Party {
            name: "Bob".to_string(),
            owning_key: KeyPair::from_seed("bob").public_key(),
        }
    }

    #[test]
    fn test_flow_instance_creation() {
        let mut instance = FlowInstance::new("test.flow");

        assert_eq!(instance.flow_name, "test.flow");
        assert_eq!(instance.status, FlowStatus::Created);
        assert!(instance.sessions.is_empty());
        assert!(instance.pending.is_none());
        assert!(!instance.id.0.is_empty());
        assert!(instance.created_at <= Utc::now());

        let events = instance.take_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type(), "flow.created");
        assert!(instance.take_events().is_empty());
    }

    #[test]
    fn test_suspend_and_resume() {
        let mut instance = running_instance();
        let session = instance.open_session(FlowSession::initiating(bob()));

        let request = receive_request(&session);
        instance.suspend(request.clone(), None).unwrap();
        assert_eq!(instance.status, FlowStatus::Suspended);
        assert!(instance.pending.is_some());

        let pending = instance.resume().unwrap();
        assert_eq!(pending.request, request);
        assert_eq!(instance.status, FlowStatus::Running);
        assert!(instance.pending.is_none());

        let types: Vec<&str> = instance
            .take_events()
            .iter()
            .map(|e| e.event_type())
            .collect();
        assert_eq!(types, vec!["session.opened", "flow.suspended", "flow.resumed"]);
    }

    #[test]
    fn test_invalid_transitions() {
        let mut instance = FlowInstance::new("test.flow");
        let session = SessionId("s1".to_string());

        assert!(matches!(
            instance.suspend(receive_request(&session), None),
            Err(CoreError::FlowStateError(_))
        ));
        assert!(instance.resume().is_err());
        assert!(instance.complete().is_err());

        instance.start().unwrap();
        assert!(instance.start().is_err());
        instance.complete().unwrap();
        assert!(instance.fail(FlowError::Logic("late".to_string())).is_err());
    }

    #[test]
    fn test_fail_from_suspended() {
        let mut instance = running_instance();
        let session = SessionId("s1".to_string());
        instance.suspend(receive_request(&session), None).unwrap();

        let error = FlowError::Protocol(FlowException::new("demo.refused", "no"));
        instance.fail(error.clone()).unwrap();

        assert_eq!(instance.status, FlowStatus::Failed);
        assert_eq!(instance.error, Some(error));
        assert!(instance.pending.is_none());
        assert!(instance.is_terminal());
    }

    #[test]
    fn test_message_deduplication() {
        let mut instance = running_instance();
        let id = MessageId("m1".to_string());

        assert!(!instance.is_processed(&id));
        assert!(instance.mark_processed(&id));
        assert!(!instance.mark_processed(&id));
        assert!(instance.is_processed(&id));
    }

    #[test]
    fn test_flow_instance_serialization() {
        let mut instance = running_instance();
        let session = instance.open_session(FlowSession::initiating(bob()));
        instance.suspend(receive_request(&session), Some(Utc::now())).unwrap();
        instance.mark_processed(&MessageId("m1".to_string()));

        let json = serde_json::to_string(&instance).unwrap();
        let restored: FlowInstance = serde_json::from_str(&json).unwrap();

        assert_eq!(restored.id, instance.id);
        assert_eq!(restored.status, FlowStatus::Suspended);
        assert_eq!(restored.sessions, instance.sessions);
        assert_eq!(restored.pending, instance.pending);
        assert_eq!(restored.processed_messages, instance.processed_messages);
        assert!(restored.events.is_empty());
    }
}
