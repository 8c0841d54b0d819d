use crate::{
    application::flow::{erase, ErasedFlow, Flow, FlowContext, FlowEvent, FlowStep},
    application::registry::FlowRegistry,
    application::service_hub::ServiceHub,
    config::StateMachineConfig,
    domain::checkpoint::Checkpoint,
    domain::events::{DomainEvent, MessageDeduplicated, SessionClosed, SessionTimedOut},
    domain::flow_instance::{FlowId, FlowInstance, FlowStatus, PendingRequest},
    domain::identity::{Party, PartyKey, SecureHash},
    domain::io_request::FlowIORequest,
    domain::messaging::{MessageId, MessagingService, NetworkMessage, SessionMessage},
    domain::repository::CheckpointRepository,
    domain::session::{FlowSession, SessionEnd, SessionId, SessionState},
    error::FlowError,
    types::Payload,
    CoreError,
};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use futures::future::join_all;
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Serialized result of a finished flow
pub type FlowOutcome = Result<serde_json::Value, FlowError>;

/// Event handler interface
#[async_trait]
pub trait DomainEventHandler: Send + Sync {
    /// Handle a domain event
    async fn handle_event(&self, event: Box<dyn DomainEvent>) -> Result<(), CoreError>;
}

/// Event handler that only traces events
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventHandler;

#[async_trait]
impl DomainEventHandler for TracingEventHandler {
    async fn handle_event(&self, event: Box<dyn DomainEvent>) -> Result<(), CoreError> {
        trace!(
            flow_id = %event.flow_id(),
            event_type = event.event_type(),
            "Domain event"
        );
        Ok(())
    }
}

/// Result of a ledger commit a flow may be waiting for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    /// The transaction is on the ledger
    Committed,
    /// The transaction will never be committed
    Rejected(String),
}

/// Status change of a flow, published on [`StateMachineManager::changes`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowUpdate {
    /// The flow
    pub flow_id: FlowId,
    /// Registered flow name
    pub flow_name: String,
    /// New status
    pub status: FlowStatus,
}

/// Outcome of restoring checkpoints on start
#[derive(Debug, Default)]
pub struct RestoreReport {
    /// Flows that were restored and re-armed
    pub restored: Vec<FlowId>,
    /// Flows whose checkpoint could not be restored
    pub failed: Vec<(FlowId, CoreError)>,
}

/// Handle to the result of a flow
#[derive(Debug)]
pub struct FlowHandle<O> {
    flow_id: FlowId,
    receiver: oneshot::Receiver<FlowOutcome>,
    _output: PhantomData<fn() -> O>,
}

impl<O: DeserializeOwned> FlowHandle<O> {
    fn new(flow_id: FlowId, receiver: oneshot::Receiver<FlowOutcome>) -> Self {
        Self {
            flow_id,
            receiver,
            _output: PhantomData,
        }
    }

    /// Id of the flow
    pub fn flow_id(&self) -> &FlowId {
        &self.flow_id
    }

    /// Wait for the flow to finish
    pub async fn result(self) -> Result<O, FlowError> {
        let value = self.receiver.await.map_err(|_| {
            FlowError::Engine(format!("Flow {} was dropped before finishing", self.flow_id))
        })??;
        Ok(serde_json::from_value(value)?)
    }
}

struct LiveFlow {
    instance: FlowInstance,
    logic: Box<dyn ErasedFlow>,
}

type SessionKey = (PartyKey, SessionId);

struct Inner {
    hub: ServiceHub,
    checkpoints: Arc<dyn CheckpointRepository>,
    messaging: Arc<dyn MessagingService>,
    registry: FlowRegistry,
    config: StateMachineConfig,
    event_handler: Arc<dyn DomainEventHandler>,
    flows: DashMap<FlowId, Arc<Mutex<LiveFlow>>>,
    sessions: DashMap<SessionKey, FlowId>,
    waiters: DashMap<FlowId, Vec<oneshot::Sender<FlowOutcome>>>,
    outcomes: DashMap<FlowId, FlowOutcome>,
    changes: broadcast::Sender<FlowUpdate>,
    started: AtomicBool,
    sweeper: std::sync::Mutex<Option<JoinHandle<()>>>,
}

/// Owns the live flows of a node: runs them, routes inbound session
/// messages to them, and persists and restores their checkpoints.
///
/// Each flow sits behind its own async mutex, so a flow only ever runs one
/// step at a time while independent flows proceed in parallel.
#[derive(Clone)]
pub struct StateMachineManager {
    inner: Arc<Inner>,
}

impl StateMachineManager {
    /// Create a new state machine manager
    pub fn new(
        hub: ServiceHub,
        checkpoints: Arc<dyn CheckpointRepository>,
        messaging: Arc<dyn MessagingService>,
        registry: FlowRegistry,
        config: StateMachineConfig,
        event_handler: Arc<dyn DomainEventHandler>,
    ) -> Result<Self, CoreError> {
        config.validate()?;
        let (changes, _) = broadcast::channel(config.changes_capacity);
        Ok(Self {
            inner: Arc::new(Inner {
                hub,
                checkpoints,
                messaging,
                registry,
                config,
                event_handler,
                flows: DashMap::new(),
                sessions: DashMap::new(),
                waiters: DashMap::new(),
                outcomes: DashMap::new(),
                changes,
                started: AtomicBool::new(false),
                sweeper: std::sync::Mutex::new(None),
            }),
        })
    }

    /// This node's identity
    pub fn our_identity(&self) -> &Party {
        self.inner.hub.my_identity()
    }

    /// Node services
    pub fn services(&self) -> &ServiceHub {
        &self.inner.hub
    }

    /// Whether the manager accepts flows and inbound traffic
    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst)
    }

    /// Ids of flows that have not finished
    pub fn live_flows(&self) -> Vec<FlowId> {
        let mut ids: Vec<FlowId> = self.inner.flows.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Subscribe to flow status updates
    pub fn changes(&self) -> broadcast::Receiver<FlowUpdate> {
        self.inner.changes.subscribe()
    }

    /// Restore every checkpoint, re-arm what each flow was waiting for, then
    /// start accepting flows and inbound messages.
    ///
    /// A checkpoint that cannot be restored is reported and skipped.
    pub async fn start(&self) -> Result<RestoreReport, CoreError> {
        if self.is_started() {
            return Ok(RestoreReport::default());
        }

        let mut report = RestoreReport::default();
        let mut restored = Vec::new();
        for (flow_id, bytes) in self.inner.checkpoints.load_all().await? {
            match self.restore_flow(&bytes) {
                Ok(live) => {
                    if live.instance.id != flow_id {
                        let err = CoreError::CheckpointError(format!(
                            "Checkpoint stored under {} belongs to flow {}",
                            flow_id, live.instance.id
                        ));
                        error!(flow_id = %flow_id, error = %err, "Failed to restore flow");
                        report.failed.push((flow_id, err));
                        continue;
                    }
                    self.index_sessions(&live.instance);
                    let live = Arc::new(Mutex::new(live));
                    self.inner.flows.insert(flow_id.clone(), live.clone());
                    restored.push((flow_id, live));
                }
                Err(err) => {
                    error!(flow_id = %flow_id, error = %err, "Failed to restore flow");
                    report.failed.push((flow_id, err));
                }
            }
        }

        let rearmed = restored.into_iter().map(|(flow_id, live)| async move {
            let mut guard = live.lock().await;
            if let Some(pending) = guard.instance.pending.as_mut() {
                // Sends may or may not have left before the restart
                pending.dispatched = false;
            }
            match self.arm(&mut guard).await {
                Ok(Some(event)) => self.drive(&mut guard, event).await,
                Ok(None) => {}
                Err(err) => {
                    error!(flow_id = %flow_id, error = %err, "Failed to re-arm restored flow");
                    self.fail_flow(&mut guard, FlowError::from(err)).await;
                }
            }
            flow_id
        });
        report.restored = join_all(rearmed).await;

        self.inner.started.store(true, Ordering::SeqCst);
        self.spawn_sweeper();
        info!(
            party = %self.our_identity(),
            restored = report.restored.len(),
            failed = report.failed.len(),
            "State machine manager started"
        );
        Ok(report)
    }

    /// Stop accepting traffic and stop the timeout sweep
    pub fn stop(&self) {
        self.inner.started.store(false, Ordering::SeqCst);
        if let Ok(mut sweeper) = self.inner.sweeper.lock() {
            if let Some(handle) = sweeper.take() {
                handle.abort();
            }
        }
        info!(party = %self.our_identity(), "State machine manager stopped");
    }

    /// Start a new flow
    pub async fn start_flow<F: Flow>(&self, flow: F) -> Result<FlowHandle<F::Output>, CoreError> {
        if !self.is_started() {
            return Err(CoreError::NotStarted);
        }
        if !self.inner.registry.is_registered(F::NAME) {
            return Err(CoreError::FlowNotRegistered(F::NAME.to_string()));
        }

        let mut instance = FlowInstance::new(F::NAME);
        instance.start()?;
        let flow_id = instance.id.clone();

        let (sender, receiver) = oneshot::channel();
        self.inner.waiters.insert(flow_id.clone(), vec![sender]);

        let live = Arc::new(Mutex::new(LiveFlow {
            instance,
            logic: erase(flow),
        }));
        self.inner.flows.insert(flow_id.clone(), live.clone());
        info!(flow_id = %flow_id, flow_name = F::NAME, "Starting flow");

        let manager = self.clone();
        tokio::spawn(async move {
            let mut guard = live.lock().await;
            manager.publish(&mut guard.instance).await;
            manager.drive(&mut guard, FlowEvent::Start).await;
        });

        Ok(FlowHandle::new(flow_id, receiver))
    }

    /// Wait for the result of a flow started earlier, possibly before a restart
    pub fn track<O: DeserializeOwned>(&self, flow_id: &FlowId) -> Result<FlowHandle<O>, CoreError> {
        let (sender, receiver) = oneshot::channel();
        if let Some(outcome) = self.inner.outcomes.get(flow_id) {
            let _ = sender.send(outcome.value().clone());
            return Ok(FlowHandle::new(flow_id.clone(), receiver));
        }
        if !self.inner.flows.contains_key(flow_id) {
            return Err(CoreError::FlowNotFound(flow_id.to_string()));
        }
        self.inner
            .waiters
            .entry(flow_id.clone())
            .or_default()
            .push(sender);

        // The flow may have finished between the checks above
        let finished = self.inner.outcomes.get(flow_id).map(|o| o.value().clone());
        if let Some(outcome) = finished {
            if let Some((_, waiters)) = self.inner.waiters.remove(flow_id) {
                for waiter in waiters {
                    let _ = waiter.send(outcome.clone());
                }
            }
        }
        Ok(FlowHandle::new(flow_id.clone(), receiver))
    }

    /// Accept an inbound message from the transport.
    ///
    /// Returns only after the effect of the message is checkpointed; an error
    /// means the message was not acknowledged and should be redelivered.
    pub async fn deliver(&self, message: NetworkMessage) -> Result<(), CoreError> {
        if !self.is_started() {
            return Err(CoreError::NotStarted);
        }

        let NetworkMessage {
            message_id,
            sender,
            recipient,
            body,
        } = message;

        if recipient.owning_key != self.our_identity().owning_key {
            warn!(
                message_id = %message_id,
                recipient = %recipient,
                "Dropping message addressed to another party"
            );
            return Ok(());
        }

        trace!(
            message_id = %message_id,
            party = %sender,
            session_id = %body.session_id(),
            kind = body.kind(),
            "Inbound session message"
        );

        match body {
            SessionMessage::Init {
                session_id,
                initiator_flow_id,
                flow_name,
                payload,
            } => {
                self.on_session_init(
                    message_id,
                    sender,
                    session_id,
                    initiator_flow_id,
                    flow_name,
                    payload,
                )
                .await
            }
            other => self.on_session_message(message_id, sender, other).await,
        }
    }

    /// Resume flows waiting for the commit of `hash`
    pub async fn notify_commit(
        &self,
        hash: SecureHash,
        outcome: CommitOutcome,
    ) -> Result<(), CoreError> {
        for live in self.snapshot_flows() {
            let mut guard = live.lock().await;
            let waiting = matches!(
                &guard.instance.pending,
                Some(PendingRequest {
                    request: FlowIORequest::WaitForLedgerCommit { hash: awaited, .. },
                    ..
                }) if *awaited == hash
            );
            if !waiting {
                continue;
            }

            debug!(flow_id = %guard.instance.id, hash = %hash, "Ledger commit notification");
            guard.instance.resume()?;
            let event = match &outcome {
                CommitOutcome::Committed => FlowEvent::Committed { hash },
                CommitOutcome::Rejected(reason) => {
                    warn!(flow_id = %guard.instance.id, hash = %hash, reason = %reason, "Awaited transaction rejected");
                    FlowEvent::Failed(FlowError::TransactionNotCommitted {
                        hash: hash.to_string(),
                    })
                }
            };
            self.drive(&mut guard, event).await;
        }
        Ok(())
    }

    /// Fail receives that waited past their deadline and retry sends that did
    /// not reach the transport. Returns the number of timed-out flows.
    pub async fn expire_overdue(&self) -> Result<usize, CoreError> {
        let mut expired = 0;
        for live in self.snapshot_flows() {
            let mut guard = live.lock().await;
            let Some(pending) = guard.instance.pending.clone() else {
                continue;
            };

            if !pending.dispatched && pending.request.outbound().is_some() {
                match self.arm(&mut guard).await {
                    Ok(Some(event)) => {
                        self.drive(&mut guard, event).await;
                        continue;
                    }
                    Ok(None) => {}
                    Err(err) => {
                        error!(flow_id = %guard.instance.id, error = %err, "Failed to retry pending send");
                        continue;
                    }
                }
            }

            let Some(deadline) = pending.deadline else {
                continue;
            };
            if deadline > Utc::now() {
                continue;
            }

            let Some(session_id) = pending.request.session().cloned() else {
                continue;
            };
            let party = guard
                .instance
                .session(&session_id)
                .map(|s| s.counterparty.name.clone())
                .unwrap_or_default();
            warn!(
                flow_id = %guard.instance.id,
                session_id = %session_id,
                party = %party,
                site = %pending.request.site(),
                "Session timed out"
            );

            let flow_id = guard.instance.id.clone();
            guard.instance.record_event(Box::new(SessionTimedOut {
                flow_id,
                session_id: session_id.clone(),
                timestamp: Utc::now(),
            }));
            if let Err(err) = guard.instance.resume() {
                error!(flow_id = %guard.instance.id, error = %err, "Cannot resume timed out flow");
                continue;
            }
            let error = FlowError::SessionTimeout {
                session: session_id.to_string(),
                party,
                timeout_ms: self.inner.config.session_timeout_ms,
            };
            self.drive(&mut guard, FlowEvent::Failed(error)).await;
            expired += 1;
        }
        Ok(expired)
    }

    fn snapshot_flows(&self) -> Vec<Arc<Mutex<LiveFlow>>> {
        self.inner
            .flows
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    fn spawn_sweeper(&self) {
        let inner: Weak<Inner> = Arc::downgrade(&self.inner);
        let interval = self.inner.config.timeout_sweep_interval();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                let manager = StateMachineManager { inner };
                if let Err(err) = manager.expire_overdue().await {
                    warn!(error = %err, "Timeout sweep failed");
                }
            }
        });

        if let Ok(mut sweeper) = self.inner.sweeper.lock() {
            if let Some(previous) = sweeper.replace(handle) {
                previous.abort();
            }
        }
    }

    fn restore_flow(&self, bytes: &[u8]) -> Result<LiveFlow, CoreError> {
        let checkpoint = Checkpoint::decode(bytes)?;
        let logic = self
            .inner
            .registry
            .restore(&checkpoint.instance.flow_name, checkpoint.continuation)?;
        let instance = checkpoint.instance;
        if instance.status != FlowStatus::Suspended || instance.pending.is_none() {
            return Err(CoreError::CheckpointError(format!(
                "Checkpoint of flow {} is not at a suspension point",
                instance.id
            )));
        }
        debug!(flow_id = %instance.id, flow_name = %instance.flow_name, "Restored flow from checkpoint");
        Ok(LiveFlow { instance, logic })
    }

    async fn on_session_init(
        &self,
        message_id: MessageId,
        sender: Party,
        session_id: SessionId,
        initiator_flow_id: FlowId,
        flow_name: String,
        payload: Option<Payload>,
    ) -> Result<(), CoreError> {
        let key = (sender.owning_key, session_id.clone());
        if self.inner.sessions.contains_key(&key)
            || self
                .inner
                .checkpoints
                .initiation_seen(&sender.owning_key, &session_id)
                .await?
        {
            debug!(
                session_id = %session_id,
                party = %sender,
                message_id = %message_id,
                "Duplicate session initiation ignored"
            );
            return Ok(());
        }

        let Some(logic) = self
            .inner
            .registry
            .responder(&flow_name, sender.clone(), session_id.clone())
        else {
            warn!(
                session_id = %session_id,
                party = %sender,
                flow_name = %flow_name,
                "No responder registered, rejecting session"
            );
            return self
                .send_session_message(
                    &sender,
                    SessionMessage::Reject {
                        session_id,
                        reason: format!("Don't know {}", flow_name),
                    },
                )
                .await;
        };

        let mut instance = FlowInstance::new(logic.name());
        let mut session = FlowSession::initiated(session_id.clone(), sender.clone(), initiator_flow_id);
        if let Some(payload) = payload {
            session.inbox.push_back(payload);
        }
        instance.open_session(session);
        instance.mark_processed(&message_id);
        instance.start()?;
        let flow_id = instance.id.clone();
        info!(
            flow_id = %flow_id,
            flow_name = logic.name(),
            session_id = %session_id,
            party = %sender,
            "Starting responder flow"
        );

        self.inner.sessions.insert(key, flow_id.clone());
        let live = Arc::new(Mutex::new(LiveFlow { instance, logic }));
        self.inner.flows.insert(flow_id.clone(), live.clone());

        let mut guard = live.lock().await;
        if let Err(err) = self
            .send_session_message(
                &sender,
                SessionMessage::Confirm {
                    session_id: session_id.clone(),
                    initiated_flow_id: flow_id,
                },
            )
            .await
        {
            // The first data message confirms the session implicitly
            warn!(session_id = %session_id, party = %sender, error = %err, "Failed to confirm session");
        }
        self.publish(&mut guard.instance).await;
        self.drive(&mut guard, FlowEvent::Start).await;
        drop(guard);

        self.inner
            .checkpoints
            .record_initiation(&sender.owning_key, &session_id)
            .await
    }

    async fn on_session_message(
        &self,
        message_id: MessageId,
        sender: Party,
        body: SessionMessage,
    ) -> Result<(), CoreError> {
        let session_id = body.session_id().clone();
        let key = (sender.owning_key, session_id.clone());

        let flow_id = match self.inner.sessions.get(&key) {
            Some(entry) => entry.value().clone(),
            None => {
                warn!(
                    session_id = %session_id,
                    party = %sender,
                    kind = body.kind(),
                    "Message for unknown session dropped"
                );
                return Ok(());
            }
        };
        let live = match self.inner.flows.get(&flow_id) {
            Some(entry) => entry.value().clone(),
            None => {
                debug!(flow_id = %flow_id, session_id = %session_id, "Message for finished flow dropped");
                return Ok(());
            }
        };

        let mut guard = live.lock().await;
        if guard.instance.is_terminal() {
            return Ok(());
        }
        if guard.instance.is_processed(&message_id) {
            debug!(
                flow_id = %flow_id,
                message_id = %message_id,
                "Duplicate message ignored"
            );
            guard.instance.record_event(Box::new(MessageDeduplicated {
                flow_id,
                message_id: message_id.to_string(),
                timestamp: Utc::now(),
            }));
            self.publish(&mut guard.instance).await;
            return Ok(());
        }

        let max_buffered = self.inner.config.max_buffered_messages;
        let Some(session) = guard.instance.session_mut(&session_id) else {
            warn!(flow_id = %flow_id, session_id = %session_id, "Session missing from flow");
            return Ok(());
        };

        let mut closed = false;
        match body {
            SessionMessage::Confirm {
                initiated_flow_id, ..
            } => session.confirm(initiated_flow_id),
            SessionMessage::Reject { reason, .. } => {
                warn!(flow_id = %flow_id, session_id = %session_id, reason = %reason, "Session rejected");
                session.close_remotely(SessionEnd::Rejected { reason });
                closed = true;
            }
            SessionMessage::Data { payload, .. } => {
                if session.inbox.len() >= max_buffered {
                    return Err(CoreError::MessagingError(format!(
                        "Inbox of session {} is full",
                        session_id
                    )));
                }
                if session.state == SessionState::Initiating {
                    session.state = SessionState::Initiated;
                }
                session.inbox.push_back(payload);
            }
            SessionMessage::End { end, .. } => {
                session.close_remotely(end);
                closed = true;
            }
            SessionMessage::Init { .. } => {
                warn!(flow_id = %flow_id, session_id = %session_id, "Unexpected session initiation");
                return Ok(());
            }
        }

        guard.instance.mark_processed(&message_id);
        if closed {
            guard.instance.record_event(Box::new(SessionClosed {
                flow_id: flow_id.clone(),
                session_id: session_id.clone(),
                timestamp: Utc::now(),
            }));
        }

        let waiting_here = guard.instance.pending.as_ref().is_some_and(|pending| {
            pending.request.session() == Some(&session_id)
                && pending.request.receive_type().is_some()
        });
        if waiting_here {
            if let Some(event) = self.take_inbound(&mut guard.instance) {
                guard.instance.resume()?;
                self.drive(&mut guard, event).await;
                return Ok(());
            }
        }

        self.checkpoint(&guard).await?;
        self.publish(&mut guard.instance).await;
        Ok(())
    }

    /// Run a flow from `event` until it parks or finishes; failures of the
    /// engine itself fail the flow
    async fn drive(&self, live: &mut LiveFlow, event: FlowEvent) {
        if let Err(err) = self.run(live, event).await {
            error!(flow_id = %live.instance.id, error = %err, "Flow engine error");
            if !live.instance.is_terminal() {
                self.fail_flow(live, FlowError::from(err)).await;
            }
        }
    }

    async fn run(&self, live: &mut LiveFlow, event: FlowEvent) -> Result<(), CoreError> {
        let mut event = event;
        loop {
            trace!(flow_id = %live.instance.id, event = event.kind(), "Running flow step");
            let (result, recorded) = {
                let mut ctx = FlowContext::new(&mut live.instance, &self.inner.hub);
                let result = live.logic.step(&mut ctx, event).await;
                (result, ctx.take_recorded())
            };

            for hash in recorded {
                self.spawn_commit_notification(hash);
            }

            match result {
                Err(error) => {
                    self.fail_flow(live, error).await;
                    return Ok(());
                }
                Ok(FlowStep::Complete(output)) => {
                    self.complete_flow(live, output).await?;
                    return Ok(());
                }
                Ok(FlowStep::Suspend(request)) => match self.suspend(live, request).await? {
                    Some(next) => event = next,
                    None => return Ok(()),
                },
            }
        }
    }

    /// Park the flow on `request`, checkpoint, then try to satisfy it
    async fn suspend(
        &self,
        live: &mut LiveFlow,
        request: FlowIORequest,
    ) -> Result<Option<FlowEvent>, CoreError> {
        if let Some(session_id) = request.session() {
            if live.instance.session(session_id).is_none() {
                return Ok(Some(FlowEvent::Failed(FlowError::Logic(format!(
                    "Unknown session {}",
                    session_id
                )))));
            }
        }

        let timeout = chrono::Duration::milliseconds(self.inner.config.session_timeout_ms as i64);
        let deadline = request.receive_type().map(|_| Utc::now() + timeout);
        debug!(
            flow_id = %live.instance.id,
            request = request.kind(),
            site = %request.site(),
            "Flow suspended"
        );

        self.index_sessions(&live.instance);
        live.instance.suspend(request, deadline)?;
        self.checkpoint(live).await?;
        self.publish(&mut live.instance).await;
        self.arm(live).await
    }

    /// Act on the pending request: dispatch its send if not yet done and
    /// return the event to resume with if it can be satisfied now
    async fn arm(&self, live: &mut LiveFlow) -> Result<Option<FlowEvent>, CoreError> {
        let Some(pending) = live.instance.pending.clone() else {
            return Ok(None);
        };
        let request = pending.request;

        if !pending.dispatched {
            if let Some((session_id, payload, message_id)) = request.outbound() {
                let closed = live
                    .instance
                    .session(session_id)
                    .and_then(|session| session.end_error());
                if let Some(error) = closed {
                    live.instance.resume()?;
                    return Ok(Some(FlowEvent::Failed(error)));
                }

                match self
                    .dispatch(&mut live.instance, session_id, payload, message_id)
                    .await
                {
                    Ok(()) => {
                        if let Some(pending) = live.instance.pending.as_mut() {
                            pending.dispatched = true;
                        }
                    }
                    Err(err) => {
                        warn!(
                            flow_id = %live.instance.id,
                            session_id = %session_id,
                            error = %err,
                            "Send failed, will retry"
                        );
                        return Ok(None);
                    }
                }
            }
        }

        let event = match &request {
            FlowIORequest::SendOnly { session, .. } => Some(FlowEvent::Sent {
                session: session.clone(),
            }),
            FlowIORequest::ReceiveOnly { .. } | FlowIORequest::SendAndReceive { .. } => {
                self.take_inbound(&mut live.instance)
            }
            FlowIORequest::WaitForLedgerCommit { hash, .. } => {
                if self.inner.hub.transactions().get(hash).await?.is_some() {
                    Some(FlowEvent::Committed { hash: *hash })
                } else {
                    None
                }
            }
        };

        if event.is_some() {
            live.instance.resume()?;
        }
        Ok(event)
    }

    /// Pop the next payload for the pending receive, if any
    fn take_inbound(&self, instance: &mut FlowInstance) -> Option<FlowEvent> {
        let pending = instance.pending.as_ref()?;
        let session_id = pending.request.session()?.clone();
        let expected = pending.request.receive_type()?.to_string();
        let site = pending.request.site().to_string();
        let flow_id = instance.id.clone();

        let session = instance.session_mut(&session_id)?;
        if let Some(payload) = session.inbox.pop_front() {
            if payload.type_tag != expected {
                warn!(
                    flow_id = %flow_id,
                    session_id = %session_id,
                    expected = %expected,
                    actual = %payload.type_tag,
                    site = %site,
                    "Unexpected message type"
                );
                return Some(FlowEvent::Failed(FlowError::UnexpectedMessageType {
                    session: session_id.to_string(),
                    expected,
                    actual: payload.type_tag,
                    site,
                }));
            }
            return Some(FlowEvent::Received {
                session: session_id,
                payload,
            });
        }

        session.end_error().map(FlowEvent::Failed)
    }

    async fn dispatch(
        &self,
        instance: &mut FlowInstance,
        session_id: &SessionId,
        payload: &Payload,
        message_id: &MessageId,
    ) -> Result<(), CoreError> {
        let flow_id = instance.id.clone();
        let flow_name = instance.flow_name.clone();
        let session = instance
            .session_mut(session_id)
            .ok_or_else(|| CoreError::SessionNotFound(session_id.to_string()))?;

        let init = session.needs_init(message_id);
        let body = if init {
            SessionMessage::Init {
                session_id: session_id.clone(),
                initiator_flow_id: flow_id.clone(),
                flow_name,
                payload: Some(payload.clone()),
            }
        } else {
            SessionMessage::Data {
                session_id: session_id.clone(),
                payload: payload.clone(),
            }
        };

        trace!(
            flow_id = %flow_id,
            session_id = %session_id,
            message_id = %message_id,
            party = %session.counterparty,
            kind = body.kind(),
            "Outbound session message"
        );
        self.inner
            .messaging
            .send(NetworkMessage {
                message_id: message_id.clone(),
                sender: self.our_identity().clone(),
                recipient: session.counterparty.clone(),
                body,
            })
            .await?;

        if init && session.state == SessionState::Uninitiated {
            session.state = SessionState::Initiating;
            session.init_message_id = Some(message_id.clone());
        }
        Ok(())
    }

    async fn send_session_message(
        &self,
        recipient: &Party,
        body: SessionMessage,
    ) -> Result<(), CoreError> {
        self.inner
            .messaging
            .send(NetworkMessage {
                message_id: MessageId::random(),
                sender: self.our_identity().clone(),
                recipient: recipient.clone(),
                body,
            })
            .await
    }

    async fn complete_flow(
        &self,
        live: &mut LiveFlow,
        output: serde_json::Value,
    ) -> Result<(), CoreError> {
        live.instance.complete()?;
        info!(flow_id = %live.instance.id, flow_name = %live.instance.flow_name, "Flow completed");
        self.end_sessions(&mut live.instance, SessionEnd::Completed)
            .await;
        self.finish(live, Ok(output)).await;
        Ok(())
    }

    async fn fail_flow(&self, live: &mut LiveFlow, error: FlowError) {
        if live.instance.is_terminal() {
            return;
        }
        warn!(
            flow_id = %live.instance.id,
            flow_name = %live.instance.flow_name,
            error = %error,
            "Flow failed"
        );
        if let Err(err) = live.instance.fail(error.clone()) {
            error!(flow_id = %live.instance.id, error = %err, "Cannot mark flow as failed");
            return;
        }

        let end = match error.to_counterparty_exception() {
            Some(exception) => SessionEnd::Exception { exception },
            None => SessionEnd::Failed,
        };
        self.end_sessions(&mut live.instance, end).await;
        self.finish(live, Err(error)).await;
    }

    /// Tell every counterparty still listening that this flow is done
    async fn end_sessions(&self, instance: &mut FlowInstance, end: SessionEnd) {
        for session in instance.sessions.iter_mut() {
            if matches!(session.state, SessionState::Uninitiated | SessionState::Closed) {
                continue;
            }
            let result = self
                .send_session_message(
                    &session.counterparty,
                    SessionMessage::End {
                        session_id: session.id.clone(),
                        end: end.clone(),
                    },
                )
                .await;
            if let Err(err) = result {
                warn!(
                    flow_id = %instance.id,
                    session_id = %session.id,
                    error = %err,
                    "Failed to end session"
                );
            }
            session.state = SessionState::Closed;
        }
    }

    async fn finish(&self, live: &mut LiveFlow, outcome: FlowOutcome) {
        let flow_id = live.instance.id.clone();
        if let Err(err) = self.inner.checkpoints.delete(&flow_id).await {
            error!(flow_id = %flow_id, error = %err, "Failed to delete checkpoint");
        }

        for session in &live.instance.sessions {
            self.inner
                .sessions
                .remove(&(session.counterparty.owning_key, session.id.clone()));
        }
        self.inner.outcomes.insert(flow_id.clone(), outcome.clone());
        self.inner.flows.remove(&flow_id);
        if let Some((_, waiters)) = self.inner.waiters.remove(&flow_id) {
            for waiter in waiters {
                let _ = waiter.send(outcome.clone());
            }
        }
        self.publish(&mut live.instance).await;
    }

    async fn checkpoint(&self, live: &LiveFlow) -> Result<(), CoreError> {
        let continuation = live.logic.snapshot()?;
        let bytes = Checkpoint::encode(&live.instance, &continuation)?;
        self.inner
            .checkpoints
            .save(&live.instance.id, bytes)
            .await
            .map_err(|e| CoreError::CheckpointError(format!("Failed to save checkpoint: {}", e)))
    }

    fn index_sessions(&self, instance: &FlowInstance) {
        for session in &instance.sessions {
            self.inner.sessions.insert(
                (session.counterparty.owning_key, session.id.clone()),
                instance.id.clone(),
            );
        }
    }

    fn spawn_commit_notification(&self, hash: SecureHash) {
        let manager = self.clone();
        tokio::spawn(async move {
            if let Err(err) = manager.notify_commit(hash, CommitOutcome::Committed).await {
                warn!(hash = %hash, error = %err, "Failed to notify ledger commit");
            }
        });
    }

    async fn publish(&self, instance: &mut FlowInstance) {
        let events = instance.take_events();
        if events.is_empty() {
            return;
        }
        for event in events {
            if let Err(err) = self.inner.event_handler.handle_event(event).await {
                warn!(flow_id = %instance.id, error = %err, "Event handler failed");
            }
        }
        let _ = self.inner.changes.send(FlowUpdate {
            flow_id: instance.id.clone(),
            flow_name: instance.flow_name.clone(),
            status: instance.status,
        });
    }
}

impl std::fmt::Debug for StateMachineManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateMachineManager")
            .field("party", self.our_identity())
            .field("live_flows", &self.inner.flows.len())
            .field("started", &self.is_started())
            .finish()
    }
}
