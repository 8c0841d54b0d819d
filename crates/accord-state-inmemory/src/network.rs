//! Process-local network with one mailbox per party
//!
//! Messages are queued in the recipient's mailbox and handed to its state
//! machine manager by a pump task. A message leaves the mailbox only after
//! `deliver` acknowledged it, so aborting a pump mid-delivery (a simulated
//! crash) leads to redelivery, never to loss.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use accord_core::{
    CoreError, MessagingService, NetworkMessage, Party, PartyKey, StateMachineManager,
};
use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

const DEFAULT_REDELIVERY_DELAY: Duration = Duration::from_millis(20);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Mailbox {
    party: Party,
    queue: Mutex<VecDeque<NetworkMessage>>,
    online: AtomicBool,
    notify: Notify,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl Mailbox {
    fn new(party: Party) -> Self {
        Self {
            party,
            queue: Mutex::new(VecDeque::new()),
            online: AtomicBool::new(true),
            notify: Notify::new(),
            pump: Mutex::new(None),
        }
    }

    fn push(&self, message: NetworkMessage) {
        lock(&self.queue).push_back(message);
        self.notify.notify_one();
    }

    fn front(&self) -> Option<NetworkMessage> {
        if !self.online.load(Ordering::SeqCst) {
            return None;
        }
        lock(&self.queue).front().cloned()
    }

    fn replace_pump(&self, handle: Option<JoinHandle<()>>) {
        let previous = std::mem::replace(&mut *lock(&self.pump), handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }
}

struct NetworkInner {
    mailboxes: DashMap<PartyKey, Arc<Mailbox>>,
    sent: Mutex<Vec<NetworkMessage>>,
    redelivery_delay: Duration,
}

/// In-memory network connecting the nodes of one process
#[derive(Clone)]
pub struct InMemoryNetwork {
    inner: Arc<NetworkInner>,
}

impl Default for InMemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryNetwork {
    /// Create an empty network
    pub fn new() -> Self {
        Self::with_redelivery_delay(DEFAULT_REDELIVERY_DELAY)
    }

    /// Create an empty network retrying unacknowledged deliveries after `delay`
    pub fn with_redelivery_delay(delay: Duration) -> Self {
        Self {
            inner: Arc::new(NetworkInner {
                mailboxes: DashMap::new(),
                sent: Mutex::new(Vec::new()),
                redelivery_delay: delay,
            }),
        }
    }

    /// Join the network, returning the transport for `party`.
    ///
    /// Registering a party again keeps its mailbox and queued messages.
    pub fn register(&self, party: Party) -> InMemoryMessagingService {
        self.inner
            .mailboxes
            .entry(party.owning_key)
            .or_insert_with(|| Arc::new(Mailbox::new(party.clone())));
        InMemoryMessagingService {
            network: self.clone(),
            owner: party,
        }
    }

    /// Start handing queued messages for `party` to `manager`, replacing any
    /// previously attached manager
    pub fn attach(&self, party: &Party, manager: StateMachineManager) -> Result<(), CoreError> {
        let mailbox = self.mailbox(&party.owning_key)?;
        let delay = self.inner.redelivery_delay;
        let handle = tokio::spawn(pump(mailbox.clone(), manager, delay));
        mailbox.replace_pump(Some(handle));
        info!(party = %party, "Attached node to in-memory network");
        Ok(())
    }

    /// Stop delivering to `party`; queued messages are kept
    pub fn detach(&self, party: &Party) -> Result<(), CoreError> {
        self.mailbox(&party.owning_key)?.replace_pump(None);
        info!(party = %party, "Detached node from in-memory network");
        Ok(())
    }

    /// Take a party off the network or bring it back.
    ///
    /// An offline party cannot send, and messages to it wait in its mailbox.
    pub fn set_online(&self, party: &Party, online: bool) -> Result<(), CoreError> {
        let mailbox = self.mailbox(&party.owning_key)?;
        mailbox.online.store(online, Ordering::SeqCst);
        if online {
            mailbox.notify.notify_one();
        }
        info!(party = %party, online, "Changed network availability");
        Ok(())
    }

    /// Whether a party is online
    pub fn is_online(&self, party: &Party) -> bool {
        self.inner
            .mailboxes
            .get(&party.owning_key)
            .map(|mailbox| mailbox.online.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Number of messages waiting for `party`
    pub fn pending(&self, party: &Party) -> usize {
        self.inner
            .mailboxes
            .get(&party.owning_key)
            .map(|mailbox| lock(&mailbox.queue).len())
            .unwrap_or(0)
    }

    /// Every message accepted by the network, in send order
    pub fn sent_messages(&self) -> Vec<NetworkMessage> {
        lock(&self.inner.sent).clone()
    }

    /// Queue a copy of an already sent message again, as an at-least-once
    /// transport may
    pub fn redeliver(&self, message: NetworkMessage) -> Result<(), CoreError> {
        let mailbox = self.mailbox(&message.recipient.owning_key)?;
        debug!(
            message_id = %message.message_id,
            party = %message.recipient,
            "Redelivering message"
        );
        mailbox.push(message);
        Ok(())
    }

    /// Stop every pump
    pub fn shutdown(&self) {
        for entry in self.inner.mailboxes.iter() {
            entry.value().replace_pump(None);
        }
    }

    fn mailbox(&self, key: &PartyKey) -> Result<Arc<Mailbox>, CoreError> {
        self.inner
            .mailboxes
            .get(key)
            .map(|mailbox| mailbox.value().clone())
            .ok_or_else(|| CoreError::MessagingError(format!("Unknown party key {}", key)))
    }

    fn enqueue(&self, message: NetworkMessage) -> Result<(), CoreError> {
        let sender = self.mailbox(&message.sender.owning_key)?;
        if !sender.online.load(Ordering::SeqCst) {
            return Err(CoreError::MessagingError(format!(
                "{} is offline",
                sender.party
            )));
        }
        let recipient = self.mailbox(&message.recipient.owning_key)?;

        trace!(
            message_id = %message.message_id,
            sender = %message.sender,
            recipient = %message.recipient,
            kind = message.body.kind(),
            "Queued message"
        );
        lock(&self.inner.sent).push(message.clone());
        recipient.push(message);
        Ok(())
    }
}

impl std::fmt::Debug for InMemoryNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryNetwork")
            .field("parties", &self.inner.mailboxes.len())
            .field("sent", &lock(&self.inner.sent).len())
            .finish()
    }
}

async fn pump(mailbox: Arc<Mailbox>, manager: StateMachineManager, delay: Duration) {
    loop {
        let Some(message) = mailbox.front() else {
            mailbox.notify.notified().await;
            continue;
        };

        match manager.deliver(message.clone()).await {
            Ok(()) => {
                lock(&mailbox.queue).pop_front();
            }
            Err(err) => {
                warn!(
                    message_id = %message.message_id,
                    party = %mailbox.party,
                    error = %err,
                    "Delivery not acknowledged, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// The network as seen by one party
#[derive(Clone, Debug)]
pub struct InMemoryMessagingService {
    network: InMemoryNetwork,
    owner: Party,
}

impl InMemoryMessagingService {
    /// The party sending through this service
    pub fn owner(&self) -> &Party {
        &self.owner
    }
}

#[async_trait]
impl MessagingService for InMemoryMessagingService {
    async fn send(&self, message: NetworkMessage) -> Result<(), CoreError> {
        if message.sender.owning_key != self.owner.owning_key {
            return Err(CoreError::MessagingError(format!(
                "{} cannot send as {}",
                self.owner, message.sender
            )));
        }
        self.network.enqueue(message)
    }
}
