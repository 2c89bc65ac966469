//! Per-identity mailboxes.
//!
//! Every registered identity gets two independent bounded queues: one
//! for routed message envelopes, one for membership events. Queues are
//! created at registration and never destroyed; removal from a group
//! does not touch the mailbox. Enqueue rejects when the queue is at
//! capacity rather than dropping older items, so a slow consumer sees
//! an explicit error at the producer instead of silent loss.

use std::{
    collections::HashMap,
    sync::{Mutex, PoisonError},
};

use tokio::sync::mpsc;

use veil_proto::{IdentityId, MessageEnvelope, ServerEvent};

use crate::error::ServiceError;

/// Default bound for each mailbox queue.
pub const DEFAULT_MAILBOX_CAPACITY: usize = 10_000;

/// One bounded queue plus its not-yet-claimed consumer half.
struct Slot<T> {
    tx: mpsc::Sender<T>,
    rx: Option<mpsc::Receiver<T>>,
}

impl<T> Slot<T> {
    fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self { tx, rx: Some(rx) }
    }
}

struct Pair {
    messages: Slot<MessageEnvelope>,
    events: Slot<ServerEvent>,
}

/// All mailboxes, keyed by identity.
pub struct MailboxRegistry {
    capacity: usize,
    inner: Mutex<HashMap<IdentityId, Pair>>,
}

impl MailboxRegistry {
    /// Create an empty registry whose mailboxes hold `capacity` items.
    pub fn new(capacity: usize) -> Self {
        Self { capacity, inner: Mutex::new(HashMap::new()) }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<IdentityId, Pair>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create the mailbox pair for an identity if it does not exist.
    /// Re-registration keeps the existing queues and their contents.
    pub fn ensure(&self, id: &IdentityId) {
        let mut inner = self.lock();
        if !inner.contains_key(id) {
            inner.insert(
                id.clone(),
                Pair {
                    messages: Slot::new(self.capacity),
                    events: Slot::new(self.capacity),
                },
            );
        }
    }

    /// Enqueue a message envelope.
    ///
    /// # Errors
    ///
    /// [`ServiceError::NotFound`] if the identity has no mailbox, and
    /// [`ServiceError::MailboxFull`] when the queue is at capacity. The
    /// rejected item is dropped; queued items are untouched.
    pub fn push_message(
        &self,
        id: &IdentityId,
        envelope: MessageEnvelope,
    ) -> Result<(), ServiceError> {
        let inner = self.lock();
        let pair = inner.get(id).ok_or_else(|| ServiceError::not_found("mailbox", id))?;
        send_bounded(&pair.messages.tx, envelope, id)
    }

    /// Enqueue a membership event.
    ///
    /// # Errors
    ///
    /// Same conditions as [`MailboxRegistry::push_message`].
    pub fn push_event(&self, id: &IdentityId, event: ServerEvent) -> Result<(), ServiceError> {
        let inner = self.lock();
        let pair = inner.get(id).ok_or_else(|| ServiceError::not_found("mailbox", id))?;
        send_bounded(&pair.events.tx, event, id)
    }

    /// Claim the consumer half of an identity's message queue.
    ///
    /// # Errors
    ///
    /// [`ServiceError::NotFound`] if the identity has no mailbox, and
    /// [`ServiceError::Protocol`] if the stream was already claimed.
    pub fn take_messages(
        &self,
        id: &IdentityId,
    ) -> Result<mpsc::Receiver<MessageEnvelope>, ServiceError> {
        let mut inner = self.lock();
        let pair = inner.get_mut(id).ok_or_else(|| ServiceError::not_found("mailbox", id))?;
        pair.messages
            .rx
            .take()
            .ok_or_else(|| ServiceError::Protocol(format!("message stream already taken: {id}")))
    }

    /// Claim the consumer half of an identity's event queue.
    ///
    /// # Errors
    ///
    /// Same conditions as [`MailboxRegistry::take_messages`].
    pub fn take_events(
        &self,
        id: &IdentityId,
    ) -> Result<mpsc::Receiver<ServerEvent>, ServiceError> {
        let mut inner = self.lock();
        let pair = inner.get_mut(id).ok_or_else(|| ServiceError::not_found("mailbox", id))?;
        pair.events
            .rx
            .take()
            .ok_or_else(|| ServiceError::Protocol(format!("event stream already taken: {id}")))
    }
}

fn send_bounded<T>(tx: &mpsc::Sender<T>, item: T, id: &IdentityId) -> Result<(), ServiceError> {
    match tx.try_send(item) {
        Ok(()) => Ok(()),
        Err(mpsc::error::TrySendError::Full(_)) => {
            Err(ServiceError::MailboxFull { id: id.clone() })
        },
        Err(mpsc::error::TrySendError::Closed(_)) => {
            Err(ServiceError::Protocol(format!("mailbox consumer dropped: {id}")))
        },
    }
}
