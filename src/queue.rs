use crate::store::MessageStore;
use crate::{Message, MessageId};

/// A FIFO queue of messages, mirrored to a [`MessageStore`].
///
/// The queue reads its store once, when opened, and from then on
/// treats its in-memory list as the source of truth: every mutation
/// rewrites the whole list through [`MessageStore::save`].  Persistence
/// failures never surface as errors from queue operations; they are
/// logged, and counted in [`MessageQueue::persist_failures`].
///
/// Order is insertion order.  Priority is carried on each message but
/// does not reorder the queue.
#[derive(Debug)]
pub struct MessageQueue<S> {
    store: S,
    messages: Vec<Message>,
    persist_failures: u64,
}

impl<S: MessageStore> MessageQueue<S> {
    /// Opens a queue over `store`, loading whatever it holds.
    ///
    /// If the store cannot be read, the queue starts empty.
    #[tracing::instrument(skip_all)]
    pub async fn open(store: S) -> Self {
        let messages = match store.load().await {
            Ok(messages) => messages,
            Err(error) => {
                tracing::error!(%error, "failed to load queue; starting with an empty queue");
                vec![]
            }
        };

        Self {
            store,
            messages,
            persist_failures: 0,
        }
    }

    /// Appends a message to the tail, returning its id.
    ///
    /// If a message with the same id is already queued, the new
    /// message is given a fresh id first.
    pub async fn enqueue(&mut self, mut message: Message) -> MessageId {
        if self.contains(message.id()) {
            let previous = message.id().clone();
            message.reassign_id();
            tracing::warn!(%previous, id = %message.id(), "duplicate message id; assigned a new one");
        }

        let id = message.id().clone();
        tracing::debug!(%id, recipient = %message.recipient, "enqueued message");
        self.messages.push(message);
        self.persist().await;
        id
    }

    /// Removes up to `count` messages from the head, stamping each as
    /// delivered.
    ///
    /// The stamp is applied on retrieval, before anyone has attempted
    /// delivery.  Use [`MessageQueue::take`] to remove messages
    /// without stamping them.
    pub async fn dequeue(&mut self, count: usize) -> Vec<Message> {
        let mut messages = self.take(count).await;
        for message in &mut messages {
            message.mark_delivered();
        }
        messages
    }

    /// Removes up to `count` messages from the head, unchanged.
    ///
    /// Never waits: an empty queue returns an empty list.
    pub async fn take(&mut self, count: usize) -> Vec<Message> {
        let count = count.min(self.messages.len());
        if count == 0 {
            return vec![];
        }

        let taken = self.messages.drain(..count).collect::<Vec<_>>();
        tracing::debug!(count, remaining = self.messages.len(), "dequeued messages");
        self.persist().await;
        taken
    }

    /// Up to `count` messages from the head, without removing them.
    #[must_use]
    pub fn peek(&self, count: usize) -> Vec<&Message> { self.messages.iter().take(count).collect() }

    #[must_use]
    pub fn count(&self) -> usize { self.messages.len() }

    #[must_use]
    pub fn is_empty(&self) -> bool { self.messages.is_empty() }

    #[must_use]
    pub fn iter(&self) -> std::slice::Iter<'_, Message> { self.messages.iter() }

    #[must_use]
    pub fn contains(&self, id: &MessageId) -> bool {
        self.messages.iter().any(|message| message.id() == id)
    }

    /// Every queued message addressed to `recipient`, in queue order.
    #[must_use]
    pub fn get_by_recipient(&self, recipient: &str) -> Vec<&Message> {
        self.messages
            .iter()
            .filter(|message| message.recipient == recipient)
            .collect()
    }

    /// Stamps a queued message as delivered, leaving it in place.
    ///
    /// Returns `false` if no such message is queued, or if it was
    /// already stamped.
    pub async fn mark_delivered(&mut self, id: &MessageId) -> bool {
        let Some(message) = self.messages.iter_mut().find(|message| message.id() == id) else {
            return false;
        };

        if !message.mark_delivered() {
            return false;
        }

        self.persist().await;
        true
    }

    /// Puts a message that was taken from the queue back at the tail.
    pub async fn requeue(&mut self, message: Message) {
        tracing::debug!(id = %message.id(), attempts = message.attempts(), "requeued message");
        self.messages.push(message);
        self.persist().await;
    }

    /// Puts messages back at the head, ahead of everything queued.
    pub(crate) async fn restore(&mut self, messages: Vec<Message>) {
        if messages.is_empty() {
            return;
        }

        let queued = std::mem::replace(&mut self.messages, messages);
        self.messages.extend(queued);
        self.persist().await;
    }

    /// Drops every message that has been stamped as delivered,
    /// returning how many were dropped.
    pub async fn remove_delivered(&mut self) -> usize {
        let before = self.messages.len();
        self.messages.retain(|message| !message.is_delivered());
        let removed = before - self.messages.len();

        if removed > 0 {
            tracing::debug!(removed, "purged delivered messages");
            self.persist().await;
        }

        removed
    }

    pub async fn clear(&mut self) {
        self.messages.clear();
        self.persist().await;
    }

    /// How many saves have failed since the queue was opened.
    #[must_use]
    pub fn persist_failures(&self) -> u64 { self.persist_failures }

    #[must_use]
    pub fn store(&self) -> &S { &self.store }

    async fn persist(&mut self) {
        if let Err(error) = self.store.save(&self.messages).await {
            self.persist_failures += 1;
            tracing::error!(%error, count = self.messages.len(), "failed to persist queue");
        }
    }
}
