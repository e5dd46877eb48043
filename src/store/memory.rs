use super::MessageStore;
use crate::Message;
use std::sync::{Arc, Mutex, PoisonError};

/// An in-process store.
///
/// Clones share the same list, so a test can keep a handle to the
/// store and inspect what a queue persisted.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    messages: Arc<Mutex<Vec<Message>>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Creates a store that already holds `messages`.
    #[must_use]
    pub fn with_messages(messages: Vec<Message>) -> Self {
        Self {
            messages: Arc::new(Mutex::new(messages)),
        }
    }

    /// A copy of the current contents.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Message> {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait::async_trait]
impl MessageStore for MemoryStore {
    type Error = std::convert::Infallible;

    async fn load(&self) -> Result<Vec<Message>, Self::Error> { Ok(self.snapshot()) }

    async fn save(&self, messages: &[Message]) -> Result<(), Self::Error> {
        let mut guard = self.messages.lock().unwrap_or_else(PoisonError::into_inner);
        guard.clear();
        guard.extend_from_slice(messages);
        Ok(())
    }

    async fn append(&self, message: &Message) -> Result<(), Self::Error> {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message.clone());
        Ok(())
    }
}
