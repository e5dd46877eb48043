use super::{Config, MessageProcessor, ProcessorState};
use crate::store::MessageStore;
use crate::{Message, MessageQueue, Settings, Spool};
use std::time::Duration;

pub struct ProcessorBuilder<S, D> {
    pub(super) queue: MessageQueue<S>,
    pub(super) delivery: D,
    pub(super) dead_letter: Option<S>,
    pub(super) spool: Option<Spool>,
    pub(super) config: Config,
}

impl<S: MessageStore, D> ProcessorBuilder<S, D> {
    #[must_use]
    pub fn with_delivery<ND>(self, delivery: ND) -> ProcessorBuilder<S, ND>
    where
        ND: tower::Service<Message, Response = bool>,
    {
        ProcessorBuilder {
            queue: self.queue,
            delivery,
            dead_letter: self.dead_letter,
            spool: self.spool,
            config: self.config,
        }
    }

    /// Sends messages that run out of attempts to `store` instead of
    /// dropping them.
    #[must_use]
    pub fn with_dead_letter(self, store: S) -> Self {
        Self {
            dead_letter: Some(store),
            ..self
        }
    }

    /// Takes submissions from `spool` at the start of every batch.
    #[must_use]
    pub fn with_spool(self, spool: Spool) -> Self {
        Self {
            spool: Some(spool),
            ..self
        }
    }

    #[must_use]
    pub fn with_poll_interval(self, poll_interval: Duration) -> Self {
        let config = Config {
            poll_interval,
            ..self.config
        };

        Self { config, ..self }
    }

    /// Sets the batch size; a size of zero is treated as one.
    #[must_use]
    pub fn with_batch_size(self, batch_size: usize) -> Self {
        let config = Config {
            batch_size: batch_size.max(1),
            ..self.config
        };

        Self { config, ..self }
    }

    #[must_use]
    pub fn with_throttle(self, throttle: Duration) -> Self {
        let config = Config {
            throttle,
            ..self.config
        };

        Self { config, ..self }
    }

    /// Sets how many delivery attempts a message gets; zero is
    /// treated as one.
    #[must_use]
    pub fn with_max_attempts(self, max_attempts: u32) -> Self {
        let config = Config {
            max_attempts: max_attempts.max(1),
            ..self.config
        };

        Self { config, ..self }
    }

    #[must_use]
    pub fn with_stamp_on_dequeue(self, stamp_on_dequeue: bool) -> Self {
        let config = Config {
            stamp_on_dequeue,
            ..self.config
        };

        Self { config, ..self }
    }

    /// Applies the processor options from `settings`.
    ///
    /// The dead-letter store is not built here, since it depends on
    /// the store type; see [`ProcessorBuilder::with_dead_letter`].
    /// Neither is the spool; see [`ProcessorBuilder::with_spool`].
    #[must_use]
    pub fn with_settings(self, settings: &Settings) -> Self {
        self.with_poll_interval(settings.poll_interval())
            .with_batch_size(settings.batch_size)
            .with_throttle(settings.delivery_throttle())
            .with_max_attempts(settings.max_attempts)
            .with_stamp_on_dequeue(settings.stamp_on_dequeue)
    }
}

impl<S, D> ProcessorBuilder<S, D>
where
    S: MessageStore,
    D: tower::Service<Message, Response = bool>,
{
    #[must_use]
    pub fn build(self) -> MessageProcessor<S, D> {
        MessageProcessor {
            queue: self.queue,
            delivery: self.delivery,
            dead_letter: self.dead_letter,
            spool: self.spool,
            config: self.config,
            state: ProcessorState::Stopped,
        }
    }
}

impl<S: std::fmt::Debug, D: std::fmt::Debug> std::fmt::Debug for ProcessorBuilder<S, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessorBuilder")
            .field("queue", &self.queue)
            .field("delivery", &self.delivery)
            .field("dead_letter", &self.dead_letter)
            .field("spool", &self.spool)
            .field("config", &self.config)
            .finish()
    }
}
