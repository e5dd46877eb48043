mod build;

pub use self::build::ProcessorBuilder;

use crate::store::MessageStore;
use crate::{Message, MessageQueue, Spool};
use futures::FutureExt as _;
use std::future::Future;
use std::time::Duration;

/// Drives delivery of queued messages.
///
/// The processor owns its queue.  Each batch takes messages from the
/// head, hands them one at a time to the delivery service, and
/// decides what happens to the ones that fail: another attempt at the
/// tail of the queue, the dead-letter store, or nowhere.  Messages are
/// stamped as delivered only once the service confirms them, unless
/// the processor was built with `stamp_on_dequeue`.
///
/// With a [`Spool`] attached, every batch starts by moving pending
/// submissions into the queue.
///
/// The delivery service is any [`tower::Service`] taking a
/// [`Message`] and answering whether it was delivered.  `Ok(false)`,
/// an error, and a panic inside the service's future all count as a
/// failed delivery.
pub struct MessageProcessor<S, D> {
    queue: MessageQueue<S>,
    delivery: D,
    dead_letter: Option<S>,
    spool: Option<Spool>,
    config: Config,
    state: ProcessorState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ProcessorState {
    Stopped,
    Running,
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ProcessorError {
    #[error("the delivery service failed to become ready: {source}")]
    NotReady {
        #[source]
        source: tower::BoxError,
    },
}

impl MessageProcessor<(), ()> {
    #[must_use]
    pub fn build<S: MessageStore>(queue: MessageQueue<S>) -> ProcessorBuilder<S, ()> {
        ProcessorBuilder {
            queue,
            delivery: (),
            dead_letter: None,
            spool: None,
            config: Config::default(),
        }
    }
}

impl<S, D> MessageProcessor<S, D> {
    #[must_use]
    pub fn queue(&self) -> &MessageQueue<S> { &self.queue }

    pub fn queue_mut(&mut self) -> &mut MessageQueue<S> { &mut self.queue }

    #[must_use]
    pub fn dead_letter(&self) -> Option<&S> { self.dead_letter.as_ref() }

    #[must_use]
    pub fn state(&self) -> ProcessorState { self.state }

    #[must_use]
    pub fn into_queue(self) -> MessageQueue<S> { self.queue }
}

impl<S, D> MessageProcessor<S, D>
where
    S: MessageStore,
    D: tower::Service<Message, Response = bool>,
    D::Error: Into<tower::BoxError> + Send + 'static,
    D::Future: Send + 'static,
{
    /// Runs batches until `shutdown` resolves.
    ///
    /// After a batch that delivered nothing, the loop waits for the
    /// poll interval (or for `shutdown`, whichever comes first).
    /// After a batch that delivered something, it goes straight on to
    /// the next one.  A batch in progress is never interrupted; the
    /// shutdown is noticed once it finishes.
    ///
    /// Returns `0` on a requested shutdown, and `1` if the loop had to
    /// stop because of an error.
    #[tracing::instrument(skip_all, name = "queue.poll")]
    pub async fn run_forever<F>(&mut self, shutdown: F) -> i32
    where
        F: Future<Output = ()>,
    {
        let mut shutdown = std::pin::pin!(shutdown);
        self.state = ProcessorState::Running;
        tracing::info!(
            batch_size = self.config.batch_size,
            poll_interval = ?self.config.poll_interval,
            pending = self.queue.count(),
            "message processor started"
        );

        let status = loop {
            if shutdown.as_mut().now_or_never().is_some() {
                break 0;
            }

            match self.process_batch(self.config.batch_size).await {
                Ok(0) => {
                    tokio::select! {
                        () = shutdown.as_mut() => break 0,
                        () = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
                Ok(delivered) => {
                    tracing::debug!(delivered, "batch processed");
                }
                Err(error) => {
                    tracing::error!(%error, "message processor stopped on an error");
                    break 1;
                }
            }
        };

        self.state = ProcessorState::Stopped;
        tracing::info!(status, pending = self.queue.count(), "message processor stopped");
        status
    }

    /// Attempts delivery of up to `batch_size` messages from the head
    /// of the queue, returning how many were delivered.
    ///
    /// Attempts are spaced by the configured throttle.  If the
    /// delivery service stops being ready partway through, the
    /// messages not yet attempted go back to the head of the queue,
    /// unstamped, and the error is returned.
    #[tracing::instrument(skip(self), name = "queue.batch")]
    pub async fn process_batch(&mut self, batch_size: usize) -> Result<usize, ProcessorError> {
        self.ingest().await;
        let batch = self.queue.take(batch_size).await;

        let mut delivered = 0;
        let mut pending = batch.into_iter().peekable();

        while let Some(message) = pending.next() {
            let mut attempt = message.clone();
            if self.config.stamp_on_dequeue {
                attempt.mark_delivered();
            }

            match self.deliver(&attempt).await {
                Ok(true) => {
                    attempt.mark_delivered();
                    delivered += 1;
                    tracing::debug!(id = %attempt.id(), recipient = %attempt.recipient, "delivered message");
                }
                Ok(false) => self.handle_failure(attempt).await,
                Err(error) => {
                    let mut unsent = vec![message];
                    unsent.extend(pending);
                    self.queue.restore(unsent).await;
                    return Err(error);
                }
            }

            if pending.peek().is_some() && !self.config.throttle.is_zero() {
                tokio::time::sleep(self.config.throttle).await;
            }
        }

        Ok(delivered)
    }

    /// Moves pending spool submissions into the queue, returning how
    /// many were added.
    ///
    /// A submission whose id is already queued is discarded.  One
    /// whose enqueue could not be saved is left in the spool.
    pub async fn ingest(&mut self) -> usize {
        let Some(spool) = &self.spool else {
            return 0;
        };

        let pending = match spool.pending().await {
            Ok(pending) => pending,
            Err(error) => {
                tracing::error!(%error, "failed to read the spool");
                return 0;
            }
        };

        let mut ingested = 0;
        for (path, message) in pending {
            if self.queue.contains(message.id()) {
                tracing::debug!(id = %message.id(), "submission is already queued");
            } else {
                let failures = self.queue.persist_failures();
                self.queue.enqueue(message).await;
                if self.queue.persist_failures() > failures {
                    continue;
                }
                ingested += 1;
            }

            if let Err(error) = spool.remove(&path).await {
                tracing::error!(path = %path.display(), %error, "failed to remove submission");
            }
        }

        if ingested > 0 {
            tracing::info!(ingested, pending = self.queue.count(), "ingested submissions");
        }
        ingested
    }

    async fn deliver(&mut self, message: &Message) -> Result<bool, ProcessorError> {
        let service = tower::ServiceExt::<Message>::ready(&mut self.delivery)
            .await
            .map_err(|e| ProcessorError::NotReady { source: e.into() })?;

        // A panic in the delivery future comes back as a `JoinError`.
        let task = tokio::spawn(service.call(message.clone()));

        let delivered = match task.await {
            Ok(Ok(true)) => true,
            Ok(Ok(false)) => {
                tracing::warn!(id = %message.id(), recipient = %message.recipient, "delivery was rejected");
                false
            }
            Ok(Err(error)) => {
                let error: tower::BoxError = error.into();
                tracing::warn!(id = %message.id(), recipient = %message.recipient, %error, "delivery failed");
                false
            }
            Err(error) => {
                tracing::warn!(id = %message.id(), recipient = %message.recipient, %error, "delivery task failed");
                false
            }
        };

        Ok(delivered)
    }

    async fn handle_failure(&mut self, mut message: Message) {
        let attempts = message.record_failure();

        // Stamped messages are never requeued.
        if !self.config.stamp_on_dequeue && attempts < self.config.max_attempts {
            self.queue.requeue(message).await;
            return;
        }

        let Some(dead_letter) = &self.dead_letter else {
            tracing::warn!(id = %message.id(), attempts, "giving up on message; it has been dropped");
            return;
        };

        match dead_letter.append(&message).await {
            Ok(()) => {
                tracing::warn!(id = %message.id(), attempts, "giving up on message; moved to the dead-letter queue");
            }
            Err(error) => {
                tracing::error!(id = %message.id(), %error, "failed to dead-letter message; it has been dropped");
            }
        }
    }
}

impl<S: std::fmt::Debug, D> std::fmt::Debug for MessageProcessor<S, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageProcessor")
            .field("queue", &self.queue)
            .field("dead_letter", &self.dead_letter)
            .field("spool", &self.spool)
            .field("config", &self.config)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
struct Config {
    poll_interval: Duration,
    batch_size: usize,
    throttle: Duration,
    max_attempts: u32,
    stamp_on_dequeue: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            batch_size: 3,
            throttle: Duration::from_secs(1),
            max_attempts: 1,
            stamp_on_dequeue: false,
        }
    }
}

/// Resolves on SIGINT, or SIGTERM on unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::error!(%error, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                tracing::error!(%error, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received ctrl-c, shutting down"),
        () = terminate => tracing::info!("received SIGTERM, shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::task::{Context, Poll};
    use tower::service_fn;

    async fn queue_for(recipients: &[&str]) -> MessageQueue<MemoryStore> {
        let mut queue = MessageQueue::open(MemoryStore::new()).await;
        for recipient in recipients {
            queue
                .enqueue(Message::new("sender", *recipient, format!("to {recipient}")))
                .await;
        }
        queue
    }

    fn fail_for_b(message: Message) -> futures::future::Ready<Result<bool, Infallible>> {
        futures::future::ready(Ok(message.recipient != "B"))
    }

    #[tokio::test]
    async fn failed_delivery_is_not_retried_by_default() {
        let queue = queue_for(&["A", "B", "C"]).await;
        let mut processor = MessageProcessor::build(queue)
            .with_delivery(service_fn(fail_for_b))
            .with_throttle(Duration::ZERO)
            .build();

        let delivered = processor.process_batch(3).await.expect("batch");

        assert_eq!(delivered, 2);
        assert!(processor.queue().is_empty());
    }

    #[tokio::test]
    async fn failed_delivery_is_requeued_until_attempts_run_out() {
        let dead_letter = MemoryStore::new();
        let queue = queue_for(&["A", "B", "C"]).await;
        let mut processor = MessageProcessor::build(queue)
            .with_delivery(service_fn(fail_for_b))
            .with_throttle(Duration::ZERO)
            .with_max_attempts(2)
            .with_dead_letter(dead_letter.clone())
            .build();

        assert_eq!(processor.process_batch(3).await.expect("batch"), 2);
        let retried = processor.queue().peek(1);
        assert_eq!(retried.len(), 1);
        assert_eq!(retried[0].recipient, "B");
        assert_eq!(retried[0].attempts(), 1);
        assert!(!retried[0].is_delivered());

        assert_eq!(processor.process_batch(3).await.expect("batch"), 0);
        assert!(processor.queue().is_empty());

        let dead = dead_letter.snapshot();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].recipient, "B");
        assert_eq!(dead[0].attempts(), 2);
    }

    #[tokio::test]
    async fn errors_and_panics_count_as_failures() {
        let queue = queue_for(&["ok", "error", "panic"]).await;
        let dead_letter = MemoryStore::new();
        let service = service_fn(|message: Message| async move {
            match message.recipient.as_str() {
                "error" => Err(std::io::Error::other("unreachable")),
                "panic" => panic!("delivery blew up"),
                _ => Ok(true),
            }
        });
        let mut processor = MessageProcessor::build(queue)
            .with_delivery(service)
            .with_throttle(Duration::ZERO)
            .with_dead_letter(dead_letter.clone())
            .build();

        assert_eq!(processor.process_batch(3).await.expect("batch"), 1);
        assert_eq!(
            dead_letter
                .snapshot()
                .iter()
                .map(|m| m.recipient.as_str())
                .collect::<Vec<_>>(),
            vec!["error", "panic"]
        );
    }

    #[tokio::test]
    async fn stamp_on_dequeue_stamps_before_delivery() {
        let dead_letter = MemoryStore::new();
        let queue = queue_for(&["B"]).await;
        let mut processor = MessageProcessor::build(queue)
            .with_delivery(service_fn(fail_for_b))
            .with_throttle(Duration::ZERO)
            .with_max_attempts(5)
            .with_stamp_on_dequeue(true)
            .with_dead_letter(dead_letter.clone())
            .build();

        assert_eq!(processor.process_batch(1).await.expect("batch"), 0);
        assert!(processor.queue().is_empty());

        let dead = dead_letter.snapshot();
        assert_eq!(dead.len(), 1);
        assert!(dead[0].is_delivered());
    }

    #[tokio::test(start_paused = true)]
    async fn throttle_spaces_out_attempts() {
        let queue = queue_for(&["A", "B", "C"]).await;
        let mut processor = MessageProcessor::build(queue)
            .with_delivery(service_fn(fail_for_b))
            .with_throttle(Duration::from_millis(250))
            .build();

        let start = tokio::time::Instant::now();
        processor.process_batch(3).await.expect("batch");

        assert_eq!(start.elapsed(), Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn run_forever_drains_then_stops_on_shutdown() {
        let queue = queue_for(&["A", "B", "C", "D"]).await;
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let service = service_fn(move |_: Message| {
            counter.fetch_add(1, Ordering::SeqCst);
            futures::future::ready(Ok::<_, Infallible>(true))
        });
        let mut processor = MessageProcessor::build(queue)
            .with_delivery(service)
            .with_batch_size(3)
            .with_throttle(Duration::ZERO)
            .with_poll_interval(Duration::from_secs(5))
            .build();
        assert_eq!(processor.state(), ProcessorState::Stopped);

        let status = processor
            .run_forever(tokio::time::sleep(Duration::from_secs(1)))
            .await;

        assert_eq!(status, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert!(processor.queue().is_empty());
        assert_eq!(processor.state(), ProcessorState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_waits_for_the_batch_in_progress() {
        let queue = queue_for(&["A", "B", "C", "D"]).await;
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let service = service_fn(move |_: Message| {
            counter.fetch_add(1, Ordering::SeqCst);
            futures::future::ready(Ok::<_, Infallible>(true))
        });
        let mut processor = MessageProcessor::build(queue)
            .with_delivery(service)
            .with_batch_size(3)
            .with_throttle(Duration::from_secs(1))
            .build();

        let start = tokio::time::Instant::now();
        let status = processor
            .run_forever(tokio::time::sleep(Duration::from_millis(500)))
            .await;

        assert_eq!(status, 0);
        assert_eq!(start.elapsed(), Duration::from_secs(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            processor
                .queue()
                .iter()
                .map(|m| m.recipient.as_str())
                .collect::<Vec<_>>(),
            vec!["D"]
        );
    }

    #[tokio::test]
    async fn submissions_are_picked_up_by_the_next_batch() {
        let dir = tempfile::tempdir().expect("tempdir");
        let spool = Spool::new(dir.path().join("incoming"));
        let queue = queue_for(&[]).await;
        let mut processor = MessageProcessor::build(queue)
            .with_delivery(service_fn(fail_for_b))
            .with_throttle(Duration::ZERO)
            .with_spool(spool.clone())
            .build();
        assert_eq!(processor.process_batch(3).await.expect("batch"), 0);

        spool
            .submit(&Message::new("other-process", "A", "late"))
            .await
            .expect("submit");
        processor.queue_mut().enqueue(Message::new("sender", "C", "local")).await;

        assert_eq!(processor.process_batch(3).await.expect("batch"), 2);
        assert!(processor.queue().is_empty());
        assert!(spool.pending().await.expect("pending").is_empty());
    }

    #[tokio::test]
    async fn submissions_already_queued_are_not_duplicated() {
        let dir = tempfile::tempdir().expect("tempdir");
        let spool = Spool::new(dir.path());
        let message = Message::new("sender", "A", "once");
        let queue = queue_for(&[]).await;
        let mut processor = MessageProcessor::build(queue)
            .with_delivery(service_fn(fail_for_b))
            .with_spool(spool.clone())
            .build();
        processor.queue_mut().enqueue(message.clone()).await;
        spool.submit(&message).await.expect("submit");

        assert_eq!(processor.ingest().await, 0);
        assert_eq!(processor.queue().count(), 1);
        assert!(spool.pending().await.expect("pending").is_empty());
    }

    #[derive(Debug)]
    struct Unavailable;

    impl tower::Service<Message> for Unavailable {
        type Error = std::io::Error;
        type Future = futures::future::Ready<Result<bool, Self::Error>>;
        type Response = bool;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Err(std::io::Error::other("channel closed")))
        }

        fn call(&mut self, _: Message) -> Self::Future { futures::future::ready(Ok(true)) }
    }

    #[tokio::test]
    async fn run_forever_exits_nonzero_when_delivery_is_unavailable() {
        let queue = queue_for(&["A", "B"]).await;
        let mut processor = MessageProcessor::build(queue)
            .with_delivery(Unavailable)
            .with_throttle(Duration::ZERO)
            .build();

        let status = processor.run_forever(std::future::pending()).await;

        assert_eq!(status, 1);
        assert_eq!(
            processor
                .queue()
                .iter()
                .map(|m| m.recipient.as_str())
                .collect::<Vec<_>>(),
            vec!["A", "B"]
        );
        assert_eq!(processor.state(), ProcessorState::Stopped);
    }

    #[tokio::test]
    async fn untried_messages_go_back_unstamped() {
        let queue = queue_for(&["A", "B"]).await;
        let mut processor = MessageProcessor::build(queue)
            .with_delivery(Unavailable)
            .with_throttle(Duration::ZERO)
            .with_stamp_on_dequeue(true)
            .build();

        let err = processor.process_batch(2).await.expect_err("not ready");
        assert!(matches!(err, ProcessorError::NotReady { .. }));

        assert_eq!(processor.queue().count(), 2);
        assert!(processor.queue().iter().all(|m| !m.is_delivered()));
        assert_eq!(processor.queue_mut().remove_delivered().await, 0);
    }
}
