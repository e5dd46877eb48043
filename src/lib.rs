//! # **F**ile **M**essage **Q**ueue.
//!
//! A small, local message queue for passing messages between agents
//! on one machine.  It is built from three pieces:
//!
//! 1. A [`MessageStore`], which persists the ordered list of pending
//!    messages ([`JsonFileStore`] keeps them in a single JSON file);
//! 2. A [`MessageQueue`], which offers FIFO operations over an
//!    in-memory copy of that list, and writes it back to the store
//!    after every change;
//! 3. A [`MessageProcessor`], which polls the queue, hands messages
//!    to a delivery service, and deals with the ones that fail.
//!
//! ## Guarantees
//!
//! Not many, on purpose.  This is a best-effort queue: if the queue
//! file is unreadable, the queue starts empty; if a save fails, the
//! operation still succeeds in memory, and the failure is logged.
//! Order is strict FIFO within one queue.  Two processes writing
//! the same file will lose each other's updates, which is why the
//! binary takes a [`ProcessLock`] before touching the queue.  While a
//! processor holds the lock, other producers submit through its
//! [`Spool`], a directory it drains into the queue before every batch.
//!
//! ## Delivery
//!
//! The delivery service is a [`tower::Service`] from [`Message`] to
//! `bool`.  By default a message gets one attempt.  A failed message
//! can instead be retried (it goes back to the tail of the queue),
//! and messages that run out of attempts can be moved to a
//! dead-letter store rather than dropped; see [`ProcessorBuilder`].
//! [`InboxDelivery`] is the service the binary uses, writing each
//! message into a per-recipient inbox directory.

mod inbox;
mod lock;
mod message;
mod processor;
mod queue;
mod settings;
mod spool;
pub mod store;

pub use self::inbox::InboxDelivery;
pub use self::lock::ProcessLock;
pub use self::message::{Message, MessageId, ParsePriorityError, Priority};
pub use self::processor::{
    shutdown_signal, MessageProcessor, ProcessorBuilder, ProcessorError, ProcessorState,
};
pub use self::queue::MessageQueue;
pub use self::settings::{ConfigError, Settings};
pub use self::spool::Spool;
pub use self::store::{JsonFileStore, MemoryStore, MessageStore, StoreError};
