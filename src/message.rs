use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    /// Creates a [`MessageId`] from an existing identifier.
    ///
    /// Identifiers are opaque; anything that round-trips through the
    /// queue file is valid.  Use [`MessageId::generate`] for new
    /// messages.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self { Self(id.into()) }

    /// Generates a fresh, random identifier (a v4 UUID).
    #[must_use]
    pub fn generate() -> Self { Self(uuid::Uuid::new_v4().to_string()) }
}

impl AsRef<str> for MessageId {
    fn as_ref(&self) -> &str { &self.0 }
}

impl std::ops::Deref for MessageId {
    type Target = str;

    fn deref(&self) -> &Self::Target { &self.0 }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { self.0.fmt(f) }
}

impl From<&str> for MessageId {
    fn from(value: &str) -> Self { Self::new(value) }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl Priority {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Urgent => "urgent",
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown priority {0:?} (expected low, normal, high, or urgent)")]
pub struct ParsePriorityError(String);

impl std::str::FromStr for Priority {
    type Err = ParsePriorityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "urgent" => Ok(Priority::Urgent),
            _ => Err(ParsePriorityError(s.to_owned())),
        }
    }
}

/// A unit of communication between two parties.
///
/// The identifier and the delivery stamp are only reachable through
/// accessors: an id never changes once assigned, and `delivered_at`
/// is set at most once.  Everything else is plain data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default = "MessageId::generate")]
    id: MessageId,
    pub sender: String,
    pub recipient: String,
    pub content: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default = "default_message_type")]
    pub message_type: String,
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    delivered_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "is_zero")]
    attempts: u32,
}

fn default_message_type() -> String { "text".to_owned() }

fn default_category() -> String { "direct".to_owned() }

#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_zero(v: &u32) -> bool { *v == 0 }

impl Message {
    #[must_use]
    pub fn new(
        sender: impl Into<String>,
        recipient: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: MessageId::generate(),
            sender: sender.into(),
            recipient: recipient.into(),
            content: content.into(),
            priority: Priority::default(),
            message_type: default_message_type(),
            category: default_category(),
            metadata: BTreeMap::new(),
            created_at: Utc::now(),
            delivered_at: None,
            attempts: 0,
        }
    }

    #[must_use]
    pub fn with_id(self, id: MessageId) -> Self { Self { id, ..self } }

    #[must_use]
    pub fn with_priority(self, priority: Priority) -> Self { Self { priority, ..self } }

    #[must_use]
    pub fn with_type(self, message_type: impl Into<String>) -> Self {
        Self {
            message_type: message_type.into(),
            ..self
        }
    }

    #[must_use]
    pub fn with_category(self, category: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            ..self
        }
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    #[must_use]
    pub fn id(&self) -> &MessageId { &self.id }

    #[must_use]
    pub fn delivered_at(&self) -> Option<DateTime<Utc>> { self.delivered_at }

    #[must_use]
    pub fn is_delivered(&self) -> bool { self.delivered_at.is_some() }

    /// The number of failed delivery attempts recorded so far.
    #[must_use]
    pub fn attempts(&self) -> u32 { self.attempts }

    /// Stamps the message as delivered.
    ///
    /// Returns `false` (and leaves the existing stamp alone) if the
    /// message was already delivered.
    pub fn mark_delivered(&mut self) -> bool {
        if self.delivered_at.is_some() {
            return false;
        }

        self.delivered_at = Some(Utc::now());
        true
    }

    /// Records a failed delivery attempt, returning the new total.
    pub fn record_failure(&mut self) -> u32 {
        self.attempts = self.attempts.saturating_add(1);
        self.attempts
    }

    /// Replaces the id of a message that has not yet entered a queue.
    pub(crate) fn reassign_id(&mut self) { self.id = MessageId::generate(); }
}
