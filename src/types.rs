//! Core identifier and priority types shared across the crate.

use crate::error::LinkError;
use serde::{Deserialize, Serialize};

/// Unique identifier for a node (one library instance in one host process).
///
/// Node ids are opaque non-empty strings, unique across the fleet and
/// immutable for the lifetime of a running instance. They appear on every
/// envelope as the publisher id and on every network event as the originator.
///
/// # Examples
///
/// ```
/// use shardlink::NodeId;
///
/// let node = NodeId::new("lobby-1").unwrap();
/// assert_eq!(node.as_str(), "lobby-1");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    /// Creates a node id, rejecting empty or whitespace-only strings.
    pub fn new(id: impl Into<String>) -> Result<Self, LinkError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(LinkError::InvalidConfiguration(
                "node id cannot be empty".to_string(),
            ));
        }
        Ok(Self(id))
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for NodeId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Priority attached to a cross-node event broadcast.
///
/// Priorities rank `Low < Normal < High < Critical` and ride on the event
/// wrapper unchanged across hops. The core does not reorder deliveries by
/// priority; the rank is carried for receivers that want it.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl EventPriority {
    /// Numeric rank, increasing with urgency.
    pub fn rank(&self) -> u8 {
        match self {
            EventPriority::Low => 1,
            EventPriority::Normal => 2,
            EventPriority::High => 3,
            EventPriority::Critical => 4,
        }
    }
}

impl std::fmt::Display for EventPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EventPriority::Low => "LOW",
            EventPriority::Normal => "NORMAL",
            EventPriority::High => "HIGH",
            EventPriority::Critical => "CRITICAL",
        };
        write!(f, "{name}")
    }
}
