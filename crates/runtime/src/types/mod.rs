//! Core data structures shared across the cognitive substrate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub mod error;

pub use error::{CortexError, CortexResult};

/// Opaque metadata attached to every persisted entity.
///
/// In memory this is a JSON object; at the storage boundary it is encoded as
/// JSON text. Merges never happen outside a transaction.
pub type Metadata = serde_json::Map<String, Value>;

/// Merge `patch` into `base`, overwriting colliding keys.
pub fn merge_metadata(base: &mut Metadata, patch: Metadata) {
    for (key, value) in patch {
        base.insert(key, value);
    }
}

/// Unique identifier for agent sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::str::FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

macro_rules! row_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        pub struct $name(pub i64);

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(value: i64) -> Self {
                Self(value)
            }
        }
    };
}

row_id!(
    /// Identifier of a persisted message row.
    MessageId
);
row_id!(
    /// Identifier of a goal row.
    GoalId
);
row_id!(
    /// Identifier of an episode row.
    EpisodeId
);
row_id!(
    /// Identifier of an epoch row.
    EpochId
);
row_id!(
    /// Identifier of a vector memory row.
    MemoryId
);
row_id!(
    /// Identifier of a journaled action row.
    ActionId
);
row_id!(
    /// Identifier of a capability row.
    CapabilityId
);
row_id!(
    /// Identifier of a policy row.
    PolicyId
);
row_id!(
    /// Identifier of a data-operation rule row.
    RuleId
);
row_id!(
    /// Identifier of a resource usage row.
    UsageId
);
row_id!(
    /// Identifier of a metric sample row.
    MetricId
);
row_id!(
    /// Identifier of a knowledge fact row.
    FactId
);

macro_rules! text_enum {
    ($(#[$doc:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(format!(
                        concat!("unknown ", stringify!($name), " value: {}"),
                        other
                    )),
                }
            }
        }
    };
}

text_enum!(
    /// Lifecycle state of a session.
    SessionStatus {
        Active => "active",
        Archived => "archived",
        Deleted => "deleted",
    }
);

text_enum!(
    /// Speaker role of a message.
    MessageRole {
        User => "user",
        Assistant => "assistant",
        System => "system",
        Tool => "tool",
        Action => "action",
    }
);

text_enum!(
    /// Lifecycle state of a goal.
    GoalStatus {
        Pending => "pending",
        InProgress => "in_progress",
        Completed => "completed",
        Failed => "failed",
        Blocked => "blocked",
    }
);

text_enum!(
    /// Lifecycle state of an episode.
    EpisodeStatus {
        Active => "active",
        Completed => "completed",
    }
);

text_enum!(
    /// Outcome state of a journaled action.
    ActionStatus {
        Pending => "pending",
        Success => "success",
        Failure => "failure",
    }
);

text_enum!(
    /// Lifecycle stage of a capability.
    CapabilityStatus {
        Experimental => "experimental",
        Sandbox => "sandbox",
        Verified => "verified",
        Blacklisted => "blacklisted",
    }
);

text_enum!(
    /// Data operation a rule applies to.
    RuleOperation {
        Insert => "insert",
        Update => "update",
        Delete => "delete",
        All => "all",
    }
);

text_enum!(
    /// Disposition a rule yields when it matches.
    RuleAction {
        Allow => "allow",
        Deny => "deny",
        Audit => "audit",
        Mask => "mask",
    }
);

/// Kind of a governance policy. Open set; unknown kinds round-trip as `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    Threshold,
    Pattern,
    Budget,
    Privacy,
    #[serde(untagged)]
    Other(String),
}

impl PolicyKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Threshold => "threshold",
            Self::Pattern => "pattern",
            Self::Budget => "budget",
            Self::Privacy => "privacy",
            Self::Other(s) => s.as_str(),
        }
    }
}

impl std::fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PolicyKind {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "threshold" => Self::Threshold,
            "pattern" => Self::Pattern,
            "budget" => Self::Budget,
            "privacy" => Self::Privacy,
            other => Self::Other(other.to_string()),
        })
    }
}

/// A bounded stream of interactions between an agent and its collaborators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub name: Option<String>,
    pub status: SessionStatus,
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A single utterance within a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub session_id: SessionId,
    pub role: MessageRole,
    pub content: String,
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Whether the message is flagged to survive windowing and pruning.
    pub fn is_anchor(&self) -> bool {
        self.metadata.get("anchor") == Some(&Value::Bool(true))
    }
}

/// A goal tracked for a session, optionally nested under a parent goal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Goal {
    pub id: GoalId,
    pub session_id: SessionId,
    pub parent_id: Option<GoalId>,
    pub description: String,
    pub status: GoalStatus,
    pub priority: i64,
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A named slice of agent experience with an explicit lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Episode {
    pub id: EpisodeId,
    pub session_id: SessionId,
    pub name: String,
    pub summary: Option<String>,
    pub status: EpisodeStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub metadata: Metadata,
}

/// A summarized range of consecutive messages. Era epochs carry
/// `metadata.type = "era"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Epoch {
    pub id: EpochId,
    pub session_id: SessionId,
    pub summary: String,
    pub start_message_id: MessageId,
    pub end_message_id: MessageId,
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
}

/// An embedding-bearing memory entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: MemoryId,
    pub session_id: Option<SessionId>,
    pub content: String,
    pub embedding: Vec<f32>,
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
}

/// A journaled tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub id: ActionId,
    pub session_id: SessionId,
    pub message_id: Option<MessageId>,
    pub tool_name: String,
    pub arguments: Metadata,
    pub status: ActionStatus,
    pub outcome: Option<String>,
    pub duration_ms: Option<i64>,
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
}

/// A token/cost accounting row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub id: UsageId,
    pub session_id: Option<SessionId>,
    pub agent_id: Option<String>,
    pub model_name: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cost: f64,
    pub currency: String,
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
}

/// A named, versioned skill with an outcome-driven lifecycle.
///
/// `metadata` carries the evolution counters: `successCount`, `totalCount`,
/// `successStreak`, `failureStreak`, `performanceBaseline`,
/// `performanceVariance`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capability {
    pub id: CapabilityId,
    pub name: String,
    pub version: String,
    pub description: Option<String>,
    pub status: CapabilityStatus,
    pub reliability: f64,
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A governance policy definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub id: PolicyId,
    pub name: String,
    pub kind: PolicyKind,
    pub definition: Metadata,
    pub is_enabled: bool,
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A per-table data-operation rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: RuleId,
    pub table_name: String,
    pub operation: RuleOperation,
    pub condition: Option<String>,
    pub action: RuleAction,
    pub priority: i64,
    pub script: Option<String>,
    pub is_enabled: bool,
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
}

/// A single metric sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub id: MetricId,
    pub metric_name: String,
    pub metric_value: f64,
    pub created_at: DateTime<Utc>,
}

/// A fact about an entity in the knowledge base.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeFact {
    pub id: FactId,
    pub entity: String,
    pub fact: String,
    pub confidence: f64,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_round_trips_through_display() {
        let id = SessionId::new();
        let parsed: SessionId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn text_enums_round_trip() {
        for status in [
            CapabilityStatus::Experimental,
            CapabilityStatus::Sandbox,
            CapabilityStatus::Verified,
            CapabilityStatus::Blacklisted,
        ] {
            let parsed: CapabilityStatus = status.as_str().parse().unwrap();
            assert_eq!(status, parsed);
        }
        assert!("bogus".parse::<CapabilityStatus>().is_err());
    }

    #[test]
    fn policy_kind_keeps_unknown_values() {
        let kind: PolicyKind = "rate_limit".parse().unwrap();
        assert_eq!(kind, PolicyKind::Other("rate_limit".to_string()));
        assert_eq!(kind.as_str(), "rate_limit");
    }

    #[test]
    fn anchor_flag_requires_literal_true() {
        let mut msg = Message {
            id: MessageId(1),
            session_id: SessionId::new(),
            role: MessageRole::User,
            content: "hello".to_string(),
            metadata: Metadata::new(),
            created_at: Utc::now(),
        };
        assert!(!msg.is_anchor());

        msg.metadata
            .insert("anchor".to_string(), Value::String("yes".to_string()));
        assert!(!msg.is_anchor());

        msg.metadata.insert("anchor".to_string(), Value::Bool(true));
        assert!(msg.is_anchor());
    }

    #[test]
    fn merge_overwrites_colliding_keys() {
        let mut base = Metadata::new();
        base.insert("a".to_string(), Value::from(1));
        base.insert("b".to_string(), Value::from(2));

        let mut patch = Metadata::new();
        patch.insert("b".to_string(), Value::from(3));
        patch.insert("c".to_string(), Value::from(4));

        merge_metadata(&mut base, patch);
        assert_eq!(base.get("a"), Some(&Value::from(1)));
        assert_eq!(base.get("b"), Some(&Value::from(3)));
        assert_eq!(base.get("c"), Some(&Value::from(4)));
    }
}
