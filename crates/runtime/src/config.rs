//! Runtime configuration for the cognitive substrate.
//!
//! Everything is serde-deserializable with sensible defaults so a partial
//! TOML file (or none at all) yields a working configuration. Backend
//! capabilities (vector provider, full-text mode, JSON operators) are chosen
//! here explicitly, never probed at runtime.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::types::{CortexError, CortexResult};

/// Top-level configuration for a [`crate::Cortex`] instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CortexConfig {
    pub context: ContextConfig,
    pub tables: TableNames,
    pub vector: VectorConfig,
    pub evolution: EvolutionConfig,
    pub logging: LoggingConfig,
    /// Whether the store's JSON operators (`json_extract`) may be used for
    /// anchor filtering. `false` selects the textual `LIKE` fallback.
    pub json_ops: bool,
}

impl Default for CortexConfig {
    fn default() -> Self {
        Self {
            context: ContextConfig::default(),
            tables: TableNames::default(),
            vector: VectorConfig::default(),
            evolution: EvolutionConfig::default(),
            logging: LoggingConfig::default(),
            json_ops: true,
        }
    }
}

impl CortexConfig {
    pub fn from_toml_str(raw: &str) -> CortexResult<Self> {
        toml::from_str(raw).map_err(|e| CortexError::Serialization(e.to_string()))
    }

    pub fn from_toml_file(path: &Path) -> CortexResult<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| CortexError::Backend(format!("read config {}: {e}", path.display())))?;
        Self::from_toml_str(&raw)
    }
}

/// In-memory context window sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Maximum number of messages retained in the window.
    pub max_messages: usize,
    /// Maximum estimated tokens retained in the window.
    pub max_tokens: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_messages: 50,
            max_tokens: 4000,
        }
    }
}

/// Configurable table names for every persisted entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TableNames {
    pub sessions: String,
    pub messages: String,
    pub goals: String,
    pub memories: String,
    pub episodes: String,
    pub epochs: String,
    pub actions: String,
    pub resource_usage: String,
    pub capabilities: String,
    pub policies: String,
    pub rules: String,
    pub metrics: String,
    pub knowledge_base: String,
}

impl Default for TableNames {
    fn default() -> Self {
        Self {
            sessions: "agent_sessions".to_string(),
            messages: "agent_messages".to_string(),
            goals: "agent_goals".to_string(),
            memories: "agent_memories".to_string(),
            episodes: "agent_episodes".to_string(),
            epochs: "agent_epochs".to_string(),
            actions: "agent_actions".to_string(),
            resource_usage: "agent_resource_usage".to_string(),
            capabilities: "agent_capabilities".to_string(),
            policies: "agent_policies".to_string(),
            rules: "agent_rules".to_string(),
            metrics: "agent_metrics".to_string(),
            knowledge_base: "agent_knowledge_base".to_string(),
        }
    }
}

/// How nearest-neighbor queries are executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VectorProvider {
    /// A dense-vector column with a native distance operator.
    Native,
    /// A sidecar nearest-neighbor virtual table (`vss_<table>`).
    Sidecar,
    /// No accelerated backend; always use the manual cosine scan.
    None,
}

/// How keyword queries are executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FtsMode {
    /// A `<table>_fts` virtual full-text table.
    Virtual,
    /// Substring matching via `content LIKE '%keyword%'`.
    Like,
}

/// Vector index configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VectorConfig {
    pub provider: VectorProvider,
    /// Fixed embedding dimension; inserts with any other length are rejected.
    pub dimension: usize,
    /// Default relevance floor for searches.
    pub min_score: f64,
    pub fts: FtsMode,
    /// Upper bound on rows streamed by the manual cosine fallback.
    pub candidate_limit: usize,
}

impl Default for VectorConfig {
    fn default() -> Self {
        Self {
            provider: VectorProvider::None,
            dimension: 384,
            min_score: 0.7,
            fts: FtsMode::Like,
            candidate_limit: 1000,
        }
    }
}

/// Skill evolution tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvolutionConfig {
    /// Outcome count over which promotion/demotion statistics are judged.
    pub verification_window: u32,
    /// Z-score magnitude that triggers a rollback in the evolution pulse.
    pub rollback_threshold_z: f64,
    pub mutation_aggressiveness: f64,
    pub max_sandbox_skills: usize,
    pub enable_hive_link: bool,
}

impl Default for EvolutionConfig {
    fn default() -> Self {
        Self {
            verification_window: 20,
            rollback_threshold_z: 2.5,
            mutation_aggressiveness: 0.5,
            max_sandbox_skills: 5,
            enable_hive_link: true,
        }
    }
}

/// Logging setup applied by [`LoggingConfig::init`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub enabled: bool,
    /// One of `debug`, `info`, `warn`, `error`.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            level: "info".to_string(),
        }
    }
}

impl LoggingConfig {
    /// Install a global tracing subscriber honoring `RUST_LOG` when set.
    ///
    /// Safe to call more than once; later calls are no-ops.
    pub fn init(&self) {
        if !self.enabled {
            return;
        }
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(self.level.clone()));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .try_init();
    }
}
