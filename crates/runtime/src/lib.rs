//! Cortex Cognitive Substrate
//!
//! A relational substrate for autonomous agents: persisted sessions and
//! messages, a token-aware context window, hierarchical epoch/era
//! compression, hybrid vector recall, an outcome-driven skill lifecycle,
//! action journaling, policy and data-rule enforcement, and a governance
//! loop that runs the self-audit rituals in a fixed order.

pub mod capability;
pub mod config;
pub mod context;
pub mod curiosity;
pub mod governance;
pub mod journal;
pub mod memory;
pub mod metrics;
pub mod policy;
pub mod providers;
pub mod resource;
pub mod session;
pub mod similarity;
pub mod storage;
pub mod telemetry;
pub mod types;

// Re-export commonly used types
pub use capability::{CapabilityRegistry, SkillSynthesizer};
pub use config::{
    ContextConfig, CortexConfig, EvolutionConfig, FtsMode, LoggingConfig, TableNames,
    VectorConfig, VectorProvider,
};
pub use context::buffer::UsageStats;
pub use context::{ContextBuffer, SessionCompressor, WindowOptions};
pub use curiosity::{CuriosityEngine, GapKind, Hotspot, KnowledgeGap};
pub use governance::{
    ActionRefiner, EvolutionPulse, EvolutionaryPilot, GovernanceCollaborators,
    GovernanceOrchestrator, HealthAuditor, HiveLink, Ritual, SelfTest, StrategyMutator,
};
pub use journal::{ActionJournal, ActionPage, ActionQuery, FailureReport};
pub use memory::episodes::EpisodePage;
pub use memory::vector_index::NewMemory;
pub use memory::{EpisodicMemory, KnowledgeStore, ScoredMemory, SearchOptions, VectorIndex};
pub use metrics::MetricStore;
pub use policy::enforcer::ContextEvaluation;
pub use policy::{PolicyDecision, PolicyEnforcer, RuleDecision, RuleEngine, RuleOptions};
pub use providers::{Completion, Embedding, EmbeddingProvider, LanguageModel, MockProvider};
pub use resource::{CostOracle, ModelUsage, QuotaDecision, QuotaProvider, ResourceMonitor};
pub use session::{GoalUpsert, SessionStore};
pub use storage::repository::{
    CognitiveRepository, RepositoryRegistry, SqliteTableRepository, TableRepository,
};
pub use storage::Database;
pub use telemetry::{TelemetryKind, TelemetrySink, TracingTelemetry};
pub use types::*;

use std::path::Path;
use std::sync::Arc;

/// External collaborators wired into a [`Cortex`] instance. Every slot has
/// a working default: tracing-backed telemetry, no providers, and an empty
/// governance set.
pub struct CortexCollaborators {
    pub telemetry: Arc<dyn TelemetrySink>,
    pub embedder: Option<Arc<dyn EmbeddingProvider>>,
    pub language_model: Option<Arc<dyn LanguageModel>>,
    pub quota: Option<Arc<dyn QuotaProvider>>,
    pub cost_oracle: Option<Arc<dyn CostOracle>>,
    pub synthesizer: Option<Arc<dyn SkillSynthesizer>>,
    pub governance: GovernanceCollaborators,
}

impl Default for CortexCollaborators {
    fn default() -> Self {
        Self {
            telemetry: Arc::new(TracingTelemetry),
            embedder: None,
            language_model: None,
            quota: None,
            cost_oracle: None,
            synthesizer: None,
            governance: GovernanceCollaborators::default(),
        }
    }
}

/// Unified façade over the cognitive subsystems.
///
/// One `Cortex` instance serves one logical agent: the context buffer is
/// owned by that agent's task, while every store shares the thread-safe
/// database handle.
pub struct Cortex {
    pub sessions: Arc<SessionStore>,
    pub buffer: Arc<ContextBuffer>,
    pub compressor: Arc<SessionCompressor>,
    pub memories: Arc<VectorIndex>,
    pub episodes: Arc<EpisodicMemory>,
    pub knowledge: Arc<KnowledgeStore>,
    pub capabilities: Arc<CapabilityRegistry>,
    pub journal: Arc<ActionJournal>,
    pub resources: Arc<ResourceMonitor>,
    pub policies: Arc<PolicyEnforcer>,
    pub rules: Arc<RuleEngine>,
    pub metrics: Arc<MetricStore>,
    pub curiosity: Arc<CuriosityEngine>,
    pub governance: Arc<GovernanceOrchestrator>,
    db: Arc<Database>,
    telemetry: Arc<dyn TelemetrySink>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    language_model: Option<Arc<dyn LanguageModel>>,
    config: CortexConfig,
}

impl Cortex {
    /// Open (or create) a substrate at the given database path.
    pub fn open(
        path: &Path,
        config: CortexConfig,
        collaborators: CortexCollaborators,
    ) -> CortexResult<Self> {
        config.logging.init();
        let db = Arc::new(Database::open(path, config.tables.clone())?);
        Ok(Self::assemble(db, config, collaborators))
    }

    /// Open an in-memory substrate (useful for tests and ephemeral agents).
    pub fn open_in_memory(
        config: CortexConfig,
        collaborators: CortexCollaborators,
    ) -> CortexResult<Self> {
        let db = Arc::new(Database::open_in_memory(config.tables.clone())?);
        Ok(Self::assemble(db, config, collaborators))
    }

    fn assemble(
        db: Arc<Database>,
        config: CortexConfig,
        collaborators: CortexCollaborators,
    ) -> Self {
        let CortexCollaborators {
            telemetry,
            embedder,
            language_model,
            quota,
            cost_oracle,
            synthesizer,
            mut governance,
        } = collaborators;

        let metrics = Arc::new(MetricStore::new(db.clone()));
        let sessions = Arc::new(SessionStore::new(db.clone(), telemetry.clone()));
        let buffer = Arc::new(ContextBuffer::new(config.context.clone()));
        let compressor = Arc::new(SessionCompressor::new(db.clone(), config.json_ops));
        let memories = Arc::new(VectorIndex::new(db.clone(), config.vector.clone()));
        let episodes = Arc::new(EpisodicMemory::new(db.clone()));
        let knowledge = Arc::new(KnowledgeStore::new(db.clone(), metrics.clone()));
        let capabilities = Arc::new(CapabilityRegistry::new(
            db.clone(),
            config.evolution.clone(),
            synthesizer.clone(),
        ));
        let journal = Arc::new(ActionJournal::new(db.clone(), telemetry.clone()));
        let resources = Arc::new(ResourceMonitor::new(db.clone(), quota, cost_oracle));
        let policies = Arc::new(PolicyEnforcer::new(db.clone(), metrics.clone()));
        let rules = Arc::new(RuleEngine::new(db.clone()));
        let curiosity = Arc::new(CuriosityEngine::new(knowledge.clone(), metrics.clone()));

        if governance.synthesizer.is_none() {
            governance.synthesizer = synthesizer;
        }
        let governance = Arc::new(GovernanceOrchestrator::new(
            governance,
            telemetry.clone(),
            config.evolution.clone(),
        ));

        Self {
            sessions,
            buffer,
            compressor,
            memories,
            episodes,
            knowledge,
            capabilities,
            journal,
            resources,
            policies,
            rules,
            metrics,
            curiosity,
            governance,
            db,
            telemetry,
            embedder,
            language_model,
            config,
        }
    }

    /// The active configuration.
    pub fn config(&self) -> &CortexConfig {
        &self.config
    }

    /// The shared database handle.
    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    /// A rule-enforcing repository over an arbitrary table.
    pub fn cognitive_repository(&self, table: impl Into<String>) -> CognitiveRepository {
        CognitiveRepository::new(
            Arc::new(SqliteTableRepository::new(self.db.clone(), table)),
            self.rules.clone(),
            self.db.clone(),
            self.telemetry.clone(),
        )
    }

    /// Append an interaction: persist the message, mirror it into the
    /// context buffer, and index it for recall when an embedder is wired.
    /// Embedding problems degrade to a log line; the message itself always
    /// lands.
    pub async fn record_interaction(
        &self,
        session_id: SessionId,
        role: MessageRole,
        content: &str,
        metadata: Option<Metadata>,
    ) -> CortexResult<Message> {
        let message = self
            .sessions
            .add_message(session_id, role, content, metadata)
            .await?;
        self.buffer.add_message(message.clone());

        if let Some(embedder) = &self.embedder {
            match embedder.embed(content).await {
                Ok(embedding) => {
                    let mut metadata = Metadata::new();
                    metadata.insert(
                        "messageId".to_string(),
                        serde_json::Value::from(message.id.0),
                    );
                    if let Err(error) = self
                        .memories
                        .add_memory(content, embedding.vector, Some(session_id), Some(metadata))
                        .await
                    {
                        tracing::warn!(%error, "failed to index interaction");
                    }
                }
                Err(error) => tracing::warn!(%error, "embedding provider failed"),
            }
        }
        Ok(message)
    }

    /// Resume a session: load its history into the context buffer.
    pub async fn resume_session(&self, session_id: SessionId) -> CortexResult<usize> {
        let history = self.sessions.get_history(session_id, None).await?;
        let loaded = history.len();
        self.buffer.set_messages(history);
        Ok(loaded)
    }

    /// Generate text through the wired language model and account for its
    /// cost in the resource monitor.
    pub async fn generate(
        &self,
        session_id: Option<SessionId>,
        prompt: &str,
    ) -> CortexResult<Completion> {
        let Some(model) = &self.language_model else {
            return Err(CortexError::Backend(
                "no language model configured".to_string(),
            ));
        };
        let completion = model.generate(prompt).await?;
        self.resources
            .record_usage(
                session_id,
                model.model_name(),
                completion.input_tokens,
                completion.output_tokens,
                Some(completion.cost),
                None,
                None,
            )
            .await?;
        Ok(completion)
    }

    /// Run one governance self-iteration.
    pub async fn self_iterate(&self) {
        self.governance.self_iterate().await;
    }
}
