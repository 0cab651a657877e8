//! The self-iterate ritual pipeline.
//!
//! Collaborators are capability seams: audits, self-tests, rituals,
//! refinement, strategy mutation, evolution, hive broadcasting, skill
//! synthesis, and the evolutionary pilot. The orchestrator runs them in a
//! fixed order; their errors are opaque, logged, and never crash the host.

use async_trait::async_trait;
use std::sync::Arc;

use crate::capability::SkillSynthesizer;
use crate::config::EvolutionConfig;
use crate::telemetry::{TelemetryKind, TelemetrySink, SYSTEM_SCOPE};

/// Reports system health issues. Issues never abort the pipeline.
#[async_trait]
pub trait HealthAuditor: Send + Sync {
    async fn audit(&self) -> anyhow::Result<Vec<String>>;
}

/// One registered self-test.
#[async_trait]
pub trait SelfTest: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self) -> anyhow::Result<()>;
}

/// A periodic maintenance ritual (compaction, optimization). Returns
/// whether it actually ran.
#[async_trait]
pub trait Ritual: Send + Sync {
    fn name(&self) -> &str;

    async fn run_if_due(&self) -> anyhow::Result<bool>;
}

/// Refines action statistics and clears out zombie data.
#[async_trait]
pub trait ActionRefiner: Send + Sync {
    async fn refine_statistics(&self) -> anyhow::Result<()>;

    async fn prune_zombie_data(&self) -> anyhow::Result<()>;

    async fn monitor_ablations(&self) -> anyhow::Result<()>;
}

/// Mutates the agent's high-level strategy.
#[async_trait]
pub trait StrategyMutator: Send + Sync {
    async fn mutate(&self) -> anyhow::Result<()>;
}

/// Executes one skill-mutation sandbox pulse.
#[async_trait]
pub trait EvolutionPulse: Send + Sync {
    async fn pulse(&self) -> anyhow::Result<()>;
}

/// Broadcasts knowledge to the hive.
#[async_trait]
pub trait HiveLink: Send + Sync {
    async fn broadcast_knowledge(&self) -> anyhow::Result<()>;
}

/// Runs the evolutionary pilot's own improvement cycle.
#[async_trait]
pub trait EvolutionaryPilot: Send + Sync {
    async fn self_improvement_cycle(&self) -> anyhow::Result<()>;
}

/// Pluggable collaborator set for the orchestrator. Every slot is
/// optional; missing collaborators are skipped.
#[derive(Default)]
pub struct GovernanceCollaborators {
    pub auditor: Option<Arc<dyn HealthAuditor>>,
    pub self_tests: Vec<Arc<dyn SelfTest>>,
    pub rituals: Vec<Arc<dyn Ritual>>,
    pub refiner: Option<Arc<dyn ActionRefiner>>,
    pub mutator: Option<Arc<dyn StrategyMutator>>,
    pub pulse: Option<Arc<dyn EvolutionPulse>>,
    pub hive: Option<Arc<dyn HiveLink>>,
    pub synthesizer: Option<Arc<dyn SkillSynthesizer>>,
    pub pilot: Option<Arc<dyn EvolutionaryPilot>>,
}

/// Runs the ordered self-improvement pipeline.
pub struct GovernanceOrchestrator {
    collaborators: GovernanceCollaborators,
    telemetry: Arc<dyn TelemetrySink>,
    config: EvolutionConfig,
}

impl GovernanceOrchestrator {
    pub fn new(
        collaborators: GovernanceCollaborators,
        telemetry: Arc<dyn TelemetrySink>,
        config: EvolutionConfig,
    ) -> Self {
        Self {
            collaborators,
            telemetry,
            config,
        }
    }

    /// Execute one self-iteration. Failures are caught, logged, and
    /// reported through telemetry; the orchestrator stays usable.
    pub async fn self_iterate(&self) {
        if let Err(error) = self.run_pipeline().await {
            tracing::error!(%error, "self-iteration failed");
            self.telemetry
                .track(
                    SYSTEM_SCOPE,
                    TelemetryKind::Error,
                    &format!("Self-iteration failed: {error}"),
                    None,
                )
                .await;
        }
    }

    async fn run_pipeline(&self) -> anyhow::Result<()> {
        let c = &self.collaborators;

        // 1. Health audit; issues are reported, never fatal.
        if let Some(auditor) = &c.auditor {
            let issues = auditor.audit().await?;
            for issue in &issues {
                tracing::warn!(issue, "health audit finding");
            }
        }

        // 2. Registered self-tests.
        for test in &c.self_tests {
            test.run()
                .await
                .map_err(|e| e.context(format!("self-test '{}'", test.name())))?;
            tracing::debug!(test = test.name(), "self-test passed");
        }

        // 3. Pending periodic rituals.
        for ritual in &c.rituals {
            let ran = ritual
                .run_if_due()
                .await
                .map_err(|e| e.context(format!("ritual '{}'", ritual.name())))?;
            if ran {
                tracing::info!(ritual = ritual.name(), "ritual executed");
            }
        }

        // 4. Action refinement and zombie pruning.
        if let Some(refiner) = &c.refiner {
            refiner.refine_statistics().await?;
            refiner.prune_zombie_data().await?;
            refiner.monitor_ablations().await?;
        }

        // 5. Strategy mutation.
        if let Some(mutator) = &c.mutator {
            mutator.mutate().await?;
        }

        // 6. One evolution pulse.
        if let Some(pulse) = &c.pulse {
            pulse.pulse().await?;
        }

        // 7. Hive broadcast, honoring the kill switch.
        if self.config.enable_hive_link {
            if let Some(hive) = &c.hive {
                hive.broadcast_knowledge().await?;
            }
        }

        // 8. Skill synthesis.
        if let Some(synthesizer) = &c.synthesizer {
            let produced = synthesizer.synthesize().await?;
            if produced > 0 {
                tracing::info!(produced, "skills synthesized");
            }
        }

        // 9. Evolutionary pilot.
        if let Some(pilot) = &c.pilot {
            pilot.self_improvement_cycle().await?;
        }

        Ok(())
    }
}
