//! Skill lifecycle: registration, outcome-driven reliability, and
//! statistics-based promotion and demotion.
//!
//! Outcomes for a capability name are serialized: the registry keeps one
//! async lock per name on top of the store transaction, so concurrent
//! reports can never interleave their read-modify-write cycles.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use rusqlite::OptionalExtension;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::config::EvolutionConfig;
use crate::storage::{decode_metadata, decode_ts, encode_metadata, encode_ts, Database};
use crate::types::{
    merge_metadata, Capability, CapabilityId, CapabilityStatus, CortexError, CortexResult,
    Metadata,
};

const CAPABILITY_COLS: &str =
    "id, name, version, description, status, reliability, metadata, created_at, updated_at";

/// Damping factor for the reliability average.
const RELIABILITY_ALPHA: f64 = 0.2;

/// EMA factor for the performance baseline and variance.
const BASELINE_ALPHA: f64 = 0.05;

/// Z-score below which a verified capability collapses back to
/// experimental.
const COLLAPSE_Z: f64 = -2.0;

/// Synthesizes new skills and warms up promising ones. Pre-warm requests
/// are fire-and-forget; their errors are discarded.
#[async_trait]
pub trait SkillSynthesizer: Send + Sync {
    async fn prewarm(&self, capability: &str) -> anyhow::Result<()>;

    /// Discover and synthesize new capabilities; returns how many were
    /// produced.
    async fn synthesize(&self) -> anyhow::Result<usize>;
}

/// Owns capability rows and evolves their status and reliability.
pub struct CapabilityRegistry {
    db: Arc<Database>,
    config: EvolutionConfig,
    synthesizer: Option<Arc<dyn SkillSynthesizer>>,
    outcome_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl CapabilityRegistry {
    pub fn new(
        db: Arc<Database>,
        config: EvolutionConfig,
        synthesizer: Option<Arc<dyn SkillSynthesizer>>,
    ) -> Self {
        Self {
            db,
            config,
            synthesizer,
            outcome_locks: DashMap::new(),
        }
    }

    /// Register a capability, idempotently on `(name, version)`.
    ///
    /// New rows start experimental with reliability 1.0 and zeroed
    /// counters; `metadata.initialStatus` may override the initial status.
    /// Existing rows have their description and caller metadata merged.
    pub async fn register_capability(
        &self,
        name: &str,
        version: &str,
        description: Option<&str>,
        metadata: Option<Metadata>,
    ) -> CortexResult<Capability> {
        let table = self.db.tables().capabilities.clone();
        let now = Utc::now();
        let name = name.to_string();
        let version = version.to_string();
        let description = description.map(str::to_string);
        let caller_metadata = metadata.unwrap_or_default();

        self.db
            .transaction(move |tx| {
                let existing = tx
                    .query_row(
                        &format!(
                            "SELECT {CAPABILITY_COLS} FROM {table}
                             WHERE name = ?1 AND version = ?2"
                        ),
                        rusqlite::params![name, version],
                        capability_row,
                    )
                    .optional()?;

                match existing {
                    Some(raw) => {
                        let mut capability = capability_from_raw(raw)?;
                        if description.is_some() {
                            capability.description = description;
                        }
                        merge_metadata(&mut capability.metadata, caller_metadata);
                        capability.updated_at = now;
                        tx.execute(
                            &format!(
                                "UPDATE {table}
                                 SET description = ?1, metadata = ?2, updated_at = ?3
                                 WHERE id = ?4"
                            ),
                            rusqlite::params![
                                capability.description,
                                encode_metadata(&capability.metadata),
                                encode_ts(now),
                                capability.id.0,
                            ],
                        )?;
                        Ok(capability)
                    }
                    None => {
                        let status = caller_metadata
                            .get("initialStatus")
                            .and_then(Value::as_str)
                            .and_then(|s| s.parse::<CapabilityStatus>().ok())
                            .unwrap_or(CapabilityStatus::Experimental);

                        let mut row_metadata = Metadata::new();
                        row_metadata.insert("successCount".to_string(), Value::from(0));
                        row_metadata.insert("totalCount".to_string(), Value::from(0));
                        merge_metadata(&mut row_metadata, caller_metadata);

                        tx.execute(
                            &format!(
                                "INSERT INTO {table}
                                 (name, version, description, status, reliability, metadata,
                                  created_at, updated_at)
                                 VALUES (?1, ?2, ?3, ?4, 1.0, ?5, ?6, ?7)"
                            ),
                            rusqlite::params![
                                name,
                                version,
                                description,
                                status.as_str(),
                                encode_metadata(&row_metadata),
                                encode_ts(now),
                                encode_ts(now),
                            ],
                        )?;
                        Ok(Capability {
                            id: CapabilityId(tx.last_insert_rowid()),
                            name,
                            version,
                            description,
                            status,
                            reliability: 1.0,
                            metadata: row_metadata,
                            created_at: now,
                            updated_at: now,
                        })
                    }
                }
            })
            .await
    }

    /// Fold one success/failure into the latest row for `name`.
    pub async fn report_outcome(&self, name: &str, success: bool) -> CortexResult<Capability> {
        let lock = self
            .outcome_locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        let table = self.db.tables().capabilities.clone();
        let window = self.config.verification_window;
        let now = Utc::now();
        let name_owned = name.to_string();

        let (capability, prewarm) = self
            .db
            .transaction(move |tx| {
                let raw = tx
                    .query_row(
                        &format!(
                            "SELECT {CAPABILITY_COLS} FROM {table}
                             WHERE name = ?1
                             ORDER BY updated_at DESC, id DESC
                             LIMIT 1"
                        ),
                        rusqlite::params![name_owned],
                        capability_row,
                    )
                    .optional()?
                    .ok_or_else(|| CortexError::not_found("capability", &name_owned))?;
                let mut capability = capability_from_raw(raw)?;

                let stats = fold_outcome(&capability, success, window);

                capability.status = stats.status;
                capability.reliability = stats.reliability;
                capability.updated_at = now;
                write_counters(&mut capability.metadata, &stats);

                tx.execute(
                    &format!(
                        "UPDATE {table}
                         SET status = ?1, reliability = ?2, metadata = ?3, updated_at = ?4
                         WHERE id = ?5"
                    ),
                    rusqlite::params![
                        capability.status.as_str(),
                        capability.reliability,
                        encode_metadata(&capability.metadata),
                        encode_ts(now),
                        capability.id.0,
                    ],
                )?;
                Ok((capability, stats.prewarm))
            })
            .await?;

        if prewarm {
            if let Some(synthesizer) = self.synthesizer.clone() {
                let name = name.to_string();
                tokio::spawn(async move {
                    if let Err(error) = synthesizer.prewarm(&name).await {
                        tracing::debug!(%name, %error, "skill pre-warm request failed");
                    }
                });
            }
        }
        Ok(capability)
    }

    /// Current reliability of the latest row for `name`.
    pub async fn get_reliability(&self, name: &str) -> CortexResult<f64> {
        let table = self.db.tables().capabilities.clone();
        let name = name.to_string();
        self.db
            .with_conn(move |conn| {
                conn.query_row(
                    &format!(
                        "SELECT reliability FROM {table}
                         WHERE name = ?1
                         ORDER BY updated_at DESC, id DESC
                         LIMIT 1"
                    ),
                    rusqlite::params![name],
                    |row| row.get::<_, f64>(0),
                )
                .optional()?
                .ok_or_else(|| CortexError::not_found("capability", &name))
            })
            .await
    }

    /// Capabilities, optionally filtered by status, ordered by name.
    pub async fn get_capabilities(
        &self,
        status: Option<CapabilityStatus>,
    ) -> CortexResult<Vec<Capability>> {
        let table = self.db.tables().capabilities.clone();
        self.db
            .with_conn(move |conn| {
                let mut out = Vec::new();
                match status {
                    Some(status) => {
                        let mut stmt = conn.prepare(&format!(
                            "SELECT {CAPABILITY_COLS} FROM {table}
                             WHERE status = ?1 ORDER BY name ASC, version ASC"
                        ))?;
                        let rows =
                            stmt.query_map(rusqlite::params![status.as_str()], capability_row)?;
                        for row in rows {
                            out.push(capability_from_raw(row?)?);
                        }
                    }
                    None => {
                        let mut stmt = conn.prepare(&format!(
                            "SELECT {CAPABILITY_COLS} FROM {table}
                             ORDER BY name ASC, version ASC"
                        ))?;
                        let rows = stmt.query_map([], capability_row)?;
                        for row in rows {
                            out.push(capability_from_raw(row?)?);
                        }
                    }
                }
                Ok(out)
            })
            .await
    }
}

/// Result of folding one outcome into a capability's statistics.
struct OutcomeStats {
    status: CapabilityStatus,
    reliability: f64,
    success_count: i64,
    total_count: i64,
    success_streak: i64,
    failure_streak: i64,
    baseline: f64,
    variance: f64,
    z_score: f64,
    prewarm: bool,
}

fn counter(metadata: &Metadata, key: &str) -> i64 {
    metadata.get(key).and_then(Value::as_i64).unwrap_or(0)
}

fn gauge(metadata: &Metadata, key: &str) -> f64 {
    metadata.get(key).and_then(Value::as_f64).unwrap_or(0.0)
}

/// The lifecycle computation. Pure so the transitions are directly
/// testable.
fn fold_outcome(capability: &Capability, success: bool, window: u32) -> OutcomeStats {
    let meta = &capability.metadata;
    let success_count = counter(meta, "successCount") + i64::from(success);
    let total_count = counter(meta, "totalCount") + 1;
    let success_streak = if success {
        counter(meta, "successStreak") + 1
    } else {
        0
    };
    let failure_streak = if success {
        0
    } else {
        counter(meta, "failureStreak") + 1
    };

    let reliability = (capability.reliability * (1.0 - RELIABILITY_ALPHA)
        + if success { RELIABILITY_ALPHA } else { 0.0 })
    .clamp(0.0, 1.0);

    let win_rate = success_count as f64 / total_count as f64;
    let old_baseline = gauge(meta, "performanceBaseline");
    let old_variance = gauge(meta, "performanceVariance");
    let baseline = old_baseline * (1.0 - BASELINE_ALPHA) + win_rate * BASELINE_ALPHA;
    let variance = old_variance * (1.0 - BASELINE_ALPHA)
        + (win_rate - old_baseline).powi(2) * BASELINE_ALPHA;
    let std_dev = variance.sqrt();
    // Both the variance term and the z-score deviate from the baseline as
    // it stood before this outcome.
    let z_score = if std_dev > 0.0 {
        (win_rate - old_baseline) / std_dev
    } else {
        0.0
    };

    let verification_floor = (0.75 * f64::from(window)).ceil() as i64;
    let in_probation = matches!(
        capability.status,
        CapabilityStatus::Experimental | CapabilityStatus::Sandbox
    );

    let status = if in_probation && !success && failure_streak >= 3 && total_count <= 5 {
        CapabilityStatus::Blacklisted
    } else if in_probation
        && ((total_count >= verification_floor && win_rate >= 0.8) || success_streak >= 5)
    {
        CapabilityStatus::Verified
    } else if total_count >= verification_floor && win_rate < 0.4 {
        CapabilityStatus::Blacklisted
    } else if capability.status == CapabilityStatus::Verified
        && total_count >= verification_floor
        && z_score < COLLAPSE_Z
    {
        CapabilityStatus::Experimental
    } else {
        capability.status
    };

    let prewarm_floor = (0.6 * f64::from(window)).ceil() as i64;
    let prewarm =
        (total_count >= prewarm_floor && win_rate >= 0.8) || success_streak == 4;

    OutcomeStats {
        status,
        reliability,
        success_count,
        total_count,
        success_streak,
        failure_streak,
        baseline,
        variance,
        z_score,
        prewarm,
    }
}

fn write_counters(metadata: &mut Metadata, stats: &OutcomeStats) {
    metadata.insert("successCount".to_string(), Value::from(stats.success_count));
    metadata.insert("totalCount".to_string(), Value::from(stats.total_count));
    metadata.insert(
        "successStreak".to_string(),
        Value::from(stats.success_streak),
    );
    metadata.insert(
        "failureStreak".to_string(),
        Value::from(stats.failure_streak),
    );
    metadata.insert(
        "performanceBaseline".to_string(),
        Value::from(stats.baseline),
    );
    metadata.insert(
        "performanceVariance".to_string(),
        Value::from(stats.variance),
    );
    metadata.insert("lastZScore".to_string(), Value::from(stats.z_score));
}

// ── Row-mapping helpers ───────────────────────────────────────────────

type RawCapability = (
    i64,
    String,
    String,
    Option<String>,
    String,
    f64,
    String,
    String,
    String,
);

fn capability_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawCapability> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
    ))
}

fn capability_from_raw(raw: RawCapability) -> CortexResult<Capability> {
    let (id, name, version, description, status, reliability, metadata, created_at, updated_at) =
        raw;
    Ok(Capability {
        id: CapabilityId(id),
        name,
        version,
        description,
        status: status.parse().map_err(CortexError::Serialization)?,
        reliability,
        metadata: decode_metadata(&metadata)?,
        created_at: decode_ts(&created_at)?,
        updated_at: decode_ts(&updated_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TableNames;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSynthesizer {
        prewarms: AtomicUsize,
    }

    #[async_trait]
    impl SkillSynthesizer for CountingSynthesizer {
        async fn prewarm(&self, _capability: &str) -> anyhow::Result<()> {
            self.prewarms.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn synthesize(&self) -> anyhow::Result<usize> {
            Ok(0)
        }
    }

    fn registry() -> CapabilityRegistry {
        CapabilityRegistry::new(
            Arc::new(Database::open_in_memory(TableNames::default()).unwrap()),
            EvolutionConfig::default(),
            None,
        )
    }

    #[tokio::test]
    async fn registration_is_idempotent_on_name_and_version() {
        let skills = registry();
        let first = skills
            .register_capability("search", "1", Some("web search"), None)
            .await
            .unwrap();
        assert_eq!(first.status, CapabilityStatus::Experimental);
        assert!((first.reliability - 1.0).abs() < f64::EPSILON);

        let second = skills
            .register_capability("search", "1", Some("refined search"), None)
            .await
            .unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.description.as_deref(), Some("refined search"));

        let all = skills.get_capabilities(None).await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn initial_status_override_applies_to_new_rows() {
        let skills = registry();
        let mut meta = Metadata::new();
        meta.insert("initialStatus".to_string(), Value::from("sandbox"));
        let capability = skills
            .register_capability("risky", "1", None, Some(meta))
            .await
            .unwrap();
        assert_eq!(capability.status, CapabilityStatus::Sandbox);
    }

    #[tokio::test]
    async fn five_straight_successes_fast_track_to_verified() {
        // Spec scenario S2.
        let skills = registry();
        skills
            .register_capability("tool_x", "1", None, None)
            .await
            .unwrap();

        let mut last = None;
        for _ in 0..5 {
            last = Some(skills.report_outcome("tool_x", true).await.unwrap());
        }
        let capability = last.unwrap();
        assert_eq!(capability.status, CapabilityStatus::Verified);
        assert!(capability.reliability >= 0.67);
        assert_eq!(counter(&capability.metadata, "successStreak"), 5);
    }

    #[tokio::test]
    async fn three_early_failures_blacklist() {
        // Spec scenario S3.
        let skills = registry();
        skills
            .register_capability("tool_y", "1", None, None)
            .await
            .unwrap();

        let mut last = None;
        for _ in 0..3 {
            last = Some(skills.report_outcome("tool_y", false).await.unwrap());
        }
        let capability = last.unwrap();
        assert_eq!(capability.status, CapabilityStatus::Blacklisted);
        assert_eq!(counter(&capability.metadata, "failureStreak"), 3);
        assert_eq!(counter(&capability.metadata, "totalCount"), 3);
        assert!((capability.reliability - 0.512).abs() < 1e-9);
    }

    #[tokio::test]
    async fn reliability_stays_bounded() {
        let skills = registry();
        skills.register_capability("t", "1", None, None).await.unwrap();
        for success in [true, false, false, true, false, false, false, true] {
            let capability = skills.report_outcome("t", success).await.unwrap();
            assert!((0.0..=1.0).contains(&capability.reliability));
        }
    }

    #[tokio::test]
    async fn low_win_rate_over_window_blacklists() {
        let skills = registry();
        let mut meta = Metadata::new();
        meta.insert("initialStatus".to_string(), Value::from("sandbox"));
        meta.insert("successCount".to_string(), Value::from(5));
        meta.insert("totalCount".to_string(), Value::from(14));
        skills
            .register_capability("flaky", "1", None, Some(meta))
            .await
            .unwrap();

        // 15th outcome: win rate 5/15 < 0.4 over a full window.
        let capability = skills.report_outcome("flaky", false).await.unwrap();
        assert_eq!(counter(&capability.metadata, "totalCount"), 15);
        assert_eq!(capability.status, CapabilityStatus::Blacklisted);
    }

    #[tokio::test]
    async fn performance_collapse_demotes_verified_to_experimental() {
        let skills = registry();
        let mut meta = Metadata::new();
        meta.insert("initialStatus".to_string(), Value::from("verified"));
        meta.insert("successCount".to_string(), Value::from(12));
        meta.insert("totalCount".to_string(), Value::from(15));
        meta.insert("performanceBaseline".to_string(), Value::from(0.9));
        meta.insert("performanceVariance".to_string(), Value::from(0.001));
        skills
            .register_capability("fading", "1", None, Some(meta))
            .await
            .unwrap();

        // win rate 12/16 = 0.75 against the prior 0.9 baseline with tiny
        // variance: z ≈ -3.3, far below the collapse threshold.
        let capability = skills.report_outcome("fading", false).await.unwrap();
        assert_eq!(capability.status, CapabilityStatus::Experimental);
    }

    #[tokio::test]
    async fn verified_capability_does_not_blacklist_early() {
        let skills = registry();
        let mut meta = Metadata::new();
        meta.insert("initialStatus".to_string(), Value::from("verified"));
        skills
            .register_capability("steady", "1", None, Some(meta))
            .await
            .unwrap();

        // Three failures would blacklist an experimental skill, but a
        // verified one rides them out this early in its window.
        for _ in 0..3 {
            skills.report_outcome("steady", false).await.unwrap();
        }
        let capability = &skills
            .get_capabilities(Some(CapabilityStatus::Verified))
            .await
            .unwrap()[0];
        assert_eq!(capability.name, "steady");
    }

    #[tokio::test]
    async fn outcome_for_unknown_capability_fails() {
        let skills = registry();
        let err = skills.report_outcome("ghost", true).await.unwrap_err();
        assert!(matches!(err, CortexError::NotFound { .. }));
    }

    #[tokio::test]
    async fn streak_of_four_requests_prewarm() {
        let synthesizer = Arc::new(CountingSynthesizer {
            prewarms: AtomicUsize::new(0),
        });
        let skills = CapabilityRegistry::new(
            Arc::new(Database::open_in_memory(TableNames::default()).unwrap()),
            EvolutionConfig::default(),
            Some(synthesizer.clone()),
        );
        skills.register_capability("warm", "1", None, None).await.unwrap();

        for _ in 0..4 {
            skills.report_outcome("warm", true).await.unwrap();
        }
        // Detached request; give the spawned task a beat to run.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(synthesizer.prewarms.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn get_reliability_reads_latest_row() {
        let skills = registry();
        skills.register_capability("r", "1", None, None).await.unwrap();
        skills.report_outcome("r", false).await.unwrap();
        let reliability = skills.get_reliability("r").await.unwrap();
        assert!((reliability - 0.8).abs() < 1e-9);

        assert!(skills.get_reliability("missing").await.is_err());
    }

    #[test]
    fn transitions_only_fire_from_permitted_states() {
        // A blacklisted capability never resurrects through fold_outcome.
        let capability = Capability {
            id: CapabilityId(1),
            name: "dead".to_string(),
            version: "1".to_string(),
            description: None,
            status: CapabilityStatus::Blacklisted,
            reliability: 0.2,
            metadata: Metadata::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let stats = fold_outcome(&capability, true, 20);
        assert_eq!(stats.status, CapabilityStatus::Blacklisted);
    }
}
