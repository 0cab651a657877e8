//! Token and cost accounting with pre-run quota projection.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;

use crate::storage::{decode_metadata, decode_ts, encode_metadata, encode_ts, Database};
use crate::types::{CortexError, CortexResult, Metadata, ResourceUsage, SessionId, UsageId};

const USAGE_COLS: &str = "id, session_id, agent_id, model_name, input_tokens, output_tokens, cost, currency, metadata, created_at";

/// Conservative per-token rate used when no oracle is wired.
const DEFAULT_RATE_PER_TOKEN: f64 = 2e-5;

/// Default token estimate for a projected run.
const DEFAULT_ESTIMATED_TOKENS: i64 = 2000;

/// Outcome of a quota check.
#[derive(Debug, Clone, PartialEq)]
pub struct QuotaDecision {
    pub allowed: bool,
    pub reason: Option<String>,
}

impl QuotaDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}

/// External quota authority, consulted persona → swarm → global.
#[async_trait]
pub trait QuotaProvider: Send + Sync {
    async fn check_persona(&self, agent_id: &str, projected_cost: f64)
        -> CortexResult<QuotaDecision>;

    async fn check_swarm(&self, swarm_id: &str, projected_cost: f64)
        -> CortexResult<QuotaDecision>;

    async fn check_global(&self, projected_cost: f64) -> CortexResult<QuotaDecision>;
}

/// Source of the projected per-token rate.
#[async_trait]
pub trait CostOracle: Send + Sync {
    async fn rate_per_token(&self, agent_id: &str) -> CortexResult<f64>;
}

/// Per-model aggregation row.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelUsage {
    pub model_name: String,
    pub calls: u64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub total_cost: f64,
}

/// Records usage rows and projects quotas before a run.
pub struct ResourceMonitor {
    db: Arc<Database>,
    quota: Option<Arc<dyn QuotaProvider>>,
    oracle: Option<Arc<dyn CostOracle>>,
}

impl ResourceMonitor {
    pub fn new(
        db: Arc<Database>,
        quota: Option<Arc<dyn QuotaProvider>>,
        oracle: Option<Arc<dyn CostOracle>>,
    ) -> Self {
        Self { db, quota, oracle }
    }

    /// Record one usage row. Cost defaults to zero, currency to USD.
    #[allow(clippy::too_many_arguments)]
    pub async fn record_usage(
        &self,
        session_id: Option<SessionId>,
        model_name: &str,
        input_tokens: i64,
        output_tokens: i64,
        cost: Option<f64>,
        agent_id: Option<&str>,
        metadata: Option<Metadata>,
    ) -> CortexResult<ResourceUsage> {
        let table = self.db.tables().resource_usage.clone();
        let now = Utc::now();
        let usage = ResourceUsage {
            id: UsageId(0),
            session_id,
            agent_id: agent_id.map(str::to_string),
            model_name: model_name.to_string(),
            input_tokens,
            output_tokens,
            cost: cost.unwrap_or(0.0),
            currency: "USD".to_string(),
            metadata: metadata.unwrap_or_default(),
            created_at: now,
        };
        let row = usage.clone();
        let id = self
            .db
            .with_conn(move |conn| {
                conn.execute(
                    &format!(
                        "INSERT INTO {table}
                         (session_id, agent_id, model_name, input_tokens, output_tokens,
                          cost, currency, metadata, created_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
                    ),
                    rusqlite::params![
                        row.session_id.map(|s| s.to_string()),
                        row.agent_id,
                        row.model_name,
                        row.input_tokens,
                        row.output_tokens,
                        row.cost,
                        row.currency,
                        encode_metadata(&row.metadata),
                        encode_ts(now),
                    ],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await?;
        Ok(ResourceUsage {
            id: UsageId(id),
            ..usage
        })
    }

    /// Project the cost of a run and return the first denying quota check,
    /// consulting persona, then swarm, then global limits. Without a wired
    /// provider everything is allowed under a conservative default rate.
    pub async fn validate_quota(
        &self,
        agent_id: &str,
        swarm_id: Option<&str>,
        estimated_tokens: Option<i64>,
    ) -> CortexResult<QuotaDecision> {
        let estimated_tokens = estimated_tokens.unwrap_or(DEFAULT_ESTIMATED_TOKENS);
        let rate = match &self.oracle {
            Some(oracle) => oracle.rate_per_token(agent_id).await?,
            None => DEFAULT_RATE_PER_TOKEN,
        };
        let projected_cost = estimated_tokens as f64 * rate;

        let Some(quota) = &self.quota else {
            return Ok(QuotaDecision::allow());
        };

        let persona = quota.check_persona(agent_id, projected_cost).await?;
        if !persona.allowed {
            return Ok(persona);
        }
        if let Some(swarm_id) = swarm_id {
            let swarm = quota.check_swarm(swarm_id, projected_cost).await?;
            if !swarm.allowed {
                return Ok(swarm);
            }
        }
        let global = quota.check_global(projected_cost).await?;
        if !global.allowed {
            return Ok(global);
        }
        Ok(QuotaDecision::allow())
    }

    /// Like [`validate_quota`](Self::validate_quota) but a denial surfaces
    /// as [`CortexError::QuotaExceeded`].
    pub async fn ensure_quota(
        &self,
        agent_id: &str,
        swarm_id: Option<&str>,
        estimated_tokens: Option<i64>,
    ) -> CortexResult<()> {
        let decision = self
            .validate_quota(agent_id, swarm_id, estimated_tokens)
            .await?;
        if decision.allowed {
            Ok(())
        } else {
            Err(CortexError::QuotaExceeded {
                policy: format!("quota:{agent_id}"),
                reason: decision
                    .reason
                    .unwrap_or_else(|| "quota check failed".to_string()),
            })
        }
    }

    /// Total recorded cost for one session.
    pub async fn get_session_total_cost(&self, session_id: SessionId) -> CortexResult<f64> {
        let table = self.db.tables().resource_usage.clone();
        self.db
            .with_conn(move |conn| {
                let total: f64 = conn.query_row(
                    &format!(
                        "SELECT COALESCE(SUM(cost), 0) FROM {table} WHERE session_id = ?1"
                    ),
                    rusqlite::params![session_id.to_string()],
                    |row| row.get(0),
                )?;
                Ok(total)
            })
            .await
    }

    /// Total recorded cost across all sessions and agents.
    pub async fn get_global_total_cost(&self) -> CortexResult<f64> {
        let table = self.db.tables().resource_usage.clone();
        self.db
            .with_conn(move |conn| {
                let total: f64 = conn.query_row(
                    &format!("SELECT COALESCE(SUM(cost), 0) FROM {table}"),
                    [],
                    |row| row.get(0),
                )?;
                Ok(total)
            })
            .await
    }

    /// Per-model call counts, token totals, and cost, biggest spender
    /// first.
    pub async fn get_model_usage_stats(&self) -> CortexResult<Vec<ModelUsage>> {
        let table = self.db.tables().resource_usage.clone();
        self.db
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT model_name, COUNT(*), SUM(input_tokens), SUM(output_tokens),
                            SUM(cost) AS total_cost
                     FROM {table}
                     GROUP BY model_name
                     ORDER BY total_cost DESC, model_name ASC"
                ))?;
                let rows = stmt.query_map([], |row| {
                    Ok(ModelUsage {
                        model_name: row.get(0)?,
                        calls: row.get::<_, i64>(1)? as u64,
                        input_tokens: row.get(2)?,
                        output_tokens: row.get(3)?,
                        total_cost: row.get(4)?,
                    })
                })?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(row?);
                }
                Ok(out)
            })
            .await
    }

    /// Usage rows for a session, oldest first.
    pub async fn get_session_usage(
        &self,
        session_id: SessionId,
    ) -> CortexResult<Vec<ResourceUsage>> {
        let table = self.db.tables().resource_usage.clone();
        self.db
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {USAGE_COLS} FROM {table}
                     WHERE session_id = ?1 ORDER BY id ASC"
                ))?;
                let rows = stmt.query_map(rusqlite::params![session_id.to_string()], usage_row)?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(usage_from_raw(row?)?);
                }
                Ok(out)
            })
            .await
    }
}

// ── Row-mapping helpers ───────────────────────────────────────────────

type RawUsage = (
    i64,
    Option<String>,
    Option<String>,
    String,
    i64,
    i64,
    f64,
    String,
    String,
    String,
);

fn usage_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawUsage> {
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
        row.get(9)?,
    ))
}

fn usage_from_raw(raw: RawUsage) -> CortexResult<ResourceUsage> {
    let (id, session_id, agent_id, model_name, input_tokens, output_tokens, cost, currency, metadata, created_at) =
        raw;
    Ok(ResourceUsage {
        id: UsageId(id),
        session_id: session_id
            .map(|s| {
                s.parse()
                    .map_err(|e: uuid::Error| CortexError::Serialization(e.to_string()))
            })
            .transpose()?,
        agent_id,
        model_name,
        input_tokens,
        output_tokens,
        cost,
        currency,
        metadata: decode_metadata(&metadata)?,
        created_at: decode_ts(&created_at)?,
    })
}
