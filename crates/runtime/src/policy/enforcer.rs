//! Threshold, pattern, budget, and privacy policy evaluation.

use chrono::{Duration, Local, TimeZone, Utc};
use regex::Regex;
use rusqlite::OptionalExtension;
use serde_json::Value;
use std::sync::Arc;

use crate::metrics::MetricStore;
use crate::storage::{decode_metadata, decode_ts, encode_metadata, encode_ts, Database};
use crate::types::{
    CortexError, CortexResult, Metadata, Policy, PolicyId, PolicyKind,
};

const POLICY_COLS: &str = "id, name, kind, definition, is_enabled, metadata, created_at, updated_at";

/// Outcome of one policy check.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyDecision {
    pub allowed: bool,
    pub reason: Option<String>,
}

impl PolicyDecision {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    fn deny(reason: String) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
        }
    }
}

/// Outcome of evaluating a whole context map.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextEvaluation {
    pub allowed: bool,
    pub violations: Vec<String>,
}

/// Defines and evaluates governance policies.
pub struct PolicyEnforcer {
    db: Arc<Database>,
    metrics: Arc<MetricStore>,
}

impl PolicyEnforcer {
    pub fn new(db: Arc<Database>, metrics: Arc<MetricStore>) -> Self {
        Self { db, metrics }
    }

    /// Create or update the policy named `name`.
    pub async fn define_policy(
        &self,
        name: &str,
        kind: PolicyKind,
        definition: Metadata,
        is_enabled: bool,
    ) -> CortexResult<Policy> {
        let table = self.db.tables().policies.clone();
        let now = Utc::now();
        let name = name.to_string();
        self.db
            .transaction(move |tx| {
                let existing = tx
                    .query_row(
                        &format!("SELECT {POLICY_COLS} FROM {table} WHERE name = ?1"),
                        rusqlite::params![name],
                        policy_row,
                    )
                    .optional()?;

                match existing {
                    Some(raw) => {
                        let mut policy = policy_from_raw(raw)?;
                        policy.kind = kind;
                        policy.definition = definition;
                        policy.is_enabled = is_enabled;
                        policy.updated_at = now;
                        tx.execute(
                            &format!(
                                "UPDATE {table}
                                 SET kind = ?1, definition = ?2, is_enabled = ?3, updated_at = ?4
                                 WHERE id = ?5"
                            ),
                            rusqlite::params![
                                policy.kind.as_str(),
                                encode_metadata(&policy.definition),
                                policy.is_enabled as i32,
                                encode_ts(now),
                                policy.id.0,
                            ],
                        )?;
                        Ok(policy)
                    }
                    None => {
                        tx.execute(
                            &format!(
                                "INSERT INTO {table}
                                 (name, kind, definition, is_enabled, metadata, created_at, updated_at)
                                 VALUES (?1, ?2, ?3, ?4, '{{}}', ?5, ?6)"
                            ),
                            rusqlite::params![
                                name,
                                kind.as_str(),
                                encode_metadata(&definition),
                                is_enabled as i32,
                                encode_ts(now),
                                encode_ts(now),
                            ],
                        )?;
                        Ok(Policy {
                            id: PolicyId(tx.last_insert_rowid()),
                            name,
                            kind,
                            definition,
                            is_enabled,
                            metadata: Metadata::new(),
                            created_at: now,
                            updated_at: now,
                        })
                    }
                }
            })
            .await
    }

    /// Fetch a policy by name.
    pub async fn get_policy(&self, name: &str) -> CortexResult<Option<Policy>> {
        let table = self.db.tables().policies.clone();
        let name = name.to_string();
        self.db
            .with_conn(move |conn| {
                let raw = conn
                    .query_row(
                        &format!("SELECT {POLICY_COLS} FROM {table} WHERE name = ?1"),
                        rusqlite::params![name],
                        policy_row,
                    )
                    .optional()?;
                raw.map(policy_from_raw).transpose()
            })
            .await
    }

    /// Check one value against the named policy. Absent or disabled
    /// policies allow everything.
    pub async fn check_policy(&self, name: &str, value: &Value) -> CortexResult<PolicyDecision> {
        let Some(policy) = self.get_policy(name).await? else {
            return Ok(PolicyDecision::allow());
        };
        if !policy.is_enabled {
            return Ok(PolicyDecision::allow());
        }
        self.evaluate(&policy, value).await
    }

    async fn evaluate(&self, policy: &Policy, value: &Value) -> CortexResult<PolicyDecision> {
        match &policy.kind {
            PolicyKind::Threshold => Ok(check_threshold(policy, value)),
            PolicyKind::Pattern => check_pattern(policy, value, definition_bool(policy, "mustMatch")),
            PolicyKind::Privacy => check_pattern(policy, value, false),
            PolicyKind::Budget => self.check_budget(policy, value).await,
            PolicyKind::Other(_) => Ok(PolicyDecision::allow()),
        }
    }

    async fn check_budget(&self, policy: &Policy, value: &Value) -> CortexResult<PolicyDecision> {
        let Some(metric_name) = policy.definition.get("metricName").and_then(Value::as_str)
        else {
            return Ok(PolicyDecision::allow());
        };
        let Some(limit) = policy.definition.get("limit").and_then(Value::as_f64) else {
            return Ok(PolicyDecision::allow());
        };
        let increment = numeric(value).unwrap_or(0.0);

        let since = match policy.definition.get("period").and_then(Value::as_str) {
            Some("daily") => Some(local_midnight()),
            Some("hourly") => Some(Utc::now() - Duration::seconds(3600)),
            _ => None,
        };
        let spent = self.metrics.sum_since(metric_name, since).await?;

        if spent + increment > limit {
            Ok(PolicyDecision::deny(format!(
                "Cumulative budget for '{metric_name}' exceeded ({spent} + {increment} / {limit})"
            )))
        } else {
            Ok(PolicyDecision::allow())
        }
    }

    /// Like [`check_policy`](Self::check_policy) but a denial surfaces as
    /// [`CortexError::QuotaExceeded`].
    pub async fn enforce_policy(&self, name: &str, value: &Value) -> CortexResult<()> {
        let decision = self.check_policy(name, value).await?;
        if decision.allowed {
            Ok(())
        } else {
            Err(CortexError::QuotaExceeded {
                policy: name.to_string(),
                reason: decision
                    .reason
                    .unwrap_or_else(|| "policy check failed".to_string()),
            })
        }
    }

    /// Check every policy whose name appears as a context key; privacy
    /// policies additionally screen `context.content`.
    pub async fn evaluate_context(&self, context: &Metadata) -> CortexResult<ContextEvaluation> {
        let policies = self.enabled_policies().await?;
        let mut violations = Vec::new();

        for policy in &policies {
            if let Some(value) = context.get(&policy.name) {
                let decision = self.evaluate(policy, value).await?;
                if !decision.allowed {
                    violations.push(decision.reason.unwrap_or_else(|| policy.name.clone()));
                }
            }
            if policy.kind == PolicyKind::Privacy {
                if let Some(content) = context.get("content") {
                    let decision = self.evaluate(policy, content).await?;
                    if !decision.allowed {
                        violations.push(decision.reason.unwrap_or_else(|| policy.name.clone()));
                    }
                }
            }
        }

        Ok(ContextEvaluation {
            allowed: violations.is_empty(),
            violations,
        })
    }

    async fn enabled_policies(&self) -> CortexResult<Vec<Policy>> {
        let table = self.db.tables().policies.clone();
        self.db
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {POLICY_COLS} FROM {table} WHERE is_enabled = 1 ORDER BY name ASC"
                ))?;
                let rows = stmt.query_map([], policy_row)?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(policy_from_raw(row?)?);
                }
                Ok(out)
            })
            .await
    }
}

fn definition_bool(policy: &Policy, key: &str) -> bool {
    policy
        .definition
        .get(key)
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn check_threshold(policy: &Policy, value: &Value) -> PolicyDecision {
    let Some(v) = numeric(value) else {
        return PolicyDecision::allow();
    };
    if let Some(min) = policy.definition.get("min").and_then(Value::as_f64) {
        if v < min {
            return PolicyDecision::deny(format!(
                "Value {v} below min {min} for policy '{}'",
                policy.name
            ));
        }
    }
    if let Some(max) = policy.definition.get("max").and_then(Value::as_f64) {
        if v > max {
            return PolicyDecision::deny(format!(
                "Value {v} exceeds max {max} for policy '{}'",
                policy.name
            ));
        }
    }
    PolicyDecision::allow()
}

fn check_pattern(
    policy: &Policy,
    value: &Value,
    must_match: bool,
) -> CortexResult<PolicyDecision> {
    let Some(pattern) = policy.definition.get("pattern").and_then(Value::as_str) else {
        return Ok(PolicyDecision::allow());
    };
    let text = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    let regex = Regex::new(&format!("(?i){pattern}"))
        .map_err(|e| CortexError::InvariantViolation(format!("policy pattern: {e}")))?;
    let matches = regex.is_match(&text);

    let decision = if must_match && !matches {
        PolicyDecision::deny(format!(
            "Value '{text}' does not match required pattern for policy '{}'",
            policy.name
        ))
    } else if !must_match && matches {
        PolicyDecision::deny(format!(
            "Value '{text}' matches forbidden pattern for policy '{}'",
            policy.name
        ))
    } else {
        PolicyDecision::allow()
    };
    Ok(decision)
}

/// Start of the current day in the host's local timezone, as UTC.
fn local_midnight() -> chrono::DateTime<Utc> {
    let today = Local::now().date_naive();
    let midnight = today.and_time(chrono::NaiveTime::MIN);
    match Local.from_local_datetime(&midnight) {
        chrono::LocalResult::Single(dt) | chrono::LocalResult::Ambiguous(dt, _) => {
            dt.with_timezone(&Utc)
        }
        chrono::LocalResult::None => Utc::now() - Duration::hours(24),
    }
}

// ── Row-mapping helpers ───────────────────────────────────────────────

type RawPolicy = (i64, String, String, String, i64, String, String, String);

fn policy_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawPolicy> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    ))
}

fn policy_from_raw(raw: RawPolicy) -> CortexResult<Policy> {
    let (id, name, kind, definition, is_enabled, metadata, created_at, updated_at) = raw;
    let kind = std::str::FromStr::from_str(&kind).unwrap_or(PolicyKind::Other(kind));
    Ok(Policy {
        id: PolicyId(id),
        name,
        kind,
        definition: decode_metadata(&definition)?,
        is_enabled: is_enabled != 0,
        metadata: decode_metadata(&metadata)?,
        created_at: decode_ts(&created_at)?,
        updated_at: decode_ts(&updated_at)?,
    })
}
