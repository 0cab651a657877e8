//! Per-table data-operation rules with a tiny condition language.
//!
//! A condition is one `KEY OP VALUE` expression with
//! `OP ∈ {==, !=, >, <, includes}`. Values coerce loosely (quotes stripped,
//! numbers and booleans recognized) and malformed expressions never match.

use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;

use crate::storage::{decode_metadata, decode_ts, encode_metadata, encode_ts, Database};
use crate::types::{
    CortexError, CortexResult, Metadata, Rule, RuleAction, RuleId, RuleOperation,
};

const RULE_COLS: &str =
    "id, table_name, operation, condition, action, priority, script, is_enabled, metadata, created_at";

/// Mask literal substituted into masked fields.
const MASK: &str = "*****";

/// Optional fields for [`RuleEngine::define_rule`].
#[derive(Debug, Clone, Default)]
pub struct RuleOptions {
    pub condition: Option<String>,
    pub priority: i64,
    pub script: Option<String>,
    pub metadata: Option<Metadata>,
}

/// Result of evaluating the active rules against one operation.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleDecision {
    pub action: RuleAction,
    pub rule_id: Option<RuleId>,
    pub reason: Option<String>,
}

impl RuleDecision {
    fn allow_by_default() -> Self {
        Self {
            action: RuleAction::Allow,
            rule_id: None,
            reason: None,
        }
    }
}

// ── Condition language ────────────────────────────────────────────────

/// Comparison operator of a parsed condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CondOp {
    Eq,
    Ne,
    Gt,
    Lt,
    Includes,
}

/// Right-hand value after loose coercion.
#[derive(Debug, Clone, PartialEq)]
enum CondValue {
    Number(f64),
    Bool(bool),
    Text(String),
}

/// A parsed `KEY OP VALUE` expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    key: String,
    op: CondOp,
    value: CondValue,
}

impl Condition {
    /// Parse a condition; `None` for anything that is not exactly three
    /// tokens with a known operator.
    pub fn parse(raw: &str) -> Option<Self> {
        let mut parts = raw.split_whitespace();
        let key = parts.next()?.to_string();
        let op = match parts.next()? {
            "==" => CondOp::Eq,
            "!=" => CondOp::Ne,
            ">" => CondOp::Gt,
            "<" => CondOp::Lt,
            "includes" => CondOp::Includes,
            _ => return None,
        };
        let rest: Vec<&str> = parts.collect();
        if rest.len() != 1 {
            return None;
        }
        Some(Self {
            key,
            op,
            value: coerce(rest[0]),
        })
    }

    /// Evaluate against a data row. Missing keys compare as JSON null.
    pub fn matches(&self, data: &Metadata) -> bool {
        let field = data.get(&self.key).unwrap_or(&Value::Null);
        match self.op {
            CondOp::Eq => loose_eq(field, &self.value),
            CondOp::Ne => !loose_eq(field, &self.value),
            CondOp::Gt => match (field_number(field), value_number(&self.value)) {
                (Some(a), Some(b)) => a > b,
                _ => false,
            },
            CondOp::Lt => match (field_number(field), value_number(&self.value)) {
                (Some(a), Some(b)) => a < b,
                _ => false,
            },
            CondOp::Includes => match field {
                Value::String(s) => s.contains(&value_text(&self.value)),
                Value::Array(items) => items.iter().any(|item| loose_eq(item, &self.value)),
                _ => false,
            },
        }
    }
}

/// Strip surrounding quotes, then try number, then boolean, else text.
fn coerce(token: &str) -> CondValue {
    let stripped = token
        .strip_prefix('\'')
        .and_then(|t| t.strip_suffix('\''))
        .or_else(|| token.strip_prefix('"').and_then(|t| t.strip_suffix('"')))
        .unwrap_or(token);
    if let Ok(number) = stripped.parse::<f64>() {
        return CondValue::Number(number);
    }
    match stripped {
        "true" => CondValue::Bool(true),
        "false" => CondValue::Bool(false),
        _ => CondValue::Text(stripped.to_string()),
    }
}

fn field_number(field: &Value) -> Option<f64> {
    match field {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(b) => Some(f64::from(*b)),
        _ => None,
    }
}

fn value_number(value: &CondValue) -> Option<f64> {
    match value {
        CondValue::Number(n) => Some(*n),
        CondValue::Bool(b) => Some(f64::from(*b)),
        CondValue::Text(s) => s.trim().parse().ok(),
    }
}

fn value_text(value: &CondValue) -> String {
    match value {
        CondValue::Number(n) => n.to_string(),
        CondValue::Bool(b) => b.to_string(),
        CondValue::Text(s) => s.clone(),
    }
}

/// Loose equality: numbers compare numerically across representations,
/// booleans coerce to 0/1 against anything non-boolean, strings compare
/// as text. Null never equals anything.
fn loose_eq(field: &Value, value: &CondValue) -> bool {
    match (field, value) {
        (Value::Null, _) => false,
        (Value::Bool(a), CondValue::Bool(b)) => a == b,
        (field, CondValue::Number(b)) => field_number(field) == Some(*b),
        (field, CondValue::Bool(b)) => field_number(field) == Some(f64::from(*b)),
        (Value::String(s), CondValue::Text(_)) => s == &value_text(value),
        (Value::Number(n), CondValue::Text(t)) => {
            t.trim().parse::<f64>().ok().and_then(|parsed| {
                n.as_f64().map(|own| own == parsed)
            }) == Some(true)
        }
        _ => false,
    }
}

// ── Engine ────────────────────────────────────────────────────────────

/// Defines and evaluates per-table data-operation rules.
pub struct RuleEngine {
    db: Arc<Database>,
}

impl RuleEngine {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Record a new enabled rule.
    pub async fn define_rule(
        &self,
        table_name: &str,
        operation: RuleOperation,
        action: RuleAction,
        options: RuleOptions,
    ) -> CortexResult<Rule> {
        let table = self.db.tables().rules.clone();
        let now = Utc::now();
        let rule = Rule {
            id: RuleId(0),
            table_name: table_name.to_string(),
            operation,
            condition: options.condition,
            action,
            priority: options.priority,
            script: options.script,
            is_enabled: true,
            metadata: options.metadata.unwrap_or_default(),
            created_at: now,
        };
        let row = rule.clone();
        let id = self
            .db
            .transaction(move |tx| {
                tx.execute(
                    &format!(
                        "INSERT INTO {table}
                         (table_name, operation, condition, action, priority, script,
                          is_enabled, metadata, created_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7, ?8)"
                    ),
                    rusqlite::params![
                        row.table_name,
                        row.operation.as_str(),
                        row.condition,
                        row.action.as_str(),
                        row.priority,
                        row.script,
                        encode_metadata(&row.metadata),
                        encode_ts(now),
                    ],
                )?;
                Ok(tx.last_insert_rowid())
            })
            .await?;
        Ok(Rule {
            id: RuleId(id),
            ..rule
        })
    }

    /// Enabled rules that apply to `(table_name, operation)`, including
    /// `all`-operation rules, highest priority first.
    pub async fn get_active_rules(
        &self,
        table_name: &str,
        operation: RuleOperation,
    ) -> CortexResult<Vec<Rule>> {
        let table = self.db.tables().rules.clone();
        let table_name = table_name.to_string();
        self.db
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {RULE_COLS} FROM {table}
                     WHERE table_name = ?1 AND is_enabled = 1
                       AND (operation = ?2 OR operation = 'all')
                     ORDER BY priority DESC, id ASC"
                ))?;
                let rows = stmt.query_map(
                    rusqlite::params![table_name, operation.as_str()],
                    rule_row,
                )?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(rule_from_raw(row?)?);
                }
                Ok(out)
            })
            .await
    }

    /// First matching rule wins; no match allows the operation.
    pub async fn evaluate_rules(
        &self,
        table_name: &str,
        operation: RuleOperation,
        data: &Metadata,
    ) -> CortexResult<RuleDecision> {
        let rules = self.get_active_rules(table_name, operation).await?;
        for rule in rules {
            let matched = match rule.condition.as_deref() {
                // Unconditional rules match every row.
                None => true,
                Some(raw) => Condition::parse(raw)
                    .map(|condition| condition.matches(data))
                    .unwrap_or(false),
            };
            if matched {
                return Ok(RuleDecision {
                    action: rule.action,
                    rule_id: Some(rule.id),
                    reason: Some(format!("Matched rule {} ({})", rule.id, rule.action)),
                });
            }
        }
        Ok(RuleDecision::allow_by_default())
    }

    /// Replace every field named in `rule.metadata.maskFields` with the
    /// mask literal; other fields pass through untouched.
    pub fn apply_masking(&self, data: &Metadata, rule: &Rule) -> Metadata {
        let Some(fields) = rule.metadata.get("maskFields").and_then(Value::as_array) else {
            return data.clone();
        };
        let mut masked = data.clone();
        for field in fields.iter().filter_map(Value::as_str) {
            if masked.contains_key(field) {
                masked.insert(field.to_string(), Value::from(MASK));
            }
        }
        masked
    }

    /// Fetch one rule by id.
    pub async fn get_rule(&self, id: RuleId) -> CortexResult<Option<Rule>> {
        let table = self.db.tables().rules.clone();
        self.db
            .with_conn(move |conn| {
                use rusqlite::OptionalExtension;
                let raw = conn
                    .query_row(
                        &format!("SELECT {RULE_COLS} FROM {table} WHERE id = ?1"),
                        rusqlite::params![id.0],
                        rule_row,
                    )
                    .optional()?;
                raw.map(rule_from_raw).transpose()
            })
            .await
    }

    /// Disable a rule without deleting its definition.
    pub async fn disable_rule(&self, id: RuleId) -> CortexResult<()> {
        let table = self.db.tables().rules.clone();
        self.db
            .with_conn(move |conn| {
                let changed = conn.execute(
                    &format!("UPDATE {table} SET is_enabled = 0 WHERE id = ?1"),
                    rusqlite::params![id.0],
                )?;
                if changed == 0 {
                    return Err(CortexError::not_found("rule", id));
                }
                Ok(())
            })
            .await
    }
}

// ── Row-mapping helpers ───────────────────────────────────────────────

type RawRule = (
    i64,
    String,
    String,
    Option<String>,
    String,
    i64,
    Option<String>,
    i64,
    String,
    String,
);

fn rule_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRule> {
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

fn rule_from_raw(raw: RawRule) -> CortexResult<Rule> {
    let (id, table_name, operation, condition, action, priority, script, is_enabled, metadata, created_at) =
        raw;
    Ok(Rule {
        id: RuleId(id),
        table_name,
        operation: operation.parse().map_err(CortexError::Serialization)?,
        condition,
        action: action.parse().map_err(CortexError::Serialization)?,
        priority,
        script,
        is_enabled: is_enabled != 0,
        metadata: decode_metadata(&metadata)?,
        created_at: decode_ts(&created_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TableNames;

    fn engine() -> RuleEngine {
        RuleEngine::new(Arc::new(
            Database::open_in_memory(TableNames::default()).unwrap(),
        ))
    }

    fn data(pairs: &[(&str, Value)]) -> Metadata {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn condition_parsing_and_coercion() {
        let c = Condition::parse("age > 18").unwrap();
        assert_eq!(c.value, CondValue::Number(18.0));

        let c = Condition::parse("name == 'alice'").unwrap();
        assert_eq!(c.value, CondValue::Text("alice".to_string()));

        let c = Condition::parse("active == true").unwrap();
        assert_eq!(c.value, CondValue::Bool(true));

        assert!(Condition::parse("age >").is_none());
        assert!(Condition::parse("age ~= 18").is_none());
        assert!(Condition::parse("a b c d").is_none());
    }

    #[test]
    fn loose_equality_crosses_representations() {
        let c = Condition::parse("age == 18").unwrap();
        assert!(c.matches(&data(&[("age", Value::from(18))])));
        assert!(c.matches(&data(&[("age", Value::from("18"))])));
        assert!(!c.matches(&data(&[("age", Value::from(19))])));
        // Missing key is null; null equals nothing.
        assert!(!c.matches(&data(&[])));

        let ne = Condition::parse("age != 18").unwrap();
        assert!(ne.matches(&data(&[])));
        assert!(ne.matches(&data(&[("age", Value::from(19))])));
    }

    #[test]
    fn ordering_is_numeric() {
        let c = Condition::parse("age > 18").unwrap();
        assert!(c.matches(&data(&[("age", Value::from(21))])));
        assert!(c.matches(&data(&[("age", Value::from("21"))])));
        assert!(!c.matches(&data(&[("age", Value::from(12))])));
        assert!(!c.matches(&data(&[("age", Value::from("twelve"))])));

        let lt = Condition::parse("score < 0.5").unwrap();
        assert!(lt.matches(&data(&[("score", Value::from(0.25))])));
    }

    #[test]
    fn includes_is_substring_or_membership() {
        let c = Condition::parse("email includes @internal").unwrap();
        assert!(c.matches(&data(&[("email", Value::from("a@internal.io"))])));
        assert!(!c.matches(&data(&[("email", Value::from("a@public.io"))])));

        let tags = Condition::parse("tags includes admin").unwrap();
        assert!(tags.matches(&data(&[(
            "tags",
            Value::from(vec!["user", "admin"])
        )])));
        assert!(!tags.matches(&data(&[("tags", Value::from(vec!["user"]))])));
    }

    #[tokio::test]
    async fn first_matching_rule_by_priority_wins() {
        // Spec scenario S6, plus a priority shadow.
        let rules = engine();
        let deny = rules
            .define_rule(
                "users",
                RuleOperation::Insert,
                RuleAction::Deny,
                RuleOptions {
                    condition: Some("age > 18".to_string()),
                    priority: 10,
                    ..RuleOptions::default()
                },
            )
            .await
            .unwrap();
        rules
            .define_rule(
                "users",
                RuleOperation::Insert,
                RuleAction::Audit,
                RuleOptions {
                    condition: Some("age > 18".to_string()),
                    priority: 1,
                    ..RuleOptions::default()
                },
            )
            .await
            .unwrap();

        let decision = rules
            .evaluate_rules("users", RuleOperation::Insert, &data(&[("age", Value::from(21))]))
            .await
            .unwrap();
        assert_eq!(decision.action, RuleAction::Deny);
        assert_eq!(decision.rule_id, Some(deny.id));
        assert_eq!(
            decision.reason.as_deref(),
            Some(format!("Matched rule {} (deny)", deny.id).as_str())
        );

        let pass = rules
            .evaluate_rules("users", RuleOperation::Insert, &data(&[("age", Value::from(12))]))
            .await
            .unwrap();
        assert_eq!(pass.action, RuleAction::Allow);
        assert!(pass.rule_id.is_none());
    }

    #[tokio::test]
    async fn all_operation_rules_apply_everywhere() {
        let rules = engine();
        rules
            .define_rule(
                "users",
                RuleOperation::All,
                RuleAction::Audit,
                RuleOptions::default(),
            )
            .await
            .unwrap();

        for op in [RuleOperation::Insert, RuleOperation::Update, RuleOperation::Delete] {
            let decision = rules.evaluate_rules("users", op, &data(&[])).await.unwrap();
            assert_eq!(decision.action, RuleAction::Audit);
        }
    }

    #[tokio::test]
    async fn malformed_conditions_never_match() {
        let rules = engine();
        rules
            .define_rule(
                "users",
                RuleOperation::Insert,
                RuleAction::Deny,
                RuleOptions {
                    condition: Some("not a valid expr at all".to_string()),
                    ..RuleOptions::default()
                },
            )
            .await
            .unwrap();
        let decision = rules
            .evaluate_rules("users", RuleOperation::Insert, &data(&[("age", Value::from(99))]))
            .await
            .unwrap();
        assert_eq!(decision.action, RuleAction::Allow);
    }

    #[tokio::test]
    async fn masking_replaces_only_listed_fields() {
        let rules = engine();
        let mut rule_metadata = Metadata::new();
        rule_metadata.insert(
            "maskFields".to_string(),
            Value::from(vec!["ssn", "email"]),
        );
        let rule = rules
            .define_rule(
                "users",
                RuleOperation::Insert,
                RuleAction::Mask,
                RuleOptions {
                    metadata: Some(rule_metadata),
                    ..RuleOptions::default()
                },
            )
            .await
            .unwrap();

        let original = data(&[
            ("name", Value::from("alice")),
            ("ssn", Value::from("123-45-6789")),
            ("email", Value::from("a@b.c")),
        ]);
        let masked = rules.apply_masking(&original, &rule);
        assert_eq!(masked.get("ssn"), Some(&Value::from("*****")));
        assert_eq!(masked.get("email"), Some(&Value::from("*****")));
        assert_eq!(masked.get("name"), Some(&Value::from("alice")));
    }

    #[tokio::test]
    async fn disabled_rules_are_skipped() {
        let rules = engine();
        let rule = rules
            .define_rule(
                "users",
                RuleOperation::Insert,
                RuleAction::Deny,
                RuleOptions::default(),
            )
            .await
            .unwrap();
        rules.disable_rule(rule.id).await.unwrap();

        let decision = rules
            .evaluate_rules("users", RuleOperation::Insert, &data(&[]))
            .await
            .unwrap();
        assert_eq!(decision.action, RuleAction::Allow);
    }
}
