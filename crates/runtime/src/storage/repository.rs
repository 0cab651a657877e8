//! Table-bound repositories and the rule-enforcing write intercept.
//!
//! Arbitrary tables are reached through [`TableRepository`], a name-keyed
//! registry replaces ambient table-to-entity dispatch, and
//! [`CognitiveRepository`] filters every mutation through the rule engine
//! before it touches the underlying table.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::policy::rules::RuleEngine;
use crate::telemetry::{TelemetryKind, TelemetrySink, SYSTEM_SCOPE};
use crate::types::{CortexError, CortexResult, Metadata, RuleAction, RuleOperation};

use super::Database;

/// Row-level access to one table, with rows expressed as JSON objects.
#[async_trait]
pub trait TableRepository: Send + Sync {
    fn table_name(&self) -> &str;

    /// Insert a row; returns its id.
    async fn insert(&self, data: Metadata) -> CortexResult<i64>;

    /// Update columns of one row; returns the affected-row count.
    async fn update(&self, id: i64, data: Metadata) -> CortexResult<u64>;

    /// Delete one row; returns the affected-row count.
    async fn delete(&self, id: i64) -> CortexResult<u64>;

    /// Read one row.
    async fn get(&self, id: i64) -> CortexResult<Option<Metadata>>;
}

/// Generic SQLite-backed repository building its statements from the row
/// keys.
pub struct SqliteTableRepository {
    db: Arc<Database>,
    table: String,
}

impl SqliteTableRepository {
    pub fn new(db: Arc<Database>, table: impl Into<String>) -> Self {
        Self {
            db,
            table: table.into(),
        }
    }
}

fn check_identifier(name: &str) -> CortexResult<()> {
    let ok = !name.is_empty()
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.chars().next().unwrap_or('0').is_ascii_digit();
    if ok {
        Ok(())
    } else {
        Err(CortexError::InvariantViolation(format!(
            "invalid column name: {name:?}"
        )))
    }
}

fn bind_value(value: &Value) -> rusqlite::types::Value {
    match value {
        Value::Null => rusqlite::types::Value::Null,
        Value::Bool(b) => rusqlite::types::Value::Integer(i64::from(*b)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                rusqlite::types::Value::Integer(i)
            } else {
                rusqlite::types::Value::Real(n.as_f64().unwrap_or(0.0))
            }
        }
        Value::String(s) => rusqlite::types::Value::Text(s.clone()),
        other => rusqlite::types::Value::Text(other.to_string()),
    }
}

fn column_value(raw: rusqlite::types::ValueRef<'_>) -> Value {
    match raw {
        rusqlite::types::ValueRef::Null => Value::Null,
        rusqlite::types::ValueRef::Integer(i) => Value::from(i),
        rusqlite::types::ValueRef::Real(f) => Value::from(f),
        rusqlite::types::ValueRef::Text(t) => Value::from(String::from_utf8_lossy(t).to_string()),
        rusqlite::types::ValueRef::Blob(b) => Value::from(b.to_vec()),
    }
}

#[async_trait]
impl TableRepository for SqliteTableRepository {
    fn table_name(&self) -> &str {
        &self.table
    }

    async fn insert(&self, data: Metadata) -> CortexResult<i64> {
        if data.is_empty() {
            return Err(CortexError::InvariantViolation(
                "cannot insert an empty row".to_string(),
            ));
        }
        let table = self.table.clone();
        self.db
            .with_conn(move |conn| {
                let mut columns = Vec::with_capacity(data.len());
                let mut placeholders = Vec::with_capacity(data.len());
                let mut values: Vec<rusqlite::types::Value> = Vec::with_capacity(data.len());
                for (index, (key, value)) in data.iter().enumerate() {
                    check_identifier(key)?;
                    columns.push(key.as_str());
                    placeholders.push(format!("?{}", index + 1));
                    values.push(bind_value(value));
                }
                conn.execute(
                    &format!(
                        "INSERT INTO {table} ({}) VALUES ({})",
                        columns.join(", "),
                        placeholders.join(", ")
                    ),
                    rusqlite::params_from_iter(values),
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await
    }

    async fn update(&self, id: i64, data: Metadata) -> CortexResult<u64> {
        if data.is_empty() {
            return Ok(0);
        }
        let table = self.table.clone();
        self.db
            .with_conn(move |conn| {
                let mut assignments = Vec::with_capacity(data.len());
                let mut values: Vec<rusqlite::types::Value> = Vec::with_capacity(data.len() + 1);
                for (index, (key, value)) in data.iter().enumerate() {
                    check_identifier(key)?;
                    assignments.push(format!("{key} = ?{}", index + 1));
                    values.push(bind_value(value));
                }
                values.push(rusqlite::types::Value::Integer(id));
                let changed = conn.execute(
                    &format!(
                        "UPDATE {table} SET {} WHERE id = ?{}",
                        assignments.join(", "),
                        data.len() + 1
                    ),
                    rusqlite::params_from_iter(values),
                )?;
                Ok(changed as u64)
            })
            .await
    }

    async fn delete(&self, id: i64) -> CortexResult<u64> {
        let table = self.table.clone();
        self.db
            .with_conn(move |conn| {
                let changed = conn.execute(
                    &format!("DELETE FROM {table} WHERE id = ?1"),
                    rusqlite::params![id],
                )?;
                Ok(changed as u64)
            })
            .await
    }

    async fn get(&self, id: i64) -> CortexResult<Option<Metadata>> {
        let table = self.table.clone();
        self.db
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(&format!("SELECT * FROM {table} WHERE id = ?1"))?;
                let names: Vec<String> =
                    stmt.column_names().iter().map(|n| n.to_string()).collect();
                let mut rows = stmt.query(rusqlite::params![id])?;
                match rows.next()? {
                    Some(row) => {
                        let mut out = Metadata::new();
                        for (index, name) in names.iter().enumerate() {
                            out.insert(name.clone(), column_value(row.get_ref(index)?));
                        }
                        Ok(Some(out))
                    }
                    None => Ok(None),
                }
            })
            .await
    }
}

/// Name-keyed registry mapping tables to their repositories.
#[derive(Default)]
pub struct RepositoryRegistry {
    repositories: HashMap<String, Arc<dyn TableRepository>>,
}

impl RepositoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, repository: Arc<dyn TableRepository>) {
        self.repositories
            .insert(repository.table_name().to_string(), repository);
    }

    pub fn get(&self, table_name: &str) -> Option<Arc<dyn TableRepository>> {
        self.repositories.get(table_name).cloned()
    }

    pub fn table_names(&self) -> Vec<&str> {
        self.repositories.keys().map(String::as_str).collect()
    }
}

/// Write intercept applying data-operation rules in front of a repository.
///
/// Reads pass through untouched. When the rules table is absent from the
/// schema, writes pass through as well.
pub struct CognitiveRepository {
    inner: Arc<dyn TableRepository>,
    rules: Arc<RuleEngine>,
    db: Arc<Database>,
    telemetry: Arc<dyn TelemetrySink>,
}

impl CognitiveRepository {
    pub fn new(
        inner: Arc<dyn TableRepository>,
        rules: Arc<RuleEngine>,
        db: Arc<Database>,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Self {
        Self {
            inner,
            rules,
            db,
            telemetry,
        }
    }

    async fn guard(&self, operation: RuleOperation, data: Metadata) -> CortexResult<Metadata> {
        let rules_table = self.db.tables().rules.clone();
        if !self.db.has_table(&rules_table).await? {
            return Ok(data);
        }

        let table = self.inner.table_name().to_string();
        let decision = self.rules.evaluate_rules(&table, operation, &data).await?;
        match decision.action {
            RuleAction::Allow => Ok(data),
            RuleAction::Deny => Err(CortexError::RuleDenied {
                operation: operation.as_str().to_string(),
                table,
                rule_id: decision.rule_id.map(|r| r.0).unwrap_or_default(),
                reason: decision
                    .reason
                    .unwrap_or_else(|| "denied by rule".to_string()),
            }),
            RuleAction::Audit => {
                let mut audit = Metadata::new();
                if let Some(rule_id) = decision.rule_id {
                    audit.insert("ruleId".to_string(), Value::from(rule_id.0));
                }
                audit.insert("table".to_string(), Value::from(table.clone()));
                audit.insert("operation".to_string(), Value::from(operation.as_str()));
                audit.insert("snapshot".to_string(), Value::Object(data.clone()));
                self.telemetry
                    .track(
                        SYSTEM_SCOPE,
                        TelemetryKind::Action,
                        &format!("audited {} on {}", operation, table),
                        Some(audit),
                    )
                    .await;
                Ok(data)
            }
            RuleAction::Mask => {
                let Some(rule_id) = decision.rule_id else {
                    return Ok(data);
                };
                match self.rules.get_rule(rule_id).await? {
                    Some(rule) => Ok(self.rules.apply_masking(&data, &rule)),
                    None => Ok(data),
                }
            }
        }
    }

    pub async fn insert(&self, data: Metadata) -> CortexResult<i64> {
        let data = self.guard(RuleOperation::Insert, data).await?;
        self.inner.insert(data).await
    }

    pub async fn update(&self, id: i64, data: Metadata) -> CortexResult<u64> {
        let data = self.guard(RuleOperation::Update, data).await?;
        self.inner.update(id, data).await
    }

    pub async fn delete(&self, id: i64) -> CortexResult<u64> {
        // Rules still see the operation; delete carries no row data.
        self.guard(RuleOperation::Delete, Metadata::new()).await?;
        self.inner.delete(id).await
    }

    pub async fn get(&self, id: i64) -> CortexResult<Option<Metadata>> {
        self.inner.get(id).await
    }

    pub fn table_name(&self) -> &str {
        self.inner.table_name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TableNames;
    use crate::policy::rules::RuleOptions;
    use crate::telemetry::test_support::RecordingTelemetry;
    use crate::telemetry::NullTelemetry;

    fn setup() -> (Arc<Database>, Arc<RuleEngine>) {
        let db = Arc::new(Database::open_in_memory(TableNames::default()).unwrap());
        let rules = Arc::new(RuleEngine::new(db.clone()));
        (db, rules)
    }

    fn knowledge_row(entity: &str, confidence: f64) -> Metadata {
        let mut data = Metadata::new();
        data.insert("entity".to_string(), Value::from(entity));
        data.insert("fact".to_string(), Value::from("something"));
        data.insert("confidence".to_string(), Value::from(confidence));
        data.insert("tags".to_string(), Value::from("[]"));
        data.insert(
            "created_at".to_string(),
            Value::from("2026-01-01T00:00:00Z"),
        );
        data
    }

    #[tokio::test]
    async fn dynamic_repository_round_trips_rows() {
        let (db, _) = setup();
        let repo = SqliteTableRepository::new(db.clone(), db.tables().knowledge_base.clone());

        let id = repo.insert(knowledge_row("redis", 0.4)).await.unwrap();
        let row = repo.get(id).await.unwrap().unwrap();
        assert_eq!(row.get("entity"), Some(&Value::from("redis")));
        assert_eq!(row.get("confidence"), Some(&Value::from(0.4)));

        let mut patch = Metadata::new();
        patch.insert("confidence".to_string(), Value::from(0.9));
        assert_eq!(repo.update(id, patch).await.unwrap(), 1);

        assert_eq!(repo.delete(id).await.unwrap(), 1);
        assert!(repo.get(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn hostile_column_names_are_rejected() {
        let (db, _) = setup();
        let repo = SqliteTableRepository::new(db.clone(), db.tables().knowledge_base.clone());
        let mut data = Metadata::new();
        data.insert("entity; DROP TABLE x".to_string(), Value::from("oops"));
        assert!(matches!(
            repo.insert(data).await,
            Err(CortexError::InvariantViolation(_))
        ));
    }

    #[tokio::test]
    async fn registry_resolves_by_table_name() {
        let (db, _) = setup();
        let mut registry = RepositoryRegistry::new();
        registry.register(Arc::new(SqliteTableRepository::new(
            db.clone(),
            db.tables().knowledge_base.clone(),
        )));
        assert!(registry.get(&db.tables().knowledge_base).is_some());
        assert!(registry.get("unknown_table").is_none());
    }

    #[tokio::test]
    async fn deny_rule_blocks_the_write() {
        let (db, rules) = setup();
        let table = db.tables().knowledge_base.clone();
        rules
            .define_rule(
                &table,
                RuleOperation::Insert,
                RuleAction::Deny,
                RuleOptions {
                    condition: Some("confidence < 0.2".to_string()),
                    ..RuleOptions::default()
                },
            )
            .await
            .unwrap();

        let repo = CognitiveRepository::new(
            Arc::new(SqliteTableRepository::new(db.clone(), table)),
            rules,
            db.clone(),
            Arc::new(NullTelemetry),
        );

        let err = repo.insert(knowledge_row("junk", 0.1)).await.unwrap_err();
        assert!(matches!(err, CortexError::RuleDenied { .. }));

        // Rows above the bar still insert.
        assert!(repo.insert(knowledge_row("solid", 0.8)).await.is_ok());
    }

    #[tokio::test]
    async fn audit_rule_records_and_continues() {
        let (db, rules) = setup();
        let table = db.tables().knowledge_base.clone();
        rules
            .define_rule(&table, RuleOperation::Insert, RuleAction::Audit, RuleOptions::default())
            .await
            .unwrap();

        let telemetry = Arc::new(RecordingTelemetry::default());
        let repo = CognitiveRepository::new(
            Arc::new(SqliteTableRepository::new(db.clone(), table)),
            rules,
            db.clone(),
            telemetry.clone(),
        );

        let id = repo.insert(knowledge_row("tracked", 0.5)).await.unwrap();
        assert!(repo.get(id).await.unwrap().is_some());
        assert_eq!(telemetry.kinds(), vec![TelemetryKind::Action]);
    }

    #[tokio::test]
    async fn mask_rule_rewrites_fields_before_insert() {
        let (db, rules) = setup();
        let table = db.tables().knowledge_base.clone();
        let mut rule_metadata = Metadata::new();
        rule_metadata.insert("maskFields".to_string(), Value::from(vec!["fact"]));
        rules
            .define_rule(
                &table,
                RuleOperation::Insert,
                RuleAction::Mask,
                RuleOptions {
                    metadata: Some(rule_metadata),
                    ..RuleOptions::default()
                },
            )
            .await
            .unwrap();

        let repo = CognitiveRepository::new(
            Arc::new(SqliteTableRepository::new(db.clone(), table)),
            rules,
            db.clone(),
            Arc::new(NullTelemetry),
        );

        let id = repo.insert(knowledge_row("secret", 0.5)).await.unwrap();
        let row = repo.get(id).await.unwrap().unwrap();
        assert_eq!(row.get("fact"), Some(&Value::from("*****")));
        assert_eq!(row.get("entity"), Some(&Value::from("secret")));
    }
}
