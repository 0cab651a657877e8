//! Shared SQLite-backed storage handle.
//!
//! One connection behind a [`tokio::sync::Mutex`] in WAL mode. The single
//! writer plus `IMMEDIATE` transactions gives every read-modify-write path
//! the no-lost-update guarantees the substrate requires; subsystems never
//! retry silently.

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

use crate::config::TableNames;
use crate::types::{CortexError, CortexResult, Metadata};

pub mod repository;

/// Shared database handle. Cheap to clone behind an `Arc`.
pub struct Database {
    conn: Mutex<Connection>,
    tables: TableNames,
}

impl Database {
    /// Open (or create) the store at the given path.
    pub fn open(path: &Path, tables: TableNames) -> CortexResult<Self> {
        validate_table_names(&tables)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| CortexError::Backend(format!("create dir: {e}")))?;
        }
        let conn = Connection::open(path)?;

        // WAL mode for concurrent readers.
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        Self::init_schema(&conn, &tables)?;

        Ok(Self {
            conn: Mutex::new(conn),
            tables,
        })
    }

    /// Open an in-memory store (useful for tests).
    pub fn open_in_memory(tables: TableNames) -> CortexResult<Self> {
        validate_table_names(&tables)?;
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn, &tables)?;
        Ok(Self {
            conn: Mutex::new(conn),
            tables,
        })
    }

    /// Default database path: `$XDG_DATA_HOME/cortex/cortex.db`
    pub fn default_path() -> PathBuf {
        let base = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
        base.join("cortex").join("cortex.db")
    }

    /// Configured table names.
    pub fn tables(&self) -> &TableNames {
        &self.tables
    }

    /// Run a read or single-statement write against the connection.
    pub async fn with_conn<T, F>(&self, f: F) -> CortexResult<T>
    where
        F: FnOnce(&Connection) -> CortexResult<T>,
    {
        let conn = self.conn.lock().await;
        f(&conn)
    }

    /// Run `f` inside an `IMMEDIATE` transaction; commit on `Ok`, roll back
    /// on `Err`.
    pub async fn transaction<T, F>(&self, f: F) -> CortexResult<T>
    where
        F: FnOnce(&rusqlite::Transaction<'_>) -> CortexResult<T>,
    {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    /// Whether a table exists in the schema. Used by the cognitive
    /// repository to decide whether rule evaluation applies at all.
    pub async fn has_table(&self, name: &str) -> CortexResult<bool> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                rusqlite::params![name],
                |row| row.get(0),
            )?;
            Ok(count > 0)
        })
        .await
    }

    fn init_schema(conn: &Connection, t: &TableNames) -> CortexResult<()> {
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY
            );

            INSERT OR IGNORE INTO schema_version (version) VALUES (1);

            CREATE TABLE IF NOT EXISTS {sessions} (
                id         TEXT PRIMARY KEY,
                name       TEXT,
                status     TEXT NOT NULL DEFAULT 'active',
                metadata   TEXT NOT NULL DEFAULT '{{}}',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS {messages} (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                role       TEXT NOT NULL,
                content    TEXT NOT NULL,
                metadata   TEXT NOT NULL DEFAULT '{{}}',
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_{messages}_session
                ON {messages}(session_id, created_at);

            CREATE TABLE IF NOT EXISTS {goals} (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id  TEXT NOT NULL,
                parent_id   INTEGER,
                description TEXT NOT NULL,
                status      TEXT NOT NULL DEFAULT 'pending',
                priority    INTEGER NOT NULL DEFAULT 0,
                metadata    TEXT NOT NULL DEFAULT '{{}}',
                created_at  TEXT NOT NULL,
                updated_at  TEXT NOT NULL,
                UNIQUE(session_id, description)
            );

            CREATE TABLE IF NOT EXISTS {memories} (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT,
                content    TEXT NOT NULL,
                embedding  TEXT NOT NULL,
                metadata   TEXT NOT NULL DEFAULT '{{}}',
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_{memories}_session
                ON {memories}(session_id, created_at);

            CREATE TABLE IF NOT EXISTS {episodes} (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                name       TEXT NOT NULL,
                summary    TEXT,
                status     TEXT NOT NULL DEFAULT 'active',
                start_time TEXT NOT NULL,
                end_time   TEXT,
                metadata   TEXT NOT NULL DEFAULT '{{}}'
            );
            CREATE INDEX IF NOT EXISTS idx_{episodes}_session
                ON {episodes}(session_id, start_time);

            CREATE TABLE IF NOT EXISTS {epochs} (
                id               INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id       TEXT NOT NULL,
                summary          TEXT NOT NULL,
                start_message_id INTEGER NOT NULL,
                end_message_id   INTEGER NOT NULL,
                metadata         TEXT NOT NULL DEFAULT '{{}}',
                created_at       TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_{epochs}_session
                ON {epochs}(session_id, created_at);

            CREATE TABLE IF NOT EXISTS {actions} (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id  TEXT NOT NULL,
                message_id  INTEGER,
                tool_name   TEXT NOT NULL,
                arguments   TEXT NOT NULL DEFAULT '{{}}',
                status      TEXT NOT NULL DEFAULT 'pending',
                outcome     TEXT,
                duration_ms INTEGER,
                metadata    TEXT NOT NULL DEFAULT '{{}}',
                created_at  TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_{actions}_session ON {actions}(session_id, id);
            CREATE INDEX IF NOT EXISTS idx_{actions}_tool ON {actions}(tool_name, created_at);
            CREATE INDEX IF NOT EXISTS idx_{actions}_status ON {actions}(status, created_at);

            CREATE TABLE IF NOT EXISTS {resource_usage} (
                id            INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id    TEXT,
                agent_id      TEXT,
                model_name    TEXT NOT NULL,
                input_tokens  INTEGER NOT NULL DEFAULT 0,
                output_tokens INTEGER NOT NULL DEFAULT 0,
                cost          REAL NOT NULL DEFAULT 0,
                currency      TEXT NOT NULL DEFAULT 'USD',
                metadata      TEXT NOT NULL DEFAULT '{{}}',
                created_at    TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_{resource_usage}_session
                ON {resource_usage}(session_id);
            CREATE INDEX IF NOT EXISTS idx_{resource_usage}_model
                ON {resource_usage}(model_name);

            CREATE TABLE IF NOT EXISTS {capabilities} (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                name        TEXT NOT NULL,
                version     TEXT NOT NULL,
                description TEXT,
                status      TEXT NOT NULL DEFAULT 'experimental',
                reliability REAL NOT NULL DEFAULT 1.0,
                metadata    TEXT NOT NULL DEFAULT '{{}}',
                created_at  TEXT NOT NULL,
                updated_at  TEXT NOT NULL,
                UNIQUE(name, version)
            );

            CREATE TABLE IF NOT EXISTS {policies} (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                name       TEXT NOT NULL UNIQUE,
                kind       TEXT NOT NULL,
                definition TEXT NOT NULL DEFAULT '{{}}',
                is_enabled INTEGER NOT NULL DEFAULT 1,
                metadata   TEXT NOT NULL DEFAULT '{{}}',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS {rules} (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                table_name TEXT NOT NULL,
                operation  TEXT NOT NULL,
                condition  TEXT,
                action     TEXT NOT NULL,
                priority   INTEGER NOT NULL DEFAULT 0,
                script     TEXT,
                is_enabled INTEGER NOT NULL DEFAULT 1,
                metadata   TEXT NOT NULL DEFAULT '{{}}',
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_{rules}_table ON {rules}(table_name, operation);

            CREATE TABLE IF NOT EXISTS {metrics} (
                id           INTEGER PRIMARY KEY AUTOINCREMENT,
                metric_name  TEXT NOT NULL,
                metric_value REAL NOT NULL,
                created_at   TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_{metrics}_name ON {metrics}(metric_name, created_at);

            CREATE TABLE IF NOT EXISTS {knowledge_base} (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                entity     TEXT NOT NULL,
                fact       TEXT NOT NULL,
                confidence REAL NOT NULL DEFAULT 0.5,
                tags       TEXT NOT NULL DEFAULT '[]',
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_{knowledge_base}_entity
                ON {knowledge_base}(entity);",
            sessions = t.sessions,
            messages = t.messages,
            goals = t.goals,
            memories = t.memories,
            episodes = t.episodes,
            epochs = t.epochs,
            actions = t.actions,
            resource_usage = t.resource_usage,
            capabilities = t.capabilities,
            policies = t.policies,
            rules = t.rules,
            metrics = t.metrics,
            knowledge_base = t.knowledge_base,
        );
        conn.execute_batch(&ddl)?;
        Ok(())
    }
}

/// Table names are interpolated into DDL/queries; restrict them to
/// identifier characters so overrides cannot smuggle SQL.
fn validate_table_names(tables: &TableNames) -> CortexResult<()> {
    let all = [
        &tables.sessions,
        &tables.messages,
        &tables.goals,
        &tables.memories,
        &tables.episodes,
        &tables.epochs,
        &tables.actions,
        &tables.resource_usage,
        &tables.capabilities,
        &tables.policies,
        &tables.rules,
        &tables.metrics,
        &tables.knowledge_base,
    ];
    for name in all {
        let ok = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
            && !name.chars().next().unwrap_or('0').is_ascii_digit();
        if !ok {
            return Err(CortexError::InvariantViolation(format!(
                "invalid table name: {name:?}"
            )));
        }
    }
    Ok(())
}

// ── Column codec helpers ──────────────────────────────────────────────

/// Encode a timestamp for a TEXT column. RFC 3339 in UTC sorts
/// lexicographically, which the windowed queries rely on.
pub(crate) fn encode_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

/// Decode a timestamp from a TEXT column.
pub(crate) fn decode_ts(raw: &str) -> CortexResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| CortexError::Serialization(format!("timestamp {raw:?}: {e}")))
}

/// Encode metadata for a TEXT column.
pub(crate) fn encode_metadata(metadata: &Metadata) -> String {
    serde_json::Value::Object(metadata.clone()).to_string()
}

/// Decode metadata from a TEXT column; anything but a JSON object is a
/// malformed row.
pub(crate) fn decode_metadata(raw: &str) -> CortexResult<Metadata> {
    match serde_json::from_str(raw)? {
        serde_json::Value::Object(map) => Ok(map),
        other => Err(CortexError::Serialization(format!(
            "metadata column holds non-object JSON: {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn schema_creates_all_configured_tables() {
        let tables = TableNames::default();
        let db = Database::open_in_memory(tables.clone()).unwrap();
        for name in [
            tables.sessions.as_str(),
            tables.messages.as_str(),
            tables.goals.as_str(),
            tables.memories.as_str(),
            tables.episodes.as_str(),
            tables.epochs.as_str(),
            tables.actions.as_str(),
            tables.resource_usage.as_str(),
            tables.capabilities.as_str(),
            tables.policies.as_str(),
            tables.rules.as_str(),
            tables.metrics.as_str(),
            tables.knowledge_base.as_str(),
        ] {
            assert!(db.has_table(name).await.unwrap(), "missing table {name}");
        }
        assert!(!db.has_table("agent_nonexistent").await.unwrap());
    }

    #[tokio::test]
    async fn custom_table_names_are_honored() {
        let tables = TableNames {
            sessions: "my_sessions".to_string(),
            ..TableNames::default()
        };
        let db = Database::open_in_memory(tables).unwrap();
        assert!(db.has_table("my_sessions").await.unwrap());
        assert!(!db.has_table("agent_sessions").await.unwrap());
    }

    #[test]
    fn hostile_table_names_are_rejected() {
        let tables = TableNames {
            sessions: "x; DROP TABLE y".to_string(),
            ..TableNames::default()
        };
        assert!(matches!(
            Database::open_in_memory(tables),
            Err(CortexError::InvariantViolation(_))
        ));
    }

    #[tokio::test]
    async fn transaction_rolls_back_on_error() {
        let db = Database::open_in_memory(TableNames::default()).unwrap();
        let result: CortexResult<()> = db
            .transaction(|tx| {
                tx.execute(
                    "INSERT INTO agent_metrics (metric_name, metric_value, created_at)
                     VALUES ('x', 1.0, '2026-01-01T00:00:00Z')",
                    [],
                )?;
                Err(CortexError::Conflict("forced".to_string()))
            })
            .await;
        assert!(result.is_err());

        let count = db
            .with_conn(|conn| {
                let n: i64 =
                    conn.query_row("SELECT COUNT(*) FROM agent_metrics", [], |r| r.get(0))?;
                Ok(n)
            })
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn timestamp_codec_round_trips_and_sorts() {
        let early = Utc::now();
        let late = early + chrono::Duration::milliseconds(5);
        let (a, b) = (encode_ts(early), encode_ts(late));
        assert!(a < b, "encoded timestamps must sort lexicographically");
        assert_eq!(decode_ts(&a).unwrap(), decode_ts(&a).unwrap());
    }

    #[test]
    fn metadata_codec_rejects_non_objects() {
        assert!(decode_metadata("[1,2]").is_err());
        let mut m = Metadata::new();
        m.insert("anchor".to_string(), serde_json::Value::Bool(true));
        let encoded = encode_metadata(&m);
        assert_eq!(encoded, r#"{"anchor":true}"#);
        assert_eq!(decode_metadata(&encoded).unwrap(), m);
    }
}
