//! Tool-call journaling with bounded reads and failure reporting.

use chrono::{Duration, Utc};
use rusqlite::OptionalExtension;
use std::sync::Arc;

use crate::storage::{decode_metadata, decode_ts, encode_metadata, encode_ts, Database};
use crate::telemetry::{TelemetryKind, TelemetrySink};
use crate::types::{
    merge_metadata, ActionId, ActionRecord, ActionStatus, CortexError, CortexResult, MessageId,
    Metadata, SessionId,
};

const ACTION_COLS: &str =
    "id, session_id, message_id, tool_name, arguments, status, outcome, duration_ms, metadata, created_at";

/// Failure-report window.
const FAILURE_WINDOW_DAYS: i64 = 7;

/// Cursor-based pagination for [`ActionJournal::get_session_actions`].
#[derive(Debug, Clone, Copy)]
pub struct ActionQuery {
    pub limit: usize,
    pub cursor: Option<ActionId>,
}

impl Default for ActionQuery {
    fn default() -> Self {
        Self {
            limit: 100,
            cursor: None,
        }
    }
}

/// One page of a session's actions plus the cursor that resumes after it.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionPage {
    pub actions: Vec<ActionRecord>,
    pub next_cursor: Option<ActionId>,
}

/// One row of the windowed failure report.
#[derive(Debug, Clone, PartialEq)]
pub struct FailureReport {
    pub tool_name: String,
    pub failure_count: u64,
    pub last_failure: chrono::DateTime<Utc>,
}

/// Records tool calls and their outcomes.
pub struct ActionJournal {
    db: Arc<Database>,
    telemetry: Arc<dyn TelemetrySink>,
}

impl ActionJournal {
    pub fn new(db: Arc<Database>, telemetry: Arc<dyn TelemetrySink>) -> Self {
        Self { db, telemetry }
    }

    /// Record a pending tool call.
    pub async fn log_action(
        &self,
        session_id: SessionId,
        tool_name: &str,
        arguments: Metadata,
        message_id: Option<MessageId>,
    ) -> CortexResult<ActionRecord> {
        let table = self.db.tables().actions.clone();
        let now = Utc::now();
        let record = ActionRecord {
            id: ActionId(0),
            session_id,
            message_id,
            tool_name: tool_name.to_string(),
            arguments,
            status: ActionStatus::Pending,
            outcome: None,
            duration_ms: None,
            metadata: Metadata::new(),
            created_at: now,
        };
        let row = record.clone();
        let id = self
            .db
            .with_conn(move |conn| {
                conn.execute(
                    &format!(
                        "INSERT INTO {table}
                         (session_id, message_id, tool_name, arguments, status, metadata, created_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"
                    ),
                    rusqlite::params![
                        row.session_id.to_string(),
                        row.message_id.map(|m| m.0),
                        row.tool_name,
                        encode_metadata(&row.arguments),
                        row.status.as_str(),
                        encode_metadata(&row.metadata),
                        encode_ts(now),
                    ],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await?;

        self.telemetry
            .track(
                &session_id.to_string(),
                TelemetryKind::Action,
                &format!("tool call: {tool_name}"),
                None,
            )
            .await;

        Ok(ActionRecord {
            id: ActionId(id),
            ..record
        })
    }

    /// Resolve a pending action exactly once.
    pub async fn record_outcome(
        &self,
        action_id: ActionId,
        status: ActionStatus,
        outcome: &str,
        duration_ms: Option<i64>,
        metadata: Option<Metadata>,
    ) -> CortexResult<ActionRecord> {
        if status == ActionStatus::Pending {
            return Err(CortexError::InvariantViolation(
                "an outcome must be success or failure".to_string(),
            ));
        }
        let table = self.db.tables().actions.clone();
        let outcome = outcome.to_string();
        let record = self
            .db
            .transaction(move |tx| {
                let raw = tx
                    .query_row(
                        &format!("SELECT {ACTION_COLS} FROM {table} WHERE id = ?1"),
                        rusqlite::params![action_id.0],
                        action_row,
                    )
                    .optional()?
                    .ok_or_else(|| CortexError::not_found("action", action_id))?;
                let mut record = action_from_raw(raw)?;

                if record.status != ActionStatus::Pending {
                    return Err(CortexError::Conflict(format!(
                        "action {action_id} already resolved as {}",
                        record.status
                    )));
                }

                record.status = status;
                record.outcome = Some(outcome.clone());
                record.duration_ms = duration_ms;
                if let Some(patch) = metadata {
                    merge_metadata(&mut record.metadata, patch);
                }

                tx.execute(
                    &format!(
                        "UPDATE {table}
                         SET status = ?1, outcome = ?2, duration_ms = ?3, metadata = ?4
                         WHERE id = ?5"
                    ),
                    rusqlite::params![
                        record.status.as_str(),
                        record.outcome,
                        record.duration_ms,
                        encode_metadata(&record.metadata),
                        action_id.0,
                    ],
                )?;
                Ok(record)
            })
            .await?;

        if status == ActionStatus::Failure {
            self.telemetry
                .track(
                    &record.session_id.to_string(),
                    TelemetryKind::Error,
                    &format!("tool {} failed: {}", record.tool_name, outcome_snippet(&record)),
                    None,
                )
                .await;
        }
        Ok(record)
    }

    /// Actions of a session in id order; `cursor` resumes after a
    /// previously seen id.
    pub async fn get_session_actions(
        &self,
        session_id: SessionId,
        query: ActionQuery,
    ) -> CortexResult<Vec<ActionRecord>> {
        let table = self.db.tables().actions.clone();
        self.db
            .with_conn(move |conn| {
                let cursor = query.cursor.map(|c| c.0).unwrap_or(i64::MIN);
                let mut stmt = conn.prepare(&format!(
                    "SELECT {ACTION_COLS} FROM {table}
                     WHERE session_id = ?1 AND id > ?2
                     ORDER BY id ASC
                     LIMIT ?3"
                ))?;
                let rows = stmt.query_map(
                    rusqlite::params![session_id.to_string(), cursor, query.limit as i64],
                    action_row,
                )?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(action_from_raw(row?)?);
                }
                Ok(out)
            })
            .await
    }

    /// Cursor-paginated convenience over
    /// [`get_session_actions`](Self::get_session_actions): the returned
    /// `next_cursor` resumes after the last row of this page, and is
    /// `None` once the page comes back short of `limit`.
    pub async fn get_session_action_page(
        &self,
        session_id: SessionId,
        query: ActionQuery,
    ) -> CortexResult<ActionPage> {
        let actions = self.get_session_actions(session_id, query).await?;
        let next_cursor = if actions.len() < query.limit {
            None
        } else {
            actions.last().map(|a| a.id)
        };
        Ok(ActionPage {
            actions,
            next_cursor,
        })
    }

    /// Latest actions for one tool across sessions.
    pub async fn get_actions_by_tool(
        &self,
        tool_name: &str,
        limit: usize,
    ) -> CortexResult<Vec<ActionRecord>> {
        let table = self.db.tables().actions.clone();
        let tool_name = tool_name.to_string();
        self.db
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {ACTION_COLS} FROM {table}
                     WHERE tool_name = ?1
                     ORDER BY created_at DESC, id DESC
                     LIMIT ?2"
                ))?;
                let rows =
                    stmt.query_map(rusqlite::params![tool_name, limit as i64], action_row)?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(action_from_raw(row?)?);
                }
                Ok(out)
            })
            .await
    }

    /// Failures of the last seven days grouped by tool, most failing
    /// first.
    pub async fn get_failure_report(&self) -> CortexResult<Vec<FailureReport>> {
        let table = self.db.tables().actions.clone();
        let since = Utc::now() - Duration::days(FAILURE_WINDOW_DAYS);
        self.db
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT tool_name, COUNT(*) AS failures, MAX(created_at) AS last_failure
                     FROM {table}
                     WHERE status = 'failure' AND created_at >= ?1
                     GROUP BY tool_name
                     ORDER BY failures DESC, tool_name ASC"
                ))?;
                let rows = stmt.query_map(rusqlite::params![encode_ts(since)], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                })?;
                let mut out = Vec::new();
                for row in rows {
                    let (tool_name, failures, last_failure) = row?;
                    out.push(FailureReport {
                        tool_name,
                        failure_count: failures as u64,
                        last_failure: decode_ts(&last_failure)?,
                    });
                }
                Ok(out)
            })
            .await
    }
}

fn outcome_snippet(record: &ActionRecord) -> String {
    let outcome = record.outcome.as_deref().unwrap_or("");
    if outcome.chars().count() > 120 {
        let truncated: String = outcome.chars().take(120).collect();
        format!("{truncated}...")
    } else {
        outcome.to_string()
    }
}

// ── Row-mapping helpers ───────────────────────────────────────────────

type RawAction = (
    i64,
    String,
    Option<i64>,
    String,
    String,
    String,
    Option<String>,
    Option<i64>,
    String,
    String,
);

fn action_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawAction> {
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

fn action_from_raw(raw: RawAction) -> CortexResult<ActionRecord> {
    let (
        id,
        session_id,
        message_id,
        tool_name,
        arguments,
        status,
        outcome,
        duration_ms,
        metadata,
        created_at,
    ) = raw;
    Ok(ActionRecord {
        id: ActionId(id),
        session_id: session_id
            .parse()
            .map_err(|e: uuid::Error| CortexError::Serialization(e.to_string()))?,
        message_id: message_id.map(MessageId),
        tool_name,
        arguments: decode_metadata(&arguments)?,
        status: status.parse().map_err(CortexError::Serialization)?,
        outcome,
        duration_ms,
        metadata: decode_metadata(&metadata)?,
        created_at: decode_ts(&created_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TableNames;
    use crate::telemetry::test_support::RecordingTelemetry;
    use crate::telemetry::NullTelemetry;

    fn journal() -> ActionJournal {
        ActionJournal::new(
            Arc::new(Database::open_in_memory(TableNames::default()).unwrap()),
            Arc::new(NullTelemetry),
        )
    }

    #[tokio::test]
    async fn log_then_resolve_action() {
        let journal = journal();
        let session = SessionId::new();
        let mut args = Metadata::new();
        args.insert("query".to_string(), serde_json::Value::from("rust"));

        let action = journal
            .log_action(session, "web_search", args, None)
            .await
            .unwrap();
        assert_eq!(action.status, ActionStatus::Pending);

        let resolved = journal
            .record_outcome(action.id, ActionStatus::Success, "3 results", Some(120), None)
            .await
            .unwrap();
        assert_eq!(resolved.status, ActionStatus::Success);
        assert_eq!(resolved.outcome.as_deref(), Some("3 results"));
        assert_eq!(resolved.duration_ms, Some(120));
    }

    #[tokio::test]
    async fn outcome_transitions_exactly_once() {
        let journal = journal();
        let action = journal
            .log_action(SessionId::new(), "t", Metadata::new(), None)
            .await
            .unwrap();
        journal
            .record_outcome(action.id, ActionStatus::Success, "ok", None, None)
            .await
            .unwrap();

        let err = journal
            .record_outcome(action.id, ActionStatus::Failure, "late", None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, CortexError::Conflict(_)));
    }

    #[tokio::test]
    async fn pending_is_not_a_valid_outcome() {
        let journal = journal();
        let action = journal
            .log_action(SessionId::new(), "t", Metadata::new(), None)
            .await
            .unwrap();
        let err = journal
            .record_outcome(action.id, ActionStatus::Pending, "", None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, CortexError::InvariantViolation(_)));
    }

    #[tokio::test]
    async fn failure_outcome_emits_error_telemetry() {
        let telemetry = Arc::new(RecordingTelemetry::default());
        let journal = ActionJournal::new(
            Arc::new(Database::open_in_memory(TableNames::default()).unwrap()),
            telemetry.clone(),
        );
        let action = journal
            .log_action(SessionId::new(), "deploy", Metadata::new(), None)
            .await
            .unwrap();
        journal
            .record_outcome(action.id, ActionStatus::Failure, "timeout", None, None)
            .await
            .unwrap();

        let kinds = telemetry.kinds();
        assert_eq!(kinds, vec![TelemetryKind::Action, TelemetryKind::Error]);
    }

    #[tokio::test]
    async fn cursor_pagination_is_gapless_and_duplicate_free() {
        let journal = journal();
        let session = SessionId::new();
        for i in 0..7 {
            journal
                .log_action(session, &format!("tool{i}"), Metadata::new(), None)
                .await
                .unwrap();
        }

        let mut seen = Vec::new();
        let mut cursor = None;
        loop {
            let page = journal
                .get_session_actions(
                    session,
                    ActionQuery { limit: 3, cursor },
                )
                .await
                .unwrap();
            if page.is_empty() {
                break;
            }
            cursor = page.last().map(|a| a.id);
            seen.extend(page.into_iter().map(|a| a.id.0));
        }

        assert_eq!(seen.len(), 7);
        let mut sorted = seen.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(seen, sorted, "ids must be strictly increasing");
    }

    #[tokio::test]
    async fn action_pages_chain_through_next_cursor() {
        let journal = journal();
        let session = SessionId::new();
        for i in 0..7 {
            journal
                .log_action(session, &format!("tool{i}"), Metadata::new(), None)
                .await
                .unwrap();
        }

        let mut seen = Vec::new();
        let mut cursor = None;
        loop {
            let page = journal
                .get_session_action_page(session, ActionQuery { limit: 3, cursor })
                .await
                .unwrap();
            seen.extend(page.actions.iter().map(|a| a.id.0));
            match page.next_cursor {
                Some(next) => {
                    assert_eq!(page.actions.len(), 3);
                    cursor = Some(next);
                }
                None => {
                    assert!(page.actions.len() < 3);
                    break;
                }
            }
        }
        assert_eq!(seen.len(), 7);
        let mut sorted = seen.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(seen, sorted);
    }

    #[tokio::test]
    async fn actions_by_tool_are_newest_first() {
        let journal = journal();
        let session = SessionId::new();
        for _ in 0..3 {
            journal
                .log_action(session, "compile", Metadata::new(), None)
                .await
                .unwrap();
        }
        journal
            .log_action(session, "other", Metadata::new(), None)
            .await
            .unwrap();

        let actions = journal.get_actions_by_tool("compile", 50).await.unwrap();
        assert_eq!(actions.len(), 3);
        assert!(actions[0].id > actions[2].id);
    }

    #[tokio::test]
    async fn failure_report_groups_by_tool() {
        let journal = journal();
        let session = SessionId::new();
        for tool in ["a", "b", "b"] {
            let action = journal
                .log_action(session, tool, Metadata::new(), None)
                .await
                .unwrap();
            journal
                .record_outcome(action.id, ActionStatus::Failure, "boom", None, None)
                .await
                .unwrap();
        }
        let ok = journal
            .log_action(session, "a", Metadata::new(), None)
            .await
            .unwrap();
        journal
            .record_outcome(ok.id, ActionStatus::Success, "fine", None, None)
            .await
            .unwrap();

        let report = journal.get_failure_report().await.unwrap();
        assert_eq!(report.len(), 2);
        assert_eq!(report[0].tool_name, "b");
        assert_eq!(report[0].failure_count, 2);
        assert_eq!(report[1].tool_name, "a");
        assert_eq!(report[1].failure_count, 1);
    }
}
