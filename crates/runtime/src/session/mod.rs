//! Persisted conversation state: sessions, messages, and goals.

use chrono::Utc;
use rusqlite::OptionalExtension;
use std::sync::Arc;

use crate::storage::{decode_metadata, decode_ts, encode_metadata, encode_ts, Database};
use crate::telemetry::{TelemetryKind, TelemetrySink};
use crate::types::{
    merge_metadata, CortexError, CortexResult, Goal, GoalId, GoalStatus, Message, MessageId,
    MessageRole, Metadata, Session, SessionId, SessionStatus,
};

const SESSION_COLS: &str = "id, name, status, metadata, created_at, updated_at";
const MESSAGE_COLS: &str = "id, session_id, role, content, metadata, created_at";
const GOAL_COLS: &str =
    "id, session_id, parent_id, description, status, priority, metadata, created_at, updated_at";

/// Options for [`SessionStore::upsert_goal`].
#[derive(Debug, Clone, Default)]
pub struct GoalUpsert {
    pub status: Option<GoalStatus>,
    pub priority: Option<i64>,
    pub parent_id: Option<GoalId>,
    pub metadata: Option<Metadata>,
}

/// CRUD for sessions, messages, and goals.
pub struct SessionStore {
    db: Arc<Database>,
    telemetry: Arc<dyn TelemetrySink>,
}

impl SessionStore {
    pub fn new(db: Arc<Database>, telemetry: Arc<dyn TelemetrySink>) -> Self {
        Self { db, telemetry }
    }

    /// Create a new active session.
    pub async fn create_session(
        &self,
        name: Option<&str>,
        metadata: Option<Metadata>,
    ) -> CortexResult<Session> {
        let table = self.db.tables().sessions.clone();
        let session = Session {
            id: SessionId::new(),
            name: name.map(str::to_string),
            status: SessionStatus::Active,
            metadata: metadata.unwrap_or_default(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let row = session.clone();
        self.db
            .with_conn(move |conn| {
                conn.execute(
                    &format!(
                        "INSERT INTO {table} (id, name, status, metadata, created_at, updated_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6)"
                    ),
                    rusqlite::params![
                        row.id.to_string(),
                        row.name,
                        row.status.as_str(),
                        encode_metadata(&row.metadata),
                        encode_ts(row.created_at),
                        encode_ts(row.updated_at),
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(session)
    }

    /// Fetch a session; `None` when absent.
    pub async fn get_session(&self, id: SessionId) -> CortexResult<Option<Session>> {
        let table = self.db.tables().sessions.clone();
        self.db
            .with_conn(move |conn| {
                let raw = conn
                    .query_row(
                        &format!("SELECT {SESSION_COLS} FROM {table} WHERE id = ?1"),
                        rusqlite::params![id.to_string()],
                        session_row,
                    )
                    .optional()?;
                raw.map(session_from_raw).transpose()
            })
            .await
    }

    /// List sessions, optionally filtered by status, most recently touched
    /// first.
    pub async fn get_sessions(
        &self,
        status: Option<SessionStatus>,
    ) -> CortexResult<Vec<Session>> {
        let table = self.db.tables().sessions.clone();
        self.db
            .with_conn(move |conn| {
                let mut out = Vec::new();
                match status {
                    Some(status) => {
                        let mut stmt = conn.prepare(&format!(
                            "SELECT {SESSION_COLS} FROM {table}
                             WHERE status = ?1 ORDER BY updated_at DESC"
                        ))?;
                        let rows =
                            stmt.query_map(rusqlite::params![status.as_str()], session_row)?;
                        for row in rows {
                            out.push(session_from_raw(row?)?);
                        }
                    }
                    None => {
                        let mut stmt = conn.prepare(&format!(
                            "SELECT {SESSION_COLS} FROM {table} ORDER BY updated_at DESC"
                        ))?;
                        let rows = stmt.query_map([], session_row)?;
                        for row in rows {
                            out.push(session_from_raw(row?)?);
                        }
                    }
                }
                Ok(out)
            })
            .await
    }

    /// Mark a session archived.
    pub async fn archive_session(&self, id: SessionId) -> CortexResult<Session> {
        self.set_status(id, SessionStatus::Archived).await
    }

    async fn set_status(&self, id: SessionId, status: SessionStatus) -> CortexResult<Session> {
        let table = self.db.tables().sessions.clone();
        let now = Utc::now();
        self.db
            .transaction(move |tx| {
                let changed = tx.execute(
                    &format!("UPDATE {table} SET status = ?1, updated_at = ?2 WHERE id = ?3"),
                    rusqlite::params![status.as_str(), encode_ts(now), id.to_string()],
                )?;
                if changed == 0 {
                    return Err(CortexError::not_found("session", id));
                }
                let raw = tx.query_row(
                    &format!("SELECT {SESSION_COLS} FROM {table} WHERE id = ?1"),
                    rusqlite::params![id.to_string()],
                    session_row,
                )?;
                session_from_raw(raw)
            })
            .await
    }

    /// Merge a metadata patch into a session under the write lock.
    pub async fn update_session_metadata(
        &self,
        id: SessionId,
        patch: Metadata,
    ) -> CortexResult<Session> {
        let table = self.db.tables().sessions.clone();
        let now = Utc::now();
        self.db
            .transaction(move |tx| {
                let raw = tx
                    .query_row(
                        &format!("SELECT {SESSION_COLS} FROM {table} WHERE id = ?1"),
                        rusqlite::params![id.to_string()],
                        session_row,
                    )
                    .optional()?
                    .ok_or_else(|| CortexError::not_found("session", id))?;
                let mut session = session_from_raw(raw)?;
                merge_metadata(&mut session.metadata, patch);
                session.updated_at = now;
                tx.execute(
                    &format!("UPDATE {table} SET metadata = ?1, updated_at = ?2 WHERE id = ?3"),
                    rusqlite::params![
                        encode_metadata(&session.metadata),
                        encode_ts(now),
                        id.to_string()
                    ],
                )?;
                Ok(session)
            })
            .await
    }

    /// Delete a session and every dependent row in one transaction.
    /// Partial deletion is never observable.
    pub async fn delete_session(&self, id: SessionId) -> CortexResult<()> {
        let t = self.db.tables().clone();
        self.db
            .transaction(move |tx| {
                let exists: Option<String> = tx
                    .query_row(
                        &format!("SELECT id FROM {} WHERE id = ?1", t.sessions),
                        rusqlite::params![id.to_string()],
                        |row| row.get(0),
                    )
                    .optional()?;
                if exists.is_none() {
                    return Err(CortexError::not_found("session", id));
                }
                for child in [
                    &t.messages,
                    &t.goals,
                    &t.memories,
                    &t.episodes,
                    &t.epochs,
                    &t.actions,
                ] {
                    tx.execute(
                        &format!("DELETE FROM {child} WHERE session_id = ?1"),
                        rusqlite::params![id.to_string()],
                    )?;
                }
                tx.execute(
                    &format!("DELETE FROM {} WHERE id = ?1", t.sessions),
                    rusqlite::params![id.to_string()],
                )?;
                Ok(())
            })
            .await
    }

    /// Append a message and bump the session's `updated_at` in one
    /// transaction. The two timestamps are identical.
    pub async fn add_message(
        &self,
        session_id: SessionId,
        role: MessageRole,
        content: &str,
        metadata: Option<Metadata>,
    ) -> CortexResult<Message> {
        let t = self.db.tables().clone();
        let now = Utc::now();
        let content = content.to_string();
        let metadata = metadata.unwrap_or_default();
        self.db
            .transaction(move |tx| {
                let exists: Option<String> = tx
                    .query_row(
                        &format!("SELECT id FROM {} WHERE id = ?1", t.sessions),
                        rusqlite::params![session_id.to_string()],
                        |row| row.get(0),
                    )
                    .optional()?;
                if exists.is_none() {
                    return Err(CortexError::not_found("session", session_id));
                }

                tx.execute(
                    &format!(
                        "INSERT INTO {} (session_id, role, content, metadata, created_at)
                         VALUES (?1, ?2, ?3, ?4, ?5)",
                        t.messages
                    ),
                    rusqlite::params![
                        session_id.to_string(),
                        role.as_str(),
                        content,
                        encode_metadata(&metadata),
                        encode_ts(now),
                    ],
                )?;
                let id = MessageId(tx.last_insert_rowid());

                tx.execute(
                    &format!("UPDATE {} SET updated_at = ?1 WHERE id = ?2", t.sessions),
                    rusqlite::params![encode_ts(now), session_id.to_string()],
                )?;

                Ok(Message {
                    id,
                    session_id,
                    role,
                    content,
                    metadata,
                    created_at: now,
                })
            })
            .await
    }

    /// Session history in temporal order, capped at `limit` (default 50).
    pub async fn get_history(
        &self,
        session_id: SessionId,
        limit: Option<usize>,
    ) -> CortexResult<Vec<Message>> {
        let table = self.db.tables().messages.clone();
        let limit = limit.unwrap_or(50);
        self.db
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {MESSAGE_COLS} FROM {table}
                     WHERE session_id = ?1
                     ORDER BY created_at ASC, id ASC
                     LIMIT ?2"
                ))?;
                let rows = stmt.query_map(
                    rusqlite::params![session_id.to_string(), limit as i64],
                    message_row,
                )?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(message_from_raw(row?)?);
                }
                Ok(out)
            })
            .await
    }

    /// Delete all messages of a session; returns the deleted count.
    pub async fn clear_history(&self, session_id: SessionId) -> CortexResult<u64> {
        let table = self.db.tables().messages.clone();
        self.db
            .with_conn(move |conn| {
                let deleted = conn.execute(
                    &format!("DELETE FROM {table} WHERE session_id = ?1"),
                    rusqlite::params![session_id.to_string()],
                )?;
                Ok(deleted as u64)
            })
            .await
    }

    /// Flag a message as an anchor. Metadata is merged, never replaced;
    /// runs under the write transaction so concurrent patches cannot lose
    /// fields.
    pub async fn mark_message_as_anchor(&self, id: MessageId) -> CortexResult<Message> {
        let table = self.db.tables().messages.clone();
        self.db
            .transaction(move |tx| {
                let raw = tx
                    .query_row(
                        &format!("SELECT {MESSAGE_COLS} FROM {table} WHERE id = ?1"),
                        rusqlite::params![id.0],
                        message_row,
                    )
                    .optional()?
                    .ok_or_else(|| CortexError::not_found("message", id))?;
                let mut message = message_from_raw(raw)?;
                message
                    .metadata
                    .insert("anchor".to_string(), serde_json::Value::Bool(true));
                tx.execute(
                    &format!("UPDATE {table} SET metadata = ?1 WHERE id = ?2"),
                    rusqlite::params![encode_metadata(&message.metadata), id.0],
                )?;
                Ok(message)
            })
            .await
    }

    /// Insert or update the goal identified by `(session_id, description)`.
    /// Emits a `pivot` telemetry event when a new goal is created.
    pub async fn upsert_goal(
        &self,
        session_id: SessionId,
        description: &str,
        upsert: GoalUpsert,
    ) -> CortexResult<Goal> {
        let t = self.db.tables().clone();
        let now = Utc::now();
        let description = description.to_string();
        let (goal, inserted) = self
            .db
            .transaction(move |tx| {
                let exists: Option<String> = tx
                    .query_row(
                        &format!("SELECT id FROM {} WHERE id = ?1", t.sessions),
                        rusqlite::params![session_id.to_string()],
                        |row| row.get(0),
                    )
                    .optional()?;
                if exists.is_none() {
                    return Err(CortexError::not_found("session", session_id));
                }

                let current = tx
                    .query_row(
                        &format!(
                            "SELECT {GOAL_COLS} FROM {} WHERE session_id = ?1 AND description = ?2",
                            t.goals
                        ),
                        rusqlite::params![session_id.to_string(), description],
                        goal_row,
                    )
                    .optional()?;

                match current {
                    Some(raw) => {
                        let mut goal = goal_from_raw(raw)?;
                        if let Some(status) = upsert.status {
                            goal.status = status;
                        }
                        if let Some(priority) = upsert.priority {
                            goal.priority = priority;
                        }
                        if let Some(parent_id) = upsert.parent_id {
                            goal.parent_id = Some(parent_id);
                        }
                        if let Some(patch) = upsert.metadata {
                            merge_metadata(&mut goal.metadata, patch);
                        }
                        goal.updated_at = now;
                        tx.execute(
                            &format!(
                                "UPDATE {} SET status = ?1, priority = ?2, parent_id = ?3,
                                 metadata = ?4, updated_at = ?5 WHERE id = ?6",
                                t.goals
                            ),
                            rusqlite::params![
                                goal.status.as_str(),
                                goal.priority,
                                goal.parent_id.map(|p| p.0),
                                encode_metadata(&goal.metadata),
                                encode_ts(now),
                                goal.id.0,
                            ],
                        )?;
                        Ok((goal, false))
                    }
                    None => {
                        let goal = Goal {
                            id: GoalId(0),
                            session_id,
                            parent_id: upsert.parent_id,
                            description: description.clone(),
                            status: upsert.status.unwrap_or(GoalStatus::Pending),
                            priority: upsert.priority.unwrap_or(0),
                            metadata: upsert.metadata.unwrap_or_default(),
                            created_at: now,
                            updated_at: now,
                        };
                        tx.execute(
                            &format!(
                                "INSERT INTO {} (session_id, parent_id, description, status,
                                 priority, metadata, created_at, updated_at)
                                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                                t.goals
                            ),
                            rusqlite::params![
                                session_id.to_string(),
                                goal.parent_id.map(|p| p.0),
                                goal.description,
                                goal.status.as_str(),
                                goal.priority,
                                encode_metadata(&goal.metadata),
                                encode_ts(now),
                                encode_ts(now),
                            ],
                        )?;
                        let goal = Goal {
                            id: GoalId(tx.last_insert_rowid()),
                            ..goal
                        };
                        Ok((goal, true))
                    }
                }
            })
            .await?;

        if inserted {
            let mut meta = Metadata::new();
            meta.insert(
                "goalId".to_string(),
                serde_json::Value::from(goal.id.0),
            );
            self.telemetry
                .track(
                    &session_id.to_string(),
                    TelemetryKind::Pivot,
                    &format!("new goal: {}", goal.description),
                    Some(meta),
                )
                .await;
        }
        Ok(goal)
    }

    /// Goals of a session, highest priority first.
    pub async fn get_goals(
        &self,
        session_id: SessionId,
        status: Option<GoalStatus>,
    ) -> CortexResult<Vec<Goal>> {
        let table = self.db.tables().goals.clone();
        self.db
            .with_conn(move |conn| {
                let mut out = Vec::new();
                match status {
                    Some(status) => {
                        let mut stmt = conn.prepare(&format!(
                            "SELECT {GOAL_COLS} FROM {table}
                             WHERE session_id = ?1 AND status = ?2
                             ORDER BY priority DESC, id ASC"
                        ))?;
                        let rows = stmt.query_map(
                            rusqlite::params![session_id.to_string(), status.as_str()],
                            goal_row,
                        )?;
                        for row in rows {
                            out.push(goal_from_raw(row?)?);
                        }
                    }
                    None => {
                        let mut stmt = conn.prepare(&format!(
                            "SELECT {GOAL_COLS} FROM {table}
                             WHERE session_id = ?1
                             ORDER BY priority DESC, id ASC"
                        ))?;
                        let rows =
                            stmt.query_map(rusqlite::params![session_id.to_string()], goal_row)?;
                        for row in rows {
                            out.push(goal_from_raw(row?)?);
                        }
                    }
                }
                Ok(out)
            })
            .await
    }
}

// ── Row-mapping helpers ───────────────────────────────────────────────

type RawSession = (String, Option<String>, String, String, String, String);

fn session_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawSession> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn session_from_raw(raw: RawSession) -> CortexResult<Session> {
    let (id, name, status, metadata, created_at, updated_at) = raw;
    Ok(Session {
        id: id
            .parse()
            .map_err(|e: uuid::Error| CortexError::Serialization(e.to_string()))?,
        name,
        status: status
            .parse()
            .map_err(CortexError::Serialization)?,
        metadata: decode_metadata(&metadata)?,
        created_at: decode_ts(&created_at)?,
        updated_at: decode_ts(&updated_at)?,
    })
}

type RawMessage = (i64, String, String, String, String, String);

fn message_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawMessage> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn message_from_raw(raw: RawMessage) -> CortexResult<Message> {
    let (id, session_id, role, content, metadata, created_at) = raw;
    Ok(Message {
        id: MessageId(id),
        session_id: session_id
            .parse()
            .map_err(|e: uuid::Error| CortexError::Serialization(e.to_string()))?,
        role: role.parse().map_err(CortexError::Serialization)?,
        content,
        metadata: decode_metadata(&metadata)?,
        created_at: decode_ts(&created_at)?,
    })
}

type RawGoal = (
    i64,
    String,
    Option<i64>,
    String,
    String,
    i64,
    String,
    String,
    String,
);

fn goal_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawGoal> {
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

fn goal_from_raw(raw: RawGoal) -> CortexResult<Goal> {
    let (id, session_id, parent_id, description, status, priority, metadata, created_at, updated_at) =
        raw;
    Ok(Goal {
        id: GoalId(id),
        session_id: session_id
            .parse()
            .map_err(|e: uuid::Error| CortexError::Serialization(e.to_string()))?,
        parent_id: parent_id.map(GoalId),
        description,
        status: status.parse().map_err(CortexError::Serialization)?,
        priority,
        metadata: decode_metadata(&metadata)?,
        created_at: decode_ts(&created_at)?,
        updated_at: decode_ts(&updated_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TableNames;
    use crate::telemetry::test_support::RecordingTelemetry;
    use crate::telemetry::NullTelemetry;

    fn store() -> SessionStore {
        SessionStore::new(
            Arc::new(Database::open_in_memory(TableNames::default()).unwrap()),
            Arc::new(NullTelemetry),
        )
    }

    #[tokio::test]
    async fn create_and_get_session() {
        let sessions = store();
        let session = sessions
            .create_session(Some("planning"), None)
            .await
            .unwrap();
        assert_eq!(session.status, SessionStatus::Active);

        let loaded = sessions.get_session(session.id).await.unwrap().unwrap();
        assert_eq!(loaded.name.as_deref(), Some("planning"));
        assert!(loaded.updated_at >= loaded.created_at);
    }

    #[tokio::test]
    async fn get_missing_session_is_none() {
        let sessions = store();
        assert!(sessions
            .get_session(SessionId::new())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn archive_session_flips_status() {
        let sessions = store();
        let session = sessions.create_session(None, None).await.unwrap();
        let archived = sessions.archive_session(session.id).await.unwrap();
        assert_eq!(archived.status, SessionStatus::Archived);

        let err = sessions.archive_session(SessionId::new()).await.unwrap_err();
        assert!(matches!(err, CortexError::NotFound { .. }));
    }

    #[tokio::test]
    async fn add_message_bumps_updated_at_to_message_time() {
        let sessions = store();
        let session = sessions.create_session(None, None).await.unwrap();

        for i in 0..3 {
            sessions
                .add_message(session.id, MessageRole::User, &format!("m{i}"), None)
                .await
                .unwrap();
        }

        let history = sessions.get_history(session.id, None).await.unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].content, "m0");

        let loaded = sessions.get_session(session.id).await.unwrap().unwrap();
        assert_eq!(loaded.updated_at, history.last().unwrap().created_at);
    }

    #[tokio::test]
    async fn add_message_to_missing_session_fails() {
        let sessions = store();
        let err = sessions
            .add_message(SessionId::new(), MessageRole::User, "x", None)
            .await
            .unwrap_err();
        assert!(matches!(err, CortexError::NotFound { entity: "session", .. }));
    }

    #[tokio::test]
    async fn history_limit_truncates() {
        let sessions = store();
        let session = sessions.create_session(None, None).await.unwrap();
        for i in 0..5 {
            sessions
                .add_message(session.id, MessageRole::User, &format!("m{i}"), None)
                .await
                .unwrap();
        }
        let history = sessions.get_history(session.id, Some(2)).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].content, "m0");
    }

    #[tokio::test]
    async fn clear_history_returns_deleted_count() {
        let sessions = store();
        let session = sessions.create_session(None, None).await.unwrap();
        for _ in 0..4 {
            sessions
                .add_message(session.id, MessageRole::User, "x", None)
                .await
                .unwrap();
        }
        assert_eq!(sessions.clear_history(session.id).await.unwrap(), 4);
        assert!(sessions.get_history(session.id, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn anchor_flip_merges_metadata() {
        let sessions = store();
        let session = sessions.create_session(None, None).await.unwrap();
        let mut meta = Metadata::new();
        meta.insert("origin".to_string(), serde_json::Value::from("user"));
        let message = sessions
            .add_message(session.id, MessageRole::User, "keep me", Some(meta))
            .await
            .unwrap();

        let updated = sessions.mark_message_as_anchor(message.id).await.unwrap();
        assert!(updated.is_anchor());
        assert_eq!(
            updated.metadata.get("origin"),
            Some(&serde_json::Value::from("user"))
        );

        let err = sessions
            .mark_message_as_anchor(MessageId(99_999))
            .await
            .unwrap_err();
        assert!(matches!(err, CortexError::NotFound { .. }));
    }

    #[tokio::test]
    async fn upsert_goal_inserts_then_updates() {
        let db = Arc::new(Database::open_in_memory(TableNames::default()).unwrap());
        let telemetry = Arc::new(RecordingTelemetry::default());
        let sessions = SessionStore::new(db, telemetry.clone());

        let session = sessions.create_session(None, None).await.unwrap();
        let goal = sessions
            .upsert_goal(
                session.id,
                "ship the feature",
                GoalUpsert {
                    priority: Some(5),
                    ..GoalUpsert::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(goal.status, GoalStatus::Pending);
        assert_eq!(goal.priority, 5);
        assert_eq!(telemetry.kinds(), vec![TelemetryKind::Pivot]);

        let updated = sessions
            .upsert_goal(
                session.id,
                "ship the feature",
                GoalUpsert {
                    status: Some(GoalStatus::InProgress),
                    ..GoalUpsert::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.id, goal.id);
        assert_eq!(updated.status, GoalStatus::InProgress);
        assert_eq!(updated.priority, 5);
        // No second pivot for the update.
        assert_eq!(telemetry.kinds().len(), 1);
    }

    #[tokio::test]
    async fn goals_are_ordered_by_priority_desc() {
        let sessions = store();
        let session = sessions.create_session(None, None).await.unwrap();
        for (desc, priority) in [("low", 1), ("high", 9), ("mid", 5)] {
            sessions
                .upsert_goal(
                    session.id,
                    desc,
                    GoalUpsert {
                        priority: Some(priority),
                        ..GoalUpsert::default()
                    },
                )
                .await
                .unwrap();
        }
        let goals = sessions.get_goals(session.id, None).await.unwrap();
        let order: Vec<&str> = goals.iter().map(|g| g.description.as_str()).collect();
        assert_eq!(order, vec!["high", "mid", "low"]);
    }

    #[tokio::test]
    async fn delete_session_cascades_atomically() {
        let sessions = store();
        let session = sessions.create_session(None, None).await.unwrap();
        sessions
            .add_message(session.id, MessageRole::User, "m", None)
            .await
            .unwrap();
        sessions
            .upsert_goal(session.id, "g", GoalUpsert::default())
            .await
            .unwrap();

        sessions.delete_session(session.id).await.unwrap();
        assert!(sessions.get_session(session.id).await.unwrap().is_none());
        assert!(sessions.get_history(session.id, None).await.unwrap().is_empty());
        assert!(sessions.get_goals(session.id, None).await.unwrap().is_empty());

        let err = sessions.delete_session(session.id).await.unwrap_err();
        assert!(matches!(err, CortexError::NotFound { .. }));
    }
}
