//! Hierarchical history compression: message ranges collapse into epochs,
//! and once a session accumulates more than ten epochs they consolidate
//! into a single era.

use chrono::Utc;
use std::sync::Arc;

use crate::storage::{decode_metadata, decode_ts, encode_metadata, encode_ts, Database};
use crate::types::{
    CortexResult, Epoch, EpochId, MessageId, Metadata, SessionId,
};

const EPOCH_COLS: &str =
    "id, session_id, summary, start_message_id, end_message_id, metadata, created_at";

/// Number of epochs a session may hold before consolidation fires.
const ERA_THRESHOLD: usize = 10;

/// How many of the oldest epoch summaries seed the era summary.
const ERA_SUMMARY_SOURCES: usize = 5;

/// Compresses long message histories into epoch and era summaries.
pub struct SessionCompressor {
    db: Arc<Database>,
    json_ops: bool,
}

impl SessionCompressor {
    pub fn new(db: Arc<Database>, json_ops: bool) -> Self {
        Self { db, json_ops }
    }

    /// Record one epoch summarizing the message range
    /// `[start_message_id, end_message_id]`. Preserved anchor terms are
    /// merged into the epoch metadata when present.
    pub async fn compress(
        &self,
        session_id: SessionId,
        summary: &str,
        start_message_id: MessageId,
        end_message_id: MessageId,
        anchors: &[String],
        metadata: Option<Metadata>,
    ) -> CortexResult<Epoch> {
        let table = self.db.tables().epochs.clone();
        let now = Utc::now();
        let summary = summary.to_string();
        let mut metadata = metadata.unwrap_or_default();
        if !anchors.is_empty() {
            metadata.insert(
                "anchors".to_string(),
                serde_json::Value::from(anchors.to_vec()),
            );
        }
        self.db
            .with_conn(move |conn| {
                conn.execute(
                    &format!(
                        "INSERT INTO {table}
                         (session_id, summary, start_message_id, end_message_id, metadata, created_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6)"
                    ),
                    rusqlite::params![
                        session_id.to_string(),
                        summary,
                        start_message_id.0,
                        end_message_id.0,
                        encode_metadata(&metadata),
                        encode_ts(now),
                    ],
                )?;
                Ok(Epoch {
                    id: EpochId(conn.last_insert_rowid()),
                    session_id,
                    summary,
                    start_message_id,
                    end_message_id,
                    metadata,
                    created_at: now,
                })
            })
            .await
    }

    /// Delete the session's prunable messages and return the deleted count.
    ///
    /// With `keep_anchors`, messages whose `metadata.anchor` is truthy
    /// survive; either the store's JSON operators or the textual fallback
    /// perform the filtering, chosen by configuration. Every call follows
    /// up with era consolidation.
    pub async fn semantic_pruning(
        &self,
        session_id: SessionId,
        keep_anchors: bool,
    ) -> CortexResult<u64> {
        let table = self.db.tables().messages.clone();
        let json_ops = self.json_ops;
        let deleted = self
            .db
            .with_conn(move |conn| {
                let deleted = if !keep_anchors {
                    conn.execute(
                        &format!("DELETE FROM {table} WHERE session_id = ?1"),
                        rusqlite::params![session_id.to_string()],
                    )?
                } else if json_ops {
                    conn.execute(
                        &format!(
                            "DELETE FROM {table}
                             WHERE session_id = ?1
                               AND COALESCE(json_extract(metadata, '$.anchor'), 0) != 1"
                        ),
                        rusqlite::params![session_id.to_string()],
                    )?
                } else {
                    conn.execute(
                        &format!(
                            "DELETE FROM {table}
                             WHERE session_id = ?1
                               AND metadata NOT LIKE '%\"anchor\":true%'
                               AND metadata NOT LIKE '%\"anchor\": true%'"
                        ),
                        rusqlite::params![session_id.to_string()],
                    )?
                };
                Ok(deleted as u64)
            })
            .await?;

        self.consolidate_epochs_into_era(session_id).await?;
        Ok(deleted)
    }

    /// Collapse the session's epochs into one era once there are more than
    /// ten of them.
    ///
    /// The era epoch summarizes the five oldest epoch summaries, an
    /// anchored `[ERA SUMMARY]` system message reifies it into the message
    /// stream (replacing any previous reification), and the source epochs
    /// are deleted in a single batch. Returns the era epoch when
    /// consolidation fired.
    pub async fn consolidate_epochs_into_era(
        &self,
        session_id: SessionId,
    ) -> CortexResult<Option<Epoch>> {
        let t = self.db.tables().clone();
        let now = Utc::now();
        self.db
            .transaction(move |tx| {
                let mut stmt = tx.prepare(&format!(
                    "SELECT {EPOCH_COLS} FROM {} WHERE session_id = ?1
                     ORDER BY created_at ASC, id ASC",
                    t.epochs
                ))?;
                let rows = stmt.query_map(rusqlite::params![session_id.to_string()], epoch_row)?;
                let mut epochs = Vec::new();
                for row in rows {
                    epochs.push(epoch_from_raw(row?)?);
                }
                drop(stmt);

                if epochs.len() <= ERA_THRESHOLD {
                    return Ok(None);
                }

                let summary = format!(
                    "{}...",
                    epochs
                        .iter()
                        .take(ERA_SUMMARY_SOURCES)
                        .map(|e| e.summary.as_str())
                        .collect::<Vec<_>>()
                        .join(";")
                );
                let (Some(first), Some(last)) = (epochs.first(), epochs.last()) else {
                    return Ok(None);
                };
                let start_message_id = first.start_message_id;
                let end_message_id = last.end_message_id;

                let mut era_metadata = Metadata::new();
                era_metadata.insert("type".to_string(), serde_json::Value::from("era"));
                era_metadata.insert(
                    "consolidated".to_string(),
                    serde_json::Value::from(epochs.len()),
                );

                tx.execute(
                    &format!(
                        "INSERT INTO {}
                         (session_id, summary, start_message_id, end_message_id, metadata, created_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                        t.epochs
                    ),
                    rusqlite::params![
                        session_id.to_string(),
                        summary,
                        start_message_id.0,
                        end_message_id.0,
                        encode_metadata(&era_metadata),
                        encode_ts(now),
                    ],
                )?;
                let era = Epoch {
                    id: EpochId(tx.last_insert_rowid()),
                    session_id,
                    summary: summary.clone(),
                    start_message_id,
                    end_message_id,
                    metadata: era_metadata,
                    created_at: now,
                };

                // Replace any earlier reification so the session carries
                // exactly one era summary message.
                tx.execute(
                    &format!(
                        "DELETE FROM {} WHERE session_id = ?1
                           AND metadata LIKE '%\"type\":\"era_reification\"%'",
                        t.messages
                    ),
                    rusqlite::params![session_id.to_string()],
                )?;

                let mut message_metadata = Metadata::new();
                message_metadata.insert("anchor".to_string(), serde_json::Value::Bool(true));
                message_metadata.insert(
                    "type".to_string(),
                    serde_json::Value::from("era_reification"),
                );
                tx.execute(
                    &format!(
                        "INSERT INTO {} (session_id, role, content, metadata, created_at)
                         VALUES (?1, 'system', ?2, ?3, ?4)",
                        t.messages
                    ),
                    rusqlite::params![
                        session_id.to_string(),
                        format!("[ERA SUMMARY] {summary}"),
                        encode_metadata(&message_metadata),
                        encode_ts(now),
                    ],
                )?;

                // Drop the source epochs in one batch; the era row survives.
                let ids: Vec<String> = epochs.iter().map(|e| e.id.0.to_string()).collect();
                tx.execute(
                    &format!(
                        "DELETE FROM {} WHERE id IN ({})",
                        t.epochs,
                        ids.join(",")
                    ),
                    [],
                )?;

                Ok(Some(era))
            })
            .await
    }

    /// All epochs of a session, oldest first.
    pub async fn get_epochs(&self, session_id: SessionId) -> CortexResult<Vec<Epoch>> {
        let table = self.db.tables().epochs.clone();
        self.db
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {EPOCH_COLS} FROM {table}
                     WHERE session_id = ?1 ORDER BY created_at ASC, id ASC"
                ))?;
                let rows = stmt.query_map(rusqlite::params![session_id.to_string()], epoch_row)?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(epoch_from_raw(row?)?);
                }
                Ok(out)
            })
            .await
    }
}

// ── Row-mapping helpers ───────────────────────────────────────────────

type RawEpoch = (i64, String, String, i64, i64, String, String);

fn epoch_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawEpoch> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn epoch_from_raw(raw: RawEpoch) -> CortexResult<Epoch> {
    let (id, session_id, summary, start, end, metadata, created_at) = raw;
    Ok(Epoch {
        id: EpochId(id),
        session_id: session_id
            .parse()
            .map_err(|e: uuid::Error| crate::types::CortexError::Serialization(e.to_string()))?,
        summary,
        start_message_id: MessageId(start),
        end_message_id: MessageId(end),
        metadata: decode_metadata(&metadata)?,
        created_at: decode_ts(&created_at)?,
    })
}
