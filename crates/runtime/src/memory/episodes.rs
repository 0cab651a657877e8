//! Named episodes with an atomic completion path.

use chrono::Utc;
use rusqlite::OptionalExtension;
use std::sync::Arc;

use crate::storage::{decode_metadata, decode_ts, encode_metadata, encode_ts, Database};
use crate::types::{
    merge_metadata, CortexError, CortexResult, Episode, EpisodeId, EpisodeStatus, Metadata,
    SessionId,
};

const EPISODE_COLS: &str = "id, session_id, name, summary, status, start_time, end_time, metadata";

/// Pagination for [`EpisodicMemory::get_session_episodes`].
#[derive(Debug, Clone, Copy)]
pub struct EpisodePage {
    pub limit: usize,
    pub offset: usize,
}

impl Default for EpisodePage {
    fn default() -> Self {
        Self {
            limit: 100,
            offset: 0,
        }
    }
}

/// Episode lifecycle over the episodes table.
pub struct EpisodicMemory {
    db: Arc<Database>,
}

impl EpisodicMemory {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Open a new active episode.
    pub async fn start_episode(
        &self,
        session_id: SessionId,
        name: &str,
        metadata: Option<Metadata>,
    ) -> CortexResult<Episode> {
        let table = self.db.tables().episodes.clone();
        let now = Utc::now();
        let episode = Episode {
            id: EpisodeId(0),
            session_id,
            name: name.to_string(),
            summary: None,
            status: EpisodeStatus::Active,
            start_time: now,
            end_time: None,
            metadata: metadata.unwrap_or_default(),
        };
        let row = episode.clone();
        let id = self
            .db
            .with_conn(move |conn| {
                conn.execute(
                    &format!(
                        "INSERT INTO {table} (session_id, name, status, start_time, metadata)
                         VALUES (?1, ?2, ?3, ?4, ?5)"
                    ),
                    rusqlite::params![
                        row.session_id.to_string(),
                        row.name,
                        row.status.as_str(),
                        encode_ts(row.start_time),
                        encode_metadata(&row.metadata),
                    ],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await?;
        Ok(Episode {
            id: EpisodeId(id),
            ..episode
        })
    }

    /// Close an episode: set the summary and end time, merge metadata.
    /// Runs under the write transaction, so completion happens exactly
    /// once even under concurrent callers.
    pub async fn complete_episode(
        &self,
        id: EpisodeId,
        summary: &str,
        metadata: Option<Metadata>,
    ) -> CortexResult<Episode> {
        let table = self.db.tables().episodes.clone();
        let now = Utc::now();
        let summary = summary.to_string();
        self.db
            .transaction(move |tx| {
                let raw = tx
                    .query_row(
                        &format!("SELECT {EPISODE_COLS} FROM {table} WHERE id = ?1"),
                        rusqlite::params![id.0],
                        episode_row,
                    )
                    .optional()?
                    .ok_or_else(|| CortexError::not_found("episode", id))?;
                let mut episode = episode_from_raw(raw)?;

                episode.status = EpisodeStatus::Completed;
                episode.summary = Some(summary.clone());
                episode.end_time = Some(now);
                if let Some(patch) = metadata {
                    merge_metadata(&mut episode.metadata, patch);
                }

                tx.execute(
                    &format!(
                        "UPDATE {table}
                         SET status = ?1, summary = ?2, end_time = ?3, metadata = ?4
                         WHERE id = ?5"
                    ),
                    rusqlite::params![
                        episode.status.as_str(),
                        summary,
                        encode_ts(now),
                        encode_metadata(&episode.metadata),
                        id.0,
                    ],
                )?;
                Ok(episode)
            })
            .await
    }

    /// Episodes of a session, newest start first.
    pub async fn get_session_episodes(
        &self,
        session_id: SessionId,
        page: EpisodePage,
    ) -> CortexResult<Vec<Episode>> {
        let table = self.db.tables().episodes.clone();
        self.db
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {EPISODE_COLS} FROM {table}
                     WHERE session_id = ?1
                     ORDER BY start_time DESC, id DESC
                     LIMIT ?2 OFFSET ?3"
                ))?;
                let rows = stmt.query_map(
                    rusqlite::params![session_id.to_string(), page.limit as i64, page.offset as i64],
                    episode_row,
                )?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(episode_from_raw(row?)?);
                }
                Ok(out)
            })
            .await
    }

    /// Most recently completed episodes across sessions.
    pub async fn get_recent_episodes(&self, limit: usize) -> CortexResult<Vec<Episode>> {
        let table = self.db.tables().episodes.clone();
        self.db
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {EPISODE_COLS} FROM {table}
                     WHERE status = 'completed'
                     ORDER BY end_time DESC, id DESC
                     LIMIT ?1"
                ))?;
                let rows = stmt.query_map(rusqlite::params![limit as i64], episode_row)?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(episode_from_raw(row?)?);
                }
                Ok(out)
            })
            .await
    }
}

// ── Row-mapping helpers ───────────────────────────────────────────────

type RawEpisode = (
    i64,
    String,
    String,
    Option<String>,
    String,
    String,
    Option<String>,
    String,
);

fn episode_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawEpisode> {
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

fn episode_from_raw(raw: RawEpisode) -> CortexResult<Episode> {
    let (id, session_id, name, summary, status, start_time, end_time, metadata) = raw;
    Ok(Episode {
        id: EpisodeId(id),
        session_id: session_id
            .parse()
            .map_err(|e: uuid::Error| CortexError::Serialization(e.to_string()))?,
        name,
        summary,
        status: status.parse().map_err(CortexError::Serialization)?,
        start_time: decode_ts(&start_time)?,
        end_time: end_time.as_deref().map(decode_ts).transpose()?,
        metadata: decode_metadata(&metadata)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TableNames;

    fn memory() -> EpisodicMemory {
        EpisodicMemory::new(Arc::new(
            Database::open_in_memory(TableNames::default()).unwrap(),
        ))
    }

    #[tokio::test]
    async fn start_then_complete_episode() {
        let episodes = memory();
        let session = SessionId::new();
        let episode = episodes
            .start_episode(session, "debugging", None)
            .await
            .unwrap();
        assert_eq!(episode.status, EpisodeStatus::Active);
        assert!(episode.summary.is_none());

        let completed = episodes
            .complete_episode(episode.id, "found the regression", None)
            .await
            .unwrap();
        assert_eq!(completed.status, EpisodeStatus::Completed);
        assert_eq!(completed.summary.as_deref(), Some("found the regression"));
        assert!(completed.end_time.is_some());
    }

    #[tokio::test]
    async fn completing_missing_episode_fails() {
        let episodes = memory();
        let err = episodes
            .complete_episode(EpisodeId(404), "s", None)
            .await
            .unwrap_err();
        assert!(matches!(err, CortexError::NotFound { entity: "episode", .. }));
    }

    #[tokio::test]
    async fn completion_merges_metadata() {
        let episodes = memory();
        let session = SessionId::new();
        let mut initial = Metadata::new();
        initial.insert("phase".to_string(), serde_json::Value::from("triage"));
        let episode = episodes
            .start_episode(session, "incident", Some(initial))
            .await
            .unwrap();

        let mut patch = Metadata::new();
        patch.insert("severity".to_string(), serde_json::Value::from("low"));
        let completed = episodes
            .complete_episode(episode.id, "resolved", Some(patch))
            .await
            .unwrap();
        assert_eq!(
            completed.metadata.get("phase"),
            Some(&serde_json::Value::from("triage"))
        );
        assert_eq!(
            completed.metadata.get("severity"),
            Some(&serde_json::Value::from("low"))
        );
    }

    #[tokio::test]
    async fn session_episodes_are_paginated_newest_first() {
        let episodes = memory();
        let session = SessionId::new();
        for i in 0..5 {
            episodes
                .start_episode(session, &format!("e{i}"), None)
                .await
                .unwrap();
        }

        let first_page = episodes
            .get_session_episodes(session, EpisodePage { limit: 2, offset: 0 })
            .await
            .unwrap();
        assert_eq!(first_page.len(), 2);
        assert_eq!(first_page[0].name, "e4");

        let second_page = episodes
            .get_session_episodes(session, EpisodePage { limit: 2, offset: 2 })
            .await
            .unwrap();
        assert_eq!(second_page[0].name, "e2");
    }

    #[tokio::test]
    async fn recent_episodes_are_completed_only() {
        let episodes = memory();
        let session = SessionId::new();
        let open = episodes.start_episode(session, "open", None).await.unwrap();
        let done = episodes.start_episode(session, "done", None).await.unwrap();
        episodes
            .complete_episode(done.id, "wrapped", None)
            .await
            .unwrap();

        let recent = episodes.get_recent_episodes(10).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].name, "done");
        assert_ne!(recent[0].id, open.id);
    }
}
