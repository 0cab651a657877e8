//! Embedding-bearing memories with hybrid vector + keyword retrieval.
//!
//! The vector stage runs on whichever backend the configuration names; a
//! backend that fails at query time degrades to the manual cosine scan, but
//! backend *choice* is never guessed. Vector and keyword hits are combined
//! with Reciprocal Rank Fusion and gated by a relevance floor.

use chrono::Utc;
use rusqlite::Connection;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{FtsMode, VectorConfig, VectorProvider};
use crate::similarity::{cosine_similarity, reciprocal_rank_fusion};
use crate::storage::{decode_metadata, decode_ts, encode_metadata, encode_ts, Database};
use crate::types::{CortexError, CortexResult, MemoryId, MemoryRecord, Metadata, SessionId};

/// RRF constant.
const RRF_K: f64 = 60.0;

const MEMORY_COLS: &str = "id, session_id, content, embedding, metadata, created_at";

/// Input for a bulk insert.
#[derive(Debug, Clone)]
pub struct NewMemory {
    pub content: String,
    pub embedding: Vec<f32>,
    pub session_id: Option<SessionId>,
    pub metadata: Option<Metadata>,
}

/// Search parameters; unset fields use the configured defaults.
#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    pub limit: Option<usize>,
    pub session_id: Option<SessionId>,
    pub min_score: Option<f64>,
    pub keyword: Option<String>,
}

/// A memory with its fused retrieval score.
#[derive(Debug, Clone)]
pub struct ScoredMemory {
    pub record: MemoryRecord,
    pub score: f64,
}

/// Stores embeddings and answers similarity queries.
pub struct VectorIndex {
    db: Arc<Database>,
    config: VectorConfig,
}

impl VectorIndex {
    pub fn new(db: Arc<Database>, config: VectorConfig) -> Self {
        Self { db, config }
    }

    /// Insert one memory. The embedding length must match the configured
    /// dimension.
    pub async fn add_memory(
        &self,
        content: &str,
        embedding: Vec<f32>,
        session_id: Option<SessionId>,
        metadata: Option<Metadata>,
    ) -> CortexResult<MemoryRecord> {
        self.check_dimension(&embedding)?;
        let table = self.db.tables().memories.clone();
        let now = Utc::now();
        let record = MemoryRecord {
            id: MemoryId(0),
            session_id,
            content: content.to_string(),
            embedding,
            metadata: metadata.unwrap_or_default(),
            created_at: now,
        };
        let row = record.clone();
        let id = self
            .db
            .with_conn(move |conn| {
                conn.execute(
                    &format!(
                        "INSERT INTO {table} (session_id, content, embedding, metadata, created_at)
                         VALUES (?1, ?2, ?3, ?4, ?5)"
                    ),
                    rusqlite::params![
                        row.session_id.map(|s| s.to_string()),
                        row.content,
                        serde_json::to_string(&row.embedding)
                            .map_err(|e| CortexError::Serialization(e.to_string()))?,
                        encode_metadata(&row.metadata),
                        encode_ts(now),
                    ],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await?;
        Ok(MemoryRecord {
            id: MemoryId(id),
            ..record
        })
    }

    /// Insert a batch of memories in one transaction; the whole batch is
    /// rejected when any embedding has the wrong dimension.
    pub async fn add_memories(&self, batch: Vec<NewMemory>) -> CortexResult<Vec<MemoryRecord>> {
        for entry in &batch {
            self.check_dimension(&entry.embedding)?;
        }
        let table = self.db.tables().memories.clone();
        let now = Utc::now();
        self.db
            .transaction(move |tx| {
                let mut out = Vec::with_capacity(batch.len());
                for entry in batch {
                    tx.execute(
                        &format!(
                            "INSERT INTO {table}
                             (session_id, content, embedding, metadata, created_at)
                             VALUES (?1, ?2, ?3, ?4, ?5)"
                        ),
                        rusqlite::params![
                            entry.session_id.map(|s| s.to_string()),
                            entry.content,
                            serde_json::to_string(&entry.embedding)
                                .map_err(|e| CortexError::Serialization(e.to_string()))?,
                            encode_metadata(entry.metadata.as_ref().unwrap_or(&Metadata::new())),
                            encode_ts(now),
                        ],
                    )?;
                    out.push(MemoryRecord {
                        id: MemoryId(tx.last_insert_rowid()),
                        session_id: entry.session_id,
                        content: entry.content,
                        embedding: entry.embedding,
                        metadata: entry.metadata.unwrap_or_default(),
                        created_at: now,
                    });
                }
                Ok(out)
            })
            .await
    }

    /// Hybrid similarity search.
    ///
    /// 1. Vector stage on the configured backend (manual cosine scan when
    ///    the backend is absent or fails).
    /// 2. Keyword stage when a keyword is given.
    /// 3. Reciprocal Rank Fusion (`k = 60`); keyword hits fuse ahead of
    ///    vector hits so exact-term matches win rank ties.
    /// 4. Relevance floor: fused candidates must score at least
    ///    `0.8 × min_score` cosine against the query embedding.
    pub async fn search(
        &self,
        embedding: &[f32],
        options: SearchOptions,
    ) -> CortexResult<Vec<ScoredMemory>> {
        let limit = options.limit.unwrap_or(5);
        let min_score = options.min_score.unwrap_or(self.config.min_score);
        if limit == 0 {
            return Ok(Vec::new());
        }

        let table = self.db.tables().memories.clone();
        let config = self.config.clone();
        let query = embedding.to_vec();
        let session_id = options.session_id;
        let keyword = options.keyword.clone();

        self.db
            .with_conn(move |conn| {
                let mut cache: HashMap<MemoryId, MemoryRecord> = HashMap::new();

                // Vector stage.
                let vector_ids = match config.provider {
                    VectorProvider::None => {
                        manual_scan(conn, &table, &config, &query, session_id, limit, &mut cache)?
                    }
                    VectorProvider::Native => {
                        match native_query(conn, &table, &query, session_id, limit) {
                            Ok(ids) => ids,
                            Err(error) => {
                                tracing::warn!(%error, "native vector query failed, using manual scan");
                                manual_scan(
                                    conn, &table, &config, &query, session_id, limit, &mut cache,
                                )?
                            }
                        }
                    }
                    VectorProvider::Sidecar => {
                        match sidecar_query(conn, &table, &query, session_id, limit) {
                            Ok(ids) => ids,
                            Err(error) => {
                                tracing::warn!(%error, "sidecar vector query failed, using manual scan");
                                manual_scan(
                                    conn, &table, &config, &query, session_id, limit, &mut cache,
                                )?
                            }
                        }
                    }
                };

                // Keyword stage.
                let mut lists: Vec<Vec<MemoryId>> = Vec::with_capacity(2);
                if let Some(keyword) = keyword.as_deref() {
                    lists.push(keyword_query(
                        conn, &table, config.fts, keyword, session_id, limit,
                    )?);
                }
                lists.push(vector_ids);

                // Fusion.
                let fused = reciprocal_rank_fusion(&lists, RRF_K);

                // Relevance floor.
                let floor = 0.8 * min_score;
                let mut results = Vec::new();
                for (id, score) in fused {
                    let record = match cache.remove(&id) {
                        Some(record) => record,
                        None => match fetch_by_id(conn, &table, id)? {
                            Some(record) => record,
                            None => continue,
                        },
                    };
                    if cosine_similarity(&query, &record.embedding) >= floor {
                        results.push(ScoredMemory { record, score });
                        if results.len() >= limit {
                            break;
                        }
                    }
                }
                Ok(results)
            })
            .await
    }

    fn check_dimension(&self, embedding: &[f32]) -> CortexResult<()> {
        if embedding.len() != self.config.dimension {
            return Err(CortexError::InvariantViolation(format!(
                "embedding dimension {} does not match configured dimension {}",
                embedding.len(),
                self.config.dimension
            )));
        }
        Ok(())
    }
}

/// Literal `'[v1,v2,…]'` embedding rendering used by the SQL backends.
fn embedding_literal(embedding: &[f32]) -> String {
    let mut out = String::with_capacity(embedding.len() * 8 + 2);
    out.push('[');
    for (i, v) in embedding.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&v.to_string());
    }
    out.push(']');
    out
}

/// Nearest-neighbor query against a native dense-vector column.
fn native_query(
    conn: &Connection,
    table: &str,
    query: &[f32],
    session_id: Option<SessionId>,
    limit: usize,
) -> CortexResult<Vec<MemoryId>> {
    let literal = embedding_literal(query);
    let (sql, params): (String, Vec<Box<dyn rusqlite::types::ToSql>>) = match session_id {
        Some(sid) => (
            format!(
                "SELECT id FROM {table} WHERE session_id = ?1
                 ORDER BY embedding <-> '{literal}' LIMIT ?2"
            ),
            vec![Box::new(sid.to_string()), Box::new(limit as i64)],
        ),
        None => (
            format!("SELECT id FROM {table} ORDER BY embedding <-> '{literal}' LIMIT ?1"),
            vec![Box::new(limit as i64)],
        ),
    };
    collect_ids(conn, &sql, &params)
}

/// Nearest-neighbor query through a sidecar `vss_<table>` virtual table.
fn sidecar_query(
    conn: &Connection,
    table: &str,
    query: &[f32],
    session_id: Option<SessionId>,
    limit: usize,
) -> CortexResult<Vec<MemoryId>> {
    let literal = embedding_literal(query);
    let (sql, params): (String, Vec<Box<dyn rusqlite::types::ToSql>>) = match session_id {
        Some(sid) => (
            format!(
                "SELECT id FROM {table}
                 WHERE session_id = ?1 AND rowid IN
                   (SELECT rowid FROM vss_{table} WHERE embedding = ?2 LIMIT ?3)"
            ),
            vec![
                Box::new(sid.to_string()),
                Box::new(literal),
                Box::new(limit as i64),
            ],
        ),
        None => (
            format!(
                "SELECT id FROM {table} WHERE rowid IN
                   (SELECT rowid FROM vss_{table} WHERE embedding = ?1 LIMIT ?2)"
            ),
            vec![Box::new(literal), Box::new(limit as i64)],
        ),
    };
    collect_ids(conn, &sql, &params)
}

/// Manual fallback: cosine over the most recent `candidate_limit` rows.
fn manual_scan(
    conn: &Connection,
    table: &str,
    config: &VectorConfig,
    query: &[f32],
    session_id: Option<SessionId>,
    limit: usize,
    cache: &mut HashMap<MemoryId, MemoryRecord>,
) -> CortexResult<Vec<MemoryId>> {
    let (sql, params): (String, Vec<Box<dyn rusqlite::types::ToSql>>) = match session_id {
        Some(sid) => (
            format!(
                "SELECT {MEMORY_COLS} FROM {table} WHERE session_id = ?1
                 ORDER BY created_at DESC, id DESC LIMIT ?2"
            ),
            vec![
                Box::new(sid.to_string()),
                Box::new(config.candidate_limit as i64),
            ],
        ),
        None => (
            format!(
                "SELECT {MEMORY_COLS} FROM {table}
                 ORDER BY created_at DESC, id DESC LIMIT ?1"
            ),
            vec![Box::new(config.candidate_limit as i64)],
        ),
    };

    let param_refs: Vec<&dyn rusqlite::types::ToSql> = params.iter().map(|p| p.as_ref()).collect();
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(param_refs.as_slice(), memory_row)?;

    let mut scored: Vec<(MemoryId, f64)> = Vec::new();
    for row in rows {
        let record = memory_from_raw(row?)?;
        let score = cosine_similarity(query, &record.embedding);
        scored.push((record.id, score));
        cache.insert(record.id, record);
    }
    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    Ok(scored.into_iter().take(limit).map(|(id, _)| id).collect())
}

/// Keyword stage: virtual FTS table or `LIKE` substring match, by
/// configuration.
fn keyword_query(
    conn: &Connection,
    table: &str,
    fts: FtsMode,
    keyword: &str,
    session_id: Option<SessionId>,
    limit: usize,
) -> CortexResult<Vec<MemoryId>> {
    let (sql, params): (String, Vec<Box<dyn rusqlite::types::ToSql>>) = match fts {
        FtsMode::Virtual => match session_id {
            Some(sid) => (
                format!(
                    "SELECT id FROM {table}
                     WHERE session_id = ?1 AND rowid IN
                       (SELECT rowid FROM {table}_fts WHERE {table}_fts MATCH ?2 LIMIT ?3)"
                ),
                vec![
                    Box::new(sid.to_string()),
                    Box::new(keyword.to_string()),
                    Box::new(limit as i64),
                ],
            ),
            None => (
                format!(
                    "SELECT id FROM {table} WHERE rowid IN
                       (SELECT rowid FROM {table}_fts WHERE {table}_fts MATCH ?1 LIMIT ?2)"
                ),
                vec![Box::new(keyword.to_string()), Box::new(limit as i64)],
            ),
        },
        FtsMode::Like => {
            let pattern = format!("%{keyword}%");
            match session_id {
                Some(sid) => (
                    format!(
                        "SELECT id FROM {table}
                         WHERE session_id = ?1 AND content LIKE ?2
                         ORDER BY created_at DESC, id DESC LIMIT ?3"
                    ),
                    vec![
                        Box::new(sid.to_string()),
                        Box::new(pattern),
                        Box::new(limit as i64),
                    ],
                ),
                None => (
                    format!(
                        "SELECT id FROM {table} WHERE content LIKE ?1
                         ORDER BY created_at DESC, id DESC LIMIT ?2"
                    ),
                    vec![Box::new(pattern), Box::new(limit as i64)],
                ),
            }
        }
    };
    collect_ids(conn, &sql, &params)
}

fn collect_ids(
    conn: &Connection,
    sql: &str,
    params: &[Box<dyn rusqlite::types::ToSql>],
) -> CortexResult<Vec<MemoryId>> {
    let param_refs: Vec<&dyn rusqlite::types::ToSql> = params.iter().map(|p| p.as_ref()).collect();
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(param_refs.as_slice(), |row| row.get::<_, i64>(0))?;
    let mut ids = Vec::new();
    for row in rows {
        ids.push(MemoryId(row?));
    }
    Ok(ids)
}

fn fetch_by_id(
    conn: &Connection,
    table: &str,
    id: MemoryId,
) -> CortexResult<Option<MemoryRecord>> {
    use rusqlite::OptionalExtension;
    let raw = conn
        .query_row(
            &format!("SELECT {MEMORY_COLS} FROM {table} WHERE id = ?1"),
            rusqlite::params![id.0],
            memory_row,
        )
        .optional()?;
    raw.map(memory_from_raw).transpose()
}

// ── Row-mapping helpers ───────────────────────────────────────────────

type RawMemory = (i64, Option<String>, String, String, String, String);

fn memory_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawMemory> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn memory_from_raw(raw: RawMemory) -> CortexResult<MemoryRecord> {
    let (id, session_id, content, embedding, metadata, created_at) = raw;
    Ok(MemoryRecord {
        id: MemoryId(id),
        session_id: session_id
            .map(|s| {
                s.parse()
                    .map_err(|e: uuid::Error| CortexError::Serialization(e.to_string()))
            })
            .transpose()?,
        content,
        embedding: serde_json::from_str(&embedding)
            .map_err(|e| CortexError::Serialization(format!("embedding column: {e}")))?,
        metadata: decode_metadata(&metadata)?,
        created_at: decode_ts(&created_at)?,
    })
}
