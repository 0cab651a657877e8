//! Entity facts consumed by the curiosity engine.

use chrono::Utc;
use std::sync::Arc;

use crate::metrics::MetricStore;
use crate::storage::{decode_ts, encode_ts, Database};
use crate::types::{CortexError, CortexResult, FactId, KnowledgeFact};

const FACT_COLS: &str = "id, entity, fact, confidence, tags, created_at";

/// Prefix for per-entity reference counters in the metrics table.
pub const ENTITY_HIT_PREFIX: &str = "entity_hit_";

/// Store of `(entity, fact, confidence, tags)` rows.
pub struct KnowledgeStore {
    db: Arc<Database>,
    metrics: Arc<MetricStore>,
}

impl KnowledgeStore {
    pub fn new(db: Arc<Database>, metrics: Arc<MetricStore>) -> Self {
        Self { db, metrics }
    }

    /// Record one fact about an entity.
    pub async fn add_fact(
        &self,
        entity: &str,
        fact: &str,
        confidence: f64,
        tags: &[String],
    ) -> CortexResult<KnowledgeFact> {
        if !(0.0..=1.0).contains(&confidence) {
            return Err(CortexError::InvariantViolation(format!(
                "confidence {confidence} outside [0, 1]"
            )));
        }
        let table = self.db.tables().knowledge_base.clone();
        let now = Utc::now();
        let row = KnowledgeFact {
            id: FactId(0),
            entity: entity.to_string(),
            fact: fact.to_string(),
            confidence,
            tags: tags.to_vec(),
            created_at: now,
        };
        let insert = row.clone();
        let id = self
            .db
            .with_conn(move |conn| {
                conn.execute(
                    &format!(
                        "INSERT INTO {table} (entity, fact, confidence, tags, created_at)
                         VALUES (?1, ?2, ?3, ?4, ?5)"
                    ),
                    rusqlite::params![
                        insert.entity,
                        insert.fact,
                        insert.confidence,
                        serde_json::to_string(&insert.tags)
                            .map_err(|e| CortexError::Serialization(e.to_string()))?,
                        encode_ts(now),
                    ],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await?;
        Ok(KnowledgeFact {
            id: FactId(id),
            ..row
        })
    }

    /// Facts recorded about one entity, oldest first.
    pub async fn get_entity_facts(&self, entity: &str) -> CortexResult<Vec<KnowledgeFact>> {
        let table = self.db.tables().knowledge_base.clone();
        let entity = entity.to_string();
        self.db
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {FACT_COLS} FROM {table}
                     WHERE entity = ?1 ORDER BY created_at ASC, id ASC"
                ))?;
                let rows = stmt.query_map(rusqlite::params![entity], fact_row)?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(fact_from_raw(row?)?);
                }
                Ok(out)
            })
            .await
    }

    /// Every fact in the knowledge base.
    pub async fn all_facts(&self) -> CortexResult<Vec<KnowledgeFact>> {
        let table = self.db.tables().knowledge_base.clone();
        self.db
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {FACT_COLS} FROM {table} ORDER BY entity ASC, id ASC"
                ))?;
                let rows = stmt.query_map([], fact_row)?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(fact_from_raw(row?)?);
                }
                Ok(out)
            })
            .await
    }

    /// Number of facts recorded about one entity.
    pub async fn count_entity_facts(&self, entity: &str) -> CortexResult<u64> {
        let table = self.db.tables().knowledge_base.clone();
        let entity = entity.to_string();
        self.db
            .with_conn(move |conn| {
                let count: i64 = conn.query_row(
                    &format!("SELECT COUNT(*) FROM {table} WHERE entity = ?1"),
                    rusqlite::params![entity],
                    |row| row.get(0),
                )?;
                Ok(count as u64)
            })
            .await
    }

    /// Bump the reference counter for an entity.
    pub async fn record_entity_hit(&self, entity: &str) -> CortexResult<()> {
        self.metrics
            .record(&format!("{ENTITY_HIT_PREFIX}{entity}"), 1.0)
            .await?;
        Ok(())
    }
}

// ── Row-mapping helpers ───────────────────────────────────────────────

type RawFact = (i64, String, String, f64, String, String);

fn fact_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawFact> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn fact_from_raw(raw: RawFact) -> CortexResult<KnowledgeFact> {
    let (id, entity, fact, confidence, tags, created_at) = raw;
    Ok(KnowledgeFact {
        id: FactId(id),
        entity,
        fact,
        confidence,
        tags: serde_json::from_str(&tags)
            .map_err(|e| CortexError::Serialization(format!("tags column: {e}")))?,
        created_at: decode_ts(&created_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TableNames;

    fn store() -> KnowledgeStore {
        let db = Arc::new(Database::open_in_memory(TableNames::default()).unwrap());
        let metrics = Arc::new(MetricStore::new(db.clone()));
        KnowledgeStore::new(db, metrics)
    }

    #[tokio::test]
    async fn facts_round_trip_with_tags() {
        let knowledge = store();
        knowledge
            .add_fact(
                "postgres",
                "uses MVCC for concurrency",
                0.9,
                &["database".to_string(), "verified".to_string()],
            )
            .await
            .unwrap();

        let facts = knowledge.get_entity_facts("postgres").await.unwrap();
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].tags, vec!["database", "verified"]);
        assert!((facts[0].confidence - 0.9).abs() < 1e-9);
    }

    #[tokio::test]
    async fn confidence_is_bounded() {
        let knowledge = store();
        assert!(knowledge.add_fact("e", "f", 1.2, &[]).await.is_err());
        assert!(knowledge.add_fact("e", "f", -0.1, &[]).await.is_err());
    }

    #[tokio::test]
    async fn counts_are_per_entity() {
        let knowledge = store();
        knowledge.add_fact("a", "f1", 0.5, &[]).await.unwrap();
        knowledge.add_fact("a", "f2", 0.5, &[]).await.unwrap();
        knowledge.add_fact("b", "f3", 0.5, &[]).await.unwrap();

        assert_eq!(knowledge.count_entity_facts("a").await.unwrap(), 2);
        assert_eq!(knowledge.count_entity_facts("b").await.unwrap(), 1);
        assert_eq!(knowledge.all_facts().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn entity_hits_land_in_metrics() {
        let db = Arc::new(Database::open_in_memory(TableNames::default()).unwrap());
        let metrics = Arc::new(MetricStore::new(db.clone()));
        let knowledge = KnowledgeStore::new(db, metrics.clone());

        knowledge.record_entity_hit("redis").await.unwrap();
        knowledge.record_entity_hit("redis").await.unwrap();

        let total = metrics.sum_since("entity_hit_redis", None).await.unwrap();
        assert!((total - 2.0).abs() < 1e-9);
    }
}
