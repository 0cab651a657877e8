//! Metric samples backing budget policies and curiosity counters.

use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::storage::{decode_ts, encode_ts, Database};
use crate::types::{CortexResult, Metric, MetricId};

/// Append-only store of named numeric samples.
pub struct MetricStore {
    db: Arc<Database>,
}

impl MetricStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Record one sample.
    pub async fn record(&self, name: &str, value: f64) -> CortexResult<Metric> {
        let table = self.db.tables().metrics.clone();
        let now = Utc::now();
        let name = name.to_string();
        self.db
            .with_conn(move |conn| {
                conn.execute(
                    &format!(
                        "INSERT INTO {table} (metric_name, metric_value, created_at)
                         VALUES (?1, ?2, ?3)"
                    ),
                    rusqlite::params![name, value, encode_ts(now)],
                )?;
                Ok(Metric {
                    id: MetricId(conn.last_insert_rowid()),
                    metric_name: name,
                    metric_value: value,
                    created_at: now,
                })
            })
            .await
    }

    /// Sum of samples for `name` with `created_at >= since`. `None` sums
    /// since the epoch.
    pub async fn sum_since(&self, name: &str, since: Option<DateTime<Utc>>) -> CortexResult<f64> {
        let table = self.db.tables().metrics.clone();
        let name = name.to_string();
        self.db
            .with_conn(move |conn| {
                let sum: f64 = match since {
                    Some(since) => conn.query_row(
                        &format!(
                            "SELECT COALESCE(SUM(metric_value), 0) FROM {table}
                             WHERE metric_name = ?1 AND created_at >= ?2"
                        ),
                        rusqlite::params![name, encode_ts(since)],
                        |row| row.get(0),
                    )?,
                    None => conn.query_row(
                        &format!(
                            "SELECT COALESCE(SUM(metric_value), 0) FROM {table}
                             WHERE metric_name = ?1"
                        ),
                        rusqlite::params![name],
                        |row| row.get(0),
                    )?,
                };
                Ok(sum)
            })
            .await
    }

    /// Number of samples for `name` with `created_at >= since`.
    pub async fn count_since(&self, name: &str, since: DateTime<Utc>) -> CortexResult<u64> {
        let table = self.db.tables().metrics.clone();
        let name = name.to_string();
        self.db
            .with_conn(move |conn| {
                let count: i64 = conn.query_row(
                    &format!(
                        "SELECT COUNT(*) FROM {table}
                         WHERE metric_name = ?1 AND created_at >= ?2"
                    ),
                    rusqlite::params![name, encode_ts(since)],
                    |row| row.get(0),
                )?;
                Ok(count as u64)
            })
            .await
    }

    /// Top metric names starting with `prefix`, by summed value descending.
    pub async fn top_by_prefix(
        &self,
        prefix: &str,
        limit: usize,
    ) -> CortexResult<Vec<(String, f64)>> {
        let table = self.db.tables().metrics.clone();
        let pattern = format!("{}%", prefix.replace('%', "\\%").replace('_', "\\_"));
        self.db
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT metric_name, SUM(metric_value) AS total FROM {table}
                     WHERE metric_name LIKE ?1 ESCAPE '\\'
                     GROUP BY metric_name
                     ORDER BY total DESC
                     LIMIT ?2"
                ))?;
                let rows = stmt.query_map(rusqlite::params![pattern, limit as i64], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
                })?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(row?);
                }
                Ok(out)
            })
            .await
    }

    /// Most recent sample for `name`, if any.
    pub async fn latest(&self, name: &str) -> CortexResult<Option<Metric>> {
        let table = self.db.tables().metrics.clone();
        let name = name.to_string();
        self.db
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT id, metric_name, metric_value, created_at FROM {table}
                     WHERE metric_name = ?1
                     ORDER BY created_at DESC, id DESC
                     LIMIT 1"
                ))?;
                let mut rows = stmt.query(rusqlite::params![name])?;
                match rows.next()? {
                    Some(row) => {
                        let created_raw: String = row.get(3)?;
                        Ok(Some(Metric {
                            id: MetricId(row.get(0)?),
                            metric_name: row.get(1)?,
                            metric_value: row.get(2)?,
                            created_at: decode_ts(&created_raw)?,
                        }))
                    }
                    None => Ok(None),
                }
            })
            .await
    }
}
