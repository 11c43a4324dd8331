//! SQLite-backed implementation of [`RetrievalStore`].
//!
//! Grounded in the runtime's original `SqliteJobStore`
//! (`scheduler/job_store.rs`): a single `rusqlite::Connection` guarded by a
//! `tokio::sync::Mutex`, WAL mode, schema created before the connection is
//! wrapped. SQLite has no `SELECT ... FOR UPDATE SKIP LOCKED`; the claim
//! operation instead expresses the same "exactly one worker wins" guarantee
//! as a single `UPDATE ... WHERE id = (SELECT ...) RETURNING *` executed
//! while holding the store's mutex.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;
use tokio::sync::Mutex;

use super::schema::INIT_SQL;
use super::{
    CacheEntry, EnqueueResult, Hit, IndexedDocument, Job, JobEvent, Report, RetrievalStore,
    RetrievalWeights, SearchResult, SearchScope,
};
use crate::retrieval::{bm25_scores, combine, min_max_normalize, vector_scores, Candidate};
use crate::types::{Embedding, EventId, JobId, JobKind, JobStatus, ReportId, StoreError};

pub struct SqliteRetrievalStore {
    conn: Mutex<Connection>,
}

impl SqliteRetrievalStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Fatal(format!("create dir: {e}")))?;
        }
        let conn = Connection::open(path).map_err(|e| StoreError::Fatal(e.to_string()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| StoreError::Fatal(e.to_string()))?;
        conn.execute_batch(INIT_SQL)
            .map_err(|e| StoreError::Fatal(e.to_string()))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn =
            Connection::open_in_memory().map_err(|e| StoreError::Fatal(e.to_string()))?;
        conn.execute_batch(INIT_SQL)
            .map_err(|e| StoreError::Fatal(e.to_string()))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn classify(e: rusqlite::Error) -> StoreError {
        match &e {
            rusqlite::Error::SqliteFailure(err, _)
                if err.code == rusqlite::ErrorCode::DatabaseBusy
                    || err.code == rusqlite::ErrorCode::DatabaseLocked =>
            {
                StoreError::Transient(e.to_string())
            }
            _ => StoreError::Fatal(e.to_string()),
        }
    }
}

fn row_to_job(row: &Row) -> rusqlite::Result<Job> {
    let id: String = row.get("id")?;
    let kind: String = row.get("kind")?;
    let params: String = row.get("params")?;
    let status: String = row.get("status")?;
    let idempotency_key: Option<String> = row.get("idempotency_key")?;
    let retry_of: Option<String> = row.get("retry_of")?;
    let lease_owner: Option<String> = row.get("lease_owner")?;
    let lease_expires_at: Option<String> = row.get("lease_expires_at")?;
    let attempt_count: i64 = row.get("attempt_count")?;
    let progress: i64 = row.get("progress")?;
    let result: Option<String> = row.get("result")?;
    let created_at: String = row.get("created_at")?;
    let started_at: Option<String> = row.get("started_at")?;
    let finished_at: Option<String> = row.get("finished_at")?;

    Ok(Job {
        id: JobId(uuid::Uuid::parse_str(&id).unwrap_or_default()),
        kind: kind.parse().unwrap_or(JobKind::Research),
        params: serde_json::from_str(&params).unwrap_or(Value::Null),
        status: status.parse().unwrap_or(JobStatus::Queued),
        idempotency_key,
        retry_of: retry_of.and_then(|s| uuid::Uuid::parse_str(&s).ok()).map(JobId),
        lease_owner,
        lease_expires_at: lease_expires_at.and_then(|s| parse_ts(&s)),
        attempt_count: attempt_count as u32,
        progress: progress as u8,
        result: result.and_then(|s| serde_json::from_str(&s).ok()),
        created_at: parse_ts(&created_at).unwrap_or_else(Utc::now),
        started_at: started_at.and_then(|s| parse_ts(&s)),
        finished_at: finished_at.and_then(|s| parse_ts(&s)),
    })
}

fn row_to_report(row: &Row) -> rusqlite::Result<Report> {
    let id: i64 = row.get("id")?;
    let query_embedding: String = row.get("query_embedding")?;
    let metadata: Option<String> = row.get("metadata")?;
    let created_at: String = row.get("created_at")?;
    let rating: Option<i64> = row.get("rating")?;

    Ok(Report {
        id: ReportId(id),
        original_query: row.get("original_query")?,
        final_report: row.get("final_report")?,
        query_embedding: serde_json::from_str(&query_embedding).unwrap_or_default(),
        metadata: metadata.and_then(|s| serde_json::from_str(&s).ok()),
        created_at: parse_ts(&created_at).unwrap_or_else(Utc::now),
        rating: rating.map(|r| r as u8),
    })
}

fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

const JOB_COLUMNS: &str = "id, kind, params, status, idempotency_key, retry_of, lease_owner, \
     lease_expires_at, attempt_count, progress, result, created_at, started_at, finished_at";

#[async_trait]
impl RetrievalStore for SqliteRetrievalStore {
    async fn insert_job(
        &self,
        kind: JobKind,
        params: Value,
        idempotency_key: &str,
        key_ttl: ChronoDuration,
        retry_of: Option<JobId>,
    ) -> Result<EnqueueResult, StoreError> {
        let conn = self.conn.lock().await;
        let now = Utc::now();

        let existing: Option<(String, String)> = conn
            .query_row(
                "SELECT job_id, expires_at FROM idempotency_keys WHERE key = ?1",
                params![idempotency_key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(Self::classify)?;

        if let Some((job_id, expires_at)) = existing {
            if parse_ts(&expires_at).map(|e| e > now).unwrap_or(false) {
                let job_id =
                    JobId(uuid::Uuid::parse_str(&job_id).map_err(|e| StoreError::Fatal(e.to_string()))?);
                return Ok(EnqueueResult::Duplicate(job_id));
            }
        }

        let job_id = JobId::new();
        let params_json = serde_json::to_string(&params)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        conn.execute(
            "INSERT INTO jobs (id, kind, params, status, idempotency_key, retry_of, \
             attempt_count, progress, created_at) VALUES (?1, ?2, ?3, 'queued', ?4, ?5, 0, 0, ?6)",
            params![
                job_id.0.to_string(),
                kind.as_str(),
                params_json,
                idempotency_key,
                retry_of.map(|r| r.0.to_string()),
                fmt_ts(now),
            ],
        )
        .map_err(Self::classify)?;

        conn.execute(
            "INSERT OR REPLACE INTO idempotency_keys (key, job_id, created_at, expires_at, retry_count) \
             VALUES (?1, ?2, ?3, ?4, 0)",
            params![
                idempotency_key,
                job_id.0.to_string(),
                fmt_ts(now),
                fmt_ts(now + key_ttl),
            ],
        )
        .map_err(Self::classify)?;

        Ok(EnqueueResult::Created(job_id))
    }

    async fn claim_next_leased_job(
        &self,
        worker_id: &str,
        lease_ms: u64,
    ) -> Result<Option<Job>, StoreError> {
        let conn = self.conn.lock().await;
        let now = Utc::now();
        let lease_expires_at = now + ChronoDuration::milliseconds(lease_ms as i64);

        let sql = format!(
            "UPDATE jobs SET status = 'leased', lease_owner = ?1, lease_expires_at = ?2, \
             attempt_count = attempt_count + 1, started_at = COALESCE(started_at, ?3) \
             WHERE id = ( \
                 SELECT id FROM jobs \
                 WHERE status = 'queued' \
                    OR (status IN ('leased', 'running') AND lease_expires_at < ?3) \
                 ORDER BY created_at ASC LIMIT 1 \
             ) \
             RETURNING {JOB_COLUMNS}"
        );

        conn.query_row(
            &sql,
            params![worker_id, fmt_ts(lease_expires_at), fmt_ts(now)],
            row_to_job,
        )
        .optional()
        .map_err(Self::classify)
    }

    async fn heartbeat(&self, job_id: JobId, worker_id: &str, lease_ms: u64) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        let new_expiry = Utc::now() + ChronoDuration::milliseconds(lease_ms as i64);
        let updated = conn
            .execute(
                "UPDATE jobs SET lease_expires_at = ?1 \
                 WHERE id = ?2 AND lease_owner = ?3 AND status IN ('leased', 'running')",
                params![fmt_ts(new_expiry), job_id.0.to_string(), worker_id],
            )
            .map_err(Self::classify)?;
        Ok(updated > 0)
    }

    async fn mark_running(&self, job_id: JobId, worker_id: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let updated = conn
            .execute(
                "UPDATE jobs SET status = 'running' WHERE id = ?1 AND lease_owner = ?2",
                params![job_id.0.to_string(), worker_id],
            )
            .map_err(Self::classify)?;
        if updated == 0 {
            return Err(StoreError::LeaseLost {
                job_id,
                worker_id: worker_id.to_string(),
            });
        }
        Ok(())
    }

    async fn update_progress(&self, job_id: JobId, progress: u8) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE jobs SET progress = ?1 WHERE id = ?2",
            params![progress as i64, job_id.0.to_string()],
        )
        .map_err(Self::classify)?;
        Ok(())
    }

    async fn append_event(
        &self,
        job_id: JobId,
        event_type: &str,
        payload: Value,
    ) -> Result<EventId, StoreError> {
        let conn = self.conn.lock().await;
        let next_id: i64 = conn
            .query_row(
                "SELECT COALESCE(MAX(event_id), 0) + 1 FROM job_events WHERE job_id = ?1",
                params![job_id.0.to_string()],
                |row| row.get(0),
            )
            .map_err(Self::classify)?;
        let payload_json =
            serde_json::to_string(&payload).map_err(|e| StoreError::Serialization(e.to_string()))?;
        conn.execute(
            "INSERT INTO job_events (job_id, event_id, event_type, payload, ts) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![job_id.0.to_string(), next_id, event_type, payload_json, fmt_ts(Utc::now())],
        )
        .map_err(Self::classify)?;
        Ok(EventId(next_id))
    }

    async fn read_events(
        &self,
        job_id: JobId,
        since_event_id: i64,
        limit: usize,
    ) -> Result<Vec<JobEvent>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT job_id, event_id, event_type, payload, ts FROM job_events \
                 WHERE job_id = ?1 AND event_id > ?2 ORDER BY event_id ASC LIMIT ?3",
            )
            .map_err(Self::classify)?;
        let rows = stmt
            .query_map(
                params![job_id.0.to_string(), since_event_id, limit as i64],
                |row| {
                    let job_id_str: String = row.get(0)?;
                    let event_id: i64 = row.get(1)?;
                    let event_type: String = row.get(2)?;
                    let payload: String = row.get(3)?;
                    let ts: String = row.get(4)?;
                    Ok((job_id_str, event_id, event_type, payload, ts))
                },
            )
            .map_err(Self::classify)?;

        let mut events = Vec::new();
        for row in rows {
            let (job_id_str, event_id, event_type, payload, ts) = row.map_err(Self::classify)?;
            events.push(JobEvent {
                job_id: JobId(uuid::Uuid::parse_str(&job_id_str).unwrap_or_default()),
                event_id: EventId(event_id),
                event_type,
                payload: serde_json::from_str(&payload).unwrap_or(Value::Null),
                ts: parse_ts(&ts).unwrap_or_else(Utc::now),
            });
        }
        Ok(events)
    }

    async fn max_event_id(&self, job_id: JobId) -> Result<i64, StoreError> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT COALESCE(MAX(event_id), 0) FROM job_events WHERE job_id = ?1",
            params![job_id.0.to_string()],
            |row| row.get(0),
        )
        .map_err(Self::classify)
    }

    async fn finish_job(
        &self,
        job_id: JobId,
        worker_id: &str,
        status: JobStatus,
        result: Value,
    ) -> Result<Option<EventId>, StoreError> {
        let conn = self.conn.lock().await;
        let now = Utc::now();
        let result_json =
            serde_json::to_string(&result).map_err(|e| StoreError::Serialization(e.to_string()))?;

        let updated = conn
            .execute(
                "UPDATE jobs SET status = ?1, result = ?2, finished_at = ?3 \
                 WHERE id = ?4 AND lease_owner = ?5 \
                 AND status NOT IN ('succeeded', 'failed', 'canceled')",
                params![
                    status.as_str(),
                    result_json,
                    fmt_ts(now),
                    job_id.0.to_string(),
                    worker_id
                ],
            )
            .map_err(Self::classify)?;
        if updated == 0 {
            // Either the lease was never ours, or a concurrent `request_cancel`
            // already moved the job to a terminal state. The latter already
            // wrote its own terminal event, so this is not an error for the
            // worker — it just lost the race to report its own outcome.
            let current: Option<String> = conn
                .query_row(
                    "SELECT status FROM jobs WHERE id = ?1 AND lease_owner = ?2",
                    params![job_id.0.to_string(), worker_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(Self::classify)?;
            let already_terminal = current
                .as_deref()
                .and_then(|s| s.parse::<JobStatus>().ok())
                .map(|s| s.is_terminal())
                .unwrap_or(false);
            if already_terminal {
                return Ok(None);
            }
            return Err(StoreError::LeaseLost {
                job_id,
                worker_id: worker_id.to_string(),
            });
        }

        let event_type = match status {
            JobStatus::Succeeded => "job.succeeded",
            JobStatus::Failed => "job.failed",
            JobStatus::Canceled => "job.canceled",
            _ => "job.progress",
        };
        let next_id: i64 = conn
            .query_row(
                "SELECT COALESCE(MAX(event_id), 0) + 1 FROM job_events WHERE job_id = ?1",
                params![job_id.0.to_string()],
                |row| row.get(0),
            )
            .map_err(Self::classify)?;
        conn.execute(
            "INSERT INTO job_events (job_id, event_id, event_type, payload, ts) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![job_id.0.to_string(), next_id, event_type, result_json, fmt_ts(now)],
        )
        .map_err(Self::classify)?;

        Ok(Some(EventId(next_id)))
    }

    async fn request_cancel(&self, job_id: JobId) -> Result<(JobStatus, Option<EventId>), StoreError> {
        let conn = self.conn.lock().await;
        let previous: String = conn
            .query_row(
                "SELECT status FROM jobs WHERE id = ?1",
                params![job_id.0.to_string()],
                |row| row.get(0),
            )
            .map_err(Self::classify)?;
        let previous_status: JobStatus = previous.parse().unwrap_or(JobStatus::Queued);
        if previous_status.is_terminal() {
            return Ok((previous_status, None));
        }

        let updated = conn
            .execute(
                "UPDATE jobs SET status = 'canceled', finished_at = ?1 WHERE id = ?2 AND status NOT IN \
                 ('succeeded', 'failed', 'canceled')",
                params![fmt_ts(Utc::now()), job_id.0.to_string()],
            )
            .map_err(Self::classify)?;
        if updated == 0 {
            return Ok((previous_status, None));
        }

        let next_id: i64 = conn
            .query_row(
                "SELECT COALESCE(MAX(event_id), 0) + 1 FROM job_events WHERE job_id = ?1",
                params![job_id.0.to_string()],
                |row| row.get(0),
            )
            .map_err(Self::classify)?;
        conn.execute(
            "INSERT INTO job_events (job_id, event_id, event_type, payload, ts) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![job_id.0.to_string(), next_id, "job.canceled", "{}", fmt_ts(Utc::now())],
        )
        .map_err(Self::classify)?;
        Ok((previous_status, Some(EventId(next_id))))
    }

    async fn requeue(&self, job_id: JobId) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE jobs SET status = 'queued', lease_owner = NULL, lease_expires_at = NULL \
             WHERE id = ?1",
            params![job_id.0.to_string()],
        )
        .map_err(Self::classify)?;
        Ok(())
    }

    async fn get_job(&self, job_id: JobId) -> Result<Option<Job>, StoreError> {
        let conn = self.conn.lock().await;
        conn.query_row(
            &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
            params![job_id.0.to_string()],
            row_to_job,
        )
        .optional()
        .map_err(Self::classify)
    }

    async fn insert_report(&self, report: &Report) -> Result<ReportId, StoreError> {
        let conn = self.conn.lock().await;
        let embedding_json = serde_json::to_string(&report.query_embedding)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let metadata_json = report
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        conn.execute(
            "INSERT INTO reports (original_query, final_report, query_embedding, metadata, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                report.original_query,
                report.final_report,
                embedding_json,
                metadata_json,
                fmt_ts(report.created_at),
            ],
        )
        .map_err(Self::classify)?;
        Ok(ReportId(conn.last_insert_rowid()))
    }

    async fn get_report(&self, report_id: ReportId) -> Result<Option<Report>, StoreError> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT id, original_query, final_report, query_embedding, metadata, created_at, rating \
             FROM reports WHERE id = ?1",
            params![report_id.0],
            row_to_report,
        )
        .optional()
        .map_err(Self::classify)
    }

    async fn rate_report(&self, report_id: ReportId, rating: Option<u8>) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let rows = conn
            .execute(
                "UPDATE reports SET rating = ?1 WHERE id = ?2",
                params![rating.map(|r| r as i64), report_id.0],
            )
            .map_err(Self::classify)?;
        if rows == 0 {
            return Err(StoreError::ReportNotFound(report_id));
        }
        Ok(())
    }

    async fn insert_document(&self, doc: &IndexedDocument) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let embedding_json = doc
            .doc_embedding
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        conn.execute(
            "INSERT INTO index_documents (source_type, source_id, title, content, doc_embedding, \
             doc_len, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
             ON CONFLICT(source_type, source_id) DO UPDATE SET \
             title = excluded.title, content = excluded.content, doc_embedding = excluded.doc_embedding, \
             doc_len = excluded.doc_len, updated_at = excluded.updated_at",
            params![
                doc.source_type,
                doc.source_id,
                doc.title,
                doc.content,
                embedding_json,
                doc.doc_len,
                fmt_ts(doc.created_at),
                fmt_ts(doc.updated_at),
            ],
        )
        .map_err(Self::classify)?;
        Ok(())
    }

    async fn hybrid_search(
        &self,
        query_text: &str,
        query_embedding: Option<&Embedding>,
        k: usize,
        scope: SearchScope,
        weights: RetrievalWeights,
        bm25_k1: f32,
        bm25_b: f32,
    ) -> Result<SearchResult, StoreError> {
        let conn = self.conn.lock().await;

        struct Row {
            source_type: String,
            source_id: String,
            title: String,
            content: String,
            doc_len: u32,
            embedding: Option<Embedding>,
        }

        let mut rows: Vec<Row> = Vec::new();

        if scope != SearchScope::ReportsOnly {
            let mut stmt = conn
                .prepare("SELECT source_type, source_id, title, content, doc_len, doc_embedding FROM index_documents")
                .map_err(Self::classify)?;
            let mapped = stmt
                .query_map([], |r| {
                    let embedding: Option<String> = r.get(5)?;
                    Ok(Row {
                        source_type: r.get(0)?,
                        source_id: r.get(1)?,
                        title: r.get(2)?,
                        content: r.get(3)?,
                        doc_len: r.get::<_, i64>(4)? as u32,
                        embedding: embedding.and_then(|s| serde_json::from_str(&s).ok()),
                    })
                })
                .map_err(Self::classify)?;
            for row in mapped {
                rows.push(row.map_err(Self::classify)?);
            }
        }

        if scope != SearchScope::DocsOnly {
            let mut stmt = conn
                .prepare("SELECT id, original_query, final_report, query_embedding FROM reports")
                .map_err(Self::classify)?;
            let mapped = stmt
                .query_map([], |r| {
                    let id: i64 = r.get(0)?;
                    let original_query: String = r.get(1)?;
                    let final_report: String = r.get(2)?;
                    let embedding: String = r.get(3)?;
                    Ok(Row {
                        source_type: "report".to_string(),
                        source_id: id.to_string(),
                        title: original_query,
                        content: final_report,
                        doc_len: 0,
                        embedding: serde_json::from_str(&embedding).ok(),
                    })
                })
                .map_err(Self::classify)?;
            for row in mapped {
                let mut row = row.map_err(Self::classify)?;
                row.doc_len = row.content.split_whitespace().count() as u32;
                rows.push(row);
            }
        }

        if rows.is_empty() {
            return Ok(SearchResult {
                hits: Vec::new(),
                degraded: false,
            });
        }

        let candidates: Vec<Candidate> = rows
            .iter()
            .map(|r| Candidate {
                content: &r.content,
                doc_len: r.doc_len,
                embedding: r.embedding.as_ref(),
            })
            .collect();

        let has_any_embedding = rows.iter().any(|r| r.embedding.is_some());
        let has_vector_query = query_embedding.is_some() && has_any_embedding;

        let bm25_norm = min_max_normalize(&bm25_scores(query_text, &candidates, bm25_k1, bm25_b));
        let (vector_norm, degraded, (w_bm25, w_vector)) = if has_vector_query {
            let raw = vector_scores(query_embedding.unwrap(), &candidates);
            (min_max_normalize(&raw), false, (weights.bm25, weights.vector))
        } else {
            (vec![0.0; rows.len()], true, (1.0, 0.0))
        };

        let final_scores = combine(&bm25_norm, &vector_norm, w_bm25, w_vector);

        let mut hits: Vec<Hit> = rows
            .into_iter()
            .zip(final_scores.iter())
            .zip(bm25_norm.iter())
            .zip(vector_norm.iter())
            .map(|(((row, score), bm25), vector)| Hit {
                source_type: row.source_type,
                source_id: row.source_id,
                title: row.title,
                score: *score,
                bm25_score: *bm25,
                vector_score: *vector,
            })
            .collect();

        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(k);

        Ok(SearchResult { hits, degraded })
    }

    async fn reap_expired(&self, older_than: ChronoDuration) -> Result<usize, StoreError> {
        let conn = self.conn.lock().await;
        let cutoff = fmt_ts(Utc::now() - older_than);
        let ids: Vec<String> = {
            let mut stmt = conn
                .prepare(
                    "SELECT id FROM jobs WHERE status IN ('succeeded', 'failed', 'canceled') \
                     AND finished_at < ?1",
                )
                .map_err(Self::classify)?;
            let mapped = stmt
                .query_map(params![cutoff], |r| r.get::<_, String>(0))
                .map_err(Self::classify)?;
            mapped.collect::<Result<Vec<_>, _>>().map_err(Self::classify)?
        };
        for id in &ids {
            conn.execute("DELETE FROM job_events WHERE job_id = ?1", params![id])
                .map_err(Self::classify)?;
            conn.execute("DELETE FROM jobs WHERE id = ?1", params![id])
                .map_err(Self::classify)?;
        }
        Ok(ids.len())
    }

    async fn cache_lookup_exact(&self, fingerprint: &str) -> Result<Option<CacheEntry>, StoreError> {
        let conn = self.conn.lock().await;
        let now = fmt_ts(Utc::now());
        let row: Option<(String, String, String, Option<String>, String, String, i64)> = conn
            .query_row(
                "SELECT fingerprint, bucket, result, query_embedding, created_at, expires_at, hit_count \
                 FROM cache_entries WHERE fingerprint = ?1 AND expires_at > ?2",
                params![fingerprint, now],
                |r| {
                    Ok((
                        r.get(0)?,
                        r.get(1)?,
                        r.get(2)?,
                        r.get(3)?,
                        r.get(4)?,
                        r.get(5)?,
                        r.get(6)?,
                    ))
                },
            )
            .optional()
            .map_err(Self::classify)?;

        let Some((fp, bucket, result, embedding, created_at, expires_at, hit_count)) = row else {
            return Ok(None);
        };

        conn.execute(
            "UPDATE cache_entries SET hit_count = hit_count + 1 WHERE fingerprint = ?1",
            params![fp],
        )
        .map_err(Self::classify)?;

        Ok(Some(CacheEntry {
            fingerprint: fp,
            bucket,
            result: serde_json::from_str(&result).unwrap_or(Value::Null),
            query_embedding: embedding.and_then(|s| serde_json::from_str(&s).ok()),
            created_at: parse_ts(&created_at).unwrap_or_else(Utc::now),
            expires_at: parse_ts(&expires_at).unwrap_or_else(Utc::now),
            hit_count: hit_count as u64 + 1,
        }))
    }

    async fn cache_lookup_semantic(
        &self,
        bucket: &str,
        query_embedding: &Embedding,
        threshold: f32,
    ) -> Result<Option<CacheEntry>, StoreError> {
        let conn = self.conn.lock().await;
        let now = fmt_ts(Utc::now());

        let mut stmt = conn
            .prepare(
                "SELECT fingerprint, result, query_embedding, created_at, expires_at, hit_count \
                 FROM cache_entries WHERE bucket = ?1 AND expires_at > ?2 AND query_embedding IS NOT NULL",
            )
            .map_err(Self::classify)?;
        let rows = stmt
            .query_map(params![bucket, now], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, String>(3)?,
                    r.get::<_, String>(4)?,
                    r.get::<_, i64>(5)?,
                ))
            })
            .map_err(Self::classify)?;

        let mut best: Option<(CacheEntry, f32)> = None;
        for row in rows {
            let (fingerprint, result, embedding_json, created_at, expires_at, hit_count) =
                row.map_err(Self::classify)?;
            let Ok(embedding) = serde_json::from_str::<Embedding>(&embedding_json) else {
                continue;
            };
            let similarity = crate::retrieval::cosine_similarity(query_embedding, &embedding);
            if similarity < threshold {
                continue;
            }
            if best.as_ref().map(|(_, s)| similarity > *s).unwrap_or(true) {
                best = Some((
                    CacheEntry {
                        fingerprint,
                        bucket: bucket.to_string(),
                        result: serde_json::from_str(&result).unwrap_or(Value::Null),
                        query_embedding: Some(embedding),
                        created_at: parse_ts(&created_at).unwrap_or_else(Utc::now),
                        expires_at: parse_ts(&expires_at).unwrap_or_else(Utc::now),
                        hit_count: hit_count as u64,
                    },
                    similarity,
                ));
            }
        }

        if let Some((entry, _)) = &best {
            conn.execute(
                "UPDATE cache_entries SET hit_count = hit_count + 1 WHERE fingerprint = ?1",
                params![entry.fingerprint],
            )
            .map_err(Self::classify)?;
        }

        Ok(best.map(|(entry, _)| entry))
    }

    async fn cache_fill(&self, entry: &CacheEntry) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let result_json =
            serde_json::to_string(&entry.result).map_err(|e| StoreError::Serialization(e.to_string()))?;
        let embedding_json = entry
            .query_embedding
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        conn.execute(
            "INSERT INTO cache_entries (fingerprint, bucket, result, query_embedding, created_at, \
             expires_at, hit_count) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0) \
             ON CONFLICT(fingerprint) DO UPDATE SET \
             bucket = excluded.bucket, result = excluded.result, query_embedding = excluded.query_embedding, \
             created_at = excluded.created_at, expires_at = excluded.expires_at",
            params![
                entry.fingerprint,
                entry.bucket,
                result_json,
                embedding_json,
                fmt_ts(entry.created_at),
                fmt_ts(entry.expires_at),
            ],
        )
        .map_err(Self::classify)?;
        Ok(())
    }

    async fn cache_prune(&self, max_entries: usize) -> Result<usize, StoreError> {
        let conn = self.conn.lock().await;
        let now = fmt_ts(Utc::now());
        let expired = conn
            .execute("DELETE FROM cache_entries WHERE expires_at <= ?1", params![now])
            .map_err(Self::classify)?;

        let total: i64 = conn
            .query_row("SELECT COUNT(*) FROM cache_entries", [], |r| r.get(0))
            .map_err(Self::classify)?;
        let mut evicted = 0usize;
        if total as usize > max_entries {
            let overflow = total as usize - max_entries;
            evicted = conn
                .execute(
                    "DELETE FROM cache_entries WHERE fingerprint IN ( \
                         SELECT fingerprint FROM cache_entries \
                         ORDER BY hit_count ASC, created_at ASC LIMIT ?1 \
                     )",
                    params![overflow as i64],
                )
                .map_err(Self::classify)?;
        }
        Ok(expired + evicted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> SqliteRetrievalStore {
        SqliteRetrievalStore::open_in_memory().unwrap()
    }

    #[tokio::test]
    async fn insert_job_is_idempotent() {
        let store = store();
        let a = store
            .insert_job(JobKind::Research, json!({"query": "x"}), "key-1", ChronoDuration::hours(1), None)
            .await
            .unwrap();
        let b = store
            .insert_job(JobKind::Research, json!({"query": "x"}), "key-1", ChronoDuration::hours(1), None)
            .await
            .unwrap();
        match (a, b) {
            (EnqueueResult::Created(id1), EnqueueResult::Duplicate(id2)) => assert_eq!(id1, id2),
            other => panic!("expected created-then-duplicate, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn claim_next_leased_job_picks_oldest_queued() {
        let store = store();
        store
            .insert_job(JobKind::Research, json!({}), "k1", ChronoDuration::hours(1), None)
            .await
            .unwrap();
        let claimed = store.claim_next_leased_job("worker-1", 30_000).await.unwrap();
        assert!(claimed.is_some());
        assert_eq!(claimed.unwrap().status, JobStatus::Leased);
    }

    #[tokio::test]
    async fn claim_next_leased_job_returns_none_when_empty() {
        let store = store();
        assert!(store.claim_next_leased_job("worker-1", 30_000).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn events_are_gapless_and_ordered() {
        let store = store();
        let job_id = match store
            .insert_job(JobKind::Research, json!({}), "k1", ChronoDuration::hours(1), None)
            .await
            .unwrap()
        {
            EnqueueResult::Created(id) => id,
            _ => unreachable!(),
        };
        let e1 = store.append_event(job_id, "job.started", json!({})).await.unwrap();
        let e2 = store.append_event(job_id, "job.progress", json!({})).await.unwrap();
        assert_eq!(e1.0, 1);
        assert_eq!(e2.0, 2);
        let events = store.read_events(job_id, 0, 10).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_id.0, 1);
        assert_eq!(events[1].event_id.0, 2);
    }

    #[tokio::test]
    async fn finish_job_requires_lease_ownership() {
        let store = store();
        let job_id = match store
            .insert_job(JobKind::Research, json!({}), "k1", ChronoDuration::hours(1), None)
            .await
            .unwrap()
        {
            EnqueueResult::Created(id) => id,
            _ => unreachable!(),
        };
        store.claim_next_leased_job("worker-1", 30_000).await.unwrap();
        let result = store
            .finish_job(job_id, "wrong-worker", JobStatus::Succeeded, json!({}))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn hybrid_search_degrades_without_query_embedding() {
        let store = store();
        store
            .insert_document(&IndexedDocument {
                source_type: "doc".into(),
                source_id: "1".into(),
                title: "rust".into(),
                content: "rust ownership and borrowing".into(),
                doc_embedding: None,
                doc_len: 4,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            })
            .await
            .unwrap();
        let result = store
            .hybrid_search(
                "rust ownership",
                None,
                5,
                SearchScope::Both,
                RetrievalWeights { bm25: 0.7, vector: 0.3 },
                1.2,
                0.75,
            )
            .await
            .unwrap();
        assert!(result.degraded);
        assert_eq!(result.hits.len(), 1);
    }

    #[tokio::test]
    async fn rate_report_sets_and_clears_rating() {
        let store = store();
        let report_id = store
            .insert_report(&Report {
                id: ReportId(0),
                original_query: "q".into(),
                final_report: "r".into(),
                query_embedding: vec![0.0; 4],
                metadata: None,
                created_at: Utc::now(),
                rating: None,
            })
            .await
            .unwrap();

        assert_eq!(store.get_report(report_id).await.unwrap().unwrap().rating, None);

        store.rate_report(report_id, Some(4)).await.unwrap();
        assert_eq!(store.get_report(report_id).await.unwrap().unwrap().rating, Some(4));

        store.rate_report(report_id, None).await.unwrap();
        assert_eq!(store.get_report(report_id).await.unwrap().unwrap().rating, None);
    }

    #[tokio::test]
    async fn rate_report_unknown_id_errors() {
        let store = store();
        let result = store.rate_report(ReportId(9999), Some(3)).await;
        assert!(matches!(result, Err(StoreError::ReportNotFound(_))));
    }
}
