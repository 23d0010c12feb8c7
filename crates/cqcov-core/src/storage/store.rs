use super::{BatchJobStore, JobClaim, RunRecordStore, StoreError};
use crate::model::{
    now_utc, BatchCounts, BatchId, BatchJob, BatchStatus, NewRunRecord, Outcome, PairKey,
    RunRecord, RunRecordId, Selection,
};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// SQLite-backed store. Clones share one connection.
#[derive(Clone)]
pub struct Store {
    pub(crate) conn: Arc<Mutex<Connection>>,
}

const RECORD_COLUMNS: &str = "id, project_id, cq_id, mt_id, outcome, row_count, failure_reason, \
     data_revision, query_sha256, batch_id, duration_ms, created_at";

const JOB_COLUMNS: &str = "id, project_id, cqs_json, mts_json, force_rerun, status, total_pairs, \
     scheduled_pairs, skipped_pairs, completed_pairs, failed_pairs, error, created_at, completed_at";

impl Store {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute_batch(crate::storage::schema::DDL)?;
        migrate_batch_jobs(&conn)?;
        Ok(())
    }

    pub fn count_run_records(&self, project_id: &str) -> Result<u64, StoreError> {
        let conn = self.lock()?;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM run_records WHERE project_id = ?1",
            params![project_id],
            |r| r.get(0),
        )?;
        Ok(n as u64)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }
}

impl RunRecordStore for Store {
    fn append(&self, record: &NewRunRecord) -> Result<RunRecordId, StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO run_records(project_id, cq_id, mt_id, outcome, row_count, failure_reason,
                                     data_revision, query_sha256, batch_id, duration_ms, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                record.project_id,
                record.cq_id,
                record.mt_id,
                record.outcome.as_str(),
                record.row_count.map(|v| v as i64),
                record.failure_reason,
                record.data_revision,
                record.query_sha256,
                record.batch_id,
                record.duration_ms.map(|v| v as i64),
                format_ts(&record.created_at),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn latest_by_pair(
        &self,
        project_id: &str,
        cq_id: &str,
        mt_id: &str,
    ) -> Result<Option<RunRecord>, StoreError> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM run_records
             WHERE project_id = ?1 AND cq_id = ?2 AND mt_id = ?3
             ORDER BY created_at DESC, id DESC
             LIMIT 1"
        );
        let raw = conn
            .query_row(&sql, params![project_id, cq_id, mt_id], read_raw_record)
            .optional()?;
        raw.map(RunRecord::try_from).transpose()
    }

    fn all_latest_for_universe(
        &self,
        project_id: &str,
        cq_ids: &[String],
        mt_ids: &[String],
    ) -> Result<HashMap<PairKey, RunRecord>, StoreError> {
        if cq_ids.is_empty() || mt_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let cq_set: HashSet<&str> = cq_ids.iter().map(String::as_str).collect();
        let mt_set: HashSet<&str> = mt_ids.iter().map(String::as_str).collect();

        let conn = self.lock()?;
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM (
                 SELECT r.*, ROW_NUMBER() OVER (
                     PARTITION BY r.cq_id, r.mt_id
                     ORDER BY r.created_at DESC, r.id DESC
                 ) AS rn
                 FROM run_records r
                 WHERE r.project_id = ?1
             )
             WHERE rn = 1"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![project_id], read_raw_record)?;

        let mut out = HashMap::new();
        for raw in rows {
            let rec = RunRecord::try_from(raw?)?;
            if cq_set.contains(rec.cq_id.as_str()) && mt_set.contains(rec.mt_id.as_str()) {
                out.insert(PairKey::new(rec.cq_id.clone(), rec.mt_id.clone()), rec);
            }
        }
        Ok(out)
    }

    fn history_for_pair(
        &self,
        project_id: &str,
        cq_id: &str,
        mt_id: &str,
        limit: u32,
    ) -> Result<Vec<RunRecord>, StoreError> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM run_records
             WHERE project_id = ?1 AND cq_id = ?2 AND mt_id = ?3
             ORDER BY created_at DESC, id DESC
             LIMIT ?4"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![project_id, cq_id, mt_id, limit], read_raw_record)?;

        let mut out = Vec::new();
        for raw in rows {
            out.push(RunRecord::try_from(raw?)?);
        }
        Ok(out)
    }
}

impl BatchJobStore for Store {
    fn create_batch_job(&self, job: &BatchJob) -> Result<BatchId, StoreError> {
        let conn = self.lock()?;
        insert_job(&conn, job)
    }

    fn claim_batch_job(
        &self,
        job: &BatchJob,
        stale_before: DateTime<Utc>,
    ) -> Result<JobClaim, StoreError> {
        let mut conn = self.lock()?;
        // IMMEDIATE: the database write lock is held from the check through the insert.
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let abandoned = tx.execute(
            "UPDATE batch_jobs
             SET status = 'failed', completed_at = ?3, updated_at = ?3,
                 error = COALESCE(error,
                     'abandoned: no progress since ' || COALESCE(updated_at, created_at))
             WHERE project_id = ?1 AND status IN ('queued', 'running')
               AND COALESCE(updated_at, created_at) < ?2",
            params![
                job.project_id,
                format_ts(&stale_before),
                format_ts(&now_utc())
            ],
        )?;
        if abandoned > 0 {
            tracing::warn!(
                event = "cqcov.batch.abandoned",
                project = %job.project_id,
                jobs = abandoned,
                "stale batch jobs marked failed"
            );
        }

        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM batch_jobs
             WHERE project_id = ?1 AND status IN ('queued', 'running')
             ORDER BY id DESC
             LIMIT 1"
        );
        let active = tx
            .query_row(&sql, params![job.project_id], read_raw_job)
            .optional()?;
        let claim = match active {
            Some(raw) => JobClaim::Busy(BatchJob::try_from(raw)?),
            None => JobClaim::Created(insert_job(&tx, job)?),
        };
        tx.commit()?;
        Ok(claim)
    }

    fn save_batch_job(&self, job: &BatchJob) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE batch_jobs
             SET status = ?1, total_pairs = ?2, scheduled_pairs = ?3, skipped_pairs = ?4,
                 completed_pairs = MAX(completed_pairs, ?5), failed_pairs = MAX(failed_pairs, ?6),
                 error = ?7, completed_at = ?8, updated_at = ?10
             WHERE id = ?9 AND status NOT IN ('completed', 'cancelled', 'failed')",
            params![
                job.status.as_str(),
                job.counts.total_pairs as i64,
                job.counts.scheduled_pairs as i64,
                job.counts.skipped_pairs as i64,
                job.counts.completed_pairs as i64,
                job.counts.failed_pairs as i64,
                job.error,
                job.completed_at.as_ref().map(format_ts),
                job.id,
                format_ts(&now_utc()),
            ],
        )?;
        Ok(())
    }

    fn get_batch_job(&self, id: BatchId) -> Result<Option<BatchJob>, StoreError> {
        let conn = self.lock()?;
        let sql = format!("SELECT {JOB_COLUMNS} FROM batch_jobs WHERE id = ?1");
        let raw = conn.query_row(&sql, params![id], read_raw_job).optional()?;
        raw.map(BatchJob::try_from).transpose()
    }
}

fn insert_job(conn: &Connection, job: &BatchJob) -> Result<BatchId, StoreError> {
    conn.execute(
        "INSERT INTO batch_jobs(project_id, cqs_json, mts_json, force_rerun, status,
                                total_pairs, scheduled_pairs, skipped_pairs, completed_pairs,
                                failed_pairs, error, created_at, completed_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        params![
            job.project_id,
            serde_json::to_string(&job.cqs)?,
            serde_json::to_string(&job.mts)?,
            job.force_rerun,
            job.status.as_str(),
            job.counts.total_pairs as i64,
            job.counts.scheduled_pairs as i64,
            job.counts.skipped_pairs as i64,
            job.counts.completed_pairs as i64,
            job.counts.failed_pairs as i64,
            job.error,
            format_ts(&job.created_at),
            job.completed_at.as_ref().map(format_ts),
            format_ts(&now_utc()),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Databases created before job heartbeats lack `updated_at`.
fn migrate_batch_jobs(conn: &Connection) -> Result<(), StoreError> {
    let cols = get_columns(conn, "batch_jobs")?;
    add_column_if_missing(conn, &cols, "batch_jobs", "updated_at", "TEXT")
}

fn get_columns(conn: &Connection, table: &str) -> Result<HashSet<String>, StoreError> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(1))?;
    let mut out = HashSet::new();
    for r in rows {
        out.insert(r?);
    }
    Ok(out)
}

fn add_column_if_missing(
    conn: &Connection,
    cols: &HashSet<String>,
    table: &str,
    col: &str,
    ty: &str,
) -> Result<(), StoreError> {
    if !cols.contains(col) {
        conn.execute(&format!("ALTER TABLE {} ADD COLUMN {} {}", table, col, ty), [])?;
    }
    Ok(())
}

pub(crate) fn format_ts(ts: &DateTime<Utc>) -> String {
    // Fixed-width UTC so lexical order in SQL equals chronological order.
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| StoreError::InvalidRow(format!("bad timestamp '{}': {}", s, e)))
}

struct RawRecord {
    id: i64,
    project_id: String,
    cq_id: String,
    mt_id: String,
    outcome: String,
    row_count: Option<i64>,
    failure_reason: Option<String>,
    data_revision: String,
    query_sha256: Option<String>,
    batch_id: Option<i64>,
    duration_ms: Option<i64>,
    created_at: String,
}

fn read_raw_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRecord> {
    Ok(RawRecord {
        id: row.get(0)?,
        project_id: row.get(1)?,
        cq_id: row.get(2)?,
        mt_id: row.get(3)?,
        outcome: row.get(4)?,
        row_count: row.get(5)?,
        failure_reason: row.get(6)?,
        data_revision: row.get(7)?,
        query_sha256: row.get(8)?,
        batch_id: row.get(9)?,
        duration_ms: row.get(10)?,
        created_at: row.get(11)?,
    })
}

impl TryFrom<RawRecord> for RunRecord {
    type Error = StoreError;

    fn try_from(raw: RawRecord) -> Result<Self, Self::Error> {
        let outcome = Outcome::parse(&raw.outcome)
            .ok_or_else(|| StoreError::InvalidRow(format!("unknown outcome '{}'", raw.outcome)))?;
        Ok(RunRecord {
            id: raw.id,
            project_id: raw.project_id,
            cq_id: raw.cq_id,
            mt_id: raw.mt_id,
            outcome,
            row_count: raw.row_count.map(|v| v.max(0) as u64),
            failure_reason: raw.failure_reason,
            data_revision: raw.data_revision,
            query_sha256: raw.query_sha256,
            batch_id: raw.batch_id,
            duration_ms: raw.duration_ms.map(|v| v.max(0) as u64),
            created_at: parse_ts(&raw.created_at)?,
        })
    }
}

struct RawJob {
    id: i64,
    project_id: String,
    cqs_json: String,
    mts_json: String,
    force_rerun: bool,
    status: String,
    counts: [i64; 5],
    error: Option<String>,
    created_at: String,
    completed_at: Option<String>,
}

fn read_raw_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawJob> {
    Ok(RawJob {
        id: row.get(0)?,
        project_id: row.get(1)?,
        cqs_json: row.get(2)?,
        mts_json: row.get(3)?,
        force_rerun: row.get(4)?,
        status: row.get(5)?,
        counts: [
            row.get(6)?,
            row.get(7)?,
            row.get(8)?,
            row.get(9)?,
            row.get(10)?,
        ],
        error: row.get(11)?,
        created_at: row.get(12)?,
        completed_at: row.get(13)?,
    })
}

impl TryFrom<RawJob> for BatchJob {
    type Error = StoreError;

    fn try_from(raw: RawJob) -> Result<Self, Self::Error> {
        let status = BatchStatus::parse(&raw.status)
            .ok_or_else(|| StoreError::InvalidRow(format!("unknown status '{}'", raw.status)))?;
        let cqs: Selection = serde_json::from_str(&raw.cqs_json)?;
        let mts: Selection = serde_json::from_str(&raw.mts_json)?;
        let [total, scheduled, skipped, completed, failed] = raw.counts.map(|v| v.max(0) as u64);
        Ok(BatchJob {
            id: raw.id,
            project_id: raw.project_id,
            cqs,
            mts,
            force_rerun: raw.force_rerun,
            status,
            counts: BatchCounts {
                total_pairs: total,
                scheduled_pairs: scheduled,
                skipped_pairs: skipped,
                completed_pairs: completed,
                failed_pairs: failed,
            },
            error: raw.error,
            created_at: parse_ts(&raw.created_at)?,
            completed_at: raw.completed_at.as_deref().map(parse_ts).transpose()?,
        })
    }
}
