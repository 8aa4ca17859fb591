//! Page result repository.
//!
//! At most one row exists per `(job_id, page_number)`. Redelivered page tasks
//! overwrite the previous outcome, keeping the original `created_at`.

use rusqlite::{params, Row};

use super::{now_timestamp, Database, DatabaseError};
use crate::job::PageStatus;

/// Outcome of a single page as written by a page worker.
#[derive(Debug, Clone, PartialEq)]
pub struct PageResult {
    pub job_id: String,
    pub page_number: u32,
    pub extracted_text: String,
    pub confidence_score: f64,
    pub status: PageStatus,
    pub model: String,
}

/// A page result row, including its creation time.
#[derive(Debug, Clone, PartialEq)]
pub struct PageResultRow {
    pub result: PageResult,
    pub created_at: String,
}

impl PageResultRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            result: PageResult {
                job_id: row.get("job_id")?,
                page_number: row.get("page_number")?,
                extracted_text: row.get("extracted_text")?,
                confidence_score: row.get("confidence_score")?,
                status: row.get("status")?,
                model: row.get("model")?,
            },
            created_at: row.get("created_at")?,
        })
    }
}

/// Inserts or replaces the result for a page while its job is `processing`.
///
/// Returns `false` when nothing was written: the job is unknown or already
/// terminal. The status check and the write are one statement, so a job
/// completed concurrently is never touched.
pub fn upsert(db: &Database, result: &PageResult) -> Result<bool, DatabaseError> {
    let now = now_timestamp();
    db.with_conn(|conn| {
        let changed = conn.execute(
            "INSERT INTO page_results
                (job_id, page_number, extracted_text, confidence_score, status, model, created_at)
             SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7
             WHERE EXISTS (SELECT 1 FROM jobs WHERE job_id = ?1 AND status = 'processing')
             ON CONFLICT(job_id, page_number) DO UPDATE SET
                extracted_text = excluded.extracted_text,
                confidence_score = excluded.confidence_score,
                status = excluded.status,
                model = excluded.model",
            params![
                result.job_id,
                result.page_number,
                result.extracted_text,
                result.confidence_score,
                result.status,
                result.model,
                now,
            ],
        )?;
        Ok(changed > 0)
    })
}

/// Number of pages with a recorded outcome, successful or not.
pub fn count_for_job(db: &Database, job_id: &str) -> Result<u32, DatabaseError> {
    db.with_conn(|conn| {
        let count: u32 = conn.query_row(
            "SELECT COUNT(*) FROM page_results WHERE job_id = ?1",
            params![job_id],
            |r| r.get(0),
        )?;
        Ok(count)
    })
}

/// All page results for a job in ascending page order.
pub fn list_for_job(db: &Database, job_id: &str) -> Result<Vec<PageResultRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM page_results WHERE job_id = ?1 ORDER BY page_number ASC",
        )?;
        let rows = stmt
            .query_map(params![job_id], PageResultRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}
