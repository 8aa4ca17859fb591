//! Final result repository.
//!
//! A job has at most one final result. The aggregator writes it together with
//! the job's transition to `completed` in a single transaction.

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{Database, DatabaseError};
use crate::job::JobStatus;

/// The merged output of a completed job.
#[derive(Debug, Clone, PartialEq)]
pub struct FinalResult {
    pub job_id: String,
    pub document_overview: String,
    pub markdown_content: String,
    pub status: JobStatus,
    pub model: String,
    pub created_at: String,
}

impl FinalResult {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            job_id: row.get("job_id")?,
            document_overview: row.get("document_overview")?,
            markdown_content: row.get("markdown_content")?,
            status: row.get("status")?,
            model: row.get("model")?,
            created_at: row.get("created_at")?,
        })
    }
}

pub fn exists(db: &Database, job_id: &str) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let found: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM final_results WHERE job_id = ?1)",
            params![job_id],
            |r| r.get(0),
        )?;
        Ok(found)
    })
}

/// Inserts the final result unless one already exists.
///
/// Returns false when a row for the job was already present.
pub(crate) fn insert_once_with_conn(
    conn: &Connection,
    result: &FinalResult,
) -> Result<bool, DatabaseError> {
    let inserted = conn.execute(
        "INSERT INTO final_results
            (job_id, document_overview, markdown_content, status, model, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(job_id) DO NOTHING",
        params![
            result.job_id,
            result.document_overview,
            result.markdown_content,
            result.status,
            result.model,
            result.created_at,
        ],
    )?;
    Ok(inserted > 0)
}

pub fn find(db: &Database, job_id: &str) -> Result<Option<FinalResult>, DatabaseError> {
    db.with_conn(|conn| {
        let row = conn
            .query_row(
                "SELECT * FROM final_results WHERE job_id = ?1",
                params![job_id],
                FinalResult::from_row,
            )
            .optional()?;
        Ok(row)
    })
}
