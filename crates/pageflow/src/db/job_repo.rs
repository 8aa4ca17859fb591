//! Job repository — operations on the `jobs` table.
//!
//! Every status change is guarded by `status = 'processing'` so a terminal
//! job can never be moved again, and `processed_pages` only ever grows.

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{now_timestamp, Database, DatabaseError};
use crate::job::{FileType, JobStatus};

/// A job row from the database.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRow {
    pub job_id: String,
    pub filename: String,
    pub file_type: FileType,
    pub total_pages: u32,
    pub processed_pages: u32,
    pub model: String,
    pub status: JobStatus,
    pub error_message: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub completed_at: Option<String>,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            job_id: row.get("job_id")?,
            filename: row.get("filename")?,
            file_type: row.get("file_type")?,
            total_pages: row.get("total_pages")?,
            processed_pages: row.get("processed_pages")?,
            model: row.get("model")?,
            status: row.get("status")?,
            error_message: row.get("error_message")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
            completed_at: row.get("completed_at")?,
        })
    }
}

/// Fields supplied by the dispatcher when a job is created.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub job_id: String,
    pub filename: String,
    pub file_type: FileType,
    pub total_pages: u32,
    pub model: String,
}

/// Inserts a new job in `processing` state with no processed pages.
pub fn insert(db: &Database, job: &NewJob) -> Result<(), DatabaseError> {
    let now = now_timestamp();
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO jobs (job_id, filename, file_type, total_pages, processed_pages,
             model, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 0, ?5, ?6, ?7, ?7)",
            params![
                job.job_id,
                job.filename,
                job.file_type,
                job.total_pages,
                job.model,
                JobStatus::Processing,
                now,
            ],
        )?;
        Ok(())
    })
}

/// Finds a job by its ID.
pub fn find_by_id(db: &Database, job_id: &str) -> Result<Option<JobRow>, DatabaseError> {
    db.with_conn(|conn| find_with_conn(conn, job_id))
}

pub(crate) fn find_with_conn(
    conn: &Connection,
    job_id: &str,
) -> Result<Option<JobRow>, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT * FROM jobs WHERE job_id = ?1",
            params![job_id],
            JobRow::from_row,
        )
        .optional()?;
    Ok(row)
}

/// Lists all jobs with the given status, oldest first.
pub fn list_by_status(db: &Database, status: JobStatus) -> Result<Vec<JobRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt =
            conn.prepare("SELECT * FROM jobs WHERE status = ?1 ORDER BY created_at ASC")?;
        let rows = stmt
            .query_map(params![status], JobRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Counts jobs with the given status.
pub fn count_by_status(db: &Database, status: JobStatus) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| {
        let count: u64 = conn.query_row(
            "SELECT COUNT(*) FROM jobs WHERE status = ?1",
            params![status],
            |r| r.get(0),
        )?;
        Ok(count)
    })
}

/// Raises `processed_pages` to `count` (capped at `total_pages`) for a job
/// that is still processing. Never lowers the stored value.
///
/// Returns true when the stored value changed.
pub fn update_processed_pages(
    db: &Database,
    job_id: &str,
    count: u32,
) -> Result<bool, DatabaseError> {
    let now = now_timestamp();
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE jobs SET processed_pages = MIN(?2, total_pages), updated_at = ?3
             WHERE job_id = ?1 AND status = 'processing' AND processed_pages < MIN(?2, total_pages)",
            params![job_id, count, now],
        )?;
        Ok(changed > 0)
    })
}

/// Moves a processing job to `completed`. Returns false if the job was not
/// in `processing` (already terminal or unknown).
pub(crate) fn mark_completed_with_conn(
    conn: &Connection,
    job_id: &str,
    completed_at: &str,
) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE jobs SET status = ?2, completed_at = ?3, updated_at = ?3, error_message = NULL
         WHERE job_id = ?1 AND status = 'processing'",
        params![job_id, JobStatus::Completed, completed_at],
    )?;
    Ok(changed > 0)
}

/// Moves a processing job to `error` with a message. Returns false if the
/// job was not in `processing`.
pub fn mark_error(db: &Database, job_id: &str, message: &str) -> Result<bool, DatabaseError> {
    let now = now_timestamp();
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE jobs SET status = ?2, error_message = ?3, updated_at = ?4
             WHERE job_id = ?1 AND status = 'processing'",
            params![job_id, JobStatus::Error, message, now],
        )?;
        Ok(changed > 0)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::{insert_job, store};

    #[test]
    fn test_insert_and_find() {
        let db = store();
        insert_job(&db, "job-1", 3);

        let found = find_by_id(&db, "job-1").unwrap().unwrap();
        assert_eq!(found.filename, "scan.pdf");
        assert_eq!(found.file_type, FileType::Pdf);
        assert_eq!(found.total_pages, 3);
        assert_eq!(found.processed_pages, 0);
        assert_eq!(found.status, JobStatus::Processing);
        assert!(found.completed_at.is_none());
        assert_eq!(found.created_at, found.updated_at);
    }

    #[test]
    fn test_find_nonexistent() {
        let db = store();
        assert!(find_by_id(&db, "nonexistent").unwrap().is_none());
    }

    #[test]
    fn test_duplicate_job_id_rejected() {
        let db = store();
        insert_job(&db, "dup", 1);
        let again = insert(
            &db,
            &NewJob {
                job_id: "dup".to_string(),
                filename: "other.png".to_string(),
                file_type: FileType::Image,
                total_pages: 1,
                model: "m1".to_string(),
            },
        );
        assert!(again.is_err());
    }

    #[test]
    fn test_list_by_status() {
        let db = store();
        insert_job(&db, "a", 1);
        insert_job(&db, "b", 2);
        insert_job(&db, "c", 1);
        mark_error(&db, "c", "boom").unwrap();

        let processing = list_by_status(&db, JobStatus::Processing).unwrap();
        let ids: Vec<_> = processing.iter().map(|j| j.job_id.as_str()).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&"a") && ids.contains(&"b"));
        assert_eq!(count_by_status(&db, JobStatus::Error).unwrap(), 1);
    }

    #[test]
    fn test_processed_pages_is_monotonic_and_capped() {
        let db = store();
        insert_job(&db, "m", 3);

        assert!(update_processed_pages(&db, "m", 2).unwrap());
        assert!(!update_processed_pages(&db, "m", 1).unwrap());
        assert_eq!(find_by_id(&db, "m").unwrap().unwrap().processed_pages, 2);

        assert!(update_processed_pages(&db, "m", 7).unwrap());
        assert_eq!(find_by_id(&db, "m").unwrap().unwrap().processed_pages, 3);
    }

    #[test]
    fn test_mark_completed_only_from_processing() {
        let db = store();
        insert_job(&db, "done", 1);

        let ok = db
            .with_conn(|conn| mark_completed_with_conn(conn, "done", "2026-01-01T00:00:00Z"))
            .unwrap();
        assert!(ok);
        let job = find_by_id(&db, "done").unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.completed_at.as_deref(), Some("2026-01-01T00:00:00Z"));

        // Terminal states have no exits.
        assert!(!mark_error(&db, "done", "late failure").unwrap());
        assert!(!update_processed_pages(&db, "done", 1).unwrap());
        assert_eq!(
            find_by_id(&db, "done").unwrap().unwrap().status,
            JobStatus::Completed
        );
    }

    #[test]
    fn test_mark_error_records_message() {
        let db = store();
        insert_job(&db, "bad", 2);

        assert!(mark_error(&db, "bad", "summarizer unavailable").unwrap());
        let job = find_by_id(&db, "bad").unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Error);
        assert_eq!(job.error_message.as_deref(), Some("summarizer unavailable"));
        assert!(job.completed_at.is_none());

        let completed = db
            .with_conn(|conn| mark_completed_with_conn(conn, "bad", "2026-01-01T00:00:00Z"))
            .unwrap();
        assert!(!completed);
    }
}
