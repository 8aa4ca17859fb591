//! Read-side boundary operations.

use serde::Serialize;

use crate::db::{final_result_repo, job_repo, page_result_repo, Database};
use crate::error::QueryError;
use crate::job::{FileType, JobStatus, PageStatus};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobStatusView {
    pub job_id: String,
    pub status: JobStatus,
    pub processed_pages: u32,
    pub total_pages: u32,
    pub filename: String,
    pub file_type: FileType,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PageView {
    pub page_number: u32,
    pub extracted_text: String,
    pub confidence_score: f64,
    pub status: PageStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobResultView {
    pub job_id: String,
    pub model: String,
    pub document_overview: String,
    pub markdown_content: String,
    /// Ascending by page number.
    pub page_results: Vec<PageView>,
}

pub fn get_status(db: &Database, job_id: &str) -> Result<JobStatusView, QueryError> {
    let job = job_repo::find_by_id(db, job_id)?
        .ok_or_else(|| QueryError::NotFound(format!("job {}", job_id)))?;

    Ok(JobStatusView {
        job_id: job.job_id,
        status: job.status,
        processed_pages: job.processed_pages,
        total_pages: job.total_pages,
        filename: job.filename,
        file_type: job.file_type,
        model: job.model,
        error_message: job.error_message,
        created_at: job.created_at,
        updated_at: job.updated_at,
        completed_at: job.completed_at,
    })
}

/// Returns the merged document of a completed job.
pub fn get_result(db: &Database, job_id: &str) -> Result<JobResultView, QueryError> {
    let job = job_repo::find_by_id(db, job_id)?
        .ok_or_else(|| QueryError::NotFound(format!("job {}", job_id)))?;

    if job.status != JobStatus::Completed {
        return Err(QueryError::NotReady {
            job_id: job.job_id,
            status: job.status.to_string(),
        });
    }

    let final_result = final_result_repo::find(db, job_id)?
        .ok_or_else(|| QueryError::NotFound(format!("final result for job {}", job_id)))?;

    let page_results = page_result_repo::list_for_job(db, job_id)?
        .into_iter()
        .map(|row| PageView {
            page_number: row.result.page_number,
            extracted_text: row.result.extracted_text,
            confidence_score: row.result.confidence_score,
            status: row.result.status,
        })
        .collect();

    Ok(JobResultView {
        job_id: final_result.job_id,
        model: final_result.model,
        document_overview: final_result.document_overview,
        markdown_content: final_result.markdown_content,
        page_results,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::page_result_repo::PageResult;
    use crate::db::test_support::{insert_job, store};

    #[test]
    fn test_status_of_unknown_job() {
        let db = store();
        assert!(matches!(
            get_status(&db, "nope"),
            Err(QueryError::NotFound(_))
        ));
    }

    #[test]
    fn test_status_reports_progress() {
        let db = store();
        insert_job(&db, "j", 4);
        job_repo::update_processed_pages(&db, "j", 3).unwrap();

        let view = get_status(&db, "j").unwrap();
        assert_eq!(view.status, JobStatus::Processing);
        assert_eq!(view.processed_pages, 3);
        assert_eq!(view.total_pages, 4);
        assert_eq!(view.filename, "scan.pdf");
        assert!(view.error_message.is_none());

        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["status"], "processing");
        assert!(json.get("completed_at").is_none());
    }

    #[test]
    fn test_status_carries_error_message() {
        let db = store();
        insert_job(&db, "j", 1);
        job_repo::mark_error(&db, "j", "summarizer down").unwrap();

        let view = get_status(&db, "j").unwrap();
        assert_eq!(view.status, JobStatus::Error);
        assert_eq!(view.error_message.as_deref(), Some("summarizer down"));
    }

    #[test]
    fn test_result_not_ready_while_processing() {
        let db = store();
        insert_job(&db, "j", 1);
        match get_result(&db, "j") {
            Err(QueryError::NotReady { status, .. }) => assert_eq!(status, "processing"),
            other => panic!("expected NotReady, got {:?}", other),
        }
    }

    #[test]
    fn test_result_of_completed_job() {
        let db = store();
        insert_job(&db, "j", 2);
        for (page, text) in [(2, "beta"), (1, "alpha")] {
            page_result_repo::upsert(
                &db,
                &PageResult {
                    job_id: "j".to_string(),
                    page_number: page,
                    extracted_text: text.to_string(),
                    confidence_score: 0.5,
                    status: PageStatus::Completed,
                    model: "m1".to_string(),
                },
            )
            .unwrap();
        }
        db.with_transaction(|tx| {
            let now = crate::db::now_timestamp();
            job_repo::mark_completed_with_conn(tx, "j", &now)?;
            final_result_repo::insert_once_with_conn(
                tx,
                &final_result_repo::FinalResult {
                    job_id: "j".to_string(),
                    document_overview: "overview".to_string(),
                    markdown_content: "# doc".to_string(),
                    status: JobStatus::Completed,
                    model: "m1".to_string(),
                    created_at: now.clone(),
                },
            )?;
            Ok(())
        })
        .unwrap();

        let view = get_result(&db, "j").unwrap();
        assert_eq!(view.document_overview, "overview");
        let pages: Vec<_> = view.page_results.iter().map(|p| p.page_number).collect();
        assert_eq!(pages, vec![1, 2]);
        assert_eq!(view.page_results[0].extracted_text, "alpha");
    }

    #[test]
    fn test_completed_without_final_result_is_not_found() {
        let db = store();
        insert_job(&db, "j", 1);
        db.with_conn(|conn| {
            job_repo::mark_completed_with_conn(conn, "j", "2024-01-01T00:00:00+00:00")?;
            Ok(())
        })
        .unwrap();

        assert!(matches!(get_result(&db, "j"), Err(QueryError::NotFound(_))));
    }
}
