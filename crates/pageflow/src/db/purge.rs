//! Administrative wipe of the job store.

use serde::Serialize;

use super::{Database, DatabaseError};

/// Rows removed by [`purge_all`], per table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PurgeCounts {
    pub final_results: usize,
    pub page_results: usize,
    pub jobs: usize,
}

impl PurgeCounts {
    pub fn total(&self) -> usize {
        self.final_results + self.page_results + self.jobs
    }
}

/// Deletes every final result, page result and job in one transaction.
///
/// Children are deleted before parents so the counts reflect each table
/// rather than cascade effects.
pub fn purge_all(db: &Database) -> Result<PurgeCounts, DatabaseError> {
    let counts = db.with_transaction(|tx| {
        let final_results = tx.execute("DELETE FROM final_results", [])?;
        let page_results = tx.execute("DELETE FROM page_results", [])?;
        let jobs = tx.execute("DELETE FROM jobs", [])?;
        Ok(PurgeCounts {
            final_results,
            page_results,
            jobs,
        })
    })?;

    log::warn!(
        "Purged job store: {} jobs, {} page results, {} final results",
        counts.jobs,
        counts.page_results,
        counts.final_results
    );
    Ok(counts)
}
