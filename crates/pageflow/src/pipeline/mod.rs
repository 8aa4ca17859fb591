//! Pipeline stages.
//!
//! The dispatcher fans a document out into page tasks, page workers record one
//! result per page, the completion monitor notices jobs whose pages are all in
//! and the aggregator merges them into the final result.

pub mod aggregator;
pub mod dispatcher;
pub mod monitor;
pub mod page_worker;
pub mod query;

pub use aggregator::Aggregator;
pub use dispatcher::{Dispatcher, Submission, SubmissionReceipt};
pub use monitor::{CompletionMonitor, MonitorScheduler, TickReport};
pub use page_worker::PageWorker;
pub use query::{get_result, get_status, JobResultView, JobStatusView, PageView};
