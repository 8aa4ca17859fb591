//! Topics and payloads carried by the broker.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The two durable topics of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topic {
    /// One message per page to extract.
    #[serde(rename = "page-processing")]
    PageProcessing,
    /// "This job looks complete, aggregate it."
    #[serde(rename = "aggregation-trigger")]
    AggregationTrigger,
}

impl Topic {
    pub const ALL: [Topic; 2] = [Topic::PageProcessing, Topic::AggregationTrigger];

    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::PageProcessing => "page-processing",
            Topic::AggregationTrigger => "aggregation-trigger",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single page handed to a page worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageTask {
    pub job_id: String,
    /// 1-based.
    pub page_number: u32,
    /// Base64-encoded page image.
    pub image_data: String,
    #[serde(alias = "llm_model")]
    pub model: String,
}

impl PageTask {
    /// Message key; keeps redeliveries of the same page recognizable in logs.
    pub fn key(&self) -> String {
        format!("{}:{}", self.job_id, self.page_number)
    }
}

/// Published when every page of a job has a result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregationTrigger {
    pub job_id: String,
    pub model: String,
    pub total_pages: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_names() {
        assert_eq!(Topic::PageProcessing.to_string(), "page-processing");
        assert_eq!(Topic::AggregationTrigger.as_str(), "aggregation-trigger");
        assert_eq!(
            serde_json::to_string(&Topic::PageProcessing).unwrap(),
            "\"page-processing\""
        );
    }

    #[test]
    fn test_page_task_wire_format() {
        let task = PageTask {
            job_id: "j1".to_string(),
            page_number: 2,
            image_data: "aGVsbG8=".to_string(),
            model: "m1".to_string(),
        };
        let value = serde_json::to_value(&task).unwrap();
        assert_eq!(value["job_id"], "j1");
        assert_eq!(value["page_number"], 2);
        assert_eq!(value["image_data"], "aGVsbG8=");
        assert_eq!(value["model"], "m1");
        assert_eq!(task.key(), "j1:2");
    }

    #[test]
    fn test_page_task_accepts_llm_model_alias() {
        let json = r#"{"job_id":"j1","page_number":1,"image_data":"","llm_model":"gemini-2.5-pro"}"#;
        let task: PageTask = serde_json::from_str(json).unwrap();
        assert_eq!(task.model, "gemini-2.5-pro");
    }

    #[test]
    fn test_page_task_rejects_missing_fields() {
        let json = r#"{"job_id":"j1","image_data":"","model":"m1"}"#;
        assert!(serde_json::from_str::<PageTask>(json).is_err());
    }

    #[test]
    fn test_trigger_wire_format() {
        let json = r#"{"job_id":"j1","model":"m1","total_pages":3}"#;
        let trigger: AggregationTrigger = serde_json::from_str(json).unwrap();
        assert_eq!(trigger.total_pages, 3);
    }
}
