//! Task executors: the analyses the dispatcher runs against a fetched page.

pub mod images;
pub mod performance;
pub mod screenshot;
pub mod seo;
pub mod technologies;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use thiserror::Error;
use tracing::debug;

use crate::cli::config::ExecutorSettings;
use crate::protocol::TaskType;

/// Failure of a single job
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("{task} task failed: {message}")]
    Execution { task: TaskType, message: String },

    #[error("{task} task timed out after {secs}s")]
    Timeout { task: TaskType, secs: u64 },

    #[error("worker running {task} task crashed: {message}")]
    WorkerCrashed { task: TaskType, message: String },

    #[error("worker pool error: {0}")]
    Pool(String),

    #[error("{0} is not a single task")]
    Unsupported(TaskType),
}

impl TaskError {
    pub fn execution(task: TaskType, message: impl Into<String>) -> Self {
        TaskError::Execution {
            task,
            message: message.into(),
        }
    }
}

/// Everything a job receives; crosses process boundaries by value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInput {
    pub url: String,
    #[serde(default)]
    pub params: Map<String, Value>,
}

impl TaskInput {
    pub fn new(url: impl Into<String>, params: Map<String, Value>) -> Self {
        Self {
            url: url.into(),
            params,
        }
    }

    /// Page markup sent by the gateway
    pub fn html(&self, task: TaskType) -> Result<&str, TaskError> {
        self.params
            .get("html")
            .and_then(Value::as_str)
            .ok_or_else(|| TaskError::execution(task, "missing 'html' parameter"))
    }

    /// Response headers of the page, with lowercase names
    pub fn headers(&self) -> HashMap<String, String> {
        self.params
            .get("headers")
            .and_then(Value::as_object)
            .map(|headers| {
                headers
                    .iter()
                    .filter_map(|(name, value)| {
                        value.as_str().map(|v| (name.to_ascii_lowercase(), v.to_string()))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Runs one concrete analysis.
///
/// Implementations must be side-effect free from the caller's point of view
/// and safe to run in a separate process.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, task: TaskType, input: &TaskInput) -> Result<Value, TaskError>;
}

/// Default executor backed by the analyzers in this module
pub struct PageAnalyzer {
    settings: ExecutorSettings,
}

impl PageAnalyzer {
    pub fn new(settings: ExecutorSettings) -> Self {
        Self { settings }
    }
}

fn to_result<T: Serialize>(task: TaskType, report: T) -> Result<Value, TaskError> {
    serde_json::to_value(report).map_err(|e| TaskError::execution(task, e.to_string()))
}

#[async_trait]
impl TaskExecutor for PageAnalyzer {
    async fn execute(&self, task: TaskType, input: &TaskInput) -> Result<Value, TaskError> {
        debug!("Running {} task for {}", task, input.url);

        match task {
            TaskType::Seo => to_result(task, seo::analyze(input.html(task)?, &input.url)),
            TaskType::Technologies => to_result(
                task,
                technologies::detect(input.html(task)?, &input.headers()),
            ),
            TaskType::Images => to_result(
                task,
                images::inventory(input.html(task)?, &input.url, self.settings.max_images),
            ),
            TaskType::Performance => {
                to_result(task, performance::measure(input.html(task)?, &input.headers()))
            }
            TaskType::Screenshot => {
                let shot = screenshot::capture(&self.settings, &input.url).await?;
                to_result(task, shot)
            }
            TaskType::All => Err(TaskError::Unsupported(task)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn input_with(params: Value) -> TaskInput {
        let params = params.as_object().cloned().unwrap_or_default();
        TaskInput::new("https://example.com/", params)
    }

    #[test]
    fn test_input_accessors() {
        let input = input_with(json!({
            "html": "<html></html>",
            "headers": {"Server": "nginx", "X-Count": 3}
        }));

        assert_eq!(input.html(TaskType::Seo).unwrap(), "<html></html>");
        let headers = input.headers();
        assert_eq!(headers.get("server").map(String::as_str), Some("nginx"));
        assert!(!headers.contains_key("x-count"));
    }

    #[tokio::test]
    async fn test_missing_html_is_an_error() {
        let analyzer = PageAnalyzer::new(ExecutorSettings::default());
        let input = input_with(json!({}));

        for task in [TaskType::Seo, TaskType::Technologies, TaskType::Images, TaskType::Performance] {
            let err = analyzer.execute(task, &input).await.unwrap_err();
            assert!(matches!(err, TaskError::Execution { task: t, .. } if t == task));
        }
    }

    #[tokio::test]
    async fn test_composite_is_not_executable() {
        let analyzer = PageAnalyzer::new(ExecutorSettings::default());
        let err = analyzer
            .execute(TaskType::All, &input_with(json!({"html": ""})))
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::Unsupported(TaskType::All)));
    }

    #[tokio::test]
    async fn test_seo_runs_through_analyzer() {
        let analyzer = PageAnalyzer::new(ExecutorSettings::default());
        let input = input_with(json!({"html": "<html><head><title>Example</title></head></html>"}));

        let result = analyzer.execute(TaskType::Seo, &input).await.unwrap();
        assert_eq!(result["title"]["text"], "Example");
        assert!(result["score"].is_number());
    }
}
