use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

use super::ProtocolError;

/// Analyses the dispatcher knows how to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    Screenshot,
    Performance,
    Images,
    Technologies,
    Seo,
    /// Every concrete task, run in parallel and merged under their own names
    All,
}

impl TaskType {
    /// The task types `All` fans out to
    pub const CONCRETE: [TaskType; 5] = [
        TaskType::Screenshot,
        TaskType::Performance,
        TaskType::Images,
        TaskType::Technologies,
        TaskType::Seo,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Screenshot => "screenshot",
            TaskType::Performance => "performance",
            TaskType::Images => "images",
            TaskType::Technologies => "technologies",
            TaskType::Seo => "seo",
            TaskType::All => "all",
        }
    }

    pub fn is_composite(&self) -> bool {
        matches!(self, TaskType::All)
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "screenshot" => Ok(TaskType::Screenshot),
            "performance" => Ok(TaskType::Performance),
            "images" => Ok(TaskType::Images),
            "technologies" => Ok(TaskType::Technologies),
            "seo" => Ok(TaskType::Seo),
            "all" => Ok(TaskType::All),
            other => Err(ProtocolError::invalid(format!("unknown task type: {}", other))),
        }
    }
}

/// A single protocol message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "message_type", rename_all = "lowercase")]
pub enum Message {
    /// Ask the dispatcher to run a task against a page
    Request {
        task_type: TaskType,
        url: String,
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
        #[serde(default)]
        params: Map<String, Value>,
    },

    /// Successful task result
    Response {
        task_type: TaskType,
        result: Value,
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
        #[serde(default)]
        metadata: Map<String, Value>,
    },

    /// Failure report, always the last message on a connection
    Error {
        #[serde(default)]
        task_type: Option<TaskType>,
        error_message: String,
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
        #[serde(default)]
        details: Map<String, Value>,
    },

    /// Liveness check
    Ping {
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
    },

    /// Answer to a ping
    Pong {
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
        #[serde(default)]
        details: Map<String, Value>,
    },
}

impl Message {
    pub fn request(task_type: TaskType, url: impl Into<String>, params: Map<String, Value>) -> Self {
        Message::Request {
            task_type,
            url: url.into(),
            timestamp: Utc::now(),
            params,
        }
    }

    pub fn response(task_type: TaskType, result: Value, metadata: Map<String, Value>) -> Self {
        Message::Response {
            task_type,
            result,
            timestamp: Utc::now(),
            metadata,
        }
    }

    pub fn error(error_message: impl Into<String>, task_type: Option<TaskType>) -> Self {
        Message::Error {
            task_type,
            error_message: error_message.into(),
            timestamp: Utc::now(),
            details: Map::new(),
        }
    }

    pub fn ping() -> Self {
        Message::Ping { timestamp: Utc::now() }
    }

    pub fn pong(details: Map<String, Value>) -> Self {
        Message::Pong {
            timestamp: Utc::now(),
            details,
        }
    }

    /// Wire name of the discriminator
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Request { .. } => "request",
            Message::Response { .. } => "response",
            Message::Error { .. } => "error",
            Message::Ping { .. } => "ping",
            Message::Pong { .. } => "pong",
        }
    }

    /// Check the per-variant invariants that the type system cannot express
    pub fn validate(&self) -> Result<(), ProtocolError> {
        match self {
            Message::Request { url, .. } if url.trim().is_empty() => {
                Err(ProtocolError::invalid("request without 'url'"))
            }
            Message::Error { error_message, .. } if error_message.trim().is_empty() => {
                Err(ProtocolError::invalid("error without 'error_message'"))
            }
            _ => Ok(()),
        }
    }

    /// Validate a raw JSON payload and turn it into a typed message.
    ///
    /// Field presence is checked on the raw object first so that a missing
    /// field is reported by name rather than as a generic serde error.
    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let object = value
            .as_object()
            .ok_or_else(|| ProtocolError::invalid("message is not a JSON object"))?;

        let kind = object
            .get("message_type")
            .and_then(Value::as_str)
            .ok_or_else(|| ProtocolError::invalid("message without 'message_type'"))?;

        let required: &[&str] = match kind {
            "request" => &["task_type", "url"],
            "response" => &["task_type", "result"],
            "error" => &["error_message"],
            "ping" | "pong" => &[],
            other => {
                return Err(ProtocolError::invalid(format!("unknown message type: {}", other)));
            }
        };

        for field in required {
            if !object.contains_key(*field) {
                return Err(ProtocolError::invalid(format!("{} without '{}'", kind, field)));
            }
        }

        let message: Message =
            serde_json::from_value(value).map_err(|e| ProtocolError::invalid(e.to_string()))?;
        message.validate()?;

        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_task_type_names() {
        for task in TaskType::CONCRETE {
            assert_eq!(task.as_str().parse::<TaskType>().unwrap(), task);
            assert!(!task.is_composite());
        }
        assert_eq!("ALL".parse::<TaskType>().unwrap(), TaskType::All);
        assert!("thumbnails".parse::<TaskType>().is_err());
    }

    #[test]
    fn test_request_wire_shape() {
        let mut params = Map::new();
        params.insert("html".to_string(), json!("<html></html>"));
        let message = Message::request(TaskType::Seo, "https://example.com", params);

        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["message_type"], "request");
        assert_eq!(value["task_type"], "seo");
        assert_eq!(value["url"], "https://example.com");
        assert_eq!(value["params"]["html"], "<html></html>");
        assert!(value["timestamp"].is_string());
    }

    #[test]
    fn test_validation_rejects_missing_fields() {
        let err = Message::from_value(json!({"message_type": "request", "task_type": "seo"}))
            .unwrap_err();
        assert!(err.to_string().contains("'url'"));

        let err = Message::from_value(json!({"message_type": "response", "task_type": "seo"}))
            .unwrap_err();
        assert!(err.to_string().contains("'result'"));

        let err = Message::from_value(json!({"message_type": "error"})).unwrap_err();
        assert!(err.to_string().contains("'error_message'"));

        let err = Message::from_value(json!({"url": "https://example.com"})).unwrap_err();
        assert!(err.to_string().contains("message_type"));
    }

    #[test]
    fn test_validation_rejects_unknown_discriminators() {
        let err = Message::from_value(json!({"message_type": "shutdown"})).unwrap_err();
        assert!(matches!(err, ProtocolError::Invalid(_)));

        let err = Message::from_value(json!({
            "message_type": "request",
            "task_type": "thumbnails",
            "url": "https://example.com"
        }))
        .unwrap_err();
        assert!(matches!(err, ProtocolError::Invalid(_)));
    }

    #[test]
    fn test_validation_rejects_empty_required_strings() {
        let err = Message::from_value(json!({
            "message_type": "request",
            "task_type": "all",
            "url": "  "
        }))
        .unwrap_err();
        assert!(matches!(err, ProtocolError::Invalid(_)));

        assert!(Message::error("", None).validate().is_err());
        assert!(Message::error("boom", Some(TaskType::Seo)).validate().is_ok());
    }

    #[test]
    fn test_optional_fields_default() {
        let message = Message::from_value(json!({
            "message_type": "request",
            "task_type": "images",
            "url": "https://example.com"
        }))
        .unwrap();

        match message {
            Message::Request { task_type, params, .. } => {
                assert_eq!(task_type, TaskType::Images);
                assert!(params.is_empty());
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }
}
