//! Webhook body and its canonical serialization.

use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::job::JobStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WebhookEvent {
    JobCompleted,
    JobFailed,
}

impl WebhookEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookEvent::JobCompleted => "job.completed",
            WebhookEvent::JobFailed => "job.failed",
        }
    }
}

impl fmt::Display for WebhookEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Notification for a job that reached `done` or `failed`.
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookPayload {
    pub event: WebhookEvent,
    pub job_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub result_summary: Option<Value>,
    /// Already redacted
    pub error: Option<String>,
}

impl WebhookPayload {
    pub fn completed(job_id: Uuid, result_summary: Value) -> Self {
        Self {
            event: WebhookEvent::JobCompleted,
            job_id,
            timestamp: Utc::now(),
            result_summary: Some(result_summary),
            error: None,
        }
    }

    pub fn failed(job_id: Uuid, error: impl Into<String>) -> Self {
        Self {
            event: WebhookEvent::JobFailed,
            job_id,
            timestamp: Utc::now(),
            result_summary: None,
            error: Some(error.into()),
        }
    }

    pub fn status(&self) -> JobStatus {
        match self.event {
            WebhookEvent::JobCompleted => JobStatus::Done,
            WebhookEvent::JobFailed => JobStatus::Failed,
        }
    }

    pub fn to_value(&self) -> Value {
        let mut body = json!({
            "event": self.event.as_str(),
            "job_id": self.job_id.to_string(),
            "status": self.status().as_str(),
            "timestamp": self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
        });
        if let Some(map) = body.as_object_mut() {
            if let Some(summary) = &self.result_summary {
                map.insert("result_summary".into(), summary.clone());
            }
            if let Some(error) = &self.error {
                map.insert("error".into(), Value::String(error.clone()));
            }
        }
        body
    }

    /// The exact bytes that are signed and sent.
    pub fn to_bytes(&self) -> Vec<u8> {
        canonical_json(&self.to_value())
    }
}

/// Serialize with object keys sorted at every level and no whitespace.
pub fn canonical_json(value: &Value) -> Vec<u8> {
    // Serializing a Value into memory cannot fail
    serde_json::to_vec(&sorted(value)).unwrap_or_default()
}

fn sorted(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let mut out = Map::new();
            for (key, value) in entries {
                out.insert(key.clone(), sorted(value));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(sorted).collect()),
        other => other.clone(),
    }
}
