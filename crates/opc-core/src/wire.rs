use crate::TaskStatus;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::OnceLock;
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024;

/// Canceled acknowledgements carry this exact `result` string.
pub const CANCEL_SUCCESS_RESULT: &str = "Task canceled successfully";

const HEARTBEAT_PATTERN: &str = r"^\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2}$";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskUpdate {
    pub task_id: String,
    pub status: TaskStatus,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushEvent {
    TaskUpdate(TaskUpdate),
    Log(String),
    TokenUpdate(u64),
    /// Bare timestamp frames the agent emits as a keep-alive.
    Heartbeat(String),
}

impl PushEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            PushEvent::TaskUpdate(_) => "taskUpdate",
            PushEvent::Log(_) => "log",
            PushEvent::TokenUpdate(_) => "tokenUpdate",
            PushEvent::Heartbeat(_) => "heartbeat",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("frame decode failed: {0}")]
    Decode(String),
    #[error("frame has no type discriminator")]
    MissingType,
    #[error("unknown frame type: {0}")]
    UnknownType(String),
    #[error("{kind} frame is missing required field '{field}'")]
    MissingField {
        kind: &'static str,
        field: &'static str,
    },
    #[error("{kind} frame has invalid field '{field}': {reason}")]
    InvalidField {
        kind: &'static str,
        field: &'static str,
        reason: String,
    },
}

pub fn is_heartbeat(text: &str) -> bool {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(HEARTBEAT_PATTERN).expect("heartbeat pattern compiles"))
        .is_match(text)
}

pub fn decode_push_frame(text: &str, max_frame_bytes: usize) -> Result<PushEvent, FrameError> {
    let raw = text.trim();
    if raw.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: raw.len(),
            max: max_frame_bytes,
        });
    }
    if is_heartbeat(raw) {
        return Ok(PushEvent::Heartbeat(raw.to_string()));
    }

    let value: Value =
        serde_json::from_str(raw).map_err(|err| FrameError::Decode(err.to_string()))?;
    let Some(frame) = value.as_object() else {
        return Err(FrameError::Decode("frame is not a JSON object".to_string()));
    };
    let kind = frame
        .get("type")
        .and_then(Value::as_str)
        .ok_or(FrameError::MissingType)?;

    match kind {
        "taskUpdate" => decode_task_update(frame).map(PushEvent::TaskUpdate),
        "log" => match frame.get("data") {
            Some(Value::String(line)) => Ok(PushEvent::Log(line.clone())),
            Some(Value::Null) | None => Err(FrameError::MissingField {
                kind: "log",
                field: "data",
            }),
            Some(other) => Ok(PushEvent::Log(other.to_string())),
        },
        "tokenUpdate" => {
            let total = frame.get("total").ok_or(FrameError::MissingField {
                kind: "tokenUpdate",
                field: "total",
            })?;
            parse_token_total(total).map(PushEvent::TokenUpdate)
        }
        other => Err(FrameError::UnknownType(other.to_string())),
    }
}

fn decode_task_update(frame: &Map<String, Value>) -> Result<TaskUpdate, FrameError> {
    // Task fields may be nested under `data` or sit beside `type`; each field
    // falls back to the top level independently.
    let nested = frame.get("data").and_then(Value::as_object);
    let field = |name: &str| -> Option<&Value> {
        nested
            .and_then(|data| data.get(name))
            .filter(|value| !value.is_null())
            .or_else(|| frame.get(name).filter(|value| !value.is_null()))
    };

    let task_id = match field("taskId") {
        Some(Value::String(id)) if !id.trim().is_empty() => id.clone(),
        Some(Value::Number(id)) => id.to_string(),
        _ => {
            return Err(FrameError::MissingField {
                kind: "taskUpdate",
                field: "taskId",
            })
        }
    };
    let status = match field("status") {
        Some(Value::String(raw)) => {
            raw.parse::<TaskStatus>()
                .map_err(|reason| FrameError::InvalidField {
                    kind: "taskUpdate",
                    field: "status",
                    reason,
                })?
        }
        _ => {
            return Err(FrameError::MissingField {
                kind: "taskUpdate",
                field: "status",
            })
        }
    };
    let message = match field("message") {
        Some(Value::String(text)) => text.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    };

    Ok(TaskUpdate {
        task_id,
        status,
        message,
    })
}

fn parse_token_total(value: &Value) -> Result<u64, FrameError> {
    if let Some(total) = value.as_u64() {
        return Ok(total);
    }
    match value.as_f64() {
        Some(total) if total >= 0.0 && total.is_finite() => Ok(total.round() as u64),
        _ => Err(FrameError::InvalidField {
            kind: "tokenUpdate",
            field: "total",
            reason: format!("expected a non-negative number, got {value}"),
        }),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubmitTaskRequest {
    pub text: String,
    #[serde(rename = "sessionId")]
    pub session_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubmitTaskResponse {
    #[serde(default, rename = "taskId", skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CancelResponse {
    #[serde(default)]
    pub result: String,
}

impl CancelResponse {
    pub fn is_success(&self) -> bool {
        self.result == CANCEL_SUCCESS_RESULT
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserAssistRequest {
    #[serde(rename = "taskId")]
    pub task_id: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserAssistResponse {
    #[serde(default)]
    pub accepted: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(text: &str) -> Result<PushEvent, FrameError> {
        decode_push_frame(text, DEFAULT_MAX_FRAME_BYTES)
    }

    #[test]
    fn task_update_reads_flat_and_nested_shapes() {
        let fields = r#""taskId":"t1","status":"in-progress","message":"ping""#;
        let flat = decode(&format!(r#"{{"type":"taskUpdate",{fields}}}"#)).expect("flat frame");
        let nested = decode(&format!(r#"{{"type":"taskUpdate","data":{{{fields}}}}}"#))
            .expect("nested frame");
        let expected = PushEvent::TaskUpdate(TaskUpdate {
            task_id: "t1".to_string(),
            status: TaskStatus::InProgress,
            message: "ping".to_string(),
        });
        assert_eq!(flat, expected);
        assert_eq!(nested, expected);
    }

    #[test]
    fn task_update_fields_fall_back_individually() {
        let event = decode(
            r#"{"type":"taskUpdate","taskId":42,"data":{"status":"completed"},"message":"done"}"#,
        )
        .expect("mixed frame");
        match event {
            PushEvent::TaskUpdate(update) => {
                assert_eq!(update.task_id, "42");
                assert_eq!(update.status, TaskStatus::Completed);
                assert_eq!(update.message, "done");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn task_update_without_required_fields_is_rejected() {
        assert_eq!(
            decode(r#"{"type":"taskUpdate","status":"completed"}"#),
            Err(FrameError::MissingField {
                kind: "taskUpdate",
                field: "taskId",
            })
        );
        assert_eq!(
            decode(r#"{"type":"taskUpdate","taskId":"t1"}"#),
            Err(FrameError::MissingField {
                kind: "taskUpdate",
                field: "status",
            })
        );
        assert!(matches!(
            decode(r#"{"type":"taskUpdate","taskId":"t1","status":"paused"}"#),
            Err(FrameError::InvalidField { field: "status", .. })
        ));
    }

    #[test]
    fn log_token_and_heartbeat_frames() {
        assert_eq!(
            decode(r#"{"type":"log","data":"clicked button"}"#),
            Ok(PushEvent::Log("clicked button".to_string()))
        );
        assert_eq!(
            decode(r#"{"type":"tokenUpdate","total":1234}"#),
            Ok(PushEvent::TokenUpdate(1234))
        );
        assert_eq!(
            decode(r#"{"type":"tokenUpdate","total":12.6}"#),
            Ok(PushEvent::TokenUpdate(13))
        );
        assert_eq!(
            decode("2026-02-07 21:00:00\n"),
            Ok(PushEvent::Heartbeat("2026-02-07 21:00:00".to_string()))
        );
        assert!(!is_heartbeat("2026-02-07T21:00:00Z"));
    }

    #[test]
    fn malformed_frames_report_errors_instead_of_panicking() {
        assert!(matches!(decode("not json"), Err(FrameError::Decode(_))));
        assert!(matches!(decode("[1,2]"), Err(FrameError::Decode(_))));
        assert_eq!(decode(r#"{"data":"x"}"#), Err(FrameError::MissingType));
        assert_eq!(
            decode(r#"{"type":"executionState"}"#),
            Err(FrameError::UnknownType("executionState".to_string()))
        );
        assert!(matches!(
            decode(r#"{"type":"tokenUpdate","total":-3}"#),
            Err(FrameError::InvalidField { .. })
        ));
        let oversized = format!(r#"{{"type":"log","data":"{}"}}"#, "x".repeat(64));
        assert!(matches!(
            decode_push_frame(&oversized, 32),
            Err(FrameError::OversizedFrame { .. })
        ));
    }

    #[test]
    fn http_bodies_use_camel_case_field_names() {
        let request = SubmitTaskRequest {
            text: "open settings".to_string(),
            session_id: "10.0.0.7".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&request).expect("serialize"),
            serde_json::json!({"text": "open settings", "sessionId": "10.0.0.7"})
        );

        let empty: SubmitTaskResponse = serde_json::from_str("{}").expect("empty body");
        assert_eq!(empty.task_id, None);

        let cancel: CancelResponse =
            serde_json::from_str(r#"{"result":"Task canceled successfully"}"#).expect("cancel");
        assert!(cancel.is_success());
        assert!(!CancelResponse::default().is_success());

        let assist: UserAssistResponse = serde_json::from_str("{}").expect("assist");
        assert!(!assist.accepted);
    }
}
