use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub seq: i64,
    #[serde(rename = "type")]
    pub message_type: String,
    pub command: String,
    #[serde(default)]
    pub arguments: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub seq: i64,
    #[serde(rename = "type")]
    pub message_type: String,
    pub request_seq: i64,
    pub success: bool,
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub seq: i64,
    #[serde(rename = "type")]
    pub message_type: String,
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

pub fn make_response(
    seq: i64,
    request_seq: i64,
    command: &str,
    outcome: Result<Option<Value>, String>,
) -> Response {
    let (success, body, message) = match outcome {
        Ok(body) => (true, body, None),
        Err(message) => (false, None, Some(message)),
    };
    Response {
        seq,
        message_type: "response".to_string(),
        request_seq,
        success,
        command: command.to_string(),
        message,
        body,
    }
}

pub fn make_event(seq: i64, event: impl Into<String>, body: Option<Value>) -> Event {
    Event {
        seq,
        message_type: "event".to_string(),
        event: event.into(),
        body,
    }
}
