//! JSON control-frame codec. Every TEXT frame on the wire is one of these
//! messages; fields absent on a given variant are omitted rather than
//! serialized as null.

use serde::{Deserialize, Serialize};

use crate::error::ServerError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ControlMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "streamId", skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub length: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ControlMessage {
    fn new(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            stream_id: None,
            offset: None,
            length: None,
            message: None,
        }
    }

    pub fn started(stream_id: impl Into<String>) -> Self {
        let mut m = Self::new("STARTED");
        m.stream_id = Some(stream_id.into());
        m.message = Some("Stream started successfully".to_string());
        m
    }

    pub fn stopped(stream_id: impl Into<String>) -> Self {
        let mut m = Self::new("STOPPED");
        m.stream_id = Some(stream_id.into());
        m.message = Some("Stream finalized successfully".to_string());
        m
    }

    pub fn error(message: impl Into<String>) -> Self {
        let mut m = Self::new("ERROR");
        m.message = Some(message.into());
        m
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("ControlMessage always serializes")
    }
}

/// A decoded, normalized request from a client. `decode` accepts a
/// lowercase or mixed-case `type` tag on input (normalizing it to
/// uppercase) for compatibility with lenient clients, but `ControlMessage`
/// always emits uppercase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Start { stream_id: String },
    Stop { stream_id: String },
    Get { stream_id: String, offset: u64, length: u64 },
}

/// Decodes a TEXT frame payload into a [`Request`]. Malformed JSON and
/// unknown/missing-field messages are reported with the exact literal
/// strings the wire protocol specifies.
pub fn decode(payload: &str) -> Result<Request, ServerError> {
    let raw: ControlMessage = serde_json::from_str(payload)
        .map_err(|_| ServerError::InvalidArgument("Invalid JSON format".to_string()))?;

    match raw.kind.to_uppercase().as_str() {
        "START" => Ok(Request::Start {
            stream_id: require_stream_id(&raw)?,
        }),
        "STOP" => Ok(Request::Stop {
            stream_id: require_stream_id(&raw)?,
        }),
        "GET" => Ok(Request::Get {
            stream_id: require_stream_id(&raw)?,
            offset: raw.offset.unwrap_or(0),
            length: raw
                .length
                .ok_or_else(|| ServerError::InvalidArgument("GET requires a length".to_string()))?,
        }),
        other => Err(ServerError::InvalidArgument(format!(
            "Unknown message type: {other}"
        ))),
    }
}

fn require_stream_id(raw: &ControlMessage) -> Result<String, ServerError> {
    raw.stream_id
        .clone()
        .ok_or_else(|| ServerError::InvalidArgument("missing streamId".to_string()))
}

/// Heuristic used by the handler to decide whether a BINARY frame is
/// actually a mis-sent control frame: small payload, valid UTF-8, and
/// parses as a JSON object carrying a `type` key. Purely a resiliency
/// affordance — raw data this small is rare in practice, and any false
/// positive just gets bounced back as an ERROR frame.
pub const BINARY_CONTROL_FRAME_THRESHOLD: usize = 512;

pub fn looks_like_control_frame(payload: &[u8]) -> bool {
    if payload.len() > BINARY_CONTROL_FRAME_THRESHOLD {
        return false;
    }
    let Ok(text) = std::str::from_utf8(payload) else {
        return false;
    };
    matches!(
        serde_json::from_str::<serde_json::Value>(text),
        Ok(serde_json::Value::Object(map)) if map.contains_key("type")
    )
}
