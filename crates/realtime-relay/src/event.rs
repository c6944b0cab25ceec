//! Client message decoding.
//!
//! A client frame is kept raw until it is about to be forwarded, so frames
//! queued before the upstream is ready are decoded in the same place and the
//! same way as live ones.

use serde_json::{Map, Value};

/// Raw message received from a relay client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    /// UTF-8 text frame.
    Text(String),
    /// Binary frame. Accepted when it holds UTF-8 JSON.
    Binary(Vec<u8>),
}

impl ClientFrame {
    /// Length of the raw payload in bytes.
    pub fn len(&self) -> usize {
        match self {
            Self::Text(text) => text.len(),
            Self::Binary(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lossy text rendering for log lines.
    pub fn preview(&self, max: usize) -> String {
        let text = match self {
            Self::Text(text) => text.clone(),
            Self::Binary(data) => String::from_utf8_lossy(data).into_owned(),
        };
        if text.chars().count() <= max {
            text
        } else {
            let cut: String = text.chars().take(max).collect();
            format!("{cut}...")
        }
    }
}

/// A decoded client event: its `type` and the full JSON object.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientEvent {
    pub event_type: String,
    pub payload: Map<String, Value>,
}

/// Why a client frame could not be decoded.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Frame is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("Frame is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Event is not a JSON object")]
    NotAnObject,

    #[error("Event has no string \"type\" field")]
    MissingType,
}

/// Decode a raw client frame into a typed event.
pub fn decode_client_frame(frame: &ClientFrame) -> Result<ClientEvent, DecodeError> {
    let text = match frame {
        ClientFrame::Text(text) => text.as_str(),
        ClientFrame::Binary(data) => std::str::from_utf8(data)?,
    };
    decode_event(text)
}

/// Decode a JSON text payload into a typed event.
pub fn decode_event(text: &str) -> Result<ClientEvent, DecodeError> {
    let Value::Object(payload) = serde_json::from_str::<Value>(text)? else {
        return Err(DecodeError::NotAnObject);
    };
    let event_type = payload
        .get("type")
        .and_then(Value::as_str)
        .ok_or(DecodeError::MissingType)?
        .to_string();
    Ok(ClientEvent {
        event_type,
        payload,
    })
}
