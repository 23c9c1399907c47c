use crate::error::{FrameError, ValidationError};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const MAX_INBOUND_BYTES: usize = 256 * 1024;

/// Inbound message on the chat (turn) channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnRequest {
    Message { text: String },
    SetCwd { path: String },
}

/// Messages the hub synthesizes on the chat channel, interleaved with the
/// agent's own records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEvent {
    State {
        cwd: String,
        session_id: Option<String>,
    },
    Error {
        message: String,
    },
}

impl TurnEvent {
    pub fn state(cwd: impl Into<String>, session_id: Option<String>) -> Self {
        Self::State {
            cwd: cwd.into(),
            session_id,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Connected,
    Error,
    Ended,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TerminalEvent {
    Status {
        status: SessionStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

impl TerminalEvent {
    pub fn status(status: SessionStatus, message: Option<String>) -> Self {
        Self::Status { status, message }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum TerminalControl {
    Resize { cols: u16, rows: u16 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalInput<'a> {
    Resize { cols: u16, rows: u16 },
    Keystrokes(&'a [u8]),
}

pub fn decode_turn_request(data: &[u8]) -> Result<TurnRequest, ValidationError> {
    if data.len() > MAX_INBOUND_BYTES {
        return Err(ValidationError::TooLarge {
            size: data.len(),
            max: MAX_INBOUND_BYTES,
        });
    }
    let request: TurnRequest = serde_json::from_slice(data)
        .map_err(|err| ValidationError::InvalidMessage(err.to_string()))?;
    match &request {
        TurnRequest::Message { text } if text.trim().is_empty() => {
            Err(ValidationError::EmptyInstruction)
        }
        TurnRequest::SetCwd { path } if path.trim().is_empty() => Err(ValidationError::EmptyPath),
        _ => Ok(request),
    }
}

/// Anything that is not a well-formed resize directive is a keystroke.
pub fn parse_terminal_input(data: &[u8]) -> TerminalInput<'_> {
    match serde_json::from_slice::<TerminalControl>(data) {
        Ok(TerminalControl::Resize { cols, rows }) => TerminalInput::Resize {
            cols: cols.max(1),
            rows: rows.max(1),
        },
        Err(_) => TerminalInput::Keystrokes(data),
    }
}

pub fn encode_event<T: Serialize>(event: &T) -> Result<String, FrameError> {
    serde_json::to_string(event).map_err(|err| FrameError::Encode(err.to_string()))
}

/// Extracts the resumable session id from a `system`/`init` record.
pub fn init_session_id(value: &Value) -> Option<&str> {
    let object = value.as_object()?;
    if object.get("type").and_then(Value::as_str) != Some("system") {
        return None;
    }
    if object.get("subtype").and_then(Value::as_str) != Some("init") {
        return None;
    }
    object
        .get("session_id")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
}
