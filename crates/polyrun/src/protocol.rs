//! Wire protocol types.
//!
//! The engine serves two contracts: the synchronous execute shape (the
//! [`JobRequest`](crate::types::JobRequest) /
//! [`ExecutionResult`](crate::types::ExecutionResult) pair in
//! [`types`](crate::types)) and the bidirectional streaming session
//! defined here. Transport adapters frame these as JSON; the engine only
//! deals in the tagged messages.

use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{DecodeError, FileEncoding, JobRequest, OutputStream, Stage};

/// How long a streaming session waits for the `init` message.
pub const INIT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid message JSON: {0}")]
    Malformed(String),

    #[error("message has no type field")]
    MissingType,

    #[error("invalid job request: {0}")]
    InvalidRequest(String),
}

/// Message received from the peer.
#[derive(Debug, Clone)]
pub enum ClientMessage {
    /// Starts the job. Exactly once, first.
    Init(JobRequest),
    /// Stdin bytes for the running process.
    Data {
        stream: String,
        data: String,
        encoding: FileEncoding,
    },
    /// Signal to forward to the sandboxed process.
    Signal { signal: String },
    /// Unrecognized message type; non-fatal.
    Unknown(String),
}

impl ClientMessage {
    /// Parse a raw JSON text frame.
    ///
    /// `init` accepts the execute-request fields either inline or under a
    /// `payload` object. Unknown `type` tags parse to
    /// [`ClientMessage::Unknown`] so the session can report them without
    /// dropping the connection.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: serde_json::Value =
            serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

        let tag = value
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or(ProtocolError::MissingType)?;

        match tag {
            "init" => {
                let request_value = match value.get("payload") {
                    Some(payload @ serde_json::Value::Object(_)) => payload.clone(),
                    _ => value.clone(),
                };
                let request: JobRequest = serde_json::from_value(request_value)
                    .map_err(|e| ProtocolError::InvalidRequest(e.to_string()))?;
                Ok(ClientMessage::Init(request))
            }
            "data" => {
                #[derive(Deserialize)]
                struct Data {
                    #[serde(default)]
                    stream: String,
                    #[serde(default)]
                    data: String,
                    #[serde(default)]
                    encoding: Option<String>,
                }
                let data: Data = serde_json::from_value(value)
                    .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
                Ok(ClientMessage::Data {
                    stream: data.stream,
                    data: data.data,
                    encoding: data
                        .encoding
                        .as_deref()
                        .map(FileEncoding::from_tag)
                        .unwrap_or_default(),
                })
            }
            "signal" => {
                #[derive(Deserialize)]
                struct SignalMsg {
                    #[serde(default)]
                    signal: String,
                }
                let msg: SignalMsg = serde_json::from_value(value)
                    .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
                Ok(ClientMessage::Signal { signal: msg.signal })
            }
            other => Ok(ClientMessage::Unknown(other.to_string())),
        }
    }

    /// Decode a `data` payload according to its declared encoding.
    pub fn decode_data(data: &str, encoding: FileEncoding) -> Result<Vec<u8>, DecodeError> {
        encoding.decode(data)
    }
}

/// Message sent to the peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// The resolved runtime, sent before `init_ack`.
    Runtime { language: String, version: String },
    InitAck,
    StageStart {
        stage: Stage,
    },
    Data {
        stream: OutputStream,
        data: String,
        /// `base64` when the chunk is not valid UTF-8; absent otherwise.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        encoding: Option<String>,
    },
    StageEnd {
        stage: Stage,
        code: i32,
    },
    Error {
        message: String,
    },
}

impl ServerMessage {
    /// Wrap an output chunk, falling back to base64 for non-UTF-8 bytes
    /// (JSON strings must be valid UTF-8).
    pub fn data(stream: OutputStream, bytes: Vec<u8>) -> Self {
        match String::from_utf8(bytes) {
            Ok(text) => ServerMessage::Data {
                stream,
                data: text,
                encoding: None,
            },
            Err(err) => ServerMessage::Data {
                stream,
                data: BASE64.encode(err.as_bytes()),
                encoding: Some("base64".to_string()),
            },
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }
}

/// Close code a streaming session ends with. Transport adapters map these
/// onto their framing's close mechanism.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
    /// Normal completion (job finished or peer went away cleanly).
    Completed,
    InitTimeout,
    AlreadyInitialized,
    NotInitialized,
    /// A `data` message addressed a stream other than stdin.
    InvalidStream,
    InvalidSignal,
}

impl CloseCode {
    pub fn code(&self) -> u16 {
        match self {
            CloseCode::Completed => 4999,
            CloseCode::InitTimeout => 4001,
            CloseCode::AlreadyInitialized => 4000,
            CloseCode::NotInitialized => 4003,
            CloseCode::InvalidStream => 4004,
            CloseCode::InvalidSignal => 4005,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            CloseCode::Completed => "Job Completed",
            CloseCode::InitTimeout => "Initialization Timeout",
            CloseCode::AlreadyInitialized => "Already Initialized",
            CloseCode::NotInitialized => "Not yet initialized",
            CloseCode::InvalidStream => "Can only write to stdin",
            CloseCode::InvalidSignal => "Invalid signal",
        }
    }
}
