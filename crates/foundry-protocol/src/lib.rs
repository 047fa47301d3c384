use chrono::SecondsFormat;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod signing;

pub use signing::{
    body_sha256_hex, canonical_query, parse_query, sign, verify, QueryParams, SigningError,
    SigningInput,
};

/// Route prefix shared by every signed endpoint.
pub const API_PREFIX: &str = "/foundry/v1";

/// Authentication header names; all five are required on signed routes.
pub mod headers {
    pub const SIGNATURE: &str = "x-foundry-signature";
    pub const TIMESTAMP: &str = "x-foundry-timestamp";
    pub const NONCE: &str = "x-foundry-nonce";
    pub const BODY_SHA256: &str = "x-foundry-body-sha256";
    pub const REQUEST_ID: &str = "x-foundry-request-id";
    /// Optional operator name checked by the capability gate.
    pub const ACTOR: &str = "x-foundry-actor";
    /// Display filename for uploads.
    pub const FILENAME: &str = "x-foundry-filename";
}

/// RFC7807-style error payload used at service edges.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ProblemDetails {
    pub r#type: String,
    pub title: String,
    pub status: u16,
    pub detail: Option<String>,
    pub instance: Option<String>,
    pub code: Option<String>,
}

/// Body of `POST /foundry/v1/run`.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RunRequest {
    pub command: String,
}

/// Body of `POST /foundry/v1/upload/delete`.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TokenRequest {
    pub token: String,
}

/// Issued token for a staged archive (download or upload).
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct TokenTicket {
    pub token: String,
    pub filename: String,
    pub size: u64,
    pub expires_in: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    CommandStart,
    CommandData,
    CommandOutput,
    CommandProgress,
    CommandComplete,
    CommandError,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::CommandStart => "command_start",
            EventKind::CommandData => "command_data",
            EventKind::CommandOutput => "command_output",
            EventKind::CommandProgress => "command_progress",
            EventKind::CommandComplete => "command_complete",
            EventKind::CommandError => "command_error",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Some(match raw {
            "command_start" => EventKind::CommandStart,
            "command_data" => EventKind::CommandData,
            "command_output" => EventKind::CommandOutput,
            "command_progress" => EventKind::CommandProgress,
            "command_complete" => EventKind::CommandComplete,
            "command_error" => EventKind::CommandError,
            _ => return None,
        })
    }

    /// `command_complete` and `command_error` close a stream.
    pub fn is_terminal(self) -> bool {
        matches!(self, EventKind::CommandComplete | EventKind::CommandError)
    }
}

/// Severity attached to plain-text `command_output` lines.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OutputLevel {
    Error,
    Warning,
    Notice,
    Success,
    Info,
}

impl OutputLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            OutputLevel::Error => "error",
            OutputLevel::Warning => "warning",
            OutputLevel::Notice => "notice",
            OutputLevel::Success => "success",
            OutputLevel::Info => "info",
        }
    }
}

/// One event of a command execution stream.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct StreamEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub timestamp: String,
    pub data: Value,
}

impl StreamEvent {
    pub fn new(kind: EventKind, data: Value) -> Self {
        Self {
            kind,
            timestamp: now_timestamp(),
            data,
        }
    }
}

/// Machine-readable codes carried by `command_error` events.
pub mod codes {
    pub const FAILED_TO_START: &str = "failed_to_start";
    pub const COMMAND_FAILED: &str = "command_failed";
}

pub fn now_timestamp() -> String {
    chrono::Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
