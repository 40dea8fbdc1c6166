//! Wire protocol for client-kernel communication.
//!
//! Every message is one JSON object per line, internally tagged by `type`.
//! Byte payloads (patches, script output) travel as standard base64.

use std::fmt;

use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

/// Correlation key binding a run request to every message about it.
///
/// Ids are allocated per connection, starting at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(u64);

impl RequestId {
    /// The first id handed out on a fresh connection.
    pub const FIRST: Self = Self(1);

    /// Wrap a raw id.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw numeric value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// The id following this one.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The project state a script runs against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectSpec {
    /// HTTPS remote URL of the project repository.
    pub repo_remote: String,
    /// Remote-tracking commit the patch applies to.
    pub revision: String,
    /// Diff of staged changes against `revision`.
    #[serde(with = "base64_bytes")]
    pub patch: Vec<u8>,
}

/// A script file within a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSpec {
    /// Script path relative to the project root.
    pub path: String,
    pub project: ProjectSpec,
}

/// Verdict for a kernel confirmation prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationVerdict {
    Allowed,
    Denied,
}

/// Credentials offered in answer to a credentials prompt.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Message from client to kernel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Run a script.
    RunRequest { request_id: RequestId, file: FileSpec },
    /// Answer to a credentials prompt. Omitting `credentials` declines.
    CredentialsResponse {
        request_id: RequestId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        credentials: Option<Credentials>,
    },
    /// Answer to a confirmation prompt.
    ConfirmationResponse {
        request_id: RequestId,
        verdict: ConfirmationVerdict,
    },
}

impl ClientMessage {
    /// The request this message initiates or answers.
    #[must_use]
    pub const fn request_id(&self) -> RequestId {
        match self {
            Self::RunRequest { request_id, .. }
            | Self::CredentialsResponse { request_id, .. }
            | Self::ConfirmationResponse { request_id, .. } => *request_id,
        }
    }
}

/// Message from kernel to client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// The script needs credentials.
    CredentialsRequest { request_id: RequestId },
    /// The script needs the user to confirm an action.
    ConfirmationRequest { request_id: RequestId },
    /// The script failed. Terminal.
    Error { request_id: RequestId, message: String },
    /// The script finished. Terminal.
    ScriptOutput {
        request_id: RequestId,
        #[serde(with = "base64_bytes")]
        output: Vec<u8>,
    },
}

impl ServerMessage {
    /// The request this message concerns.
    #[must_use]
    pub const fn request_id(&self) -> RequestId {
        match self {
            Self::CredentialsRequest { request_id }
            | Self::ConfirmationRequest { request_id }
            | Self::Error { request_id, .. }
            | Self::ScriptOutput { request_id, .. } => *request_id,
        }
    }

    /// Whether this message ends its request's lifecycle.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Error { .. } | Self::ScriptOutput { .. })
    }
}

/// Protocol error.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Encode a message as a single line, without the trailing newline.
///
/// Compact JSON escapes control characters, so the result never spans lines.
///
/// # Errors
/// Returns error if serialization fails.
pub fn encode_line<T: Serialize>(message: &T) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(message)?)
}

/// Decode one line into a message.
///
/// # Errors
/// Returns error if the line is not a valid message.
pub fn decode_line<T: for<'de> Deserialize<'de>>(line: &str) -> Result<T, ProtocolError> {
    Ok(serde_json::from_str(line.trim())?)
}

/// Decode one raw frame, as read off the wire, into a message.
///
/// Invalid UTF-8 is reported as a decode error like any other malformed frame.
///
/// # Errors
/// Returns error if the frame is not a valid message.
pub fn decode_frame<T: for<'de> Deserialize<'de>>(frame: &[u8]) -> Result<T, ProtocolError> {
    Ok(serde_json::from_slice(frame.trim_ascii())?)
}

mod base64_bytes {
    use super::BASE64;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer, de::Error as _};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64.decode(encoded.as_bytes()).map_err(D::Error::custom)
    }
}
