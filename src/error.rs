//! Error types for FreeSWITCH ESL operations.
//!
//! All fallible operations in this crate return [`EslResult<T>`].  Errors are
//! classified into two axes for caller convenience:
//!
//! - **Connection errors** ([`EslError::is_connection_error`]) — the TCP session
//!   is dead and the caller should reconnect.
//! - **Recoverable errors** ([`EslError::is_recoverable`]) — the command failed
//!   but the connection is still usable (e.g., timeout, command rejected).

use thiserror::Error;

/// Result type alias for ESL operations
pub type EslResult<T> = Result<T, EslError>;

/// Error types for ESL operations
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum EslError {
    /// IO error from underlying TCP operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Connection is not established or lost
    #[error("Not connected to FreeSWITCH")]
    NotConnected,

    /// Authentication failed
    #[error("Authentication failed: {reason}")]
    AuthFailed { reason: String },

    /// A header line without a `Name: Value` separator
    #[error("Malformed header line: {line}")]
    MalformedHeader { line: String },

    /// The stream ended before a length-delimited body completed
    #[error("Unexpected EOF: {needed} body bytes outstanding")]
    UnexpectedEof { needed: usize },

    /// `Content-Length` is not a number or exceeds the message size limit
    #[error("Invalid Content-Length: {value}")]
    InvalidContentLength { value: String },

    /// A frame with a content-type the core does not understand.
    ///
    /// Warn-only: the handler logs the frame and drops it without tearing
    /// down the connection.
    #[error("Unsupported content type: {content_type}")]
    UnsupportedContentType { content_type: String },

    /// Command returned `-ERR` with an error message from FreeSWITCH
    #[error("Command failed: {reply_text}")]
    CommandError { reply_text: String },

    /// A `bgapi` reply arrived without the `Job-UUID` header
    #[error("bgapi reply missing Job-UUID header")]
    MissingJobUuid,

    /// A background job was registered twice under the same UUID
    #[error("Duplicate background job id: {job_uuid}")]
    DuplicateJobId { job_uuid: String },

    /// Timeout waiting for a reply or a background job
    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// Connection closed while a reply or job was outstanding
    #[error("Connection closed by FreeSWITCH")]
    ConnectionClosed,

    /// Protocol error - invalid message framing or state
    #[error("Protocol error: {message}")]
    ProtocolError { message: String },

    /// JSON parsing error
    #[error("JSON parsing error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// XML parsing error
    #[error("XML parsing error: {0}")]
    XmlError(#[from] quick_xml::Error),

    /// UTF-8 conversion error
    #[error("UTF-8 conversion error: {0}")]
    Utf8Error(#[from] std::str::Utf8Error),

    /// Buffer overflow - message too large
    #[error("Buffer overflow: message size {size} exceeds limit {limit}")]
    BufferOverflow { size: usize, limit: usize },
}

impl EslError {
    pub fn protocol_error(message: impl Into<String>) -> Self {
        Self::ProtocolError {
            message: message.into(),
        }
    }

    pub fn auth_failed(reason: impl Into<String>) -> Self {
        Self::AuthFailed {
            reason: reason.into(),
        }
    }

    pub fn malformed_header(line: impl Into<String>) -> Self {
        Self::MalformedHeader { line: line.into() }
    }

    /// `true` if the connection is still usable and the caller can retry.
    ///
    /// Recoverable: `Timeout`, `CommandError`, `MissingJobUuid`,
    /// `DuplicateJobId`, `UnsupportedContentType`.  Non-recoverable errors
    /// (I/O, auth, framing, disconnect) mean the connection is dead and the
    /// caller should reconnect.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            EslError::Timeout { .. }
                | EslError::CommandError { .. }
                | EslError::MissingJobUuid
                | EslError::DuplicateJobId { .. }
                | EslError::UnsupportedContentType { .. }
        )
    }

    /// `true` if the TCP session is dead and the caller should reconnect.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            EslError::Io(_)
                | EslError::NotConnected
                | EslError::ConnectionClosed
                | EslError::UnexpectedEof { .. }
        )
    }
}
