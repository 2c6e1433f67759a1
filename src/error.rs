//! Bridge error taxonomy
//!
//! Every fault that reaches the recovery engine is classified into an
//! [`ErrorCode`], which keys the static strategy table in `recovery`.

use thiserror::Error;

/// Classified error codes used by the recovery strategy table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    DeviceNotFound,
    ConnectionFailed,
    InitializationFailed,
    ProtocolWriteFailed,
    HeartbeatTimeout,
    Unknown,
}

impl ErrorCode {
    /// Stable string form used in event payloads and diagnostics.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::DeviceNotFound => "device_not_found",
            ErrorCode::ConnectionFailed => "connection_failed",
            ErrorCode::InitializationFailed => "initialization_failed",
            ErrorCode::ProtocolWriteFailed => "protocol_write_failed",
            ErrorCode::HeartbeatTimeout => "heartbeat_timeout",
            ErrorCode::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors surfaced by the bridge.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("no grid controller found matching {patterns:?}")]
    DeviceNotFound { patterns: Vec<String> },

    #[error("failed to open device channels: {0}")]
    ConnectionFailed(String),

    #[error("device initialization failed: {0}")]
    InitializationFailed(String),

    #[error("protocol write failed: {0}")]
    ProtocolWriteFailed(String),

    #[error("heartbeat timeout: no message for {elapsed_ms}ms")]
    HeartbeatTimeout { elapsed_ms: u64 },

    #[error("{0}")]
    Other(String),
}

impl BridgeError {
    /// Classify this error for the recovery strategy table.
    ///
    /// Typed variants map directly; `Other` falls back to keyword matching
    /// on the message, mirroring how foreign driver errors get bucketed.
    pub fn code(&self) -> ErrorCode {
        match self {
            BridgeError::DeviceNotFound { .. } => ErrorCode::DeviceNotFound,
            BridgeError::ConnectionFailed(_) => ErrorCode::ConnectionFailed,
            BridgeError::InitializationFailed(_) => ErrorCode::InitializationFailed,
            BridgeError::ProtocolWriteFailed(_) => ErrorCode::ProtocolWriteFailed,
            BridgeError::HeartbeatTimeout { .. } => ErrorCode::HeartbeatTimeout,
            BridgeError::Other(msg) => classify_message(msg),
        }
    }
}

/// Keyword fallback for errors that arrive as plain strings.
pub fn classify_message(message: &str) -> ErrorCode {
    let lower = message.to_lowercase();
    if lower.contains("not found") || lower.contains("no device") {
        ErrorCode::DeviceNotFound
    } else if lower.contains("timeout") || lower.contains("stale") {
        ErrorCode::HeartbeatTimeout
    } else if lower.contains("port") || lower.contains("connect") {
        ErrorCode::ConnectionFailed
    } else if lower.contains("write") || lower.contains("send") {
        ErrorCode::ProtocolWriteFailed
    } else {
        ErrorCode::Unknown
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
