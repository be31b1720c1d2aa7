//! Mirror error type.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Categorised mirror error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FtpError {
    pub kind: FtpErrorKind,
    pub message: String,
    /// FTP reply code that triggered the error, if any.
    pub code: Option<u16>,
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum FtpErrorKind {
    /// TCP / DNS resolution failure.
    ConnectionFailed,
    /// Wrong username/password.
    AuthFailed,
    /// Server returned a 4xx/5xx for a command.
    CommandRejected,
    /// Data channel could not be established (PASV/EPSV failed).
    DataChannelFailed,
    /// Transfer aborted or incomplete.
    TransferFailed,
    /// Server sent an un-parseable response.
    ProtocolError,
    /// Socket or local file I/O failure.
    IoError,
    /// Operation timed out.
    Timeout,
    /// Control connection dropped.
    Disconnected,
    /// Permission denied on the server.
    PermissionDenied,
    /// File/directory not found on the server.
    NotFound,
    /// Missing or contradictory task parameter.
    InvalidConfig,
    /// Remote tree enumeration could not complete.
    ScanAborted,
    /// A transient failure persisted past the retry policy.
    RetriesExhausted,
    /// Catch-all.
    Unknown,
}

pub type FtpResult<T> = Result<T, FtpError>;

// ── Construction helpers ─────────────────────────────────────────────

impl FtpError {
    pub fn new(kind: FtpErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            message: msg.into(),
            code: None,
            session_id: None,
        }
    }

    pub fn with_code(mut self, code: u16) -> Self {
        self.code = Some(code);
        self
    }

    pub fn with_session(mut self, id: impl Into<String>) -> Self {
        self.session_id = Some(id.into());
        self
    }

    pub fn connection_failed(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::ConnectionFailed, msg)
    }

    pub fn auth_failed(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::AuthFailed, msg)
    }

    pub fn command_rejected(code: u16, msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::CommandRejected, msg).with_code(code)
    }

    pub fn data_channel(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::DataChannelFailed, msg)
    }

    pub fn transfer_failed(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::TransferFailed, msg)
    }

    pub fn protocol_error(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::ProtocolError, msg)
    }

    pub fn io_error(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::IoError, msg)
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::Timeout, msg)
    }

    pub fn disconnected(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::Disconnected, msg)
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::NotFound, msg)
    }

    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::InvalidConfig, msg)
    }

    /// Wrap a failure raised while enumerating the remote tree.
    pub fn scan_aborted(operation: &str, cause: &FtpError) -> Self {
        Self {
            kind: FtpErrorKind::ScanAborted,
            message: format!("remote scan aborted during {}: {}", operation, cause.message),
            code: cause.code,
            session_id: cause.session_id.clone(),
        }
    }

    /// Wrap the last transient failure once the retry budget is spent.
    pub fn retries_exhausted(description: &str, attempts: u32, cause: FtpError) -> Self {
        Self {
            kind: FtpErrorKind::RetriesExhausted,
            message: format!(
                "{} failed after {} attempt(s): {}",
                description, attempts, cause.message
            ),
            code: cause.code,
            session_id: cause.session_id,
        }
    }

    /// Classify an FTP reply code into the most appropriate error kind.
    pub fn from_reply(code: u16, text: &str) -> Self {
        let kind = match code {
            421 => FtpErrorKind::Disconnected,
            425 | 426 => FtpErrorKind::DataChannelFailed,
            430 | 530 => FtpErrorKind::AuthFailed,
            450 | 550 => {
                let lower = text.to_lowercase();
                if lower.contains("permission") || lower.contains("denied") {
                    FtpErrorKind::PermissionDenied
                } else if lower.contains("not found") || lower.contains("no such") {
                    FtpErrorKind::NotFound
                } else {
                    FtpErrorKind::CommandRejected
                }
            }
            451 | 452 | 552 => FtpErrorKind::TransferFailed,
            _ if code >= 400 => FtpErrorKind::CommandRejected,
            _ => FtpErrorKind::Unknown,
        };
        Self {
            kind,
            message: text.to_string(),
            code: Some(code),
            session_id: None,
        }
    }

    /// Whether the failure is a socket/protocol hiccup worth re-issuing.
    ///
    /// Negative replies, configuration problems and scan aborts are never
    /// transient.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            FtpErrorKind::ConnectionFailed
                | FtpErrorKind::DataChannelFailed
                | FtpErrorKind::Disconnected
                | FtpErrorKind::Timeout
                | FtpErrorKind::IoError
        )
    }
}

impl fmt::Display for FtpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(code) = self.code {
            write!(f, "[FTP {:?} {}] {}", self.kind, code, self.message)
        } else {
            write!(f, "[FTP {:?}] {}", self.kind, self.message)
        }
    }
}

impl std::error::Error for FtpError {}

impl From<std::io::Error> for FtpError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::TimedOut {
            Self::timeout(format!("I/O timeout: {}", e))
        } else {
            Self::io_error(e.to_string())
        }
    }
}

impl From<walkdir::Error> for FtpError {
    fn from(e: walkdir::Error) -> Self {
        Self::io_error(format!("local scan: {}", e))
    }
}

impl From<serde_json::Error> for FtpError {
    fn from(e: serde_json::Error) -> Self {
        Self::invalid_config(format!("malformed task configuration: {}", e))
    }
}

impl From<glob::PatternError> for FtpError {
    fn from(e: glob::PatternError) -> Self {
        Self::invalid_config(format!("invalid pattern: {}", e))
    }
}

impl From<FtpError> for String {
    fn from(e: FtpError) -> String {
        e.message
    }
}
