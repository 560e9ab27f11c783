use std::{error, fmt, io, string::FromUtf8Error};

use camino::FromPathBufError;

use crate::path::PathBuf;

/// NT status code as returned by an SMB2 server
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct NtStatus(pub u32);

impl NtStatus {
    pub fn is_success(self) -> bool {
        self.0 == 0
    }

    pub fn name(self) -> Option<&'static str> {
        let name = match self.0 {
            0x0000_0000 => "STATUS_SUCCESS",
            0x0000_0103 => "STATUS_PENDING",
            0x8000_0005 => "STATUS_BUFFER_OVERFLOW",
            0x8000_0006 => "STATUS_NO_MORE_FILES",
            0xC000_000D => "STATUS_INVALID_PARAMETER",
            0xC000_000F => "STATUS_NO_SUCH_FILE",
            0xC000_0016 => "STATUS_MORE_PROCESSING_REQUIRED",
            0xC000_0022 => "STATUS_ACCESS_DENIED",
            0xC000_0033 => "STATUS_OBJECT_NAME_INVALID",
            0xC000_0034 => "STATUS_OBJECT_NAME_NOT_FOUND",
            0xC000_0035 => "STATUS_OBJECT_NAME_COLLISION",
            0xC000_003A => "STATUS_OBJECT_PATH_NOT_FOUND",
            0xC000_0043 => "STATUS_SHARING_VIOLATION",
            0xC000_0056 => "STATUS_DELETE_PENDING",
            0xC000_006D => "STATUS_LOGON_FAILURE",
            0xC000_0072 => "STATUS_ACCOUNT_DISABLED",
            0xC000_00BA => "STATUS_FILE_IS_A_DIRECTORY",
            0xC000_00C9 => "STATUS_NETWORK_NAME_DELETED",
            0xC000_00CC => "STATUS_BAD_NETWORK_NAME",
            0xC000_0101 => "STATUS_DIRECTORY_NOT_EMPTY",
            0xC000_0103 => "STATUS_NOT_A_DIRECTORY",
            0xC000_0203 => "STATUS_USER_SESSION_DELETED",
            0xC000_035C => "STATUS_NETWORK_SESSION_EXPIRED",
            _ => return None,
        };
        Some(name)
    }
}

impl fmt::Display for NtStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "NTSTATUS 0x{:08X}", self.0),
        }
    }
}

/// Errors of a deployment run.
///
/// The variants follow how a failure must be handled: connectivity problems
/// are fatal, transient I/O is retried, local file errors escalate at once.
#[derive(Debug, Clone)]
pub enum Error {
    /// Server did not answer the reachability probe
    Unreachable(String),
    /// Authentication was refused
    Auth(String),
    /// The share does not exist on the server
    ShareNotFound(String),
    /// The connection dropped, a reconnect is needed
    Disconnected(String),
    Timeout(String),
    Io(String),
    Protocol { status: NtStatus, context: String },
    /// Remote content does not match the source after a transfer
    Integrity(String),
    /// Error on the local publish tree
    Local(String),
    Path(PathBuf, String),
    Config(String),
    Cancelled,
    Utf8(String),
    Other(String),
}

impl Error {
    /// Whether the retry policy may attempt the operation again
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Disconnected(..)
                | Self::Timeout(..)
                | Self::Io(..)
                | Self::Protocol { .. }
                | Self::Integrity(..)
        )
    }

    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            Self::Unreachable(..) | Self::Auth(..) | Self::ShareNotFound(..)
        )
    }

    pub fn status(&self) -> Option<NtStatus> {
        match self {
            Self::Protocol { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unreachable(msg) => write!(f, "Server unreachable: {msg}"),
            Self::Auth(msg) => write!(f, "Authentication failed: {msg}"),
            Self::ShareNotFound(share) => write!(f, "Share not found: {share}"),
            Self::Disconnected(msg) => write!(f, "Connection lost: {msg}"),
            Self::Timeout(msg) => write!(f, "Timed out: {msg}"),
            Self::Io(msg) => write!(f, "IO error: {msg}"),
            Self::Protocol { status, context } => write!(f, "{context}: {status}"),
            Self::Integrity(msg) => write!(f, "Integrity check failed: {msg}"),
            Self::Local(msg) => write!(f, "Local file error: {msg}"),
            Self::Path(path, reason) => write!(f, "{reason}: `{path}`"),
            Self::Config(msg) => write!(f, "Configuration error: {msg}"),
            Self::Cancelled => f.write_str("Cancelled"),
            Self::Utf8(msg) => write!(f, "Non UTF-8 string: {msg}"),
            Self::Other(msg) => f.write_str(msg),
        }
    }
}

impl error::Error for Error {}

impl From<FromUtf8Error> for Error {
    fn from(value: FromUtf8Error) -> Self {
        Self::Utf8(String::from_utf8_lossy(&value.into_bytes()).to_string())
    }
}

impl From<FromPathBufError> for Error {
    fn from(value: FromPathBufError) -> Self {
        Self::Utf8(value.as_path().as_os_str().to_string_lossy().to_string())
    }
}

impl From<io::Error> for Error {
    fn from(value: io::Error) -> Self {
        match value.kind() {
            io::ErrorKind::TimedOut => Self::Timeout(value.to_string()),
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::NotConnected => Self::Disconnected(value.to_string()),
            _ => Self::Io(value.to_string()),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Self::Config(value.to_string())
    }
}

impl From<anyhow::Error> for Error {
    fn from(value: anyhow::Error) -> Self {
        Self::Other(format!("{value:#}"))
    }
}

impl From<String> for Error {
    fn from(value: String) -> Self {
        Self::Other(value)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[macro_export]
macro_rules! io_bail {
    ($($t:tt)*) => {
        return ::core::result::Result::Err($crate::Error::Io(format!($($t)*)));
    };
}

#[macro_export]
macro_rules! local_bail {
    ($($t:tt)*) => {
        return ::core::result::Result::Err($crate::Error::Local(format!($($t)*)));
    };
}

#[macro_export]
macro_rules! other_bail {
    ($($t:tt)*) => {
        return ::core::result::Result::Err($crate::Error::Other(format!($($t)*)));
    };
}

#[macro_export]
macro_rules! io_error {
    ($($t:tt)*) => {
        $crate::Error::Io(format!($($t)*))
    };
}

#[macro_export]
macro_rules! local_error {
    ($($t:tt)*) => {
        $crate::Error::Local(format!($($t)*))
    };
}

#[macro_export]
macro_rules! protocol_error {
    ($status:expr, $($t:tt)*) => {
        $crate::Error::Protocol {
            status: $status,
            context: format!($($t)*),
        }
    };
}

#[macro_export]
macro_rules! other_error {
    ($($t:tt)*) => {
        $crate::Error::Other(format!($($t)*))
    };
}
