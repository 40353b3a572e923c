//! Error types for the Quarry driver.

use std::fmt;
use std::io;

/// Result type for driver operations.
pub type Result<T> = std::result::Result<T, Error>;

/// A server-reported error code.
///
/// Codes are grouped into families by their high bytes; the
/// transaction-conflict family (`0x0503_xxxx`) is the retryable one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ErrorCode(pub u32);

impl ErrorCode {
    pub const INTERNAL_SERVER_ERROR: ErrorCode = ErrorCode(0x0100_0000);
    pub const PROTOCOL_ERROR: ErrorCode = ErrorCode(0x0300_0000);
    pub const QUERY_ERROR: ErrorCode = ErrorCode(0x0400_0000);
    pub const INVALID_SYNTAX_ERROR: ErrorCode = ErrorCode(0x0401_0000);
    pub const EXECUTION_ERROR: ErrorCode = ErrorCode(0x0500_0000);
    pub const CONSTRAINT_VIOLATION_ERROR: ErrorCode = ErrorCode(0x0501_0001);
    pub const TRANSACTION_CONFLICT_ERROR: ErrorCode = ErrorCode(0x0503_0100);
    pub const TRANSACTION_SERIALIZATION_ERROR: ErrorCode = ErrorCode(0x0503_0101);
    pub const TRANSACTION_DEADLOCK_ERROR: ErrorCode = ErrorCode(0x0503_0102);
    pub const ACCESS_ERROR: ErrorCode = ErrorCode(0x0700_0000);

    /// Whether re-running the failed transaction is semantically valid.
    #[inline]
    pub fn is_transaction_conflict(self) -> bool {
        self.0 & 0xffff_0000 == 0x0503_0000
    }

    /// Human-readable name of the code's family.
    pub fn category(self) -> &'static str {
        match self.0 >> 24 {
            0x01 => "InternalServerError",
            0x02 => "UnsupportedFeatureError",
            0x03 => "ProtocolError",
            0x04 => "QueryError",
            0x05 if self.is_transaction_conflict() => "TransactionConflictError",
            0x05 => "ExecutionError",
            0x06 => "ConfigurationError",
            0x07 => "AccessError",
            _ => "UnknownError",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:08x})", self.category(), self.0)
    }
}

/// Errors surfaced by the driver.
#[derive(Debug)]
pub enum Error {
    /// Invalid options at connect time. Fatal, never retried.
    Configuration(String),

    /// Misuse of a closed object or a caller-side invariant violation.
    Interface(String),

    /// Framing or message-level violation. Marks the connection broken.
    Protocol(String),

    /// Malformed descriptor blob, codec/shape mismatch, or bad argument.
    InvalidArgument(String),

    /// Query expected a row and got none.
    NoData(String),

    /// Query expected at most one row and got more.
    ResultCardinalityMismatch(String),

    /// Authentication handshake failed.
    Authentication(String),

    /// Socket read/write failure. Marks the connection broken; retryable.
    Io(io::Error),

    /// The operation deadline fired.
    DeadlineExceeded,

    /// The operation was cancelled by the caller.
    Canceled,

    /// Server-reported error, carried with its category code so the retry
    /// loop can discriminate transient failures.
    Server {
        severity: u8,
        code: ErrorCode,
        message: String,
    },
}

impl Error {
    /// Whether `Pool::retry` may re-run the transaction after this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Io(_) => true,
            Error::Server { code, .. } => code.is_transaction_conflict(),
            _ => false,
        }
    }

    /// Whether this error leaves the connection unusable.
    pub(crate) fn breaks_connection(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::Protocol(_) | Error::DeadlineExceeded | Error::Canceled
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Configuration(msg) => write!(f, "ConfigurationError: {}", msg),
            Error::Interface(msg) => write!(f, "InterfaceError: {}", msg),
            Error::Protocol(msg) => write!(f, "ProtocolError: {}", msg),
            Error::InvalidArgument(msg) => write!(f, "InvalidArgumentError: {}", msg),
            Error::NoData(msg) => write!(f, "NoDataError: {}", msg),
            Error::ResultCardinalityMismatch(msg) => {
                write!(f, "ResultCardinalityMismatchError: {}", msg)
            }
            Error::Authentication(msg) => write!(f, "AuthenticationError: {}", msg),
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::DeadlineExceeded => write!(f, "operation deadline exceeded"),
            Error::Canceled => write!(f, "operation canceled"),
            Error::Server {
                severity,
                code,
                message,
            } => write!(f, "{}: {} [severity {}]", code, message, severity),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_family_is_retryable() {
        for code in [
            ErrorCode::TRANSACTION_CONFLICT_ERROR,
            ErrorCode::TRANSACTION_SERIALIZATION_ERROR,
            ErrorCode::TRANSACTION_DEADLOCK_ERROR,
        ] {
            let err = Error::Server {
                severity: 120,
                code,
                message: "conflict".into(),
            };
            assert!(err.is_retryable(), "{} should be retryable", code);
        }
    }

    #[test]
    fn permanent_server_errors_are_not_retryable() {
        let err = Error::Server {
            severity: 120,
            code: ErrorCode::CONSTRAINT_VIOLATION_ERROR,
            message: "duplicate".into(),
        };
        assert!(!err.is_retryable());
        assert!(!Error::Configuration("bad".into()).is_retryable());
        assert!(!Error::NoData("zero rows".into()).is_retryable());
    }

    #[test]
    fn io_errors_are_retryable_and_break_the_connection() {
        let err = Error::Io(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
        assert!(err.is_retryable());
        assert!(err.breaks_connection());
        assert!(!Error::Interface("closed".into()).breaks_connection());
    }

    #[test]
    fn category_names() {
        assert_eq!(
            ErrorCode::TRANSACTION_SERIALIZATION_ERROR.category(),
            "TransactionConflictError"
        );
        assert_eq!(ErrorCode::INVALID_SYNTAX_ERROR.category(), "QueryError");
        assert_eq!(ErrorCode::ACCESS_ERROR.category(), "AccessError");
    }
}
