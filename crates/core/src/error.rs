//! Error types for the vellum document engine.

use thiserror::Error;

/// Primary error type for engine operations.
///
/// Every failure that crosses the wrapper boundary is one of these variants;
/// hosts branch on [`Error::name`] rather than matching message text.
#[derive(Error, Debug)]
pub enum Error {
    #[error("type error: expected {expected}, got {got}")]
    Type {
        expected: &'static str,
        got: &'static str,
    },

    #[error("bad argument: {0}")]
    Argument(String),

    #[error("{0} used after destroy")]
    UseAfterDestroy(&'static str),

    #[error("stale {0} handle")]
    StaleHandle(&'static str),

    #[error("data not ready: need {length} bytes at offset {position}")]
    TryLater { position: u64, length: u64 },

    #[error("data still missing after {0} attempts")]
    RetriesExhausted(u32),

    #[error("password required")]
    NeedsPassword,

    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("unsupported encryption: {0}")]
    UnsupportedEncryption(String),

    #[error("corrupt file: {0}")]
    Corrupt(String),

    #[error("syntax error at offset {pos}: {msg}")]
    Syntax { pos: usize, msg: String },

    #[error("unexpected end of input")]
    UnexpectedEof,

    #[error("object not found: {0}")]
    ObjectNotFound(u32),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("operation aborted")]
    Aborted,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Stable short name for the error class.
    pub fn name(&self) -> &'static str {
        match self {
            Error::Type { .. } => "type-error",
            Error::Argument(_) => "bad-argument",
            Error::UseAfterDestroy(_) => "use-after-destroy",
            Error::StaleHandle(_) => "stale-handle",
            Error::TryLater { .. } => "try-later",
            Error::RetriesExhausted(_) => "retries-exhausted",
            Error::NeedsPassword => "needs-password",
            Error::UnsupportedFormat(_) => "unsupported-format",
            Error::UnsupportedEncryption(_) => "unsupported-encryption",
            Error::Corrupt(_) => "corrupt-file",
            Error::Syntax { .. } => "syntax-error",
            Error::UnexpectedEof => "unexpected-eof",
            Error::ObjectNotFound(_) => "object-not-found",
            Error::Decode(_) => "decode-error",
            Error::Aborted => "aborted",
            Error::Io(_) => "io-error",
        }
    }

    /// True for the try-later signal, which callers may retry after feeding
    /// more data. Every other variant is final for the attempted operation.
    pub fn is_try_later(&self) -> bool {
        matches!(self, Error::TryLater { .. })
    }
}

/// Convenience Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_names_are_stable() {
        assert_eq!(
            Error::Type {
                expected: "matrix",
                got: "rect"
            }
            .name(),
            "type-error"
        );
        assert_eq!(Error::NeedsPassword.name(), "needs-password");
        assert_eq!(
            Error::TryLater {
                position: 0,
                length: 512
            }
            .name(),
            "try-later"
        );
        assert_eq!(Error::UseAfterDestroy("document").name(), "use-after-destroy");
    }

    #[test]
    fn test_try_later_is_retryable() {
        assert!(
            Error::TryLater {
                position: 1024,
                length: 16
            }
            .is_try_later()
        );
        assert!(!Error::Aborted.is_try_later());
        assert!(!Error::RetriesExhausted(10).is_try_later());
    }

    #[test]
    fn test_display_messages() {
        let e = Error::Type {
            expected: "matrix",
            got: "rect",
        };
        assert_eq!(e.to_string(), "type error: expected matrix, got rect");
        let e = Error::Syntax {
            pos: 17,
            msg: "expected dict".into(),
        };
        assert_eq!(e.to_string(), "syntax error at offset 17: expected dict");
    }
}
