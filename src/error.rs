//! Error types for drivelink.

use thiserror::Error;

/// Main error type for all drivelink operations.
#[derive(Debug, Error)]
pub enum DrivelinkError {
    /// I/O error on the underlying byte stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A received frame failed payload CRC validation.
    #[error("bad frame: {0}")]
    BadFrame(&'static str),

    /// A payload does not fit the MTU, or a packet exceeds the read buffer.
    #[error("buffer too small: {0}")]
    BufferTooSmall(&'static str),

    /// Both the transmit slot and the single pending slot are occupied.
    #[error("endpoint engine busy")]
    Busy,

    /// The operation was cancelled by the caller.
    #[error("operation cancelled")]
    Cancelled,

    /// The underlying transport closed.
    #[error("transport closed")]
    Closed,

    /// Protocol violation (e.g. a sequence number reused while the older
    /// operation was still awaiting its reply).
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl DrivelinkError {
    /// Classify an I/O error from a stream read or write.
    ///
    /// End-of-stream conditions collapse into [`DrivelinkError::Closed`];
    /// everything else stays an I/O error.
    pub(crate) fn from_stream_io(err: std::io::Error) -> Self {
        use std::io::ErrorKind;

        match err.kind() {
            ErrorKind::UnexpectedEof
            | ErrorKind::BrokenPipe
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted => DrivelinkError::Closed,
            _ => DrivelinkError::Io(err),
        }
    }

    /// True for errors that terminate the engine (anything that is not a
    /// per-packet decoding failure).
    pub(crate) fn is_terminal(&self) -> bool {
        !matches!(
            self,
            DrivelinkError::BadFrame(_) | DrivelinkError::BufferTooSmall(_)
        )
    }
}

/// Result type alias using DrivelinkError.
pub type Result<T> = std::result::Result<T, DrivelinkError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error as IoError, ErrorKind};

    #[test]
    fn eof_maps_to_closed() {
        let err = DrivelinkError::from_stream_io(IoError::from(ErrorKind::UnexpectedEof));
        assert!(matches!(err, DrivelinkError::Closed));

        let err = DrivelinkError::from_stream_io(IoError::from(ErrorKind::BrokenPipe));
        assert!(matches!(err, DrivelinkError::Closed));
    }

    #[test]
    fn other_io_errors_stay_io() {
        let err = DrivelinkError::from_stream_io(IoError::from(ErrorKind::PermissionDenied));
        assert!(matches!(err, DrivelinkError::Io(_)));
    }

    #[test]
    fn packet_level_errors_are_not_terminal() {
        assert!(!DrivelinkError::BadFrame("crc").is_terminal());
        assert!(!DrivelinkError::BufferTooSmall("len").is_terminal());
        assert!(DrivelinkError::Closed.is_terminal());
        assert!(DrivelinkError::Io(IoError::other("boom")).is_terminal());
    }
}
