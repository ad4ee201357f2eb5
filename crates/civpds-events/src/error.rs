use std::io;

use civpds_types::TypeError;

/// Errors produced by the event subsystem.
#[derive(Debug, thiserror::Error)]
pub enum EventError {
    /// Internal sentinel: replay reached the first live event.
    #[error("caught up with live stream")]
    CaughtUp,

    /// The subscriber fell behind and was dropped.
    #[error("consumer too slow")]
    ConsumerTooSlow,

    /// The subscription or manager is closed.
    #[error("event stream closed")]
    Closed,

    /// A frame failed to decode.
    #[error("malformed frame: {0}")]
    Frame(String),

    /// A frame carried a message type this node does not understand.
    #[error("unknown message type {0:?}")]
    UnknownType(String),

    /// CRC check failed for a persisted record.
    #[error("crc mismatch at offset {offset}: expected {expected:#010x}, got {actual:#010x}")]
    CrcMismatch {
        offset: u64,
        expected: u32,
        actual: u32,
    },

    /// No pong arrived within the allowed window.
    #[error("no pong received within {0:?}")]
    PongTimeout(std::time::Duration),

    /// Too many consecutive ping writes failed.
    #[error("{0} consecutive ping failures")]
    PingFailures(u32),

    /// The remote end sent an error frame.
    #[error("remote error {error}: {message}")]
    Remote { error: String, message: String },

    /// A firehose address could not be parsed.
    #[error("invalid firehose uri {0:?}")]
    InvalidUri(String),

    /// The handler for consumed events failed.
    #[error("event handler failed: {0}")]
    Handler(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_websockets::Error),

    #[error(transparent)]
    Type(#[from] TypeError),
}

impl EventError {
    /// Network failures worth retrying rather than treating as fatal.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Io(e) => is_transient_io(e),
            Self::WebSocket(tokio_websockets::Error::Io(e)) => is_transient_io(e),
            Self::PongTimeout(_) => true,
            _ => false,
        }
    }
}

/// Reset, refused, aborted and timed-out connections are transient.
pub fn is_transient_io(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::TimedOut
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

/// Result alias for event operations.
pub type EventResult<T> = Result<T, EventError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        for kind in [
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::ConnectionRefused,
            io::ErrorKind::TimedOut,
        ] {
            assert!(EventError::Io(io::Error::from(kind)).is_transient());
        }
        assert!(!EventError::Io(io::Error::from(io::ErrorKind::PermissionDenied)).is_transient());
        assert!(!EventError::Frame("bad".into()).is_transient());
        assert!(EventError::PongTimeout(std::time::Duration::from_secs(60)).is_transient());
    }
}
