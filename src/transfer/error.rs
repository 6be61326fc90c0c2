use crate::options::OptionError;
use crate::tftp::ErrorCode;
use std::error;
use std::fmt;
use std::io;

/// Why a transfer ended without completing.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferError {
    /// The retry budget for one block ran out without hearing back from the peer.
    Timeout,

    /// The peer sent an Error packet.
    Remote { code: ErrorCode, message: String },

    /// Reading from or writing to the byte channel failed.
    LocalIo { kind: io::ErrorKind, message: String },

    /// The peer's option acknowledgment did not match what was requested.
    OptionNegotiation(String),
}

impl error::Error for TransferError {}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "Timed out waiting for the peer"),
            Self::Remote { code, message } => write!(f, "Peer sent error {:?}: '{}'", code, message),
            Self::LocalIo { kind, message } => write!(f, "Local I/O failure ({:?}): {}", kind, message),
            Self::OptionNegotiation(msg) => write!(f, "Option negotiation failed: {}", msg),
        }
    }
}

impl From<io::Error> for TransferError {
    fn from(e: io::Error) -> TransferError {
        TransferError::LocalIo { kind: e.kind(), message: e.to_string() }
    }
}

impl From<OptionError> for TransferError {
    fn from(e: OptionError) -> TransferError {
        TransferError::OptionNegotiation(e.to_string())
    }
}

/// How a transfer ended. Exactly one outcome is produced per transfer.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Completed,
    Cancelled(ErrorCode),
    Failed(TransferError),
}
