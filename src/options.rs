// Option negotiation (RFC 2347) for the three options this crate understands:
//
// - blksize (RFC 2348): block size in bytes, 8..=65464.
// - timeout (RFC 2349): retransmission timeout in whole seconds, 1..=255.
// - tsize   (RFC 2349): transfer size in bytes. A reader sends 0 and the server answers with the
//   real size; a writer announces the size of the upload.
//
// The requester lists the options it wants in its RRQ/WRQ. The responder answers with an OACK
// carrying the subset it accepted (possibly with a smaller blksize). Options the responder does
// not understand are silently dropped. When nothing was accepted the responder skips the OACK and
// the transfer proceeds as plain RFC 1350.

use crate::tftp::{TftpOption, MAX_BLOCK_SIZE};
use std::error;
use std::fmt;
use std::time::Duration;

pub const BLKSIZE: &str = "blksize";
pub const TIMEOUT: &str = "timeout";
pub const TSIZE: &str = "tsize";

const MIN_BLOCK_SIZE: usize = 8;
const MAX_TIMEOUT_SECS: u64 = 255;

#[derive(Debug, PartialEq)]
pub enum OptionError {
    /// The peer answered with an option we never asked for.
    Unrequested(String),
    /// The peer answered with a value outside what was requested or allowed.
    InvalidValue { name: String, value: String },
}

impl error::Error for OptionError {}

impl fmt::Display for OptionError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Unrequested(name) => write!(f, "Peer acknowledged option '{}' which was not requested", name),
            Self::InvalidValue { name, value } => write!(f, "Invalid value '{}' for option '{}'", value, name),
        }
    }
}

/// The options a requester would like to negotiate.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OptionRequest {
    pub block_size: Option<usize>,
    pub timeout: Option<Duration>,
    /// For reads, any value asks the server to report the size; for writes it announces it.
    pub transfer_size: Option<u64>,
}

impl OptionRequest {
    pub fn is_empty(&self) -> bool {
        self.block_size.is_none() && self.timeout.is_none() && self.transfer_size.is_none()
    }

    /// Builds the option list that goes into an RRQ or WRQ.
    pub fn to_options(&self) -> Vec<TftpOption> {
        let mut options = Vec::new();
        if let Some(size) = self.block_size {
            options.push(TftpOption::new(BLKSIZE, size));
        }
        if let Some(timeout) = self.timeout {
            options.push(TftpOption::new(TIMEOUT, timeout.as_secs().clamp(1, MAX_TIMEOUT_SECS)));
        }
        if let Some(size) = self.transfer_size {
            options.push(TftpOption::new(TSIZE, size));
        }
        options
    }
}

/// Values both sides agreed on. `None` means the option was not negotiated and the default applies.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Negotiated {
    pub block_size: Option<usize>,
    pub timeout: Option<Duration>,
    pub transfer_size: Option<u64>,

    /// The options as they go into an OACK.
    pub accepted: Vec<TftpOption>,
}

fn parse_block_size(value: &str) -> Option<usize> {
    value.parse::<usize>().ok().filter(|size| (MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(size))
}

fn parse_timeout(value: &str) -> Option<Duration> {
    value
        .parse::<u64>()
        .ok()
        .filter(|secs| (1..=MAX_TIMEOUT_SECS).contains(secs))
        .map(Duration::from_secs)
}

/// Responder side: picks the options out of a request that we support.
///
/// `file_size` is the size of the file being read, if the request is a read. A `tsize` option in a
/// read request is answered with that size; in a write request the announced value is echoed back.
pub fn accept(requested: &[TftpOption], file_size: Option<u64>) -> Negotiated {
    let mut negotiated = Negotiated::default();
    for option in requested {
        match option.name.as_str() {
            BLKSIZE => {
                // A client may ask for more than we can take; answer with the largest we allow.
                let size = match option.value.parse::<usize>() {
                    Ok(size) if size >= MIN_BLOCK_SIZE => size.min(MAX_BLOCK_SIZE),
                    _ => continue,
                };
                negotiated.block_size = Some(size);
                negotiated.accepted.push(TftpOption::new(BLKSIZE, size));
            },
            TIMEOUT => {
                if let Some(timeout) = parse_timeout(&option.value) {
                    negotiated.timeout = Some(timeout);
                    negotiated.accepted.push(TftpOption::new(TIMEOUT, timeout.as_secs()));
                }
            },
            TSIZE => {
                let size = match file_size {
                    Some(size) => size,
                    None => match option.value.parse::<u64>() {
                        Ok(size) => size,
                        Err(_) => continue,
                    },
                };
                negotiated.transfer_size = Some(size);
                negotiated.accepted.push(TftpOption::new(TSIZE, size));
            },
            other => log::debug!("Ignoring unsupported option '{}'", other),
        }
    }
    negotiated
}

/// Requester side: validates an OACK against what we asked for.
pub fn apply_ack(requested: &OptionRequest, acked: &[TftpOption]) -> Result<Negotiated, OptionError> {
    let mut negotiated = Negotiated::default();
    let invalid = |option: &TftpOption| OptionError::InvalidValue {
        name: option.name.clone(),
        value: option.value.clone(),
    };

    for option in acked {
        match option.name.as_str() {
            BLKSIZE => {
                let asked = requested.block_size.ok_or_else(|| OptionError::Unrequested(option.name.clone()))?;
                let size = parse_block_size(&option.value)
                    .filter(|size| *size <= asked)
                    .ok_or_else(|| invalid(option))?;
                negotiated.block_size = Some(size);
            },
            TIMEOUT => {
                let asked = requested.timeout.ok_or_else(|| OptionError::Unrequested(option.name.clone()))?;
                let timeout = parse_timeout(&option.value)
                    .filter(|timeout| timeout.as_secs() == asked.as_secs().clamp(1, MAX_TIMEOUT_SECS))
                    .ok_or_else(|| invalid(option))?;
                negotiated.timeout = Some(timeout);
            },
            TSIZE => {
                if requested.transfer_size.is_none() {
                    return Err(OptionError::Unrequested(option.name.clone()));
                }
                negotiated.transfer_size = Some(option.value.parse::<u64>().map_err(|_| invalid(option))?);
            },
            _ => return Err(OptionError::Unrequested(option.name.clone())),
        }
        negotiated.accepted.push(option.clone());
    }
    Ok(negotiated)
}
