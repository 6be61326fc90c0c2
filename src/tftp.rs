use async_io::Async;
use std::error;
use std::fmt;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;
use tokio::time::error::Elapsed;
use tokio::time::timeout;

/// Block size defined by RFC 1350, used whenever no `blksize` option was negotiated.
pub const DEFAULT_BLOCK_SIZE: usize = 512;

/// Largest block size a peer may negotiate (RFC 2348).
pub const MAX_BLOCK_SIZE: usize = 65464;

/// Opcode plus block number.
const DATA_HEADER_SIZE: usize = 4;

/// Receive buffer large enough for a Data packet with the largest negotiable block size.
const MAX_DATAGRAM_SIZE: usize = DATA_HEADER_SIZE + MAX_BLOCK_SIZE;

///////////////////////////////////////////////////////////////
// Error-handling objects

/// Represents an error returned from the TFTP Socket handler
#[derive(Debug)]
pub enum SocketError {
    IO(io::Error),
    PacketParse(String),
    Timeout(Elapsed),
}

impl error::Error for SocketError {}

impl fmt::Display for SocketError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SocketError::IO(e) => write!(f, "Socket IO error: {}", e),
            SocketError::PacketParse(e) => write!(f, "Packet parsing error: {}", e),
            SocketError::Timeout(e) => write!(f, "Socket IO timeout: {}", e),
        }
    }
}

impl From<io::Error> for SocketError {
    fn from(e: io::Error) -> Self {
        SocketError::IO(e)
    }
}

impl From<Elapsed> for SocketError {
    fn from(e: Elapsed) -> Self {
        SocketError::Timeout(e)
    }
}

pub type TftpResult<T> = Result<T, SocketError>;

/// Represents the mode for a file the client wishes to read or write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode { NetAscii, Octet, Mail }

impl FileMode {
    fn as_str(&self) -> &'static str {
        match self {
            FileMode::NetAscii => "netascii",
            FileMode::Octet => "octet",
            FileMode::Mail => "mail",
        }
    }
}

/// Represents a TFTP Error code surfaced by a TFTP Error packet.
///
/// Codes outside the ones defined by RFC 1350 and RFC 2347 are kept verbatim in `Other` so the
/// peer's code can be reported unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Undefined,
    FileNotFound,
    AccessViolation,
    DiskFull,
    Illegal,
    UnknownTid,
    FileAlreadyExists,
    NoSuchUser,
    OptionNegotiation,
    Other(u16),
}

impl From<u16> for ErrorCode {
    fn from(raw: u16) -> Self {
        match raw {
            0 => ErrorCode::Undefined,
            1 => ErrorCode::FileNotFound,
            2 => ErrorCode::AccessViolation,
            3 => ErrorCode::DiskFull,
            4 => ErrorCode::Illegal,
            5 => ErrorCode::UnknownTid,
            6 => ErrorCode::FileAlreadyExists,
            7 => ErrorCode::NoSuchUser,
            8 => ErrorCode::OptionNegotiation,
            other => ErrorCode::Other(other),
        }
    }
}

impl From<ErrorCode> for u16 {
    fn from(code: ErrorCode) -> u16 {
        match code {
            ErrorCode::Undefined => 0,
            ErrorCode::FileNotFound => 1,
            ErrorCode::AccessViolation => 2,
            ErrorCode::DiskFull => 3,
            ErrorCode::Illegal => 4,
            ErrorCode::UnknownTid => 5,
            ErrorCode::FileAlreadyExists => 6,
            ErrorCode::NoSuchUser => 7,
            ErrorCode::OptionNegotiation => 8,
            ErrorCode::Other(raw) => raw,
        }
    }
}

impl From<io::ErrorKind> for ErrorCode {
    fn from(kind: io::ErrorKind) -> Self {
        match kind {
            io::ErrorKind::NotFound => ErrorCode::FileNotFound,
            io::ErrorKind::PermissionDenied => ErrorCode::AccessViolation,
            io::ErrorKind::AlreadyExists => ErrorCode::FileAlreadyExists,
            io::ErrorKind::WriteZero | io::ErrorKind::OutOfMemory => ErrorCode::DiskFull,
            _ => ErrorCode::Undefined,
        }
    }
}

/// A single `name=value` pair carried by a request or an option acknowledgment (RFC 2347).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TftpOption {
    pub name: String,
    pub value: String,
}

impl TftpOption {
    pub fn new(name: &str, value: impl ToString) -> TftpOption {
        TftpOption { name: name.to_lowercase(), value: value.to_string() }
    }
}

/// An enum representing a TFTP packet and its associated data.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// A read request packet
    ReadReq {
        /// The file path the client wants to read.
        path: String,

        /// The file mode.
        mode: FileMode,

        /// Options the client would like to negotiate, in request order.
        options: Vec<TftpOption>,
    },

    /// A write request packet
    WriteReq {
        path: String,
        mode: FileMode,
        options: Vec<TftpOption>,
    },

    /// A data packet
    Data {
        /// The block number for this data packet.
        block: u16,

        /// The contents of the data itself.
        data: Vec<u8>,
    },

    /// An acknowledgment packet
    Ack {
        /// The block being acknowledged.
        block: u16,
    },

    /// An error packet.
    Error {
        code: ErrorCode,
        message: String,
    },

    /// An option acknowledgment, listing the options the responder accepted.
    OptionAck {
        options: Vec<TftpOption>,
    },
}

fn u16_from_buffer(buf: &[u8]) -> u16 {
    (u16::from(buf[0]) << 8) + u16::from(buf[1])
}

/// Given a buffer, assumes the string begins at the beginning of the buffer and concatenates until
/// it finds a 0 byte, which it assumes terminates the string.
///
/// Returns the string extracted from the buffer as well as the position of the 0 byte in the
/// buffer it was given (or the size of the buffer, if no 0 byte was encountered)
fn string_from_buffer(buf: &[u8]) -> (String, usize) {
    match buf.iter().position(|&c| c == 0x00) {
        Some(end) => (buf[..end].iter().map(|&c| char::from(c)).collect(), end),
        None => (buf.iter().map(|&c| char::from(c)).collect(), buf.len()),
    }
}

/// Utility function for obtaining the TFTP OpCode from a buffer
#[derive(Debug, PartialEq)]
pub enum OpCode { Rrq, Wrq, Data, Ack, Error, Oack }

impl From<&OpCode> for u16 {
    fn from(op: &OpCode) -> u16 {
        match op {
            OpCode::Rrq => 1,
            OpCode::Wrq => 2,
            OpCode::Data => 3,
            OpCode::Ack => 4,
            OpCode::Error => 5,
            OpCode::Oack => 6,
        }
    }
}

fn retrieve_op_code(buf: &[u8]) -> TftpResult<OpCode> {
    let rawcode = u16_from_buffer(&buf[..2]);
    match rawcode {
        1 => Ok(OpCode::Rrq),
        2 => Ok(OpCode::Wrq),
        3 => Ok(OpCode::Data),
        4 => Ok(OpCode::Ack),
        5 => Ok(OpCode::Error),
        6 => Ok(OpCode::Oack),
        _ => Err(SocketError::PacketParse(format!("Unknown opcode retrieved: {rawcode}"))),
    }
}

/// Parses a run of null-terminated `name`, `value` string pairs until the buffer is exhausted.
fn parse_options(mut buf: &[u8]) -> TftpResult<Vec<TftpOption>> {
    let mut options = Vec::new();
    while !buf.is_empty() {
        let (name, name_end) = string_from_buffer(buf);
        if name_end == buf.len() {
            return Err(SocketError::PacketParse(format!("Option '{name}' must be terminated with a null byte!")));
        }
        let rest = &buf[name_end + 1..];
        let (value, value_end) = string_from_buffer(rest);
        if value_end == rest.len() {
            return Err(SocketError::PacketParse(format!("Value of option '{name}' must be terminated with a null byte!")));
        }
        options.push(TftpOption { name: name.to_lowercase(), value });
        buf = &rest[value_end + 1..];
    }
    Ok(options)
}

fn parse_request(buf: &[u8]) -> TftpResult<(String, FileMode, Vec<TftpOption>)> {
    let (path, path_end) = string_from_buffer(buf);

    if path_end == buf.len() {
        return Err(SocketError::PacketParse("Request does not contain a mode, but it needs to!".to_string()));
    }

    let rest = &buf[path_end + 1..];
    let (raw_mode, mode_end) = string_from_buffer(rest);

    if mode_end == rest.len() {
        return Err(SocketError::PacketParse("Mode must be terminated with a null byte!".to_string()));
    }

    let mode = match raw_mode.to_lowercase().as_str() {
        "netascii" => FileMode::NetAscii,
        "octet" => FileMode::Octet,
        "mail" => FileMode::Mail,
        _ => return Err(SocketError::PacketParse(format!("Unknown file mode: '{raw_mode}'"))),
    };

    let options = parse_options(&rest[mode_end + 1..])?;
    Ok((path, mode, options))
}

fn parse_read_req(buf: &[u8]) -> TftpResult<Packet> {
    let (path, mode, options) = parse_request(&buf[2..])?;
    Ok(Packet::ReadReq { path, mode, options })
}

fn parse_write_req(buf: &[u8]) -> TftpResult<Packet> {
    let (path, mode, options) = parse_request(&buf[2..])?;
    Ok(Packet::WriteReq { path, mode, options })
}

fn parse_data(buf: &[u8]) -> TftpResult<Packet> {
    let block = u16_from_buffer(&buf[2..4]);
    Ok(Packet::Data { block, data: Vec::from(&buf[4..]) })
}

fn parse_ack(buf: &[u8]) -> TftpResult<Packet> {
    let block = u16_from_buffer(&buf[2..4]);
    Ok(Packet::Ack { block })
}

fn parse_error(buf: &[u8]) -> TftpResult<Packet> {
    let code = ErrorCode::from(u16_from_buffer(&buf[2..4]));
    let (message, _) = string_from_buffer(&buf[4..]);
    Ok(Packet::Error { code, message })
}

fn parse_option_ack(buf: &[u8]) -> TftpResult<Packet> {
    let options = parse_options(&buf[2..])?;
    Ok(Packet::OptionAck { options })
}

fn push_u16(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_be_bytes());
}

fn push_string(buf: &mut Vec<u8>, s: &str) {
    buf.extend(s.chars().map(|c| if (c as u32) < 256 { c as u8 } else { b'?' }));
    buf.push(0x00);
}

fn push_options(buf: &mut Vec<u8>, options: &[TftpOption]) {
    for option in options {
        push_string(buf, &option.name);
        push_string(buf, &option.value);
    }
}

impl Packet {
    pub fn parse_from_buf(buf: &[u8]) -> TftpResult<Packet> {
        if buf.len() < 2 {
            return Err(SocketError::PacketParse("Packet too short!".to_string()));
        }

        let op = retrieve_op_code(&buf[..2])?;
        // Option acknowledgments are the only packets that may legitimately carry no body.
        if op != OpCode::Oack && buf.len() < 4 {
            return Err(SocketError::PacketParse("Packet too short!".to_string()));
        }

        match op {
            OpCode::Rrq => parse_read_req(buf),
            OpCode::Wrq => parse_write_req(buf),
            OpCode::Data => parse_data(buf),
            OpCode::Ack => parse_ack(buf),
            OpCode::Error => parse_error(buf),
            OpCode::Oack => parse_option_ack(buf),
        }
    }

    pub fn op_code(&self) -> OpCode {
        match self {
            Packet::ReadReq { .. } => OpCode::Rrq,
            Packet::WriteReq { .. } => OpCode::Wrq,
            Packet::Data { .. } => OpCode::Data,
            Packet::Ack { .. } => OpCode::Ack,
            Packet::Error { .. } => OpCode::Error,
            Packet::OptionAck { .. } => OpCode::Oack,
        }
    }

    /// Serializes the packet into its wire representation.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(DATA_HEADER_SIZE);
        push_u16(&mut buf, u16::from(&self.op_code()));
        match self {
            Packet::ReadReq { path, mode, options } | Packet::WriteReq { path, mode, options } => {
                push_string(&mut buf, path);
                push_string(&mut buf, mode.as_str());
                push_options(&mut buf, options);
            },
            Packet::Data { block, data } => {
                push_u16(&mut buf, *block);
                buf.extend_from_slice(data);
            },
            Packet::Ack { block } => push_u16(&mut buf, *block),
            Packet::Error { code, message } => {
                push_u16(&mut buf, (*code).into());
                push_string(&mut buf, message);
            },
            Packet::OptionAck { options } => push_options(&mut buf, options),
        }
        buf
    }
}

///////////////////////////////////////////////////////////////
/// Wrapper around a UDP socket that parses TFTP headers and
/// returns the packets in a more structured format.
pub struct TftpSocket {
    sock: Async<UdpSocket>,
}

impl TftpSocket {
    pub fn bind(addr: SocketAddr) -> TftpResult<TftpSocket> {
        Ok(TftpSocket {
            sock: Async::<UdpSocket>::bind(addr)?,
        })
    }

    pub fn local_addr(&self) -> TftpResult<SocketAddr> {
        Ok(self.sock.get_ref().local_addr()?)
    }

    pub async fn send(&self, packet: &Packet, dst: SocketAddr) -> TftpResult<()> {
        self.sock.send_to(&packet.to_bytes(), dst).await?;
        Ok(())
    }

    /// Waits for the next datagram. A datagram that cannot be decoded is reported as
    /// `SocketError::PacketParse`.
    pub async fn recv(&self) -> TftpResult<(Packet, SocketAddr)> {
        let mut buf = vec![0; MAX_DATAGRAM_SIZE];
        let (total_written, src) = self.sock.recv_from(&mut buf).await?;

        let packet = Packet::parse_from_buf(&buf[..total_written])?;
        Ok((packet, src))
    }

    pub async fn recv_with_timeout(&self, ttl: Duration) -> TftpResult<(Packet, SocketAddr)> {
        timeout(ttl, self.recv()).await?
    }
}
