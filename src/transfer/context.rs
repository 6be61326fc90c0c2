use super::error::{Outcome, TransferError};
use super::notify::NotificationSink;
use super::TransferConfig;
use crate::options::Negotiated;
use crate::tftp::{ErrorCode, Packet, DEFAULT_BLOCK_SIZE};
use crate::transport::Transport;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::time::Duration;

/// The bytes behind a transfer: a source when we send, a sink when we receive.
pub enum ByteChannel {
    Source(Box<dyn Read + Send>),
    Sink(Box<dyn Write + Send>),
}

/// Everything a state acts upon. Owned by exactly one [`super::Transfer`].
pub struct TransferContext {
    peer: SocketAddr,
    channel: Option<ByteChannel>,
    transport: Box<dyn Transport + Send>,
    notify: Box<dyn NotificationSink + Send>,

    pub(crate) block_size: usize,
    pub(crate) retry_timeout: Duration,
    pub(crate) retry_count: u32,
    tick_interval: Duration,

    /// Sending: the block currently in flight. Receiving: the last block acknowledged.
    pub(crate) block_counter: u16,
    pub(crate) retries_used: u32,
    since_activity: Duration,
    last_sent: Option<Packet>,
    pub(crate) last_received_block: Option<u16>,

    transferred_bytes: u64,
    total_bytes: Option<u64>,
}

impl TransferContext {
    pub(crate) fn new(
        peer: SocketAddr,
        channel: ByteChannel,
        config: &TransferConfig,
        transport: Box<dyn Transport + Send>,
        notify: Box<dyn NotificationSink + Send>,
    ) -> TransferContext {
        TransferContext {
            peer,
            channel: Some(channel),
            transport,
            notify,
            block_size: DEFAULT_BLOCK_SIZE,
            retry_timeout: config.retry_timeout,
            retry_count: config.retry_count,
            tick_interval: config.tick_interval,
            block_counter: 0,
            retries_used: 0,
            since_activity: Duration::ZERO,
            last_sent: None,
            last_received_block: None,
            transferred_bytes: 0,
            total_bytes: None,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn transferred_bytes(&self) -> u64 {
        self.transferred_bytes
    }

    pub fn total_bytes(&self) -> Option<u64> {
        self.total_bytes
    }

    pub fn last_sent(&self) -> Option<&Packet> {
        self.last_sent.as_ref()
    }

    pub(crate) fn set_total_bytes(&mut self, total: Option<u64>) {
        if total.is_some() {
            self.total_bytes = total;
        }
    }

    pub(crate) fn apply_negotiated(&mut self, negotiated: &Negotiated) {
        if let Some(size) = negotiated.block_size {
            self.block_size = size;
        }
        if let Some(timeout) = negotiated.timeout {
            self.retry_timeout = timeout;
        }
        self.set_total_bytes(negotiated.transfer_size);
    }

    fn transmit(&mut self, packet: &Packet) {
        if let Err(e) = self.transport.send(self.peer, packet) {
            // The timer takes care of getting the packet out again.
            log::warn!("Unable to send {:?} to {}: {}", packet.op_code(), self.peer, e);
        }
    }

    /// Sends a packet that moves the transfer forward. It becomes the packet retransmitted on
    /// timeout, and the retry budget starts over.
    pub(crate) fn send(&mut self, packet: Packet) {
        self.transmit(&packet);
        self.last_sent = Some(packet);
        self.retries_used = 0;
        self.since_activity = Duration::ZERO;
    }

    /// Sends an Error packet. Error packets are never acknowledged nor retransmitted.
    pub(crate) fn send_error(&mut self, code: ErrorCode, message: String) {
        self.transmit(&Packet::Error { code, message });
    }

    /// Accounts for one tick. Returns true when a whole retry timeout has passed since the last
    /// activity, in which case the clock starts over.
    pub(crate) fn timer_expired(&mut self) -> bool {
        self.since_activity = self.since_activity.saturating_add(self.tick_interval);
        if self.since_activity < self.retry_timeout {
            return false;
        }
        self.since_activity = Duration::ZERO;
        true
    }

    /// Sends the last packet again and charges it to the retry budget.
    pub(crate) fn resend(&mut self) {
        if let Some(packet) = self.last_sent.take() {
            log::debug!("Retransmitting {:?} to {} (retry {})", packet.op_code(), self.peer, self.retries_used + 1);
            self.transmit(&packet);
            self.last_sent = Some(packet);
        }
        self.retries_used += 1;
    }

    /// Reads the next block from the source. Only a short read (or end of file) yields fewer
    /// than `block_size` bytes.
    pub(crate) fn read_block(&mut self) -> io::Result<Vec<u8>> {
        let source = match self.channel.as_mut() {
            Some(ByteChannel::Source(source)) => source,
            _ => return Err(io::Error::new(io::ErrorKind::Other, "Transfer has no byte source")),
        };

        let mut buf = vec![0_u8; self.block_size];
        let mut cursor = 0;

        // A single call to read is not guaranteed to fill the buffer, so keep reading into the
        // remainder until it is full or the source is exhausted.
        while cursor < buf.len() {
            match source.read(&mut buf[cursor..]) {
                Ok(0) => break,
                Ok(s) => cursor += s,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        buf.truncate(cursor);
        Ok(buf)
    }

    pub(crate) fn write_block(&mut self, data: &[u8]) -> io::Result<()> {
        match self.channel.as_mut() {
            Some(ByteChannel::Sink(sink)) => sink.write_all(data),
            _ => Err(io::Error::new(io::ErrorKind::Other, "Transfer has no byte sink")),
        }
    }

    /// Flushes (for sinks) and drops the byte channel. Further calls do nothing.
    pub(crate) fn release_channel(&mut self) -> io::Result<()> {
        match self.channel.take() {
            Some(ByteChannel::Sink(mut sink)) => sink.flush(),
            Some(ByteChannel::Source(_)) | None => Ok(()),
        }
    }

    pub(crate) fn has_channel(&self) -> bool {
        self.channel.is_some()
    }

    pub(crate) fn add_progress(&mut self, bytes: usize) {
        self.transferred_bytes += bytes as u64;
        self.notify.on_progress(self.transferred_bytes, self.total_bytes);
    }

    pub(crate) fn notify_outcome(&mut self, outcome: &Outcome) {
        match outcome {
            Outcome::Completed => self.notify.on_completed(),
            Outcome::Cancelled(code) => self.notify.on_cancelled(*code),
            Outcome::Failed(error) => self.notify.on_error(error),
        }
    }

    /// Tells the peer why we are giving up after a byte channel failure and returns the error to
    /// close the transfer with.
    pub(crate) fn local_failure(&mut self, e: io::Error) -> TransferError {
        log::error!("Local I/O failure during transfer with {}: {}", self.peer, e);
        self.send_error(ErrorCode::from(e.kind()), format!("Local I/O failure: {}", e));
        TransferError::from(e)
    }
}
