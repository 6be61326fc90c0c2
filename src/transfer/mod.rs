// The transfer engine drives one file transfer from request to close.
//
// A `Transfer` owns a `TransferContext` and exactly one active `State`. It is fed three kinds of
// stimuli: decoded packets from the peer (`deliver`), timer ticks (`tick`) and cancel requests
// (`cancel`). The engine never touches a socket or a clock itself. Outgoing packets go to a
// `Transport`, what happens is reported to a `NotificationSink`, and the caller decides when ticks
// happen. That keeps the whole state machine testable without a network.

mod context;
mod error;
mod notify;
mod state;

pub use context::{ByteChannel, TransferContext};
pub use error::{Outcome, TransferError};
pub use notify::{LogSink, NotificationSink, TransferEvent};
pub use state::{Direction, StateKind};

use crate::options::{Negotiated, OptionRequest};
use crate::tftp::{ErrorCode, FileMode, Packet};
use crate::transport::Transport;
use state::{Next, State};
use std::io::{Read, Write};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

pub const DEFAULT_RETRY_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_RETRY_COUNT: u32 = 5;
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(100);

/// Tunables for a single transfer.
///
/// There is no block size here: it is 512 bytes (RFC 1350) unless a `blksize` option was
/// negotiated, and both ends have to agree on it.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferConfig {
    /// How long to wait for the peer before retransmitting. Zero makes every tick a timeout.
    pub retry_timeout: Duration,

    /// How many times one packet is retransmitted before the transfer times out.
    pub retry_count: u32,

    /// How much time one call to `tick` stands for.
    pub tick_interval: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            retry_timeout: DEFAULT_RETRY_TIMEOUT,
            retry_count: DEFAULT_RETRY_COUNT,
            tick_interval: DEFAULT_TICK_INTERVAL,
        }
    }
}

/// Which end of the conversation this transfer is, and the bytes it moves.
pub enum Role {
    /// We asked the peer for a file; received data goes into `sink`.
    ReadRequester {
        path: String,
        mode: FileMode,
        options: OptionRequest,
        sink: Box<dyn Write + Send>,
    },

    /// We asked the peer to accept a file read from `source`.
    WriteRequester {
        path: String,
        mode: FileMode,
        options: OptionRequest,
        source: Box<dyn Read + Send>,
    },

    /// The peer asked us for a file. `file_size` is reported as the progress total when known.
    ReadResponder {
        negotiated: Negotiated,
        file_size: Option<u64>,
        source: Box<dyn Read + Send>,
    },

    /// The peer asked to send us a file.
    WriteResponder {
        negotiated: Negotiated,
        sink: Box<dyn Write + Send>,
    },
}

/// One file transfer. See the module documentation.
pub struct Transfer {
    context: TransferContext,
    state: State,
    started: bool,
    outcome: Option<Outcome>,
}

impl Transfer {
    pub fn new(
        peer: SocketAddr,
        role: Role,
        config: &TransferConfig,
        transport: Box<dyn Transport + Send>,
        notify: Box<dyn NotificationSink + Send>,
    ) -> Transfer {
        let (channel, initial, negotiated, total) = match role {
            Role::ReadRequester { path, mode, options, sink } => {
                let request = Packet::ReadReq { path, mode, options: options.to_options() };
                (ByteChannel::Sink(sink), State::SendReadRequest { request, options }, None, None)
            },
            Role::WriteRequester { path, mode, options, source } => {
                let total = options.transfer_size;
                let request = Packet::WriteReq { path, mode, options: options.to_options() };
                (ByteChannel::Source(source), State::SendWriteRequest { request, options }, None, total)
            },
            Role::ReadResponder { negotiated, file_size, source } => {
                let initial = if negotiated.accepted.is_empty() {
                    State::sending()
                } else {
                    State::SendOptionAck { options: negotiated.accepted.clone(), direction: Direction::Send }
                };
                (ByteChannel::Source(source), initial, Some(negotiated), file_size)
            },
            Role::WriteResponder { negotiated, sink } => {
                let initial = if negotiated.accepted.is_empty() {
                    State::AcknowledgeWriteRequest
                } else {
                    State::SendOptionAck { options: negotiated.accepted.clone(), direction: Direction::Receive }
                };
                (ByteChannel::Sink(sink), initial, Some(negotiated), None)
            },
        };

        let mut context = TransferContext::new(peer, channel, config, transport, notify);
        if let Some(negotiated) = &negotiated {
            context.apply_negotiated(negotiated);
        }
        context.set_total_bytes(total);
        // A responder sending without an OACK starts with block 1 straight away.
        if let State::Sending { .. } = initial {
            context.block_counter = 1;
        }

        Transfer { context, state: initial, started: false, outcome: None }
    }

    /// Installs the initial state and performs its entry action. Calling it again does nothing.
    pub fn start(&mut self) {
        if self.started || self.is_closed() {
            return;
        }
        self.started = true;
        log::debug!("Starting transfer with {} in state {:?}", self.context.peer(), self.state.kind());
        let next = self.state.on_enter(&mut self.context);
        self.apply(next);
    }

    /// Hands a decoded packet from the peer to the current state.
    pub fn deliver(&mut self, packet: Packet) {
        if !self.started {
            return;
        }
        let next = self.state.on_command(&mut self.context, packet);
        self.apply(next);
    }

    /// Reports that one tick interval has passed.
    pub fn tick(&mut self) {
        if !self.started {
            return;
        }
        let next = self.state.on_timer(&mut self.context);
        self.apply(next);
    }

    /// Aborts the transfer, telling the peer `code`. Does nothing once the transfer is closed.
    pub fn cancel(&mut self, code: ErrorCode) {
        if !self.started {
            // Nothing was sent yet, so there is nobody to tell.
            self.apply(Next::Close(Outcome::Cancelled(code)));
            return;
        }
        let next = self.state.on_cancel(&mut self.context, code);
        self.apply(next);
    }

    pub fn state(&self) -> StateKind {
        self.state.kind()
    }

    pub fn is_closed(&self) -> bool {
        self.outcome.is_some()
    }

    /// How the transfer ended, once it has.
    pub fn outcome(&self) -> Option<&Outcome> {
        self.outcome.as_ref()
    }

    pub fn context(&self) -> &TransferContext {
        &self.context
    }

    fn apply(&mut self, mut next: Next) {
        loop {
            next = match next {
                Next::Stay => return,
                Next::Enter(state) => {
                    log::trace!("{}: {:?} -> {:?}", self.context.peer(), self.state.kind(), state.kind());
                    self.state = state;
                    self.state.on_enter(&mut self.context)
                },
                Next::Forward(state, packet) => {
                    self.state = state;
                    match self.state.on_enter(&mut self.context) {
                        Next::Stay => self.state.on_command(&mut self.context, packet),
                        other => other,
                    }
                },
                Next::Close(outcome) => {
                    if self.outcome.is_some() {
                        return;
                    }
                    self.state = State::Closed;
                    self.outcome = Some(state::close(&mut self.context, outcome));
                    return;
                },
            }
        }
    }
}

/// A transfer shared between the tasks that feed it.
///
/// Every stimulus takes the lock, so packets, ticks and cancel requests coming from different
/// threads are processed one at a time, in the order they acquire it.
#[derive(Clone)]
pub struct TransferHandle {
    inner: Arc<Mutex<Transfer>>,
}

impl TransferHandle {
    pub fn new(transfer: Transfer) -> TransferHandle {
        TransferHandle { inner: Arc::new(Mutex::new(transfer)) }
    }

    fn lock(&self) -> MutexGuard<'_, Transfer> {
        // A panicking notification sink must not wedge the transfer for everyone else.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn start(&self) {
        self.lock().start();
    }

    pub fn deliver(&self, packet: Packet) {
        self.lock().deliver(packet);
    }

    pub fn tick(&self) {
        self.lock().tick();
    }

    pub fn cancel(&self, code: ErrorCode) {
        self.lock().cancel(code);
    }

    pub fn state(&self) -> StateKind {
        self.lock().state()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().is_closed()
    }

    pub fn outcome(&self) -> Option<Outcome> {
        self.lock().outcome().cloned()
    }

    pub fn transferred_bytes(&self) -> u64 {
        self.lock().context().transferred_bytes()
    }
}
