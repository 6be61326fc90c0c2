use crate::tftp::Packet;
use std::error;
use std::fmt;
use std::net::SocketAddr;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

#[derive(Debug)]
pub enum TransportError {
    /// Nobody is draining the outgoing queue anymore.
    Closed,
}

impl error::Error for TransportError {}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "Transport closed"),
        }
    }
}

/// Where a transfer hands its outgoing packets.
///
/// Sends are fire-and-forget: implementations must not block, and a failed send is never
/// retried here. Retransmission is driven by the transfer's timer.
pub trait Transport {
    fn send(&mut self, peer: SocketAddr, packet: &Packet) -> Result<(), TransportError>;
}

/// Queues outgoing packets for the task that owns the socket.
pub struct Outbox {
    tx: UnboundedSender<(SocketAddr, Packet)>,
}

impl Outbox {
    pub fn new() -> (Outbox, UnboundedReceiver<(SocketAddr, Packet)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Outbox { tx }, rx)
    }
}

impl Transport for Outbox {
    fn send(&mut self, peer: SocketAddr, packet: &Packet) -> Result<(), TransportError> {
        self.tx.send((peer, packet.clone())).map_err(|_| TransportError::Closed)
    }
}
