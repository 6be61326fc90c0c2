use super::error::TransferError;
use crate::tftp::ErrorCode;
use std::net::SocketAddr;
use tokio::sync::mpsc::UnboundedSender;

/// Receives what happens to a transfer.
///
/// Every method is called synchronously while the transfer is locked. Implementations must
/// return quickly and must not call back into the same transfer (directly or through a
/// [`super::TransferHandle`]); doing so deadlocks.
///
/// Progress may fire many times. Exactly one of `on_completed`, `on_cancelled` and `on_error`
/// fires per transfer, and nothing fires after it.
pub trait NotificationSink {
    fn on_progress(&mut self, _transferred: u64, _total: Option<u64>) {}
    fn on_error(&mut self, _error: &TransferError) {}
    fn on_completed(&mut self) {}
    fn on_cancelled(&mut self, _code: ErrorCode) {}
}

/// Discards every notification.
impl NotificationSink for () {}

/// Writes notifications to the log.
pub struct LogSink {
    peer: SocketAddr,
    label: String,
}

impl LogSink {
    pub fn new(peer: SocketAddr, label: impl Into<String>) -> LogSink {
        LogSink { peer, label: label.into() }
    }
}

impl NotificationSink for LogSink {
    fn on_progress(&mut self, transferred: u64, total: Option<u64>) {
        match total {
            Some(total) => log::debug!("{} with {}: {}/{} bytes", self.label, self.peer, transferred, total),
            None => log::debug!("{} with {}: {} bytes", self.label, self.peer, transferred),
        }
    }

    fn on_error(&mut self, error: &TransferError) {
        log::warn!("{} with {} failed: {}", self.label, self.peer, error);
    }

    fn on_completed(&mut self) {
        log::info!("{} with {} completed", self.label, self.peer);
    }

    fn on_cancelled(&mut self, code: ErrorCode) {
        log::info!("{} with {} cancelled ({:?})", self.label, self.peer, code);
    }
}

/// A notification, as forwarded over a channel.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    Progress { transferred: u64, total: Option<u64> },
    Completed,
    Cancelled(ErrorCode),
    Failed(TransferError),
}

/// Forwards notifications to another task. Sending never blocks; events for a receiver that
/// went away are dropped.
impl NotificationSink for UnboundedSender<TransferEvent> {
    fn on_progress(&mut self, transferred: u64, total: Option<u64>) {
        let _ = self.send(TransferEvent::Progress { transferred, total });
    }

    fn on_error(&mut self, error: &TransferError) {
        let _ = self.send(TransferEvent::Failed(error.clone()));
    }

    fn on_completed(&mut self) {
        let _ = self.send(TransferEvent::Completed);
    }

    fn on_cancelled(&mut self, code: ErrorCode) {
        let _ = self.send(TransferEvent::Cancelled(code));
    }
}
