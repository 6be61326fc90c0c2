// Runs one transfer over one UDP socket.
//
// The transfer engine never touches the socket. This module is the glue: it drains the packets
// the engine queued into its outbox onto the wire, decodes datagrams from the peer and delivers
// them, and turns a tokio interval into engine ticks. All three are funnelled through a
// `TransferHandle`, so a cancel request from another task is serialized with everything else.

use crate::tftp::{self, ErrorCode, Packet, TftpSocket};
use crate::transfer::{NotificationSink, Outcome, Role, Transfer, TransferConfig, TransferHandle};
use crate::transport::Outbox;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{self, Instant, MissedTickBehavior};

pub struct Connection {
    sock: TftpSocket,

    /// Where packets go. Until `remote_locked`, only the IP is trusted: a server answers a request
    /// from a fresh port, and the first reply from that host pins the port.
    remote: SocketAddr,
    remote_locked: bool,

    transfer: TransferHandle,
    outbox: UnboundedReceiver<(SocketAddr, Packet)>,
    tick_interval: Duration,
}

impl Connection {
    /// Sets up a transfer with `remote`. Pass `remote_locked = false` when `remote` is a server's
    /// well-known port that will answer from another one.
    pub fn new(
        sock: TftpSocket,
        remote: SocketAddr,
        remote_locked: bool,
        role: Role,
        config: &TransferConfig,
        notify: Box<dyn NotificationSink + Send>,
    ) -> Connection {
        let (outbox, rx) = Outbox::new();
        let transfer = Transfer::new(remote, role, config, Box::new(outbox), notify);
        Connection {
            sock,
            remote,
            remote_locked,
            transfer: TransferHandle::new(transfer),
            outbox: rx,
            tick_interval: config.tick_interval,
        }
    }

    /// A handle other tasks can use to watch or cancel the transfer while it runs.
    pub fn handle(&self) -> TransferHandle {
        self.transfer.clone()
    }

    /// Drives the transfer until it closes.
    pub async fn run(mut self) -> Outcome {
        self.transfer.start();

        let mut ticker = time::interval_at(Instant::now() + self.tick_interval, self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            self.flush().await;
            if let Some(outcome) = self.transfer.outcome() {
                return outcome;
            }

            tokio::select! {
                _ = ticker.tick() => self.transfer.tick(),
                Some((_, packet)) = self.outbox.recv() => self.send(&packet).await,
                res = self.sock.recv() => self.on_datagram(res).await,
            }
        }
    }

    async fn flush(&mut self) {
        while let Ok((_, packet)) = self.outbox.try_recv() {
            self.send(&packet).await;
        }
    }

    async fn send(&self, packet: &Packet) {
        if let Err(e) = self.sock.send(packet, self.remote).await {
            log::warn!("Unable to send packet to {}: {}", self.remote, e);
        }
    }

    async fn on_datagram(&mut self, res: tftp::TftpResult<(Packet, SocketAddr)>) {
        match res {
            Ok((packet, src)) => {
                if !self.remote_locked && src.ip() == self.remote.ip() {
                    log::debug!("Peer {} answered from {}", self.remote, src);
                    self.remote = src;
                    self.remote_locked = true;
                }

                if src != self.remote {
                    // Someone else is talking to our port. Tell them, but keep our transfer going.
                    log::warn!("Got packet from unexpected peer {}, expected {}", src, self.remote);
                    let error = Packet::Error {
                        code: ErrorCode::UnknownTid,
                        message: "This port is in use by another transfer.".to_string(),
                    };
                    let _ = self.sock.send(&error, src).await;
                    return;
                }

                log::trace!("Got packet from {}: {:?}", src, packet);
                self.transfer.deliver(packet);
            },
            Err(tftp::SocketError::PacketParse(msg)) => {
                log::debug!("Dropping undecodable datagram: {}", msg);
            },
            Err(e) => {
                log::warn!("Socket error while receiving: {}", e);
                // Avoid spinning on a socket that keeps failing; the retry budget will end the
                // transfer if the peer is really gone.
                time::sleep(self.tick_interval).await;
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::{Negotiated, OptionRequest};
    use crate::tftp::FileMode;
    use crate::transfer::{StateKind, TransferError, TransferEvent};
    use std::io::Cursor;
    use std::net::Ipv4Addr;
    use tokio::sync::mpsc;

    fn local_socket() -> TftpSocket {
        TftpSocket::bind((Ipv4Addr::LOCALHOST, 0).into()).unwrap()
    }

    fn quick_config() -> TransferConfig {
        TransferConfig {
            retry_timeout: Duration::from_millis(50),
            retry_count: 3,
            tick_interval: Duration::from_millis(10),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_connection_sends_file_to_peer() {
        let server_sock = local_socket();
        let peer = local_socket();
        let peer_addr = peer.local_addr().unwrap();
        let contents: Vec<u8> = (0..1300).map(|i| i as u8).collect();

        let (events_tx, mut events) = mpsc::unbounded_channel();
        let role = Role::ReadResponder {
            negotiated: Negotiated::default(),
            file_size: Some(contents.len() as u64),
            source: Box::new(Cursor::new(contents.clone())),
        };
        let conn = Connection::new(server_sock, peer_addr, true, role, &quick_config(), Box::new(events_tx));
        let task = tokio::spawn(conn.run());

        let mut received = Vec::new();
        loop {
            let (packet, src) = peer.recv_with_timeout(Duration::from_secs(2)).await.unwrap();
            let (block, data) = match packet {
                Packet::Data { block, data } => (block, data),
                other => panic!("unexpected {:?}", other),
            };
            received.extend_from_slice(&data);
            peer.send(&Packet::Ack { block }, src).await.unwrap();
            if data.len() < 512 {
                break;
            }
        }

        assert_eq!(task.await.unwrap(), Outcome::Completed);
        assert_eq!(received, contents);

        let mut last = None;
        while let Ok(event) = events.try_recv() {
            last = Some(event);
        }
        assert_eq!(last, Some(TransferEvent::Completed));
    }

    #[tokio::test]
    async fn test_connection_times_out_without_peer() {
        let sock = local_socket();
        let silent = local_socket();
        let role = Role::ReadResponder {
            negotiated: Negotiated::default(),
            file_size: None,
            source: Box::new(Cursor::new(vec![0; 10])),
        };
        let conn = Connection::new(sock, silent.local_addr().unwrap(), true, role, &quick_config(), Box::new(()));

        let outcome = time::timeout(Duration::from_secs(5), conn.run()).await.unwrap();
        assert_eq!(outcome, Outcome::Failed(TransferError::Timeout));

        // The first send plus three retransmissions.
        for _ in 0..4 {
            let (packet, _) = silent.recv_with_timeout(Duration::from_secs(1)).await.unwrap();
            assert_eq!(packet, Packet::Data { block: 1, data: vec![0; 10] });
        }
    }

    #[tokio::test]
    async fn test_connection_rejects_strangers_and_follows_server_port() {
        let client_sock = local_socket();
        let client_addr = client_sock.local_addr().unwrap();
        let listener = local_socket();
        let server = local_socket();
        let stranger = TftpSocket::bind((Ipv4Addr::LOCALHOST, 0).into()).unwrap();

        let sink = Vec::new();
        let role = Role::ReadRequester {
            path: "file.txt".to_string(),
            mode: FileMode::Octet,
            options: OptionRequest::default(),
            sink: Box::new(sink),
        };
        let conn = Connection::new(client_sock, listener.local_addr().unwrap(), false, role, &TransferConfig::default(), Box::new(()));
        let handle = conn.handle();
        let task = tokio::spawn(conn.run());

        let (request, src) = listener.recv_with_timeout(Duration::from_secs(2)).await.unwrap();
        assert!(matches!(request, Packet::ReadReq { .. }));
        assert_eq!(src, client_addr);

        // The server answers from its own port; from then on only that port is accepted.
        server.send(&Packet::Data { block: 1, data: vec![1; 512] }, client_addr).await.unwrap();
        let (ack, _) = server.recv_with_timeout(Duration::from_secs(2)).await.unwrap();
        assert_eq!(ack, Packet::Ack { block: 1 });

        stranger.send(&Packet::Data { block: 2, data: vec![2] }, client_addr).await.unwrap();
        let (reply, _) = stranger.recv_with_timeout(Duration::from_secs(2)).await.unwrap();
        assert!(matches!(reply, Packet::Error { code: ErrorCode::UnknownTid, .. }));
        assert_eq!(handle.state(), StateKind::Receiving);

        server.send(&Packet::Data { block: 2, data: vec![2] }, client_addr).await.unwrap();
        assert_eq!(task.await.unwrap(), Outcome::Completed);
        assert_eq!(handle.transferred_bytes(), 513);
    }

    #[tokio::test]
    async fn test_connection_cancel_from_other_task() {
        let sock = local_socket();
        let peer = local_socket();
        let role = Role::WriteResponder {
            negotiated: Negotiated::default(),
            sink: Box::new(Vec::new()),
        };
        let conn = Connection::new(sock, peer.local_addr().unwrap(), true, role, &TransferConfig::default(), Box::new(()));
        let handle = conn.handle();
        let task = tokio::spawn(conn.run());

        let (ack, _) = peer.recv_with_timeout(Duration::from_secs(2)).await.unwrap();
        assert_eq!(ack, Packet::Ack { block: 0 });

        handle.cancel(ErrorCode::DiskFull);
        let (error, _) = peer.recv_with_timeout(Duration::from_secs(2)).await.unwrap();
        assert!(matches!(error, Packet::Error { code: ErrorCode::DiskFull, .. }));
        assert_eq!(task.await.unwrap(), Outcome::Cancelled(ErrorCode::DiskFull));
    }
}
