// The listening side of the server.
//
// Requests arrive on the well-known port. Each RRQ/WRQ is handed to a ServerRequestHandler that
// runs the transfer on its own port in its own task, so transfers never share state. A semaphore
// caps how many run at once; requests beyond that are turned away with an Error packet.

use crate::srv_conn::ServerRequestHandler;
use crate::tftp::{ErrorCode, Packet, SocketError, TftpSocket};
use crate::transfer::TransferConfig;
use std::net::{Ipv4Addr, SocketAddr};
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Semaphore;

pub const DEFAULT_PORT: u16 = 69;
pub const DEFAULT_MAX_CONNECTIONS: usize = 64;

/// Server options.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    /// Address the listening socket binds to. Transfers bind to the same IP.
    pub bind: SocketAddr,

    /// Directory files are served from and written to.
    pub root: PathBuf,

    /// Whether write requests are accepted at all.
    pub allow_writes: bool,

    /// Upper bound on concurrently running transfers.
    pub max_connections: usize,

    /// Ports transfers may pick from.
    pub port_range: RangeInclusive<u16>,

    pub transfer: TransferConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: (Ipv4Addr::UNSPECIFIED, DEFAULT_PORT).into(),
            root: PathBuf::from("."),
            allow_writes: false,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            port_range: 1024..=65535,
            transfer: TransferConfig::default(),
        }
    }
}

pub struct Server {
    config: Arc<ServerConfig>,
    sock: TftpSocket,
    slots: Arc<Semaphore>,
}

impl Server {
    pub fn bind(config: ServerConfig) -> Result<Server, SocketError> {
        let sock = TftpSocket::bind(config.bind)?;
        log::info!("Listening on {}, serving {:?}", sock.local_addr()?, config.root);
        let slots = Arc::new(Semaphore::new(config.max_connections));
        Ok(Server { config: Arc::new(config), sock, slots })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, SocketError> {
        self.sock.local_addr()
    }

    /// Accepts requests forever. Only a failure of the listening socket itself ends the loop.
    pub async fn run(self) -> Result<(), SocketError> {
        loop {
            let (packet, src) = match self.sock.recv().await {
                Ok(received) => received,
                Err(SocketError::PacketParse(msg)) => {
                    log::warn!("Ignoring malformed request: {}", msg);
                    continue;
                },
                Err(e) => return Err(e),
            };
            self.dispatch(packet, src).await;
        }
    }

    async fn dispatch(&self, packet: Packet, src: SocketAddr) {
        match &packet {
            Packet::ReadReq { path, .. } | Packet::WriteReq { path, .. } => {
                log::info!("Got {:?} for '{}' from {}", packet.op_code(), path, src);
            },
            _ => {
                log::warn!("Got {:?} from {} on the request port", packet.op_code(), src);
                let error = Packet::Error {
                    code: ErrorCode::Illegal,
                    message: "Only read and write requests are accepted on this port.".to_string(),
                };
                let _ = self.sock.send(&error, src).await;
                return;
            },
        }

        let permit = match self.slots.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                log::warn!("Turning away {}: too many transfers", src);
                let error = Packet::Error {
                    code: ErrorCode::Undefined,
                    message: "Server busy, try again later".to_string(),
                };
                let _ = self.sock.send(&error, src).await;
                return;
            },
        };

        let config = self.config.clone();
        tokio::spawn(async move {
            let _permit = permit;
            match ServerRequestHandler::new(&config, &packet, src).await {
                Ok(handler) => {
                    handler.handle().await;
                },
                Err(e) => log::warn!("Refused request from {}: {}", src, e),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tftp::FileMode;
    use std::time::Duration;
    use tempdir::TempDir;

    fn test_server(root: &std::path::Path, max_connections: usize) -> Server {
        Server::bind(ServerConfig {
            bind: (Ipv4Addr::LOCALHOST, 0).into(),
            root: root.to_path_buf(),
            max_connections,
            ..Default::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_server_rejects_non_requests() {
        let tmpdir = TempDir::new("scratch").unwrap();
        let server = test_server(tmpdir.path(), 4);
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.run());

        let client = TftpSocket::bind((Ipv4Addr::LOCALHOST, 0).into()).unwrap();
        client.send(&Packet::Ack { block: 1 }, addr).await.unwrap();
        let (packet, src) = client.recv_with_timeout(Duration::from_secs(2)).await.unwrap();
        assert!(matches!(packet, Packet::Error { code: ErrorCode::Illegal, .. }));
        assert_eq!(src, addr);
    }

    #[tokio::test]
    async fn test_server_answers_from_new_port() {
        let tmpdir = TempDir::new("scratch").unwrap();
        std::fs::write(tmpdir.path().join("hello.txt"), b"hello world").unwrap();
        let server = test_server(tmpdir.path(), 4);
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.run());

        let client = TftpSocket::bind((Ipv4Addr::LOCALHOST, 0).into()).unwrap();
        let request = Packet::ReadReq { path: "hello.txt".to_string(), mode: FileMode::Octet, options: vec![] };
        client.send(&request, addr).await.unwrap();

        let (packet, src) = client.recv_with_timeout(Duration::from_secs(2)).await.unwrap();
        assert_eq!(packet, Packet::Data { block: 1, data: b"hello world".to_vec() });
        assert_ne!(src, addr);
        client.send(&Packet::Ack { block: 1 }, src).await.unwrap();
    }

    #[tokio::test]
    async fn test_server_turns_away_when_full() {
        let tmpdir = TempDir::new("scratch").unwrap();
        std::fs::write(tmpdir.path().join("big.bin"), vec![0; 4096]).unwrap();
        let server = test_server(tmpdir.path(), 1);
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.run());

        let request = Packet::ReadReq { path: "big.bin".to_string(), mode: FileMode::Octet, options: vec![] };
        let first = TftpSocket::bind((Ipv4Addr::LOCALHOST, 0).into()).unwrap();
        first.send(&request, addr).await.unwrap();
        let (packet, _) = first.recv_with_timeout(Duration::from_secs(2)).await.unwrap();
        assert!(matches!(packet, Packet::Data { block: 1, .. }));

        let second = TftpSocket::bind((Ipv4Addr::LOCALHOST, 0).into()).unwrap();
        second.send(&request, addr).await.unwrap();
        let (packet, src) = second.recv_with_timeout(Duration::from_secs(2)).await.unwrap();
        assert!(matches!(packet, Packet::Error { code: ErrorCode::Undefined, .. }));
        assert_eq!(src, addr);
    }
}
