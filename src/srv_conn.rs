// This module contains the server-side connection handler.
//
// Server connections are initiated when a ReadReq or a WriteReq is received. The server handles
// this by creating a ServerRequestHandler instance, which works in roughly the following stages:
//
// 1. Check whether the request can be serviced by interacting with the filesystem: the mode must
//    be supported, the path must stay inside the server root, writes must be enabled for write
//    requests, and the file must open. Any failure here is reported to the client with an Error
//    packet from a fresh port and no transfer is created.
// 2. Negotiate options and build a transfer for the request: a read becomes a transfer that sends
//    from the file, a write one that receives into it.
// 3. Hand the transfer to a Connection bound to its own random port, which runs it to the end.

use crate::connection::Connection;
use crate::options;
use crate::server::ServerConfig;
use crate::tftp::{self, ErrorCode, FileMode, TftpOption};
use crate::transfer::{LogSink, Outcome, Role, TransferHandle};
use rand::Rng;
use std::error;
use std::fmt;
use std::io::{BufReader, BufWriter};
use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};
use tokio::fs::File;
use tokio::io;

/// How many random ports to try before giving up on a request.
const BIND_ATTEMPTS: usize = 16;

/// An object responsible for handling a request.
pub struct ServerRequestHandler {
    /// The transfer, bound to its own socket.
    connection: Connection,

    /// The address to send packets to.
    dst: SocketAddr,

    /// The file being served or written, and whether we are writing it.
    path: PathBuf,
    writing: bool,
}

/// Attempts to bind to a random UDP port in the configured range until one succeeds.
fn bind_random_socket(config: &ServerConfig) -> Result<tftp::TftpSocket, ServerConnectionError> {
    let mut rng = rand::thread_rng();
    let mut last_err = None;
    for _ in 0..BIND_ATTEMPTS {
        let port = rng.gen_range(config.port_range.clone());
        match tftp::TftpSocket::bind((config.bind.ip(), port).into()) {
            Ok(sock) => return Ok(sock),
            Err(e) => {
                log::warn!("Couldn't bind socket on port {}: {}", port, e);
                last_err = Some(e);
            },
        }
    }
    Err(ServerConnectionError::Socket(last_err.map_or_else(
        || "No port available".to_string(),
        |e| e.to_string(),
    )))
}

async fn send_error_packet(
    sock: &tftp::TftpSocket,
    dst: SocketAddr,
    code: ErrorCode,
    message: String,
) {
    // Error packet is sent as a courtesy, we don't care how it goes.
    let _ = sock.send(&tftp::Packet::Error { code, message }, dst).await;
}

/// Maps a requested path onto the server root. Absolute paths are taken relative to the root;
/// anything that would climb out of it is refused.
pub fn resolve_path(root: &Path, requested: &str) -> Result<PathBuf, ServerConnectionError> {
    let relative = Path::new(requested.trim_start_matches('/'));
    let mut resolved = root.to_path_buf();
    for component in relative.components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {},
            _ => {
                return Err(ServerConnectionError::Denied(format!(
                    "Path '{}' is outside the served directory",
                    requested
                )))
            },
        }
    }
    if resolved == root {
        return Err(ServerConnectionError::BadRequest("Request does not name a file".to_string()));
    }
    Ok(resolved)
}

impl ServerRequestHandler {
    pub async fn new(
        config: &ServerConfig,
        initial_request: &tftp::Packet,
        src: SocketAddr,
    ) -> Result<ServerRequestHandler, ServerConnectionError> {
        log::info!("Binding socket");
        let sock = bind_random_socket(config)?;
        match Self::prepare(config, initial_request).await {
            Ok((role, path, writing)) => {
                let label = format!("{} '{}'", if writing { "Write" } else { "Read" }, path.display());
                let connection = Connection::new(
                    sock,
                    src,
                    true,
                    role,
                    &config.transfer,
                    Box::new(LogSink::new(src, label)),
                );
                Ok(ServerRequestHandler { connection, dst: src, path, writing })
            },
            Err(e) => {
                send_error_packet(&sock, src, e.code(), e.to_string()).await;
                Err(e)
            },
        }
    }

    async fn prepare(
        config: &ServerConfig,
        initial_request: &tftp::Packet,
    ) -> Result<(Role, PathBuf, bool), ServerConnectionError> {
        let (path, mode, requested, writing) = match initial_request {
            tftp::Packet::ReadReq { path, mode, options } => (path, mode, options, false),
            tftp::Packet::WriteReq { path, mode, options } => (path, mode, options, true),
            _ => {
                return Err(ServerConnectionError::BadRequest(
                    "Only read and write requests are valid initial requests.".to_string(),
                ))
            },
        };

        if *mode == FileMode::Mail {
            return Err(ServerConnectionError::BadRequest(
                "Peer requested mail mode, which is unsupported".to_string(),
            ));
        }
        if writing && !config.allow_writes {
            return Err(ServerConnectionError::Denied("Writes are disabled on this server".to_string()));
        }

        let full_path = resolve_path(&config.root, path)?;
        let role = if writing {
            Self::accept_write(&full_path, requested).await?
        } else {
            Self::accept_read(&full_path, requested).await?
        };
        Ok((role, full_path, writing))
    }

    async fn accept_read(path: &Path, requested: &[TftpOption]) -> Result<Role, ServerConnectionError> {
        log::info!("Reading from {:?}", path);
        let file = File::open(path).await?;
        let file_size = file.metadata().await.ok().filter(|m| m.is_file()).map(|m| m.len());
        if file_size.is_none() {
            return Err(ServerConnectionError::Denied(format!("'{}' is not a regular file", path.display())));
        }
        let negotiated = options::accept(requested, file_size);
        Ok(Role::ReadResponder {
            negotiated,
            file_size,
            source: Box::new(BufReader::new(file.into_std().await)),
        })
    }

    async fn accept_write(path: &Path, requested: &[TftpOption]) -> Result<Role, ServerConnectionError> {
        log::info!("Writing to {:?}", path);
        let file = File::create_new(path).await?;
        let negotiated = options::accept(requested, None);
        Ok(Role::WriteResponder {
            negotiated,
            sink: Box::new(BufWriter::new(file.into_std().await)),
        })
    }

    /// A handle for watching or cancelling the transfer.
    pub fn transfer(&self) -> TransferHandle {
        self.connection.handle()
    }

    /// Does the work of sending and receiving data over the connection until the connection closes
    pub async fn handle(self) -> Outcome {
        let outcome = self.connection.run().await;
        log::info!("Closing connection with {}", self.dst);

        if self.writing && outcome != Outcome::Completed {
            // Don't leave half a file behind.
            if let Err(e) = tokio::fs::remove_file(&self.path).await {
                log::warn!("Unable to remove partial upload {:?}: {}", self.path, e);
            }
        }
        outcome
    }
}

#[derive(Debug)]
pub enum ServerConnectionError {
    BadRequest(String),
    Denied(String),
    File(io::Error),
    Socket(String),
}

impl ServerConnectionError {
    /// The code to report to the client.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::BadRequest(_) => ErrorCode::Illegal,
            Self::Denied(_) => ErrorCode::AccessViolation,
            Self::File(e) => e.kind().into(),
            Self::Socket(_) => ErrorCode::Undefined,
        }
    }
}

impl error::Error for ServerConnectionError {}

impl fmt::Display for ServerConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::BadRequest(msg) => write!(f, "Invalid request: {}", msg),
            Self::Denied(msg) => write!(f, "Access denied: {}", msg),
            Self::File(e) => write!(f, "File IO error: {}", e),
            Self::Socket(msg) => write!(f, "Socket error: {}", msg),
        }
    }
}

impl From<io::Error> for ServerConnectionError {
    fn from(e: io::Error) -> ServerConnectionError {
        ServerConnectionError::File(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tftp::{Packet, TftpSocket};
    use crate::transfer::TransferConfig;
    use std::net::Ipv4Addr;
    use std::time::Duration;
    use tempdir::TempDir;

    fn config(root: &Path, allow_writes: bool) -> ServerConfig {
        ServerConfig {
            bind: (Ipv4Addr::LOCALHOST, 0).into(),
            root: root.to_path_buf(),
            allow_writes,
            transfer: TransferConfig {
                retry_timeout: Duration::from_millis(100),
                retry_count: 2,
                tick_interval: Duration::from_millis(10),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn client() -> (TftpSocket, SocketAddr) {
        let sock = TftpSocket::bind((Ipv4Addr::LOCALHOST, 0).into()).unwrap();
        let addr = sock.local_addr().unwrap();
        (sock, addr)
    }

    fn read_req(path: &str) -> Packet {
        Packet::ReadReq { path: path.to_string(), mode: FileMode::Octet, options: vec![] }
    }

    fn write_req(path: &str) -> Packet {
        Packet::WriteReq { path: path.to_string(), mode: FileMode::Octet, options: vec![] }
    }

    #[test]
    fn test_resolve_path() {
        let root = Path::new("/srv/tftp");
        assert_eq!(resolve_path(root, "/boot/pxelinux.0").unwrap(), root.join("boot/pxelinux.0"));
        assert_eq!(resolve_path(root, "./a.txt").unwrap(), root.join("a.txt"));
        assert!(matches!(resolve_path(root, "../etc/passwd"), Err(ServerConnectionError::Denied(_))));
        assert!(matches!(resolve_path(root, "a/../../b"), Err(ServerConnectionError::Denied(_))));
        assert!(matches!(resolve_path(root, "/"), Err(ServerConnectionError::BadRequest(_))));
    }

    #[tokio::test]
    async fn test_new_for_reading_invalid_path() {
        let tmpdir = TempDir::new("scratch").unwrap();
        let (sock, addr) = client();

        let err = ServerRequestHandler::new(&config(tmpdir.path(), false), &read_req("missing.txt"), addr)
            .await
            .err()
            .unwrap();
        assert!(matches!(&err, ServerConnectionError::File(e) if e.kind() == io::ErrorKind::NotFound));

        let (packet, _) = sock.recv_with_timeout(Duration::from_secs(2)).await.unwrap();
        assert!(matches!(packet, Packet::Error { code: ErrorCode::FileNotFound, .. }));
    }

    #[tokio::test]
    async fn test_rejects_mail_mode() {
        let tmpdir = TempDir::new("scratch").unwrap();
        let (sock, addr) = client();
        let request = Packet::ReadReq { path: "a.txt".to_string(), mode: FileMode::Mail, options: vec![] };

        let res = ServerRequestHandler::new(&config(tmpdir.path(), false), &request, addr).await;
        assert!(matches!(res, Err(ServerConnectionError::BadRequest(_))));
        let (packet, _) = sock.recv_with_timeout(Duration::from_secs(2)).await.unwrap();
        assert!(matches!(packet, Packet::Error { code: ErrorCode::Illegal, .. }));
    }

    #[tokio::test]
    async fn test_rejects_write_when_disabled() {
        let tmpdir = TempDir::new("scratch").unwrap();
        let (sock, addr) = client();

        let res = ServerRequestHandler::new(&config(tmpdir.path(), false), &write_req("a.txt"), addr).await;
        assert!(matches!(res, Err(ServerConnectionError::Denied(_))));
        let (packet, _) = sock.recv_with_timeout(Duration::from_secs(2)).await.unwrap();
        assert!(matches!(packet, Packet::Error { code: ErrorCode::AccessViolation, .. }));
        assert!(!tmpdir.path().join("a.txt").exists());
    }

    #[tokio::test]
    async fn test_rejects_overwriting_existing_file() {
        let tmpdir = TempDir::new("scratch").unwrap();
        std::fs::write(tmpdir.path().join("a.txt"), b"keep me").unwrap();
        let (sock, addr) = client();

        let res = ServerRequestHandler::new(&config(tmpdir.path(), true), &write_req("a.txt"), addr).await;
        assert!(matches!(res, Err(ServerConnectionError::File(_))));
        let (packet, _) = sock.recv_with_timeout(Duration::from_secs(2)).await.unwrap();
        assert!(matches!(packet, Packet::Error { code: ErrorCode::FileAlreadyExists, .. }));
        assert_eq!(std::fs::read(tmpdir.path().join("a.txt")).unwrap(), b"keep me");
    }

    #[tokio::test]
    async fn test_serves_read_request() {
        let tmpdir = TempDir::new("scratch").unwrap();
        let mut contents = vec![0x78; 1024];
        contents.extend_from_slice(b"testing");
        std::fs::write(tmpdir.path().join("test.txt"), &contents).unwrap();
        let (sock, addr) = client();

        let handler = ServerRequestHandler::new(&config(tmpdir.path(), false), &read_req("/test.txt"), addr)
            .await
            .unwrap();
        let task = tokio::spawn(handler.handle());

        let mut received = Vec::new();
        for expected in 1..=3u16 {
            let (packet, src) = sock.recv_with_timeout(Duration::from_secs(2)).await.unwrap();
            match packet {
                Packet::Data { block, data } => {
                    assert_eq!(block, expected);
                    received.extend_from_slice(&data);
                },
                other => panic!("unexpected {:?}", other),
            }
            sock.send(&Packet::Ack { block: expected }, src).await.unwrap();
        }

        assert_eq!(task.await.unwrap(), Outcome::Completed);
        assert_eq!(received, contents);
    }

    #[tokio::test]
    async fn test_accepts_write_request_with_options() {
        let tmpdir = TempDir::new("scratch").unwrap();
        let (sock, addr) = client();
        let request = Packet::WriteReq {
            path: "upload.bin".to_string(),
            mode: FileMode::Octet,
            options: vec![TftpOption::new("blksize", 16), TftpOption::new("tsize", 20)],
        };

        let handler = ServerRequestHandler::new(&config(tmpdir.path(), true), &request, addr).await.unwrap();
        let task = tokio::spawn(handler.handle());

        let (oack, src) = sock.recv_with_timeout(Duration::from_secs(2)).await.unwrap();
        assert_eq!(
            oack,
            Packet::OptionAck { options: vec![TftpOption::new("blksize", 16), TftpOption::new("tsize", 20)] }
        );
        sock.send(&Packet::Data { block: 1, data: vec![1; 16] }, src).await.unwrap();
        assert_eq!(sock.recv_with_timeout(Duration::from_secs(2)).await.unwrap().0, Packet::Ack { block: 1 });
        sock.send(&Packet::Data { block: 2, data: vec![2; 4] }, src).await.unwrap();
        assert_eq!(sock.recv_with_timeout(Duration::from_secs(2)).await.unwrap().0, Packet::Ack { block: 2 });

        assert_eq!(task.await.unwrap(), Outcome::Completed);
        let mut expected = vec![1; 16];
        expected.extend_from_slice(&[2; 4]);
        assert_eq!(std::fs::read(tmpdir.path().join("upload.bin")).unwrap(), expected);
    }

    #[tokio::test]
    async fn test_removes_partial_upload() {
        let tmpdir = TempDir::new("scratch").unwrap();
        let (sock, addr) = client();

        let handler = ServerRequestHandler::new(&config(tmpdir.path(), true), &write_req("partial.bin"), addr)
            .await
            .unwrap();
        let task = tokio::spawn(handler.handle());

        let (_, src) = sock.recv_with_timeout(Duration::from_secs(2)).await.unwrap();
        sock.send(&Packet::Data { block: 1, data: vec![1; 512] }, src).await.unwrap();
        sock.send(
            &Packet::Error { code: ErrorCode::Undefined, message: "changed my mind".to_string() },
            src,
        )
        .await
        .unwrap();

        assert!(matches!(task.await.unwrap(), Outcome::Failed(_)));
        assert!(!tmpdir.path().join("partial.bin").exists());
    }
}
