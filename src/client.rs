// Client side: fetch a file from a server (RRQ) or push one to it (WRQ).

use crate::connection::Connection;
use crate::options::OptionRequest;
use crate::tftp::{FileMode, TftpSocket};
use crate::transfer::{LogSink, Outcome, Role, TransferConfig};
use anyhow::{anyhow, Context, Result};
use std::io::{BufReader, BufWriter};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use tokio::fs::File;

/// What to ask the server for, beyond the file name.
#[derive(Debug, Clone, Default)]
pub struct ClientOptions {
    pub mode: Option<FileMode>,
    pub options: OptionRequest,
    pub transfer: TransferConfig,
}

fn bind_for(server: SocketAddr) -> Result<TftpSocket> {
    let local: SocketAddr = match server {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    TftpSocket::bind(local).context("Unable to bind client socket")
}

fn into_result(outcome: Outcome, transferred: u64) -> Result<u64> {
    match outcome {
        Outcome::Completed => Ok(transferred),
        Outcome::Cancelled(code) => Err(anyhow!("Transfer cancelled ({:?})", code)),
        Outcome::Failed(e) => Err(e.into()),
    }
}

/// Where a download is written until it completes. It sits next to `local` so the final rename
/// stays on one file system.
fn partial_path(local: &Path) -> Result<PathBuf> {
    let name = local
        .file_name()
        .and_then(|name| name.to_str())
        .with_context(|| format!("{:?} does not name a file", local))?;
    Ok(local.with_file_name(format!(".{}.{:08x}.part", name, rand::random::<u32>())))
}

/// Downloads `remote` from `server` into `local`. Returns the number of bytes received.
///
/// `local` is only replaced once the whole file has arrived; a failed download leaves whatever
/// was there untouched.
pub async fn get(server: SocketAddr, remote: &str, local: &Path, opts: &ClientOptions) -> Result<u64> {
    let sock = bind_for(server)?;
    let partial = partial_path(local)?;
    let file = File::create_new(&partial)
        .await
        .with_context(|| format!("Unable to create {:?}", partial))?;

    let role = Role::ReadRequester {
        path: remote.to_string(),
        mode: opts.mode.unwrap_or(FileMode::Octet),
        options: opts.options.clone(),
        sink: Box::new(BufWriter::new(file.into_std().await)),
    };
    let notify = LogSink::new(server, format!("Download '{}'", remote));
    let connection = Connection::new(sock, server, false, role, &opts.transfer, Box::new(notify));
    let handle = connection.handle();
    let outcome = connection.run().await;

    if outcome == Outcome::Completed {
        tokio::fs::rename(&partial, local)
            .await
            .with_context(|| format!("Unable to move download into {:?}", local))?;
    } else if let Err(e) = tokio::fs::remove_file(&partial).await {
        log::warn!("Unable to remove partial download {:?}: {}", partial, e);
    }
    into_result(outcome, handle.transferred_bytes())
}

/// Uploads `local` to `server` as `remote`. Returns the number of bytes sent.
pub async fn put(server: SocketAddr, local: &Path, remote: &str, opts: &ClientOptions) -> Result<u64> {
    let sock = bind_for(server)?;
    let file = File::open(local)
        .await
        .with_context(|| format!("Unable to open {:?}", local))?;

    let mut options = opts.options.clone();
    if options.transfer_size.is_some() {
        // Announce the real size rather than whatever placeholder was asked for.
        options.transfer_size = Some(file.metadata().await?.len());
    }

    let role = Role::WriteRequester {
        path: remote.to_string(),
        mode: opts.mode.unwrap_or(FileMode::Octet),
        options,
        source: Box::new(BufReader::new(file.into_std().await)),
    };
    let notify = LogSink::new(server, format!("Upload '{}'", remote));
    let connection = Connection::new(sock, server, false, role, &opts.transfer, Box::new(notify));
    let handle = connection.handle();
    let outcome = connection.run().await;
    into_result(outcome, handle.transferred_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{Server, ServerConfig};
    use crate::transfer::TransferError;
    use crate::tftp::ErrorCode;
    use std::time::Duration;
    use tempdir::TempDir;
    use tokio_test::{assert_err, assert_ok};

    fn quick_transfer() -> TransferConfig {
        TransferConfig {
            retry_timeout: Duration::from_millis(200),
            retry_count: 3,
            tick_interval: Duration::from_millis(20),
            ..Default::default()
        }
    }

    async fn start_server(root: &Path, allow_writes: bool) -> SocketAddr {
        let server = Server::bind(ServerConfig {
            bind: (Ipv4Addr::LOCALHOST, 0).into(),
            root: root.to_path_buf(),
            allow_writes,
            transfer: quick_transfer(),
            ..Default::default()
        })
        .unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.run());
        addr
    }

    #[tokio::test]
    async fn test_get_and_put_round_trip() {
        let served = TempDir::new("served").unwrap();
        let local = TempDir::new("local").unwrap();
        let contents: Vec<u8> = (0..5000u32).map(|i| (i * 7) as u8).collect();
        std::fs::write(local.path().join("original.bin"), &contents).unwrap();
        let server = start_server(served.path(), true).await;

        let opts = ClientOptions { transfer: quick_transfer(), ..Default::default() };
        let sent = assert_ok!(put(server, &local.path().join("original.bin"), "stored.bin", &opts).await);
        assert_eq!(sent, 5000);
        assert_eq!(std::fs::read(served.path().join("stored.bin")).unwrap(), contents);

        let opts = ClientOptions {
            options: OptionRequest { block_size: Some(1428), transfer_size: Some(0), ..Default::default() },
            transfer: quick_transfer(),
            ..Default::default()
        };
        let received = assert_ok!(get(server, "stored.bin", &local.path().join("copy.bin"), &opts).await);
        assert_eq!(received, 5000);
        assert_eq!(std::fs::read(local.path().join("copy.bin")).unwrap(), contents);
    }

    #[tokio::test]
    async fn test_get_missing_file_reports_remote_error() {
        let served = TempDir::new("served").unwrap();
        let local = TempDir::new("local").unwrap();
        let server = start_server(served.path(), false).await;
        let target = local.path().join("nothing.bin");

        let opts = ClientOptions { transfer: quick_transfer(), ..Default::default() };
        let err = assert_err!(get(server, "nothing.bin", &target, &opts).await);
        match err.downcast_ref::<TransferError>() {
            Some(TransferError::Remote { code, .. }) => assert_eq!(*code, ErrorCode::FileNotFound),
            other => panic!("unexpected error {:?}", other),
        }
        assert!(!target.exists());
    }

    #[tokio::test]
    async fn test_failed_get_keeps_existing_file() {
        let served = TempDir::new("served").unwrap();
        let local = TempDir::new("local").unwrap();
        let server = start_server(served.path(), false).await;
        let target = local.path().join("precious.bin");
        std::fs::write(&target, b"do not lose me").unwrap();

        let opts = ClientOptions { transfer: quick_transfer(), ..Default::default() };
        assert_err!(get(server, "does-not-exist.bin", &target, &opts).await);
        assert_eq!(std::fs::read(&target).unwrap(), b"do not lose me");
        // No leftovers from the attempt either.
        assert_eq!(std::fs::read_dir(local.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_get_replaces_existing_file_on_success() {
        let served = TempDir::new("served").unwrap();
        let local = TempDir::new("local").unwrap();
        std::fs::write(served.path().join("fresh.txt"), b"new contents").unwrap();
        let server = start_server(served.path(), false).await;
        let target = local.path().join("fresh.txt");
        std::fs::write(&target, b"old contents that are longer").unwrap();

        let opts = ClientOptions { transfer: quick_transfer(), ..Default::default() };
        assert_eq!(assert_ok!(get(server, "fresh.txt", &target, &opts).await), 12);
        assert_eq!(std::fs::read(&target).unwrap(), b"new contents");
        assert_eq!(std::fs::read_dir(local.path()).unwrap().count(), 1);
    }
}
