use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;
use tftp_transfer::client::{self, ClientOptions};
use tftp_transfer::options::OptionRequest;
use tftp_transfer::server::{Server, ServerConfig, DEFAULT_MAX_CONNECTIONS};
use tftp_transfer::tftp::FileMode;
use tftp_transfer::transfer::{TransferConfig, DEFAULT_RETRY_COUNT};

#[derive(Parser)]
#[command(name = "tftp-transfer", about = "TFTP server and client")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct TimingArgs {
    /// Seconds to wait for the peer before retransmitting
    #[arg(long, default_value_t = 5)]
    timeout: u64,

    /// Retransmissions of one packet before giving up
    #[arg(long, default_value_t = DEFAULT_RETRY_COUNT)]
    retries: u32,
}

impl TimingArgs {
    fn transfer_config(&self) -> TransferConfig {
        TransferConfig {
            retry_timeout: Duration::from_secs(self.timeout),
            retry_count: self.retries,
            ..Default::default()
        }
    }
}

#[derive(Args)]
struct NegotiationArgs {
    /// Ask for this block size (blksize option)
    #[arg(long)]
    blksize: Option<usize>,

    /// Ask the server to use this retransmission timeout, in seconds (timeout option)
    #[arg(long)]
    server_timeout: Option<u64>,

    /// Exchange the transfer size (tsize option)
    #[arg(long)]
    tsize: bool,

    /// Transfer in netascii mode instead of octet
    #[arg(long)]
    netascii: bool,
}

impl NegotiationArgs {
    fn client_options(&self, timing: &TimingArgs) -> ClientOptions {
        ClientOptions {
            mode: Some(if self.netascii { FileMode::NetAscii } else { FileMode::Octet }),
            options: OptionRequest {
                block_size: self.blksize,
                timeout: self.server_timeout.map(Duration::from_secs),
                transfer_size: self.tsize.then_some(0),
            },
            transfer: timing.transfer_config(),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Serve files from a directory
    Serve {
        #[arg(long, default_value = "0.0.0.0:69")]
        bind: SocketAddr,

        /// Directory to serve
        #[arg(long, short = 'd', default_value = ".")]
        root: PathBuf,

        /// Accept write requests
        #[arg(long)]
        allow_writes: bool,

        #[arg(long, default_value_t = DEFAULT_MAX_CONNECTIONS)]
        max_connections: usize,

        /// Lowest port a transfer may use
        #[arg(long, default_value_t = 1024)]
        port_min: u16,

        /// Highest port a transfer may use
        #[arg(long, default_value_t = 65535)]
        port_max: u16,

        #[command(flatten)]
        timing: TimingArgs,
    },
    /// Download a file
    Get {
        /// Server address, e.g. 192.168.1.10:69
        server: String,
        remote: String,
        /// Where to store the file (defaults to the remote name)
        local: Option<PathBuf>,

        #[command(flatten)]
        negotiation: NegotiationArgs,

        #[command(flatten)]
        timing: TimingArgs,
    },
    /// Upload a file
    Put {
        server: String,
        local: PathBuf,
        /// Name on the server (defaults to the local file name)
        remote: Option<String>,

        #[command(flatten)]
        negotiation: NegotiationArgs,

        #[command(flatten)]
        timing: TimingArgs,
    },
}

fn resolve(server: &str) -> Result<SocketAddr> {
    let with_port = if server.contains(':') { server.to_string() } else { format!("{server}:69") };
    with_port
        .to_socket_addrs()
        .with_context(|| format!("Unable to resolve {server}"))?
        .next()
        .with_context(|| format!("No address found for {server}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { bind, root, allow_writes, max_connections, port_min, port_max, timing } => {
            anyhow::ensure!(port_min <= port_max, "--port-min must not exceed --port-max");
            let config = ServerConfig {
                bind,
                root,
                allow_writes,
                max_connections,
                port_range: port_min..=port_max,
                transfer: timing.transfer_config(),
            };
            Server::bind(config)?.run().await?;
        },
        Commands::Get { server, remote, local, negotiation, timing } => {
            let local = local.unwrap_or_else(|| PathBuf::from(remote.rsplit('/').next().unwrap_or(&remote)));
            let bytes = client::get(resolve(&server)?, &remote, &local, &negotiation.client_options(&timing)).await?;
            log::info!("Received {} bytes into {:?}", bytes, local);
        },
        Commands::Put { server, local, remote, negotiation, timing } => {
            let remote = match remote {
                Some(remote) => remote,
                None => local
                    .file_name()
                    .and_then(|name| name.to_str())
                    .map(str::to_string)
                    .context("Local path has no file name")?,
            };
            let bytes = client::put(resolve(&server)?, &local, &remote, &negotiation.client_options(&timing)).await?;
            log::info!("Sent {} bytes as '{}'", bytes, remote);
        },
    }

    Ok(())
}
