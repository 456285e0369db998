//! rudp CLI
//!
//! Reliable stop-and-wait resource transfer over UDP

mod config;
mod store;

use clap::{Parser, Subcommand, ValueEnum};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use config::Config;
use rudp_core::{Client, ProtocolConfig, ResourceStore, Role, Server, split_units};
use rudp_transport::AsyncUdpTransport;
use store::DirectoryStore;

/// rudp - reliable, optionally encrypted transfers over UDP
#[derive(Parser)]
#[command(name = "rudp")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path [default: <config dir>/rudp/config.toml]
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve resources from (or receive them into) a directory
    Serve {
        /// Bind address
        #[arg(short, long)]
        bind: Option<String>,

        /// Storage directory
        #[arg(short, long)]
        dir: Option<PathBuf>,

        /// Data direction
        #[arg(long, value_enum)]
        role: Option<RoleArg>,

        /// Refuse unencrypted sessions
        #[arg(long)]
        require_encryption: bool,
    },

    /// Download a resource from a source-role server
    Fetch {
        /// Resource name
        #[arg(required = true)]
        resource: String,

        /// Output file, `-` for stdout [default: ./<resource>]
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Server address
        #[arg(short, long)]
        server: Option<String>,

        /// Run the key exchange first
        #[arg(long)]
        secure: bool,
    },

    /// Upload a file to a sink-role server
    Push {
        /// File to send
        #[arg(required = true)]
        file: PathBuf,

        /// Resource name [default: file name]
        #[arg(short, long)]
        name: Option<String>,

        /// Server address
        #[arg(short, long)]
        server: Option<String>,

        /// Run the key exchange first
        #[arg(long)]
        secure: bool,
    },

    /// List resources a server offers
    List {
        /// Server address
        #[arg(short, long)]
        server: Option<String>,

        /// Run the key exchange first
        #[arg(long)]
        secure: bool,
    },

    /// Write the default configuration file
    Config {
        /// Destination [default: the config path]
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Replace an existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum RoleArg {
    /// Server sends resources to peers
    Source,
    /// Peers send resources to the server
    Sink,
}

impl From<RoleArg> for Role {
    fn from(role: RoleArg) -> Self {
        match role {
            RoleArg::Source => Role::Source,
            RoleArg::Sink => Role::Sink,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load(path)
            .map_err(|e| anyhow::anyhow!("Cannot load {}: {}", path.display(), e))?,
        None => Config::load_or_default()?,
    };

    tracing_subscriber::fmt()
        .with_env_filter(if cli.verbose {
            "debug"
        } else {
            config.logging.level.as_str()
        })
        .init();

    match cli.command {
        Commands::Serve {
            bind,
            dir,
            role,
            require_encryption,
        } => {
            let mut config = config;
            if let Some(bind) = bind {
                config.network.bind_addr = bind;
            }
            if let Some(dir) = dir {
                config.storage.dir = dir;
            }
            if let Some(role) = role {
                config.protocol.role = role.into();
            }
            config.protocol.require_encryption |= require_encryption;
            config.validate()?;
            serve(&config).await?;
        }
        Commands::Fetch {
            resource,
            output,
            server,
            secure,
        } => {
            let config = with_server(config, server)?;
            fetch(&config, &resource, output, secure).await?;
        }
        Commands::Push {
            file,
            name,
            server,
            secure,
        } => {
            let config = with_server(config, server)?;
            push(&config, file, name, secure).await?;
        }
        Commands::List { server, secure } => {
            let config = with_server(config, server)?;
            list(&config, secure).await?;
        }
        Commands::Config { output, force } => {
            let path = output
                .or(cli.config)
                .unwrap_or_else(Config::default_path);
            write_default_config(path, force)?;
        }
    }

    Ok(())
}

fn with_server(mut config: Config, server: Option<String>) -> anyhow::Result<Config> {
    if let Some(server) = server {
        config.network.server_addr = server;
    }
    config.validate()?;
    Ok(config)
}

/// Run the responder until Ctrl+C
async fn serve(config: &Config) -> anyhow::Result<()> {
    let bind = config.parse_bind_addr()?;
    let store = DirectoryStore::open(&config.storage.dir)?;
    let protocol = config.protocol_config();

    let transport = AsyncUdpTransport::bind_with_buffer(bind, config.network.socket_buffer).await?;
    let server = Server::new(transport, Arc::new(store.clone()), protocol.clone())?;

    println!("rudp server");
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!("Listen: {}", server.local_addr()?);
    println!("Role: {:?}", protocol.role);
    println!("Directory: {}", store.root().display());
    println!("Resources: {}", store.list().len());
    println!("Public key: {}", hex::encode(server.public_key().as_bytes()));
    println!(
        "Encryption: {}",
        if protocol.require_encryption { "required" } else { "optional" }
    );
    println!("\nPress Ctrl+C to stop");

    let handle = server.spawn()?;
    tokio::signal::ctrl_c().await?;
    println!("\nShutting down...");
    tracing::info!("{} sessions open at shutdown", handle.registry().len());
    handle.shutdown().await?;

    Ok(())
}

async fn connect(config: &Config) -> anyhow::Result<Client<AsyncUdpTransport>> {
    let server = config.parse_server_addr()?;
    let local: SocketAddr = if server.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let transport = AsyncUdpTransport::bind_with_buffer(local, config.network.socket_buffer).await?;
    let protocol: ProtocolConfig = config.protocol_config();
    Ok(Client::with_transport(transport, server, protocol)?)
}

async fn secure_if(client: &mut Client<AsyncUdpTransport>, secure: bool, config: &Config) -> anyhow::Result<()> {
    if secure || config.protocol.require_encryption {
        client.secure().await?;
    }
    Ok(())
}

/// Download a resource
async fn fetch(
    config: &Config,
    resource: &str,
    output: Option<PathBuf>,
    secure: bool,
) -> anyhow::Result<()> {
    let mut client = connect(config).await?;
    secure_if(&mut client, secure, config).await?;

    tracing::info!("Fetching {:?} from {}", resource, client.server());
    let outcome = client.fetch(resource).await?;
    if outcome.decrypt_failures() > 0 {
        tracing::warn!(
            "{} frames failed to decrypt and were retransmitted",
            outcome.decrypt_failures()
        );
    }

    let bytes = outcome.bytes();
    let output = output.unwrap_or_else(|| PathBuf::from(resource));
    if output.as_os_str() == "-" {
        use std::io::Write;
        std::io::stdout().write_all(&bytes)?;
    } else {
        std::fs::write(&output, &bytes)?;
        println!(
            "Fetched {} ({} units, {} bytes) -> {}",
            resource,
            outcome.units.len(),
            bytes.len(),
            output.display()
        );
    }
    Ok(())
}

/// Upload a file
async fn push(
    config: &Config,
    file: PathBuf,
    name: Option<String>,
    secure: bool,
) -> anyhow::Result<()> {
    if !file.is_file() {
        anyhow::bail!("File not found: {}", file.display());
    }
    let name = match name {
        Some(name) => name,
        None => file
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_owned)
            .ok_or_else(|| anyhow::anyhow!("Cannot derive a resource name from {}", file.display()))?,
    };

    let units = split_units(&std::fs::read(&file)?);
    let mut client = connect(config).await?;
    secure_if(&mut client, secure, config).await?;

    tracing::info!("Pushing {} as {:?} to {}", file.display(), name, client.server());
    let report = client.push(&name, &units).await?;
    println!(
        "Pushed {} as {} ({} units, {} retransmissions)",
        file.display(),
        name,
        report.units,
        report.retransmissions
    );
    Ok(())
}

/// Print the server's resources
async fn list(config: &Config, secure: bool) -> anyhow::Result<()> {
    let mut client = connect(config).await?;
    secure_if(&mut client, secure, config).await?;

    let names = client.list().await?;
    if names.is_empty() {
        println!("No resources");
    }
    for name in names {
        println!("{name}");
    }
    Ok(())
}

fn write_default_config(path: PathBuf, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!("{} already exists (use --force to replace it)", path.display());
    }
    Config::default().save(&path)?;
    println!("Wrote default configuration to {}", path.display());
    Ok(())
}
