//! SMB2/3 Client CLI

use clap::{Parser, Subcommand};
use rust_smb_client::config::FramingMode;
use rust_smb_client::{AnonymousCredentials, ClientConfig, OpenOptions, SmbClient};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "smb-client")]
#[command(about = "Rust SMB2/3 Client", long_about = None)]
struct Args {
    /// SMB server address or hostname
    #[arg(short = 'H', long)]
    host: String,

    /// Port to connect to
    #[arg(short = 'p', long, default_value = "445")]
    port: u16,

    /// Use NetBIOS session framing regardless of the port
    #[arg(long)]
    netbios: bool,

    /// Require signed sessions
    #[arg(long)]
    require_signing: bool,

    /// Per-request timeout in seconds
    #[arg(long, default_value = "30")]
    timeout: u64,

    /// Log level
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print a remote file to stdout
    Cat {
        /// Share name
        share: String,
        /// Path within the share
        path: String,
    },

    /// Upload a file to the server
    Put {
        /// Share name
        share: String,
        /// Local file path
        local: PathBuf,
        /// Remote file path (optional, uses local filename if not specified)
        remote: Option<String>,
    },

    /// Authenticate and send an echo request
    Echo,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level)),
        )
        .init();

    let config = ClientConfig {
        port: args.port,
        framing: if args.netbios {
            FramingMode::NetBios
        } else {
            FramingMode::Auto
        },
        signing_required: args.require_signing,
        response_timeout: Duration::from_secs(args.timeout),
        ..ClientConfig::default()
    };
    let client = SmbClient::new(config)?;

    tracing::info!("Connecting to {}:{}", args.host, args.port);
    let session = client
        .connect(&args.host, Arc::new(AnonymousCredentials))
        .await?;

    let outcome = run(&session, args.command).await;
    session.release().await?;
    outcome?;
    tracing::info!("Disconnected");
    Ok(())
}

async fn run(
    session: &rust_smb_client::SmbSession,
    command: Commands,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Commands::Echo => {
            let started = std::time::Instant::now();
            session.echo().await?;
            println!("echo from {} in {:?}", session.host(), started.elapsed());
        }

        Commands::Cat { share, path } => {
            let tree = session.tree(&share).await?;
            let handle = tree.open(&path, OpenOptions::read()).await?;

            let mut stdout = std::io::stdout().lock();
            let mut offset = 0u64;
            let result = loop {
                match handle.read(offset, 1024 * 1024).await {
                    Ok(chunk) if chunk.is_empty() => break Ok(()),
                    Ok(chunk) => {
                        stdout.write_all(&chunk)?;
                        offset += chunk.len() as u64;
                    }
                    Err(e) => break Err(e),
                }
            };
            stdout.flush()?;
            drop(stdout);

            handle.close().await?;
            tree.release().await?;
            result?;
            tracing::info!("Read {} bytes", offset);
        }

        Commands::Put {
            share,
            local,
            remote,
        } => {
            let remote_path = remote.unwrap_or_else(|| {
                local
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or("upload")
                    .to_string()
            });
            tracing::info!("Uploading {} -> {}", local.display(), remote_path);
            let data = std::fs::read(&local)?;

            let tree = session.tree(&share).await?;
            let handle = tree.open(&remote_path, OpenOptions::create()).await?;
            let result = handle.write(0, &data).await;
            handle.close().await?;
            tree.release().await?;
            tracing::info!("Uploaded {} bytes", result?);
        }
    }
    Ok(())
}
