//! peercall - Peer-to-peer calls over relay signaling

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn, Level};
use tracing_subscriber::EnvFilter;

use peercall::network::{CallEngine, CallEvent, CallHandle, RelayClient, RtcTransportFactory};
use peercall::protocol::{ChannelId, MediaKind};
use peercall::{CallConfig, Participant};

#[derive(Parser)]
#[command(name = "peercall")]
#[command(about = "Peer-to-peer text and media calls over a signaling relay")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to the platform config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the channel id two participants share
    ChannelId {
        #[arg(long)]
        tenant: String,

        #[arg(long)]
        user: String,

        #[arg(long)]
        peer: String,
    },

    /// Call a peer and chat
    Chat(CallArgs),

    /// Wait for a peer to call, then chat
    Listen(CallArgs),
}

#[derive(Args)]
struct CallArgs {
    /// Relay server URL (e.g., wss://example.com)
    #[arg(short, long, env = "PEERCALL_SERVER")]
    server: Option<String>,

    #[arg(long)]
    tenant: Option<String>,

    /// Your user id
    #[arg(long)]
    user: Option<String>,

    /// The remote user id
    #[arg(long)]
    peer: String,

    /// Where received media is written
    #[arg(long, default_value = ".")]
    output_dir: PathBuf,

    /// Bytes per media frame
    #[arg(long)]
    chunk_size: Option<usize>,

    /// STUN/TURN server url (repeatable)
    #[arg(long = "ice-server")]
    ice_servers: Vec<String>,
}

/// RUST_LOG wins over --verbose when set
fn setup_logging(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

/// File values overridden by command line flags
fn resolve_config(path: Option<&Path>, args: &CallArgs) -> Result<CallConfig> {
    let mut config = CallConfig::load_or_default(path).context("Failed to load config")?;

    if let Some(server) = &args.server {
        config.relay_url = Some(server.clone());
    }
    if let Some(tenant) = &args.tenant {
        config.tenant = Some(tenant.clone());
    }
    if let Some(user) = &args.user {
        config.user_id = Some(user.clone());
    }
    if let Some(chunk_size) = args.chunk_size {
        config.chunk_size = chunk_size;
    }
    if !args.ice_servers.is_empty() {
        config.ice_servers = args.ice_servers.clone();
    }

    config.validate()?;
    Ok(config)
}

fn kind_name(kind: MediaKind) -> &'static str {
    match kind {
        MediaKind::Video => "video",
        MediaKind::Audio => "audio",
    }
}

async fn save_media(output_dir: &Path, kind: MediaKind, payload: &[u8], index: u32) -> Result<PathBuf> {
    tokio::fs::create_dir_all(output_dir).await?;
    let path = output_dir.join(format!("received-{}-{}.bin", kind_name(kind), index));
    tokio::fs::write(&path, payload)
        .await
        .with_context(|| format!("Failed to write {:?}", path))?;
    Ok(path)
}

/// Handle one line typed by the user; returns false to quit
async fn handle_line(handle: &CallHandle, channel_id: &ChannelId, line: &str) -> Result<bool> {
    if line == "/quit" {
        return Ok(false);
    }

    let request = if let Some(path) = line.strip_prefix("/send-audio ") {
        Some((MediaKind::Audio, path.trim()))
    } else if let Some(path) = line.strip_prefix("/send-video ") {
        Some((MediaKind::Video, path.trim()))
    } else {
        None
    };

    match request {
        Some((kind, path)) => {
            let payload = tokio::fs::read(&path)
                .await
                .with_context(|| format!("Failed to read {}", path))?;
            let size = payload.len();
            let frames = handle.send_media(channel_id, kind, payload).await?;
            println!("Sent {} ({} bytes, {} frames)", path, size, frames);
        }
        None => {
            handle.send_text(channel_id, line).await?;
            println!("You: {}", line);
        }
    }
    Ok(true)
}

async fn run_call(config_path: Option<PathBuf>, args: CallArgs, initiate: bool) -> Result<()> {
    let config = resolve_config(config_path.as_deref(), &args)?;

    let Some(url) = config.relay_url.clone() else {
        bail!("No relay server configured (use --server)");
    };
    let Some(participant) = config.participant() else {
        bail!("Both --tenant and --user are required");
    };
    if participant.user_id == args.peer {
        bail!("Cannot call yourself");
    }

    info!("Connecting to relay {}", url);
    let relay = RelayClient::new(&url).connect().await?;
    let factory = Arc::new(RtcTransportFactory::new(config.ice_servers.clone()));
    let (handle, mut events, engine) =
        CallEngine::spawn(participant, config.session_options(), factory, relay);

    let channel_id = handle.channel_with(&args.peer);
    println!("Channel: {}", channel_id);
    if initiate {
        handle.connect(&channel_id).await?;
        println!("Calling {}...", args.peer);
    } else {
        println!("Waiting for {} to call...", args.peer);
    }

    let stdin = tokio::io::stdin();
    let mut stdin_reader = BufReader::new(stdin).lines();
    let mut received = 0u32;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                break;
            }
            event = events.recv() => {
                let Some(event) = event else {
                    break;
                };
                if event.channel_id().is_some_and(|id| id != &channel_id) {
                    debug!("Ignoring event for another channel: {:?}", event);
                    continue;
                }
                match event {
                    CallEvent::Connected { .. } => {
                        println!("Connected to {}. Type a message, /send-audio PATH, /send-video PATH or /quit", args.peer);
                    }
                    CallEvent::Text { text, .. } => {
                        println!("{}: {}", args.peer, text);
                    }
                    CallEvent::Media { kind, payload, .. } => {
                        received += 1;
                        match save_media(&args.output_dir, kind, &payload, received).await {
                            Ok(path) => println!("Received {} ({} bytes) -> {:?}", kind_name(kind), payload.len(), path),
                            Err(e) => warn!("{:#}", e),
                        }
                    }
                    CallEvent::Closed { .. } => {
                        println!("{} hung up", args.peer);
                        if initiate {
                            break;
                        }
                    }
                    CallEvent::Warning { message, .. } => {
                        warn!("{}", message);
                    }
                }
            }
            line_result = stdin_reader.next_line() => {
                match line_result {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        match handle_line(&handle, &channel_id, line).await {
                            Ok(true) => {}
                            Ok(false) => break,
                            Err(e) => warn!("{:#}", e),
                        }
                    }
                    Ok(None) => {
                        info!("stdin closed");
                        break;
                    }
                    Err(e) => {
                        warn!("stdin error: {}", e);
                        break;
                    }
                }
            }
        }
    }

    handle.shutdown().await?;
    engine.await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    match cli.command {
        Commands::ChannelId { tenant, user, peer } => {
            println!("{}", Participant::new(tenant, user).channel_with(&peer));
        }
        Commands::Chat(args) => run_call(cli.config, args, true).await?,
        Commands::Listen(args) => run_call(cli.config, args, false).await?,
    }

    Ok(())
}
