//! Standalone relay server binary
//!
//! Run with:
//!   cargo run --bin relay-server -- --port 8080
//!
//! With TLS:
//!   cargo run --bin relay-server -- --port 8443 --cert cert.pem --key key.pem

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio_rustls::TlsAcceptor;
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

use peercall::network::RelayServer;

/// Broadcast relay for peercall signaling
#[derive(Parser, Debug)]
#[command(name = "relay-server")]
#[command(about = "Broadcast relay for peercall signaling")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Path to TLS certificate file (PEM format)
    #[arg(long)]
    cert: Option<PathBuf>,

    /// Path to TLS private key file (PEM format)
    #[arg(long)]
    key: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn open_pem(path: &Path) -> Result<BufReader<File>> {
    let file = File::open(path).with_context(|| format!("Failed to open {:?}", path))?;
    Ok(BufReader::new(file))
}

/// TLS acceptor for a PEM certificate chain and private key
fn tls_acceptor(cert: &Path, key: &Path) -> Result<TlsAcceptor> {
    let chain = rustls_pemfile::certs(&mut open_pem(cert)?)
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("Invalid certificate in {:?}", cert))?;
    let private_key = rustls_pemfile::private_key(&mut open_pem(key)?)?
        .with_context(|| format!("No private key found in {:?}", key))?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(chain, private_key)?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    let addr = format!("{}:{}", args.host, args.port);
    let server = RelayServer::new();

    match (&args.cert, &args.key) {
        (Some(cert), Some(key)) => {
            let acceptor = tls_acceptor(cert, key)?;
            info!("Relay starting on wss://{}", addr);
            server.run_tls(&addr, acceptor).await?;
        }
        (None, None) => {
            warn!("TLS disabled, relay starting on ws://{}", addr);
            server.run(&addr).await?;
        }
        _ => bail!("Both --cert and --key must be provided for TLS"),
    }

    Ok(())
}
