pub mod bft;
pub mod config;
pub mod crypto;
pub mod error;
pub mod network;
pub mod node;
pub mod node_identity;
pub mod storage;
pub mod sync;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::info;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::config::NodeConfig;
use crate::crypto::Keystore;
use crate::network::HttpTransport;
use crate::node::Node;

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

#[derive(Parser)]
#[command(name = "glyph")]
#[command(about = "GlyphChain BFT consensus node", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a node configured from the environment (and `.env`)
    Start {
        /// Override STATE_DIR
        #[arg(long)]
        state_dir: Option<PathBuf>,
    },
    /// Print a fresh P2P private key and its public key
    Keygen,
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Keygen => {
            let key = Keystore::from_signing_key(ed25519_dalek::SigningKey::generate(
                &mut rand::rngs::OsRng,
            ));
            println!("P2P_PRIVKEY_HEX={}", key.seed_hex());
            println!("pubkey_hex={}", key.pubkey_hex());
            Ok(())
        }
        Commands::Start { state_dir } => {
            let (mut config, validation) = NodeConfig::from_env()?;
            validation.print_summary();
            if let Some(dir) = state_dir {
                config.state_dir = dir;
            }
            serve(config).await
        }
    }
}

/// Serve a node over HTTP until ctrl-c, then shut down gracefully.
pub async fn serve(config: NodeConfig) -> Result<()> {
    let transport = Arc::new(HttpTransport::new(Duration::from_millis(
        config.http_timeout_ms,
    ))?);
    let addr = config.listen_addr;
    let grace = Duration::from_millis(config.shutdown_grace_ms);
    let node = Node::start(config, transport).await?;
    let app = node.router();

    let handle = axum_server::Handle::new();
    let server_handle = handle.clone();
    let mut server = tokio::spawn(async move {
        axum_server::bind(addr)
            .handle(server_handle)
            .serve(app.into_make_service_with_connect_info::<SocketAddr>())
            .await
    });
    info!(
        "node {} listening on http://{} (announced as {})",
        node.identity().node_id,
        addr,
        node.identity().base_url
    );

    let finished = tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res.context("listen for ctrl-c")?;
            info!("shutdown requested");
            None
        }
        res = &mut server => Some(res),
    };

    handle.graceful_shutdown(Some(grace));
    node.shutdown(grace).await;
    let res = match finished {
        Some(res) => res,
        None => server.await,
    };
    res.context("HTTP server task failed")?
        .with_context(|| format!("HTTP server on {}", addr))
}
