// src/node.rs
// Wires keystore, chain store, peer store, engine, broadcaster, catchup and
// the HTTP router into one running node.

use anyhow::{Context, Result};
use axum::Router;
use log::info;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;

use crate::bft::engine::EngineConfig;
use crate::bft::{
    spawn_engine, ConsensusCore, ConsensusSnapshot, CoreParams, EngineHandle, FinalizedChain,
};
use crate::config::NodeConfig;
use crate::crypto::Keystore;
use crate::network::auth::AuthPolicy;
use crate::network::broadcast::{spawn_fanout, spawn_hello_loop};
use crate::network::{
    router, Broadcaster, IngressLanes, LocalIdentity, P2pContext, PeerStore, PeerTransport,
};
use crate::node_identity::NodeIdentity;
use crate::sync::{spawn_catchup_loop, CatchupService};

/// Engine messages waiting for the fanout task.
const OUTBOUND_CAPACITY: usize = 4096;
const ENGINE_INBOX_CAPACITY: usize = 1024;

pub struct Node {
    identity: LocalIdentity,
    pubkey_hex: String,
    ctx: Arc<P2pContext>,
    catchup: Arc<CatchupService>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Node {
    /// Open the state directory and start every background task.
    pub async fn start(config: NodeConfig, transport: Arc<dyn PeerTransport>) -> Result<Self> {
        let state = config.state_dir.clone();
        std::fs::create_dir_all(&state)
            .with_context(|| format!("create state dir {}", state.display()))?;

        let keystore = Arc::new(match &config.privkey_hex {
            Some(hex) => Keystore::from_hex(hex)?,
            None => Keystore::load_or_generate(&state.join("p2p_key"))?,
        });
        let stored = NodeIdentity::load_or_create(
            &state.join("node_identity.json"),
            config.node_id.as_deref(),
            config.self_val_id.as_deref(),
            &config.base_url,
            keystore.pubkey_hex(),
        )?;
        let identity = LocalIdentity {
            chain_id: config.chain_id.clone(),
            node_id: stored.node_id.clone(),
            val_id: config.self_val_id.clone(),
            base_url: config.base_url.clone(),
        };

        let chain = Arc::new(FinalizedChain::open(&state.join("blocks"))?);
        let peers = Arc::new(PeerStore::new(
            &identity.node_id,
            &identity.base_url,
            Some(state.join("peers.json")),
        ));
        if let Err(e) = peers.load() {
            log::warn!("ignoring unreadable peer list: {:#}", e);
        }
        peers.seed(&config.bootstrap);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let catchup_trigger = Arc::new(Notify::new());

        let core = ConsensusCore::new(
            CoreParams {
                chain_id: config.chain_id.clone(),
                validators: config.validators.clone(),
                self_val_id: config.self_val_id.clone(),
                round_timeout_ms: config.round_timeout_ms,
            },
            chain.clone(),
        );
        let (engine, mut tasks) = spawn_engine(
            core,
            EngineConfig {
                tick_ms: config.tick_ms,
                inbox_capacity: ENGINE_INBOX_CAPACITY,
                reply_timeout: Duration::from_millis(config.http_timeout_ms),
            },
            outbound_tx,
            catchup_trigger.clone(),
            shutdown_rx.clone(),
        );

        let broadcaster = Broadcaster::new(
            identity.clone(),
            keystore.clone(),
            peers.clone(),
            transport,
            shutdown_rx.clone(),
        );
        tasks.push(spawn_fanout(
            broadcaster.clone(),
            outbound_rx,
            shutdown_rx.clone(),
        ));
        let every = Duration::from_millis(config.sync_every_ms);
        tasks.push(spawn_hello_loop(
            broadcaster.clone(),
            every,
            shutdown_rx.clone(),
        ));
        let catchup = CatchupService::new(
            broadcaster,
            peers.clone(),
            engine.clone(),
            config.validators.clone(),
        );
        tasks.push(spawn_catchup_loop(
            catchup.clone(),
            every,
            catchup_trigger.clone(),
            shutdown_rx,
        ));

        let ctx = Arc::new(P2pContext {
            identity: identity.clone(),
            validators: config.validators.clone(),
            peers,
            lanes: IngressLanes::new(&config.ingress),
            auth: AuthPolicy {
                chain_id: config.chain_id.clone(),
                require_signed_block_req: config.require_signed_block_req,
                require_hello_for_block_req: config.require_hello_for_block_req,
            },
            engine,
            chain,
            catchup: catchup_trigger,
        });
        info!(
            "node {} ({:?}) on chain {} with {} validators, finalized height {}",
            identity.node_id,
            identity.val_id,
            identity.chain_id,
            config.validators.len(),
            ctx.chain.finalized_height()
        );

        Ok(Node {
            identity,
            pubkey_hex: keystore.pubkey_hex().to_string(),
            ctx,
            catchup,
            shutdown_tx,
            tasks,
        })
    }

    pub fn router(&self) -> Router {
        router(self.ctx.clone())
    }

    pub fn identity(&self) -> &LocalIdentity {
        &self.identity
    }

    pub fn pubkey_hex(&self) -> &str {
        &self.pubkey_hex
    }

    pub fn engine(&self) -> &EngineHandle {
        &self.ctx.engine
    }

    pub fn snapshot(&self) -> ConsensusSnapshot {
        self.ctx.engine.snapshot()
    }

    pub fn chain(&self) -> &Arc<FinalizedChain> {
        &self.ctx.chain
    }

    pub fn peers(&self) -> &Arc<PeerStore> {
        &self.ctx.peers
    }

    /// Run one catchup pass immediately.
    pub async fn catch_up(&self) -> Result<u64> {
        self.catchup.run_once().await
    }

    /// Stop background tasks, waiting at most `grace` for each.
    pub async fn shutdown(self, grace: Duration) {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks {
            if tokio::time::timeout(grace, task).await.is_err() {
                log::warn!("background task did not stop within {:?}", grace);
            }
        }
        if let Err(e) = self.ctx.peers.save() {
            log::warn!("failed to persist peers on shutdown: {:#}", e);
        }
        info!("node {} stopped", self.identity.node_id);
    }
}
