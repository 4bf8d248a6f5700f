// src/network/broadcast.rs
// Outbound side: seals engine messages, fans them out to per-peer ordered
// workers, and re-announces HELLO.

use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::envelope::{Envelope, LocalIdentity, MsgType};
use super::handshake::build_hello;
use super::peer_store::PeerStore;
use super::transport::{PeerReply, PeerTransport};
use crate::bft::OutboundMessage;
use crate::crypto::Keystore;
use crate::now_ms;

/// Envelopes queued per peer before new ones are dropped.
pub const PEER_QUEUE_CAPACITY: usize = 256;

pub struct Broadcaster {
    identity: LocalIdentity,
    keystore: Arc<Keystore>,
    peers: Arc<PeerStore>,
    transport: Arc<dyn PeerTransport>,
    workers: Mutex<HashMap<String, mpsc::Sender<Envelope>>>,
    shutdown: watch::Receiver<bool>,
}

impl Broadcaster {
    pub fn new(
        identity: LocalIdentity,
        keystore: Arc<Keystore>,
        peers: Arc<PeerStore>,
        transport: Arc<dyn PeerTransport>,
        shutdown: watch::Receiver<bool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            identity,
            keystore,
            peers,
            transport,
            workers: Mutex::new(HashMap::new()),
            shutdown,
        })
    }

    pub fn identity(&self) -> &LocalIdentity {
        &self.identity
    }

    pub fn keystore(&self) -> &Keystore {
        &self.keystore
    }

    pub fn transport(&self) -> &Arc<dyn PeerTransport> {
        &self.transport
    }

    /// Sign an engine message and queue it for every known peer.
    pub fn publish(&self, msg: OutboundMessage) {
        let now = now_ms();
        let sealed = match &msg {
            OutboundMessage::Proposal(p) => {
                self.identity
                    .seal(&self.keystore, MsgType::Proposal, p, now)
            }
            OutboundMessage::Vote(v) => self.identity.seal(&self.keystore, MsgType::Vote, v, now),
        };
        match sealed {
            Ok(env) => self.send_to_all(env),
            Err(e) => warn!("failed to seal outbound message: {}", e),
        }
    }

    pub fn send_to_all(&self, env: Envelope) {
        for base_url in self.peers.targets() {
            let tx = self.worker_for(&base_url);
            if let Err(e) = tx.try_send(env.clone()) {
                debug!("dropping {} for {}: {}", env.msg_type, base_url, e);
            }
        }
    }

    fn worker_for(&self, base_url: &str) -> mpsc::Sender<Envelope> {
        let mut workers = self.workers.lock();
        if let Some(tx) = workers.get(base_url) {
            if !tx.is_closed() {
                return tx.clone();
            }
        }
        let (tx, rx) = mpsc::channel(PEER_QUEUE_CAPACITY);
        tokio::spawn(peer_worker(
            base_url.to_string(),
            self.transport.clone(),
            rx,
            self.shutdown.clone(),
        ));
        workers.insert(base_url.to_string(), tx.clone());
        tx
    }

    pub async fn hello(&self, base_url: &str) -> anyhow::Result<PeerReply> {
        let env = build_hello(&self.identity, &self.keystore, now_ms());
        let body = serde_json::to_value(&env)?;
        self.transport
            .post_json(base_url, MsgType::Hello.path(), &body)
            .await
    }

    /// HELLO every known peer concurrently.
    pub async fn hello_all(&self) {
        let targets = self.peers.targets();
        let calls = targets.iter().map(|url| async move {
            match self.hello(url).await {
                Ok(reply) if reply.is_success() => {}
                Ok(reply) => debug!("HELLO to {} answered {}: {}", url, reply.status, reply.body),
                Err(e) => debug!("HELLO to {} failed: {}", url, e),
            }
        });
        futures::future::join_all(calls).await;
    }
}

async fn peer_worker(
    base_url: String,
    transport: Arc<dyn PeerTransport>,
    mut rx: mpsc::Receiver<Envelope>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let env = tokio::select! {
            _ = shutdown.changed() => break,
            env = rx.recv() => match env {
                Some(env) => env,
                None => break,
            },
        };
        let body = match serde_json::to_value(&env) {
            Ok(b) => b,
            Err(e) => {
                warn!("failed to encode {}: {}", env.msg_type, e);
                continue;
            }
        };
        match transport.post_json(&base_url, env.msg_type.path(), &body).await {
            Ok(reply) if reply.status >= 400 => {
                debug!("{} to {} rejected ({}): {}", env.msg_type, base_url, reply.status, reply.body)
            }
            Ok(_) => {}
            Err(e) => debug!("{} to {} failed: {}", env.msg_type, base_url, e),
        }
    }
}

/// Drain the engine's outbound channel into the per-peer workers.
pub fn spawn_fanout(
    broadcaster: Arc<Broadcaster>,
    mut outbound: mpsc::Receiver<OutboundMessage>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                msg = outbound.recv() => match msg {
                    Some(msg) => broadcaster.publish(msg),
                    None => break,
                },
            }
        }
        debug!("fanout stopped");
    })
}

/// HELLO all peers now and then every `every`.
pub fn spawn_hello_loop(
    broadcaster: Arc<Broadcaster>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("announcing {} to {} peers", broadcaster.identity().node_id, broadcaster.peers.len());
        let mut interval = tokio::time::interval(every.max(Duration::from_millis(10)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = interval.tick() => broadcaster.hello_all().await,
            }
        }
    })
}
