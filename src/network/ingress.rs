// src/network/ingress.rs
// Per-message-type ingress lanes: duplicate filter, per-peer rate limit,
// bounded queue with bounded in-flight work, and a response cache for the
// idempotent request types.

use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{watch, Semaphore, SemaphorePermit};

use super::envelope::{Envelope, MsgType};
use crate::error::P2pError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DropPolicy {
    /// Refuse the newcomer with `200 {accepted:false}`.
    DropNew,
    /// Refuse the newcomer with 429.
    Reject429,
}

impl DropPolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "drop_new" => Some(DropPolicy::DropNew),
            "reject_429" | "429" => Some(DropPolicy::Reject429),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LaneConfig {
    pub max_queue: usize,
    pub max_inflight: usize,
    pub dup_lru: usize,
    /// Messages per second per sending node; 0 disables the limit.
    pub rate_per_sec: u32,
}

impl LaneConfig {
    pub fn defaults_for(msg_type: MsgType) -> Self {
        let (max_queue, max_inflight) = match msg_type {
            MsgType::Vote => (512, 16),
            MsgType::Proposal => (128, 8),
            MsgType::BlockReq | MsgType::SyncReq => (128, 8),
            _ => (64, 4),
        };
        LaneConfig {
            max_queue,
            max_inflight,
            dup_lru: 4096,
            rate_per_sec: 0,
        }
    }
}

#[derive(Clone, Debug)]
pub struct IngressConfig {
    pub lanes: BTreeMap<MsgType, LaneConfig>,
    pub drop_policy: DropPolicy,
    pub resp_cache_ttl_ms: u64,
    pub resp_cache_max: usize,
    pub dedup_ttl_ms: u64,
}

impl Default for IngressConfig {
    fn default() -> Self {
        IngressConfig {
            lanes: MsgType::ALL
                .iter()
                .map(|t| (*t, LaneConfig::defaults_for(*t)))
                .collect(),
            drop_policy: DropPolicy::DropNew,
            resp_cache_ttl_ms: 2_000,
            resp_cache_max: 1_024,
            dedup_ttl_ms: 30_000,
        }
    }
}

#[derive(Default, Debug)]
pub struct LaneCounters {
    accepted: AtomicU64,
    dropped_dup: AtomicU64,
    dropped_full: AtomicU64,
    dropped_rate: AtomicU64,
    rejected: AtomicU64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CountersSnapshot {
    pub accepted: u64,
    pub dropped_dup: u64,
    pub dropped_full: u64,
    pub dropped_rate: u64,
    pub rejected: u64,
}

impl LaneCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            dropped_dup: self.dropped_dup.load(Ordering::Relaxed),
            dropped_full: self.dropped_full.load(Ordering::Relaxed),
            dropped_rate: self.dropped_rate.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

/// Fixed-window counter per sending node.
struct WindowLimiter {
    buckets: Mutex<HashMap<String, (u32, Instant)>>,
    max_per_window: u32,
    window: Duration,
}

impl WindowLimiter {
    fn new(max_per_window: u32) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            max_per_window,
            window: Duration::from_secs(1),
        }
    }

    fn check(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut buckets = self.buckets.lock();
        if buckets.len() > 4096 {
            let window = self.window;
            buckets.retain(|_, (_, start)| now.duration_since(*start) <= window);
        }
        let entry = buckets.entry(key.to_string()).or_insert((0, now));
        if now.duration_since(entry.1) > self.window {
            *entry = (1, now);
            true
        } else if entry.0 < self.max_per_window {
            entry.0 += 1;
            true
        } else {
            false
        }
    }
}

/// Decrements the queue depth when the waiting request leaves the queue,
/// including when its handler future is dropped.
struct QueueSlot<'a>(&'a AtomicUsize);

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct Lane {
    pub msg_type: MsgType,
    cfg: LaneConfig,
    queued: AtomicUsize,
    inflight: Semaphore,
    dedup: Mutex<LruCache<String, u64>>,
    limiter: Option<WindowLimiter>,
    counters: LaneCounters,
}

impl Lane {
    pub fn new(msg_type: MsgType, cfg: LaneConfig) -> Self {
        let cap = NonZeroUsize::new(cfg.dup_lru.max(1)).unwrap_or(NonZeroUsize::MIN);
        let limiter = (cfg.rate_per_sec > 0).then(|| WindowLimiter::new(cfg.rate_per_sec));
        Lane {
            msg_type,
            queued: AtomicUsize::new(0),
            inflight: Semaphore::new(cfg.max_inflight.max(1)),
            dedup: Mutex::new(LruCache::new(cap)),
            limiter,
            counters: LaneCounters::default(),
            cfg,
        }
    }

    pub fn config(&self) -> &LaneConfig {
        &self.cfg
    }

    pub fn counters(&self) -> CountersSnapshot {
        self.counters.snapshot()
    }

    pub fn queue_depth(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    /// True if `fp` was seen within `ttl_ms`; otherwise marks it seen.
    pub fn check_and_mark(&self, fp: &str, now_ms: u64, ttl_ms: u64) -> bool {
        let mut dedup = self.dedup.lock();
        if let Some(seen) = dedup.get(fp) {
            if now_ms.saturating_sub(*seen) <= ttl_ms {
                return true;
            }
        }
        dedup.put(fp.to_string(), now_ms);
        false
    }

    pub fn forget(&self, fp: &str) {
        self.dedup.lock().pop(fp);
    }

    fn allow(&self, node_id: &str) -> bool {
        self.limiter.as_ref().map(|l| l.check(node_id)).unwrap_or(true)
    }

    /// Wait for an in-flight slot, or `None` when the queue is full.
    pub async fn enter(&self) -> Option<SemaphorePermit<'_>> {
        let depth = self.queued.fetch_add(1, Ordering::SeqCst);
        let slot = QueueSlot(&self.queued);
        if depth >= self.cfg.max_queue {
            LaneCounters::bump(&self.counters.dropped_full);
            return None;
        }
        let permit = self.inflight.acquire().await.ok();
        drop(slot);
        match permit {
            Some(p) => {
                LaneCounters::bump(&self.counters.accepted);
                Some(p)
            }
            None => {
                LaneCounters::bump(&self.counters.dropped_full);
                None
            }
        }
    }
}

struct ResponseCache {
    entries: Mutex<LruCache<String, (u64, Value)>>,
    ttl_ms: u64,
}

impl ResponseCache {
    fn new(max: usize, ttl_ms: u64) -> Self {
        let cap = NonZeroUsize::new(max.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(cap)),
            ttl_ms,
        }
    }

    fn get(&self, key: &str, now_ms: u64) -> Option<Value> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some((expires, v)) if *expires >= now_ms => Some(v.clone()),
            Some(_) => {
                entries.pop(key);
                None
            }
            None => None,
        }
    }

    fn put(&self, key: String, value: Value, now_ms: u64) {
        self.entries
            .lock()
            .put(key, (now_ms.saturating_add(self.ttl_ms), value));
    }
}

struct PendingEntry<'a> {
    pending: &'a Mutex<HashMap<String, watch::Receiver<Option<Value>>>>,
    fp: String,
}

impl Drop for PendingEntry<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.fp);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LaneOutcome {
    Done(Value),
    /// Seen before; carries the cached response for idempotent lanes.
    Duplicate(Option<Value>),
    Full,
    RateLimited,
}

pub struct IngressLanes {
    lanes: BTreeMap<MsgType, Lane>,
    cache: ResponseCache,
    /// Cacheable requests whose handler is still running, by fingerprint.
    pending: Mutex<HashMap<String, watch::Receiver<Option<Value>>>>,
    pub drop_policy: DropPolicy,
    dedup_ttl_ms: u64,
}

impl IngressLanes {
    pub fn new(cfg: &IngressConfig) -> Self {
        let lanes = MsgType::ALL
            .iter()
            .map(|t| {
                let lane_cfg = cfg
                    .lanes
                    .get(t)
                    .cloned()
                    .unwrap_or_else(|| LaneConfig::defaults_for(*t));
                (*t, Lane::new(*t, lane_cfg))
            })
            .collect();
        IngressLanes {
            lanes,
            cache: ResponseCache::new(cfg.resp_cache_max, cfg.resp_cache_ttl_ms),
            pending: Mutex::new(HashMap::new()),
            drop_policy: cfg.drop_policy,
            dedup_ttl_ms: cfg.dedup_ttl_ms,
        }
    }

    pub fn lane(&self, msg_type: MsgType) -> Option<&Lane> {
        self.lanes.get(&msg_type)
    }

    /// Idempotent lanes key on the sender's `msg_id`; the rest on content.
    pub fn fingerprint(env: &Envelope) -> String {
        match env.msg_id() {
            Some(id) if env.msg_type.is_cacheable() => {
                format!("{}:{}", env.from_node_id, id)
            }
            _ => env.content_hash(),
        }
    }

    /// Run `handler` for an authenticated envelope under its lane's rules.
    pub async fn process<F, Fut>(
        &self,
        env: &Envelope,
        now_ms: u64,
        handler: F,
    ) -> Result<LaneOutcome, P2pError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, P2pError>>,
    {
        let lane = self
            .lane(env.msg_type)
            .ok_or_else(|| P2pError::Malformed(format!("no lane for {}", env.msg_type)))?;
        let fp = Self::fingerprint(env);
        let cacheable = env.msg_type.is_cacheable();
        let admitted = {
            let mut pending = self.pending.lock();
            if lane.check_and_mark(&fp, now_ms, self.dedup_ttl_ms) {
                Err(pending.get(&fp).cloned())
            } else if cacheable {
                let (tx, rx) = watch::channel(None);
                pending.insert(fp.clone(), rx);
                Ok(Some(tx))
            } else {
                Ok(None)
            }
        };
        let publish = match admitted {
            Ok(publish) => publish,
            Err(running) => {
                LaneCounters::bump(&lane.counters.dropped_dup);
                if !cacheable {
                    return Ok(LaneOutcome::Duplicate(None));
                }
                let cached = match (self.cache.get(&fp, now_ms), running) {
                    (Some(body), _) => Some(body),
                    (None, Some(rx)) => self.await_response(rx).await,
                    (None, None) => None,
                };
                return Ok(LaneOutcome::Duplicate(cached));
            }
        };
        let _running = publish.as_ref().map(|_| PendingEntry {
            pending: &self.pending,
            fp: fp.clone(),
        });
        if !lane.allow(&env.from_node_id) {
            lane.forget(&fp);
            LaneCounters::bump(&lane.counters.dropped_rate);
            return Ok(LaneOutcome::RateLimited);
        }
        let permit = match lane.enter().await {
            Some(p) => p,
            None => {
                lane.forget(&fp);
                return Ok(LaneOutcome::Full);
            }
        };
        let res = handler().await;
        drop(permit);
        match res {
            Ok(body) => {
                if let Some(tx) = publish {
                    self.cache.put(fp, body.clone(), now_ms);
                    let _ = tx.send(Some(body.clone()));
                }
                Ok(LaneOutcome::Done(body))
            }
            Err(e) => {
                lane.forget(&fp);
                LaneCounters::bump(&lane.counters.rejected);
                Err(e)
            }
        }
    }

    /// Wait for the first copy of a cacheable request to produce its body.
    /// `None` if it failed or outlived the cache TTL.
    async fn await_response(&self, mut rx: watch::Receiver<Option<Value>>) -> Option<Value> {
        let wait = async move {
            loop {
                if let Some(body) = rx.borrow().clone() {
                    return Some(body);
                }
                if rx.changed().await.is_err() {
                    return rx.borrow().clone();
                }
            }
        };
        tokio::time::timeout(Duration::from_millis(self.cache.ttl_ms), wait)
            .await
            .ok()
            .flatten()
    }

    /// `{TYPE: {counters: {...}, max_queue, max_inflight, queue_depth}}`
    pub fn status(&self) -> Value {
        let lanes: serde_json::Map<String, Value> = self
            .lanes
            .iter()
            .map(|(t, lane)| {
                (
                    t.as_str().to_string(),
                    json!({
                        "counters": lane.counters(),
                        "max_queue": lane.cfg.max_queue,
                        "max_inflight": lane.cfg.max_inflight,
                        "dup_lru": lane.cfg.dup_lru,
                        "queue_depth": lane.queue_depth(),
                    }),
                )
            })
            .collect();
        json!({
            "drop_policy": self.drop_policy,
            "lanes": lanes,
        })
    }
}
