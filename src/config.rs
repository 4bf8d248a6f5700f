// src/config.rs
// Node configuration from the environment, validated at startup.

use anyhow::{anyhow, Result};
use log::{error, info, warn};
use std::collections::BTreeMap;
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;

use crate::bft::ValidatorSet;
use crate::network::envelope::MsgType;
use crate::network::ingress::{DropPolicy, IngressConfig, LaneConfig};
use crate::network::peer_store::BootstrapPeer;

/// Validation result for configuration checks
#[derive(Debug, Default)]
pub struct ConfigValidation {
    pub valid: bool,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl ConfigValidation {
    fn new() -> Self {
        Self {
            valid: true,
            ..Default::default()
        }
    }

    fn add_warning(&mut self, msg: String) {
        self.warnings.push(msg);
    }

    fn add_error(&mut self, msg: String) {
        self.errors.push(msg);
        self.valid = false;
    }

    pub fn print_summary(&self) {
        for w in &self.warnings {
            warn!("config: {}", w);
        }
        for e in &self.errors {
            error!("config: {}", e);
        }
        if self.valid && self.warnings.is_empty() {
            info!("configuration validation passed");
        }
    }
}

#[derive(Clone, Debug)]
pub struct NodeConfig {
    pub chain_id: String,
    pub validators: ValidatorSet,
    pub self_val_id: Option<String>,
    pub node_id: Option<String>,
    pub base_url: String,
    pub listen_addr: SocketAddr,
    pub privkey_hex: Option<String>,
    pub bootstrap: Vec<BootstrapPeer>,
    pub state_dir: PathBuf,
    pub tick_ms: u64,
    pub round_timeout_ms: u64,
    pub sync_every_ms: u64,
    pub http_timeout_ms: u64,
    pub shutdown_grace_ms: u64,
    pub require_signed_block_req: bool,
    pub require_hello_for_block_req: bool,
    pub ingress: IngressConfig,
}

struct Reader<'a, F: Fn(&str) -> Option<String>> {
    lookup: &'a F,
    validation: &'a mut ConfigValidation,
}

impl<F: Fn(&str) -> Option<String>> Reader<'_, F> {
    fn string(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn u64_or(&mut self, key: &str, default: u64) -> u64 {
        match self.string(key) {
            None => default,
            Some(raw) => match raw.parse::<u64>() {
                Ok(v) => v,
                Err(_) => {
                    self.validation
                        .add_error(format!("{} must be an unsigned integer, got {:?}", key, raw));
                    default
                }
            },
        }
    }

    fn bool_or(&mut self, key: &str, default: bool) -> bool {
        match self.string(key) {
            None => default,
            Some(raw) => match raw.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => {
                    self.validation
                        .add_error(format!("{} must be a boolean, got {:?}", key, raw));
                    default
                }
            },
        }
    }
}

/// `0.0.0.0:<port of base_url>`.
fn listen_from_base_url(base_url: &str) -> Option<SocketAddr> {
    let url = url::Url::parse(base_url).ok()?;
    let port = url.port_or_known_default()?;
    Some(SocketAddr::from(([0, 0, 0, 0], port)))
}

impl NodeConfig {
    pub fn from_env() -> Result<(Self, ConfigValidation)> {
        Self::from_lookup(|k| env::var(k).ok())
    }

    /// Build from an arbitrary key lookup. All errors are reported together.
    pub fn from_lookup<F>(lookup: F) -> Result<(Self, ConfigValidation)>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut validation = ConfigValidation::new();
        let mut r = Reader {
            lookup: &lookup,
            validation: &mut validation,
        };

        let chain_id = r.string("CHAIN_ID").unwrap_or_else(|| {
            r.validation
                .add_warning("CHAIN_ID not set, using glyph-local".into());
            "glyph-local".to_string()
        });

        let validators = match r.string("VALIDATORS") {
            Some(csv) => match ValidatorSet::parse_csv(&csv) {
                Ok(v) => Some(v),
                Err(e) => {
                    r.validation.add_error(format!("VALIDATORS: {}", e));
                    None
                }
            },
            None => {
                r.validation.add_error("VALIDATORS is required".into());
                None
            }
        };
        if let Some(v) = &validators {
            if v.len() < 4 {
                r.validation.add_warning(format!(
                    "{} validators cannot tolerate a Byzantine fault",
                    v.len()
                ));
            }
        }

        let self_val_id = r.string("SELF_VAL_ID");
        match (&self_val_id, &validators) {
            (Some(me), Some(v)) if !v.contains(me) => {
                r.validation
                    .add_error(format!("SELF_VAL_ID {} is not in VALIDATORS", me));
            }
            (None, _) => r
                .validation
                .add_warning("SELF_VAL_ID not set, running as an observer".into()),
            _ => {}
        }

        let base_url = r
            .string("BASE_URL")
            .unwrap_or_else(|| "http://127.0.0.1:8080".to_string())
            .trim_end_matches('/')
            .to_string();
        let listen_raw = r.string("LISTEN_ADDR");
        let listen_addr = match &listen_raw {
            Some(raw) => raw.parse::<SocketAddr>().ok(),
            None => listen_from_base_url(&base_url),
        };
        let listen_addr = listen_addr.unwrap_or_else(|| {
            let msg = format!(
                "cannot derive a listen address (BASE_URL {:?}, LISTEN_ADDR {:?})",
                base_url, listen_raw
            );
            r.validation.add_error(msg);
            SocketAddr::from(([0, 0, 0, 0], 8080))
        });

        let bootstrap = match r.string("P2P_PEERS_JSON") {
            Some(raw) => BootstrapPeer::parse_list(&raw).unwrap_or_else(|e| {
                r.validation.add_error(format!("{:#}", e));
                Vec::new()
            }),
            None => Vec::new(),
        };

        let tick_ms = r.u64_or("CONSENSUS_TICK_MS", 50).max(1);
        let round_timeout_ms = r.u64_or("CONSENSUS_ROUND_TIMEOUT_MS", 2_000);
        if round_timeout_ms < tick_ms {
            r.validation.add_warning(format!(
                "CONSENSUS_ROUND_TIMEOUT_MS {} is shorter than the tick {}",
                round_timeout_ms, tick_ms
            ));
        }
        let sync_every_ms = r.u64_or("CONSENSUS_SYNC_EVERY_MS", 1_000).max(10);

        let mut lanes = BTreeMap::new();
        for t in MsgType::ALL {
            let d = LaneConfig::defaults_for(t);
            let name = t.as_str();
            let lane = LaneConfig {
                max_queue: r.u64_or(&format!("P2P_LANE_MAX_QUEUE_{}", name), d.max_queue as u64)
                    as usize,
                max_inflight: r
                    .u64_or(&format!("P2P_LANE_MAX_INFLIGHT_{}", name), d.max_inflight as u64)
                    as usize,
                dup_lru: r.u64_or(&format!("P2P_LANE_DUP_LRU_{}", name), d.dup_lru as u64)
                    as usize,
                rate_per_sec: r
                    .u64_or(&format!("P2P_LANE_RATE_PER_SEC_{}", name), d.rate_per_sec as u64)
                    .min(u32::MAX as u64) as u32,
            };
            if lane.max_inflight == 0 {
                r.validation
                    .add_error(format!("P2P_LANE_MAX_INFLIGHT_{} must be at least 1", name));
            }
            if lane.dup_lru == 0 {
                r.validation
                    .add_error(format!("P2P_LANE_DUP_LRU_{} must be at least 1", name));
            }
            lanes.insert(t, lane);
        }
        let drop_policy = match r.string("P2P_LANE_DROP_POLICY") {
            None => DropPolicy::DropNew,
            Some(raw) => DropPolicy::parse(&raw).unwrap_or_else(|| {
                r.validation.add_error(format!(
                    "P2P_LANE_DROP_POLICY must be drop_new or reject_429, got {:?}",
                    raw
                ));
                DropPolicy::DropNew
            }),
        };
        let ingress = IngressConfig {
            lanes,
            drop_policy,
            resp_cache_ttl_ms: r.u64_or("P2P_RESP_CACHE_TTL_MS", 2_000),
            resp_cache_max: r.u64_or("P2P_RESP_CACHE_MAX", 1_024).max(1) as usize,
            dedup_ttl_ms: r.u64_or("P2P_DEDUP_TTL_MS", 30_000),
        };

        let node_id = r.string("NODE_ID");
        let privkey_hex = r.string("P2P_PRIVKEY_HEX");
        let state_dir = PathBuf::from(
            r.string("STATE_DIR")
                .unwrap_or_else(|| "./glyph_state".to_string()),
        );
        let http_timeout_ms = r.u64_or("P2P_HTTP_TIMEOUT_MS", 2_000).max(1);
        let shutdown_grace_ms = r.u64_or("P2P_SHUTDOWN_GRACE_MS", 3_000);
        let require_signed_block_req = r.bool_or("P2P_REQUIRE_SIGNED_BLOCK", false);
        let require_hello_for_block_req = r.bool_or("P2P_REQUIRE_HELLO_BINDING_BLOCK", false);

        let validators = match validators {
            Some(v) if validation.valid => v,
            _ => {
                validation.print_summary();
                return Err(anyhow!(
                    "invalid configuration: {}",
                    validation.errors.join("; ")
                ));
            }
        };
        let config = NodeConfig {
            chain_id,
            validators,
            self_val_id,
            node_id,
            base_url,
            listen_addr,
            privkey_hex,
            bootstrap,
            state_dir,
            tick_ms,
            round_timeout_ms,
            sync_every_ms,
            http_timeout_ms,
            shutdown_grace_ms,
            require_signed_block_req,
            require_hello_for_block_req,
            ingress,
        };
        Ok((config, validation))
    }
}
