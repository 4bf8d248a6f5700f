// src/network/mod.rs
pub mod api;
pub mod auth;
pub mod broadcast;
pub mod envelope;
pub mod handshake;
pub mod ingress;
pub mod peer_store;
pub mod transport;

pub use api::{router, P2pContext};
pub use broadcast::Broadcaster;
pub use envelope::{Envelope, LocalIdentity, MsgType};
pub use ingress::{DropPolicy, IngressConfig, IngressLanes, LaneConfig};
pub use peer_store::{BootstrapPeer, PeerRecord, PeerStore};
pub use transport::{HttpTransport, PeerReply, PeerTransport};
