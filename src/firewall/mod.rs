//! Request inspection: flood detection, group policies and the kernel
//! blocklist.

pub mod cc;
pub mod check_item;
pub mod fingerprint;
pub mod nftables;
pub mod policy;
pub mod types;

use std::net::IpAddr;

use thiserror::Error;

pub use cc::{FloodDetector, FloodVerdict};
pub use check_item::{CheckItemIndex, CompiledCheckItem};
pub use fingerprint::{challenge_client_id, flood_fingerprint, sha256_hex};
pub use nftables::{KernelBlocklist, NftCommand, PacketFilter};
pub use policy::{PolicyEngine, PolicyHit};
pub use types::{
    CcLog, CcPolicy, CheckItem, CheckPoint, ClientStat, GroupHitLog, GroupPolicy, HitInfo, HitKind, Operation,
    PolicyAction, RequestSummary, RequestView, VulnType,
};

#[derive(Debug, Error)]
pub enum FirewallError {
    #[error("Global CC policy cannot be deleted")]
    GlobalPolicyProtected,

    #[error("Invalid policy: {0}")]
    InvalidPolicy(String),

    #[error("Check item {id} has an invalid pattern: {reason}")]
    InvalidPattern { id: i64, reason: String },

    #[error("Packet filter rejected the ruleset: {0}")]
    Kernel(String),

    #[error("Kernel blocklist only holds IPv4 addresses, got {0}")]
    UnsupportedAddress(IpAddr),

    #[error("Packet filter I/O error: {0}")]
    Io(#[from] std::io::Error),
}
