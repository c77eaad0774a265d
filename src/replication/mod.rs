//! Primary/replica configuration replication.
//!
//! # Data Flow
//! ```text
//! replica SyncLoop tick
//!     → ReplicationClient (token = AES-GCM(cur_time), node version)
//!     → primary rpc_router: verify token (±180 s), record node, run action
//!     → watermarks compared, stale subsystems reloaded in background tasks
//!
//! replica hit logs
//!     → ReplicationClient::submit_* → primary store
//! ```

pub mod auth;
pub mod client;
pub mod server;
pub mod sync;
pub mod types;

pub use auth::{AuthError, NodeKey, MAX_CLOCK_SKEW_SECS};
pub use client::{ReplicationClient, ReplicationError};
pub use server::{rpc_router, RpcState};
pub use sync::SyncLoop;
pub use types::{Node, NodeAuth, RpcAction, RpcRequest, RpcResponse};
