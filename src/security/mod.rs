//! Request-side security: client addressing, verdict enforcement, challenges
//! and the background queue.
//!
//! # Data Flow
//! ```text
//! Admitted request:
//!     → client_ip.rs (source address per application setting)
//!     → firewall verdict (flood, then group policies)
//!     → enforcer.rs (block / log / challenge / pass)
//!         → dispatch.rs (hit logs, kernel blocklist)
//!         → challenge.rs (pending challenges, one-shot passes)
//! ```

pub mod challenge;
pub mod client_ip;
pub mod dispatch;
pub mod enforcer;
pub mod identity;

pub use challenge::{ArithmeticChallenge, ChallengeOutcome, ChallengeProvider, ChallengeStore, PendingChallenge, Question};
pub use client_ip::client_ip;
pub use dispatch::{BackgroundTask, HitLogSink, TaskDispatcher, TaskWorker};
pub use enforcer::{Enforcement, Enforcer, HitContext, Verdict};
pub use identity::{Identity, IdentityResolver, NoIdentity};
