//! Escrow-backed trade settlement engine for peer-to-peer marketplaces
//!
//! This crate implements the order lifecycle and settlement core that holds
//! buyer funds neutrally until delivery is verified:
//! - Proof-gated dual confirmation with exactly-once fund release
//! - Fee/referral/VIP split calculation and append-only payout ledgers
//! - Point/credit wallets reconciled against their ledgers
//! - Dispute freezing with staff-applied resolutions
//! - Lazy deadline policies (48h dispute window, 24h stale auto-cancel)

pub mod disputes;
pub mod error;
pub mod lifecycle;
pub mod models;
pub mod node;
pub mod outbox;
pub mod proofs;
pub mod provider;
pub mod settings;
pub mod settlement;
pub mod stats;
pub mod timers;
pub mod verification;
pub mod wallet;

use error::EngineError;

/// Result type alias for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Install a global tracing subscriber for binaries and test harnesses.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_target(false).try_init();
}
