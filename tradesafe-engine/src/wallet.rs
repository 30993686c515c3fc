//! Wallet Ledger - append-only point/credit ledgers and balance projections
//!
//! Every balance change is one unit of work: update the cached wallet
//! projection and append an immutable ledger row carrying the source tag.
//! The ledgers are the source of truth; `reconciles` checks the projection
//! against them.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use crate::error::EngineError;
use crate::models::{CreditLedgerEntry, LedgerSource, PointsLedgerEntry, Wallet};
use crate::EngineResult;

/// Configuration for the wallet ledger
#[derive(Debug, Clone)]
pub struct WalletConfig {
    /// Points per dollar of credit on conversion
    pub points_per_dollar: i64,
    /// Conversions must be a multiple of this many points
    pub conversion_step_points: i64,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            points_per_dollar: 100,
            conversion_step_points: 100,
        }
    }
}

/// Inner book guarded by a single lock so every operation that touches a
/// balance and its ledger commits as one unit.
#[derive(Debug, Default)]
struct WalletBook {
    wallets: HashMap<Uuid, Wallet>,
    points_rows: Vec<PointsLedgerEntry>,
    credit_rows: Vec<CreditLedgerEntry>,
}

impl WalletBook {
    fn wallet_mut(&mut self, user_id: Uuid) -> &mut Wallet {
        self.wallets
            .entry(user_id)
            .or_insert_with(|| Wallet::new(user_id))
    }
}

/// Wallet ledger service
///
/// In-memory storage; in production this would be a database with the same
/// single-transaction boundaries.
pub struct WalletLedger {
    config: WalletConfig,
    book: Arc<RwLock<WalletBook>>,
}

impl WalletLedger {
    pub fn new(config: WalletConfig) -> Self {
        Self {
            config,
            book: Arc::new(RwLock::new(WalletBook::default())),
        }
    }

    /// Get (or create) a user's wallet projection
    pub async fn wallet(&self, user_id: Uuid) -> Wallet {
        self.book.write().await.wallet_mut(user_id).clone()
    }

    /// Apply a signed point delta and append the matching ledger row.
    /// Balances never go negative; a debit beyond the balance fails and
    /// leaves the wallet unchanged.
    pub async fn add_points(
        &self,
        user_id: Uuid,
        delta: i64,
        source: LedgerSource,
        metadata: Option<serde_json::Value>,
    ) -> EngineResult<Wallet> {
        if delta == 0 {
            return Err(EngineError::precondition("Point delta must be non-zero"));
        }

        let mut book = self.book.write().await;
        let wallet = book.wallet_mut(user_id);

        if wallet.points_balance + delta < 0 {
            return Err(EngineError::precondition(format!(
                "Insufficient points: balance {}, delta {}",
                wallet.points_balance, delta
            )));
        }

        wallet.points_balance += delta;
        if delta > 0 {
            wallet.lifetime_points_earned += delta;
        }
        wallet.updated_at = Utc::now();
        let snapshot = wallet.clone();

        book.points_rows.push(PointsLedgerEntry {
            id: Uuid::new_v4(),
            user_id,
            source,
            delta,
            metadata,
            created_at: Utc::now(),
        });

        info!("Applied {} points to {} ({:?})", delta, user_id, source);

        Ok(snapshot)
    }

    /// Apply a signed credit delta (cents) and append the matching ledger row
    pub async fn add_credit(
        &self,
        user_id: Uuid,
        delta_cents: i64,
        source: LedgerSource,
        metadata: Option<serde_json::Value>,
    ) -> EngineResult<Wallet> {
        if delta_cents == 0 {
            return Err(EngineError::precondition("Credit delta must be non-zero"));
        }

        let mut book = self.book.write().await;
        let wallet = book.wallet_mut(user_id);

        if wallet.credit_balance_cents + delta_cents < 0 {
            return Err(EngineError::precondition(format!(
                "Insufficient credit: balance {} cents, delta {}",
                wallet.credit_balance_cents, delta_cents
            )));
        }

        wallet.credit_balance_cents += delta_cents;
        wallet.updated_at = Utc::now();
        let snapshot = wallet.clone();

        book.credit_rows.push(CreditLedgerEntry {
            id: Uuid::new_v4(),
            user_id,
            source,
            delta_cents,
            metadata,
            created_at: Utc::now(),
        });

        info!("Applied {} cents to {} ({:?})", delta_cents, user_id, source);

        Ok(snapshot)
    }

    /// Convert points into store credit at the configured rate
    /// (100 points = $1). Accepts only multiples of the conversion step and
    /// debits/credits atomically, one row to each ledger.
    pub async fn convert_points(&self, user_id: Uuid, points: i64) -> EngineResult<Wallet> {
        if points <= 0 || points % self.config.conversion_step_points != 0 {
            return Err(EngineError::precondition(format!(
                "Conversion must be a positive multiple of {} points",
                self.config.conversion_step_points
            )));
        }

        let credit_cents = points * 100 / self.config.points_per_dollar;

        let mut book = self.book.write().await;
        let wallet = book.wallet_mut(user_id);

        if wallet.points_balance < points {
            return Err(EngineError::precondition(format!(
                "Insufficient points: balance {}, requested {}",
                wallet.points_balance, points
            )));
        }

        wallet.points_balance -= points;
        wallet.credit_balance_cents += credit_cents;
        wallet.updated_at = Utc::now();
        let snapshot = wallet.clone();

        let metadata = serde_json::json!({ "points": points, "credit_cents": credit_cents });
        book.points_rows.push(PointsLedgerEntry {
            id: Uuid::new_v4(),
            user_id,
            source: LedgerSource::PointsConversion,
            delta: -points,
            metadata: Some(metadata.clone()),
            created_at: Utc::now(),
        });
        book.credit_rows.push(CreditLedgerEntry {
            id: Uuid::new_v4(),
            user_id,
            source: LedgerSource::PointsConversion,
            delta_cents: credit_cents,
            metadata: Some(metadata),
            created_at: Utc::now(),
        });

        info!(
            "Converted {} points to {} cents for {}",
            points, credit_cents, user_id
        );

        Ok(snapshot)
    }

    /// Points ledger rows for a user, oldest first
    pub async fn points_history(&self, user_id: Uuid) -> Vec<PointsLedgerEntry> {
        self.book
            .read()
            .await
            .points_rows
            .iter()
            .filter(|row| row.user_id == user_id)
            .cloned()
            .collect()
    }

    /// Credit ledger rows for a user, oldest first
    pub async fn credit_history(&self, user_id: Uuid) -> Vec<CreditLedgerEntry> {
        self.book
            .read()
            .await
            .credit_rows
            .iter()
            .filter(|row| row.user_id == user_id)
            .cloned()
            .collect()
    }

    /// Check the reconciliation invariant: the sum of ledger deltas for a
    /// user equals the cached wallet balances.
    pub async fn reconciles(&self, user_id: Uuid) -> bool {
        let book = self.book.read().await;
        let wallet = match book.wallets.get(&user_id) {
            Some(w) => w,
            None => return true,
        };

        let points_sum: i64 = book
            .points_rows
            .iter()
            .filter(|row| row.user_id == user_id)
            .map(|row| row.delta)
            .sum();
        let credit_sum: i64 = book
            .credit_rows
            .iter()
            .filter(|row| row.user_id == user_id)
            .map(|row| row.delta_cents)
            .sum();

        points_sum == wallet.points_balance && credit_sum == wallet.credit_balance_cents
    }
}

impl Default for WalletLedger {
    fn default() -> Self {
        Self::new(WalletConfig::default())
    }
}
