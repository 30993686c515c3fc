//! Escrow Settlement - fee/referral/VIP split calculation and atomic payout
//!
//! The split is a pure computation over the order total and a buyer snapshot
//! frozen at confirm time. `settle` executes the payout as one unit with the
//! lifecycle's Completed write: seller credit, one Purchase row, and one
//! payout ledger row per non-zero beneficiary. If any step fails the caller
//! must not commit the Completed status.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use crate::error::EngineError;
use crate::models::{
    LedgerSource, Order, PayoutLedgerEntry, PayoutRole, Purchase, SettlementSnapshot,
};
use crate::wallet::WalletLedger;
use crate::EngineResult;

/// Configuration for the settlement engine, rates in basis points
#[derive(Debug, Clone)]
pub struct SettlementConfig {
    /// Owner rate when the buyer has no referrer
    pub owner_rate_bps: i64,
    /// Owner rate when a referrer takes their cut
    pub owner_rate_referred_bps: i64,
    /// Referrer rate, unaffected by VIP
    pub referrer_rate_bps: i64,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            owner_rate_bps: 1000,
            owner_rate_referred_bps: 700,
            referrer_rate_bps: 300,
        }
    }
}

/// Result of a split calculation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeSplit {
    pub owner_cut_cents: i64,
    pub referrer_cut_cents: i64,
    pub vip_applied: bool,
}

impl FeeSplit {
    /// Owner cut plus referrer cut, deducted from the order total before
    /// the seller payout
    pub fn platform_fee_cents(&self) -> i64 {
        self.owner_cut_cents + self.referrer_cut_cents
    }
}

/// Record returned by a successful settlement
#[derive(Debug, Clone)]
pub struct SettlementRecord {
    pub purchase: Purchase,
    pub split: FeeSplit,
    pub seller_amount_cents: i64,
}

/// Settlement engine holding the purchase and payout ledgers
pub struct EscrowSettlement {
    config: SettlementConfig,
    wallet: Arc<WalletLedger>,
    /// One purchase per settled order, keyed by order id
    purchases: Arc<RwLock<HashMap<Uuid, Purchase>>>,
    payout_rows: Arc<RwLock<Vec<PayoutLedgerEntry>>>,
}

/// Round `amount * rate_bps / 10_000` half-up
fn cut_of(amount_cents: i64, rate_bps: i64) -> i64 {
    (amount_cents * rate_bps + 5_000) / 10_000
}

impl EscrowSettlement {
    pub fn new(config: SettlementConfig, wallet: Arc<WalletLedger>) -> Self {
        Self {
            config,
            wallet,
            purchases: Arc::new(RwLock::new(HashMap::new())),
            payout_rows: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Compute the fee/referral/VIP split for an amount.
    ///
    /// An active VIP buyer halves the owner rate; the referrer rate is
    /// unaffected. Each cut is rounded independently, with no
    /// reconciliation against the total.
    pub fn calculate_split(
        &self,
        amount_cents: i64,
        vip_active: bool,
        has_referrer: bool,
    ) -> FeeSplit {
        let mut owner_rate_bps = if has_referrer {
            self.config.owner_rate_referred_bps
        } else {
            self.config.owner_rate_bps
        };
        if vip_active {
            owner_rate_bps /= 2;
        }

        let owner_cut_cents = cut_of(amount_cents, owner_rate_bps);
        let referrer_cut_cents = if has_referrer {
            cut_of(amount_cents, self.config.referrer_rate_bps)
        } else {
            0
        };

        FeeSplit {
            owner_cut_cents,
            referrer_cut_cents,
            vip_applied: vip_active,
        }
    }

    /// Fee estimate recorded on an order at creation time. The settlement
    /// recomputes from a fresh snapshot and its value wins.
    pub fn estimate_fee(&self, amount_cents: i64, snapshot: &SettlementSnapshot) -> i64 {
        self.calculate_split(
            amount_cents,
            snapshot.vip_active,
            snapshot.referrer_user_id.is_some(),
        )
        .platform_fee_cents()
    }

    /// Execute the payout for a completing order.
    ///
    /// Must run inside the lifecycle's completion critical section; the
    /// caller commits the Completed status only if this returns Ok.
    pub async fn settle(
        &self,
        order: &Order,
        snapshot: &SettlementSnapshot,
    ) -> EngineResult<SettlementRecord> {
        let mut purchases = self.purchases.write().await;
        if purchases.contains_key(&order.id) {
            return Err(EngineError::internal(format!(
                "Order {} already settled",
                order.id
            )));
        }

        let split = self.calculate_split(
            order.total_cents,
            snapshot.vip_active,
            snapshot.referrer_user_id.is_some(),
        );
        let seller_amount_cents = order.total_cents - split.platform_fee_cents();

        self.credit_seller(order, seller_amount_cents, LedgerSource::OrderPayout)
            .await?;

        let purchase = Purchase {
            id: Uuid::new_v4(),
            order_id: order.id,
            owner_cut_cents: split.owner_cut_cents,
            referrer_user_id: snapshot.referrer_user_id,
            referrer_cut_cents: split.referrer_cut_cents,
            vip_applied: split.vip_applied,
            created_at: Utc::now(),
        };
        purchases.insert(order.id, purchase.clone());
        drop(purchases);

        self.write_payout_rows(order.id, &split, snapshot.referrer_user_id)
            .await;

        info!(
            "Settled order {}: seller {} cents, owner cut {}, referrer cut {}",
            order.id, seller_amount_cents, split.owner_cut_cents, split.referrer_cut_cents
        );

        Ok(SettlementRecord {
            purchase,
            split,
            seller_amount_cents,
        })
    }

    /// Pay the seller the non-refunded remainder of a disputed order, minus
    /// the split computed on that remainder. Writes payout rows but no
    /// Purchase row, since the order does not complete.
    pub async fn settle_partial(
        &self,
        order: &Order,
        snapshot: &SettlementSnapshot,
        amount_cents: i64,
    ) -> EngineResult<FeeSplit> {
        if amount_cents <= 0 || amount_cents > order.total_cents {
            return Err(EngineError::precondition(format!(
                "Partial settlement amount {} out of range for total {}",
                amount_cents, order.total_cents
            )));
        }

        let split = self.calculate_split(
            amount_cents,
            snapshot.vip_active,
            snapshot.referrer_user_id.is_some(),
        );
        let seller_amount_cents = amount_cents - split.platform_fee_cents();

        self.credit_seller(order, seller_amount_cents, LedgerSource::DisputeSettlement)
            .await?;
        self.write_payout_rows(order.id, &split, snapshot.referrer_user_id)
            .await;

        info!(
            "Partially settled order {}: seller {} cents of {}",
            order.id, seller_amount_cents, amount_cents
        );

        Ok(split)
    }

    async fn credit_seller(
        &self,
        order: &Order,
        amount_cents: i64,
        source: LedgerSource,
    ) -> EngineResult<()> {
        let metadata = serde_json::json!({ "order_id": order.id });
        self.wallet
            .add_credit(order.seller_id, amount_cents, source, Some(metadata))
            .await?;
        Ok(())
    }

    async fn write_payout_rows(
        &self,
        order_id: Uuid,
        split: &FeeSplit,
        referrer_user_id: Option<Uuid>,
    ) {
        let mut rows = self.payout_rows.write().await;
        if split.owner_cut_cents > 0 {
            rows.push(PayoutLedgerEntry {
                id: Uuid::new_v4(),
                order_id,
                role: PayoutRole::Owner,
                beneficiary_user_id: None,
                amount_cents: split.owner_cut_cents,
                created_at: Utc::now(),
            });
        }
        if split.referrer_cut_cents > 0 {
            rows.push(PayoutLedgerEntry {
                id: Uuid::new_v4(),
                order_id,
                role: PayoutRole::Referrer,
                beneficiary_user_id: referrer_user_id,
                amount_cents: split.referrer_cut_cents,
                created_at: Utc::now(),
            });
        }
    }

    /// The purchase row for a settled order, if any
    pub async fn purchase_for_order(&self, order_id: Uuid) -> Option<Purchase> {
        self.purchases.read().await.get(&order_id).cloned()
    }

    /// Payout ledger rows for an order
    pub async fn payouts_for_order(&self, order_id: Uuid) -> Vec<PayoutLedgerEntry> {
        self.payout_rows
            .read()
            .await
            .iter()
            .filter(|row| row.order_id == order_id)
            .cloned()
            .collect()
    }
}
