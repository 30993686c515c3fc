//! Trade Node - high-level API for the settlement engine
//!
//! Wires the lifecycle, wallet, settlement, dispute, stats, and outbox
//! components together and exposes the operations callers see. Staff-only
//! operations take an injected [`AdminCredential`] capability object rather
//! than consulting ambient environment state.

use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use crate::disputes::DisputeManager;
use crate::error::EngineError;
use crate::lifecycle::{LifecycleConfig, OrderLifecycle};
use crate::models::{
    BuyerProfile, DeliveryProof, Dispute, DisputeDecision, LedgerSource, Listing, Order,
    PayoutLedgerEntry, Purchase, SellerStats, Wallet,
};
use crate::outbox::{
    InMemoryNotificationSink, Notification, NotificationConfig, Outbox, OutboxWorker,
};
use crate::proofs::ProofGate;
use crate::provider::{DevStubProvider, EscrowPaymentProvider};
use crate::settings::Settings;
use crate::settlement::{EscrowSettlement, SettlementConfig};
use crate::stats::SellerStatsIndexer;
use crate::timers::{TimerConfig, TimerService};
use crate::verification::{StaticVerificationGate, VerificationGate};
use crate::wallet::{WalletConfig, WalletLedger};
use crate::EngineResult;

/// Points granted to a referrer when a referred user signs up
const REFERRAL_SIGNUP_POINTS: i64 = 10;

/// Configuration for the trade node
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub lifecycle: LifecycleConfig,
    pub timers: TimerConfig,
    pub settlement: SettlementConfig,
    pub wallet: WalletConfig,
    pub notifications: NotificationConfig,
    pub admin_token: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            lifecycle: LifecycleConfig::default(),
            timers: TimerConfig::default(),
            settlement: SettlementConfig::default(),
            wallet: WalletConfig::default(),
            notifications: NotificationConfig::default(),
            admin_token: "dev-admin-token".to_string(),
        }
    }
}

impl NodeConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            lifecycle: settings.lifecycle_config(),
            timers: settings.timer_config(),
            settlement: settings.settlement_config(),
            wallet: WalletConfig::default(),
            notifications: settings.notification_config(),
            admin_token: settings.admin_token.clone(),
        }
    }
}

/// Capability object presented by staff callers
#[derive(Debug, Clone)]
pub struct AdminCredential {
    token: String,
}

impl AdminCredential {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

/// Main node coordinating all components
pub struct TradeNode {
    lifecycle: Arc<OrderLifecycle>,
    wallet: Arc<WalletLedger>,
    settlement: Arc<EscrowSettlement>,
    stats: Arc<SellerStatsIndexer>,
    sink: Arc<InMemoryNotificationSink>,
    worker: OutboxWorker,
    admin_token: String,
}

impl TradeNode {
    /// Create a node with the given provider and verification collaborators
    pub fn new(
        config: NodeConfig,
        provider: Arc<dyn EscrowPaymentProvider>,
        verification: Arc<dyn VerificationGate>,
    ) -> Self {
        let wallet = Arc::new(WalletLedger::new(config.wallet));
        let settlement = Arc::new(EscrowSettlement::new(config.settlement, wallet.clone()));
        let outbox = Arc::new(Outbox::new());
        let stats = Arc::new(SellerStatsIndexer::new());
        let sink = Arc::new(InMemoryNotificationSink::new(config.notifications));
        let worker = OutboxWorker::new(outbox.clone(), sink.clone(), stats.clone());

        let lifecycle = Arc::new(OrderLifecycle::new(
            config.lifecycle,
            Arc::new(ProofGate::new()),
            Arc::new(DisputeManager::new()),
            settlement.clone(),
            TimerService::new(config.timers),
            verification,
            provider,
            outbox,
        ));

        info!("Trade node initialized");

        Self {
            lifecycle,
            wallet,
            settlement,
            stats,
            sink,
            worker,
            admin_token: config.admin_token,
        }
    }

    /// Dev-mode node: deterministic stub provider, permissive verification
    pub fn with_dev_stub(config: NodeConfig) -> Self {
        Self::new(
            config,
            Arc::new(DevStubProvider),
            Arc::new(StaticVerificationGate::default()),
        )
    }

    // ------------------------------------------------------------------
    // Order operations
    // ------------------------------------------------------------------

    pub async fn request_order(
        &self,
        buyer_id: Uuid,
        listing_id: Uuid,
        quantity: u32,
    ) -> EngineResult<Order> {
        let order = self
            .lifecycle
            .request_order(buyer_id, listing_id, quantity)
            .await?;
        self.flush_side_effects().await;
        Ok(order)
    }

    pub async fn accept_order(&self, order_id: Uuid, caller_id: Uuid) -> EngineResult<Order> {
        let order = self.lifecycle.accept_order(order_id, caller_id).await?;
        self.flush_side_effects().await;
        Ok(order)
    }

    pub async fn decline_order(&self, order_id: Uuid, caller_id: Uuid) -> EngineResult<Order> {
        let order = self.lifecycle.decline_order(order_id, caller_id).await?;
        self.flush_side_effects().await;
        Ok(order)
    }

    pub async fn cancel_order(&self, order_id: Uuid, caller_id: Uuid) -> EngineResult<Order> {
        let order = self.lifecycle.cancel_order(order_id, caller_id).await?;
        self.flush_side_effects().await;
        Ok(order)
    }

    pub async fn pay_escrow(&self, order_id: Uuid, caller_id: Uuid) -> EngineResult<Order> {
        let order = self.lifecycle.pay_escrow(order_id, caller_id).await?;
        self.flush_side_effects().await;
        Ok(order)
    }

    pub async fn confirm_exchange(&self, order_id: Uuid, caller_id: Uuid) -> EngineResult<Order> {
        let order = self.lifecycle.confirm_exchange(order_id, caller_id).await?;
        self.flush_side_effects().await;
        Ok(order)
    }

    pub async fn get_order(&self, order_id: Uuid) -> EngineResult<Order> {
        let order = self.lifecycle.get_order(order_id).await?;
        self.flush_side_effects().await;
        Ok(order)
    }

    pub async fn orders_for_user(&self, user_id: Uuid) -> Vec<Order> {
        self.lifecycle.orders_for_user(user_id).await
    }

    // ------------------------------------------------------------------
    // Proofs
    // ------------------------------------------------------------------

    pub async fn submit_proof(
        &self,
        order_id: Uuid,
        caller_id: Uuid,
        kind: String,
        url: String,
    ) -> EngineResult<DeliveryProof> {
        let proof = self
            .lifecycle
            .submit_proof(order_id, caller_id, kind, url)
            .await?;
        self.flush_side_effects().await;
        Ok(proof)
    }

    pub async fn accept_proof(
        &self,
        order_id: Uuid,
        proof_id: Uuid,
        caller_id: Uuid,
    ) -> EngineResult<DeliveryProof> {
        let proof = self
            .lifecycle
            .accept_proof(order_id, proof_id, caller_id)
            .await?;
        self.flush_side_effects().await;
        Ok(proof)
    }

    pub async fn reject_proof(
        &self,
        order_id: Uuid,
        proof_id: Uuid,
        caller_id: Uuid,
    ) -> EngineResult<DeliveryProof> {
        let proof = self
            .lifecycle
            .reject_proof(order_id, proof_id, caller_id)
            .await?;
        self.flush_side_effects().await;
        Ok(proof)
    }

    // ------------------------------------------------------------------
    // Disputes
    // ------------------------------------------------------------------

    pub async fn open_dispute(
        &self,
        order_id: Uuid,
        caller_id: Uuid,
        evidence: Option<String>,
    ) -> EngineResult<Dispute> {
        let dispute = self
            .lifecycle
            .open_dispute(order_id, caller_id, evidence)
            .await?;
        self.flush_side_effects().await;
        Ok(dispute)
    }

    /// Staff-only: apply a decision to a disputed order
    pub async fn resolve_dispute(
        &self,
        credential: Option<&AdminCredential>,
        order_id: Uuid,
        decision: DisputeDecision,
        refund_amount_cents: Option<i64>,
    ) -> EngineResult<Order> {
        self.authorize_admin(credential)?;
        let order = self
            .lifecycle
            .resolve_dispute(order_id, decision, refund_amount_cents)
            .await?;
        self.flush_side_effects().await;
        Ok(order)
    }

    // ------------------------------------------------------------------
    // Wallet
    // ------------------------------------------------------------------

    pub async fn convert_points(&self, caller_id: Uuid, points: i64) -> EngineResult<Wallet> {
        self.wallet.convert_points(caller_id, points).await
    }

    pub async fn wallet(&self, user_id: Uuid) -> Wallet {
        self.wallet.wallet(user_id).await
    }

    /// Staff-only: apply point and/or credit deltas to a wallet
    pub async fn adjust_wallet(
        &self,
        credential: Option<&AdminCredential>,
        user_id: Uuid,
        delta_points: i64,
        delta_cents: i64,
    ) -> EngineResult<Wallet> {
        self.authorize_admin(credential)?;
        if delta_points == 0 && delta_cents == 0 {
            return Err(EngineError::precondition(
                "Adjustment requires a non-zero delta",
            ));
        }

        if delta_points != 0 {
            self.wallet
                .add_points(user_id, delta_points, LedgerSource::AdminAdjustment, None)
                .await?;
        }
        if delta_cents != 0 {
            self.wallet
                .add_credit(user_id, delta_cents, LedgerSource::AdminAdjustment, None)
                .await?;
        }

        Ok(self.wallet.wallet(user_id).await)
    }

    /// Credit a referrer for a referred signup
    pub async fn grant_referral_signup_bonus(&self, referrer_id: Uuid) -> EngineResult<Wallet> {
        self.wallet
            .add_points(
                referrer_id,
                REFERRAL_SIGNUP_POINTS,
                LedgerSource::ReferralSignup,
                None,
            )
            .await
    }

    /// Credit a daily-wheel reward
    pub async fn award_wheel_points(&self, user_id: Uuid, points: i64) -> EngineResult<Wallet> {
        self.wallet
            .add_points(user_id, points, LedgerSource::DailyWheel, None)
            .await
    }

    // ------------------------------------------------------------------
    // Setup, side effects, and read models
    // ------------------------------------------------------------------

    pub async fn upsert_listing(&self, listing: Listing) {
        self.lifecycle.upsert_listing(listing).await;
    }

    pub async fn get_listing(&self, listing_id: Uuid) -> EngineResult<Listing> {
        self.lifecycle.get_listing(listing_id).await
    }

    pub async fn upsert_profile(&self, profile: BuyerProfile) {
        self.lifecycle.upsert_profile(profile).await;
    }

    pub async fn seller_stats(&self, seller_id: Uuid) -> SellerStats {
        self.stats.get_stats(seller_id).await
    }

    pub async fn purchase_for_order(&self, order_id: Uuid) -> Option<Purchase> {
        self.settlement.purchase_for_order(order_id).await
    }

    pub async fn payouts_for_order(&self, order_id: Uuid) -> Vec<PayoutLedgerEntry> {
        self.settlement.payouts_for_order(order_id).await
    }

    pub async fn notifications_for(&self, user_id: Uuid) -> Vec<Notification> {
        self.sink.notifications_for(user_id).await
    }

    /// Deliver pending outbox effects. Failures never surface to callers.
    pub async fn flush_side_effects(&self) -> usize {
        self.worker.drain_once().await
    }

    fn authorize_admin(&self, credential: Option<&AdminCredential>) -> EngineResult<()> {
        match credential {
            None => Err(EngineError::unauthenticated("Admin credential required")),
            Some(c) if c.token == self.admin_token => Ok(()),
            Some(_) => Err(EngineError::forbidden("Admin credential rejected")),
        }
    }
}
