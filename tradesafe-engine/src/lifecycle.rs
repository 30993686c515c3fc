//! Order Lifecycle - the state machine orchestrating escrowed trades
//!
//! Callers (buyer or seller) request transitions here. The lifecycle
//! validates role and state preconditions, consults the proof gate on the
//! confirm path and the timer service for lazy deadline policies, and on the
//! completing confirmation invokes settlement inside the same critical
//! section as the status write, so funds release exactly once even when both
//! parties confirm in the same instant.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::{info, warn};
use uuid::Uuid;

use crate::disputes::DisputeManager;
use crate::error::EngineError;
use crate::models::{
    generate_safe_trade_code, BuyerProfile, DeliveryProof, Dispute, DisputeDecision, Listing,
    Order, OrderEvent, OrderStatus, PartyRole, SettlementSnapshot,
};
use crate::outbox::{Outbox, SideEffect};
use crate::proofs::ProofGate;
use crate::provider::EscrowPaymentProvider;
use crate::settlement::EscrowSettlement;
use crate::timers::TimerService;
use crate::verification::VerificationGate;
use crate::EngineResult;

/// Configuration for the order lifecycle
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Currency passed to the escrow provider
    pub currency: String,
    /// Bound on the provider call during escrow funding
    pub provider_call_timeout_secs: u64,
    /// Maximum order total in cents
    pub max_order_total_cents: i64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            currency: "USD".to_string(),
            provider_call_timeout_secs: 10,
            max_order_total_cents: 10_000_000, // $100k
        }
    }
}

/// The order state machine and its stores.
///
/// Orders, listings, and profiles are in-memory maps; in production these
/// would be database tables with the same per-order transaction boundaries.
/// The orders map's write lock is the serialization point: every transition
/// on an order runs under it, which is what makes the dual-confirm
/// completion branch exactly-once.
pub struct OrderLifecycle {
    config: LifecycleConfig,
    orders: Arc<RwLock<HashMap<Uuid, Order>>>,
    listings: Arc<RwLock<HashMap<Uuid, Listing>>>,
    profiles: Arc<RwLock<HashMap<Uuid, BuyerProfile>>>,
    events: Arc<RwLock<Vec<OrderEvent>>>,
    proofs: Arc<ProofGate>,
    disputes: Arc<DisputeManager>,
    settlement: Arc<EscrowSettlement>,
    timers: TimerService,
    verification: Arc<dyn VerificationGate>,
    provider: Arc<dyn EscrowPaymentProvider>,
    outbox: Arc<Outbox>,
}

impl OrderLifecycle {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: LifecycleConfig,
        proofs: Arc<ProofGate>,
        disputes: Arc<DisputeManager>,
        settlement: Arc<EscrowSettlement>,
        timers: TimerService,
        verification: Arc<dyn VerificationGate>,
        provider: Arc<dyn EscrowPaymentProvider>,
        outbox: Arc<Outbox>,
    ) -> Self {
        Self {
            config,
            orders: Arc::new(RwLock::new(HashMap::new())),
            listings: Arc::new(RwLock::new(HashMap::new())),
            profiles: Arc::new(RwLock::new(HashMap::new())),
            events: Arc::new(RwLock::new(Vec::new())),
            proofs,
            disputes,
            settlement,
            timers,
            verification,
            provider,
            outbox,
        }
    }

    /// Create or replace a listing
    pub async fn upsert_listing(&self, listing: Listing) {
        self.listings.write().await.insert(listing.id, listing);
    }

    /// Get a listing by ID
    pub async fn get_listing(&self, listing_id: Uuid) -> EngineResult<Listing> {
        self.listings
            .read()
            .await
            .get(&listing_id)
            .cloned()
            .ok_or_else(|| EngineError::not_found(format!("Listing {} not found", listing_id)))
    }

    /// Create or replace a buyer profile
    pub async fn upsert_profile(&self, profile: BuyerProfile) {
        self.profiles.write().await.insert(profile.user_id, profile);
    }

    async fn profile_snapshot(&self, buyer_id: Uuid, now: DateTime<Utc>) -> SettlementSnapshot {
        self.profiles
            .read()
            .await
            .get(&buyer_id)
            .cloned()
            .unwrap_or_else(|| BuyerProfile::new(buyer_id))
            .snapshot(now)
    }

    /// Buyer requests a trade against an active listing
    pub async fn request_order(
        &self,
        buyer_id: Uuid,
        listing_id: Uuid,
        quantity: u32,
    ) -> EngineResult<Order> {
        if quantity == 0 {
            return Err(EngineError::precondition("Quantity must be at least 1"));
        }

        let listing = self.get_listing(listing_id).await?;
        if !listing.active {
            return Err(EngineError::not_found(format!(
                "Listing {} is no longer available",
                listing_id
            )));
        }
        if listing.seller_id == buyer_id {
            return Err(EngineError::forbidden("Cannot buy from your own listing"));
        }
        if listing.unit_price_cents <= 0 {
            return Err(EngineError::precondition("Listing price must be positive"));
        }

        let subtotal = listing.unit_price_cents * quantity as i64;
        if subtotal > self.config.max_order_total_cents {
            return Err(EngineError::precondition(format!(
                "Order total {} cents exceeds maximum {}",
                subtotal, self.config.max_order_total_cents
            )));
        }

        let now = Utc::now();
        let snapshot = self.profile_snapshot(buyer_id, now).await;
        let fee_estimate = self.settlement.estimate_fee(subtotal, &snapshot);

        let order = Order::new(
            buyer_id,
            listing.seller_id,
            listing_id,
            quantity,
            listing.unit_price_cents,
            fee_estimate,
        );

        self.orders.write().await.insert(order.id, order.clone());
        self.push_event(OrderEvent::new(
            "order.requested",
            order.id,
            Some(buyer_id),
            Some(serde_json::json!({ "listing_id": listing_id, "quantity": quantity })),
        ))
        .await;
        self.outbox
            .enqueue_notify(
                order.seller_id,
                "order.requested",
                "New trade request",
                format!("A buyer requested {} of your listing", quantity),
                None,
                Some(serde_json::json!({ "order_id": order.id })),
            )
            .await;

        info!("Order {} requested on listing {}", order.id, listing_id);

        Ok(order)
    }

    /// Seller accepts a requested order. One-time listings are deactivated
    /// in the same step.
    pub async fn accept_order(&self, order_id: Uuid, caller_id: Uuid) -> EngineResult<Order> {
        let now = Utc::now();
        let mut orders = self.orders.write().await;
        let mut order = Self::load(&orders, order_id)?;
        self.apply_stale_policy(&mut orders, &mut order, now).await;

        Self::require_role(&order, caller_id, PartyRole::Seller, "accept the order")?;
        if !order.status.can_accept() {
            return Err(EngineError::state_conflict(
                format!("{:?}", order.status),
                "accept".to_string(),
                "Only requested orders can be accepted".to_string(),
            ));
        }
        if !self.verification.is_setup_complete(caller_id).await? {
            return Err(EngineError::precondition(
                "Seller verification setup is incomplete",
            ));
        }

        order.validate_transition(OrderStatus::Accepted)?;
        order.status = OrderStatus::Accepted;
        order.updated_at = now;
        orders.insert(order.id, order.clone());
        drop(orders);

        self.deactivate_if_one_time(order.listing_id).await;

        self.push_event(OrderEvent::new("order.accepted", order.id, Some(caller_id), None))
            .await;
        self.outbox
            .enqueue_notify(
                order.buyer_id,
                "order.accepted",
                "Trade accepted",
                "The seller accepted your request; you can fund escrow now".to_string(),
                None,
                Some(serde_json::json!({ "order_id": order.id })),
            )
            .await;

        info!("Order {} accepted", order.id);

        Ok(order)
    }

    /// Seller declines a requested order
    pub async fn decline_order(&self, order_id: Uuid, caller_id: Uuid) -> EngineResult<Order> {
        self.close_requested(
            order_id,
            caller_id,
            PartyRole::Seller,
            OrderStatus::Declined,
            "decline",
        )
        .await
    }

    /// Buyer withdraws a requested order
    pub async fn cancel_order(&self, order_id: Uuid, caller_id: Uuid) -> EngineResult<Order> {
        self.close_requested(
            order_id,
            caller_id,
            PartyRole::Buyer,
            OrderStatus::Cancelled,
            "cancel",
        )
        .await
    }

    async fn close_requested(
        &self,
        order_id: Uuid,
        caller_id: Uuid,
        role: PartyRole,
        to_status: OrderStatus,
        action: &str,
    ) -> EngineResult<Order> {
        let now = Utc::now();
        let mut orders = self.orders.write().await;
        let mut order = Self::load(&orders, order_id)?;
        self.apply_stale_policy(&mut orders, &mut order, now).await;

        Self::require_role(&order, caller_id, role, action)?;
        if order.status != OrderStatus::Requested {
            return Err(EngineError::state_conflict(
                format!("{:?}", order.status),
                action.to_string(),
                "Only requested orders can be closed this way".to_string(),
            ));
        }

        order.validate_transition(to_status)?;
        order.status = to_status;
        order.updated_at = now;
        orders.insert(order.id, order.clone());
        drop(orders);

        let event_type = match to_status {
            OrderStatus::Declined => "order.declined",
            _ => "order.cancelled",
        };
        self.push_event(OrderEvent::new(event_type, order.id, Some(caller_id), None))
            .await;

        let counterparty = match role {
            PartyRole::Seller => order.buyer_id,
            PartyRole::Buyer => order.seller_id,
        };
        self.outbox
            .enqueue_notify(
                counterparty,
                event_type,
                "Trade closed",
                format!("The counterparty chose to {} the trade", action),
                None,
                Some(serde_json::json!({ "order_id": order.id })),
            )
            .await;

        info!("Order {} closed as {:?}", order.id, to_status);

        Ok(order)
    }

    /// Buyer funds escrow through the payment provider.
    ///
    /// The provider call is the only network-bound step in the core; it runs
    /// outside the order lock with a bounded timeout, and on failure or
    /// timeout nothing commits — the order stays Accepted and the caller
    /// retries.
    pub async fn pay_escrow(&self, order_id: Uuid, caller_id: Uuid) -> EngineResult<Order> {
        let now = Utc::now();

        // Validate before touching the provider
        let total_cents = {
            let mut orders = self.orders.write().await;
            let mut order = Self::load(&orders, order_id)?;
            self.apply_stale_policy(&mut orders, &mut order, now).await;

            Self::require_role(&order, caller_id, PartyRole::Buyer, "fund escrow")?;
            if !order.status.can_pay() {
                return Err(EngineError::state_conflict(
                    format!("{:?}", order.status),
                    "pay".to_string(),
                    "Escrow can only be funded on an accepted order".to_string(),
                ));
            }
            order.validate_transition(OrderStatus::PaidEscrow)?;
            order.total_cents
        };

        let fund = timeout(
            StdDuration::from_secs(self.config.provider_call_timeout_secs),
            self.provider
                .fund_escrow(order_id, total_cents, &self.config.currency),
        )
        .await;
        let provider_ref = match fund {
            Ok(Ok(provider_ref)) => provider_ref,
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(EngineError::upstream(
                    "Escrow provider timed out; order left unfunded",
                ))
            }
        };

        // Commit; the order may have auto-cancelled while the provider ran
        let now = Utc::now();
        let mut orders = self.orders.write().await;
        let mut order = Self::load(&orders, order_id)?;
        if order.status != OrderStatus::Accepted {
            drop(orders);
            warn!(
                "Order {} changed state during funding; releasing hold {}",
                order_id, provider_ref.0
            );
            if let Err(e) = self.provider.refund(&provider_ref, None).await {
                warn!("Could not release orphaned hold {}: {}", provider_ref.0, e);
            }
            return Err(EngineError::state_conflict(
                format!("{:?}", order.status),
                "pay".to_string(),
                "Order changed state while funding was in flight".to_string(),
            ));
        }

        order.status = OrderStatus::PaidEscrow;
        order.safe_trade_code = Some(generate_safe_trade_code());
        order.buyer_dispute_deadline = Some(self.timers.dispute_deadline(now));
        order.escrow_funded_at = Some(now);
        order.provider_ref = Some(provider_ref.0.clone());
        order.updated_at = now;
        orders.insert(order.id, order.clone());
        drop(orders);

        self.push_event(OrderEvent::new(
            "order.paid_escrow",
            order.id,
            Some(caller_id),
            Some(serde_json::json!({ "provider_ref": provider_ref.0 })),
        ))
        .await;
        self.outbox
            .enqueue_notify(
                order.seller_id,
                "order.paid_escrow",
                "Escrow funded",
                "The buyer funded escrow; deliver and submit proof".to_string(),
                None,
                Some(serde_json::json!({ "order_id": order.id })),
            )
            .await;

        info!("Order {} funded into escrow", order.id);

        Ok(order)
    }

    /// Record a party's confirmation of the exchange.
    ///
    /// The seller cannot confirm without a delivery proof of their own on
    /// record. When the second confirmation lands, settlement executes and
    /// the Completed status commits in the same critical section; if
    /// settlement fails nothing commits, including the confirmation
    /// timestamp.
    pub async fn confirm_exchange(&self, order_id: Uuid, caller_id: Uuid) -> EngineResult<Order> {
        let now = Utc::now();
        let mut orders = self.orders.write().await;
        let mut order = Self::load(&orders, order_id)?;
        self.apply_stale_policy(&mut orders, &mut order, now).await;

        let role = Self::require_party(&order, caller_id)?;
        if !order.status.can_confirm() {
            return Err(EngineError::state_conflict(
                format!("{:?}", order.status),
                "confirm".to_string(),
                "Confirmation is only possible after escrow funding".to_string(),
            ));
        }

        if role == PartyRole::Seller {
            if !self.verification.is_setup_complete(caller_id).await? {
                return Err(EngineError::precondition(
                    "Seller verification setup is incomplete",
                ));
            }
            if !self.proofs.has_proof_from(order_id, caller_id).await {
                return Err(EngineError::precondition(
                    "Seller cannot confirm without a delivery proof on record",
                ));
            }
        }

        // Idempotent: a repeated confirmation only touches updated_at
        match role {
            PartyRole::Buyer => {
                if order.buyer_confirmed_at.is_none() {
                    order.buyer_confirmed_at = Some(now);
                }
            }
            PartyRole::Seller => {
                if order.seller_confirmed_at.is_none() {
                    order.seller_confirmed_at = Some(now);
                }
            }
        }
        order.updated_at = now;

        let completed = order.both_confirmed();
        if completed {
            order.validate_transition(OrderStatus::Completed)?;
            let snapshot = self.profile_snapshot(order.buyer_id, now).await;
            let record = self.settlement.settle(&order, &snapshot).await?;

            order.status = OrderStatus::Completed;
            order.released_at = Some(now);
            // Settlement value wins over the creation-time estimate
            order.platform_fee_cents = record.split.platform_fee_cents();
        }

        orders.insert(order.id, order.clone());
        drop(orders);

        self.push_event(OrderEvent::new(
            "order.confirmed",
            order.id,
            Some(caller_id),
            Some(serde_json::json!({ "role": format!("{:?}", role) })),
        ))
        .await;

        if completed {
            self.deactivate_if_one_time(order.listing_id).await;
            self.push_event(OrderEvent::new("order.completed", order.id, None, None))
                .await;
            self.outbox
                .enqueue(SideEffect::CompletedSale {
                    seller_id: order.seller_id,
                    amount_cents: order.total_cents - order.platform_fee_cents,
                })
                .await;
            for user in [order.buyer_id, order.seller_id] {
                self.outbox
                    .enqueue_notify(
                        user,
                        "order.completed",
                        "Trade complete",
                        "Both parties confirmed; escrow has been released".to_string(),
                        None,
                        Some(serde_json::json!({ "order_id": order.id })),
                    )
                    .await;
            }
            info!("Order {} completed and settled", order.id);
        }

        Ok(order)
    }

    /// Submit a delivery proof. The seller's first proof on a funded order
    /// marks it Delivered.
    pub async fn submit_proof(
        &self,
        order_id: Uuid,
        caller_id: Uuid,
        kind: String,
        url: String,
    ) -> EngineResult<DeliveryProof> {
        let now = Utc::now();
        let mut orders = self.orders.write().await;
        let mut order = Self::load(&orders, order_id)?;
        self.apply_stale_policy(&mut orders, &mut order, now).await;

        let role = Self::require_party(&order, caller_id)?;
        if !order.status.can_submit_proof() {
            return Err(EngineError::state_conflict(
                format!("{:?}", order.status),
                "submit proof".to_string(),
                "Proofs can only be submitted after escrow funding".to_string(),
            ));
        }

        let proof = self.proofs.submit(order_id, caller_id, kind, url).await?;

        if role == PartyRole::Seller && order.status == OrderStatus::PaidEscrow {
            order.validate_transition(OrderStatus::Delivered)?;
            order.status = OrderStatus::Delivered;
            self.push_event(OrderEvent::new("order.delivered", order.id, Some(caller_id), None))
                .await;
        }
        order.updated_at = now;
        orders.insert(order.id, order.clone());
        drop(orders);

        let counterparty = match role {
            PartyRole::Seller => order.buyer_id,
            PartyRole::Buyer => order.seller_id,
        };
        self.push_event(OrderEvent::new(
            "proof.submitted",
            order.id,
            Some(caller_id),
            Some(serde_json::json!({ "proof_id": proof.id })),
        ))
        .await;
        self.outbox
            .enqueue_notify(
                counterparty,
                "proof.submitted",
                "Delivery proof submitted",
                "The counterparty submitted delivery evidence".to_string(),
                None,
                Some(serde_json::json!({ "order_id": order.id, "proof_id": proof.id })),
            )
            .await;

        Ok(proof)
    }

    /// Buyer accepts a pending proof; informational, feeds seller stats
    pub async fn accept_proof(
        &self,
        order_id: Uuid,
        proof_id: Uuid,
        caller_id: Uuid,
    ) -> EngineResult<DeliveryProof> {
        let order = self.get_order(order_id).await?;
        Self::require_role(&order, caller_id, PartyRole::Buyer, "review proofs")?;

        let proof = self.proofs.accept(order_id, proof_id, caller_id).await?;

        self.push_event(OrderEvent::new(
            "proof.accepted",
            order_id,
            Some(caller_id),
            Some(serde_json::json!({ "proof_id": proof_id })),
        ))
        .await;
        self.outbox
            .enqueue(SideEffect::ProofAccepted {
                seller_id: order.seller_id,
            })
            .await;
        self.outbox
            .enqueue_notify(
                order.seller_id,
                "proof.accepted",
                "Proof accepted",
                "The buyer accepted your delivery proof".to_string(),
                None,
                Some(serde_json::json!({ "order_id": order_id, "proof_id": proof_id })),
            )
            .await;

        Ok(proof)
    }

    /// Buyer rejects a pending proof
    pub async fn reject_proof(
        &self,
        order_id: Uuid,
        proof_id: Uuid,
        caller_id: Uuid,
    ) -> EngineResult<DeliveryProof> {
        let order = self.get_order(order_id).await?;
        Self::require_role(&order, caller_id, PartyRole::Buyer, "review proofs")?;

        let proof = self.proofs.reject(order_id, proof_id, caller_id).await?;
        self.push_event(OrderEvent::new(
            "proof.rejected",
            order_id,
            Some(caller_id),
            Some(serde_json::json!({ "proof_id": proof_id })),
        ))
        .await;

        Ok(proof)
    }

    /// Open a dispute, freezing the order pending staff resolution
    pub async fn open_dispute(
        &self,
        order_id: Uuid,
        caller_id: Uuid,
        evidence: Option<String>,
    ) -> EngineResult<Dispute> {
        let now = Utc::now();
        let mut orders = self.orders.write().await;
        let mut order = Self::load(&orders, order_id)?;
        self.apply_stale_policy(&mut orders, &mut order, now).await;

        Self::require_party(&order, caller_id)?;
        if !order.status.can_dispute() {
            return Err(EngineError::state_conflict(
                format!("{:?}", order.status),
                "dispute".to_string(),
                "Disputes can only be opened while escrow is held".to_string(),
            ));
        }
        if !self.timers.dispute_window_open(&order, now) {
            return Err(EngineError::precondition(
                "The dispute window for this order has closed",
            ));
        }

        let dispute = self.disputes.open_record(order_id, caller_id, evidence).await?;

        order.validate_transition(OrderStatus::DisputeOpen)?;
        order.status = OrderStatus::DisputeOpen;
        order.updated_at = now;
        orders.insert(order.id, order.clone());
        drop(orders);

        let counterparty = if caller_id == order.buyer_id {
            order.seller_id
        } else {
            order.buyer_id
        };
        self.push_event(OrderEvent::new(
            "dispute.opened",
            order.id,
            Some(caller_id),
            Some(serde_json::json!({ "dispute_id": dispute.id })),
        ))
        .await;
        self.outbox
            .enqueue(SideEffect::DisputeOpened {
                seller_id: order.seller_id,
            })
            .await;
        self.outbox
            .enqueue_notify(
                counterparty,
                "dispute.opened",
                "Dispute opened",
                "The counterparty opened a dispute; escrow release is frozen".to_string(),
                None,
                Some(serde_json::json!({ "order_id": order.id, "dispute_id": dispute.id })),
            )
            .await;

        info!("Order {} frozen by dispute {}", order.id, dispute.id);

        Ok(dispute)
    }

    /// Apply a staff decision to a disputed order. Admin authentication
    /// happens at the node; this executes the money movement.
    pub async fn resolve_dispute(
        &self,
        order_id: Uuid,
        decision: DisputeDecision,
        refund_amount_cents: Option<i64>,
    ) -> EngineResult<Order> {
        let now = Utc::now();
        let mut orders = self.orders.write().await;
        let mut order = Self::load(&orders, order_id)?;

        if order.status != OrderStatus::DisputeOpen {
            return Err(EngineError::state_conflict(
                format!("{:?}", order.status),
                "resolve dispute".to_string(),
                "Only disputed orders can be resolved".to_string(),
            ));
        }
        let provider_ref = order.provider_ref.clone().map(crate::provider::ProviderRef);
        let snapshot = self.profile_snapshot(order.buyer_id, now).await;

        match decision {
            DisputeDecision::RefundBuyer => {
                if let Some(ref provider_ref) = provider_ref {
                    self.bounded_refund(provider_ref, None).await?;
                }
                order.validate_transition(OrderStatus::Refunded)?;
                order.status = OrderStatus::Refunded;
            }
            DisputeDecision::ReleaseSeller => {
                let record = self.settlement.settle(&order, &snapshot).await?;
                order.validate_transition(OrderStatus::Completed)?;
                order.status = OrderStatus::Completed;
                order.released_at = Some(now);
                order.platform_fee_cents = record.split.platform_fee_cents();
                self.outbox
                    .enqueue(SideEffect::CompletedSale {
                        seller_id: order.seller_id,
                        amount_cents: record.seller_amount_cents,
                    })
                    .await;
            }
            DisputeDecision::PartialRefund => {
                let refund = refund_amount_cents.ok_or_else(|| {
                    EngineError::precondition("Partial refund requires an amount")
                })?;
                if refund <= 0 || refund >= order.total_cents {
                    return Err(EngineError::precondition(format!(
                        "Partial refund {} out of range for total {}",
                        refund, order.total_cents
                    )));
                }
                if let Some(ref provider_ref) = provider_ref {
                    self.bounded_refund(provider_ref, Some(refund)).await?;
                }
                self.settlement
                    .settle_partial(&order, &snapshot, order.total_cents - refund)
                    .await?;
                order.validate_transition(OrderStatus::Refunded)?;
                order.status = OrderStatus::Refunded;
            }
        }

        order.updated_at = now;
        orders.insert(order.id, order.clone());
        drop(orders);

        self.disputes.resolve_record(order_id, decision).await?;

        self.push_event(OrderEvent::new(
            "dispute.resolved",
            order.id,
            None,
            Some(serde_json::json!({
                "decision": format!("{:?}", decision),
                "refund_amount_cents": refund_amount_cents,
            })),
        ))
        .await;
        for user in [order.buyer_id, order.seller_id] {
            self.outbox
                .enqueue_notify(
                    user,
                    "dispute.resolved",
                    "Dispute resolved",
                    format!("Staff resolved the dispute: {:?}", decision),
                    None,
                    Some(serde_json::json!({ "order_id": order.id })),
                )
                .await;
        }

        info!("Order {} dispute resolved as {:?}", order.id, decision);

        Ok(order)
    }

    async fn bounded_refund(
        &self,
        provider_ref: &crate::provider::ProviderRef,
        amount_cents: Option<i64>,
    ) -> EngineResult<()> {
        match timeout(
            StdDuration::from_secs(self.config.provider_call_timeout_secs),
            self.provider.refund(provider_ref, amount_cents),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(EngineError::upstream("Escrow provider refund timed out")),
        }
    }

    /// Fetch an order, applying the lazy stale auto-cancel policy.
    ///
    /// Any reader may trigger the passive transition; a second concurrent
    /// reader re-checks under the write lock and sees the already-cancelled
    /// row instead of producing a duplicate write.
    pub async fn get_order(&self, order_id: Uuid) -> EngineResult<Order> {
        let now = Utc::now();
        let order = {
            let orders = self.orders.read().await;
            Self::load(&orders, order_id)?
        };
        if !self.timers.is_stale(&order, now) {
            return Ok(order);
        }

        let mut orders = self.orders.write().await;
        let mut order = Self::load(&orders, order_id)?;
        self.apply_stale_policy(&mut orders, &mut order, now).await;
        Ok(order)
    }

    /// All orders where the user is a party
    pub async fn orders_for_user(&self, user_id: Uuid) -> Vec<Order> {
        self.orders
            .read()
            .await
            .values()
            .filter(|o| o.buyer_id == user_id || o.seller_id == user_id)
            .cloned()
            .collect()
    }

    /// Audit events recorded for an order
    pub async fn events_for_order(&self, order_id: Uuid) -> Vec<OrderEvent> {
        self.events
            .read()
            .await
            .iter()
            .filter(|e| e.order_id == order_id)
            .cloned()
            .collect()
    }

    /// Apply the stale auto-cancel policy to a loaded order. The caller
    /// holds the orders write lock, so the flip commits at most once.
    async fn apply_stale_policy(
        &self,
        orders: &mut HashMap<Uuid, Order>,
        order: &mut Order,
        now: DateTime<Utc>,
    ) {
        if !self.timers.is_stale(order, now) {
            return;
        }

        order.status = OrderStatus::Cancelled;
        order.updated_at = now;
        orders.insert(order.id, order.clone());

        self.push_event(OrderEvent::new(
            "order.auto_cancelled",
            order.id,
            None,
            Some(serde_json::json!({ "reason": "inactive beyond the stale window" })),
        ))
        .await;
        for user in [order.buyer_id, order.seller_id] {
            self.outbox
                .enqueue_notify(
                    user,
                    "order.cancelled",
                    "Trade cancelled",
                    "The trade was cancelled after 24 hours of inactivity".to_string(),
                    None,
                    Some(serde_json::json!({ "order_id": order.id })),
                )
                .await;
        }

        warn!("Order {} auto-cancelled as stale", order.id);
    }

    async fn deactivate_if_one_time(&self, listing_id: Uuid) {
        let mut listings = self.listings.write().await;
        if let Some(listing) = listings.get_mut(&listing_id) {
            if listing.one_time && listing.active {
                listing.active = false;
                info!("One-time listing {} deactivated", listing_id);
            }
        }
    }

    async fn push_event(&self, event: OrderEvent) {
        self.events.write().await.push(event);
    }

    fn load(orders: &HashMap<Uuid, Order>, order_id: Uuid) -> EngineResult<Order> {
        orders
            .get(&order_id)
            .cloned()
            .ok_or_else(|| EngineError::not_found(format!("Order {} not found", order_id)))
    }

    fn require_party(order: &Order, caller_id: Uuid) -> EngineResult<PartyRole> {
        order.role_of(caller_id).ok_or_else(|| {
            EngineError::forbidden(format!("Caller is not a party to order {}", order.id))
        })
    }

    fn require_role(
        order: &Order,
        caller_id: Uuid,
        role: PartyRole,
        action: &str,
    ) -> EngineResult<()> {
        match Self::require_party(order, caller_id)? {
            r if r == role => Ok(()),
            _ => Err(EngineError::forbidden(format!(
                "Only the {} may {}",
                match role {
                    PartyRole::Buyer => "buyer",
                    PartyRole::Seller => "seller",
                },
                action
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{DevStubProvider, ProviderRef};
    use crate::settlement::SettlementConfig;
    use crate::timers::TimerConfig;
    use crate::verification::StaticVerificationGate;
    use crate::wallet::{WalletConfig, WalletLedger};
    use async_trait::async_trait;
    use chrono::Duration;

    struct FailingProvider;

    #[async_trait]
    impl EscrowPaymentProvider for FailingProvider {
        async fn fund_escrow(
            &self,
            _order_id: Uuid,
            _amount_cents: i64,
            _currency: &str,
        ) -> EngineResult<ProviderRef> {
            Err(EngineError::upstream("card declined"))
        }

        async fn refund(
            &self,
            _provider_ref: &ProviderRef,
            _amount_cents: Option<i64>,
        ) -> EngineResult<()> {
            Ok(())
        }

        async fn payout(&self, _provider_ref: &ProviderRef) -> EngineResult<()> {
            Ok(())
        }
    }

    struct Fixture {
        lifecycle: OrderLifecycle,
        settlement: Arc<EscrowSettlement>,
        wallet: Arc<WalletLedger>,
        verification: Arc<StaticVerificationGate>,
        buyer: Uuid,
        seller: Uuid,
        listing: Listing,
    }

    async fn fixture_with(
        provider: Arc<dyn EscrowPaymentProvider>,
        one_time: bool,
    ) -> Fixture {
        let wallet = Arc::new(WalletLedger::new(WalletConfig::default()));
        let settlement = Arc::new(EscrowSettlement::new(
            SettlementConfig::default(),
            wallet.clone(),
        ));
        let proofs = Arc::new(ProofGate::new());
        let verification = Arc::new(StaticVerificationGate::default());
        let lifecycle = OrderLifecycle::new(
            LifecycleConfig::default(),
            proofs,
            Arc::new(DisputeManager::new()),
            settlement.clone(),
            TimerService::new(TimerConfig::default()),
            verification.clone(),
            provider,
            Arc::new(Outbox::new()),
        );

        let seller = Uuid::new_v4();
        let buyer = Uuid::new_v4();
        let listing = Listing::new(seller, "Rare skin".into(), 10_000, one_time);
        lifecycle.upsert_listing(listing.clone()).await;

        Fixture {
            lifecycle,
            settlement,
            wallet,
            verification,
            buyer,
            seller,
            listing,
        }
    }

    async fn fixture() -> Fixture {
        fixture_with(Arc::new(DevStubProvider), false).await
    }

    async fn funded_order(f: &Fixture) -> Order {
        let order = f
            .lifecycle
            .request_order(f.buyer, f.listing.id, 1)
            .await
            .unwrap();
        f.lifecycle.accept_order(order.id, f.seller).await.unwrap();
        f.lifecycle.pay_escrow(order.id, f.buyer).await.unwrap()
    }

    async fn backdate(f: &Fixture, order_id: Uuid, hours: i64) {
        let mut orders = f.lifecycle.orders.write().await;
        let order = orders.get_mut(&order_id).unwrap();
        order.updated_at = Utc::now() - Duration::hours(hours);
    }

    #[tokio::test]
    async fn test_full_lifecycle_seller_confirms_first() {
        let f = fixture().await;
        let order = funded_order(&f).await;

        assert_eq!(order.status, OrderStatus::PaidEscrow);
        let code = order.safe_trade_code.clone().unwrap();
        assert_eq!(code.len(), 10);
        assert!(code.starts_with("TRD-"));
        assert!(order.buyer_dispute_deadline.is_some());
        assert!(order.escrow_funded_at.is_some());

        f.lifecycle
            .submit_proof(order.id, f.seller, "screenshot".into(), "https://x/1".into())
            .await
            .unwrap();
        assert_eq!(
            f.lifecycle.get_order(order.id).await.unwrap().status,
            OrderStatus::Delivered
        );

        let after_seller = f
            .lifecycle
            .confirm_exchange(order.id, f.seller)
            .await
            .unwrap();
        assert_eq!(after_seller.status, OrderStatus::Delivered);
        assert!(after_seller.seller_confirmed_at.is_some());

        let done = f
            .lifecycle
            .confirm_exchange(order.id, f.buyer)
            .await
            .unwrap();
        assert_eq!(done.status, OrderStatus::Completed);
        assert!(done.released_at.is_some());
        assert_eq!(done.platform_fee_cents, 1_000);

        let purchase = f.settlement.purchase_for_order(order.id).await.unwrap();
        assert_eq!(purchase.owner_cut_cents, 1_000);
        assert_eq!(purchase.referrer_cut_cents, 0);

        let wallet = f.wallet.wallet(f.seller).await;
        assert_eq!(wallet.credit_balance_cents, 9_000);
        assert!(f.wallet.reconciles(f.seller).await);
    }

    #[tokio::test]
    async fn test_buyer_confirming_first_settles_once_too() {
        let f = fixture().await;
        let order = funded_order(&f).await;

        f.lifecycle
            .confirm_exchange(order.id, f.buyer)
            .await
            .unwrap();
        f.lifecycle
            .submit_proof(order.id, f.seller, "screenshot".into(), "https://x/1".into())
            .await
            .unwrap();
        let done = f
            .lifecycle
            .confirm_exchange(order.id, f.seller)
            .await
            .unwrap();

        assert_eq!(done.status, OrderStatus::Completed);
        assert!(f.settlement.purchase_for_order(order.id).await.is_some());
        assert_eq!(f.wallet.wallet(f.seller).await.credit_balance_cents, 9_000);
    }

    #[tokio::test]
    async fn test_racing_confirms_settle_exactly_once() {
        let f = fixture().await;
        let order = funded_order(&f).await;
        f.lifecycle
            .submit_proof(order.id, f.seller, "screenshot".into(), "https://x/1".into())
            .await
            .unwrap();

        let (buyer_result, seller_result) = tokio::join!(
            f.lifecycle.confirm_exchange(order.id, f.buyer),
            f.lifecycle.confirm_exchange(order.id, f.seller),
        );
        buyer_result.unwrap();
        seller_result.unwrap();

        assert_eq!(
            f.lifecycle.get_order(order.id).await.unwrap().status,
            OrderStatus::Completed
        );
        assert!(f.settlement.purchase_for_order(order.id).await.is_some());
        assert_eq!(f.settlement.payouts_for_order(order.id).await.len(), 1);
        assert_eq!(f.wallet.wallet(f.seller).await.credit_balance_cents, 9_000);
    }

    #[tokio::test]
    async fn test_seller_cannot_confirm_without_proof() {
        let f = fixture().await;
        let order = funded_order(&f).await;

        let err = f
            .lifecycle
            .confirm_exchange(order.id, f.seller)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::PreconditionFailed(_)));

        // The buyer is not proof-gated
        f.lifecycle
            .confirm_exchange(order.id, f.buyer)
            .await
            .unwrap();
        assert_eq!(
            f.lifecycle.get_order(order.id).await.unwrap().status,
            OrderStatus::PaidEscrow
        );
    }

    #[tokio::test]
    async fn test_pending_proof_is_enough_for_seller_confirm() {
        let f = fixture().await;
        let order = funded_order(&f).await;

        f.lifecycle
            .submit_proof(order.id, f.seller, "screenshot".into(), "https://x/1".into())
            .await
            .unwrap();
        // No buyer review happened; upload alone opens the gate
        let confirmed = f
            .lifecycle
            .confirm_exchange(order.id, f.seller)
            .await
            .unwrap();
        assert!(confirmed.seller_confirmed_at.is_some());
    }

    #[tokio::test]
    async fn test_double_confirm_is_idempotent() {
        let f = fixture().await;
        let order = funded_order(&f).await;

        let first = f
            .lifecycle
            .confirm_exchange(order.id, f.buyer)
            .await
            .unwrap();
        let second = f
            .lifecycle
            .confirm_exchange(order.id, f.buyer)
            .await
            .unwrap();

        assert_eq!(first.buyer_confirmed_at, second.buyer_confirmed_at);
        assert_eq!(second.status, OrderStatus::PaidEscrow);
        assert!(f.settlement.purchase_for_order(order.id).await.is_none());
    }

    #[tokio::test]
    async fn test_accept_role_state_and_verification_guards() {
        let f = fixture().await;
        let order = f
            .lifecycle
            .request_order(f.buyer, f.listing.id, 1)
            .await
            .unwrap();

        let err = f
            .lifecycle
            .accept_order(order.id, f.buyer)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Forbidden(_)));

        let err = f
            .lifecycle
            .accept_order(order.id, Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Forbidden(_)));

        f.verification.revoke(f.seller).await;
        let err = f
            .lifecycle
            .accept_order(order.id, f.seller)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::PreconditionFailed(_)));

        f.verification.mark_complete(f.seller).await;
        f.lifecycle.accept_order(order.id, f.seller).await.unwrap();
        let err = f
            .lifecycle
            .accept_order(order.id, f.seller)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::StateConflict { .. }));
    }

    #[tokio::test]
    async fn test_one_time_listing_deactivates_on_accept() {
        let f = fixture_with(Arc::new(DevStubProvider), true).await;
        let order = f
            .lifecycle
            .request_order(f.buyer, f.listing.id, 1)
            .await
            .unwrap();
        f.lifecycle.accept_order(order.id, f.seller).await.unwrap();

        assert!(!f.lifecycle.get_listing(f.listing.id).await.unwrap().active);

        let err = f
            .lifecycle
            .request_order(Uuid::new_v4(), f.listing.id, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_provider_failure_leaves_order_accepted() {
        let f = fixture_with(Arc::new(FailingProvider), false).await;
        let order = f
            .lifecycle
            .request_order(f.buyer, f.listing.id, 1)
            .await
            .unwrap();
        f.lifecycle.accept_order(order.id, f.seller).await.unwrap();

        let err = f
            .lifecycle
            .pay_escrow(order.id, f.buyer)
            .await
            .unwrap_err();
        assert!(err.is_retryable());

        let order = f.lifecycle.get_order(order.id).await.unwrap();
        assert_eq!(order.status, OrderStatus::Accepted);
        assert!(order.safe_trade_code.is_none());
        assert!(order.escrow_funded_at.is_none());
        assert!(order.buyer_dispute_deadline.is_none());
    }

    #[tokio::test]
    async fn test_pay_guards() {
        let f = fixture().await;
        let order = f
            .lifecycle
            .request_order(f.buyer, f.listing.id, 1)
            .await
            .unwrap();

        let err = f.lifecycle.pay_escrow(order.id, f.buyer).await.unwrap_err();
        assert!(matches!(err, EngineError::StateConflict { .. }));

        f.lifecycle.accept_order(order.id, f.seller).await.unwrap();
        let err = f
            .lifecycle
            .pay_escrow(order.id, f.seller)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Forbidden(_)));

        f.lifecycle.pay_escrow(order.id, f.buyer).await.unwrap();
        let err = f.lifecycle.pay_escrow(order.id, f.buyer).await.unwrap_err();
        assert!(matches!(err, EngineError::StateConflict { .. }));
    }

    #[tokio::test]
    async fn test_fresh_code_per_funding() {
        let f = fixture().await;
        let first = funded_order(&f).await;

        let listing2 = Listing::new(f.seller, "Another skin".into(), 5_000, false);
        f.lifecycle.upsert_listing(listing2.clone()).await;
        let order2 = f
            .lifecycle
            .request_order(f.buyer, listing2.id, 1)
            .await
            .unwrap();
        f.lifecycle.accept_order(order2.id, f.seller).await.unwrap();
        let second = f.lifecycle.pay_escrow(order2.id, f.buyer).await.unwrap();

        assert_ne!(first.safe_trade_code, second.safe_trade_code);
    }

    #[tokio::test]
    async fn test_stale_order_cancels_once_under_concurrent_reads() {
        let f = fixture().await;
        let order = funded_order(&f).await;
        backdate(&f, order.id, 25).await;

        let (first, second) = tokio::join!(
            f.lifecycle.get_order(order.id),
            f.lifecycle.get_order(order.id),
        );
        assert_eq!(first.unwrap().status, OrderStatus::Cancelled);
        assert_eq!(second.unwrap().status, OrderStatus::Cancelled);

        let cancellations = f
            .lifecycle
            .events_for_order(order.id)
            .await
            .into_iter()
            .filter(|e| e.event_type == "order.auto_cancelled")
            .count();
        assert_eq!(cancellations, 1);
    }

    #[tokio::test]
    async fn test_stale_order_blocks_transitions() {
        let f = fixture().await;
        let order = funded_order(&f).await;
        backdate(&f, order.id, 25).await;

        let err = f
            .lifecycle
            .confirm_exchange(order.id, f.buyer)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::StateConflict { .. }));
        assert_eq!(
            f.lifecycle.get_order(order.id).await.unwrap().status,
            OrderStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn test_fresh_order_is_not_cancelled_on_read() {
        let f = fixture().await;
        let order = funded_order(&f).await;
        assert_eq!(
            f.lifecycle.get_order(order.id).await.unwrap().status,
            OrderStatus::PaidEscrow
        );
    }

    #[tokio::test]
    async fn test_dispute_freezes_order() {
        let f = fixture().await;
        let order = funded_order(&f).await;

        let dispute = f
            .lifecycle
            .open_dispute(order.id, f.buyer, Some("nothing arrived".into()))
            .await
            .unwrap();
        assert_eq!(dispute.status, crate::models::DisputeStatus::Open);
        assert_eq!(
            f.lifecycle.get_order(order.id).await.unwrap().status,
            OrderStatus::DisputeOpen
        );

        let err = f
            .lifecycle
            .confirm_exchange(order.id, f.buyer)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::StateConflict { .. }));

        let err = f
            .lifecycle
            .open_dispute(order.id, f.seller, None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::StateConflict { .. }));
    }

    #[tokio::test]
    async fn test_dispute_rejected_after_window() {
        let f = fixture().await;
        let order = funded_order(&f).await;
        {
            let mut orders = f.lifecycle.orders.write().await;
            let order = orders.get_mut(&order.id).unwrap();
            order.buyer_dispute_deadline = Some(Utc::now() - Duration::hours(1));
        }

        let err = f
            .lifecycle
            .open_dispute(order.id, f.buyer, None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::PreconditionFailed(_)));
    }

    #[tokio::test]
    async fn test_dispute_rejected_from_completed() {
        let f = fixture().await;
        let order = funded_order(&f).await;
        f.lifecycle
            .submit_proof(order.id, f.seller, "screenshot".into(), "https://x/1".into())
            .await
            .unwrap();
        f.lifecycle
            .confirm_exchange(order.id, f.seller)
            .await
            .unwrap();
        f.lifecycle
            .confirm_exchange(order.id, f.buyer)
            .await
            .unwrap();

        let err = f
            .lifecycle
            .open_dispute(order.id, f.buyer, None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::StateConflict { .. }));
    }

    #[tokio::test]
    async fn test_resolution_refund_buyer() {
        let f = fixture().await;
        let order = funded_order(&f).await;
        f.lifecycle.open_dispute(order.id, f.buyer, None).await.unwrap();

        let resolved = f
            .lifecycle
            .resolve_dispute(order.id, DisputeDecision::RefundBuyer, None)
            .await
            .unwrap();
        assert_eq!(resolved.status, OrderStatus::Refunded);
        assert!(f.settlement.purchase_for_order(order.id).await.is_none());
        assert_eq!(f.wallet.wallet(f.seller).await.credit_balance_cents, 0);
    }

    #[tokio::test]
    async fn test_resolution_release_seller() {
        let f = fixture().await;
        let order = funded_order(&f).await;
        f.lifecycle.open_dispute(order.id, f.seller, None).await.unwrap();

        let resolved = f
            .lifecycle
            .resolve_dispute(order.id, DisputeDecision::ReleaseSeller, None)
            .await
            .unwrap();
        assert_eq!(resolved.status, OrderStatus::Completed);
        assert!(f.settlement.purchase_for_order(order.id).await.is_some());
        assert_eq!(f.wallet.wallet(f.seller).await.credit_balance_cents, 9_000);
    }

    #[tokio::test]
    async fn test_resolution_partial_refund() {
        let f = fixture().await;
        let order = funded_order(&f).await;
        f.lifecycle.open_dispute(order.id, f.buyer, None).await.unwrap();

        let err = f
            .lifecycle
            .resolve_dispute(order.id, DisputeDecision::PartialRefund, None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::PreconditionFailed(_)));

        let resolved = f
            .lifecycle
            .resolve_dispute(order.id, DisputeDecision::PartialRefund, Some(4_000))
            .await
            .unwrap();
        assert_eq!(resolved.status, OrderStatus::Refunded);

        // Seller gets the remainder minus the split on it: 6000 - 600
        assert_eq!(f.wallet.wallet(f.seller).await.credit_balance_cents, 5_400);
        assert!(f.settlement.purchase_for_order(order.id).await.is_none());
        assert_eq!(f.settlement.payouts_for_order(order.id).await.len(), 1);
    }

    #[tokio::test]
    async fn test_settlement_snapshot_uses_referrer_and_vip() {
        let f = fixture().await;
        let referrer = Uuid::new_v4();
        let mut profile = BuyerProfile::new(f.buyer);
        profile.referrer_user_id = Some(referrer);
        profile.vip_active_until = Some(Utc::now() + Duration::days(30));
        f.lifecycle.upsert_profile(profile).await;

        let order = funded_order(&f).await;
        f.lifecycle
            .submit_proof(order.id, f.seller, "screenshot".into(), "https://x/1".into())
            .await
            .unwrap();
        f.lifecycle
            .confirm_exchange(order.id, f.seller)
            .await
            .unwrap();
        let done = f
            .lifecycle
            .confirm_exchange(order.id, f.buyer)
            .await
            .unwrap();

        assert_eq!(done.platform_fee_cents, 650);
        let purchase = f.settlement.purchase_for_order(order.id).await.unwrap();
        assert_eq!(purchase.owner_cut_cents, 350);
        assert_eq!(purchase.referrer_cut_cents, 300);
        assert!(purchase.vip_applied);
        assert_eq!(purchase.referrer_user_id, Some(referrer));
        assert_eq!(f.wallet.wallet(f.seller).await.credit_balance_cents, 9_350);
        assert_eq!(f.settlement.payouts_for_order(order.id).await.len(), 2);
    }

    #[tokio::test]
    async fn test_request_order_guards() {
        let f = fixture().await;

        let err = f
            .lifecycle
            .request_order(f.seller, f.listing.id, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Forbidden(_)));

        let err = f
            .lifecycle
            .request_order(f.buyer, f.listing.id, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::PreconditionFailed(_)));

        let err = f
            .lifecycle
            .request_order(f.buyer, Uuid::new_v4(), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }
}
