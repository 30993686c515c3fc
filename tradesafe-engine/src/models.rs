//! Core data models for the trade settlement engine
//!
//! This module contains the order state machine, proof and dispute records,
//! wallet and ledger rows, and the payout records written at settlement time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EngineError;
use crate::EngineResult;

/// Order state machine enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    /// Buyer requested the trade, awaiting seller response
    Requested,
    /// Seller accepted, awaiting escrow funding
    Accepted,
    /// Buyer funded escrow, funds held by the platform
    PaidEscrow,
    /// Seller submitted delivery proof
    Delivered,
    /// Both parties confirmed, funds released to seller
    Completed,
    /// Cancelled by the buyer or by the stale-order policy
    Cancelled,
    /// Declined by the seller
    Declined,
    /// A dispute froze the order pending staff resolution
    DisputeOpen,
    /// Escrowed funds returned to the buyer
    Refunded,
}

impl OrderStatus {
    /// Check if this is a terminal state (order is immutable)
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Cancelled | Self::Declined | Self::Refunded
        )
    }

    /// Check if this state is subject to the stale auto-cancel policy.
    /// DisputeOpen is frozen awaiting staff action and is exempt.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Requested | Self::Accepted | Self::PaidEscrow | Self::Delivered
        )
    }

    /// Check if this state allows seller acceptance
    pub fn can_accept(&self) -> bool {
        matches!(self, Self::Requested)
    }

    /// Check if this state allows escrow funding
    pub fn can_pay(&self) -> bool {
        matches!(self, Self::Accepted)
    }

    /// Check if this state allows party confirmation
    pub fn can_confirm(&self) -> bool {
        matches!(self, Self::PaidEscrow | Self::Delivered)
    }

    /// Check if this state allows opening a dispute
    pub fn can_dispute(&self) -> bool {
        matches!(self, Self::PaidEscrow | Self::Delivered)
    }

    /// Check if this state allows proof submission
    pub fn can_submit_proof(&self) -> bool {
        matches!(self, Self::PaidEscrow | Self::Delivered)
    }
}

/// The role a caller plays on an order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartyRole {
    Buyer,
    Seller,
}

/// Order model representing a mediated trade between two parties.
///
/// Orders are a financial record: they are never hard-deleted and become
/// immutable once they reach a terminal status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub buyer_id: Uuid,
    pub seller_id: Uuid,
    pub listing_id: Uuid,

    // Amounts
    pub quantity: u32,
    pub unit_price_cents: i64,
    pub subtotal_cents: i64,
    pub platform_fee_cents: i64,
    pub total_cents: i64,

    pub status: OrderStatus,

    /// Display token shown to both parties to correlate the exchange.
    /// Regenerated on every escrow funding; not an access credential.
    pub safe_trade_code: Option<String>,

    // Deadlines & escrow
    pub buyer_dispute_deadline: Option<DateTime<Utc>>,
    pub escrow_funded_at: Option<DateTime<Utc>>,
    pub released_at: Option<DateTime<Utc>>,
    pub provider_ref: Option<String>,

    // Confirmations
    pub buyer_confirmed_at: Option<DateTime<Utc>>,
    pub seller_confirmed_at: Option<DateTime<Utc>>,

    // Timestamps
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// Create a new order in the Requested state
    pub fn new(
        buyer_id: Uuid,
        seller_id: Uuid,
        listing_id: Uuid,
        quantity: u32,
        unit_price_cents: i64,
        platform_fee_estimate_cents: i64,
    ) -> Self {
        let subtotal_cents = unit_price_cents * quantity as i64;
        Self {
            id: Uuid::new_v4(),
            buyer_id,
            seller_id,
            listing_id,
            quantity,
            unit_price_cents,
            subtotal_cents,
            platform_fee_cents: platform_fee_estimate_cents,
            total_cents: subtotal_cents,
            status: OrderStatus::Requested,
            safe_trade_code: None,
            buyer_dispute_deadline: None,
            escrow_funded_at: None,
            released_at: None,
            provider_ref: None,
            buyer_confirmed_at: None,
            seller_confirmed_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    /// The role `user_id` plays on this order, if any
    pub fn role_of(&self, user_id: Uuid) -> Option<PartyRole> {
        if user_id == self.buyer_id {
            Some(PartyRole::Buyer)
        } else if user_id == self.seller_id {
            Some(PartyRole::Seller)
        } else {
            None
        }
    }

    /// Validate a state transition against the order's current status
    pub fn validate_transition(&self, to_status: OrderStatus) -> EngineResult<()> {
        use OrderStatus::*;

        let valid = match (&self.status, &to_status) {
            (Requested, Accepted) => true,
            (Requested, Cancelled) => true,
            (Requested, Declined) => true,
            (Accepted, PaidEscrow) => true,
            (Accepted, Cancelled) => true,
            (PaidEscrow, Delivered) => true,
            (PaidEscrow, Completed) => true,
            (PaidEscrow, DisputeOpen) => true,
            (PaidEscrow, Cancelled) => true,
            (Delivered, Completed) => true,
            (Delivered, DisputeOpen) => true,
            (Delivered, Cancelled) => true,
            (DisputeOpen, Completed) => true,
            (DisputeOpen, Refunded) => true,
            _ => false,
        };

        if valid {
            Ok(())
        } else {
            Err(EngineError::state_conflict(
                format!("{:?}", self.status),
                format!("transition to {:?}", to_status),
                "Invalid state transition".to_string(),
            ))
        }
    }

    /// Whether both parties have confirmed the exchange
    pub fn both_confirmed(&self) -> bool {
        self.buyer_confirmed_at.is_some() && self.seller_confirmed_at.is_some()
    }
}

/// Generate a fresh safe-trade display code (`TRD-XXXXXX`, 10 characters).
pub fn generate_safe_trade_code() -> String {
    let hex = Uuid::new_v4().simple().to_string().to_uppercase();
    format!("TRD-{}", &hex[..6])
}

/// Delivery proof review status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProofStatus {
    /// Submitted, awaiting buyer review
    Pending,
    /// Accepted by the buyer
    Accepted,
    /// Rejected by the buyer
    Rejected,
}

/// Evidence submitted by a party claiming delivery occurred.
///
/// An order may carry any number of proofs from either party. A seller may
/// not confirm the exchange without at least one proof of their own on
/// record; buyer acceptance is a trust signal, not a gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryProof {
    pub id: Uuid,
    pub order_id: Uuid,
    /// Submitting party
    pub user_id: Uuid,
    pub kind: String,
    pub url: String,
    pub status: ProofStatus,
    pub reviewed_by_id: Option<Uuid>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl DeliveryProof {
    pub fn new(order_id: Uuid, user_id: Uuid, kind: String, url: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            order_id,
            user_id,
            kind,
            url,
            status: ProofStatus::Pending,
            reviewed_by_id: None,
            reviewed_at: None,
            created_at: Utc::now(),
        }
    }
}

/// Dispute lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisputeStatus {
    Open,
    Resolved,
}

/// Staff decision applied to a resolved dispute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisputeDecision {
    /// Return the full escrowed amount to the buyer
    RefundBuyer,
    /// Return part of the amount to the buyer, settle the remainder
    PartialRefund,
    /// Release the full escrowed amount to the seller
    ReleaseSeller,
}

/// Dispute model freezing an order pending staff resolution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dispute {
    pub id: Uuid,
    pub order_id: Uuid,
    pub opened_by_id: Uuid,
    pub status: DisputeStatus,
    pub decision: Option<DisputeDecision>,
    pub evidence: Option<String>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Dispute {
    pub fn new(order_id: Uuid, opened_by_id: Uuid, evidence: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            order_id,
            opened_by_id,
            status: DisputeStatus::Open,
            decision: None,
            evidence,
            created_at: Utc::now(),
            resolved_at: None,
        }
    }
}

/// Per-user wallet projection.
///
/// Cached view over the point and credit ledgers; the ledgers are the
/// source of truth and the projection must reconcile with them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Wallet {
    pub user_id: Uuid,
    pub points_balance: i64,
    pub lifetime_points_earned: i64,
    pub credit_balance_cents: i64,
    pub lifetime_discount_bps: i32,
    pub updated_at: DateTime<Utc>,
}

impl Wallet {
    pub fn new(user_id: Uuid) -> Self {
        Self {
            user_id,
            points_balance: 0,
            lifetime_points_earned: 0,
            credit_balance_cents: 0,
            lifetime_discount_bps: 0,
            updated_at: Utc::now(),
        }
    }
}

/// Source tag carried on every ledger row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerSource {
    /// Seller payout from a settled order
    OrderPayout,
    /// Points-to-credit conversion
    PointsConversion,
    /// Referral signup bonus
    ReferralSignup,
    /// Daily wheel reward
    DailyWheel,
    /// Staff wallet adjustment
    AdminAdjustment,
    /// Payout applied by a dispute resolution
    DisputeSettlement,
}

/// Append-only points ledger row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PointsLedgerEntry {
    pub id: Uuid,
    pub user_id: Uuid,
    pub source: LedgerSource,
    pub delta: i64,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// Append-only credit ledger row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditLedgerEntry {
    pub id: Uuid,
    pub user_id: Uuid,
    pub source: LedgerSource,
    pub delta_cents: i64,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// Beneficiary role on a payout ledger row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PayoutRole {
    /// Platform owner cut
    Owner,
    /// Referrer cut
    Referrer,
}

/// Monetary split record for a settled order. Created exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Purchase {
    pub id: Uuid,
    pub order_id: Uuid,
    pub owner_cut_cents: i64,
    pub referrer_user_id: Option<Uuid>,
    pub referrer_cut_cents: i64,
    pub vip_applied: bool,
    pub created_at: DateTime<Utc>,
}

/// One payout ledger row per non-zero beneficiary of a settlement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayoutLedgerEntry {
    pub id: Uuid,
    pub order_id: Uuid,
    pub role: PayoutRole,
    /// None for the Owner role (the platform itself)
    pub beneficiary_user_id: Option<Uuid>,
    pub amount_cents: i64,
    pub created_at: DateTime<Utc>,
}

/// Marketplace listing, as far as the engine needs it: the accept path
/// deactivates one-time listings and order requests check activity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Listing {
    pub id: Uuid,
    pub seller_id: Uuid,
    pub title: String,
    pub unit_price_cents: i64,
    /// Single-unit listing, deactivated once sold
    pub one_time: bool,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl Listing {
    pub fn new(seller_id: Uuid, title: String, unit_price_cents: i64, one_time: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            seller_id,
            title,
            unit_price_cents,
            one_time,
            active: true,
            created_at: Utc::now(),
        }
    }
}

/// Buyer-side account state consulted when computing the platform split
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuyerProfile {
    pub user_id: Uuid,
    pub vip_lifetime: bool,
    pub vip_status: Option<String>,
    pub vip_active_until: Option<DateTime<Utc>>,
    pub referrer_user_id: Option<Uuid>,
}

impl BuyerProfile {
    pub fn new(user_id: Uuid) -> Self {
        Self {
            user_id,
            vip_lifetime: false,
            vip_status: None,
            vip_active_until: None,
            referrer_user_id: None,
        }
    }

    /// Whether the buyer's VIP state is active at `now`
    pub fn vip_active(&self, now: DateTime<Utc>) -> bool {
        self.vip_lifetime
            || self.vip_status.as_deref() == Some("lifetime")
            || self.vip_active_until.map_or(false, |until| until > now)
    }

    /// Freeze the profile into the immutable view settlement works from.
    /// Taken once at confirm time so a mid-flight VIP or referrer change
    /// does not alter an already-decided split.
    pub fn snapshot(&self, now: DateTime<Utc>) -> SettlementSnapshot {
        SettlementSnapshot {
            buyer_id: self.user_id,
            vip_active: self.vip_active(now),
            referrer_user_id: self.referrer_user_id,
        }
    }
}

/// Immutable buyer snapshot used by settlement
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SettlementSnapshot {
    pub buyer_id: Uuid,
    pub vip_active: bool,
    pub referrer_user_id: Option<Uuid>,
}

/// Order event for the audit trail
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderEvent {
    pub id: Uuid,
    pub event_type: String,
    pub order_id: Uuid,
    pub actor_id: Option<Uuid>,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl OrderEvent {
    pub fn new(
        event_type: impl Into<String>,
        order_id: Uuid,
        actor_id: Option<Uuid>,
        metadata: Option<serde_json::Value>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type: event_type.into(),
            order_id,
            actor_id,
            metadata,
            created_at: Utc::now(),
        }
    }
}

/// Aggregated seller trust statistics, recomputed after proof acceptance
/// and order completion
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SellerStats {
    pub completed_sales: i64,
    pub accepted_proofs: i64,
    pub total_cents_earned: i64,
    pub disputes_total: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_terminal_states() {
        assert!(OrderStatus::Completed.is_terminal());
        assert!(OrderStatus::Cancelled.is_terminal());
        assert!(OrderStatus::Declined.is_terminal());
        assert!(OrderStatus::Refunded.is_terminal());
        assert!(!OrderStatus::DisputeOpen.is_terminal());
        assert!(!OrderStatus::PaidEscrow.is_terminal());
    }

    #[test]
    fn test_dispute_open_is_not_stale_eligible() {
        assert!(!OrderStatus::DisputeOpen.is_active());
        assert!(OrderStatus::PaidEscrow.is_active());
        assert!(OrderStatus::Requested.is_active());
    }

    #[test]
    fn test_transition_table() {
        let buyer = Uuid::new_v4();
        let seller = Uuid::new_v4();
        let mut order = Order::new(buyer, seller, Uuid::new_v4(), 1, 1000, 100);

        assert!(order.validate_transition(OrderStatus::Accepted).is_ok());
        assert!(order.validate_transition(OrderStatus::Completed).is_err());

        order.status = OrderStatus::PaidEscrow;
        assert!(order.validate_transition(OrderStatus::Completed).is_ok());
        assert!(order.validate_transition(OrderStatus::DisputeOpen).is_ok());
        assert!(order.validate_transition(OrderStatus::Accepted).is_err());

        order.status = OrderStatus::Completed;
        assert!(order.validate_transition(OrderStatus::DisputeOpen).is_err());
    }

    #[test]
    fn test_safe_trade_code_shape() {
        let code = generate_safe_trade_code();
        assert_eq!(code.len(), 10);
        assert!(code.starts_with("TRD-"));
        let suffix = &code[4..];
        assert!(suffix.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_eq!(suffix, suffix.to_uppercase());
    }

    #[test]
    fn test_vip_active_variants() {
        let now = Utc::now();
        let mut profile = BuyerProfile::new(Uuid::new_v4());
        assert!(!profile.vip_active(now));

        profile.vip_lifetime = true;
        assert!(profile.vip_active(now));

        profile.vip_lifetime = false;
        profile.vip_status = Some("lifetime".to_string());
        assert!(profile.vip_active(now));

        profile.vip_status = None;
        profile.vip_active_until = Some(now + Duration::hours(1));
        assert!(profile.vip_active(now));

        profile.vip_active_until = Some(now - Duration::hours(1));
        assert!(!profile.vip_active(now));
    }

    #[test]
    fn test_order_amounts() {
        let order = Order::new(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), 3, 2500, 750);
        assert_eq!(order.subtotal_cents, 7500);
        assert_eq!(order.total_cents, 7500);
        assert_eq!(order.platform_fee_cents, 750);
        assert_eq!(order.status, OrderStatus::Requested);
    }
}
