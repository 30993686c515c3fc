//! Dispute Manager - opens and tracks disputes and their resolution outcomes
//!
//! One active dispute per order. Opening a dispute freezes the order in the
//! lifecycle; resolutions are applied out-of-band by staff through the node's
//! admin-credentialed path, which calls back into settlement and refund
//! primitives.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use crate::error::EngineError;
use crate::models::{Dispute, DisputeDecision, DisputeStatus};
use crate::EngineResult;

/// Dispute record store.
///
/// In-memory storage; in production this would be a database table.
pub struct DisputeManager {
    disputes: Arc<RwLock<HashMap<Uuid, Dispute>>>,
}

impl DisputeManager {
    pub fn new() -> Self {
        Self {
            disputes: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Create the dispute row for an order. The caller (lifecycle) has
    /// already validated the order state and the opener's role.
    pub async fn open_record(
        &self,
        order_id: Uuid,
        opened_by_id: Uuid,
        evidence: Option<String>,
    ) -> EngineResult<Dispute> {
        let mut disputes = self.disputes.write().await;

        let already_open = disputes
            .values()
            .any(|d| d.order_id == order_id && d.status == DisputeStatus::Open);
        if already_open {
            return Err(EngineError::state_conflict(
                "Open".to_string(),
                "open dispute".to_string(),
                "Order already has an active dispute".to_string(),
            ));
        }

        let dispute = Dispute::new(order_id, opened_by_id, evidence);
        disputes.insert(dispute.id, dispute.clone());

        info!("Dispute {} opened on order {}", dispute.id, order_id);

        Ok(dispute)
    }

    /// Record the staff decision on the order's active dispute
    pub async fn resolve_record(
        &self,
        order_id: Uuid,
        decision: DisputeDecision,
    ) -> EngineResult<Dispute> {
        let mut disputes = self.disputes.write().await;
        let dispute = disputes
            .values_mut()
            .find(|d| d.order_id == order_id && d.status == DisputeStatus::Open)
            .ok_or_else(|| {
                EngineError::not_found(format!("No active dispute on order {}", order_id))
            })?;

        dispute.status = DisputeStatus::Resolved;
        dispute.decision = Some(decision);
        dispute.resolved_at = Some(Utc::now());

        info!(
            "Dispute {} on order {} resolved: {:?}",
            dispute.id, order_id, decision
        );

        Ok(dispute.clone())
    }

    /// The order's active dispute, if one exists
    pub async fn active_for_order(&self, order_id: Uuid) -> Option<Dispute> {
        self.disputes
            .read()
            .await
            .values()
            .find(|d| d.order_id == order_id && d.status == DisputeStatus::Open)
            .cloned()
    }

    /// Get a dispute by ID
    pub async fn get_dispute(&self, dispute_id: Uuid) -> EngineResult<Dispute> {
        self.disputes
            .read()
            .await
            .get(&dispute_id)
            .cloned()
            .ok_or_else(|| EngineError::not_found(format!("Dispute {} not found", dispute_id)))
    }
}

impl Default for DisputeManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_one_active_dispute_per_order() {
        let manager = DisputeManager::new();
        let order = Uuid::new_v4();
        let opener = Uuid::new_v4();

        manager.open_record(order, opener, None).await.unwrap();
        let err = manager
            .open_record(order, opener, None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::StateConflict { .. }));
    }

    #[tokio::test]
    async fn test_resolution_reopens_nothing() {
        let manager = DisputeManager::new();
        let order = Uuid::new_v4();

        let dispute = manager
            .open_record(order, Uuid::new_v4(), Some("tracking shows no delivery".into()))
            .await
            .unwrap();

        let resolved = manager
            .resolve_record(order, DisputeDecision::RefundBuyer)
            .await
            .unwrap();
        assert_eq!(resolved.id, dispute.id);
        assert_eq!(resolved.status, DisputeStatus::Resolved);
        assert_eq!(resolved.decision, Some(DisputeDecision::RefundBuyer));
        assert!(resolved.resolved_at.is_some());

        // Nothing active anymore; a second resolve finds no dispute
        assert!(manager.active_for_order(order).await.is_none());
        assert!(manager
            .resolve_record(order, DisputeDecision::ReleaseSeller)
            .await
            .is_err());

        // A fresh dispute may be opened after resolution
        manager.open_record(order, Uuid::new_v4(), None).await.unwrap();
    }
}
