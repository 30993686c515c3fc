//! Proof Gate - tracks delivery-proof submissions and acceptance per order
//!
//! Either party may submit any number of proofs. Buyer acceptance stamps the
//! reviewer and feeds the seller trust stats; it is informational only. The
//! seller-confirmation gate in the lifecycle requires the *existence* of a
//! seller-authored proof, regardless of its review status.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use crate::error::EngineError;
use crate::models::{DeliveryProof, ProofStatus};
use crate::EngineResult;

/// Proof store and review operations.
///
/// In-memory storage; in production this would be a database table.
pub struct ProofGate {
    proofs: Arc<RwLock<HashMap<Uuid, DeliveryProof>>>,
}

impl ProofGate {
    pub fn new() -> Self {
        Self {
            proofs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Record a proof submission. No uniqueness constraint; role and order
    /// state are validated by the lifecycle before this is called.
    pub async fn submit(
        &self,
        order_id: Uuid,
        user_id: Uuid,
        kind: String,
        url: String,
    ) -> EngineResult<DeliveryProof> {
        if url.trim().is_empty() {
            return Err(EngineError::precondition("Proof URL cannot be empty"));
        }
        if kind.trim().is_empty() {
            return Err(EngineError::precondition("Proof kind cannot be empty"));
        }

        let proof = DeliveryProof::new(order_id, user_id, kind, url);
        self.proofs.write().await.insert(proof.id, proof.clone());

        info!("Proof {} submitted on order {}", proof.id, order_id);

        Ok(proof)
    }

    /// Move a pending proof to Accepted and stamp the reviewer
    pub async fn accept(
        &self,
        order_id: Uuid,
        proof_id: Uuid,
        reviewer_id: Uuid,
    ) -> EngineResult<DeliveryProof> {
        self.review(order_id, proof_id, reviewer_id, ProofStatus::Accepted)
            .await
    }

    /// Move a pending proof to Rejected and stamp the reviewer
    pub async fn reject(
        &self,
        order_id: Uuid,
        proof_id: Uuid,
        reviewer_id: Uuid,
    ) -> EngineResult<DeliveryProof> {
        self.review(order_id, proof_id, reviewer_id, ProofStatus::Rejected)
            .await
    }

    async fn review(
        &self,
        order_id: Uuid,
        proof_id: Uuid,
        reviewer_id: Uuid,
        status: ProofStatus,
    ) -> EngineResult<DeliveryProof> {
        let mut proofs = self.proofs.write().await;
        let proof = proofs
            .get_mut(&proof_id)
            .ok_or_else(|| EngineError::not_found(format!("Proof {} not found", proof_id)))?;

        if proof.order_id != order_id {
            return Err(EngineError::not_found(format!(
                "Proof {} does not belong to order {}",
                proof_id, order_id
            )));
        }
        if proof.status != ProofStatus::Pending {
            return Err(EngineError::state_conflict(
                format!("{:?}", proof.status),
                "review proof".to_string(),
                "Only pending proofs can be reviewed".to_string(),
            ));
        }

        proof.status = status;
        proof.reviewed_by_id = Some(reviewer_id);
        proof.reviewed_at = Some(Utc::now());

        info!("Proof {} reviewed as {:?}", proof_id, status);

        Ok(proof.clone())
    }

    /// Whether `user_id` has authored at least one proof on the order,
    /// with any review status
    pub async fn has_proof_from(&self, order_id: Uuid, user_id: Uuid) -> bool {
        self.proofs
            .read()
            .await
            .values()
            .any(|p| p.order_id == order_id && p.user_id == user_id)
    }

    /// All proofs submitted on an order
    pub async fn proofs_for_order(&self, order_id: Uuid) -> Vec<DeliveryProof> {
        self.proofs
            .read()
            .await
            .values()
            .filter(|p| p.order_id == order_id)
            .cloned()
            .collect()
    }

    /// Get a proof by ID
    pub async fn get_proof(&self, proof_id: Uuid) -> EngineResult<DeliveryProof> {
        self.proofs
            .read()
            .await
            .get(&proof_id)
            .cloned()
            .ok_or_else(|| EngineError::not_found(format!("Proof {} not found", proof_id)))
    }
}

impl Default for ProofGate {
    fn default() -> Self {
        Self::new()
    }
}
