//! Seller Stats Indexer - trust statistics recomputed after trade events
//!
//! Refreshed after proof acceptance and order completion, always through the
//! outbox so a stats failure never rolls back the triggering transaction.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::SellerStats;

/// Seller statistics store.
///
/// In-memory storage; in production this would be a database projection.
pub struct SellerStatsIndexer {
    stats: Arc<RwLock<HashMap<Uuid, SellerStats>>>,
}

impl SellerStatsIndexer {
    pub fn new() -> Self {
        Self {
            stats: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Get a seller's current statistics
    pub async fn get_stats(&self, seller_id: Uuid) -> SellerStats {
        self.stats
            .read()
            .await
            .get(&seller_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Apply an update to a seller's statistics
    pub async fn update<F>(&self, seller_id: Uuid, update_fn: F)
    where
        F: FnOnce(&mut SellerStats),
    {
        let mut stats = self.stats.write().await;
        let entry = stats.entry(seller_id).or_default();
        update_fn(entry);
    }

    /// Record a completed sale
    pub async fn record_completed_sale(&self, seller_id: Uuid, amount_cents: i64) {
        self.update(seller_id, |s| {
            s.completed_sales += 1;
            s.total_cents_earned += amount_cents;
        })
        .await;
    }

    /// Record a buyer-accepted proof
    pub async fn record_accepted_proof(&self, seller_id: Uuid) {
        self.update(seller_id, |s| s.accepted_proofs += 1).await;
    }

    /// Record an opened dispute
    pub async fn record_dispute(&self, seller_id: Uuid) {
        self.update(seller_id, |s| s.disputes_total += 1).await;
    }
}

impl Default for SellerStatsIndexer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stats_accumulate() {
        let indexer = SellerStatsIndexer::new();
        let seller = Uuid::new_v4();

        indexer.record_completed_sale(seller, 9_000).await;
        indexer.record_completed_sale(seller, 1_000).await;
        indexer.record_accepted_proof(seller).await;
        indexer.record_dispute(seller).await;

        let stats = indexer.get_stats(seller).await;
        assert_eq!(stats.completed_sales, 2);
        assert_eq!(stats.total_cents_earned, 10_000);
        assert_eq!(stats.accepted_proofs, 1);
        assert_eq!(stats.disputes_total, 1);
    }
}
