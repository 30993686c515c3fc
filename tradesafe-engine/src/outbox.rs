//! Outbox - fire-and-forget side effects decoupled from the core transaction
//!
//! Notifications and seller-stats refreshes are queued by the lifecycle
//! inside its operations and delivered afterwards by the worker with
//! at-least-once semantics. Consumer-side idempotency comes from the
//! notification dedup window; a failed delivery is logged and swallowed and
//! never rolls back the transition that queued it.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::warn;
use uuid::Uuid;

use crate::stats::SellerStatsIndexer;
use crate::EngineResult;

/// A queued notification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationRequest {
    pub user_id: Uuid,
    pub kind: String,
    pub title: String,
    pub body: String,
    pub link: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

/// A delivered notification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub user_id: Uuid,
    pub kind: String,
    pub title: String,
    pub body: String,
    pub link: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// Side effects the core queues instead of executing inline
#[derive(Debug, Clone)]
pub enum SideEffect {
    Notify(NotificationRequest),
    CompletedSale { seller_id: Uuid, amount_cents: i64 },
    ProofAccepted { seller_id: Uuid },
    DisputeOpened { seller_id: Uuid },
}

/// The pending side-effect queue
pub struct Outbox {
    queue: Arc<RwLock<VecDeque<SideEffect>>>,
}

impl Outbox {
    pub fn new() -> Self {
        Self {
            queue: Arc::new(RwLock::new(VecDeque::new())),
        }
    }

    pub async fn enqueue(&self, effect: SideEffect) {
        self.queue.write().await.push_back(effect);
    }

    pub async fn enqueue_notify(
        &self,
        user_id: Uuid,
        kind: impl Into<String>,
        title: impl Into<String>,
        body: impl Into<String>,
        link: Option<String>,
        metadata: Option<serde_json::Value>,
    ) {
        self.enqueue(SideEffect::Notify(NotificationRequest {
            user_id,
            kind: kind.into(),
            title: title.into(),
            body: body.into(),
            link,
            metadata,
        }))
        .await;
    }

    /// Take every pending effect off the queue
    pub async fn drain_all(&self) -> Vec<SideEffect> {
        self.queue.write().await.drain(..).collect()
    }

    pub async fn len(&self) -> usize {
        self.queue.read().await.len()
    }
}

impl Default for Outbox {
    fn default() -> Self {
        Self::new()
    }
}

/// Delivery target for notifications
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, request: NotificationRequest) -> EngineResult<()>;
}

/// Configuration for the in-memory sink
#[derive(Debug, Clone)]
pub struct NotificationConfig {
    /// Same user/kind/title within this window collapses to a no-op,
    /// tolerating duplicate triggers from racing requests
    pub dedup_window_secs: i64,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            dedup_window_secs: 2,
        }
    }
}

/// In-memory sink with the dedup window applied at delivery time
pub struct InMemoryNotificationSink {
    config: NotificationConfig,
    delivered: Arc<RwLock<Vec<Notification>>>,
}

impl InMemoryNotificationSink {
    pub fn new(config: NotificationConfig) -> Self {
        Self {
            config,
            delivered: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Notifications delivered to a user, oldest first
    pub async fn notifications_for(&self, user_id: Uuid) -> Vec<Notification> {
        self.delivered
            .read()
            .await
            .iter()
            .filter(|n| n.user_id == user_id)
            .cloned()
            .collect()
    }
}

impl Default for InMemoryNotificationSink {
    fn default() -> Self {
        Self::new(NotificationConfig::default())
    }
}

#[async_trait]
impl NotificationSink for InMemoryNotificationSink {
    async fn deliver(&self, request: NotificationRequest) -> EngineResult<()> {
        let now = Utc::now();
        let window = Duration::seconds(self.config.dedup_window_secs);

        let mut delivered = self.delivered.write().await;
        let duplicate = delivered.iter().any(|n| {
            n.user_id == request.user_id
                && n.kind == request.kind
                && n.title == request.title
                && now - n.created_at < window
        });
        if duplicate {
            return Ok(());
        }

        delivered.push(Notification {
            id: Uuid::new_v4(),
            user_id: request.user_id,
            kind: request.kind,
            title: request.title,
            body: request.body,
            link: request.link,
            metadata: request.metadata,
            created_at: now,
        });

        Ok(())
    }
}

/// Consumer draining the outbox into the sink and the stats indexer
pub struct OutboxWorker {
    outbox: Arc<Outbox>,
    sink: Arc<dyn NotificationSink>,
    stats: Arc<SellerStatsIndexer>,
}

impl OutboxWorker {
    pub fn new(
        outbox: Arc<Outbox>,
        sink: Arc<dyn NotificationSink>,
        stats: Arc<SellerStatsIndexer>,
    ) -> Self {
        Self {
            outbox,
            sink,
            stats,
        }
    }

    /// Deliver every pending effect. Failures are logged and swallowed.
    pub async fn drain_once(&self) -> usize {
        let effects = self.outbox.drain_all().await;
        let count = effects.len();

        for effect in effects {
            match effect {
                SideEffect::Notify(request) => {
                    if let Err(e) = self.sink.deliver(request).await {
                        warn!("Notification delivery failed: {}", e);
                    }
                }
                SideEffect::CompletedSale {
                    seller_id,
                    amount_cents,
                } => {
                    self.stats
                        .record_completed_sale(seller_id, amount_cents)
                        .await;
                }
                SideEffect::ProofAccepted { seller_id } => {
                    self.stats.record_accepted_proof(seller_id).await;
                }
                SideEffect::DisputeOpened { seller_id } => {
                    self.stats.record_dispute(seller_id).await;
                }
            }
        }

        count
    }
}
