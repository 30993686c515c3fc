//! Verification gate - seller verification-setup checks
//!
//! Gates order acceptance and the seller side of exchange confirmation.
//! The real identity/verification system lives outside the engine; this is
//! the seam it plugs into.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::EngineResult;

/// External verification lookup
#[async_trait]
pub trait VerificationGate: Send + Sync {
    async fn is_setup_complete(&self, user_id: Uuid) -> EngineResult<bool>;
}

/// Configuration for the static gate
#[derive(Debug, Clone)]
pub struct VerificationConfig {
    /// Treat every user as verified unless explicitly revoked.
    /// Dev-mode default; production wires the real verification service.
    pub default_complete: bool,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            default_complete: true,
        }
    }
}

/// In-process gate backed by explicit per-user overrides
pub struct StaticVerificationGate {
    config: VerificationConfig,
    completed: Arc<RwLock<HashSet<Uuid>>>,
    revoked: Arc<RwLock<HashSet<Uuid>>>,
}

impl StaticVerificationGate {
    pub fn new(config: VerificationConfig) -> Self {
        Self {
            config,
            completed: Arc::new(RwLock::new(HashSet::new())),
            revoked: Arc::new(RwLock::new(HashSet::new())),
        }
    }

    /// Mark a user's verification setup complete
    pub async fn mark_complete(&self, user_id: Uuid) {
        self.revoked.write().await.remove(&user_id);
        self.completed.write().await.insert(user_id);
    }

    /// Revoke a user's verification
    pub async fn revoke(&self, user_id: Uuid) {
        self.completed.write().await.remove(&user_id);
        self.revoked.write().await.insert(user_id);
    }
}

impl Default for StaticVerificationGate {
    fn default() -> Self {
        Self::new(VerificationConfig::default())
    }
}

#[async_trait]
impl VerificationGate for StaticVerificationGate {
    async fn is_setup_complete(&self, user_id: Uuid) -> EngineResult<bool> {
        if self.revoked.read().await.contains(&user_id) {
            return Ok(false);
        }
        if self.completed.read().await.contains(&user_id) {
            return Ok(true);
        }
        Ok(self.config.default_complete)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_overrides_beat_default() {
        let gate = StaticVerificationGate::new(VerificationConfig {
            default_complete: false,
        });
        let user = Uuid::new_v4();

        assert!(!gate.is_setup_complete(user).await.unwrap());
        gate.mark_complete(user).await;
        assert!(gate.is_setup_complete(user).await.unwrap());
        gate.revoke(user).await;
        assert!(!gate.is_setup_complete(user).await.unwrap());
    }
}
