//! Deadline and inactivity policies
//!
//! Both policies are evaluated lazily at read time, never by a background
//! scheduler: the dispute window (48h from escrow funding) and the stale
//! auto-cancel (24h without an update). The checks are pure over an injected
//! `now` so any reader can run them and callers stay testable without clocks.

use chrono::{DateTime, Duration, Utc};

use crate::models::Order;

/// Configuration for the timer service
#[derive(Debug, Clone)]
pub struct TimerConfig {
    /// Hours the buyer has to open a dispute after escrow funding
    pub dispute_window_hours: i64,
    /// Hours of inactivity after which an active order auto-cancels
    pub stale_after_hours: i64,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            dispute_window_hours: 48,
            stale_after_hours: 24,
        }
    }
}

/// Deadline policy service
#[derive(Debug, Clone, Default)]
pub struct TimerService {
    config: TimerConfig,
}

impl TimerService {
    pub fn new(config: TimerConfig) -> Self {
        Self { config }
    }

    /// Dispute deadline for an order funded at `funded_at`
    pub fn dispute_deadline(&self, funded_at: DateTime<Utc>) -> DateTime<Utc> {
        funded_at + Duration::hours(self.config.dispute_window_hours)
    }

    /// Whether a dispute may still be opened on this order at `now`.
    /// Orders without a recorded deadline have never been funded.
    pub fn dispute_window_open(&self, order: &Order, now: DateTime<Utc>) -> bool {
        match order.buyer_dispute_deadline {
            Some(deadline) => now < deadline,
            None => false,
        }
    }

    /// Whether the stale auto-cancel policy applies to this order at `now`
    pub fn is_stale(&self, order: &Order, now: DateTime<Utc>) -> bool {
        order.status.is_active()
            && now - order.updated_at > Duration::hours(self.config.stale_after_hours)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OrderStatus;
    use uuid::Uuid;

    fn sample_order() -> Order {
        Order::new(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), 1, 1000, 100)
    }

    #[test]
    fn test_dispute_window() {
        let timers = TimerService::default();
        let now = Utc::now();
        let mut order = sample_order();

        assert!(!timers.dispute_window_open(&order, now));

        order.buyer_dispute_deadline = Some(timers.dispute_deadline(now));
        assert!(timers.dispute_window_open(&order, now));
        assert!(!timers.dispute_window_open(&order, now + Duration::hours(49)));
    }

    #[test]
    fn test_staleness() {
        let timers = TimerService::default();
        let now = Utc::now();
        let mut order = sample_order();
        order.status = OrderStatus::PaidEscrow;

        assert!(!timers.is_stale(&order, now));

        order.updated_at = now - Duration::hours(25);
        assert!(timers.is_stale(&order, now));

        // Frozen and terminal orders never auto-cancel
        order.status = OrderStatus::DisputeOpen;
        assert!(!timers.is_stale(&order, now));
        order.status = OrderStatus::Completed;
        assert!(!timers.is_stale(&order, now));
    }
}
