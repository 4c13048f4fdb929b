use std::sync::atomic::{AtomicI64, Ordering};

/// Process-wide resource sums shared by every live function client. All
/// updates are deltas from concurrent clients; accuracy is eventual, a
/// registry rebalance corrects transient drift. Owned by the registry and
/// injected, never a global static.
pub struct SharedBudgets {
    min_connections: AtomicI64,
    max_connections: AtomicI64,
    used_connections: AtomicI64,
    queue_byte_budget: u64,
    high_load_threshold: f64,
}

impl SharedBudgets {
    pub fn new(queue_byte_budget: u64, high_load_threshold: f64) -> Self {
        Self {
            min_connections: AtomicI64::new(0),
            max_connections: AtomicI64::new(0),
            used_connections: AtomicI64::new(0),
            queue_byte_budget,
            high_load_threshold,
        }
    }

    pub fn register(&self, min_connections: u32, max_connections: u32) {
        self.min_connections
            .fetch_add(min_connections as i64, Ordering::AcqRel);
        self.max_connections
            .fetch_add(max_connections as i64, Ordering::AcqRel);
    }

    pub fn deregister(&self, min_connections: u32, max_connections: u32) {
        self.min_connections
            .fetch_sub(min_connections as i64, Ordering::AcqRel);
        self.max_connections
            .fetch_sub(max_connections as i64, Ordering::AcqRel);
    }

    pub fn connection_delta(&self, delta: i64) {
        self.used_connections.fetch_add(delta, Ordering::AcqRel);
    }

    pub fn min_connection_sum(&self) -> i64 {
        self.min_connections.load(Ordering::Acquire).max(0)
    }

    pub fn max_connection_sum(&self) -> i64 {
        self.max_connections.load(Ordering::Acquire).max(0)
    }

    pub fn used_connections(&self) -> i64 {
        self.used_connections.load(Ordering::Acquire).max(0)
    }

    /// Fraction of the global connection capacity currently in use.
    pub fn utilization(&self) -> f64 {
        let max = self.max_connection_sum();
        if max == 0 {
            return 0.0;
        }
        self.used_connections() as f64 / max as f64
    }

    pub fn is_high_load(&self) -> bool {
        self.utilization() > self.high_load_threshold
    }

    pub fn queue_byte_budget(&self) -> u64 {
        self.queue_byte_budget
    }

    /// A connector's priority is its share of the configured minimums.
    pub fn priority_of(&self, min_connections: u32) -> f64 {
        let sum = self.min_connection_sum();
        if sum <= 0 {
            return 0.0;
        }
        min_connections as f64 / sum as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_shares() {
        let budgets = SharedBudgets::new(1024, 0.75);
        budgets.register(4, 16);
        budgets.register(2, 8);
        assert_eq!(budgets.min_connection_sum(), 6);
        assert!((budgets.priority_of(4) - 4.0 / 6.0).abs() < 1e-9);
        assert!((budgets.priority_of(2) - 2.0 / 6.0).abs() < 1e-9);

        budgets.deregister(2, 8);
        assert!((budgets.priority_of(4) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_high_load_detection() {
        let budgets = SharedBudgets::new(1024, 0.75);
        budgets.register(1, 10);
        budgets.connection_delta(7);
        assert!(!budgets.is_high_load());
        budgets.connection_delta(1);
        assert!(budgets.is_high_load());
        budgets.connection_delta(-8);
        assert!(!budgets.is_high_load());
    }
}
