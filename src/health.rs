use dashmap::DashMap;
use data_model::ConnectorId;

/// Consecutive health-check failures per connector, fed by the warmup loop
/// and consumed by the config sync's auto-disable rule. A single success
/// resets the streak.
#[derive(Default)]
pub struct ConnectorHealth {
    failures: DashMap<ConnectorId, u32>,
}

impl ConnectorHealth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn report_success(&self, id: &ConnectorId) {
        self.failures.remove(id);
    }

    pub fn report_failure(&self, id: &ConnectorId) {
        *self.failures.entry(id.clone()).or_insert(0) += 1;
    }

    pub fn consecutive_failures(&self, id: &ConnectorId) -> u32 {
        self.failures.get(id).map(|f| *f).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_streaks_reset_on_success() {
        let health = ConnectorHealth::new();
        let id = ConnectorId::from("c1");
        assert_eq!(health.consecutive_failures(&id), 0);

        health.report_failure(&id);
        health.report_failure(&id);
        assert_eq!(health.consecutive_failures(&id), 2);

        health.report_success(&id);
        assert_eq!(health.consecutive_failures(&id), 0);
    }
}
