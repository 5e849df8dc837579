//! Keep-alive tracker (spec §3, §4.3, §8 property 5).
//!
//! Extends a running application's credentials past their nominal expiry by
//! periodically re-sending a keep-alive for each app still live.

use crate::model::ApplicationId;
use rand::Rng;
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_millis() as i64
}

/// `nextSendEpochMs = now + (0.7 + 0.2*r)*tokenRemovalDelayMs`, r in [0, 1).
fn next_send_at(now: i64, token_removal_delay_ms: i64) -> i64 {
    let r: f64 = rand::thread_rng().gen();
    let factor = 0.7 + 0.2 * r;
    now + (factor * token_removal_delay_ms as f64) as i64
}

pub struct KeepAliveTracker {
    enabled: bool,
    token_removal_delay_ms: i64,
    next_send: HashMap<ApplicationId, i64>,
}

impl KeepAliveTracker {
    /// Keep-alive is enabled iff log-aggregation is enabled *and* security is
    /// enabled (spec §4.3).
    pub fn new(log_aggregation_enabled: bool, security_enabled: bool, token_removal_delay_ms: i64) -> Self {
        Self {
            enabled: log_aggregation_enabled && security_enabled,
            token_removal_delay_ms,
            next_send: HashMap::new(),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Register a newly observed live application, scheduling its first
    /// keep-alive send.
    pub fn track(&mut self, app: ApplicationId) {
        if !self.enabled {
            return;
        }
        self.next_send
            .entry(app)
            .or_insert_with(|| next_send_at(now_ms(), self.token_removal_delay_ms));
    }

    /// Drop any tracked app not present in `live_apps`.
    pub fn retain_live<'a>(&mut self, live_apps: impl Iterator<Item = &'a ApplicationId>) {
        let live: std::collections::HashSet<&ApplicationId> = live_apps.collect();
        self.next_send.retain(|app, _| live.contains(app));
    }

    /// Produce the list of apps whose keep-alive is due this tick, rescheduling
    /// each one. Returns an empty list when keep-alive is disabled.
    pub fn due_applications(&mut self) -> Vec<ApplicationId> {
        if !self.enabled {
            return Vec::new();
        }
        let now = now_ms();
        let due: Vec<ApplicationId> = self
            .next_send
            .iter()
            .filter(|(_, &t)| t <= now)
            .map(|(app, _)| app.clone())
            .collect();
        for app in &due {
            self.next_send
                .insert(app.clone(), next_send_at(now, self.token_removal_delay_ms));
        }
        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app(id: u32) -> ApplicationId {
        ApplicationId { cluster_timestamp: 1, id }
    }

    #[test]
    fn disabled_when_log_aggregation_off() {
        let tracker = KeepAliveTracker::new(false, true, 10_000);
        assert!(!tracker.enabled());
    }

    #[test]
    fn disabled_tracker_returns_empty_list() {
        let mut tracker = KeepAliveTracker::new(false, true, 10_000);
        tracker.track(app(1));
        assert!(tracker.due_applications().is_empty());
    }

    #[test]
    fn next_send_bounds_hold() {
        let d = 100_000i64;
        let now = 0i64;
        for _ in 0..200 {
            let t = next_send_at(now, d);
            let lower = (0.7 * d as f64) as i64;
            let upper = (0.9 * d as f64) as i64;
            assert!(t >= now + lower, "t={} lower={}", t, lower);
            assert!(t < now + upper, "t={} upper={}", t, upper);
        }
    }

    #[test]
    fn retain_live_drops_dead_apps() {
        let mut tracker = KeepAliveTracker::new(true, true, 10_000);
        tracker.track(app(1));
        tracker.track(app(2));
        let live = vec![app(1)];
        tracker.retain_live(live.iter());
        assert_eq!(tracker.next_send.len(), 1);
        assert!(tracker.next_send.contains_key(&app(1)));
    }
}
