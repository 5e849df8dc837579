//! Node-labels handler (spec §4.4).
//!
//! Two variants share one capability set. `Centralized` is a no-op: labels are
//! assigned by the controller out of band. `Distributed` consults a local
//! label provider and negotiates acceptance with the controller.

use std::collections::HashSet;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{error, info};

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_millis() as i64
}

/// Syntax rule for a node label name: non-empty, ASCII alphanumeric plus `-`/`_`,
/// no leading digit.
fn is_valid_label(label: &str) -> bool {
    !label.is_empty()
        && label.chars().next().map(|c| !c.is_ascii_digit()).unwrap_or(false)
        && label
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Something that knows which labels this node should currently advertise.
/// Stands in for the out-of-scope "node-label providers" collaborator of §1.
pub trait LabelProvider: Send + Sync {
    fn current_labels(&self) -> HashSet<String>;
}

/// A label provider returning a fixed, operator-configured set.
pub struct StaticLabelProvider {
    labels: HashSet<String>,
}

impl StaticLabelProvider {
    pub fn new(labels: HashSet<String>) -> Self {
        Self { labels }
    }
}

impl LabelProvider for StaticLabelProvider {
    fn current_labels(&self) -> HashSet<String> {
        self.labels.clone()
    }
}

/// The capability set shared by both label-handler variants.
pub trait NodeLabelsHandler: Send + Sync {
    /// Labels to attach to the registration request, or `None` to send none.
    fn labels_for_registration(&mut self) -> Option<HashSet<String>>;
    /// Labels to attach to the next heartbeat, or `None` to send none.
    fn labels_for_heartbeat(&mut self) -> Option<HashSet<String>>;
    /// Process the controller's acceptance flag for the labels just sent.
    fn verify_registration_ack(&mut self, accepted: Option<bool>, diagnostics: &str);
    /// Process the controller's acceptance flag for a heartbeat round.
    fn verify_heartbeat_ack(&mut self, accepted: Option<bool>, diagnostics: &str);
}

/// Centralized mode: the controller assigns labels; this node never sends any.
pub struct CentralizedLabelsHandler;

impl NodeLabelsHandler for CentralizedLabelsHandler {
    fn labels_for_registration(&mut self) -> Option<HashSet<String>> {
        None
    }

    fn labels_for_heartbeat(&mut self) -> Option<HashSet<String>> {
        None
    }

    fn verify_registration_ack(&mut self, _accepted: Option<bool>, _diagnostics: &str) {}

    fn verify_heartbeat_ack(&mut self, _accepted: Option<bool>, _diagnostics: &str) {}
}

/// Distributed mode: this node computes its own labels via a `LabelProvider`.
pub struct DistributedLabelsHandler {
    provider: Box<dyn LabelProvider>,
    resync_interval_ms: i64,
    previous: HashSet<String>,
    last_send_ms: i64,
    sent_last_round: bool,
}

impl DistributedLabelsHandler {
    pub fn new(provider: Box<dyn LabelProvider>, resync_interval_ms: i64) -> Self {
        Self {
            provider,
            resync_interval_ms,
            previous: HashSet::new(),
            last_send_ms: 0,
            sent_last_round: false,
        }
    }

    fn changed(&self, candidate: &HashSet<String>) -> bool {
        candidate.len() != self.previous.len() || !self.previous.is_superset(candidate)
    }

    fn resync_elapsed(&self) -> bool {
        now_ms() - self.last_send_ms >= self.resync_interval_ms
    }

    fn compute(&mut self) -> Option<HashSet<String>> {
        let candidate = self.provider.current_labels();

        if !(self.changed(&candidate) || self.resync_elapsed()) {
            self.sent_last_round = false;
            return None;
        }

        if let Some(bad) = candidate.iter().find(|l| !is_valid_label(l)) {
            error!(label = %bad, "rejecting invalid node label, keeping previously accepted set");
            self.sent_last_round = false;
            return None;
        }

        self.previous = candidate.clone();
        self.sent_last_round = true;
        self.last_send_ms = now_ms();
        Some(candidate)
    }

    fn verify(&self, accepted: Option<bool>, diagnostics: &str) {
        if !self.sent_last_round {
            return;
        }
        match accepted {
            Some(true) => info!("node labels accepted by controller"),
            Some(false) | None => {
                error!(diagnostics = %diagnostics, "node labels rejected by controller")
            }
        }
    }
}

impl NodeLabelsHandler for DistributedLabelsHandler {
    fn labels_for_registration(&mut self) -> Option<HashSet<String>> {
        self.compute()
    }

    fn labels_for_heartbeat(&mut self) -> Option<HashSet<String>> {
        self.compute()
    }

    fn verify_registration_ack(&mut self, accepted: Option<bool>, diagnostics: &str) {
        self.verify(accepted, diagnostics);
    }

    fn verify_heartbeat_ack(&mut self, accepted: Option<bool>, diagnostics: &str) {
        self.verify(accepted, diagnostics);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(items: &[&str]) -> HashSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn centralized_never_sends_labels() {
        let mut h = CentralizedLabelsHandler;
        assert!(h.labels_for_registration().is_none());
        assert!(h.labels_for_heartbeat().is_none());
    }

    #[test]
    fn distributed_sends_on_first_change() {
        let provider = StaticLabelProvider::new(labels(&["gpu"]));
        let mut h = DistributedLabelsHandler::new(Box::new(provider), 60_000);
        assert_eq!(h.labels_for_heartbeat(), Some(labels(&["gpu"])));
    }

    #[test]
    fn distributed_silent_on_unchanged_within_resync_window() {
        let provider = StaticLabelProvider::new(labels(&["gpu"]));
        let mut h = DistributedLabelsHandler::new(Box::new(provider), 60_000);
        assert!(h.labels_for_heartbeat().is_some());
        // Same labels again, well within the resync window.
        assert_eq!(h.labels_for_heartbeat(), None, "S6/property 6: no-change must be silent");
    }

    #[test]
    fn distributed_does_not_resend_after_a_negative_ack() {
        let provider = StaticLabelProvider::new(labels(&["gpu"]));
        let mut h = DistributedLabelsHandler::new(Box::new(provider), 60_000);

        assert_eq!(h.labels_for_heartbeat(), Some(labels(&["gpu"])));
        h.verify_heartbeat_ack(Some(false), "rejected by controller policy");

        // S6: a negative ack must not trigger a resend on the next tick,
        // only an actual label change or the resync interval elapsing would.
        assert_eq!(h.labels_for_heartbeat(), None, "S6: rejected ack must not cause a resend of unchanged labels");
    }

    #[test]
    fn distributed_rejects_invalid_label_keeps_previous() {
        struct BadThenGood {
            calls: std::cell::RefCell<u32>,
        }
        impl LabelProvider for BadThenGood {
            fn current_labels(&self) -> HashSet<String> {
                *self.calls.borrow_mut() += 1;
                labels(&["1bad"])
            }
        }
        let mut h = DistributedLabelsHandler::new(
            Box::new(BadThenGood { calls: std::cell::RefCell::new(0) }),
            60_000,
        );
        assert_eq!(h.labels_for_heartbeat(), None);
        assert!(h.previous.is_empty(), "invalid label must not update previously-accepted set");
    }

    #[test]
    fn valid_label_syntax() {
        assert!(is_valid_label("gpu"));
        assert!(is_valid_label("rack-12"));
        assert!(!is_valid_label("1bad"));
        assert!(!is_valid_label(""));
        assert!(!is_valid_label("bad label"));
    }
}
