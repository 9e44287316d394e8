//! Operator notifications.
//!
//! Alerts are queued during a tick and drained by the dispatcher, which
//! logs them at error level. Delivery beyond the log (mail, paging) is up
//! to whoever drains the queue.

use std::sync::{Arc, Mutex};

use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alert {
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Clone, Default)]
pub struct AdminAlerts {
    queue: Arc<Mutex<Vec<Alert>>>,
}

impl AdminAlerts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, subject: impl Into<String>, body: impl Into<String>) {
        let alert = Alert {
            subject: subject.into(),
            body: body.into(),
        };
        warn!(subject = %alert.subject, "operator alert queued");
        self.queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(alert);
    }

    pub fn drain(&self) -> Vec<Alert> {
        std::mem::take(
            &mut *self
                .queue
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        )
    }

    pub fn len(&self) -> usize {
        self.queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_the_queue() {
        let alerts = AdminAlerts::new();
        let other = alerts.clone();
        other.enqueue("Results repository error", "rsync failed");

        assert_eq!(alerts.len(), 1);
        let drained = alerts.drain();
        assert_eq!(drained[0].subject, "Results repository error");
        assert!(other.is_empty());
    }
}
