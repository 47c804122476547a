//! What happens when the completion API fails.

use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::relay::database::{Database, DbError};
use crate::relay::telegram::Outbox;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Tell every known user about the outage, then stop the service.
    #[default]
    Shutdown,
    /// Apologize to the affected user and keep serving.
    Apologize,
}

/// Halt switch shared by the engine and the dispatcher.
///
/// Once halted, the engine drops every update and the dispatcher is asked to
/// stop. Halting happens at most once.
pub struct Supervisor {
    policy: FailurePolicy,
    halted: AtomicBool,
    halt_tx: watch::Sender<bool>,
}

impl Supervisor {
    pub fn new(policy: FailurePolicy) -> Self {
        let (halt_tx, _) = watch::channel(false);
        Self {
            policy,
            halted: AtomicBool::new(false),
            halt_tx,
        }
    }

    pub fn policy(&self) -> FailurePolicy {
        self.policy
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// Receiver that flips to `true` when the service halts.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.halt_tx.subscribe()
    }

    /// Returns `true` only for the call that actually halted.
    pub fn halt(&self) -> bool {
        if self.halted.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.halt_tx.send_replace(true);
        true
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: usize,
}

/// Send `text` to every stored user. Delivery failures are logged and skipped.
pub async fn broadcast(db: &Database, outbox: &dyn Outbox, text: &str) -> Result<BroadcastReport, DbError> {
    let user_ids = db.all_user_ids()?;
    let mut report = BroadcastReport::default();

    for user_id in user_ids {
        match outbox.send(user_id, text).await {
            Ok(()) => report.delivered += 1,
            Err(e) => {
                warn!("Broadcast to {} failed: {}", user_id, e);
                report.failed += 1;
            }
        }
    }

    info!("📢 Broadcast done: {} delivered, {} failed", report.delivered, report.failed);
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_halt_once() {
        let sup = Supervisor::new(FailurePolicy::Shutdown);
        let rx = sup.subscribe();
        assert!(!sup.is_halted());
        assert!(!*rx.borrow());

        assert!(sup.halt());
        assert!(!sup.halt());
        assert!(sup.is_halted());
        assert!(*rx.borrow());
    }

    #[tokio::test]
    async fn test_subscriber_wakes_on_halt() {
        let sup = std::sync::Arc::new(Supervisor::new(FailurePolicy::Shutdown));
        let mut rx = sup.subscribe();
        let waiter = tokio::spawn(async move { rx.wait_for(|halted| *halted).await.is_ok() });
        sup.halt();
        assert!(waiter.await.unwrap());
    }

    #[test]
    fn test_policy_deserialize() {
        let p: FailurePolicy = serde_json::from_str(r#""apologize""#).unwrap();
        assert_eq!(p, FailurePolicy::Apologize);
        assert_eq!(FailurePolicy::default(), FailurePolicy::Shutdown);
    }
}
