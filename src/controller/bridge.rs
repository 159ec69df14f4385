//! Event bridge from issuer notifications to reconcile triggers
//!
//! The bridge is the single consumer of issuer change notifications, so
//! changes are applied to the [`IssuerStateGuard`] strictly in arrival order.
//! Each accepted change is queued on a single-slot channel before the next
//! notification is read. The bridge can therefore run at most one trigger
//! ahead of the dispatcher and then waits, which couples notification
//! throughput to reconcile throughput. The hand-off gives way to
//! cancellation so shutdown never blocks on a dispatcher that stopped
//! consuming.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::controller::target::{CertificateTarget, ReconcileTrigger};
use crate::crd::IssuerRef;
use crate::issuer::{IssuerDecision, IssuerStateGuard};
use crate::Error;

/// Forwards accepted issuer changes as reconcile triggers
pub struct EventBridge {
    issuer: Arc<IssuerStateGuard>,
    notifications: mpsc::Receiver<Option<IssuerRef>>,
    triggers: mpsc::Sender<ReconcileTrigger>,
    target: CertificateTarget,
}

impl EventBridge {
    /// Create a bridge for the managed `target`
    pub fn new(
        issuer: Arc<IssuerStateGuard>,
        notifications: mpsc::Receiver<Option<IssuerRef>>,
        triggers: mpsc::Sender<ReconcileTrigger>,
        target: CertificateTarget,
    ) -> Self {
        Self {
            issuer,
            notifications,
            triggers,
            target,
        }
    }

    /// The bridge must only run in one replica
    ///
    /// Two active bridges would both converge the same Certificate and race
    /// each other's creates.
    pub fn needs_leader_election(&self) -> bool {
        true
    }

    /// Run until cancelled
    ///
    /// Returns `Ok(())` on cancellation or when the notifier goes away, and an
    /// error if the dispatcher dropped its end of the trigger channel.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), Error> {
        loop {
            let update = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("Received cancellation, shutting down dynamic istiod cert provisioner");
                    return Ok(());
                }
                update = self.notifications.recv() => match update {
                    Some(update) => update,
                    None => {
                        info!("Issuer change notifier closed; no further issuer changes");
                        return Ok(());
                    }
                },
            };

            if !self.handle_new_issuer(update, &cancel).await? {
                return Ok(());
            }
        }
    }

    /// Apply one notification and forward a trigger if it changed anything
    ///
    /// Returns `false` when cancellation interrupted the hand-off.
    async fn handle_new_issuer(
        &self,
        update: Option<IssuerRef>,
        cancel: &CancellationToken,
    ) -> Result<bool, Error> {
        match self.issuer.decide(update) {
            IssuerDecision::RestoredInitial(initial) => {
                info!(
                    issuer_name = %initial.name,
                    issuer_kind = %initial.kind,
                    issuer_group = %initial.group,
                    "Issuer cleared, keeping initial issuer"
                );
                return Ok(true);
            }
            IssuerDecision::Changed(Some(issuer)) => info!(
                issuer_name = %issuer.name,
                issuer_kind = %issuer.kind,
                issuer_group = %issuer.group,
                cert_name = %self.target.name(),
                cert_namespace = %self.target.namespace(),
                "Triggering reconciliation of istiod cert after issuer change"
            ),
            IssuerDecision::Changed(None) => info!(
                cert_name = %self.target.name(),
                cert_namespace = %self.target.namespace(),
                "Issuer cleared with no initial issuer, triggering reconciliation"
            ),
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("Shutdown during trigger hand-off, dropping trigger");
                Ok(false)
            }
            sent = self.triggers.send(self.target.trigger()) => match sent {
                Ok(()) => Ok(true),
                Err(_) => {
                    warn!("Reconcile dispatcher stopped accepting triggers");
                    Err(Error::watch("reconcile trigger channel closed"))
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn issuer(name: &str) -> IssuerRef {
        IssuerRef::new(name, "Issuer", "cert-manager.io")
    }

    struct Harness {
        guard: Arc<IssuerStateGuard>,
        notify: mpsc::Sender<Option<IssuerRef>>,
        triggers: mpsc::Receiver<ReconcileTrigger>,
        bridge: EventBridge,
    }

    fn harness(initial: Option<IssuerRef>) -> Harness {
        let guard = Arc::new(IssuerStateGuard::new(initial));
        let (notify, notifications) = mpsc::channel(8);
        let (trigger_tx, triggers) = mpsc::channel(1);
        let bridge = EventBridge::new(
            Arc::clone(&guard),
            notifications,
            trigger_tx,
            CertificateTarget::new("istio-system", "istiod"),
        );
        Harness {
            guard,
            notify,
            triggers,
            bridge,
        }
    }

    #[test]
    fn bridge_requires_singleton_execution() {
        let h = harness(None);
        assert!(h.bridge.needs_leader_election());
    }

    /// Story: an issuer change becomes a trigger for the managed identity
    #[tokio::test]
    async fn story_accepted_change_emits_trigger() {
        let mut h = harness(Some(issuer("initial")));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(h.bridge.run(cancel.clone()));

        h.notify.send(Some(issuer("runtime"))).await.unwrap();
        let trigger = h.triggers.recv().await.unwrap();
        assert_eq!(trigger, CertificateTarget::new("istio-system", "istiod").trigger());
        assert_eq!(h.guard.current(), Some(issuer("runtime")));

        cancel.cancel();
        assert!(task.await.unwrap().is_ok());
    }

    /// Story: clearing the issuer falls back to the initial one silently
    #[tokio::test]
    async fn story_restore_to_initial_emits_nothing() {
        let mut h = harness(Some(issuer("initial")));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(h.bridge.run(cancel.clone()));

        h.notify.send(Some(issuer("runtime"))).await.unwrap();
        h.triggers.recv().await.unwrap();

        h.notify.send(None).await.unwrap();
        h.notify.send(Some(issuer("later"))).await.unwrap();

        // The only trigger after the restore is for "later"
        h.triggers.recv().await.unwrap();
        assert_eq!(h.guard.current(), Some(issuer("later")));
        assert!(h.triggers.try_recv().is_err());

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    /// Story: notifications apply in order; the last one wins
    #[tokio::test]
    async fn story_sequential_updates_end_at_last_value() {
        let mut h = harness(None);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(h.bridge.run(cancel.clone()));

        h.notify.send(Some(issuer("a"))).await.unwrap();
        h.notify.send(Some(issuer("b"))).await.unwrap();
        h.triggers.recv().await.unwrap();
        h.triggers.recv().await.unwrap();
        assert_eq!(h.guard.current(), Some(issuer("b")));

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    /// Story: a stalled dispatcher does not prevent shutdown
    #[tokio::test]
    async fn story_blocked_hand_off_respects_cancellation() {
        let h = harness(None);
        let cancel = CancellationToken::new();
        // Keep the receiver alive but never read from it
        let _stalled = h.triggers;
        let task = tokio::spawn(h.bridge.run(cancel.clone()));

        // First trigger fills the single slot, second one blocks
        h.notify.send(Some(issuer("a"))).await.unwrap();
        h.notify.send(Some(issuer("b"))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!task.is_finished());

        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("bridge should stop promptly");
        assert!(result.unwrap().is_ok());
    }

    #[tokio::test]
    async fn closed_notifier_ends_the_bridge() {
        let h = harness(None);
        drop(h.notify);
        let result = h.bridge.run(CancellationToken::new()).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn dropped_dispatcher_is_an_error() {
        let h = harness(None);
        drop(h.triggers);
        h.notify.send(Some(issuer("a"))).await.unwrap();
        let result = h.bridge.run(CancellationToken::new()).await;
        assert!(matches!(result, Err(Error::Watch(_))));
    }
}
