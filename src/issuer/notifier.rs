//! Issuer change notification

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use crate::crd::IssuerRef;

/// Buffered notifications per subscriber before `publish` waits
const SUBSCRIBER_BUFFER: usize = 8;

/// Source of the initial issuer and of subsequent issuer changes
///
/// Each subscription receives every published value in publication order.
/// `None` means the runtime configuration no longer names an issuer.
pub trait IssuerChangeNotifier: Send + Sync {
    /// Issuer known at startup
    fn initial_issuer(&self) -> Option<IssuerRef>;

    /// Subscribe to issuer changes published after this call
    fn subscribe_issuer_change(&self) -> mpsc::Receiver<Option<IssuerRef>>;
}

/// In-process notifier that fans issuer changes out to its subscribers
#[derive(Debug)]
pub struct IssuerBroadcaster {
    initial: Option<IssuerRef>,
    subscribers: Mutex<Vec<mpsc::Sender<Option<IssuerRef>>>>,
}

impl IssuerBroadcaster {
    /// Create a broadcaster that reports `initial` as the startup issuer
    pub fn new(initial: Option<IssuerRef>) -> Self {
        Self {
            initial,
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Deliver an issuer change to every live subscriber
    ///
    /// Waits while a subscriber's buffer is full. Subscribers whose receiver
    /// was dropped are forgotten. Returns how many subscribers received it.
    pub async fn publish(&self, issuer: Option<IssuerRef>) -> usize {
        let subscribers: Vec<_> = self.subscribers.lock().clone();

        let mut delivered = 0;
        for tx in &subscribers {
            if tx.send(issuer.clone()).await.is_ok() {
                delivered += 1;
            }
        }

        if delivered < subscribers.len() {
            self.subscribers.lock().retain(|tx| !tx.is_closed());
            debug!(
                dropped = subscribers.len() - delivered,
                "Pruned closed issuer change subscribers"
            );
        }
        delivered
    }

    /// Number of subscribers that have not been pruned yet
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

impl IssuerChangeNotifier for IssuerBroadcaster {
    fn initial_issuer(&self) -> Option<IssuerRef> {
        self.initial.clone()
    }

    fn subscribe_issuer_change(&self) -> mpsc::Receiver<Option<IssuerRef>> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.subscribers.lock().push(tx);
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issuer(name: &str) -> IssuerRef {
        IssuerRef::new(name, "ClusterIssuer", "cert-manager.io")
    }

    #[test]
    fn reports_initial_issuer() {
        let notifier = IssuerBroadcaster::new(Some(issuer("root")));
        assert_eq!(notifier.initial_issuer(), Some(issuer("root")));
        assert_eq!(IssuerBroadcaster::new(None).initial_issuer(), None);
    }

    #[tokio::test]
    async fn subscribers_receive_changes_in_order() {
        let notifier = IssuerBroadcaster::new(None);
        let mut first = notifier.subscribe_issuer_change();
        let mut second = notifier.subscribe_issuer_change();

        assert_eq!(notifier.publish(Some(issuer("a"))).await, 2);
        assert_eq!(notifier.publish(None).await, 2);
        assert_eq!(notifier.publish(Some(issuer("b"))).await, 2);

        for rx in [&mut first, &mut second] {
            assert_eq!(rx.recv().await, Some(Some(issuer("a"))));
            assert_eq!(rx.recv().await, Some(None));
            assert_eq!(rx.recv().await, Some(Some(issuer("b"))));
        }
    }

    #[tokio::test]
    async fn dropped_subscribers_are_pruned() {
        let notifier = IssuerBroadcaster::new(None);
        let mut kept = notifier.subscribe_issuer_change();
        drop(notifier.subscribe_issuer_change());
        assert_eq!(notifier.subscriber_count(), 2);

        assert_eq!(notifier.publish(Some(issuer("a"))).await, 1);
        assert_eq!(notifier.subscriber_count(), 1);
        assert_eq!(kept.recv().await, Some(Some(issuer("a"))));
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_a_no_op() {
        let notifier = IssuerBroadcaster::new(None);
        assert_eq!(notifier.publish(Some(issuer("a"))).await, 0);
    }
}
