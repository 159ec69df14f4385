//! Reconcile dispatcher
//!
//! Merges the three sources that can ask for a reconcile: issuer change
//! triggers from the event bridge, watch events for the managed Certificate,
//! and requeues after transient failures. Reconciles run one at a time, so
//! the Certificate is never written concurrently by the same replica.

use std::sync::Arc;

use futures::{Stream, StreamExt};
use kube::api::Api;
use kube::runtime::{watcher, WatchStreamExt};
use kube::Client;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::controller::reconcile::Provisioner;
use crate::controller::target::{CertificateTarget, ReconcileTrigger};
use crate::crd::Certificate;
use crate::retry::{Backoff, RetryConfig};
use crate::Error;

/// Watcher timeout (seconds), kept below the client read timeout so idle
/// watches are closed by the API server first
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Watch the managed Certificate and yield a trigger for every touch
///
/// Deletions count as touches so a removed Certificate is recreated. Watch
/// errors are logged and retried with the watcher's default backoff.
pub fn watch_certificate(
    client: Client,
    target: &CertificateTarget,
) -> impl Stream<Item = ReconcileTrigger> + Send + 'static {
    let api: Api<Certificate> = Api::namespaced(client, target.namespace());
    let config = watcher::Config::default()
        .fields(&format!("metadata.name={}", target.name()))
        .timeout(WATCH_TIMEOUT_SECS);

    watcher::watcher(api, config)
        .default_backoff()
        .touched_objects()
        .filter_map(|result| async move {
            match result {
                Ok(certificate) => ReconcileTrigger::for_object(&certificate),
                Err(e) => {
                    warn!(error = %e, "Certificate watch error");
                    None
                }
            }
        })
}

/// Serializes reconciles of the managed Certificate
pub struct Dispatcher<W> {
    provisioner: Arc<Provisioner>,
    triggers: mpsc::Receiver<ReconcileTrigger>,
    watch: W,
    retry: RetryConfig,
}

impl<W> Dispatcher<W>
where
    W: Stream<Item = ReconcileTrigger> + Send,
{
    /// Create a dispatcher fed by the bridge's `triggers` and a Certificate
    /// `watch` stream
    pub fn new(
        provisioner: Arc<Provisioner>,
        triggers: mpsc::Receiver<ReconcileTrigger>,
        watch: W,
    ) -> Self {
        Self {
            provisioner,
            triggers,
            watch,
            retry: RetryConfig::default(),
        }
    }

    /// Override the requeue backoff
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Run until cancelled
    ///
    /// The managed Certificate is reconciled once at startup so it exists
    /// even if no issuer change or watch event ever arrives.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), Error> {
        let Self {
            provisioner,
            mut triggers,
            watch,
            retry,
        } = self;
        let target = provisioner.target().clone();
        let mut watch = Box::pin(watch);
        let mut backoff = Backoff::new(retry);

        let mut requeue_at = Some(Instant::now());
        let mut triggers_open = true;
        let mut watch_open = true;

        info!(
            cert_name = %target.name(),
            cert_namespace = %target.namespace(),
            "Starting dynamic istiod cert dispatcher"
        );

        loop {
            let trigger = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("Received cancellation, stopping reconcile dispatcher");
                    return Ok(());
                }
                received = triggers.recv(), if triggers_open => match received {
                    Some(trigger) => trigger,
                    None => {
                        debug!("Issuer trigger channel closed");
                        triggers_open = false;
                        continue;
                    }
                },
                observed = watch.next(), if watch_open => match observed {
                    Some(trigger) => trigger,
                    None => {
                        warn!("Certificate watch ended, relying on issuer triggers only");
                        watch_open = false;
                        continue;
                    }
                },
                _ = sleep_until(requeue_at.unwrap_or_else(Instant::now)), if requeue_at.is_some() => {
                    target.trigger()
                }
            };

            if !target.matches(&trigger) {
                debug!(trigger = %trigger, "Ignoring trigger for unmanaged Certificate");
                continue;
            }

            requeue_at = None;
            match provisioner.reconcile(&trigger).await {
                Ok(outcome) => {
                    backoff.reset();
                    debug!(?outcome, "Reconcile completed");
                }
                Err(e) if e.is_retryable() => {
                    let delay = backoff.next_delay();
                    warn!(
                        error = %e,
                        attempt = backoff.attempt(),
                        retry_in_ms = delay.as_millis() as u64,
                        "Reconcile failed, requeueing"
                    );
                    requeue_at = Some(Instant::now() + delay);
                }
                Err(e) => {
                    error!(error = %e, "Reconcile failed, waiting for the next event");
                }
            }
        }
    }
}
