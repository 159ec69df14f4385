//! Leader election using Kubernetes Leases
//!
//! The event bridge and dispatcher must run in exactly one replica, so every
//! replica first competes for a coordination.k8s.io/v1 Lease and only the
//! holder starts them.
//!
//! # Atomicity
//!
//! Uses resourceVersion for compare-and-swap semantics. If the lease changes
//! between read and write, the write fails with 409 Conflict and the attempt
//! is retried, so two replicas can never both believe they hold the lease.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::Client;
use serde_json::json;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Lease name shared by all provisioner replicas
pub const LEADER_LEASE_NAME: &str = "istiod-cert-provisioner-leader";

const LEASE_DURATION: Duration = Duration::from_secs(30);
const RENEW_INTERVAL: Duration = Duration::from_secs(10);
const RETRY_INTERVAL: Duration = Duration::from_secs(5);
const FIELD_MANAGER: &str = "istiod-cert-provisioner";

/// Leader election errors
#[derive(Debug, Error)]
pub enum LeaderElectionError {
    /// Kubernetes API error
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// The lease read back from the API server cannot be written safely
    #[error("invalid lease: {0}")]
    InvalidLease(String),

    /// Another replica took the lease or renewal kept failing
    #[error("leadership lost")]
    Lost,
}

/// Whether a lease held by someone else may be taken over at `now`
///
/// A lease without renew time or duration is treated as abandoned.
pub fn lease_expired(spec: Option<&LeaseSpec>, now: DateTime<Utc>) -> bool {
    let renew_time = spec.and_then(|s| s.renew_time.as_ref());
    let duration_secs = spec.and_then(|s| s.lease_duration_seconds);
    match (renew_time, duration_secs) {
        (Some(renewed), Some(secs)) => now > renewed.0 + chrono::Duration::seconds(secs as i64),
        _ => true,
    }
}

/// What the renewal loop does after a renewal attempt
#[derive(Debug, PartialEq, Eq)]
enum RenewalStep {
    Renewed,
    Retry,
    Lost,
}

/// Classify a renewal attempt
///
/// Another holder or a write conflict loses leadership at once. API errors
/// are retried until `deadline` has passed since the last successful renewal,
/// which must be shorter than the lease duration.
fn renewal_step(
    attempt: &Result<bool, LeaderElectionError>,
    since_last_renewal: Duration,
    deadline: Duration,
) -> RenewalStep {
    match attempt {
        Ok(true) => RenewalStep::Renewed,
        Ok(false) => RenewalStep::Lost,
        Err(_) if since_last_renewal < deadline => RenewalStep::Retry,
        Err(_) => RenewalStep::Lost,
    }
}

/// Merge patch that clears the holder and backdates the renew time
fn release_patch(now: DateTime<Utc>) -> serde_json::Value {
    let past = now - chrono::Duration::seconds(60);
    json!({
        "spec": {
            "holderIdentity": null,
            "renewTime": past.to_rfc3339()
        }
    })
}

/// Params for the release merge patch; `force` is only valid for apply patches
fn release_params() -> PatchParams {
    PatchParams {
        field_manager: Some(FIELD_MANAGER.to_string()),
        ..Default::default()
    }
}

/// What to do with the lease as read from the API server
#[derive(Debug, PartialEq, Eq)]
enum LeaseAction {
    Create,
    Renew,
    TakeOver { transitions: i32 },
    Wait,
}

fn plan(existing: Option<&Lease>, identity: &str, now: DateTime<Utc>) -> LeaseAction {
    let Some(lease) = existing else {
        return LeaseAction::Create;
    };
    let spec = lease.spec.as_ref();
    if spec.and_then(|s| s.holder_identity.as_deref()) == Some(identity) {
        return LeaseAction::Renew;
    }
    if lease_expired(spec, now) {
        LeaseAction::TakeOver {
            transitions: spec.and_then(|s| s.lease_transitions).unwrap_or(0),
        }
    } else {
        LeaseAction::Wait
    }
}

/// Leader elector using Kubernetes Leases
pub struct LeaderElector {
    client: Client,
    lease_name: String,
    namespace: String,
    identity: String,
    lease_duration: Duration,
    renew_interval: Duration,
    renew_deadline: Duration,
    retry_interval: Duration,
}

impl LeaderElector {
    /// Create a new leader elector with default timing (30s lease, 10s renew, 5s retry)
    pub fn new(client: Client, lease_name: &str, namespace: &str, identity: &str) -> Self {
        Self {
            client,
            lease_name: lease_name.to_string(),
            namespace: namespace.to_string(),
            identity: identity.to_string(),
            lease_duration: LEASE_DURATION,
            renew_interval: RENEW_INTERVAL,
            renew_deadline: LEASE_DURATION - RETRY_INTERVAL,
            retry_interval: RETRY_INTERVAL,
        }
    }

    /// Block until leadership is acquired, then return a guard
    ///
    /// The guard keeps renewing the lease. When renewal fails the guard's
    /// `lost()` future resolves.
    pub async fn acquire(self: Arc<Self>) -> LeaderGuard {
        info!(
            identity = %self.identity,
            lease = %self.lease_name,
            namespace = %self.namespace,
            "Waiting for leadership..."
        );

        loop {
            match self.try_acquire_or_renew().await {
                Ok(true) => {
                    info!(identity = %self.identity, "Leadership acquired");
                    return self.create_guard();
                }
                Ok(false) => {
                    debug!(
                        identity = %self.identity,
                        retry_secs = self.retry_interval.as_secs(),
                        "Lease held by another replica, waiting..."
                    );
                }
                Err(e) => {
                    warn!(
                        identity = %self.identity,
                        error = %e,
                        retry_secs = self.retry_interval.as_secs(),
                        "Failed to acquire lease, retrying..."
                    );
                }
            }
            tokio::time::sleep(self.retry_interval).await;
        }
    }

    fn create_guard(self: &Arc<Self>) -> LeaderGuard {
        let (lost_tx, lost_rx) = oneshot::channel();
        let elector = Arc::clone(self);
        let renewal_task = tokio::spawn(async move {
            elector.renewal_loop(lost_tx).await;
        });

        LeaderGuard {
            elector: Arc::clone(self),
            renewal: RenewalTask {
                handle: renewal_task,
            },
            lost_rx: Some(lost_rx),
        }
    }

    async fn try_acquire_or_renew(&self) -> Result<bool, LeaderElectionError> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), &self.namespace);
        let now = Utc::now();
        let existing = api.get_opt(&self.lease_name).await?;

        match plan(existing.as_ref(), &self.identity, now) {
            LeaseAction::Create => self.create_lease(&api, now).await,
            LeaseAction::Wait => Ok(false),
            LeaseAction::Renew => match existing {
                Some(lease) => self.renew_lease(&api, lease, now).await,
                None => Ok(false),
            },
            LeaseAction::TakeOver { transitions } => {
                let resource_version =
                    existing.and_then(|lease| lease.metadata.resource_version);
                self.take_over_lease(&api, resource_version, now, transitions)
                    .await
            }
        }
    }

    fn desired_lease(
        &self,
        now: DateTime<Utc>,
        resource_version: Option<String>,
        transitions: i32,
    ) -> Lease {
        Lease {
            metadata: ObjectMeta {
                name: Some(self.lease_name.clone()),
                namespace: Some(self.namespace.clone()),
                resource_version,
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.identity.clone()),
                lease_duration_seconds: Some(self.lease_duration.as_secs() as i32),
                acquire_time: Some(MicroTime(now)),
                renew_time: Some(MicroTime(now)),
                lease_transitions: Some(transitions),
                ..Default::default()
            }),
        }
    }

    async fn create_lease(
        &self,
        api: &Api<Lease>,
        now: DateTime<Utc>,
    ) -> Result<bool, LeaderElectionError> {
        let lease = self.desired_lease(now, None, 0);
        match api.create(&PostParams::default(), &lease).await {
            Ok(_) => {
                info!(identity = %self.identity, "Created new lease");
                Ok(true)
            }
            Err(kube::Error::Api(e)) if e.code == 409 => {
                debug!(identity = %self.identity, "Lease creation conflict, will retry");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn renew_lease(
        &self,
        api: &Api<Lease>,
        mut lease: Lease,
        now: DateTime<Utc>,
    ) -> Result<bool, LeaderElectionError> {
        if lease.metadata.resource_version.is_none() {
            return Err(LeaderElectionError::InvalidLease(
                "lease missing resourceVersion".to_string(),
            ));
        }
        if let Some(ref mut spec) = lease.spec {
            spec.renew_time = Some(MicroTime(now));
        }

        match api
            .replace(&self.lease_name, &PostParams::default(), &lease)
            .await
        {
            Ok(_) => {
                debug!(identity = %self.identity, "Lease renewed");
                Ok(true)
            }
            Err(kube::Error::Api(e)) if e.code == 409 => {
                warn!(identity = %self.identity, "Lease renewal conflict, lost leadership");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn take_over_lease(
        &self,
        api: &Api<Lease>,
        resource_version: Option<String>,
        now: DateTime<Utc>,
        transitions: i32,
    ) -> Result<bool, LeaderElectionError> {
        let rv = resource_version.ok_or_else(|| {
            LeaderElectionError::InvalidLease("lease missing resourceVersion".to_string())
        })?;
        let lease = self.desired_lease(now, Some(rv), transitions + 1);

        match api
            .replace(&self.lease_name, &PostParams::default(), &lease)
            .await
        {
            Ok(_) => {
                info!(
                    identity = %self.identity,
                    transitions = transitions + 1,
                    "Took over expired lease"
                );
                Ok(true)
            }
            Err(kube::Error::Api(e)) if e.code == 409 => {
                debug!(identity = %self.identity, "Lease takeover conflict, will retry");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn renewal_loop(&self, lost_tx: oneshot::Sender<()>) {
        let mut last_renewed = Instant::now();
        let mut wait = self.renew_interval;

        loop {
            tokio::time::sleep(wait).await;

            let attempt = self.try_acquire_or_renew().await;
            match renewal_step(&attempt, last_renewed.elapsed(), self.renew_deadline) {
                RenewalStep::Renewed => {
                    last_renewed = Instant::now();
                    wait = self.renew_interval;
                }
                RenewalStep::Retry => {
                    if let Err(e) = &attempt {
                        warn!(
                            identity = %self.identity,
                            error = %e,
                            retry_secs = self.retry_interval.as_secs(),
                            "Lease renewal failed, retrying before deadline"
                        );
                    }
                    wait = self.retry_interval;
                }
                RenewalStep::Lost => {
                    warn!(identity = %self.identity, "Leadership lost");
                    let _ = lost_tx.send(());
                    return;
                }
            }
        }
    }

    /// Clear the holder so a standby can take over without waiting for expiry
    async fn release_lease(&self) -> Result<(), LeaderElectionError> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), &self.namespace);

        let Some(lease) = api.get_opt(&self.lease_name).await? else {
            debug!(identity = %self.identity, "Lease not found, nothing to release");
            return Ok(());
        };

        let holder = lease.spec.as_ref().and_then(|s| s.holder_identity.as_deref());
        if holder != Some(self.identity.as_str()) {
            debug!(identity = %self.identity, "Not the lease holder, nothing to release");
            return Ok(());
        }

        api.patch(
            &self.lease_name,
            &release_params(),
            &Patch::Merge(&release_patch(Utc::now())),
        )
        .await?;

        info!(identity = %self.identity, "Lease released for fast failover");
        Ok(())
    }
}

/// Background lease renewal
struct RenewalTask {
    handle: JoinHandle<()>,
}

impl RenewalTask {
    /// Abort renewal and wait until no renewal request is in flight
    async fn stop(&mut self) {
        self.handle.abort();
        let _ = (&mut self.handle).await;
    }
}

/// Guard that maintains leadership
///
/// The renewal task is aborted when the guard is dropped.
pub struct LeaderGuard {
    elector: Arc<LeaderElector>,
    renewal: RenewalTask,
    lost_rx: Option<oneshot::Receiver<()>>,
}

impl LeaderGuard {
    /// Wait until leadership is lost
    pub async fn lost(&mut self) {
        if let Some(rx) = self.lost_rx.take() {
            let _ = rx.await;
        }
    }

    /// Release leadership by clearing the lease holder
    ///
    /// Renewal is stopped first so it cannot take the lease back. Call during
    /// graceful shutdown so a standby becomes leader immediately.
    pub async fn release_leadership(mut self) -> Result<(), LeaderElectionError> {
        self.renewal.stop().await;
        self.elector.release_lease().await
    }
}

impl Drop for LeaderGuard {
    fn drop(&mut self) {
        self.renewal.handle.abort();
        info!(identity = %self.elector.identity, "Leadership released");
    }
}
