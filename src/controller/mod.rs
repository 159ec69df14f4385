//! Controller for the dynamic istiod Certificate
//!
//! Issuer changes flow through the [`EventBridge`] into the [`Dispatcher`],
//! which serializes reconciles performed by the [`Provisioner`].

mod bridge;
mod client;
mod dispatch;
mod reconcile;
mod target;

pub use bridge::EventBridge;
pub use client::{CertificateClient, CertificateClientImpl};
pub use dispatch::{watch_certificate, Dispatcher};
pub use reconcile::{
    desired_certificate_spec, spiffe_id, Provisioner, ReconcileOutcome, ISTIOD_SECRET_NAME,
    ISTIOD_SERVICE_ACCOUNT, REVISION_HISTORY_LIMIT, TRIGGER_CHANNEL_CAPACITY,
};
pub use target::{CertificateTarget, ReconcileTrigger};
