//! istiod-cert-provisioner - keeps istiod's serving Certificate on the active issuer
//!
//! The provisioner owns a single cert-manager `Certificate` for istiod and
//! rewrites it whenever the issuer that should sign it changes at runtime.
//!
//! # Architecture
//!
//! - An [`issuer::IssuerChangeNotifier`] publishes issuer changes, typically
//!   fed by the runtime issuance ConfigMap
//! - The [`controller::EventBridge`] records each change in the shared
//!   [`issuer::IssuerStateGuard`] and hands a trigger to the dispatcher
//! - The [`controller::Dispatcher`] serializes reconciles from triggers,
//!   Certificate watch events and failure requeues
//! - The [`controller::Provisioner`] computes the desired spec and creates or
//!   replaces the Certificate
//!
//! # Modules
//!
//! - [`crd`] - cert-manager Certificate types
//! - [`controller`] - Bridge, dispatcher and reconcile logic
//! - [`issuer`] - Active issuer state and change notification
//! - [`dns`] - DNS names for istiod revisions
//! - [`options`] - Static certificate options and CLI arguments
//! - [`leader_election`] - Lease-based leader election
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod controller;
pub mod crd;
pub mod dns;
pub mod duration;
pub mod error;
pub mod issuer;
pub mod leader_election;
pub mod options;
pub mod retry;
pub mod shutdown;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
