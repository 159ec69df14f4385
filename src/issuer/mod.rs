//! Active issuer tracking
//!
//! The issuer used for the istiod certificate can change at runtime. The
//! [`IssuerStateGuard`] owns the active reference behind a single lock; the
//! event bridge writes it through [`IssuerStateGuard::decide`] and every
//! reconcile reads a snapshot through [`IssuerStateGuard::current`].

mod notifier;
mod runtime_config;

pub use notifier::{IssuerBroadcaster, IssuerChangeNotifier};
pub use runtime_config::{issuer_from_config_map, watch_runtime_config, RuntimeConfigSource};

use parking_lot::Mutex;

use crate::crd::IssuerRef;

/// Result of applying an issuer notification
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IssuerDecision {
    /// The active issuer was replaced and the certificate must be reconciled
    Changed(Option<IssuerRef>),
    /// The notification cleared the issuer; the initial issuer was restored
    /// and nothing needs to be reconciled
    RestoredInitial(IssuerRef),
}

impl IssuerDecision {
    /// Whether a reconcile trigger should be emitted for this decision
    pub fn is_change(&self) -> bool {
        matches!(self, Self::Changed(_))
    }
}

/// Lock-guarded holder of the active issuer reference
///
/// The initial issuer is captured at construction and never overwritten. A
/// notification carrying no issuer reverts to it instead of leaving the
/// certificate without an issuer.
#[derive(Debug)]
pub struct IssuerStateGuard {
    initial: Option<IssuerRef>,
    active: Mutex<Option<IssuerRef>>,
}

impl IssuerStateGuard {
    /// Create a guard whose active issuer starts as `initial`
    pub fn new(initial: Option<IssuerRef>) -> Self {
        Self {
            active: Mutex::new(initial.clone()),
            initial,
        }
    }

    /// Apply an issuer notification atomically
    ///
    /// `None` with an initial issuer restores the initial issuer and reports
    /// [`IssuerDecision::RestoredInitial`]. Anything else becomes the active
    /// issuer and reports [`IssuerDecision::Changed`]; `None` is only stored
    /// when no initial issuer was ever configured.
    pub fn decide(&self, update: Option<IssuerRef>) -> IssuerDecision {
        let mut active = self.active.lock();
        match (update, &self.initial) {
            (None, Some(initial)) => {
                *active = Some(initial.clone());
                IssuerDecision::RestoredInitial(initial.clone())
            }
            (update, _) => {
                *active = update.clone();
                IssuerDecision::Changed(update)
            }
        }
    }

    /// Snapshot of the active issuer
    pub fn current(&self) -> Option<IssuerRef> {
        self.active.lock().clone()
    }

    /// The issuer configured at startup, if any
    pub fn initial(&self) -> Option<&IssuerRef> {
        self.initial.as_ref()
    }
}
