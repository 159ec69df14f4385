//! Identity of the single Certificate a provisioner owns

use kube::ResourceExt;

use crate::crd::Certificate;
use crate::options::Options;

/// Request to converge a Certificate, identified only by namespace and name
///
/// Triggers carry no desired state. Reconciles always re-read the active
/// issuer and options, so a stale trigger can never apply stale data.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ReconcileTrigger {
    /// Namespace of the Certificate
    pub namespace: String,
    /// Name of the Certificate
    pub name: String,
}

impl ReconcileTrigger {
    /// Trigger for an observed Certificate, if it carries a namespace
    pub fn for_object(certificate: &Certificate) -> Option<Self> {
        Some(Self {
            namespace: certificate.namespace()?,
            name: certificate.name_any(),
        })
    }
}

impl std::fmt::Display for ReconcileTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// The one Certificate identity a provisioner instance is allowed to mutate
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CertificateTarget {
    namespace: String,
    name: String,
}

impl CertificateTarget {
    /// Create a target identity
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Target named by the configured options
    pub fn from_options(options: &Options) -> Self {
        Self::new(
            options.certificate_namespace.clone(),
            options.certificate_name.clone(),
        )
    }

    /// Namespace of the managed Certificate
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Name of the managed Certificate
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Selectivity predicate: only the managed identity may be reconciled
    pub fn matches(&self, trigger: &ReconcileTrigger) -> bool {
        trigger.name == self.name && trigger.namespace == self.namespace
    }

    /// A trigger for this target
    pub fn trigger(&self) -> ReconcileTrigger {
        ReconcileTrigger {
            namespace: self.namespace.clone(),
            name: self.name.clone(),
        }
    }
}
