//! cert-manager Certificate resource
//!
//! Only the fields this provisioner manages are modelled. Replacing the spec
//! wholesale therefore clears anything else a human may have added, which is
//! the intended ownership model for the dynamic istiod certificate.

use kube::CustomResource;
use serde::{Deserialize, Serialize};

use super::types::{CertificatePrivateKey, IssuerRef};

/// Spec for a cert-manager Certificate
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[kube(
    group = "cert-manager.io",
    version = "v1",
    kind = "Certificate",
    plural = "certificates",
    namespaced,
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct CertificateSpec {
    /// Subject common name
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub common_name: String,

    /// DNS subject alternative names, in order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dns_names: Vec<String>,

    /// URI subject alternative names
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub uris: Vec<String>,

    /// Secret that cert-manager writes the signed keypair into
    pub secret_name: String,

    /// Requested certificate lifetime as a Go duration string
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,

    /// How long before expiry to renew, as a Go duration string
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub renew_before: Option<String>,

    /// Private key settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<CertificatePrivateKey>,

    /// Number of CertificateRequest revisions kept in history
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision_history_limit: Option<i32>,

    /// Issuer that signs the certificate
    pub issuer_ref: IssuerRef,
}
