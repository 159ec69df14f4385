//! Static configuration of the managed istiod certificate
//!
//! [`Options`] is captured once at construction and never mutated, so it is
//! shared freely between the event bridge and concurrent reconciles.

use std::time::Duration;

use clap::Args;

use crate::crd::{IssuerRef, KeyAlgorithm};
use crate::{duration, Error};

/// Default name of the managed Certificate
pub const DEFAULT_CERTIFICATE_NAME: &str = "istiod";

/// Default namespace of the managed Certificate
pub const DEFAULT_CERTIFICATE_NAMESPACE: &str = "istio-system";

/// cert-manager rejects certificates shorter than this
pub const MIN_DURATION: Duration = Duration::from_secs(60 * 60);

/// cert-manager rejects renew-before values shorter than this
pub const MIN_RENEW_BEFORE: Duration = Duration::from_secs(5 * 60);

/// Desired shape of the managed istiod certificate
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Options {
    /// Name of the Certificate resource
    pub certificate_name: String,
    /// Namespace of the Certificate resource
    pub certificate_namespace: String,
    /// Istio revisions that need a DNS SAN
    pub istio_revisions: Vec<String>,
    /// Extra DNS SANs appended after the revision names
    pub additional_dns_names: Vec<String>,
    /// Requested certificate lifetime
    pub duration: Duration,
    /// How long before expiry cert-manager renews
    pub renew_before: Duration,
    /// Private key algorithm
    pub key_algorithm: KeyAlgorithm,
    /// Private key size (ignored for Ed25519)
    pub key_size: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            certificate_name: DEFAULT_CERTIFICATE_NAME.to_string(),
            certificate_namespace: DEFAULT_CERTIFICATE_NAMESPACE.to_string(),
            istio_revisions: vec![crate::dns::DEFAULT_REVISION.to_string()],
            additional_dns_names: Vec::new(),
            duration: MIN_DURATION,
            renew_before: Duration::from_secs(30 * 60),
            key_algorithm: KeyAlgorithm::Rsa,
            key_size: 2048,
        }
    }
}

impl Options {
    /// Check the options against cert-manager's admission rules
    pub fn validate(&self) -> Result<(), Error> {
        if self.certificate_name.is_empty() {
            return Err(Error::config("istiod certificate name must not be empty"));
        }
        if self.certificate_namespace.is_empty() {
            return Err(Error::config(
                "istiod certificate namespace must not be empty",
            ));
        }
        if self.istio_revisions.iter().any(|r| r.is_empty()) {
            return Err(Error::config("istio revisions must not contain empty names"));
        }

        if self.duration < MIN_DURATION {
            return Err(Error::config(format!(
                "duration ({}) must be at least {}",
                duration::format(self.duration),
                duration::format(MIN_DURATION)
            )));
        }
        if self.renew_before < MIN_RENEW_BEFORE {
            return Err(Error::config(format!(
                "renew-before ({}) must be at least {}",
                duration::format(self.renew_before),
                duration::format(MIN_RENEW_BEFORE)
            )));
        }
        if self.renew_before >= self.duration {
            return Err(Error::config(format!(
                "renew-before ({}) must be less than duration ({})",
                duration::format(self.renew_before),
                duration::format(self.duration)
            )));
        }

        match self.key_algorithm {
            KeyAlgorithm::Rsa if !(2048..=8192).contains(&self.key_size) => {
                Err(Error::config(format!(
                    "RSA key size {} must be between 2048 and 8192",
                    self.key_size
                )))
            }
            KeyAlgorithm::Ecdsa if ![256, 384, 521].contains(&self.key_size) => {
                Err(Error::config(format!(
                    "ECDSA key size {} must be one of 256, 384, 521",
                    self.key_size
                )))
            }
            _ => Ok(()),
        }
    }
}

/// Command-line arguments describing the managed certificate
#[derive(Args, Debug, Clone)]
pub struct CertificateArgs {
    /// Name of the dynamic istiod Certificate
    #[arg(
        id = "istiod_cert_name",
        long = "istiod-cert-name",
        env = "ISTIOD_CERT_NAME",
        default_value = DEFAULT_CERTIFICATE_NAME
    )]
    pub name: String,

    /// Namespace of the dynamic istiod Certificate
    #[arg(
        long = "istiod-cert-namespace",
        env = "ISTIOD_CERT_NAMESPACE",
        default_value = DEFAULT_CERTIFICATE_NAMESPACE
    )]
    pub namespace: String,

    /// Istio revisions to generate DNS names for
    #[arg(
        long = "istiod-cert-istio-revisions",
        env = "ISTIOD_CERT_ISTIO_REVISIONS",
        value_delimiter = ',',
        default_value = "default"
    )]
    pub istio_revisions: Vec<String>,

    /// Extra DNS names added to the istiod certificate
    #[arg(
        long = "istiod-cert-additional-dns-names",
        env = "ISTIOD_CERT_ADDITIONAL_DNS_NAMES",
        value_delimiter = ','
    )]
    pub additional_dns_names: Vec<String>,

    /// Requested lifetime of the istiod certificate
    #[arg(
        long = "istiod-cert-duration",
        env = "ISTIOD_CERT_DURATION",
        default_value = "1h",
        value_parser = duration::parse
    )]
    pub duration: Duration,

    /// How long before expiry the istiod certificate is renewed
    #[arg(
        long = "istiod-cert-renew-before",
        env = "ISTIOD_CERT_RENEW_BEFORE",
        default_value = "30m",
        value_parser = duration::parse
    )]
    pub renew_before: Duration,

    /// Private key algorithm (RSA, ECDSA, Ed25519)
    #[arg(
        long = "istiod-cert-key-algorithm",
        env = "ISTIOD_CERT_KEY_ALGORITHM",
        default_value = "RSA"
    )]
    pub key_algorithm: KeyAlgorithm,

    /// Private key size
    #[arg(
        long = "istiod-cert-key-size",
        env = "ISTIOD_CERT_KEY_SIZE",
        default_value_t = 2048
    )]
    pub key_size: u32,
}

impl CertificateArgs {
    /// Convert parsed arguments into validated [`Options`]
    pub fn into_options(self) -> Result<Options, Error> {
        let options = Options {
            certificate_name: self.name,
            certificate_namespace: self.namespace,
            istio_revisions: non_empty(self.istio_revisions),
            additional_dns_names: non_empty(self.additional_dns_names),
            duration: self.duration,
            renew_before: self.renew_before,
            key_algorithm: self.key_algorithm,
            key_size: self.key_size,
        };
        options.validate()?;
        Ok(options)
    }
}

/// Drop blank entries produced by empty or trailing-comma lists
fn non_empty(items: Vec<String>) -> Vec<String> {
    items
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Command-line arguments describing the issuer used until told otherwise
#[derive(Args, Debug, Clone)]
pub struct IssuerArgs {
    /// Name of the initial issuer; without it no certificate is written until
    /// an issuer arrives through runtime configuration
    #[arg(id = "issuer_name", long = "issuer-name", env = "ISSUER_NAME")]
    pub name: Option<String>,

    /// Kind of the initial issuer
    #[arg(long = "issuer-kind", env = "ISSUER_KIND", default_value = "Issuer")]
    pub kind: String,

    /// API group of the initial issuer
    #[arg(
        long = "issuer-group",
        env = "ISSUER_GROUP",
        default_value = "cert-manager.io"
    )]
    pub group: String,
}

impl IssuerArgs {
    /// The configured initial issuer, if a name was given
    pub fn initial_issuer(&self) -> Option<IssuerRef> {
        self.name
            .as_deref()
            .filter(|name| !name.is_empty())
            .map(|name| IssuerRef::new(name, self.kind.clone(), self.group.clone()))
    }
}
