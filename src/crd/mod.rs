//! Resource types owned by other operators that the provisioner writes
//!
//! The Certificate CRD is installed by cert-manager; these types only model
//! the fields the provisioner reads and writes.

mod certificate;
mod types;

pub use certificate::{Certificate, CertificateSpec};
pub use types::{CertificatePrivateKey, IssuerRef, KeyAlgorithm, RotationPolicy};
