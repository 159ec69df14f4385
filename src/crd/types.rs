//! Supporting types for the cert-manager Certificate resource

use serde::{Deserialize, Serialize};

/// Reference to the cert-manager issuer that signs a certificate
///
/// Mirrors cert-manager's `ObjectReference`: `kind` and `group` are omitted
/// from the wire when empty and cert-manager applies its own defaults.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq, Hash)]
pub struct IssuerRef {
    /// Name of the issuer
    pub name: String,
    /// Kind of the issuer (`Issuer`, `ClusterIssuer`, or an external kind)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
    /// API group of the issuer
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub group: String,
}

impl IssuerRef {
    /// Create an issuer reference
    pub fn new(name: impl Into<String>, kind: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            group: group.into(),
        }
    }
}

impl std::fmt::Display for IssuerRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}/{}", self.kind, self.group, self.name)
    }
}

/// When cert-manager generates a new private key
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub enum RotationPolicy {
    /// Reuse the existing key across renewals
    Never,
    /// Generate a fresh key on every issuance
    #[default]
    Always,
}

/// Private key algorithm for the issued certificate
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[non_exhaustive]
pub enum KeyAlgorithm {
    /// RSA keys (size 2048-8192)
    #[default]
    #[serde(rename = "RSA")]
    Rsa,
    /// ECDSA keys (size 256, 384 or 521)
    #[serde(rename = "ECDSA")]
    Ecdsa,
    /// Ed25519 keys (size is ignored)
    Ed25519,
}

impl KeyAlgorithm {
    /// Whether cert-manager reads the `size` field for this algorithm
    pub fn uses_key_size(self) -> bool {
        !matches!(self, Self::Ed25519)
    }
}

impl std::str::FromStr for KeyAlgorithm {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "rsa" => Ok(Self::Rsa),
            "ecdsa" => Ok(Self::Ecdsa),
            "ed25519" => Ok(Self::Ed25519),
            _ => Err(crate::Error::config(format!(
                "invalid key algorithm: {s}, expected one of: RSA, ECDSA, Ed25519"
            ))),
        }
    }
}

impl std::fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rsa => write!(f, "RSA"),
            Self::Ecdsa => write!(f, "ECDSA"),
            Self::Ed25519 => write!(f, "Ed25519"),
        }
    }
}

/// Private key settings of a Certificate
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CertificatePrivateKey {
    /// Key rotation behaviour on renewal
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation_policy: Option<RotationPolicy>,
    /// Key algorithm
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub algorithm: Option<KeyAlgorithm>,
    /// Key size in bits (or curve size for ECDSA)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_algorithm_parses_case_insensitively() {
        assert_eq!("RSA".parse::<KeyAlgorithm>().unwrap(), KeyAlgorithm::Rsa);
        assert_eq!("ecdsa".parse::<KeyAlgorithm>().unwrap(), KeyAlgorithm::Ecdsa);
        assert_eq!(
            "ED25519".parse::<KeyAlgorithm>().unwrap(),
            KeyAlgorithm::Ed25519
        );
        assert!("dsa".parse::<KeyAlgorithm>().is_err());
    }

    #[test]
    fn key_algorithm_uses_cert_manager_spelling() {
        assert_eq!(
            serde_json::to_value(KeyAlgorithm::Rsa).unwrap(),
            serde_json::json!("RSA")
        );
        assert_eq!(
            serde_json::to_value(KeyAlgorithm::Ecdsa).unwrap(),
            serde_json::json!("ECDSA")
        );
        assert_eq!(KeyAlgorithm::Ed25519.to_string(), "Ed25519");
    }

    #[test]
    fn issuer_ref_omits_empty_kind_and_group() {
        let issuer = IssuerRef::new("istio-ca", "", "");
        assert_eq!(
            serde_json::to_value(&issuer).unwrap(),
            serde_json::json!({ "name": "istio-ca" })
        );
    }
}
