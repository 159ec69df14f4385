//! Certificate store access

use async_trait::async_trait;
use kube::api::{Api, PostParams};
use kube::{Client, ResourceExt};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::crd::Certificate;
use crate::Error;

/// Trait abstracting Kubernetes operations on cert-manager Certificates
///
/// This trait allows mocking the Kubernetes client in tests while using
/// the real client in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CertificateClient: Send + Sync {
    /// Get a Certificate, `None` if it does not exist
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Certificate>, Error>;

    /// Create a Certificate
    async fn create(&self, certificate: &Certificate) -> Result<(), Error>;

    /// Replace a Certificate
    ///
    /// The object must carry the resourceVersion it was read with; a
    /// concurrent modification fails with a conflict.
    async fn update(&self, certificate: &Certificate) -> Result<(), Error>;
}

/// Real Kubernetes client implementation
pub struct CertificateClientImpl {
    client: Client,
}

impl CertificateClientImpl {
    /// Create a new CertificateClientImpl wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api_for(&self, certificate: &Certificate) -> Result<Api<Certificate>, Error> {
        let namespace = certificate.namespace().ok_or_else(|| {
            Error::validation(format!(
                "Certificate {} has no namespace",
                certificate.name_any()
            ))
        })?;
        Ok(Api::namespaced(self.client.clone(), &namespace))
    }
}

#[async_trait]
impl CertificateClient for CertificateClientImpl {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Certificate>, Error> {
        let api: Api<Certificate> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create(&self, certificate: &Certificate) -> Result<(), Error> {
        let api = self.api_for(certificate)?;
        api.create(&PostParams::default(), certificate).await?;
        debug!(cert_name = %certificate.name_any(), "Certificate created");
        Ok(())
    }

    async fn update(&self, certificate: &Certificate) -> Result<(), Error> {
        let api = self.api_for(certificate)?;
        let name = certificate.name_any();
        api.replace(&name, &PostParams::default(), certificate)
            .await?;
        debug!(cert_name = %name, "Certificate replaced");
        Ok(())
    }
}
