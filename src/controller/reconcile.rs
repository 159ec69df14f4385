//! Desired state and convergence of the dynamic istiod Certificate
//!
//! A reconcile reads the active issuer, computes the complete desired spec
//! from it and the static options, then creates the Certificate or replaces
//! its spec wholesale. Every field the provisioner owns is written on every
//! update, so repeated reconciles with unchanged inputs are no-ops for the
//! API server.

use std::sync::Arc;

use kube::api::ObjectMeta;
use tokio::sync::mpsc;
use tracing::{info, instrument};

use crate::controller::bridge::EventBridge;
use crate::controller::client::CertificateClient;
use crate::controller::target::{CertificateTarget, ReconcileTrigger};
use crate::crd::{Certificate, CertificatePrivateKey, CertificateSpec, IssuerRef, RotationPolicy};
use crate::issuer::{IssuerChangeNotifier, IssuerStateGuard};
use crate::options::Options;
use crate::{dns, duration, Error};

/// Secret cert-manager writes the istiod keypair into
pub const ISTIOD_SECRET_NAME: &str = "istiod-tls";

/// Service account istiod runs as, embedded in its SPIFFE identity
pub const ISTIOD_SERVICE_ACCOUNT: &str = "istiod-service-account";

/// CertificateRequest revisions kept by cert-manager
pub const REVISION_HISTORY_LIMIT: i32 = 1;

/// Capacity of the trigger hand-off between the event bridge and dispatcher
///
/// One slot is the closest tokio gets to an unbuffered channel: the bridge
/// cannot run more than one trigger ahead of the dispatcher.
pub const TRIGGER_CHANNEL_CAPACITY: usize = 1;

/// SPIFFE identity of istiod in `namespace`
pub fn spiffe_id(trust_domain: &str, namespace: &str) -> String {
    format!("spiffe://{trust_domain}/ns/{namespace}/sa/{ISTIOD_SERVICE_ACCOUNT}")
}

/// Build the desired Certificate spec
///
/// Pure function of its inputs: the same issuer, options and namespace always
/// produce the same spec.
pub fn desired_certificate_spec(
    options: &Options,
    trust_domain: &str,
    namespace: &str,
    issuer: &IssuerRef,
) -> CertificateSpec {
    let (common_name, dns_names) = dns::compute_names(
        namespace,
        &options.istio_revisions,
        &options.additional_dns_names,
    );

    CertificateSpec {
        common_name,
        dns_names,
        uris: vec![spiffe_id(trust_domain, namespace)],
        secret_name: ISTIOD_SECRET_NAME.to_string(),
        duration: Some(duration::format(options.duration)),
        renew_before: Some(duration::format(options.renew_before)),
        private_key: Some(CertificatePrivateKey {
            rotation_policy: Some(RotationPolicy::Always),
            algorithm: Some(options.key_algorithm),
            size: options
                .key_algorithm
                .uses_key_size()
                .then_some(options.key_size),
        }),
        revision_history_limit: Some(REVISION_HISTORY_LIMIT),
        issuer_ref: issuer.clone(),
    }
}

/// What a successful reconcile did
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// No issuer is active yet; nothing was written
    NoIssuer,
    /// The Certificate did not exist and was created
    Created,
    /// The existing Certificate's spec was replaced
    Updated,
}

/// Keeps the dynamic istiod Certificate converged with the active issuer
pub struct Provisioner {
    options: Options,
    target: CertificateTarget,
    issuer: Arc<IssuerStateGuard>,
    certificates: Arc<dyn CertificateClient>,
    trust_domain: String,
}

impl Provisioner {
    /// Create a provisioner whose active issuer starts at the notifier's
    /// initial issuer
    pub fn new(
        options: Options,
        notifier: &dyn IssuerChangeNotifier,
        certificates: Arc<dyn CertificateClient>,
        trust_domain: impl Into<String>,
    ) -> Self {
        Self {
            target: CertificateTarget::from_options(&options),
            issuer: Arc::new(IssuerStateGuard::new(notifier.initial_issuer())),
            options,
            certificates,
            trust_domain: trust_domain.into(),
        }
    }

    /// The Certificate identity this provisioner owns
    pub fn target(&self) -> &CertificateTarget {
        &self.target
    }

    /// Shared issuer state
    pub fn issuer_state(&self) -> &Arc<IssuerStateGuard> {
        &self.issuer
    }

    /// Subscribe to `notifier` and build the bridge feeding reconcile triggers
    ///
    /// Returns the bridge and the receiving end of the trigger hand-off.
    pub fn event_bridge(
        &self,
        notifier: &dyn IssuerChangeNotifier,
    ) -> (EventBridge, mpsc::Receiver<ReconcileTrigger>) {
        let (tx, rx) = mpsc::channel(TRIGGER_CHANNEL_CAPACITY);
        let bridge = EventBridge::new(
            Arc::clone(&self.issuer),
            notifier.subscribe_issuer_change(),
            tx,
            self.target.clone(),
        );
        (bridge, rx)
    }

    /// Converge the Certificate identified by `trigger`
    #[instrument(skip(self), fields(cert_namespace = %trigger.namespace, cert_name = %trigger.name))]
    pub async fn reconcile(&self, trigger: &ReconcileTrigger) -> Result<ReconcileOutcome, Error> {
        let Some(issuer) = self.issuer.current() else {
            info!("Exiting reconcile of dynamic istiod cert early; no issuer is set");
            return Ok(ReconcileOutcome::NoIssuer);
        };

        info!(
            issuer_name = %issuer.name,
            issuer_kind = %issuer.kind,
            issuer_group = %issuer.group,
            "Reconciling dynamic istiod cert"
        );

        let desired = desired_certificate_spec(
            &self.options,
            &self.trust_domain,
            &trigger.namespace,
            &issuer,
        );

        match self
            .certificates
            .get(&trigger.namespace, &trigger.name)
            .await?
        {
            None => {
                let certificate = Certificate {
                    metadata: ObjectMeta {
                        name: Some(trigger.name.clone()),
                        namespace: Some(trigger.namespace.clone()),
                        ..Default::default()
                    },
                    spec: desired,
                };
                self.certificates.create(&certificate).await?;
                info!(outcome = "created", "Dynamic istiod cert created");
                Ok(ReconcileOutcome::Created)
            }
            Some(mut certificate) => {
                certificate.spec = desired;
                self.certificates.update(&certificate).await?;
                info!(outcome = "updated", "Dynamic istiod cert updated");
                Ok(ReconcileOutcome::Updated)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::client::MockCertificateClient;
    use crate::crd::KeyAlgorithm;
    use crate::issuer::IssuerBroadcaster;
    use std::time::Duration;

    fn issuer(name: &str) -> IssuerRef {
        IssuerRef::new(name, "Issuer", "cert-manager.io")
    }

    fn options() -> Options {
        Options {
            istio_revisions: vec!["default".to_string(), "canary".to_string()],
            additional_dns_names: vec!["istiod.example.com".to_string()],
            ..Default::default()
        }
    }

    fn provisioner(initial: Option<IssuerRef>, client: MockCertificateClient) -> Provisioner {
        let notifier = IssuerBroadcaster::new(initial);
        Provisioner::new(options(), &notifier, Arc::new(client), "cluster.local")
    }

    fn existing_certificate() -> Certificate {
        let mut cert = Certificate::new(
            "istiod",
            CertificateSpec {
                common_name: "stale".to_string(),
                secret_name: "old-secret".to_string(),
                issuer_ref: issuer("old"),
                ..Default::default()
            },
        );
        cert.metadata.namespace = Some("istio-system".to_string());
        cert.metadata.resource_version = Some("17".to_string());
        cert
    }

    fn trigger() -> ReconcileTrigger {
        CertificateTarget::new("istio-system", "istiod").trigger()
    }

    mod desired_state {
        use super::*;

        #[test]
        fn spec_carries_every_owned_field() {
            let spec =
                desired_certificate_spec(&options(), "cluster.local", "istio-system", &issuer("ca"));

            assert_eq!(spec.common_name, "istiod.istio-system.svc");
            assert_eq!(
                spec.dns_names,
                vec![
                    "istiod.istio-system.svc",
                    "istiodcanary.istio-system.svc",
                    "istiod.example.com"
                ]
            );
            assert_eq!(
                spec.uris,
                vec!["spiffe://cluster.local/ns/istio-system/sa/istiod-service-account"]
            );
            assert_eq!(spec.secret_name, "istiod-tls");
            assert_eq!(spec.duration.as_deref(), Some("1h0m0s"));
            assert_eq!(spec.renew_before.as_deref(), Some("30m0s"));
            assert_eq!(
                spec.private_key,
                Some(CertificatePrivateKey {
                    rotation_policy: Some(RotationPolicy::Always),
                    algorithm: Some(KeyAlgorithm::Rsa),
                    size: Some(2048),
                })
            );
            assert_eq!(spec.revision_history_limit, Some(1));
            assert_eq!(spec.issuer_ref, issuer("ca"));
        }

        #[test]
        fn spec_is_deterministic() {
            let a = desired_certificate_spec(&options(), "td", "ns", &issuer("ca"));
            let b = desired_certificate_spec(&options(), "td", "ns", &issuer("ca"));
            assert_eq!(a, b);
        }

        #[test]
        fn ed25519_omits_key_size() {
            let opts = Options {
                key_algorithm: KeyAlgorithm::Ed25519,
                duration: Duration::from_secs(24 * 3600),
                ..Default::default()
            };
            let spec = desired_certificate_spec(&opts, "td", "ns", &issuer("ca"));
            let key = spec.private_key.unwrap();
            assert_eq!(key.algorithm, Some(KeyAlgorithm::Ed25519));
            assert_eq!(key.size, None);
            assert_eq!(spec.duration.as_deref(), Some("24h0m0s"));
        }

        #[test]
        fn spiffe_id_uses_trust_domain_and_namespace() {
            assert_eq!(
                spiffe_id("mesh.example", "istio-system"),
                "spiffe://mesh.example/ns/istio-system/sa/istiod-service-account"
            );
        }
    }

    mod convergence {
        use super::*;

        /// Story: before any issuer is known the provisioner waits quietly
        #[tokio::test]
        async fn story_no_issuer_is_a_successful_no_op() {
            let client = MockCertificateClient::new();
            // No expectations: any store call would panic
            let provisioner = provisioner(None, client);

            let outcome = provisioner.reconcile(&trigger()).await.unwrap();
            assert_eq!(outcome, ReconcileOutcome::NoIssuer);
        }

        /// Story: first reconcile creates the Certificate with the full spec
        #[tokio::test]
        async fn story_missing_certificate_is_created_once() {
            let mut client = MockCertificateClient::new();
            client
                .expect_get()
                .withf(|ns, name| ns.to_string() == "istio-system" && name.to_string() == "istiod")
                .times(1)
                .returning(|_, _| Ok(None));
            client
                .expect_create()
                .withf(|cert| {
                    cert.metadata.name.as_deref() == Some("istiod")
                        && cert.metadata.namespace.as_deref() == Some("istio-system")
                        && cert.spec
                            == desired_certificate_spec(
                                &options(),
                                "cluster.local",
                                "istio-system",
                                &issuer("initial"),
                            )
                })
                .times(1)
                .returning(|_| Ok(()));
            client.expect_update().never();

            let provisioner = provisioner(Some(issuer("initial")), client);
            let outcome = provisioner.reconcile(&trigger()).await.unwrap();
            assert_eq!(outcome, ReconcileOutcome::Created);
        }

        /// Story: an existing Certificate gets its whole spec replaced,
        /// keeping metadata such as the resourceVersion for conflict detection
        #[tokio::test]
        async fn story_existing_certificate_is_fully_replaced() {
            let mut client = MockCertificateClient::new();
            client
                .expect_get()
                .times(1)
                .returning(|_, _| Ok(Some(existing_certificate())));
            client.expect_create().never();
            client
                .expect_update()
                .withf(|cert| {
                    cert.metadata.resource_version.as_deref() == Some("17")
                        && cert.spec.secret_name == ISTIOD_SECRET_NAME
                        && cert.spec.revision_history_limit == Some(REVISION_HISTORY_LIMIT)
                        && cert.spec.issuer_ref == issuer("runtime")
                        && cert.spec.common_name == "istiod.istio-system.svc"
                })
                .times(1)
                .returning(|_| Ok(()));

            let provisioner = provisioner(Some(issuer("initial")), client);
            provisioner.issuer_state().decide(Some(issuer("runtime")));

            let outcome = provisioner.reconcile(&trigger()).await.unwrap();
            assert_eq!(outcome, ReconcileOutcome::Updated);
        }

        /// Story: a failing read aborts the reconcile without writing
        #[tokio::test]
        async fn story_fetch_failure_is_surfaced_without_writes() {
            let mut client = MockCertificateClient::new();
            client.expect_get().times(1).returning(|_, _| {
                Err(Error::Kube(kube::Error::Api(kube::error::ErrorResponse {
                    status: "Failure".to_string(),
                    message: "forbidden".to_string(),
                    reason: "Forbidden".to_string(),
                    code: 403,
                })))
            });
            client.expect_create().never();
            client.expect_update().never();

            let provisioner = provisioner(Some(issuer("initial")), client);
            let err = provisioner.reconcile(&trigger()).await.unwrap_err();
            assert!(matches!(err, Error::Kube(_)));
        }

        /// Story: a failed create is reported so the dispatcher can retry
        #[tokio::test]
        async fn story_create_failure_is_the_outcome() {
            let mut client = MockCertificateClient::new();
            client.expect_get().returning(|_, _| Ok(None));
            client
                .expect_create()
                .times(1)
                .returning(|_| Err(Error::watch("connection reset")));

            let provisioner = provisioner(Some(issuer("initial")), client);
            assert!(provisioner.reconcile(&trigger()).await.is_err());
        }

        /// Story: the reconcile uses the trigger's namespace for identities
        #[tokio::test]
        async fn story_identities_follow_the_trigger_namespace() {
            let mut client = MockCertificateClient::new();
            client.expect_get().returning(|_, _| Ok(None));
            client
                .expect_create()
                .withf(|cert| {
                    cert.spec.uris
                        == vec!["spiffe://cluster.local/ns/mesh/sa/istiod-service-account"]
                        && cert.spec.common_name == "istiod.mesh.svc"
                })
                .times(1)
                .returning(|_| Ok(()));

            let provisioner = provisioner(Some(issuer("initial")), client);
            let trigger = ReconcileTrigger {
                namespace: "mesh".to_string(),
                name: "istiod".to_string(),
            };
            provisioner.reconcile(&trigger).await.unwrap();
        }
    }
}
