//! istiod-cert-provisioner - keeps istiod's Certificate on the active issuer

use std::future::Future;
use std::sync::Arc;

use anyhow::Context;
use clap::{ArgAction, Parser};
use kube::Client;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use istiod_cert_provisioner::controller::{
    watch_certificate, CertificateClientImpl, Dispatcher, Provisioner,
};
use istiod_cert_provisioner::issuer::{
    watch_runtime_config, IssuerBroadcaster, RuntimeConfigSource,
};
use istiod_cert_provisioner::leader_election::{
    LeaderElectionError, LeaderElector, LeaderGuard, LEADER_LEASE_NAME,
};
use istiod_cert_provisioner::options::{CertificateArgs, IssuerArgs};
use istiod_cert_provisioner::telemetry::{init_telemetry, shutdown_telemetry, TelemetryConfig};
use istiod_cert_provisioner::{shutdown, Error};

/// Keeps istiod's cert-manager Certificate converged with the active issuer
#[derive(Parser, Debug)]
#[command(name = "istiod-cert-provisioner", version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    certificate: CertificateArgs,

    #[command(flatten)]
    issuer: IssuerArgs,

    /// Trust domain used in istiod's SPIFFE identity
    #[arg(long, env = "TRUST_DOMAIN", default_value = "cluster.local")]
    trust_domain: String,

    /// ConfigMap naming the issuer at runtime; without it the initial
    /// issuer never changes
    #[arg(long, env = "RUNTIME_ISSUANCE_CONFIG_MAP_NAME")]
    runtime_issuance_config_map_name: Option<String>,

    /// Namespace of the runtime issuance ConfigMap (default: certificate namespace)
    #[arg(long, env = "RUNTIME_ISSUANCE_CONFIG_MAP_NAMESPACE")]
    runtime_issuance_config_map_namespace: Option<String>,

    /// Only act while holding the leader lease
    #[arg(long, env = "LEADER_ELECT", default_value_t = true, action = ArgAction::Set)]
    leader_elect: bool,

    /// Namespace of the leader lease (default: certificate namespace)
    #[arg(long, env = "LEADER_ELECTION_NAMESPACE")]
    leader_election_namespace: Option<String>,

    /// Leader election identity, usually the pod name
    #[arg(long, env = "POD_NAME")]
    identity: Option<String>,
}

impl Cli {
    fn runtime_config_source(&self, default_namespace: &str) -> Option<RuntimeConfigSource> {
        let name = self
            .runtime_issuance_config_map_name
            .as_deref()
            .filter(|name| !name.is_empty())?;
        Some(RuntimeConfigSource {
            name: name.to_string(),
            namespace: self
                .runtime_issuance_config_map_namespace
                .clone()
                .unwrap_or_else(|| default_namespace.to_string()),
        })
    }

    fn identity(&self) -> String {
        self.identity.clone().unwrap_or_else(|| {
            format!(
                "istiod-cert-provisioner-{:08x}",
                rand::thread_rng().gen::<u32>()
            )
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_telemetry(TelemetryConfig::default()).context("failed to initialize telemetry")?;

    let result = run(cli).await;
    if let Err(e) = &result {
        error!(error = %e, "istiod-cert-provisioner exited with error");
    }
    shutdown_telemetry();
    result
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let options = cli.certificate.clone().into_options()?;
    if cli.trust_domain.trim().is_empty() {
        return Err(Error::config("trust domain must not be empty").into());
    }

    let client = Client::try_default()
        .await
        .context("failed to create kubernetes client")?;

    let notifier = IssuerBroadcaster::new(cli.issuer.initial_issuer());
    let certificates = Arc::new(CertificateClientImpl::new(client.clone()));
    let provisioner = Arc::new(Provisioner::new(
        options,
        &notifier,
        certificates,
        cli.trust_domain.clone(),
    ));
    let target = provisioner.target().clone();
    let (bridge, triggers) = provisioner.event_bridge(&notifier);

    info!(
        cert_name = %target.name(),
        cert_namespace = %target.namespace(),
        trust_domain = %cli.trust_domain,
        "Starting istiod-cert-provisioner"
    );

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown::cancel_on_signal(cancel.clone()));

    let mut leader: Option<LeaderGuard> = None;
    if bridge.needs_leader_election() && cli.leader_elect {
        let namespace = cli
            .leader_election_namespace
            .clone()
            .unwrap_or_else(|| target.namespace().to_string());
        let elector = Arc::new(LeaderElector::new(
            client.clone(),
            LEADER_LEASE_NAME,
            &namespace,
            &cli.identity(),
        ));
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Shutdown requested before leadership was acquired");
                return Ok(());
            }
            guard = elector.acquire() => leader = Some(guard),
        }
    } else {
        warn!("Leader election disabled; only run a single replica");
    }

    let runtime_source = cli.runtime_config_source(target.namespace());
    let runtime_config = async {
        match runtime_source {
            Some(source) => {
                watch_runtime_config(client.clone(), source, &notifier, cancel.clone()).await
            }
            None => {
                info!("No runtime issuance ConfigMap configured, issuer is fixed");
                Ok(())
            }
        }
    };

    let dispatcher = Dispatcher::new(
        Arc::clone(&provisioner),
        triggers,
        watch_certificate(client.clone(), &target),
    );

    let leadership = async {
        let Some(guard) = leader.as_mut() else {
            return Ok::<(), Error>(());
        };
        tokio::select! {
            _ = cancel.cancelled() => Ok(()),
            _ = guard.lost() => Err(LeaderElectionError::Lost.into()),
        }
    };

    let (bridge_result, dispatcher_result, runtime_result, leadership_result) = tokio::join!(
        cancel_on_error("event bridge", bridge.run(cancel.clone()), &cancel),
        cancel_on_error("dispatcher", dispatcher.run(cancel.clone()), &cancel),
        cancel_on_error("runtime configuration", runtime_config, &cancel),
        cancel_on_error("leadership", leadership, &cancel),
    );

    // Renewal is stopped before the lease is cleared
    if let Some(guard) = leader.take() {
        if let Err(e) = guard.release_leadership().await {
            warn!(error = %e, "Failed to release leader lease");
        }
    }

    bridge_result?;
    dispatcher_result?;
    runtime_result?;
    leadership_result?;
    info!("istiod-cert-provisioner stopped");
    Ok(())
}

/// Await `task`; cancel every other task if it fails
async fn cancel_on_error<F>(
    name: &'static str,
    task: F,
    cancel: &CancellationToken,
) -> Result<(), Error>
where
    F: Future<Output = Result<(), Error>>,
{
    let result = task.await;
    if let Err(e) = &result {
        error!(task = name, error = %e, "Task failed, shutting down");
        cancel.cancel();
    }
    result
}
