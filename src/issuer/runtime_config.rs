//! Runtime issuer configuration from a ConfigMap
//!
//! Operators can switch the issuer without restarting the provisioner by
//! writing the issuer coordinates into a ConfigMap:
//!
//! ```yaml
//! data:
//!   issuer-name: mesh-root
//!   issuer-kind: ClusterIssuer     # default: Issuer
//!   issuer-group: cert-manager.io  # default: cert-manager.io
//! ```
//!
//! Removing `issuer-name` or deleting the ConfigMap publishes `None`, which
//! reverts to the issuer configured by flags.

use std::collections::BTreeMap;

use futures::{Stream, StreamExt};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Api, Client};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::IssuerBroadcaster;
use crate::crd::IssuerRef;
use crate::Error;

/// ConfigMap key holding the issuer name
pub const ISSUER_NAME_KEY: &str = "issuer-name";
/// ConfigMap key holding the issuer kind
pub const ISSUER_KIND_KEY: &str = "issuer-kind";
/// ConfigMap key holding the issuer group
pub const ISSUER_GROUP_KEY: &str = "issuer-group";

const DEFAULT_ISSUER_KIND: &str = "Issuer";
const DEFAULT_ISSUER_GROUP: &str = "cert-manager.io";

/// Location of the runtime issuance ConfigMap
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuntimeConfigSource {
    /// ConfigMap name
    pub name: String,
    /// ConfigMap namespace
    pub namespace: String,
}

/// Read the issuer named by a runtime configuration ConfigMap
pub fn issuer_from_config_map(config_map: &ConfigMap) -> Option<IssuerRef> {
    let data = config_map.data.as_ref()?;
    let name = lookup(data, ISSUER_NAME_KEY)?;

    Some(IssuerRef::new(
        name,
        lookup(data, ISSUER_KIND_KEY).unwrap_or(DEFAULT_ISSUER_KIND),
        lookup(data, ISSUER_GROUP_KEY).unwrap_or(DEFAULT_ISSUER_GROUP),
    ))
}

fn lookup<'a>(data: &'a BTreeMap<String, String>, key: &str) -> Option<&'a str> {
    data.get(key).map(|v| v.trim()).filter(|v| !v.is_empty())
}

/// Watch the runtime issuance ConfigMap and publish issuer changes
///
/// Runs until `cancel` fires. Returns an error if the watch stream ends.
pub async fn watch_runtime_config(
    client: Client,
    source: RuntimeConfigSource,
    notifier: &IssuerBroadcaster,
    cancel: CancellationToken,
) -> Result<(), Error> {
    let api: Api<ConfigMap> = Api::namespaced(client, &source.namespace);
    let config = watcher::Config::default().fields(&format!("metadata.name={}", source.name));

    info!(
        config_map = %source.name,
        namespace = %source.namespace,
        "Watching runtime issuance configuration"
    );

    let events = watcher::watcher(api, config).default_backoff();
    forward_config_events(events, notifier, cancel).await
}

/// Translate ConfigMap watch events into issuer notifications
///
/// Consecutive identical issuers are published once. A relist that does not
/// contain the ConfigMap counts as a deletion.
pub(crate) async fn forward_config_events<S>(
    events: S,
    notifier: &IssuerBroadcaster,
    cancel: CancellationToken,
) -> Result<(), Error>
where
    S: Stream<Item = Result<Event<ConfigMap>, watcher::Error>>,
{
    tokio::pin!(events);

    let mut last_published: Option<Option<IssuerRef>> = None;
    let mut seen_in_relist = false;

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Runtime configuration watch cancelled");
                return Ok(());
            }
            event = events.next() => event,
        };

        let issuer = match event {
            None => return Err(Error::watch("runtime configuration watch stream ended")),
            Some(Err(e)) => {
                warn!(error = %e, "Runtime configuration watch error, will retry");
                continue;
            }
            Some(Ok(Event::Init)) => {
                seen_in_relist = false;
                continue;
            }
            Some(Ok(Event::InitApply(cm))) => {
                seen_in_relist = true;
                issuer_from_config_map(&cm)
            }
            Some(Ok(Event::InitDone)) => {
                if seen_in_relist {
                    continue;
                }
                None
            }
            Some(Ok(Event::Apply(cm))) => issuer_from_config_map(&cm),
            Some(Ok(Event::Delete(_))) => None,
        };

        if last_published.as_ref() == Some(&issuer) {
            continue;
        }

        match &issuer {
            Some(issuer) => info!(
                issuer_name = %issuer.name,
                issuer_kind = %issuer.kind,
                issuer_group = %issuer.group,
                "Runtime configuration names an issuer"
            ),
            None => info!("Runtime configuration names no issuer"),
        }

        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = notifier.publish(issuer.clone()) => {}
        }
        last_published = Some(issuer);
    }
}
