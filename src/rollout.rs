//! Apply a List and wait for its DeploymentConfigs to finish rolling out.

use std::{collections::BTreeSet, time::Duration};

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::gateway::{get_typed, ClusterGateway, GetOptions, LineStream};
use crate::resource::{DeploymentConfig, Kind, Resources};

/// One line per change: name, replicas, available, unavailable, version.
pub const WATCH_TEMPLATE: &str = concat!(
    "{.metadata.name}{\"\\t\"}",
    "{.status.replicas}{\"\\t\"}",
    "{.status.availableReplicas}{\"\\t\"}",
    "{.status.unavailableReplicas}{\"\\t\"}",
    "{.status.latestVersion}{\"\\n\"}",
);

type Snapshot = Vec<(String, Option<i32>, Option<i64>)>;

/// `(name, desired replicas, latest version)` of every DeploymentConfig
/// matching `selector`, sorted by name.
async fn snapshot<G>(gateway: &G, selector: &str) -> Result<Snapshot>
where
    G: ClusterGateway + ?Sized,
{
    let found = gateway
        .get(
            &[Kind::DeploymentConfig.to_string()],
            &GetOptions::selector(selector),
        )
        .await?;
    let mut snapshot = Vec::new();
    for item in found.map(Resources::into_items).unwrap_or_default() {
        let dc: DeploymentConfig = item.cast()?;
        snapshot.push((
            dc.metadata.name.unwrap_or_default(),
            dc.spec.replicas,
            dc.status.latest_version,
        ));
    }
    snapshot.sort();
    Ok(snapshot)
}

/// Apply `resources`, then block until every DeploymentConfig among them is
/// fully rolled out. Returns right after the apply when it changed no
/// DeploymentConfig labelled `app=<app>`.
pub async fn apply_and_wait<G>(
    gateway: &G,
    resources: &Resources,
    app: Option<&str>,
    timeout: Option<Duration>,
) -> Result<Resources>
where
    G: ClusterGateway + ?Sized,
{
    let (label, owner) = match resources {
        Resources::Collection(list) => (list.label("app"), Kind::List.to_string()),
        Resources::Single(item) => (item.label("app"), item.full_name().to_string()),
    };
    let app = app.or(label).ok_or_else(|| {
        Error::configuration(owner, "no 'app' label to select DeploymentConfigs")
    })?;
    let selector = format!("app={}", app);

    let before = snapshot(gateway, &selector).await?;
    let applied = gateway.apply(resources).await?;
    let after = snapshot(gateway, &selector).await?;
    if before == after {
        info!("No DeploymentConfig labelled {} changed", selector);
        return Ok(applied);
    }

    let mut pending: BTreeSet<String> = resources
        .items()
        .iter()
        .filter(|item| item.kind == Kind::DeploymentConfig)
        .map(|item| item.name().to_string())
        .collect();
    if pending.is_empty() {
        return Ok(applied);
    }
    info!("Waiting for {:?} to roll out", pending);

    let mut watch = gateway
        .watch(Kind::DeploymentConfig.as_str(), &selector, WATCH_TEMPLATE)
        .await?;
    let waiting = wait_for_rollout(gateway, watch.as_mut(), &mut pending);
    let outcome = match timeout {
        Some(after) => {
            let finished = tokio::time::timeout(after, waiting).await;
            finished.unwrap_or_else(|_| {
                Err(Error::Timeout {
                    what: format!("rollout of {:?}", pending),
                    after,
                })
            })
        }
        None => waiting.await,
    };
    if let Err(e) = watch.terminate().await {
        warn!("Stopping the rollout watch: {}", e);
    }
    outcome?;
    info!("Rollout of {} complete", selector);
    Ok(applied)
}

async fn wait_for_rollout<G>(
    gateway: &G,
    watch: &mut dyn LineStream,
    pending: &mut BTreeSet<String>,
) -> Result<()>
where
    G: ClusterGateway + ?Sized,
{
    while !pending.is_empty() {
        let Some(line) = watch.next_line().await? else {
            return Err(Error::Unexpected(format!(
                "watch ended while {:?} were still rolling out",
                pending
            )));
        };
        let Some(name) = line.split_whitespace().next() else {
            continue;
        };
        if !pending.contains(name) {
            continue;
        }
        debug!("{}", line);
        let dc: Option<DeploymentConfig> = get_typed(
            gateway,
            &format!("{}/{}", Kind::DeploymentConfig, name),
            &GetOptions::default(),
        )
        .await?;
        if dc.map_or(false, |dc| dc.is_rolled_out()) {
            info!("DeploymentConfig/{} rolled out", name);
            pending.remove(name);
        }
    }
    Ok(())
}
