//! The boundary between the scheduler and the cluster.
//!
//! Everything the build pipeline needs from OpenShift goes through
//! [`ClusterGateway`]. [`OcCli`] implements it by shelling out to `oc` and `git`.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use serde::de::DeserializeOwned;

use crate::error::Result;
use crate::resource::Resources;

mod oc;
pub use oc::{OcCli, OcWatch};

#[cfg(test)]
pub(crate) mod fake;

#[derive(Debug, Clone, Default)]
pub struct GetOptions {
    pub selector: Option<String>,
    /// Missing resources are skipped instead of failing the call.
    pub ignore_not_found: bool,
    /// Look in this namespace instead of the configured one.
    pub namespace: Option<String>,
}

impl GetOptions {
    pub fn ignore_not_found() -> Self {
        Self {
            ignore_not_found: true,
            ..Default::default()
        }
    }

    pub fn selector(selector: impl Into<String>) -> Self {
        Self {
            selector: Some(selector.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct StartBuild {
    /// Name of the BuildConfig to start.
    pub build_config: String,
    /// Binary build context to upload.
    pub from_archive: Option<PathBuf>,
}

/// A long running, line oriented status stream backed by a subprocess.
#[async_trait::async_trait]
pub trait LineStream: Send {
    /// `None` once the underlying process stopped producing output.
    async fn next_line(&mut self) -> Result<Option<String>>;

    /// Stop the underlying process. Safe to call more than once.
    async fn terminate(&mut self) -> Result<()>;
}

#[async_trait::async_trait]
pub trait ClusterGateway: Send + Sync {
    /// Fetch named resources (`kind/name`) or, with a selector, every match of a kind.
    /// Returns `None` when nothing was found and `ignore_not_found` is set.
    async fn get(&self, names: &[String], options: &GetOptions) -> Result<Option<Resources>>;

    /// Create or update. The result has the same shape as the input.
    async fn apply(&self, resources: &Resources) -> Result<Resources>;

    /// Start a build and wait for it to finish. Returns the Build, fetched back in full.
    async fn start_build(&self, request: &StartBuild) -> Result<crate::resource::Resource>;

    /// Stream one line per change of the matching resources, formatted by `template`.
    async fn watch(
        &self,
        resource: &str,
        selector: &str,
        template: &str,
    ) -> Result<Box<dyn LineStream>>;

    /// Import the image at `from`, a pullable reference, into the ImageStreamTag `target`.
    async fn import_image(&self, target: &str, from: &str) -> Result<()>;

    /// Point the ImageStreamTag `target` at `source` (`name@digest` or `name:tag`).
    async fn tag(&self, source: &str, target: &str) -> Result<()>;

    async fn delete_tag(&self, tag: &str) -> Result<()>;

    /// Full log of a finished build, optionally with a timestamp on each line.
    async fn logs(&self, build: &str, namespace: Option<&str>, timestamps: bool)
        -> Result<String>;

    /// Tree hash of `subpath` at `git_ref` in the source checkout.
    async fn source_tree_hash(&self, git_ref: &str, subpath: &str) -> Result<String>;

    /// Root of the source checkout; relative context directories resolve against it.
    fn cwd(&self) -> &Path;
}

/// Fetch a single resource and cast it into one of the typed views.
pub async fn get_typed<T, G>(gateway: &G, name: &str, options: &GetOptions) -> Result<Option<T>>
where
    T: DeserializeOwned,
    G: ClusterGateway + ?Sized,
{
    let Some(found) = gateway.get(&[name.to_string()], options).await? else {
        return Ok(None);
    };
    match found.into_items().into_iter().next() {
        Some(resource) => Ok(Some(resource.cast()?)),
        None => Ok(None),
    }
}

/// Copy `metadata.resourceVersion` from the live objects onto `resources`.
/// Items not yet in the cluster are left alone.
pub async fn fetch_resource_versions<G>(gateway: &G, resources: &mut Resources) -> Result<()>
where
    G: ClusterGateway + ?Sized,
{
    let mut by_namespace: BTreeMap<Option<String>, Vec<String>> = BTreeMap::new();
    for item in resources.items() {
        by_namespace
            .entry(item.metadata.namespace.clone())
            .or_default()
            .push(item.full_name().to_string());
    }
    for (namespace, names) in by_namespace {
        let options = GetOptions {
            namespace: namespace.clone(),
            ..GetOptions::ignore_not_found()
        };
        let Some(live) = gateway.get(&names, &options).await? else {
            continue;
        };
        for found in live.into_items() {
            let full_name = found.full_name();
            for item in resources
                .items_mut()
                .iter_mut()
                .filter(|i| i.metadata.namespace == namespace && i.full_name() == full_name)
            {
                item.metadata.resource_version = found.metadata.resource_version.clone();
            }
        }
    }
    Ok(())
}
