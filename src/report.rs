//! Save what a build run used and produced: the resources behind every
//! result and the log of every build.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use k8s_openapi::api::core::v1::ObjectReference;
use tracing::{info, warn};

use crate::error::Result;
use crate::executor::BuildResult;
use crate::gateway::{ClusterGateway, GetOptions};
use crate::resource::{List, Resources};

pub const REPORT_FILE: &str = "build.out.json";

pub fn log_file_name(build: &str) -> String {
    format!("build.{}.log.txt", build)
}

fn references(result: &BuildResult) -> impl Iterator<Item = &ObjectReference> {
    std::iter::once(&result.build_config)
        .chain(result.build.as_ref())
        .chain([&result.image_stream_tag, &result.image_stream_image])
}

/// Fetch the BuildConfig, Build, ImageStreamTag and ImageStreamImage of every
/// result into `dir/build.out.json` as one List, and save each build's log
/// next to it. Logs of reused builds may be gone already, that is only
/// logged. Returns the report path.
pub async fn write_report<G>(gateway: &G, dir: &Path, results: &[BuildResult]) -> Result<PathBuf>
where
    G: ClusterGateway + ?Sized,
{
    tokio::fs::create_dir_all(dir).await?;

    let mut by_namespace: BTreeMap<Option<String>, Vec<String>> = BTreeMap::new();
    for reference in results.iter().flat_map(references) {
        let (Some(kind), Some(name)) = (&reference.kind, &reference.name) else {
            continue;
        };
        let names = by_namespace.entry(reference.namespace.clone()).or_default();
        let full_name = format!("{}/{}", kind, name);
        if !names.contains(&full_name) {
            names.push(full_name);
        }
    }
    let mut items = Vec::new();
    for (namespace, names) in by_namespace {
        let options = GetOptions {
            namespace,
            ..GetOptions::ignore_not_found()
        };
        if let Some(found) = gateway.get(&names, &options).await? {
            items.extend(found.into_items());
        }
    }
    let path = dir.join(REPORT_FILE);
    let report = Resources::Collection(List::new(items));
    tokio::fs::write(&path, serde_json::to_vec_pretty(&report)?).await?;
    info!("Wrote {}", path.display());

    for result in results {
        let Some(build) = &result.build else {
            continue;
        };
        let name = build.name.as_deref().unwrap_or_default();
        let log = match gateway
            .logs(&format!("Build/{}", name), build.namespace.as_deref(), true)
            .await
        {
            Ok(log) => log,
            Err(e) if !result.new_build => {
                warn!("No log for reused Build/{}: {}", name, e);
                continue;
            }
            Err(e) => return Err(e),
        };
        let log_path = dir.join(log_file_name(name));
        tokio::fs::write(&log_path, log).await?;
        info!("Wrote {}", log_path.display());
    }
    Ok(path)
}
