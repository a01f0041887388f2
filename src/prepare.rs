//! Stamp a List before it is built: template and source hashes become
//! labels so later runs can tell what changed.

use serde_json::{json, Value};
use tracing::{trace, warn};

use crate::error::{Error, Result};
use crate::gateway::ClusterGateway;
use crate::hash::{hash_directory, hash_object};
use crate::resource::{
    BuildConfig, Kind, Resource, Resources, SourceType, SOURCE_HASH_LABEL, TEMPLATE_HASH_LABEL,
};

/// Every item gets labels and annotations maps, a `template-hash` label
/// computed before anything else is touched, and a namespace (its own, the
/// List's, or `namespace`). BuildConfigs additionally lose their triggers
/// and gain a `source-hash` label.
pub async fn prepare_list<G>(
    gateway: &G,
    resources: Resources,
    namespace: Option<&str>,
) -> Result<Resources>
where
    G: ClusterGateway + ?Sized,
{
    let Resources::Collection(mut list) = resources else {
        return Err(Error::configuration(
            Kind::List.as_str(),
            "expected a resource of kind List",
        ));
    };
    let namespace = list
        .metadata
        .namespace
        .clone()
        .or_else(|| namespace.map(String::from));

    for item in &mut list.items {
        ensure_metadata(item);
        let template_hash = hash_object(&*item)?;
        item.set_label(TEMPLATE_HASH_LABEL, template_hash.hex());
        if item.metadata.namespace.is_none() {
            item.metadata.namespace = namespace.clone();
        }
        if item.kind == Kind::BuildConfig {
            remove_triggers(item);
            let source_hash = source_hash(gateway, item).await?;
            item.set_label(SOURCE_HASH_LABEL, source_hash);
        }
    }
    Ok(Resources::Collection(list))
}

fn ensure_metadata(item: &mut Resource) {
    item.metadata.labels.get_or_insert_with(Default::default);
    item.metadata.annotations.get_or_insert_with(Default::default);
}

/// Builds are started explicitly, cluster side triggers would race with that.
fn remove_triggers(item: &mut Resource) {
    let full_name = item.full_name();
    let Some(spec) = item.body.get_mut("spec").and_then(Value::as_object_mut) else {
        return;
    };
    let has_triggers = spec
        .get("triggers")
        .and_then(Value::as_array)
        .map_or(false, |t| !t.is_empty());
    if has_triggers {
        warn!(
            "{} .spec.triggers are being removed and will be managed by this build script",
            full_name
        );
    }
    spec.insert("triggers".to_string(), json!([]));
}

async fn source_hash<G>(gateway: &G, item: &Resource) -> Result<String>
where
    G: ClusterGateway + ?Sized,
{
    let build_config: BuildConfig = item
        .cast()
        .map_err(|e| Error::configuration(item.full_name().as_str(), e.to_string()))?;
    let context_dir = build_config.context_dir();
    let hash = match build_config.source_type() {
        SourceType::Binary => {
            let root = gateway.cwd().join(context_dir);
            trace!("Hashing {}", root.display());
            hash_directory(&root)?.hex()
        }
        SourceType::Git | SourceType::Other => gateway.source_tree_hash("HEAD", context_dir).await?,
    };
    Ok(hash)
}
