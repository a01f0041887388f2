//! Promote images between namespaces by digest.
//!
//! For every ImageStream of a List, the image behind `<name>:<source tag>` in
//! the source namespace is imported into the local stream twice (once by its
//! original reference, once through the local registry) and the target tag is
//! then pointed at that exact digest. The two staging tags are removed
//! afterwards.

use serde::Serialize;
use tracing::{info, info_span, Instrument};

use crate::error::{Error, Result};
use crate::gateway::{get_typed, ClusterGateway, GetOptions};
use crate::resource::{ImageStream, ImageStreamTag, Kind, Resources};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Promotion {
    pub image_stream: String,
    /// `<name>:<target tag>` as it now exists locally.
    pub image_stream_tag: String,
    pub digest: String,
}

pub struct PromoteOptions<'a> {
    pub source_namespace: &'a str,
    pub source_tag: &'a str,
    pub target_tag: &'a str,
}

pub async fn import_image_streams<G>(
    gateway: &G,
    resources: &Resources,
    options: &PromoteOptions<'_>,
) -> Result<Vec<Promotion>>
where
    G: ClusterGateway + ?Sized,
{
    let Resources::Collection(list) = resources else {
        return Err(Error::configuration(
            Kind::List.as_str(),
            "expected a resource of kind List",
        ));
    };
    let mut promoted = Vec::new();
    for item in list.items.iter().filter(|i| i.kind == Kind::ImageStream) {
        let span = info_span!("promote", image_stream = item.name());
        promoted.push(promote(gateway, item.name(), options).instrument(span).await?);
    }
    Ok(promoted)
}

async fn promote<G>(gateway: &G, name: &str, options: &PromoteOptions<'_>) -> Result<Promotion>
where
    G: ClusterGateway + ?Sized,
{
    let source = format!("{}:{}", name, options.source_tag);
    let in_source = GetOptions {
        namespace: Some(options.source_namespace.to_string()),
        ..Default::default()
    };
    let tag: ImageStreamTag = get_typed(
        gateway,
        &format!("{}/{}", Kind::ImageStreamTag, source),
        &in_source,
    )
    .await?
    .ok_or_else(|| {
        Error::configuration(
            format!("{}/{}", Kind::ImageStreamTag, source),
            format!("not found in namespace {}", options.source_namespace),
        )
    })?;
    let reference = tag.image.docker_image_reference.ok_or_else(|| {
        Error::Unexpected(format!("ImageStreamTag/{} has no image reference", source))
    })?;
    let digest = reference
        .split_once('@')
        .map(|(_, digest)| digest.to_string())
        .ok_or_else(|| Error::Unexpected(format!("{} is not pinned to a digest", reference)))?;

    let first = format!("{}:temp1-{}", name, options.target_tag);
    gateway.import_image(&first, &reference).await?;

    let stream: ImageStream = get_typed(
        gateway,
        &format!("{}/{}", Kind::ImageStream, name),
        &GetOptions::default(),
    )
    .await?
    .ok_or_else(|| Error::Unexpected(format!("ImageStream/{} vanished after import", name)))?;
    let repository = stream.status.docker_image_repository.ok_or_else(|| {
        Error::Unexpected(format!("ImageStream/{} has no docker image repository", name))
    })?;
    let second = format!("{}:temp2-{}", name, options.target_tag);
    gateway
        .import_image(&second, &format!("{}@{}", repository, digest))
        .await?;

    let target = format!("{}:{}", name, options.target_tag);
    gateway
        .tag(&format!("{}@{}", name, digest), &target)
        .await?;
    gateway.delete_tag(&first).await?;
    gateway.delete_tag(&second).await?;
    info!("{} now points at {}", target, digest);

    Ok(Promotion {
        image_stream: name.to_string(),
        image_stream_tag: target,
        digest,
    })
}
