//! Runs one BuildConfig: fingerprint its inputs, reuse a matching image when
//! the output ImageStream already has one, otherwise build.

use std::{
    fs::File,
    path::{Path, PathBuf},
    time::Duration,
};

use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use serde::Serialize;
use serde_json::json;
use tempfile::TempPath;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::error::{Error, Result};
use crate::gateway::{get_typed, ClusterGateway, GetOptions, StartBuild};
use crate::hash::{hash_directory, hash_object, ContentHash};
use crate::resource::{
    image_stream_name, metadata_reference, Build, BuildConfig, ImageStream, ImageStreamImage,
    ImageStreamTag, Kind, Resource, Resources, SourceType, BUILD_HASH_ENV, BUILD_NAMESPACE_ENV,
    BUILD_NAME_ENV, TEMPLATE_HASH_LABEL,
};

/// What a BuildConfig resolved to, reused or freshly built.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildResult {
    pub build_config: ObjectReference,
    /// Absent when a reused image carries no build lineage.
    pub build: Option<ObjectReference>,
    pub image_stream_tag: ObjectReference,
    pub image_stream_image: ObjectReference,
    pub new_build: bool,
}

/// Source of a build, ready to be fingerprinted and uploaded.
struct Source {
    hash: String,
    /// Removed from disk when dropped.
    archive: Option<TempPath>,
}

/// An existing image whose fingerprint matched.
struct Candidate {
    image_stream_image: ObjectReference,
    build: Option<ObjectReference>,
    created: Option<Time>,
}

pub struct BuildExecutor<'a, G: ?Sized> {
    gateway: &'a G,
    build_timeout: Option<Duration>,
}

impl<'a, G: ClusterGateway + ?Sized> BuildExecutor<'a, G> {
    pub fn new(gateway: &'a G, build_timeout: Option<Duration>) -> Self {
        Self {
            gateway,
            build_timeout,
        }
    }

    pub async fn run(&self, build_config: BuildConfig) -> Result<BuildResult> {
        let span = info_span!("build", build_config = %build_config.full_name());
        self.run_inner(build_config).instrument(span).await
    }

    async fn run_inner(&self, mut build_config: BuildConfig) -> Result<BuildResult> {
        let full_name = build_config.full_name();
        let namespace = build_config.metadata.namespace.clone();
        let output_to = build_config
            .output_to()
            .filter(|o| o.kind.as_deref() == Some(Kind::ImageStreamTag.as_str()))
            .cloned()
            .ok_or_else(|| {
                Error::configuration(full_name.as_str(), "output must be an ImageStreamTag")
            })?;
        let output_name = output_to.name.clone().unwrap_or_default();
        let output_namespace = output_to.namespace.clone().or_else(|| namespace.clone());

        let source = self.materialize_source(&build_config).await?;
        let images = self.pin_inputs(&mut build_config).await?;
        let fingerprint = fingerprint(
            &source.hash,
            &images,
            build_config.label(TEMPLATE_HASH_LABEL),
        )?;
        debug!("{} fingerprint {}", full_name, fingerprint);
        build_config.set_env(BUILD_HASH_ENV, &fingerprint.hex());

        let image_stream_tag = ObjectReference {
            kind: Some(Kind::ImageStreamTag.to_string()),
            name: Some(output_name.clone()),
            namespace: output_namespace.clone(),
            ..Default::default()
        };
        let reference = metadata_reference(Kind::BuildConfig, &build_config.metadata);

        let stream = image_stream_name(&output_name).to_string();
        if let Some(existing) = self
            .find_existing(&stream, output_namespace.as_deref(), &fingerprint)
            .await
        {
            info!(
                "Reusing {} for {}",
                existing.image_stream_image.name.as_deref().unwrap_or_default(),
                full_name
            );
            return Ok(BuildResult {
                build_config: reference,
                build: existing.build,
                image_stream_tag,
                image_stream_image: existing.image_stream_image,
                new_build: false,
            });
        }

        info!("Building {}", full_name);
        self.gateway
            .apply(&Resources::Single(Resource::from_typed(&build_config)?))
            .await?;
        let request = StartBuild {
            build_config: build_config.name().to_string(),
            from_archive: source.archive.as_ref().map(|a| a.to_path_buf()),
        };
        let started = self.gateway.start_build(&request);
        let build = match self.build_timeout {
            Some(after) => tokio::time::timeout(after, started)
                .await
                .map_err(|_| Error::Timeout {
                    what: full_name.to_string(),
                    after,
                })??,
            None => started.await?,
        };
        drop(source);

        let build: Build = build.cast()?;
        if let Some(phase) = build.status.phase.as_deref().filter(|p| *p != "Complete") {
            return Err(Error::Unexpected(format!(
                "Build/{} ended in phase {}",
                build.metadata.name.as_deref().unwrap_or_default(),
                phase
            )));
        }
        let digest = build.image_digest().ok_or_else(|| {
            Error::Unexpected(format!(
                "Build/{} finished without an image digest",
                build.metadata.name.as_deref().unwrap_or_default()
            ))
        })?;
        let built_to = build.spec.output.to.as_ref();
        let built_stream = built_to
            .and_then(|to| to.name.as_deref())
            .map(image_stream_name)
            .unwrap_or(&stream);
        let image_stream_image = ObjectReference {
            kind: Some(Kind::ImageStreamImage.to_string()),
            name: Some(format!("{}@{}", built_stream, digest)),
            namespace: built_to
                .and_then(|to| to.namespace.clone())
                .or_else(|| build.metadata.namespace.clone()),
            ..Default::default()
        };
        info!(
            "Built {} as {}",
            full_name,
            image_stream_image.name.as_deref().unwrap_or_default()
        );
        Ok(BuildResult {
            build_config: reference,
            build: Some(metadata_reference(Kind::Build, &build.metadata)),
            image_stream_tag,
            image_stream_image,
            new_build: true,
        })
    }

    /// Binary sources are archived and hashed locally, everything else is
    /// identified by the git tree of its context directory.
    async fn materialize_source(&self, build_config: &BuildConfig) -> Result<Source> {
        let context_dir = build_config.context_dir().to_string();
        match build_config.source_type() {
            SourceType::Binary => {
                let root = self.gateway.cwd().to_path_buf();
                let archive = tempfile::Builder::new()
                    .prefix("ocpipe-")
                    .suffix(".tar")
                    .tempfile()?
                    .into_temp_path();
                let path = archive.to_path_buf();
                let hash = tokio::task::spawn_blocking(move || {
                    write_archive(&root, &context_dir, &path)?;
                    hash_directory(&root.join(&context_dir))
                })
                .await
                .map_err(|e| Error::Unexpected(format!("archiving source: {}", e)))??;
                Ok(Source {
                    hash: hash.hex(),
                    archive: Some(archive),
                })
            }
            SourceType::Git | SourceType::Other => Ok(Source {
                hash: self.gateway.source_tree_hash("HEAD", &context_dir).await?,
                archive: None,
            }),
        }
    }

    /// Resolve every ImageStreamTag input to the image it points at right now
    /// and rewrite the reference as the matching ImageStreamImage.
    async fn pin_inputs(&self, build_config: &mut BuildConfig) -> Result<Vec<ObjectReference>> {
        let full_name = build_config.full_name();
        let mut images = Vec::new();
        for reference in build_config.input_images_mut() {
            if reference.kind.as_deref() == Some(Kind::ImageStreamTag.as_str()) {
                let name = reference.name.clone().unwrap_or_default();
                let options = GetOptions {
                    namespace: reference.namespace.clone(),
                    ..Default::default()
                };
                let tag: ImageStreamTag = get_typed(
                    self.gateway,
                    &format!("{}/{}", Kind::ImageStreamTag, name),
                    &options,
                )
                .await?
                .ok_or_else(|| {
                    Error::configuration(full_name.as_str(), format!("input {} not found", name))
                })?;
                let digest = tag.image.metadata.name.ok_or_else(|| {
                    Error::Unexpected(format!("ImageStreamTag/{} points at no image", name))
                })?;
                let pinned = format!("{}@{}", image_stream_name(&name), digest);
                debug!("Pinning {} to {}", name, pinned);
                reference.kind = Some(Kind::ImageStreamImage.to_string());
                reference.name = Some(pinned);
            }
            images.push(reference.clone());
        }
        Ok(images)
    }

    /// Newest image on `stream` built with `fingerprint`. Anything that cannot
    /// be read along the way counts as no match.
    async fn find_existing(
        &self,
        stream: &str,
        namespace: Option<&str>,
        fingerprint: &ContentHash,
    ) -> Option<Candidate> {
        let options = GetOptions {
            ignore_not_found: true,
            namespace: namespace.map(String::from),
            ..Default::default()
        };
        let image_stream: ImageStream =
            match get_typed(self.gateway, &format!("{}/{}", Kind::ImageStream, stream), &options)
                .await
            {
                Ok(Some(found)) => found,
                Ok(None) => return None,
                Err(e) => {
                    warn!("Looking up ImageStream/{}: {}", stream, e);
                    return None;
                }
            };

        let wanted = fingerprint.hex();
        let mut seen = Vec::new();
        let mut best: Option<Candidate> = None;
        for tag in &image_stream.status.tags {
            let names: Vec<String> = tag
                .items
                .iter()
                .map(|event| format!("{}/{}@{}", Kind::ImageStreamImage, stream, event.image))
                .filter(|name| !seen.contains(name))
                .collect();
            if names.is_empty() {
                continue;
            }
            seen.extend(names.iter().cloned());
            let found = match self.gateway.get(&names, &options).await {
                Ok(Some(found)) => found,
                Ok(None) => continue,
                Err(e) => {
                    warn!("Looking up images of {}:{}: {}", stream, tag.tag, e);
                    continue;
                }
            };
            for item in found.items() {
                let Ok(isi) = item.cast::<ImageStreamImage>() else {
                    debug!("Skipping unreadable {}", item.full_name());
                    continue;
                };
                if isi.image.env_value(BUILD_HASH_ENV) != Some(wanted.as_str()) {
                    continue;
                }
                let candidate = candidate(stream, namespace, isi);
                let newer = best.as_ref().map_or(true, |b| {
                    candidate.created.as_ref().map(|t| t.0) >= b.created.as_ref().map(|t| t.0)
                });
                if newer {
                    best = Some(candidate);
                }
            }
        }
        best
    }
}

fn candidate(stream: &str, namespace: Option<&str>, isi: ImageStreamImage) -> Candidate {
    let digest = isi.image.metadata.name.clone().unwrap_or_default();
    let build = isi.image.env_value(BUILD_NAME_ENV).map(|name| ObjectReference {
        kind: Some(Kind::Build.to_string()),
        name: Some(name.to_string()),
        namespace: isi
            .image
            .env_value(BUILD_NAMESPACE_ENV)
            .map(String::from)
            .or_else(|| namespace.map(String::from)),
        ..Default::default()
    });
    let created = isi
        .metadata
        .creation_timestamp
        .clone()
        .or_else(|| isi.image.metadata.creation_timestamp.clone());
    Candidate {
        image_stream_image: ObjectReference {
            kind: Some(Kind::ImageStreamImage.to_string()),
            name: Some(
                isi.metadata
                    .name
                    .clone()
                    .unwrap_or_else(|| format!("{}@{}", stream, digest)),
            ),
            namespace: isi
                .metadata
                .namespace
                .clone()
                .or_else(|| namespace.map(String::from)),
            ..Default::default()
        },
        build,
        created,
    }
}

/// Fingerprint of everything that determines a build's output.
pub fn fingerprint(
    source: &str,
    images: &[ObjectReference],
    template_hash: Option<&str>,
) -> Result<ContentHash> {
    Ok(hash_object(&json!({
        "source": source,
        "images": images,
        "buildConfig": template_hash,
    }))?)
}

/// Tar `root/context_dir` into `dest`, entries prefixed with `context_dir`.
/// Symlinks are stored as the files they point to.
pub fn write_archive(root: &Path, context_dir: &str, dest: &Path) -> std::io::Result<()> {
    let mut archive = tar::Builder::new(File::create(dest)?);
    archive.follow_symlinks(true);
    let name = if context_dir.is_empty() {
        PathBuf::from(".")
    } else {
        PathBuf::from(context_dir)
    };
    archive.append_dir_all(name, root.join(context_dir))?;
    archive.into_inner()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::fake::{build_config, FakeCluster};

    fn app(cluster: &FakeCluster) -> BuildConfig {
        cluster.with_image("base", "1.0", "sha256:b1", &[]);
        build_config("app", "app:latest", &["base:1.0"]).cast().unwrap()
    }

    #[tokio::test]
    async fn second_run_reuses_the_image() {
        let cluster = FakeCluster::default();
        let bc = app(&cluster);
        cluster.insert(Resource::from_typed(&bc).unwrap());
        let executor = BuildExecutor::new(&cluster, None);

        let first = executor.run(bc.clone()).await.unwrap();
        assert!(first.new_build);
        assert_eq!(cluster.builds_started(), ["app"]);

        let second = executor.run(bc).await.unwrap();
        assert!(!second.new_build);
        assert_eq!(cluster.builds_started(), ["app"]);
        assert_eq!(first.image_stream_image, second.image_stream_image);
        assert_eq!(first.build, second.build);
        assert_eq!(second.image_stream_tag.name.as_deref(), Some("app:latest"));
    }

    #[tokio::test]
    async fn inputs_are_pinned_and_fingerprint_injected() {
        let cluster = FakeCluster::default();
        let bc = app(&cluster);
        BuildExecutor::new(&cluster, None).run(bc).await.unwrap();

        let applied: BuildConfig = cluster.object("BuildConfig/app").unwrap().cast().unwrap();
        let from = applied.input_images()[0].clone();
        assert_eq!(from.kind.as_deref(), Some("ImageStreamImage"));
        assert_eq!(from.name.as_deref(), Some("base@sha256:b1"));
        assert_eq!(applied.env(BUILD_HASH_ENV).map(str::len), Some(64));
    }

    #[tokio::test]
    async fn new_base_digest_triggers_a_build() {
        let cluster = FakeCluster::default();
        let bc = app(&cluster);
        let executor = BuildExecutor::new(&cluster, None);
        executor.run(bc.clone()).await.unwrap();

        cluster.with_image("base", "1.0", "sha256:b2", &[]);
        let again = executor.run(bc).await.unwrap();
        assert!(again.new_build);
        assert_eq!(cluster.builds_started(), ["app", "app"]);
    }

    #[tokio::test]
    async fn source_and_template_changes_trigger_a_build() {
        let cluster = FakeCluster::default();
        let bc = app(&cluster);
        let executor = BuildExecutor::new(&cluster, None);
        executor.run(bc.clone()).await.unwrap();

        cluster.set_tree_hash("app", "another-tree");
        assert!(executor.run(bc.clone()).await.unwrap().new_build);

        let mut changed = bc;
        changed
            .metadata
            .labels
            .get_or_insert_with(Default::default)
            .insert(TEMPLATE_HASH_LABEL.to_string(), "other".to_string());
        assert!(executor.run(changed).await.unwrap().new_build);
        assert_eq!(cluster.builds_started().len(), 3);
    }

    #[tokio::test]
    async fn newest_matching_image_wins() {
        let cluster = FakeCluster::default();
        let bc = app(&cluster);
        let mut pinned = bc.clone();
        let images = BuildExecutor::new(&cluster, None)
            .pin_inputs(&mut pinned)
            .await
            .unwrap();
        let hash = fingerprint("tree-of-app", &images, Some("template-of-app"))
            .unwrap()
            .hex();
        let env = format!("{}={}", BUILD_HASH_ENV, hash);
        cluster.with_image("app", "latest", "sha256:old", &[&env, "OPENSHIFT_BUILD_NAME=app-1"]);
        cluster.with_image("app", "prod", "sha256:new", &[&env, "OPENSHIFT_BUILD_NAME=app-2"]);

        let result = BuildExecutor::new(&cluster, None).run(bc).await.unwrap();
        assert!(!result.new_build);
        assert_eq!(
            result.image_stream_image.name.as_deref(),
            Some("app@sha256:new")
        );
        assert_eq!(result.build.unwrap().name.as_deref(), Some("app-2"));
    }

    #[tokio::test]
    async fn binary_source_is_uploaded_and_cleaned_up() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("web")).unwrap();
        std::fs::write(dir.path().join("web/index.html"), "<p>hi</p>").unwrap();

        let cluster = FakeCluster::new(dir.path());
        let mut bc: BuildConfig = build_config("web", "web:latest", &[]).cast().unwrap();
        bc.spec.source.source_type = Some("Binary".to_string());
        bc.spec.source.context_dir = Some("web".to_string());

        let result = BuildExecutor::new(&cluster, None).run(bc).await.unwrap();
        assert!(result.new_build);
        let archives = cluster.archives();
        assert_eq!(archives.len(), 1);
        let (path, existed) = &archives[0];
        assert!(existed);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn one_changed_byte_in_a_binary_source_rebuilds() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("web")).unwrap();
        std::fs::write(dir.path().join("web/index.html"), "<p>hi</p>").unwrap();

        let cluster = FakeCluster::new(dir.path());
        let mut bc: BuildConfig = build_config("web", "web:latest", &[]).cast().unwrap();
        bc.spec.source.source_type = Some("Binary".to_string());
        bc.spec.source.context_dir = Some("web".to_string());
        let executor = BuildExecutor::new(&cluster, None);

        let first = executor.run(bc.clone()).await.unwrap();
        assert!(first.new_build);
        let second = executor.run(bc.clone()).await.unwrap();
        assert!(!second.new_build);
        assert_eq!(first.image_stream_image, second.image_stream_image);

        std::fs::write(dir.path().join("web/index.html"), "<p>ho</p>").unwrap();
        let third = executor.run(bc).await.unwrap();
        assert!(third.new_build);
        assert_ne!(first.image_stream_image, third.image_stream_image);
        assert_eq!(cluster.builds_started(), ["web", "web"]);
    }

    #[test]
    fn archive_entries_are_prefixed_with_the_context_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("web/css")).unwrap();
        std::fs::write(dir.path().join("web/css/site.css"), "body {}").unwrap();
        let dest = dir.path().join("out.tar");

        write_archive(dir.path(), "web", &dest).unwrap();
        let mut archive = tar::Archive::new(File::open(&dest).unwrap());
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().display().to_string())
            .collect();
        assert!(names.contains(&"web/css/site.css".to_string()), "{names:?}");
    }

    #[tokio::test]
    async fn failed_build_is_an_error() {
        let cluster = FakeCluster::default();
        let bc = app(&cluster);
        cluster.fail_build("app");
        let err = BuildExecutor::new(&cluster, None).run(bc).await.unwrap_err();
        assert!(matches!(err, Error::Gateway { .. }), "{err}");
    }

    #[tokio::test]
    async fn build_timeout_is_reported() {
        let cluster = FakeCluster::default();
        let bc = app(&cluster);
        cluster.hang_build("app");
        let err = BuildExecutor::new(&cluster, Some(Duration::from_millis(20)))
            .run(bc)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }), "{err}");
    }
}
