//! In-memory [`ClusterGateway`] for tests.
//!
//! Builds complete instantly (after one yield so concurrent builds interleave)
//! and produce an ImageStreamImage carrying the fingerprint env var, just like
//! a real build does.

use std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use serde_json::{json, Value};

use super::{ClusterGateway, GetOptions, LineStream, StartBuild};
use crate::error::{Error, Result};
use crate::resource::{
    image_stream_name, BuildConfig, FullName, Kind, List, Resource, Resources, BUILD_HASH_ENV,
    BUILD_NAMESPACE_ENV, BUILD_NAME_ENV,
};

pub const NAMESPACE: &str = "tools";

pub fn image_stream(name: &str) -> Resource {
    serde_json::from_value(json!({
        "apiVersion": "image.openshift.io/v1",
        "kind": "ImageStream",
        "metadata": {"name": name, "namespace": NAMESPACE},
    }))
    .unwrap()
}

/// Git sourced BuildConfig with a source strategy. The first input becomes
/// the strategy `from`, the rest go to `spec.source.images`.
pub fn build_config(name: &str, output: &str, inputs: &[&str]) -> Resource {
    let mut strategy = json!({"env": []});
    if let Some(first) = inputs.first() {
        strategy["from"] = json!({"kind": "ImageStreamTag", "name": first});
    }
    let images: Vec<Value> = inputs
        .iter()
        .skip(1)
        .map(|i| json!({"from": {"kind": "ImageStreamTag", "name": i}}))
        .collect();
    serde_json::from_value(json!({
        "apiVersion": "build.openshift.io/v1",
        "kind": "BuildConfig",
        "metadata": {
            "name": name,
            "namespace": NAMESPACE,
            "labels": {"template-hash": format!("template-of-{}", name)},
        },
        "spec": {
            "output": {"to": {"kind": "ImageStreamTag", "name": output}},
            "source": {"type": "Git", "contextDir": name, "images": images},
            "strategy": {"type": "Source", "sourceStrategy": strategy},
        },
    }))
    .unwrap()
}

pub fn deployment_config(name: &str, app: &str, replicas: i32) -> Resource {
    serde_json::from_value(json!({
        "apiVersion": "apps.openshift.io/v1",
        "kind": "DeploymentConfig",
        "metadata": {"name": name, "namespace": NAMESPACE, "labels": {"app": app}},
        "spec": {"replicas": replicas},
        "status": {"latestVersion": 1},
    }))
    .unwrap()
}

/// Status of a DeploymentConfig whose every replica is up.
pub fn rolled_out(replicas: i32) -> Value {
    json!({
        "replicas": replicas,
        "readyReplicas": replicas,
        "availableReplicas": replicas,
        "unavailableReplicas": 0,
        "conditions": [{"type": "Available", "status": "True"}],
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Started(String),
    Finished(String),
}

#[derive(Default)]
struct State {
    objects: BTreeMap<FullName, Resource>,
    tree_hashes: HashMap<String, String>,
    events: Vec<Event>,
    applied: Vec<String>,
    fail_builds: HashSet<String>,
    hang_builds: HashSet<String>,
    /// Whether the archive file existed while its build ran.
    archives: Vec<(PathBuf, bool)>,
    in_flight: usize,
    max_in_flight: usize,
    counter: u64,
    rollout_script: VecDeque<(String, Value)>,
    watches_terminated: usize,
    resource_version: u64,
    /// `import-image`, `tag` and `tag --delete` calls, in order.
    tag_calls: Vec<String>,
}

#[derive(Clone)]
pub struct FakeCluster {
    state: Arc<Mutex<State>>,
    cwd: PathBuf,
}

impl Default for FakeCluster {
    fn default() -> Self {
        Self::new(".")
    }
}

impl FakeCluster {
    pub fn new(cwd: impl Into<PathBuf>) -> Self {
        Self {
            state: Default::default(),
            cwd: cwd.into(),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn insert(&self, mut resource: Resource) {
        resource
            .metadata
            .namespace
            .get_or_insert_with(|| NAMESPACE.to_string());
        self.state().objects.insert(resource.full_name(), resource);
    }

    pub fn object(&self, full_name: &str) -> Option<Resource> {
        self.state()
            .objects
            .values()
            .find(|r| r.full_name().as_str() == full_name)
            .cloned()
    }

    /// An image already present under `stream:tag`, as if built or imported earlier.
    pub fn with_image(&self, stream: &str, tag: &str, digest: &str, env: &[&str]) -> &Self {
        let env: Vec<String> = env.iter().map(|e| e.to_string()).collect();
        let mut state = self.state();
        let created = state.next_timestamp();
        state.add_image(stream, tag, digest, env, created);
        drop(state);
        self
    }

    pub fn set_tree_hash(&self, subpath: &str, hash: &str) {
        self.state()
            .tree_hashes
            .insert(subpath.to_string(), hash.to_string());
    }

    pub fn fail_build(&self, build_config: &str) {
        self.state().fail_builds.insert(build_config.to_string());
    }

    /// Builds of `build_config` never finish.
    pub fn hang_build(&self, build_config: &str) {
        self.state().hang_builds.insert(build_config.to_string());
    }

    /// Each watch line first merges `status` into the named DeploymentConfig.
    pub fn script_rollout(&self, deployment_config: &str, status: Value) {
        self.state()
            .rollout_script
            .push_back((deployment_config.to_string(), status));
    }

    pub fn events(&self) -> Vec<Event> {
        self.state().events.clone()
    }

    pub fn builds_started(&self) -> Vec<String> {
        self.state()
            .events
            .iter()
            .filter_map(|e| match e {
                Event::Started(name) => Some(name.clone()),
                Event::Finished(_) => None,
            })
            .collect()
    }

    pub fn applied(&self) -> Vec<String> {
        self.state().applied.clone()
    }

    pub fn archives(&self) -> Vec<(PathBuf, bool)> {
        self.state().archives.clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.state().max_in_flight
    }

    pub fn watches_terminated(&self) -> usize {
        self.state().watches_terminated
    }

    pub fn tag_calls(&self) -> Vec<String> {
        self.state().tag_calls.clone()
    }

    /// Digest `stream:tag` currently points at.
    pub fn tagged(&self, stream: &str, tag: &str) -> Option<String> {
        self.state().tag_history(stream, tag)?.first().cloned()
    }
}

impl State {
    fn next_timestamp(&mut self) -> String {
        self.counter += 1;
        format!(
            "2023-01-01T{:02}:{:02}:{:02}Z",
            self.counter / 3600,
            (self.counter / 60) % 60,
            self.counter % 60
        )
    }

    fn add_image(
        &mut self,
        stream: &str,
        tag: &str,
        digest: &str,
        env: Vec<String>,
        created: String,
    ) {
        self.point_tag(stream, tag, digest, &created);

        let isi_name = format!("{}@{}", stream, digest);
        let isi: Resource = serde_json::from_value(json!({
            "apiVersion": "image.openshift.io/v1",
            "kind": "ImageStreamImage",
            "metadata": {"name": isi_name, "namespace": NAMESPACE, "creationTimestamp": created},
            "image": {
                "metadata": {"name": digest, "creationTimestamp": created},
                "dockerImageReference": format!("registry/{}/{}@{}", NAMESPACE, stream, digest),
                "dockerImageMetadata": {"Config": {"Env": env}},
            },
        }))
        .unwrap();
        self.objects.insert(isi.full_name(), isi);
    }

    fn status_tags(&mut self, stream: &str) -> &mut Vec<Value> {
        let is = self
            .objects
            .entry(FullName::new(&Kind::ImageStream, stream))
            .or_insert_with(|| image_stream(stream));
        let status = is.body.entry("status").or_insert_with(|| {
            json!({
                "dockerImageRepository": format!("registry/{}/{}", NAMESPACE, stream),
                "tags": [],
            })
        });
        status["tags"].as_array_mut().unwrap()
    }

    fn point_tag(&mut self, stream: &str, tag: &str, digest: &str, created: &str) {
        let tags = self.status_tags(stream);
        let event = json!({"image": digest, "created": created});
        match tags.iter_mut().find(|t| t["tag"] == tag) {
            Some(t) => t["items"].as_array_mut().unwrap().insert(0, event),
            None => tags.push(json!({"tag": tag, "items": [event]})),
        }
    }

    /// Digests `stream:tag` pointed at, newest first.
    fn tag_history(&self, stream: &str, tag: &str) -> Option<Vec<String>> {
        let is = self
            .objects
            .get(&FullName::new(&Kind::ImageStream, stream))?;
        let items = is.body.get("status")?["tags"]
            .as_array()?
            .iter()
            .find(|t| t["tag"] == tag)?["items"]
            .as_array()?;
        Some(
            items
                .iter()
                .filter_map(|i| i["image"].as_str().map(String::from))
                .collect(),
        )
    }

    /// Latest image behind `stream:tag`, presented as an ImageStreamTag.
    fn image_stream_tag(&self, name: &str) -> Option<Resource> {
        let (stream, tag) = name.split_once(':')?;
        let digest = self.tag_history(stream, tag)?.into_iter().next()?;
        let isi = self
            .objects
            .get(&FullName::new(&Kind::ImageStreamImage, &format!("{}@{}", stream, digest)))?;
        let mut ist = isi.clone();
        ist.kind = Kind::ImageStreamTag;
        ist.metadata.name = Some(name.to_string());
        Some(ist)
    }

    fn lookup(&self, name: &str) -> Option<Resource> {
        let (kind, name) = name.split_once('/')?;
        let kind = Kind::from(kind);
        if kind == Kind::ImageStreamTag {
            return self.image_stream_tag(name);
        }
        self.objects.get(&FullName::new(&kind, name)).cloned()
    }

    fn not_found(name: &str) -> Error {
        Error::Gateway {
            command: format!("oc get {}", name),
            code: 1,
            stderr: format!("Error from server (NotFound): {} not found", name),
        }
    }

    fn complete_build(&mut self, request: &StartBuild) -> Result<Resource> {
        let key = FullName::new(&Kind::BuildConfig, &request.build_config);
        let bc: BuildConfig = self
            .objects
            .get(&key)
            .ok_or_else(|| Self::not_found(key.as_str()))?
            .cast()?;
        let output = bc
            .output_to()
            .and_then(|o| o.name.clone())
            .unwrap_or_default();
        let stream = image_stream_name(&output).to_string();
        let tag = output.split_once(':').map(|(_, t)| t).unwrap_or("latest");

        let created = self.next_timestamp();
        let digest = format!("sha256:{:064x}", self.counter);
        let build_name = format!("{}-{}", request.build_config, self.counter);
        let mut env = vec![
            format!("{}={}", BUILD_NAME_ENV, build_name),
            format!("{}={}", BUILD_NAMESPACE_ENV, NAMESPACE),
        ];
        if let Some(hash) = bc.env(BUILD_HASH_ENV) {
            env.push(format!("{}={}", BUILD_HASH_ENV, hash));
        }
        self.add_image(&stream, tag, &digest, env, created.clone());

        let build: Resource = serde_json::from_value(json!({
            "apiVersion": "build.openshift.io/v1",
            "kind": "Build",
            "metadata": {"name": build_name, "namespace": NAMESPACE, "creationTimestamp": created},
            "spec": {"output": {"to": {"kind": "ImageStreamTag", "name": output}}},
            "status": {"phase": "Complete", "output": {"to": {"imageDigest": digest}}},
        }))?;
        self.objects.insert(build.full_name(), build.clone());
        Ok(build)
    }
}

#[async_trait::async_trait]
impl ClusterGateway for FakeCluster {
    async fn get(&self, names: &[String], options: &GetOptions) -> Result<Option<Resources>> {
        let state = self.state();
        if let Some(selector) = &options.selector {
            let (key, value) = selector.split_once('=').unwrap_or((selector.as_str(), ""));
            let kinds: Vec<Kind> = names.iter().map(|n| Kind::from(n.as_str())).collect();
            let items = state
                .objects
                .values()
                .filter(|r| kinds.contains(&r.kind) && r.label(key) == Some(value))
                .cloned()
                .collect();
            return Ok(Some(Resources::Collection(List::new(items))));
        }

        let mut items = Vec::new();
        for name in names {
            match state.lookup(name) {
                Some(found) => items.push(found),
                None if options.ignore_not_found => {}
                None => return Err(State::not_found(name)),
            }
        }
        if items.is_empty() {
            return Ok(None);
        }
        if names.len() == 1 {
            return Ok(items.pop().map(Resources::Single));
        }
        Ok(Some(Resources::Collection(List::new(items))))
    }

    async fn apply(&self, resources: &Resources) -> Result<Resources> {
        let mut state = self.state();
        let mut applied = Vec::new();
        for item in resources.items() {
            let mut item = item.clone();
            item.metadata
                .namespace
                .get_or_insert_with(|| NAMESPACE.to_string());
            let key = item.full_name();
            let live_version = state
                .objects
                .get(&key)
                .and_then(|live| live.metadata.resource_version.clone());
            if item.metadata.resource_version.is_some()
                && item.metadata.resource_version != live_version
            {
                return Err(Error::Gateway {
                    command: format!("oc apply {}", key),
                    code: 1,
                    stderr: format!(
                        "Operation cannot be fulfilled on {}: the object has been modified",
                        key
                    ),
                });
            }
            state.resource_version += 1;
            item.metadata.resource_version = Some(state.resource_version.to_string());
            state.applied.push(key.to_string());
            if item.kind == Kind::DeploymentConfig {
                let previous = state.objects.get(&key);
                let version = previous
                    .and_then(|p| p.body.get("status"))
                    .and_then(|s| s["latestVersion"].as_i64())
                    .unwrap_or(0);
                let changed =
                    previous.map_or(true, |p| p.body.get("spec") != item.body.get("spec"));
                let status = match (changed, previous) {
                    (false, Some(p)) => p.body.get("status").cloned().unwrap_or(Value::Null),
                    _ => json!({"latestVersion": version + 1}),
                };
                item.body.insert("status".to_string(), status);
            }
            state.objects.insert(key, item.clone());
            applied.push(item);
        }
        Ok(resources.reshape(applied))
    }

    async fn start_build(&self, request: &StartBuild) -> Result<Resource> {
        let hang = {
            let mut state = self.state();
            state
                .events
                .push(Event::Started(request.build_config.clone()));
            state.in_flight += 1;
            state.max_in_flight = state.max_in_flight.max(state.in_flight);
            if let Some(archive) = &request.from_archive {
                let exists = archive.exists();
                state.archives.push((archive.clone(), exists));
            }
            state.hang_builds.contains(&request.build_config)
        };
        if hang {
            std::future::pending::<()>().await;
        }
        tokio::task::yield_now().await;

        let mut state = self.state();
        state.in_flight -= 1;
        state
            .events
            .push(Event::Finished(request.build_config.clone()));
        if state.fail_builds.contains(&request.build_config) {
            return Err(Error::Gateway {
                command: format!("oc start-build {}", request.build_config),
                code: 1,
                stderr: format!("build {} failed", request.build_config),
            });
        }
        state.complete_build(request)
    }

    async fn watch(
        &self,
        resource: &str,
        _selector: &str,
        _template: &str,
    ) -> Result<Box<dyn LineStream>> {
        Ok(Box::new(FakeWatch {
            cluster: self.clone(),
            kind: Kind::from(resource),
            terminated: false,
        }))
    }

    async fn import_image(&self, target: &str, from: &str) -> Result<()> {
        let mut state = self.state();
        state.tag_calls.push(format!("import-image {} --from={}", target, from));
        let (stream, tag) = target.split_once(':').unwrap_or((target, "latest"));
        let digest = from
            .split_once('@')
            .map(|(_, d)| d)
            .ok_or_else(|| Error::Unexpected(format!("{} has no digest", from)))?;
        let env = state
            .objects
            .values()
            .filter(|r| r.kind == Kind::ImageStreamImage)
            .find(|r| r.name().ends_with(&format!("@{}", digest)))
            .and_then(|r| r.cast::<crate::resource::ImageStreamImage>().ok())
            .map(|isi| isi.image.env().to_vec())
            .unwrap_or_default();
        let created = state.next_timestamp();
        state.add_image(stream, tag, digest, env, created);
        Ok(())
    }

    async fn tag(&self, source: &str, target: &str) -> Result<()> {
        let mut state = self.state();
        state.tag_calls.push(format!("tag {} {}", source, target));
        let (stream, digest) = source
            .split_once('@')
            .ok_or_else(|| Error::Unexpected(format!("{} is not pinned", source)))?;
        let isi = FullName::new(&Kind::ImageStreamImage, source);
        if !state.objects.contains_key(&isi) {
            return Err(State::not_found(isi.as_str()));
        }
        let (target_stream, tag) = target.split_once(':').unwrap_or((target, "latest"));
        if target_stream != stream {
            return Err(Error::Unexpected(format!("cannot tag {} as {}", source, target)));
        }
        let created = state.next_timestamp();
        state.point_tag(stream, tag, digest, &created);
        Ok(())
    }

    async fn delete_tag(&self, tag: &str) -> Result<()> {
        let mut state = self.state();
        state.tag_calls.push(format!("tag {} --delete", tag));
        let (stream, tag) = tag.split_once(':').unwrap_or((tag, "latest"));
        state.status_tags(stream).retain(|t| t["tag"] != tag);
        Ok(())
    }

    async fn logs(
        &self,
        build: &str,
        _namespace: Option<&str>,
        timestamps: bool,
    ) -> Result<String> {
        let state = self.state();
        let found = state.lookup(build).ok_or_else(|| State::not_found(build))?;
        let stamp = match found.metadata.creation_timestamp {
            Some(t) if timestamps => format!("{} ", t.0.to_rfc3339()),
            _ => String::new(),
        };
        Ok(format!("{}building {}\n{}push successful\n", stamp, build, stamp))
    }

    async fn source_tree_hash(&self, _git_ref: &str, subpath: &str) -> Result<String> {
        Ok(self
            .state()
            .tree_hashes
            .get(subpath)
            .cloned()
            .unwrap_or_else(|| format!("tree-of-{}", subpath)))
    }

    fn cwd(&self) -> &Path {
        &self.cwd
    }
}

/// Plays back the rollout script, then waits forever like `oc get --watch`.
struct FakeWatch {
    cluster: FakeCluster,
    kind: Kind,
    terminated: bool,
}

#[async_trait::async_trait]
impl LineStream for FakeWatch {
    async fn next_line(&mut self) -> Result<Option<String>> {
        if self.terminated {
            return Ok(None);
        }
        let step = self.cluster.state().rollout_script.pop_front();
        let Some((name, status)) = step else {
            std::future::pending::<()>().await;
            return Ok(None);
        };
        tokio::task::yield_now().await;
        let mut state = self.cluster.state();
        if let Some(dc) = state.objects.get_mut(&FullName::new(&self.kind, &name)) {
            let current = dc.body.entry("status").or_insert_with(|| json!({}));
            if let (Some(current), Value::Object(patch)) = (current.as_object_mut(), status) {
                current.extend(patch);
            }
        }
        Ok(Some(format!("{}\t...", name)))
    }

    async fn terminate(&mut self) -> Result<()> {
        if !self.terminated {
            self.terminated = true;
            self.cluster.state().watches_terminated += 1;
        }
        Ok(())
    }
}
