//! Typed views over the OpenShift resources the pipeline touches.
//!
//! A [`Resource`] keeps everything it does not understand in `body`, so a
//! value read from the cluster can be written back without losing fields.
//! The typed views (`BuildConfig`, `ImageStream`, ...) are obtained with
//! [`Resource::cast`] and turned back with [`Resource::from_typed`].

use std::fmt::{Debug, Display, Formatter};

use k8s_openapi::api::apps::v1::DeploymentCondition;
use k8s_openapi::api::core::v1::{EnvVar, ObjectReference};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::core::ObjectMeta;
use serde::{de::DeserializeOwned, Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

/// Environment variable carrying the build fingerprint into the produced image.
pub const BUILD_HASH_ENV: &str = "_BUILD_HASH";
pub const BUILD_NAME_ENV: &str = "OPENSHIFT_BUILD_NAME";
pub const BUILD_NAMESPACE_ENV: &str = "OPENSHIFT_BUILD_NAMESPACE";

pub const TEMPLATE_HASH_LABEL: &str = "template-hash";
pub const SOURCE_HASH_LABEL: &str = "source-hash";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Kind {
    BuildConfig,
    ImageStream,
    ImageStreamTag,
    ImageStreamImage,
    Build,
    DeploymentConfig,
    List,
    Secret,
    ConfigMap,
    Route,
    Other(String),
}

impl Kind {
    pub fn as_str(&self) -> &str {
        match self {
            Kind::BuildConfig => "BuildConfig",
            Kind::ImageStream => "ImageStream",
            Kind::ImageStreamTag => "ImageStreamTag",
            Kind::ImageStreamImage => "ImageStreamImage",
            Kind::Build => "Build",
            Kind::DeploymentConfig => "DeploymentConfig",
            Kind::List => "List",
            Kind::Secret => "Secret",
            Kind::ConfigMap => "ConfigMap",
            Kind::Route => "Route",
            Kind::Other(s) => s.as_str(),
        }
    }
}

impl From<&str> for Kind {
    fn from(s: &str) -> Self {
        match s {
            "BuildConfig" => Kind::BuildConfig,
            "ImageStream" => Kind::ImageStream,
            "ImageStreamTag" => Kind::ImageStreamTag,
            "ImageStreamImage" => Kind::ImageStreamImage,
            "Build" => Kind::Build,
            "DeploymentConfig" => Kind::DeploymentConfig,
            "List" => Kind::List,
            "Secret" => Kind::Secret,
            "ConfigMap" => Kind::ConfigMap,
            "Route" => Kind::Route,
            other => Kind::Other(other.to_string()),
        }
    }
}

impl From<String> for Kind {
    fn from(s: String) -> Self {
        Kind::from(s.as_str())
    }
}

impl From<Kind> for String {
    fn from(k: Kind) -> Self {
        k.as_str().to_string()
    }
}

impl Display for Kind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// `kind/name`, the lookup key of a resource within one scheduling run.
#[derive(Clone, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FullName(String);

impl FullName {
    pub fn new(kind: &Kind, name: &str) -> Self {
        Self(format!("{}/{}", kind, name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for FullName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Debug for FullName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// `name:tag` and `name@digest` both belong to ImageStream `name`.
pub fn image_stream_name(reference: &str) -> &str {
    reference
        .split(|c: char| c == ':' || c == '@')
        .next()
        .unwrap_or(reference)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    pub kind: Kind,
    #[serde(default)]
    pub metadata: ObjectMeta,
    /// spec, status, data, image, ... whatever the kind carries.
    #[serde(flatten)]
    pub body: Map<String, Value>,
}

impl Resource {
    pub fn new(kind: Kind, name: &str) -> Self {
        Self {
            api_version: None,
            kind,
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            body: Map::new(),
        }
    }

    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }

    pub fn namespace(&self) -> Option<&str> {
        self.metadata.namespace.as_deref()
    }

    pub fn full_name(&self) -> FullName {
        FullName::new(&self.kind, self.name())
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.metadata.labels.as_ref()?.get(key).map(String::as_str)
    }

    pub fn set_label(&mut self, key: &str, value: impl Into<String>) {
        self.metadata
            .labels
            .get_or_insert_with(Default::default)
            .insert(key.to_string(), value.into());
    }

    /// Reinterpret as one of the typed views below.
    pub fn cast<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(serde_json::to_value(self)?)
    }

    pub fn from_typed<T: Serialize>(typed: &T) -> Result<Self, serde_json::Error> {
        serde_json::from_value(serde_json::to_value(typed)?)
    }
}

/// A `kind: List` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct List {
    #[serde(default = "default_list_api_version")]
    pub api_version: String,
    #[serde(default = "default_list_kind")]
    pub kind: Kind,
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub items: Vec<Resource>,
}

impl List {
    pub fn new(items: Vec<Resource>) -> Self {
        Self {
            api_version: default_list_api_version(),
            kind: Kind::List,
            metadata: ObjectMeta::default(),
            items,
        }
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.metadata.labels.as_ref()?.get(key).map(String::as_str)
    }
}

fn default_list_api_version() -> String {
    "v1".to_string()
}

fn default_list_kind() -> Kind {
    Kind::List
}

/// What the CLI hands back: sometimes one resource, sometimes a List of them.
#[derive(Debug, Clone, PartialEq)]
pub enum Resources {
    Single(Resource),
    Collection(List),
}

impl Resources {
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        if value.get("kind").and_then(Value::as_str) == Some(Kind::List.as_str()) {
            Ok(Resources::Collection(serde_json::from_value(value)?))
        } else {
            Ok(Resources::Single(serde_json::from_value(value)?))
        }
    }

    pub fn items(&self) -> &[Resource] {
        match self {
            Resources::Single(r) => std::slice::from_ref(r),
            Resources::Collection(l) => &l.items,
        }
    }

    pub fn items_mut(&mut self) -> &mut [Resource] {
        match self {
            Resources::Single(r) => std::slice::from_mut(r),
            Resources::Collection(l) => &mut l.items,
        }
    }

    pub fn into_items(self) -> Vec<Resource> {
        match self {
            Resources::Single(r) => vec![r],
            Resources::Collection(l) => l.items,
        }
    }

    /// Same shape as `self`, populated with `items`.
    pub fn reshape(&self, mut items: Vec<Resource>) -> Resources {
        match self {
            Resources::Single(_) if items.len() == 1 => Resources::Single(items.remove(0)),
            Resources::Single(_) => Resources::Collection(List::new(items)),
            Resources::Collection(list) => Resources::Collection(List {
                items,
                ..list.clone()
            }),
        }
    }
}

impl Serialize for Resources {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Resources::Single(r) => r.serialize(serializer),
            Resources::Collection(l) => l.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for Resources {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Resources::from_value(value).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildConfig {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: BuildConfigSpec,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildConfigSpec {
    #[serde(default)]
    pub output: BuildOutput,
    #[serde(default)]
    pub source: BuildSource,
    #[serde(default)]
    pub strategy: BuildStrategy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triggers: Option<Vec<Value>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildOutput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<ObjectReference>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildSource {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub source_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<ImageSource>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageSource {
    pub from: ObjectReference,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildStrategy {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub strategy_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_strategy: Option<StrategyOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker_strategy: Option<StrategyOptions>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<ObjectReference>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceType {
    Binary,
    Git,
    Other,
}

impl BuildConfig {
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }

    pub fn full_name(&self) -> FullName {
        FullName::new(&Kind::BuildConfig, self.name())
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.metadata.labels.as_ref()?.get(key).map(String::as_str)
    }

    pub fn source_type(&self) -> SourceType {
        match self.spec.source.source_type.as_deref() {
            Some("Binary") => SourceType::Binary,
            Some("Git") => SourceType::Git,
            _ => SourceType::Other,
        }
    }

    pub fn context_dir(&self) -> &str {
        self.spec.source.context_dir.as_deref().unwrap_or_default()
    }

    /// Source strategy wins over docker strategy when both are present.
    pub fn strategy(&self) -> Option<&StrategyOptions> {
        let strategy = &self.spec.strategy;
        strategy
            .source_strategy
            .as_ref()
            .or(strategy.docker_strategy.as_ref())
    }

    pub fn strategy_mut(&mut self) -> Option<&mut StrategyOptions> {
        let strategy = &mut self.spec.strategy;
        match strategy.source_strategy {
            Some(ref mut s) => Some(s),
            None => strategy.docker_strategy.as_mut(),
        }
    }

    pub fn output_to(&self) -> Option<&ObjectReference> {
        self.spec.output.to.as_ref()
    }

    /// The strategy's `from` followed by every `spec.source.images[].from`.
    pub fn input_images(&self) -> Vec<&ObjectReference> {
        self.strategy()
            .and_then(|s| s.from.as_ref())
            .into_iter()
            .chain(self.spec.source.images.iter().map(|i| &i.from))
            .collect()
    }

    pub fn input_images_mut(&mut self) -> Vec<&mut ObjectReference> {
        let BuildConfigSpec {
            source, strategy, ..
        } = &mut self.spec;
        let from = match strategy.source_strategy {
            Some(ref mut s) => s.from.as_mut(),
            None => strategy.docker_strategy.as_mut().and_then(|s| s.from.as_mut()),
        };
        from.into_iter()
            .chain(source.images.iter_mut().map(|i| &mut i.from))
            .collect()
    }

    /// Set `name` in the strategy environment. An existing entry keeps its
    /// position and gets the new value; everything else is left alone.
    pub fn set_env(&mut self, name: &str, value: &str) {
        let Some(strategy) = self.strategy_mut() else {
            return;
        };
        match strategy.env.iter_mut().find(|e| e.name == name) {
            Some(existing) => {
                existing.value = Some(value.to_string());
                existing.value_from = None;
            }
            None => strategy.env.push(EnvVar {
                name: name.to_string(),
                value: Some(value.to_string()),
                ..Default::default()
            }),
        }
    }

    pub fn env(&self, name: &str) -> Option<&str> {
        self.strategy()?
            .env
            .iter()
            .find(|e| e.name == name)
            .and_then(|e| e.value.as_deref())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageStream {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub status: ImageStreamStatus,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageStreamStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker_image_repository: Option<String>,
    #[serde(default)]
    pub tags: Vec<NamedTagEventList>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NamedTagEventList {
    pub tag: String,
    #[serde(default)]
    pub items: Vec<TagEvent>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TagEvent {
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker_image_reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<Time>,
}

/// Shared by ImageStreamTag and ImageStreamImage, both embed the image.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageStreamImage {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub image: Image,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

pub type ImageStreamTag = ImageStreamImage;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Image {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker_image_reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker_image_metadata: Option<DockerImageMetadata>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DockerImageMetadata {
    #[serde(rename = "Config", default, skip_serializing_if = "Option::is_none")]
    pub config: Option<DockerConfig>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DockerConfig {
    #[serde(rename = "Env", default)]
    pub env: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Image {
    /// `NAME=value` lines baked into the image, empty when metadata is missing.
    pub fn env(&self) -> &[String] {
        self.docker_image_metadata
            .as_ref()
            .and_then(|m| m.config.as_ref())
            .map(|c| c.env.as_slice())
            .unwrap_or_default()
    }

    pub fn env_value(&self, name: &str) -> Option<&str> {
        self.env().iter().find_map(|line| {
            let (k, v) = line.split_once('=')?;
            (k == name).then_some(v)
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Build {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: BuildSpec,
    #[serde(default)]
    pub status: BuildStatus,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildSpec {
    #[serde(default)]
    pub output: BuildOutput,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<BuildStatusOutput>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildStatusOutput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<BuildStatusOutputTo>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildStatusOutputTo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_digest: Option<String>,
}

impl Build {
    pub fn image_digest(&self) -> Option<&str> {
        self.status.output.as_ref()?.to.as_ref()?.image_digest.as_deref()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentConfig {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: DeploymentConfigSpec,
    #[serde(default)]
    pub status: DeploymentConfigStatus,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentConfigSpec {
    #[serde(default)]
    pub replicas: Option<i32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentConfigStatus {
    #[serde(default)]
    pub replicas: Option<i32>,
    #[serde(default)]
    pub ready_replicas: Option<i32>,
    #[serde(default)]
    pub available_replicas: Option<i32>,
    #[serde(default)]
    pub unavailable_replicas: Option<i32>,
    #[serde(default)]
    pub latest_version: Option<i64>,
    #[serde(default)]
    pub conditions: Vec<DeploymentCondition>,
}

impl DeploymentConfig {
    /// Available, every replica count equal to the desired count, none unavailable.
    pub fn is_rolled_out(&self) -> bool {
        let available = self
            .status
            .conditions
            .iter()
            .any(|c| c.type_ == "Available" && c.status == "True");
        let desired = self.spec.replicas.unwrap_or(0);
        let status = &self.status;
        available
            && status.replicas.unwrap_or(0) == desired
            && status.ready_replicas.unwrap_or(0) == desired
            && status.available_replicas.unwrap_or(0) == desired
            && status.unavailable_replicas.unwrap_or(0) == 0
    }
}

pub fn metadata_reference(kind: Kind, meta: &ObjectMeta) -> ObjectReference {
    ObjectReference {
        kind: Some(kind.to_string()),
        name: meta.name.clone(),
        namespace: meta.namespace.clone(),
        ..Default::default()
    }
}
