//! Per-run index of the input List and the BuildConfig dependency graph.
//!
//! A BuildConfig depends on another when it consumes an ImageStream the other
//! one produces. ImageStreams nobody in the List produces are external base
//! images and never block anything.

use std::collections::HashMap;

use k8s_openapi::api::core::v1::ObjectReference;
use petgraph::{algo::tarjan_scc, graph::NodeIndex, prelude::DiGraph};
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::resource::{image_stream_name, BuildConfig, FullName, Kind, Resource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// Not looked at yet.
    Pending,
    /// Looked at, but a producer it depends on is not done.
    Blocked,
    /// Handed to the executor, outcome outstanding.
    Dispatched,
    /// Output image known, either reused or freshly built.
    Done,
}

#[derive(Debug, Clone)]
pub struct Entry {
    pub full_name: FullName,
    pub item: Resource,
    /// For ImageStreams: the BuildConfig in this run that outputs to it.
    pub producer: Option<FullName>,
}

#[derive(Debug, Clone)]
pub struct BuildConfigEntry {
    pub full_name: FullName,
    pub build_config: BuildConfig,
    /// ImageStreams consumed from this namespace, in strategy-then-source-images order.
    pub dependencies: Vec<FullName>,
    pub state: EntryState,
    pub image_stream_image: Option<ObjectReference>,
    pub build: Option<ObjectReference>,
    node: NodeIndex,
}

/// Everything known about one scheduling run. Created per run, never shared
/// between runs.
#[derive(Debug, Default)]
pub struct RunContext {
    entries: HashMap<FullName, Entry>,
    build_configs: Vec<BuildConfigEntry>,
    positions: HashMap<FullName, usize>,
    /// BuildConfig nodes, edges run producer -> consumer, weighted by the ImageStream.
    graph: DiGraph<FullName, FullName>,
}

impl RunContext {
    pub fn index(items: &[Resource]) -> Result<Self> {
        let mut ctx = RunContext::default();
        let mut build_configs = Vec::new();

        for item in items {
            let full_name = item.full_name();
            trace!("Indexing {} - {:?}", full_name, item.namespace());
            if item.kind == Kind::BuildConfig {
                build_configs.push(item);
            }
            let entry = Entry {
                full_name: full_name.clone(),
                item: item.clone(),
                producer: None,
            };
            if ctx.entries.insert(full_name.clone(), entry).is_some() {
                warn!("{} appears more than once, the last one wins", full_name);
            }
        }

        for item in build_configs {
            let full_name = item.full_name();
            let build_config: BuildConfig = item
                .cast()
                .map_err(|e| Error::configuration(full_name.as_str(), e.to_string()))?;
            if ctx.positions.contains_key(&full_name) {
                return Err(Error::configuration(
                    full_name.as_str(),
                    "appears more than once in the List",
                ));
            }
            let node = ctx.graph.add_node(full_name.clone());
            ctx.positions
                .insert(full_name.clone(), ctx.build_configs.len());
            ctx.build_configs.push(BuildConfigEntry {
                full_name,
                build_config,
                dependencies: Vec::new(),
                state: EntryState::Pending,
                image_stream_image: None,
                build: None,
                node,
            });
        }

        for i in 0..ctx.build_configs.len() {
            ctx.link_output(i)?;
        }
        for i in 0..ctx.build_configs.len() {
            ctx.link_inputs(i)?;
        }
        Ok(ctx)
    }

    /// Register the BuildConfig as producer of its output ImageStream.
    fn link_output(&mut self, i: usize) -> Result<()> {
        let bc = &self.build_configs[i];
        let full_name = bc.full_name.clone();
        debug!("Analyzing {}", full_name);

        let output_to = bc.build_config.output_to().ok_or_else(|| {
            Error::configuration(full_name.as_str(), "missing .spec.output.to")
        })?;
        let kind = output_to.kind.as_deref().unwrap_or_default();
        if kind != Kind::ImageStreamTag.as_str() {
            return Err(Error::configuration(
                full_name.as_str(),
                format!(
                    "expected '{}' but found '{}' in .spec.output.to",
                    Kind::ImageStreamTag,
                    kind
                ),
            ));
        }
        let stream = FullName::new(
            &Kind::ImageStream,
            image_stream_name(output_to.name.as_deref().unwrap_or_default()),
        );
        let entry = self.entries.get_mut(&stream).ok_or_else(|| {
            Error::configuration(
                full_name.as_str(),
                format!("output {} is not part of the List", stream),
            )
        })?;
        if let Some(other) = &entry.producer {
            return Err(Error::configuration(
                full_name.as_str(),
                format!("{} is already the output of {}", stream, other),
            ));
        }
        entry.producer = Some(full_name);
        Ok(())
    }

    fn link_inputs(&mut self, i: usize) -> Result<()> {
        let bc = &self.build_configs[i];
        let full_name = bc.full_name.clone();
        let own_namespace = bc.build_config.metadata.namespace.clone();

        let mut dependencies = Vec::new();
        for input in bc.build_config.input_images() {
            let kind = input.kind.as_deref().unwrap_or_default();
            if kind != Kind::ImageStreamTag.as_str() {
                return Err(Error::configuration(
                    full_name.as_str(),
                    format!(
                        "expected '{}' but found '{}' as an input image",
                        Kind::ImageStreamTag,
                        kind
                    ),
                ));
            }
            let stream = FullName::new(
                &Kind::ImageStream,
                image_stream_name(input.name.as_deref().unwrap_or_default()),
            );
            let foreign = match (&input.namespace, &own_namespace) {
                (Some(theirs), Some(ours)) => theirs != ours,
                _ => false,
            };
            if foreign {
                trace!("{} uses {} from namespace {:?}", full_name, stream, input.namespace);
                continue;
            }
            if !self.entries.contains_key(&stream) {
                trace!("{} uses {} which is not part of the List", full_name, stream);
            }
            dependencies.push(stream);
        }

        let node = self.build_configs[i].node;
        for stream in &dependencies {
            if let Some(producer) = self.producer_of(stream) {
                let producer_node = producer.node;
                self.graph.add_edge(producer_node, node, stream.clone());
            }
        }
        self.build_configs[i].dependencies = dependencies;
        Ok(())
    }

    pub fn entry(&self, full_name: &FullName) -> Option<&Entry> {
        self.entries.get(full_name)
    }

    pub fn build_configs(&self) -> &[BuildConfigEntry] {
        &self.build_configs
    }

    pub fn build_config(&self, full_name: &FullName) -> Option<&BuildConfigEntry> {
        self.positions
            .get(full_name)
            .map(|&i| &self.build_configs[i])
    }

    pub fn build_config_mut(&mut self, full_name: &FullName) -> Option<&mut BuildConfigEntry> {
        self.positions
            .get(full_name)
            .map(|&i| &mut self.build_configs[i])
    }

    /// The BuildConfig producing `image_stream` in this run, if any.
    pub fn producer_of(&self, image_stream: &FullName) -> Option<&BuildConfigEntry> {
        let producer = self.entries.get(image_stream)?.producer.as_ref()?;
        self.build_config(producer)
    }

    /// Producers `full_name` is still waiting for.
    pub fn blocking(&self, full_name: &FullName) -> Vec<FullName> {
        let Some(bc) = self.build_config(full_name) else {
            return Vec::new();
        };
        bc.dependencies
            .iter()
            .filter_map(|stream| self.producer_of(stream))
            .filter(|producer| producer.state != EntryState::Done)
            .map(|producer| producer.full_name.clone())
            .collect()
    }

    /// Ready once every dependency with a producer in this run is done.
    pub fn is_ready(&self, full_name: &FullName) -> bool {
        self.blocking(full_name).is_empty()
    }

    pub fn set_state(&mut self, full_name: &FullName, state: EntryState) {
        if let Some(bc) = self.build_config_mut(full_name) {
            bc.state = state;
        }
    }

    /// Record the image a BuildConfig resolved to. Also indexes the image and
    /// build so later lookups by full name find them.
    pub fn mark_done(
        &mut self,
        full_name: &FullName,
        image_stream_image: ObjectReference,
        build: Option<ObjectReference>,
    ) {
        for reference in std::iter::once(&image_stream_image).chain(build.as_ref()) {
            let mut item = Resource::new(
                Kind::from(reference.kind.as_deref().unwrap_or_default()),
                reference.name.as_deref().unwrap_or_default(),
            );
            item.metadata.namespace = reference.namespace.clone();
            let key = item.full_name();
            self.entries.insert(
                key.clone(),
                Entry {
                    full_name: key,
                    item,
                    producer: None,
                },
            );
        }
        if let Some(bc) = self.build_config_mut(full_name) {
            bc.state = EntryState::Done;
            bc.image_stream_image = Some(image_stream_image);
            bc.build = build;
        }
    }

    /// Groups of BuildConfigs that wait on each other, including self loops.
    pub fn cycles(&self) -> Vec<Vec<FullName>> {
        tarjan_scc(&self.graph)
            .into_iter()
            .filter(|component| {
                component.len() > 1 || self.graph.contains_edge(component[0], component[0])
            })
            .map(|component| {
                let mut names: Vec<FullName> = component
                    .into_iter()
                    .map(|n| self.graph[n].clone())
                    .collect();
                names.sort();
                names
            })
            .collect()
    }
}
