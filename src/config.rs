use std::{
    fmt::Debug,
    fmt::Formatter,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use clap::{Parser, Subcommand};
use serde::Deserialize;

use crate::error::Result;

#[derive(Parser, Debug, Clone)]
#[clap(version, about = "Build and deploy OpenShift resources in dependency order")]
pub struct Opts {
    /// Optional TOML settings file. Command line values take precedence over it.
    #[clap(short, long, env = "OCPIPE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Namespace passed to every `oc` invocation.
    #[clap(short, long, env = "OCPIPE_NAMESPACE")]
    pub namespace: Option<KubeNamespace>,

    /// Root of the source checkout, defaults to the enclosing git top level.
    #[clap(long, env = "OCPIPE_CWD")]
    pub cwd: Option<PathBuf>,

    /// Path to the `oc` binary.
    #[clap(long, env = "OCPIPE_OC")]
    pub oc: Option<PathBuf>,

    /// Give up on a single build after this many seconds.
    #[clap(long)]
    pub build_timeout: Option<u64>,

    /// Give up waiting for a rollout after this many seconds.
    #[clap(long)]
    pub rollout_timeout: Option<u64>,

    #[clap(subcommand)]
    pub command: Cmd,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Cmd {
    /// Stamp template-hash and source-hash labels on a List and print it.
    Prepare { list: PathBuf },
    /// Build every BuildConfig in a List in dependency order.
    Build {
        list: PathBuf,
        /// Write build.out.json here once every build settled.
        #[clap(long)]
        report_dir: Option<PathBuf>,
    },
    /// Apply a List and wait until its DeploymentConfigs are rolled out.
    Deploy {
        list: PathBuf,
        /// Value of the `app` label shared by the deployed resources.
        #[clap(long)]
        app: Option<String>,
    },
    /// Point `<stream>:<to-tag>` of every ImageStream in a List at the image
    /// behind `<stream>:<from-tag>` in another namespace.
    Promote {
        list: PathBuf,
        #[clap(long)]
        from_namespace: KubeNamespace,
        #[clap(long)]
        from_tag: String,
        #[clap(long)]
        to_tag: String,
    },
}

/// Settings file contents, every field optional.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub namespace: Option<KubeNamespace>,
    pub cwd: Option<PathBuf>,
    pub oc_binary: Option<PathBuf>,
    pub build_timeout_secs: Option<u64>,
    pub rollout_timeout_secs: Option<u64>,
    pub report_dir: Option<PathBuf>,
}

impl Settings {
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Overlay the command line on top of the file.
    pub fn with_opts(self, opts: &Opts) -> Self {
        let report_dir = match &opts.command {
            Cmd::Build {
                report_dir: Some(dir),
                ..
            } => Some(dir.clone()),
            _ => self.report_dir,
        };
        Self {
            namespace: opts.namespace.clone().or(self.namespace),
            cwd: opts.cwd.clone().or(self.cwd),
            oc_binary: opts.oc.clone().or(self.oc_binary),
            build_timeout_secs: opts.build_timeout.or(self.build_timeout_secs),
            rollout_timeout_secs: opts.rollout_timeout.or(self.rollout_timeout_secs),
            report_dir,
        }
    }

    pub fn oc_binary(&self) -> PathBuf {
        self.oc_binary.clone().unwrap_or_else(|| PathBuf::from("oc"))
    }

    /// `None` waits as long as the cluster takes.
    pub fn build_timeout(&self) -> Option<Duration> {
        self.build_timeout_secs.map(Duration::from_secs)
    }

    pub fn rollout_timeout(&self) -> Option<Duration> {
        self.rollout_timeout_secs.map(Duration::from_secs)
    }
}

/// Valid custom namespaces:
///   must not be empty, use "default" instead
///   contain at most 63 characters
///   contain only lowercase alphanumeric characters or '-'
///   start with an alphanumeric character
///   end with an alphanumeric character
///   should not start with 'kube-'
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct KubeNamespace(String);

impl KubeNamespace {
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl FromStr for KubeNamespace {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        anyhow::ensure!(!s.is_empty(), "namespace cannot be an empty string");
        anyhow::ensure!(s.len() <= 63, "namespace must be <= 63 characters");
        anyhow::ensure!(
            s.chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'),
            "namespace must contain only lowercase alphanumeric characters or '-'"
        );
        let alnum = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit();
        anyhow::ensure!(
            s.starts_with(alnum),
            "namespace must start with an alphanumeric character"
        );
        anyhow::ensure!(
            s.ends_with(alnum),
            "namespace must end with an alphanumeric character"
        );
        anyhow::ensure!(
            !s.starts_with("kube-"),
            "namespace should not start with 'kube-'"
        );
        Ok(Self(s.to_string()))
    }
}

impl TryFrom<String> for KubeNamespace {
    type Error = anyhow::Error;

    fn try_from(s: String) -> anyhow::Result<Self> {
        s.parse()
    }
}

impl Debug for KubeNamespace {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
