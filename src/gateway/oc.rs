use std::{
    path::{Path, PathBuf},
    process::Stdio,
    time::Instant,
};

use tokio::{
    io::{AsyncBufReadExt, BufReader, Lines},
    process::{Child, ChildStdout, Command},
};
use tracing::{debug, info};

use super::{fetch_resource_versions, ClusterGateway, GetOptions, LineStream, StartBuild};
use crate::config::KubeNamespace;
use crate::error::{Error, Result};
use crate::resource::{Resource, Resources};

/// [`ClusterGateway`] backed by the `oc` command line client.
#[derive(Debug, Clone)]
pub struct OcCli {
    oc: PathBuf,
    namespace: Option<KubeNamespace>,
    cwd: PathBuf,
}

impl OcCli {
    pub fn new(oc: PathBuf, namespace: Option<KubeNamespace>, cwd: PathBuf) -> Self {
        Self { oc, namespace, cwd }
    }

    /// Make sure `oc` is installed and logged in, and `git` is usable.
    pub async fn check_prerequisites(&self) -> Result<()> {
        let mut errors = String::new();

        match Command::new(&self.oc).arg("whoami").output().await {
            Ok(out) => match out.status.code() {
                Some(0) => {}
                Some(1) => errors.push_str("Not authenticated (oc whoami) (exit code = 1)\n"),
                Some(126) => errors
                    .push_str("'oc' command found, but not executable (exit code = 126)\n"),
                Some(127) => errors.push_str("'oc' command not found (exit code = 127)\n"),
                code => errors.push_str(&format!(
                    "Error trying to run oc (exit code = {:?}):\n  stdout:{}\n  stderr:{}\n",
                    code,
                    String::from_utf8_lossy(&out.stdout),
                    String::from_utf8_lossy(&out.stderr),
                )),
            },
            Err(e) => errors.push_str(&format!(
                "'{}' could not be started: {}\n",
                self.oc.display(),
                e
            )),
        }

        match Command::new("git").arg("version").output().await {
            Ok(out) if out.status.success() => {}
            Ok(out) => errors.push_str(&format!(
                "Error trying to run git (exit code = {:?})\nstdout:{}\nstderr:{}\n",
                out.status.code(),
                String::from_utf8_lossy(&out.stdout),
                String::from_utf8_lossy(&out.stderr),
            )),
            Err(e) => errors.push_str(&format!("'git' could not be started: {}\n", e)),
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Prerequisites(errors))
        }
    }

    /// Top level of the git checkout containing the current directory.
    pub async fn discover_cwd() -> Result<PathBuf> {
        let cwd = std::env::current_dir()?;
        let args = ["rev-parse".to_string(), "--show-toplevel".to_string()];
        let out = run_command(Path::new("git"), &args, &cwd).await?;
        Ok(PathBuf::from(out.trim()))
    }

    fn args(&self, action: &str, names: &[String], options: &[(&str, String)]) -> Vec<String> {
        self.args_in(None, action, names, options)
    }

    fn args_in(
        &self,
        namespace: Option<&str>,
        action: &str,
        names: &[String],
        options: &[(&str, String)],
    ) -> Vec<String> {
        let mut args = Vec::with_capacity(names.len() + options.len() + 2);
        if let Some(namespace) = namespace.or(self.namespace.as_ref().map(KubeNamespace::as_str)) {
            args.push(format!("--namespace={}", namespace));
        }
        args.push(action.to_string());
        args.extend(names.iter().cloned());
        args.extend(options.iter().map(|(k, v)| format!("--{}={}", k, v)));
        args
    }

    async fn run(
        &self,
        action: &str,
        names: &[String],
        options: &[(&str, String)],
    ) -> Result<String> {
        run_command(&self.oc, &self.args(action, names, options), &self.cwd).await
    }
}

fn command_line(program: &Path, args: &[String]) -> String {
    std::iter::once(program.display().to_string())
        .chain(args.iter().cloned())
        .collect::<Vec<_>>()
        .join(" ")
}

async fn run_command(program: &Path, args: &[String], cwd: &Path) -> Result<String> {
    let line = command_line(program, args);
    debug!("> {}", line);
    let started = Instant::now();
    let output = Command::new(program)
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await?;
    let code = output.status.code().unwrap_or(-1);
    info!("{} # ({}) [{}s]", line, code, started.elapsed().as_secs());
    if !output.status.success() {
        return Err(Error::Gateway {
            command: line,
            code,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn output_names(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect()
}

#[async_trait::async_trait]
impl ClusterGateway for OcCli {
    async fn get(&self, names: &[String], options: &GetOptions) -> Result<Option<Resources>> {
        let mut opts = vec![("output", "json".to_string())];
        if let Some(selector) = &options.selector {
            opts.push(("selector", selector.clone()));
        }
        if options.ignore_not_found {
            opts.push(("ignore-not-found", "true".to_string()));
        }
        let args = self.args_in(options.namespace.as_deref(), "get", names, &opts);
        let stdout = run_command(&self.oc, &args, &self.cwd).await?;
        let json = stdout.trim();
        if json.is_empty() {
            return Ok(None);
        }
        Ok(Some(Resources::from_value(serde_json::from_str(json)?)?))
    }

    async fn apply(&self, resources: &Resources) -> Result<Resources> {
        let mut versioned = resources.clone();
        fetch_resource_versions(self, &mut versioned).await?;
        let file = tempfile::Builder::new()
            .prefix("ocpipe-")
            .suffix(".json")
            .tempfile()?;
        tokio::fs::write(file.path(), serde_json::to_vec(&versioned)?).await?;
        let stdout = self
            .run(
                "apply",
                &[],
                &[
                    ("filename", file.path().display().to_string()),
                    ("output", "name".to_string()),
                ],
            )
            .await?;
        let names = output_names(&stdout);
        let applied = if names.is_empty() {
            Vec::new()
        } else {
            self.get(&names, &GetOptions::default())
                .await?
                .map(Resources::into_items)
                .unwrap_or_default()
        };
        Ok(resources.reshape(applied))
    }

    async fn start_build(&self, request: &StartBuild) -> Result<Resource> {
        let mut opts = vec![("wait", "true".to_string()), ("output", "name".to_string())];
        if let Some(archive) = &request.from_archive {
            opts.push(("from-archive", archive.display().to_string()));
        }
        let stdout = self
            .run("start-build", &[request.build_config.clone()], &opts)
            .await?;
        let name = output_names(&stdout).into_iter().next().ok_or_else(|| {
            Error::Unexpected(format!(
                "start-build {} reported no build",
                request.build_config
            ))
        })?;
        self.get(&[name.clone()], &GetOptions::default())
            .await?
            .and_then(|found| found.into_items().into_iter().next())
            .ok_or_else(|| {
                Error::Unexpected(format!("{} vanished after it was started", name))
            })
    }

    async fn watch(
        &self,
        resource: &str,
        selector: &str,
        template: &str,
    ) -> Result<Box<dyn LineStream>> {
        let args = self.args(
            "get",
            &[resource.to_string()],
            &[
                ("selector", selector.to_string()),
                ("watch", "true".to_string()),
                ("output", format!("jsonpath={}", template)),
            ],
        );
        let command = command_line(&self.oc, &args);
        debug!("> {}", command);
        let mut child = Command::new(&self.oc)
            .args(&args)
            .current_dir(&self.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Unexpected(format!("no stdout for '{}'", command)))?;
        Ok(Box::new(OcWatch {
            command,
            started: Instant::now(),
            child,
            lines: BufReader::new(stdout).lines(),
            terminated: false,
        }))
    }

    async fn import_image(&self, target: &str, from: &str) -> Result<()> {
        self.run(
            "import-image",
            &[target.to_string()],
            &[
                ("from", from.to_string()),
                ("confirm", "true".to_string()),
                ("insecure", "true".to_string()),
            ],
        )
        .await?;
        Ok(())
    }

    async fn tag(&self, source: &str, target: &str) -> Result<()> {
        self.run("tag", &[source.to_string(), target.to_string()], &[])
            .await?;
        Ok(())
    }

    async fn delete_tag(&self, tag: &str) -> Result<()> {
        self.run("tag", &[tag.to_string()], &[("delete", "true".to_string())])
            .await?;
        Ok(())
    }

    async fn logs(
        &self,
        build: &str,
        namespace: Option<&str>,
        timestamps: bool,
    ) -> Result<String> {
        let mut opts = Vec::new();
        if timestamps {
            opts.push(("timestamps", "true".to_string()));
        }
        let args = self.args_in(namespace, "logs", &[build.to_string()], &opts);
        run_command(&self.oc, &args, &self.cwd).await
    }

    async fn source_tree_hash(&self, git_ref: &str, subpath: &str) -> Result<String> {
        let args = ["rev-parse".to_string(), format!("{}:{}", git_ref, subpath)];
        let out = run_command(Path::new("git"), &args, &self.cwd).await?;
        Ok(out.trim().to_string())
    }

    fn cwd(&self) -> &Path {
        &self.cwd
    }
}

/// `oc get --watch` subprocess. Killed on [`LineStream::terminate`] or drop.
pub struct OcWatch {
    command: String,
    started: Instant,
    child: Child,
    lines: Lines<BufReader<ChildStdout>>,
    terminated: bool,
}

#[async_trait::async_trait]
impl LineStream for OcWatch {
    async fn next_line(&mut self) -> Result<Option<String>> {
        if self.terminated {
            return Ok(None);
        }
        if let Some(line) = self.lines.next_line().await? {
            return Ok(Some(line));
        }
        let status = self.child.wait().await?;
        self.terminated = true;
        info!(
            "{} # ({:?}) [{}s]",
            self.command,
            status.code(),
            self.started.elapsed().as_secs()
        );
        if !status.success() {
            return Err(Error::Gateway {
                command: self.command.clone(),
                code: status.code().unwrap_or(-1),
                stderr: String::new(),
            });
        }
        Ok(None)
    }

    async fn terminate(&mut self) -> Result<()> {
        if self.terminated {
            return Ok(());
        }
        if let Err(e) = self.child.start_kill() {
            debug!("{} already gone: {}", self.command, e);
        }
        self.child.wait().await?;
        self.terminated = true;
        info!(
            "{} # (terminated) [{}s]",
            self.command,
            self.started.elapsed().as_secs()
        );
        Ok(())
    }
}
