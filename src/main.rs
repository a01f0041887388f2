use std::path::Path;

use anyhow::Context;
use clap::Parser;
use ocpipe::{
    config::{Cmd, Opts, Settings},
    gateway::OcCli,
    prepare::prepare_list,
    promote::{import_image_streams, PromoteOptions},
    report::write_report,
    resource::Resources,
    rollout::apply_and_wait,
    scheduler::Scheduler,
};
use tracing_subscriber::EnvFilter;

fn read_list(path: &Path) -> anyhow::Result<Resources> {
    let contents =
        std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(Resources::from_value(serde_json::from_slice(&contents)?)?)
}

async fn inner_main() -> anyhow::Result<()> {
    let opts = Opts::parse();
    let settings = match &opts.config {
        Some(path) => Settings::from_file(path)?,
        None => Settings::default(),
    }
    .with_opts(&opts);

    let cwd = match &settings.cwd {
        Some(cwd) => cwd.clone(),
        None => OcCli::discover_cwd().await?,
    };
    let oc = OcCli::new(settings.oc_binary(), settings.namespace.clone(), cwd);
    oc.check_prerequisites().await?;

    match &opts.command {
        Cmd::Prepare { list } => {
            let namespace = settings.namespace.as_ref().map(|n| n.as_str());
            let prepared = prepare_list(&oc, read_list(list)?, namespace).await?;
            println!("{}", serde_json::to_string_pretty(&prepared)?);
        }
        Cmd::Build { list, .. } => {
            let resources = read_list(list)?;
            let results = Scheduler::new(&oc, settings.build_timeout())
                .build_all(resources.items())
                .await?;
            if let Some(dir) = &settings.report_dir {
                write_report(&oc, dir, &results).await?;
            }
            println!("{}", serde_json::to_string_pretty(&results)?);
        }
        Cmd::Deploy { list, app } => {
            let resources = read_list(list)?;
            apply_and_wait(&oc, &resources, app.as_deref(), settings.rollout_timeout()).await?;
        }
        Cmd::Promote {
            list,
            from_namespace,
            from_tag,
            to_tag,
        } => {
            let options = PromoteOptions {
                source_namespace: from_namespace.as_str(),
                source_tag: from_tag,
                target_tag: to_tag,
            };
            let promoted = import_image_streams(&oc, &read_list(list)?, &options).await?;
            println!("{}", serde_json::to_string_pretty(&promoted)?);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_env("OCPIPE_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = inner_main().await {
        eprintln!("{:?}", e);
        std::process::exit(1);
    }
}
