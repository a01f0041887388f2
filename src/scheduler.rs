//! Drives every BuildConfig of a List to completion in dependency order.
//!
//! Work happens in rounds. Each round walks the remaining BuildConfigs in
//! order, dispatches every one whose producers are done and keeps the rest
//! for the next round. All dispatches of a round run concurrently and the
//! round ends only when every one of them settled. A round that dispatches
//! nothing means the remaining BuildConfigs wait on each other.

use std::time::Duration;

use futures::{stream::FuturesUnordered, StreamExt};
use tracing::{debug, info, info_span, trace, Instrument};

use crate::error::{Error, Result};
use crate::executor::{BuildExecutor, BuildResult};
use crate::gateway::ClusterGateway;
use crate::index::{EntryState, RunContext};
use crate::resource::{FullName, Resource};

pub struct Scheduler<'a, G: ?Sized> {
    gateway: &'a G,
    build_timeout: Option<Duration>,
}

impl<'a, G: ClusterGateway + ?Sized> Scheduler<'a, G> {
    pub fn new(gateway: &'a G, build_timeout: Option<Duration>) -> Self {
        Self {
            gateway,
            build_timeout,
        }
    }

    /// Index `items` and build everything in them. Results come in the order
    /// builds settled.
    pub async fn build_all(&self, items: &[Resource]) -> Result<Vec<BuildResult>> {
        let mut ctx = RunContext::index(items)?;
        self.run(&mut ctx).await
    }

    pub async fn run(&self, ctx: &mut RunContext) -> Result<Vec<BuildResult>> {
        let executor = BuildExecutor::new(self.gateway, self.build_timeout);
        let mut results = Vec::new();
        let mut worklist: Vec<FullName> = ctx
            .build_configs()
            .iter()
            .filter(|bc| bc.state != EntryState::Done)
            .map(|bc| bc.full_name.clone())
            .collect();
        let mut round = 0;

        while !worklist.is_empty() {
            round += 1;
            let mut blocked = Vec::new();
            let mut ready = Vec::new();
            for full_name in worklist {
                if ctx.is_ready(&full_name) {
                    ctx.set_state(&full_name, EntryState::Dispatched);
                    ready.push(full_name);
                } else {
                    trace!("{} waits for {:?}", full_name, ctx.blocking(&full_name));
                    ctx.set_state(&full_name, EntryState::Blocked);
                    blocked.push(full_name);
                }
            }

            if ready.is_empty() {
                return Err(stalled(ctx, &blocked));
            }
            info!(
                "Round {}: dispatching {}, {} blocked",
                round,
                ready.len(),
                blocked.len()
            );

            let mut in_flight = ready
                .into_iter()
                .filter_map(|full_name| {
                    let build_config = ctx.build_config(&full_name)?.build_config.clone();
                    let span = info_span!("dispatch", round, build_config = %full_name);
                    let executor = &executor;
                    Some(
                        async move { (full_name, executor.run(build_config).await) }
                            .instrument(span),
                    )
                })
                .collect::<FuturesUnordered<_>>();

            let mut first_error = None;
            while let Some((full_name, outcome)) = in_flight.next().await {
                match outcome {
                    Ok(result) => {
                        debug!("{} settled, new build: {}", full_name, result.new_build);
                        ctx.mark_done(
                            &full_name,
                            result.image_stream_image.clone(),
                            result.build.clone(),
                        );
                        results.push(result);
                    }
                    Err(e) => {
                        tracing::error!("{} failed: {}", full_name, e);
                        first_error.get_or_insert(e);
                    }
                }
            }
            if let Some(e) = first_error {
                return Err(e);
            }
            worklist = blocked;
        }
        Ok(results)
    }
}

fn stalled(ctx: &RunContext, blocked: &[FullName]) -> Error {
    Error::Stalled {
        blocked: blocked
            .iter()
            .map(|full_name| {
                let waiting: Vec<String> = ctx
                    .blocking(full_name)
                    .iter()
                    .map(FullName::to_string)
                    .collect();
                format!("{} (waiting for {})", full_name, waiting.join(", "))
            })
            .collect(),
        cycles: ctx
            .cycles()
            .into_iter()
            .map(|cycle| cycle.iter().map(FullName::to_string).collect())
            .collect(),
    }
}
