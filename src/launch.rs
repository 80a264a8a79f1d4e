//! One launch invocation, from pre-flight checks to a populated group.

use std::sync::Arc;

use anyhow::Context;
use futures::future::join_all;

use crate::command::Platform;
use crate::config::LaunchRequest;
use crate::core_service::{ensure_core_running, CoreService, GateConfig};
use crate::error::LaunchError;
use crate::evaluator::LaunchEvaluator;
use crate::group::{GroupPolicy, ProcessGroup};
use crate::host::DebugHost;
use crate::plan::{build_plan, NodeCommand, NodeLaunchDecision};
use crate::terminate::ShutdownConfig;

/// Summary of a launch that got past the fatal checks.
#[derive(Debug, Default)]
pub struct LaunchOutcome {
    pub decisions: Vec<NodeLaunchDecision>,
    /// Debug sessions the host agreed to start.
    pub sessions_accepted: usize,
    /// Plain nodes that are now running in the group.
    pub processes_spawned: usize,
    /// Per-node errors that did not abort the launch.
    pub failures: Vec<LaunchError>,
}

impl LaunchOutcome {
    /// Whether there is anything for the group to supervise.
    pub fn is_running(&self) -> bool {
        self.sessions_accepted > 0 || self.processes_spawned > 0
    }
}

pub struct Launcher {
    host: Arc<dyn DebugHost>,
    core: Arc<dyn CoreService>,
    evaluator: Arc<dyn LaunchEvaluator>,
    platform: Platform,
    shutdown: ShutdownConfig,
    gate: GateConfig,
}

impl Launcher {
    pub fn new(
        host: Arc<dyn DebugHost>,
        core: Arc<dyn CoreService>,
        evaluator: Arc<dyn LaunchEvaluator>,
    ) -> Self {
        Self {
            host,
            core,
            evaluator,
            platform: Platform::current(),
            shutdown: ShutdownConfig::default(),
            gate: GateConfig::default(),
        }
    }

    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    pub fn with_shutdown(mut self, shutdown: ShutdownConfig) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn with_gate(mut self, gate: GateConfig) -> Self {
        self.gate = gate;
        self
    }

    /// An empty group for `request`. Wire its handle to the host before
    /// calling [`Launcher::launch`] so session notifications are not lost.
    pub fn group(&self, request: &LaunchRequest) -> ProcessGroup {
        ProcessGroup::new(
            GroupPolicy::from(request),
            self.shutdown,
            Arc::clone(&self.host),
            Arc::clone(&self.core),
        )
    }

    /// Evaluates the launch file and decides every node without starting
    /// anything.
    pub async fn plan(&self, request: &LaunchRequest) -> Result<Vec<NodeLaunchDecision>, LaunchError> {
        request.validate()?;
        self.evaluate(request).await
    }

    /// Runs the launch: core gate, parameters, per-node decisions, debug
    /// sessions, then the plain batch.
    ///
    /// Every fatal error is returned before the first session or process is
    /// started. Per-node spawn failures and rejected debug sessions are
    /// collected in the outcome unless no session was accepted at all.
    pub async fn launch(
        &self,
        request: &LaunchRequest,
        group: &mut ProcessGroup,
    ) -> Result<LaunchOutcome, LaunchError> {
        request.validate()?;
        ensure_core_running(self.core.as_ref(), self.gate).await?;

        let params = self
            .evaluator
            .dump_params(&request.target, &request.arguments)
            .await?;
        self.core
            .load_params(&params)
            .await
            .context("failed to load launch parameters")?;

        let decisions = self.evaluate(request).await?;
        let mut outcome = LaunchOutcome::default();

        let debug: Vec<_> = decisions
            .iter()
            .filter_map(|decision| match decision {
                NodeLaunchDecision::DebugLaunch { node, config } => Some((node, config)),
                NodeLaunchDecision::PlainLaunch { .. } => None,
            })
            .collect();
        if debug.is_empty() {
            log::warn!("no node was selected for debugging, nothing launched");
            outcome.decisions = decisions;
            return Ok(outcome);
        }

        let started = join_all(debug.iter().map(|(node, config)| async move {
            (node.as_str(), self.host.start_session(config).await)
        }))
        .await;
        for (node, result) in started {
            match result {
                Ok(true) => {
                    log::info!("{node}: debug session requested");
                    outcome.sessions_accepted += 1;
                }
                Ok(false) => {
                    let err = LaunchError::DebuggerRejected {
                        node: node.to_string(),
                    };
                    log::error!("{err}");
                    outcome.failures.push(err);
                }
                Err(err) => {
                    let err = LaunchError::Host(format!("{node}: {err:#}"));
                    log::error!("{err}");
                    outcome.failures.push(err);
                }
            }
        }
        if outcome.sessions_accepted == 0 {
            let first = debug[0].0.clone();
            return Err(outcome
                .failures
                .into_iter()
                .next()
                .unwrap_or(LaunchError::DebuggerRejected { node: first }));
        }

        for decision in &decisions {
            let NodeLaunchDecision::PlainLaunch {
                node,
                command,
                options,
            } = decision
            else {
                continue;
            };
            match group.spawn(node, command, &options.env).await {
                Ok(_) => outcome.processes_spawned += 1,
                Err(err) => {
                    log::error!("{node}: {err}");
                    outcome.failures.push(err);
                }
            }
        }

        outcome.decisions = decisions;
        Ok(outcome)
    }

    async fn evaluate(&self, request: &LaunchRequest) -> Result<Vec<NodeLaunchDecision>, LaunchError> {
        let nodes = self
            .evaluator
            .list_nodes(&request.target, &request.arguments)
            .await?;
        log::info!("{} node(s) in {}", nodes.len(), request.target.display());

        let commands = join_all(nodes.into_iter().map(|node| async move {
            let line = self
                .evaluator
                .node_command(&request.target, &request.arguments, &node)
                .await?;
            Ok::<_, LaunchError>(NodeCommand { node, line })
        }))
        .await
        .into_iter()
        .collect::<Result<Vec<_>, _>>()?;

        build_plan(&commands, request, self.platform).await
    }
}
