//! rosdbg: runs a ROS launch file with debuggers attached to its nodes.
//!
//! The binary is meant to run as an IDE sidecar. Host requests and
//! notifications travel as JSON lines over stdout and stdin, and all logging
//! goes to stderr.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::builder::styling::{AnsiColor, Effects, Style};
use clap::builder::Styles;
use clap::Parser;

use rosdbg::config::{self, LaunchRequest};
use rosdbg::core_service::{CoreService, GateConfig, RosMaster};
use rosdbg::evaluator::{LaunchEvaluator, Roslaunch};
use rosdbg::group::{GroupEvent, GroupHandle};
use rosdbg::host::{DebugHost, JsonLinesHost};
use rosdbg::launch::Launcher;
use rosdbg::terminate::ShutdownConfig;

/// Command-line interface definition.
#[derive(Debug, Parser)]
#[command(
    name = "rosdbg",
    version,
    about = "Launch ROS launch files with debuggers attached",
    styles = help_styles()
)]
struct Cli {
    /// Launch file to run.
    target: Option<PathBuf>,
    /// Launch request file (TOML). Flags below are applied on top of it.
    #[arg(long)]
    request: Option<PathBuf>,
    /// Extra launch argument (name:=value).
    #[arg(long = "arg")]
    arguments: Vec<String>,
    /// Env entry applied to every node (KEY=VALUE).
    #[arg(long)]
    env: Vec<String>,
    /// Node, namespace or executable to launch without a debugger.
    #[arg(long = "launch-only")]
    launch_whitelist: Vec<String>,
    /// Node, namespace or executable to attach a debugger to.
    #[arg(long = "attach")]
    attach_debugger_whitelist: Vec<String>,
    /// Stop every debug session when one of them stops.
    #[arg(long)]
    stop_all: bool,
    /// Stop the ROS core when the group shuts down.
    #[arg(long)]
    stop_core_after_debug: bool,
    /// Leave plainly launched nodes running when the group shuts down.
    #[arg(long)]
    keep_launched_nodes: bool,
    /// Send plain node output to host terminals.
    #[arg(long)]
    attach_terminals: bool,
    /// Print the launch plan as JSON and exit.
    #[arg(long)]
    dry_run: bool,
    /// Time to wait after sending SIGINT before escalating (ms).
    #[arg(long)]
    shutdown_sigint_ms: Option<u64>,
    /// Time to wait after sending SIGTERM before force-killing (ms).
    #[arg(long)]
    shutdown_sigterm_ms: Option<u64>,
    /// How long to wait for the ROS core to come up (s).
    #[arg(long)]
    core_timeout_secs: Option<u64>,
    /// The roslaunch executable.
    #[arg(long, default_value = "roslaunch")]
    roslaunch: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let env = env_logger::Env::default().default_filter_or("info");
    env_logger::init_from_env(env);

    let request = resolve_request(&cli)?;
    let shutdown = ShutdownConfig::new(
        cli.shutdown_sigint_ms.unwrap_or(5_000),
        cli.shutdown_sigterm_ms.unwrap_or(2_000),
    );
    let mut gate = GateConfig::default();
    if let Some(secs) = cli.core_timeout_secs {
        gate.timeout = Duration::from_secs(secs);
    }

    let host = Arc::new(JsonLinesHost::stdio());
    let core: Arc<dyn CoreService> = Arc::new(RosMaster::from_env());
    let evaluator: Arc<dyn LaunchEvaluator> = Arc::new(Roslaunch::new(cli.roslaunch.clone()));
    let launcher = Launcher::new(Arc::clone(&host) as Arc<dyn DebugHost>, core, evaluator)
        .with_shutdown(shutdown)
        .with_gate(gate);

    if cli.dry_run {
        let plan = launcher.plan(&request).await?;
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(());
    }

    let mut group = launcher.group(&request);
    let reader = host.spawn_reader(tokio::io::stdin(), group.handle());
    spawn_signal_listener(group.handle());

    let outcome = launcher.launch(&request, &mut group).await?;
    if !outcome.is_running() {
        reader.abort();
        return Ok(());
    }
    log::info!(
        "{} debug session(s), {} plain node(s) running",
        outcome.sessions_accepted,
        outcome.processes_spawned
    );

    let report = group.run().await;
    reader.abort();
    for exit in &report.abnormal_exits {
        log::warn!("node exited abnormally: {exit}");
    }
    if !report.failures.is_empty() {
        bail!("node failures:\n{}", report.failures.join("\n"));
    }
    Ok(())
}

/// Builds the launch request from the optional request file and the flags.
fn resolve_request(cli: &Cli) -> Result<LaunchRequest> {
    let mut request = match &cli.request {
        Some(path) => config::load_request(path)?,
        None => {
            let target = cli
                .target
                .clone()
                .ok_or_else(|| anyhow!("no launch target (pass a launch file or --request)"))?;
            LaunchRequest::new(target)
        }
    };
    if let Some(target) = &cli.target {
        request.target = target.clone();
    }
    if request.target.is_relative() {
        let cwd = std::env::current_dir().context("failed to read the current directory")?;
        request.target = cwd.join(&request.target);
    }

    request.arguments.extend(cli.arguments.iter().cloned());
    for entry in &cli.env {
        let (key, value) = split_env(entry)?;
        request.env.insert(key, value);
    }
    if !cli.launch_whitelist.is_empty() {
        request
            .launch_whitelist
            .get_or_insert_with(Vec::new)
            .extend(cli.launch_whitelist.iter().cloned());
    }
    if !cli.attach_debugger_whitelist.is_empty() {
        request
            .attach_debugger_whitelist
            .get_or_insert_with(Vec::new)
            .extend(cli.attach_debugger_whitelist.iter().cloned());
    }

    request.stop_all |= cli.stop_all;
    request.stop_core_after_debug |= cli.stop_core_after_debug;
    request.attach_terminals_to_processes |= cli.attach_terminals;
    if cli.keep_launched_nodes {
        request.stop_launched_nodes = false;
    }
    Ok(request)
}

fn split_env(value: &str) -> Result<(String, String)> {
    let (key, val) = value
        .split_once('=')
        .ok_or_else(|| anyhow!("invalid env {}, expected KEY=VALUE", value))?;
    if key.is_empty() {
        bail!("invalid env {}, empty name", value);
    }
    Ok((key.to_string(), val.to_string()))
}

fn spawn_signal_listener(group: GroupHandle) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(_) => return,
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        log::info!("interrupted, stopping launched nodes");
        group.send(GroupEvent::Shutdown).await;
    });
}

fn help_styles() -> Styles {
    Styles::styled()
        .header(
            Style::new()
                .fg_color(Some(AnsiColor::Cyan.into()))
                .effects(Effects::BOLD),
        )
        .usage(
            Style::new()
                .fg_color(Some(AnsiColor::Green.into()))
                .effects(Effects::BOLD),
        )
        .literal(Style::new().fg_color(Some(AnsiColor::Yellow.into())))
        .placeholder(Style::new().fg_color(Some(AnsiColor::Magenta.into())))
}
