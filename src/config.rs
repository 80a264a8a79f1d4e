//! Launch request configuration.
//!
//! A launch request is read from a TOML file (written by the IDE extension or
//! by hand) and may be overridden from the command line. Keys accept both the
//! snake_case form and the camelCase form used in IDE launch configurations.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::error::LaunchError;

/// File extensions accepted as launch targets.
pub const ACCEPTED_EXTENSIONS: &[&str] = &["launch", "test", "py", "xml"];

/// The validated input of one launch invocation.
#[derive(Debug, Clone, Deserialize)]
pub struct LaunchRequest {
    /// Absolute path of the launch file.
    pub target: PathBuf,
    /// Extra `name:=value` arguments passed to the launch evaluator.
    #[serde(default)]
    pub arguments: Vec<String>,
    /// Environment overrides applied to every node.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Nodes that are always launched without a debugger.
    #[serde(default, alias = "launchWhitelist")]
    pub launch_whitelist: Option<Vec<String>>,
    /// When present, only these nodes get a debugger.
    #[serde(default, alias = "attachDebuggerWhitelist")]
    pub attach_debugger_whitelist: Option<Vec<String>>,
    /// Stopping any debug session stops the whole group.
    #[serde(default, alias = "stopAll")]
    pub stop_all: bool,
    /// Stop the ROS core once the group has been torn down.
    #[serde(default, alias = "stopCoreAfterDebug")]
    pub stop_core_after_debug: bool,
    /// Kill plainly launched nodes when the group stops.
    #[serde(default = "default_true", alias = "stopLaunchedNodes")]
    pub stop_launched_nodes: bool,
    /// Route plain node output to per-node terminals.
    #[serde(default, alias = "attachTerminalsToProcesses")]
    pub attach_terminals_to_processes: bool,
    /// Closing a node's terminal terminates that node.
    #[serde(default = "default_true", alias = "terminateOnTerminalClosed")]
    pub terminate_on_terminal_closed: bool,
    /// Symbol search path handed to the native debugger.
    #[serde(default, alias = "symbolSearchPath")]
    pub symbol_search_path: Option<String>,
    /// Source path remapping handed to the native debugger.
    #[serde(default, alias = "sourceFileMap")]
    pub source_file_map: BTreeMap<String, String>,
    /// Extra shared library search path for the native debugger.
    #[serde(default, alias = "additionalSOLibSearchPath")]
    pub additional_so_lib_search_path: Option<String>,
    /// Break on the first line of interpreted nodes.
    #[serde(default, alias = "stopOnEntry")]
    pub stop_on_entry: bool,
}

fn default_true() -> bool {
    true
}

impl LaunchRequest {
    /// Creates a request for `target` with every policy at its default.
    pub fn new(target: impl Into<PathBuf>) -> Self {
        Self {
            target: target.into(),
            arguments: Vec::new(),
            env: BTreeMap::new(),
            launch_whitelist: None,
            attach_debugger_whitelist: None,
            stop_all: false,
            stop_core_after_debug: false,
            stop_launched_nodes: true,
            attach_terminals_to_processes: false,
            terminate_on_terminal_closed: true,
            symbol_search_path: None,
            source_file_map: BTreeMap::new(),
            additional_so_lib_search_path: None,
            stop_on_entry: false,
        }
    }

    /// Checks the target path before anything touches the filesystem.
    pub fn validate(&self) -> Result<(), LaunchError> {
        if !self.target.is_absolute() {
            return Err(LaunchError::InvalidTarget(self.target.clone()));
        }
        let extension = self
            .target
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or_default();
        if !ACCEPTED_EXTENSIONS.contains(&extension) {
            return Err(LaunchError::UnsupportedExtension {
                extension: extension.to_string(),
                accepted: ACCEPTED_EXTENSIONS
                    .iter()
                    .map(|ext| format!(".{ext}"))
                    .collect::<Vec<_>>()
                    .join(", "),
            });
        }
        Ok(())
    }
}

/// Loads a launch request from a TOML file.
pub fn load_request(path: &Path) -> Result<LaunchRequest> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read launch request {}", path.display()))?;
    let request: LaunchRequest = toml::from_str(&raw)
        .with_context(|| format!("failed to parse launch request {}", path.display()))?;
    Ok(request)
}
