//! Per-node launch decisions: run plainly or under a debugger.

use std::collections::BTreeMap;

use futures::future::join_all;
use serde::Serialize;

use crate::command::{parse_command, ParsedCommand, Platform};
use crate::config::LaunchRequest;
use crate::debug_config::{self, DebugConfiguration};
use crate::error::LaunchError;
use crate::whitelist::{matches_optional, Absent};

const UNIX_SCRIPT_EXTENSIONS: &[&str] = &["sh", "bash", "zsh", "csh", "ksh"];
const WINDOWS_SCRIPT_EXTENSIONS: &[&str] = &["bat", "cmd", "ps1"];

/// A node and the command line the launch file starts it with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeCommand {
    pub node: String,
    pub line: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SpawnOptions {
    /// Variables added on top of the inherited environment.
    pub env: BTreeMap<String, String>,
}

/// What happens to one node. Made once and never revisited.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "launch", rename_all = "snake_case")]
pub enum NodeLaunchDecision {
    PlainLaunch {
        node: String,
        command: ParsedCommand,
        options: SpawnOptions,
    },
    DebugLaunch {
        node: String,
        config: DebugConfiguration,
    },
}

impl NodeLaunchDecision {
    pub fn node(&self) -> &str {
        match self {
            NodeLaunchDecision::PlainLaunch { node, .. }
            | NodeLaunchDecision::DebugLaunch { node, .. } => node,
        }
    }

    pub fn is_debug(&self) -> bool {
        matches!(self, NodeLaunchDecision::DebugLaunch { .. })
    }
}

fn file_name(executable: &str) -> &str {
    executable.rsplit(['/', '\\']).next().unwrap_or(executable)
}

fn extension(executable: &str) -> Option<&str> {
    let name = file_name(executable);
    name.rfind('.').filter(|&dot| dot > 0).map(|dot| &name[dot + 1..])
}

/// File name of `executable` without directory or extension.
pub fn executable_stem(executable: &str) -> &str {
    let name = file_name(executable);
    match name.rfind('.') {
        Some(dot) if dot > 0 => &name[..dot],
        _ => name,
    }
}

fn is_shell_script(executable: &str, platform: Platform) -> bool {
    let Some(extension) = extension(executable) else {
        return false;
    };
    match platform {
        Platform::Unix => UNIX_SCRIPT_EXTENSIONS.contains(&extension),
        Platform::Windows => WINDOWS_SCRIPT_EXTENSIONS
            .iter()
            .any(|candidate| candidate.eq_ignore_ascii_case(extension)),
    }
}

/// Decides how a single node is launched.
pub async fn decide(
    node: &NodeCommand,
    request: &LaunchRequest,
    platform: Platform,
) -> Result<NodeLaunchDecision, LaunchError> {
    let command = parse_command(&node.line, platform).map_err(|source| LaunchError::Command {
        line: node.line.clone(),
        source,
    })?;
    let mut env = command.env.clone();
    env.extend(request.env.iter().map(|(k, v)| (k.clone(), v.clone())));
    let stem = executable_stem(&command.executable);

    let plain = |command: ParsedCommand, env: BTreeMap<String, String>| {
        NodeLaunchDecision::PlainLaunch {
            node: node.node.clone(),
            command,
            options: SpawnOptions { env },
        }
    };

    if matches_optional(
        request.launch_whitelist.as_deref(),
        Absent::MatchNone,
        stem,
        &node.node,
    ) {
        log::debug!("{}: on the launch whitelist", node.node);
        return Ok(plain(command, env));
    }
    if is_shell_script(&command.executable, platform) {
        log::debug!("{}: shell script, launching without a debugger", node.node);
        return Ok(plain(command, env));
    }
    if !matches_optional(
        request.attach_debugger_whitelist.as_deref(),
        Absent::MatchAll,
        stem,
        &node.node,
    ) {
        log::debug!("{}: not on the attach whitelist", node.node);
        return Ok(plain(command, env));
    }

    match debug_config::build(&node.node, &command, &env, request, platform).await? {
        Some(config) => Ok(NodeLaunchDecision::DebugLaunch {
            node: node.node.clone(),
            config,
        }),
        None => {
            log::warn!(
                "{}: no debugger for `{}`, launching it without one",
                node.node,
                command.executable
            );
            Ok(plain(command, env))
        }
    }
}

/// Decides every node concurrently. Any fatal error fails the whole plan.
pub async fn build_plan(
    nodes: &[NodeCommand],
    request: &LaunchRequest,
    platform: Platform,
) -> Result<Vec<NodeLaunchDecision>, LaunchError> {
    join_all(nodes.iter().map(|node| decide(node, request, platform)))
        .await
        .into_iter()
        .collect()
}
