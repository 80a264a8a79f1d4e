//! Debugger launch configurations and interpreter detection.
//!
//! Each debugged node becomes either a native (gdb / Visual Studio) launch or
//! an interpreted (Python) launch. Which one is decided from the executable:
//! by file name on Windows, by the shebang line everywhere else.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};

use crate::command::{ParsedCommand, Platform};
use crate::config::LaunchRequest;
use crate::error::LaunchError;

const SHEBANG_PROBE_BYTES: u64 = 512;

/// Configuration handed to the host to start one debug session.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DebugConfiguration {
    Native(NativeConfig),
    Interpreted(InterpretedConfig),
}

impl DebugConfiguration {
    pub fn name(&self) -> &str {
        match self {
            DebugConfiguration::Native(config) => &config.name,
            DebugConfiguration::Interpreted(config) => &config.name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NativeConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub debugger: String,
    pub request: String,
    pub program: String,
    pub args: Vec<String>,
    pub environment: Vec<EnvPair>,
    pub cwd: String,
    pub stop_at_entry: bool,
    #[serde(rename = "MIMode", skip_serializing_if = "Option::is_none")]
    pub mi_mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbol_search_path: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub source_file_map: BTreeMap<String, String>,
    #[serde(
        rename = "additionalSOLibSearchPath",
        skip_serializing_if = "Option::is_none"
    )]
    pub additional_so_lib_search_path: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub setup_commands: Vec<SetupCommand>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnvPair {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupCommand {
    pub text: String,
    pub description: String,
    pub ignore_failures: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InterpretedConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub debugger: String,
    pub request: String,
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub stop_on_entry: bool,
    pub just_my_code: bool,
}

/// Debugger backend family chosen for an executable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugTarget {
    Native,
    Interpreted,
}

fn shebang_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^#!.*python").expect("shebang regex is valid"))
}

/// Decides the backend for `executable`; `None` when it cannot be debugged.
pub async fn sniff_target(
    executable: &str,
    platform: Platform,
) -> std::io::Result<Option<DebugTarget>> {
    match platform {
        Platform::Windows => {
            let lower = executable.to_ascii_lowercase();
            if ["python", "python.exe", "pythonw.exe"]
                .iter()
                .any(|name| lower.ends_with(name))
            {
                Ok(Some(DebugTarget::Interpreted))
            } else if lower.ends_with(".exe") {
                Ok(Some(DebugTarget::Native))
            } else {
                Ok(None)
            }
        }
        Platform::Unix => {
            let file = tokio::fs::File::open(executable).await?;
            let mut reader = BufReader::new(file.take(SHEBANG_PROBE_BYTES));
            let mut first_line = Vec::new();
            reader.read_until(b'\n', &mut first_line).await?;
            let first_line = String::from_utf8_lossy(&first_line);
            if shebang_regex().is_match(&first_line) {
                Ok(Some(DebugTarget::Interpreted))
            } else {
                Ok(Some(DebugTarget::Native))
            }
        }
    }
}

/// Builds the debug configuration for one node.
///
/// `env` is the node's merged environment. Returns `Ok(None)` when the
/// executable has no supported debugger.
pub async fn build(
    node: &str,
    command: &ParsedCommand,
    env: &BTreeMap<String, String>,
    request: &LaunchRequest,
    platform: Platform,
) -> Result<Option<DebugConfiguration>, LaunchError> {
    let target = sniff_target(&command.executable, platform)
        .await
        .map_err(|err| LaunchError::Other(anyhow::anyhow!(
            "failed to inspect {}: {err}",
            command.executable
        )))?;
    let Some(target) = target else {
        return Ok(None);
    };

    let config = match (target, platform) {
        (DebugTarget::Interpreted, Platform::Windows) => {
            // `python.exe script.py args...`: the script is what gets debugged.
            let mut args = command.args.clone();
            if args.is_empty() {
                return Ok(None);
            }
            let program = args.remove(0);
            interpreted(node, program, args, env, request)
        }
        (DebugTarget::Interpreted, Platform::Unix) => interpreted(
            node,
            command.executable.clone(),
            command.args.clone(),
            env,
            request,
        ),
        (DebugTarget::Native, Platform::Windows) => native(node, command, env, request, "cppvsdbg"),
        (DebugTarget::Native, Platform::Unix) => {
            ensure_runnable(Path::new(&command.executable))?;
            let mut config = native(node, command, env, request, "cppdbg");
            if let DebugConfiguration::Native(native) = &mut config {
                native.mi_mode = Some("gdb".to_string());
                native.setup_commands = vec![SetupCommand {
                    text: "-enable-pretty-printing".to_string(),
                    description: "Enable pretty-printing for gdb".to_string(),
                    ignore_failures: true,
                }];
            }
            config
        }
    };
    Ok(Some(config))
}

fn interpreted(
    node: &str,
    program: String,
    args: Vec<String>,
    env: &BTreeMap<String, String>,
    request: &LaunchRequest,
) -> DebugConfiguration {
    DebugConfiguration::Interpreted(InterpretedConfig {
        name: node.to_string(),
        debugger: "python".to_string(),
        request: "launch".to_string(),
        program,
        args,
        env: env.clone(),
        stop_on_entry: request.stop_on_entry,
        just_my_code: false,
    })
}

fn native(
    node: &str,
    command: &ParsedCommand,
    env: &BTreeMap<String, String>,
    request: &LaunchRequest,
    debugger: &str,
) -> DebugConfiguration {
    DebugConfiguration::Native(NativeConfig {
        name: node.to_string(),
        debugger: debugger.to_string(),
        request: "launch".to_string(),
        program: command.executable.clone(),
        args: command.args.clone(),
        environment: env
            .iter()
            .map(|(name, value)| EnvPair {
                name: name.clone(),
                value: value.clone(),
            })
            .collect(),
        cwd: ".".to_string(),
        stop_at_entry: request.stop_on_entry,
        mi_mode: None,
        symbol_search_path: request.symbol_search_path.clone(),
        source_file_map: request.source_file_map.clone(),
        additional_so_lib_search_path: request.additional_so_lib_search_path.clone(),
        setup_commands: Vec::new(),
    })
}

#[cfg(unix)]
fn ensure_runnable(path: &Path) -> Result<(), LaunchError> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| LaunchError::NotReadable(path.to_path_buf()))?;
    if unsafe { libc::access(c_path.as_ptr(), libc::X_OK) } != 0 {
        return Err(LaunchError::NotExecutable(path.to_path_buf()));
    }
    if unsafe { libc::access(c_path.as_ptr(), libc::R_OK) } != 0 {
        return Err(LaunchError::NotReadable(path.to_path_buf()));
    }
    Ok(())
}

#[cfg(not(unix))]
fn ensure_runnable(_path: &Path) -> Result<(), LaunchError> {
    Ok(())
}
