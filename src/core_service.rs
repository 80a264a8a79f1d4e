//! The ROS core and the pre-flight gate in front of every launch.
//!
//! Nodes cannot start without a reachable master, so a launch first makes
//! sure one is running, starting it if needed, and gives up after a bounded
//! wait.

use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use regex::Regex;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use crate::error::LaunchError;
use crate::terminate::{terminate, ShutdownConfig};

const DEFAULT_MASTER_URI: &str = "http://localhost:11311/";
const CALLER_ID: &str = "/rosdbg";

/// The always-on coordination service nodes depend on.
#[async_trait]
pub trait CoreService: Send + Sync {
    /// Whether the core is up and answering.
    async fn status(&self) -> bool;
    async fn start(&self) -> Result<()>;
    async fn stop(&self) -> Result<()>;
    /// Loads a parameter dump (YAML) into the parameter server.
    async fn load_params(&self, dump: &str) -> Result<()>;
}

/// Bounds for the pre-flight wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateConfig {
    pub timeout: Duration,
    pub interval: Duration,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            interval: Duration::from_millis(100),
        }
    }
}

/// Makes sure the core is running before anything is launched.
pub async fn ensure_core_running(
    core: &dyn CoreService,
    gate: GateConfig,
) -> Result<(), LaunchError> {
    if core.status().await {
        log::debug!("ROS core already running");
        return Ok(());
    }

    log::info!("starting ROS core");
    core.start().await.context("failed to start the ROS core")?;

    let ready = tokio::time::timeout(gate.timeout, async {
        loop {
            if core.status().await {
                return;
            }
            tokio::time::sleep(gate.interval).await;
        }
    })
    .await;

    match ready {
        Ok(()) => {
            log::info!("ROS core is ready");
            Ok(())
        }
        Err(_) => Err(LaunchError::CoreTimeout(gate.timeout)),
    }
}

/// [`CoreService`] backed by the ROS master XML-RPC API and the `roscore`
/// and `rosparam` tools.
pub struct RosMaster {
    uri: String,
    client: reqwest::Client,
    spawned: Mutex<Option<Child>>,
}

impl RosMaster {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            client: reqwest::Client::new(),
            spawned: Mutex::new(None),
        }
    }

    /// Uses `ROS_MASTER_URI`, falling back to the default local master.
    pub fn from_env() -> Self {
        let uri = std::env::var("ROS_MASTER_URI").unwrap_or_else(|_| DEFAULT_MASTER_URI.into());
        Self::new(uri)
    }

    async fn call(&self, method: &str, params: &[&str]) -> Result<String> {
        let body = xmlrpc_request(method, params);
        let response = self
            .client
            .post(&self.uri)
            .header(reqwest::header::CONTENT_TYPE, "text/xml")
            .timeout(Duration::from_secs(2))
            .body(body)
            .send()
            .await
            .with_context(|| format!("master call {method} failed"))?
            .error_for_status()?
            .text()
            .await?;
        if !xmlrpc_succeeded(&response) {
            bail!("master rejected {method}");
        }
        Ok(response)
    }
}

#[async_trait]
impl CoreService for RosMaster {
    async fn status(&self) -> bool {
        self.call("getPid", &[CALLER_ID]).await.is_ok()
    }

    async fn start(&self) -> Result<()> {
        let mut spawned = self.spawned.lock().await;
        if let Some(child) = spawned.as_mut() {
            if child.try_wait()?.is_none() {
                return Ok(());
            }
        }
        let mut command = Command::new("roscore");
        command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(false);
        #[cfg(unix)]
        unsafe {
            command.pre_exec(|| {
                let _ = libc::setpgid(0, 0);
                Ok(())
            });
        }
        let child = command.spawn().context("failed to spawn roscore")?;
        *spawned = Some(child);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let result = self
            .call("shutdown", &[CALLER_ID, "debug session finished"])
            .await
            .map(|_| ());
        if let Some(mut child) = self.spawned.lock().await.take() {
            terminate(&mut child, ShutdownConfig::default(), "roscore").await;
        }
        result
    }

    async fn load_params(&self, dump: &str) -> Result<()> {
        let mut child = Command::new("rosparam")
            .args(["load", "-"])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .context("failed to spawn rosparam")?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(dump.as_bytes()).await?;
            stdin.shutdown().await?;
        }
        let output = child.wait_with_output().await?;
        if !output.status.success() {
            bail!(
                "rosparam load failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}

fn xmlrpc_request(method: &str, params: &[&str]) -> String {
    let params: String = params
        .iter()
        .map(|value| {
            format!(
                "<param><value><string>{}</string></value></param>",
                xml_escape(value)
            )
        })
        .collect();
    format!(
        "<?xml version=\"1.0\"?><methodCall><methodName>{method}</methodName><params>{params}</params></methodCall>"
    )
}

fn xml_escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

// Master responses are `[code, statusMessage, value]`; code 1 is success.
fn xmlrpc_succeeded(response: &str) -> bool {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"<array>\s*<data>\s*<value>\s*<(?:i4|int)>\s*(-?\d+)\s*</")
            .expect("xmlrpc status regex is valid")
    });
    re.captures(response)
        .map(|caps| &caps[1] == "1")
        .unwrap_or(false)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// In-memory core that becomes ready after a number of status polls.
    #[derive(Default)]
    pub(crate) struct FakeCore {
        pub running: AtomicBool,
        pub ready_after: Option<usize>,
        pub polls: AtomicUsize,
        pub starts: AtomicUsize,
        pub stops: AtomicUsize,
        pub params: std::sync::Mutex<Vec<String>>,
    }

    impl FakeCore {
        pub(crate) fn running() -> Self {
            let core = Self::default();
            core.running.store(true, Ordering::SeqCst);
            core
        }
    }

    #[async_trait]
    impl CoreService for FakeCore {
        async fn status(&self) -> bool {
            let polls = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some(after) = self.ready_after {
                if self.starts.load(Ordering::SeqCst) > 0 && polls > after {
                    self.running.store(true, Ordering::SeqCst);
                }
            }
            self.running.load(Ordering::SeqCst)
        }

        async fn start(&self) -> Result<()> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn stop(&self) -> Result<()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            self.running.store(false, Ordering::SeqCst);
            Ok(())
        }

        async fn load_params(&self, dump: &str) -> Result<()> {
            self.params.lock().unwrap().push(dump.to_string());
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn running_core_is_not_started() {
        let core = FakeCore::running();
        ensure_core_running(&core, GateConfig::default()).await.unwrap();
        assert_eq!(core.starts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_a_started_core() {
        let core = FakeCore {
            ready_after: Some(5),
            ..FakeCore::default()
        };
        ensure_core_running(&core, GateConfig::default()).await.unwrap();
        assert_eq!(core.starts.load(Ordering::SeqCst), 1);
        assert!(core.polls.load(Ordering::SeqCst) >= 6);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_when_core_never_comes_up() {
        let core = FakeCore::default();
        let started = tokio::time::Instant::now();
        let err = ensure_core_running(&core, GateConfig::default()).await.unwrap_err();
        assert!(matches!(err, LaunchError::CoreTimeout(t) if t == Duration::from_secs(30)));
        assert!(started.elapsed() >= Duration::from_secs(30));
        assert!(err.to_string().contains("roscore"));
    }

    #[test]
    fn builds_escaped_xmlrpc_calls() {
        let body = xmlrpc_request("shutdown", &["/rosdbg", "a<b"]);
        assert!(body.contains("<methodName>shutdown</methodName>"));
        assert!(body.contains("<string>a&lt;b</string>"));
    }

    #[test]
    fn reads_master_status_codes() {
        let ok = "<methodResponse><params><param><value><array><data>\
                  <value><int>1</int></value><value><string></string></value>\
                  <value><int>4242</int></value></data></array></value></param></params></methodResponse>";
        let failed = ok.replacen("<int>1</int>", "<int>-1</int>", 1);
        assert!(xmlrpc_succeeded(ok));
        assert!(!xmlrpc_succeeded(&failed));
        assert!(!xmlrpc_succeeded("garbage"));
    }
}
