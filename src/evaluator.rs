//! Evaluation of launch files through `roslaunch`.
//!
//! The launch file itself is never interpreted here. `roslaunch` is asked for
//! the parameter dump, the node list and each node's exact command line.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::LaunchError;

/// Source of launch-file facts.
#[async_trait]
pub trait LaunchEvaluator: Send + Sync {
    /// Parameter set declared by the launch file, as YAML.
    async fn dump_params(&self, target: &Path, args: &[String]) -> Result<String, LaunchError>;
    /// Fully qualified names of the nodes the launch file starts.
    async fn list_nodes(&self, target: &Path, args: &[String]) -> Result<Vec<String>, LaunchError>;
    /// The shell command line `node` would be started with.
    async fn node_command(
        &self,
        target: &Path,
        args: &[String],
        node: &str,
    ) -> Result<String, LaunchError>;
}

/// [`LaunchEvaluator`] that shells out to `roslaunch`.
#[derive(Debug, Clone)]
pub struct Roslaunch {
    program: String,
    env: BTreeMap<String, String>,
}

impl Default for Roslaunch {
    fn default() -> Self {
        Self::new("roslaunch")
    }
}

impl Roslaunch {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            env: BTreeMap::new(),
        }
    }

    /// Environment applied to every evaluator run.
    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    async fn run(
        &self,
        mut args: Vec<String>,
        target: &Path,
        extra: &[String],
    ) -> Result<String, LaunchError> {
        args.push(target.display().to_string());
        args.extend(extra.iter().cloned());
        let reproduce = shell_words::join(
            std::iter::once(self.program.as_str()).chain(args.iter().map(String::as_str)),
        );
        log::debug!("evaluating: {reproduce}");

        let output = Command::new(&self.program)
            .args(&args)
            .envs(&self.env)
            .output()
            .await
            .map_err(|err| LaunchError::Evaluator {
                command: reproduce.clone(),
                output: err.to_string(),
            })?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() || !output.status.success() {
            let mut message = stderr.trim().to_string();
            if message.is_empty() {
                message = format!("exited with {}", output.status);
            }
            return Err(LaunchError::Evaluator {
                command: reproduce,
                output: message,
            });
        }
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if stdout.trim().is_empty() {
            return Err(LaunchError::Evaluator {
                command: reproduce,
                output: "no output".to_string(),
            });
        }
        Ok(stdout)
    }
}

#[async_trait]
impl LaunchEvaluator for Roslaunch {
    async fn dump_params(&self, target: &Path, args: &[String]) -> Result<String, LaunchError> {
        self.run(vec!["--dump-params".to_string()], target, args).await
    }

    async fn list_nodes(&self, target: &Path, args: &[String]) -> Result<Vec<String>, LaunchError> {
        let stdout = self.run(vec!["--nodes".to_string()], target, args).await?;
        Ok(parse_node_list(&stdout))
    }

    async fn node_command(
        &self,
        target: &Path,
        args: &[String],
        node: &str,
    ) -> Result<String, LaunchError> {
        let stdout = self
            .run(vec!["--args".to_string(), node.to_string()], target, args)
            .await?;
        Ok(stdout.trim().to_string())
    }
}

fn parse_node_list(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}
