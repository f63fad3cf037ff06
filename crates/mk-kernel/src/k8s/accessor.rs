//! Cluster accessor.
//!
//! The kernel never talks to the API server itself. Every read, permission
//! check, dry run and patch goes through a [`ClusterAccessor`], which runs
//! one CLI invocation and hands back its raw exit status and output.

use std::fmt;
use std::io::ErrorKind;
use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Raw result of one cluster call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    /// Exit status. `None` if the process was killed or timed out.
    pub exit_code: Option<i32>,
    /// Captured stdout.
    pub stdout: String,
    /// Captured stderr.
    pub stderr: String,
}

impl CommandOutput {
    /// Successful output.
    #[must_use]
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Failed output.
    #[must_use]
    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code: Some(exit_code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Exit status 0.
    #[inline]
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// A cluster call that produced no output at all.
#[derive(Debug, thiserror::Error)]
pub enum AccessError {
    /// The cluster CLI binary does not exist.
    #[error("cluster CLI not found: {0}")]
    Missing(String),

    /// The call did not finish within the per-call timeout.
    #[error("cluster call timed out after {0:?}")]
    Timeout(Duration),

    /// The process could not be spawned.
    #[error("cluster call failed to start: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Executes cluster CLI calls.
///
/// # Timeouts
/// Implementations must bound every call; a stuck object must not stall
/// the watch loop.
#[async_trait::async_trait]
pub trait ClusterAccessor: Send + Sync + fmt::Debug {
    /// Run one call with the given arguments.
    async fn run(&self, args: &[String]) -> Result<CommandOutput, AccessError>;
}

/// Cluster settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// CLI binary, overridable with `KUBECTL`.
    pub kubectl: String,
    /// `--context` to pass, if any.
    pub context: Option<String>,
    /// Namespace of the workload.
    pub namespace: String,
    /// Deployment running the workload.
    pub deployment: String,
    /// Per-call timeout.
    pub timeout_ms: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            kubectl: "kubectl".to_string(),
            context: None,
            namespace: "default".to_string(),
            deployment: "trainer".to_string(),
            timeout_ms: 20_000,
        }
    }
}

impl ClusterConfig {
    /// Set the CLI binary.
    #[must_use]
    pub fn with_kubectl(mut self, kubectl: impl Into<String>) -> Self {
        self.kubectl = kubectl.into();
        self
    }

    /// Set the workload target.
    #[must_use]
    pub fn with_target(mut self, namespace: impl Into<String>, deployment: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self.deployment = deployment.into();
        self
    }

    /// Set the per-call timeout.
    #[must_use]
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }
}

/// [`ClusterAccessor`] backed by the `kubectl` binary.
#[derive(Debug, Clone)]
pub struct Kubectl {
    program: String,
    context: Option<String>,
    timeout: Duration,
}

impl Kubectl {
    /// Create from cluster settings.
    #[must_use]
    pub fn new(config: &ClusterConfig) -> Self {
        Self {
            program: config.kubectl.clone(),
            context: config.context.clone(),
            timeout: Duration::from_millis(config.timeout_ms),
        }
    }
}

#[async_trait::async_trait]
impl ClusterAccessor for Kubectl {
    async fn run(&self, args: &[String]) -> Result<CommandOutput, AccessError> {
        let mut command = tokio::process::Command::new(&self.program);
        if let Some(context) = &self.context {
            command.arg("--context").arg(context);
        }
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(program = %self.program, ?args, "cluster call");
        let output = match tokio::time::timeout(self.timeout, command.output()).await {
            Err(_) => {
                warn!(?args, timeout = ?self.timeout, "cluster call timed out");
                return Err(AccessError::Timeout(self.timeout));
            }
            Ok(Err(err)) if err.kind() == ErrorKind::NotFound => {
                return Err(AccessError::Missing(self.program.clone()));
            }
            Ok(result) => result?,
        };

        Ok(CommandOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Run a call and fold transport failures into a failed [`CommandOutput`].
///
/// Returns `None` only when the CLI binary is missing.
pub(crate) async fn run_folded<A>(accessor: &A, args: &[String]) -> Option<CommandOutput>
where
    A: ClusterAccessor + ?Sized,
{
    match accessor.run(args).await {
        Ok(output) => Some(output),
        Err(AccessError::Missing(program)) => {
            warn!(%program, "cluster CLI not found");
            None
        }
        Err(err) => Some(CommandOutput {
            exit_code: None,
            stdout: String::new(),
            stderr: err.to_string(),
        }),
    }
}

/// Current kube context, if the accessor can tell.
pub async fn current_context<A>(accessor: &A) -> Option<String>
where
    A: ClusterAccessor + ?Sized,
{
    let output = accessor
        .run(&["config".to_string(), "current-context".to_string()])
        .await
        .ok()?;
    let context = output.stdout.trim();
    (output.success() && !context.is_empty()).then(|| context.to_string())
}

/// Build an argument vector from string slices.
pub(crate) fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|p| (*p).to_string()).collect()
}
