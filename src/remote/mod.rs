pub mod readiness;
pub mod ssh;

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::core::errors::{ProvisionError, ProvisionResult};
pub use readiness::{await_reachable, Backoff, RetryPolicy};
pub use ssh::{ssh_transport, DirectSsh, JumpHost, JumpSsh, SshCredentials};

/// Where a command should run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
}

impl SshTarget {
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: 22,
            user: user.into(),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }
}

impl fmt::Display for SshTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.host, self.port)
    }
}

/// Raw result of one remote command.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_status: u32,
}

/// An authenticated session able to run commands.
#[async_trait]
pub trait RemoteSession: Send {
    async fn run(&mut self, command: &str) -> ProvisionResult<CommandOutput>;

    /// Tears down the session and anything it was tunnelled through.
    async fn close(self: Box<Self>);
}

/// "Open a command-executing session to host H", however that gets done.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Whether the target's ssh port accepts connections right now.
    async fn probe(&self, target: &SshTarget) -> bool;

    async fn open(&self, target: &SshTarget) -> ProvisionResult<Box<dyn RemoteSession>>;
}

/// Runs commands on provisioned nodes over a [`Transport`].
#[derive(Clone)]
pub struct RemoteExecutor {
    transport: Arc<dyn Transport>,
}

impl RemoteExecutor {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    /// Readiness gate: must pass before anything is executed on a fresh node.
    pub async fn await_reachable(
        &self,
        target: &SshTarget,
        policy: &RetryPolicy,
    ) -> ProvisionResult<Duration> {
        await_reachable(&target.host, policy, || self.transport.probe(target)).await
    }

    /// Runs `command` and returns its trimmed stdout.
    ///
    /// The session is closed whether the command succeeds or not.
    pub async fn execute(&self, target: &SshTarget, command: &str) -> ProvisionResult<String> {
        info!(%target, "executing remote command");
        let mut session = self.transport.open(target).await?;
        let outcome = session.run(command).await;
        session.close().await;

        interpret(&target.host, outcome?)
    }
}

fn interpret(host: &str, output: CommandOutput) -> ProvisionResult<String> {
    if output.exit_status != 0 {
        return Err(ProvisionError::RemoteCommand {
            host: host.to_string(),
            status: output.exit_status,
            stderr: output.stderr.trim().to_string(),
        });
    }
    if !output.stderr.trim().is_empty() {
        warn!(host, stderr = %output.stderr.trim(), "command succeeded with stderr output");
    }
    Ok(output.stdout.trim().to_string())
}
