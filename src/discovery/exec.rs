//! Local Node Executor
//!
//! Runs shell commands on the node this process lives on.

use crate::domain::{ExecOutput, NodeExecutor, NodeName};
use crate::error::{Error, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

/// Executes commands through `sh -c` on the local node only
#[derive(Debug, Clone)]
pub struct LocalShellExecutor {
    node: NodeName,
}

impl LocalShellExecutor {
    pub fn new(node: NodeName) -> Self {
        Self { node }
    }
}

#[async_trait]
impl NodeExecutor for LocalShellExecutor {
    async fn exec(&self, node: &str, command: &str) -> Result<ExecOutput> {
        if node != self.node.as_str() {
            return Err(Error::NodeExec {
                node: node.to_string(),
                command: command.to_string(),
                reason: format!("only the local node {} is reachable", self.node),
            });
        }

        debug!(node, command, "Executing on node");
        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .output()
            .await
            .map_err(|e| Error::NodeExec {
                node: node.to_string(),
                command: command.to_string(),
                reason: e.to_string(),
            })?;

        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            code: output.status.code().unwrap_or(-1),
        })
    }
}

/// Quote a value for safe use as one shell word
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}
