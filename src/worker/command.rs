//! Worker that runs a shell command taken from the record input.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{info, warn};

use super::{WorkContext, Worker};
use crate::model::WorkResult;

/// Exit status a command uses to ask for a retry (EX_TEMPFAIL).
pub const RETRY_EXIT_CODE: i32 = 75;

/// Runs `input.command` through `sh -c`.
///
/// Exit 0 succeeds with `{"exit_code": 0}`, exit 75 requests a retry, any
/// other status fails. A raised stop signal kills the child.
#[derive(Debug, Clone)]
pub struct CommandWorker {
    shell: String,
}

impl CommandWorker {
    pub fn new() -> Self {
        Self {
            shell: "sh".to_string(),
        }
    }

    pub fn with_shell(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }
}

impl Default for CommandWorker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Worker for CommandWorker {
    async fn run(&self, mut ctx: WorkContext) -> WorkResult {
        let Some(command) = ctx.input.get("command").and_then(|v| v.as_str()) else {
            return WorkResult::failure("input has no \"command\" string");
        };

        let mut child = match Command::new(&self.shell)
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => return WorkResult::failure(format!("failed to spawn {}: {e}", self.shell)),
        };

        tokio::select! {
            status = child.wait() => match status {
                Ok(status) if status.success() => {
                    info!(id = %ctx.id, "command succeeded");
                    WorkResult::success_with(serde_json::json!({ "exit_code": 0 }))
                }
                Ok(status) if status.code() == Some(RETRY_EXIT_CODE) => WorkResult::Retry,
                Ok(status) => WorkResult::failure(format!(
                    "command exited with status {}",
                    status.code().unwrap_or(-1)
                )),
                Err(e) => WorkResult::failure(format!("failed to wait for command: {e}")),
            },
            _ = ctx.stop.stopped() => {
                warn!(id = %ctx.id, "stop requested, killing command");
                if let Err(e) = child.kill().await {
                    warn!(id = %ctx.id, "kill failed: {e}");
                }
                WorkResult::Retry
            }
        }
    }
}
