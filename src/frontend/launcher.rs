use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::{JobError, Result};
use crate::protocol::LaunchInfo;

/// Everything needed to start one backend process on its node.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub rank: u32,
    pub job_number: u64,
    /// Node name as assigned by the scheduler.
    pub name: String,
    pub host: String,
    pub launch: LaunchInfo,
    pub threads: u32,
    /// Address the backend connects back to.
    pub frontend_addr: String,
    /// Extra flags from the frontend's environment.
    pub flags: Vec<String>,
    pub frontend_comm: bool,
}

impl LaunchRequest {
    /// Arguments following the program name.
    pub fn command_args(&self) -> Vec<String> {
        let mut args = self.launch.flags.clone();
        args.extend(self.flags.iter().cloned());
        args.push("backend".to_string());
        args.push(format!("--frontend={}", self.frontend_addr));
        args.push(format!("--job={}", self.job_number));
        args.push(format!("--rank={}", self.rank));
        args.push(format!("--threads={}", self.threads));
        args.push(format!("--host={}", self.host));
        if self.frontend_comm {
            args.push("--frontend-comm".to_string());
        }
        args
    }
}

/// Starts backend processes.
///
/// `launch` returns once the process has been started; whether it comes up
/// is observed through `backendReady` and its lease.
#[async_trait]
pub trait BackendLauncher: Send + Sync {
    async fn launch(&self, request: LaunchRequest) -> Result<()>;
}

/// Launches backends over ssh, or directly when the node is this machine.
#[derive(Debug, Clone)]
pub struct SshLauncher {
    ssh_program: String,
}

impl Default for SshLauncher {
    fn default() -> Self {
        Self {
            ssh_program: "ssh".to_string(),
        }
    }
}

impl SshLauncher {
    pub fn new(ssh_program: impl Into<String>) -> Self {
        Self {
            ssh_program: ssh_program.into(),
        }
    }

    fn is_local(host: &str) -> bool {
        matches!(host, "localhost" | "127.0.0.1" | "::1")
    }

    fn command(&self, request: &LaunchRequest) -> Command {
        if Self::is_local(&request.host) {
            let mut cmd = Command::new(&request.launch.program);
            cmd.args(request.command_args());
            cmd
        } else {
            let mut cmd = Command::new(&self.ssh_program);
            cmd.arg("-o")
                .arg("BatchMode=yes")
                .arg(&request.host)
                .arg(&request.launch.program)
                .args(request.command_args());
            cmd
        }
    }
}

#[async_trait]
impl BackendLauncher for SshLauncher {
    async fn launch(&self, request: LaunchRequest) -> Result<()> {
        tracing::info!(
            rank = request.rank,
            host = %request.host,
            program = %request.launch.program,
            "Launching backend"
        );

        let mut child = self
            .command(&request)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(false)
            .spawn()
            .map_err(|e| JobError::Launch {
                host: request.host.clone(),
                reason: e.to_string(),
            })?;

        let rank = request.rank;
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) if status.success() => {
                    tracing::debug!(rank, "Backend process exited");
                }
                Ok(status) => {
                    tracing::warn!(rank, exit_code = ?status.code(), "Backend process failed");
                }
                Err(e) => {
                    tracing::warn!(rank, error = %e, "Lost track of backend process");
                }
            }
        });
        Ok(())
    }
}
