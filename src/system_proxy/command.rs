use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

use crate::error::{CoreError, CoreResult};
use crate::runtime_settings::DEFAULT_COMMAND_TIMEOUT;
use crate::utils::display_command;

#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool { self.code == Some(0) }
}

/// Seam between the platform strategies and the external tools they drive.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[String]) -> CoreResult<CommandOutput>;
}

/// Runs a command and maps a non-zero exit to [`CoreError::OsCommandFailed`].
pub async fn run_checked(runner: &dyn CommandRunner, program: &str, args: &[String]) -> CoreResult<CommandOutput> {
    let out = runner.run(program, args).await?;
    if out.success() {
        return Ok(out);
    }
    let reason = match out.code {
        Some(code) if out.stderr.trim().is_empty() => format!("exit code {}", code),
        Some(code) => format!("exit code {}: {}", code, out.stderr.trim()),
        None => "terminated by signal".to_string(),
    };
    Err(CoreError::os_command(display_command(program, args), reason))
}

pub struct SystemCommandRunner {
    timeout: Duration,
}

impl SystemCommandRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for SystemCommandRunner {
    fn default() -> Self {
        Self::new(DEFAULT_COMMAND_TIMEOUT)
    }
}

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn run(&self, program: &str, args: &[String]) -> CoreResult<CommandOutput> {
        let shown = display_command(program, args);
        log::debug!("[SYSTEM_PROXY] exec: {}", shown);

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(target_os = "windows")]
        {
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(CoreError::os_command(shown, e.to_string())),
            Err(_) => {
                log::warn!("[SYSTEM_PROXY] `{}` timed out after {:?}", shown, self.timeout);
                return Err(CoreError::os_command(shown, format!("timed out after {:?}", self.timeout)));
            }
        };

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}
