use std::path::PathBuf;
use std::time::Duration;

use crate::supervisor::RestartPolicy;

pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_PAC_PORT_ATTEMPTS: u32 = 3;

#[derive(Clone, Debug)]
pub struct RuntimeSettings {
    /// Root of every per-user file the app owns; `None` resolves to `dirs::data_dir()/v2rayx`.
    pub data_dir: Option<PathBuf>,
    /// Overrides the bundled proxy-core executable.
    pub core_bin: Option<PathBuf>,
    pub command_timeout: Duration,
    pub restart_policy: RestartPolicy,
    pub pac_port_attempts: u32,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            data_dir: None,
            core_bin: None,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            restart_policy: RestartPolicy::Replace,
            pac_port_attempts: DEFAULT_PAC_PORT_ATTEMPTS,
        }
    }
}

impl RuntimeSettings {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let data_dir = std::env::var("V2RAYX_DATA_DIR").ok().filter(|s| !s.is_empty()).map(PathBuf::from);
        let core_bin = std::env::var("V2RAYX_CORE_BIN").ok().filter(|s| !s.is_empty()).map(PathBuf::from);
        let command_timeout = std::env::var("V2RAYX_COMMAND_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(defaults.command_timeout);
        let restart_policy = match std::env::var("V2RAYX_RESTART_POLICY").unwrap_or_default().to_lowercase().as_str() {
            "reject" => RestartPolicy::Reject,
            _ => RestartPolicy::Replace,
        };
        let pac_port_attempts = std::env::var("V2RAYX_PAC_PORT_ATTEMPTS")
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .filter(|n| *n > 0)
            .unwrap_or(defaults.pac_port_attempts);
        Self { data_dir, core_bin, command_timeout, restart_policy, pac_port_attempts }
    }
}
