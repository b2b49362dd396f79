use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("No free port found after {attempts} attempts")]
    PortUnavailable { attempts: u32 },

    #[error("Invalid port set: {0}")]
    InvalidPorts(String),

    #[error("OS command `{command}` failed: {reason}")]
    OsCommandFailed { command: String, reason: String },

    #[error("Failed to spawn proxy core: {0}")]
    ProcessSpawnFailed(String),

    #[error("Failed to write proxy core config: {0}")]
    ConfigWriteFailed(String),

    #[error("Proxy core is already running")]
    AlreadyRunning,

    #[error("Unsupported platform: {0}")]
    UnsupportedPlatform(String),

    #[error("Port {0} is already in use")]
    PortInUse(u16),

    #[error("PAC server error: {0}")]
    PacServer(String),

    #[error("PAC error: {0}")]
    Pac(String),

    #[error("Settings store error: {0}")]
    Settings(String),

    #[error("Hook `{name}` does not match the kind of phase {phase}")]
    HookPhaseMismatch { phase: String, name: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CoreError {
    pub fn os_command(command: impl Into<String>, reason: impl Into<String>) -> Self {
        CoreError::OsCommandFailed { command: command.into(), reason: reason.into() }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
