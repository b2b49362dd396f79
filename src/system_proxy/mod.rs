use async_trait::async_trait;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::{CoreError, CoreResult};
use crate::paths::AppPaths;

pub mod command;
pub mod linux;
pub mod macos;
pub mod windows;

pub use command::{run_checked, CommandOutput, CommandRunner, SystemCommandRunner};
pub use linux::{DesktopEnv, LinuxProxy};
pub use macos::MacosProxy;
pub use windows::WindowsProxy;

pub const LOOPBACK_HOST: &str = "127.0.0.1";

/// Hosts that bypass the proxy on Linux and macOS.
pub const IGNORED_HOSTS: [&str; 7] =
    ["FE80::/64", "127.0.0.1/8", "::1", "FD00::/8", "192.168.0.0/16", "10.0.0.0/8", "localhost"];

pub const IGNORED_HOSTS_WINDOWS: &str = "localhost;127.*;10.*;172.16.*;172.17.*;172.18.*;172.19.*;172.20.*;172.21.*;172.22.*;172.23.*;172.24.*;172.25.*;172.26.*;172.27.*;172.28.*;172.29.*;172.30.*;172.31.*;192.168.*";

/// Translates a proxy mode into OS proxy settings. One peer implementation per OS.
#[async_trait]
pub trait PlatformProxy: Send + Sync {
    fn platform(&self) -> Platform;
    /// Leaves the OS without any proxy configured.
    async fn apply_manual(&self) -> CoreResult<()>;
    async fn apply_pac(&self, url: &str) -> CoreResult<()>;
    async fn apply_global(&self, host: &str, http_port: u16, socks_port: u16) -> CoreResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Linux,
    MacOs,
    Windows,
}

impl Platform {
    pub fn current() -> CoreResult<Self> {
        std::env::consts::OS.parse()
    }
}

impl FromStr for Platform {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "linux" => Ok(Platform::Linux),
            "darwin" | "macos" => Ok(Platform::MacOs),
            "win32" | "windows" => Ok(Platform::Windows),
            other => Err(CoreError::UnsupportedPlatform(other.to_string())),
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Platform::Linux => "linux",
            Platform::MacOs => "darwin",
            Platform::Windows => "win32",
        };
        f.write_str(name)
    }
}

pub struct PlatformProxyFactory;

impl PlatformProxyFactory {
    pub fn make(platform: Platform, runner: Arc<dyn CommandRunner>, paths: &AppPaths) -> Box<dyn PlatformProxy> {
        log::info!("[SYSTEM_PROXY] Using {} proxy strategy", platform);
        match platform {
            Platform::Linux => Box::new(LinuxProxy::new(runner, DesktopEnv::detect())),
            Platform::MacOs => Box::new(MacosProxy::new(runner)),
            Platform::Windows => Box::new(WindowsProxy::new(runner, paths.sysproxy_helper())),
        }
    }
}
