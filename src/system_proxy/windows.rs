use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;

use super::{run_checked, CommandRunner, Platform, PlatformProxy, IGNORED_HOSTS_WINDOWS};
use crate::error::CoreResult;

/// Drives the bundled `sysproxy.exe` helper, which writes the WinINet settings for us.
pub struct WindowsProxy {
    runner: Arc<dyn CommandRunner>,
    helper: PathBuf,
}

impl WindowsProxy {
    pub fn new(runner: Arc<dyn CommandRunner>, helper: PathBuf) -> Self {
        Self { runner, helper }
    }

    async fn sysproxy(&self, args: &[&str]) -> CoreResult<()> {
        let program = self.helper.to_string_lossy();
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        run_checked(self.runner.as_ref(), &program, &args).await?;
        Ok(())
    }
}

#[async_trait]
impl PlatformProxy for WindowsProxy {
    fn platform(&self) -> Platform { Platform::Windows }

    async fn apply_manual(&self) -> CoreResult<()> {
        self.sysproxy(&["set", "1", "-", "-"]).await?;
        log::info!("[SYSTEM_PROXY][Windows] Proxy disabled");
        Ok(())
    }

    async fn apply_pac(&self, url: &str) -> CoreResult<()> {
        self.sysproxy(&["pac", url]).await?;
        log::info!("[SYSTEM_PROXY][Windows] PAC set: {}", url);
        Ok(())
    }

    async fn apply_global(&self, host: &str, http_port: u16, _socks_port: u16) -> CoreResult<()> {
        let server = format!("{}:{}", host, http_port);
        self.sysproxy(&["global", &server, IGNORED_HOSTS_WINDOWS]).await?;
        log::info!("[SYSTEM_PROXY][Windows] Global proxy set: {}", server);
        Ok(())
    }
}
