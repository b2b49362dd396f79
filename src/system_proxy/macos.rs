use async_trait::async_trait;
use std::sync::Arc;

use super::{run_checked, CommandRunner, Platform, PlatformProxy, IGNORED_HOSTS};
use crate::error::{CoreError, CoreResult};

const NETWORKSETUP: &str = "networksetup";

pub struct MacosProxy {
    runner: Arc<dyn CommandRunner>,
}

impl MacosProxy {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    /// Enabled network services; the header line and `*`-disabled services are skipped.
    async fn list_network_services(&self) -> CoreResult<Vec<String>> {
        let out = run_checked(self.runner.as_ref(), NETWORKSETUP, &["-listallnetworkservices".to_string()]).await?;
        let services: Vec<String> = out
            .stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with("An asterisk (") && !line.starts_with('*'))
            .map(str::to_string)
            .collect();
        if services.is_empty() {
            return Err(CoreError::os_command("networksetup -listallnetworkservices", "no enabled network services"));
        }
        Ok(services)
    }

    /// Runs the per-service command list for every service.
    ///
    /// A service succeeds when all of its commands do; the whole operation succeeds
    /// when at least one service was configured.
    async fn apply_per_service<F>(&self, commands_for: F) -> CoreResult<()>
    where
        F: Fn(&str) -> Vec<Vec<String>>,
    {
        let services = self.list_network_services().await?;
        let mut first_error = None;
        let mut configured = 0usize;
        for service in &services {
            let mut ok = true;
            for args in commands_for(service) {
                if let Err(e) = run_checked(self.runner.as_ref(), NETWORKSETUP, &args).await {
                    log::warn!("[SYSTEM_PROXY][macOS] {}: {}", service, e);
                    first_error.get_or_insert(e);
                    ok = false;
                    break;
                }
            }
            if ok {
                configured += 1;
            }
        }
        match (configured, first_error) {
            (0, Some(e)) => Err(e),
            _ => Ok(()),
        }
    }
}

fn args(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[async_trait]
impl PlatformProxy for MacosProxy {
    fn platform(&self) -> Platform { Platform::MacOs }

    async fn apply_manual(&self) -> CoreResult<()> {
        self.apply_per_service(|service| {
            vec![
                args(&["-setwebproxystate", service, "off"]),
                args(&["-setsecurewebproxystate", service, "off"]),
                args(&["-setsocksfirewallproxystate", service, "off"]),
                args(&["-setautoproxystate", service, "off"]),
            ]
        })
        .await?;
        log::info!("[SYSTEM_PROXY][macOS] Proxy disabled for all services");
        Ok(())
    }

    async fn apply_pac(&self, url: &str) -> CoreResult<()> {
        self.apply_per_service(|service| {
            vec![args(&["-setautoproxyurl", service, url]), args(&["-setautoproxystate", service, "on"])]
        })
        .await?;
        log::info!("[SYSTEM_PROXY][macOS] PAC set: {}", url);
        Ok(())
    }

    async fn apply_global(&self, host: &str, http_port: u16, socks_port: u16) -> CoreResult<()> {
        let http = http_port.to_string();
        let socks = socks_port.to_string();
        self.apply_per_service(|service| {
            let mut bypass = args(&["-setproxybypassdomains", service]);
            bypass.extend(IGNORED_HOSTS.iter().map(|h| h.to_string()));
            vec![
                args(&["-setwebproxy", service, host, http.as_str()]),
                args(&["-setsecurewebproxy", service, host, http.as_str()]),
                args(&["-setsocksfirewallproxy", service, host, socks.as_str()]),
                args(&["-setsocksfirewallproxystate", service, "on"]),
                bypass,
            ]
        })
        .await?;
        log::info!("[SYSTEM_PROXY][macOS] Proxies set: HTTP/HTTPS {}:{}, SOCKS {}:{}", host, http_port, host, socks_port);
        Ok(())
    }
}
