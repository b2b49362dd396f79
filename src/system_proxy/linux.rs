use async_trait::async_trait;
use std::sync::Arc;

use super::{run_checked, CommandRunner, Platform, PlatformProxy, IGNORED_HOSTS};
use crate::error::CoreResult;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DesktopEnv { Gnome, Kde }

impl DesktopEnv {
    /// KDE only when the session says so; everything else goes through gsettings.
    pub fn detect() -> Self {
        let de = std::env::var("XDG_CURRENT_DESKTOP").unwrap_or_default().to_lowercase();
        let ses = std::env::var("DESKTOP_SESSION").unwrap_or_default().to_lowercase();
        if [de, ses].iter().any(|s| s.contains("kde") || s.contains("plasma")) {
            DesktopEnv::Kde
        } else {
            DesktopEnv::Gnome
        }
    }
}

pub struct LinuxProxy {
    runner: Arc<dyn CommandRunner>,
    desktop: DesktopEnv,
}

impl LinuxProxy {
    pub fn new(runner: Arc<dyn CommandRunner>, desktop: DesktopEnv) -> Self {
        Self { runner, desktop }
    }

    /// Issues commands in order; the first failure aborts the rest.
    async fn run_all(&self, commands: Vec<(&'static str, Vec<String>)>) -> CoreResult<()> {
        for (program, args) in commands {
            run_checked(self.runner.as_ref(), program, &args).await?;
        }
        if self.desktop == DesktopEnv::Kde {
            // tells running KDE apps to re-read kioslaverc; not every session has qdbus
            let args = vec!["org.kde.kded5".to_string(), "/kded".to_string(), "reconfigure".to_string()];
            if let Err(e) = run_checked(self.runner.as_ref(), "qdbus", &args).await {
                log::warn!("[SYSTEM_PROXY] KDE reconfigure failed: {}", e);
            }
        }
        Ok(())
    }
}

fn gsettings(schema: &str, key: &str, value: impl Into<String>) -> (&'static str, Vec<String>) {
    ("gsettings", vec!["set".into(), schema.into(), key.into(), value.into()])
}

fn kwriteconfig(key: &str, value: impl Into<String>) -> (&'static str, Vec<String>) {
    (
        "kwriteconfig5",
        vec![
            "--file".into(),
            "kioslaverc".into(),
            "--group".into(),
            "Proxy Settings".into(),
            "--key".into(),
            key.into(),
            value.into(),
        ],
    )
}

fn gnome_ignore_hosts() -> String {
    let quoted: Vec<String> = IGNORED_HOSTS.iter().map(|h| format!("'{}'", h)).collect();
    format!("[{}]", quoted.join(", "))
}

#[async_trait]
impl PlatformProxy for LinuxProxy {
    fn platform(&self) -> Platform { Platform::Linux }

    async fn apply_manual(&self) -> CoreResult<()> {
        let commands = match self.desktop {
            DesktopEnv::Gnome => vec![gsettings("org.gnome.system.proxy", "mode", "none")],
            // ProxyType: 0 none, 1 manual, 2 PAC url
            DesktopEnv::Kde => vec![kwriteconfig("ProxyType", "0")],
        };
        self.run_all(commands).await?;
        log::info!("[SYSTEM_PROXY] Linux ({:?}) proxy disabled", self.desktop);
        Ok(())
    }

    async fn apply_pac(&self, url: &str) -> CoreResult<()> {
        let commands = match self.desktop {
            DesktopEnv::Gnome => vec![
                gsettings("org.gnome.system.proxy", "mode", "auto"),
                gsettings("org.gnome.system.proxy", "autoconfig-url", url),
            ],
            DesktopEnv::Kde => vec![kwriteconfig("ProxyType", "2"), kwriteconfig("Proxy Config Script", url)],
        };
        self.run_all(commands).await?;
        log::info!("[SYSTEM_PROXY] Linux ({:?}) PAC set: {}", self.desktop, url);
        Ok(())
    }

    async fn apply_global(&self, host: &str, http_port: u16, socks_port: u16) -> CoreResult<()> {
        let commands = match self.desktop {
            DesktopEnv::Gnome => vec![
                gsettings("org.gnome.system.proxy", "mode", "manual"),
                gsettings("org.gnome.system.proxy.http", "host", host),
                gsettings("org.gnome.system.proxy.http", "port", http_port.to_string()),
                gsettings("org.gnome.system.proxy.https", "host", host),
                gsettings("org.gnome.system.proxy.https", "port", http_port.to_string()),
                gsettings("org.gnome.system.proxy.socks", "host", host),
                gsettings("org.gnome.system.proxy.socks", "port", socks_port.to_string()),
                gsettings("org.gnome.system.proxy", "ignore-hosts", gnome_ignore_hosts()),
            ],
            DesktopEnv::Kde => vec![
                kwriteconfig("ProxyType", "1"),
                kwriteconfig("httpProxy", format!("http://{} {}", host, http_port)),
                kwriteconfig("httpsProxy", format!("http://{} {}", host, http_port)),
                kwriteconfig("socksProxy", format!("socks://{} {}", host, socks_port)),
                kwriteconfig("NoProxyFor", IGNORED_HOSTS.join(",")),
            ],
        };
        self.run_all(commands).await?;
        log::info!("[SYSTEM_PROXY] Linux ({:?}) global proxy set: {} http={} socks={}", self.desktop, host, http_port, socks_port);
        Ok(())
    }
}
