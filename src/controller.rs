use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::{CoreError, CoreResult};
use crate::events::{CoreEvent, EventBus};
use crate::net::pick_ephemeral_port;
use crate::pac::{PacServer, PacStore};
use crate::runtime_settings::DEFAULT_PAC_PORT_ATTEMPTS;
use crate::settings_store::{SettingsStore, KEY_PROXY_MODE};
use crate::system_proxy::{PlatformProxy, LOOPBACK_HOST};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProxyMode {
    /// OS proxy left disabled.
    Manual,
    #[serde(rename = "PAC")]
    Pac,
    Global,
}

impl fmt::Display for ProxyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProxyMode::Manual => "Manual",
            ProxyMode::Pac => "PAC",
            ProxyMode::Global => "Global",
        })
    }
}

impl FromStr for ProxyMode {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "manual" => Ok(ProxyMode::Manual),
            "pac" => Ok(ProxyMode::Pac),
            "global" => Ok(ProxyMode::Global),
            other => Err(CoreError::Settings(format!("unknown proxy mode: {}", other))),
        }
    }
}

/// Listener ports the OS proxy settings point at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortSet {
    pub http: u16,
    pub socks: u16,
    pub pac: u16,
}

impl PortSet {
    /// All three must be non-zero and pairwise distinct.
    pub fn new(http: u16, socks: u16, pac: u16) -> CoreResult<Self> {
        if http == 0 || socks == 0 || pac == 0 {
            return Err(CoreError::InvalidPorts(format!("zero port in http={} socks={} pac={}", http, socks, pac)));
        }
        if http == socks || http == pac || socks == pac {
            return Err(CoreError::InvalidPorts(format!("ports must differ: http={} socks={} pac={}", http, socks, pac)));
        }
        Ok(Self { http, socks, pac })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyState {
    pub mode: ProxyMode,
    pub ports: PortSet,
    pub is_active: bool,
}

struct OsBinding {
    strategy: Box<dyn PlatformProxy>,
    pac_store: PacStore,
    pac_server: Option<PacServer>,
    pac_port_attempts: u32,
}

impl OsBinding {
    async fn stop_pac_server(&mut self) {
        if let Some(server) = self.pac_server.take() {
            server.stop().await;
        }
    }

    /// Binds a PAC server on `ports.pac`, drawing a fresh port when that one was taken since it was probed.
    async fn bind_pac_server(&self, ports: PortSet, script: String) -> CoreResult<PacServer> {
        let mut port = ports.pac;
        let mut retries = 0;
        loop {
            match PacServer::start(port, script.clone()).await {
                Err(CoreError::PortInUse(busy)) if retries < self.pac_port_attempts => {
                    retries += 1;
                    log::warn!(
                        "[PROXY] PAC port {} was taken, drawing another ({}/{})",
                        busy,
                        retries,
                        self.pac_port_attempts
                    );
                    port = pick_ephemeral_port(self.pac_port_attempts, &[ports.http, ports.socks, busy])?;
                }
                result => return result,
            }
        }
    }

    /// Serves the freshly rendered script and points the OS at it. Returns the PAC port in use.
    ///
    /// A server already on `ports.pac` just gets the new script. Otherwise the previous server
    /// keeps running until the OS has accepted the new URL.
    async fn serve_and_apply_pac(&mut self, ports: PortSet) -> CoreResult<u16> {
        let script = self.pac_store.render(ports.http, ports.socks).await?;
        if let Some(server) = self.pac_server.as_ref().filter(|s| s.port() == ports.pac) {
            server.set_script(script);
            self.strategy.apply_pac(&server.url()).await?;
            return Ok(ports.pac);
        }
        let server = self.bind_pac_server(ports, script).await?;
        if let Err(e) = self.strategy.apply_pac(&server.url()).await {
            server.stop().await;
            return Err(e);
        }
        let port = server.port();
        if let Some(old) = self.pac_server.replace(server) {
            old.stop().await;
        }
        Ok(port)
    }

    /// Applies `mode` on top of `live`, the mode currently applied if any. Returns the ports in use.
    async fn apply(&mut self, mode: ProxyMode, ports: PortSet, live: Option<ProxyMode>) -> CoreResult<PortSet> {
        if mode != ProxyMode::Manual && live != Some(mode) {
            // settings of the previous mode must not stay active beside the new one
            self.strategy.apply_manual().await?;
        }
        match mode {
            ProxyMode::Manual => {
                self.strategy.apply_manual().await?;
                self.stop_pac_server().await;
                Ok(ports)
            }
            ProxyMode::Pac => {
                let pac = self.serve_and_apply_pac(ports).await?;
                Ok(PortSet { pac, ..ports })
            }
            ProxyMode::Global => {
                self.strategy.apply_global(LOOPBACK_HOST, ports.http, ports.socks).await?;
                self.stop_pac_server().await;
                Ok(ports)
            }
        }
    }
}

/// Translates the logical proxy mode into OS settings and keeps the PAC endpoint in step.
///
/// OS-touching operations are serialized by the binding lock; the recorded state only
/// changes after the OS calls succeed.
pub struct ProxyController {
    state: parking_lot::Mutex<ProxyState>,
    os: tokio::sync::Mutex<OsBinding>,
    store: Arc<dyn SettingsStore>,
    bus: Arc<EventBus>,
}

impl ProxyController {
    pub fn new(
        strategy: Box<dyn PlatformProxy>,
        pac_store: PacStore,
        ports: PortSet,
        mode: ProxyMode,
        store: Arc<dyn SettingsStore>,
        bus: Arc<EventBus>,
    ) -> Self {
        log::info!(
            "[PROXY] Controller created on {}: mode={}, http={}, socks={}, pac={}",
            strategy.platform(),
            mode,
            ports.http,
            ports.socks,
            ports.pac
        );
        Self {
            state: parking_lot::Mutex::new(ProxyState { mode, ports, is_active: false }),
            os: tokio::sync::Mutex::new(OsBinding {
                strategy,
                pac_store,
                pac_server: None,
                pac_port_attempts: DEFAULT_PAC_PORT_ATTEMPTS,
            }),
            store,
            bus,
        }
    }

    /// How many fresh ports to try when the PAC port is taken at bind time.
    pub fn with_pac_port_attempts(mut self, attempts: u32) -> Self {
        self.os.get_mut().pac_port_attempts = attempts;
        self
    }

    pub fn state(&self) -> ProxyState {
        *self.state.lock()
    }

    /// Records the mode to use on the next `start` without touching the OS.
    pub fn set_mode(&self, mode: ProxyMode) {
        self.state.lock().mode = mode;
    }

    /// Replaces the port set. `None` keeps the current PAC port. No OS calls are made.
    pub fn update_ports(&self, http: u16, socks: u16, pac: Option<u16>) -> CoreResult<()> {
        let mut state = self.state.lock();
        let ports = PortSet::new(http, socks, pac.unwrap_or(state.ports.pac))?;
        if ports != state.ports {
            log::info!("[PROXY] Ports updated: http={}, socks={}, pac={}", ports.http, ports.socks, ports.pac);
        }
        state.ports = ports;
        Ok(())
    }

    /// Applies `mode` to the OS. On failure the recorded state is left as it was.
    pub async fn switch_mode(&self, mode: ProxyMode) -> CoreResult<()> {
        let mut os = self.os.lock().await;
        let before = self.state();
        log::info!("[PROXY] Switching mode {} -> {}", before.mode, mode);

        let ports = match os.apply(mode, before.ports, before.is_active.then_some(before.mode)).await {
            Ok(ports) => ports,
            Err(e) => {
                log::error!("[PROXY] Failed to apply {} mode: {}", mode, e);
                if before.is_active && before.mode != mode {
                    if let Err(restore) = os.apply(before.mode, before.ports, None).await {
                        log::error!("[PROXY] Failed to restore {} mode: {}", before.mode, restore);
                    }
                }
                return Err(e);
            }
        };
        drop(os);
        if ports.pac != before.ports.pac {
            log::info!("[PROXY] PAC now served on port {}", ports.pac);
        }

        let after = {
            let mut state = self.state.lock();
            state.mode = mode;
            state.ports.pac = ports.pac;
            state.is_active = true;
            *state
        };
        self.persist_mode(mode).await;
        self.publish(after);
        log::info!("[PROXY] Mode {} applied", mode);
        Ok(())
    }

    /// Applies the recorded mode; Manual counts as active too.
    pub async fn start(&self) -> CoreResult<()> {
        let mode = self.state().mode;
        log::info!("[PROXY] Starting system proxy in {} mode", mode);
        self.switch_mode(mode).await
    }

    /// Disables the OS proxy and the PAC endpoint. Failures are logged, never returned.
    pub async fn stop(&self) {
        let mut os = self.os.lock().await;
        os.stop_pac_server().await;
        if let Err(e) = os.strategy.apply_manual().await {
            log::error!("[PROXY] Failed to clear system proxy: {}", e);
        }
        drop(os);

        let after = {
            let mut state = self.state.lock();
            state.is_active = false;
            *state
        };
        self.publish(after);
        log::info!("[PROXY] System proxy stopped");
    }

    /// Replaces the user PAC rules; re-applies PAC when it is the live mode.
    pub async fn update_user_rules(&self, text: &str) -> CoreResult<()> {
        let mut os = self.os.lock().await;
        os.pac_store.update_user_rules(text).await?;
        self.reapply_live_pac(&mut os, "user rules").await
    }

    /// Replaces the block-list source; re-applies PAC when it is the live mode.
    pub async fn update_base_rules(&self, text: &str) -> CoreResult<()> {
        let mut os = self.os.lock().await;
        os.pac_store.update_base_rules(text).await?;
        self.reapply_live_pac(&mut os, "block-list").await
    }

    async fn reapply_live_pac(&self, os: &mut OsBinding, what: &str) -> CoreResult<()> {
        let state = self.state();
        if state.is_active && state.mode == ProxyMode::Pac {
            let pac = os.serve_and_apply_pac(state.ports).await?;
            self.state.lock().ports.pac = pac;
            log::info!("[PROXY] PAC re-applied with new {}", what);
        }
        Ok(())
    }

    /// URL of the PAC endpoint while one is being served.
    pub async fn pac_url(&self) -> Option<String> {
        self.os.lock().await.pac_server.as_ref().map(PacServer::url)
    }

    async fn persist_mode(&self, mode: ProxyMode) {
        let value = match serde_json::to_value(mode) {
            Ok(v) => v,
            Err(e) => {
                log::error!("[PROXY] Failed to encode mode {}: {}", mode, e);
                return;
            }
        };
        if let Err(e) = self.store.write(KEY_PROXY_MODE, value).await {
            log::error!("[PROXY] Failed to persist proxy mode: {}", e);
        }
    }

    fn publish(&self, state: ProxyState) {
        self.bus.publish(&CoreEvent::ProxyStatusChanged { active: state.is_active, mode: state.mode });
    }
}


#[cfg(test)]
mod tests {
    use super::testing::FakeGsettings;
    use super::*;
    use crate::net::pick_ephemeral_port;
    use crate::settings_store::MemoryStore;
    use crate::system_proxy::testing::RecordingRunner;
    use crate::system_proxy::{DesktopEnv, LinuxProxy, MacosProxy};
    use serde_json::json;

    struct Fixture {
        os: Arc<FakeGsettings>,
        store: Arc<MemoryStore>,
        controller: ProxyController,
        _dir: tempfile::TempDir,
    }

    fn fixture(mode: ProxyMode, pac: u16) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let os = Arc::new(FakeGsettings::default());
        let store = Arc::new(MemoryStore::new());
        let controller = ProxyController::new(
            Box::new(LinuxProxy::new(os.clone(), DesktopEnv::Gnome)),
            PacStore::new(dir.path()),
            PortSet::new(10871, 10801, pac).unwrap(),
            mode,
            store.clone(),
            Arc::new(EventBus::new()),
        );
        Fixture { os, store, controller, _dir: dir }
    }

    const SCHEMA: &str = "org.gnome.system.proxy";

    #[test]
    fn mode_string_forms() {
        assert_eq!(serde_json::to_value(ProxyMode::Pac).unwrap(), json!("PAC"));
        assert_eq!(serde_json::from_value::<ProxyMode>(json!("Global")).unwrap(), ProxyMode::Global);
        assert_eq!("pac".parse::<ProxyMode>().unwrap(), ProxyMode::Pac);
        assert!("tun".parse::<ProxyMode>().is_err());
    }

    #[test]
    fn port_set_rejects_zero_and_duplicates() {
        assert!(PortSet::new(10871, 10801, 51234).is_ok());
        assert!(matches!(PortSet::new(0, 10801, 51234), Err(CoreError::InvalidPorts(_))));
        assert!(matches!(PortSet::new(10871, 10871, 51234), Err(CoreError::InvalidPorts(_))));
        assert!(matches!(PortSet::new(10871, 10801, 10801), Err(CoreError::InvalidPorts(_))));
    }

    #[tokio::test]
    async fn global_then_manual_clears_the_os_proxy() {
        let f = fixture(ProxyMode::Manual, 51234);
        f.controller.switch_mode(ProxyMode::Global).await.unwrap();
        assert_eq!(f.os.get(SCHEMA, "mode").as_deref(), Some("manual"));
        assert_eq!(f.os.get("org.gnome.system.proxy.http", "port").as_deref(), Some("10871"));
        assert_eq!(f.os.get("org.gnome.system.proxy.socks", "port").as_deref(), Some("10801"));

        f.controller.switch_mode(ProxyMode::Manual).await.unwrap();
        assert_eq!(f.os.get(SCHEMA, "mode").as_deref(), Some("none"));
        assert_eq!(f.store.get(KEY_PROXY_MODE), Some(json!("Manual")));
    }

    #[tokio::test]
    async fn manual_start_sets_no_proxy_fields() {
        let f = fixture(ProxyMode::Manual, 51234);
        f.controller.start().await.unwrap();
        let state = f.controller.state();
        assert!(state.is_active);
        assert_eq!(state.mode, ProxyMode::Manual);
        assert_eq!(f.os.get(SCHEMA, "mode").as_deref(), Some("none"));
        assert!(f.os.get("org.gnome.system.proxy.http", "host").is_none());
        assert!(f.controller.pac_url().await.is_none());
    }

    #[tokio::test]
    async fn pac_url_follows_pac_port() {
        let first = pick_ephemeral_port(10, &[10871, 10801]).unwrap();
        let f = fixture(ProxyMode::Manual, first);
        f.controller.switch_mode(ProxyMode::Pac).await.unwrap();
        let url = format!("http://127.0.0.1:{}/proxy.pac", first);
        assert_eq!(f.os.get(SCHEMA, "autoconfig-url"), Some(url.clone()));
        assert_eq!(f.controller.pac_url().await, Some(url));

        let second = pick_ephemeral_port(10, &[10871, 10801, first]).unwrap();
        f.controller.update_ports(10871, 10801, Some(second)).unwrap();
        f.controller.switch_mode(ProxyMode::Pac).await.unwrap();
        let url = format!("http://127.0.0.1:{}/proxy.pac", second);
        assert_eq!(f.os.get(SCHEMA, "autoconfig-url"), Some(url.clone()));
        assert_eq!(f.controller.pac_url().await, Some(url));
        f.controller.stop().await;
    }

    #[tokio::test]
    async fn failed_pac_move_keeps_the_old_endpoint() {
        let first = pick_ephemeral_port(10, &[10871, 10801]).unwrap();
        let f = fixture(ProxyMode::Manual, first);
        f.controller.switch_mode(ProxyMode::Pac).await.unwrap();

        let second = pick_ephemeral_port(10, &[10871, 10801, first]).unwrap();
        f.controller.update_ports(10871, 10801, Some(second)).unwrap();
        f.os.fail_on(Some(format!(":{}/", second).as_str()));
        assert!(f.controller.switch_mode(ProxyMode::Pac).await.is_err());

        let old = format!("http://127.0.0.1:{}/proxy.pac", first);
        assert_eq!(f.os.get(SCHEMA, "autoconfig-url"), Some(old.clone()));
        assert_eq!(f.controller.pac_url().await, Some(old));
        assert!(std::net::TcpStream::connect(("127.0.0.1", first)).is_ok());
        assert!(std::net::TcpStream::connect(("127.0.0.1", second)).is_err());
        f.os.fail_on(None);
        f.controller.stop().await;
    }

    #[tokio::test]
    async fn taken_pac_port_is_replaced_at_bind_time() {
        let held = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let busy = held.local_addr().unwrap().port();
        let f = fixture(ProxyMode::Pac, busy);
        f.controller.start().await.unwrap();

        let pac = f.controller.state().ports.pac;
        assert_ne!(pac, busy);
        let url = format!("http://127.0.0.1:{}/proxy.pac", pac);
        assert_eq!(f.os.get(SCHEMA, "autoconfig-url"), Some(url.clone()));
        assert_eq!(f.controller.pac_url().await, Some(url));
        f.controller.stop().await;
    }

    #[tokio::test]
    async fn block_list_refresh_reaches_the_live_pac() {
        let port = pick_ephemeral_port(10, &[10871, 10801]).unwrap();
        let f = fixture(ProxyMode::Pac, port);
        f.controller.start().await.unwrap();
        f.controller.update_base_rules("||blocked.example").await.unwrap();
        let served = tokio::fs::read_to_string(f._dir.path().join("proxy.pac")).await.unwrap();
        assert!(served.contains("||blocked.example"));
        assert_eq!(f.controller.state().ports.pac, port);
        f.controller.stop().await;
    }

    #[tokio::test]
    async fn switching_clears_the_previous_mode_first() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(RecordingRunner::default());
        runner.stdout.lock().insert("networksetup -listallnetworkservices".into(), "Wi-Fi\n".into());
        let pac = pick_ephemeral_port(10, &[10871, 10801]).unwrap();
        let c = ProxyController::new(
            Box::new(MacosProxy::new(runner.clone())),
            PacStore::new(dir.path()),
            PortSet::new(10871, 10801, pac).unwrap(),
            ProxyMode::Global,
            Arc::new(MemoryStore::new()),
            Arc::new(EventBus::new()),
        );
        let position = |calls: &[String], wanted: &str| calls.iter().position(|line| line == wanted);

        c.start().await.unwrap();
        runner.calls.lock().clear();
        c.switch_mode(ProxyMode::Pac).await.unwrap();
        let calls = runner.calls();
        let web_off = position(&calls, "networksetup -setwebproxystate Wi-Fi off").unwrap();
        assert!(position(&calls, "networksetup -setsocksfirewallproxystate Wi-Fi off").is_some());
        let pac_on = position(&calls, "networksetup -setautoproxystate Wi-Fi on").unwrap();
        assert!(web_off < pac_on);

        runner.calls.lock().clear();
        c.switch_mode(ProxyMode::Global).await.unwrap();
        let calls = runner.calls();
        let pac_off = position(&calls, "networksetup -setautoproxystate Wi-Fi off").unwrap();
        let web_on = position(&calls, "networksetup -setwebproxy Wi-Fi 127.0.0.1 10871").unwrap();
        assert!(pac_off < web_on);
        assert!(c.pac_url().await.is_none());
    }

    #[tokio::test]
    async fn failed_switch_restores_the_live_mode() {
        let f = fixture(ProxyMode::Global, 51234);
        f.controller.start().await.unwrap();
        f.os.fail_on(Some("autoconfig-url"));
        assert!(f.controller.switch_mode(ProxyMode::Pac).await.is_err());
        assert_eq!(f.controller.state().mode, ProxyMode::Global);
        assert_eq!(f.os.get(SCHEMA, "mode").as_deref(), Some("manual"));
        assert!(f.controller.pac_url().await.is_none());
    }

    #[tokio::test]
    async fn failed_switch_keeps_recorded_mode() {
        let f = fixture(ProxyMode::Manual, 51234);
        f.controller.start().await.unwrap();
        f.os.fail_on(Some("proxy.https"));
        let err = f.controller.switch_mode(ProxyMode::Global).await.unwrap_err();
        assert!(matches!(err, CoreError::OsCommandFailed { .. }));
        assert_eq!(f.controller.state().mode, ProxyMode::Manual);
        assert_eq!(f.store.get(KEY_PROXY_MODE), Some(json!("Manual")));
    }

    #[tokio::test]
    async fn stop_swallows_os_failures() {
        let f = fixture(ProxyMode::Global, 51234);
        f.controller.start().await.unwrap();
        f.os.fail_on(Some("gsettings"));
        f.controller.stop().await;
        assert!(!f.controller.state().is_active);
        assert_eq!(f.controller.state().mode, ProxyMode::Global);
    }

    #[tokio::test]
    async fn update_ports_validates_without_os_calls() {
        let f = fixture(ProxyMode::Manual, 51234);
        assert!(matches!(f.controller.update_ports(10801, 10801, None), Err(CoreError::InvalidPorts(_))));
        f.controller.update_ports(8080, 1080, None).unwrap();
        assert_eq!(f.controller.state().ports, PortSet::new(8080, 1080, 51234).unwrap());
        assert!(f.os.values.lock().is_empty());
    }

    #[tokio::test]
    async fn status_is_broadcast() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(EventBus::new());
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let s = seen.clone();
        bus.subscribe(crate::events::Topic::ProxyStatus, move |e| {
            if let CoreEvent::ProxyStatusChanged { active, mode } = e {
                s.lock().push((*active, *mode));
            }
            Ok(())
        });
        let c = ProxyController::new(
            Box::new(LinuxProxy::new(Arc::new(FakeGsettings::default()), DesktopEnv::Gnome)),
            PacStore::new(dir.path()),
            PortSet::new(10871, 10801, 51234).unwrap(),
            ProxyMode::Global,
            Arc::new(MemoryStore::new()),
            bus,
        );
        c.start().await.unwrap();
        c.stop().await;
        assert_eq!(*seen.lock(), vec![(true, ProxyMode::Global), (false, ProxyMode::Global)]);
    }
}
