use anyhow::Result;
use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::controller::{PortSet, ProxyController, ProxyMode};
use crate::error::{CoreError, CoreResult};
use crate::events::EventBus;
use crate::pac::PacStore;
use crate::paths::AppPaths;
use crate::runtime_settings::RuntimeSettings;
use crate::service_config::ServiceConfig;
use crate::settings_store::{AppSettings, JsonFileStore, SettingsStore};
use crate::supervisor::ProcessSupervisor;
use crate::system_proxy::{CommandRunner, Platform, PlatformProxyFactory, SystemCommandRunner};

/// Composition root: owns the shared collaborators and the one controller and supervisor
/// per process. Lifecycle hooks receive it as `Arc<AppContext>`.
pub struct AppContext {
    settings: RuntimeSettings,
    paths: AppPaths,
    platform: Platform,
    bus: Arc<EventBus>,
    store: Arc<dyn SettingsStore>,
    runner: Arc<dyn CommandRunner>,
    pac_store: PacStore,
    app_settings: RwLock<AppSettings>,
    controller: OnceCell<Arc<ProxyController>>,
    supervisor: OnceCell<Arc<ProcessSupervisor>>,
    pac_setup: Mutex<Option<JoinHandle<()>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl AppContext {
    pub fn new(
        settings: RuntimeSettings,
        paths: AppPaths,
        platform: Platform,
        store: Arc<dyn SettingsStore>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        let pac_store = PacStore::new(paths.pac_dir());
        Self {
            settings,
            paths,
            platform,
            bus: Arc::new(EventBus::new()),
            store,
            runner,
            pac_store,
            app_settings: RwLock::new(AppSettings::default()),
            controller: OnceCell::new(),
            supervisor: OnceCell::new(),
            pac_setup: Mutex::new(None),
            dispatcher: Mutex::new(None),
        }
    }

    /// Production wiring: real paths, `settings.json`, OS commands for the current platform.
    pub fn from_settings(settings: RuntimeSettings) -> Result<Self> {
        let paths = AppPaths::resolve(settings.data_dir.as_deref())?;
        let platform = Platform::current()?;
        let store: Arc<dyn SettingsStore> = Arc::new(JsonFileStore::new(paths.settings_file()));
        let runner: Arc<dyn CommandRunner> = Arc::new(SystemCommandRunner::new(settings.command_timeout));
        log::info!("[MAIN] Data dir {}, platform {}", paths.root().display(), platform);
        Ok(Self::new(settings, paths, platform, store, runner))
    }

    pub fn settings(&self) -> &RuntimeSettings { &self.settings }
    pub fn paths(&self) -> &AppPaths { &self.paths }
    pub fn platform(&self) -> Platform { self.platform }
    pub fn bus(&self) -> &Arc<EventBus> { &self.bus }
    pub fn store(&self) -> &Arc<dyn SettingsStore> { &self.store }
    pub fn pac_store(&self) -> &PacStore { &self.pac_store }

    pub fn app_settings(&self) -> AppSettings {
        self.app_settings.read().clone()
    }

    /// Refreshes the cached snapshot of persisted user settings.
    pub async fn reload_app_settings(&self) -> CoreResult<AppSettings> {
        let loaded = AppSettings::load(self.store.as_ref()).await?;
        log::info!(
            "[CONFIG] Loaded settings: mode={}, autoStart={}, serviceRunning={}",
            loaded.proxy_mode,
            loaded.auto_start,
            loaded.service_running
        );
        *self.app_settings.write() = loaded.clone();
        Ok(loaded)
    }

    /// Returns the controller, creating it on first use.
    ///
    /// Later calls only update ports and mode on the existing instance.
    pub fn proxy_controller(&self, ports: PortSet, mode: ProxyMode) -> CoreResult<Arc<ProxyController>> {
        if let Some(existing) = self.controller.get() {
            existing.update_ports(ports.http, ports.socks, Some(ports.pac))?;
            existing.set_mode(mode);
            return Ok(Arc::clone(existing));
        }
        let controller = self.controller.get_or_init(|| {
            let strategy = PlatformProxyFactory::make(self.platform, Arc::clone(&self.runner), &self.paths);
            Arc::new(
                ProxyController::new(
                    strategy,
                    self.pac_store.clone(),
                    ports,
                    mode,
                    Arc::clone(&self.store),
                    Arc::clone(&self.bus),
                )
                .with_pac_port_attempts(self.settings.pac_port_attempts),
            )
        });
        Ok(Arc::clone(controller))
    }

    /// The controller, if the ready phase has created one.
    pub fn controller(&self) -> Option<Arc<ProxyController>> {
        self.controller.get().cloned()
    }

    pub fn supervisor(&self) -> Arc<ProcessSupervisor> {
        let sup = self.supervisor.get_or_init(|| {
            let bin = self.settings.core_bin.clone().unwrap_or_else(|| self.paths.core_bin());
            log::info!("[CORE] Using core binary {}", bin.display());
            Arc::new(ProcessSupervisor::new(
                bin,
                self.paths.core_config_file(),
                self.settings.restart_policy,
                Arc::clone(&self.bus),
            ))
        });
        Arc::clone(sup)
    }

    /// Core config assembled from the persisted server template and selected outbound.
    pub async fn core_config_from_store(&self) -> CoreResult<ServiceConfig> {
        let s = AppSettings::load(self.store.as_ref()).await?;
        let outbound = s
            .current_outbound
            .ok_or_else(|| CoreError::Settings("no outbound selected".to_string()))?;
        let template = s.server_template.unwrap_or_else(|| ServiceConfig::default_template().into_value());
        let logs = s.logs_folder.unwrap_or_else(|| self.paths.logs_dir());
        Ok(ServiceConfig::from_template(template, outbound, &logs))
    }

    pub(crate) fn set_pac_setup(&self, task: JoinHandle<()>) {
        *self.pac_setup.lock() = Some(task);
    }

    /// Waits for the first-run PAC generation started during `beforeReady`, if any.
    pub async fn pac_setup_finished(&self) {
        let task = self.pac_setup.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                log::warn!("[PAC] PAC setup task ended abnormally: {}", e);
            }
        }
    }

    pub(crate) fn set_dispatcher(&self, task: JoinHandle<()>) {
        if let Some(old) = self.dispatcher.lock().replace(task) {
            old.abort();
        }
    }

    pub fn stop_dispatcher(&self) {
        if let Some(task) = self.dispatcher.lock().take() {
            task.abort();
            log::info!("[EVENTS] Dispatcher stopped");
        }
    }
}
