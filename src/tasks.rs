//! Default lifecycle tasks of the headless client.

use anyhow::{Context, Result};
use futures_util::FutureExt;
use std::future::Future;
use std::sync::Arc;

use crate::app::AppContext;
use crate::controller::PortSet;
use crate::dispatcher;
use crate::events::CoreEvent;
use crate::hooks::{HookRegistry, Phase};
use crate::net::pick_ephemeral_port;
use crate::service_config::{ServiceConfig, DEFAULT_HTTP_PORT, DEFAULT_SOCKS_PORT};

pub type Ctx = Arc<AppContext>;

pub fn register_defaults(hooks: &mut HookRegistry<Ctx>) -> Result<()> {
    hooks.register_sync(Phase::BeforeReady, "checkEnvFiles", check_env_files)?;
    hooks.register_sync(Phase::BeforeReady, "chmodFiles", chmod_files)?;
    hooks.register_sync(Phase::BeforeReady, "setupPacFile", setup_pac_file)?;
    hooks.register_sync(Phase::BeforeReady, "setupListeners", setup_listeners)?;

    hooks.register_sync(Phase::Ready, "setupProxy", setup_proxy)?;
    hooks.register_sync(Phase::Ready, "setupCore", |ctx: &Ctx| {
        ctx.supervisor();
        Ok(())
    })?;

    hooks.register_async(Phase::AfterReady, "applyProxyMode", |ctx: Ctx| apply_proxy_mode(ctx).boxed())?;
    hooks.register_async(Phase::AfterReady, "autoStartCore", |ctx: Ctx| auto_start_core(ctx).boxed())?;

    hooks.register_async(Phase::BeforeQuit, "stopCore", |ctx: Ctx| stop_core(ctx).boxed())?;
    hooks.register_async(Phase::BeforeQuit, "stopProxy", |ctx: Ctx| stop_proxy(ctx).boxed())?;
    Ok(())
}

/// Runs the startup phases, waits for `shutdown`, then runs `beforeQuit` whatever happened before.
///
/// The first startup or signal error is returned after the quit tasks have run.
pub async fn run_app<F>(hooks: &HookRegistry<Ctx>, ctx: Ctx, shutdown: F) -> Result<()>
where
    F: Future<Output = std::io::Result<()>>,
{
    let outcome = run_until_shutdown(hooks, &ctx, shutdown).await;
    if let Err(e) = &outcome {
        log::error!("[MAIN] {:#}", e);
    }
    log::info!("[MAIN] Shutting down");
    if let Err(e) = hooks.run(Phase::BeforeQuit, Arc::clone(&ctx)).await {
        log::error!("[MAIN] {:#}", e);
    }
    ctx.stop_dispatcher();
    outcome
}

async fn run_until_shutdown<F>(hooks: &HookRegistry<Ctx>, ctx: &Ctx, shutdown: F) -> Result<()>
where
    F: Future<Output = std::io::Result<()>>,
{
    for phase in [Phase::BeforeReady, Phase::Ready] {
        hooks.run(phase, Arc::clone(ctx)).await?;
    }
    if let Err(e) = hooks.run(Phase::AfterReady, Arc::clone(ctx)).await {
        log::error!("[MAIN] {:#}", e);
    }
    log::info!("[MAIN] Running, press Ctrl-C to quit");
    shutdown.await.context("wait for shutdown signal")
}

fn check_env_files(ctx: &Ctx) -> Result<()> {
    for dir in ctx.paths().required_dirs() {
        if !dir.exists() {
            std::fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
            log::info!("[MAIN] Created {}", dir.display());
        }
    }
    Ok(())
}

#[cfg(unix)]
fn chmod_files(ctx: &Ctx) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let bin_dir = ctx.paths().bin_dir();
    if bin_dir.is_dir() {
        std::fs::set_permissions(&bin_dir, std::fs::Permissions::from_mode(0o711))
            .with_context(|| format!("chmod {}", bin_dir.display()))?;
    }
    let core = ctx.paths().core_bin();
    if core.is_file() {
        std::fs::set_permissions(&core, std::fs::Permissions::from_mode(0o755))
            .with_context(|| format!("chmod {}", core.display()))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn chmod_files(_ctx: &Ctx) -> Result<()> {
    Ok(())
}

/// Generates the port-less PAC artifact on first run, off the startup path.
fn setup_pac_file(ctx: &Ctx) -> Result<()> {
    let store = ctx.pac_store().clone();
    let task = tokio::spawn(async move {
        match store.ensure_generated().await {
            Ok(true) => log::info!("[PAC] First-run PAC artifact generated"),
            Ok(false) => {}
            Err(e) => log::error!("[PAC] Failed to generate PAC artifact: {}", e),
        }
    });
    ctx.set_pac_setup(task);
    Ok(())
}

fn setup_listeners(ctx: &Ctx) -> Result<()> {
    let task = dispatcher::spawn(Arc::clone(ctx));
    ctx.set_dispatcher(task);
    Ok(())
}

/// Builds the controller on a freshly probed PAC port.
///
/// A PAC port that cannot be found is logged rather than failing startup.
fn setup_proxy(ctx: &Ctx) -> Result<()> {
    let settings = ctx.app_settings();
    let listeners = settings.server_template.clone().map(ServiceConfig::new);
    let socks = listeners.as_ref().and_then(ServiceConfig::socks_port).unwrap_or(DEFAULT_SOCKS_PORT);
    let http = listeners.as_ref().and_then(ServiceConfig::http_port).unwrap_or(DEFAULT_HTTP_PORT);

    let pac = match pick_ephemeral_port(ctx.settings().pac_port_attempts, &[http, socks]) {
        Ok(port) => port,
        Err(e) => {
            log::error!("[PROXY] {}; system proxy stays untouched", e);
            return Ok(());
        }
    };
    log::info!(
        "[PROXY] Mode port information -- pacPort:{}, httpPort:{}, socksPort:{}, mode:{}",
        pac,
        http,
        socks,
        settings.proxy_mode
    );
    ctx.proxy_controller(PortSet::new(http, socks, pac)?, settings.proxy_mode)?;
    Ok(())
}

async fn apply_proxy_mode(ctx: Ctx) -> Result<()> {
    ctx.pac_setup_finished().await;
    let Some(controller) = ctx.controller() else {
        log::warn!("[PROXY] No proxy controller, skipping persisted mode");
        return Ok(());
    };
    controller.start().await.context("apply persisted proxy mode")?;
    Ok(())
}

async fn auto_start_core(ctx: Ctx) -> Result<()> {
    if !ctx.app_settings().auto_start {
        return Ok(());
    }
    log::info!("[CORE] Auto-starting proxy core");
    ctx.bus().publish(&CoreEvent::CoreStart(None));
    Ok(())
}

async fn stop_core(ctx: Ctx) -> Result<()> {
    ctx.supervisor().stop().await;
    dispatcher::persist_running(&ctx, false).await;
    Ok(())
}

async fn stop_proxy(ctx: Ctx) -> Result<()> {
    if let Some(controller) = ctx.controller() {
        controller.stop().await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::testing::test_app;
    use crate::controller::ProxyMode;
    use crate::settings_store::{MemoryStore, KEY_PROXY_MODE, KEY_SERVER_TEMPLATE, KEY_SERVICE_RUNNING};
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn default_tasks_per_phase() {
        let mut hooks = HookRegistry::new();
        register_defaults(&mut hooks).unwrap();
        assert_eq!(
            hooks.names(Phase::BeforeReady),
            vec!["checkEnvFiles", "chmodFiles", "setupPacFile", "setupListeners"]
        );
        assert_eq!(hooks.names(Phase::Ready), vec!["setupProxy", "setupCore"]);
        assert_eq!(hooks.names(Phase::AfterReady), vec!["applyProxyMode", "autoStartCore"]);
        assert_eq!(hooks.names(Phase::BeforeQuit), vec!["stopCore", "stopProxy"]);
    }

    #[tokio::test]
    async fn full_lifecycle_applies_and_clears_persisted_mode() {
        let template = ServiceConfig::default_template().into_value();
        let app = test_app(
            MemoryStore::new()
                .with(KEY_PROXY_MODE, json!("Global"))
                .with(KEY_SERVER_TEMPLATE, template)
                .with(KEY_SERVICE_RUNNING, json!(true)),
        );
        app.ctx.reload_app_settings().await.unwrap();
        let mut hooks = HookRegistry::new();
        register_defaults(&mut hooks).unwrap();

        for phase in [Phase::BeforeReady, Phase::Ready, Phase::AfterReady] {
            hooks.run(phase, app.ctx.clone()).await.unwrap();
        }
        assert!(app.ctx.paths().pac_dir().is_dir());
        assert!(app.ctx.pac_store().generated_path().exists());
        let state = app.ctx.controller().unwrap().state();
        assert!(state.is_active);
        assert_eq!(state.mode, ProxyMode::Global);
        assert_eq!((state.ports.http, state.ports.socks), (10871, 10801));
        assert_eq!(app.os.get("org.gnome.system.proxy", "mode").as_deref(), Some("manual"));

        hooks.run(Phase::BeforeQuit, app.ctx.clone()).await.unwrap();
        app.ctx.stop_dispatcher();
        assert_eq!(app.os.get("org.gnome.system.proxy", "mode").as_deref(), Some("none"));
        assert!(!app.ctx.controller().unwrap().state().is_active);
        assert_eq!(app.store.get(KEY_SERVICE_RUNNING), Some(json!(false)));
        // the recorded mode survives shutdown for the next start
        assert_eq!(app.store.get(KEY_PROXY_MODE), Some(json!("Global")));
    }

    #[tokio::test]
    async fn quit_tasks_run_when_startup_fails() {
        let app = test_app(MemoryStore::new().with(KEY_SERVICE_RUNNING, json!(true)));
        let mut hooks = HookRegistry::new();
        register_defaults(&mut hooks).unwrap();
        hooks.register_sync(Phase::Ready, "needsDisplay", |_: &Ctx| anyhow::bail!("no display")).unwrap();
        let quit = Arc::new(AtomicBool::new(false));
        let q = quit.clone();
        hooks
            .register_async(Phase::BeforeQuit, "markQuit", move |_: Ctx| {
                let q = q.clone();
                async move {
                    q.store(true, Ordering::SeqCst);
                    Ok(())
                }
                .boxed()
            })
            .unwrap();

        let result = run_app(&hooks, app.ctx.clone(), std::future::pending()).await;
        assert!(result.unwrap_err().to_string().contains("no display"));
        assert!(quit.load(Ordering::SeqCst));
        assert_eq!(app.store.get(KEY_SERVICE_RUNNING), Some(json!(false)));
        assert!(!app.ctx.controller().unwrap().state().is_active);
    }

    #[tokio::test]
    async fn shutdown_signal_ends_the_run() {
        let app = test_app(MemoryStore::new());
        let mut hooks = HookRegistry::new();
        register_defaults(&mut hooks).unwrap();
        run_app(&hooks, app.ctx.clone(), async { Ok(()) }).await.unwrap();
        assert_eq!(app.store.get(KEY_SERVICE_RUNNING), Some(json!(false)));
        assert_eq!(app.os.get("org.gnome.system.proxy", "mode").as_deref(), Some("none"));
    }
}
