use anyhow::{anyhow, Context, Result};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::app::AppContext;
use crate::controller::ProxyController;
use crate::events::CoreEvent;
use crate::service_config::ServiceConfig;
use crate::settings_store::KEY_SERVICE_RUNNING;

/// Forwards every request published on the bus to one task that executes them in order.
///
/// Must be called from within a tokio runtime.
pub fn spawn(ctx: Arc<AppContext>) -> JoinHandle<()> {
    let (tx, mut rx) = mpsc::unbounded_channel::<CoreEvent>();
    ctx.bus().subscribe_all(move |event| {
        if event.is_request() {
            tx.send(event.clone()).map_err(|_| anyhow!("dispatcher is not running"))?;
        }
        Ok(())
    });
    log::info!("[EVENTS] Dispatcher listening");
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let topic = event.topic();
            if let Err(e) = handle(&ctx, event).await {
                log::error!("[EVENTS] {:?} failed: {:#}", topic, e);
            }
        }
    })
}

pub async fn handle(ctx: &AppContext, event: CoreEvent) -> Result<()> {
    match event {
        CoreEvent::ProxyModeChange(mode) => {
            let controller = ctx.controller().ok_or_else(|| anyhow!("proxy controller not ready"))?;
            controller.switch_mode(mode).await?;
        }
        CoreEvent::ProxyStart => {
            let controller = ctx.controller().ok_or_else(|| anyhow!("proxy controller not ready"))?;
            controller.start().await?;
        }
        CoreEvent::ProxyStop => {
            if let Some(controller) = ctx.controller() {
                controller.stop().await;
            }
        }
        CoreEvent::CoreStart(config) => {
            let config = match config {
                Some(c) => c,
                None => ctx.core_config_from_store().await?,
            };
            ctx.supervisor().start(&config).await?;
            persist_running(ctx, true).await;
            ctx.bus().publish(&CoreEvent::CoreStatusChanged(true));
            log::info!("[CORE] socksPort: {:?}, httpPort: {:?}", config.socks_port(), config.http_port());
            if let Some(controller) = ctx.controller() {
                follow_core_ports(&controller, &config).await?;
            }
        }
        CoreEvent::CoreStop => {
            ctx.supervisor().stop().await;
            persist_running(ctx, false).await;
            ctx.bus().publish(&CoreEvent::CoreStatusChanged(false));
        }
        CoreEvent::CoreCheck => {
            let running = ctx.supervisor().check();
            ctx.bus().publish(&CoreEvent::CoreStatusChanged(running));
        }
        CoreEvent::PacUserRulesUpdate(text) => match ctx.controller() {
            Some(controller) => controller.update_user_rules(&text).await?,
            None => ctx.pac_store().update_user_rules(&text).await?,
        },
        CoreEvent::PacBaseRulesUpdate(text) => match ctx.controller() {
            Some(controller) => controller.update_base_rules(&text).await?,
            None => ctx.pac_store().update_base_rules(&text).await?,
        },
        CoreEvent::ProxyStatusChanged { .. } | CoreEvent::CoreStatusChanged(_) => {}
    }
    Ok(())
}

/// Moves the OS proxy onto the listener ports of a freshly started core.
///
/// Ports the controller rejects are reported, but the proxy is still re-applied on the old ones.
async fn follow_core_ports(controller: &ProxyController, config: &ServiceConfig) -> Result<()> {
    let moved = match (config.http_port(), config.socks_port()) {
        (Some(http), Some(socks)) => controller.update_ports(http, socks, None),
        _ => {
            log::warn!("[CORE] Config has no socks/http inbounds, keeping proxy ports");
            Ok(())
        }
    };
    if let Err(e) = &moved {
        log::error!("[CORE] Keeping proxy ports: {}", e);
    }
    controller.stop().await;
    controller.start().await?;
    moved.context("core started, but its listener ports cannot be used by the system proxy")
}

pub(crate) async fn persist_running(ctx: &AppContext, running: bool) {
    if let Err(e) = ctx.store().write(KEY_SERVICE_RUNNING, json!(running)).await {
        log::error!("[CONFIG] Failed to persist {}: {}", KEY_SERVICE_RUNNING, e);
    }
}
