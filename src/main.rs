use std::sync::Arc;

use v2rayx_core::hooks::HookRegistry;
use v2rayx_core::runtime_settings::RuntimeSettings;
use v2rayx_core::utils::init_logging;
use v2rayx_core::{tasks, AppContext};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    log::info!("[MAIN] Starting v2rayx core");

    let settings = RuntimeSettings::from_env();
    let ctx = Arc::new(AppContext::from_settings(settings)?);
    // the ready phase is sync, so persisted settings must be loaded up front
    if let Err(e) = ctx.reload_app_settings().await {
        log::error!("[MAIN] Failed to load settings, using defaults: {}", e);
    }

    let mut hooks = HookRegistry::new();
    tasks::register_defaults(&mut hooks)?;

    tasks::run_app(&hooks, ctx, tokio::signal::ctrl_c()).await
}
