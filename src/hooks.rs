use futures_util::future::{join_all, BoxFuture};
use std::fmt;
use std::sync::Arc;

use crate::error::{CoreError, CoreResult};

/// Application lifecycle phases, in the order they run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    BeforeReady,
    Ready,
    AfterReady,
    BeforeQuit,
}

impl Phase {
    /// Sync phases run on the caller's thread, one callback after another.
    pub fn is_sync(self) -> bool {
        matches!(self, Phase::BeforeReady | Phase::Ready)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::BeforeReady => "beforeReady",
            Phase::Ready => "ready",
            Phase::AfterReady => "afterReady",
            Phase::BeforeQuit => "beforeQuit",
        })
    }
}

pub type SyncHook<C> = Arc<dyn Fn(&C) -> anyhow::Result<()> + Send + Sync>;
pub type AsyncHook<C> = Arc<dyn Fn(C) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

enum Callback<C> {
    Sync(SyncHook<C>),
    Async(AsyncHook<C>),
}

struct Registration<C> {
    phase: Phase,
    name: String,
    callback: Callback<C>,
}

/// Named callbacks per lifecycle phase.
///
/// Registration needs `&mut self`, running only `&self`, so everything is registered before
/// the first phase runs. A name registered twice in one phase keeps its slot and the latest
/// callback.
pub struct HookRegistry<C> {
    hooks: Vec<Registration<C>>,
}

impl<C> Default for HookRegistry<C> {
    fn default() -> Self {
        Self { hooks: Vec::new() }
    }
}

impl<C: Clone + Send + 'static> HookRegistry<C> {
    pub fn new() -> Self { Self::default() }

    pub fn register_sync<F>(&mut self, phase: Phase, name: &str, callback: F) -> CoreResult<()>
    where
        F: Fn(&C) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        if !phase.is_sync() {
            return Err(CoreError::HookPhaseMismatch { phase: phase.to_string(), name: name.to_string() });
        }
        self.insert(phase, name, Callback::Sync(Arc::new(callback)));
        Ok(())
    }

    pub fn register_async<F>(&mut self, phase: Phase, name: &str, callback: F) -> CoreResult<()>
    where
        F: Fn(C) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync + 'static,
    {
        if phase.is_sync() {
            return Err(CoreError::HookPhaseMismatch { phase: phase.to_string(), name: name.to_string() });
        }
        self.insert(phase, name, Callback::Async(Arc::new(callback)));
        Ok(())
    }

    fn insert(&mut self, phase: Phase, name: &str, callback: Callback<C>) {
        match self.hooks.iter_mut().find(|r| r.phase == phase && r.name == name) {
            Some(existing) => {
                log::debug!("[HOOKS] Replacing {}:{}", phase, name);
                existing.callback = callback;
            }
            None => self.hooks.push(Registration { phase, name: name.to_string(), callback }),
        }
    }

    pub fn names(&self, phase: Phase) -> Vec<&str> {
        self.hooks.iter().filter(|r| r.phase == phase).map(|r| r.name.as_str()).collect()
    }

    /// Runs a sync phase in registration order, stopping at the first error.
    pub fn run_sync(&self, phase: Phase, ctx: &C) -> anyhow::Result<()> {
        for r in self.hooks.iter().filter(|r| r.phase == phase) {
            if let Callback::Sync(cb) = &r.callback {
                log::info!("[HOOKS] {} >> {}", phase, r.name);
                cb(ctx).map_err(|e| e.context(format!("hook {}:{} failed", phase, r.name)))?;
            }
        }
        Ok(())
    }

    /// Starts every callback of an async phase concurrently and waits for all of them.
    ///
    /// The first error in registration order is returned once everything has finished.
    pub async fn run_async(&self, phase: Phase, ctx: C) -> anyhow::Result<()> {
        let mut names = Vec::new();
        let mut futures = Vec::new();
        for r in self.hooks.iter().filter(|r| r.phase == phase) {
            if let Callback::Async(cb) = &r.callback {
                log::info!("[HOOKS] {} >> {}", phase, r.name);
                names.push(r.name.clone());
                futures.push(cb(ctx.clone()));
            }
        }
        let results = join_all(futures).await;
        let mut first = None;
        for (name, result) in names.into_iter().zip(results) {
            if let Err(e) = result {
                log::error!("[HOOKS] {}:{} failed: {:#}", phase, name, e);
                if first.is_none() {
                    first = Some(e.context(format!("hook {}:{} failed", phase, name)));
                }
            }
        }
        first.map_or(Ok(()), Err)
    }

    /// Dispatches to the sync or async runner depending on the phase.
    pub async fn run(&self, phase: Phase, ctx: C) -> anyhow::Result<()> {
        if phase.is_sync() {
            self.run_sync(phase, &ctx)
        } else {
            self.run_async(phase, ctx).await
        }
    }
}
