use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::{CoreError, CoreResult};
use crate::events::{CoreEvent, EventBus};
use crate::service_config::ServiceConfig;

pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(5);

/// What `start` does when a core process is already running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RestartPolicy {
    /// Stop the old process, then start the new one.
    #[default]
    Replace,
    Reject,
}

struct ProcessHandle {
    pid: Option<u32>,
    kill_tx: Option<oneshot::Sender<()>>,
    watcher: JoinHandle<()>,
}

/// Owns the proxy-core child process.
pub struct ProcessSupervisor {
    core_bin: PathBuf,
    config_path: PathBuf,
    policy: RestartPolicy,
    grace: Duration,
    bus: Arc<EventBus>,
    handle: tokio::sync::Mutex<Option<ProcessHandle>>,
    running: Arc<AtomicBool>,
    generation: Arc<AtomicU64>,
}

impl ProcessSupervisor {
    pub fn new(core_bin: PathBuf, config_path: PathBuf, policy: RestartPolicy, bus: Arc<EventBus>) -> Self {
        Self {
            core_bin,
            config_path,
            policy,
            grace: DEFAULT_STOP_GRACE,
            bus,
            handle: tokio::sync::Mutex::new(None),
            running: Arc::new(AtomicBool::new(false)),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn config_path(&self) -> &Path { &self.config_path }

    /// Last known liveness; cleared by `stop` and by the exit watcher.
    pub fn check(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub async fn pid(&self) -> Option<u32> {
        if !self.check() {
            return None;
        }
        self.handle.lock().await.as_ref().and_then(|h| h.pid)
    }

    /// Writes `config` and launches `<core> run -c <config>`.
    pub async fn start(&self, config: &ServiceConfig) -> CoreResult<()> {
        let mut slot = self.handle.lock().await;
        if slot.is_some() && self.check() {
            match self.policy {
                RestartPolicy::Reject => {
                    log::warn!("[CORE] Start rejected, core is already running");
                    return Err(CoreError::AlreadyRunning);
                }
                RestartPolicy::Replace => {
                    log::info!("[CORE] Core already running, replacing it");
                    if let Some(old) = slot.take() {
                        self.shutdown(old).await;
                    }
                }
            }
        } else if let Some(stale) = slot.take() {
            // previous process already exited on its own
            stale.watcher.abort();
        }

        self.write_config(config).await?;
        let mut child = self.spawn()?;
        let pid = child.id();
        log::info!("[CORE] Started {} (pid {:?})", self.core_bin.display(), pid);

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(async move {
                use tokio::io::{AsyncBufReadExt, BufReader};
                let mut r = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = r.next_line().await {
                    if !line.trim().is_empty() { log::info!("[CORE][STDOUT] {}", line); }
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                use tokio::io::{AsyncBufReadExt, BufReader};
                let mut r = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = r.next_line().await {
                    if !line.trim().is_empty() { log::error!("[CORE][STDERR] {}", line); }
                }
            });
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (kill_tx, kill_rx) = oneshot::channel();
        // set before the watcher exists so an instant exit is not overwritten
        self.running.store(true, Ordering::SeqCst);
        let watcher = tokio::spawn(watch_exit(
            child,
            kill_rx,
            self.grace,
            generation,
            Arc::clone(&self.generation),
            Arc::clone(&self.running),
            Arc::clone(&self.bus),
        ));
        *slot = Some(ProcessHandle { pid, kill_tx: Some(kill_tx), watcher });
        Ok(())
    }

    /// Terminates the tracked process. Never fails; problems are logged.
    pub async fn stop(&self) {
        let handle = self.handle.lock().await.take();
        match handle {
            Some(h) => self.shutdown(h).await,
            None => log::info!("[CORE] Stop requested but no core process is tracked"),
        }
        self.running.store(false, Ordering::SeqCst);
    }

    async fn shutdown(&self, mut handle: ProcessHandle) {
        // invalidate the watcher before it observes the exit
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
        if let Some(tx) = handle.kill_tx.take() {
            let _ = tx.send(());
        }
        let budget = self.grace + Duration::from_secs(2);
        match tokio::time::timeout(budget, &mut handle.watcher).await {
            Ok(Ok(())) => log::info!("[CORE] Core process {:?} stopped", handle.pid),
            Ok(Err(e)) => log::error!("[CORE] Exit watcher failed: {}", e),
            Err(_) => {
                log::error!("[CORE] Timed out waiting for core process {:?} to exit", handle.pid);
                handle.watcher.abort();
            }
        }
    }

    async fn write_config(&self, config: &ServiceConfig) -> CoreResult<()> {
        let write = async {
            if let Some(parent) = self.config_path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let body = serde_json::to_vec_pretty(config.as_value())?;
            tokio::fs::write(&self.config_path, body).await?;
            Ok::<(), anyhow::Error>(())
        };
        write.await.map_err(|e| {
            log::error!("[CORE] Failed to write {}: {}", self.config_path.display(), e);
            CoreError::ConfigWriteFailed(format!("{}: {}", self.config_path.display(), e))
        })?;
        log::info!("[CORE] Config written to {}", self.config_path.display());
        Ok(())
    }

    fn spawn(&self) -> CoreResult<Child> {
        let mut cmd = Command::new(&self.core_bin);
        cmd.arg("run")
            .arg("-c")
            .arg(&self.config_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = self.config_path.parent() {
            cmd.current_dir(dir);
        }
        #[cfg(target_os = "windows")]
        {
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }
        cmd.spawn().map_err(|e| {
            log::error!("[CORE] Failed to start {}: {}", self.core_bin.display(), e);
            CoreError::ProcessSpawnFailed(format!("{}: {}", self.core_bin.display(), e))
        })
    }
}

async fn watch_exit(
    mut child: Child,
    kill_rx: oneshot::Receiver<()>,
    grace: Duration,
    generation: u64,
    current: Arc<AtomicU64>,
    running: Arc<AtomicBool>,
    bus: Arc<EventBus>,
) {
    tokio::select! {
        status = child.wait() => {
            match status {
                Ok(s) => log::warn!("[CORE] Core process exited on its own: {}", s),
                Err(e) => log::error!("[CORE] Error waiting for core process: {}", e),
            }
            if current.load(Ordering::SeqCst) == generation {
                running.store(false, Ordering::SeqCst);
                bus.publish(&CoreEvent::CoreStatusChanged(false));
            }
        }
        // also fires when the sender is dropped along with the supervisor
        _ = kill_rx => terminate(&mut child, grace).await,
    }
}

async fn terminate(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = child.id() {
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                log::warn!("[CORE] Failed to send SIGTERM to {}: {}", pid, e);
            }
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = child.start_kill() {
            log::warn!("[CORE] Failed to terminate core process: {}", e);
        }
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => log::info!("[CORE] Core process exited: {}", status),
        Ok(Err(e)) => log::error!("[CORE] Error waiting for core process: {}", e),
        Err(_) => {
            log::warn!("[CORE] Core process ignored SIGTERM for {:?}, forcing kill", grace);
            if let Err(e) = child.kill().await {
                log::error!("[CORE] Failed to kill core process: {}", e);
            }
        }
    }
}
