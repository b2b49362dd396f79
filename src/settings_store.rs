use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::controller::ProxyMode;
use crate::error::{CoreError, CoreResult};

pub const KEY_PROXY_MODE: &str = "settings.proxyMode";
pub const KEY_SERVICE_RUNNING: &str = "serviceRunningState";
pub const KEY_AUTO_START: &str = "management.generalSettings.autoStartProxy";
pub const KEY_LOGS_FOLDER: &str = "management.generalSettings.v2rayLogsFolder";
pub const KEY_SERVER_TEMPLATE: &str = "serverTemplate";
pub const KEY_CURRENT_OUTBOUND: &str = "currentOutbound";

/// Key/value persistence the core reads its user settings from.
///
/// Keys are flat dotted strings; the store never interprets them.
#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn read(&self, key: &str) -> CoreResult<Option<Value>>;
    async fn write(&self, key: &str, value: Value) -> CoreResult<()>;
}

/// `settings.json` under the data dir. Every write rewrites the whole file.
pub struct JsonFileStore {
    path: PathBuf,
    // serializes read-modify-write cycles
    lock: tokio::sync::Mutex<()>,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), lock: tokio::sync::Mutex::new(()) }
    }

    pub fn path(&self) -> &Path { &self.path }

    async fn load(&self) -> CoreResult<BTreeMap<String, Value>> {
        if !tokio::fs::try_exists(&self.path).await? {
            log::info!("[CONFIG] Settings file doesn't exist yet: {:?}", self.path);
            return Ok(BTreeMap::new());
        }
        let content = tokio::fs::read_to_string(&self.path).await?;
        if content.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        serde_json::from_str(&content)
            .map_err(|e| CoreError::Settings(format!("{} is not a settings object: {}", self.path.display(), e)))
    }

    async fn save(&self, map: &BTreeMap<String, Value>) -> CoreResult<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let content = serde_json::to_string_pretty(map)?;
        tokio::fs::write(&self.path, content).await?;
        Ok(())
    }
}

#[async_trait]
impl SettingsStore for JsonFileStore {
    async fn read(&self, key: &str) -> CoreResult<Option<Value>> {
        let _guard = self.lock.lock().await;
        Ok(self.load().await?.remove(key))
    }

    async fn write(&self, key: &str, value: Value) -> CoreResult<()> {
        let _guard = self.lock.lock().await;
        let mut map = self.load().await?;
        map.insert(key.to_string(), value);
        self.save(&map).await?;
        log::debug!("[CONFIG] Saved {} to {:?}", key, self.path);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryStore {
    values: Mutex<BTreeMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self { Self::default() }

    pub fn with(self, key: &str, value: Value) -> Self {
        self.values.lock().insert(key.to_string(), value);
        self
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.values.lock().get(key).cloned()
    }
}

#[async_trait]
impl SettingsStore for MemoryStore {
    async fn read(&self, key: &str) -> CoreResult<Option<Value>> {
        Ok(self.get(key))
    }

    async fn write(&self, key: &str, value: Value) -> CoreResult<()> {
        self.values.lock().insert(key.to_string(), value);
        Ok(())
    }
}

/// The subset of persisted settings the core acts on at startup.
#[derive(Debug, Clone)]
pub struct AppSettings {
    pub proxy_mode: ProxyMode,
    pub service_running: bool,
    pub auto_start: bool,
    pub logs_folder: Option<PathBuf>,
    pub server_template: Option<Value>,
    pub current_outbound: Option<Value>,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            proxy_mode: ProxyMode::Manual,
            service_running: false,
            auto_start: false,
            logs_folder: None,
            server_template: None,
            current_outbound: None,
        }
    }
}

impl AppSettings {
    /// Reads every known key; missing or malformed values fall back to defaults.
    pub async fn load(store: &dyn SettingsStore) -> CoreResult<Self> {
        let defaults = Self::default();
        let proxy_mode = match store.read(KEY_PROXY_MODE).await? {
            Some(v) => serde_json::from_value(v.clone()).unwrap_or_else(|_| {
                log::warn!("[CONFIG] Unknown proxy mode {}, using Manual", v);
                defaults.proxy_mode
            }),
            None => defaults.proxy_mode,
        };
        let flag = |v: Option<Value>| v.and_then(|v| v.as_bool()).unwrap_or(false);
        let service_running = flag(store.read(KEY_SERVICE_RUNNING).await?);
        let auto_start = flag(store.read(KEY_AUTO_START).await?);
        let logs_folder = store
            .read(KEY_LOGS_FOLDER)
            .await?
            .and_then(|v| v.as_str().map(str::to_string))
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);
        let server_template = store.read(KEY_SERVER_TEMPLATE).await?.filter(|v| v.is_object());
        let current_outbound = store.read(KEY_CURRENT_OUTBOUND).await?.filter(|v| !v.is_null());
        Ok(Self { proxy_mode, service_running, auto_start, logs_folder, server_template, current_outbound })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn json_store_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");
        JsonFileStore::new(&path).write(KEY_PROXY_MODE, json!("PAC")).await.unwrap();
        JsonFileStore::new(&path).write(KEY_SERVICE_RUNNING, json!(true)).await.unwrap();

        let store = JsonFileStore::new(&path);
        assert_eq!(store.read(KEY_PROXY_MODE).await.unwrap(), Some(json!("PAC")));
        assert_eq!(store.read(KEY_SERVICE_RUNNING).await.unwrap(), Some(json!(true)));
        assert_eq!(store.read("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn corrupt_file_is_a_settings_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        tokio::fs::write(&path, "[1, 2").await.unwrap();
        let err = JsonFileStore::new(&path).read(KEY_PROXY_MODE).await.unwrap_err();
        assert!(matches!(err, CoreError::Settings(_)));
    }

    #[tokio::test]
    async fn app_settings_from_store() {
        let store = MemoryStore::new()
            .with(KEY_PROXY_MODE, json!("Global"))
            .with(KEY_AUTO_START, json!(true))
            .with(KEY_LOGS_FOLDER, json!("/tmp/logs"));
        let s = AppSettings::load(&store).await.unwrap();
        assert_eq!(s.proxy_mode, ProxyMode::Global);
        assert!(s.auto_start);
        assert!(!s.service_running);
        assert_eq!(s.logs_folder, Some(PathBuf::from("/tmp/logs")));
        assert!(s.server_template.is_none());
    }

    #[tokio::test]
    async fn unknown_mode_falls_back_to_manual() {
        let store = MemoryStore::new().with(KEY_PROXY_MODE, json!("Tunnel"));
        assert_eq!(AppSettings::load(&store).await.unwrap().proxy_mode, ProxyMode::Manual);
    }
}
