use anyhow::Result;
use std::path::{Path, PathBuf};

const APP_DIR_NAME: &str = "v2rayx";
const CORE_DIR_NAME: &str = "v2ray-core";

/// Every on-disk location the core touches, derived from one root directory.
#[derive(Clone, Debug)]
pub struct AppPaths {
    root: PathBuf,
}

impl AppPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn resolve(data_dir: Option<&Path>) -> Result<Self> {
        if let Some(dir) = data_dir {
            return Ok(Self::new(dir));
        }
        let base = dirs::data_dir()
            .ok_or_else(|| anyhow::anyhow!("Failed to get data directory"))?;
        Ok(Self::new(base.join(APP_DIR_NAME)))
    }

    pub fn root(&self) -> &Path { &self.root }
    pub fn runtime_dir(&self) -> PathBuf { self.root.join("runtime") }
    pub fn bin_dir(&self) -> PathBuf { self.runtime_dir().join("bin") }
    pub fn pac_dir(&self) -> PathBuf { self.runtime_dir().join("pac") }
    pub fn core_dir(&self) -> PathBuf { self.root.join(CORE_DIR_NAME) }
    pub fn logs_dir(&self) -> PathBuf { self.root.join("logs") }
    pub fn settings_file(&self) -> PathBuf { self.root.join("settings.json") }

    /// Config file handed to the proxy core; rewritten on every start.
    pub fn core_config_file(&self) -> PathBuf { self.core_dir().join("tmp.json") }

    pub fn core_bin(&self) -> PathBuf {
        let name = if cfg!(target_os = "windows") { "v2ray.exe" } else { "v2ray" };
        self.core_dir().join(name)
    }

    /// Helper used by the Windows proxy strategy.
    pub fn sysproxy_helper(&self) -> PathBuf { self.bin_dir().join("sysproxy.exe") }

    pub fn required_dirs(&self) -> Vec<PathBuf> {
        vec![self.root.clone(), self.runtime_dir(), self.bin_dir(), self.pac_dir(), self.core_dir(), self.logs_dir()]
    }
}
