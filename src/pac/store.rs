use std::path::{Path, PathBuf};

use crate::error::{CoreError, CoreResult};
use crate::pac::builder::{render_with_ports, PacDocumentBuilder};

pub const BASE_LIST_FILE: &str = "gfwlist.txt";
pub const USER_RULES_FILE: &str = "user-rules.txt";
pub const TEMPLATE_FILE: &str = "template.pac";
pub const GENERATED_FILE: &str = "pac.txt";
pub const RENDERED_FILE: &str = "proxy.pac";

/// PAC artifacts on disk: the block-list source, the user overrides, and what is generated from them.
#[derive(Clone, Debug)]
pub struct PacStore {
    dir: PathBuf,
}

impl PacStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path { &self.dir }
    pub fn generated_path(&self) -> PathBuf { self.dir.join(GENERATED_FILE) }
    pub fn rendered_path(&self) -> PathBuf { self.dir.join(RENDERED_FILE) }

    /// Generates the port-less artifact on first run. Returns `true` when it had to.
    pub async fn ensure_generated(&self) -> CoreResult<bool> {
        if tokio::fs::try_exists(self.generated_path()).await? {
            return Ok(false);
        }
        log::info!("[PAC] First run detected, generating {}", self.generated_path().display());
        self.regenerate().await?;
        Ok(true)
    }

    pub async fn user_rules(&self) -> CoreResult<String> {
        read_or_empty(&self.dir.join(USER_RULES_FILE)).await
    }

    /// Replaces the whole override layer and regenerates the artifact.
    pub async fn update_user_rules(&self, text: &str) -> CoreResult<()> {
        self.write(USER_RULES_FILE, text).await?;
        log::info!("[PAC] User rules updated ({} lines)", text.lines().count());
        self.regenerate().await
    }

    pub async fn base_rules(&self) -> CoreResult<String> {
        read_or_empty(&self.dir.join(BASE_LIST_FILE)).await
    }

    pub async fn update_base_rules(&self, text: &str) -> CoreResult<()> {
        self.write(BASE_LIST_FILE, text).await?;
        log::info!("[PAC] Block-list refreshed");
        self.regenerate().await
    }

    /// Substitutes the ports into the artifact, writes `proxy.pac` and returns the script.
    pub async fn render(&self, http_port: u16, socks_port: u16) -> CoreResult<String> {
        self.ensure_generated().await?;
        let generated = tokio::fs::read_to_string(self.generated_path()).await?;
        let script = render_with_ports(&generated, http_port, socks_port);
        self.write(RENDERED_FILE, &script).await?;
        log::info!("[PAC] Rendered {} (http={}, socks={})", self.rendered_path().display(), http_port, socks_port);
        Ok(script)
    }

    async fn regenerate(&self) -> CoreResult<()> {
        let builder = self.builder().await?;
        let base = self.base_rules().await?;
        let user = self.user_rules().await?;
        let script = builder.build(&base, &user)?;
        self.write(GENERATED_FILE, &script).await
    }

    async fn builder(&self) -> CoreResult<PacDocumentBuilder> {
        let custom = self.dir.join(TEMPLATE_FILE);
        if tokio::fs::try_exists(&custom).await? {
            let text = tokio::fs::read_to_string(&custom).await?;
            return PacDocumentBuilder::with_template(text);
        }
        Ok(PacDocumentBuilder::default())
    }

    async fn write(&self, name: &str, text: &str) -> CoreResult<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        tokio::fs::write(self.dir.join(name), text)
            .await
            .map_err(|e| CoreError::Pac(format!("write {} failed: {}", name, e)))
    }
}

async fn read_or_empty(path: &Path) -> CoreResult<String> {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => Ok(text),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(e.into()),
    }
}
