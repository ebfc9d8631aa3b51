//! Configuration schema and persistence.
//!
//! Lives at `~/.picoclaw/config.toml` unless `PICOCLAW_CONFIG_DIR` points
//! elsewhere. Saves are atomic: write to a temp file in the same directory,
//! fsync, rename over the original.

use anyhow::{Context, Result};
use directories::UserDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Computed at load time, never serialized.
    #[serde(skip)]
    pub config_path: PathBuf,
    /// Computed at load time, never serialized.
    #[serde(skip)]
    pub workspace_dir: PathBuf,

    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub agent: AgentConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// When false, unauthenticated webhook access is allowed until the first
    /// credential is issued.
    #[serde(default = "default_true")]
    pub require_pairing: bool,
    /// Issued bearer credentials, stored as SHA-256 hashes. Older configs may
    /// hold plaintext `pc_` tokens; those are hashed on load.
    #[serde(default)]
    pub paired_tokens: Vec<String>,
    /// Shared HMAC secret for validating externally signed tokens. Absent
    /// means the signed-token path is disabled entirely.
    #[serde(default)]
    pub jwt_secret: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Upstream agent service endpoint.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_model")]
    pub model: String,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8088
}

fn default_true() -> bool {
    true
}

fn default_model() -> String {
    "default".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            require_pairing: true,
            paired_tokens: Vec::new(),
            jwt_secret: None,
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            url: None,
            model: default_model(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_path: PathBuf::new(),
            workspace_dir: PathBuf::new(),
            gateway: GatewayConfig::default(),
            agent: AgentConfig::default(),
        }
    }
}

fn default_config_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var("PICOCLAW_CONFIG_DIR") {
        if !dir.trim().is_empty() {
            return Ok(PathBuf::from(dir));
        }
    }
    let home = UserDirs::new()
        .map(|u| u.home_dir().to_path_buf())
        .context("Could not find home directory")?;
    Ok(home.join(".picoclaw"))
}

impl Config {
    /// Load config from disk, creating a default one on first run.
    pub async fn load_or_init() -> Result<Self> {
        let config_dir = default_config_dir()?;
        Self::load_or_init_at(&config_dir).await
    }

    /// Load config rooted at an explicit directory.
    pub async fn load_or_init_at(config_dir: &Path) -> Result<Self> {
        let config_path = config_dir.join("config.toml");
        let workspace_dir = config_dir.join("workspace");

        fs::create_dir_all(config_dir)
            .await
            .with_context(|| format!("Failed to create config directory: {}", config_dir.display()))?;
        fs::create_dir_all(&workspace_dir)
            .await
            .context("Failed to create workspace directory")?;

        if config_path.exists() {
            let contents = fs::read_to_string(&config_path)
                .await
                .context("Failed to read config file")?;
            let mut config: Config =
                toml::from_str(&contents).context("Failed to parse config file")?;
            // Set computed paths that are skipped during serialization
            config.config_path = config_path.clone();
            config.workspace_dir = workspace_dir;
            config.validate()?;
            tracing::info!(
                path = %config.config_path.display(),
                initialized = false,
                "Config loaded"
            );
            Ok(config)
        } else {
            let mut config = Config::default();
            config.config_path = config_path.clone();
            config.workspace_dir = workspace_dir;
            config.save().await?;

            // Credential hashes live here; keep it out of other users' reach.
            #[cfg(unix)]
            {
                use std::{fs::Permissions, os::unix::fs::PermissionsExt};
                let _ = fs::set_permissions(&config_path, Permissions::from_mode(0o600)).await;
            }

            config.validate()?;
            tracing::info!(
                path = %config.config_path.display(),
                initialized = true,
                "Config loaded"
            );
            Ok(config)
        }
    }

    /// Validate values that would otherwise fail at arbitrary runtime points.
    pub fn validate(&self) -> Result<()> {
        if self.gateway.host.trim().is_empty() {
            anyhow::bail!("gateway.host must not be empty");
        }
        if let Some(secret) = &self.gateway.jwt_secret {
            if secret.trim().is_empty() {
                anyhow::bail!("gateway.jwt_secret must not be empty when set");
            }
        }
        Ok(())
    }

    /// Append a credential hash if it is not already recorded. Returns true
    /// when the config changed and needs saving.
    pub fn persist_token_hash(&mut self, hash: &str) -> bool {
        if self.gateway.paired_tokens.iter().any(|t| t == hash) {
            return false;
        }
        self.gateway.paired_tokens.push(hash.to_string());
        true
    }

    /// Atomically persist the config to its load path.
    pub async fn save(&self) -> Result<()> {
        let toml_str = toml::to_string_pretty(self).context("Failed to serialize config")?;

        let parent_dir = self
            .config_path
            .parent()
            .context("Config path must have a parent directory")?;
        fs::create_dir_all(parent_dir).await.with_context(|| {
            format!(
                "Failed to create config directory: {}",
                parent_dir.display()
            )
        })?;

        let file_name = self
            .config_path
            .file_name()
            .and_then(|v| v.to_str())
            .unwrap_or("config.toml");
        let temp_path = parent_dir.join(format!(".{file_name}.tmp-{}", uuid::Uuid::new_v4()));

        let mut temp_file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| {
                format!(
                    "Failed to create temporary config file: {}",
                    temp_path.display()
                )
            })?;
        temp_file
            .write_all(toml_str.as_bytes())
            .await
            .context("Failed to write temporary config contents")?;
        temp_file
            .sync_all()
            .await
            .context("Failed to fsync temporary config file")?;
        drop(temp_file);

        if let Err(e) = fs::rename(&temp_path, &self.config_path).await {
            let _ = fs::remove_file(&temp_path).await;
            anyhow::bail!("Failed to atomically replace config file: {e}");
        }

        Ok(())
    }
}
