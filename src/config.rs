use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub oracle: OracleConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub sessions: SessionsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_upload_dir")]
    pub upload_dir: PathBuf,
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
    #[serde(default = "default_allowed_extensions")]
    pub allowed_extensions: Vec<String>,
    #[serde(default = "default_max_request_bytes")]
    pub max_request_bytes: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            upload_dir: default_upload_dir(),
            max_file_size: default_max_file_size(),
            allowed_extensions: default_allowed_extensions(),
            max_request_bytes: default_max_request_bytes(),
        }
    }
}

fn default_upload_dir() -> PathBuf {
    PathBuf::from("./uploads")
}
fn default_max_file_size() -> u64 {
    10 * 1024 * 1024
}
fn default_allowed_extensions() -> Vec<String> {
    vec!["xlsx".to_string(), "csv".to_string()]
}
fn default_max_request_bytes() -> usize {
    64 * 1024 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    #[serde(default = "default_idle_ttl_secs")]
    pub idle_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_sessions: default_max_sessions(),
            idle_ttl_secs: default_idle_ttl_secs(),
        }
    }
}

impl CacheConfig {
    pub fn idle_ttl(&self) -> Duration {
        Duration::from_secs(self.idle_ttl_secs)
    }
}

fn default_max_sessions() -> usize {
    64
}
fn default_idle_ttl_secs() -> u64 {
    3600
}

#[derive(Debug, Deserialize, Clone)]
pub struct SandboxConfig {
    #[serde(default = "default_sandbox_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_memory_limit_mb")]
    pub memory_limit_mb: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_sandbox_timeout(),
            memory_limit_mb: default_memory_limit_mb(),
        }
    }
}

fn default_sandbox_timeout() -> u64 {
    10
}
fn default_memory_limit_mb() -> usize {
    256
}

#[derive(Debug, Deserialize, Clone)]
pub struct OracleConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_oracle_url")]
    pub url: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_oracle_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            url: default_oracle_url(),
            api_key_env: default_api_key_env(),
            timeout_secs: default_oracle_timeout(),
            max_retries: default_max_retries(),
        }
    }
}

impl OracleConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_oracle_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_oracle_timeout() -> u64 {
    60
}
fn default_max_retries() -> u32 {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            cors_origins: default_cors_origins(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8000".to_string()
}
fn default_cors_origins() -> Vec<String> {
    vec!["*".to_string()]
}

#[derive(Debug, Deserialize, Clone)]
pub struct SessionsConfig {
    #[serde(default = "default_purge_after_hours")]
    pub purge_after_hours: u64,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            purge_after_hours: default_purge_after_hours(),
        }
    }
}

fn default_purge_after_hours() -> u64 {
    24
}

impl Config {
    /// Defaults rooted at `root`: database in `root/data`, uploads in
    /// `root/uploads`, oracle disabled.
    pub fn rooted_at(root: &Path) -> Self {
        Self {
            db: DbConfig {
                path: root.join("data").join("sheet.sqlite"),
            },
            storage: StorageConfig {
                upload_dir: root.join("uploads"),
                ..StorageConfig::default()
            },
            cache: CacheConfig::default(),
            sandbox: SandboxConfig::default(),
            oracle: OracleConfig::default(),
            server: ServerConfig::default(),
            sessions: SessionsConfig::default(),
        }
    }

    /// Whether `extension` (without the dot, any case) is accepted for upload.
    pub fn accepts_extension(&self, extension: &str) -> bool {
        let ext = extension.to_ascii_lowercase();
        self.storage
            .allowed_extensions
            .iter()
            .any(|a| a.eq_ignore_ascii_case(&ext))
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.storage.max_file_size == 0 {
        anyhow::bail!("storage.max_file_size must be > 0");
    }
    if config.storage.allowed_extensions.is_empty() {
        anyhow::bail!("storage.allowed_extensions must not be empty");
    }
    for ext in &config.storage.allowed_extensions {
        if !matches!(ext.to_ascii_lowercase().as_str(), "xlsx" | "csv") {
            anyhow::bail!(
                "Unsupported extension in storage.allowed_extensions: '{}'. Must be xlsx or csv.",
                ext
            );
        }
    }

    if config.cache.max_sessions == 0 {
        anyhow::bail!("cache.max_sessions must be >= 1");
    }

    if config.sandbox.timeout_secs == 0 {
        anyhow::bail!("sandbox.timeout_secs must be > 0");
    }
    if config.sandbox.memory_limit_mb == 0 {
        anyhow::bail!("sandbox.memory_limit_mb must be > 0");
    }

    match config.oracle.provider.as_str() {
        "disabled" => {}
        "openai" => {
            if config.oracle.model.is_none() {
                anyhow::bail!("oracle.model must be specified when provider is 'openai'");
            }
        }
        other => anyhow::bail!(
            "Unknown oracle provider: '{}'. Must be disabled or openai.",
            other
        ),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(src: &str) -> Result<Config> {
        let config: Config = toml::from_str(src)?;
        validate(&config)?;
        Ok(config)
    }

    #[test]
    fn minimal_file_gets_defaults() {
        let config = parse("[db]\npath = \"./data/sheet.sqlite\"\n").unwrap();
        assert_eq!(config.storage.max_file_size, 10 * 1024 * 1024);
        assert!(config.accepts_extension("XLSX"));
        assert!(config.accepts_extension("csv"));
        assert!(!config.accepts_extension("xls"));
        assert_eq!(config.cache.max_sessions, 64);
        assert!(!config.oracle.is_enabled());
    }

    #[test]
    fn openai_requires_model() {
        let err = parse("[db]\npath = \"x.sqlite\"\n[oracle]\nprovider = \"openai\"\n")
            .unwrap_err();
        assert!(err.to_string().contains("oracle.model"));
    }

    #[test]
    fn unknown_extension_rejected() {
        let err = parse(
            "[db]\npath = \"x.sqlite\"\n[storage]\nallowed_extensions = [\"xlsx\", \"pdf\"]\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("pdf"));
    }

    #[test]
    fn unknown_provider_rejected() {
        let err =
            parse("[db]\npath = \"x.sqlite\"\n[oracle]\nprovider = \"magic\"\n").unwrap_err();
        assert!(err.to_string().contains("Unknown oracle provider"));
    }
}
