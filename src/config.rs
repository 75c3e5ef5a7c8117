use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::auth::{Credentials, Token};
use crate::error::ChainLensError;

/// Configuration file structure for chainlens.
///
/// Declares the CI servers to talk to, the tracked branches that map a
/// logical branch name onto (server, suite, branch) triples, cache windows and
/// analysis defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    /// Principal used as the credentials scope for cached results
    #[serde(default = "default_user")]
    pub user: String,

    #[serde(default)]
    pub servers: Vec<ServerConfig>,

    #[serde(default)]
    pub tracked: Vec<BranchTracked>,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub analysis: AnalysisConfig,

    #[serde(default)]
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ServerConfig {
    /// Server code referenced by tracked chains
    pub id: String,

    /// Base URL of the REST API
    pub url: String,

    /// API token
    pub token: Option<String>,

    /// Environment variable holding the API token
    pub token_env: Option<String>,

    /// Whether unauthenticated access is permitted
    #[serde(default)]
    pub allow_anonymous: bool,

    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
}

/// A logical branch and the chains that make it up on each server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BranchTracked {
    pub id: String,
    #[serde(default)]
    pub chains: Vec<ChainAtServerTracked>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ChainAtServerTracked {
    pub server_id: String,
    /// Chain root build configuration
    pub suite_id: String,
    /// Branch name as known to the server
    pub branch: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CacheConfig {
    /// Freshness window for single latest build results
    #[serde(default = "default_live_ttl_secs")]
    pub live_ttl_secs: u64,

    /// Freshness window for merged results
    #[serde(default = "default_merged_ttl_secs")]
    pub merged_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AnalysisConfig {
    /// Tracked branch used when none is given
    #[serde(default = "default_branch")]
    pub default_branch: String,

    /// Number of recent chains merged by default
    #[serde(default = "default_merge_count")]
    pub default_merge_count: usize,

    /// Suites below this historical pass rate are reported
    #[serde(default = "default_low_pass_rate")]
    pub low_pass_rate: f64,

    /// Contact person per suite id
    #[serde(default)]
    pub annotations: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub struct OutputConfig {
    #[serde(default)]
    pub format: OutputFormat,

    #[serde(default)]
    pub pretty: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Summary,
    Json,
    Text,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            user: default_user(),
            servers: vec![],
            tracked: vec![],
            cache: CacheConfig::default(),
            analysis: AnalysisConfig::default(),
            output: OutputConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            url: String::new(),
            token: None,
            token_env: None,
            allow_anonymous: false,
            max_concurrent_requests: default_max_concurrent_requests(),
            max_retries: default_max_retries(),
            retry_delay_secs: default_retry_delay_secs(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            live_ttl_secs: default_live_ttl_secs(),
            merged_ttl_secs: default_merged_ttl_secs(),
        }
    }
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            default_branch: default_branch(),
            default_merge_count: default_merge_count(),
            low_pass_rate: default_low_pass_rate(),
            annotations: HashMap::new(),
        }
    }
}

fn default_user() -> String {
    "cli".to_string()
}

fn default_max_concurrent_requests() -> usize {
    50
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_secs() -> u64 {
    2
}

fn default_live_ttl_secs() -> u64 {
    60
}

fn default_merged_ttl_secs() -> u64 {
    30
}

fn default_branch() -> String {
    "master".to_string()
}

fn default_merge_count() -> usize {
    10
}

fn default_low_pass_rate() -> f64 {
    0.2
}

impl ServerConfig {
    /// Token from the config file, falling back to the named environment variable.
    pub fn resolve_token(&self) -> Option<Token> {
        self.token
            .clone()
            .or_else(|| {
                self.token_env
                    .as_deref()
                    .and_then(|var| std::env::var(var).ok())
            })
            .map(Token::from)
    }
}

impl CacheConfig {
    pub fn live_ttl(&self) -> Duration {
        Duration::from_secs(self.live_ttl_secs)
    }

    pub fn merged_ttl(&self) -> Duration {
        Duration::from_secs(self.merged_ttl_secs)
    }
}

/// Read-only view over the tracked branch definitions.
#[derive(Debug, Clone, Default)]
pub struct TrackedBranches {
    branches: Vec<BranchTracked>,
}

impl TrackedBranches {
    pub fn new(branches: Vec<BranchTracked>) -> Self {
        Self { branches }
    }

    pub fn get(&self, name: &str) -> Option<&BranchTracked> {
        self.branches.iter().find(|b| b.id == name)
    }

    /// # Errors
    ///
    /// Returns `NotFound` naming the branch when it is not tracked.
    pub fn branch_mandatory(&self, name: &str) -> crate::error::Result<&BranchTracked> {
        self.get(name)
            .ok_or_else(|| ChainLensError::not_found("tracked branch", name))
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.branches.iter().map(|b| b.id.as_str())
    }
}

impl Config {
    /// Load configuration from a file.
    ///
    /// Searches for configuration files in this order:
    /// 1. Specified path
    /// 2. ./chainlens.toml
    /// 3. ./chainlens.json
    /// 4. ./chainlens.yaml
    /// 5. ./chainlens.yml
    /// 6. `<config dir>/chainlens/chainlens.toml`
    ///
    /// Returns default configuration if no file is found.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            if path.exists() {
                return Self::load_from_path(path);
            }
            anyhow::bail!("Config file not found: {}", path.display());
        }

        let candidates = [
            "chainlens.toml",
            "chainlens.json",
            "chainlens.yaml",
            "chainlens.yml",
        ];

        for candidate in &candidates {
            let path = Path::new(candidate);
            if path.exists() {
                return Self::load_from_path(path);
            }
        }

        if let Some(path) = Self::user_config_path().filter(|p| p.exists()) {
            return Self::load_from_path(&path);
        }

        Ok(Self::default())
    }

    fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("chainlens").join("chainlens.toml"))
    }

    /// Load configuration from a specific file path.
    fn load_from_path(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let extension = path.extension().and_then(|ext| ext.to_str()).unwrap_or("");

        match extension {
            "toml" => toml::from_str(&contents)
                .with_context(|| format!("Failed to parse TOML config: {}", path.display())),
            "json" => serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse JSON config: {}", path.display())),
            "yaml" | "yml" => serde_yaml::from_str(&contents)
                .with_context(|| format!("Failed to parse YAML config: {}", path.display())),
            _ => toml::from_str(&contents)
                .or_else(|_| serde_json::from_str(&contents))
                .or_else(|_| serde_yaml::from_str(&contents))
                .with_context(|| format!("Failed to parse config file: {}", path.display())),
        }
    }

    /// Save configuration to a file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let contents = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::to_string_pretty(self)?,
            Some("yaml") | Some("yml") => serde_yaml::to_string(self)?,
            _ => toml::to_string_pretty(self)?,
        };

        std::fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Checks that every tracked chain refers to a declared server.
    pub fn validate(&self) -> crate::error::Result<()> {
        for branch in &self.tracked {
            for chain in &branch.chains {
                if !self.servers.iter().any(|s| s.id == chain.server_id) {
                    return Err(ChainLensError::Config(format!(
                        "tracked branch '{}' refers to unknown server '{}'",
                        branch.id, chain.server_id
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn tracked_branches(&self) -> TrackedBranches {
        TrackedBranches::new(self.tracked.clone())
    }

    /// Credentials for the configured user: a token per server that has one,
    /// plus anonymous access where the server allows it.
    pub fn credentials(&self) -> Credentials {
        self.servers
            .iter()
            .fold(Credentials::new(self.user.clone()), |creds, server| {
                match server.resolve_token() {
                    Some(token) => creds.with_token(server.id.clone(), token),
                    None if server.allow_anonymous => creds.with_anonymous(server.id.clone()),
                    None => creds,
                }
            })
    }
}
