//! Configuration loading and API key resolution
//!
//! Settings are resolved in priority order:
//! 1. Command-line argument (highest priority)
//! 2. Environment variable
//! 3. TOML config file
//! 4. Compiled default (fallback)
//!
//! A missing TOML file is never fatal: a warning is logged and defaults apply.

use crate::model::SourceId;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{info, warn};

/// Environment variable naming an explicit config file
pub const CONFIG_ENV_VAR: &str = "KESTREL_CONFIG";

/// Top-level TOML configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KestrelConfig {
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub search: SearchConfig,

    #[serde(default)]
    pub sources: SourcesConfig,

    #[serde(default)]
    pub escalation: EscalationConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log file path (optional, logs to stderr if not specified)
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Worker pool and resolver settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Worker count; clamped to host parallelism
    #[serde(default)]
    pub threads: Option<usize>,

    /// Retry multi-word misses with the leading word dropped
    #[serde(default = "default_true")]
    pub relax_terms: bool,

    /// Log a progress line every N persisted outcomes
    #[serde(default = "default_progress_interval")]
    pub progress_interval: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            threads: None,
            relax_terms: true,
            progress_interval: default_progress_interval(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_progress_interval() -> usize {
    25
}

/// Per-source overrides; unset fields fall back to the adapter's defaults
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceSettings {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub requests_per_second: Option<u32>,
}

/// Structured source configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourcesConfig {
    /// Chain order, highest authority first
    #[serde(default = "default_priority")]
    pub priority: Vec<SourceId>,

    #[serde(default)]
    pub ncbi: SourceSettings,
    #[serde(default)]
    pub gbif: SourceSettings,
    #[serde(default)]
    pub itis: SourceSettings,
    #[serde(default)]
    pub iucn: SourceSettings,
    #[serde(default)]
    pub eol: SourceSettings,
    #[serde(default)]
    pub wikipedia: SourceSettings,
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            priority: default_priority(),
            ncbi: SourceSettings::default(),
            gbif: SourceSettings::default(),
            itis: SourceSettings::default(),
            iucn: SourceSettings::default(),
            eol: SourceSettings::default(),
            wikipedia: SourceSettings::default(),
        }
    }
}

fn default_priority() -> Vec<SourceId> {
    SourceId::STRUCTURED.to_vec()
}

impl SourcesConfig {
    /// Settings table for a structured source (`None` for the escalation source)
    pub fn settings(&self, source: SourceId) -> Option<&SourceSettings> {
        match source {
            SourceId::Ncbi => Some(&self.ncbi),
            SourceId::Gbif => Some(&self.gbif),
            SourceId::Itis => Some(&self.itis),
            SourceId::Iucn => Some(&self.iucn),
            SourceId::Eol => Some(&self.eol),
            SourceId::Wikipedia => Some(&self.wikipedia),
            SourceId::WebSearch => None,
        }
    }

    /// Priority list with duplicates and the escalation source removed
    pub fn ordered(&self) -> Vec<SourceId> {
        let mut seen = Vec::with_capacity(self.priority.len());
        for source in &self.priority {
            if *source != SourceId::WebSearch && !seen.contains(source) {
                seen.push(*source);
            }
        }
        seen
    }
}

/// Backend used by the escalation stage to fetch search results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrowserBackend {
    /// Plain HTTP fetch of the results page
    #[default]
    Http,
    /// Chrome driven through a WebDriver endpoint
    Chrome,
    /// Firefox driven through a WebDriver endpoint
    Firefox,
}

impl FromStr for BrowserBackend {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "http" => Ok(BrowserBackend::Http),
            "chrome" => Ok(BrowserBackend::Chrome),
            "firefox" => Ok(BrowserBackend::Firefox),
            other => Err(format!(
                "unknown browser backend '{}' (expected http, chrome or firefox)",
                other
            )),
        }
    }
}

impl fmt::Display for BrowserBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrowserBackend::Http => write!(f, "http"),
            BrowserBackend::Chrome => write!(f, "chrome"),
            BrowserBackend::Firefox => write!(f, "firefox"),
        }
    }
}

/// Escalation stage settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub backend: BrowserBackend,

    /// WebDriver endpoint for the browser backends
    #[serde(default = "default_webdriver_url")]
    pub webdriver_url: String,

    /// Search engine results URL; the query is appended as `q`
    #[serde(default)]
    pub search_url: Option<String>,

    #[serde(default = "default_escalation_concurrency")]
    pub concurrency: usize,

    #[serde(default = "default_escalation_timeout")]
    pub timeout_secs: u64,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            backend: BrowserBackend::default(),
            webdriver_url: default_webdriver_url(),
            search_url: None,
            concurrency: default_escalation_concurrency(),
            timeout_secs: default_escalation_timeout(),
        }
    }
}

fn default_webdriver_url() -> String {
    "http://127.0.0.1:4444".to_string()
}

fn default_escalation_concurrency() -> usize {
    1
}

fn default_escalation_timeout() -> u64 {
    30
}

// ============================================================================
// Loading and writing
// ============================================================================

/// Default config location: `<config_dir>/kestrel/kestrel.toml`
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("kestrel").join("kestrel.toml"))
}

/// Pick the config file: CLI → `KESTREL_CONFIG` → default location
///
/// The default location is only returned when the file exists.
pub fn resolve_config_path(cli_arg: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = cli_arg {
        return Some(path.to_path_buf());
    }

    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        if !path.trim().is_empty() {
            return Some(PathBuf::from(path));
        }
    }

    default_config_path().filter(|p| p.exists())
}

/// Load configuration, falling back to defaults when the file is absent
pub fn load_config(path: Option<&Path>) -> Result<KestrelConfig> {
    let Some(path) = path else {
        info!("No config file found, using built-in defaults");
        return Ok(KestrelConfig::default());
    };

    if !path.exists() {
        warn!(
            path = %path.display(),
            "Config file not found, using built-in defaults"
        );
        return Ok(KestrelConfig::default());
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Read {} failed: {}", path.display(), e)))?;
    let config: KestrelConfig = toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Parse {} failed: {}", path.display(), e)))?;

    info!(path = %path.display(), "Loaded configuration");
    Ok(config)
}

/// Write configuration atomically (temp file + rename)
pub fn write_toml_config(config: &KestrelConfig, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let content = toml::to_string_pretty(config)
        .map_err(|e| Error::Config(format!("Serialize config failed: {}", e)))?;

    let tmp_path = path.with_extension("toml.tmp");
    std::fs::write(&tmp_path, content)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

// ============================================================================
// API keys
// ============================================================================

/// Validate API key (non-empty, non-whitespace)
pub fn is_valid_key(key: &str) -> bool {
    !key.trim().is_empty()
}

/// Resolve a source's API key: CLI → environment → TOML
///
/// Returns `None` when no tier holds a valid key; the source is then skipped
/// if it requires one.
pub fn resolve_api_key(
    source: SourceId,
    cli_key: Option<&str>,
    config: &KestrelConfig,
) -> Option<String> {
    let env_key = std::env::var(source.api_key_env()).ok();
    let toml_key = config
        .sources
        .settings(source)
        .and_then(|s| s.api_key.clone());

    let tiers = [
        ("command line", cli_key.map(str::to_string)),
        ("environment", env_key),
        ("TOML", toml_key),
    ];

    let valid: Vec<(&str, String)> = tiers
        .into_iter()
        .filter_map(|(tier, key)| key.filter(|k| is_valid_key(k)).map(|k| (tier, k)))
        .collect();

    if valid.len() > 1 {
        warn!(
            source = %source,
            tiers = %valid.iter().map(|(t, _)| *t).collect::<Vec<_>>().join(", "),
            "API key found in multiple places, using highest priority"
        );
    }

    valid.into_iter().next().map(|(tier, key)| {
        info!(source = %source, tier, "API key resolved");
        key.trim().to_string()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = KestrelConfig::default();
        assert_eq!(config.logging.level, "info");
        assert!(config.search.relax_terms);
        assert_eq!(config.sources.ordered(), SourceId::STRUCTURED.to_vec());
        assert_eq!(config.escalation.backend, BrowserBackend::Http);
        assert_eq!(config.escalation.concurrency, 1);
    }

    #[test]
    fn test_ordered_drops_duplicates_and_web_search() {
        let sources = SourcesConfig {
            priority: vec![
                SourceId::Gbif,
                SourceId::WebSearch,
                SourceId::Ncbi,
                SourceId::Gbif,
            ],
            ..Default::default()
        };
        assert_eq!(sources.ordered(), vec![SourceId::Gbif, SourceId::Ncbi]);
    }

    #[test]
    fn test_parse_partial_toml() {
        let config: KestrelConfig = toml::from_str(
            r#"
            [sources]
            priority = ["gbif", "itis"]

            [sources.iucn]
            api_key = "abc"
            timeout_secs = 5

            [escalation]
            backend = "firefox"
            "#,
        )
        .unwrap();

        assert_eq!(config.sources.priority, vec![SourceId::Gbif, SourceId::Itis]);
        assert_eq!(config.sources.iucn.api_key.as_deref(), Some("abc"));
        assert_eq!(config.sources.iucn.timeout_secs, Some(5));
        assert_eq!(config.escalation.backend, BrowserBackend::Firefox);
        assert!(config.escalation.enabled);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_browser_backend_from_str() {
        assert_eq!("Chrome".parse::<BrowserBackend>(), Ok(BrowserBackend::Chrome));
        assert!("safari".parse::<BrowserBackend>().is_err());
    }

    #[test]
    fn test_is_valid_key() {
        assert!(is_valid_key("abc"));
        assert!(!is_valid_key("   "));
        assert!(!is_valid_key(""));
    }
}
