// ⚙️ Configuration - JSON file + environment overrides
//
// Every field has a default, so an empty `{}` file (or no file at all) is a
// valid configuration. Environment variables win over the file; CLI flags
// win over both (applied by the binaries).

use crate::mapping::{default_rules, MappingRule, SalesScope, SalesmanMapper};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const ENV_DB: &str = "SALES_SYNC_DB";
pub const ENV_API_URL: &str = "SALES_SYNC_API_URL";
pub const ENV_API_KEY: &str = "SALES_SYNC_API_KEY";

// ============================================================================
// REMOTE FEED SETTINGS
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Per-request timeout; expiry fails the pass
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Size of the dated window fetched next to the open-order snapshot
    #[serde(default = "default_days_back")]
    pub days_back: u32,

    /// Newest pages of the open-quotation snapshot read per run
    #[serde(default = "default_quotation_open_pages")]
    pub quotation_open_pages: usize,

    /// Sales orders and quotations are kept only for customer codes with
    /// one of these prefixes. Empty keeps everything.
    #[serde(default = "default_customer_prefixes")]
    pub customer_prefixes: Vec<String>,
}

fn default_base_url() -> String {
    "http://localhost:8080/api".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_page_size() -> usize {
    20
}

fn default_days_back() -> u32 {
    3
}

fn default_quotation_open_pages() -> usize {
    15
}

fn default_customer_prefixes() -> Vec<String> {
    vec!["HO".to_string()]
}

impl Default for RemoteConfig {
    fn default() -> Self {
        RemoteConfig {
            base_url: default_base_url(),
            timeout_secs: default_timeout_secs(),
            page_size: default_page_size(),
            days_back: default_days_back(),
            quotation_open_pages: default_quotation_open_pages(),
            customer_prefixes: default_customer_prefixes(),
        }
    }
}

// ============================================================================
// SYNC CONFIG
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    #[serde(default)]
    pub remote: RemoteConfig,

    /// Shared secret expected by the receive server
    #[serde(default)]
    pub api_key: Option<String>,

    /// Minutes between runs in `watch` mode
    #[serde(default = "default_interval_minutes")]
    pub interval_minutes: u64,

    /// Ordered salesman rules; list order is match order
    #[serde(default = "default_rules")]
    pub salesman_mapping: Vec<MappingRule>,

    /// Unmapped names are dropped instead of passed through
    #[serde(default = "default_strict_mapping")]
    pub strict_mapping: bool,

    /// Username → salesman names that user may see
    #[serde(default)]
    pub user_scopes: HashMap<String, Vec<String>>,
}

fn default_database_path() -> PathBuf {
    PathBuf::from("sales_sync.db")
}

fn default_interval_minutes() -> u64 {
    7
}

fn default_strict_mapping() -> bool {
    true
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            database_path: default_database_path(),
            remote: RemoteConfig::default(),
            api_key: None,
            interval_minutes: default_interval_minutes(),
            salesman_mapping: default_rules(),
            strict_mapping: default_strict_mapping(),
            user_scopes: HashMap::new(),
        }
    }
}

impl SyncConfig {
    /// Load config from a JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

        serde_json::from_str(&content).context("Failed to parse config JSON")
    }

    /// File if given, defaults otherwise, then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Takes a lookup function so tests don't touch the process environment.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(db) = lookup(ENV_DB).filter(|v| !v.trim().is_empty()) {
            self.database_path = PathBuf::from(db);
        }
        if let Some(url) = lookup(ENV_API_URL).filter(|v| !v.trim().is_empty()) {
            self.remote.base_url = url;
        }
        if let Some(key) = lookup(ENV_API_KEY).filter(|v| !v.trim().is_empty()) {
            self.api_key = Some(key);
        }
    }

    pub fn mapper(&self) -> SalesmanMapper {
        SalesmanMapper::new(self.salesman_mapping.clone(), self.strict_mapping)
    }

    pub fn scope(&self) -> SalesScope {
        SalesScope::new(self.user_scopes.clone())
    }
}

// ============================================================================
// TESTS
// ============================================================================
