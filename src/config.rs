//! Configuration for codespeak
//!
//! Read once from `<project_root>/codespeak.toml`, then overridden by environment variables.
//! The resulting `Config` is passed by reference into the engine and the artifact store.

use crate::digest::DigestPolicy;
use crate::error::{CodespeakError, Result};
use keyring::Entry;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

pub const CONFIG_FILE: &str = "codespeak.toml";
pub const DEFAULT_ARTIFACT_DIRNAME: &str = "codespeak_inferred";

const KEYRING_SERVICE: &str = "codespeak";
const KEYRING_USERNAME: &str = "openai_api_key";

/// Deployment mode. `Prod` skips every staleness check and runs committed artifacts as-is.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Dev,
    Prod,
}

impl FromStr for Environment {
    type Err = CodespeakError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "dev" => Ok(Environment::Dev),
            "prod" => Ok(Environment::Prod),
            other => Err(CodespeakError::Config(format!(
                "environment must be 'dev' or 'prod', got '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Environment::Dev => write!(f, "dev"),
            Environment::Prod => write!(f, "prod"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    #[serde(skip)]
    pub project_root: PathBuf,
    pub environment: Environment,
    pub artifact_dirname: String,
    pub model: String,
    pub api_base: String,
    /// Filled from the environment only; never written to disk.
    #[serde(skip)]
    pub openai_api_key: Option<String>,
    /// Remove artifacts of deleted functions after each successful generation
    pub auto_clean: bool,
    /// Log full prompts at debug level
    pub verbose: bool,
    pub python: String,
    pub max_code_versions: u32,
    pub max_test_versions: u32,
    pub max_bad_formatting_versions: u32,
    pub digest_policy: DigestPolicy,
    pub execution_timeout_secs: u64,
    pub test_timeout_secs: u64,
    pub model_retries: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            project_root: PathBuf::from("."),
            environment: Environment::Dev,
            artifact_dirname: DEFAULT_ARTIFACT_DIRNAME.to_string(),
            model: "gpt-4".to_string(),
            api_base: "https://api.openai.com/v1".to_string(),
            openai_api_key: None,
            auto_clean: false,
            verbose: false,
            python: "python3".to_string(),
            max_code_versions: 3,
            max_test_versions: 3,
            max_bad_formatting_versions: 3,
            digest_policy: DigestPolicy::Shallow,
            execution_timeout_secs: 120,
            test_timeout_secs: 300,
            model_retries: 5,
        }
    }
}

fn keyring_entry() -> std::result::Result<Entry, keyring::Error> {
    Entry::new(KEYRING_SERVICE, KEYRING_USERNAME)
}

fn read_keyring_key() -> std::result::Result<Option<String>, keyring::Error> {
    let entry = keyring_entry()?;
    match entry.get_password() {
        Ok(key) => Ok(Some(key)),
        Err(keyring::Error::NoEntry) => Ok(None),
        Err(err) => Err(err),
    }
}

impl Config {
    /// Defaults rooted at `project_root`, without touching disk or the environment.
    pub fn for_project(project_root: impl Into<PathBuf>) -> Self {
        Self {
            project_root: project_root.into(),
            ..Self::default()
        }
    }

    /// Load `codespeak.toml` from the project root and apply environment overrides.
    pub fn load(project_root: &Path) -> Result<Self> {
        let mut config = Self::load_file(project_root);
        config.apply_overrides(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Read the project file, falling back to defaults when it is missing or corrupt.
    pub fn load_file(project_root: &Path) -> Self {
        let path = project_root.join(CONFIG_FILE);
        let mut config = match fs::read_to_string(&path) {
            Ok(content) => match toml::from_str::<Config>(&content) {
                Ok(config) => config,
                Err(err) => {
                    preserve_corrupt_config(&path, &content);
                    tracing::warn!(
                        path = %path.display(),
                        "config file was corrupted ({}); a backup was saved and defaults were loaded",
                        err
                    );
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        };
        config.project_root = project_root.to_path_buf();
        config
    }

    /// Apply overrides from a variable lookup (the process environment in production).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("CODESPEAK_ENVIRONMENT").or_else(|| lookup("ENVIRONMENT")) {
            self.environment = value.parse()?;
        }
        if let Some(key) = lookup("OPENAI_API_KEY").filter(|k| !k.trim().is_empty()) {
            self.openai_api_key = Some(key);
        }
        if let Some(model) = lookup("CODESPEAK_MODEL") {
            self.model = model;
        }
        if let Some(base) = lookup("OPENAI_API_BASE") {
            self.api_base = base;
        }
        if let Some(python) = lookup("CODESPEAK_PYTHON") {
            self.python = python;
        }
        self.validate()
    }

    fn validate(&self) -> Result<()> {
        if self.artifact_dirname.trim().is_empty() || self.artifact_dirname.contains(['/', '\\']) {
            return Err(CodespeakError::Config(format!(
                "artifact_dirname must be a single directory name, got '{}'",
                self.artifact_dirname
            )));
        }
        url::Url::parse(&self.api_base)
            .map_err(|e| CodespeakError::Config(format!("api_base is not a URL: {}", e)))?;
        Ok(())
    }

    pub fn is_prod(&self) -> bool {
        self.environment == Environment::Prod
    }

    pub fn artifact_root(&self) -> PathBuf {
        self.project_root.join(&self.artifact_dirname)
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.execution_timeout_secs)
    }

    pub fn test_timeout(&self) -> Duration {
        Duration::from_secs(self.test_timeout_secs)
    }

    /// The OpenAI API key: environment first, then the OS keychain.
    pub fn api_key(&self) -> Option<String> {
        if let Some(key) = &self.openai_api_key {
            return Some(key.clone());
        }
        match read_keyring_key() {
            Ok(key) => key,
            Err(err) => {
                tracing::debug!("keychain lookup failed: {}", err);
                None
            }
        }
    }

    /// Store an API key in the OS keychain and confirm it reads back.
    pub fn set_api_key(key: &str) -> Result<()> {
        let key = key.trim();
        if key.is_empty() {
            return Err(CodespeakError::Config("API key is empty".to_string()));
        }
        let entry = keyring_entry()
            .map_err(|e| CodespeakError::Config(format!("keychain unavailable: {}", e)))?;
        entry
            .set_password(key)
            .map_err(|e| CodespeakError::Config(format!("failed to store API key: {}", e)))?;
        match read_keyring_key() {
            Ok(Some(stored)) if stored == key => Ok(()),
            Ok(_) => Err(CodespeakError::Config(
                "API key did not read back from the keychain".to_string(),
            )),
            Err(e) => Err(CodespeakError::Config(format!(
                "failed to verify stored API key: {}",
                e
            ))),
        }
    }
}

fn preserve_corrupt_config(path: &Path, content: &str) {
    let corrupt_path = path.with_extension("toml.corrupt");
    if fs::rename(path, &corrupt_path).is_err() {
        let _ = fs::write(&corrupt_path, content);
    }
}
