use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::probe::request::DEFAULT_TIMEOUT_MS;

const ENV_PREFIX: &str = "PROTOPROBE_";

/// Engine-wide knobs. Loaded from JSON, then environment, then CLI flags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProbeConfig {
    pub default_timeout_ms: u64,
    pub max_concurrent_probes: usize,
    pub max_pending_probes: usize,
    pub raw_diagnostics: bool,
    /// Bytes of peer output kept for raw hex diagnostics.
    pub raw_capture_bytes: usize,
    pub max_response_bytes: usize,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: DEFAULT_TIMEOUT_MS,
            max_concurrent_probes: 32,
            max_pending_probes: 256,
            raw_diagnostics: false,
            raw_capture_bytes: 512,
            max_response_bytes: 1024 * 1024,
        }
    }
}

impl ProbeConfig {
    pub fn default_path() -> PathBuf {
        let mut path = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
        path.push("protoprobe");
        path.push("config.json");
        path
    }

    /// An explicit path must exist; the default path is optional.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut config = match explicit {
            Some(path) => Self::load_from_file(path)?,
            None => {
                let path = Self::default_path();
                if path.exists() {
                    Self::load_from_file(&path)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: ProbeConfig = serde_json::from_str(&content)
            .with_context(|| format!("invalid config file {}", path.display()))?;
        debug!(path = %path.display(), "loaded config");
        Ok(config)
    }

    /// Applies `PROTOPROBE_*` overrides using `lookup` to read variables.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
            value
                .trim()
                .parse()
                .map_err(|_| anyhow::anyhow!("{}{} has invalid value '{}'", ENV_PREFIX, key, value))
        }
        let var = |key: &str| lookup(&format!("{}{}", ENV_PREFIX, key));

        if let Some(v) = var("TIMEOUT_MS") {
            self.default_timeout_ms = parse("TIMEOUT_MS", &v)?;
        }
        if let Some(v) = var("MAX_CONCURRENT") {
            self.max_concurrent_probes = parse("MAX_CONCURRENT", &v)?;
        }
        if let Some(v) = var("MAX_PENDING") {
            self.max_pending_probes = parse("MAX_PENDING", &v)?;
        }
        if let Some(v) = var("RAW") {
            self.raw_diagnostics = matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on");
        }
        if let Some(v) = var("RAW_CAPTURE_BYTES") {
            self.raw_capture_bytes = parse("RAW_CAPTURE_BYTES", &v)?;
        }
        if let Some(v) = var("MAX_RESPONSE_BYTES") {
            self.max_response_bytes = parse("MAX_RESPONSE_BYTES", &v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.default_timeout_ms == 0 {
            bail!("defaultTimeoutMs must be greater than zero");
        }
        if self.max_concurrent_probes == 0 {
            bail!("maxConcurrentProbes must be greater than zero");
        }
        if self.max_pending_probes < self.max_concurrent_probes {
            bail!(
                "maxPendingProbes ({}) must be at least maxConcurrentProbes ({})",
                self.max_pending_probes,
                self.max_concurrent_probes
            );
        }
        if self.max_response_bytes == 0 {
            bail!("maxResponseBytes must be greater than zero");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"maxConcurrentProbes": 4, "rawDiagnostics": true}}"#).unwrap();

        let config = ProbeConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.max_concurrent_probes, 4);
        assert!(config.raw_diagnostics);
        assert_eq!(config.default_timeout_ms, DEFAULT_TIMEOUT_MS);
        assert_eq!(config.max_pending_probes, 256);
    }

    #[test]
    fn test_explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ProbeConfig::load(Some(&dir.path().join("absent.json"))).is_err());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("PROTOPROBE_TIMEOUT_MS", "750"),
            ("PROTOPROBE_MAX_PENDING", "64"),
            ("PROTOPROBE_RAW", "yes"),
        ]
        .into_iter()
        .collect();
        let mut config = ProbeConfig::default();
        config.apply_env(|k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.default_timeout_ms, 750);
        assert_eq!(config.max_pending_probes, 64);
        assert!(config.raw_diagnostics);

        let bad = |k: &str| (k == "PROTOPROBE_MAX_CONCURRENT").then(|| "many".to_string());
        assert!(ProbeConfig::default().apply_env(bad).is_err());
    }

    #[test]
    fn test_validate_rejects_zero_limits() {
        let mut config = ProbeConfig::default();
        assert!(config.validate().is_ok());
        config.max_concurrent_probes = 0;
        assert!(config.validate().is_err());

        let config = ProbeConfig {
            max_pending_probes: 2,
            max_concurrent_probes: 8,
            ..ProbeConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
