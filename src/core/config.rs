use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::{fs, path::PathBuf, time::Duration};
use tracing::debug;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct EastMoneyProviderConfig {
    #[serde(default = "EastMoneyProviderConfig::default_estimate_url")]
    pub estimate_url: String,
    #[serde(default = "EastMoneyProviderConfig::default_detail_url")]
    pub detail_url: String,
    #[serde(default = "EastMoneyProviderConfig::default_timeout_secs")]
    pub timeout_secs: u64,
}

impl EastMoneyProviderConfig {
    fn default_estimate_url() -> String {
        "http://fundgz.1234567.com.cn".to_string()
    }

    fn default_detail_url() -> String {
        "http://fund.eastmoney.com".to_string()
    }

    fn default_timeout_secs() -> u64 {
        5
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

impl Default for EastMoneyProviderConfig {
    fn default() -> Self {
        EastMoneyProviderConfig {
            estimate_url: Self::default_estimate_url(),
            detail_url: Self::default_detail_url(),
            timeout_secs: Self::default_timeout_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub eastmoney: EastMoneyProviderConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SettlementConfig {
    /// Upper bound on one scheduler sleep before the clock is re-read.
    #[serde(default = "SettlementConfig::default_sleep_chunk_secs")]
    pub sleep_chunk_secs: u64,
}

impl SettlementConfig {
    fn default_sleep_chunk_secs() -> u64 {
        3600
    }
}

impl Default for SettlementConfig {
    fn default() -> Self {
        SettlementConfig {
            sleep_chunk_secs: Self::default_sleep_chunk_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ResolverConfig {
    /// How long a loaded name index may be reused before it is rebuilt.
    #[serde(default = "ResolverConfig::default_directory_ttl_secs")]
    pub directory_ttl_secs: u64,
}

impl ResolverConfig {
    fn default_directory_ttl_secs() -> u64 {
        300
    }
}

impl Default for ResolverConfig {
    fn default() -> Self {
        ResolverConfig {
            directory_ttl_secs: Self::default_directory_ttl_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct AppConfig {
    pub data_path: Option<String>,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub settlement: SettlementConfig,
    #[serde(default)]
    pub resolver: ResolverConfig,
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        debug!("Loading default config");
        let config_path = Self::default_config_path()?;
        Self::load_from_path(&config_path)
    }

    pub fn default_config_path() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("com", "fundwatch", "fundwatch")
            .context("Could not determine project directories")?;
        Ok(proj_dirs.config_dir().join("config.yaml"))
    }

    pub fn default_data_path(&self) -> Result<PathBuf> {
        if let Some(custom_path) = &self.data_path {
            return Ok(PathBuf::from(custom_path));
        }
        let proj_dirs = ProjectDirs::from("com", "fundwatch", "fundwatch")
            .context("Could not determine project directories")?;
        Ok(proj_dirs.data_dir().to_path_buf())
    }

    pub fn load_from_path<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let config_str = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: Self = serde_yaml::from_str(&config_str)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))?;
        debug!("Successfully loaded config");
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_deserialization() {
        let yaml_str = r#"
data_path: "/tmp/fundwatch"
providers:
  eastmoney:
    estimate_url: "http://localhost:9000/gz"
    timeout_secs: 2
settlement:
  sleep_chunk_secs: 60
"#;

        let config: AppConfig = serde_yaml::from_str(yaml_str).expect("Failed to deserialize");
        assert_eq!(config.data_path.as_deref(), Some("/tmp/fundwatch"));
        let eastmoney = &config.providers.eastmoney;
        assert_eq!(eastmoney.estimate_url, "http://localhost:9000/gz");
        assert_eq!(eastmoney.detail_url, "http://fund.eastmoney.com");
        assert_eq!(eastmoney.timeout(), Duration::from_secs(2));
        assert_eq!(config.settlement.sleep_chunk_secs, 60);
        assert_eq!(config.resolver.directory_ttl_secs, 300);
        assert_eq!(
            config.default_data_path().unwrap(),
            PathBuf::from("/tmp/fundwatch")
        );
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: AppConfig = serde_yaml::from_str("{}").unwrap();
        assert!(config.data_path.is_none());
        assert_eq!(
            config.providers.eastmoney.estimate_url,
            "http://fundgz.1234567.com.cn"
        );
        assert_eq!(config.settlement.sleep_chunk_secs, 3600);
    }

    #[test]
    fn test_load_from_path_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = AppConfig::load_from_path(dir.path().join("missing.yaml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
