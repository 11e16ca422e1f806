use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

fn default_db_name() -> String {
    "anivault".to_string()
}

fn default_branch() -> String {
    "backups".to_string()
}

fn default_debounce_secs() -> u64 {
    300
}

fn default_interval_secs() -> u64 {
    6 * 3600
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    pub couchdb_url: String,
    #[serde(default)]
    pub couchdb_user: String,
    #[serde(default)]
    pub couchdb_password: String,
    #[serde(default = "default_db_name")]
    pub db_name: String,

    /// Remote read-only catalog source; empty disables the fallback tier.
    #[serde(default)]
    pub fallback_url: Option<String>,

    /// Root of the local fallback file tree.
    pub data_dir: PathBuf,

    pub backup: BackupSection,

    #[serde(default)]
    pub admin_tokens: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackupSection {
    /// Git working tree the snapshots are materialized into.
    pub workdir: PathBuf,
    #[serde(default)]
    pub remote: Option<String>,
    #[serde(default = "default_branch")]
    pub branch: String,
    #[serde(default = "default_debounce_secs")]
    pub debounce_secs: u64,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
}

impl StoreConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path.display(), e))?;
        let mut config: StoreConfig = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse {}: {}", path.display(), e))?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Secrets and connection details may come from the environment instead
    /// of the config file.
    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("ANIVAULT_COUCHDB_URL") {
            self.couchdb_url = url;
        }
        if let Ok(user) = std::env::var("ANIVAULT_COUCHDB_USER") {
            self.couchdb_user = user;
        }
        if let Ok(password) = std::env::var("ANIVAULT_COUCHDB_PASSWORD") {
            self.couchdb_password = password;
        }
        if let Ok(tokens) = std::env::var("ANIVAULT_ADMIN_TOKENS") {
            self.admin_tokens = tokens
                .split(',')
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect();
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.couchdb_url.is_empty() {
            anyhow::bail!("couchdb_url must not be empty");
        }
        if self.db_name.is_empty() {
            anyhow::bail!("db_name must not be empty");
        }
        if !self.data_dir.is_absolute() {
            anyhow::bail!("data_dir must be absolute: {}", self.data_dir.display());
        }
        if !self.backup.workdir.is_absolute() {
            anyhow::bail!(
                "backup.workdir must be absolute: {}",
                self.backup.workdir.display()
            );
        }
        if self.backup.branch.is_empty() {
            anyhow::bail!("backup.branch must not be empty");
        }
        if self.backup.debounce_secs == 0 {
            anyhow::bail!("backup.debounce_secs must be positive");
        }
        if self.backup.interval_secs == 0 {
            anyhow::bail!("backup.interval_secs must be positive");
        }
        Ok(())
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_secs(self.backup.debounce_secs)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.backup.interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid_config() {
        let toml_str = r#"
couchdb_url = "http://localhost:5984"
couchdb_user = "admin"
couchdb_password = "secret"
fallback_url = "https://mirror.example.net/catalog.json"
data_dir = "/var/lib/anivault"

[backup]
workdir = "/var/lib/anivault/backup"
remote = "git@example.net:anivault/backups.git"
"#;
        let mut config: StoreConfig = toml::from_str(toml_str).unwrap();
        config.validate().unwrap();
        assert_eq!(config.db_name, "anivault");
        assert_eq!(config.backup.branch, "backups");
        assert_eq!(config.debounce(), Duration::from_secs(300));
        assert_eq!(config.interval(), Duration::from_secs(6 * 3600));
        config.apply_env_overrides();
    }

    #[test]
    fn test_relative_data_dir_rejected() {
        let toml_str = r#"
couchdb_url = "http://localhost:5984"
data_dir = "relative/path"

[backup]
workdir = "/var/lib/anivault/backup"
"#;
        let config: StoreConfig = toml::from_str(toml_str).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_debounce_rejected() {
        let toml_str = r#"
couchdb_url = "http://localhost:5984"
data_dir = "/var/lib/anivault"

[backup]
workdir = "/var/lib/anivault/backup"
debounce_secs = 0
"#;
        let config: StoreConfig = toml::from_str(toml_str).unwrap();
        assert!(config.validate().is_err());
    }
}
