//! Mount configuration, loaded from a TOML file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use gethostname::gethostname;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub mongo: MongoSettings,
    pub mount: MountSettings,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub identity: IdentitySettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MongoSettings {
    pub hosts: Vec<String>,
    pub database: String,
    #[serde(default)]
    pub collection_prefix: String,
}

impl MongoSettings {
    pub fn uri(&self) -> String {
        format!("mongodb://{}/", self.hosts.join(","))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountSettings {
    /// Where the bridge mounts the filesystem. The engine itself only
    /// needs it for the best-effort unmount when the backend is given up
    /// on.
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    /// How long one operation may keep retrying against an unreachable
    /// backend before the mount is abandoned.
    #[serde(default = "default_attempt_budget_secs")]
    pub attempt_budget_secs: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            attempt_budget_secs: default_attempt_budget_secs(),
        }
    }
}

fn default_attempt_budget_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdentitySettings {
    /// Host part of lock identities; empty means the OS hostname.
    #[serde(default)]
    pub hostname: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            mongo: MongoSettings {
                hosts: vec!["127.0.0.1:27017".to_string()],
                database: "mongofs".to_string(),
                collection_prefix: String::new(),
            },
            mount: MountSettings {
                path: PathBuf::from("/mnt/mongofs"),
            },
            retry: RetrySettings::default(),
            identity: IdentitySettings::default(),
        }
    }
}

impl Settings {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let settings: Settings = toml::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        if settings.mongo.hosts.is_empty() {
            bail!("config {} lists no mongo hosts", path.display());
        }
        Ok(settings)
    }

    pub fn write_default_config(path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if path.exists() {
            bail!("{} already exists, refusing to overwrite", path.display());
        }
        let rendered = toml::to_string_pretty(&Settings::default())?;
        std::fs::write(path, rendered)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    pub fn attempt_budget(&self) -> Duration {
        Duration::from_secs(self.retry.attempt_budget_secs)
    }

    /// Host identity for lock ids; configuration wins over the OS name.
    pub fn hostname(&self) -> String {
        if self.identity.hostname.is_empty() {
            gethostname().to_string_lossy().into_owned()
        } else {
            self.identity.hostname.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mongofs.toml");

        Settings::write_default_config(&path).unwrap();
        let settings = Settings::from_file(&path).unwrap();

        assert_eq!(settings.mongo.hosts, vec!["127.0.0.1:27017".to_string()]);
        assert_eq!(settings.mongo.database, "mongofs");
        assert_eq!(settings.retry.attempt_budget_secs, 60);
        assert_eq!(settings.mongo.uri(), "mongodb://127.0.0.1:27017/");
    }

    #[test]
    fn existing_config_is_not_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mongofs.toml");

        Settings::write_default_config(&path).unwrap();
        assert!(Settings::write_default_config(&path).is_err());
    }

    #[test]
    fn empty_host_list_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mongofs.toml");
        std::fs::write(
            &path,
            "[mongo]\nhosts = []\ndatabase = \"mongofs\"\n[mount]\npath = \"/mnt/mongofs\"\n",
        )
        .unwrap();

        assert!(Settings::from_file(&path).is_err());
    }

    #[test]
    fn hostname_falls_back_to_the_os() {
        let mut settings = Settings::default();
        assert!(!settings.hostname().is_empty());

        settings.identity.hostname = "db-head".to_string();
        assert_eq!(settings.hostname(), "db-head");
    }
}
