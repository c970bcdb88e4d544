use anyhow::{Context, Result};
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Process configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind: SocketAddr,
    pub data_dir: PathBuf,
    pub database_url: String,
    pub vault_key: Option<String>,
    pub git_timeout: Duration,
    pub health_base_url: String,
    pub compose_bin: String,
    pub log_json: bool,
    pub log_dir: Option<PathBuf>,
}

impl AppConfig {
    /// Load from the environment after applying `.env`, if present.
    pub fn from_env() -> Result<Self> {
        // A missing .env is normal in containers
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let bind = get("STACKHOOK_BIND")
            .unwrap_or_else(|| "0.0.0.0:3000".to_string())
            .parse()
            .context("STACKHOOK_BIND must be host:port")?;

        let data_dir = PathBuf::from(get("STACKHOOK_DATA_DIR").unwrap_or_else(|| "/data/stackhook".to_string()));
        let database_url = get("DATABASE_URL")
            .unwrap_or_else(|| format!("sqlite://{}", data_dir.join("stackhook.db").display()));

        let git_timeout_secs: u64 = match get("STACKHOOK_GIT_TIMEOUT_SECS") {
            Some(value) => value
                .parse()
                .with_context(|| format!("STACKHOOK_GIT_TIMEOUT_SECS is not a number: {}", value))?,
            None => 300,
        };
        if git_timeout_secs == 0 {
            anyhow::bail!("STACKHOOK_GIT_TIMEOUT_SECS must be positive");
        }

        Ok(Self {
            bind,
            database_url,
            vault_key: get("STACKHOOK_VAULT_KEY"),
            git_timeout: Duration::from_secs(git_timeout_secs),
            health_base_url: get("STACKHOOK_HEALTH_BASE_URL").unwrap_or_else(|| "http://127.0.0.1".to_string()),
            compose_bin: get("STACKHOOK_COMPOSE_BIN").unwrap_or_else(|| "docker".to_string()),
            log_json: get("LOG_FORMAT").map_or(false, |f| f.eq_ignore_ascii_case("json")),
            log_dir: get("LOG_DIR").map(PathBuf::from),
            data_dir,
        })
    }

    pub fn workspaces_dir(&self) -> PathBuf {
        self.data_dir.join("workspaces")
    }

    pub fn credentials_dir(&self) -> PathBuf {
        self.data_dir.join("credentials")
    }

    pub fn stacks_dir(&self) -> PathBuf {
        self.data_dir.join("stacks")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<AppConfig> {
        let map: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        AppConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config.bind.port(), 3000);
        assert_eq!(config.database_url, "sqlite:///data/stackhook/stackhook.db");
        assert_eq!(config.git_timeout, Duration::from_secs(300));
        assert_eq!(config.compose_bin, "docker");
        assert_eq!(config.workspaces_dir(), PathBuf::from("/data/stackhook/workspaces"));
        assert!(config.vault_key.is_none());
        assert!(!config.log_json);
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("STACKHOOK_DATA_DIR", "/srv/hook"),
            ("STACKHOOK_GIT_TIMEOUT_SECS", "60"),
            ("LOG_FORMAT", "JSON"),
            ("STACKHOOK_VAULT_KEY", "  "),
        ])
        .unwrap();
        assert_eq!(config.database_url, "sqlite:///srv/hook/stackhook.db");
        assert_eq!(config.stacks_dir(), PathBuf::from("/srv/hook/stacks"));
        assert_eq!(config.git_timeout, Duration::from_secs(60));
        assert!(config.log_json);
        assert!(config.vault_key.is_none());
    }

    #[test]
    fn test_rejects_invalid_values() {
        assert!(load(&[("STACKHOOK_BIND", "nope")]).is_err());
        assert!(load(&[("STACKHOOK_GIT_TIMEOUT_SECS", "0")]).is_err());
        assert!(load(&[("STACKHOOK_GIT_TIMEOUT_SECS", "soon")]).is_err());
    }
}
