use crate::cache::CacheDefaults;
use crate::persist::PersistOptions;
use directories::BaseDirs;
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

pub const DEFAULT_API_URL: &str = "https://api.lift.app/v1/";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiSettings {
    pub base_url: Url,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub api: ApiSettings,
    pub cache: CacheDefaults,
    pub gc_interval: Duration,
    pub persistence: PersistOptions,
    pub data_dir: PathBuf,
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("no liftsync.yaml found")]
    Missing,
    #[error("configuration invalid: {0}")]
    Invalid(String),
}

impl ConfigError {
    pub fn user_message(&self) -> String {
        match self {
            Self::Missing => "Client not configured: create liftsync.yaml.".to_string(),
            Self::Invalid(detail) => format!("Client misconfigured: {detail}. Update liftsync.yaml."),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        let base_url = Url::parse(DEFAULT_API_URL).expect("default api url parses");
        Self {
            api: ApiSettings {
                base_url,
                timeout: Duration::from_secs(30),
            },
            cache: CacheDefaults::default(),
            gc_interval: Duration::from_secs(60),
            persistence: PersistOptions::default(),
            data_dir: default_data_dir(),
        }
    }
}

impl ClientConfig {
    /// Load `liftsync.yaml` from the usual locations, then apply environment
    /// overrides. A missing file yields the defaults.
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let file = match locate_config_file() {
            Some(path) => {
                let contents = fs::read_to_string(&path).map_err(|err| {
                    ConfigError::Invalid(format!("failed to read {}: {err}", path.display()))
                })?;
                Self::parse_file(&contents)?
            }
            None => ConfigFile::default(),
        };
        let overrides = EnvOverrides {
            api_url: std::env::var("LIFTSYNC_API_URL").ok(),
            data_dir: std::env::var("LIFTSYNC_DATA_DIR").ok(),
        };
        resolve(file, overrides)
    }

    /// Load from an explicit path; the file must exist.
    pub fn from_path(path: &std::path::Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::Missing);
        }
        let contents = fs::read_to_string(path).map_err(|err| {
            ConfigError::Invalid(format!("failed to read {}: {err}", path.display()))
        })?;
        resolve(Self::parse_file(&contents)?, EnvOverrides::default())
    }

    fn parse_file(contents: &str) -> Result<ConfigFile, ConfigError> {
        serde_yaml::from_str(contents)
            .map_err(|err| ConfigError::Invalid(format!("invalid liftsync.yaml: {err}")))
    }
}

#[derive(Debug, Default)]
struct EnvOverrides {
    api_url: Option<String>,
    data_dir: Option<String>,
}

fn resolve(file: ConfigFile, env: EnvOverrides) -> Result<ClientConfig, ConfigError> {
    let mut config = ClientConfig::default();

    let api = file.api.unwrap_or_default();
    if let Some(raw) = env.api_url.or(api.base_url) {
        config.api.base_url = Url::parse(raw.trim())
            .map_err(|err| ConfigError::Invalid(format!("api base_url {raw:?}: {err}")))?;
        if !matches!(config.api.base_url.scheme(), "http" | "https") {
            return Err(ConfigError::Invalid(
                "api base_url must use http or https".to_string(),
            ));
        }
    }
    if let Some(secs) = api.timeout_secs {
        config.api.timeout = positive_secs("api timeout_secs", secs)?;
    }

    let cache = file.cache.unwrap_or_default();
    if let Some(secs) = cache.stale_time_secs {
        config.cache.stale_time = Duration::from_secs(secs);
    }
    if let Some(secs) = cache.gc_time_secs {
        config.cache.gc_time = Duration::from_secs(secs);
    }
    if let Some(retry) = cache.query_retry {
        config.cache.query_retry = retry;
    }
    if let Some(retry) = cache.mutation_retry {
        config.cache.mutation_retry = retry;
    }
    if let Some(secs) = cache.gc_interval_secs {
        config.gc_interval = positive_secs("cache gc_interval_secs", secs)?;
    }

    let persistence = file.persistence.unwrap_or_default();
    if let Some(secs) = persistence.max_age_secs {
        config.persistence.max_age = positive_secs("persistence max_age_secs", secs)?;
    }
    if let Some(ms) = persistence.debounce_ms {
        config.persistence.debounce = Duration::from_millis(ms);
    }
    if let Some(dir) = env.data_dir.or(persistence.data_dir) {
        let dir = dir.trim();
        if dir.is_empty() {
            return Err(ConfigError::Invalid("persistence data_dir is empty".to_string()));
        }
        config.data_dir = PathBuf::from(dir);
    }

    Ok(config)
}

fn positive_secs(field: &str, secs: u64) -> Result<Duration, ConfigError> {
    if secs == 0 {
        return Err(ConfigError::Invalid(format!("{field} must be greater than zero")));
    }
    Ok(Duration::from_secs(secs))
}

fn default_data_dir() -> PathBuf {
    match BaseDirs::new() {
        Some(base) => base.data_dir().join("liftsync"),
        None => PathBuf::from(".liftsync"),
    }
}

fn locate_config_file() -> Option<PathBuf> {
    liftsync_yaml_candidates()
        .into_iter()
        .find(|path| path.exists())
}

fn liftsync_yaml_candidates() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from("liftsync.yaml"), PathBuf::from("liftsync.yml")];
    if let Some(base) = BaseDirs::new() {
        let config_dir = base.config_dir().join("liftsync");
        paths.push(config_dir.join("liftsync.yaml"));
        paths.push(config_dir.join("liftsync.yml"));
        let home_dir = base.home_dir();
        paths.push(home_dir.join(".liftsync").join("liftsync.yaml"));
        paths.push(home_dir.join(".liftsync").join("liftsync.yml"));
    }
    paths
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    api: Option<ApiSection>,
    cache: Option<CacheSection>,
    persistence: Option<PersistenceSection>,
}

#[derive(Debug, Default, Deserialize)]
struct ApiSection {
    base_url: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct CacheSection {
    stale_time_secs: Option<u64>,
    gc_time_secs: Option<u64>,
    query_retry: Option<u32>,
    mutation_retry: Option<u32>,
    gc_interval_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct PersistenceSection {
    max_age_secs: Option<u64>,
    debounce_ms: Option<u64>,
    data_dir: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_resolves_to_defaults() {
        let file = ClientConfig::parse_file("{}").expect("parse");
        let config = resolve(file, EnvOverrides::default()).expect("resolve");
        assert_eq!(config.cache.stale_time, Duration::from_secs(300));
        assert_eq!(config.cache.gc_time, Duration::from_secs(86_400));
        assert_eq!(config.cache.query_retry, 2);
        assert_eq!(config.cache.mutation_retry, 1);
        assert_eq!(config.persistence.debounce, Duration::from_secs(1));
        assert_eq!(config.api.base_url.as_str(), DEFAULT_API_URL);
    }

    #[test]
    fn file_values_and_env_overrides_apply() {
        let file = ClientConfig::parse_file(
            r#"
api:
  base_url: https://staging.lift.app/v1/
  timeout_secs: 10
cache:
  stale_time_secs: 60
  query_retry: 4
persistence:
  debounce_ms: 250
  data_dir: /var/lib/lift
"#,
        )
        .expect("parse");
        let env = EnvOverrides {
            api_url: Some("http://localhost:8080/".into()),
            data_dir: None,
        };
        let config = resolve(file, env).expect("resolve");
        assert_eq!(config.api.base_url.as_str(), "http://localhost:8080/");
        assert_eq!(config.api.timeout, Duration::from_secs(10));
        assert_eq!(config.cache.stale_time, Duration::from_secs(60));
        assert_eq!(config.cache.query_retry, 4);
        assert_eq!(config.persistence.debounce, Duration::from_millis(250));
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/lift"));
    }

    #[test]
    fn rejects_bad_values() {
        let file = ClientConfig::parse_file("api:\n  base_url: ftp://files.example.com\n").unwrap();
        assert!(matches!(
            resolve(file, EnvOverrides::default()),
            Err(ConfigError::Invalid(_))
        ));

        let file = ClientConfig::parse_file("persistence:\n  max_age_secs: 0\n").unwrap();
        assert!(matches!(
            resolve(file, EnvOverrides::default()),
            Err(ConfigError::Invalid(_))
        ));

        assert!(ClientConfig::parse_file("cache: [1, 2").is_err());
    }

    #[test]
    fn missing_explicit_path_is_reported() {
        let err = ClientConfig::from_path(std::path::Path::new("/nonexistent/liftsync.yaml"))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Missing));
    }
}
