use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;

/// Collector settings, layered file -> environment. Environment wins.
#[derive(Clone, Debug, Deserialize)]
pub struct CollectorConfig {
    pub listen_addr: String,
    pub database_url: String,
    pub consensus_threshold: usize,
}

impl CollectorConfig {
    pub fn load(config_path: Option<&str>) -> Result<Self, String> {
        let mut partial: PartialCollectorConfig = if let Some(path_str) = config_path {
            let path = Path::new(path_str);
            let contents = fs::read_to_string(path)
                .map_err(|e| format!("Failed to read config file at {path:?}: {e}"))?;
            toml::from_str(&contents)
                .map_err(|e| format!("Failed to parse TOML from config file at {path:?}: {e}"))?
        } else {
            PartialCollectorConfig::default()
        };

        if let Ok(val) = env::var("SENTINEL_LISTEN_ADDR") {
            partial.listen_addr = Some(val);
        }
        if let Ok(val) = env::var("DATABASE_URL") {
            partial.database_url = Some(val);
        }
        if let Ok(val) = env::var("SENTINEL_CONSENSUS_THRESHOLD") {
            let parsed = val
                .parse::<usize>()
                .map_err(|e| format!("Invalid SENTINEL_CONSENSUS_THRESHOLD: {e}"))?;
            partial.consensus_threshold = Some(parsed);
        }

        partial.try_into()
    }
}

#[derive(Deserialize, Default)]
struct PartialCollectorConfig {
    listen_addr: Option<String>,
    database_url: Option<String>,
    consensus_threshold: Option<usize>,
}

impl TryFrom<PartialCollectorConfig> for CollectorConfig {
    type Error = String;

    fn try_from(partial: PartialCollectorConfig) -> Result<Self, Self::Error> {
        let consensus_threshold = partial.consensus_threshold.unwrap_or(2);
        if consensus_threshold == 0 {
            return Err("`consensus_threshold` must be at least 1".to_string());
        }
        Ok(CollectorConfig {
            listen_addr: partial
                .listen_addr
                .unwrap_or_else(|| "0.0.0.0:3001".to_string()),
            database_url: partial.database_url.ok_or_else(|| {
                "Missing required config: `database_url` or `DATABASE_URL`".to_string()
            })?,
            consensus_threshold,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_optional_fields() {
        let partial = PartialCollectorConfig {
            listen_addr: None,
            database_url: Some("postgres://localhost/sentinel".to_string()),
            consensus_threshold: None,
        };
        let config: CollectorConfig = partial.try_into().unwrap();
        assert_eq!(config.listen_addr, "0.0.0.0:3001");
        assert_eq!(config.consensus_threshold, 2);
    }

    #[test]
    fn database_url_is_required() {
        let partial = PartialCollectorConfig::default();
        let result: Result<CollectorConfig, _> = partial.try_into();
        assert!(result.unwrap_err().contains("DATABASE_URL"));
    }

    #[test]
    fn zero_threshold_is_rejected() {
        let partial = PartialCollectorConfig {
            listen_addr: None,
            database_url: Some("postgres://localhost/sentinel".to_string()),
            consensus_threshold: Some(0),
        };
        let result: Result<CollectorConfig, _> = partial.try_into();
        assert!(result.is_err());
    }
}
