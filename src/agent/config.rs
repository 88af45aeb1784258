use serde::Deserialize;
use std::env;
use std::fmt::Display;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Agent settings, layered file -> environment. Environment wins. The three
/// identity fields are required; everything else has a default.
#[derive(Clone, Debug, Deserialize)]
pub struct AgentConfig {
    pub agent_id: String,
    pub agent_api_key: String,
    pub validator_id: String,
    pub backend_api_url: String,
    pub beacon_node_url: String,
    pub health_check_interval_ms: u64,
    pub health_check_timeout_ms: u64,
    pub health_check_retries: u32,
    pub p2p_enabled: bool,
    pub p2p_port: u16,
    pub p2p_discovery_interval_ms: u64,
    pub p2p_bootstrap_peers: Vec<String>,
    pub consensus_threshold: usize,
    pub consensus_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub max_retries: u32,
}

impl AgentConfig {
    pub fn load(config_path: Option<&str>) -> Result<Self, String> {
        let mut partial: PartialAgentConfig = if let Some(path_str) = config_path {
            let path = Path::new(path_str);
            let contents = fs::read_to_string(path)
                .map_err(|e| format!("Failed to read config file at {path:?}: {e}"))?;
            toml::from_str(&contents)
                .map_err(|e| format!("Failed to parse TOML from config file at {path:?}: {e}"))?
        } else {
            PartialAgentConfig::default()
        };

        if let Ok(val) = env::var("SENTINEL_AGENT_ID") {
            partial.agent_id = Some(val);
        }
        if let Ok(val) = env::var("SENTINEL_AGENT_API_KEY") {
            partial.agent_api_key = Some(val);
        }
        if let Ok(val) = env::var("SENTINEL_VALIDATOR_ID") {
            partial.validator_id = Some(val);
        }
        if let Ok(val) = env::var("SENTINEL_BACKEND_API_URL") {
            partial.backend_api_url = Some(val);
        }
        if let Ok(val) = env::var("SENTINEL_BEACON_NODE_URL") {
            partial.beacon_node_url = Some(val);
        }
        if let Ok(val) = env::var("SENTINEL_P2P_BOOTSTRAP_PEERS") {
            partial.p2p_bootstrap_peers = Some(
                val.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect(),
            );
        }
        partial.health_check_interval_ms =
            env_parsed("SENTINEL_HEALTH_CHECK_INTERVAL_MS")?.or(partial.health_check_interval_ms);
        partial.health_check_timeout_ms =
            env_parsed("SENTINEL_HEALTH_CHECK_TIMEOUT_MS")?.or(partial.health_check_timeout_ms);
        partial.health_check_retries =
            env_parsed("SENTINEL_HEALTH_CHECK_RETRIES")?.or(partial.health_check_retries);
        partial.p2p_enabled = env_parsed("SENTINEL_P2P_ENABLED")?.or(partial.p2p_enabled);
        partial.p2p_port = env_parsed("SENTINEL_P2P_PORT")?.or(partial.p2p_port);
        partial.p2p_discovery_interval_ms =
            env_parsed("SENTINEL_P2P_DISCOVERY_INTERVAL_MS")?.or(partial.p2p_discovery_interval_ms);
        partial.consensus_threshold =
            env_parsed("SENTINEL_CONSENSUS_THRESHOLD")?.or(partial.consensus_threshold);
        partial.consensus_timeout_ms =
            env_parsed("SENTINEL_CONSENSUS_TIMEOUT_MS")?.or(partial.consensus_timeout_ms);
        partial.request_timeout_ms =
            env_parsed("SENTINEL_REQUEST_TIMEOUT_MS")?.or(partial.request_timeout_ms);
        partial.max_retries = env_parsed("SENTINEL_MAX_RETRIES")?.or(partial.max_retries);

        partial.try_into()
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_millis(self.health_check_timeout_ms)
    }

    pub fn p2p_discovery_interval(&self) -> Duration {
        Duration::from_millis(self.p2p_discovery_interval_ms)
    }

    pub fn consensus_timeout(&self) -> Duration {
        Duration::from_millis(self.consensus_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

fn env_parsed<T: FromStr>(name: &str) -> Result<Option<T>, String>
where
    T::Err: Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|e| format!("Invalid {name}: {e}")),
        Err(_) => Ok(None),
    }
}

#[derive(Deserialize, Default)]
struct PartialAgentConfig {
    agent_id: Option<String>,
    agent_api_key: Option<String>,
    validator_id: Option<String>,
    backend_api_url: Option<String>,
    beacon_node_url: Option<String>,
    health_check_interval_ms: Option<u64>,
    health_check_timeout_ms: Option<u64>,
    health_check_retries: Option<u32>,
    p2p_enabled: Option<bool>,
    p2p_port: Option<u16>,
    p2p_discovery_interval_ms: Option<u64>,
    p2p_bootstrap_peers: Option<Vec<String>>,
    consensus_threshold: Option<usize>,
    consensus_timeout_ms: Option<u64>,
    request_timeout_ms: Option<u64>,
    max_retries: Option<u32>,
}

impl TryFrom<PartialAgentConfig> for AgentConfig {
    type Error = String;

    fn try_from(partial: PartialAgentConfig) -> Result<Self, Self::Error> {
        let p2p_port = partial.p2p_port.unwrap_or(3003);
        if p2p_port < 1024 {
            return Err(format!(
                "`p2p_port` must be between 1024 and 65535, got {p2p_port}"
            ));
        }
        let consensus_threshold = partial.consensus_threshold.unwrap_or(2);
        if consensus_threshold == 0 {
            return Err("`consensus_threshold` must be at least 1".to_string());
        }
        let health_check_retries = partial.health_check_retries.unwrap_or(3);
        if health_check_retries == 0 {
            return Err("`health_check_retries` must be at least 1".to_string());
        }

        Ok(AgentConfig {
            agent_id: partial
                .agent_id
                .ok_or_else(|| "Missing required config: `agent_id` or SENTINEL_AGENT_ID".to_string())?,
            agent_api_key: partial.agent_api_key.ok_or_else(|| {
                "Missing required config: `agent_api_key` or SENTINEL_AGENT_API_KEY".to_string()
            })?,
            validator_id: partial.validator_id.ok_or_else(|| {
                "Missing required config: `validator_id` or SENTINEL_VALIDATOR_ID".to_string()
            })?,
            backend_api_url: partial
                .backend_api_url
                .unwrap_or_else(|| "http://localhost:3001".to_string()),
            beacon_node_url: partial
                .beacon_node_url
                .unwrap_or_else(|| "http://localhost:5052".to_string()),
            health_check_interval_ms: partial.health_check_interval_ms.unwrap_or(30_000),
            health_check_timeout_ms: partial.health_check_timeout_ms.unwrap_or(10_000),
            health_check_retries,
            p2p_enabled: partial.p2p_enabled.unwrap_or(false),
            p2p_port,
            p2p_discovery_interval_ms: partial.p2p_discovery_interval_ms.unwrap_or(60_000),
            p2p_bootstrap_peers: partial.p2p_bootstrap_peers.unwrap_or_default(),
            consensus_threshold,
            consensus_timeout_ms: partial.consensus_timeout_ms.unwrap_or(120_000),
            request_timeout_ms: partial.request_timeout_ms.unwrap_or(10_000),
            max_retries: partial.max_retries.unwrap_or(3),
        })
    }
}
