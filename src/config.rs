//! Configuration for agents and bureaus.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Error;
use crate::identity::{Address, KeyMaterial};
use crate::message::envelope::expiry_after;
use crate::transport::Endpoint;

pub type Result<T> = std::result::Result<T, Error>;

/// Get the tinybureau home directory (~/.tinybureau).
pub fn get_home_dir() -> Result<PathBuf> {
    let home = directories::UserDirs::new()
        .ok_or_else(|| Error::Config("Could not determine home directory".to_string()))?;

    Ok(home.home_dir().join(".tinybureau"))
}

/// Default directory for agent storage snapshots.
pub fn default_data_dir() -> Result<PathBuf> {
    Ok(get_home_dir()?.join("data"))
}

/// Load settings from a JSON file.
pub fn load_settings(path: impl AsRef<Path>) -> Result<Settings> {
    let path = path.as_ref();

    if !path.exists() {
        return Err(Error::Config(format!(
            "Settings file not found at {}",
            path.display()
        )));
    }

    let content = std::fs::read_to_string(path)?;
    let settings: Settings = serde_json::from_str(&content)?;

    validate_settings(&settings)?;

    tracing::debug!("Loaded settings from {}", path.display());
    Ok(settings)
}

/// Load settings or return default if not found.
pub fn load_settings_or_default(path: impl AsRef<Path>) -> Settings {
    load_settings(path).unwrap_or_else(|e| {
        tracing::warn!("Failed to load settings: {}, using defaults", e);
        Settings::default()
    })
}

pub fn validate_settings(settings: &Settings) -> Result<()> {
    let mut names = HashSet::new();
    let mut seeds = HashSet::new();
    for agent in &settings.agents {
        agent.validate()?;
        if let Some(name) = agent.name.as_deref() {
            if !names.insert(name) {
                return Err(Error::Config(format!("duplicate agent name '{}'", name)));
            }
        }
        if let Some(seed) = agent.seed.as_deref() {
            if !seeds.insert(seed) {
                return Err(Error::Config(format!(
                    "two agents share a seed (second one: '{}')",
                    agent.name.as_deref().unwrap_or("<unnamed>")
                )));
            }
        }
    }

    for entry in &settings.bureau.directory {
        entry.address.parse::<Address>().map_err(|e| {
            Error::Config(format!("directory entry '{}': {}", entry.address, e))
        })?;
    }

    Ok(())
}

/// Storage backend kind.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    #[default]
    Json,
    Sqlite,
    Memory,
}

/// Storage configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct StorageConfig {
    #[serde(default)]
    pub kind: StorageKind,
    pub data_dir: Option<PathBuf>,
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,
}

fn default_flush_interval_secs() -> u64 {
    30
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            kind: StorageKind::default(),
            data_dir: None,
            flush_interval_secs: default_flush_interval_secs(),
        }
    }
}

impl StorageConfig {
    pub fn memory() -> Self {
        Self {
            kind: StorageKind::Memory,
            ..Default::default()
        }
    }

    pub fn resolve_data_dir(&self) -> Result<PathBuf> {
        match &self.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => default_data_dir(),
        }
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs.max(1))
    }
}

/// Agent construction options.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct AgentConfig {
    /// Display/logging label; derived from the address when absent.
    pub name: Option<String>,

    /// Deterministic identity seed; a random key is generated when absent.
    pub seed: Option<String>,

    /// Externally advertised submit URL.
    pub endpoint: Option<String>,

    /// Local listen port when the agent runs standalone.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Mailbox relay base URL; enables relay mode instead of direct listening.
    pub mailbox: Option<String>,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,

    /// Lifetime of outbound envelopes; no expiry when absent.
    pub envelope_ttl_secs: Option<u64>,

    #[serde(default = "default_mailbox_poll_secs")]
    pub mailbox_poll_secs: u64,

    #[serde(default = "default_inbox_capacity")]
    pub inbox_capacity: usize,
}

fn default_port() -> u16 {
    8000
}

fn default_send_timeout_ms() -> u64 {
    5000
}

fn default_mailbox_poll_secs() -> u64 {
    5
}

fn default_inbox_capacity() -> usize {
    256
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: None,
            seed: None,
            endpoint: None,
            port: default_port(),
            mailbox: None,
            storage: StorageConfig::default(),
            send_timeout_ms: default_send_timeout_ms(),
            envelope_ttl_secs: None,
            mailbox_poll_secs: default_mailbox_poll_secs(),
            inbox_capacity: default_inbox_capacity(),
        }
    }
}

impl AgentConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn with_seed(mut self, seed: impl Into<String>) -> Self {
        self.seed = Some(seed.into());
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_mailbox(mut self, relay_url: impl Into<String>) -> Self {
        self.mailbox = Some(relay_url.into());
        self
    }

    pub fn with_storage(mut self, storage: StorageConfig) -> Self {
        self.storage = storage;
        self
    }

    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn key_material(&self) -> KeyMaterial {
        match &self.seed {
            Some(seed) => KeyMaterial::Seed(seed.clone()),
            None => KeyMaterial::Random,
        }
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn mailbox_poll_interval(&self) -> Duration {
        Duration::from_secs(self.mailbox_poll_secs.max(1))
    }

    pub fn validate(&self) -> Result<()> {
        if self.send_timeout_ms == 0 {
            return Err(Error::Config("send_timeout_ms must be greater than zero".to_string()));
        }
        if self.inbox_capacity == 0 {
            return Err(Error::Config("inbox_capacity must be greater than zero".to_string()));
        }
        if let Some(seed) = &self.seed {
            if seed.is_empty() {
                return Err(Error::Config("seed must not be empty".to_string()));
            }
        }
        if let Some(ttl) = self.envelope_ttl_secs {
            if expiry_after(ttl).is_none() {
                return Err(Error::Config(format!("envelope_ttl_secs of {} is out of range", ttl)));
            }
        }
        Ok(())
    }
}

/// Static directory entry: where to reach a remote agent.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct DirectoryEntry {
    pub address: String,
    pub endpoint: Endpoint,
}

/// Bureau configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct BureauConfig {
    #[serde(default = "default_host")]
    pub host: String,

    /// Listen port; no inbound listener when absent.
    pub port: Option<u16>,

    /// Externally advertised submit URL.
    pub endpoint: Option<String>,

    /// Serve the mailbox relay endpoints.
    #[serde(default)]
    pub relay: bool,

    /// Persistence directory for relayed mailboxes.
    pub relay_dir: Option<PathBuf>,

    #[serde(default = "default_submit_timeout_ms")]
    pub submit_timeout_ms: u64,

    #[serde(default)]
    pub directory: Vec<DirectoryEntry>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_submit_timeout_ms() -> u64 {
    1000
}

impl Default for BureauConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: None,
            endpoint: None,
            relay: false,
            relay_dir: None,
            submit_timeout_ms: default_submit_timeout_ms(),
            directory: Vec::new(),
        }
    }
}

impl BureauConfig {
    pub fn listening(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port: Some(port),
            ..Default::default()
        }
    }

    pub fn submit_timeout(&self) -> Duration {
        Duration::from_millis(self.submit_timeout_ms)
    }
}

/// tinybureau settings file.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Settings {
    #[serde(default)]
    pub bureau: BureauConfig,

    #[serde(default)]
    pub agents: Vec<AgentConfig>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;

    #[test]
    fn test_defaults_applied() {
        let settings: Settings = serde_json::from_str(
            r#"{
                "bureau": { "port": 8100 },
                "agents": [ { "name": "alice", "seed": "alice seed" } ]
            }"#,
        )
        .unwrap();

        assert_eq!(settings.bureau.host, "0.0.0.0");
        assert_eq!(settings.bureau.port, Some(8100));
        assert!(!settings.bureau.relay);
        let alice = &settings.agents[0];
        assert_eq!(alice.port, 8000);
        assert_eq!(alice.send_timeout_ms, 5000);
        assert_eq!(alice.storage.kind, StorageKind::Json);
        assert_eq!(alice.storage.flush_interval_secs, 30);
        assert!(matches!(alice.key_material(), KeyMaterial::Seed(_)));
    }

    #[test]
    fn test_load_settings_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("settings.json");
        let remote = Identity::from_seed("remote").unwrap().address();
        std::fs::write(
            &path,
            format!(
                r#"{{
                    "bureau": {{
                        "relay": true,
                        "directory": [
                            {{ "address": "{}", "endpoint": {{ "kind": "direct", "url": "http://10.0.0.2:8000/submit" }} }}
                        ]
                    }},
                    "agents": [ {{ "name": "a", "storage": {{ "kind": "sqlite" }} }} ]
                }}"#,
                remote
            ),
        )
        .unwrap();

        let settings = load_settings(&path).unwrap();
        assert!(settings.bureau.relay);
        assert_eq!(
            settings.bureau.directory[0].endpoint,
            Endpoint::Direct("http://10.0.0.2:8000/submit".to_string())
        );
        assert_eq!(settings.agents[0].storage.kind, StorageKind::Sqlite);
    }

    #[test]
    fn test_missing_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("absent.json");
        assert!(matches!(load_settings(&path), Err(Error::Config(_))));
        assert!(load_settings_or_default(&path).agents.is_empty());
    }

    #[test]
    fn test_envelope_ttl_range() {
        let mut config = AgentConfig::new("a");
        config.envelope_ttl_secs = Some(u64::MAX);
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        config.envelope_ttl_secs = Some(1 << 62);
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        config.envelope_ttl_secs = Some(3600);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        let mut settings = Settings::default();
        settings.agents.push(AgentConfig::new("a").with_seed("same"));
        settings.agents.push(AgentConfig::new("b").with_seed("same"));
        assert!(matches!(validate_settings(&settings), Err(Error::Config(_))));

        let mut settings = Settings::default();
        settings.agents.push(AgentConfig::new("a"));
        settings.agents.push(AgentConfig::new("a"));
        assert!(matches!(validate_settings(&settings), Err(Error::Config(_))));

        let mut settings = Settings::default();
        settings.bureau.directory.push(DirectoryEntry {
            address: "nobody".to_string(),
            endpoint: Endpoint::Mailbox("http://relay".to_string()),
        });
        assert!(matches!(validate_settings(&settings), Err(Error::Config(_))));

        let mut config = AgentConfig::new("zero");
        config.send_timeout_ms = 0;
        assert!(config.validate().is_err());
    }
}
