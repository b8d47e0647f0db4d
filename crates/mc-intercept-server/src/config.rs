use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use mc_intercept_proto::PacketType;
use mc_intercept_script::ScriptLimits;
use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
pub struct InterceptConfig {
    #[serde(default)]
    pub proxy: ProxySection,
    #[serde(default)]
    pub logging: LoggingSection,
    #[serde(default)]
    pub limits: LimitsSection,
    #[serde(default)]
    pub history: HistorySection,
    #[serde(default)]
    pub scripts: ScriptsSection,
    #[serde(default)]
    pub diagnostics: DiagnosticsSection,
}

#[derive(Debug, Deserialize)]
pub struct ProxySection {
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Game server the proxy forwards to. Must run in offline mode.
    #[serde(default = "default_backend")]
    pub backend: String,
    /// Largest frame accepted from either side, in bytes.
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
}

fn default_listen() -> String {
    "0.0.0.0:25565".into()
}

fn default_backend() -> String {
    "127.0.0.1:25566".into()
}

fn default_max_frame_size() -> usize {
    2 * 1024 * 1024
}

impl Default for ProxySection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            backend: default_backend(),
            max_frame_size: default_max_frame_size(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_level")]
    pub level: String,
}

fn default_level() -> String {
    "info".into()
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_level(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LimitsSection {
    /// When false the built-in limits are switched off; `per_second` still applies.
    #[serde(default = "default_true")]
    pub defaults: bool,
    /// Packet type name to maximum packets per second. 0 removes the limit.
    #[serde(default)]
    pub per_second: BTreeMap<String, u32>,
}

fn default_true() -> bool {
    true
}

impl Default for LimitsSection {
    fn default() -> Self {
        Self {
            defaults: true,
            per_second: BTreeMap::new(),
        }
    }
}

impl LimitsSection {
    /// Resolve `per_second` keys. Unknown names are returned separately.
    pub fn resolve(&self) -> (Vec<(PacketType, u32)>, Vec<String>) {
        let mut limits = Vec::new();
        let mut unknown = Vec::new();
        for (name, max) in &self.per_second {
            match PacketType::from_name(name) {
                Some(t) => limits.push((t, *max)),
                None => unknown.push(name.clone()),
            }
        }
        (limits, unknown)
    }
}

#[derive(Debug, Deserialize)]
pub struct HistorySection {
    #[serde(default = "default_capacity")]
    pub capacity: usize,
}

fn default_capacity() -> usize {
    100
}

impl Default for HistorySection {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ScriptsSection {
    /// Every `*.lua` file here is loaded as a filter at startup.
    #[serde(default = "default_scripts_directory")]
    pub directory: PathBuf,
    #[serde(default)]
    pub limits: ScriptLimits,
}

fn default_scripts_directory() -> PathBuf {
    "filters".into()
}

impl Default for ScriptsSection {
    fn default() -> Self {
        Self {
            directory: default_scripts_directory(),
            limits: ScriptLimits::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct DiagnosticsSection {
    #[serde(default)]
    pub debug: bool,
    #[serde(default = "default_pcap_directory")]
    pub pcap_directory: PathBuf,
    #[serde(default)]
    pub webhook_url: Option<String>,
    /// Packet type names posted to the webhook.
    #[serde(default)]
    pub webhook_types: Vec<String>,
}

fn default_pcap_directory() -> PathBuf {
    "captures".into()
}

impl Default for DiagnosticsSection {
    fn default() -> Self {
        Self {
            debug: false,
            pcap_directory: default_pcap_directory(),
            webhook_url: None,
            webhook_types: Vec::new(),
        }
    }
}

impl InterceptConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config: InterceptConfig = toml::from_str("").unwrap();
        assert_eq!(config.proxy.listen, "0.0.0.0:25565");
        assert_eq!(config.proxy.backend, "127.0.0.1:25566");
        assert_eq!(config.proxy.max_frame_size, 2 * 1024 * 1024);
        assert_eq!(config.logging.level, "info");
        assert!(config.limits.defaults);
        assert!(config.limits.per_second.is_empty());
        assert_eq!(config.history.capacity, 100);
        assert_eq!(config.scripts.directory, PathBuf::from("filters"));
        assert_eq!(config.scripts.limits.instruction_limit, 1_000_000);
        assert!(!config.diagnostics.debug);
        assert_eq!(config.diagnostics.pcap_directory, PathBuf::from("captures"));
        assert!(config.diagnostics.webhook_url.is_none());
    }

    #[test]
    fn parse_full_config() {
        let toml_str = r#"
            [proxy]
            listen = "127.0.0.1:25500"
            backend = "10.0.0.2:25565"

            [logging]
            level = "debug"

            [limits]
            defaults = false
            per_second = { PLAY_CLIENT_CHAT = 5, NOT_A_PACKET = 1 }

            [history]
            capacity = 20

            [scripts]
            directory = "scripts"
            limits = { memory_mb = 4 }

            [diagnostics]
            debug = true
            webhook_url = "http://localhost:9000/hook"
            webhook_types = ["PLAY_CLIENT_CHAT"]
        "#;
        let config: InterceptConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.proxy.listen, "127.0.0.1:25500");
        assert_eq!(config.proxy.max_frame_size, 2 * 1024 * 1024);
        assert_eq!(config.logging.level, "debug");
        assert!(!config.limits.defaults);
        assert_eq!(config.history.capacity, 20);
        assert_eq!(config.scripts.limits.memory_mb, 4);
        assert_eq!(config.scripts.limits.instruction_limit, 1_000_000);
        assert!(config.diagnostics.debug);
        assert_eq!(
            config.diagnostics.webhook_url.as_deref(),
            Some("http://localhost:9000/hook")
        );

        let (limits, unknown) = config.limits.resolve();
        assert_eq!(limits, vec![(PacketType::PlayClientChat, 5)]);
        assert_eq!(unknown, vec!["NOT_A_PACKET".to_string()]);
    }
}
