use std::time::Duration;

use serde::{Deserialize, Serialize};

use miko_gateway::processor::StreamSettings;
use miko_gateway::server::ConnectionSettings;

// ── Default helper functions ────────────────────────────────────────────────

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8910
}

fn default_auth_deadline_secs() -> u64 {
    30
}

fn default_ping_interval_secs() -> u64 {
    30
}

fn default_pong_timeout_secs() -> u64 {
    10
}

fn default_inactivity_timeout_secs() -> u64 {
    300
}

fn default_max_error_tolerance() -> u32 {
    5
}

fn default_error_backoff_ms() -> u64 {
    500
}

fn default_queue_capacity() -> usize {
    100
}

fn default_min_chunk_len() -> usize {
    10
}

fn default_interrupt_wait_ms() -> u64 {
    1_000
}

fn default_cleanup_ttl_secs() -> u64 {
    3_600
}

fn default_normalizer_rules() -> Vec<NormalizerRuleConfig> {
    miko_gateway::normalizer::default_rules()
        .into_iter()
        .map(|(pattern, replacement)| NormalizerRuleConfig {
            pattern,
            replacement,
        })
        .collect()
}

fn default_agent_base_url() -> String {
    "http://127.0.0.1:8000/v1".to_string()
}

fn default_agent_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_agent_buffer() -> usize {
    32
}

fn default_tts_base_url() -> String {
    "http://127.0.0.1:8930".to_string()
}

fn default_vlm_base_url() -> String {
    "http://127.0.0.1:8940".to_string()
}

fn default_stm_base_url() -> String {
    "http://127.0.0.1:8950".to_string()
}

fn default_ltm_base_url() -> String {
    "http://127.0.0.1:8960".to_string()
}

fn default_backgrounds_dir() -> String {
    "./assets/backgrounds".to_string()
}

fn default_avatar_configs_dir() -> String {
    "./assets/avatars".to_string()
}

fn default_active_model() -> String {
    "shizuku".to_string()
}

fn default_log_filter() -> String {
    "info".to_string()
}

// ── Sub-config structs ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuthConfig {
    /// Accepted tokens. Empty means any non-empty token authenticates.
    #[serde(default)]
    pub tokens: Vec<String>,
    #[serde(default = "default_auth_deadline_secs")]
    pub auth_deadline_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            tokens: Vec::new(),
            auth_deadline_secs: default_auth_deadline_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HeartbeatConfig {
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
    #[serde(default = "default_pong_timeout_secs")]
    pub pong_timeout_secs: u64,
    #[serde(default = "default_inactivity_timeout_secs")]
    pub inactivity_timeout_secs: u64,
    #[serde(default = "default_max_error_tolerance")]
    pub max_error_tolerance: u32,
    #[serde(default = "default_error_backoff_ms")]
    pub error_backoff_ms: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ping_interval_secs: default_ping_interval_secs(),
            pong_timeout_secs: default_pong_timeout_secs(),
            inactivity_timeout_secs: default_inactivity_timeout_secs(),
            max_error_tolerance: default_max_error_tolerance(),
            error_backoff_ms: default_error_backoff_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamingConfig {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_min_chunk_len")]
    pub min_chunk_len: usize,
    #[serde(default = "default_interrupt_wait_ms")]
    pub interrupt_wait_ms: u64,
    #[serde(default = "default_cleanup_ttl_secs")]
    pub cleanup_ttl_secs: u64,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            min_chunk_len: default_min_chunk_len(),
            interrupt_wait_ms: default_interrupt_wait_ms(),
            cleanup_ttl_secs: default_cleanup_ttl_secs(),
        }
    }
}

/// One sentence-cleanup rule, applied in file order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NormalizerRuleConfig {
    pub pattern: String,
    #[serde(default)]
    pub replacement: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NormalizerConfig {
    #[serde(default = "default_normalizer_rules")]
    pub rules: Vec<NormalizerRuleConfig>,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            rules: default_normalizer_rules(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentConfig {
    /// OpenAI-compatible chat completions endpoint base URL.
    #[serde(default = "default_agent_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_agent_model")]
    pub model: String,
    pub persona: Option<String>,
    /// Buffer capacity of the agent event channel.
    #[serde(default = "default_agent_buffer")]
    pub stream_buffer: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            base_url: default_agent_base_url(),
            api_key: String::new(),
            model: default_agent_model(),
            persona: None,
            stream_buffer: default_agent_buffer(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TtsConfig {
    #[serde(default = "default_tts_base_url")]
    pub base_url: String,
    pub voice: Option<String>,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            base_url: default_tts_base_url(),
            voice: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VlmConfig {
    #[serde(default = "default_vlm_base_url")]
    pub base_url: String,
}

impl Default for VlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_vlm_base_url(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemoryConfig {
    #[serde(default = "default_stm_base_url")]
    pub stm_base_url: String,
    #[serde(default = "default_ltm_base_url")]
    pub ltm_base_url: String,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            stm_base_url: default_stm_base_url(),
            ltm_base_url: default_ltm_base_url(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssetsConfig {
    #[serde(default = "default_backgrounds_dir")]
    pub backgrounds_dir: String,
    #[serde(default = "default_avatar_configs_dir")]
    pub avatar_configs_dir: String,
    /// Model name reported alongside avatar config switches.
    #[serde(default = "default_active_model")]
    pub active_model: String,
}

impl Default for AssetsConfig {
    fn default() -> Self {
        Self {
            backgrounds_dir: default_backgrounds_dir(),
            avatar_configs_dir: default_avatar_configs_dir(),
            active_model: default_active_model(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogConfig {
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

// ── Top-level config ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct MikoConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub streaming: StreamingConfig,
    #[serde(default)]
    pub normalizer: NormalizerConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub tts: TtsConfig,
    #[serde(default)]
    pub vlm: VlmConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub assets: AssetsConfig,
    #[serde(default)]
    pub log: LogConfig,
}

impl MikoConfig {
    /// Load configuration from a TOML file at the given path.
    /// Missing fields use documented defaults. Unknown fields are ignored.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file '{}': {}", path, e))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse TOML config '{}': {}", path, e))?;
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(toml_str)
    }

    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            auth_deadline: Duration::from_secs(self.auth.auth_deadline_secs),
            ping_interval: Duration::from_secs(self.heartbeat.ping_interval_secs),
            pong_timeout: Duration::from_secs(self.heartbeat.pong_timeout_secs),
            inactivity_timeout: Duration::from_secs(self.heartbeat.inactivity_timeout_secs),
            max_error_tolerance: self.heartbeat.max_error_tolerance,
            error_backoff: Duration::from_millis(self.heartbeat.error_backoff_ms),
        }
    }

    pub fn stream_settings(&self) -> StreamSettings {
        StreamSettings {
            queue_capacity: self.streaming.queue_capacity,
            min_chunk_len: self.streaming.min_chunk_len,
            interrupt_wait: Duration::from_millis(self.streaming.interrupt_wait_ms),
            cleanup_ttl: Duration::from_secs(self.streaming.cleanup_ttl_secs),
        }
    }

    pub fn normalizer_rules(&self) -> Vec<(String, String)> {
        self.normalizer
            .rules
            .iter()
            .map(|rule| (rule.pattern.clone(), rule.replacement.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let cfg = MikoConfig::default();

        assert_eq!(cfg.server.host, "127.0.0.1");
        assert_eq!(cfg.server.port, 8910);

        assert!(cfg.auth.tokens.is_empty());
        assert_eq!(cfg.auth.auth_deadline_secs, 30);

        assert_eq!(cfg.heartbeat.ping_interval_secs, 30);
        assert_eq!(cfg.heartbeat.pong_timeout_secs, 10);
        assert_eq!(cfg.heartbeat.inactivity_timeout_secs, 300);
        assert_eq!(cfg.heartbeat.max_error_tolerance, 5);
        assert_eq!(cfg.heartbeat.error_backoff_ms, 500);

        assert_eq!(cfg.streaming.queue_capacity, 100);
        assert_eq!(cfg.streaming.min_chunk_len, 10);
        assert_eq!(cfg.streaming.interrupt_wait_ms, 1_000);
        assert_eq!(cfg.streaming.cleanup_ttl_secs, 3_600);

        assert!(!cfg.normalizer.rules.is_empty());

        assert_eq!(cfg.agent.base_url, "http://127.0.0.1:8000/v1");
        assert_eq!(cfg.agent.model, "gpt-4o-mini");
        assert_eq!(cfg.agent.persona, None);
        assert_eq!(cfg.agent.stream_buffer, 32);

        assert_eq!(cfg.tts.base_url, "http://127.0.0.1:8930");
        assert_eq!(cfg.vlm.base_url, "http://127.0.0.1:8940");
        assert_eq!(cfg.memory.stm_base_url, "http://127.0.0.1:8950");
        assert_eq!(cfg.memory.ltm_base_url, "http://127.0.0.1:8960");

        assert_eq!(cfg.assets.backgrounds_dir, "./assets/backgrounds");
        assert_eq!(cfg.assets.avatar_configs_dir, "./assets/avatars");
        assert_eq!(cfg.assets.active_model, "shizuku");

        assert_eq!(cfg.log.filter, "info");
    }

    #[test]
    fn test_settings_conversions() {
        let cfg = MikoConfig::default();

        let conn = cfg.connection_settings();
        assert_eq!(conn.auth_deadline, Duration::from_secs(30));
        assert_eq!(conn.ping_interval, Duration::from_secs(30));
        assert_eq!(conn.pong_timeout, Duration::from_secs(10));
        assert_eq!(conn.inactivity_timeout, Duration::from_secs(300));
        assert_eq!(conn.max_error_tolerance, 5);
        assert_eq!(conn.error_backoff, Duration::from_millis(500));

        let stream = cfg.stream_settings();
        assert_eq!(stream.queue_capacity, 100);
        assert_eq!(stream.min_chunk_len, 10);
        assert_eq!(stream.interrupt_wait, Duration::from_secs(1));
        assert_eq!(stream.cleanup_ttl, Duration::from_secs(3_600));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let toml_str = r#"
[server]
port = 9999

[streaming]
queue_capacity = 8
"#;
        let cfg = MikoConfig::from_toml(toml_str).expect("parse partial");

        assert_eq!(cfg.server.port, 9999);
        assert_eq!(cfg.streaming.queue_capacity, 8);

        assert_eq!(cfg.server.host, "127.0.0.1");
        assert_eq!(cfg.streaming.min_chunk_len, 10);
        assert_eq!(cfg.heartbeat.ping_interval_secs, 30);
        assert_eq!(cfg.agent.model, "gpt-4o-mini");
    }

    #[test]
    fn test_empty_toml_uses_all_defaults() {
        let cfg = MikoConfig::from_toml("").expect("parse empty");
        assert_eq!(cfg, MikoConfig::default());
    }

    #[test]
    fn test_invalid_toml_returns_error() {
        assert!(MikoConfig::from_toml("not [valid toml }{").is_err());
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let toml_str = r#"
[server]
host = "10.0.0.1"
what_is_this = "ignored"

[future_section]
foo = "bar"
"#;
        let cfg = MikoConfig::from_toml(toml_str).expect("parse with unknown fields");
        assert_eq!(cfg.server.host, "10.0.0.1");
    }

    #[test]
    fn test_normalizer_rules_from_toml() {
        let toml_str = r#"
[[normalizer.rules]]
pattern = "uh+"
replacement = ""

[[normalizer.rules]]
pattern = "\\s{2,}"
replacement = " "
"#;
        let cfg = MikoConfig::from_toml(toml_str).expect("parse rules");
        assert_eq!(cfg.normalizer.rules.len(), 2);
        assert_eq!(cfg.normalizer.rules[0].pattern, "uh+");
        assert_eq!(cfg.normalizer.rules[1].replacement, " ");

        let rules = cfg.normalizer_rules();
        assert_eq!(rules[0], ("uh+".to_string(), String::new()));
    }

    #[test]
    fn test_toml_round_trip() {
        let mut cfg = MikoConfig::default();
        cfg.server.port = 9001;
        cfg.auth.tokens = vec!["secret-1".to_string()];
        cfg.agent.persona = Some("gentle and curious".to_string());
        cfg.assets.active_model = "mio".to_string();

        let toml_str = toml::to_string(&cfg).expect("serialize");
        let parsed: MikoConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(cfg, parsed);
    }

    #[test]
    fn test_load_nonexistent_file_returns_error() {
        assert!(MikoConfig::load("/nonexistent/path/miko.toml").is_err());
    }
}
