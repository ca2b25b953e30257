use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

use crate::error::{CoreResult, GatewayError};
use crate::model::RequestDefaults;

/// Environment variable overriding `upstream.base_url`.
pub const ENV_BASE_URL: &str = "LMSTUDIO_BASE_URL";
/// Environment variable overriding `upstream.default_model`.
pub const ENV_MODEL_NAME: &str = "MODEL_NAME";

fn default_base_url() -> String {
    "http://127.0.0.1:1234/v1".into()
}
fn default_model() -> String {
    "qwen/qwen3-coder-30b".into()
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct UpstreamCfg {
    /// OpenAI-compatible base URL, including the version prefix (e.g. `/v1`).
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub default_model: String,
    /// Name of the environment variable holding the bearer token.
    /// Local backends ignore it; `lm-studio` is sent when unset.
    #[serde(default)]
    pub api_key_env: Option<String>,
}

impl Default for UpstreamCfg {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            default_model: default_model(),
            api_key_env: None,
        }
    }
}

fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> Option<u32> {
    Some(1000)
}
fn default_top_p() -> f32 {
    1.0
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct DefaultsCfg {
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: Option<u32>,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
}

impl Default for DefaultsCfg {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            top_p: default_top_p(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0:8000".into()
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ServerCfg {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerCfg {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
pub struct RelayCfg {
    /// Forward content-less chunks that establish id/model/role metadata.
    /// Off by default: only content-bearing and finishing chunks reach the client.
    #[serde(default)]
    pub forward_metadata_chunks: bool,
}

/// Outbound HTTP settings for the backend client.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct HttpCfg {
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Whole-call limit for non-streaming requests.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Whole-call limit for streaming requests, body included.
    #[serde(default = "default_stream_timeout_ms")]
    pub stream_timeout_ms: u64,
    #[serde(default)]
    pub pool_max_idle_per_host: Option<usize>,
}

impl Default for HttpCfg {
    fn default() -> Self {
        HttpCfg {
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            stream_timeout_ms: default_stream_timeout_ms(),
            pool_max_idle_per_host: None,
        }
    }
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}
fn default_request_timeout_ms() -> u64 {
    60_000
}
fn default_stream_timeout_ms() -> u64 {
    600_000
}

fn default_dummy_model() -> String {
    "dummy-model".into()
}
fn default_chunk_delay_ms() -> u64 {
    500
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct DummyCfg {
    #[serde(default = "default_dummy_model")]
    pub model: String,
    /// Pause between streamed poem lines.
    #[serde(default = "default_chunk_delay_ms")]
    pub chunk_delay_ms: u64,
}

impl Default for DummyCfg {
    fn default() -> Self {
        Self {
            model: default_dummy_model(),
            chunk_delay_ms: default_chunk_delay_ms(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct Config {
    #[serde(default)]
    pub upstream: UpstreamCfg,
    #[serde(default)]
    pub defaults: DefaultsCfg,
    #[serde(default)]
    pub server: ServerCfg,
    #[serde(default)]
    pub relay: RelayCfg,
    #[serde(default)]
    pub http: HttpCfg,
    #[serde(default)]
    pub dummy: DummyCfg,
}

impl Config {
    /// Read a config file. `.json` and `.toml` are parsed as such; any other
    /// extension is tried as JSON, then as TOML.
    pub fn from_path<P: AsRef<Path>>(path: P) -> CoreResult<Self> {
        let path = path.as_ref();
        let raw = fs::read(path)?;
        let text = String::from_utf8(raw).map_err(|e| GatewayError::Other(e.into()))?;
        let as_json = || serde_json::from_str::<Self>(&text).map_err(anyhow::Error::from);
        let as_toml = || toml::from_str::<Self>(&text).map_err(anyhow::Error::from);
        let parsed = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => as_json(),
            Some("toml") => as_toml(),
            _ => as_json().or_else(|_| as_toml()),
        };
        parsed.map_err(GatewayError::Other)
    }

    /// Apply `LMSTUDIO_BASE_URL` / `MODEL_NAME` from the process environment.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|k| std::env::var(k).ok())
    }

    fn with_overrides_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(url) = lookup(ENV_BASE_URL).filter(|v| !v.trim().is_empty()) {
            self.upstream.base_url = url;
        }
        if let Some(model) = lookup(ENV_MODEL_NAME).filter(|v| !v.trim().is_empty()) {
            self.upstream.default_model = model;
        }
        self
    }

    pub fn request_defaults(&self) -> RequestDefaults {
        RequestDefaults {
            model: self.upstream.default_model.clone(),
            temperature: self.defaults.temperature,
            max_tokens: self.defaults.max_tokens,
            top_p: self.defaults.top_p,
        }
    }

    /// Defaults for the canned backend: requests without a model name get the dummy's.
    pub fn dummy_request_defaults(&self) -> RequestDefaults {
        RequestDefaults {
            model: self.dummy.model.clone(),
            ..self.request_defaults()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn load_from_json() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("gate.json");
        let json = r#"{
          "upstream": {"base_url":"http://10.0.0.5:1234/v1","default_model":"llama-3"},
          "server": {"bind":"127.0.0.1:9000"},
          "relay": {"forward_metadata_chunks": true}
        }"#;
        fs::write(&file, json).unwrap();
        let cfg = Config::from_path(&file).unwrap();
        assert_eq!(cfg.upstream.base_url, "http://10.0.0.5:1234/v1");
        assert_eq!(cfg.upstream.default_model, "llama-3");
        assert_eq!(cfg.server.bind, "127.0.0.1:9000");
        assert!(cfg.relay.forward_metadata_chunks);
        assert_eq!(cfg.http.connect_timeout_ms, 5_000);
        assert_eq!(cfg.http.request_timeout_ms, 60_000);
        assert_eq!(cfg.http.pool_max_idle_per_host, None);
        assert_eq!(cfg.defaults.max_tokens, Some(1000));
    }

    #[test]
    fn unreadable_files_map_to_error_variants() {
        let err = Config::from_path("/definitely/not/here/lmgate.json").unwrap_err();
        assert!(matches!(err, GatewayError::Io(_)), "{err:?}");

        let dir = tempdir().unwrap();
        let binary = dir.path().join("gate.bin");
        fs::write(&binary, [0xff, 0xfe, 0x00, 0x80]).unwrap();
        assert!(matches!(
            Config::from_path(&binary).unwrap_err(),
            GatewayError::Other(_)
        ));

        let broken = dir.path().join("gate.json");
        fs::write(&broken, r#"{ "upstream": { "base_url": 123 }"#).unwrap();
        assert!(matches!(
            Config::from_path(&broken).unwrap_err(),
            GatewayError::Other(_)
        ));
    }

    #[test]
    fn load_from_toml() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("gate.toml");
        let toml = r#"
[upstream]
base_url = "http://localhost:1234/v1"
api_key_env = "LMGATE_KEY"

[defaults]
temperature = 0.2

[http]
stream_timeout_ms = 1000

[dummy]
chunk_delay_ms = 0
"#;
        fs::write(&file, toml).unwrap();
        let cfg = Config::from_path(&file).unwrap();
        assert_eq!(cfg.upstream.api_key_env.as_deref(), Some("LMGATE_KEY"));
        assert_eq!(cfg.upstream.default_model, "qwen/qwen3-coder-30b");
        assert_eq!(cfg.defaults.temperature, 0.2);
        assert_eq!(cfg.defaults.top_p, 1.0);
        assert_eq!(cfg.http.stream_timeout_ms, 1000);
        assert_eq!(cfg.http.request_timeout_ms, 60_000);
        assert_eq!(cfg.dummy.chunk_delay_ms, 0);
        assert_eq!(cfg.dummy.model, "dummy-model");
    }

    #[test]
    fn unknown_extension_falls_back_to_json_then_toml() {
        let dir = tempdir().unwrap();
        let json_path = dir.path().join("gate.conf");
        fs::write(&json_path, r#"{"server":{"bind":"127.0.0.1:1"}}"#).unwrap();
        let cfg_json_first = Config::from_path(&json_path).unwrap();
        assert_eq!(cfg_json_first.server.bind, "127.0.0.1:1");

        let toml_path = dir.path().join("gate2.conf");
        fs::write(&toml_path, "[server]\nbind = \"127.0.0.1:2\"\n").unwrap();
        let cfg_toml_fallback = Config::from_path(&toml_path).unwrap();
        assert_eq!(cfg_toml_fallback.server.bind, "127.0.0.1:2");
        assert_eq!(cfg_toml_fallback.http.connect_timeout_ms, 5_000);
    }

    #[test]
    fn env_overrides_replace_upstream_fields() {
        let cfg = Config::default().with_overrides_from(|k| match k {
            ENV_BASE_URL => Some("http://gpu-box:1234/v1".into()),
            ENV_MODEL_NAME => Some("mistral-7b".into()),
            _ => None,
        });
        assert_eq!(cfg.upstream.base_url, "http://gpu-box:1234/v1");
        let defaults = cfg.request_defaults();
        assert_eq!(defaults.model, "mistral-7b");
        assert_eq!(defaults.temperature, 0.7);
    }

    #[test]
    fn dummy_defaults_use_dummy_model() {
        let cfg = Config::default();
        let defaults = cfg.dummy_request_defaults();
        assert_eq!(defaults.model, "dummy-model");
        assert_eq!(defaults.max_tokens, cfg.request_defaults().max_tokens);
    }

    #[test]
    fn blank_env_values_are_ignored() {
        let cfg = Config::default().with_overrides_from(|_| Some("   ".into()));
        assert_eq!(cfg.upstream, UpstreamCfg::default());
    }
}
