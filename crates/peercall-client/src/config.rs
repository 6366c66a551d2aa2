//! Endpoint configuration
//!
//! Values come from built-in defaults, then an optional `peercall.toml` in the
//! working directory, then `PEERCALL_*` environment variables
//! (`PEERCALL_LOCAL_ID`, `PEERCALL_RELAY_URL`, `PEERCALL_ICE_SERVERS=a,b`, ...).

use config::{Config, ConfigError, Environment, File, FileFormat};
use peercall_media::OverflowPolicy;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

use crate::orchestrator::OrchestratorOptions;
use crate::pipeline::{PipelineOptions, ReceiveFraming};
use crate::transport::TransportConfig;

const ENV_PREFIX: &str = "PEERCALL";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallConfig {
    #[serde(default = "default_relay_url")]
    pub relay_url: String,
    /// Identity announced to the relay
    pub local_id: String,
    /// Peer to call right after connecting
    #[serde(default)]
    pub call: Option<String>,
    #[serde(default = "default_ice_servers")]
    pub ice_servers: Vec<String>,
    #[serde(default = "default_payload_type")]
    pub payload_type: u8,
    /// Received packets buffered ahead of playback
    #[serde(default = "default_playback_queue")]
    pub playback_queue: usize,
    #[serde(default)]
    pub overflow_policy: OverflowPolicy,
    #[serde(default)]
    pub receive_framing: ReceiveFraming,
    /// 0 disables the timeout
    #[serde(default = "default_negotiation_timeout")]
    pub negotiation_timeout_secs: u64,
    #[serde(default)]
    pub input_device: Option<String>,
    #[serde(default)]
    pub output_device: Option<String>,
    #[serde(default)]
    pub log_format: LogFormat,
}

fn default_relay_url() -> String {
    "ws://localhost:3000".to_string()
}

fn default_ice_servers() -> Vec<String> {
    vec!["stun:stun.l.google.com:19302".to_string()]
}

fn default_payload_type() -> u8 {
    peercall_media::rtp::OPUS_PAYLOAD_TYPE
}

fn default_playback_queue() -> usize {
    50
}

fn default_negotiation_timeout() -> u64 {
    30
}

impl CallConfig {
    /// Load from `peercall.toml` (optional) and the process environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::build(Config::builder().add_source(File::with_name("peercall").required(false)), None)
    }

    /// Load from an inline TOML document and an explicit variable map
    pub fn from_sources(toml: &str, env: HashMap<String, String>) -> Result<Self, ConfigError> {
        Self::build(
            Config::builder().add_source(File::from_str(toml, FileFormat::Toml)),
            Some(env),
        )
    }

    fn build(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
        env: Option<HashMap<String, String>>,
    ) -> Result<Self, ConfigError> {
        let config: CallConfig = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("ice_servers")
                    .source(env),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.local_id.trim().is_empty() {
            return Err(ConfigError::Message("local_id must not be empty".to_string()));
        }
        if self.call.as_deref() == Some(self.local_id.as_str()) {
            return Err(ConfigError::Message("cannot call own identity".to_string()));
        }
        if self.payload_type > 127 {
            return Err(ConfigError::Message(format!(
                "payload_type {} does not fit in 7 bits",
                self.payload_type
            )));
        }
        Ok(())
    }

    pub fn negotiation_timeout(&self) -> Option<Duration> {
        (self.negotiation_timeout_secs > 0).then(|| Duration::from_secs(self.negotiation_timeout_secs))
    }

    pub fn orchestrator_options(&self) -> OrchestratorOptions {
        OrchestratorOptions {
            payload_type: self.payload_type,
            transport: TransportConfig {
                ice_servers: self.ice_servers.clone(),
            },
            negotiation_timeout: self.negotiation_timeout(),
        }
    }

    pub fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            queue_capacity: self.playback_queue,
            overflow: self.overflow_policy,
            framing: self.receive_framing,
        }
    }
}
