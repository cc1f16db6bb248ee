// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Configuration tree for the Clawline provider (§4.1).
//!
//! Defaults match the documented values. Every field is overridable by CLI
//! flag or environment variable; an optional `--config` TOML file supplies
//! values below CLI/env precedence.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

const DEFAULT_MAX_MESSAGE_BYTES: usize = 64 * 1024;

/// Top-level provider configuration.
#[derive(Debug, Clone, clap::Parser)]
#[command(name = "clawline-provider")]
pub struct ClawlineConfig {
    /// Optional TOML file overlay, applied before CLI/env overrides.
    #[arg(long, env = "CLAWLINE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Directory holding allowlist.json, denylist.json, jwt.key, clawline.sqlite, lock files.
    #[arg(long, default_value = "./state", env = "CLAWLINE_STATE_PATH")]
    pub state_path: PathBuf,

    #[command(flatten)]
    pub network: NetworkConfig,

    #[command(flatten)]
    pub auth: AuthConfig,

    #[command(flatten)]
    pub pairing: PairingConfig,

    #[command(flatten)]
    pub media: MediaConfig,

    #[command(flatten)]
    pub sessions: SessionsConfig,

    #[command(flatten)]
    pub streams: StreamsConfig,

    /// Name of the host-supplied adapter to use; `None` selects the built-in echo adapter.
    #[arg(long, env = "CLAWLINE_ADAPTER")]
    pub adapter: Option<String>,
}

#[derive(Debug, Clone, clap::Args, Deserialize)]
pub struct NetworkConfig {
    #[arg(long, default_value = "127.0.0.1", env = "CLAWLINE_HOST")]
    #[serde(default = "default_host")]
    pub host: String,

    #[arg(long, default_value_t = 18792, env = "CLAWLINE_PORT")]
    #[serde(default = "default_port")]
    pub port: u16,

    /// Allow binding to a non-localhost address. Refused otherwise (§4.1 step 7).
    #[arg(long, default_value_t = false, env = "CLAWLINE_ALLOW_INSECURE_PUBLIC")]
    #[serde(default)]
    pub allow_insecure_public: bool,
}

fn default_host() -> String {
    "127.0.0.1".to_owned()
}
fn default_port() -> u16 {
    18792
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self { host: default_host(), port: default_port(), allow_insecure_public: false }
    }
}

#[derive(Debug, Clone, clap::Args, Deserialize)]
pub struct AuthConfig {
    /// Clamped to 64 KiB; values above emit a startup warning.
    #[arg(long, default_value_t = 65_536, env = "CLAWLINE_MAX_MESSAGE_BYTES")]
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,

    #[arg(long, default_value_t = 262_144, env = "CLAWLINE_MAX_INLINE_BYTES")]
    #[serde(default = "default_max_inline_bytes")]
    pub max_inline_bytes: usize,

    #[arg(long, default_value_t = 31_536_000, env = "CLAWLINE_TOKEN_TTL_SECONDS")]
    #[serde(default = "default_token_ttl")]
    pub token_ttl_seconds: u64,

    #[arg(long, default_value_t = 600, env = "CLAWLINE_REISSUE_GRACE_SECONDS")]
    #[serde(default = "default_reissue_grace")]
    pub reissue_grace_seconds: u64,
}

fn default_max_message_bytes() -> usize {
    DEFAULT_MAX_MESSAGE_BYTES
}
fn default_max_inline_bytes() -> usize {
    262_144
}
fn default_token_ttl() -> u64 {
    31_536_000
}
fn default_reissue_grace() -> u64 {
    600
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            max_message_bytes: default_max_message_bytes(),
            max_inline_bytes: default_max_inline_bytes(),
            token_ttl_seconds: default_token_ttl(),
            reissue_grace_seconds: default_reissue_grace(),
        }
    }
}

impl AuthConfig {
    /// Total inline payload cap: content + decoded inline attachments (§8).
    pub fn max_total_payload_bytes(&self) -> usize {
        self.max_message_bytes + self.max_inline_bytes
    }

    pub fn token_ttl(&self) -> Option<Duration> {
        if self.token_ttl_seconds == 0 {
            None
        } else {
            Some(Duration::from_secs(self.token_ttl_seconds))
        }
    }
}

#[derive(Debug, Clone, clap::Args, Deserialize)]
pub struct PairingConfig {
    #[arg(long, default_value_t = 300, env = "CLAWLINE_PENDING_TTL_SECONDS")]
    #[serde(default = "default_pending_ttl")]
    pub pending_ttl_seconds: u64,
}

fn default_pending_ttl() -> u64 {
    300
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self { pending_ttl_seconds: default_pending_ttl() }
    }
}

impl PairingConfig {
    pub fn pending_ttl(&self) -> Duration {
        Duration::from_secs(self.pending_ttl_seconds)
    }
}

#[derive(Debug, Clone, clap::Args, Deserialize)]
pub struct MediaConfig {
    /// Directory for asset blobs and in-progress uploads.
    #[arg(long, default_value = "./media", env = "CLAWLINE_MEDIA_PATH")]
    #[serde(default = "default_media_path")]
    pub media_path: PathBuf,

    #[arg(long, default_value_t = 104_857_600, env = "CLAWLINE_MAX_UPLOAD_BYTES")]
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: u64,

    #[arg(long, default_value_t = 86_400, env = "CLAWLINE_UNREFERENCED_UPLOAD_TTL_SECONDS")]
    #[serde(default = "default_unreferenced_ttl")]
    pub unreferenced_upload_ttl_seconds: u64,

    /// Interval between periodic asset sweeps.
    #[arg(long, default_value_t = 3600, env = "CLAWLINE_MEDIA_SWEEP_INTERVAL_SECONDS")]
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_seconds: u64,
}

fn default_media_path() -> PathBuf {
    PathBuf::from("./media")
}
fn default_max_upload_bytes() -> u64 {
    104_857_600
}
fn default_unreferenced_ttl() -> u64 {
    86_400
}
fn default_sweep_interval() -> u64 {
    3600
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            media_path: default_media_path(),
            max_upload_bytes: default_max_upload_bytes(),
            unreferenced_upload_ttl_seconds: default_unreferenced_ttl(),
            sweep_interval_seconds: default_sweep_interval(),
        }
    }
}

impl MediaConfig {
    pub fn unreferenced_upload_ttl(&self) -> Duration {
        Duration::from_secs(self.unreferenced_upload_ttl_seconds)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds)
    }

    pub fn assets_dir(&self) -> PathBuf {
        self.media_path.join("assets")
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.media_path.join("tmp")
    }
}

#[derive(Debug, Clone, clap::Args, Deserialize)]
pub struct SessionsConfig {
    #[arg(long, default_value_t = 500, env = "CLAWLINE_MAX_REPLAY_MESSAGES")]
    #[serde(default = "default_max_replay")]
    pub max_replay_messages: u32,

    #[arg(long, default_value_t = 200, env = "CLAWLINE_MAX_PROMPT_MESSAGES")]
    #[serde(default = "default_max_prompt")]
    pub max_prompt_messages: u32,

    #[arg(long, default_value_t = 20, env = "CLAWLINE_MAX_QUEUED_MESSAGES")]
    #[serde(default = "default_max_queued")]
    pub max_queued_messages: usize,

    #[arg(long, default_value_t = 1000, env = "CLAWLINE_MAX_WRITE_QUEUE_DEPTH")]
    #[serde(default = "default_max_write_queue_depth")]
    pub max_write_queue_depth: usize,

    #[arg(long, default_value_t = 5, env = "CLAWLINE_MAX_MESSAGES_PER_SECOND")]
    #[serde(default = "default_max_messages_per_second")]
    pub max_messages_per_second: u32,

    #[arg(long, default_value_t = 2, env = "CLAWLINE_MAX_TYPING_PER_SECOND")]
    #[serde(default = "default_max_typing_per_second")]
    pub max_typing_per_second: u32,

    #[arg(long, default_value_t = 30, env = "CLAWLINE_TYPING_AUTO_EXPIRE_SECONDS")]
    #[serde(default = "default_typing_auto_expire")]
    pub typing_auto_expire_seconds: u64,
}

fn default_max_replay() -> u32 {
    500
}
fn default_max_prompt() -> u32 {
    200
}
fn default_max_queued() -> usize {
    20
}
fn default_max_write_queue_depth() -> usize {
    1000
}
fn default_max_messages_per_second() -> u32 {
    5
}
fn default_max_typing_per_second() -> u32 {
    2
}
fn default_typing_auto_expire() -> u64 {
    30
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            max_replay_messages: default_max_replay(),
            max_prompt_messages: default_max_prompt(),
            max_queued_messages: default_max_queued(),
            max_write_queue_depth: default_max_write_queue_depth(),
            max_messages_per_second: default_max_messages_per_second(),
            max_typing_per_second: default_max_typing_per_second(),
            typing_auto_expire_seconds: default_typing_auto_expire(),
        }
    }
}

#[derive(Debug, Clone, clap::Args, Deserialize)]
pub struct StreamsConfig {
    #[arg(long, default_value_t = 300, env = "CLAWLINE_STREAM_INACTIVITY_SECONDS")]
    #[serde(default = "default_stream_inactivity")]
    pub stream_inactivity_seconds: u64,

    #[arg(long, default_value_t = 100, env = "CLAWLINE_CHUNK_PERSIST_INTERVAL_MS")]
    #[serde(default = "default_chunk_persist_interval_ms")]
    pub chunk_persist_interval_ms: u64,

    #[arg(long, default_value_t = 1_048_576, env = "CLAWLINE_CHUNK_BUFFER_BYTES")]
    #[serde(default = "default_chunk_buffer_bytes")]
    pub chunk_buffer_bytes: usize,

    #[arg(long, default_value_t = 120, env = "CLAWLINE_ADAPTER_EXECUTE_TIMEOUT_SECONDS")]
    #[serde(default = "default_adapter_timeout")]
    pub adapter_execute_timeout_seconds: u64,
}

fn default_stream_inactivity() -> u64 {
    300
}
fn default_chunk_persist_interval_ms() -> u64 {
    100
}
fn default_chunk_buffer_bytes() -> usize {
    1_048_576
}
fn default_adapter_timeout() -> u64 {
    120
}

impl Default for StreamsConfig {
    fn default() -> Self {
        Self {
            stream_inactivity_seconds: default_stream_inactivity(),
            chunk_persist_interval_ms: default_chunk_persist_interval_ms(),
            chunk_buffer_bytes: default_chunk_buffer_bytes(),
            adapter_execute_timeout_seconds: default_adapter_timeout(),
        }
    }
}

impl StreamsConfig {
    pub fn stream_inactivity(&self) -> Duration {
        Duration::from_secs(self.stream_inactivity_seconds)
    }

    pub fn chunk_persist_interval(&self) -> Duration {
        Duration::from_millis(self.chunk_persist_interval_ms)
    }

    pub fn adapter_execute_timeout(&self) -> Duration {
        Duration::from_secs(self.adapter_execute_timeout_seconds)
    }
}

impl ClawlineConfig {
    /// Merge a TOML file overlay beneath whatever clap already resolved from
    /// CLI flags/env vars. Only fields left at their struct default are
    /// overwritten — matching the "CLI/env win" precedence from §4.1.
    ///
    /// Mirrors the teacher's own nested `#[command(flatten)]` config style,
    /// generalized with an optional file layer the mux proxy itself has no
    /// need for (it takes no file config at all).
    pub fn apply_file_overlay(&mut self) -> anyhow::Result<()> {
        let Some(path) = self.config.clone() else {
            return Ok(());
        };
        let text = std::fs::read_to_string(&path)
            .map_err(|e| anyhow::anyhow!("reading config file {}: {e}", path.display()))?;
        let file: ConfigFile = toml::from_str(&text)
            .map_err(|e| anyhow::anyhow!("parsing config file {}: {e}", path.display()))?;
        if let Some(network) = file.network {
            self.network = network;
        }
        if let Some(auth) = file.auth {
            self.auth = auth;
        }
        if let Some(pairing) = file.pairing {
            self.pairing = pairing;
        }
        if let Some(media) = file.media {
            self.media = media;
        }
        if let Some(sessions) = file.sessions {
            self.sessions = sessions;
        }
        if let Some(streams) = file.streams {
            self.streams = streams;
        }
        if self.adapter.is_none() {
            self.adapter = file.adapter;
        }
        Ok(())
    }

    /// Clamp `maxMessageBytes` to 64 KiB, warning if the configured value was higher.
    pub fn clamp_max_message_bytes(&mut self) {
        if self.auth.max_message_bytes > DEFAULT_MAX_MESSAGE_BYTES {
            tracing::warn!(
                configured = self.auth.max_message_bytes,
                clamped = DEFAULT_MAX_MESSAGE_BYTES,
                "maxMessageBytes exceeds the 64 KiB cap; clamping"
            );
            self.auth.max_message_bytes = DEFAULT_MAX_MESSAGE_BYTES;
        }
    }
}

/// Shape of an optional TOML config file overlay.
#[derive(Debug, Deserialize, Default)]
struct ConfigFile {
    network: Option<NetworkConfig>,
    auth: Option<AuthConfig>,
    pairing: Option<PairingConfig>,
    media: Option<MediaConfig>,
    sessions: Option<SessionsConfig>,
    streams: Option<StreamsConfig>,
    adapter: Option<String>,
}

#[cfg(test)]
mod config_tests {
    use super::*;

    #[test]
    fn clamp_warns_and_clamps_oversized_message_bytes() {
        let mut config = test_config();
        config.auth.max_message_bytes = 200_000;
        config.clamp_max_message_bytes();
        assert_eq!(config.auth.max_message_bytes, DEFAULT_MAX_MESSAGE_BYTES);
    }

    #[test]
    fn total_payload_cap_matches_spec_boundary() {
        let config = test_config();
        assert_eq!(config.auth.max_total_payload_bytes(), 65_536 + 262_144);
    }

    fn test_config() -> ClawlineConfig {
        ClawlineConfig {
            config: None,
            state_path: PathBuf::from("./state"),
            network: NetworkConfig::default(),
            auth: AuthConfig::default(),
            pairing: PairingConfig::default(),
            media: MediaConfig::default(),
            sessions: SessionsConfig::default(),
            streams: StreamsConfig::default(),
            adapter: None,
        }
    }
}
