use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use audiotunnel::process::session::SessionConfig;
use audiotunnel::structs::channel::ChannelLayout;
use audiotunnel::structs::stream::{Codec, StreamHints};
use serde::{Deserialize, Serialize};

use crate::cli::command::{CodecArg, PlayArgs};

/// Session defaults read from a YAML file. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionSection {
    pub device: Option<String>,
    pub passthrough: Option<bool>,
    pub buffer_seconds: Option<u32>,
    pub chunk_bytes: Option<usize>,
    pub handshake_timeout_ms: Option<u64>,
    pub buffer_timeout_ms: Option<u64>,
    pub sync_carry_over: Option<bool>,
    /// Millibels.
    pub volume: Option<i32>,
    /// Millibels of gain for remapped 16-bit PCM.
    pub drc: Option<i32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StreamSection {
    pub channels: Option<u32>,
    pub sample_rate: Option<u32>,
    pub bits: Option<u32>,
    pub codec: Option<CodecArg>,
    pub layout: Option<String>,
}

/// Contents of a `--config` file.
///
/// ```yaml
/// session:
///   device: hdmi
///   buffer_seconds: 2
/// stream:
///   channels: 6
///   codec: dts
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PlayConfig {
    pub session: SessionSection,
    pub stream: StreamSection,
}

impl PlayConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("Invalid config {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml_ng::from_str(text)?)
    }

    /// Loads `args.config` if given, otherwise starts from defaults.
    pub fn for_args(args: &PlayArgs) -> Result<Self> {
        match &args.config {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    /// Session configuration with command-line flags taking precedence over
    /// file values.
    pub fn session_config(&self, args: &PlayArgs, fail_level: log::Level) -> SessionConfig {
        let defaults = SessionConfig::default();
        let file = &self.session;

        SessionConfig {
            device: args
                .device
                .clone()
                .or_else(|| file.device.clone())
                .unwrap_or(defaults.device),
            passthrough: args.passthrough || file.passthrough.unwrap_or(defaults.passthrough),
            buffer_seconds: file.buffer_seconds.unwrap_or(defaults.buffer_seconds),
            chunk_bytes: file.chunk_bytes.unwrap_or(defaults.chunk_bytes),
            handshake_timeout: file
                .handshake_timeout_ms
                .map_or(defaults.handshake_timeout, Duration::from_millis),
            buffer_timeout: file
                .buffer_timeout_ms
                .map_or(defaults.buffer_timeout, Duration::from_millis),
            sync_carry_over: file.sync_carry_over.unwrap_or(defaults.sync_carry_over),
            volume: file.volume.unwrap_or(defaults.volume),
            drc: file.drc.unwrap_or(defaults.drc),
            fail_level,
        }
    }

    pub fn stream_hints(&self, args: &PlayArgs) -> Result<StreamHints> {
        let defaults = StreamHints::default();
        let file = &self.stream;

        let layout = match args.layout.as_deref().or(file.layout.as_deref()) {
            Some(text) => Some(
                text.parse::<ChannelLayout>()
                    .with_context(|| format!("Invalid channel layout `{text}`"))?,
            ),
            None => None,
        };

        let codec = args.codec.or(file.codec).map_or(defaults.codec, Codec::from);
        let channels = args
            .channels
            .or(file.channels)
            .or(layout.as_ref().map(|l| l.len() as u32))
            .unwrap_or(defaults.channels);

        Ok(StreamHints {
            channels,
            layout,
            sample_rate: args
                .sample_rate
                .or(file.sample_rate)
                .unwrap_or(defaults.sample_rate),
            bits_per_sample: args.bits.or(file.bits).unwrap_or(defaults.bits_per_sample),
            codec,
            extra_data: Vec::new(),
        })
    }
}
