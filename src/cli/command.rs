use std::path::PathBuf;

use audiotunnel::structs::stream::Codec;
use clap::{Args, Parser as ClapParser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};

#[derive(Debug, ClapParser)]
#[command(
    name       = env!("CARGO_PKG_NAME"),
    version    = env!("CARGO_PKG_VERSION"),
    long_version = concat!(
        env!("CARGO_PKG_VERSION"),
        " (audiotunnel ", env!("AUDIOTUNNEL_VERSION"), ", built ", env!("BUILD_TIMESTAMP"), ")"
    ),
    author     = env!("CARGO_PKG_AUTHORS"),
    about      = "Push PCM and passthrough bitstreams through a tunneled decode/render pipeline",
    long_about = None,
)]
pub struct Cli {
    /// Set the log level
    #[arg(long, global = true, value_enum, default_value_t = LogLevel::Info)]
    pub loglevel: LogLevel,

    /// Treat warnings as fatal errors (fail on first warning).
    #[arg(long, global = true)]
    pub strict: bool,

    /// Log output format.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Plain)]
    pub log_format: LogFormat,

    /// Show progress bars during operations.
    #[arg(long, global = true)]
    pub progress: bool,

    /// Choose an operation to perform.
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    pub fn fail_level(&self) -> log::Level {
        if self.strict {
            log::Level::Warn
        } else {
            log::Level::Error
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Play a raw PCM or DTS stream through the software pipeline.
    Play(PlayArgs),

    /// Scan a file for DTS frames and report what was found.
    Probe(ProbeArgs),
}

#[derive(Debug, Args)]
pub struct PlayArgs {
    /// Input stream (use "-" for stdin).
    #[arg(value_name = "INPUT")]
    pub input: PathBuf,

    /// Interleaved channels in the input.
    #[arg(long, value_name = "N")]
    pub channels: Option<u32>,

    /// Sample rate in Hz.
    #[arg(long, value_name = "HZ")]
    pub sample_rate: Option<u32>,

    /// Bits per sample (8, 16, 24 or 32).
    #[arg(long, value_name = "B")]
    pub bits: Option<u32>,

    /// Codec of the input stream.
    #[arg(long, value_enum)]
    pub codec: Option<CodecArg>,

    /// Forward the bitstream undecoded.
    #[arg(long)]
    pub passthrough: bool,

    /// Output device ("local" or "hdmi").
    #[arg(long, value_name = "NAME")]
    pub device: Option<String>,

    /// Where to write the rendered output: WAV for PCM, raw for passthrough.
    #[arg(long, value_name = "PATH")]
    pub output: Option<PathBuf>,

    /// Channel roles of the input, e.g. "fl,fr,fc,lfe".
    #[arg(long, value_name = "ROLES")]
    pub layout: Option<String>,

    /// YAML file with `session` and `stream` defaults.
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct ProbeArgs {
    /// Input stream (use "-" for stdin).
    #[arg(value_name = "INPUT")]
    pub input: PathBuf,

    /// Print the summary as YAML.
    #[arg(long)]
    pub yaml: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum LogLevel {
    /// Disable logging output.
    Off,
    /// No output except errors.
    Error,
    /// Show warnings and errors.
    Warn,
    /// Show info, warnings and errors (default).
    Info,
    /// Show debug, info, warnings and errors.
    Debug,
    /// Show all log messages including trace.
    Trace,
}

impl LogLevel {
    /// Convert LogLevel to log::LevelFilter
    pub fn to_level_filter(self) -> log::LevelFilter {
        match self {
            LogLevel::Off => log::LevelFilter::Off,
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum LogFormat {
    /// Colorized human-readable text.
    Plain,
    /// Structured JSON per log record.
    Json,
}

#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecArg {
    /// Interleaved little-endian PCM.
    Pcm,
    /// DTS core, any packing.
    Dts,
    /// Dolby Digital.
    Ac3,
    /// Dolby Digital Plus.
    Eac3,
}

impl From<CodecArg> for Codec {
    fn from(codec: CodecArg) -> Self {
        match codec {
            CodecArg::Pcm => Codec::Pcm,
            CodecArg::Dts => Codec::Dts,
            CodecArg::Ac3 => Codec::Ac3,
            CodecArg::Eac3 => Codec::Eac3,
        }
    }
}
