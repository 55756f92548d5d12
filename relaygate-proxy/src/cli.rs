//! Command-line arguments.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogFormat {
    /// Human-readable multi-line output.
    Pretty,
    /// One JSON object per line.
    #[default]
    Json,
}

/// Relaygate API/XML gateway.
///
/// # Port and address
///
/// `--port` and `--bind` override `listen.port` and `listen.address` from
/// the configuration file.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to the YAML configuration file.
    /// If not specified, searches: RELAYGATE_CONFIG env, /etc/relaygate/config.yaml, ./config.yaml
    #[arg(long, env = "RELAYGATE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Listen port
    #[arg(short, long, env = "RELAYGATE_PORT")]
    pub port: Option<u16>,

    /// Bind address
    #[arg(short, long, env = "RELAYGATE_BIND")]
    pub bind: Option<String>,

    #[arg(long, env = "RELAYGATE_LOG_FORMAT", value_enum, default_value_t = LogFormat::Json)]
    pub log_format: LogFormat,
}
