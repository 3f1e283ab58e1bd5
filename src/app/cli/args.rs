//! Command line arguments
//!
//! Every option here can also be set in the configuration file; values given
//! on the command line win.

use clap::{ArgAction, Parser};
use std::path::PathBuf;

#[derive(Parser, Debug, Clone, Default)]
#[command(name = "plugwatch")]
#[command(about = "Discover socket plugins and print their merged reports")]
#[command(version)]
#[command(after_help = " * can be specified multiple times")]
pub struct Args {
    /// Directory tree searched for plugin sockets
    #[arg(short = 'r', long = "root", value_name = "DIR")]
    pub root: Option<PathBuf>,

    /// Configuration file path
    #[arg(short = 'c', long = "config-file", value_name = "FILE")]
    pub config_file: Option<PathBuf>,

    /// Protocol version plugins must report
    #[arg(long = "api-version", value_name = "VERSION")]
    pub api_version: Option<String>,

    /// Handshake metadata sent to every plugin*
    #[arg(
        short = 'm',
        long = "metadata",
        value_name = "KEY=VALUE",
        value_parser = parse_key_value,
        action = ArgAction::Append
    )]
    pub metadata: Vec<(String, String)>,

    /// Wire protocol spoken to plugins
    #[arg(short = 't', long = "transport", value_name = "KIND", value_parser = ["http", "jsonrpc"])]
    pub transport: Option<String>,

    /// Seconds between report rounds
    #[arg(short = 'i', long = "poll-interval", value_name = "SECONDS")]
    pub poll_interval: Option<u64>,

    /// Deadline for each handshake or report call
    #[arg(long = "rpc-timeout-ms", value_name = "MILLIS")]
    pub rpc_timeout_ms: Option<u64>,

    /// Delay between failed handshake attempts
    #[arg(long = "retry-interval-ms", value_name = "MILLIS")]
    pub retry_interval_ms: Option<u64>,

    /// Print a single report after one poll interval and exit
    #[arg(long = "once")]
    pub once: bool,

    /// Force colored log output
    #[arg(long = "color")]
    pub color: bool,

    /// Disable colored log output
    #[arg(long = "no-color", conflicts_with = "color")]
    pub no_color: bool,

    /// Log level
    #[arg(short = 'l', long = "log-level", value_name = "LEVEL", value_parser = ["trace", "debug", "info", "warn", "error", "off"])]
    pub log_level: Option<String>,

    /// Log file path (use 'none' to disable file logging)
    #[arg(short = 'f', long = "log-file", value_name = "FILE")]
    pub log_file: Option<PathBuf>,

    /// Log output format
    #[arg(short = 'o', long = "log-format", value_name = "FORMAT", value_parser = ["text", "ext", "json"])]
    pub log_format: Option<String>,
}

impl Args {
    /// `Some(true)` for --color, `Some(false)` for --no-color, otherwise
    /// `None` (decided by the config file or the terminal).
    pub fn color_choice(&self) -> Option<bool> {
        match (self.color, self.no_color) {
            (true, _) => Some(true),
            (_, true) => Some(false),
            _ => None,
        }
    }
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected KEY=VALUE, got '{s}'")),
    }
}
