//! CLI parsing.

use std::path::PathBuf;

use clap::Parser;

use crate::config::ForwardConfig;

/// Namespace Relay - forward sockets into and out of a sandboxed process's network namespace
#[derive(Parser, Debug)]
#[command(name = "nsrelay")]
#[command(about = "Forward sockets across the network namespace of a sandboxed process")]
#[command(version)]
pub struct Cli {
    /// Enable debug logging
    #[arg(short = 'd', long = "debug")]
    pub debug: bool,

    /// Path to settings file (default: ~/.nsrelay-settings.json)
    #[arg(short = 's', long = "settings")]
    pub settings: Option<PathBuf>,

    /// Process whose network namespace is the sandbox side
    #[arg(long = "pid", value_parser = clap::value_parser!(i32).range(1..))]
    pub pid: i32,

    /// Extra forward as TYPE,PROTO,PORT[,DESTINATION], e.g. client,tcp,8080
    #[arg(short = 'f', long = "forward")]
    pub forwards: Vec<ForwardConfig>,
}

impl Cli {
    /// Parse CLI arguments.
    pub fn parse_args() -> Self {
        Cli::parse()
    }

    /// Get the settings file path.
    pub fn get_settings_path(&self) -> Option<PathBuf> {
        self.settings.clone().or_else(crate::config::default_settings_path)
    }
}
