use std::path::PathBuf;

use crate::config::{Config, ConfigErrors, IcePolicy};

#[derive(clap::Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Signaling server WebSocket url
    #[arg(long, default_value = "ws://127.0.0.1:3000/ws")]
    pub server: String,
    /// TOML file with [ice], [session] and [signaling] sections
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Only use TURN relayed candidates
    #[arg(long)]
    pub relay_only: bool,
    #[arg(long)]
    pub no_audio: bool,
    #[arg(long)]
    pub no_video: bool,
}

impl Args {
    pub fn load_config(&self) -> Result<Config, ConfigErrors> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };
        if self.relay_only {
            config.ice.transport_policy = IcePolicy::Relay;
        }
        Ok(config)
    }
}

/// Commands typed on stdin while the client runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Next,
    Quit,
}

impl Command {
    pub fn parse(line: &str) -> Option<Self> {
        match line.trim().to_ascii_lowercase().as_str() {
            "next" | "n" => Some(Command::Next),
            "quit" | "q" | "exit" => Some(Command::Quit),
            _ => None,
        }
    }
}
