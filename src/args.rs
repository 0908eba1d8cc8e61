use clap::Parser;
use std::path::PathBuf;

use crate::config;

#[derive(Parser, Debug)]
#[command(name = "meshcall-core")]
#[command(author = "Meshcall Team")]
#[command(version = "0.2.0")]
#[command(about = "Rust-based mesh call core", long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/meshcall-core.toml")]
    pub config: PathBuf,

    /// Signaling relay WebSocket URL
    #[arg(long)]
    pub relay_url: Option<String>,

    /// Channel (call) to join
    #[arg(long)]
    pub channel: Option<String>,

    /// Local user id
    #[arg(short, long)]
    pub user_id: Option<String>,

    /// Display name shown to other participants
    #[arg(long)]
    pub display_name: Option<String>,

    /// Verbose logging
    #[arg(short, long, action)]
    pub verbose: bool,
}

impl Args {
    /// Load the config file and apply command line overrides
    pub fn load_config(&self) -> Result<config::Config, Box<dyn std::error::Error>> {
        let mut config = config::Config::load(&self.config)?;
        self.apply_overrides(&mut config);
        Ok(config)
    }

    /// Apply command line values over `config`
    pub fn apply_overrides(&self, config: &mut config::Config) {
        if let Some(url) = &self.relay_url {
            config.relay.url = url.clone();
        }
        if let Some(channel) = &self.channel {
            config.relay.channel = channel.clone();
        }
        if let Some(user_id) = &self.user_id {
            config.identity.user_id = user_id.clone();
        }
        if let Some(display_name) = &self.display_name {
            config.identity.display_name = display_name.clone();
        }
    }
}
