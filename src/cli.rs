use clap::{Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

use crate::config::SyncConfig;

#[derive(Parser)]
#[command(name = "klientel-sync")]
#[command(version)]
#[command(about = "Watch and post Klientel lead comments in real time")]
pub struct Args {
    /// TOML config file (defaults and KLIENTEL_* env vars apply without it)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// GraphQL endpoint, overrides the config file
    #[arg(long, global = true)]
    pub api_url: Option<String>,

    /// Room server websocket URL, overrides the config file
    #[arg(long, global = true)]
    pub socket_url: Option<String>,

    /// Bearer token for the API and the room server
    #[arg(long, global = true, env = "KLIENTEL_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Debug-level logging
    #[arg(long, short, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Print a lead's comments and follow new ones until Ctrl-C
    Watch {
        lead_id: String,
    },
    /// Add a comment to a lead
    Post {
        lead_id: String,
        content: String,
    },
    /// Print shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

impl Args {
    /// Command-line URL overrides on top of a loaded config.
    pub fn apply_overrides(&self, config: &mut SyncConfig) {
        if let Some(url) = &self.api_url {
            config.api_url = url.clone();
        }
        if let Some(url) = &self.socket_url {
            config.socket_url = url.clone();
        }
    }

    /// `RUST_LOG`-style default filter for the subscriber.
    pub fn log_filter(&self) -> &'static str {
        if self.verbose {
            "klientel_sync=debug"
        } else {
            "klientel_sync=info"
        }
    }
}
