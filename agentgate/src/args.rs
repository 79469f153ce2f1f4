use std::{net::SocketAddr, path::PathBuf};

use clap::Parser;

/// OpenAI-compatible chat completions gateway in front of an agent runtime.
#[derive(Debug, Parser)]
#[command(name = "agentgate", version)]
pub struct Args {
    /// Path to the TOML configuration file. Defaults apply when it does not exist.
    #[arg(short, long, env = "AGENTGATE_CONFIG_PATH", default_value = "./agentgate.toml")]
    pub config: PathBuf,

    /// IP address and port to listen on, overriding the configuration file.
    #[arg(short, long, env = "AGENTGATE_LISTEN_ADDRESS")]
    pub listen_address: Option<SocketAddr>,

    /// Log filter, such as `info` or `server=debug,chat=debug`.
    #[arg(long, env = "AGENTGATE_LOG", default_value = "info")]
    pub log: String,
}
