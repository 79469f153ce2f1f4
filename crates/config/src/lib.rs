mod chat;
mod error;
mod loader;
mod server;

use std::path::Path;

use serde::Deserialize;

pub use chat::{ChatConfig, OpenAiRuntimeConfig, RuntimeConfig};
pub use error::Error;
pub use server::{HealthConfig, ServerConfig};

pub type Result<T> = std::result::Result<T, error::Error>;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub chat: ChatConfig,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> crate::Result<Config> {
        loader::load(path)
    }
}
