use std::path::Path;

use crate::{Config, RuntimeConfig, error::Error};

pub fn load<P: AsRef<Path>>(path: P) -> crate::Result<Config> {
    let content = std::fs::read_to_string(path.as_ref())?;
    let config: Config = toml::from_str(&content)?;

    validate(&config)?;

    if !config.chat.enabled {
        log::warn!("Chat completions endpoint is disabled, only the health endpoint will be served");
    }

    Ok(config)
}

pub(crate) fn validate(config: &Config) -> crate::Result<()> {
    if !config.chat.path.starts_with('/') {
        return Err(Error::Validation(format!(
            "chat.path must start with '/', got '{}'",
            config.chat.path
        )));
    }

    if config.server.health.enabled && !config.server.health.path.starts_with('/') {
        return Err(Error::Validation(format!(
            "server.health.path must start with '/', got '{}'",
            config.server.health.path
        )));
    }

    match &config.chat.runtime {
        RuntimeConfig::Openai(runtime) => {
            if runtime.max_messages == 0 {
                return Err(Error::Validation(
                    "chat.runtime.max_messages must be greater than zero".to_string(),
                ));
            }

            if runtime.timeout.is_zero() {
                return Err(Error::Validation(
                    "chat.runtime.timeout must be greater than zero".to_string(),
                ));
            }
        }
    }

    Ok(())
}
