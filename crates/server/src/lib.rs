mod error;
mod health;
pub mod logger;

use std::{net::SocketAddr, sync::Arc};

use axum::{Router, routing::get};
use chat::{ChatHandler, LogTracer};
use config::Config;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

pub use error::Error;

pub(crate) type Result<T> = std::result::Result<T, error::Error>;

pub struct ServeConfig {
    pub listen_address: SocketAddr,
    pub config: Config,
    /// Cancelled to stop accepting connections and end every stream in flight.
    pub shutdown_signal: CancellationToken,
    /// Log filter such as `info` or `server=debug,chat=debug`.
    pub log_filter: String,
}

pub async fn serve(
    ServeConfig {
        listen_address,
        config,
        shutdown_signal,
        log_filter,
    }: ServeConfig,
) -> crate::Result<()> {
    logger::init(&log_filter);

    let app = router(&config, shutdown_signal.clone())?;

    let listener = TcpListener::bind(listen_address).await.map_err(Error::Bind)?;
    let local_address = listener.local_addr().map_err(Error::Bind)?;

    if config.chat.enabled {
        let prefix = config.chat.path.trim_end_matches('/');
        log::info!("Chat completions endpoint available at: http://{local_address}{prefix}/v1/chat/completions");
    }

    if config.server.health.enabled {
        log::info!(
            "Health endpoint available at: http://{local_address}{}",
            config.server.health.path
        );
    }

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal.cancelled_owned())
        .await
        .map_err(Error::Server)?;

    log::info!("Server stopped");

    Ok(())
}

/// Builds the application router from the configuration.
///
/// Runs started by the chat endpoint are cancelled together with `shutdown`.
pub fn router(config: &Config, shutdown: CancellationToken) -> crate::Result<Router> {
    let mut app = Router::new();

    if config.chat.enabled {
        let runtime = chat::runtime_from_config(&config.chat.runtime).map_err(Error::Runtime)?;

        log::debug!("Serving chat completions with the {} runtime", runtime.name());

        let handler = ChatHandler::new(runtime)
            .with_tracer(Arc::new(LogTracer))
            .with_shutdown(shutdown)
            .with_project_id(chat::project_id(&config.chat.runtime));

        app = app.merge(chat::router(&config.chat, handler));
    }

    if config.server.health.enabled {
        app = app.route(&config.server.health.path, get(health::health));
    }

    Ok(app)
}
