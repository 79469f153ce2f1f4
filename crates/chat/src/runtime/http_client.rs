use std::time::Duration;

use axum::http;
use reqwest::Client;

/// Client builder tuned for long-lived streaming calls to one upstream.
pub(super) fn default_http_client_builder(timeout: Duration) -> reqwest::ClientBuilder {
    let mut headers = http::HeaderMap::new();
    headers.insert(http::header::CONNECTION, http::HeaderValue::from_static("keep-alive"));

    Client::builder()
        .timeout(timeout)
        .connect_timeout(Duration::from_secs(10))
        // The pool has no connection TTL, a short idle timeout is what lets us
        // pick up DNS changes of the upstream.
        .pool_idle_timeout(Some(Duration::from_secs(5)))
        .tcp_nodelay(true)
        .tcp_keepalive(Some(Duration::from_secs(60)))
        .default_headers(headers)
}
