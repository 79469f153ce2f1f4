pub mod llms;

use std::net::SocketAddr;
use std::time::Duration;

use config::Config;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::json;
use server::ServeConfig;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

pub use llms::{OpenAIMock, RecordedRequest, RunningMock};

/// Test client for making HTTP requests to the test server
#[derive(Clone)]
pub struct TestClient {
    base_url: String,
    client: reqwest::Client,
}

impl TestClient {
    pub fn new(base_url: String) -> Self {
        Self {
            base_url,
            client: reqwest::Client::new(),
        }
    }

    /// Send a POST request to the given path with JSON body
    pub async fn post<T: serde::Serialize>(&self, path: &str, body: &T) -> reqwest::Result<reqwest::Response> {
        self.client.post(format!("{}{}", self.base_url, path)).json(body).send().await
    }

    /// Send a GET request to the given path
    pub async fn get(&self, path: &str) -> reqwest::Response {
        self.client
            .get(format!("{}{}", self.base_url, path))
            .send()
            .await
            .unwrap()
    }

    /// Send a GET request to the given path, returning Result instead of panicking
    pub async fn try_get(&self, path: &str) -> reqwest::Result<reqwest::Response> {
        self.client.get(format!("{}{}", self.base_url, path)).send().await
    }
}

/// Builder for chat completion requests
pub struct CompletionsRequest<'a> {
    test_server: &'a TestServer,
    request: serde_json::Value,
    headers: HeaderMap,
}

impl CompletionsRequest<'_> {
    /// Add a header to the request
    pub fn header(mut self, key: &str, value: &str) -> Self {
        let header_name = HeaderName::from_bytes(key.as_bytes()).unwrap();
        let header_value = HeaderValue::from_str(value).unwrap();
        self.headers.insert(header_name, header_value);
        self
    }

    fn builder(&self, body: &serde_json::Value) -> reqwest::RequestBuilder {
        self.test_server
            .client
            .client
            .post(self.test_server.completions_url())
            .headers(self.headers.clone())
            .json(body)
    }

    /// Send the request and return the response
    pub async fn send(self) -> serde_json::Value {
        let response = self.builder(&self.request).send().await.unwrap();
        let status = response.status();

        #[allow(clippy::panic)]
        if status != 200 {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read error".to_string());
            panic!("Expected 200 status, got {status}: {error_text}");
        }

        response.json().await.unwrap()
    }

    /// Send the request and return status code and body (for error testing)
    pub async fn send_raw(self) -> (u16, serde_json::Value) {
        let response = self.builder(&self.request).send().await.unwrap();
        let status = response.status().as_u16();
        let body = response.json().await.unwrap();

        (status, body)
    }
}

/// Builder for streaming chat completion requests
pub struct CompletionsStreamRequest<'a> {
    inner: CompletionsRequest<'a>,
}

impl CompletionsStreamRequest<'_> {
    /// Add a header to the request
    pub fn header(mut self, key: &str, value: &str) -> Self {
        self.inner = self.inner.header(key, value);
        self
    }

    /// Send the request and return the raw event stream body
    pub async fn send_raw(self) -> String {
        // Ensure streaming is enabled
        let mut request = self.inner.request.clone();
        request["stream"] = json!(true);

        let response = self.inner.builder(&request).send().await.unwrap();

        assert_eq!(response.status(), 200);
        assert_eq!(response.headers().get("content-type").unwrap(), "text/event-stream");

        response.text().await.unwrap()
    }

    /// Send the request and return streaming chunks, without the `[DONE]` marker
    pub async fn send(self) -> Vec<serde_json::Value> {
        use eventsource_stream::Eventsource;
        use futures::StreamExt;

        let body = self.send_raw().await;
        let bytes = futures::stream::iter([Ok::<_, std::convert::Infallible>(body.into_bytes())]);

        bytes
            .eventsource()
            .filter_map(|event| async move {
                match event {
                    Ok(event) if event.data.is_empty() || event.data == "[DONE]" => None,
                    Ok(event) => serde_json::from_str::<serde_json::Value>(&event.data).ok(),
                    Err(_) => None,
                }
            })
            .collect()
            .await
    }
}

/// Test server that manages the lifecycle of a server instance
pub struct TestServer {
    pub client: TestClient,
    pub address: SocketAddr,
    /// Configuration used by this test server
    pub config: Config,
    /// Cancellation tokens for upstream mocks
    pub test_service_tokens: Vec<CancellationToken>,
    _server_task_handle: tokio::task::JoinHandle<()>,
    shutdown_signal: CancellationToken,
}

impl TestServer {
    pub fn builder() -> TestServerBuilder {
        TestServerBuilder::default()
    }

    /// Start a new test server with the given TOML configuration and no upstream
    pub async fn start(config_toml: &str) -> Self {
        Self::start_with_services(config_toml, Vec::new()).await
    }

    async fn start_with_services(config_toml: &str, test_service_tokens: Vec<CancellationToken>) -> Self {
        // Write config to a temporary file and use the proper loader to ensure validation
        let temp_dir = tempfile::tempdir().unwrap();
        let config_path = temp_dir.path().join("agentgate.toml");
        std::fs::write(&config_path, config_toml).unwrap();

        let config = Config::load(&config_path).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();

        let shutdown_signal = CancellationToken::new();

        let serve_config = ServeConfig {
            listen_address: address,
            config: config.clone(),
            shutdown_signal: shutdown_signal.clone(),
            log_filter: "server=debug,chat=debug,config=debug,integration_tests=debug".to_string(),
        };

        let (tx, mut rx) = tokio::sync::oneshot::channel();

        let server_task_handle = tokio::spawn(async move {
            // Drop the listener so the server can bind to the address
            drop(listener);

            let _ = tx.send(server::serve(serve_config).await);
        });

        let client = TestClient::new(format!("http://{address}"));
        let health_path = config.server.health.path.clone();

        let mut retries = 30;
        let mut last_error = None;

        while retries > 0 {
            #[allow(clippy::panic)]
            if let Ok(Err(e)) = rx.try_recv() {
                panic!("Server failed to start: {e}");
            }

            match client.try_get(&health_path).await {
                Ok(_) => break,
                Err(e) => last_error = Some(e),
            }

            retries -= 1;
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        #[allow(clippy::panic)]
        if retries == 0 {
            match last_error {
                Some(e) => panic!("Server failed to become ready after 30 retries. Last error: {e}"),
                None => panic!("Server failed to become ready after 30 retries. No specific error."),
            }
        }

        TestServer {
            client,
            address,
            config,
            test_service_tokens,
            _server_task_handle: server_task_handle,
            shutdown_signal,
        }
    }

    fn chat_prefix(&self) -> String {
        format!("http://{}{}", self.address, self.config.chat.path.trim_end_matches('/'))
    }

    fn completions_url(&self) -> String {
        format!("{}/v1/chat/completions", self.chat_prefix())
    }

    /// Create a chat completions request builder
    pub fn completions(&self, request: serde_json::Value) -> CompletionsRequest<'_> {
        CompletionsRequest {
            test_server: self,
            request,
            headers: HeaderMap::new(),
        }
    }

    /// Create a streaming chat completions request builder
    pub fn completions_stream(&self, request: serde_json::Value) -> CompletionsStreamRequest<'_> {
        CompletionsStreamRequest {
            inner: self.completions(request),
        }
    }

    /// Post a raw, possibly malformed, body to the completions endpoint
    pub async fn completions_body(&self, body: &str) -> (u16, serde_json::Value) {
        let response = self
            .client
            .client
            .post(self.completions_url())
            .header("content-type", "application/json")
            .body(body.to_string())
            .send()
            .await
            .unwrap();

        let status = response.status().as_u16();
        (status, response.json().await.unwrap())
    }

    pub async fn list_models(&self) -> serde_json::Value {
        let url = format!("{}/v1/models", self.chat_prefix());
        let response = self.client.client.get(&url).send().await.unwrap();

        assert_eq!(response.status(), 200);
        response.json().await.unwrap()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        for token in &self.test_service_tokens {
            token.cancel();
        }

        self.shutdown_signal.cancel();
    }
}

#[derive(Default)]
pub struct TestServerBuilder {
    config: String,
    /// Cancellation tokens for test services that will be spawned
    test_service_tokens: Vec<CancellationToken>,
}

impl TestServerBuilder {
    /// Spawn a mock upstream model and point the runtime at it
    pub async fn spawn_llm(&mut self, mock: OpenAIMock) -> RunningMock {
        self.spawn_llm_with_runtime(mock, "").await
    }

    /// Like [`Self::spawn_llm`], appending `runtime_config` to the `[chat.runtime]` table
    pub async fn spawn_llm_with_runtime(&mut self, mock: OpenAIMock, runtime_config: &str) -> RunningMock {
        let running = mock.spawn().await.unwrap();

        self.test_service_tokens.push(running.shutdown_token());
        self.config.push_str(&running.config());
        self.config.push_str(runtime_config);
        self.config.push('\n');

        running
    }

    pub async fn build(self, config: &str) -> TestServer {
        let mut final_config = config.to_string();

        final_config.push('\n');
        final_config.push_str(&self.config);

        TestServer::start_with_services(&final_config, self.test_service_tokens).await
    }
}
