use integration_tests::{OpenAIMock, TestServer};
use serde_json::json;

use super::user_request;

#[tokio::test]
async fn malformed_body() {
    let mut builder = TestServer::builder();
    let mock = builder.spawn_llm(OpenAIMock::new("gpt-4o-mini")).await;

    let server = builder.build("").await;
    let (status, body) = server.completions_body("{not json").await;

    assert_eq!(status, 400);
    assert_eq!(body["error"]["type"], "invalid_request_error");
    assert_eq!(body["error"]["code"], "400000");
    assert!(mock.requests().is_empty());
}

#[tokio::test]
async fn empty_messages() {
    let mut builder = TestServer::builder();
    let mock = builder.spawn_llm(OpenAIMock::new("gpt-4o-mini")).await;

    let server = builder.build("").await;

    let request = json!({ "model": "data-agent", "session_id": "s-1", "messages": [] });
    let (status, body) = server.completions(request).send_raw().await;

    assert_eq!(status, 400);
    insta::with_settings!({ sort_maps => true }, {
        insta::assert_json_snapshot!(body, @r#"
        {
          "error": {
            "code": "400003",
            "message": "Invalid request: 'messages' must contain at least one message",
            "type": "invalid_request_error"
          }
        }
        "#);
    });

    assert!(mock.requests().is_empty());
}

#[tokio::test]
async fn missing_session() {
    let mut builder = TestServer::builder();
    let mock = builder.spawn_llm(OpenAIMock::new("gpt-4o-mini")).await;

    let server = builder.build("").await;

    let request = json!({ "model": "data-agent", "messages": [{ "role": "user", "content": "Hi" }] });
    let (status, body) = server.completions(request).send_raw().await;

    assert_eq!(status, 400);
    assert_eq!(body["error"]["code"], "400001");
    assert_eq!(body["error"]["message"], "session_id is required");
    assert!(mock.requests().is_empty());
}

#[tokio::test]
async fn session_from_header() {
    let mut builder = TestServer::builder();
    let mock = builder.spawn_llm(OpenAIMock::new("gpt-4o-mini")).await;

    let server = builder.build("").await;

    let request = json!({ "model": "data-agent", "messages": [{ "role": "user", "content": "Hi" }] });
    let body = server.completions(request).header("X-Session-Id", "from-header").send().await;

    assert_eq!(body["choices"][0]["message"]["content"], "Hello from the agent");
    assert_eq!(mock.requests().len(), 1);
}

#[tokio::test]
async fn no_user_message_after_last_assistant() {
    let mut builder = TestServer::builder();
    let mock = builder.spawn_llm(OpenAIMock::new("gpt-4o-mini")).await;

    let server = builder.build("").await;

    let request = json!({
        "model": "data-agent",
        "session_id": "s-2",
        "messages": [
            { "role": "user", "content": "Hi" },
            { "role": "assistant", "content": "Hello" }
        ]
    });

    let (status, body) = server.completions(request).send_raw().await;

    assert_eq!(status, 400);
    assert_eq!(body["error"]["code"], "400002");
    assert!(mock.requests().is_empty());
}

#[tokio::test]
async fn upstream_not_found() {
    let mut builder = TestServer::builder();
    builder
        .spawn_llm(OpenAIMock::new("gpt-4o-mini").with_status(404, "model does not exist"))
        .await;

    let server = builder.build("").await;
    let (status, body) = server.completions(user_request("s-3", "Hi")).send_raw().await;

    assert_eq!(status, 404);
    assert_eq!(body["error"]["type"], "not_found_error");
    assert_eq!(body["error"]["code"], "404001");
    assert!(body["error"]["message"].as_str().unwrap().contains("model does not exist"));
}

#[tokio::test]
async fn upstream_gateway_timeout() {
    let mut builder = TestServer::builder();
    builder
        .spawn_llm(OpenAIMock::new("gpt-4o-mini").with_status(504, "upstream timed out"))
        .await;

    let server = builder.build("").await;
    let (status, body) = server.completions(user_request("s-4", "Hi")).send_raw().await;

    assert_eq!(status, 408);
    assert_eq!(body["error"]["type"], "timeout_error");
    assert_eq!(body["error"]["code"], "408001");
}

#[tokio::test]
async fn upstream_server_error() {
    let mut builder = TestServer::builder();
    builder
        .spawn_llm(OpenAIMock::new("gpt-4o-mini").with_status(503, "overloaded"))
        .await;

    let server = builder.build("").await;
    let (status, body) = server.completions(user_request("s-5", "Hi")).send_raw().await;

    assert_eq!(status, 500);
    assert_eq!(body["error"]["type"], "internal_error");
    assert_eq!(body["error"]["code"], "500002");
}

#[tokio::test]
async fn upstream_error_in_stream_mode_is_reported_in_band() {
    let mut builder = TestServer::builder();
    builder
        .spawn_llm(OpenAIMock::new("gpt-4o-mini").with_status(404, "model does not exist"))
        .await;

    let server = builder.build("").await;
    let body = server.completions_stream(user_request("s-6", "Hi")).send_raw().await;

    assert!(body.ends_with("data: [DONE]\n\n"));

    let chunks = server.completions_stream(user_request("s-7", "Hi")).send().await;

    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0]["object"], "chat.completion.chunk");
    assert_eq!(chunks[0]["error"]["type"], "not_found_error");
    assert_eq!(chunks[0]["error"]["code"], "404001");
}

#[tokio::test]
async fn mid_stream_error() {
    let mut builder = TestServer::builder();
    builder
        .spawn_llm(
            OpenAIMock::new("gpt-4o-mini")
                .with_chunks(&["Partial"])
                .with_mid_stream_error("connection reset by model"),
        )
        .await;

    let server = builder.build("").await;
    let body = server.completions_stream(user_request("s-8", "Hi")).send_raw().await;

    assert_eq!(body.matches("[DONE]").count(), 1);
    assert!(body.ends_with("data: [DONE]\n\n"));

    let chunks = server.completions_stream(user_request("s-9", "Hi")).send().await;

    assert_eq!(super::content_of(&chunks), "Partial");

    let last = chunks.last().unwrap();
    assert_eq!(last["error"]["type"], "internal_error");
    assert_eq!(last["error"]["code"], "500002");
    assert!(last["error"]["message"].as_str().unwrap().contains("connection reset by model"));
    assert!(chunks.iter().all(|chunk| chunk["choices"][0]["finish_reason"] != "stop"));
}

#[tokio::test]
async fn mid_stream_error_in_buffered_mode() {
    let mut builder = TestServer::builder();
    builder
        .spawn_llm(OpenAIMock::new("gpt-4o-mini").with_mid_stream_error("model crashed"))
        .await;

    let server = builder.build("").await;
    let (status, body) = server.completions(user_request("s-10", "Hi")).send_raw().await;

    assert_eq!(status, 500);
    assert_eq!(body["error"]["code"], "500002");
}
