use integration_tests::{OpenAIMock, TestServer};
use serde_json::json;

use super::{content_of, user_request};

#[tokio::test]
async fn streams_deltas_then_finish() {
    let mut builder = TestServer::builder();
    builder.spawn_llm(OpenAIMock::new("gpt-4o-mini").with_chunks(&["Hel", "lo"])).await;

    let server = builder.build("").await;
    let chunks = server.completions_stream(user_request("stream-1", "Say hello")).send().await;

    assert_eq!(content_of(&chunks), "Hello");

    insta::with_settings!({ sort_maps => true }, {
        insta::assert_json_snapshot!(chunks, {
            "[].id" => "[id]",
            "[].created" => "[created]"
        }, @r#"
        [
          {
            "choices": [
              {
                "delta": {
                  "content": "Hel",
                  "role": "assistant"
                },
                "finish_reason": null,
                "index": 0
              }
            ],
            "created": "[created]",
            "id": "[id]",
            "model": "data-agent",
            "object": "chat.completion.chunk"
          },
          {
            "choices": [
              {
                "delta": {
                  "content": "lo"
                },
                "finish_reason": null,
                "index": 0
              }
            ],
            "created": "[created]",
            "id": "[id]",
            "model": "data-agent",
            "object": "chat.completion.chunk"
          },
          {
            "choices": [
              {
                "delta": {},
                "finish_reason": "stop",
                "index": 0
              }
            ],
            "created": "[created]",
            "id": "[id]",
            "model": "data-agent",
            "object": "chat.completion.chunk"
          }
        ]
        "#);
    });
}

#[tokio::test]
async fn every_chunk_shares_the_request_id() {
    let mut builder = TestServer::builder();
    builder.spawn_llm(OpenAIMock::new("gpt-4o-mini")).await;

    let server = builder.build("").await;
    let chunks = server.completions_stream(user_request("stream-2", "Hi")).send().await;

    let id = chunks[0]["id"].as_str().unwrap();
    assert!(id.starts_with("chatcmpl-"));
    assert!(chunks.iter().all(|chunk| chunk["id"] == id));
    assert!(chunks.iter().all(|chunk| chunk["created"] == chunks[0]["created"]));
}

#[tokio::test]
async fn ends_with_a_single_done_marker() {
    let mut builder = TestServer::builder();
    builder.spawn_llm(OpenAIMock::new("gpt-4o-mini")).await;

    let server = builder.build("").await;
    let body = server.completions_stream(user_request("stream-3", "Hi")).send_raw().await;

    assert!(body.ends_with("data: [DONE]\n\n"));
    assert_eq!(body.matches("[DONE]").count(), 1);
    assert!(body.split("\n\n").filter(|frame| !frame.is_empty()).all(|frame| frame.starts_with("data: ")));
}

#[tokio::test]
async fn usage_on_the_finish_chunk_when_requested() {
    let mut builder = TestServer::builder();
    builder.spawn_llm(OpenAIMock::new("gpt-4o-mini")).await;

    let server = builder.build("").await;

    let mut request = user_request("stream-4", "Hi");
    request["stream_options"] = json!({ "include_usage": true });

    let chunks = server.completions_stream(request).send().await;
    let last = chunks.last().unwrap();

    assert_eq!(last["choices"][0]["finish_reason"], "stop");
    assert_eq!(
        last["usage"],
        json!({ "prompt_tokens": 12, "completion_tokens": 5, "total_tokens": 17 })
    );

    let chunks = server.completions_stream(user_request("stream-5", "Hi")).send().await;
    assert!(chunks.iter().all(|chunk| chunk.get("usage").is_none()));
}

#[tokio::test]
async fn upstream_finish_reason_is_forwarded() {
    let mut builder = TestServer::builder();
    builder
        .spawn_llm(OpenAIMock::new("gpt-4o-mini").with_finish_reason("length"))
        .await;

    let server = builder.build("").await;
    let chunks = server.completions_stream(user_request("stream-6", "Hi")).send().await;

    assert_eq!(chunks.last().unwrap()["choices"][0]["finish_reason"], "length");
}

#[tokio::test]
async fn runtime_receives_the_request_id() {
    let mut builder = TestServer::builder();
    let mock = builder.spawn_llm(OpenAIMock::new("gpt-4o-mini")).await;

    let server = builder.build("").await;
    server
        .completions_stream(user_request("stream-7", "Hi"))
        .header("X-Request-Id", "req-42")
        .send()
        .await;

    let requests = mock.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].request_id.as_deref(), Some("req-42"));
    assert_eq!(requests[0].authorization.as_deref(), Some("Bearer test-key"));
    assert_eq!(requests[0].body["model"], "gpt-4o-mini");
    assert_eq!(requests[0].body["stream"], true);
}
