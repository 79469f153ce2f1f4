use indoc::indoc;
use integration_tests::{OpenAIMock, TestServer};
use serde_json::json;

use super::user_request;

#[tokio::test]
async fn aggregates_the_run_into_one_response() {
    let mut builder = TestServer::builder();
    builder.spawn_llm(OpenAIMock::new("gpt-4o-mini")).await;

    let server = builder.build("").await;
    let body = server.completions(user_request("buffered-1", "Say hello")).send().await;

    insta::with_settings!({ sort_maps => true }, {
        insta::assert_json_snapshot!(body, {
            ".id" => "[id]",
            ".created" => "[created]"
        }, @r#"
        {
          "choices": [
            {
              "finish_reason": "stop",
              "index": 0,
              "message": {
                "content": "Hello from the agent",
                "role": "assistant"
              }
            }
          ],
          "created": "[created]",
          "id": "[id]",
          "model": "data-agent",
          "object": "chat.completion",
          "usage": {
            "completion_tokens": 5,
            "prompt_tokens": 12,
            "total_tokens": 17
          }
        }
        "#);
    });
}

#[tokio::test]
async fn stream_false_is_buffered() {
    let mut builder = TestServer::builder();
    builder.spawn_llm(OpenAIMock::new("gpt-4o-mini")).await;

    let server = builder.build("").await;

    let mut request = user_request("buffered-2", "Hi");
    request["stream"] = json!(false);

    let body = server.completions(request).send().await;

    assert_eq!(body["object"], "chat.completion");
    assert!(body["id"].as_str().unwrap().starts_with("chatcmpl-"));
}

#[tokio::test]
async fn buffered_and_streamed_content_match() {
    let mut builder = TestServer::builder();
    builder
        .spawn_llm(OpenAIMock::new("gpt-4o-mini").with_chunks(&["One", ", two", ", three"]))
        .await;

    let server = builder.build("").await;

    let body = server.completions(user_request("match-1", "Count")).send().await;
    let chunks = server.completions_stream(user_request("match-2", "Count")).send().await;

    assert_eq!(body["choices"][0]["message"]["content"], super::content_of(&chunks));
}

#[tokio::test]
async fn custom_path() {
    let config = indoc! {r#"
        [chat]
        path = "/agent"
    "#};

    let mut builder = TestServer::builder();
    builder.spawn_llm(OpenAIMock::new("gpt-4o-mini")).await;

    let server = builder.build(config).await;

    let body = server.completions(user_request("custom-1", "Hi")).send().await;
    assert_eq!(body["choices"][0]["message"]["content"], "Hello from the agent");

    let response = server
        .client
        .post("/v1/chat/completions", &user_request("custom-2", "Hi"))
        .await
        .unwrap();

    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn list_models() {
    let mut builder = TestServer::builder();
    builder.spawn_llm(OpenAIMock::new("analyst-model")).await;

    let server = builder.build("").await;
    let body = server.list_models().await;

    insta::with_settings!({ sort_maps => true }, {
        insta::assert_json_snapshot!(body, {
            ".data[].created" => "[created]"
        }, @r#"
        {
          "data": [
            {
              "created": "[created]",
              "id": "analyst-model",
              "object": "model",
              "owned_by": "openai"
            }
          ],
          "object": "list"
        }
        "#);
    });
}
