use integration_tests::{OpenAIMock, TestServer};
use serde_json::json;

use super::user_request;

#[tokio::test]
async fn history_is_replayed_for_the_same_session() {
    let mut builder = TestServer::builder();
    let mock = builder.spawn_llm(OpenAIMock::new("gpt-4o-mini")).await;

    let server = builder.build("").await;

    server.completions(user_request("memory-1", "My name is Ada")).send().await;
    server.completions(user_request("memory-1", "What is my name?")).send().await;

    insta::with_settings!({ sort_maps => true }, {
        insta::assert_json_snapshot!(mock.messages(1), @r#"
        [
          {
            "content": "My name is Ada",
            "role": "user"
          },
          {
            "content": "Hello from the agent",
            "role": "assistant"
          },
          {
            "content": "What is my name?",
            "role": "user"
          }
        ]
        "#);
    });
}

#[tokio::test]
async fn sessions_are_isolated() {
    let mut builder = TestServer::builder();
    let mock = builder.spawn_llm(OpenAIMock::new("gpt-4o-mini")).await;

    let server = builder.build("").await;

    server.completions(user_request("memory-2", "First thread")).send().await;
    server.completions(user_request("memory-3", "Second thread")).send().await;

    assert_eq!(mock.messages(1), json!([{ "role": "user", "content": "Second thread" }]));
}

#[tokio::test]
async fn client_resent_history_is_not_duplicated() {
    let mut builder = TestServer::builder();
    let mock = builder.spawn_llm(OpenAIMock::new("gpt-4o-mini")).await;

    let server = builder.build("").await;

    server.completions(user_request("memory-4", "Hi")).send().await;

    let request = json!({
        "model": "data-agent",
        "session_id": "memory-4",
        "messages": [
            { "role": "user", "content": "Hi" },
            { "role": "assistant", "content": "Hello from the agent" },
            { "role": "user", "content": "And again" }
        ]
    });

    server.completions(request).send().await;

    let messages = mock.messages(1);
    assert_eq!(messages.as_array().unwrap().len(), 3);
    assert_eq!(messages[2], json!({ "role": "user", "content": "And again" }));
}

#[tokio::test]
async fn configured_system_prompt_is_prepended() {
    let mut builder = TestServer::builder();
    let mock = builder
        .spawn_llm_with_runtime(OpenAIMock::new("gpt-4o-mini"), r#"system_prompt = "You are a data analyst.""#)
        .await;

    let server = builder.build("").await;

    server.completions(user_request("memory-5", "Hi")).send().await;

    assert_eq!(
        mock.messages(0)[0],
        json!({ "role": "system", "content": "You are a data analyst." })
    );
}

#[tokio::test]
async fn request_system_message_replaces_the_configured_prompt() {
    let mut builder = TestServer::builder();
    let mock = builder
        .spawn_llm_with_runtime(OpenAIMock::new("gpt-4o-mini"), r#"system_prompt = "You are a data analyst.""#)
        .await;

    let server = builder.build("").await;

    let request = json!({
        "model": "data-agent",
        "session_id": "memory-6",
        "messages": [
            { "role": "system", "content": "Answer in French." },
            { "role": "user", "content": "Hi" }
        ]
    });

    server.completions(request).send().await;

    assert_eq!(
        mock.messages(0),
        json!([
            { "role": "system", "content": "Answer in French." },
            { "role": "user", "content": "Hi" }
        ])
    );
}

#[tokio::test]
async fn failed_runs_are_not_remembered() {
    let mut builder = TestServer::builder();
    let mock = builder
        .spawn_llm(OpenAIMock::new("gpt-4o-mini").with_mid_stream_error("model crashed"))
        .await;

    let server = builder.build("").await;

    server.completions(user_request("memory-7", "First")).send_raw().await;
    server.completions(user_request("memory-7", "Second")).send_raw().await;

    assert_eq!(mock.messages(1), json!([{ "role": "user", "content": "Second" }]));
}
