mod completions;
mod errors;
mod sessions;
mod streaming;

use serde_json::{Value, json};

fn user_request(session_id: &str, content: &str) -> Value {
    json!({
        "model": "data-agent",
        "session_id": session_id,
        "messages": [{ "role": "user", "content": content }]
    })
}

fn content_of(chunks: &[Value]) -> String {
    chunks
        .iter()
        .filter_map(|chunk| chunk["choices"][0]["delta"]["content"].as_str())
        .collect()
}
