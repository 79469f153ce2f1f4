mod chat;

use indoc::indoc;
use integration_tests::*;

#[tokio::test]
async fn health_endpoint() {
    let server = TestServer::start("").await;

    let response = server.client.get("/health").await;
    assert_eq!(response.status(), 200);

    let body = response.text().await.unwrap();
    insta::assert_snapshot!(body, @r#"{"status":"healthy"}"#);
}

#[tokio::test]
async fn custom_health_path() {
    let config = indoc! {r#"
        [server.health]
        path = "/ready"
    "#};

    let server = TestServer::start(config).await;

    let response = server.client.get("/ready").await;
    assert_eq!(response.status(), 200);

    let response = server.client.get("/health").await;
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn chat_can_be_disabled() {
    let config = indoc! {r#"
        [chat]
        enabled = false
    "#};

    let server = TestServer::start(config).await;

    let response = server.client.get("/v1/models").await;
    assert_eq!(response.status(), 404);
}
