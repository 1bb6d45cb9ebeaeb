// Integration tests for `TokenClient` using wiremock.

use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde_json::json;
use url::Url;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use cuss2_api::Error;
use cuss2_api::token::TokenClient;

// ── Helpers ─────────────────────────────────────────────────────────

async fn setup() -> (MockServer, TokenClient) {
    let server = MockServer::start().await;
    let token_url = Url::parse(&format!("{}/oauth/token", server.uri())).unwrap();
    let client = TokenClient::new(
        token_url,
        "kiosk-app",
        SecretString::from("s3cret".to_string()),
    )
    .unwrap();
    (server, client)
}

// ── Happy path ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_authorize_posts_credentials_and_parses_token() {
    let (server, client) = setup().await;

    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .and(body_partial_json(json!({
            "client_id": "kiosk-app",
            "client_secret": "s3cret",
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "abc.def.ghi",
            "expires_in": 3600,
        })))
        .mount(&server)
        .await;

    let token = client.authorize().await.unwrap();
    assert_eq!(token.access_token.expose_secret(), "abc.def.ghi");
    assert_eq!(token.ttl(), Some(Duration::from_secs(3600)));
}

#[tokio::test]
async fn test_authorize_treats_zero_expiry_as_unexpiring() {
    let (server, client) = setup().await;

    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "abc.def.ghi",
            "expires_in": 0,
        })))
        .mount(&server)
        .await;

    let token = client.authorize().await.unwrap();
    assert_eq!(token.ttl(), None);
}

// ── Failure paths ───────────────────────────────────────────────────

#[tokio::test]
async fn test_authorize_rejected_credentials() {
    let (server, client) = setup().await;

    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "error": "invalid_client",
        })))
        .mount(&server)
        .await;

    let err = client.authorize().await.unwrap_err();
    match err {
        Error::Authorization { message } => {
            assert!(message.contains("401"), "message: {message}");
        }
        other => panic!("expected Authorization error, got: {other:?}"),
    }
    assert!(client.authorize().await.unwrap_err().is_auth());
}

#[tokio::test]
async fn test_authorize_malformed_token_body() {
    let (server, client) = setup().await;

    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
        .mount(&server)
        .await;

    let err = client.authorize().await.unwrap_err();
    match err {
        Error::Authorization { message } => {
            assert!(message.contains("undecodable"), "message: {message}");
        }
        other => panic!("expected Authorization error, got: {other:?}"),
    }
}

#[tokio::test]
async fn test_authorize_unreachable_endpoint() {
    let (server, client) = setup().await;
    // Stopping the server leaves the port closed.
    drop(server);

    let err = client.authorize().await.unwrap_err();
    match err {
        Error::Authorization { message } => {
            assert!(message.contains("token request failed"), "message: {message}");
        }
        other => panic!("expected Authorization error, got: {other:?}"),
    }
}
