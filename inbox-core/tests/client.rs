use inbox_core::{ApiErrorClass, InboxClient, InboxError, NewDocument};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn sample_document() -> NewDocument {
    NewDocument {
        file_name: "invoice.pdf".into(),
        mime_type: "application/pdf".into(),
        bytes: b"%PDF-1.4 payload".to_vec(),
        user_id: "user-1".into(),
        source_key: "abc123".into(),
    }
}

#[tokio::test]
async fn upload_document_posts_multipart_record() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/collections/files_inbox/records"))
        .and(header("authorization", "test-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "id": "rec-42",
            "name": "invoice.pdf"
        })))
        .mount(&server)
        .await;

    let client = InboxClient::new(&server.uri(), "test-token").unwrap();
    let record = client.upload_document(sample_document()).await.unwrap();
    assert_eq!(record.id, "rec-42");
    assert_eq!(record.name, "invoice.pdf");

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    let body = String::from_utf8_lossy(&requests[0].body);
    assert!(body.contains("name=\"file\""));
    assert!(body.contains("invoice.pdf"));
    assert!(body.contains("abc123"));
    assert!(body.contains("pending"));
}

#[tokio::test]
async fn upload_document_surfaces_api_errors_with_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/collections/files_inbox/records"))
        .respond_with(ResponseTemplate::new(400).set_body_string("unsupported file"))
        .mount(&server)
        .await;

    let client = InboxClient::new(&server.uri(), "test-token").unwrap();
    let err = client
        .upload_document(sample_document())
        .await
        .expect_err("expected rejection");

    match &err {
        InboxError::Api { status, body } => {
            assert_eq!(status.as_u16(), 400);
            assert_eq!(body, "unsupported file");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(err.classification(), Some(ApiErrorClass::Permanent));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn server_errors_are_retryable() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/collections/files_inbox/records"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let client = InboxClient::new(&server.uri(), "test-token").unwrap();
    let err = client
        .upload_document(sample_document())
        .await
        .expect_err("expected server error");
    assert_eq!(err.classification(), Some(ApiErrorClass::Transient));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn auth_failures_are_classified() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/collections/files_inbox/records"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let client = InboxClient::new(&server.uri(), "stale-token").unwrap();
    let err = client
        .upload_document(sample_document())
        .await
        .expect_err("expected auth error");
    assert_eq!(err.classification(), Some(ApiErrorClass::Auth));
}

#[tokio::test]
async fn check_health_succeeds_on_any_http_response() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/health"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let client = InboxClient::new(&server.uri(), "test-token").unwrap();
    client
        .check_health()
        .await
        .expect("an HTTP response means the server is reachable");
}

#[tokio::test]
async fn check_health_fails_when_unreachable() {
    // Port taken from a server that is immediately dropped. An exclusive
    // (non-pooled) server is required: pooled servers keep their listener
    // bound after drop, so the port would still answer.
    let server = MockServer::builder().start().await;
    let uri = server.uri();
    drop(server);

    let client = InboxClient::new(&uri, "test-token").unwrap();
    let err = client.check_health().await.expect_err("expected no route");
    assert!(err.is_connectivity());
}
