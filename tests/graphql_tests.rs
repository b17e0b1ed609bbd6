//! Tests for the GraphQL client against a minimal in-test HTTP responder.

use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use klientel_sync::graphql::{CommentApi, GraphqlClient};
use klientel_sync::{Credential, SyncError};

/// What the responder saw.
#[derive(Debug)]
struct Captured {
    method: String,
    path: String,
    authorization: Option<String>,
    body: serde_json::Value,
}

/// Answer exactly one request with `status` and `reply`.
async fn serve_once(status: u16, reply: String) -> (String, JoinHandle<Captured>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/graphql", listener.local_addr().unwrap());

    let handle = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];

        let (header_len, method, path, authorization, content_length) = loop {
            let n = stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "client closed before sending headers");
            buf.extend_from_slice(&chunk[..n]);

            let mut headers = [httparse::EMPTY_HEADER; 32];
            let mut req = httparse::Request::new(&mut headers);
            if let httparse::Status::Complete(len) = req.parse(&buf).unwrap() {
                let header = |name: &str| {
                    req.headers
                        .iter()
                        .find(|h| h.name.eq_ignore_ascii_case(name))
                        .map(|h| String::from_utf8_lossy(h.value).into_owned())
                };
                let content_length = header("content-length")
                    .and_then(|v| v.parse::<usize>().ok())
                    .unwrap_or(0);
                let authorization = header("authorization");
                break (
                    len,
                    req.method.unwrap_or_default().to_string(),
                    req.path.unwrap_or_default().to_string(),
                    authorization,
                    content_length,
                );
            }
        };

        while buf.len() < header_len + content_length {
            let n = stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "client closed mid-body");
            buf.extend_from_slice(&chunk[..n]);
        }
        let body = serde_json::from_slice(&buf[header_len..header_len + content_length])
            .unwrap_or(serde_json::Value::Null);

        let response = format!(
            "HTTP/1.1 {status} Status\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{reply}",
            reply.len()
        );
        stream.write_all(response.as_bytes()).await.unwrap();
        stream.flush().await.unwrap();

        Captured {
            method,
            path,
            authorization,
            body,
        }
    });
    (url, handle)
}

fn client(url: &str) -> GraphqlClient {
    GraphqlClient::builder(url).build().unwrap()
}

fn token() -> Credential {
    Credential::new("tok-123")
}

// ---------------------------------------------------------------------------
// fetch_comments
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_fetch_comments_sends_query_and_bearer() {
    let reply = json!({"data": {"comments": [
        {"id": "c1", "leadId": "42", "userId": "u1", "content": "first", "createdAt": "2024-06-01T10:00:00"},
        {"id": "c2", "leadId": "42", "userId": "u2", "content": "second", "createdAt": "2024-06-01T10:01:00.500000"}
    ]}});
    let (url, server) = serve_once(200, reply.to_string()).await;

    let comments = client(&url).fetch_comments(&token(), "42").await.unwrap();
    assert_eq!(comments.len(), 2);
    assert_eq!(comments[0].id, "c1");
    assert_eq!(comments[1].user_id.as_deref(), Some("u2"));

    let seen = server.await.unwrap();
    assert_eq!(seen.method, "POST");
    assert_eq!(seen.path, "/graphql");
    assert_eq!(seen.authorization.as_deref(), Some("Bearer tok-123"));
    assert_eq!(seen.body["variables"]["leadId"], "42");
    assert!(seen.body["query"].as_str().unwrap().contains("comments(leadId: $leadId)"));
}

#[tokio::test]
async fn test_fetch_comments_empty_list() {
    let (url, _server) = serve_once(200, json!({"data": {"comments": []}}).to_string()).await;
    let comments = client(&url).fetch_comments(&token(), "42").await.unwrap();
    assert!(comments.is_empty());
}

// ---------------------------------------------------------------------------
// add_comment
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_add_comment_sends_input_and_returns_confirmed_comment() {
    let reply = json!({"data": {"addComment": {"comment":
        {"id": "c1", "leadId": "lead-42", "userId": "u1", "content": "hello", "createdAt": "2024-06-01T10:00:00"}
    }}});
    let (url, server) = serve_once(200, reply.to_string()).await;

    let comment = client(&url).add_comment(&token(), "lead-42", "hello").await.unwrap();
    assert_eq!(comment.id, "c1");
    assert_eq!(comment.lead_id, "lead-42");
    assert!(!comment.provisional);

    let seen = server.await.unwrap();
    assert_eq!(seen.body["variables"]["input"], json!({"leadId": "lead-42", "content": "hello"}));
    assert!(seen.body["query"].as_str().unwrap().starts_with("mutation AddComment"));
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_graphql_errors_use_first_message() {
    let reply = json!({"data": null, "errors": [{"message": "Insufficient credits"}, {"message": "second"}]});
    let (url, _server) = serve_once(200, reply.to_string()).await;

    let err = client(&url).add_comment(&token(), "1", "x").await.unwrap_err();
    assert!(matches!(&err, SyncError::Mutation { message } if message == "Insufficient credits"), "{err:?}");
}

#[tokio::test]
async fn test_graphql_errors_win_over_partial_data() {
    let reply = json!({"data": {"addComment": null}, "errors": [{"message": "Lead not found"}]});
    let (url, _server) = serve_once(200, reply.to_string()).await;

    let err = client(&url).add_comment(&token(), "1", "x").await.unwrap_err();
    assert_eq!(err.to_string(), "Lead not found");
}

#[tokio::test]
async fn test_graphql_errors_on_error_status_still_use_message() {
    let reply = json!({"errors": [{"message": "Unauthorized"}]});
    let (url, _server) = serve_once(401, reply.to_string()).await;

    let err = client(&url).fetch_comments(&token(), "1").await.unwrap_err();
    assert_eq!(err.to_string(), "Unauthorized");
}

#[tokio::test]
async fn test_non_json_error_status_is_http_error() {
    let (url, _server) = serve_once(502, "Bad Gateway".to_string()).await;

    let err = client(&url).fetch_comments(&token(), "1").await.unwrap_err();
    assert!(matches!(err, SyncError::Http { status: 502, .. }), "{err:?}");
}

#[tokio::test]
async fn test_garbage_body_is_json_error() {
    let (url, _server) = serve_once(200, "not json".to_string()).await;

    let err = client(&url).fetch_comments(&token(), "1").await.unwrap_err();
    assert!(matches!(err, SyncError::Json { .. }), "{err:?}");
}

#[tokio::test]
async fn test_missing_data_is_json_error() {
    let (url, _server) = serve_once(200, json!({"data": null}).to_string()).await;

    let err = client(&url).fetch_comments(&token(), "1").await.unwrap_err();
    assert!(matches!(&err, SyncError::Json { field, .. } if field == "data"), "{err:?}");
}

#[tokio::test]
async fn test_wrong_data_shape_is_json_error() {
    let (url, _server) = serve_once(200, json!({"data": {"comments": "nope"}}).to_string()).await;

    let err = client(&url).fetch_comments(&token(), "1").await.unwrap_err();
    assert!(matches!(err, SyncError::Json { .. }), "{err:?}");
}

#[tokio::test]
async fn test_unreachable_server_is_connect_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/graphql", listener.local_addr().unwrap());
    drop(listener);

    let err = client(&url).fetch_comments(&token(), "1").await.unwrap_err();
    assert!(matches!(err, SyncError::Connect { .. }), "{err:?}");
    assert!(err.is_user_visible());
}
