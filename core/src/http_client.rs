/// Shared HTTP client plumbing for the REST and realtime collaborators
use crate::error::SyncError;
use crate::model::Credential;
use bytes::Bytes;
use http::{header, Method, Request, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;

pub type HttpClient = Client<HttpConnector, Full<Bytes>>;

pub fn new_client() -> HttpClient {
    Client::builder(TokioExecutor::new()).build_http()
}

/// Build a request carrying the bearer credential
pub fn authorized_request(
    method: Method,
    uri: &str,
    credential: &Credential,
    accept: &str,
    body: Option<Vec<u8>>,
) -> Result<Request<Full<Bytes>>, SyncError> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {}", credential.token))
        .header(header::ACCEPT, accept);
    if body.is_some() {
        builder = builder.header(header::CONTENT_TYPE, "application/json");
    }
    builder
        .body(Full::new(Bytes::from(body.unwrap_or_default())))
        .map_err(|e| SyncError::Config(format!("Invalid request for {}: {}", uri, e)))
}

pub async fn read_body(body: Incoming) -> Result<Bytes, SyncError> {
    body.collect()
        .await
        .map(|c| c.to_bytes())
        .map_err(|e| SyncError::Network(format!("body read error: {}", e)))
}

/// Map a non-success status to the error taxonomy
pub fn status_error(status: StatusCode, body: &[u8]) -> SyncError {
    let message = error_message(body);
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => SyncError::Auth(message),
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            SyncError::Network(format!("{}: {}", status, message))
        }
        s if s.is_server_error() => SyncError::Network(format!("{}: {}", status, message)),
        s => SyncError::Rejected {
            status: s.as_u16(),
            message,
        },
    }
}

/// Pull `{"error": "..."}` out of a body, or fall back to its text
fn error_message(body: &[u8]) -> String {
    serde_json::from_slice::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
        .unwrap_or_else(|| String::from_utf8_lossy(body).trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert!(status_error(StatusCode::UNAUTHORIZED, b"").is_auth());
        assert!(status_error(StatusCode::BAD_GATEWAY, b"").is_retriable());
        assert!(status_error(StatusCode::TOO_MANY_REQUESTS, b"").is_retriable());
        match status_error(StatusCode::UNPROCESSABLE_ENTITY, br#"{"error":"empty message"}"#) {
            SyncError::Rejected { status, message } => {
                assert_eq!(status, 422);
                assert_eq!(message, "empty message");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_authorized_request_headers() {
        let cred = Credential::new("u1", "tok");
        let req = authorized_request(
            Method::POST,
            "http://localhost/x",
            &cred,
            "application/json",
            Some(b"{}".to_vec()),
        )
        .unwrap();
        assert_eq!(req.headers()[header::AUTHORIZATION], "Bearer tok");
        assert_eq!(req.headers()[header::CONTENT_TYPE], "application/json");
    }
}
