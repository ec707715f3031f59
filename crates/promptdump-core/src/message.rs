//! Parsed HTTP messages
//!
//! Requests and responses are shared between the half-stream that parsed
//! them, the pairing logic, and the observer, so bodies are attached through
//! `&self` and can be set exactly once.

use crate::flow::FlowId;
use chrono::{DateTime, Utc};
use http::header::{CONTENT_TYPE, HOST};
use http::{HeaderMap, Method, StatusCode, Uri, Version};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::Notify;

/// A parsed HTTP request
#[derive(Debug)]
pub struct Request {
    /// Opaque unique identifier
    pub id: String,

    /// Direction the request travelled in (client -> server)
    pub flow: FlowId,

    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,

    /// When the request head was parsed
    pub captured_at: DateTime<Utc>,

    body: OnceLock<Vec<u8>>,
    /// Set once the observer has been handed the request
    delivered: AtomicBool,
    progress: Notify,
}

impl Request {
    pub fn new(
        flow: FlowId,
        method: Method,
        uri: Uri,
        version: Version,
        headers: HeaderMap,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            flow,
            method,
            uri,
            version,
            headers,
            captured_at: Utc::now(),
            body: OnceLock::new(),
            delivered: AtomicBool::new(false),
            progress: Notify::new(),
        }
    }

    /// Attach the fully read body. Only the first call has any effect;
    /// returns whether this call stored the body.
    pub fn set_body(&self, body: Vec<u8>) -> bool {
        let stored = self.body.set(body).is_ok();
        if stored {
            self.progress.notify_waiters();
        }
        stored
    }

    /// Record that the observer has seen this request (or never will).
    /// Responses paired with it are held back until then.
    pub fn mark_delivered(&self) {
        if !self.delivered.swap(true, Ordering::AcqRel) {
            self.progress.notify_waiters();
        }
    }

    pub fn is_delivered(&self) -> bool {
        self.delivered.load(Ordering::Acquire)
    }

    /// Body bytes, empty until the body is attached
    pub fn body(&self) -> &[u8] {
        self.body.get().map(Vec::as_slice).unwrap_or_default()
    }

    pub fn is_body_finalized(&self) -> bool {
        self.body.get().is_some()
    }

    /// Wait until the body is attached. Returns `false` if `timeout`
    /// elapsed first.
    pub async fn wait_for_body(&self, timeout: Duration) -> bool {
        self.wait_until(timeout, Self::is_body_finalized).await
    }

    /// Wait until the request is marked delivered. Returns `false` if
    /// `timeout` elapsed first.
    pub async fn wait_for_delivery(&self, timeout: Duration) -> bool {
        self.wait_until(timeout, Self::is_delivered).await
    }

    async fn wait_until(&self, timeout: Duration, ready: fn(&Self) -> bool) -> bool {
        let reached = async {
            loop {
                let notified = self.progress.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if ready(self) {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, reached).await.is_ok()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        header_str(&self.headers, name)
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok())
    }

    /// Host header, falling back to the URI authority
    pub fn host(&self) -> Option<&str> {
        self.headers
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .or_else(|| self.uri.host())
    }
}

/// A parsed HTTP response
#[derive(Debug)]
pub struct Response {
    /// The request this response answers, if one was observed
    pub request: Option<Arc<Request>>,

    /// Direction the response travelled in (server -> client)
    pub flow: FlowId,

    pub status: StatusCode,

    /// Reason phrase exactly as sent
    pub reason: String,

    pub version: Version,
    pub headers: HeaderMap,
    pub captured_at: DateTime<Utc>,

    body: OnceLock<Vec<u8>>,
}

impl Response {
    pub fn new(
        request: Option<Arc<Request>>,
        flow: FlowId,
        status: StatusCode,
        reason: String,
        version: Version,
        headers: HeaderMap,
    ) -> Self {
        Self {
            request,
            flow,
            status,
            reason,
            version,
            headers,
            captured_at: Utc::now(),
            body: OnceLock::new(),
        }
    }

    /// Attach the fully read body. Only the first call has any effect.
    pub fn set_body(&self, body: Vec<u8>) -> bool {
        self.body.set(body).is_ok()
    }

    pub fn body(&self) -> &[u8] {
        self.body.get().map(Vec::as_slice).unwrap_or_default()
    }

    pub fn is_body_finalized(&self) -> bool {
        self.body.get().is_some()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        header_str(&self.headers, name)
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok())
    }

    /// Identifier of the matched request, if any
    pub fn request_id(&self) -> Option<&str> {
        self.request.as_ref().map(|r| r.id.as_str())
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> Request {
        let flow = FlowId::from_addrs(
            "127.0.0.1:50000".parse().unwrap(),
            "127.0.0.1:11434".parse().unwrap(),
        );
        let mut headers = HeaderMap::new();
        headers.insert(HOST, "localhost:11434".parse().unwrap());
        headers.insert(CONTENT_TYPE, "application/json".parse().unwrap());
        Request::new(
            flow,
            Method::POST,
            "/api/chat".parse().unwrap(),
            Version::HTTP_11,
            headers,
        )
    }

    #[test]
    fn test_request_body_set_once() {
        let req = request();
        assert!(!req.is_body_finalized());
        assert!(req.body().is_empty());

        assert!(req.set_body(b"first".to_vec()));
        assert!(!req.set_body(b"second".to_vec()));
        assert_eq!(req.body(), b"first");
        assert!(req.is_body_finalized());
    }

    #[test]
    fn test_response_body_set_once() {
        let resp = Response::new(
            None,
            request().flow.reverse(),
            StatusCode::OK,
            "OK".to_string(),
            Version::HTTP_11,
            HeaderMap::new(),
        );
        assert!(resp.set_body(Vec::new()));
        assert!(!resp.set_body(b"late".to_vec()));
        assert!(resp.body().is_empty());
        assert!(resp.is_body_finalized());
        assert!(resp.request_id().is_none());
    }

    #[test]
    fn test_request_ids_are_unique() {
        assert_ne!(request().id, request().id);
    }

    #[test]
    fn test_header_helpers() {
        let req = request();
        assert_eq!(req.host(), Some("localhost:11434"));
        assert_eq!(req.content_type(), Some("application/json"));
        assert_eq!(req.header("content-type"), Some("application/json"));
        assert_eq!(req.header("x-missing"), None);
    }

    #[tokio::test]
    async fn test_wait_for_body_wakes_on_set() {
        let req = Arc::new(request());
        let writer = req.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.set_body(b"{}".to_vec());
        });

        assert!(req.wait_for_body(Duration::from_secs(5)).await);
        assert_eq!(req.body(), b"{}");
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_for_body_already_set() {
        let req = request();
        req.set_body(Vec::new());
        assert!(req.wait_for_body(Duration::from_millis(1)).await);
    }

    #[tokio::test]
    async fn test_wait_for_body_times_out() {
        let req = request();
        assert!(!req.wait_for_body(Duration::from_millis(20)).await);
    }

    #[tokio::test]
    async fn test_delivery_is_separate_from_body() {
        let req = Arc::new(request());
        req.set_body(b"{}".to_vec());
        assert!(!req.is_delivered());
        assert!(!req.wait_for_delivery(Duration::from_millis(20)).await);

        let writer = req.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.mark_delivered();
            writer.mark_delivered();
        });
        assert!(req.wait_for_delivery(Duration::from_secs(5)).await);
        assert!(req.is_delivered());
        handle.await.unwrap();
    }
}
