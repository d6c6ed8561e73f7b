//! Request ID stage for log correlation.
//!
//! # Features
//!
//! - Propagates an incoming `X-Request-Id` header
//! - Generates a UUIDv4 when the header is missing or empty
//! - Stores the ID in the request extensions ([`RequestId`]) and headers
//! - Echoes it in the response headers, including rejection responses from
//!   later stages
//!
//! Clients can provide their own ID and will get the same one back:
//!
//! ```bash
//! curl -H "X-Request-Id: my-correlation-id" http://localhost:3000/data
//! ```

use std::fmt;

use axum::http::header::HeaderValue;
use tracing::{Span, debug};
use uuid::Uuid;

use crate::pipeline::{BoxFuture, Next, Request, Response, Stage};

/// Header name for request ID.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Longest client-supplied ID that is propagated as is.
const MAX_REQUEST_ID_LEN: usize = 128;

/// Correlation ID of the current request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestId(String);

impl RequestId {
    /// The ID as text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Assigns every request an ID.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestIdStage;

impl RequestIdStage {
    /// Create the stage.
    pub fn new() -> Self {
        Self
    }
}

impl Stage for RequestIdStage {
    fn name(&self) -> &'static str {
        "request_id"
    }

    fn process(&self, mut request: Request, next: Next) -> BoxFuture<Response> {
        let (request_id, header) = extract_or_generate_request_id(&request);

        request.headers_mut().insert(REQUEST_ID_HEADER, header.clone());
        request.extensions_mut().insert(request_id.clone());

        Span::current().record("request_id", request_id.as_str());
        debug!(request_id = %request_id, "Processing request");

        Box::pin(async move {
            let mut response = next.run(request).await;
            response.headers_mut().insert(REQUEST_ID_HEADER, header);
            response
        })
    }
}

/// Reuse a sane incoming ID, otherwise generate one.
fn extract_or_generate_request_id(request: &Request) -> (RequestId, HeaderValue) {
    if let Some(header_value) = request.headers().get(REQUEST_ID_HEADER)
        && let Ok(value) = header_value.to_str()
        && !value.is_empty()
        && value.len() <= MAX_REQUEST_ID_LEN
    {
        return (RequestId(value.to_string()), header_value.clone());
    }

    let id = Uuid::new_v4().to_string();
    // A hyphenated UUID is always a valid header value.
    let header = HeaderValue::from_str(&id).unwrap_or_else(|_| HeaderValue::from_static("unknown"));
    (RequestId(id), header)
}

/// Extension trait to read the request ID.
pub trait RequestIdExt {
    /// The ID assigned by [`RequestIdStage`], if it ran.
    fn request_id(&self) -> Option<&str>;
}

impl<B> RequestIdExt for axum::http::Request<B> {
    fn request_id(&self) -> Option<&str> {
        self.extensions().get::<RequestId>().map(RequestId::as_str)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::pipeline::Chain;
    use axum::body::Body;
    use axum::http::{self, StatusCode};
    use axum::response::IntoResponse;

    fn echo_chain() -> Chain {
        Chain::builder()
            .stage(RequestIdStage::new())
            .build(|req: Request| async move {
                req.request_id().unwrap_or("missing").to_string().into_response()
            })
    }

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_existing_request_id_is_propagated() {
        let response = echo_chain()
            .invoke(
                http::Request::builder()
                    .header("x-request-id", "existing-id-123")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;

        assert_eq!(response.headers().get("x-request-id").unwrap(), "existing-id-123");
        assert_eq!(body_text(response).await, "existing-id-123");
    }

    #[tokio::test]
    async fn test_missing_request_id_is_generated() {
        let response = echo_chain()
            .invoke(http::Request::builder().body(Body::empty()).unwrap())
            .await;

        let header = response
            .headers()
            .get("x-request-id")
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert!(Uuid::parse_str(&header).is_ok());
        assert_eq!(body_text(response).await, header);
    }

    #[tokio::test]
    async fn test_request_id_added_to_short_circuit_responses() {
        let chain = Chain::builder()
            .stage(RequestIdStage::new())
            .build(|_req: Request| async { StatusCode::UNAUTHORIZED.into_response() });

        let response = chain
            .invoke(http::Request::builder().body(Body::empty()).unwrap())
            .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.headers().contains_key("x-request-id"));
    }

    #[test]
    fn test_oversized_request_id_is_replaced() {
        let long = "a".repeat(MAX_REQUEST_ID_LEN + 1);
        let req = http::Request::builder()
            .header("x-request-id", long.as_str())
            .body(Body::empty())
            .unwrap();

        let (id, _) = extract_or_generate_request_id(&req);
        assert!(Uuid::parse_str(id.as_str()).is_ok());
    }

    #[test]
    fn test_request_id_ext_none() {
        let req = http::Request::builder().body(Body::empty()).unwrap();
        assert_eq!(req.request_id(), None);
    }
}
