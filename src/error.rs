//! Errors the proxy reports to HTTP clients itself
//!
//! Anything the dev server answers is passed through untouched. These
//! responses only cover requests the proxy could not hand to a dev server,
//! and carry the code both in a JSON body and an `X-Proxy-Error` header.

use crate::forwarder::{full, ForwardError, ProxyBody};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Response, StatusCode};
use serde::Serialize;

pub const PROXY_ERROR_HEADER: &str = "x-proxy-error";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// No dev server target is mounted at the request path
    UnknownTarget,
    /// The dev server did not answer within the forward timeout
    RequestTimeout,
    /// Failed to connect to or exchange with the dev server
    ConnectionFailed,
    /// The target's destination could not be turned into a request
    InternalError,
}

impl ProxyErrorCode {
    fn parts(self) -> (StatusCode, &'static str) {
        match self {
            ProxyErrorCode::UnknownTarget => (StatusCode::NOT_FOUND, "UNKNOWN_TARGET"),
            ProxyErrorCode::RequestTimeout => (StatusCode::GATEWAY_TIMEOUT, "REQUEST_TIMEOUT"),
            ProxyErrorCode::ConnectionFailed => (StatusCode::BAD_GATEWAY, "CONNECTION_FAILED"),
            ProxyErrorCode::InternalError => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        }
    }

    /// HTTP status sent for this code
    pub fn status_code(self) -> StatusCode {
        self.parts().0
    }

    /// Value of the `X-Proxy-Error` header
    pub fn as_header_value(self) -> &'static str {
        self.parts().1
    }
}

impl From<&ForwardError> for ProxyErrorCode {
    fn from(err: &ForwardError) -> Self {
        match err {
            ForwardError::InvalidDestination(_) | ForwardError::InvalidUri(_) => {
                ProxyErrorCode::InternalError
            }
            _ => ProxyErrorCode::ConnectionFailed,
        }
    }
}

/// Body of a proxy error: `{"code":"…","message":"…","status":…}`
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: ProxyErrorCode,
    pub message: String,
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            status: code.status_code().as_u16(),
        }
    }

    pub fn to_json(&self) -> String {
        match serde_json::to_string(self) {
            Ok(json) => json,
            Err(_) => serde_json::json!({
                "code": self.code.as_header_value(),
                "status": self.status,
            })
            .to_string(),
        }
    }

    pub fn into_response(self) -> Response<ProxyBody> {
        let code = self.code;
        let mut response = Response::new(full(self.to_json()));
        *response.status_mut() = code.status_code();

        let headers = response.headers_mut();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            PROXY_ERROR_HEADER,
            HeaderValue::from_static(code.as_header_value()),
        );
        response
    }
}

/// Build the JSON error response for `code`
pub fn json_error_response(code: ProxyErrorCode, message: impl Into<String>) -> Response<ProxyBody> {
    ErrorResponse::new(code, message).into_response()
}
