//! HTTP seams for the control plane.
//!
//! The concrete HTTP client lives in the embedder; auth and egress only
//! see `HttpFetcherInterface`. Responses carry the HTTP status line plus
//! the raw JSON body, which the callers decode themselves.

use crate::status::Status;

/// A JSON POST request to a control-plane endpoint.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HttpRequest {
    pub url: String,
    pub json_body: String,
}

impl HttpRequest {
    pub fn new(url: impl Into<String>, json_body: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            json_body: json_body.into(),
        }
    }
}

/// A control-plane response: HTTP status code, status message, JSON body.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HttpResponse {
    pub status_code: u32,
    pub message: String,
    pub json_body: String,
}

impl HttpResponse {
    /// Map a non-200 response onto the status carried back to the session.
    pub fn to_status(&self) -> Status {
        match self.status_code {
            200 => Status::ok(),
            401 => Status::unauthenticated(self.message.clone()),
            403 => Status::permission_denied(self.message.clone()),
            404 => Status::not_found(self.message.clone()),
            408 | 504 => Status::deadline_exceeded(self.message.clone()),
            429 => Status::resource_exhausted(self.message.clone()),
            500..=599 => Status::unavailable(self.message.clone()),
            code => Status::internal(format!("http status {}: {}", code, self.message)),
        }
    }
}

/// Blocking JSON POST transport, implemented by the embedder.
pub trait HttpFetcherInterface: Send + Sync {
    fn post_json(&self, request: &HttpRequest) -> HttpResponse;
}

/// Supplies the OAuth bearer token attached to auth requests.
pub trait OAuthTokenProvider: Send + Sync {
    fn oauth_token(&self) -> Result<String, Status>;
}
