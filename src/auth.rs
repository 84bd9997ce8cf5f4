//! Auth (zinc) client.
//!
//! `Auth::start` is fire-and-forget: the HTTP exchange runs as a posted
//! job and the outcome reaches the registered handler as exactly one of
//! `auth_successful` / `auth_failure`. The parsed response is immutable
//! once stored and shared by reference with the egress flow.

use crate::http::{HttpFetcherInterface, HttpRequest, HttpResponse, OAuthTokenProvider};
use crate::looper::LooperThread;
use crate::status::Status;
use crate::config::KryptonConfig;
use serde::Deserialize;
use serde_json::json;
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, warn};

/// Outcome callbacks, implemented by the session.
pub trait AuthNotification: Send + Sync {
    fn auth_successful(&self, is_rekey: bool);
    fn auth_failure(&self, status: Status);
}

/// The session's view of the auth collaborator.
pub trait AuthInterface: Send + Sync {
    /// Begin an auth/sign exchange. Must eventually produce exactly one
    /// notification on the registered handler.
    fn start(&self, is_rekey: bool);

    /// Quiesce: in-flight exchanges complete silently.
    fn stop(&self);

    /// The last successful response, if any.
    fn auth_response(&self) -> Option<Arc<AuthAndSignResponse>>;
}

/// Parsed zinc auth/sign response body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct AuthAndSignResponse {
    #[serde(default)]
    pub jwt_token: String,
    #[serde(default)]
    pub blinded_token_signatures: Vec<String>,
}

impl AuthAndSignResponse {
    /// Decode from an HTTP response; non-200 maps onto the status error.
    pub fn decode_from_response(response: &HttpResponse) -> Result<Self, Status> {
        let status = response.to_status();
        if !status.is_ok() {
            return Err(status);
        }
        serde_json::from_str(&response.json_body)
            .map_err(|e| Status::internal(format!("malformed auth response: {}", e)))
    }
}

struct AuthState {
    zinc_url: String,
    service_type: String,
    http_fetcher: Arc<dyn HttpFetcherInterface>,
    oauth: Arc<dyn OAuthTokenProvider>,
    looper: Arc<LooperThread>,
    inner: Mutex<AuthInner>,
}

#[derive(Default)]
struct AuthInner {
    handler: Option<Weak<dyn AuthNotification>>,
    response: Option<Arc<AuthAndSignResponse>>,
    stopped: bool,
}

impl AuthState {
    fn notify(&self, f: impl FnOnce(&dyn AuthNotification)) {
        let handler = {
            let inner = self.inner.lock().expect("auth lock poisoned");
            if inner.stopped {
                return;
            }
            inner.handler.clone()
        };
        if let Some(handler) = handler.and_then(|h| h.upgrade()) {
            f(&*handler);
        }
    }
}

/// Zinc auth client driving `HttpFetcherInterface`.
pub struct Auth {
    state: Arc<AuthState>,
}

impl Auth {
    pub fn new(
        config: &KryptonConfig,
        http_fetcher: Arc<dyn HttpFetcherInterface>,
        oauth: Arc<dyn OAuthTokenProvider>,
        looper: Arc<LooperThread>,
    ) -> Self {
        Self {
            state: Arc::new(AuthState {
                zinc_url: config.zinc_url.clone(),
                service_type: config.service_type.clone(),
                http_fetcher,
                oauth,
                looper,
                inner: Mutex::new(AuthInner::default()),
            }),
        }
    }

    /// Install the outcome handler. Called once, before `start`.
    pub fn register_notification_handler(&self, handler: Weak<dyn AuthNotification>) {
        self.state.inner.lock().expect("auth lock poisoned").handler = Some(handler);
    }
}

impl AuthInterface for Auth {
    fn start(&self, is_rekey: bool) {
        let state = self.state.clone();
        self.state.looper.post(move || {
            if state.inner.lock().expect("auth lock poisoned").stopped {
                debug!("Auth exchange skipped, client stopped");
                return;
            }

            let token = match state.oauth.oauth_token() {
                Ok(token) => token,
                Err(status) => {
                    warn!(%status, "OAuth token fetch failed");
                    state.notify(|h| h.auth_failure(status));
                    return;
                }
            };

            let body = json!({
                "oauth_token": token,
                "service_type": state.service_type,
            });
            let request = HttpRequest::new(&state.zinc_url, body.to_string());
            let response = state.http_fetcher.post_json(&request);

            match AuthAndSignResponse::decode_from_response(&response) {
                Ok(parsed) => {
                    let parsed = Arc::new(parsed);
                    state.inner.lock().expect("auth lock poisoned").response =
                        Some(parsed.clone());
                    debug!(is_rekey, "Auth exchange succeeded");
                    state.notify(|h| h.auth_successful(is_rekey));
                }
                Err(status) => {
                    warn!(%status, is_rekey, "Auth exchange failed");
                    state.notify(|h| h.auth_failure(status));
                }
            }
        });
    }

    fn stop(&self) {
        self.state.inner.lock().expect("auth lock poisoned").stopped = true;
    }

    fn auth_response(&self) -> Option<Arc<AuthAndSignResponse>> {
        self.state
            .inner
            .lock()
            .expect("auth lock poisoned")
            .response
            .clone()
    }
}
