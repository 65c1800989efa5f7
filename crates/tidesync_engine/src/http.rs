//! HTTP sync client.
//!
//! The wire format is JSON over POST, one endpoint per [`SyncClient`]
//! operation. The HTTP library itself sits behind [`HttpClient`] so the
//! engine does not pick one; [`LoopbackClient`] routes requests straight
//! into an in-process server.

use crate::client::SyncClient;
use crate::error::{SyncError, SyncResult};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tidesync_protocol::{
    ApplyRequest, BeginSyncRequest, BeginSyncResponse, ChangeCountResponse, ChangeRequest,
    CorrectionRequest, EndSyncRequest, ServiceResult, SyncIssue, SyncObject, SyncOptions,
    APPLY_CORRECTIONS_PATH, APPLY_PATH, BEGIN_PATH, CHANGES_PATH, CHANGE_COUNT_PATH,
    CORRECTIONS_PATH, END_PATH,
};
use tracing::{debug, warn};
use uuid::Uuid;

/// Error kind reported for a session the server does not know.
pub const UNKNOWN_SESSION_KIND: &str = "unknownSession";

/// A status code and body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response body.
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// A 200 response.
    pub fn ok(body: Vec<u8>) -> Self {
        Self { status: 200, body }
    }

    /// An error response with a JSON [`ErrorBody`].
    pub fn error(status: u16, body: &ErrorBody) -> Self {
        Self {
            status,
            body: serde_json::to_vec(body).unwrap_or_default(),
        }
    }

    /// Returns true for 2xx.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// JSON body of a non-2xx response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    /// Machine-readable error kind.
    pub kind: String,
    /// Human-readable message.
    pub message: String,
    /// Session the error relates to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<Uuid>,
}

impl ErrorBody {
    /// Creates an error body.
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            session_id: None,
        }
    }

    /// Names the session the error relates to.
    pub fn with_session(mut self, session_id: Uuid) -> Self {
        self.session_id = Some(session_id);
        self
    }
}

/// HTTP client abstraction.
///
/// Implement this trait over whichever HTTP library the application uses.
pub trait HttpClient: Send + Sync {
    /// Sends a POST with an optional bearer token.
    ///
    /// `Err` is a transport failure; HTTP error statuses are `Ok`.
    fn post(&self, url: &str, token: Option<&str>, body: Vec<u8>) -> Result<HttpResponse, String>;

    /// Checks if the client is healthy.
    fn is_healthy(&self) -> bool;
}

/// A [`SyncClient`] that talks to a remote sync server.
pub struct WebSyncClient<C: HttpClient> {
    base_url: String,
    client: C,
    token: Option<String>,
    connected: AtomicBool,
    last_error: RwLock<Option<String>>,
}

impl<C: HttpClient> WebSyncClient<C> {
    /// Creates a client for the server at `base_url`.
    pub fn new(base_url: impl Into<String>, client: C) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            token: None,
            connected: AtomicBool::new(true),
            last_error: RwLock::new(None),
        }
    }

    /// Sends `token` as a bearer token on every request.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Returns the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Returns the last transport or server error.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    /// Returns true if the client is open and its HTTP client is healthy.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && self.client.is_healthy()
    }

    /// Closes the client; later calls fail with `NotConnected`.
    pub fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    fn set_error(&self, err: &str) {
        *self.last_error.write() = Some(err.to_string());
    }

    fn send<Req: Serialize>(&self, path: &str, request: &Req) -> SyncResult<Vec<u8>> {
        if !self.is_connected() {
            return Err(SyncError::NotConnected);
        }

        let body = serde_json::to_vec(request)?;
        let url = format!("{}{}", self.base_url, path);
        debug!(url = %url, bytes = body.len(), "sync request");

        let response = self
            .client
            .post(&url, self.token.as_deref(), body)
            .map_err(|e| {
                self.set_error(&e);
                warn!(url = %url, error = %e, "sync transport failed");
                SyncError::transport_retryable(e)
            })?;

        if !response.is_success() {
            let err = status_error(&response);
            self.set_error(&err.to_string());
            return Err(err);
        }
        *self.last_error.write() = None;
        Ok(response.body)
    }

    fn post_json<Req, Res>(&self, path: &str, request: &Req) -> SyncResult<Res>
    where
        Req: Serialize,
        Res: DeserializeOwned,
    {
        let body = self.send(path, request)?;
        serde_json::from_slice(&body)
            .map_err(|e| SyncError::Protocol(format!("failed to decode response: {e}")))
    }
}

/// Maps a non-2xx response to an error.
fn status_error(response: &HttpResponse) -> SyncError {
    let body: Option<ErrorBody> = serde_json::from_slice(&response.body).ok();
    let message = body
        .as_ref()
        .map(|b| b.message.clone())
        .unwrap_or_else(|| format!("HTTP {}", response.status));

    match response.status {
        400 | 409 | 422 => SyncError::InvalidOperation(message),
        401 => SyncError::AuthenticationFailed(message),
        403 => SyncError::NotAuthorized(message),
        404 => match body {
            Some(ErrorBody {
                kind,
                session_id: Some(id),
                ..
            }) if kind == UNKNOWN_SESSION_KIND => SyncError::UnknownSession(id),
            _ => SyncError::Protocol(message),
        },
        408 | 429 => SyncError::transport_retryable(message),
        500..=599 => SyncError::ServerError(message),
        _ => SyncError::transport_fatal(message),
    }
}

impl<C: HttpClient> SyncClient for WebSyncClient<C> {
    fn begin_sync(&self, session_id: Uuid, options: &SyncOptions) -> SyncResult<BeginSyncResponse> {
        self.post_json(BEGIN_PATH, &BeginSyncRequest::new(session_id, options.clone()))
    }

    fn get_change_count(&self, request: &ChangeRequest) -> SyncResult<u64> {
        let response: ChangeCountResponse = self.post_json(CHANGE_COUNT_PATH, request)?;
        Ok(response.count)
    }

    fn get_changes(&self, request: &ChangeRequest) -> SyncResult<ServiceResult<SyncObject>> {
        self.post_json(CHANGES_PATH, request)
    }

    fn apply_changes(
        &self,
        session_id: Uuid,
        changes: Vec<SyncObject>,
    ) -> SyncResult<ServiceResult<SyncIssue>> {
        self.post_json(
            APPLY_PATH,
            &ApplyRequest {
                session_id,
                items: changes,
            },
        )
    }

    fn apply_corrections(
        &self,
        session_id: Uuid,
        corrections: Vec<SyncObject>,
    ) -> SyncResult<ServiceResult<SyncIssue>> {
        self.post_json(
            APPLY_CORRECTIONS_PATH,
            &ApplyRequest {
                session_id,
                items: corrections,
            },
        )
    }

    fn get_corrections(
        &self,
        session_id: Uuid,
        issues: &[SyncIssue],
    ) -> SyncResult<ServiceResult<SyncObject>> {
        self.post_json(
            CORRECTIONS_PATH,
            &CorrectionRequest {
                session_id,
                issues: issues.to_vec(),
            },
        )
    }

    fn end_sync(&self, session_id: Uuid) -> SyncResult<()> {
        self.send(END_PATH, &EndSyncRequest { session_id })?;
        Ok(())
    }
}

/// A server that can answer requests in-process.
pub trait LoopbackServer: Send + Sync {
    /// Handles a POST to `path`.
    fn handle_post(&self, path: &str, token: Option<&str>, body: &[u8]) -> HttpResponse;
}

impl<S: LoopbackServer + ?Sized> LoopbackServer for Arc<S> {
    fn handle_post(&self, path: &str, token: Option<&str>, body: &[u8]) -> HttpResponse {
        (**self).handle_post(path, token, body)
    }
}

/// An [`HttpClient`] that routes requests directly to a [`LoopbackServer`].
pub struct LoopbackClient<S: LoopbackServer> {
    server: S,
}

impl<S: LoopbackServer> LoopbackClient<S> {
    /// Creates a loopback client for `server`.
    pub fn new(server: S) -> Self {
        Self { server }
    }
}

impl<S: LoopbackServer> HttpClient for LoopbackClient<S> {
    fn post(&self, url: &str, token: Option<&str>, body: Vec<u8>) -> Result<HttpResponse, String> {
        let path = url.find("/sync/").map(|i| &url[i..]).unwrap_or(url);
        Ok(self.server.handle_post(path, token, &body))
    }

    fn is_healthy(&self) -> bool {
        true
    }
}
