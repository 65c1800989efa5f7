//! Main sync server.

use crate::auth::{AuthConfig, Caller, TokenValidator};
use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::handler::{HandlerContext, RequestHandler};
use crate::schema::ServerSchema;
use serde::Serialize;
use std::sync::Arc;
use tidesync_engine::{HttpResponse, LoopbackServer};
use tidesync_protocol::SyncMessage;
use tidesync_store::Repository;
use tracing::{debug, warn};
use uuid::Uuid;

/// The sync server.
///
/// Requests arrive as a path, an optional bearer token and a JSON body;
/// answers are a status code and a JSON body. Binding this to a real HTTP
/// listener is left to the application, and [`LoopbackServer`] lets a
/// client talk to it in-process.
///
/// Without authentication every request runs as an administrator with the
/// nil account id.
///
/// # Example
///
/// ```rust,ignore
/// let server = SyncServer::new(
///     ServerConfig::default().with_auth(secret),
///     Arc::new(MemoryRepository::new()),
///     Arc::new(schema),
/// );
/// let response = server.handle_post("/sync/begin", Some(&token), &body);
/// ```
pub struct SyncServer {
    handler: RequestHandler,
    context: Arc<HandlerContext>,
    validator: Option<TokenValidator>,
}

impl SyncServer {
    /// Creates a server over `repo`.
    pub fn new(
        config: ServerConfig,
        repo: Arc<dyn Repository>,
        schema: Arc<dyn ServerSchema>,
    ) -> Self {
        let validator = config.auth_secret.as_ref().map(|secret| {
            TokenValidator::new(AuthConfig::new(secret.clone()).with_expiry(config.token_expiry))
        });
        let context = Arc::new(HandlerContext::new(config, repo, schema));
        let handler = RequestHandler::new(Arc::clone(&context));

        Self {
            handler,
            context,
            validator,
        }
    }

    /// The configured token validator, if a secret was given.
    pub fn validator(&self) -> Option<&TokenValidator> {
        self.validator.as_ref()
    }

    /// The server's repository.
    pub fn repository(&self) -> &Arc<dyn Repository> {
        self.context.repository()
    }

    /// Number of open sessions.
    pub fn active_sessions(&self) -> usize {
        self.context.active_sessions()
    }

    /// Resolves the caller behind a request.
    pub fn authenticate(&self, token: Option<&str>) -> ServerResult<Caller> {
        match (token, &self.validator) {
            (Some(token), Some(validator)) => validator.validate_token(token),
            (None, _) if self.context.config.require_auth => Err(
                ServerError::AuthenticationFailed("a bearer token is required".into()),
            ),
            (Some(_), None) if self.context.config.require_auth => Err(ServerError::Internal(
                "authentication is required but no secret is configured".into(),
            )),
            _ => Ok(Caller::administrator(Uuid::nil())),
        }
    }

    /// Handles a decoded message, returning the JSON response body.
    pub fn handle_message(&self, caller: &Caller, message: SyncMessage) -> ServerResult<Vec<u8>> {
        match message {
            SyncMessage::Begin(req) => encode(&self.handler.handle_begin(caller, req)?),
            SyncMessage::ChangeCount(req) => {
                encode(&self.handler.handle_change_count(caller, req)?)
            }
            SyncMessage::Changes(req) => encode(&self.handler.handle_changes(caller, req)?),
            SyncMessage::Apply(req) => encode(&self.handler.handle_apply(caller, req)?),
            SyncMessage::Corrections(req) => {
                encode(&self.handler.handle_corrections(caller, req)?)
            }
            SyncMessage::ApplyCorrections(req) => {
                encode(&self.handler.handle_apply_corrections(caller, req)?)
            }
            SyncMessage::End(req) => {
                self.handler.handle_end(caller, req)?;
                Ok(b"{}".to_vec())
            }
        }
    }

    /// Handles a POST to `path`.
    pub fn handle_post(&self, path: &str, token: Option<&str>, body: &[u8]) -> HttpResponse {
        let result = self
            .authenticate(token)
            .and_then(|caller| {
                let message = SyncMessage::decode(path, body)?;
                self.handle_message(&caller, message)
            });

        match result {
            Ok(body) => {
                debug!(path, bytes = body.len(), "sync request served");
                HttpResponse::ok(body)
            }
            Err(e) => {
                if e.is_server_error() {
                    warn!(path, error = %e, "sync request failed");
                } else {
                    debug!(path, error = %e, "sync request rejected");
                }
                e.to_response()
            }
        }
    }
}

impl LoopbackServer for SyncServer {
    fn handle_post(&self, path: &str, token: Option<&str>, body: &[u8]) -> HttpResponse {
        SyncServer::handle_post(self, path, token, body)
    }
}

fn encode<T: Serialize>(value: &T) -> ServerResult<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SharedSchema;
    use serde::Deserialize;
    use tidesync_engine::{
        ErrorBody, LoopbackClient, RepositoryFilter, SyncClient, SyncError, SyncRegistry,
        WebSyncClient,
    };
    use tidesync_protocol::{
        BeginSyncRequest, BeginSyncResponse, SyncEntity, SyncMeta, SyncObject, SyncOptions,
        SyncStatus, BEGIN_PATH,
    };
    use tidesync_store::MemoryRepository;

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    struct Item {
        #[serde(flatten)]
        meta: SyncMeta,
        name: String,
    }

    impl SyncEntity for Item {
        const TYPE_NAME: &'static str = "Item";
        fn meta(&self) -> &SyncMeta {
            &self.meta
        }
        fn meta_mut(&mut self) -> &mut SyncMeta {
            &mut self.meta
        }
        fn update_from(&mut self, other: &Self) {
            self.name = other.name.clone();
        }
    }

    const SECRET: &[u8] = b"server-test-secret";

    fn server(config: ServerConfig) -> Arc<SyncServer> {
        let registry = SyncRegistry::new().register(RepositoryFilter::<Item>::new());
        Arc::new(SyncServer::new(
            config,
            Arc::new(MemoryRepository::new()),
            Arc::new(SharedSchema::new(registry)),
        ))
    }

    fn begin_body() -> Vec<u8> {
        serde_json::to_vec(&BeginSyncRequest::new(Uuid::new_v4(), SyncOptions::new())).unwrap()
    }

    #[test]
    fn open_server_treats_callers_as_administrators() {
        let server = server(ServerConfig::default());
        let response = server.handle_post(BEGIN_PATH, None, &begin_body());
        assert!(response.is_success());

        let begun: BeginSyncResponse = serde_json::from_slice(&response.body).unwrap();
        assert_eq!(server.active_sessions(), 1);
        assert_eq!(begun.options.items_per_sync_request, 300);
    }

    #[test]
    fn missing_token_is_rejected() {
        let server = server(ServerConfig::default().with_auth(SECRET.to_vec()));
        let response = server.handle_post(BEGIN_PATH, None, &begin_body());
        assert_eq!(response.status, 401);
        assert_eq!(server.active_sessions(), 0);
    }

    #[test]
    fn valid_token_opens_a_session() {
        let server = server(ServerConfig::default().with_auth(SECRET.to_vec()));
        let token = server
            .validator()
            .unwrap()
            .create_token(&Caller::user(Uuid::new_v4()))
            .unwrap();

        let response = server.handle_post(BEGIN_PATH, Some(&token), &begin_body());
        assert!(response.is_success());
    }

    #[test]
    fn bad_requests_get_error_bodies() {
        let server = server(ServerConfig::default());

        let response = server.handle_post("/sync/nowhere", None, b"{}");
        assert_eq!(response.status, 404);
        let body: ErrorBody = serde_json::from_slice(&response.body).unwrap();
        assert_eq!(body.kind, "unknownPath");

        let response = server.handle_post(BEGIN_PATH, None, b"not json");
        assert_eq!(response.status, 400);
    }

    #[test]
    fn web_client_round_trip_over_loopback() {
        let server = server(ServerConfig::default().with_auth(SECRET.to_vec()));
        let caller = Caller::user(Uuid::new_v4());
        let token = server.validator().unwrap().create_token(&caller).unwrap();
        let transport = LoopbackClient::new(Arc::clone(&server));
        let client = WebSyncClient::new("http://sync.local", transport).with_token(token);

        let session_id = Uuid::new_v4();
        let begun = client.begin_sync(session_id, &SyncOptions::new()).unwrap();
        assert_eq!(begun.session_id, session_id);

        let item = Item {
            meta: SyncMeta::new(chrono::Utc::now()),
            name: "widget".into(),
        };
        let object = SyncObject::from_entity(&item, SyncStatus::Added).unwrap();
        let issues = client.apply_changes(session_id, vec![object]).unwrap();
        assert!(issues.items.is_empty());

        client.end_sync(session_id).unwrap();
        assert!(matches!(
            client.end_sync(session_id),
            Err(SyncError::UnknownSession(id)) if id == session_id
        ));
        assert!(server
            .repository()
            .find_by_sync_id("Item", item.meta.sync_id)
            .unwrap()
            .is_some());
    }
}
