//! Request handlers for sync endpoints.

use crate::auth::Caller;
use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::policy::ServerPolicy;
use crate::schema::ServerSchema;
use std::sync::Arc;
use tidesync_engine::{DatabaseSyncClient, SyncClient};
use tidesync_protocol::{
    ApplyRequest, BeginSyncRequest, BeginSyncResponse, ChangeCountResponse, ChangeRequest,
    CorrectionRequest, EndSyncRequest, ServiceResult, SyncIssue, SyncObject,
};
use tidesync_store::Repository;
use tracing::warn;
use uuid::Uuid;

/// Context for request handling.
pub struct HandlerContext {
    /// Server configuration.
    pub config: ServerConfig,
    /// Maps callers to what they may sync.
    pub schema: Arc<dyn ServerSchema>,
    /// Sessions and storage.
    client: DatabaseSyncClient,
}

impl HandlerContext {
    /// Creates a new handler context over `repo`.
    pub fn new(
        config: ServerConfig,
        repo: Arc<dyn Repository>,
        schema: Arc<dyn ServerSchema>,
    ) -> Self {
        // Sessions are only opened through `begin_session` with the caller's
        // own policy; this one is never consulted.
        let policy = Arc::new(ServerPolicy::new(
            Arc::clone(&schema),
            Caller::administrator(Uuid::nil()),
            config.max_items_per_sync_request,
        ));
        let client = DatabaseSyncClient::new(repo, policy)
            .with_cache_timeout(config.primary_key_cache_timeout)
            .with_session_timeout(config.session_idle_timeout);
        Self {
            config,
            schema,
            client,
        }
    }

    /// The server's repository.
    pub fn repository(&self) -> &Arc<dyn Repository> {
        self.client.repository()
    }

    /// Number of open sessions.
    pub fn active_sessions(&self) -> usize {
        self.client.active_sessions()
    }
}

/// Handler for sync requests.
///
/// Every request after `begin` must come from the caller that opened the
/// session.
pub struct RequestHandler {
    context: Arc<HandlerContext>,
}

impl RequestHandler {
    /// Creates a new request handler.
    pub fn new(context: Arc<HandlerContext>) -> Self {
        Self { context }
    }

    /// Opens a session with options re-derived for `caller`.
    pub fn handle_begin(
        &self,
        caller: &Caller,
        request: BeginSyncRequest,
    ) -> ServerResult<BeginSyncResponse> {
        let policy = ServerPolicy::new(
            Arc::clone(&self.context.schema),
            *caller,
            self.context.config.max_items_per_sync_request,
        );
        let response = self.context.client.begin_session(
            request.session_id,
            &request.options,
            &policy,
            Some(&caller.identity()),
        )?;
        Ok(response)
    }

    /// Counts changes in a window.
    pub fn handle_change_count(
        &self,
        caller: &Caller,
        request: ChangeRequest,
    ) -> ServerResult<ChangeCountResponse> {
        self.authorize(caller, request.session_id)?;
        let count = self.context.client.get_change_count(&request)?;
        Ok(ChangeCountResponse { count })
    }

    /// Serves one page of changes.
    pub fn handle_changes(
        &self,
        caller: &Caller,
        request: ChangeRequest,
    ) -> ServerResult<ServiceResult<SyncObject>> {
        self.authorize(caller, request.session_id)?;
        Ok(self.context.client.get_changes(&request)?)
    }

    /// Applies a page of incoming changes.
    pub fn handle_apply(
        &self,
        caller: &Caller,
        request: ApplyRequest,
    ) -> ServerResult<ServiceResult<SyncIssue>> {
        self.authorize(caller, request.session_id)?;
        self.check_batch("changes", request.items.len())?;
        Ok(self
            .context
            .client
            .apply_changes(request.session_id, request.items)?)
    }

    /// Returns the server's values for the caller's issues.
    pub fn handle_corrections(
        &self,
        caller: &Caller,
        request: CorrectionRequest,
    ) -> ServerResult<ServiceResult<SyncObject>> {
        self.authorize(caller, request.session_id)?;
        self.check_batch("issues", request.issues.len())?;
        Ok(self
            .context
            .client
            .get_corrections(request.session_id, &request.issues)?)
    }

    /// Applies the caller's authoritative values.
    pub fn handle_apply_corrections(
        &self,
        caller: &Caller,
        request: ApplyRequest,
    ) -> ServerResult<ServiceResult<SyncIssue>> {
        self.authorize(caller, request.session_id)?;
        self.check_batch("corrections", request.items.len())?;
        Ok(self
            .context
            .client
            .apply_corrections(request.session_id, request.items)?)
    }

    /// Closes a session.
    pub fn handle_end(&self, caller: &Caller, request: EndSyncRequest) -> ServerResult<()> {
        self.authorize(caller, request.session_id)?;
        self.context.client.end_sync(request.session_id)?;
        Ok(())
    }

    /// Refuses batches larger than the configured page size cap.
    fn check_batch(&self, what: &str, len: usize) -> ServerResult<()> {
        let max = self.context.config.max_items_per_sync_request as usize;
        if len > max {
            return Err(ServerError::InvalidRequest(format!(
                "too many {what}: {len} > {max}"
            )));
        }
        Ok(())
    }

    fn authorize(&self, caller: &Caller, session_id: Uuid) -> ServerResult<()> {
        let owner = self.context.client.session_owner(session_id)?;
        if owner.as_deref() == Some(caller.identity().as_str()) {
            return Ok(());
        }
        warn!(
            session = %session_id,
            account = %caller.account_id,
            "request for another caller's session"
        );
        Err(ServerError::NotAuthorized(format!(
            "session {session_id} belongs to another caller"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SharedSchema;
    use serde::{Deserialize, Serialize};
    use tidesync_engine::{RepositoryFilter, SyncRegistry};
    use std::time::Duration;
    use tidesync_protocol::{
        full_sync_watermark, SyncEntity, SyncIssueType, SyncMeta, SyncOptions, SyncStatus,
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

    fn handler(config: ServerConfig) -> RequestHandler {
        let registry = SyncRegistry::new().register(RepositoryFilter::<Item>::new());
        let context = HandlerContext::new(
            config,
            Arc::new(MemoryRepository::new()),
            Arc::new(SharedSchema::new(registry)),
        );
        RequestHandler::new(Arc::new(context))
    }

    fn item(name: &str) -> SyncObject {
        let item = Item {
            meta: SyncMeta::new(chrono::Utc::now()),
            name: name.into(),
        };
        SyncObject::from_entity(&item, SyncStatus::Added).unwrap()
    }

    #[test]
    fn sessions_belong_to_their_caller() {
        let handler = handler(ServerConfig::default());
        let owner = Caller::user(Uuid::new_v4());
        let intruder = Caller::user(Uuid::new_v4());
        let session_id = Uuid::new_v4();

        handler
            .handle_begin(&owner, BeginSyncRequest::new(session_id, SyncOptions::new()))
            .unwrap();

        let until = chrono::Utc::now();
        let request = ChangeRequest::new(session_id, full_sync_watermark(), until, 10);
        assert!(matches!(
            handler.handle_change_count(&intruder, request.clone()),
            Err(ServerError::NotAuthorized(_))
        ));
        assert!(matches!(
            handler.handle_end(&intruder, EndSyncRequest { session_id }),
            Err(ServerError::NotAuthorized(_))
        ));
        assert_eq!(handler.handle_change_count(&owner, request).unwrap().count, 0);
        handler.handle_end(&owner, EndSyncRequest { session_id }).unwrap();
    }

    #[test]
    fn unknown_sessions_are_reported() {
        let handler = handler(ServerConfig::default());
        let session_id = Uuid::new_v4();
        let caller = Caller::user(Uuid::nil());
        let result = handler.handle_end(&caller, EndSyncRequest { session_id });
        assert!(matches!(result, Err(ServerError::UnknownSession(id)) if id == session_id));
    }

    #[test]
    fn begin_reports_trusted_options() {
        let handler = handler(ServerConfig::default().with_max_items_per_sync_request(5));
        let caller = Caller::user(Uuid::new_v4());
        let requested = SyncOptions::new()
            .with_items_per_sync_request(100)
            .with_permanent_deletions(true);

        let response = handler
            .handle_begin(&caller, BeginSyncRequest::new(Uuid::new_v4(), requested))
            .unwrap();
        assert_eq!(response.options.items_per_sync_request, 5);
        assert!(!response.options.permanent_deletions);
    }

    #[test]
    fn oversized_batches_are_refused() {
        let handler = handler(ServerConfig::default().with_max_items_per_sync_request(2));
        let caller = Caller::user(Uuid::new_v4());
        let session_id = Uuid::new_v4();
        handler
            .handle_begin(&caller, BeginSyncRequest::new(session_id, SyncOptions::new()))
            .unwrap();

        let items = vec![item("a"), item("b"), item("c")];
        let result = handler.handle_apply(&caller, ApplyRequest { session_id, items });
        assert!(matches!(result, Err(ServerError::InvalidRequest(_))));

        let items = vec![item("a"), item("b")];
        let issues = handler
            .handle_apply(&caller, ApplyRequest { session_id, items })
            .unwrap();
        assert!(issues.items.is_empty());
    }

    #[test]
    fn oversized_correction_requests_are_refused() {
        let handler = handler(ServerConfig::default().with_max_items_per_sync_request(2));
        let caller = Caller::user(Uuid::new_v4());
        let session_id = Uuid::new_v4();
        handler
            .handle_begin(&caller, BeginSyncRequest::new(session_id, SyncOptions::new()))
            .unwrap();

        let issues: Vec<SyncIssue> = ["a", "b", "c"]
            .iter()
            .map(|name| SyncIssue::new(SyncIssueType::Rejected, &item(name), "no"))
            .collect();
        let result = handler.handle_corrections(
            &caller,
            CorrectionRequest {
                session_id,
                issues: issues.clone(),
            },
        );
        assert!(matches!(result, Err(ServerError::InvalidRequest(_))));

        let items = vec![item("a"), item("b"), item("c")];
        let result = handler.handle_apply_corrections(&caller, ApplyRequest { session_id, items });
        assert!(matches!(result, Err(ServerError::InvalidRequest(_))));

        let corrections = handler
            .handle_corrections(
                &caller,
                CorrectionRequest {
                    session_id,
                    issues: issues[..2].to_vec(),
                },
            )
            .unwrap();
        assert_eq!(corrections.items.len(), 2);
    }

    #[test]
    fn abandoned_sessions_are_evicted() {
        let handler =
            handler(ServerConfig::default().with_session_idle_timeout(Duration::ZERO));
        let caller = Caller::user(Uuid::new_v4());
        let abandoned = Uuid::new_v4();
        handler
            .handle_begin(&caller, BeginSyncRequest::new(abandoned, SyncOptions::new()))
            .unwrap();
        assert_eq!(handler.context.active_sessions(), 1);

        // The next caller to begin sweeps the one that never ended.
        let fresh = Uuid::new_v4();
        handler
            .handle_begin(&caller, BeginSyncRequest::new(fresh, SyncOptions::new()))
            .unwrap();
        assert_eq!(handler.context.active_sessions(), 1);
        let result = handler.handle_end(&caller, EndSyncRequest { session_id: abandoned });
        assert!(matches!(result, Err(ServerError::UnknownSession(_))));
        handler
            .handle_end(&caller, EndSyncRequest { session_id: fresh })
            .unwrap();
    }

    #[test]
    fn active_sessions_survive_the_sweep() {
        let handler = handler(ServerConfig::default());
        let caller = Caller::user(Uuid::new_v4());
        for _ in 0..3 {
            handler
                .handle_begin(&caller, BeginSyncRequest::new(Uuid::new_v4(), SyncOptions::new()))
                .unwrap();
        }
        assert_eq!(handler.context.active_sessions(), 3);
    }
}
