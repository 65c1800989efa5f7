//! Trust derivation for remote sessions.

use crate::auth::Caller;
use crate::schema::ServerSchema;
use std::sync::Arc;
use tidesync_engine::{ConverterSet, FilterSet, SyncPolicy, SyncResult};
use tidesync_protocol::{SyncOptions, KNOWN_VALUE_KEYS};
use tracing::debug;

/// Re-derives a remote caller's options before a session opens.
///
/// - The page size is clamped to `1..=max_items_per_sync_request`
/// - Only administrators may request permanent deletions or issue details
/// - Side-channel values with unknown names are dropped
/// - Filters come from the schema for this caller, narrowed to the scope
pub struct ServerPolicy {
    schema: Arc<dyn ServerSchema>,
    caller: Caller,
    max_items_per_sync_request: u32,
}

impl ServerPolicy {
    /// Creates the policy for one caller.
    pub fn new(
        schema: Arc<dyn ServerSchema>,
        caller: Caller,
        max_items_per_sync_request: u32,
    ) -> Self {
        Self {
            schema,
            caller,
            max_items_per_sync_request: max_items_per_sync_request.max(1),
        }
    }

    /// The caller this policy is for.
    pub fn caller(&self) -> &Caller {
        &self.caller
    }
}

impl SyncPolicy for ServerPolicy {
    fn derive_options(&self, requested: &SyncOptions) -> SyncResult<SyncOptions> {
        let mut options = requested.clone();
        options.items_per_sync_request = options
            .items_per_sync_request
            .clamp(1, self.max_items_per_sync_request);

        if !self.caller.is_administrator() {
            options.permanent_deletions = false;
            options.include_issue_details = false;
        }

        let before = options.values.len();
        options.values.retain_known(KNOWN_VALUE_KEYS);
        if options.values.len() != before {
            debug!(
                account = %self.caller.account_id,
                dropped = before - options.values.len(),
                "unknown sync values dropped"
            );
        }
        Ok(options)
    }

    fn filters(&self, options: &SyncOptions) -> SyncResult<FilterSet> {
        self.schema
            .filters(&self.caller, &options.scope, &options.values)?
            .narrowed(&options.scope)
    }

    fn converters(&self, _options: &SyncOptions) -> ConverterSet {
        self.schema.converters(&self.caller)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SharedSchema;
    use serde::{Deserialize, Serialize};
    use tidesync_engine::{RepositoryFilter, SyncRegistry};
    use tidesync_protocol::{SyncEntity, SyncMeta, SyncScope, ACCOUNT_CHANGED};
    use uuid::Uuid;

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    struct Item {
        #[serde(flatten)]
        meta: SyncMeta,
    }

    impl SyncEntity for Item {
        const TYPE_NAME: &'static str = "Item";
        fn meta(&self) -> &SyncMeta {
            &self.meta
        }
        fn meta_mut(&mut self) -> &mut SyncMeta {
            &mut self.meta
        }
        fn update_from(&mut self, _other: &Self) {}
    }

    fn policy(caller: Caller) -> ServerPolicy {
        let registry = SyncRegistry::new().register(RepositoryFilter::<Item>::new());
        ServerPolicy::new(Arc::new(SharedSchema::new(registry)), caller, 50)
    }

    fn greedy_request() -> SyncOptions {
        serde_json::from_value(serde_json::json!({
            "lastSyncedOnClient": "2024-01-01T00:00:00Z",
            "lastSyncedOnServer": "2024-01-02T00:00:00Z",
            "itemsPerSyncRequest": 10_000,
            "includeIssueDetails": true,
            "permanentDeletions": true,
            "values": { "accountChanged": true, "debugBypass": true }
        }))
        .unwrap()
    }

    #[test]
    fn users_get_clamped_and_downgraded_options() {
        let requested = greedy_request();
        let options = policy(Caller::user(Uuid::new_v4()))
            .derive_options(&requested)
            .unwrap();

        assert_eq!(options.items_per_sync_request, 50);
        assert!(!options.permanent_deletions);
        assert!(!options.include_issue_details);
        assert_eq!(options.values.get(ACCOUNT_CHANGED), Some(true));
        assert_eq!(options.values.len(), 1);
        assert_eq!(options.last_synced_on_client, requested.last_synced_on_client);
        assert_eq!(options.last_synced_on_server, requested.last_synced_on_server);
    }

    #[test]
    fn administrators_keep_their_privileges() {
        let options = policy(Caller::administrator(Uuid::new_v4()))
            .derive_options(&greedy_request())
            .unwrap();

        assert_eq!(options.items_per_sync_request, 50);
        assert!(options.permanent_deletions);
        assert!(options.include_issue_details);
    }

    #[test]
    fn empty_pages_are_not_allowed() {
        let requested = SyncOptions::new().with_items_per_sync_request(0);
        let options = policy(Caller::user(Uuid::nil()))
            .derive_options(&requested)
            .unwrap();
        assert_eq!(options.items_per_sync_request, 1);
    }

    #[test]
    fn scope_outside_the_schema_is_invalid() {
        let policy = policy(Caller::user(Uuid::nil()));
        let options = SyncOptions::new().with_scope(SyncScope::Type {
            type_name: "Secret".into(),
        });
        assert!(policy.filters(&options).is_err());

        let options = SyncOptions::new().with_scope(SyncScope::Type {
            type_name: "Item".into(),
        });
        assert_eq!(policy.filters(&options).unwrap().type_names(), vec!["Item"]);
    }
}
