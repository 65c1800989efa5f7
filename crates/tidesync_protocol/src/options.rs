//! Per-session sync options.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::marker::PhantomData;
use uuid::Uuid;

/// Default page size for change requests.
pub const DEFAULT_ITEMS_PER_SYNC_REQUEST: u32 = 300;

/// Set when the caller's own account row is part of the change set.
pub const ACCOUNT_CHANGED: ValueKey<bool> = ValueKey::new("accountChanged");

/// Free-form client label, used for logging only.
pub const CLIENT_NAME: ValueKey<String> = ValueKey::new("clientName");

/// Every key a peer is allowed to send in [`SyncValues`].
pub const KNOWN_VALUE_KEYS: &[&str] = &[ACCOUNT_CHANGED.name(), CLIENT_NAME.name()];

/// A single value in the side-channel bag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SyncValue {
    /// Boolean flag.
    Bool(bool),
    /// Integer value.
    Integer(i64),
    /// Text value.
    Text(String),
}

/// A Rust type that can be stored in [`SyncValues`].
pub trait ValueType: Sized {
    /// Wraps the value.
    fn into_value(self) -> SyncValue;

    /// Unwraps the value if it has the right shape.
    fn from_value(value: &SyncValue) -> Option<Self>;
}

impl ValueType for bool {
    fn into_value(self) -> SyncValue {
        SyncValue::Bool(self)
    }

    fn from_value(value: &SyncValue) -> Option<Self> {
        match value {
            SyncValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl ValueType for i64 {
    fn into_value(self) -> SyncValue {
        SyncValue::Integer(self)
    }

    fn from_value(value: &SyncValue) -> Option<Self> {
        match value {
            SyncValue::Integer(i) => Some(*i),
            _ => None,
        }
    }
}

impl ValueType for String {
    fn into_value(self) -> SyncValue {
        SyncValue::Text(self)
    }

    fn from_value(value: &SyncValue) -> Option<Self> {
        match value {
            SyncValue::Text(s) => Some(s.clone()),
            _ => None,
        }
    }
}

/// A typed, named key into [`SyncValues`].
pub struct ValueKey<T> {
    name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> ValueKey<T> {
    /// Declares a key.
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _marker: PhantomData,
        }
    }

    /// Returns the wire name of the key.
    pub const fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> Clone for ValueKey<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for ValueKey<T> {}

impl<T> std::fmt::Debug for ValueKey<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ValueKey").field(&self.name).finish()
    }
}

/// Typed side-channel values a particular sync needs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SyncValues(BTreeMap<String, SyncValue>);

impl SyncValues {
    /// Creates an empty bag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads a value. Returns `None` if absent or of the wrong shape.
    pub fn get<T: ValueType>(&self, key: ValueKey<T>) -> Option<T> {
        self.0.get(key.name()).and_then(T::from_value)
    }

    /// Writes a value.
    pub fn set<T: ValueType>(&mut self, key: ValueKey<T>, value: T) {
        self.0.insert(key.name().to_string(), value.into_value());
    }

    /// Writes a value, builder style.
    pub fn with<T: ValueType>(mut self, key: ValueKey<T>, value: T) -> Self {
        self.set(key, value);
        self
    }

    /// Removes a value.
    pub fn remove<T>(&mut self, key: ValueKey<T>) {
        self.0.remove(key.name());
    }

    /// Drops every entry whose name is not in `known`.
    pub fn retain_known(&mut self, known: &[&str]) {
        self.0.retain(|name, _| known.contains(&name.as_str()));
    }

    /// Returns the number of entries.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if there are no entries.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// What a peer asks to sync.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum SyncScope {
    /// Every type the peer is allowed to sync.
    #[default]
    All,
    /// A single entity type.
    Type {
        /// Type name.
        #[serde(rename = "typeName")]
        type_name: String,
    },
    /// A single entity.
    Entity {
        /// Type name.
        #[serde(rename = "typeName")]
        type_name: String,
        /// Sync id of the entity.
        #[serde(rename = "syncId")]
        sync_id: Uuid,
    },
}

/// Configuration for one sync session.
///
/// Options arriving from a peer are untrusted; the receiving side re-derives
/// its own copy before using them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOptions {
    /// Watermark for changes made on the client.
    pub last_synced_on_client: DateTime<Utc>,
    /// Watermark for changes made on the server.
    pub last_synced_on_server: DateTime<Utc>,
    /// Page size cap.
    pub items_per_sync_request: u32,
    /// Whether verbose issue messages are returned.
    pub include_issue_details: bool,
    /// Whether deletes remove rows (and leave tombstones) or soft delete.
    pub permanent_deletions: bool,
    /// Typed side-channel values.
    #[serde(default)]
    pub values: SyncValues,
    /// Requested scope.
    #[serde(default)]
    pub scope: SyncScope,
}

impl SyncOptions {
    /// Creates options for a full sync with default paging.
    pub fn new() -> Self {
        Self {
            last_synced_on_client: crate::full_sync_watermark(),
            last_synced_on_server: crate::full_sync_watermark(),
            items_per_sync_request: DEFAULT_ITEMS_PER_SYNC_REQUEST,
            include_issue_details: false,
            permanent_deletions: false,
            values: SyncValues::new(),
            scope: SyncScope::All,
        }
    }

    /// Sets the page size.
    pub fn with_items_per_sync_request(mut self, items: u32) -> Self {
        self.items_per_sync_request = items;
        self
    }

    /// Sets the scope.
    pub fn with_scope(mut self, scope: SyncScope) -> Self {
        self.scope = scope;
        self
    }

    /// Requests permanent deletions.
    pub fn with_permanent_deletions(mut self, permanent: bool) -> Self {
        self.permanent_deletions = permanent;
        self
    }

    /// Requests verbose issue messages.
    pub fn with_issue_details(mut self, include: bool) -> Self {
        self.include_issue_details = include;
        self
    }

    /// Sets a side-channel value.
    pub fn with_value<T: ValueType>(mut self, key: ValueKey<T>, value: T) -> Self {
        self.values.set(key, value);
        self
    }

    /// Sets both watermarks.
    pub fn with_watermarks(mut self, client: DateTime<Utc>, server: DateTime<Utc>) -> Self {
        self.last_synced_on_client = client;
        self.last_synced_on_server = server;
        self
    }

    /// Returns true if the client side has never synced.
    pub fn is_full_sync(&self) -> bool {
        self.last_synced_on_client == crate::full_sync_watermark()
            && self.last_synced_on_server == crate::full_sync_watermark()
    }

    /// Moves the watermarks forward. Never moves them backward.
    pub fn advance(&mut self, client: DateTime<Utc>, server: DateTime<Utc>) {
        self.last_synced_on_client = self.last_synced_on_client.max(client);
        self.last_synced_on_server = self.last_synced_on_server.max(server);
    }
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn typed_values() {
        let mut values = SyncValues::new()
            .with(ACCOUNT_CHANGED, true)
            .with(CLIENT_NAME, "tablet".to_string());

        assert_eq!(values.get(ACCOUNT_CHANGED), Some(true));
        assert_eq!(values.get(CLIENT_NAME), Some("tablet".to_string()));

        values.remove(ACCOUNT_CHANGED);
        assert_eq!(values.get(ACCOUNT_CHANGED), None);
        assert_eq!(values.len(), 1);
    }

    #[test]
    fn wrong_shape_reads_as_none() {
        let json = r#"{"accountChanged": "yes"}"#;
        let values: SyncValues = serde_json::from_str(json).unwrap();
        assert_eq!(values.get(ACCOUNT_CHANGED), None);
    }

    #[test]
    fn unknown_keys_are_dropped() {
        let json = r#"{"accountChanged": true, "debugBackdoor": true}"#;
        let mut values: SyncValues = serde_json::from_str(json).unwrap();
        values.retain_known(KNOWN_VALUE_KEYS);
        assert_eq!(values.len(), 1);
        assert_eq!(values.get(ACCOUNT_CHANGED), Some(true));
    }

    #[test]
    fn default_options_are_full_sync() {
        let options = SyncOptions::default();
        assert!(options.is_full_sync());
        assert_eq!(options.items_per_sync_request, DEFAULT_ITEMS_PER_SYNC_REQUEST);
        assert!(!options.permanent_deletions);
        assert_eq!(options.scope, SyncScope::All);
    }

    #[test]
    fn watermarks_never_move_backward() {
        let now = Utc::now();
        let mut options = SyncOptions::new().with_watermarks(now, now);

        options.advance(now - Duration::hours(1), now + Duration::hours(1));
        assert_eq!(options.last_synced_on_client, now);
        assert_eq!(options.last_synced_on_server, now + Duration::hours(1));
    }

    #[test]
    fn scope_wire_shape() {
        let id = Uuid::new_v4();
        let scope = SyncScope::Entity {
            type_name: "Person".into(),
            sync_id: id,
        };
        let json = serde_json::to_value(&scope).unwrap();
        assert_eq!(json["kind"], "Entity");
        assert_eq!(json["typeName"], "Person");

        let parsed: SyncScope = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, scope);
    }

    #[test]
    fn options_without_scope_default_to_all() {
        let json = serde_json::json!({
            "lastSyncedOnClient": "2024-01-01T00:00:00Z",
            "lastSyncedOnServer": "2024-01-01T00:00:00Z",
            "itemsPerSyncRequest": 50,
            "includeIssueDetails": false,
            "permanentDeletions": true
        });
        let options: SyncOptions = serde_json::from_value(json).unwrap();
        assert_eq!(options.scope, SyncScope::All);
        assert!(options.values.is_empty());
        assert_eq!(options.items_per_sync_request, 50);
    }

    proptest::proptest! {
        #[test]
        fn advance_is_monotonic(steps in proptest::collection::vec((-1000i64..1000, -1000i64..1000), 1..20)) {
            let base = Utc::now();
            let mut options = SyncOptions::new();
            let mut previous = (options.last_synced_on_client, options.last_synced_on_server);
            for (client, server) in steps {
                options.advance(base + Duration::seconds(client), base + Duration::seconds(server));
                proptest::prop_assert!(options.last_synced_on_client >= previous.0);
                proptest::prop_assert!(options.last_synced_on_server >= previous.1);
                previous = (options.last_synced_on_client, options.last_synced_on_server);
            }
        }
    }
}
