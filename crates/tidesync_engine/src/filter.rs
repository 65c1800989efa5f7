//! Repository filters: which rows of a type a session may see and touch.

use crate::converter::{IncomingConverter, IncomingHandler, OutgoingConverter, OutgoingHandler};
use crate::error::{SyncError, SyncResult};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use tidesync_protocol::{SyncEntity, SyncObject, SyncScope, Tombstone};
use tidesync_store::Row;
use uuid::Uuid;

type Predicate<T> = dyn Fn(&T) -> bool + Send + Sync;
type Lookup<T> = dyn Fn(&T, &T) -> bool + Send + Sync;

/// Declares a syncable type, with an optional row predicate and an
/// optional natural-key lookup.
///
/// The predicate applies in both directions: rows it rejects are never
/// sent, and incoming changes to or producing such rows are refused.
///
/// # Example
///
/// ```rust,ignore
/// let mine = RepositoryFilter::<Person>::new()
///     .with_predicate(move |p| p.account_id == caller);
/// ```
pub struct RepositoryFilter<T> {
    predicate: Option<Arc<Predicate<T>>>,
    lookup: Option<Arc<Lookup<T>>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for RepositoryFilter<T> {
    fn clone(&self) -> Self {
        Self {
            predicate: self.predicate.clone(),
            lookup: self.lookup.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: SyncEntity + Default> RepositoryFilter<T> {
    /// A filter that admits every row of `T`.
    pub fn new() -> Self {
        Self {
            predicate: None,
            lookup: None,
            _marker: PhantomData,
        }
    }

    /// Restricts the visible rows.
    pub fn with_predicate(
        mut self,
        predicate: impl Fn(&T) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    /// Matches incoming entities to local ones when sync ids differ.
    ///
    /// Called as `lookup(local, incoming)`.
    pub fn with_lookup(
        mut self,
        lookup: impl Fn(&T, &T) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.lookup = Some(Arc::new(lookup));
        self
    }

    /// Returns true if the predicate admits `entity`.
    pub fn matches(&self, entity: &T) -> bool {
        self.predicate.as_ref().map_or(true, |p| p(entity))
    }
}

impl<T: SyncEntity + Default> Default for RepositoryFilter<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Type-erased [`RepositoryFilter`].
pub trait SyncFilter: Send + Sync {
    /// Local type the filter covers.
    fn type_name(&self) -> &'static str;

    /// Returns true if the row is visible. Decode failures are errors.
    fn allows(&self, row: &Row) -> SyncResult<bool>;

    /// Returns true if the tombstone is visible.
    fn allows_tombstone(&self, _tombstone: &Tombstone) -> bool {
        true
    }

    /// Returns true if a natural-key lookup is configured.
    fn has_lookup(&self) -> bool;

    /// Finds the live row matching `incoming` by natural key.
    fn lookup(&self, rows: &[Row], incoming: &SyncObject) -> Option<Row>;

    /// Same-type incoming converter.
    fn identity_incoming(&self) -> Arc<dyn IncomingHandler>;

    /// Same-type outgoing converter.
    fn identity_outgoing(&self) -> Arc<dyn OutgoingHandler>;
}

impl<T: SyncEntity + Default> SyncFilter for RepositoryFilter<T> {
    fn type_name(&self) -> &'static str {
        T::TYPE_NAME
    }

    fn allows(&self, row: &Row) -> SyncResult<bool> {
        match &self.predicate {
            None => Ok(true),
            Some(predicate) => Ok(predicate(&row.to_entity::<T>()?)),
        }
    }

    fn has_lookup(&self) -> bool {
        self.lookup.is_some()
    }

    fn lookup(&self, rows: &[Row], incoming: &SyncObject) -> Option<Row> {
        let lookup = self.lookup.as_ref()?;
        // Only same-shaped payloads can be compared.
        let mut candidate: T = serde_json::from_str(&incoming.data).ok()?;
        candidate.meta_mut().sync_id = incoming.sync_id;

        rows.iter()
            .filter(|row| !row.is_deleted)
            .find(|row| {
                row.to_entity::<T>()
                    .map(|local| lookup(&local, &candidate))
                    .unwrap_or(false)
            })
            .cloned()
    }

    fn identity_incoming(&self) -> Arc<dyn IncomingHandler> {
        Arc::new(IncomingConverter::<T, T>::identity())
    }

    fn identity_outgoing(&self) -> Arc<dyn OutgoingHandler> {
        Arc::new(OutgoingConverter::<T, T>::identity())
    }
}

/// Narrows a filter to a single entity.
struct EntityFilter {
    inner: Arc<dyn SyncFilter>,
    sync_id: Uuid,
}

impl SyncFilter for EntityFilter {
    fn type_name(&self) -> &'static str {
        self.inner.type_name()
    }

    fn allows(&self, row: &Row) -> SyncResult<bool> {
        if row.sync_id != self.sync_id {
            return Ok(false);
        }
        self.inner.allows(row)
    }

    fn allows_tombstone(&self, tombstone: &Tombstone) -> bool {
        tombstone.sync_id == self.sync_id && self.inner.allows_tombstone(tombstone)
    }

    fn has_lookup(&self) -> bool {
        false
    }

    fn lookup(&self, _rows: &[Row], _incoming: &SyncObject) -> Option<Row> {
        None
    }

    fn identity_incoming(&self) -> Arc<dyn IncomingHandler> {
        self.inner.identity_incoming()
    }

    fn identity_outgoing(&self) -> Arc<dyn OutgoingHandler> {
        self.inner.identity_outgoing()
    }
}

/// The filters in effect for a session, in sync order.
#[derive(Clone, Default)]
pub struct FilterSet {
    filters: Vec<Arc<dyn SyncFilter>>,
}

impl FilterSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a typed filter. A later filter for the same type replaces the
    /// earlier one.
    pub fn with<T: SyncEntity + Default>(self, filter: RepositoryFilter<T>) -> Self {
        self.with_filter(Arc::new(filter))
    }

    /// Adds a type-erased filter.
    pub fn with_filter(mut self, filter: Arc<dyn SyncFilter>) -> Self {
        self.filters.retain(|f| f.type_name() != filter.type_name());
        self.filters.push(filter);
        self
    }

    /// Returns the filter for a local type.
    pub fn get(&self, type_name: &str) -> Option<&Arc<dyn SyncFilter>> {
        self.filters.iter().find(|f| f.type_name() == type_name)
    }

    /// Returns true if the type is in the set.
    pub fn contains(&self, type_name: &str) -> bool {
        self.get(type_name).is_some()
    }

    /// Iterates over the filters in sync order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn SyncFilter>> {
        self.filters.iter()
    }

    /// Returns the covered type names in sync order.
    pub fn type_names(&self) -> Vec<&'static str> {
        self.filters.iter().map(|f| f.type_name()).collect()
    }

    /// Number of filters.
    pub fn len(&self) -> usize {
        self.filters.len()
    }

    /// Returns true if no type is covered.
    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Restricts the set to a scope.
    ///
    /// A scope naming a type outside the set is an invalid operation.
    pub fn narrowed(&self, scope: &SyncScope) -> SyncResult<FilterSet> {
        match scope {
            SyncScope::All => Ok(self.clone()),
            SyncScope::Type { type_name } => {
                let filter = self.require(type_name)?;
                Ok(FilterSet::new().with_filter(Arc::clone(filter)))
            }
            SyncScope::Entity { type_name, sync_id } => {
                let filter = self.require(type_name)?;
                Ok(FilterSet::new().with_filter(Arc::new(EntityFilter {
                    inner: Arc::clone(filter),
                    sync_id: *sync_id,
                })))
            }
        }
    }

    fn require(&self, type_name: &str) -> SyncResult<&Arc<dyn SyncFilter>> {
        self.get(type_name).ok_or_else(|| {
            SyncError::invalid(format!("type {type_name} is not syncable in this scope"))
        })
    }
}

impl fmt::Debug for FilterSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("FilterSet").field(&self.type_names()).finish()
    }
}
