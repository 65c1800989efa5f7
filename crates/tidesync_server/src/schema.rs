//! What each caller may sync.

use crate::auth::Caller;
use tidesync_engine::{ConverterSet, FilterSet, SyncRegistry, SyncResult};
use tidesync_protocol::{SyncScope, SyncValues};

/// Maps a caller to the filters and converters of their sessions.
///
/// Implementations see the trusted caller, the requested scope and the
/// whitelisted side-channel values. Whatever they return is narrowed to
/// the scope afterwards, so returning the caller's full set is correct.
pub trait ServerSchema: Send + Sync {
    /// Filters visible to `caller`.
    fn filters(
        &self,
        caller: &Caller,
        scope: &SyncScope,
        values: &SyncValues,
    ) -> SyncResult<FilterSet>;

    /// Converters applied for `caller`.
    fn converters(&self, caller: &Caller) -> ConverterSet;
}

/// A schema that gives every caller the same registry.
#[derive(Debug, Clone, Default)]
pub struct SharedSchema {
    registry: SyncRegistry,
}

impl SharedSchema {
    /// Creates a schema over `registry`.
    pub fn new(registry: SyncRegistry) -> Self {
        Self { registry }
    }
}

impl ServerSchema for SharedSchema {
    fn filters(
        &self,
        _caller: &Caller,
        _scope: &SyncScope,
        _values: &SyncValues,
    ) -> SyncResult<FilterSet> {
        Ok(self.registry.filters().clone())
    }

    fn converters(&self, _caller: &Caller) -> ConverterSet {
        self.registry.converters().clone()
    }
}
