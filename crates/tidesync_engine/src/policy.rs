//! Session policies: what a peer may sync, and how.

use crate::converter::{ConverterSet, IncomingConverter, OutgoingConverter};
use crate::error::SyncResult;
use crate::filter::{FilterSet, RepositoryFilter};
use tidesync_protocol::{SyncEntity, SyncOptions};

/// Decides the effective options, filters and converters of a session.
///
/// The options a peer sends are untrusted; a policy returns its own copy.
pub trait SyncPolicy: Send + Sync {
    /// Derives the options this side will honor.
    fn derive_options(&self, requested: &SyncOptions) -> SyncResult<SyncOptions>;

    /// Filters for the session.
    fn filters(&self, options: &SyncOptions) -> SyncResult<FilterSet>;

    /// Converters for the session.
    fn converters(&self, options: &SyncOptions) -> ConverterSet;
}

/// The syncable types of a repository, with their converters.
#[derive(Debug, Clone, Default)]
pub struct SyncRegistry {
    filters: FilterSet,
    converters: ConverterSet,
}

impl SyncRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a syncable type.
    pub fn register<T: SyncEntity + Default>(mut self, filter: RepositoryFilter<T>) -> Self {
        self.filters = self.filters.with(filter);
        self
    }

    /// Registers an incoming converter.
    pub fn with_incoming<W, L>(mut self, converter: IncomingConverter<W, L>) -> Self
    where
        W: SyncEntity,
        L: SyncEntity + Default,
    {
        self.converters = self.converters.with_incoming(converter);
        self
    }

    /// Registers an outgoing converter.
    pub fn with_outgoing<L, W>(mut self, converter: OutgoingConverter<L, W>) -> Self
    where
        L: SyncEntity,
        W: SyncEntity,
    {
        self.converters = self.converters.with_outgoing(converter);
        self
    }

    /// Registered filters.
    pub fn filters(&self) -> &FilterSet {
        &self.filters
    }

    /// Registered converters.
    pub fn converters(&self) -> &ConverterSet {
        &self.converters
    }
}

/// Policy for a peer's own local repository: the requested options are
/// trusted and every registered type is in scope.
#[derive(Debug, Clone)]
pub struct LocalPolicy {
    registry: SyncRegistry,
}

impl LocalPolicy {
    /// Creates a policy over a registry.
    pub fn new(registry: SyncRegistry) -> Self {
        Self { registry }
    }
}

impl SyncPolicy for LocalPolicy {
    fn derive_options(&self, requested: &SyncOptions) -> SyncResult<SyncOptions> {
        let mut options = requested.clone();
        options.items_per_sync_request = options.items_per_sync_request.max(1);
        Ok(options)
    }

    fn filters(&self, options: &SyncOptions) -> SyncResult<FilterSet> {
        self.registry.filters.narrowed(&options.scope)
    }

    fn converters(&self, _options: &SyncOptions) -> ConverterSet {
        self.registry.converters.clone()
    }
}
