//! Incoming and outgoing converters.
//!
//! An incoming converter decides what a peer's change does to a local
//! entity; an outgoing converter maps a local entity to the shape a peer
//! expects. Both are typed at registration and type-erased behind
//! [`IncomingHandler`] / [`OutgoingHandler`] so a session can hold one per
//! type name.

use crate::error::{SyncResult, SyncUpdateError};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tidesync_protocol::{SyncEntity, SyncMeta, SyncObject, SyncStatus};
use tidesync_store::Row;

type CopyFn<W, L> = dyn Fn(&W, &mut L) + Send + Sync;
type DecideFn<W, L> =
    dyn Fn(&mut IncomingUpdate<'_, W, L>) -> Result<bool, SyncUpdateError> + Send + Sync;

/// One incoming change, as seen by an incoming converter.
///
/// The converter inspects the incoming value and the local entity, then
/// returns `Ok(true)` to accept, `Ok(false)` to reject or an error to report
/// a typed issue. Accepting without calling [`IncomingUpdate::process_update`]
/// leaves the local entity untouched.
pub struct IncomingUpdate<'a, W, L> {
    incoming: Option<&'a W>,
    local: &'a mut L,
    status: SyncStatus,
    is_new: bool,
    processed: bool,
    refresh: bool,
    copy: &'a CopyFn<W, L>,
}

impl<'a, W, L> IncomingUpdate<'a, W, L> {
    /// The incoming value. `None` for deletions.
    pub fn incoming(&self) -> Option<&W> {
        self.incoming
    }

    /// The local entity; a default value when nothing matched locally.
    pub fn local(&self) -> &L {
        &*self.local
    }

    /// Mutable access to the local entity.
    pub fn local_mut(&mut self) -> &mut L {
        &mut *self.local
    }

    /// Status of the change after local matching.
    pub fn status(&self) -> SyncStatus {
        self.status
    }

    /// Returns true if no local entity matched.
    pub fn is_new(&self) -> bool {
        self.is_new
    }

    /// Applies the change: copies the incoming value onto the local entity,
    /// or for a deletion, marks the local entity for removal.
    pub fn process_update(&mut self) {
        if let Some(incoming) = self.incoming {
            (self.copy)(incoming, &mut *self.local);
        }
        self.processed = true;
    }

    /// Bumps the local entity's `modified_on` so it is sent back to the
    /// peer as the authoritative value.
    pub fn force_refresh(&mut self) {
        self.refresh = true;
    }
}

/// What an incoming converter decided, with the resulting local entity.
#[derive(Debug, Clone)]
pub struct IncomingOutcome {
    /// Whether the change was accepted.
    pub accepted: bool,
    /// Whether `process_update` was called.
    pub processed: bool,
    /// Whether `force_refresh` was called.
    pub refresh: bool,
    /// The local entity after the converter ran.
    pub local: serde_json::Value,
    /// Sync columns of the incoming value, if it had one.
    pub incoming_meta: Option<SyncMeta>,
    /// Typed failure raised by the converter.
    pub error: Option<SyncUpdateError>,
}

/// Type-erased incoming converter.
pub trait IncomingHandler: Send + Sync {
    /// Wire type this handler accepts.
    fn wire_type(&self) -> &'static str;

    /// Local type this handler writes.
    fn local_type(&self) -> &'static str;

    /// Runs the converter. `Err` carries a decode failure message.
    fn convert(
        &self,
        object: &SyncObject,
        status: SyncStatus,
        local: Option<&Row>,
    ) -> Result<IncomingOutcome, String>;
}

/// Type-erased outgoing converter.
pub trait OutgoingHandler: Send + Sync {
    /// Local type this handler reads.
    fn local_type(&self) -> &'static str;

    /// Wire type this handler produces.
    fn wire_type(&self) -> &'static str;

    /// Encodes a stored row with the given status.
    fn encode(&self, row: &Row, status: SyncStatus) -> SyncResult<SyncObject>;
}

/// Maps incoming `W` values onto local `L` entities.
pub struct IncomingConverter<W, L> {
    copy: Arc<CopyFn<W, L>>,
    decide: Arc<DecideFn<W, L>>,
}

impl<W, L> Clone for IncomingConverter<W, L> {
    fn clone(&self) -> Self {
        Self {
            copy: Arc::clone(&self.copy),
            decide: Arc::clone(&self.decide),
        }
    }
}

impl<W: SyncEntity, L: SyncEntity + Default> IncomingConverter<W, L> {
    /// Creates a converter that copies with `copy` and accepts every change.
    pub fn new(copy: impl Fn(&W, &mut L) + Send + Sync + 'static) -> Self {
        Self {
            copy: Arc::new(copy),
            decide: Arc::new(accept_all::<W, L>),
        }
    }

    /// Replaces the accept-everything policy.
    pub fn with_policy(
        mut self,
        decide: impl Fn(&mut IncomingUpdate<'_, W, L>) -> Result<bool, SyncUpdateError>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.decide = Arc::new(decide);
        self
    }
}

fn accept_all<W, L>(update: &mut IncomingUpdate<'_, W, L>) -> Result<bool, SyncUpdateError> {
    update.process_update();
    Ok(true)
}

impl<T: SyncEntity + Default> IncomingConverter<T, T> {
    /// Same-type converter: copies with [`SyncEntity::update_from`].
    pub fn identity() -> Self {
        Self::new(|incoming: &T, local: &mut T| local.update_from(incoming))
    }
}

impl<W: SyncEntity, L: SyncEntity + Default> IncomingHandler for IncomingConverter<W, L> {
    fn wire_type(&self) -> &'static str {
        W::TYPE_NAME
    }

    fn local_type(&self) -> &'static str {
        L::TYPE_NAME
    }

    fn convert(
        &self,
        object: &SyncObject,
        status: SyncStatus,
        local_row: Option<&Row>,
    ) -> Result<IncomingOutcome, String> {
        let incoming: Option<W> = if status.is_deleted() {
            None
        } else {
            Some(object.to_entity::<W>().map_err(|e| e.to_string())?)
        };
        let mut local: L = match local_row {
            Some(row) => row.to_entity().map_err(|e| e.to_string())?,
            None => L::default(),
        };

        let mut update = IncomingUpdate {
            incoming: incoming.as_ref(),
            local: &mut local,
            status,
            is_new: local_row.is_none(),
            processed: false,
            refresh: false,
            copy: &*self.copy,
        };
        let decision = (self.decide)(&mut update);
        let (processed, refresh) = (update.processed, update.refresh);

        let (accepted, error) = match decision {
            Ok(accepted) => (accepted, None),
            Err(e) => (false, Some(e)),
        };

        Ok(IncomingOutcome {
            accepted,
            processed,
            refresh,
            local: serde_json::to_value(&local).map_err(|e| e.to_string())?,
            incoming_meta: incoming.as_ref().map(|w| *w.meta()),
            error,
        })
    }
}

/// Maps local `L` entities to outgoing `W` values.
pub struct OutgoingConverter<L, W> {
    map: Arc<dyn Fn(&L) -> W + Send + Sync>,
}

impl<L, W> Clone for OutgoingConverter<L, W> {
    fn clone(&self) -> Self {
        Self {
            map: Arc::clone(&self.map),
        }
    }
}

impl<L: SyncEntity, W: SyncEntity> OutgoingConverter<L, W> {
    /// Creates a converter from a mapping function.
    pub fn new(map: impl Fn(&L) -> W + Send + Sync + 'static) -> Self {
        Self { map: Arc::new(map) }
    }
}

impl<T: SyncEntity> OutgoingConverter<T, T> {
    /// Same-type converter.
    pub fn identity() -> Self {
        Self::new(T::clone)
    }
}

impl<L: SyncEntity, W: SyncEntity> OutgoingHandler for OutgoingConverter<L, W> {
    fn local_type(&self) -> &'static str {
        L::TYPE_NAME
    }

    fn wire_type(&self) -> &'static str {
        W::TYPE_NAME
    }

    fn encode(&self, row: &Row, status: SyncStatus) -> SyncResult<SyncObject> {
        let local: L = row.to_entity()?;
        let mut wire = (self.map)(&local);
        *wire.meta_mut() = row.meta();
        Ok(SyncObject::from_entity(&wire, status)?)
    }
}

/// Converters registered for a session, keyed by type name.
///
/// Incoming converters are keyed by wire type, outgoing converters by local
/// type. Types without an entry use the identity converter of their filter.
#[derive(Clone, Default)]
pub struct ConverterSet {
    incoming: HashMap<&'static str, Arc<dyn IncomingHandler>>,
    outgoing: HashMap<&'static str, Arc<dyn OutgoingHandler>>,
}

impl ConverterSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an incoming converter.
    pub fn with_incoming<W, L>(mut self, converter: IncomingConverter<W, L>) -> Self
    where
        W: SyncEntity,
        L: SyncEntity + Default,
    {
        self.incoming.insert(W::TYPE_NAME, Arc::new(converter));
        self
    }

    /// Registers an outgoing converter.
    pub fn with_outgoing<L, W>(mut self, converter: OutgoingConverter<L, W>) -> Self
    where
        L: SyncEntity,
        W: SyncEntity,
    {
        self.outgoing.insert(L::TYPE_NAME, Arc::new(converter));
        self
    }

    /// Returns the incoming converter for a wire type.
    pub fn incoming(&self, wire_type: &str) -> Option<Arc<dyn IncomingHandler>> {
        self.incoming.get(wire_type).cloned()
    }

    /// Returns the outgoing converter for a local type.
    pub fn outgoing(&self, local_type: &str) -> Option<Arc<dyn OutgoingHandler>> {
        self.outgoing.get(local_type).cloned()
    }

    /// Resolves the local type a wire type is stored as.
    pub fn local_type_for<'a>(&self, wire_type: &'a str) -> &'a str {
        match self.incoming.get(wire_type) {
            Some(handler) => handler.local_type(),
            None => wire_type,
        }
    }

    /// Returns true if no converter is registered.
    pub fn is_empty(&self) -> bool {
        self.incoming.is_empty() && self.outgoing.is_empty()
    }
}

impl fmt::Debug for ConverterSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut incoming: Vec<_> = self.incoming.keys().collect();
        incoming.sort();
        let mut outgoing: Vec<_> = self.outgoing.keys().collect();
        outgoing.sort();
        f.debug_struct("ConverterSet")
            .field("incoming", &incoming)
            .field("outgoing", &outgoing)
            .finish()
    }
}
