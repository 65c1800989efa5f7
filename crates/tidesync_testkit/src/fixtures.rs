//! Test fixtures: peers, a server and engines wired between them.
//!
//! Peers and the server of one test usually share a [`ManualClock`], so
//! every timestamp is distinct and ordered across all of them.

use crate::models::{join_roles, Account};
use crate::schema::{account_email_index, local_registry, DemoSchema};
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::Arc;
use tidesync_engine::{
    DatabaseSyncClient, LoopbackClient, RetryConfig, SyncConfig, SyncEngine, WebSyncClient,
};
use tidesync_protocol::{SyncEntity, SyncMeta, Tombstone};
use tidesync_server::{Caller, ServerConfig, SyncServer};
use tidesync_store::{ManualClock, MemoryRepository, Repository, Row, Transaction};
use uuid::Uuid;

/// Secret the test server signs tokens with.
pub const TEST_SECRET: &[u8] = b"tidesync-testkit-secret";

/// Page size used by [`test_config`]; small enough that most tests page.
pub const TEST_PAGE_SIZE: u32 = 3;

/// A client talking to a [`SyncServer`] in-process.
pub type RemoteClient = WebSyncClient<LoopbackClient<Arc<SyncServer>>>;

/// An engine between a peer and the test server.
pub type ServerEngine = SyncEngine<DatabaseSyncClient, RemoteClient>;

/// An engine between two peers.
pub type PeerEngine = SyncEngine<DatabaseSyncClient, DatabaseSyncClient>;

/// Start of test time.
pub fn test_epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

/// A clock starting at [`test_epoch`] that moves 1ms per read.
pub fn test_clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::with_step(test_epoch(), Duration::milliseconds(1)))
}

/// Engine settings for tests: small pages and no waiting between rounds.
pub fn test_config() -> SyncConfig {
    SyncConfig::new()
        .with_items_per_sync_request(TEST_PAGE_SIZE)
        .with_retry(RetryConfig::no_retry())
}

/// A client-side repository with typed helpers.
///
/// Helpers panic on store errors; they are for tests.
#[derive(Clone)]
pub struct TestPeer {
    repo: Arc<MemoryRepository>,
}

impl TestPeer {
    /// Creates an empty peer on `clock`.
    pub fn new(clock: &Arc<ManualClock>) -> Self {
        Self {
            repo: Arc::new(MemoryRepository::new().with_clock(clock.clone())),
        }
    }

    /// The repository.
    pub fn repo(&self) -> &Arc<MemoryRepository> {
        &self.repo
    }

    /// A trusted local client over the sample domain.
    pub fn client(&self) -> DatabaseSyncClient {
        DatabaseSyncClient::local(self.repo.clone(), local_registry())
    }

    /// Saves a new entity, returning it with its sync columns.
    pub fn add<T: SyncEntity>(&self, mut entity: T) -> T {
        let mut txn = Transaction::new(self.repo.as_ref());
        txn.add(&mut entity).expect("add entity");
        txn.save_changes().expect("commit add");
        entity
    }

    /// Loads an entity, changes it with `edit` and saves it.
    pub fn edit<T: SyncEntity>(&self, sync_id: Uuid, edit: impl FnOnce(&mut T)) -> T {
        let mut txn = Transaction::new(self.repo.as_ref());
        let mut entity: T = txn
            .find(sync_id)
            .expect("find entity")
            .expect("entity exists");
        edit(&mut entity);
        txn.update(&mut entity).expect("update entity");
        txn.save_changes().expect("commit update");
        entity
    }

    /// Permanently deletes an entity.
    pub fn remove<T: SyncEntity>(&self, sync_id: Uuid) -> Tombstone {
        let mut txn = Transaction::new(self.repo.as_ref());
        let tombstone = txn.remove::<T>(sync_id).expect("remove entity");
        txn.save_changes().expect("commit remove");
        tombstone
    }

    /// Soft-deletes an entity.
    pub fn soft_delete<T: SyncEntity>(&self, sync_id: Uuid) {
        let mut txn = Transaction::new(self.repo.as_ref());
        txn.soft_delete::<T>(sync_id).expect("soft delete entity");
        txn.save_changes().expect("commit soft delete");
    }

    /// A live entity by sync id.
    pub fn find<T: SyncEntity>(&self, sync_id: Uuid) -> Option<T> {
        Transaction::new(self.repo.as_ref())
            .find(sync_id)
            .expect("find entity")
    }

    /// Every live entity of a type, ordered by sync id.
    pub fn all<T: SyncEntity>(&self) -> Vec<T> {
        let mut entities: Vec<T> = Transaction::new(self.repo.as_ref())
            .all()
            .expect("list entities");
        entities.sort_by_key(|entity| entity.sync_id());
        entities
    }

    /// The stored row for a sync id, deleted or not.
    pub fn row<T: SyncEntity>(&self, sync_id: Uuid) -> Option<Row> {
        self.repo
            .find_by_sync_id(T::TYPE_NAME, sync_id)
            .expect("find row")
    }

    /// The tombstone for a sync id.
    pub fn tombstone<T: SyncEntity>(&self, sync_id: Uuid) -> Option<Tombstone> {
        self.repo
            .find_tombstone(T::TYPE_NAME, sync_id)
            .expect("find tombstone")
    }

    /// Every row of every type, for exact before/after comparisons.
    pub fn rows(&self) -> Vec<Row> {
        let mut rows = Vec::new();
        for type_name in self.repo.type_names() {
            rows.extend(self.repo.rows(&type_name).expect("list rows"));
        }
        rows
    }
}

/// A [`SyncServer`] over the sample domain with authentication on.
pub struct TestServer {
    repo: Arc<MemoryRepository>,
    server: Arc<SyncServer>,
}

impl TestServer {
    /// Creates a server on `clock` with the default configuration.
    pub fn new(clock: &Arc<ManualClock>) -> Self {
        Self::with_config(clock, ServerConfig::default())
    }

    /// Creates a server on `clock`; authentication with [`TEST_SECRET`] is
    /// always enabled.
    pub fn with_config(clock: &Arc<ManualClock>, config: ServerConfig) -> Self {
        let repo = Arc::new(
            MemoryRepository::new()
                .with_clock(clock.clone())
                .with_unique_index(account_email_index()),
        );
        let server = Arc::new(SyncServer::new(
            config.with_auth(TEST_SECRET.to_vec()),
            repo.clone(),
            Arc::new(DemoSchema),
        ));
        Self { repo, server }
    }

    /// The server's repository, wrapped for typed access.
    pub fn store(&self) -> TestPeer {
        TestPeer {
            repo: self.repo.clone(),
        }
    }

    /// The server.
    pub fn server(&self) -> &Arc<SyncServer> {
        &self.server
    }

    /// Stores an account directly on the server.
    pub fn add_account(&self, name: &str, email: &str, roles: &[&str]) -> Account {
        let roles: Vec<String> = roles.iter().map(|role| role.to_string()).collect();
        self.store().add(Account {
            meta: SyncMeta::default(),
            name: name.into(),
            email: email.into(),
            roles: join_roles(&roles),
        })
    }

    /// Signs a token for `caller`.
    pub fn token_for(&self, caller: &Caller) -> String {
        self.server
            .validator()
            .expect("authentication is enabled")
            .create_token(caller)
            .expect("sign token")
    }

    /// A remote client authenticated as `caller`.
    pub fn remote(&self, caller: &Caller) -> RemoteClient {
        let transport = LoopbackClient::new(Arc::clone(&self.server));
        WebSyncClient::new("http://tidesync.test/api", transport).with_token(self.token_for(caller))
    }

    /// An engine syncing `peer` with this server as `caller`.
    pub fn engine(&self, peer: &TestPeer, caller: &Caller, config: SyncConfig) -> ServerEngine {
        SyncEngine::new(config, peer.client(), self.remote(caller))
    }
}

/// An engine syncing two peers directly; `b` plays the remote.
pub fn peer_engine(a: &TestPeer, b: &TestPeer, config: SyncConfig) -> PeerEngine {
    SyncEngine::new(config, a.client(), b.client())
}
