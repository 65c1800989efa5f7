//! End-to-end: engines syncing with a server through the loopback transport.

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tidesync_engine::{
    DatabaseSyncClient, LoopbackClient, RepositoryFilter, SyncConfig, SyncEngine, SyncRegistry,
    WebSyncClient,
};
use tidesync_protocol::{SyncEntity, SyncMeta};
use tidesync_server::{Caller, ServerConfig, SharedSchema, SyncServer};
use tidesync_store::{ManualClock, MemoryRepository, Transaction};
use uuid::Uuid;

const SECRET: &[u8] = b"loopback-secret";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Task {
    #[serde(flatten)]
    meta: SyncMeta,
    title: String,
}

impl SyncEntity for Task {
    const TYPE_NAME: &'static str = "Task";

    fn meta(&self) -> &SyncMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut SyncMeta {
        &mut self.meta
    }

    fn update_from(&mut self, other: &Self) {
        self.title = other.title.clone();
    }
}

fn registry() -> SyncRegistry {
    SyncRegistry::new().register(RepositoryFilter::<Task>::new())
}

fn clocked(repo: MemoryRepository, offset_minutes: i64) -> Arc<MemoryRepository> {
    let start = Utc::now() + Duration::minutes(offset_minutes);
    let clock = Arc::new(ManualClock::with_step(start, Duration::milliseconds(1)));
    Arc::new(repo.with_clock(clock))
}

fn server(repo: Arc<MemoryRepository>) -> Arc<SyncServer> {
    Arc::new(SyncServer::new(
        ServerConfig::default().with_auth(SECRET.to_vec()),
        repo,
        Arc::new(SharedSchema::new(registry())),
    ))
}

type Remote = WebSyncClient<LoopbackClient<Arc<SyncServer>>>;

fn engine(
    local: &Arc<MemoryRepository>,
    server: &Arc<SyncServer>,
) -> SyncEngine<DatabaseSyncClient, Remote> {
    let validator = server.validator().unwrap();
    let token = validator.create_token(&Caller::user(Uuid::new_v4())).unwrap();
    let transport = LoopbackClient::new(Arc::clone(server));
    let remote = WebSyncClient::new("http://localhost/api", transport).with_token(token);
    let local = DatabaseSyncClient::local(local.clone(), registry());
    SyncEngine::new(SyncConfig::new().with_items_per_sync_request(2), local, remote)
}

fn add_task(repo: &MemoryRepository, title: &str) {
    let mut task = Task {
        title: title.into(),
        ..Task::default()
    };
    let mut txn = Transaction::new(repo);
    txn.add(&mut task).unwrap();
    txn.save_changes().unwrap();
}

fn titles(repo: &MemoryRepository) -> Vec<String> {
    let txn = Transaction::new(repo);
    let mut titles: Vec<String> = txn
        .all::<Task>()
        .unwrap()
        .into_iter()
        .map(|t| t.title)
        .collect();
    titles.sort();
    titles
}

#[test]
fn clients_meet_through_the_server() {
    let server_repo = clocked(MemoryRepository::new(), 0);
    let server = server(server_repo.clone());

    let phone = clocked(MemoryRepository::new(), 0);
    let laptop = clocked(MemoryRepository::new(), 0);
    add_task(&phone, "buy milk");
    add_task(&phone, "call mum");
    add_task(&laptop, "file taxes");

    let phone_sync = engine(&phone, &server);
    let laptop_sync = engine(&laptop, &server);

    assert_eq!(phone_sync.sync().unwrap().pushed, 2);
    laptop_sync.sync().unwrap();
    phone_sync.sync().unwrap();

    let expected = vec!["buy milk", "call mum", "file taxes"];
    assert_eq!(titles(&phone), expected);
    assert_eq!(titles(&laptop), expected);
    assert_eq!(titles(&server_repo), expected);
    assert_eq!(server.active_sessions(), 0);
}

#[test]
fn server_state_survives_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let snapshot = dir.path().join("server.json");

    let server_repo = clocked(MemoryRepository::new(), 0);
    let first = server(server_repo.clone());
    let phone = clocked(MemoryRepository::new(), 0);
    add_task(&phone, "water plants");
    engine(&phone, &first).sync().unwrap();
    server_repo.save(&snapshot).unwrap();
    drop(first);

    // The restarted process reads a clock that has moved on.
    let restarted = server(clocked(MemoryRepository::open(&snapshot).unwrap(), 60));
    let tablet = clocked(MemoryRepository::new(), 60);
    engine(&tablet, &restarted).sync().unwrap();

    assert_eq!(titles(&tablet), vec!["water plants"]);
}
