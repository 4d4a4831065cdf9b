use std::{
    collections::BTreeMap,
    env, fs, io,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use futures_util::{StreamExt, stream};
use mockall::{mock, predicate::eq};
use types::{DevnetConfig, DevnetPlatform, DevnetRecord, PortMode, RecordPort};

use super::*;
use crate::{
    engine::LogStream,
    state::{RECORD_FILE_NAME, WALLET_DIR_NAME},
};

const READY_PHRASE: &str = "indexed block";
const FREE_PORT: u16 = 40_123;

mock! {
    Probe {}
    #[async_trait]
    impl PortProbe for Probe {
        fn free_port(&self) -> io::Result<u16>;
        fn is_taken(&self, port: u16) -> bool;
        async fn accepts_connections(&self, host: &str, port: u16) -> bool;
    }
}

impl std::fmt::Debug for MockProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MockProbe")
    }
}

fn open_probe(port: u16) -> MockProbe {
    let mut probe = MockProbe::new();
    probe.expect_free_port().returning(move || Ok(port));
    probe.expect_is_taken().returning(|_| false);
    probe.expect_accepts_connections().returning(|_, _| true);
    probe
}

#[derive(Debug)]
struct FakeContainer {
    id: String,
    spec: ContainerSpec,
    running: AtomicBool,
    starts: AtomicUsize,
    kills: AtomicUsize,
    /// `None` keeps the output stream open without ever producing a line.
    logs: Option<Vec<String>>,
    exit_code: i64,
    files: BTreeMap<String, String>,
    inspect_fails: bool,
    start_fails: bool,
}

impl FakeContainer {
    fn new(id: &str, spec: ContainerSpec, running: bool) -> Self {
        Self {
            id: id.to_owned(),
            spec,
            running: AtomicBool::new(running),
            starts: AtomicUsize::new(0),
            kills: AtomicUsize::new(0),
            logs: Some(Vec::new()),
            exit_code: 0,
            files: BTreeMap::new(),
            inspect_fails: false,
            start_fails: false,
        }
    }

    fn is_up(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn start_count(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    fn kill_count(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContainerHandle for FakeContainer {
    fn id(&self) -> &str {
        &self.id
    }

    async fn is_running(&self) -> Result<bool, EngineError> {
        if self.inspect_fails {
            return Err(EngineError::operation("inspect_container", &self.id, "daemon hiccup"));
        }
        Ok(self.is_up())
    }

    async fn start(&self) -> Result<(), EngineError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if self.start_fails {
            return Err(EngineError::operation("start_container", &self.id, "port already allocated"));
        }
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn kill(&self) -> Result<(), EngineError> {
        self.kills.fetch_add(1, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn logs(&self) -> Result<LogStream, EngineError> {
        Ok(match &self.logs {
            Some(lines) => stream::iter(lines.clone().into_iter().map(Ok)).boxed(),
            None => stream::pending().boxed(),
        })
    }

    /// Mimics the cleanup container: a successful run empties every mount.
    async fn wait_exit(&self) -> Result<i64, EngineError> {
        self.running.store(false, Ordering::SeqCst);
        if self.exit_code == 0 {
            for mount in &self.spec.mounts {
                for entry in fs::read_dir(&mount.host_path).expect("mount should exist") {
                    let path = entry.expect("entry should be readable").path();
                    if path.is_dir() {
                        fs::remove_dir_all(&path).expect("dir should be removed");
                    } else {
                        fs::remove_file(&path).expect("file should be removed");
                    }
                }
            }
        }
        Ok(self.exit_code)
    }

    async fn exec(&self, command: &[String]) -> Result<String, EngineError> {
        match command {
            [program, path] if program == "cat" => self
                .files
                .get(path)
                .cloned()
                .ok_or_else(|| EngineError::operation("exec", &self.id, "no such file")),
            _ => Err(EngineError::operation("exec", &self.id, "unsupported command")),
        }
    }

    async fn commit(&self, repository: &str, tag: &str) -> Result<String, EngineError> {
        Ok(format!("sha256:{repository}-{tag}"))
    }
}

#[derive(Debug)]
struct FakeEngineState {
    created: Vec<ContainerSpec>,
    containers: BTreeMap<String, Arc<FakeContainer>>,
    resolve_error: Option<EngineError>,
    node_logs: Option<Vec<String>>,
    cleanup_exit_code: i64,
    container_files: BTreeMap<String, String>,
}

/// Records every container it is asked to create.
#[derive(Debug)]
struct FakeEngine {
    state: Mutex<FakeEngineState>,
}

impl FakeEngine {
    fn new() -> Self {
        Self {
            state: Mutex::new(FakeEngineState {
                created: Vec::new(),
                containers: BTreeMap::new(),
                resolve_error: None,
                node_logs: Some(vec![
                    "booting node\n".to_owned(),
                    "INFO indexed block height=0\n".to_owned(),
                    format!("12:00PM INF {READY_PHRASE} height=1\n"),
                ]),
                cleanup_exit_code: 0,
                container_files: BTreeMap::new(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeEngineState> {
        self.state
            .lock()
            .expect("fake engine mutex should not be poisoned")
    }

    fn created(&self) -> Vec<ContainerSpec> {
        self.lock().created.clone()
    }

    fn container(&self, id: &str) -> Arc<FakeContainer> {
        Arc::clone(
            self.lock()
                .containers
                .get(id)
                .expect("container should be known to the fake engine"),
        )
    }

    fn insert_container(&self, id: &str, running: bool) {
        self.insert(FakeContainer::new(id, ContainerSpec::new(id, "node-image"), running));
    }

    fn insert(&self, container: FakeContainer) {
        self.lock()
            .containers
            .insert(container.id.clone(), Arc::new(container));
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    fn label(&self) -> String {
        "fake".to_owned()
    }

    async fn create_and_run(
        &self,
        spec: ContainerSpec,
    ) -> Result<Arc<dyn ContainerHandle>, EngineError> {
        let mut state = self.lock();
        state.created.push(spec.clone());
        let id = format!("container-{}", state.created.len());
        let mut container = FakeContainer::new(&id, spec.clone(), true);
        if spec.privileged {
            container.exit_code = state.cleanup_exit_code;
        } else {
            container.logs = state.node_logs.clone();
            container.files = state.container_files.clone();
        }
        let container = Arc::new(container);
        state
            .containers
            .retain(|_, existing| existing.spec.name != spec.name);
        state.containers.insert(id, Arc::clone(&container));
        Ok(container)
    }

    async fn resolve(&self, container_id: &str) -> Result<Arc<dyn ContainerHandle>, EngineError> {
        let state = self.lock();
        if let Some(error) = &state.resolve_error {
            return Err(error.clone());
        }
        state
            .containers
            .get(container_id)
            .map(|container| Arc::clone(container) as Arc<dyn ContainerHandle>)
            .ok_or_else(|| EngineError::NotFound {
                container: container_id.to_owned(),
            })
    }
}

fn temp_dir(label: &str) -> PathBuf {
    let unique = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock should be after epoch")
        .as_nanos();
    let root = env::temp_dir().join(format!(
        "devnet-{label}-{}-{unique}",
        std::process::id()
    ));
    fs::create_dir_all(&root).expect("temp dir should be created");
    root
}

fn test_settings(root: &Path, chain_id: &str) -> DevnetSettings {
    let config = DevnetConfig {
        chain_id: chain_id.to_owned(),
        state_root: Some(root.join(chain_id)),
        ready_phrase: Some(READY_PHRASE.to_owned()),
        launch_timeout_secs: 5,
        post_launch_wait_secs: 0,
        uid: Some(1000),
        gid: Some(1000),
        ..DevnetConfig::default()
    };
    DevnetSettings::from_config(&config).expect("test settings should be valid")
}

fn devnet(engine: &Arc<FakeEngine>, settings: DevnetSettings) -> ContainerDevnet {
    ContainerDevnet::new(
        settings,
        Arc::clone(engine) as Arc<dyn ContainerEngine>,
        Arc::new(open_probe(FREE_PORT)),
    )
}

fn deny_removal(_: &Path) -> io::Result<()> {
    Err(io::Error::from(io::ErrorKind::PermissionDenied))
}

fn fail_removal(_: &Path) -> io::Result<()> {
    Err(io::Error::other("disk on fire"))
}

fn write_state(root: &Path, record: &str) {
    fs::create_dir_all(root.join(WALLET_DIR_NAME)).expect("state dir should be created");
    fs::write(root.join(RECORD_FILE_NAME), record).expect("record should be written");
}

#[test]
fn state_store_round_trips_records_without_leaving_temp_files() {
    let root = temp_dir("state-round-trip");
    let store = StateStore::new(root.join("nested").join("test-1"));
    let record = DevnetRecord::new("test-1", 26657)
        .with_container_id("abc123")
        .with_host("localhost");

    assert_eq!(store.load().expect("missing record should load"), None);
    store.save(&record).expect("record should save");

    assert_eq!(
        store.load().expect("record should load"),
        Some(record.clone())
    );
    let entries: Vec<_> = fs::read_dir(store.root())
        .expect("state dir should exist")
        .map(|entry| entry.expect("entry").file_name())
        .collect();
    assert_eq!(entries, vec![RECORD_FILE_NAME]);

    let updated = record.with_container_id("def456");
    store.save(&updated).expect("record should be replaced");
    assert_eq!(store.load().expect("record should load"), Some(updated));
    let _ = fs::remove_dir_all(root);
}

#[test]
fn state_store_reports_corruption_without_touching_disk() {
    let root = temp_dir("state-corrupt");
    let store = StateStore::new(&root);
    fs::write(store.record_path(), "{ not json").expect("record should be written");

    let error = store.load().expect_err("corrupt record should fail");
    assert!(error.is_corrupt());
    assert!(store.record_exists());

    fs::write(store.record_path(), r#"{"chainId":"  ","port":1}"#).expect("record");
    assert!(store.load().expect_err("blank chain id").is_corrupt());
    let _ = fs::remove_dir_all(root);
}

#[test]
fn port_allocator_retries_until_a_free_port_is_verified() {
    let mut probe = MockProbe::new();
    let mut offered = vec![40_002, 40_001];
    probe
        .expect_free_port()
        .times(2)
        .returning(move || Ok(offered.pop().unwrap_or_default()));
    probe
        .expect_is_taken()
        .with(eq(40_001))
        .times(1)
        .return_const(true);
    probe
        .expect_is_taken()
        .with(eq(40_002))
        .times(1)
        .return_const(false);

    assert_eq!(allocate_port(&probe, None).expect("port"), 40_002);
}

#[test]
fn port_allocator_keeps_a_free_requested_port_and_treats_zero_as_unset() {
    let mut probe = MockProbe::new();
    probe.expect_free_port().times(1).returning(|| Ok(41_000));
    probe.expect_is_taken().returning(|_| false);

    assert_eq!(allocate_port(&probe, Some(1317)).expect("port"), 1317);
    assert_eq!(allocate_port(&probe, Some(0)).expect("port"), 41_000);
}

#[test]
fn node_environment_sets_exactly_one_port_variable() {
    let root = temp_dir("node-env");
    let mut settings = test_settings(&root, "test-1");
    settings.identities = vec!["Alice".to_owned(), "Bob".to_owned()];

    let env = settings.node_environment(1317);
    assert_eq!(env.get("ChainID").map(String::as_str), Some("test-1"));
    assert_eq!(env.get("GenesisAccounts").map(String::as_str), Some("Alice Bob"));
    assert_eq!(env.get("Verbose").map(String::as_str), Some(""));
    assert_eq!(env.get("_UID").map(String::as_str), Some("1000"));
    assert_eq!(env.get("lcpPort").map(String::as_str), Some("1317"));
    assert!(!env.contains_key("grpcWebAddr"));

    settings.port_mode = PortMode::GrpcWeb;
    settings.verbose = true;
    let env = settings.node_environment(9091);
    assert_eq!(
        env.get("grpcWebAddr").map(String::as_str),
        Some("0.0.0.0:9091")
    );
    assert_eq!(env.get("Verbose").map(String::as_str), Some("yes"));
    assert!(!env.contains_key("lcpPort"));
    let _ = fs::remove_dir_all(root);
}

#[test]
fn settings_resolve_platform_defaults_and_sanitize_names() {
    let config = DevnetConfig {
        chain_id: "my chain/1".to_owned(),
        platform: Some(DevnetPlatform::Scrt1_4),
        no_state_mount: true,
        ..DevnetConfig::default()
    };
    let settings = DevnetSettings::from_config(&config).expect("settings");

    assert_eq!(settings.port_mode, PortMode::GrpcWeb);
    assert_eq!(settings.image, DevnetPlatform::Scrt1_4.default_image());
    assert_eq!(settings.ready_phrase, "indexed block");
    assert_eq!(settings.launch_timeout, Duration::from_secs(120));
    assert!(!settings.mount_state);
    assert_eq!(settings.container_name(Some(9091)), "my-chain-1-9091");
}

#[tokio::test]
async fn spawn_on_fresh_state_persists_record_and_confirms_readiness() {
    let root = temp_dir("spawn-fresh");
    let engine = Arc::new(FakeEngine::new());
    let mut probe = MockProbe::new();
    probe.expect_free_port().returning(|| Ok(FREE_PORT));
    probe.expect_is_taken().with(eq(FREE_PORT)).return_const(false);
    probe
        .expect_accepts_connections()
        .withf(|host, port| host == "localhost" && *port == FREE_PORT)
        .times(1..)
        .return_const(true);
    let mut devnet = ContainerDevnet::new(
        test_settings(&root, "test-1"),
        Arc::clone(&engine) as Arc<dyn ContainerEngine>,
        Arc::new(probe),
    );

    devnet.spawn().await.expect("spawn should succeed");

    assert_eq!(devnet.phase(), DevnetPhase::Running);
    let record = devnet
        .record()
        .expect("record should load")
        .expect("record should exist");
    assert_eq!(record.chain_id, "test-1");
    assert_eq!(record.container_id.as_deref(), Some("container-1"));
    assert_eq!(record.port, RecordPort::Number(FREE_PORT));
    assert_eq!(record.host.as_deref(), Some("localhost"));
    assert_eq!(
        devnet.url().map(|url| url.to_string()),
        Some(format!("http://localhost:{FREE_PORT}/"))
    );

    let created = engine.created();
    assert_eq!(created.len(), 1);
    let spec = &created[0];
    assert_eq!(spec.name, format!("test-1-{FREE_PORT}"));
    assert_eq!(spec.published_ports, vec![FREE_PORT]);
    assert_eq!(spec.hostname.as_deref(), Some("test-1"));
    assert!(spec.tty);
    assert_eq!(
        spec.env.get("lcpPort").map(String::as_str),
        Some(FREE_PORT.to_string().as_str())
    );
    assert_eq!(
        spec.labels.get("devnet.chain_id").map(String::as_str),
        Some("test-1")
    );
    assert_eq!(
        spec.mounts,
        vec![BindMount::read_write(root.join("test-1"), "/state/test-1")]
    );
    let _ = fs::remove_dir_all(root);
}

#[tokio::test]
async fn spawn_without_state_mount_and_with_init_script() {
    let root = temp_dir("spawn-init");
    let script = root.join("devnet-init.sh");
    fs::write(&script, "#!/bin/sh\n").expect("script should be written");
    let engine = Arc::new(FakeEngine::new());
    let mut settings = test_settings(&root, "test-1");
    settings.mount_state = false;
    settings.init_script = Some(script.clone());
    let mut devnet = devnet(&engine, settings);

    devnet.spawn().await.expect("spawn should succeed");

    let spec = &engine.created()[0];
    assert_eq!(
        spec.mounts,
        vec![BindMount::read_only(script, "/devnet-init.sh")]
    );
    assert_eq!(spec.command, vec!["/devnet-init.sh".to_owned()]);
    let _ = fs::remove_dir_all(root);
}

#[tokio::test]
async fn spawn_timeout_surfaces_and_leaves_container_running() {
    let root = temp_dir("spawn-timeout");
    let engine = Arc::new(FakeEngine::new());
    engine.lock().node_logs = None;
    let mut settings = test_settings(&root, "test-1");
    settings.launch_timeout = Duration::from_millis(50);
    let mut devnet = devnet(&engine, settings);

    let error = devnet.spawn().await.expect_err("silent node should time out");

    assert!(matches!(error, DevnetError::ReadinessTimeout { ref chain_id, .. } if chain_id == "test-1"));
    let container = engine.container("container-1");
    assert!(container.is_up());
    assert_eq!(container.kill_count(), 0);
    let record = devnet.record().expect("record").expect("record should exist");
    assert_eq!(record.container_id.as_deref(), Some("container-1"));
    let _ = fs::remove_dir_all(root);
}

#[tokio::test]
async fn spawn_reports_node_that_exits_before_ready() {
    let root = temp_dir("spawn-exit");
    let engine = Arc::new(FakeEngine::new());
    engine.lock().node_logs = Some(vec!["panic: genesis mismatch\n".to_owned()]);
    let mut devnet = devnet(&engine, test_settings(&root, "test-1"));

    let error = devnet.spawn().await.expect_err("exited node should fail");
    assert!(matches!(error, DevnetError::LogStreamEnded { .. }));
    let _ = fs::remove_dir_all(root);
}

#[tokio::test]
async fn respawn_twice_reuses_the_running_container() {
    let root = temp_dir("respawn-idempotent");
    let engine = Arc::new(FakeEngine::new());
    let settings = test_settings(&root, "test-1");

    let mut first = devnet(&engine, settings.clone());
    first.respawn().await.expect("first respawn should spawn");
    let mut second = devnet(&engine, settings);
    second.respawn().await.expect("second respawn should reuse");
    second.respawn().await.expect("repeat respawn should reuse");

    assert_eq!(engine.created().len(), 1);
    assert_eq!(first.container_id().as_deref(), Some("container-1"));
    assert_eq!(second.container_id().as_deref(), Some("container-1"));
    assert_eq!(second.port(), Some(FREE_PORT));
    assert_eq!(second.phase(), DevnetPhase::Running);
    assert_eq!(engine.container("container-1").start_count(), 0);
    let _ = fs::remove_dir_all(root);
}

#[tokio::test]
async fn respawn_recreates_when_recorded_container_is_missing() {
    let root = temp_dir("respawn-missing");
    let state_root = root.join("test-1");
    write_state(
        &state_root,
        r#"{"containerId":"vanished","chainId":"test-1","port":"40123"}"#,
    );
    let engine = Arc::new(FakeEngine::new());
    let mut devnet = devnet(&engine, test_settings(&root, "test-1"));

    devnet.respawn().await.expect("missing container should be recovered");

    assert_eq!(engine.created().len(), 1);
    let record = devnet.record().expect("record").expect("record should exist");
    assert_eq!(record.container_id.as_deref(), Some("container-1"));
    assert!(!state_root.join(WALLET_DIR_NAME).exists());
    let _ = fs::remove_dir_all(root);
}

#[tokio::test]
async fn respawn_discards_corrupt_state_and_spawns_fresh() {
    let root = temp_dir("respawn-corrupt");
    let state_root = root.join("test-1");
    write_state(&state_root, "{\"containerId\": tru");
    fs::write(state_root.join(WALLET_DIR_NAME).join("Alice.json"), "{}").expect("wallet");
    let engine = Arc::new(FakeEngine::new());
    let mut devnet = devnet(&engine, test_settings(&root, "test-1"));

    devnet.respawn().await.expect("corrupt state should be recovered");

    let record = devnet.record().expect("record should be valid").expect("record");
    assert_eq!(record.chain_id, "test-1");
    assert_eq!(record.container_id.as_deref(), Some("container-1"));
    assert!(!state_root.join(WALLET_DIR_NAME).exists());
    let _ = fs::remove_dir_all(root);
}

#[tokio::test]
async fn respawn_restarts_a_stopped_container_instead_of_recreating_it() {
    let root = temp_dir("respawn-stopped");
    write_state(
        &root.join("test-1"),
        r#"{"containerId":"stopped-node","chainId":"test-1","host":"localhost","port":26657}"#,
    );
    let engine = Arc::new(FakeEngine::new());
    engine.insert_container("stopped-node", false);
    let mut devnet = devnet(&engine, test_settings(&root, "test-1"));

    devnet.respawn().await.expect("stopped container should restart");

    let container = engine.container("stopped-node");
    assert!(container.is_up());
    assert_eq!(container.start_count(), 1);
    assert!(engine.created().is_empty());
    assert_eq!(devnet.container_id().as_deref(), Some("stopped-node"));
    assert_eq!(devnet.port(), Some(26657));
    let _ = fs::remove_dir_all(root);
}

#[tokio::test]
async fn respawn_falls_forward_on_unexpected_engine_errors() {
    let root = temp_dir("respawn-engine-error");
    write_state(
        &root.join("test-1"),
        r#"{"containerId":"flaky","chainId":"test-1","port":26657}"#,
    );
    let engine = Arc::new(FakeEngine::new());
    engine.lock().resolve_error = Some(EngineError::operation("inspect", "flaky", "timeout"));
    let mut devnet = devnet(&engine, test_settings(&root, "test-1"));

    devnet.respawn().await.expect("engine errors should not surface");

    assert_eq!(engine.created().len(), 1);
    assert_eq!(devnet.container_id().as_deref(), Some("container-1"));
    let _ = fs::remove_dir_all(root);
}

#[tokio::test]
async fn respawn_discards_state_when_container_cannot_be_inspected() {
    let root = temp_dir("respawn-inspect-error");
    let state_root = root.join("test-1");
    write_state(
        &state_root,
        r#"{"containerId":"broken-node","chainId":"test-1","port":26657}"#,
    );
    fs::write(state_root.join(WALLET_DIR_NAME).join("Alice.json"), "{}").expect("wallet");
    let engine = Arc::new(FakeEngine::new());
    let mut broken = FakeContainer::new("broken-node", ContainerSpec::new("broken", "node-image"), true);
    broken.inspect_fails = true;
    engine.insert(broken);
    let mut devnet = devnet(&engine, test_settings(&root, "test-1"));

    devnet.respawn().await.expect("inspection failure should be recovered");

    assert_eq!(engine.created().len(), 1);
    assert!(!state_root.join(WALLET_DIR_NAME).exists());
    let record = devnet.record().expect("record").expect("record should exist");
    assert_eq!(record.container_id.as_deref(), Some("container-1"));
    assert_eq!(devnet.phase(), DevnetPhase::Running);
    let _ = fs::remove_dir_all(root);
}

#[tokio::test]
async fn respawn_spawns_fresh_when_stopped_container_fails_to_start() {
    let root = temp_dir("respawn-start-error");
    let state_root = root.join("test-1");
    write_state(
        &state_root,
        r#"{"containerId":"stuck-node","chainId":"test-1","port":26657}"#,
    );
    let engine = Arc::new(FakeEngine::new());
    let mut stuck = FakeContainer::new("stuck-node", ContainerSpec::new("stuck", "node-image"), false);
    stuck.start_fails = true;
    engine.insert(stuck);
    let mut devnet = devnet(&engine, test_settings(&root, "test-1"));

    devnet.respawn().await.expect("start failure should fall forward");

    let stuck = engine.container("stuck-node");
    assert_eq!(stuck.start_count(), 1);
    assert!(!stuck.is_up());
    assert_eq!(engine.created().len(), 1);
    assert_eq!(devnet.container_id().as_deref(), Some("container-1"));
    let record = devnet.record().expect("record").expect("record should exist");
    assert_eq!(record.container_id.as_deref(), Some("container-1"));
    let _ = fs::remove_dir_all(root);
}

#[tokio::test]
async fn spawn_times_out_when_port_never_opens_and_leaves_node_running() {
    let root = temp_dir("spawn-port-timeout");
    let engine = Arc::new(FakeEngine::new());
    let mut probe = MockProbe::new();
    probe.expect_free_port().returning(|| Ok(FREE_PORT));
    probe.expect_is_taken().returning(|_| false);
    probe.expect_accepts_connections().returning(|_, _| false);
    let mut settings = test_settings(&root, "test-1");
    settings.launch_timeout = Duration::from_millis(100);
    let mut devnet = ContainerDevnet::new(
        settings,
        Arc::clone(&engine) as Arc<dyn ContainerEngine>,
        Arc::new(probe),
    );

    let error = devnet.spawn().await.expect_err("closed port should time out");

    assert!(matches!(
        error,
        DevnetError::ReadinessTimeout {
            source: ReadinessError::PortTimeout { port: FREE_PORT, .. },
            ..
        }
    ));
    assert!(engine.container("container-1").is_up());
    let record = devnet.record().expect("record").expect("record should exist");
    assert_eq!(record.container_id.as_deref(), Some("container-1"));
    let _ = fs::remove_dir_all(root);
}

#[tokio::test]
async fn respawn_spawns_when_record_has_no_container_id() {
    let root = temp_dir("respawn-no-id");
    write_state(&root.join("test-1"), r#"{"chainId":"test-1","port":26657}"#);
    let engine = Arc::new(FakeEngine::new());
    let mut devnet = devnet(&engine, test_settings(&root, "test-1"));

    devnet.respawn().await.expect("respawn should spawn");

    assert_eq!(engine.created().len(), 1);
    let _ = fs::remove_dir_all(root);
}

#[tokio::test]
async fn erase_falls_back_to_cleanup_container_on_permission_denied() {
    let root = temp_dir("erase-fallback");
    let state_root = root.join("test-1");
    write_state(&state_root, r#"{"chainId":"test-1","port":26657}"#);
    let engine = Arc::new(FakeEngine::new());
    let mut devnet = devnet(&engine, test_settings(&root, "test-1"))
        .with_state_store(StateStore::new(&state_root).with_remover(deny_removal));

    devnet.erase().await.expect("cleanup container should erase state");

    assert!(!state_root.exists());
    assert_eq!(devnet.phase(), DevnetPhase::Erased);
    let created = engine.created();
    assert_eq!(created.len(), 1);
    let cleanup = &created[0];
    assert!(cleanup.privileged);
    assert!(cleanup.auto_remove);
    assert_eq!(cleanup.name, "test-1-cleanup");
    assert_eq!(cleanup.entrypoint, Some(vec!["find".to_owned()]));
    assert_eq!(
        cleanup.mounts,
        vec![BindMount::read_write(state_root.clone(), "/state")]
    );
    assert_eq!(
        cleanup.labels.get("devnet.role").map(String::as_str),
        Some("cleanup")
    );
    let _ = fs::remove_dir_all(root);
}

#[tokio::test]
async fn erase_reports_cleanup_failed_when_fallback_fails() {
    let root = temp_dir("erase-cleanup-failed");
    let state_root = root.join("test-1");
    write_state(&state_root, r#"{"chainId":"test-1","port":26657}"#);
    let engine = Arc::new(FakeEngine::new());
    engine.lock().cleanup_exit_code = 1;
    let mut devnet = devnet(&engine, test_settings(&root, "test-1"))
        .with_state_store(StateStore::new(&state_root).with_remover(deny_removal));

    let error = devnet.erase().await.expect_err("failed cleanup should surface");

    assert!(matches!(error, DevnetError::CleanupFailed { ref path, .. } if path == &state_root));
    assert!(state_root.join(RECORD_FILE_NAME).exists());
    let _ = fs::remove_dir_all(root);
}

#[tokio::test]
async fn erase_surfaces_other_deletion_failures() {
    let root = temp_dir("erase-fatal");
    let state_root = root.join("test-1");
    write_state(&state_root, r#"{"chainId":"test-1","port":26657}"#);
    let engine = Arc::new(FakeEngine::new());
    let mut devnet = devnet(&engine, test_settings(&root, "test-1"))
        .with_state_store(StateStore::new(&state_root).with_remover(fail_removal));

    let error = devnet.erase().await.expect_err("unexpected failure should surface");

    assert!(matches!(error, DevnetError::EraseFailed { .. }));
    assert!(engine.created().is_empty());
    let _ = fs::remove_dir_all(root);
}

#[tokio::test]
async fn erase_of_missing_state_succeeds() {
    let root = temp_dir("erase-missing");
    let engine = Arc::new(FakeEngine::new());
    let mut devnet = devnet(&engine, test_settings(&root, "test-1"));

    devnet.erase().await.expect("nothing to erase");
    assert_eq!(devnet.phase(), DevnetPhase::Erased);
    let _ = fs::remove_dir_all(root);
}

#[tokio::test]
async fn kill_without_any_container_is_a_no_op() {
    let root = temp_dir("kill-noop");
    let engine = Arc::new(FakeEngine::new());
    let mut devnet = devnet(&engine, test_settings(&root, "test-1"));

    devnet.kill().await.expect("nothing to kill");
    assert_eq!(devnet.phase(), DevnetPhase::Unspawned);

    write_state(
        &root.join("test-1"),
        r#"{"containerId":"vanished","chainId":"test-1","port":26657}"#,
    );
    devnet.kill().await.expect("missing container is vacuously stopped");
    let _ = fs::remove_dir_all(root);
}

#[tokio::test]
async fn kill_resolves_the_recorded_container() {
    let root = temp_dir("kill-recorded");
    write_state(
        &root.join("test-1"),
        r#"{"containerId":"recorded","chainId":"test-1","port":26657}"#,
    );
    let engine = Arc::new(FakeEngine::new());
    engine.insert_container("recorded", true);
    let mut devnet = devnet(&engine, test_settings(&root, "test-1"));

    devnet.kill().await.expect("kill should succeed");

    let container = engine.container("recorded");
    assert!(!container.is_up());
    assert_eq!(container.kill_count(), 1);
    assert_eq!(devnet.phase(), DevnetPhase::Stopped);
    let _ = fs::remove_dir_all(root);
}

#[tokio::test]
async fn terminate_stops_the_node_and_erases_state() {
    let root = temp_dir("terminate");
    let engine = Arc::new(FakeEngine::new());
    let mut devnet = devnet(&engine, test_settings(&root, "test-1"));
    devnet.spawn().await.expect("spawn should succeed");

    devnet.terminate().await.expect("terminate should succeed");

    assert_eq!(engine.container("container-1").kill_count(), 1);
    assert!(!root.join("test-1").exists());
    assert_eq!(devnet.phase(), DevnetPhase::Erased);
    let _ = fs::remove_dir_all(root);
}

#[tokio::test]
async fn genesis_account_reads_wallet_file_from_state_directory() {
    let root = temp_dir("genesis-file");
    let state_root = root.join("test-1");
    write_state(&state_root, r#"{"chainId":"test-1","port":26657}"#);
    fs::write(
        state_root.join(WALLET_DIR_NAME).join("Alice.json"),
        r#"{"name":"Alice","type":"local","address":"secret1alice","mnemonic":"word word"}"#,
    )
    .expect("wallet should be written");
    let engine = Arc::new(FakeEngine::new());
    let devnet = devnet(&engine, test_settings(&root, "test-1"));

    let account = devnet.genesis_account("Alice").await.expect("Alice exists");
    assert_eq!(account.address, "secret1alice");
    assert_eq!(account.mnemonic, "word word");
    assert_eq!(account.extra.get("type"), Some(&serde_json::json!("local")));

    let error = devnet
        .genesis_account("Bob")
        .await
        .expect_err("Bob has no wallet file yet");
    assert!(matches!(error, DevnetError::MissingIdentity { ref name, .. } if name == "Bob"));

    let error = devnet
        .genesis_account("Eve")
        .await
        .expect_err("Eve is not configured");
    assert!(matches!(error, DevnetError::MissingIdentity { .. }));
    let _ = fs::remove_dir_all(root);
}

#[tokio::test]
async fn genesis_account_runs_lookup_inside_container_without_state_mount() {
    let root = temp_dir("genesis-exec");
    let engine = Arc::new(FakeEngine::new());
    engine.lock().container_files.insert(
        "/state/test-1/wallet/Bob.json".to_owned(),
        r#"{"address":"secret1bob","mnemonic":"bob words"}"#.to_owned(),
    );
    let mut settings = test_settings(&root, "test-1");
    settings.mount_state = false;
    let mut devnet = devnet(&engine, settings);
    devnet.spawn().await.expect("spawn should succeed");

    let account = devnet.genesis_account("Bob").await.expect("Bob exists");
    assert_eq!(account.address, "secret1bob");
    assert_eq!(account.name.as_deref(), Some("Bob"));

    let error = devnet
        .genesis_account("Alice")
        .await
        .expect_err("lookup without output fails");
    assert!(matches!(error, DevnetError::MissingIdentity { .. }));
    let _ = fs::remove_dir_all(root);
}

#[test]
fn blank_credentials_count_as_missing() {
    for raw in ["", "  ", r#"{"address":"","mnemonic":"m"}"#, r#"{"mnemonic":"m"}"#] {
        let error = genesis::parse_account("Alice", raw).expect_err("blank credentials");
        assert!(matches!(error, DevnetError::MissingIdentity { .. }), "{raw}");
    }
}

#[tokio::test]
async fn ephemeral_devnet_registers_one_exit_hook_that_kills_the_node() {
    let root = temp_dir("ephemeral-hook");
    let engine = Arc::new(FakeEngine::new());
    let hooks = ShutdownHooks::new();
    let mut settings = test_settings(&root, "test-1");
    settings.ephemeral = true;
    let mut devnet = devnet(&engine, settings).with_shutdown_hooks(hooks.clone());

    devnet.respawn().await.expect("respawn should spawn");
    devnet.respawn().await.expect("respawn should reuse");
    assert_eq!(hooks.len(), 1);

    hooks.run().await;
    let container = engine.container("container-1");
    assert_eq!(container.kill_count(), 1);
    assert!(hooks.is_empty());
    let _ = fs::remove_dir_all(root);
}

#[tokio::test]
async fn exit_hook_stops_the_node_that_is_live_when_it_runs() {
    let root = temp_dir("ephemeral-hook-relaunch");
    let engine = Arc::new(FakeEngine::new());
    let hooks = ShutdownHooks::new();
    let mut settings = test_settings(&root, "test-1");
    settings.ephemeral = true;
    let mut devnet = devnet(&engine, settings).with_shutdown_hooks(hooks.clone());

    devnet.respawn().await.expect("first respawn should spawn");
    let first = engine.container("container-1");
    devnet.terminate().await.expect("terminate should succeed");
    devnet.respawn().await.expect("second respawn should spawn again");
    let second = engine.container("container-2");
    assert_eq!(devnet.container_id().as_deref(), Some("container-2"));
    assert_eq!(hooks.len(), 1);

    hooks.run().await;

    assert_eq!(second.kill_count(), 1);
    assert!(!second.is_up());
    assert_eq!(first.kill_count(), 1);
    let _ = fs::remove_dir_all(root);
}

#[tokio::test]
async fn persistent_devnet_exit_hook_leaves_the_node_running() {
    let root = temp_dir("persistent-hook");
    let engine = Arc::new(FakeEngine::new());
    let hooks = ShutdownHooks::new();
    let mut devnet =
        devnet(&engine, test_settings(&root, "test-1")).with_shutdown_hooks(hooks.clone());

    devnet.respawn().await.expect("respawn should spawn");
    hooks.run().await;

    let container = engine.container("container-1");
    assert_eq!(container.kill_count(), 0);
    assert!(container.is_up());
    let _ = fs::remove_dir_all(root);
}

#[tokio::test]
async fn shutdown_hooks_time_out_instead_of_blocking_exit() {
    let hooks = ShutdownHooks::with_timeout(Duration::from_millis(20));
    let finished = Arc::new(AtomicBool::new(false));
    hooks.register("slow", || async {
        tokio::time::sleep(Duration::from_secs(5)).await;
    });
    let flag = Arc::clone(&finished);
    hooks.register("fast", move || async move {
        flag.store(true, Ordering::SeqCst);
    });

    let started = Instant::now();
    hooks.run().await;

    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(finished.load(Ordering::SeqCst));
    assert!(hooks.is_empty());
}

#[tokio::test]
async fn export_commits_the_held_container() {
    let root = temp_dir("export");
    let engine = Arc::new(FakeEngine::new());
    let mut devnet = devnet(&engine, test_settings(&root, "test-1"));

    let error = devnet
        .export(None, None)
        .await
        .expect_err("nothing to export before spawn");
    assert!(matches!(error, DevnetError::Unsupported { .. }));

    devnet.spawn().await.expect("spawn should succeed");
    let image = devnet
        .export(None, Some("snapshot"))
        .await
        .expect("export should succeed");
    assert_eq!(image, "sha256:test-1-snapshot");
    let _ = fs::remove_dir_all(root);
}

#[tokio::test]
async fn export_resolves_the_recorded_container() {
    let root = temp_dir("export-recorded");
    write_state(
        &root.join("test-1"),
        r#"{"containerId":"recorded-node","chainId":"test-1","port":26657}"#,
    );
    let engine = Arc::new(FakeEngine::new());
    let devnet = devnet(&engine, test_settings(&root, "test-1"));

    let error = devnet
        .export(Some("snap"), None)
        .await
        .expect_err("recorded container is gone");
    assert!(matches!(
        error,
        DevnetError::ContainerNotFound { ref container_id, .. } if container_id == "recorded-node"
    ));

    engine.insert_container("recorded-node", true);
    let image = devnet
        .export(Some("snap"), None)
        .await
        .expect("recorded container should export");
    assert_eq!(image, "sha256:snap-latest");
    let _ = fs::remove_dir_all(root);
}

#[test]
fn managed_backend_requires_a_parseable_manager_url() {
    let config = DevnetConfig {
        backend: types::DevnetBackend::Managed,
        manager_url: Some("not a url".to_owned()),
        ..DevnetConfig::default()
    };
    let error = ManagedDevnet::from_config(&config, Arc::new(open_probe(FREE_PORT)))
        .expect_err("invalid url should fail");
    assert!(matches!(error, DevnetError::Manager { operation: "parse_url", .. }));
}
