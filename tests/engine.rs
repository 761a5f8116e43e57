//! Boot engine integration tests over mock collaborators.

use async_trait::async_trait;
use ignite::{
    BlockDevice, BlockDevices, BootDisplay, DaemonSpec, Error, ExitCause, ExitEvent, Init,
    InitConfig, ItemStyle, Launcher, Mounter, ReadyCheck, StepState, VfsMount,
};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Default)]
struct DisplayState {
    bailouts: Vec<String>,
}

struct MockDisplay(Arc<Mutex<DisplayState>>);

impl BootDisplay for MockDisplay {
    fn init(&mut self) {}
    fn add_item(&mut self, _name: &str) {}
    fn set_item_state(&mut self, _name: &str, _style: ItemStyle, _text: &str) {}
    fn clear_items(&mut self) {}
    fn set_items_location(&mut self, _row: u16, _col: u16) {}
    fn bailout(&mut self, msg: &str) {
        self.0.lock().unwrap().bailouts.push(msg.to_string());
    }
}

#[derive(Default)]
struct MountState {
    calls: Vec<(String, PathBuf)>,
    fail_targets: HashSet<PathBuf>,
}

struct MockMounter(Arc<Mutex<MountState>>);

impl Mounter for MockMounter {
    fn mount(&self, device: &str, target: &Path, _fstype: &str, _options: &str) -> ignite::Result<()> {
        let mut state = self.0.lock().unwrap();
        state.calls.push((device.to_string(), target.to_path_buf()));
        if state.fail_targets.contains(target) {
            return Err(Error::MountFailed {
                device: device.to_string(),
                target: target.to_path_buf(),
                source: nix::errno::Errno::EIO,
            });
        }
        Ok(())
    }

    fn unmount(&self, _target: &Path) -> ignite::Result<()> {
        Ok(())
    }
}

#[derive(Default)]
struct BlockState {
    calls: Vec<&'static str>,
    by_uuid: HashMap<String, PathBuf>,
    by_label: HashMap<String, PathBuf>,
    paths: HashSet<PathBuf>,
    /// When set, path lookups only succeed after a probe
    paths_need_probe: bool,
    probed: bool,
}

struct MockBlockDevices(Arc<Mutex<BlockState>>);

fn device(path: &Path) -> BlockDevice {
    BlockDevice {
        path: path.to_path_buf(),
        fstype: Some("ext4".to_string()),
    }
}

impl BlockDevices for MockBlockDevices {
    fn probe(&mut self) {
        let mut state = self.0.lock().unwrap();
        state.calls.push("probe");
        state.probed = true;
    }

    fn by_path(&self, path: &Path) -> Option<BlockDevice> {
        let mut state = self.0.lock().unwrap();
        state.calls.push("by_path");
        if state.paths_need_probe && !state.probed {
            return None;
        }
        state.paths.get(path).map(|p| device(p))
    }

    fn by_uuid(&self, uuid: &str) -> Option<BlockDevice> {
        let mut state = self.0.lock().unwrap();
        state.calls.push("by_uuid");
        state.by_uuid.get(uuid).map(|p| device(p))
    }

    fn by_label(&self, label: &str) -> Option<BlockDevice> {
        let mut state = self.0.lock().unwrap();
        state.calls.push("by_label");
        state.by_label.get(label).map(|p| device(p))
    }
}

/// What a mock launch does to the outside world.
#[derive(Clone)]
enum LaunchEffect {
    /// Launch succeeds, daemon never becomes ready
    Nothing,
    /// Launch itself fails
    Fail,
    /// Launch binds the daemon's readiness socket
    CreateSocket(PathBuf),
    /// Launch rewrites a file (e.g. the mtab) with this content
    WriteFile(PathBuf, String),
}

struct LaunchState {
    launches: Vec<PathBuf>,
    effect: LaunchEffect,
    listeners: Vec<UnixListener>,
    exit_tx: Option<mpsc::Sender<ExitEvent>>,
}

impl LaunchState {
    fn new(effect: LaunchEffect) -> Self {
        Self {
            launches: Vec::new(),
            effect,
            listeners: Vec::new(),
            exit_tx: None,
        }
    }
}

struct MockLauncher(Arc<Mutex<LaunchState>>);

#[async_trait]
impl Launcher for MockLauncher {
    async fn launch(
        &mut self,
        daemon: &DaemonSpec,
        exit_tx: mpsc::Sender<ExitEvent>,
    ) -> ignite::Result<u32> {
        let mut state = self.0.lock().unwrap();
        state.launches.push(daemon.binary.clone());
        state.exit_tx = Some(exit_tx);
        let effect = state.effect.clone();
        match effect {
            LaunchEffect::Nothing => Ok(42),
            LaunchEffect::Fail => Err(Error::LaunchFailed {
                binary: daemon.binary.clone(),
                reason: "spawn failed".to_string(),
            }),
            LaunchEffect::CreateSocket(path) => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent).unwrap();
                }
                let _ = fs::remove_file(&path);
                let listener = UnixListener::bind(&path).unwrap();
                state.listeners.push(listener);
                Ok(42)
            }
            LaunchEffect::WriteFile(path, content) => {
                fs::write(path, content).unwrap();
                Ok(42)
            }
        }
    }

    async fn run_oneshot(&mut self, _program: &str, _args: &[&str]) -> ignite::Result<bool> {
        Ok(true)
    }
}

struct Harness {
    init: Init,
    display: Arc<Mutex<DisplayState>>,
    mounts: Arc<Mutex<MountState>>,
    blocks: Arc<Mutex<BlockState>>,
    launches: Arc<Mutex<LaunchState>>,
    tmp: tempfile::TempDir,
}

impl Harness {
    fn state_of(&self, step: &str) -> StepState {
        self.init
            .steps()
            .iter()
            .find(|s| s.name == step)
            .unwrap()
            .result
    }

    fn launch_count(&self) -> usize {
        self.launches.lock().unwrap().launches.len()
    }
}

/// Build an engine over a temp directory with fast retry timing.
fn harness(effect: LaunchEffect) -> Harness {
    let tmp = tempfile::tempdir().unwrap();
    fs::write(tmp.path().join("fstab"), "").unwrap();
    fs::write(tmp.path().join("mtab"), "").unwrap();

    let config = InitConfig {
        fstab_path: tmp.path().join("fstab"),
        mtab_path: tmp.path().join("mtab"),
        modules_path: tmp.path().join("modules"),
        daemons_path: None,
        cmdline_path: tmp.path().join("cmdline"),
        proc_probe_dir: tmp.path().join("proc"),
        root_target: tmp.path().join("sysroot"),
        load_modules: false,
        mount_root: false,
        require_pid1: false,
        launch_attempts: 5,
        retry_delay: Duration::from_millis(1),
        respawn_delay: Duration::from_millis(1),
    };

    let display = Arc::new(Mutex::new(DisplayState::default()));
    let mounts = Arc::new(Mutex::new(MountState::default()));
    let blocks = Arc::new(Mutex::new(BlockState::default()));
    let launches = Arc::new(Mutex::new(LaunchState::new(effect)));

    let init = Init::with_collaborators(
        config,
        Box::new(MockDisplay(Arc::clone(&display))),
        Box::new(MockMounter(Arc::clone(&mounts))),
        Box::new(MockBlockDevices(Arc::clone(&blocks))),
        Box::new(MockLauncher(Arc::clone(&launches))),
    );

    Harness {
        init,
        display,
        mounts,
        blocks,
        launches,
        tmp,
    }
}

fn svc_mount(tmp: &Path) -> VfsMount {
    VfsMount::new("mount svcfs", "svcfs", tmp.join("svc"), "svcfs")
}

fn socket_daemon(name: &str, binary: &str, fatal: bool) -> DaemonSpec {
    DaemonSpec {
        name: name.to_string(),
        binary: PathBuf::from(binary),
        args: "-f".to_string(),
        user: None,
        ready: ReadyCheck::Socket {
            mount: "svcfs".to_string(),
            suffix: PathBuf::from("config/io"),
        },
        fatal,
    }
}

#[tokio::test]
async fn ready_daemon_is_canceled_without_a_launch() {
    let mut h = harness(LaunchEffect::Nothing);
    let socket = h.tmp.path().join("svc/config/io");
    fs::create_dir_all(socket.parent().unwrap()).unwrap();
    let _listener = UnixListener::bind(&socket).unwrap();

    h.init = h
        .init
        .with_vfs_mounts(vec![svc_mount(h.tmp.path())])
        .with_daemons(vec![socket_daemon("start confd", "/sbin/confd", false)]);

    h.init.start().await.unwrap();

    assert_eq!(h.state_of("start confd"), StepState::Canceled);
    assert_eq!(h.launch_count(), 0);
}

#[tokio::test]
async fn unready_fatal_daemon_fails_and_halts_the_sequence() {
    let mut h = harness(LaunchEffect::Nothing);
    h.init = h
        .init
        .with_vfs_mounts(vec![svc_mount(h.tmp.path())])
        .with_daemons(vec![
            socket_daemon("start confd", "/sbin/confd", true),
            socket_daemon("start execd", "/sbin/execd", false),
        ]);

    let err = h.init.start().await.unwrap_err();
    assert!(matches!(err, Error::FatalStep(_)));

    assert_eq!(h.state_of("start confd"), StepState::Failed);
    // nothing after the fatal failure ran
    assert_eq!(h.state_of("start execd"), StepState::Clear);
    // one launch; the running record blocks relaunch during retries
    assert_eq!(h.launch_count(), 1);
    // the rescue hand-off happened exactly once
    assert_eq!(h.display.lock().unwrap().bailouts.len(), 1);
}

#[tokio::test]
async fn launch_failure_consumes_attempts_without_readiness_waits() {
    let mut h = harness(LaunchEffect::Fail);
    h.init = h
        .init
        .with_vfs_mounts(vec![svc_mount(h.tmp.path())])
        .with_daemons(vec![
            socket_daemon("start confd", "/sbin/confd", false),
            DaemonSpec {
                name: "start logd".to_string(),
                binary: PathBuf::from("/sbin/logd"),
                args: String::new(),
                user: None,
                ready: ReadyCheck::None,
                fatal: false,
            },
        ]);

    h.init.start().await.unwrap();

    assert_eq!(h.state_of("start confd"), StepState::Failed);
    // every attempt retried the launch since no record was ever created
    assert!(h
        .launches
        .lock()
        .unwrap()
        .launches
        .iter()
        .filter(|b| **b == PathBuf::from("/sbin/confd"))
        .count()
        == 5);
    // a non-fatal failure does not block later independent steps
    assert_ne!(h.state_of("start logd"), StepState::Clear);
}

#[tokio::test]
async fn daemon_becomes_ready_after_launch() {
    let mut h = harness(LaunchEffect::Nothing);
    let socket = h.tmp.path().join("svc/config/io");
    h.launches.lock().unwrap().effect = LaunchEffect::CreateSocket(socket);

    h.init = h
        .init
        .with_vfs_mounts(vec![svc_mount(h.tmp.path())])
        .with_daemons(vec![socket_daemon("start confd", "/sbin/confd", true)]);

    h.init.start().await.unwrap();

    assert_eq!(h.state_of("start confd"), StepState::Passed);
    assert_eq!(h.launch_count(), 1);
    assert!(h.init.is_running(Path::new("/sbin/confd")));
}

#[tokio::test]
async fn discovered_spec_failure_falls_back_to_default_spec() {
    let mut h = harness(LaunchEffect::Nothing);
    let alt = h.tmp.path().join("alt-svc");
    fs::write(
        h.tmp.path().join("fstab"),
        format!("svcfs {} svcfs noexec 0 0\n", alt.display()),
    )
    .unwrap();
    h.mounts.lock().unwrap().fail_targets.insert(alt.clone());

    h.init = h
        .init
        .with_vfs_mounts(vec![svc_mount(h.tmp.path())])
        .with_daemons(Vec::new());

    h.init.start().await.unwrap();

    assert_eq!(h.state_of("mount svcfs"), StepState::Passed);
    let calls = h.mounts.lock().unwrap().calls.clone();
    let targets: Vec<&PathBuf> = calls.iter().map(|(_, t)| t).collect();
    assert!(targets.contains(&&alt));
    assert!(targets.contains(&&h.tmp.path().join("svc")));
}

#[tokio::test]
async fn missing_fstab_is_a_fatal_boot_failure() {
    let mut h = harness(LaunchEffect::Nothing);
    fs::remove_file(h.tmp.path().join("fstab")).unwrap();
    h.init = h.init.with_vfs_mounts(vec![svc_mount(h.tmp.path())]);

    let err = h.init.start().await.unwrap_err();
    assert!(matches!(err, Error::FatalStep(_)));
    assert_eq!(h.state_of("read fstab"), StepState::Failed);
    assert_eq!(h.state_of("mount svcfs"), StepState::Clear);
    assert_eq!(h.display.lock().unwrap().bailouts.len(), 1);
}

async fn run_root_mount(h: &mut Harness, cmdline: &str) {
    fs::write(h.tmp.path().join("cmdline"), cmdline).unwrap();
    let mut config = InitConfig {
        fstab_path: h.tmp.path().join("fstab"),
        mtab_path: h.tmp.path().join("mtab"),
        modules_path: h.tmp.path().join("modules"),
        daemons_path: None,
        cmdline_path: h.tmp.path().join("cmdline"),
        proc_probe_dir: h.tmp.path().join("proc"),
        root_target: h.tmp.path().join("sysroot"),
        ..InitConfig::default()
    };
    config.load_modules = false;
    config.mount_root = true;
    config.require_pid1 = false;
    config.retry_delay = Duration::from_millis(1);

    let init = Init::with_collaborators(
        config,
        Box::new(MockDisplay(Arc::clone(&h.display))),
        Box::new(MockMounter(Arc::clone(&h.mounts))),
        Box::new(MockBlockDevices(Arc::clone(&h.blocks))),
        Box::new(MockLauncher(Arc::clone(&h.launches))),
    )
    .with_vfs_mounts(Vec::new())
    .with_daemons(Vec::new());

    h.init = init;
    let _ = h.init.start().await;
}

#[tokio::test]
async fn root_by_uuid_only_consults_uuid_lookup() {
    let mut h = harness(LaunchEffect::Nothing);
    h.blocks
        .lock()
        .unwrap()
        .by_uuid
        .insert("abc".to_string(), PathBuf::from("/dev/vda1"));

    run_root_mount(&mut h, "root=UUID=abc ro").await;

    assert_eq!(h.state_of("mount root"), StepState::Passed);
    let calls = h.blocks.lock().unwrap().calls.clone();
    assert_eq!(calls, vec!["by_uuid"]);
    // the resolved device was mounted at the root target
    let mounted = h.mounts.lock().unwrap().calls.clone();
    assert!(mounted
        .iter()
        .any(|(d, t)| d == "/dev/vda1" && *t == h.tmp.path().join("sysroot")));
}

#[tokio::test]
async fn root_by_label_only_consults_label_lookup() {
    let mut h = harness(LaunchEffect::Nothing);
    h.blocks
        .lock()
        .unwrap()
        .by_label
        .insert("rootfs".to_string(), PathBuf::from("/dev/vda2"));

    run_root_mount(&mut h, "root=LABEL=rootfs").await;

    assert_eq!(h.state_of("mount root"), StepState::Passed);
    let calls = h.blocks.lock().unwrap().calls.clone();
    assert_eq!(calls, vec!["by_label"]);
}

#[tokio::test]
async fn root_by_path_retries_after_a_fresh_probe() {
    let mut h = harness(LaunchEffect::Nothing);
    {
        let mut blocks = h.blocks.lock().unwrap();
        blocks.paths.insert(PathBuf::from("/dev/sda1"));
        blocks.paths_need_probe = true;
    }

    run_root_mount(&mut h, "root=/dev/sda1").await;

    assert_eq!(h.state_of("mount root"), StepState::Passed);
    let calls = h.blocks.lock().unwrap().calls.clone();
    assert_eq!(calls, vec!["by_path", "probe", "by_path"]);
}

#[tokio::test]
async fn unresolvable_root_is_fatal() {
    let mut h = harness(LaunchEffect::Nothing);

    run_root_mount(&mut h, "root=UUID=unknown").await;

    assert_eq!(h.state_of("mount root"), StepState::Failed);
    assert_eq!(h.display.lock().unwrap().bailouts.len(), 1);
}

#[tokio::test]
async fn second_start_skips_satisfied_steps() {
    let mut h = harness(LaunchEffect::Nothing);
    let socket = h.tmp.path().join("svc/config/io");
    h.launches.lock().unwrap().effect = LaunchEffect::CreateSocket(socket);

    h.init = h
        .init
        .with_vfs_mounts(vec![svc_mount(h.tmp.path())])
        .with_daemons(vec![socket_daemon("start confd", "/sbin/confd", false)]);

    h.init.start().await.unwrap();
    let first: Vec<StepState> = h.init.steps().iter().map(|s| s.result).collect();
    let mounts_after_first = h.mounts.lock().unwrap().calls.len();

    h.init.start().await.unwrap();
    let second: Vec<StepState> = h.init.steps().iter().map(|s| s.result).collect();

    assert_eq!(first, second);
    // no daemon relaunch, no redundant mounts
    assert_eq!(h.launch_count(), 1);
    assert_eq!(h.mounts.lock().unwrap().calls.len(), mounts_after_first);
}

#[tokio::test]
async fn dead_daemon_is_respawned_from_an_exit_event() {
    let mut h = harness(LaunchEffect::Nothing);
    let socket = h.tmp.path().join("svc/config/io");
    h.launches.lock().unwrap().effect = LaunchEffect::CreateSocket(socket.clone());

    h.init = h
        .init
        .with_vfs_mounts(vec![svc_mount(h.tmp.path())])
        .with_daemons(vec![socket_daemon("start confd", "/sbin/confd", false)]);

    h.init.start().await.unwrap();
    assert_eq!(h.launch_count(), 1);

    // the daemon dies: its socket disappears and an exit event arrives
    fs::remove_file(&socket).unwrap();
    let tx = h.launches.lock().unwrap().exit_tx.clone().unwrap();
    tx.send(ExitEvent {
        binary: PathBuf::from("/sbin/confd"),
        cause: ExitCause::Signaled(9),
    })
    .await
    .unwrap();

    h.init.drain_exit_events().await.unwrap();

    assert_eq!(h.launch_count(), 2);
    assert_eq!(h.state_of("start confd"), StepState::Passed);
    assert!(h.init.is_running(Path::new("/sbin/confd")));
}

#[tokio::test]
async fn respawn_relaunches_despite_stale_readiness_marker() {
    let mut h = harness(LaunchEffect::Nothing);
    let socket = h.tmp.path().join("svc/config/io");
    h.launches.lock().unwrap().effect = LaunchEffect::CreateSocket(socket.clone());

    h.init = h
        .init
        .with_vfs_mounts(vec![svc_mount(h.tmp.path())])
        .with_daemons(vec![socket_daemon("start confd", "/sbin/confd", false)]);

    h.init.start().await.unwrap();
    assert_eq!(h.launch_count(), 1);

    // the daemon dies, but nothing unlinks its socket file; the stale
    // marker must not suppress the relaunch
    assert!(socket.exists());
    let tx = h.launches.lock().unwrap().exit_tx.clone().unwrap();
    tx.send(ExitEvent {
        binary: PathBuf::from("/sbin/confd"),
        cause: ExitCause::Signaled(11),
    })
    .await
    .unwrap();

    h.init.drain_exit_events().await.unwrap();

    assert_eq!(h.launch_count(), 2);
    assert_eq!(h.state_of("start confd"), StepState::Passed);
    assert!(h.init.is_running(Path::new("/sbin/confd")));
}

#[tokio::test]
async fn mounted_readiness_reads_the_live_mount_table() {
    let mut h = harness(LaunchEffect::Nothing);
    let mtab = h.tmp.path().join("mtab");
    let svc = h.tmp.path().join("svc");
    h.launches.lock().unwrap().effect = LaunchEffect::WriteFile(
        mtab,
        format!("svcfs {} svcfs rw 0 0\n", svc.display()),
    );

    h.init = h
        .init
        .with_vfs_mounts(vec![svc_mount(h.tmp.path())])
        .with_daemons(vec![DaemonSpec {
            name: "start svcfsd".to_string(),
            binary: PathBuf::from("/sbin/svcfsd"),
            args: "-f".to_string(),
            user: None,
            ready: ReadyCheck::Mounted {
                device: "svcfs".to_string(),
            },
            fatal: false,
        }]);

    h.init.start().await.unwrap();

    assert_eq!(h.state_of("start svcfsd"), StepState::Passed);
    assert_eq!(h.launch_count(), 1);
}
