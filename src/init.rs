//! The boot step engine.
//!
//! `Init` owns the ordered step list and every collaborator, and drives
//! the boot from "kernel just started" to "core daemons supervised":
//! optional module loading, optional root mount, reading the filesystem
//! table, the virtual-filesystem mounts, then the daemon launches. Steps
//! execute strictly in registration order; a step with a recorded
//! non-failed result is never re-run, so `start()` may be invoked again
//! after a manual recovery. A failed step marked fatal stops the
//! sequence and hands the terminal to the emergency shell.
//!
//! All state lives on this one value and is touched only from the
//! control task; daemon exits arrive as messages on a channel rather
//! than re-entrant callbacks.

use crate::blockdev::{BlockDevice, BlockDevices, SysBlockDevices};
use crate::cmdline::parse_cmdline;
use crate::daemons::{self, DaemonSpec, ReadyCheck};
use crate::display::{BootDisplay, TermDisplay};
use crate::error::{Error, Result};
use crate::fstab::{self, FsEntry};
use crate::mounts::{default_vfs_mounts, Mounter, SysMounter, VfsMount};
use crate::step::{StepKind, StepRecord, StepState};
use crate::supervisor::{self, ExitCause, ExitEvent, Launcher, ProcessLauncher, RunningProc};
use chrono::Utc;
use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Item grid origin on the boot display.
const ITEMS_ROW: u16 = 10;
const ITEMS_COL: u16 = 4;

/// Init system configuration.
#[derive(Debug, Clone)]
pub struct InitConfig {
    /// Filesystem table path
    pub fstab_path: PathBuf,
    /// Mounted-filesystem table path, read by readiness probes
    pub mtab_path: PathBuf,
    /// Kernel modules list path
    pub modules_path: PathBuf,
    /// Optional TOML daemon set replacing the compiled-in one
    pub daemons_path: Option<PathBuf>,
    /// Kernel command line pseudo-file
    pub cmdline_path: PathBuf,
    /// Temporary procfs probe mountpoint used while reading the command line
    pub proc_probe_dir: PathBuf,
    /// Where the resolved root device gets mounted
    pub root_target: PathBuf,
    /// Whether to register the module-loading step
    pub load_modules: bool,
    /// Whether to register the root-mount step
    pub mount_root: bool,
    /// Whether to enforce the PID 1 requirement
    pub require_pid1: bool,
    /// Launch attempts per daemon before the step fails
    pub launch_attempts: u32,
    /// Wait between a launch and its readiness re-check
    pub retry_delay: Duration,
    /// Safety delay before erasing a dead daemon's record and respawning
    pub respawn_delay: Duration,
}

impl Default for InitConfig {
    fn default() -> Self {
        Self {
            fstab_path: PathBuf::from(fstab::FSTAB_PATH),
            mtab_path: PathBuf::from(fstab::MTAB_PATH),
            modules_path: PathBuf::from("/etc/modules"),
            daemons_path: None,
            cmdline_path: PathBuf::from("/proc/cmdline"),
            proc_probe_dir: PathBuf::from("/proc"),
            root_target: PathBuf::from("/sysroot"),
            load_modules: true,
            mount_root: false,
            require_pid1: true,
            launch_attempts: 5,
            retry_delay: Duration::from_secs(1),
            respawn_delay: Duration::from_secs(1),
        }
    }
}

/// The boot step engine.
pub struct Init {
    config: InitConfig,
    display: Box<dyn BootDisplay>,
    mounter: Box<dyn Mounter>,
    blockdev: Box<dyn BlockDevices>,
    launcher: Box<dyn Launcher>,
    vfs_mounts: Vec<VfsMount>,
    daemons: Vec<DaemonSpec>,
    steps: Vec<StepRecord>,
    /// Rebuilt on every read of the filesystem table
    fstab: Vec<FsEntry>,
    /// Running-process records, keyed by binary path
    procs: HashMap<PathBuf, RunningProc>,
    exit_tx: mpsc::Sender<ExitEvent>,
    exit_rx: Option<mpsc::Receiver<ExitEvent>>,
    bailed: bool,
}

impl Init {
    /// Create an engine over the real system collaborators.
    pub fn new(config: InitConfig) -> Result<Self> {
        let pid = std::process::id();
        if config.require_pid1 && pid != 1 {
            return Err(Error::NotPid1(pid));
        }

        let daemons = match &config.daemons_path {
            Some(path) => daemons::load_daemons(path)?,
            None => daemons::default_daemons(),
        };

        let mut init = Self::with_collaborators(
            config,
            Box::new(TermDisplay::new()),
            Box::new(SysMounter),
            Box::new(SysBlockDevices::new()),
            Box::new(ProcessLauncher),
        );
        init.daemons = daemons;
        Ok(init)
    }

    /// Create an engine over explicit collaborators.
    ///
    /// Skips the PID 1 check; intended for embedding and tests, where
    /// multiple engines may exist in one process. `config.daemons_path`
    /// is not consulted here: the engine starts with the compiled-in
    /// daemon set, replaceable through [`Init::with_daemons`].
    pub fn with_collaborators(
        config: InitConfig,
        display: Box<dyn BootDisplay>,
        mounter: Box<dyn Mounter>,
        blockdev: Box<dyn BlockDevices>,
        launcher: Box<dyn Launcher>,
    ) -> Self {
        let (exit_tx, exit_rx) = mpsc::channel(16);
        Self {
            config,
            display,
            mounter,
            blockdev,
            launcher,
            vfs_mounts: default_vfs_mounts(),
            daemons: daemons::default_daemons(),
            steps: Vec::new(),
            fstab: Vec::new(),
            procs: HashMap::new(),
            exit_tx,
            exit_rx: Some(exit_rx),
            bailed: false,
        }
    }

    /// Replace the virtual-filesystem mount set. Resets the step list.
    pub fn with_vfs_mounts(mut self, mounts: Vec<VfsMount>) -> Self {
        self.vfs_mounts = mounts;
        self.steps.clear();
        self
    }

    /// Replace the daemon set. Resets the step list.
    pub fn with_daemons(mut self, daemons: Vec<DaemonSpec>) -> Self {
        self.daemons = daemons;
        self.steps.clear();
        self
    }

    /// The step list with recorded results.
    pub fn steps(&self) -> &[StepRecord] {
        &self.steps
    }

    /// Whether a process record exists for this binary.
    pub fn is_running(&self, binary: &Path) -> bool {
        self.procs.contains_key(binary)
    }

    /// Run the boot sequence and then supervise daemons forever.
    pub async fn run(&mut self) -> Result<()> {
        self.start().await?;
        self.event_loop().await
    }

    /// Execute the boot step sequence.
    ///
    /// Safe to call again after a manual recovery: steps whose recorded
    /// result is `Passed` or `Canceled` are skipped, failed steps are
    /// retried.
    pub async fn start(&mut self) -> Result<()> {
        if self.steps.is_empty() {
            self.build_steps();
        }

        self.display.init();
        self.display.clear_items();
        self.display.set_items_location(ITEMS_ROW, ITEMS_COL);
        for index in 0..self.steps.len() {
            let name = self.steps[index].name.clone();
            self.display.add_item(&name);
            let state = self.steps[index].result;
            if state != StepState::Clear {
                let (style, text) = state.style();
                self.display.set_item_state(&name, style, text);
            }
        }

        for index in 0..self.steps.len() {
            if !self.steps[index].needs_run() {
                continue;
            }
            let state = self.execute_step(index, false).await;
            if state == StepState::Failed && self.steps[index].fatal {
                let name = self.steps[index].name.clone();
                self.emergency_shell(&name);
                return Err(Error::FatalStep(name));
            }
        }
        Ok(())
    }

    /// Supervise daemons: respawn on exit events, reap zombies.
    async fn event_loop(&mut self) -> Result<()> {
        let mut exit_rx = self
            .exit_rx
            .take()
            .ok_or_else(|| Error::Config("event loop already running".to_string()))?;
        let mut sigchld = signal(SignalKind::child())?;

        info!("Boot sequence complete, supervising daemons");
        loop {
            tokio::select! {
                Some(event) = exit_rx.recv() => {
                    self.handle_daemon_exit(event).await?;
                }
                _ = sigchld.recv() => {
                    supervisor::reap_zombies();
                }
            }
        }
    }

    /// Process any queued daemon exit notifications without blocking.
    pub async fn drain_exit_events(&mut self) -> Result<()> {
        loop {
            let event = match self.exit_rx.as_mut() {
                Some(rx) => rx.try_recv().ok(),
                None => None,
            };
            let Some(event) = event else { break };
            self.handle_daemon_exit(event).await?;
        }
        Ok(())
    }

    /// Assemble the ordered step list from the descriptor sets.
    fn build_steps(&mut self) {
        let mut steps = Vec::new();
        if self.config.load_modules {
            steps.push(StepRecord::new("load modules", StepKind::LoadModules, false));
        }
        if self.config.mount_root {
            steps.push(StepRecord::new("mount root", StepKind::MountRoot, true));
        }
        steps.push(StepRecord::new("read fstab", StepKind::ReadFstab, true));
        for (index, mount) in self.vfs_mounts.iter().enumerate() {
            steps.push(StepRecord::new(
                mount.name.clone(),
                StepKind::MountVfs(index),
                mount.fatal,
            ));
        }
        for (index, daemon) in self.daemons.iter().enumerate() {
            steps.push(StepRecord::new(
                daemon.name.clone(),
                StepKind::StartDaemon(index),
                daemon.fatal,
            ));
        }
        self.steps = steps;
    }

    /// Run one step, recording transient and final states. `respawn`
    /// tells a daemon step to skip its already-ready short-circuit.
    async fn execute_step(&mut self, index: usize, respawn: bool) -> StepState {
        self.record(index, StepState::Starting);
        let started = Instant::now();

        let state = match self.steps[index].kind {
            StepKind::LoadModules => self.run_load_modules().await,
            StepKind::MountRoot => self.run_mount_root().await,
            StepKind::ReadFstab => self.run_read_fstab(),
            StepKind::MountVfs(mount_index) => self.run_vfs_mount(mount_index),
            StepKind::StartDaemon(daemon_index) => {
                self.run_daemon(daemon_index, index, respawn).await
            }
        };

        self.steps[index].duration_ms = Some(started.elapsed().as_millis() as u64);
        self.record(index, state);
        debug!(step = %self.steps[index].name, state = %state, "Step finished");
        state
    }

    /// Record a step state and reflect it on the display.
    fn record(&mut self, index: usize, state: StepState) {
        self.steps[index].result = state;
        let name = self.steps[index].name.clone();
        let (style, text) = state.style();
        self.display.set_item_state(&name, style, text);
    }

    /// Load kernel modules listed in the modules file.
    async fn run_load_modules(&mut self) -> StepState {
        let content = match fs::read_to_string(&self.config.modules_path) {
            Ok(content) => content,
            Err(_) => {
                debug!(path = %self.config.modules_path.display(), "No modules file");
                return StepState::Canceled;
            }
        };

        let mut failed = 0u32;
        for line in content.lines() {
            let name = line.split('#').next().unwrap_or(line).trim();
            if name.is_empty() {
                continue;
            }
            match self.launcher.run_oneshot("modprobe", &["-q", name]).await {
                Ok(true) => debug!(module = name, "Loaded kernel module"),
                Ok(false) => {
                    warn!(module = name, "modprobe reported failure");
                    failed += 1;
                }
                Err(e) => {
                    warn!(module = name, error = %e, "Cannot run modprobe");
                    failed += 1;
                }
            }
        }

        if failed == 0 {
            StepState::Passed
        } else {
            StepState::Failed
        }
    }

    /// Resolve the root device from the kernel command line and mount it.
    async fn run_mount_root(&mut self) -> StepState {
        let options = match self.read_boot_options() {
            Ok(options) => options,
            Err(e) => {
                warn!(error = %e, "Cannot read kernel command line");
                return StepState::Failed;
            }
        };

        let Some(root) = options.get("root").cloned() else {
            warn!("No root= option on the kernel command line");
            return StepState::Failed;
        };
        let Some(device) = self.resolve_root(&root) else {
            warn!(root = %root, "Cannot resolve root device");
            return StepState::Failed;
        };

        let fstype = options
            .get("rootfstype")
            .cloned()
            .or_else(|| device.fstype.clone())
            .unwrap_or_else(|| "auto".to_string());
        let flags = options
            .get("rootflags")
            .map(String::as_str)
            .unwrap_or("defaults");

        if let Err(e) = fs::create_dir_all(&self.config.root_target) {
            warn!(error = %e, "Cannot create root mount target");
            return StepState::Failed;
        }

        let devpath = device.path.to_string_lossy().into_owned();
        let target = self.config.root_target.clone();
        info!(device = %devpath, target = %target.display(), fstype = %fstype, "Mounting root filesystem");
        match self.mounter.mount(&devpath, &target, &fstype, flags) {
            Ok(()) => StepState::Passed,
            Err(e) => {
                warn!(error = %e, "Root mount failed");
                StepState::Failed
            }
        }
    }

    /// Probe-mount procfs, read the kernel command line, release the
    /// probe mount, and parse the boot options.
    fn read_boot_options(&mut self) -> Result<HashMap<String, String>> {
        fs::create_dir_all(&self.config.proc_probe_dir)?;
        let probe_mounted = self
            .mounter
            .mount("proc", &self.config.proc_probe_dir, "proc", "defaults")
            .is_ok();

        let text = fs::read_to_string(&self.config.cmdline_path);

        if probe_mounted {
            if let Err(e) = self.mounter.unmount(&self.config.proc_probe_dir) {
                warn!(error = %e, "Failed to release proc probe mount");
            }
        }

        Ok(parse_cmdline(&text?))
    }

    /// Resolve the `root=` option to a concrete device.
    ///
    /// `UUID=` and `LABEL=` prefixes select their lookup strategy; any
    /// other prefixed value falls back to the generic lookup; a bare
    /// value is a device path, retried once after a fresh probe.
    fn resolve_root(&mut self, value: &str) -> Option<BlockDevice> {
        match value.split_once('=') {
            Some((prefix, id)) if prefix.eq_ignore_ascii_case("UUID") => self.blockdev.by_uuid(id),
            Some((prefix, id)) if prefix.eq_ignore_ascii_case("LABEL") => {
                self.blockdev.by_label(id)
            }
            Some(_) => self.blockdev.lookup(value),
            None => self.blockdev.by_path(Path::new(value)).or_else(|| {
                self.blockdev.probe();
                self.blockdev.by_path(Path::new(value))
            }),
        }
    }

    /// Read the filesystem table and re-resolve mount overrides.
    fn run_read_fstab(&mut self) -> StepState {
        match fstab::parse_table(&self.config.fstab_path) {
            Ok(entries) => {
                self.fstab = entries;
                info!(
                    path = %self.config.fstab_path.display(),
                    entries = self.fstab.len(),
                    "Read filesystem table"
                );
                // stale indices must never survive a table re-read
                for mount in &mut self.vfs_mounts {
                    mount.discovered = self.fstab.iter().position(|e| e.device == mount.device);
                }
                StepState::Passed
            }
            Err(e) => {
                warn!(error = %e, "Cannot read filesystem table");
                StepState::Failed
            }
        }
    }

    /// Mount one virtual filesystem: table-directed spec first, then the
    /// compiled-in default spec.
    fn run_vfs_mount(&mut self, mount_index: usize) -> StepState {
        let mount = self.vfs_mounts[mount_index].clone();
        let discovered = mount
            .discovered
            .and_then(|index| self.fstab.get(index))
            .cloned();

        if let Some(entry) = discovered {
            if fs::create_dir_all(&entry.path).is_ok()
                && self
                    .mounter
                    .mount(&entry.device, &entry.path, &entry.fstype, &entry.options)
                    .is_ok()
            {
                return StepState::Passed;
            }
            debug!(device = %mount.device, "Table-directed mount failed, trying default spec");
        }

        if let Err(e) = fs::create_dir_all(&mount.mountpoint) {
            warn!(mountpoint = %mount.mountpoint.display(), error = %e, "Cannot create mountpoint");
            return StepState::Failed;
        }
        match self
            .mounter
            .mount(&mount.device, &mount.mountpoint, &mount.fstype, &mount.options)
        {
            Ok(()) => StepState::Passed,
            Err(e) => {
                warn!(device = %mount.device, error = %e, "Mount failed");
                StepState::Failed
            }
        }
    }

    /// The mountpoint a VFS device is using this boot: the table
    /// override when one was discovered, else the descriptor default.
    fn effective_mountpoint(&self, device: &str) -> Option<PathBuf> {
        let mount = self.vfs_mounts.iter().find(|m| m.device == device)?;
        match mount.discovered.and_then(|index| self.fstab.get(index)) {
            Some(entry) => Some(entry.path.clone()),
            None => Some(mount.mountpoint.clone()),
        }
    }

    /// Evaluate a daemon's readiness check. Side-effect-free.
    fn daemon_ready(&self, daemon: &DaemonSpec) -> bool {
        match &daemon.ready {
            ReadyCheck::Socket { mount, suffix } => {
                let Some(base) = self.effective_mountpoint(mount) else {
                    return false;
                };
                is_socket(&base.join(suffix))
            }
            ReadyCheck::Mounted { device } => {
                let Some(base) = self.effective_mountpoint(device) else {
                    return false;
                };
                match fstab::parse_table(&self.config.mtab_path) {
                    Ok(entries) => entries
                        .iter()
                        .any(|entry| &entry.device == device && entry.path == base),
                    Err(e) => {
                        // an unreadable mount table must not wedge the boot
                        warn!(error = %e, "Cannot verify mount table, assuming ready");
                        true
                    }
                }
            }
            ReadyCheck::None => self.procs.contains_key(&daemon.binary),
        }
    }

    /// Launch a daemon and wait for readiness, retrying up to the bound.
    ///
    /// A crashed daemon can leave a stale readiness marker behind (a
    /// socket file survives its owner), so a respawn goes straight to
    /// the launch loop instead of trusting the pre-check.
    async fn run_daemon(
        &mut self,
        daemon_index: usize,
        step_index: usize,
        respawning: bool,
    ) -> StepState {
        let daemon = self.daemons[daemon_index].clone();

        if !respawning && self.daemon_ready(&daemon) {
            info!(daemon = %daemon.name, "Already ready, nothing to launch");
            return StepState::Canceled;
        }

        for attempt in 1..=self.config.launch_attempts {
            if attempt > 1 {
                self.record(step_index, StepState::Retrying);
            }

            // an existing record means an earlier launch is still
            // starting up; relaunching it would race on its socket
            if !self.procs.contains_key(&daemon.binary) {
                match self.launcher.launch(&daemon, self.exit_tx.clone()).await {
                    Ok(pid) => {
                        self.procs.insert(daemon.binary.clone(), RunningProc::new(pid));
                    }
                    Err(e) => {
                        // could not even start: an immediate failed
                        // attempt, no point waiting on readiness
                        warn!(daemon = %daemon.name, attempt = attempt, error = %e, "Launch failed");
                        continue;
                    }
                }
            }

            sleep(self.config.retry_delay).await;
            if self.daemon_ready(&daemon) {
                return StepState::Passed;
            }
        }

        warn!(daemon = %daemon.name, attempts = self.config.launch_attempts, "Daemon never became ready");
        StepState::Failed
    }

    /// React to a supervised daemon stopping: erase the stale record
    /// after a safety delay and re-run its launch step.
    async fn handle_daemon_exit(&mut self, event: ExitEvent) -> Result<()> {
        let Some((daemon_index, step_index)) = self.find_daemon_step(&event.binary) else {
            debug!(binary = %event.binary.display(), "Exit event for unknown daemon");
            self.procs.remove(&event.binary);
            return Ok(());
        };

        let name = self.daemons[daemon_index].name.clone();
        let uptime_secs = self
            .procs
            .get(&event.binary)
            .map(|proc| (Utc::now() - proc.started_at).num_seconds());
        match event.cause {
            ExitCause::Exited(code) => {
                warn!(daemon = %name, code = code, uptime_secs = uptime_secs, "Supervised daemon exited")
            }
            ExitCause::Signaled(sig) => {
                warn!(daemon = %name, signal = sig, uptime_secs = uptime_secs, "Supervised daemon killed by signal")
            }
        }

        if self.steps[step_index].result != StepState::Passed {
            // the launch step is still (or again) in charge of this
            // daemon; just drop the stale record
            self.procs.remove(&event.binary);
            return Ok(());
        }

        // safety delay against a tight respawn loop
        sleep(self.config.respawn_delay).await;
        self.procs.remove(&event.binary);

        let state = self.execute_step(step_index, true).await;
        if state == StepState::Failed && self.steps[step_index].fatal {
            let name = self.steps[step_index].name.clone();
            self.emergency_shell(&name);
            return Err(Error::FatalStep(name));
        }
        Ok(())
    }

    /// Locate the daemon and step indices for a binary path.
    fn find_daemon_step(&self, binary: &Path) -> Option<(usize, usize)> {
        let daemon_index = self.daemons.iter().position(|d| d.binary == binary)?;
        let step_index = self
            .steps
            .iter()
            .position(|s| s.kind == StepKind::StartDaemon(daemon_index))?;
        Some((daemon_index, step_index))
    }

    /// Hand the terminal over for manual recovery. Invoked at most once.
    fn emergency_shell(&mut self, step: &str) {
        if self.bailed {
            return;
        }
        self.bailed = true;

        // flush filesystem buffers before giving up the console
        unsafe {
            libc::sync();
        }
        self.display.bailout(&format!(
            "Boot step '{}' failed fatally. Dropping to emergency shell.",
            step
        ));
    }
}

/// Whether a filesystem node of socket type exists at this path.
fn is_socket(path: &Path) -> bool {
    fs::metadata(path)
        .map(|meta| meta.file_type().is_socket())
        .unwrap_or(false)
}
