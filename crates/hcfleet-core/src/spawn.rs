//! Conductor process spawning and readiness detection.
//!
//! Each conductor gets its own working directory and port pair, derived
//! from its index, so a fleet never needs locking around shared resources.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use futures::future::try_join_all;
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch};

use crate::conductor_config::ConductorConfig;
use crate::config::{FleetConfig, PortBase};
use crate::error::{FleetError, FleetResult};
use crate::logging::{LogWriter, Stream};

/// Lifecycle of a conductor process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    /// Launched, readiness marker not seen yet
    Spawning,
    /// Interfaces are listening
    Ready,
    /// Terminated by the harness
    Killed,
}

/// Ports and directory owned by the conductor at `index`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerLayout {
    pub index: usize,
    pub admin_port: u16,
    pub instance_port: u16,
    pub work_dir: PathBuf,
}

/// A running conductor process
pub struct PeerProcess {
    layout: PeerLayout,
    config_path: PathBuf,
    pid: Option<u32>,
    status: Mutex<PeerStatus>,
    /// Dropping this sender makes the exit watcher kill the process
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
    exit_rx: watch::Receiver<Option<i32>>,
}

impl PeerProcess {
    pub fn index(&self) -> usize {
        self.layout.index
    }

    pub fn admin_port(&self) -> u16 {
        self.layout.admin_port
    }

    pub fn instance_port(&self) -> u16 {
        self.layout.instance_port
    }

    pub fn work_dir(&self) -> &Path {
        &self.layout.work_dir
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn layout(&self) -> &PeerLayout {
        &self.layout
    }

    pub fn status(&self) -> PeerStatus {
        *self.status.lock()
    }

    /// Exit code once the process has gone away (`-1` when killed by signal)
    pub fn exit_code(&self) -> Option<i32> {
        *self.exit_rx.borrow()
    }

    /// Terminate the conductor and everything it spawned, then wait for it to exit.
    pub async fn kill(&self) -> FleetResult<()> {
        let index = self.layout.index;
        tracing::info!(peer = index, "Killing conductor");

        #[cfg(unix)]
        if let Some(pid) = self.pid {
            kill_process_group(index, pid)?;
        }

        // Without a process group, fall back to killing the direct child
        if let Some(tx) = self.kill_tx.lock().take() {
            let _ = tx.send(());
        }

        let mut exit_rx = self.exit_rx.clone();
        exit_rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| FleetError::Terminate {
                index,
                message: "exit watcher went away".to_string(),
            })?;

        *self.status.lock() = PeerStatus::Killed;
        Ok(())
    }

    async fn wait_ready(
        &self,
        ready_rx: oneshot::Receiver<()>,
        timeout: Option<Duration>,
    ) -> FleetResult<()> {
        let index = self.layout.index;
        let ready = async {
            ready_rx
                .await
                .map_err(|_| FleetError::ExitedBeforeReady { index })
        };

        match timeout {
            None => ready.await?,
            Some(limit) => tokio::time::timeout(limit, ready)
                .await
                .map_err(|_| FleetError::ReadyTimeout {
                    index,
                    waited_ms: limit.as_millis() as u64,
                })??,
        }

        *self.status.lock() = PeerStatus::Ready;
        Ok(())
    }
}

impl std::fmt::Debug for PeerProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerProcess")
            .field("layout", &self.layout)
            .field("pid", &self.pid)
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(unix)]
fn kill_process_group(index: usize, pid: u32) -> FleetResult<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    match killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        // Group already gone
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(errno) => Err(FleetError::Terminate {
            index,
            message: errno.to_string(),
        }),
    }
}

/// Launches conductors with isolated resources
pub struct ProcessSpawner {
    binary: PathBuf,
    root: PathBuf,
    ports: PortBase,
    debug: bool,
    ready_marker: String,
    ready_timeout: Option<Duration>,
    logs_dir: Option<PathBuf>,
    /// Keeps a generated root alive for the spawner's lifetime
    _temp_root: Option<TempDir>,
}

impl ProcessSpawner {
    pub fn new(config: &FleetConfig) -> FleetResult<Self> {
        let (root, temp_root) = match &config.work_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                (dir.clone(), None)
            }
            None => {
                let temp = tempfile::Builder::new().prefix("hcfleet-").tempdir()?;
                (temp.path().to_path_buf(), Some(temp))
            }
        };

        Ok(Self {
            binary: config.conductor_bin.clone(),
            root,
            ports: config.ports,
            debug: config.debug,
            ready_marker: config.ready_marker.clone(),
            ready_timeout: config.ready_timeout,
            logs_dir: config.logs_dir.clone(),
            _temp_root: temp_root,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Ports and working directory for the conductor at `index`.
    pub fn layout(&self, index: usize) -> FleetResult<PeerLayout> {
        let offset = u16::try_from(index).ok();
        let port = |base: u16| {
            offset.and_then(|o| base.checked_add(o)).ok_or_else(|| {
                FleetError::InvalidOperation(format!(
                    "conductor {} does not fit above port base {}",
                    index, base
                ))
            })
        };

        Ok(PeerLayout {
            index,
            admin_port: port(self.ports.admin)?,
            instance_port: port(self.ports.instance)?,
            work_dir: self.root.join(format!("conductor-{}", index)),
        })
    }

    /// Spawn the conductor at `index` and wait until it prints the readiness marker.
    pub async fn spawn(&self, index: usize) -> FleetResult<PeerProcess> {
        let layout = self.layout(index)?;
        let config = ConductorConfig::generate(
            &layout.work_dir,
            layout.admin_port,
            layout.instance_port,
            self.debug,
        );
        tokio::fs::create_dir_all(&config.network.n3h_persistence_path).await?;
        let config_path = layout.work_dir.join(format!("conductor-{}.toml", index));
        tokio::fs::write(&config_path, config.to_toml()?).await?;

        tracing::info!(
            peer = index,
            admin_port = layout.admin_port,
            instance_port = layout.instance_port,
            "Spawning conductor process"
        );

        let mut cmd = Command::new(&self.binary);
        cmd.arg("-c")
            .arg(&config_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group so shutdown can take down the conductor's children too
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd
            .spawn()
            .map_err(|source| FleetError::Spawn { index, source })?;
        let pid = child.id();

        let log_writer = self.peer_log_writer(index);
        let (ready_tx, ready_rx) = oneshot::channel();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(relay_stdout(
                index,
                stdout,
                self.ready_marker.clone(),
                ready_tx,
                log_writer.clone(),
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(relay_stderr(index, stderr, log_writer));
        }

        let (kill_tx, kill_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        tokio::spawn(watch_exit(index, pid, child, kill_rx, exit_tx));

        let process = PeerProcess {
            layout,
            config_path,
            pid,
            status: Mutex::new(PeerStatus::Spawning),
            kill_tx: Mutex::new(Some(kill_tx)),
            exit_rx,
        };
        process.wait_ready(ready_rx, self.ready_timeout).await?;

        tracing::info!(peer = index, "Conductor ready");
        Ok(process)
    }

    /// Spawn conductors `0..count`. Conductor 0 is fully up before the
    /// others start, since it hosts the network state they join.
    pub async fn spawn_fleet(&self, count: usize) -> FleetResult<Vec<PeerProcess>> {
        if count == 0 {
            return Ok(Vec::new());
        }

        let first = self.spawn(0).await?;
        let rest = try_join_all((1..count).map(|index| self.spawn(index))).await?;

        let mut fleet = Vec::with_capacity(count);
        fleet.push(first);
        fleet.extend(rest);
        Ok(fleet)
    }

    fn peer_log_writer(&self, index: usize) -> Option<Arc<LogWriter>> {
        let dir = self.logs_dir.as_ref()?;
        match LogWriter::for_conductor(dir, index) {
            Ok(writer) => Some(Arc::new(writer)),
            Err(e) => {
                tracing::warn!(peer = index, error = %e, "Failed to open conductor log file");
                None
            }
        }
    }
}

/// Copies relayed conductor lines into the conductor's log file
struct OutputCapture {
    index: usize,
    writer: Option<Arc<LogWriter>>,
    failed: bool,
}

impl OutputCapture {
    fn new(index: usize, writer: Option<Arc<LogWriter>>) -> Self {
        Self {
            index,
            writer,
            failed: false,
        }
    }

    /// Only the first write failure is reported.
    fn record(&mut self, stream: Stream, line: &str) {
        let Some(writer) = &self.writer else {
            return;
        };
        if let Err(e) = writer.relay(stream, line) {
            if !self.failed {
                self.failed = true;
                tracing::warn!(
                    peer = self.index,
                    stream = stream.as_str(),
                    path = %writer.path().display(),
                    error = %e,
                    "Failed to capture conductor output"
                );
            }
        }
    }
}

async fn relay_stdout(
    index: usize,
    stdout: impl AsyncRead + Unpin,
    marker: String,
    ready_tx: oneshot::Sender<()>,
    log_writer: Option<Arc<LogWriter>>,
) {
    let mut ready_tx = Some(ready_tx);
    let mut capture = OutputCapture::new(index, log_writer);
    let mut lines = BufReader::new(stdout).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::info!(peer = index, stream = "stdout", "{}", line);
        capture.record(Stream::Stdout, &line);
        if line.contains(&marker) {
            if let Some(tx) = ready_tx.take() {
                let _ = tx.send(());
            }
        }
    }
    // Dropping an unsent `ready_tx` reports an exit before readiness
}

async fn relay_stderr(
    index: usize,
    stderr: impl AsyncRead + Unpin,
    log_writer: Option<Arc<LogWriter>>,
) {
    let mut capture = OutputCapture::new(index, log_writer);
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::warn!(peer = index, stream = "stderr", "{}", line);
        capture.record(Stream::Stderr, &line);
    }
}

async fn watch_exit(
    index: usize,
    pid: Option<u32>,
    mut child: Child,
    kill_rx: oneshot::Receiver<()>,
    exit_tx: watch::Sender<Option<i32>>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        // Explicit kill request, or the owning PeerProcess was dropped
        _ = kill_rx => {
            #[cfg(unix)]
            if let Some(pid) = pid {
                if let Err(e) = kill_process_group(index, pid) {
                    tracing::warn!(peer = index, error = %e, "Failed to kill conductor process group");
                }
            }
            #[cfg(not(unix))]
            let _ = pid;
            if let Err(e) = child.start_kill() {
                tracing::debug!(peer = index, error = %e, "start_kill on exited child");
            }
            child.wait().await
        }
    };

    let code = match status {
        Ok(status) => status.code().unwrap_or(-1),
        Err(e) => {
            tracing::warn!(peer = index, error = %e, "Failed to wait on conductor");
            -1
        }
    };
    tracing::info!(peer = index, exit_code = code, "Conductor exited");
    let _ = exit_tx.send(Some(code));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn spawner(root: &Path) -> ProcessSpawner {
        let config = FleetConfig::default()
            .with_work_dir(root)
            .with_ports(PortBase {
                admin: 3000,
                instance: 4000,
            });
        ProcessSpawner::new(&config).unwrap()
    }

    #[test]
    fn test_layouts_are_disjoint_and_offset_by_index() {
        let temp = tempfile::tempdir().unwrap();
        let spawner = spawner(temp.path());

        let layouts: Vec<PeerLayout> = (0..16).map(|i| spawner.layout(i).unwrap()).collect();

        for (i, layout) in layouts.iter().enumerate() {
            assert_eq!(layout.admin_port as usize, 3000 + i);
            assert_eq!(layout.instance_port as usize, 4000 + i);
            assert_eq!(layout.work_dir, temp.path().join(format!("conductor-{}", i)));
        }

        let ports: HashSet<u16> = layouts
            .iter()
            .flat_map(|l| [l.admin_port, l.instance_port])
            .collect();
        assert_eq!(ports.len(), 32);
        let dirs: HashSet<&PathBuf> = layouts.iter().map(|l| &l.work_dir).collect();
        assert_eq!(dirs.len(), 16);
    }

    #[test]
    fn test_layout_rejects_port_overflow() {
        let temp = tempfile::tempdir().unwrap();
        let config = FleetConfig::default()
            .with_work_dir(temp.path())
            .with_ports(PortBase {
                admin: 65_530,
                instance: 4000,
            });
        let spawner = ProcessSpawner::new(&config).unwrap();

        assert!(spawner.layout(5).is_ok());
        assert!(matches!(
            spawner.layout(6),
            Err(FleetError::InvalidOperation(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_binary_fails_to_spawn() {
        let temp = tempfile::tempdir().unwrap();
        let config = FleetConfig::default()
            .with_work_dir(temp.path())
            .with_conductor_bin(temp.path().join("no-such-conductor"));
        let spawner = ProcessSpawner::new(&config).unwrap();

        let err = spawner.spawn(0).await.unwrap_err();
        assert!(matches!(err, FleetError::Spawn { index: 0, .. }));
        // Config artifact is still written before launch
        assert!(temp.path().join("conductor-0/conductor-0.toml").exists());
    }

    /// Running and not a zombie
    #[cfg(target_os = "linux")]
    fn is_running(pid: i32) -> bool {
        std::fs::read_to_string(format!("/proc/{}/stat", pid))
            .ok()
            .and_then(|stat| {
                let state = stat.rsplit(')').next()?.trim_start().chars().next()?;
                Some(state != 'Z')
            })
            .unwrap_or(false)
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_dropped_process_takes_its_children_along() {
        use std::os::unix::fs::PermissionsExt;

        let temp = tempfile::tempdir().unwrap();
        let script = temp.path().join("forking-conductor.sh");
        std::fs::write(
            &script,
            "#!/bin/sh\nsleep 600 &\necho $! > \"$(dirname \"$2\")/helper.pid\"\necho \"Starting interfaces...\"\nwait\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut config = FleetConfig::default()
            .with_work_dir(temp.path().join("work"))
            .with_conductor_bin(&script);
        config.ready_timeout = Some(Duration::from_secs(10));
        let spawner = ProcessSpawner::new(&config).unwrap();

        let process = spawner.spawn(0).await.unwrap();
        let helper: i32 = std::fs::read_to_string(process.work_dir().join("helper.pid"))
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        assert!(is_running(helper));

        // No kill(): the exit watcher alone has to take down the group
        drop(process);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while is_running(helper) {
            assert!(
                tokio::time::Instant::now() < deadline,
                "helper {} outlived its conductor",
                helper
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_capture_failure_is_reported_once() {
        use crate::logging::{read_entries, JsonlLayer, LogSource};
        use tracing_subscriber::prelude::*;

        let temp = tempfile::tempdir().unwrap();
        let conductor_logs = temp.path().join("conductors");
        let raw = conductor_logs.join("raw");
        std::fs::create_dir_all(&raw).unwrap();
        // Every flush into /dev/full fails with ENOSPC
        std::os::unix::fs::symlink(
            "/dev/full",
            raw.join(format!(
                "{}_conductor-0.jsonl",
                chrono::Local::now().format("%Y-%m-%d")
            )),
        )
        .unwrap();
        let writer = Arc::new(LogWriter::for_conductor(&conductor_logs, 0).unwrap());

        let harness_logs = temp.path().join("harness");
        let subscriber = tracing_subscriber::registry().with(JsonlLayer::new(&harness_logs).unwrap());
        let mut capture = OutputCapture::new(0, Some(writer));
        tracing::subscriber::with_default(subscriber, || {
            capture.record(Stream::Stdout, "Starting interfaces...");
            capture.record(Stream::Stderr, "n3h: bootstrap node unreachable");
            capture.record(Stream::Stdout, "Instance started");
        });

        assert!(capture.failed);
        let warnings: Vec<_> = read_entries(&harness_logs, Some(LogSource::Harness))
            .unwrap()
            .into_iter()
            .filter(|entry| entry.msg == "Failed to capture conductor output")
            .collect();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].level, "warn");
        assert_eq!(warnings[0].fields.as_ref().unwrap()["stream"], "stdout");
    }

    #[test]
    fn test_capture_without_log_file_is_a_no_op() {
        let mut capture = OutputCapture::new(0, None);
        capture.record(Stream::Stderr, "n3h: bootstrap node unreachable");
        assert!(!capture.failed);
    }
}
