//! Backend process supervision.
//!
//! One [`BackendSupervisor`] exists per backend definition for the life
//! of the broker. It spawns its child on first demand, owns the child's
//! stdio pipes, frames outbound client messages onto stdin, and decodes
//! stdout back into per-client replies. When the child exits, for any
//! reason, the supervisor falls back to idle and the next dispatch
//! spawns a fresh child.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;

use crate::codec::{self, FrameDecoder, StdoutEvent};
use crate::config::BackendDescriptor;
use crate::error::BrokerError;
use crate::registry::SessionTable;

/// Mutable child-process state, serialized behind one lock so that
/// check-and-spawn and the subsequent stdin write never interleave
/// between two dispatching clients.
#[derive(Default)]
struct ProcState {
    /// Write end of the child's stdin. `Some` exactly while a child is
    /// considered running.
    stdin: Option<ChildStdin>,
    /// Child process id, for terminate().
    pid: Option<u32>,
    /// Bumped on every spawn so a stale exit callback cannot clobber
    /// the state of a respawned child.
    generation: u64,
}

/// Supervisor for one backend child process.
pub struct BackendSupervisor {
    descriptor: BackendDescriptor,
    broker_dir: PathBuf,
    /// Working directory, absolutized against the broker directory.
    working_dir: PathBuf,
    sessions: Arc<SessionTable>,
    ready: AtomicBool,
    state: Mutex<ProcState>,
}

impl BackendSupervisor {
    pub fn new(
        descriptor: BackendDescriptor,
        broker_dir: &Path,
        sessions: Arc<SessionTable>,
    ) -> Self {
        let working_dir = {
            let dir = Path::new(&descriptor.working_dir);
            if dir.is_absolute() {
                dir.to_path_buf()
            } else {
                broker_dir.join(dir)
            }
        };
        Self {
            descriptor,
            broker_dir: broker_dir.to_path_buf(),
            working_dir,
            sessions,
            ready: AtomicBool::new(false),
            state: Mutex::new(ProcState::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    /// Whether the backend has emitted its ready sentinel. Advisory:
    /// frames are forwarded regardless.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    /// Whether a child process is currently considered running.
    pub async fn is_running(&self) -> bool {
        self.state.lock().await.stdin.is_some()
    }

    /// Forward one client message to the backend, spawning the child
    /// first if it is not running.
    ///
    /// Once this returns, the frame has been written to the child's
    /// stdin (or dropped: a failed spawn or a dead pipe drops the
    /// message, leaving the supervisor idle for the next dispatch to
    /// retry).
    pub async fn dispatch(self: &Arc<Self>, client_id: &str, payload: &[u8]) {
        let frame = match codec::encode(client_id, payload) {
            Ok(frame) => frame,
            Err(err) => {
                warn!("not forwarding to backend '{}': {}", self.name(), err);
                return;
            }
        };

        let mut state = self.state.lock().await;
        if state.stdin.is_none() {
            if let Err(err) = self.spawn_child(&mut state) {
                warn!("{err}");
                return;
            }
        }
        if let Some(stdin) = state.stdin.as_mut() {
            if let Err(err) = stdin.write_all(&frame).await {
                warn!("writing to backend '{}' stdin: {}", self.name(), err);
            }
        }
    }

    /// Signal the running child to terminate and return immediately.
    /// Pipe and state cleanup happens when the exit watcher observes
    /// the child going away.
    pub async fn terminate(&self) {
        let state = self.state.lock().await;
        if let Some(pid) = state.pid {
            info!("terminating backend '{}' (pid {})", self.name(), pid);
            signal_terminate(pid);
        }
    }

    /// Spawn the child and wire up its pipes. Called with the state
    /// lock held; on error the supervisor stays idle.
    fn spawn_child(self: &Arc<Self>, state: &mut ProcState) -> Result<(), BrokerError> {
        let exe = self.broker_dir.join(&self.descriptor.command);

        let mut command = Command::new(&exe);
        command
            .arg(&self.descriptor.params)
            .current_dir(&self.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|source| BrokerError::SpawnFailed {
            name: self.descriptor.name.clone(),
            source,
        })?;
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(BrokerError::SpawnFailed {
                name: self.descriptor.name.clone(),
                source: std::io::Error::other("child stdio pipes missing"),
            });
        };

        state.generation += 1;
        state.stdin = Some(stdin);
        state.pid = child.id();
        self.ready.store(false, Ordering::Relaxed);
        info!(
            "spawned backend '{}' ({}) pid {:?}",
            self.name(),
            exe.display(),
            child.id()
        );

        tokio::spawn(Arc::clone(self).read_stdout(stdout));
        tokio::spawn(Arc::clone(self).watch_exit(child, state.generation));
        Ok(())
    }

    /// Read loop over the child's stdout: decode frames incrementally
    /// and route each reply to the session with the matching client id.
    async fn read_stdout(self: Arc<Self>, mut stdout: ChildStdout) {
        let mut decoder = FrameDecoder::new();
        let mut buf = vec![0u8; 8192];
        loop {
            match stdout.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    for event in decoder.feed(&buf[..n]) {
                        match event {
                            StdoutEvent::Ready => {
                                debug!("backend '{}' signalled ready", self.name());
                                self.ready.store(true, Ordering::Relaxed);
                            }
                            StdoutEvent::Frame { client_id, payload } => {
                                self.sessions.route_reply(&client_id, payload).await;
                            }
                        }
                    }
                }
                Err(err) => {
                    debug!("reading backend '{}' stdout: {}", self.name(), err);
                    break;
                }
            }
        }
        if decoder.malformed_count() > 0 {
            warn!(
                "backend '{}' produced {} malformed frame(s)",
                self.name(),
                decoder.malformed_count()
            );
        }
    }

    /// Wait for the child to exit, then reset the supervisor to idle.
    /// Bound sessions are not notified; their next dispatch respawns.
    async fn watch_exit(self: Arc<Self>, mut child: Child, generation: u64) {
        match child.wait().await {
            Ok(status) => info!("backend '{}' exited: {}", self.name(), status),
            Err(err) => warn!("waiting on backend '{}': {}", self.name(), err),
        }

        let mut state = self.state.lock().await;
        if state.generation == generation {
            state.stdin = None;
            state.pid = None;
            self.ready.store(false, Ordering::Relaxed);
        }
    }
}

#[cfg(unix)]
fn signal_terminate(pid: u32) {
    // SAFETY: delivering a signal to a pid; racy against reuse but
    // memory-safe.
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGTERM);
    }
}

#[cfg(windows)]
fn signal_terminate(pid: u32) {
    use windows_sys::Win32::Foundation::CloseHandle;
    use windows_sys::Win32::System::Threading::{
        OpenProcess, TerminateProcess, PROCESS_TERMINATE,
    };

    // SAFETY: the handle is closed before returning.
    unsafe {
        let handle = OpenProcess(PROCESS_TERMINATE, 0, pid);
        if !handle.is_null() {
            TerminateProcess(handle, 0);
            CloseHandle(handle);
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    fn write_script(dir: &Path, name: &str, body: &str) {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn supervisor(
        dir: &TempDir,
        command: &str,
        params: &str,
    ) -> (Arc<BackendSupervisor>, Arc<SessionTable>) {
        let sessions = Arc::new(SessionTable::default());
        let descriptor = BackendDescriptor {
            name: "test".to_string(),
            command: command.to_string(),
            working_dir: ".".to_string(),
            params: params.to_string(),
        };
        let supervisor = Arc::new(BackendSupervisor::new(
            descriptor,
            dir.path(),
            Arc::clone(&sessions),
        ));
        (supervisor, sessions)
    }

    async fn recv_reply(rx: &mut mpsc::UnboundedReceiver<Vec<u8>>) -> Vec<u8> {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for reply")
            .expect("reply channel closed")
    }

    async fn wait_until_idle(supervisor: &Arc<BackendSupervisor>) {
        timeout(Duration::from_secs(5), async {
            while supervisor.is_running().await {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("backend did not become idle");
    }

    #[tokio::test]
    async fn dispatch_spawns_and_routes_reply() {
        let dir = TempDir::new().unwrap();
        write_script(dir.path(), "echo.sh", "exec cat");
        let (supervisor, sessions) = supervisor(&dir, "echo.sh", "");

        let (tx, mut rx) = mpsc::unbounded_channel();
        sessions.insert("c1", tx).await;

        assert!(!supervisor.is_running().await);
        supervisor.dispatch("c1", b"hello").await;
        assert!(supervisor.is_running().await);

        assert_eq!(recv_reply(&mut rx).await, b"hello");
    }

    #[tokio::test]
    async fn exit_resets_to_idle_and_dispatch_respawns() {
        let dir = TempDir::new().unwrap();
        // Echoes exactly one line, then exits.
        write_script(dir.path(), "one.sh", "IFS= read -r line\nprintf '%s\\n' \"$line\"");
        let (supervisor, sessions) = supervisor(&dir, "one.sh", "");

        let (tx, mut rx) = mpsc::unbounded_channel();
        sessions.insert("c1", tx).await;

        supervisor.dispatch("c1", b"first").await;
        assert_eq!(recv_reply(&mut rx).await, b"first");

        wait_until_idle(&supervisor).await;

        supervisor.dispatch("c1", b"second").await;
        assert_eq!(recv_reply(&mut rx).await, b"second");
    }

    #[tokio::test]
    async fn spawn_failure_is_dropped_silently() {
        let dir = TempDir::new().unwrap();
        let (supervisor, sessions) = supervisor(&dir, "does-not-exist", "");

        let (tx, mut rx) = mpsc::unbounded_channel();
        sessions.insert("c1", tx).await;

        supervisor.dispatch("c1", b"hello").await;
        assert!(!supervisor.is_running().await);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn terminate_stops_the_child() {
        let dir = TempDir::new().unwrap();
        write_script(dir.path(), "echo.sh", "exec cat");
        let (supervisor, sessions) = supervisor(&dir, "echo.sh", "");

        let (tx, _rx) = mpsc::unbounded_channel();
        sessions.insert("c1", tx).await;

        supervisor.dispatch("c1", b"hello").await;
        assert!(supervisor.is_running().await);

        supervisor.terminate().await;
        wait_until_idle(&supervisor).await;
    }

    #[tokio::test]
    async fn ready_sentinel_sets_flag() {
        let dir = TempDir::new().unwrap();
        write_script(dir.path(), "ready.sh", "printf '\\0'\nexec cat");
        let (supervisor, sessions) = supervisor(&dir, "ready.sh", "");

        let (tx, mut rx) = mpsc::unbounded_channel();
        sessions.insert("c1", tx).await;

        assert!(!supervisor.is_ready());
        supervisor.dispatch("c1", b"ping").await;
        assert_eq!(recv_reply(&mut rx).await, b"ping");
        assert!(supervisor.is_ready());
    }

    #[tokio::test]
    async fn params_are_passed_to_the_child() {
        let dir = TempDir::new().unwrap();
        // Sinks stdin into the file named by the params argument.
        write_script(dir.path(), "sink.sh", "exec cat > \"$1\"");
        let out = dir.path().join("captured.txt");
        let (supervisor, _sessions) =
            supervisor(&dir, "sink.sh", out.to_str().unwrap());

        supervisor.dispatch("c9", b"payload").await;

        timeout(Duration::from_secs(5), async {
            loop {
                if std::fs::read(&out)
                    .map(|data| data == b"c9\tpayload\n")
                    .unwrap_or(false)
                {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("backend never received the frame");
    }
}
