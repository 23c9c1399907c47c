use bridgette_core::SpawnError;
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use std::{
    env, fmt, io,
    io::{Read, Write},
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
    sync::Mutex as StdMutex,
    time::Duration,
};
use tokio::{
    process::{Child, ChildStderr, ChildStdout, Command},
    sync::{mpsc, oneshot, watch},
};
use tracing::{debug, info, warn};

const PTY_READ_BUFFER: usize = 8192;
const PTY_INPUT_STALL: Duration = Duration::from_secs(5);

#[derive(Clone, Debug)]
pub struct SpawnSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
}

impl SpawnSpec {
    fn program_label(&self) -> String {
        self.program.display().to_string()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    fn from_status(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;
        Self {
            code: status.code(),
            signal,
        }
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "code {code}"),
            (None, Some(signal)) => write!(f, "signal {signal}"),
            (None, None) => write!(f, "unknown status"),
        }
    }
}

/// Control side of a spawned turn process. Dropping the handle terminates
/// the process the same way `terminate` does.
#[derive(Debug)]
pub struct ProcessHandle {
    pid: Option<u32>,
    cancel: watch::Sender<bool>,
    exit: watch::Receiver<Option<ExitInfo>>,
}

impl ProcessHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Graceful stop, escalated to a kill after the grace period. Repeated
    /// calls and calls after exit are no-ops.
    pub fn terminate(&self) {
        if self.exit_info().is_some() {
            return;
        }
        self.cancel.send_replace(true);
    }

    pub fn exit_info(&self) -> Option<ExitInfo> {
        *self.exit.borrow()
    }

    pub async fn wait(&self) -> Option<ExitInfo> {
        let mut exit = self.exit.clone();
        let info = match exit.wait_for(Option::is_some).await {
            Ok(info) => *info,
            Err(_) => None,
        };
        info
    }
}

pub struct TurnProcess {
    pub handle: ProcessHandle,
    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
}

pub fn spawn_turn(spec: &SpawnSpec, kill_grace: Duration) -> Result<TurnProcess, SpawnError> {
    let mut command = Command::new(&spec.program);
    command
        .args(&spec.args)
        .current_dir(&spec.cwd)
        .envs(spec.env.iter().map(|(key, value)| (key, value)))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command
        .spawn()
        .map_err(|err| SpawnError::new(spec.program_label(), err))?;

    let stdout = child.stdout.take().ok_or_else(|| {
        SpawnError::new(
            spec.program_label(),
            io::Error::new(io::ErrorKind::Other, "stdout not captured"),
        )
    })?;
    let stderr = child.stderr.take().ok_or_else(|| {
        SpawnError::new(
            spec.program_label(),
            io::Error::new(io::ErrorKind::Other, "stderr not captured"),
        )
    })?;

    let pid = child.id();
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let (exit_tx, exit_rx) = watch::channel(None);
    tokio::spawn(supervise(child, cancel_rx, exit_tx, kill_grace));

    debug!(event = "process_spawned", program = %spec.program.display(), pid = ?pid);
    Ok(TurnProcess {
        handle: ProcessHandle {
            pid,
            cancel: cancel_tx,
            exit: exit_rx,
        },
        stdout,
        stderr,
    })
}

async fn supervise(
    mut child: Child,
    mut cancel: watch::Receiver<bool>,
    exit_tx: watch::Sender<Option<ExitInfo>>,
    kill_grace: Duration,
) {
    let pid = child.id();
    let status = tokio::select! {
        status = child.wait() => status,
        _ = cancelled(&mut cancel) => {
            terminate_gracefully(&mut child, kill_grace).await
        }
    };
    let info = match status {
        Ok(status) => ExitInfo::from_status(status),
        Err(err) => {
            warn!(event = "process_wait_error", pid = ?pid, error = %err);
            ExitInfo::default()
        }
    };
    debug!(event = "process_exited", pid = ?pid, status = %info);
    exit_tx.send_replace(Some(info));
}

/// Resolves on an explicit terminate or when the handle is dropped.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    let _ = cancel.wait_for(|requested| *requested).await;
}

async fn terminate_gracefully(child: &mut Child, kill_grace: Duration) -> io::Result<ExitStatus> {
    if let Some(status) = child.try_wait()? {
        return Ok(status);
    }
    let pid = child.id();
    if !send_terminate(child) {
        child.kill().await?;
        return child.wait().await;
    }
    match tokio::time::timeout(kill_grace, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            warn!(
                event = "process_kill_escalated",
                pid = ?pid,
                grace_ms = kill_grace.as_millis() as u64
            );
            child.kill().await?;
            child.wait().await
        }
    }
}

#[cfg(unix)]
fn send_terminate(child: &Child) -> bool {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return false;
    };
    match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        Ok(()) => true,
        Err(nix::errno::Errno::ESRCH) => false,
        Err(err) => {
            warn!(event = "process_sigterm_failed", pid = pid, error = %err);
            false
        }
    }
}

#[cfg(not(unix))]
fn send_terminate(_child: &Child) -> bool {
    false
}

/// Shared control surface of the interactive PTY process.
pub struct PtyControl {
    pid: Option<u32>,
    input: mpsc::Sender<Vec<u8>>,
    master: StdMutex<Box<dyn MasterPty + Send>>,
    killer: StdMutex<Box<dyn ChildKiller + Send + Sync>>,
}

impl PtyControl {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Queues keystrokes for the writer thread. Gives up after
    /// `PTY_INPUT_STALL` when the child has stopped reading its input.
    pub async fn write(&self, bytes: &[u8]) -> bool {
        self.input
            .send_timeout(bytes.to_vec(), PTY_INPUT_STALL)
            .await
            .is_ok()
    }

    pub fn resize(&self, cols: u16, rows: u16) -> io::Result<()> {
        let master = self
            .master
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "pty master poisoned"))?;
        master
            .resize(pty_size(cols, rows))
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err.to_string()))
    }

    pub fn kill(&self) {
        if let Ok(mut killer) = self.killer.lock() {
            if let Err(err) = killer.kill() {
                debug!(event = "pty_kill_error", pid = ?self.pid, error = %err);
            }
        }
    }
}

pub struct PtyProcess {
    pub control: PtyControl,
    pub output: mpsc::Receiver<Vec<u8>>,
    pub exit: oneshot::Receiver<ExitInfo>,
}

pub fn spawn_pty(spec: &SpawnSpec, cols: u16, rows: u16) -> Result<PtyProcess, SpawnError> {
    let label = spec.program_label();
    let pty_error = |err: String| SpawnError::new(label.clone(), io::Error::new(io::ErrorKind::Other, err));

    let pty_system = native_pty_system();
    let pair = pty_system
        .openpty(pty_size(cols, rows))
        .map_err(|err| pty_error(err.to_string()))?;

    let mut builder = CommandBuilder::new(&spec.program);
    builder.args(&spec.args);
    builder.cwd(&spec.cwd);
    for (key, value) in &spec.env {
        builder.env(key, value);
    }

    let mut child = pair
        .slave
        .spawn_command(builder)
        .map_err(|err| pty_error(err.to_string()))?;
    drop(pair.slave);

    let killer = child.clone_killer();
    let pid = child.process_id();
    let mut reader = pair
        .master
        .try_clone_reader()
        .map_err(|err| pty_error(err.to_string()))?;
    let mut writer = pair
        .master
        .take_writer()
        .map_err(|err| pty_error(err.to_string()))?;

    let (output_tx, output_rx) = mpsc::channel::<Vec<u8>>(256);
    std::thread::spawn(move || {
        let mut buffer = [0u8; PTY_READ_BUFFER];
        loop {
            let read = match reader.read(&mut buffer) {
                Ok(0) => break,
                Ok(count) => count,
                Err(_) => break,
            };
            if output_tx.blocking_send(buffer[..read].to_vec()).is_err() {
                break;
            }
        }
    });

    let (input_tx, mut input_rx) = mpsc::channel::<Vec<u8>>(256);
    std::thread::spawn(move || {
        while let Some(bytes) = input_rx.blocking_recv() {
            if writer.write_all(&bytes).is_err() {
                break;
            }
            let _ = writer.flush();
        }
    });

    let (exit_tx, exit_rx) = oneshot::channel::<ExitInfo>();
    std::thread::spawn(move || {
        let info = match child.wait() {
            Ok(status) => ExitInfo {
                code: Some(status.exit_code() as i32),
                signal: None,
            },
            Err(_) => ExitInfo::default(),
        };
        let _ = exit_tx.send(info);
    });

    info!(event = "pty_spawned", program = %spec.program.display(), pid = ?pid, cols, rows);
    Ok(PtyProcess {
        control: PtyControl {
            pid,
            input: input_tx,
            master: StdMutex::new(pair.master),
            killer: StdMutex::new(killer),
        },
        output: output_rx,
        exit: exit_rx,
    })
}

fn pty_size(cols: u16, rows: u16) -> PtySize {
    PtySize {
        rows: rows.max(1),
        cols: cols.max(1),
        pixel_width: 0,
        pixel_height: 0,
    }
}

/// Child environment: `<home>/.local/bin` is where agent CLIs usually live
/// but it is often missing from a service manager's PATH.
pub fn agent_env(home: &Path) -> Vec<(String, String)> {
    let local_bin = home.join(".local").join("bin").to_string_lossy().to_string();
    let path = env::var("PATH").unwrap_or_default();
    let full_path = if path.split(':').any(|entry| entry == local_bin) {
        path
    } else if path.is_empty() {
        local_bin
    } else {
        format!("{local_bin}:{path}")
    };
    vec![("PATH".to_string(), full_path)]
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn sh(script: &str) -> SpawnSpec {
        SpawnSpec {
            program: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_string(), script.to_string()],
            cwd: env::temp_dir(),
            env: Vec::new(),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn turn_process_reports_exit_code() {
        let mut process =
            spawn_turn(&sh("printf 'out'; exit 4"), Duration::from_secs(1)).expect("spawn");
        let mut out = String::new();
        process.stdout.read_to_string(&mut out).await.expect("read");
        assert_eq!(out, "out");

        let exit = tokio::time::timeout(Duration::from_secs(5), process.handle.wait())
            .await
            .expect("exit timeout")
            .expect("exit info");
        assert_eq!(exit.code, Some(4));
        assert!(!exit.success());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn terminate_stops_cooperative_process() {
        let process = spawn_turn(&sh("sleep 30"), Duration::from_secs(5)).expect("spawn");
        process.handle.terminate();
        let exit = tokio::time::timeout(Duration::from_secs(3), process.handle.wait())
            .await
            .expect("terminate timeout")
            .expect("exit info");
        assert!(!exit.success());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn terminate_escalates_when_sigterm_is_ignored() {
        let process = spawn_turn(
            &sh("trap '' TERM; while true; do sleep 0.05; done"),
            Duration::from_millis(200),
        )
        .expect("spawn");
        tokio::time::sleep(Duration::from_millis(100)).await;
        process.handle.terminate();
        let exit = tokio::time::timeout(Duration::from_secs(5), process.handle.wait())
            .await
            .expect("escalation timeout")
            .expect("exit info");
        assert_eq!(exit.signal, Some(9));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn terminate_after_exit_is_noop() {
        let process = spawn_turn(&sh("exit 0"), Duration::from_secs(1)).expect("spawn");
        let exit = process.handle.wait().await.expect("exit info");
        assert!(exit.success());
        process.handle.terminate();
        process.handle.terminate();
        assert_eq!(process.handle.exit_info(), Some(exit));
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let spec = SpawnSpec {
            program: PathBuf::from("/nonexistent/bridgette-agent"),
            args: Vec::new(),
            cwd: env::temp_dir(),
            env: Vec::new(),
        };
        let err = match spawn_turn(&spec, Duration::from_secs(1)) {
            Ok(_) => panic!("spawn should fail"),
            Err(err) => err,
        };
        assert_eq!(err.program, "/nonexistent/bridgette-agent");
        assert_eq!(err.source.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn agent_env_prefixes_local_bin_once() {
        let home = PathBuf::from("/home/agent-test");
        let env = agent_env(&home);
        let (key, path) = &env[0];
        assert_eq!(key, "PATH");
        assert!(path.starts_with("/home/agent-test/.local/bin"));
        assert_eq!(path.matches("/home/agent-test/.local/bin").count(), 1);
    }
}
