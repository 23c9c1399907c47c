use crate::process::{spawn_turn, ExitInfo, ProcessHandle, SpawnSpec};
use bridgette_core::{
    decode_turn_request, encode_event, LineReassembler, Record, TurnEvent, TurnRequest,
    ValidationError,
};
use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, BufReader},
    process::{ChildStderr, ChildStdout},
    sync::{mpsc, Mutex},
};
use tracing::{debug, info, warn};

const OUTBOUND_CAPACITY: usize = 512;
const STDOUT_READ_BUFFER: usize = 8192;

/// How one-shot agent turns are launched.
#[derive(Clone, Debug)]
pub struct TurnConfig {
    pub program: PathBuf,
    pub base_args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub kill_grace: Duration,
}

pub fn build_turn_args(base_args: &[String], text: &str, resume_token: Option<&str>) -> Vec<String> {
    let mut args = base_args.to_vec();
    args.extend(
        [
            "-p",
            text,
            "--output-format",
            "stream-json",
            "--verbose",
            "--include-partial-messages",
        ]
        .iter()
        .map(|arg| arg.to_string()),
    );
    if let Some(token) = resume_token {
        args.push("--resume".to_string());
        args.push(token.to_string());
    }
    args
}

/// A text frame queued for the connection. Frames produced by a turn process
/// carry that process's generation; hub-generated frames carry none.
#[derive(Debug)]
pub struct Outbound {
    generation: Option<u64>,
    text: String,
}

/// Single consumer of a connection's outbound queue. Frames tagged with a
/// generation other than the current one are dropped here.
pub struct OutboundReceiver {
    rx: mpsc::Receiver<Outbound>,
    generation: Arc<AtomicU64>,
}

impl OutboundReceiver {
    pub async fn recv(&mut self) -> Option<String> {
        loop {
            let outbound = self.rx.recv().await?;
            if let Some(generation) = outbound.generation {
                if generation != self.generation.load(Ordering::SeqCst) {
                    continue;
                }
            }
            return Some(outbound.text);
        }
    }
}

struct ActiveTurn {
    generation: u64,
    handle: Arc<ProcessHandle>,
}

struct TurnState {
    cwd: PathBuf,
    /// Bumped on every accepted directory change; a turn only hands its
    /// session id back while the directory it ran in is still current.
    cwd_epoch: u64,
    resume_token: Option<String>,
    active: Option<ActiveTurn>,
}

/// Per-connection state of the chat channel.
pub struct TurnSession {
    conn_id: String,
    config: Arc<TurnConfig>,
    generation: Arc<AtomicU64>,
    state: Mutex<TurnState>,
    outbound: mpsc::Sender<Outbound>,
}

impl TurnSession {
    pub fn new(
        conn_id: String,
        config: Arc<TurnConfig>,
        home: PathBuf,
    ) -> (Arc<Self>, OutboundReceiver) {
        let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let generation = Arc::new(AtomicU64::new(0));
        let session = Arc::new(Self {
            conn_id,
            config,
            generation: generation.clone(),
            state: Mutex::new(TurnState {
                cwd: home,
                cwd_epoch: 0,
                resume_token: None,
                active: None,
            }),
            outbound: tx,
        });
        (session, OutboundReceiver { rx, generation })
    }

    pub fn conn_id(&self) -> &str {
        &self.conn_id
    }

    #[cfg(test)]
    pub async fn cwd(&self) -> PathBuf {
        self.state.lock().await.cwd.clone()
    }

    #[cfg(test)]
    pub async fn resume_token(&self) -> Option<String> {
        self.state.lock().await.resume_token.clone()
    }

    pub async fn is_streaming(&self) -> bool {
        self.state.lock().await.active.is_some()
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    /// Sends the current working directory; done once when the connection opens.
    pub async fn announce(&self) {
        let event = {
            let state = self.state.lock().await;
            TurnEvent::state(
                state.cwd.display().to_string(),
                state.resume_token.clone(),
            )
        };
        self.send_event(None, &event).await;
    }

    pub async fn handle_raw(self: &Arc<Self>, data: &[u8]) {
        match decode_turn_request(data) {
            Ok(request) => self.handle_request(request).await,
            Err(err) => {
                warn!(event = "turn_request_invalid", conn_id = %self.conn_id, error = %err);
                self.send_event(None, &TurnEvent::error(err.to_string()))
                    .await;
            }
        }
    }

    pub async fn handle_request(self: &Arc<Self>, request: TurnRequest) {
        match request {
            TurnRequest::Message { text } => self.start_turn(text).await,
            TurnRequest::SetCwd { path } => self.change_directory(path).await,
        }
    }

    async fn start_turn(self: &Arc<Self>, text: String) {
        let mut state = self.state.lock().await;

        // The bump must land before the replacement spawns so that anything
        // the old process still emits is already stale at the writer.
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(previous) = state.active.take() {
            info!(
                event = "turn_superseded",
                conn_id = %self.conn_id,
                generation = previous.generation,
                pid = ?previous.handle.pid(),
                next_generation = generation
            );
            previous.handle.terminate();
        }

        let spec = SpawnSpec {
            program: self.config.program.clone(),
            args: build_turn_args(
                &self.config.base_args,
                &text,
                state.resume_token.as_deref(),
            ),
            cwd: state.cwd.clone(),
            env: self.config.env.clone(),
        };

        let process = match spawn_turn(&spec, self.config.kill_grace) {
            Ok(process) => process,
            Err(err) => {
                drop(state);
                warn!(event = "turn_spawn_failed", conn_id = %self.conn_id, error = %err);
                self.send_event(None, &TurnEvent::error(err.to_string()))
                    .await;
                return;
            }
        };

        let handle = Arc::new(process.handle);
        info!(
            event = "turn_started",
            conn_id = %self.conn_id,
            generation = generation,
            pid = ?handle.pid(),
            cwd = %spec.cwd.display(),
            resume = state.resume_token.is_some()
        );
        let cwd_epoch = state.cwd_epoch;
        state.active = Some(ActiveTurn {
            generation,
            handle: handle.clone(),
        });
        drop(state);

        let session = self.clone();
        let stdout = process.stdout;
        let stderr = process.stderr;
        tokio::spawn(async move {
            tokio::join!(
                session.relay_stdout(generation, cwd_epoch, stdout),
                session.relay_stderr(generation, stderr),
            );
            let exit = handle.wait().await;
            session.finish_turn(generation, exit).await;
        });
    }

    async fn relay_stdout(&self, generation: u64, cwd_epoch: u64, mut stdout: ChildStdout) {
        let mut reassembler = LineReassembler::default();
        let mut buffer = vec![0u8; STDOUT_READ_BUFFER];
        loop {
            let read = match stdout.read(&mut buffer).await {
                Ok(0) => break,
                Ok(count) => count,
                Err(err) => {
                    warn!(event = "turn_stdout_error", conn_id = %self.conn_id, error = %err);
                    break;
                }
            };
            let report = reassembler.feed(&buffer[..read]);
            for err in &report.errors {
                debug!(event = "turn_record_unparsed", conn_id = %self.conn_id, error = %err);
            }
            for record in report.records {
                self.relay_record(generation, cwd_epoch, record).await;
            }
        }
        if let Some(record) = reassembler.flush() {
            self.relay_record(generation, cwd_epoch, record).await;
        }
    }

    async fn relay_stderr(&self, generation: u64, stderr: ChildStderr) {
        let mut reader = BufReader::new(stderr);
        let mut line = Vec::new();
        loop {
            line.clear();
            match reader.read_until(b'\n', &mut line).await {
                Ok(0) => break,
                Ok(_) => {}
                Err(err) => {
                    warn!(event = "turn_stderr_error", conn_id = %self.conn_id, error = %err);
                    break;
                }
            }
            let text = String::from_utf8_lossy(&line);
            let text = text.trim_end();
            if text.is_empty() {
                continue;
            }
            debug!(event = "turn_stderr", conn_id = %self.conn_id, generation = generation, line = %text);
            self.send_event(Some(generation), &TurnEvent::error(text))
                .await;
        }
    }

    async fn relay_record(&self, generation: u64, cwd_epoch: u64, record: Record) {
        if !self.is_current(generation) {
            return;
        }
        if record.is_blank() {
            debug!(event = "turn_blank_record", conn_id = %self.conn_id, generation = generation);
            return;
        }
        if let Some(session_id) = record.session_id() {
            let mut state = self.state.lock().await;
            if !self.is_current(generation) {
                return;
            }
            if state.cwd_epoch != cwd_epoch {
                debug!(
                    event = "resume_token_ignored",
                    conn_id = %self.conn_id,
                    generation = generation,
                    reason = "cwd_changed"
                );
            } else {
                info!(
                    event = "resume_token_updated",
                    conn_id = %self.conn_id,
                    generation = generation,
                    session_id = session_id
                );
                state.resume_token = Some(session_id.to_string());
            }
        }
        self.send(Some(generation), record.into_raw()).await;
    }

    async fn finish_turn(&self, generation: u64, exit: Option<ExitInfo>) {
        {
            let mut state = self.state.lock().await;
            let finished = state
                .active
                .as_ref()
                .is_some_and(|active| active.generation == generation);
            if finished {
                state.active = None;
            }
        }
        let status = exit.map(|info| info.to_string()).unwrap_or_default();
        info!(
            event = "turn_finished",
            conn_id = %self.conn_id,
            generation = generation,
            status = %status
        );
        if let Some(info) = exit {
            if !info.success() && self.is_current(generation) {
                let message = format!("agent exited with {info}");
                self.send_event(Some(generation), &TurnEvent::error(message))
                    .await;
            }
        }
    }

    async fn change_directory(&self, path: String) {
        let current = self.state.lock().await.cwd.clone();
        let target = match validate_directory(&current, &path).await {
            Ok(target) => target,
            Err(err) => {
                warn!(event = "cwd_rejected", conn_id = %self.conn_id, path = %path, error = %err);
                self.send_event(None, &TurnEvent::error(err.to_string()))
                    .await;
                return;
            }
        };

        let event = {
            let mut state = self.state.lock().await;
            state.cwd = target;
            state.cwd_epoch += 1;
            // A resumed conversation is bound to the directory it ran in.
            state.resume_token = None;
            TurnEvent::state(state.cwd.display().to_string(), None)
        };
        info!(event = "cwd_changed", conn_id = %self.conn_id, path = %path);
        self.send_event(None, &event).await;
    }

    /// Connection teardown: whatever is running is signalled and its output
    /// becomes stale.
    pub async fn close(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().await;
        if let Some(active) = state.active.take() {
            info!(
                event = "turn_cancelled",
                conn_id = %self.conn_id,
                generation = active.generation,
                pid = ?active.handle.pid()
            );
            active.handle.terminate();
        }
    }

    async fn send_event(&self, generation: Option<u64>, event: &TurnEvent) {
        match encode_event(event) {
            Ok(text) => self.send(generation, text).await,
            Err(err) => warn!(event = "encode_error", conn_id = %self.conn_id, error = %err),
        }
    }

    async fn send(&self, generation: Option<u64>, text: String) {
        if self
            .outbound
            .send(Outbound { generation, text })
            .await
            .is_err()
        {
            debug!(event = "outbound_closed", conn_id = %self.conn_id);
        }
    }

    #[cfg(test)]
    async fn seed_resume_token(&self, token: &str) {
        self.state.lock().await.resume_token = Some(token.to_string());
    }
}

async fn validate_directory(current: &Path, path: &str) -> Result<PathBuf, ValidationError> {
    let requested = PathBuf::from(path);
    let target = if requested.is_relative() {
        current.join(requested)
    } else {
        requested
    };
    match tokio::fs::metadata(&target).await {
        Ok(meta) if meta.is_dir() => Ok(target),
        _ => Err(ValidationError::NotADirectory(path.to_string())),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use serde_json::Value;

    // Stand-in agent: $2 is the instruction text, the token after --resume
    // is echoed back so tests can see the spawn arguments.
    const AGENT_SCRIPT: &str = r#"
text="$2"
resume=""
prev=""
for arg in "$@"; do
  if [ "$prev" = "--resume" ]; then resume="$arg"; fi
  prev="$arg"
done
case "$text" in
  slow)
    i=0
    while true; do
      printf '{"type":"tick","n":%d}\n' "$i"
      i=$((i+1))
      sleep 0.05
    done
    ;;
  fail)
    echo "boom" >&2
    exit 3
    ;;
  partial)
    printf '\n  \n{"type":"result","partial":true}'
    ;;
  late)
    trap '' TERM
    sleep 0.3
    printf '{"type":"system","subtype":"init","session_id":"late-session"}\n'
    ;;
  *)
    printf '{"type":"system","subtype":"init","session_id":"%s"}\n' "${resume:-abc}"
    printf '{"type":"echo","text":"%s","resume":"%s","cwd":"%s"}\n' "$text" "$resume" "$(pwd -P)"
    printf '{"type":"result","subtype":"success"}\n'
    ;;
esac
"#;

    fn agent_config(program: &str) -> Arc<TurnConfig> {
        Arc::new(TurnConfig {
            program: PathBuf::from(program),
            base_args: vec![
                "-c".to_string(),
                AGENT_SCRIPT.to_string(),
                "agent".to_string(),
            ],
            env: Vec::new(),
            kill_grace: Duration::from_millis(500),
        })
    }

    fn session_with(program: &str, home: PathBuf) -> (Arc<TurnSession>, OutboundReceiver) {
        TurnSession::new("conn-test".to_string(), agent_config(program), home)
    }

    fn message(text: &str) -> TurnRequest {
        TurnRequest::Message {
            text: text.to_string(),
        }
    }

    async fn next_json(rx: &mut OutboundReceiver) -> Value {
        let text = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("outbound timeout")
            .expect("outbound closed");
        serde_json::from_str(&text).unwrap_or(Value::String(text))
    }

    async fn next_of_type(rx: &mut OutboundReceiver, kind: &str) -> Value {
        loop {
            let value = next_json(rx).await;
            if value["type"] == kind {
                return value;
            }
        }
    }

    async fn wait_idle(session: &TurnSession) {
        for _ in 0..100 {
            if !session.is_streaming().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("turn did not finish");
    }

    #[test]
    fn turn_args_include_resume_only_when_present() {
        let fresh = build_turn_args(&[], "hello", None);
        assert_eq!(&fresh[..2], &["-p".to_string(), "hello".to_string()]);
        assert!(!fresh.contains(&"--resume".to_string()));

        let resumed = build_turn_args(&["--model".to_string(), "x".to_string()], "again", Some("abc"));
        assert_eq!(&resumed[..2], &["--model".to_string(), "x".to_string()]);
        assert_eq!(&resumed[resumed.len() - 2..], &["--resume".to_string(), "abc".to_string()]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn announce_reports_home_directory() {
        let home = tempfile::tempdir().expect("tempdir");
        let (session, mut rx) = session_with("/bin/sh", home.path().to_path_buf());
        session.announce().await;
        let state = next_json(&mut rx).await;
        assert_eq!(state["type"], "state");
        assert_eq!(state["cwd"], home.path().display().to_string());
        assert!(state["session_id"].is_null());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn init_record_sets_resume_token_for_next_turn() {
        let home = tempfile::tempdir().expect("tempdir");
        let (session, mut rx) = session_with("/bin/sh", home.path().to_path_buf());

        session.handle_request(message("hello")).await;
        let init = next_json(&mut rx).await;
        assert_eq!(init["subtype"], "init");
        assert_eq!(init["session_id"], "abc");
        let echo = next_json(&mut rx).await;
        assert_eq!(echo["text"], "hello");
        assert_eq!(echo["resume"], "");
        next_of_type(&mut rx, "result").await;
        wait_idle(&session).await;
        assert_eq!(session.resume_token().await.as_deref(), Some("abc"));

        session.handle_request(message("again")).await;
        let echo = next_of_type(&mut rx, "echo").await;
        assert_eq!(echo["text"], "again");
        assert_eq!(echo["resume"], "abc");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn new_instruction_supersedes_running_turn() {
        let home = tempfile::tempdir().expect("tempdir");
        let (session, mut rx) = session_with("/bin/sh", home.path().to_path_buf());

        session.handle_request(message("slow")).await;
        let tick = next_json(&mut rx).await;
        assert_eq!(tick["type"], "tick");

        session.handle_request(message("fast")).await;
        loop {
            let value = next_json(&mut rx).await;
            assert_ne!(value["type"], "tick", "stale output leaked: {value}");
            if value["type"] == "result" {
                break;
            }
        }
        wait_idle(&session).await;

        let late = tokio::time::timeout(Duration::from_millis(300), rx.recv()).await;
        assert!(late.is_err(), "unexpected output after turn: {late:?}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn spawn_failure_reports_error_and_keeps_token() {
        let home = tempfile::tempdir().expect("tempdir");
        let (session, mut rx) =
            session_with("/nonexistent/bridgette-agent", home.path().to_path_buf());
        session.seed_resume_token("keep-me").await;

        session.handle_request(message("hello")).await;
        let error = next_json(&mut rx).await;
        assert_eq!(error["type"], "error");
        assert!(error["message"]
            .as_str()
            .unwrap_or_default()
            .contains("failed to spawn"));
        assert!(!session.is_streaming().await);
        assert_eq!(session.resume_token().await.as_deref(), Some("keep-me"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stderr_and_failed_exit_become_error_records() {
        let home = tempfile::tempdir().expect("tempdir");
        let (session, mut rx) = session_with("/bin/sh", home.path().to_path_buf());

        session.handle_request(message("fail")).await;
        let stderr = next_json(&mut rx).await;
        assert_eq!(stderr["type"], "error");
        assert_eq!(stderr["message"], "boom");
        let exit = next_json(&mut rx).await;
        assert_eq!(exit["type"], "error");
        assert_eq!(exit["message"], "agent exited with code 3");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn blank_lines_are_skipped_and_unterminated_record_is_flushed() {
        let home = tempfile::tempdir().expect("tempdir");
        let (session, mut rx) = session_with("/bin/sh", home.path().to_path_buf());

        session.handle_request(message("partial")).await;
        let record = next_json(&mut rx).await;
        assert_eq!(record["type"], "result");
        assert_eq!(record["partial"], true);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn invalid_directory_is_rejected_once_without_state_change() {
        let home = tempfile::tempdir().expect("tempdir");
        let (session, mut rx) = session_with("/bin/sh", home.path().to_path_buf());
        session.seed_resume_token("abc").await;

        session
            .handle_request(TurnRequest::SetCwd {
                path: "/definitely/not/here".to_string(),
            })
            .await;
        let error = next_json(&mut rx).await;
        assert_eq!(error["type"], "error");
        let extra = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
        assert!(extra.is_err(), "expected exactly one message");

        assert_eq!(session.cwd().await, home.path().to_path_buf());
        assert_eq!(session.resume_token().await.as_deref(), Some("abc"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn superseded_init_does_not_replace_resume_token() {
        let home = tempfile::tempdir().expect("tempdir");
        let (session, mut rx) = session_with("/bin/sh", home.path().to_path_buf());

        // "late" ignores SIGTERM and reports its session id after the
        // replacement turn has already finished.
        session.handle_request(message("late")).await;
        session.handle_request(message("hello")).await;
        next_of_type(&mut rx, "result").await;
        wait_idle(&session).await;
        tokio::time::sleep(Duration::from_millis(600)).await;

        assert_eq!(session.resume_token().await.as_deref(), Some("abc"));
        while let Ok(Some(text)) = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await {
            assert!(!text.contains("late-session"), "stale init relayed: {text}");
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn init_from_previous_directory_is_not_adopted() {
        let home = tempfile::tempdir().expect("tempdir");
        let project = tempfile::tempdir().expect("tempdir");
        let (session, mut rx) = session_with("/bin/sh", home.path().to_path_buf());

        session.handle_request(message("late")).await;
        session
            .handle_request(TurnRequest::SetCwd {
                path: project.path().display().to_string(),
            })
            .await;
        let state = next_of_type(&mut rx, "state").await;
        assert_eq!(state["cwd"], project.path().display().to_string());

        // The running turn is not cancelled; its init is still relayed.
        let init = next_of_type(&mut rx, "system").await;
        assert_eq!(init["session_id"], "late-session");
        wait_idle(&session).await;
        assert_eq!(session.resume_token().await, None);

        session.handle_request(message("again")).await;
        let echo = next_of_type(&mut rx, "echo").await;
        assert_eq!(echo["resume"], "");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn directory_change_clears_resume_token() {
        let home = tempfile::tempdir().expect("tempdir");
        let project = tempfile::tempdir().expect("tempdir");
        let (session, mut rx) = session_with("/bin/sh", home.path().to_path_buf());
        session.seed_resume_token("abc").await;

        session
            .handle_request(TurnRequest::SetCwd {
                path: project.path().display().to_string(),
            })
            .await;
        let state = next_json(&mut rx).await;
        assert_eq!(state["type"], "state");
        assert_eq!(state["cwd"], project.path().display().to_string());
        assert!(state["session_id"].is_null());
        assert_eq!(session.resume_token().await, None);

        session.handle_request(message("hello")).await;
        let echo = next_of_type(&mut rx, "echo").await;
        assert_eq!(echo["resume"], "");
        let expected = std::fs::canonicalize(project.path()).expect("canonicalize");
        assert_eq!(echo["cwd"], expected.display().to_string());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn malformed_request_reports_validation_error() {
        let home = tempfile::tempdir().expect("tempdir");
        let (session, mut rx) = session_with("/bin/sh", home.path().to_path_buf());

        session.handle_raw(br#"{"type":"launch"}"#).await;
        let error = next_json(&mut rx).await;
        assert_eq!(error["type"], "error");
        assert!(error["message"]
            .as_str()
            .unwrap_or_default()
            .starts_with("invalid message"));
        assert!(!session.is_streaming().await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn close_cancels_running_turn() {
        let home = tempfile::tempdir().expect("tempdir");
        let (session, mut rx) = session_with("/bin/sh", home.path().to_path_buf());

        session.handle_request(message("slow")).await;
        let tick = next_json(&mut rx).await;
        assert_eq!(tick["type"], "tick");

        session.close().await;
        assert!(!session.is_streaming().await);
        let late = tokio::time::timeout(Duration::from_millis(300), rx.recv()).await;
        assert!(late.is_err(), "output leaked after close: {late:?}");
    }
}
