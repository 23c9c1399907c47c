use crate::process::{spawn_pty, ExitInfo, PtyControl, SpawnSpec};
use axum::extract::ws::{CloseFrame, Message};
use bridgette_core::{
    encode_event, parse_terminal_input, SessionStatus, TerminalEvent, TerminalInput, Utf8Carry,
};
use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

const EXIT_DRAIN_IDLE: Duration = Duration::from_millis(200);
const CLOSE_NORMAL: u16 = 1000;

const BANNER_RECONNECTED: &str = "\r\n\x1b[33m[Reconnected to existing session]\x1b[0m\r\n";
const BANNER_ENDED: &str = "\r\n\x1b[31m[Agent session ended]\x1b[0m\r\n";

#[derive(Clone, Debug)]
pub struct TerminalConfig {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
    pub cols: u16,
    pub rows: u16,
}

struct Attachment {
    conn_id: String,
    sender: mpsc::Sender<Message>,
}

struct TerminalSlot {
    id: u64,
    control: Arc<PtyControl>,
    attached: Option<Attachment>,
}

/// Owner of the one interactive agent process. It outlives the connections
/// that view it; a browser refresh re-attaches instead of respawning.
pub struct TerminalRegistry {
    config: TerminalConfig,
    next_id: AtomicU64,
    slot: Mutex<Option<TerminalSlot>>,
}

impl TerminalRegistry {
    pub fn new(config: TerminalConfig) -> Self {
        Self {
            config,
            next_id: AtomicU64::new(0),
            slot: Mutex::new(None),
        }
    }

    pub async fn is_running(&self) -> bool {
        self.slot.lock().await.is_some()
    }

    pub async fn attached_conn(&self) -> Option<String> {
        self.slot
            .lock()
            .await
            .as_ref()
            .and_then(|slot| slot.attached.as_ref())
            .map(|attachment| attachment.conn_id.clone())
    }

    /// Slot lock is never held across an await on a connection or input
    /// queue; a stalled peer must not block reattach or detach.
    pub async fn attach(self: &Arc<Self>, conn_id: &str, sender: mpsc::Sender<Message>) {
        let mut slot = self.slot.lock().await;

        if let Some(existing) = slot.as_mut() {
            let replaced = existing
                .attached
                .take()
                .filter(|previous| previous.conn_id != conn_id);
            existing.attached = Some(Attachment {
                conn_id: conn_id.to_string(),
                sender: sender.clone(),
            });
            info!(
                event = "terminal_reattached",
                conn_id = conn_id,
                pid = ?existing.control.pid()
            );
            // Queued before any output the pump may deliver to this sender.
            for message in [
                status_message(SessionStatus::Connected, None),
                Some(Message::Text(BANNER_RECONNECTED.to_string())),
            ]
            .into_iter()
            .flatten()
            {
                if sender.try_send(message).is_err() {
                    debug!(event = "terminal_status_dropped", conn_id = conn_id);
                }
            }
            drop(slot);

            if let Some(previous) = replaced {
                info!(
                    event = "terminal_detached",
                    conn_id = %previous.conn_id,
                    reason = "replaced",
                    replaced_by = conn_id
                );
                let _ = previous
                    .sender
                    .send(close_message("replaced by a newer connection"))
                    .await;
            }
            return;
        }

        let spec = SpawnSpec {
            program: self.config.program.clone(),
            args: self.config.args.clone(),
            cwd: self.config.cwd.clone(),
            env: self.config.env.clone(),
        };
        let process = match spawn_pty(&spec, self.config.cols, self.config.rows) {
            Ok(process) => process,
            Err(err) => {
                drop(slot);
                warn!(event = "terminal_spawn_failed", conn_id = conn_id, error = %err);
                let message = err.source.to_string();
                send_status(&sender, SessionStatus::Error, Some(message.clone())).await;
                let _ = sender
                    .send(Message::Text(failure_banner(&spec.program, &message)))
                    .await;
                return;
            }
        };

        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let control = Arc::new(process.control);
        *slot = Some(TerminalSlot {
            id,
            control: control.clone(),
            attached: Some(Attachment {
                conn_id: conn_id.to_string(),
                sender: sender.clone(),
            }),
        });
        drop(slot);
        info!(
            event = "terminal_started",
            conn_id = conn_id,
            terminal_id = id,
            pid = ?control.pid()
        );
        // The pump is not running yet, so this lands ahead of any output.
        send_status(&sender, SessionStatus::Connected, None).await;

        let registry = self.clone();
        tokio::spawn(async move {
            registry.pump(id, process.output, process.exit).await;
        });
    }

    /// Input from a connection. Only the attached connection may drive the
    /// process; anything else is dropped.
    pub async fn forward(&self, conn_id: &str, data: &[u8]) -> bool {
        let control = {
            let slot = self.slot.lock().await;
            let Some(current) = slot.as_ref() else {
                debug!(event = "terminal_input_ignored", conn_id = conn_id, reason = "no_process");
                return false;
            };
            let attached = current
                .attached
                .as_ref()
                .is_some_and(|attachment| attachment.conn_id == conn_id);
            if !attached {
                debug!(event = "terminal_input_ignored", conn_id = conn_id, reason = "not_attached");
                return false;
            }
            current.control.clone()
        };

        match parse_terminal_input(data) {
            TerminalInput::Resize { cols, rows } => {
                if let Err(err) = control.resize(cols, rows) {
                    warn!(event = "terminal_resize_failed", conn_id = conn_id, error = %err);
                    return false;
                }
                debug!(event = "terminal_resized", conn_id = conn_id, cols, rows);
                true
            }
            TerminalInput::Keystrokes(bytes) => {
                let written = control.write(bytes).await;
                if !written {
                    warn!(event = "terminal_input_dropped", conn_id = conn_id, size = bytes.len());
                }
                written
            }
        }
    }

    pub async fn detach(&self, conn_id: &str) {
        let mut slot = self.slot.lock().await;
        let Some(current) = slot.as_mut() else {
            return;
        };
        let attached = current
            .attached
            .as_ref()
            .is_some_and(|attachment| attachment.conn_id == conn_id);
        if attached {
            current.attached = None;
            info!(event = "terminal_detached", conn_id = conn_id, reason = "disconnect");
        }
    }

    /// Kills the process on hub shutdown.
    pub async fn shutdown(&self) {
        let taken = self.slot.lock().await.take();
        if let Some(current) = taken {
            info!(event = "terminal_shutdown", terminal_id = current.id, pid = ?current.control.pid());
            current.control.kill();
        }
    }

    async fn pump(
        self: Arc<Self>,
        id: u64,
        mut output: mpsc::Receiver<Vec<u8>>,
        mut exit: oneshot::Receiver<ExitInfo>,
    ) {
        let mut carry = Utf8Carry::default();
        let mut exit_info = None;
        loop {
            tokio::select! {
                chunk = output.recv() => match chunk {
                    Some(bytes) => self.deliver(id, carry.push(&bytes)).await,
                    None => break,
                },
                result = &mut exit => {
                    exit_info = Some(result.unwrap_or_default());
                    break;
                }
            }
        }

        if exit_info.is_some() {
            // The reader thread may still hold the last bytes the process wrote.
            while let Ok(Some(bytes)) = tokio::time::timeout(EXIT_DRAIN_IDLE, output.recv()).await {
                self.deliver(id, carry.push(&bytes)).await;
            }
        }
        self.deliver(id, carry.finish()).await;

        let exit_info = match exit_info {
            Some(info) => info,
            None => exit.await.unwrap_or_default(),
        };
        self.finish(id, exit_info).await;
    }

    async fn deliver(&self, id: u64, text: String) {
        if text.is_empty() {
            return;
        }
        let target = {
            let slot = self.slot.lock().await;
            slot.as_ref()
                .filter(|current| current.id == id)
                .and_then(|current| current.attached.as_ref())
                .map(|attachment| (attachment.conn_id.clone(), attachment.sender.clone()))
        };
        let Some((conn_id, sender)) = target else {
            return;
        };
        // A replaced connection's writer stops at its Close frame, so a
        // chunk racing a reattach never reaches the old socket.
        if sender.send(Message::Text(text)).await.is_err() {
            debug!(event = "terminal_output_dropped", conn_id = %conn_id);
        }
    }

    async fn finish(&self, id: u64, exit: ExitInfo) {
        let current = {
            let mut slot = self.slot.lock().await;
            if slot.as_ref().map(|current| current.id) != Some(id) {
                return;
            }
            slot.take()
        };
        let Some(current) = current else {
            return;
        };
        info!(event = "terminal_exited", terminal_id = id, status = %exit);
        if let Some(attachment) = current.attached {
            send_status(
                &attachment.sender,
                SessionStatus::Ended,
                Some(format!("exited with {exit}")),
            )
            .await;
            let _ = attachment
                .sender
                .send(Message::Text(BANNER_ENDED.to_string()))
                .await;
            let _ = attachment.sender.send(close_message("session ended")).await;
        }
    }
}

fn status_message(status: SessionStatus, message: Option<String>) -> Option<Message> {
    match encode_event(&TerminalEvent::status(status, message)) {
        Ok(text) => Some(Message::Text(text)),
        Err(err) => {
            warn!(event = "encode_error", error = %err);
            None
        }
    }
}

async fn send_status(sender: &mpsc::Sender<Message>, status: SessionStatus, message: Option<String>) {
    if let Some(message) = status_message(status, message) {
        let _ = sender.send(message).await;
    }
}

fn close_message(reason: &'static str) -> Message {
    Message::Close(Some(CloseFrame {
        code: CLOSE_NORMAL,
        reason: reason.into(),
    }))
}

fn failure_banner(program: &std::path::Path, message: &str) -> String {
    format!(
        "\r\n\x1b[31m[Failed to start agent session]\x1b[0m\r\n\
         \x1b[33mError: {message}\x1b[0m\r\n\r\n\
         \x1b[90mThis usually means:\x1b[0m\r\n\
         \x1b[90m  - PTY allocation is blocked in this environment\x1b[0m\r\n\
         \x1b[90m  - agent binary not found at: {}\x1b[0m\r\n",
        program.display()
    )
}
