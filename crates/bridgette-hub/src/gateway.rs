use crate::{
    terminal::{TerminalConfig, TerminalRegistry},
    turn::{OutboundReceiver, TurnConfig, TurnSession},
};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, Query, Request, State,
    },
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use serde_json::json;
use std::{
    collections::HashMap,
    net::SocketAddr,
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tokio::{
    sync::{mpsc, watch, RwLock},
    time::Interval,
};
use tracing::{debug, info, warn};

const TERMINAL_QUEUE: usize = 256;
const RESTART_DELAY: Duration = Duration::from_millis(500);

#[derive(Clone, Debug)]
pub struct GatewayConfig {
    pub home: PathBuf,
    pub token: Option<String>,
    pub write_timeout: Duration,
    pub ping_interval: Duration,
    pub debug: bool,
}

pub struct Gateway {
    config: GatewayConfig,
    conn_counter: AtomicU64,
    sessions: RwLock<HashMap<String, Arc<TurnSession>>>,
    terminal: Arc<TerminalRegistry>,
    turn_config: Arc<TurnConfig>,
    started: Instant,
    shutdown: watch::Sender<bool>,
}

impl Gateway {
    pub fn new(
        config: GatewayConfig,
        turn_config: TurnConfig,
        terminal_config: TerminalConfig,
    ) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            config,
            conn_counter: AtomicU64::new(0),
            sessions: RwLock::new(HashMap::new()),
            terminal: Arc::new(TerminalRegistry::new(terminal_config)),
            turn_config: Arc::new(turn_config),
            started: Instant::now(),
            shutdown,
        })
    }

    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/ws/chat", get(chat_handler))
            .route("/ws/terminal", get(terminal_handler))
            .route("/api/health", get(health_handler))
            .route("/api/restart", post(restart_handler))
            .layer(middleware::from_fn_with_state(self.clone(), require_token))
            .with_state(self.clone())
    }

    fn next_conn_id(&self) -> String {
        let id = self.conn_counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("conn-{id}")
    }

    pub async fn connection_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    async fn streaming_count(&self) -> usize {
        let sessions: Vec<_> = self.sessions.read().await.values().cloned().collect();
        let mut streaming = 0;
        for session in sessions {
            if session.is_streaming().await {
                streaming += 1;
            }
        }
        streaming
    }

    /// Resolves once a restart has been requested over HTTP.
    pub async fn restart_requested(&self) {
        let mut rx = self.shutdown.subscribe();
        let _ = rx.wait_for(|requested| *requested).await;
    }

    pub async fn shutdown(&self) {
        self.terminal.shutdown().await;
        let sessions = std::mem::take(&mut *self.sessions.write().await);
        for session in sessions.into_values() {
            debug!(event = "session_shutdown", conn_id = %session.conn_id());
            session.close().await;
        }
        info!(event = "gateway_shutdown");
    }

    async fn handle_turn_socket(self: Arc<Self>, socket: WebSocket, remote: SocketAddr) {
        let conn_id = self.next_conn_id();
        let (ws_sender, mut ws_receiver) = socket.split();
        let (session, outbound) = TurnSession::new(
            conn_id.clone(),
            self.turn_config.clone(),
            self.config.home.clone(),
        );
        self.sessions
            .write()
            .await
            .insert(conn_id.clone(), session.clone());
        info!(event = "client_connected", conn_id = %conn_id, channel = "chat", remote = %remote);

        let write_task = tokio::spawn(turn_writer(
            conn_id.clone(),
            ws_sender,
            outbound,
            self.config.write_timeout,
            self.config.ping_interval,
        ));

        session.announce().await;

        while let Some(result) = ws_receiver.next().await {
            let msg = match result {
                Ok(value) => value,
                Err(err) => {
                    warn!(event = "read_error", conn_id = %conn_id, error = %err);
                    break;
                }
            };
            let Some(data) = message_bytes(msg, &conn_id) else {
                break;
            };
            if data.is_empty() {
                continue;
            }
            if self.config.debug {
                debug!(event = "message_received", conn_id = %conn_id, raw = %String::from_utf8_lossy(&data));
            }
            session.handle_raw(&data).await;
        }

        session.close().await;
        self.sessions.write().await.remove(&conn_id);
        write_task.abort();
        info!(event = "client_disconnected", conn_id = %conn_id, channel = "chat");
    }

    async fn handle_terminal_socket(self: Arc<Self>, socket: WebSocket, remote: SocketAddr) {
        let conn_id = self.next_conn_id();
        let (ws_sender, mut ws_receiver) = socket.split();
        let (tx, rx) = mpsc::channel::<Message>(TERMINAL_QUEUE);
        info!(event = "client_connected", conn_id = %conn_id, channel = "terminal", remote = %remote);

        let write_task = tokio::spawn(terminal_writer(
            conn_id.clone(),
            ws_sender,
            rx,
            self.config.write_timeout,
            self.config.ping_interval,
        ));

        self.terminal.attach(&conn_id, tx).await;

        while let Some(result) = ws_receiver.next().await {
            let msg = match result {
                Ok(value) => value,
                Err(err) => {
                    warn!(event = "read_error", conn_id = %conn_id, error = %err);
                    break;
                }
            };
            let Some(data) = message_bytes(msg, &conn_id) else {
                break;
            };
            if data.is_empty() {
                continue;
            }
            self.terminal.forward(&conn_id, &data).await;
        }

        self.terminal.detach(&conn_id).await;
        write_task.abort();
        info!(event = "client_disconnected", conn_id = %conn_id, channel = "terminal");
    }
}

type WsSink = SplitSink<WebSocket, Message>;

async fn turn_writer(
    conn_id: String,
    mut ws_sender: WsSink,
    mut outbound: OutboundReceiver,
    write_timeout: Duration,
    ping_interval: Duration,
) {
    let mut ticker = keepalive(ping_interval);
    loop {
        let msg = tokio::select! {
            text = outbound.recv() => match text {
                Some(text) => Message::Text(text),
                None => break,
            },
            _ = next_ping(&mut ticker) => Message::Ping(Vec::new()),
        };
        if !send_bounded(&conn_id, &mut ws_sender, msg, write_timeout).await {
            break;
        }
    }
}

async fn terminal_writer(
    conn_id: String,
    mut ws_sender: WsSink,
    mut rx: mpsc::Receiver<Message>,
    write_timeout: Duration,
    ping_interval: Duration,
) {
    let mut ticker = keepalive(ping_interval);
    loop {
        let msg = tokio::select! {
            msg = rx.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
            _ = next_ping(&mut ticker) => Message::Ping(Vec::new()),
        };
        let closing = matches!(msg, Message::Close(_));
        if !send_bounded(&conn_id, &mut ws_sender, msg, write_timeout).await || closing {
            break;
        }
    }
}

async fn send_bounded(
    conn_id: &str,
    ws_sender: &mut WsSink,
    msg: Message,
    write_timeout: Duration,
) -> bool {
    match tokio::time::timeout(write_timeout, ws_sender.send(msg)).await {
        Ok(Ok(())) => true,
        Ok(Err(err)) => {
            debug!(event = "send_error", conn_id = conn_id, error = %err);
            false
        }
        Err(_) => {
            warn!(event = "write_timeout", conn_id = conn_id);
            false
        }
    }
}

fn keepalive(period: Duration) -> Option<Interval> {
    if period.is_zero() {
        return None;
    }
    Some(tokio::time::interval_at(
        tokio::time::Instant::now() + period,
        period,
    ))
}

async fn next_ping(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// `None` ends the read loop; control frames map to an empty payload.
fn message_bytes(msg: Message, conn_id: &str) -> Option<Vec<u8>> {
    match msg {
        Message::Text(text) => Some(text.into_bytes()),
        Message::Binary(bytes) => Some(bytes),
        Message::Close(_) => {
            info!(event = "client_close", conn_id = conn_id);
            None
        }
        Message::Ping(_) | Message::Pong(_) => Some(Vec::new()),
    }
}

async fn chat_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(gateway): State<Arc<Gateway>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        gateway.handle_turn_socket(socket, addr).await;
    })
}

async fn terminal_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(gateway): State<Arc<Gateway>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        gateway.handle_terminal_socket(socket, addr).await;
    })
}

async fn health_handler(State(gateway): State<Arc<Gateway>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "uptime": gateway.started.elapsed().as_secs_f64(),
        "timestamp": Utc::now().to_rfc3339(),
        "connections": gateway.connection_count().await,
        "streaming": gateway.streaming_count().await,
        "terminal": {
            "running": gateway.terminal.is_running().await,
            "attached": gateway.terminal.attached_conn().await,
        },
    }))
}

async fn restart_handler(State(gateway): State<Arc<Gateway>>) -> impl IntoResponse {
    info!(event = "restart_requested");
    tokio::spawn(async move {
        tokio::time::sleep(RESTART_DELAY).await;
        gateway.shutdown.send_replace(true);
    });
    Json(json!({"ok": true, "message": "Restarting..."}))
}

async fn require_token(
    State(gateway): State<Arc<Gateway>>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Response {
    if authorized(
        gateway.config.token.as_deref(),
        &headers,
        params.get("token").map(String::as_str),
    ) {
        return next.run(request).await;
    }
    warn!(event = "unauthorized", path = %request.uri().path());
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"error": "Unauthorized"})),
    )
        .into_response()
}

/// No configured token means every request is allowed.
fn authorized(token: Option<&str>, headers: &HeaderMap, query_token: Option<&str>) -> bool {
    let Some(token) = token.filter(|token| !token.is_empty()) else {
        return true;
    };
    let bearer = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));
    bearer == Some(token) || query_token == Some(token)
}
