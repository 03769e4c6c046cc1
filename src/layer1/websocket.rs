// WebSocket Client - shared Binance futures stream connection
// Dynamic SUBSCRIBE/UNSUBSCRIBE multiplexing with exponential-backoff reconnect

use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message};
use tracing::{debug, error, info, warn};

use crate::core::config::{BinanceConfig, ReconnectConfig};
use crate::core::ConnectionStatus;
use crate::layer2::parser::{DepthUpdateEvent, MessageParser, ParserStats, StreamFrame};

/// Close code for an orderly shutdown; no reconnect follows it
pub const NORMAL_CLOSE_CODE: u16 = 1000;
/// Reported for dropped connections that carried no close frame
pub const ABNORMAL_CLOSE_CODE: u16 = 1006;
/// Error text emitted once reconnecting is abandoned
pub const MAX_RECONNECT_ERROR: &str = "max reconnect attempts reached";

// ============================================================================
// Events, errors and the control seam
// ============================================================================

/// Typed events delivered to the consumer of the connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Opened,
    Closed { code: u16, reason: String },
    Error(String),
    DepthUpdate(DepthUpdateEvent),
    SubscriptionAck { id: Option<u64> },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("WebSocket not connected")]
    NotConnected,
    #[error("Failed to send command: {0}")]
    Send(String),
}

/// Stream multiplexing on a shared connection
pub trait StreamControl: Send + Sync {
    fn subscribe(&self, streams: &[String]) -> Result<(), TransportError>;
    fn unsubscribe(&self, streams: &[String]) -> Result<(), TransportError>;
}

/// Commands sent to the WebSocket event loop
#[derive(Debug)]
enum WsCommand {
    Subscribe(Vec<String>),
    Unsubscribe(Vec<String>),
    Close,
}

// ============================================================================
// Reconnect policy
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub backoff_factor: f64,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    pub fn from_config(config: &ReconnectConfig) -> Self {
        Self {
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            backoff_factor: config.backoff_factor,
            max_delay: Duration::from_millis(config.max_delay_ms),
            max_attempts: config.max_attempts,
        }
    }

    /// Delay before reconnect `attempt` (1-based), or None once attempts are exhausted
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let exponent = (attempt - 1) as i32;
        let millis = self.initial_delay.as_millis() as f64 * self.backoff_factor.powi(exponent);
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Some(Duration::from_millis(capped as u64))
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from_config(&ReconnectConfig::default())
    }
}

// ============================================================================
// Client
// ============================================================================

/// Everything the connection task shares with the client handle
#[derive(Clone)]
struct ConnectionContext {
    url: String,
    state: Arc<RwLock<ConnectionStatus>>,
    message_count: Arc<RwLock<u64>>,
    error_count: Arc<RwLock<u64>>,
    reconnect_count: Arc<RwLock<u64>>,
    parser_stats: Arc<RwLock<ParserStats>>,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
    active_subscriptions: Arc<RwLock<HashSet<String>>>,
    next_request_id: Arc<AtomicU32>,
    policy: ReconnectPolicy,
    ping_interval: Duration,
    stale_timeout: Duration,
}

impl ConnectionContext {
    fn emit(&self, event: TransportEvent) {
        if self.event_tx.send(event).is_err() {
            debug!("Transport event receiver dropped");
        }
    }

    fn set_state(&self, status: ConnectionStatus) {
        *self.state.write() = status;
    }
}

/// Single shared WebSocket connection for every depth stream
pub struct WebSocketClient {
    ctx: ConnectionContext,
    // Command channel for subscribe/unsubscribe while the task runs
    cmd_tx: RwLock<Option<mpsc::UnboundedSender<WsCommand>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl WebSocketClient {
    pub fn new(
        config: &BinanceConfig,
        reconnect: &ReconnectConfig,
    ) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        info!(url = %config.ws_url, "WebSocket client created");

        let ctx = ConnectionContext {
            url: config.ws_url.clone(),
            state: Arc::new(RwLock::new(ConnectionStatus::Disconnected)),
            message_count: Arc::new(RwLock::new(0)),
            error_count: Arc::new(RwLock::new(0)),
            reconnect_count: Arc::new(RwLock::new(0)),
            parser_stats: Arc::new(RwLock::new(ParserStats::default())),
            event_tx,
            active_subscriptions: Arc::new(RwLock::new(HashSet::new())),
            next_request_id: Arc::new(AtomicU32::new(1)),
            policy: ReconnectPolicy::from_config(reconnect),
            ping_interval: Duration::from_secs(config.ws_ping_interval_secs.max(1)),
            stale_timeout: Duration::from_secs(config.ws_stale_timeout_secs.max(1)),
        };

        let client = Self {
            ctx,
            cmd_tx: RwLock::new(None),
            task: Mutex::new(None),
        };
        (client, event_rx)
    }

    /// Spawn the connection task on the current tokio runtime
    pub fn connect(&self) {
        let mut task = self.task.lock();
        if task.as_ref().map(|t| !t.is_finished()).unwrap_or(false) {
            debug!("WebSocket task already running");
            return;
        }

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<WsCommand>();
        *self.cmd_tx.write() = Some(cmd_tx);

        info!(url = %self.ctx.url, "Connecting to WebSocket");
        self.ctx.set_state(ConnectionStatus::Connecting);

        let ctx = self.ctx.clone();
        *task = Some(tokio::spawn(run_websocket(ctx, cmd_rx)));
    }

    /// Close with code 1000 and stop reconnecting
    pub fn disconnect(&self) {
        info!("Disconnecting WebSocket");
        if let Some(tx) = self.cmd_tx.read().as_ref() {
            let _ = tx.send(WsCommand::Close);
        }
    }

    /// True while the connection task (connected or backing off) is alive
    pub fn is_running(&self) -> bool {
        self.task.lock().as_ref().map(|t| !t.is_finished()).unwrap_or(false)
    }

    pub fn is_connected(&self) -> bool {
        *self.ctx.state.read() == ConnectionStatus::Connected
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.ctx.state.read()
    }

    /// Get list of active subscriptions
    pub fn active_subscriptions(&self) -> Vec<String> {
        self.ctx.active_subscriptions.read().iter().cloned().collect()
    }

    fn send_command(&self, cmd: WsCommand) -> Result<(), TransportError> {
        match self.cmd_tx.read().as_ref() {
            // Not connected yet: the set is sent on open
            None => Ok(()),
            Some(tx) => tx.send(cmd).map_err(|_| TransportError::NotConnected),
        }
    }

    /// Get statistics
    pub fn get_stats(&self) -> WebSocketStats {
        WebSocketStats {
            state: *self.ctx.state.read(),
            message_count: *self.ctx.message_count.read(),
            error_count: *self.ctx.error_count.read(),
            reconnect_count: *self.ctx.reconnect_count.read(),
            active_subscriptions: self.ctx.active_subscriptions.read().len(),
            parser: self.ctx.parser_stats.read().clone(),
        }
    }
}

impl StreamControl for WebSocketClient {
    fn subscribe(&self, streams: &[String]) -> Result<(), TransportError> {
        let added: Vec<String> = {
            let mut subs = self.ctx.active_subscriptions.write();
            streams.iter().filter(|s| subs.insert((*s).clone())).cloned().collect()
        };
        if added.is_empty() {
            return Ok(());
        }
        self.send_command(WsCommand::Subscribe(added))
    }

    fn unsubscribe(&self, streams: &[String]) -> Result<(), TransportError> {
        let removed: Vec<String> = {
            let mut subs = self.ctx.active_subscriptions.write();
            streams.iter().filter(|s| subs.remove(s.as_str())).cloned().collect()
        };
        if removed.is_empty() {
            return Ok(());
        }
        self.send_command(WsCommand::Unsubscribe(removed))
    }
}

impl Drop for WebSocketClient {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        self.ctx.set_state(ConnectionStatus::Disconnected);
        debug!("WebSocket client dropped, task aborted");
    }
}

/// WebSocket statistics
#[derive(Debug, Clone)]
pub struct WebSocketStats {
    pub state: ConnectionStatus,
    pub message_count: u64,
    pub error_count: u64,
    pub reconnect_count: u64,
    pub active_subscriptions: usize,
    pub parser: ParserStats,
}

impl fmt::Display for WebSocketStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "WebSocketStats(state={}, messages={}, errors={}, reconnects={}, subs={}, parse_errors={})",
            self.state,
            self.message_count,
            self.error_count,
            self.reconnect_count,
            self.active_subscriptions,
            self.parser.parse_errors
        )
    }
}

// ============================================================================
// Connection task
// ============================================================================

/// How a single connection ended
#[derive(Debug)]
enum ConnectionEnd {
    ClientClosed,
    ClientDropped,
    ServerClosed { code: u16, reason: String },
    Failed(String),
}

/// Main WebSocket async loop with automatic reconnection
async fn run_websocket(ctx: ConnectionContext, mut cmd_rx: mpsc::UnboundedReceiver<WsCommand>) {
    let mut attempt = 0u32;
    // Outlives each connection so counters accumulate across reconnects
    let mut parser = MessageParser {
        stats: ctx.parser_stats.read().clone(),
    };

    loop {
        match try_connect(&ctx, &mut cmd_rx, &mut attempt, &mut parser).await {
            ConnectionEnd::ClientClosed => {
                ctx.set_state(ConnectionStatus::Disconnected);
                ctx.emit(TransportEvent::Closed {
                    code: NORMAL_CLOSE_CODE,
                    reason: "client disconnect".to_string(),
                });
                return;
            }
            ConnectionEnd::ClientDropped => {
                ctx.set_state(ConnectionStatus::Disconnected);
                return;
            }
            ConnectionEnd::ServerClosed { code, reason } => {
                info!(code = code, reason = %reason, "WebSocket closed by server");
                if code == NORMAL_CLOSE_CODE {
                    ctx.set_state(ConnectionStatus::Disconnected);
                    ctx.emit(TransportEvent::Closed { code, reason });
                    return;
                }
                ctx.emit(TransportEvent::Closed { code, reason });
            }
            ConnectionEnd::Failed(msg) => {
                error!(error = %msg, "WebSocket connection error");
                *ctx.error_count.write() += 1;
                ctx.emit(TransportEvent::Error(msg.clone()));
                ctx.emit(TransportEvent::Closed {
                    code: ABNORMAL_CLOSE_CODE,
                    reason: msg,
                });
            }
        }

        attempt += 1;
        let delay = match ctx.policy.delay_for(attempt) {
            Some(delay) => delay,
            None => {
                error!(max_attempts = ctx.policy.max_attempts, "Max reconnection attempts reached");
                ctx.set_state(ConnectionStatus::Failed);
                ctx.emit(TransportEvent::Error(MAX_RECONNECT_ERROR.to_string()));
                return;
            }
        };

        warn!(
            delay_ms = delay.as_millis() as u64,
            attempt = attempt,
            max = ctx.policy.max_attempts,
            "Reconnecting"
        );
        ctx.set_state(ConnectionStatus::Reconnecting);
        *ctx.reconnect_count.write() += 1;

        // Back off, but honor a disconnect issued meanwhile. Subscription changes
        // are already in the active set and go out with the next SUBSCRIBE.
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => break,
                cmd = cmd_rx.recv() => match cmd {
                    Some(WsCommand::Close) => {
                        ctx.set_state(ConnectionStatus::Disconnected);
                        ctx.emit(TransportEvent::Closed {
                            code: NORMAL_CLOSE_CODE,
                            reason: "client disconnect".to_string(),
                        });
                        return;
                    }
                    Some(_) => {}
                    None => {
                        ctx.set_state(ConnectionStatus::Disconnected);
                        return;
                    }
                },
            }
        }
    }
}

/// Build a Binance SUBSCRIBE/UNSUBSCRIBE request frame
pub fn create_request_message(method: &str, streams: &[String], id: u32) -> String {
    serde_json::json!({
        "method": method,
        "params": streams,
        "id": id
    })
    .to_string()
}

/// One connection lifetime: connect, subscribe the active set, pump frames and commands
async fn try_connect(
    ctx: &ConnectionContext,
    cmd_rx: &mut mpsc::UnboundedReceiver<WsCommand>,
    attempt: &mut u32,
    parser: &mut MessageParser,
) -> ConnectionEnd {
    debug!(url = %ctx.url, "Connecting to WebSocket");

    let ws_stream = match connect_async(ctx.url.as_str()).await {
        Ok((stream, _)) => stream,
        Err(e) => return ConnectionEnd::Failed(e.to_string()),
    };

    info!("WebSocket connected");
    *attempt = 0;
    ctx.set_state(ConnectionStatus::Connected);
    ctx.emit(TransportEvent::Opened);

    let (mut write, mut read) = ws_stream.split();

    // Anything queued before this point is already reflected in the active set
    loop {
        match cmd_rx.try_recv() {
            Ok(WsCommand::Close) => {
                let _ = write.send(normal_close()).await;
                return ConnectionEnd::ClientClosed;
            }
            Ok(_) => continue,
            Err(mpsc::error::TryRecvError::Empty) => break,
            Err(mpsc::error::TryRecvError::Disconnected) => return ConnectionEnd::ClientDropped,
        }
    }

    let initial: Vec<String> = ctx.active_subscriptions.read().iter().cloned().collect();
    if !initial.is_empty() {
        let req_id = ctx.next_request_id.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = write
            .send(Message::Text(create_request_message("SUBSCRIBE", &initial, req_id)))
            .await
        {
            return ConnectionEnd::Failed(e.to_string());
        }
        info!(count = initial.len(), streams = ?initial, "Subscribed to streams");
    }

    let mut last_message_time = Instant::now();
    let mut ping = tokio::time::interval_at(Instant::now() + ctx.ping_interval, ctx.ping_interval);
    let health_period = ctx.stale_timeout.min(Duration::from_secs(30));
    let mut health = tokio::time::interval_at(Instant::now() + health_period, health_period);

    // Main event loop: incoming frames, commands, keepalive
    let end = loop {
        tokio::select! {
            msg_result = read.next() => {
                match msg_result {
                    Some(Ok(Message::Text(text))) => {
                        last_message_time = Instant::now();
                        *ctx.message_count.write() += 1;

                        let parsed = parser.parse(&text);
                        *ctx.parser_stats.write() = parser.stats.clone();

                        match parsed {
                            Ok(StreamFrame::DepthUpdate(update)) => {
                                ctx.emit(TransportEvent::DepthUpdate(update));
                            }
                            Ok(StreamFrame::SubscriptionAck { id }) => {
                                debug!(id = ?id, "Subscription acknowledged");
                                ctx.emit(TransportEvent::SubscriptionAck { id });
                            }
                            Ok(StreamFrame::ExchangeError { code, message }) => {
                                warn!(code = code, message = %message, "Exchange error frame");
                                ctx.emit(TransportEvent::Error(format!("Exchange error {}: {}", code, message)));
                            }
                            Err(e) => {
                                *ctx.error_count.write() += 1;
                                ctx.emit(TransportEvent::Error(e.to_string()));
                            }
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        last_message_time = Instant::now();
                        warn!(bytes = data.len(), "Received unexpected binary message");
                    }
                    Some(Ok(Message::Ping(data))) => {
                        last_message_time = Instant::now();
                        let _ = write.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_message_time = Instant::now();
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let (code, reason) = match frame {
                            Some(f) => (u16::from(f.code), f.reason.to_string()),
                            None => (1005, String::new()),
                        };
                        break ConnectionEnd::ServerClosed { code, reason };
                    }
                    Some(Ok(Message::Frame(_))) => {}
                    Some(Err(e)) => break ConnectionEnd::Failed(e.to_string()),
                    None => break ConnectionEnd::ServerClosed {
                        code: ABNORMAL_CLOSE_CODE,
                        reason: "stream ended".to_string(),
                    },
                }
            }

            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(WsCommand::Subscribe(streams)) => {
                        let req_id = ctx.next_request_id.fetch_add(1, Ordering::Relaxed);
                        if let Err(e) = write.send(Message::Text(create_request_message("SUBSCRIBE", &streams, req_id))).await {
                            break ConnectionEnd::Failed(e.to_string());
                        }
                        info!(streams = ?streams, id = req_id, "Subscribed");
                    }
                    Some(WsCommand::Unsubscribe(streams)) => {
                        let req_id = ctx.next_request_id.fetch_add(1, Ordering::Relaxed);
                        if let Err(e) = write.send(Message::Text(create_request_message("UNSUBSCRIBE", &streams, req_id))).await {
                            break ConnectionEnd::Failed(e.to_string());
                        }
                        info!(streams = ?streams, id = req_id, "Unsubscribed");
                    }
                    Some(WsCommand::Close) => {
                        let _ = write.send(normal_close()).await;
                        break ConnectionEnd::ClientClosed;
                    }
                    None => {
                        debug!("Command channel closed");
                        break ConnectionEnd::ClientDropped;
                    }
                }
            }

            _ = ping.tick() => {
                if let Err(e) = write.send(Message::Ping(Vec::new())).await {
                    break ConnectionEnd::Failed(format!("ping failed: {}", e));
                }
            }

            _ = health.tick() => {
                let elapsed = last_message_time.elapsed();
                if elapsed > ctx.stale_timeout {
                    warn!(elapsed_secs = elapsed.as_secs(), "Stale connection detected");
                    break ConnectionEnd::Failed("stale connection".to_string());
                }
            }
        }
    };

    debug!(end = ?end, "WebSocket connection closed");
    end
}

fn normal_close() -> Message {
    Message::Close(Some(CloseFrame {
        code: CloseCode::Normal,
        reason: "client disconnect".into(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn quick_reconnect(max_attempts: u32) -> ReconnectConfig {
        ReconnectConfig {
            initial_delay_ms: 10,
            backoff_factor: 2.0,
            max_delay_ms: 40,
            max_attempts,
        }
    }

    fn config_for(url: &str) -> BinanceConfig {
        BinanceConfig {
            ws_url: url.to_string(),
            ..BinanceConfig::default()
        }
    }

    #[test]
    fn test_reconnect_delay_schedule() {
        let policy = ReconnectPolicy::default();
        let delays: Vec<u64> = (1..=5)
            .map(|a| policy.delay_for(a).unwrap().as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![1_000, 2_000, 4_000, 8_000, 16_000]);
        assert_eq!(policy.delay_for(6), None);
        assert_eq!(policy.delay_for(0), None);

        let capped = ReconnectPolicy {
            max_attempts: 10,
            ..ReconnectPolicy::default()
        };
        assert_eq!(capped.delay_for(6), Some(Duration::from_millis(30_000)));
        assert_eq!(capped.delay_for(10), Some(Duration::from_millis(30_000)));
    }

    #[test]
    fn test_request_message() {
        let msg = create_request_message("SUBSCRIBE", &["btcusdt@depth".to_string()], 5);
        let value: serde_json::Value = serde_json::from_str(&msg).unwrap();
        assert_eq!(value["method"], "SUBSCRIBE");
        assert_eq!(value["params"][0], "btcusdt@depth");
        assert_eq!(value["id"], 5);
    }

    #[tokio::test]
    async fn test_subscriptions_recorded_before_connect() {
        let (client, _events) = WebSocketClient::new(&BinanceConfig::default(), &ReconnectConfig::default());
        assert!(!client.is_connected());

        let streams = vec!["btcusdt@depth".to_string(), "ethusdt@depth".to_string()];
        client.subscribe(&streams).unwrap();
        client.subscribe(&streams[..1]).unwrap();
        assert_eq!(client.active_subscriptions().len(), 2);

        client.unsubscribe(&streams[..1]).unwrap();
        assert_eq!(client.active_subscriptions(), vec!["ethusdt@depth".to_string()]);

        let stats = client.get_stats();
        assert_eq!(stats.state, ConnectionStatus::Disconnected);
        assert_eq!(stats.active_subscriptions, 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        // Nothing listens on port 1
        let (client, mut events) = WebSocketClient::new(&config_for("ws://127.0.0.1:1"), &quick_reconnect(2));
        client.connect();

        let mut errors = Vec::new();
        let mut closes = 0;
        while let Some(event) = tokio::time::timeout(Duration::from_secs(10), events.recv()).await.unwrap() {
            match event {
                TransportEvent::Error(msg) => {
                    let done = msg == MAX_RECONNECT_ERROR;
                    errors.push(msg);
                    if done {
                        break;
                    }
                }
                TransportEvent::Closed { code, .. } => {
                    assert_eq!(code, ABNORMAL_CLOSE_CODE);
                    closes += 1;
                }
                other => panic!("unexpected event {:?}", other),
            }
        }

        // Initial attempt plus two reconnects, then the final error
        assert_eq!(closes, 3);
        assert_eq!(errors.len(), 4);
        assert_eq!(client.get_stats().reconnect_count, 2);

        for _ in 0..100 {
            if !client.is_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!client.is_running());
        assert_eq!(client.status(), ConnectionStatus::Failed);
        assert_eq!(
            client.subscribe(&["btcusdt@depth".to_string()]),
            Err(TransportError::NotConnected)
        );
    }

    #[tokio::test]
    async fn test_subscribes_and_forwards_depth_frames() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

            let request = match ws.next().await.unwrap().unwrap() {
                Message::Text(text) => text,
                other => panic!("expected text, got {:?}", other),
            };
            let value: serde_json::Value = serde_json::from_str(&request).unwrap();
            assert_eq!(value["method"], "SUBSCRIBE");
            assert_eq!(value["params"][0], "btcusdt@depth");

            ws.send(Message::Text(format!(r#"{{"result":null,"id":{}}}"#, value["id"]))).await.unwrap();
            ws.send(Message::Text(
                r#"{"e":"depthUpdate","E":1,"s":"BTCUSDT","U":10,"u":12,"pu":9,"b":[["100.0","1"]],"a":[]}"#.to_string(),
            ))
            .await
            .unwrap();
            ws.send(Message::Text("garbage".to_string())).await.unwrap();
            ws.close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "bye".into(),
            }))
            .await
            .unwrap();
            // Drain until the client acknowledges the close
            while let Some(Ok(_)) = ws.next().await {}
        });

        let (client, mut events) =
            WebSocketClient::new(&config_for(&format!("ws://{}", addr)), &quick_reconnect(1));
        client.subscribe(&["btcusdt@depth".to_string()]).unwrap();
        client.connect();

        let mut received = Vec::new();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(10), events.recv())
                .await
                .unwrap()
                .unwrap();
            let done = matches!(event, TransportEvent::Closed { .. });
            received.push(event);
            if done {
                break;
            }
        }

        assert_eq!(received[0], TransportEvent::Opened);
        assert!(matches!(received[1], TransportEvent::SubscriptionAck { id: Some(_) }));
        match &received[2] {
            TransportEvent::DepthUpdate(update) => {
                assert_eq!(update.symbol, "BTCUSDT");
                assert_eq!(update.final_update_id, 12);
            }
            other => panic!("expected depth update, got {:?}", other),
        }
        assert!(matches!(received[3], TransportEvent::Error(_)));
        assert_eq!(
            received[4],
            TransportEvent::Closed {
                code: NORMAL_CLOSE_CODE,
                reason: "bye".to_string()
            }
        );

        server.await.unwrap();
        assert_eq!(client.get_stats().message_count, 3);
        assert_eq!(client.get_stats().parser.depth_count, 1);
        assert_eq!(client.status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_parser_stats_live_and_kept_across_reconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

        let server = tokio::spawn(async move {
            let frame = r#"{"e":"depthUpdate","E":1,"s":"BTCUSDT","U":10,"u":12,"b":[["100.0","1"]],"a":[]}"#;

            // First connection: one frame, then the socket is dropped without a close frame
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            ws.send(Message::Text(frame.to_string())).await.unwrap();
            drop(ws);

            // Second connection stays open until the test has read the stats
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            ws.send(Message::Text(frame.to_string())).await.unwrap();
            ws.send(Message::Text("garbage".to_string())).await.unwrap();
            let _ = release_rx.await;
            let _ = ws.close(None).await;
        });

        let (client, mut events) =
            WebSocketClient::new(&config_for(&format!("ws://{}", addr)), &quick_reconnect(3));
        client.connect();

        let mut depth_updates = 0;
        let mut parse_errors = 0;
        while depth_updates < 2 || parse_errors < 1 {
            match tokio::time::timeout(Duration::from_secs(10), events.recv()).await.unwrap().unwrap() {
                TransportEvent::DepthUpdate(_) => depth_updates += 1,
                TransportEvent::Error(msg) if msg.starts_with("Invalid JSON") => parse_errors += 1,
                _ => {}
            }
        }

        // Still connected: counters reflect both connections
        let stats = client.get_stats();
        assert_eq!(stats.parser.depth_count, 2);
        assert_eq!(stats.parser.parse_errors, 1);
        assert_eq!(stats.reconnect_count, 1);

        let _ = release_tx.send(());
        client.disconnect();
        server.await.unwrap();
    }
}
