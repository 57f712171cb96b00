//! Async driver that connects a [`Client`] to a real WebSocket.
//!
//! The protocol core is socket-free; this module owns the socket, the
//! keepalive timer and the reconnect policy. Callers talk to the task
//! through a cloneable [`ClientHandle`] and receive every [`ClientEvent`]
//! on an unbounded channel.
//!
//! # Architecture
//!
//! ```text
//!   ClientHandle ──Command──▶ run_task ──▶ Client (sans-IO)
//!                               │  ▲            │
//!            ws::connect ◀──────┘  │            │ take_outgoing()
//!                                  │            ▼
//!            WsReader ──bytes──────┘        WsWriter::send_frame
//!                                           drain_events() ──▶ event_rx
//! ```
//!
//! # Lifecycle
//!
//! - `open(url)` connects. A previously open socket is closed first.
//! - `close()` closes the socket and stays idle until the next `open`.
//! - A lost socket (read error, peer close, keepalive timeout) reconnects
//!   with exponential backoff when `reconnect` is set, else goes idle.
//! - `shutdown()` closes the socket and ends the task.
//!
//! Rust guideline compliant 2025-01

use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};

use crate::client::{Client, ClientEvent};
use crate::ws::{self, WsMessage, WsReader, WsWriter};

/// Initial reconnection delay in seconds.
const INITIAL_BACKOFF_SECS: u64 = 1;
/// Maximum reconnection delay in seconds.
const MAX_BACKOFF_SECS: u64 = 60;

/// Closure run against the client inside the runner task.
type ClientCall = Box<dyn FnOnce(&mut Client) + Send>;

/// Runner settings.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// URL to connect to immediately. `None` waits for [`ClientHandle::open`].
    pub url: Option<String>,
    /// Extra HTTP headers for the WebSocket handshake.
    pub headers: Vec<(String, String)>,
    /// Reconnect after an unexpected disconnect.
    pub reconnect: bool,
    /// Ping interval. Zero disables keepalive.
    pub keepalive_interval: Duration,
    /// How long to wait for a pong.
    pub keepalive_timeout: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            url: None,
            headers: Vec::new(),
            reconnect: false,
            keepalive_interval: Duration::ZERO,
            keepalive_timeout: crate::link::keepalive::DEFAULT_TIMEOUT,
        }
    }
}

impl From<&crate::config::Config> for RunnerConfig {
    fn from(config: &crate::config::Config) -> Self {
        Self {
            url: Some(config.server_url.clone()),
            headers: Vec::new(),
            reconnect: config.reconnect,
            keepalive_interval: Duration::from_millis(config.keepalive_interval_ms),
            keepalive_timeout: Duration::from_millis(config.keepalive_timeout_ms),
        }
    }
}

enum Command {
    Open(String),
    Close,
    Reset,
    Call(ClientCall),
    Shutdown(oneshot::Sender<()>),
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open(url) => f.debug_tuple("Open").field(url).finish(),
            Self::Close => f.write_str("Close"),
            Self::Reset => f.write_str("Reset"),
            Self::Call(_) => f.write_str("Call(..)"),
            Self::Shutdown(_) => f.write_str("Shutdown"),
        }
    }
}

/// Handle to a running client task.
///
/// Every method is fire-and-forget; commands sent after the task ended are
/// silently dropped.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    command_tx: mpsc::UnboundedSender<Command>,
}

impl ClientHandle {
    /// Connect (or reconnect) to `url`.
    pub fn open(&self, url: impl Into<String>) {
        let _ = self.command_tx.send(Command::Open(url.into()));
    }

    /// Close the socket and stay idle.
    pub fn close(&self) {
        let _ = self.command_tx.send(Command::Close);
    }

    /// Soft reset: re-register every channel without reopening the socket.
    pub fn reset(&self) {
        let _ = self.command_tx.send(Command::Reset);
    }

    /// Run `f` against the client inside the task.
    pub fn call(&self, f: impl FnOnce(&mut Client) + Send + 'static) {
        let _ = self.command_tx.send(Command::Call(Box::new(f)));
    }

    /// Run `f` against the client and wait for its result.
    ///
    /// Returns `None` if the task has ended.
    pub async fn query<R, F>(&self, f: F) -> Option<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut Client) -> R + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.call(move |client| {
            let _ = tx.send(f(client));
        });
        rx.await.ok()
    }

    /// Close the socket and end the task. Resolves once the task is done.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.command_tx.send(Command::Shutdown(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

/// Spawn the runner task. Must be called inside a Tokio runtime.
pub fn spawn(mut client: Client, config: RunnerConfig) -> (ClientHandle, mpsc::UnboundedReceiver<ClientEvent>) {
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();

    client.set_keep_alive(config.keepalive_interval, config.keepalive_timeout, Instant::now());
    tokio::spawn(run_task(client, config, command_rx, event_tx));

    (ClientHandle { command_tx }, event_rx)
}

/// Why a connected session ended.
#[derive(Debug)]
enum ConnectionLoopExit {
    /// Socket lost; reconnect if configured.
    Disconnected,
    /// `close()` was requested; go idle.
    Closed,
    /// `open()` with a new URL.
    Reopen(String),
    /// Task is ending.
    Shutdown(Option<oneshot::Sender<()>>),
}

struct Task {
    client: Client,
    config: RunnerConfig,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<ClientEvent>,
}

async fn run_task(
    client: Client,
    config: RunnerConfig,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<ClientEvent>,
) {
    let mut target = config.url.clone();
    let mut task = Task {
        client,
        config,
        commands,
        events,
    };
    let mut backoff_secs = INITIAL_BACKOFF_SECS;

    loop {
        let Some(url) = target.clone() else {
            match task.idle().await {
                Some(ConnectionLoopExit::Reopen(url)) => {
                    backoff_secs = INITIAL_BACKOFF_SECS;
                    target = Some(url);
                }
                Some(ConnectionLoopExit::Shutdown(ack)) => return finish(ack),
                _ => {}
            }
            continue;
        };

        log::info!("[Runner] Connecting to {}", url);
        let headers: Vec<(&str, &str)> = task
            .config
            .headers
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();

        let exit = match ws::connect(&url, &headers).await {
            Ok((mut writer, mut reader)) => {
                log::info!("[Runner] WebSocket connected");
                backoff_secs = INITIAL_BACKOFF_SECS;
                task.client.socket_connected(Instant::now());
                let exit = task.run_connection(&mut writer, &mut reader).await;
                task.client.socket_disconnected();
                task.publish();
                exit
            }
            Err(e) => {
                log::warn!("[Runner] Connection failed: {e:#}");
                ConnectionLoopExit::Disconnected
            }
        };

        match exit {
            ConnectionLoopExit::Shutdown(ack) => return finish(ack),
            ConnectionLoopExit::Closed => target = None,
            ConnectionLoopExit::Reopen(url) => target = Some(url),
            ConnectionLoopExit::Disconnected if !task.config.reconnect => {
                log::info!("[Runner] Disconnected, reconnect disabled");
                target = None;
            }
            ConnectionLoopExit::Disconnected => {
                let jitter_ms = rand::random::<u64>() % 1000;
                let delay = Duration::from_secs(backoff_secs) + Duration::from_millis(jitter_ms);
                log::info!("[Runner] Reconnecting in {:?}", delay);
                backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
                match task.wait_backoff(delay).await {
                    Some(ConnectionLoopExit::Shutdown(ack)) => return finish(ack),
                    Some(ConnectionLoopExit::Closed) => target = None,
                    Some(ConnectionLoopExit::Reopen(url)) => {
                        backoff_secs = INITIAL_BACKOFF_SECS;
                        target = Some(url);
                    }
                    _ => {}
                }
            }
        }
    }
}

fn finish(ack: Option<oneshot::Sender<()>>) {
    log::info!("[Runner] Shutdown");
    if let Some(ack) = ack {
        let _ = ack.send(());
    }
}

impl Task {
    /// Forward queued client events to the owner.
    fn publish(&mut self) {
        for event in self.client.drain_events() {
            let _ = self.events.send(event);
        }
    }

    /// Write every queued frame to the socket.
    async fn flush(&mut self, writer: &mut WsWriter) -> anyhow::Result<()> {
        for frame in self.client.take_outgoing() {
            writer.send_frame(frame).await?;
        }
        Ok(())
    }

    /// Apply a command while no socket is open. Returns an exit when the
    /// command changes what the outer loop should do.
    fn handle_offline(&mut self, command: Option<Command>) -> Option<ConnectionLoopExit> {
        let exit = match command {
            None => Some(ConnectionLoopExit::Shutdown(None)),
            Some(Command::Open(url)) => Some(ConnectionLoopExit::Reopen(url)),
            Some(Command::Close) => Some(ConnectionLoopExit::Closed),
            Some(Command::Shutdown(ack)) => Some(ConnectionLoopExit::Shutdown(Some(ack))),
            Some(Command::Reset) => None,
            Some(Command::Call(f)) => {
                f(&mut self.client);
                None
            }
        };
        // Nothing can go out while disconnected.
        self.client.take_outgoing();
        self.publish();
        exit
    }

    /// Wait for a command that leaves the idle state.
    async fn idle(&mut self) -> Option<ConnectionLoopExit> {
        let command = self.commands.recv().await;
        self.handle_offline(command)
    }

    /// Sleep through a reconnect delay, still serving commands.
    async fn wait_backoff(&mut self, delay: Duration) -> Option<ConnectionLoopExit> {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                () = &mut sleep => return None,
                command = self.commands.recv() => {
                    if let Some(exit) = self.handle_offline(command) {
                        return Some(exit);
                    }
                }
            }
        }
    }

    async fn run_connection(&mut self, writer: &mut WsWriter, reader: &mut WsReader) -> ConnectionLoopExit {
        loop {
            self.publish();
            if let Err(e) = self.flush(writer).await {
                log::warn!("[Runner] Write failed: {e:#}");
                return ConnectionLoopExit::Disconnected;
            }
            if !self.client.is_connected() {
                log::warn!("[Runner] Link dropped, closing socket");
                let _ = writer.close().await;
                return ConnectionLoopExit::Disconnected;
            }

            let deadline = self.client.next_deadline();
            tokio::select! {
                message = reader.recv() => match message {
                    Some(Ok(WsMessage::Data(bytes))) => {
                        self.client.handle_message(Instant::now(), &bytes);
                    }
                    Some(Ok(WsMessage::Ping(data))) => {
                        let _ = writer.send_pong(data).await;
                    }
                    Some(Ok(WsMessage::Pong(_))) => {}
                    Some(Ok(WsMessage::Close { code, reason })) => {
                        log::info!("[Runner] Server closed connection: code={} reason={}", code, reason);
                        return ConnectionLoopExit::Disconnected;
                    }
                    Some(Err(e)) => {
                        log::warn!("[Runner] Read failed: {e:#}");
                        return ConnectionLoopExit::Disconnected;
                    }
                    None => {
                        log::info!("[Runner] WebSocket stream ended");
                        return ConnectionLoopExit::Disconnected;
                    }
                },
                () = sleep_until(deadline) => {
                    self.client.poll(Instant::now());
                }
                command = self.commands.recv() => match command {
                    Some(Command::Call(f)) => f(&mut self.client),
                    Some(Command::Reset) => self.client.reset(),
                    Some(Command::Open(url)) => {
                        let _ = writer.close().await;
                        return ConnectionLoopExit::Reopen(url);
                    }
                    Some(Command::Close) => {
                        let _ = writer.close().await;
                        return ConnectionLoopExit::Closed;
                    }
                    Some(Command::Shutdown(ack)) => {
                        let _ = writer.close().await;
                        return ConnectionLoopExit::Shutdown(Some(ack));
                    }
                    None => {
                        let _ = writer.close().await;
                        return ConnectionLoopExit::Shutdown(None);
                    }
                },
            }
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runner_config_from_config() {
        let config = crate::config::Config {
            server_url: "ws://localhost:9000/hub".to_string(),
            keepalive_interval_ms: 5000,
            keepalive_timeout_ms: 750,
            reconnect: true,
            ..crate::config::Config::default()
        };
        let runner = RunnerConfig::from(&config);
        assert_eq!(runner.url.as_deref(), Some("ws://localhost:9000/hub"));
        assert_eq!(runner.keepalive_interval, Duration::from_secs(5));
        assert_eq!(runner.keepalive_timeout, Duration::from_millis(750));
        assert!(runner.reconnect);
    }

    #[test]
    fn test_default_runner_config_is_idle() {
        let config = RunnerConfig::default();
        assert!(config.url.is_none());
        assert!(!config.reconnect);
        assert_eq!(config.keepalive_interval, Duration::ZERO);
    }

    #[tokio::test]
    async fn test_idle_runner_serves_queries() {
        let (handle, _events) = spawn(Client::new(), RunnerConfig::default());
        let id = handle.query(|client| client.add_list("todos", Some(10))).await.unwrap();
        let descriptor = handle
            .query(move |client| client.list(id).map(|l| l.descriptor().to_string()))
            .await
            .unwrap();
        assert_eq!(descriptor.as_deref(), Some("todos"));
        let connected = handle.query(|client| client.is_connected()).await;
        assert_eq!(connected, Some(false));
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_query_after_shutdown_returns_none() {
        let (handle, _events) = spawn(Client::new(), RunnerConfig::default());
        handle.shutdown().await;
        assert!(handle.query(|client| client.is_connected()).await.is_none());
    }

    #[tokio::test]
    async fn test_failed_connect_without_reconnect_goes_idle() {
        let config = RunnerConfig {
            url: Some("ws://127.0.0.1:1/hub".to_string()),
            ..RunnerConfig::default()
        };
        let (handle, _events) = spawn(Client::new(), config);
        // Still serves commands after the failed attempt.
        let connected = handle.query(|client| client.is_connected()).await;
        assert_eq!(connected, Some(false));
        handle.shutdown().await;
    }
}
