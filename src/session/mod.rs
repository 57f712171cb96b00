//! Resource sessions: attach a named remote resource over one channel.
//!
//! A session owns one channel (opened lazily) and one descriptor. It attaches
//! the resource only while the channel is connected and the context is
//! authenticated, and re-attaches when the descriptor changes.
//!
//! # State machine
//!
//! ```text
//!                  channel connected
//!  DISCONNECTED ─────────────────────────▶ READY
//!       │  ▲                                 │ attach (authenticated,
//!       │  │ detach:success / detached       │ descriptor set)
//!       │  │ channel lost / auth lost        ▼
//!       │  └──────────────────────────── CONNECTING
//!       │                                    │
//!       │            attach:success          │ attach:failed
//!       │        ┌───────────────────────────┤
//!       ▼        ▼                           ▼
//!           CONNECTED                      ERROR
//! ```
//!
//! # Wire format
//!
//! Outbound: `{"command":"<type>:attach","payload":{"descriptor":"..."},"token":"..."}`
//! and `{"command":"<type>:detach","token":"..."}`. Every inbound message
//! carrying a non-empty `msguid` is answered with
//! `{"command":"ACK","msguid":"..."}` before anything else happens.
//!
//! Rust guideline compliant 2025-01

pub mod descriptor;

use serde_json::{json, Map, Value};

use crate::channel::{ChannelError, ChannelEvent, ChannelId, ChannelState};
use crate::context::Context;
use crate::frame;

/// Attach state of a resource session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// Channel down, authentication lost, or detached.
    #[default]
    Disconnected,
    /// Channel connected; not attached.
    Ready,
    /// Attach sent, waiting for the server.
    Connecting,
    /// Attached; resource traffic flows.
    Connected,
    /// Reserved for bulk transfers; never entered by the session itself.
    Transferring,
    /// The server refused the attach.
    Error,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Ready => "ready",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Transferring => "transferring",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

/// Notifications raised by a session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The session moved to a new state.
    StateChanged(SessionState),
    /// The attached flag flipped.
    AttachedChanged(bool),
    /// A resource message that is not part of the attach handshake.
    Message(Value),
}

/// Errors that can occur when sending resource traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// The session has not opened its channel yet.
    NoChannel,
    /// The channel is not connected.
    ChannelDown,
    /// Resource traffic requires the CONNECTED state.
    NotAttached(SessionState),
    /// A value could not be serialized.
    Serialize(String),
    /// No object resource is registered under this session id.
    NotAnObject(u64),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoChannel => write!(f, "Session has no channel"),
            Self::ChannelDown => write!(f, "Session channel is not connected"),
            Self::NotAttached(state) => write!(f, "Session not attached (state: {state})"),
            Self::Serialize(msg) => write!(f, "Serialization failed: {msg}"),
            Self::NotAnObject(id) => write!(f, "Session {id} is not an object"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<ChannelError> for SessionError {
    fn from(err: ChannelError) -> Self {
        match err {
            ChannelError::UnknownChannel(_) => Self::NoChannel,
            ChannelError::NotConnected(_) => Self::ChannelDown,
        }
    }
}

/// One attachable remote resource bound to one channel.
#[derive(Debug)]
pub struct ResourceSession {
    resource_type: String,
    descriptor: String,
    /// Descriptor sent with the in-flight or last attach.
    requested: String,
    state: SessionState,
    attached: bool,
    channel: Option<ChannelId>,
    attach_when_ready: bool,
    reattach: bool,
    /// A detach was sent and not yet confirmed.
    detach_pending: bool,
}

impl ResourceSession {
    /// A detached session for `resource_type` (e.g. `synclist`, `object`).
    pub fn new(resource_type: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            descriptor: String::new(),
            requested: String::new(),
            state: SessionState::Disconnected,
            attached: false,
            channel: None,
            attach_when_ready: false,
            reattach: false,
            detach_pending: false,
        }
    }

    /// Command namespace.
    pub fn resource_type(&self) -> &str {
        &self.resource_type
    }

    /// Current descriptor.
    pub fn descriptor(&self) -> &str {
        &self.descriptor
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Whether the server confirmed the attach.
    pub fn is_attached(&self) -> bool {
        self.attached
    }

    /// The channel, once opened.
    pub fn channel(&self) -> Option<&ChannelId> {
        self.channel.as_ref()
    }

    /// Whether an attach is wanted but not yet possible.
    pub fn attach_pending(&self) -> bool {
        self.attach_when_ready && !matches!(self.state, SessionState::Connecting | SessionState::Connected)
    }

    /// Open the channel if it does not exist yet.
    pub fn ensure_channel(&mut self, ctx: &mut Context) -> ChannelId {
        if let Some(id) = &self.channel {
            return id.clone();
        }
        let id = ctx.link.open_channel();
        log::debug!("[Session] {} opened channel {id}", self.resource_type);
        self.channel = Some(id.clone());
        id
    }

    /// Request the resource be attached, now or once possible.
    pub fn attach(&mut self, ctx: &mut Context) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        self.attach_when_ready = true;
        self.ensure_channel(ctx);

        if self.descriptor.is_empty() {
            log::debug!("[Session] {} attach without descriptor", self.resource_type);
            return events;
        }

        match self.state {
            SessionState::Connected => {
                if self.requested != self.descriptor {
                    self.send_detach(ctx);
                    self.reattach = true;
                }
            }
            SessionState::Connecting => {}
            _ => self.try_attach(ctx, &mut events),
        }
        events
    }

    /// Detach and forget the attach request.
    ///
    /// The state changes once the server confirms with `detach:success`.
    pub fn detach(&mut self, ctx: &mut Context) {
        self.attach_when_ready = false;
        self.reattach = false;
        self.send_detach(ctx);
    }

    /// Change the descriptor. While attached this detaches and re-attaches.
    pub fn set_descriptor(&mut self, ctx: &mut Context, descriptor: impl Into<String>) -> Vec<SessionEvent> {
        let descriptor = descriptor.into();
        let mut events = Vec::new();
        if self.descriptor == descriptor {
            return events;
        }
        log::debug!(
            "[Session] {} descriptor {:?} -> {:?}",
            self.resource_type,
            self.descriptor,
            descriptor
        );
        self.descriptor = descriptor;

        if self.descriptor.is_empty() {
            self.reattach = false;
            if matches!(self.state, SessionState::Connected | SessionState::Connecting) {
                self.send_detach(ctx);
            }
            return events;
        }

        match self.state {
            SessionState::Connected => {
                if self.requested != self.descriptor {
                    self.send_detach(ctx);
                    self.reattach = true;
                }
            }
            // Resolved when the in-flight attach answers.
            SessionState::Connecting => {}
            _ => {
                if self.attach_when_ready {
                    self.try_attach(ctx, &mut events);
                }
            }
        }
        events
    }

    /// Send resource traffic. Requires CONNECTED.
    pub fn send(&self, ctx: &mut Context, message: Value) -> Result<(), SessionError> {
        if self.state != SessionState::Connected {
            return Err(SessionError::NotAttached(self.state));
        }
        self.send_control(ctx, message)
    }

    /// React to an event from the session's channel.
    pub fn handle_channel_event(&mut self, ctx: &mut Context, event: ChannelEvent) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        match event {
            ChannelEvent::Connected => {
                self.set_state(SessionState::Ready, &mut events);
                if self.attach_when_ready && ctx.auth.is_authenticated() {
                    self.try_attach(ctx, &mut events);
                }
            }
            ChannelEvent::Disconnected => {
                self.reattach = false;
                self.detach_pending = false;
                self.set_state(SessionState::Disconnected, &mut events);
                self.set_attached(false, &mut events);
            }
            ChannelEvent::Payload(message) => self.handle_message(ctx, message, &mut events),
        }
        events
    }

    /// React to a change of `ctx.auth`.
    pub fn auth_changed(&mut self, ctx: &mut Context) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        if ctx.auth.is_authenticated() {
            if self.attach_when_ready {
                self.try_attach(ctx, &mut events);
            }
        } else {
            if matches!(self.state, SessionState::Connected | SessionState::Connecting) {
                self.send_detach(ctx);
            }
            self.reattach = false;
            self.detach_pending = false;
            self.set_state(SessionState::Disconnected, &mut events);
            self.set_attached(false, &mut events);
        }
        events
    }

    /// Release the channel, notifying the peer best-effort.
    pub fn close(&mut self, ctx: &mut Context) {
        if let Some(id) = self.channel.take() {
            ctx.link.remove_channel(&id);
        }
        self.state = SessionState::Disconnected;
        self.attached = false;
        self.detach_pending = false;
    }

    fn channel_connected(&self, ctx: &Context) -> bool {
        self.channel
            .as_ref()
            .and_then(|id| ctx.link.channel_state(id))
            == Some(ChannelState::Connected)
    }

    fn try_attach(&mut self, ctx: &mut Context, events: &mut Vec<SessionEvent>) {
        let allowed = matches!(
            self.state,
            SessionState::Disconnected | SessionState::Ready | SessionState::Error
        );
        if !allowed || self.descriptor.is_empty() {
            return;
        }
        if !ctx.auth.is_authenticated() || !self.channel_connected(ctx) {
            log::debug!("[Session] {} attach deferred", self.resource_type);
            return;
        }

        self.requested = self.descriptor.clone();
        self.set_state(SessionState::Connecting, events);
        log::debug!("[Session] Attaching {}:{}", self.resource_type, self.requested);
        let message = json!({
            "command": format!("{}:attach", self.resource_type),
            "payload": {"descriptor": self.requested},
        });
        if let Err(e) = self.send_control(ctx, message) {
            log::debug!("[Session] {} attach not sent: {e}", self.resource_type);
        }
    }

    /// At most one detach is in flight.
    fn send_detach(&mut self, ctx: &mut Context) {
        if self.detach_pending {
            log::debug!("[Session] {} detach already pending", self.resource_type);
            return;
        }
        let message = json!({"command": format!("{}:detach", self.resource_type)});
        match self.send_control(ctx, message) {
            Ok(()) => self.detach_pending = true,
            Err(e) => log::debug!("[Session] {} detach not sent: {e}", self.resource_type),
        }
    }

    /// Stamp the token and send over the channel, regardless of attach state.
    fn send_control(&self, ctx: &mut Context, message: Value) -> Result<(), SessionError> {
        let id = self.channel.as_ref().ok_or(SessionError::NoChannel)?;
        let mut map = match message {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("data".to_string(), other);
                map
            }
        };
        map.insert("token".to_string(), Value::String(ctx.auth.token().to_string()));
        ctx.link.send_payload(id, Value::Object(map))?;
        Ok(())
    }

    fn handle_message(&mut self, ctx: &mut Context, message: Value, events: &mut Vec<SessionEvent>) {
        let command = message
            .get("command")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        if let Some(msguid) = message.get("msguid").and_then(Value::as_str) {
            if !msguid.is_empty() {
                let ack = json!({"command": frame::ACK, "msguid": msguid});
                if let Err(e) = self.send_control(ctx, ack) {
                    log::debug!("[Session] ACK for {msguid} not sent: {e}");
                }
            }
        }

        let suffix = command
            .strip_prefix(self.resource_type.as_str())
            .and_then(|rest| rest.strip_prefix(':'));

        match suffix {
            Some("attach:success") => {
                log::info!("[Session] {}:{} attached", self.resource_type, self.requested);
                self.set_attached(true, events);
                self.set_state(SessionState::Connected, events);
                if self.descriptor.is_empty() {
                    self.send_detach(ctx);
                } else if self.descriptor != self.requested {
                    self.send_detach(ctx);
                    self.reattach = true;
                }
            }
            Some("attach:failed") => {
                log::warn!("[Session] {}:{} attach failed", self.resource_type, self.requested);
                self.set_attached(false, events);
                self.set_state(SessionState::Error, events);
            }
            Some("detach:success" | "detached") => {
                log::info!("[Session] {}:{} detached", self.resource_type, self.requested);
                self.detach_pending = false;
                self.set_state(SessionState::Disconnected, events);
                self.set_attached(false, events);
                if std::mem::take(&mut self.reattach) {
                    self.try_attach(ctx, events);
                }
            }
            _ => events.push(SessionEvent::Message(message)),
        }
    }

    fn set_state(&mut self, state: SessionState, events: &mut Vec<SessionEvent>) {
        if self.state != state {
            log::debug!("[Session] {} {} -> {}", self.resource_type, self.state, state);
            self.state = state;
            events.push(SessionEvent::StateChanged(state));
        }
    }

    fn set_attached(&mut self, attached: bool, events: &mut Vec<SessionEvent>) {
        if self.attached != attached {
            self.attached = attached;
            events.push(SessionEvent::AttachedChanged(attached));
        }
    }
}
