//! Replica synchronization on top of resource sessions.
//!
//! A [`SyncedResource`] couples one [`ResourceSession`] with one
//! [`ResourceHandler`], the strategy that interprets resource messages and
//! keeps a local replica. Messages stay opaque `serde_json::Value`s until
//! they reach this boundary, where they are decoded into a
//! [`ResourceMessage`]; unknown fields are tolerated.
//!
//! # Architecture
//!
//! ```text
//! ChannelEvent ──▶ ResourceSession ──SessionEvent──▶ SyncedResource::pump
//!                        ▲                                  │
//!                        │ requests (dump, get, ...)        ▼
//!                        └────────────────────────── ResourceHandler
//!                                                     ├── ListReplica
//!                                                     └── ObjectReplica
//! ```
//!
//! Rust guideline compliant 2025-01

pub mod list;
pub mod object;

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::channel::ChannelEvent;
use crate::context::Context;
use crate::session::{ResourceSession, SessionError, SessionEvent, SessionState};

pub use list::{ListChange, ListEvent, ListReplica, ReplicaItem, SyncList};
pub use object::{ObjectEvent, ObjectReplica, PropertyMeta, SyncObject, WriteCallback, WriteError};

/// A resource message decoded at the replica boundary.
#[derive(Debug, Clone, Deserialize)]
pub struct ResourceMessage {
    /// Full command, e.g. `synclist:insertat`.
    pub command: String,
    /// The `parameters` object, if any.
    #[serde(default)]
    pub parameters: Value,
    /// Every other top-level field.
    #[serde(flatten)]
    pub root: Map<String, Value>,
}

impl ResourceMessage {
    /// Decode a session message. `None` if it has no string `command`.
    pub fn decode(value: Value) -> Option<Self> {
        serde_json::from_value(value).ok()
    }

    /// Look up a field in `parameters`, falling back to the message root.
    pub fn param(&self, key: &str) -> Option<&Value> {
        self.parameters
            .get(key)
            .or_else(|| self.root.get(key))
            .filter(|v| !v.is_null())
    }

    /// String field, empty if missing.
    pub fn param_str(&self, key: &str) -> &str {
        self.param(key).and_then(Value::as_str).unwrap_or_default()
    }

    /// Integer field. Accepts numeric strings.
    pub fn param_i64(&self, key: &str) -> Option<i64> {
        self.param(key).and_then(as_i64)
    }

    /// `parameters.data`.
    pub fn data(&self) -> Option<&Value> {
        self.param("data")
    }

    /// Whether this message echoes a change this client made.
    pub fn is_reply(&self) -> bool {
        match self.root.get("reply") {
            Some(Value::Bool(b)) => *b,
            Some(Value::Number(n)) => n.as_i64().is_some_and(|n| n != 0),
            _ => false,
        }
    }

    /// `errorcode`, stringified.
    pub fn error_code(&self) -> String {
        match self.root.get("errorcode") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        }
    }

    /// `errorstring`.
    pub fn error_string(&self) -> String {
        self.root
            .get("errorstring")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    }
}

/// Lenient integer conversion for wire values.
pub(crate) fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Message-interpretation strategy plugged into a [`SyncedResource`].
pub trait ResourceHandler {
    /// Notifications raised to the data-binding layer.
    type Event;

    /// Command namespace, e.g. `synclist`.
    fn resource_type(&self) -> &'static str;

    /// Apply one resource message. Requests pushed to `requests` are sent
    /// back to the server in order.
    fn on_message(&mut self, message: &ResourceMessage, requests: &mut Vec<Value>) -> Vec<Self::Event>;

    /// The session changed state.
    fn on_session_state(&mut self, state: SessionState) -> Vec<Self::Event>;

    /// The descriptor changed; replica contents no longer apply.
    fn on_descriptor_changed(&mut self) -> Vec<Self::Event>;
}

/// Notifications raised by a [`SyncedResource`].
#[derive(Debug, Clone, PartialEq)]
pub enum ReplicaEvent<E> {
    /// The session moved to a new state.
    State(SessionState),
    /// The attached flag flipped.
    Attached(bool),
    /// A replica-level notification.
    Replica(E),
}

/// One session plus the replica it feeds.
#[derive(Debug)]
pub struct SyncedResource<H> {
    session: ResourceSession,
    handler: H,
}

impl<H: ResourceHandler> SyncedResource<H> {
    /// Wrap a handler in a fresh session for its resource type.
    pub fn new(handler: H) -> Self {
        Self {
            session: ResourceSession::new(handler.resource_type()),
            handler,
        }
    }

    /// The underlying session.
    pub fn session(&self) -> &ResourceSession {
        &self.session
    }

    /// The replica.
    pub fn replica(&self) -> &H {
        &self.handler
    }

    pub(crate) fn replica_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    /// Session state.
    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    /// Current descriptor.
    pub fn descriptor(&self) -> &str {
        self.session.descriptor()
    }

    /// Request attach now or once possible.
    pub fn attach(&mut self, ctx: &mut Context) -> Vec<ReplicaEvent<H::Event>> {
        let events = self.session.attach(ctx);
        self.pump(ctx, events)
    }

    /// Detach and forget the attach request.
    pub fn detach(&mut self, ctx: &mut Context) {
        self.session.detach(ctx);
    }

    /// Change the descriptor, discarding replica contents.
    pub fn set_descriptor(&mut self, ctx: &mut Context, descriptor: impl Into<String>) -> Vec<ReplicaEvent<H::Event>> {
        let descriptor = descriptor.into();
        if descriptor == self.session.descriptor() {
            return Vec::new();
        }
        let mut out: Vec<_> = self
            .handler
            .on_descriptor_changed()
            .into_iter()
            .map(ReplicaEvent::Replica)
            .collect();
        let events = self.session.set_descriptor(ctx, descriptor);
        out.extend(self.pump(ctx, events));
        out
    }

    /// Route an event from the session's channel.
    pub fn handle_channel_event(&mut self, ctx: &mut Context, event: ChannelEvent) -> Vec<ReplicaEvent<H::Event>> {
        let events = self.session.handle_channel_event(ctx, event);
        self.pump(ctx, events)
    }

    /// React to a change of `ctx.auth`.
    pub fn auth_changed(&mut self, ctx: &mut Context) -> Vec<ReplicaEvent<H::Event>> {
        let events = self.session.auth_changed(ctx);
        self.pump(ctx, events)
    }

    /// Release the session's channel.
    pub fn close(&mut self, ctx: &mut Context) {
        self.session.close(ctx);
    }

    /// Send resource traffic. Requires CONNECTED.
    pub fn send(&self, ctx: &mut Context, message: Value) -> Result<(), SessionError> {
        self.session.send(ctx, message)
    }

    fn pump(&mut self, ctx: &mut Context, events: Vec<SessionEvent>) -> Vec<ReplicaEvent<H::Event>> {
        let mut out = Vec::new();
        for event in events {
            match event {
                SessionEvent::StateChanged(state) => {
                    out.push(ReplicaEvent::State(state));
                    out.extend(
                        self.handler
                            .on_session_state(state)
                            .into_iter()
                            .map(ReplicaEvent::Replica),
                    );
                }
                SessionEvent::AttachedChanged(attached) => out.push(ReplicaEvent::Attached(attached)),
                SessionEvent::Message(value) => {
                    let Some(message) = ResourceMessage::decode(value) else {
                        log::debug!("[Replica] Dropping message without command");
                        continue;
                    };
                    let mut requests = Vec::new();
                    out.extend(
                        self.handler
                            .on_message(&message, &mut requests)
                            .into_iter()
                            .map(ReplicaEvent::Replica),
                    );
                    for request in requests {
                        if let Err(e) = self.session.send(ctx, request) {
                            log::debug!("[Replica] Request not sent: {e}");
                        }
                    }
                }
            }
        }
        out
    }
}
