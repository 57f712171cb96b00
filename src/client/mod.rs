//! The client: one link, one authentication state, many synced resources.
//!
//! `Client` is the object the runner drives. It owns the [`Context`] and
//! every list/object resource, routes link events to the session owning the
//! channel, and queues [`ClientEvent`]s for the data-binding layer.
//!
//! # Architecture
//!
//! ```text
//! runner ──socket/timer──▶ Client
//!                            ├── Context { PhysicalLink, AuthState }
//!                            ├── SessionId(1) ── SyncList   (synclist)
//!                            ├── SessionId(2) ── SyncObject (object)
//!                            └── events ──▶ ClientEvent queue ──▶ caller
//! ```
//!
//! All transitions run synchronously inside the caller. Nothing here does
//! I/O; outbound frames accumulate in the link until
//! [`Client::take_outgoing`].
//!
//! Rust guideline compliant 2025-01

use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use serde_json::Value;

use crate::channel::{ChannelError, ChannelEvent, ChannelId};
use crate::context::{AuthState, Context};
use crate::link::LinkEvent;
use crate::replica::{
    ListEvent, ListReplica, ObjectEvent, ObjectReplica, ReplicaEvent, SyncList, SyncObject, WriteCallback,
};
use crate::session::{SessionError, SessionState};

/// Identifier of a resource managed by a [`Client`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Everything the client reports to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// The link came up.
    LinkConnected,
    /// The link went down.
    LinkDisconnected,
    /// The peer opened a channel no session owns.
    IncomingChannel(ChannelId),
    /// A payload on a channel no session owns.
    ChannelPayload {
        /// Channel.
        channel: ChannelId,
        /// Opaque payload.
        payload: Value,
    },
    /// A channel no session owns connected or disconnected.
    ChannelState {
        /// Channel.
        channel: ChannelId,
        /// Whether it is connected now.
        connected: bool,
    },
    /// A session changed state.
    SessionState {
        /// Session.
        session: SessionId,
        /// New state.
        state: SessionState,
    },
    /// A session's attached flag flipped.
    Attached {
        /// Session.
        session: SessionId,
        /// Whether it is attached now.
        attached: bool,
    },
    /// A list replica notification.
    List {
        /// Session.
        session: SessionId,
        /// Event.
        event: ListEvent,
    },
    /// An object replica notification.
    Object {
        /// Session.
        session: SessionId,
        /// Event.
        event: ObjectEvent,
    },
}

#[derive(Debug)]
enum Slot {
    List(SyncList),
    Object(SyncObject),
}

/// Dispatch an operation to whichever resource kind a slot holds and
/// convert the resulting events.
macro_rules! with_slot {
    ($self:ident, $id:expr, |$res:ident, $ctx:ident| $body:expr) => {{
        let id = $id;
        match $self.sessions.get_mut(&id) {
            Some(Slot::List($res)) => {
                let $ctx = &mut $self.ctx;
                let events = $body;
                $self.push_list(id, events);
                true
            }
            Some(Slot::Object($res)) => {
                let $ctx = &mut $self.ctx;
                let events = $body;
                $self.push_object(id, events);
                true
            }
            None => false,
        }
    }};
}

/// Socket-free client state.
#[derive(Debug, Default)]
pub struct Client {
    ctx: Context,
    sessions: BTreeMap<SessionId, Slot>,
    next_id: u64,
    events: VecDeque<ClientEvent>,
}

impl Client {
    /// Disconnected, unauthenticated client with no resources.
    pub fn new() -> Self {
        Self::default()
    }

    /// The shared context.
    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// Whether the link is up.
    pub fn is_connected(&self) -> bool {
        self.ctx.link.is_connected()
    }

    /// Current authentication state.
    pub fn auth(&self) -> &AuthState {
        &self.ctx.auth
    }

    /// Mark the client authenticated. Pending attaches proceed.
    pub fn authenticate(&mut self, token: impl Into<String>) {
        self.ctx.auth = AuthState::authenticated(token);
        log::info!("[Client] Authenticated");
        self.auth_changed();
    }

    /// Drop authentication. Every session detaches.
    pub fn deauthenticate(&mut self) {
        self.ctx.auth = AuthState::default();
        log::info!("[Client] Authentication lost");
        self.auth_changed();
    }

    fn auth_changed(&mut self) {
        let ids: Vec<_> = self.sessions.keys().copied().collect();
        for id in ids {
            with_slot!(self, id, |res, ctx| res.auth_changed(ctx));
        }
    }

    /// Add a list resource. Call [`Client::attach`] to start syncing.
    pub fn add_list(&mut self, descriptor: impl Into<String>, preload_count: Option<usize>) -> SessionId {
        let replica = match preload_count {
            Some(n) => ListReplica::with_preload(n),
            None => ListReplica::new(),
        };
        let mut list = SyncList::new(replica);
        let id = self.allocate_id();
        let events = list.set_descriptor(&mut self.ctx, descriptor);
        self.sessions.insert(id, Slot::List(list));
        self.push_list(id, events);
        id
    }

    /// Add an object resource. Call [`Client::attach`] to start syncing.
    pub fn add_object(&mut self, descriptor: impl Into<String>) -> SessionId {
        let mut object = SyncObject::new(ObjectReplica::new());
        let id = self.allocate_id();
        let events = object.set_descriptor(&mut self.ctx, descriptor);
        self.sessions.insert(id, Slot::Object(object));
        self.push_object(id, events);
        id
    }

    fn allocate_id(&mut self) -> SessionId {
        self.next_id += 1;
        SessionId(self.next_id)
    }

    /// Attach a resource now or as soon as possible.
    pub fn attach(&mut self, id: SessionId) -> bool {
        with_slot!(self, id, |res, ctx| res.attach(ctx))
    }

    /// Detach a resource and forget the attach request.
    pub fn detach(&mut self, id: SessionId) -> bool {
        with_slot!(self, id, |res, ctx| {
            res.detach(ctx);
            Vec::new()
        })
    }

    /// Change a resource's descriptor.
    pub fn set_descriptor(&mut self, id: SessionId, descriptor: &str) -> bool {
        with_slot!(self, id, |res, ctx| res.set_descriptor(ctx, descriptor))
    }

    /// Filter a list resource.
    pub fn set_filter(&mut self, id: SessionId, filter: &Value) -> bool {
        let Some(Slot::List(list)) = self.sessions.get_mut(&id) else {
            return false;
        };
        let events = list.set_filter(&mut self.ctx, filter);
        self.push_list(id, events);
        true
    }

    /// Optimistically set an object property, with an optional callback for
    /// the server's answer.
    pub fn set_property(
        &mut self,
        id: SessionId,
        key: &str,
        value: Value,
        callback: Option<WriteCallback>,
    ) -> Result<(), SessionError> {
        let Some(Slot::Object(object)) = self.sessions.get_mut(&id) else {
            return Err(SessionError::NotAnObject(id.0));
        };
        let event = match callback {
            Some(callback) => object.set_with_callback(&mut self.ctx, key, value, callback)?,
            None => object.set(&mut self.ctx, key, value)?,
        };
        self.events.push_back(ClientEvent::Object { session: id, event });
        Ok(())
    }

    /// Remove a resource and close its channel.
    pub fn remove_session(&mut self, id: SessionId) -> bool {
        match self.sessions.remove(&id) {
            Some(Slot::List(mut list)) => {
                list.close(&mut self.ctx);
                true
            }
            Some(Slot::Object(mut object)) => {
                object.close(&mut self.ctx);
                true
            }
            None => false,
        }
    }

    /// A list resource.
    pub fn list(&self, id: SessionId) -> Option<&SyncList> {
        match self.sessions.get(&id) {
            Some(Slot::List(list)) => Some(list),
            _ => None,
        }
    }

    /// An object resource.
    pub fn object(&self, id: SessionId) -> Option<&SyncObject> {
        match self.sessions.get(&id) {
            Some(Slot::Object(object)) => Some(object),
            _ => None,
        }
    }

    /// A list resource together with the context its writes need.
    pub fn list_mut(&mut self, id: SessionId) -> Option<(&mut SyncList, &mut Context)> {
        match self.sessions.get_mut(&id) {
            Some(Slot::List(list)) => Some((list, &mut self.ctx)),
            _ => None,
        }
    }

    /// An object resource together with the context its writes need.
    pub fn object_mut(&mut self, id: SessionId) -> Option<(&mut SyncObject, &mut Context)> {
        match self.sessions.get_mut(&id) {
            Some(Slot::Object(object)) => Some((object, &mut self.ctx)),
            _ => None,
        }
    }

    /// Session state of any resource.
    pub fn session_state(&self, id: SessionId) -> Option<SessionState> {
        match self.sessions.get(&id)? {
            Slot::List(list) => Some(list.state()),
            Slot::Object(object) => Some(object.state()),
        }
    }

    /// Send a payload on a channel no session owns (e.g. an incoming one).
    pub fn send_payload(&mut self, channel: &ChannelId, payload: Value) -> Result<(), ChannelError> {
        self.ctx.link.send_payload(channel, payload)
    }

    /// Configure link keepalive. A zero interval disables it.
    pub fn set_keep_alive(&mut self, interval: Duration, timeout: Duration, now: Instant) {
        self.ctx.link.set_keep_alive(interval, timeout, now);
    }

    /// The socket opened.
    pub fn socket_connected(&mut self, now: Instant) {
        let events = self.ctx.link.socket_connected(now);
        self.route(events);
    }

    /// The socket closed.
    pub fn socket_disconnected(&mut self) {
        let events = self.ctx.link.socket_disconnected();
        self.route(events);
    }

    /// Soft reset: every channel re-registers without reopening the socket.
    pub fn reset(&mut self) {
        let events = self.ctx.link.reset();
        self.route(events);
    }

    /// One inbound socket message.
    pub fn handle_message(&mut self, now: Instant, bytes: &[u8]) {
        let events = self.ctx.link.handle_message(now, bytes);
        self.route(events);
    }

    /// Fire expired timers.
    pub fn poll(&mut self, now: Instant) {
        let events = self.ctx.link.poll(now);
        self.route(events);
    }

    /// When [`Client::poll`] next needs to run.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.ctx.link.next_deadline()
    }

    /// Take every queued outbound message.
    pub fn take_outgoing(&mut self) -> Vec<String> {
        self.ctx.link.take_outgoing()
    }

    /// Take every queued event.
    pub fn drain_events(&mut self) -> Vec<ClientEvent> {
        self.events.drain(..).collect()
    }

    fn owner_of(&self, channel: &ChannelId) -> Option<SessionId> {
        self.sessions.iter().find_map(|(id, slot)| {
            let session = match slot {
                Slot::List(list) => list.session(),
                Slot::Object(object) => object.session(),
            };
            (session.channel() == Some(channel)).then_some(*id)
        })
    }

    fn route(&mut self, events: Vec<LinkEvent>) {
        for event in events {
            match event {
                LinkEvent::Connected => self.events.push_back(ClientEvent::LinkConnected),
                LinkEvent::Disconnected => self.events.push_back(ClientEvent::LinkDisconnected),
                LinkEvent::IncomingChannel(channel) => {
                    self.events.push_back(ClientEvent::IncomingChannel(channel));
                }
                LinkEvent::Channel { id: channel, event } => match self.owner_of(&channel) {
                    Some(session) => {
                        with_slot!(self, session, |res, ctx| res.handle_channel_event(ctx, event));
                    }
                    None => self.unowned_channel_event(channel, event),
                },
            }
        }
    }

    fn unowned_channel_event(&mut self, channel: ChannelId, event: ChannelEvent) {
        let event = match event {
            ChannelEvent::Payload(payload) => ClientEvent::ChannelPayload { channel, payload },
            ChannelEvent::Connected => ClientEvent::ChannelState {
                channel,
                connected: true,
            },
            ChannelEvent::Disconnected => ClientEvent::ChannelState {
                channel,
                connected: false,
            },
        };
        self.events.push_back(event);
    }

    fn push_list(&mut self, session: SessionId, events: Vec<ReplicaEvent<ListEvent>>) {
        for event in events {
            let event = match event {
                ReplicaEvent::State(state) => ClientEvent::SessionState { session, state },
                ReplicaEvent::Attached(attached) => ClientEvent::Attached { session, attached },
                ReplicaEvent::Replica(event) => ClientEvent::List { session, event },
            };
            self.events.push_back(event);
        }
    }

    fn push_object(&mut self, session: SessionId, events: Vec<ReplicaEvent<ObjectEvent>>) {
        for event in events {
            let event = match event {
                ReplicaEvent::State(state) => ClientEvent::SessionState { session, state },
                ReplicaEvent::Attached(attached) => ClientEvent::Attached { session, attached },
                ReplicaEvent::Replica(event) => ClientEvent::Object { session, event },
            };
            self.events.push_back(event);
        }
    }
}
