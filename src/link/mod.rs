//! The physical link: one socket, many logical channels.
//!
//! `PhysicalLink` is a socket-free protocol core. The runner feeds it socket
//! lifecycle changes, inbound messages and the current time, and drains the
//! outgoing frames it produces. Keeping I/O out of this layer makes every
//! transition synchronous and testable without a network.
//!
//! # Architecture
//!
//! ```text
//!            socket bytes                         outgoing JSON
//!                 │                                     ▲
//!                 ▼                                     │
//! ┌────────────────────────────────────────────────────────────┐
//! │ PhysicalLink                                               │
//! │   KeepAlive ── ping / timeout                              │
//! │   dispatch:                                                │
//! │     ping            → pong                                 │
//! │     uuid known      → Channel::handle_frame                │
//! │     register, new   → passive Channel + IncomingChannel    │
//! │     anything else   → dropped                              │
//! │   Wire ── outbox, no-op while disconnected                 │
//! └────────────────────────────────────────────────────────────┘
//!                 │
//!                 ▼
//!            LinkEvent
//! ```
//!
//! Rust guideline compliant 2025-01

pub mod keepalive;

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use serde_json::Value;

use crate::channel::{Channel, ChannelError, ChannelEvent, ChannelId, ChannelState};
use crate::frame::{self, Frame};

pub use keepalive::{KeepAlive, KeepAliveAction, DEFAULT_TIMEOUT};

/// Outbox shared by the link and its channels.
///
/// Sending while disconnected silently drops the frame.
#[derive(Debug, Default)]
pub struct Wire {
    connected: bool,
    queue: VecDeque<String>,
}

impl Wire {
    /// Whether the underlying socket is up.
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub(crate) fn set_connected(&mut self, connected: bool) {
        self.connected = connected;
        if !connected {
            self.queue.clear();
        }
    }

    /// Queue a frame as compact JSON. Returns `false` if it was dropped.
    pub fn send(&mut self, frame: &Frame) -> bool {
        if !self.connected {
            log::trace!("[Link] Dropping {} while disconnected", frame.command);
            return false;
        }
        self.queue.push_back(frame.to_json());
        true
    }

    /// Take every queued message in send order.
    pub fn drain(&mut self) -> impl Iterator<Item = String> + '_ {
        self.queue.drain(..)
    }
}

/// Notifications raised by the link.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// The link is up (socket opened or soft reset).
    Connected,
    /// The link is down (socket closed, keepalive timeout, or soft reset).
    Disconnected,
    /// The peer opened a channel we did not know about.
    IncomingChannel(ChannelId),
    /// A channel-level notification.
    Channel {
        /// Channel that raised the event.
        id: ChannelId,
        /// The event itself.
        event: ChannelEvent,
    },
}

/// Socket-free multiplexing transport.
#[derive(Debug)]
pub struct PhysicalLink {
    wire: Wire,
    keepalive: Option<KeepAlive>,
    channels: HashMap<ChannelId, Channel>,
}

impl Default for PhysicalLink {
    fn default() -> Self {
        Self::new()
    }
}

impl PhysicalLink {
    /// A disconnected link with keepalive disabled.
    pub fn new() -> Self {
        Self {
            wire: Wire::default(),
            keepalive: None,
            channels: HashMap::new(),
        }
    }

    /// Whether the link is up.
    pub fn is_connected(&self) -> bool {
        self.wire.is_connected()
    }

    /// Configure keepalive. A zero `interval` disables it.
    pub fn set_keep_alive(&mut self, interval: Duration, timeout: Duration, now: Instant) {
        if interval.is_zero() {
            log::debug!("[Link] Keepalive disabled");
            self.keepalive = None;
            return;
        }
        log::debug!("[Link] Keepalive every {interval:?}, timeout {timeout:?}");
        let mut keepalive = KeepAlive::new(interval, timeout);
        if self.is_connected() {
            keepalive.start(now);
        }
        self.keepalive = Some(keepalive);
    }

    /// Current keepalive configuration.
    pub fn keep_alive(&self) -> Option<&KeepAlive> {
        self.keepalive.as_ref()
    }

    /// The socket finished opening.
    pub fn socket_connected(&mut self, now: Instant) -> Vec<LinkEvent> {
        if self.is_connected() {
            return Vec::new();
        }
        log::info!("[Link] Connected");
        self.wire.set_connected(true);
        if let Some(keepalive) = self.keepalive.as_mut() {
            keepalive.start(now);
        }
        let events = vec![LinkEvent::Connected];
        self.reopen_channels();
        events
    }

    /// The socket closed or failed.
    pub fn socket_disconnected(&mut self) -> Vec<LinkEvent> {
        if !self.is_connected() {
            return Vec::new();
        }
        log::info!("[Link] Disconnected");
        self.wire.set_connected(false);
        if let Some(keepalive) = self.keepalive.as_mut() {
            keepalive.stop();
        }
        let mut events = vec![LinkEvent::Disconnected];
        events.extend(self.drop_channels());
        events
    }

    /// Re-announce connectivity without touching the socket.
    ///
    /// Every channel sees a disconnect and active channels re-register. This
    /// is a re-registration trigger, not a server-side session reset.
    pub fn reset(&mut self) -> Vec<LinkEvent> {
        if !self.is_connected() {
            return Vec::new();
        }
        log::info!("[Link] Soft reset");
        let mut events = vec![LinkEvent::Disconnected];
        events.extend(self.drop_channels());
        events.push(LinkEvent::Connected);
        self.reopen_channels();
        events
    }

    /// Process one inbound socket message.
    pub fn handle_message(&mut self, now: Instant, bytes: &[u8]) -> Vec<LinkEvent> {
        if !self.is_connected() {
            return Vec::new();
        }
        let Some(frame) = Frame::parse(bytes) else {
            return Vec::new();
        };

        if let Some(keepalive) = self.keepalive.as_mut() {
            keepalive.on_frame(now);
            if frame.command == frame::PONG {
                return Vec::new();
            }
        }

        if frame.command == frame::PING {
            self.wire.send(&Frame::new(frame::PONG));
            return Vec::new();
        }

        let Some(uuid) = frame.uuid().map(ChannelId::from) else {
            log::trace!("[Link] Dropping {} without uuid", frame.command);
            return Vec::new();
        };

        if let Some(channel) = self.channels.get_mut(&uuid) {
            return channel
                .handle_frame(&mut self.wire, frame)
                .map(|event| LinkEvent::Channel { id: uuid, event })
                .into_iter()
                .collect();
        }

        if frame.command == frame::REGISTER && !uuid.as_str().is_empty() {
            log::debug!("[Link] Incoming channel {uuid}");
            let mut channel = Channel::passive(uuid.clone());
            let mut events = vec![LinkEvent::IncomingChannel(uuid.clone())];
            if let Some(event) = channel.handle_frame(&mut self.wire, frame) {
                events.push(LinkEvent::Channel {
                    id: uuid.clone(),
                    event,
                });
            }
            self.channels.insert(uuid, channel);
            return events;
        }

        log::debug!("[Link] Dropping {} for unknown channel {uuid}", frame.command);
        Vec::new()
    }

    /// Fire expired keepalive timers.
    pub fn poll(&mut self, now: Instant) -> Vec<LinkEvent> {
        if !self.is_connected() {
            return Vec::new();
        }
        let action = self.keepalive.as_mut().and_then(|k| k.poll(now));
        match action {
            Some(KeepAliveAction::SendPing) => {
                log::trace!("[Link] Sending ping");
                self.wire.send(&Frame::new(frame::PING));
                Vec::new()
            }
            Some(KeepAliveAction::TimedOut) => {
                log::warn!("[Link] Keepalive timed out");
                self.socket_disconnected()
            }
            None => Vec::new(),
        }
    }

    /// When [`PhysicalLink::poll`] next needs to run.
    pub fn next_deadline(&self) -> Option<Instant> {
        if !self.is_connected() {
            return None;
        }
        self.keepalive.as_ref().and_then(KeepAlive::next_deadline)
    }

    /// Send a raw frame. No-op (returns `false`) while disconnected.
    pub fn send(&mut self, frame: &Frame) -> bool {
        self.wire.send(frame)
    }

    /// Take every queued outbound message.
    pub fn take_outgoing(&mut self) -> Vec<String> {
        self.wire.drain().collect()
    }

    /// Open a new active channel. It registers immediately if the link is up.
    pub fn open_channel(&mut self) -> ChannelId {
        let id = ChannelId::generate();
        let mut channel = Channel::active(id.clone());
        channel.open(&mut self.wire);
        self.channels.insert(id.clone(), channel);
        id
    }

    /// Ask the peer to close a channel; it stays in the table.
    pub fn close_channel(&mut self, id: &ChannelId) -> Result<(), ChannelError> {
        let channel = self
            .channels
            .get_mut(id)
            .ok_or_else(|| ChannelError::UnknownChannel(id.clone()))?;
        channel.close(&mut self.wire);
        Ok(())
    }

    /// Destroy a channel, notifying the peer best-effort.
    pub fn remove_channel(&mut self, id: &ChannelId) -> bool {
        match self.channels.remove(id) {
            Some(mut channel) => {
                channel.close(&mut self.wire);
                true
            }
            None => false,
        }
    }

    /// Send a payload envelope on a channel.
    pub fn send_payload(&mut self, id: &ChannelId, payload: Value) -> Result<(), ChannelError> {
        let channel = self
            .channels
            .get(id)
            .ok_or_else(|| ChannelError::UnknownChannel(id.clone()))?;
        channel.send_payload(&mut self.wire, payload)
    }

    /// State of a channel, if it exists.
    pub fn channel_state(&self, id: &ChannelId) -> Option<ChannelState> {
        self.channels.get(id).map(Channel::state)
    }

    /// Number of channels in the dispatch table.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    fn drop_channels(&mut self) -> Vec<LinkEvent> {
        self.channels
            .iter_mut()
            .filter_map(|(id, channel)| {
                channel.link_disconnected().map(|event| LinkEvent::Channel {
                    id: id.clone(),
                    event,
                })
            })
            .collect()
    }

    fn reopen_channels(&mut self) {
        for channel in self.channels.values_mut() {
            channel.link_connected(&mut self.wire);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn outgoing(link: &mut PhysicalLink) -> Vec<Value> {
        link.take_outgoing()
            .iter()
            .map(|s| serde_json::from_str(s).unwrap())
            .collect()
    }

    fn connected() -> (PhysicalLink, Instant) {
        let mut link = PhysicalLink::new();
        let now = Instant::now();
        assert_eq!(link.socket_connected(now), vec![LinkEvent::Connected]);
        (link, now)
    }

    #[test]
    fn test_send_while_disconnected_is_noop() {
        let mut link = PhysicalLink::new();
        assert!(!link.send(&Frame::new("hello")));
        assert!(link.take_outgoing().is_empty());
    }

    #[test]
    fn test_malformed_input_dropped() {
        let (mut link, now) = connected();
        assert!(link.handle_message(now, b"{oops").is_empty());
        assert!(link.handle_message(now, br#"{"uuid":"x"}"#).is_empty());
        assert!(link.take_outgoing().is_empty());
    }

    #[test]
    fn test_ping_answered_with_pong() {
        let (mut link, now) = connected();
        assert!(link.handle_message(now, br#"{"command":"ping"}"#).is_empty());
        assert_eq!(outgoing(&mut link), vec![json!({"command": "pong"})]);
    }

    #[test]
    fn test_active_channel_round_trip() {
        let (mut link, now) = connected();
        let id = link.open_channel();
        assert_eq!(link.channel_state(&id), Some(ChannelState::Connecting));
        assert_eq!(
            outgoing(&mut link),
            vec![json!({"command": "connection:register", "uuid": id.as_str()})]
        );

        let msg = json!({"command": "connection:registered", "uuid": id.as_str()}).to_string();
        let events = link.handle_message(now, msg.as_bytes());
        assert_eq!(
            events,
            vec![LinkEvent::Channel {
                id: id.clone(),
                event: ChannelEvent::Connected
            }]
        );
        assert_eq!(link.channel_state(&id), Some(ChannelState::Connected));
    }

    #[test]
    fn test_channel_opened_before_connect_registers_on_connect() {
        let mut link = PhysicalLink::new();
        let id = link.open_channel();
        assert_eq!(link.channel_state(&id), Some(ChannelState::Disconnected));
        assert!(link.take_outgoing().is_empty());

        link.socket_connected(Instant::now());
        assert_eq!(
            outgoing(&mut link),
            vec![json!({"command": "connection:register", "uuid": id.as_str()})]
        );
    }

    #[test]
    fn test_incoming_register_creates_passive_channel() {
        let (mut link, now) = connected();
        let events = link.handle_message(now, br#"{"command":"connection:register","uuid":"P1"}"#);
        let id = ChannelId::from("P1");
        assert_eq!(
            events,
            vec![
                LinkEvent::IncomingChannel(id.clone()),
                LinkEvent::Channel {
                    id: id.clone(),
                    event: ChannelEvent::Connected
                },
            ]
        );
        assert_eq!(
            outgoing(&mut link),
            vec![json!({"command": "connection:registered", "uuid": "P1"})]
        );
        assert_eq!(link.channel_state(&id), Some(ChannelState::Connected));
    }

    #[test]
    fn test_unknown_uuid_non_register_dropped() {
        let (mut link, now) = connected();
        let events = link.handle_message(now, br#"{"command":"send","uuid":"nope","payload":1}"#);
        assert!(events.is_empty());
        assert_eq!(link.channel_count(), 0);
    }

    #[test]
    fn test_disconnect_drops_channels_and_reconnect_reregisters() {
        let (mut link, now) = connected();
        let id = link.open_channel();
        let msg = json!({"command": "connection:registered", "uuid": id.as_str()}).to_string();
        link.handle_message(now, msg.as_bytes());
        link.take_outgoing();

        let events = link.socket_disconnected();
        assert_eq!(
            events,
            vec![
                LinkEvent::Disconnected,
                LinkEvent::Channel {
                    id: id.clone(),
                    event: ChannelEvent::Disconnected
                },
            ]
        );
        assert!(link.socket_disconnected().is_empty());

        link.socket_connected(now);
        assert_eq!(
            outgoing(&mut link),
            vec![json!({"command": "connection:register", "uuid": id.as_str()})]
        );
    }

    #[test]
    fn test_reset_synthesizes_disconnect_then_connect() {
        let (mut link, now) = connected();
        let id = link.open_channel();
        let msg = json!({"command": "connection:registered", "uuid": id.as_str()}).to_string();
        link.handle_message(now, msg.as_bytes());
        link.take_outgoing();

        let events = link.reset();
        assert_eq!(events.first(), Some(&LinkEvent::Disconnected));
        assert_eq!(events.last(), Some(&LinkEvent::Connected));
        assert!(link.is_connected());
        assert_eq!(link.channel_state(&id), Some(ChannelState::Connecting));
        assert_eq!(outgoing(&mut link).len(), 1);
    }

    #[test]
    fn test_reset_while_disconnected_does_nothing() {
        let mut link = PhysicalLink::new();
        assert!(link.reset().is_empty());
    }

    #[test]
    fn test_keepalive_timeout_disconnects_exactly_once() {
        let (mut link, t0) = connected();
        let interval = Duration::from_millis(100);
        let timeout = Duration::from_millis(50);
        link.set_keep_alive(interval, timeout, t0);

        assert!(link.poll(t0 + interval).is_empty());
        assert_eq!(outgoing(&mut link), vec![json!({"command": "ping"})]);

        let events = link.poll(t0 + interval + timeout);
        assert_eq!(events, vec![LinkEvent::Disconnected]);
        assert!(!link.is_connected());
        assert!(link.poll(t0 + interval * 10).is_empty());
    }

    #[test]
    fn test_keepalive_any_frame_resets_timer_and_pong_swallowed() {
        let (mut link, t0) = connected();
        let interval = Duration::from_millis(100);
        link.set_keep_alive(interval, DEFAULT_TIMEOUT, t0);
        link.poll(t0 + interval);
        link.take_outgoing();

        let t1 = t0 + interval + Duration::from_millis(10);
        assert!(link.handle_message(t1, br#"{"command":"pong"}"#).is_empty());
        assert_eq!(link.next_deadline(), Some(t1 + interval));
        assert!(link.poll(t0 + interval + DEFAULT_TIMEOUT).is_empty());
        assert!(link.is_connected());
    }

    #[test]
    fn test_keepalive_zero_interval_disables() {
        let (mut link, now) = connected();
        link.set_keep_alive(Duration::ZERO, DEFAULT_TIMEOUT, now);
        assert!(link.keep_alive().is_none());
        assert_eq!(link.next_deadline(), None);
    }

    #[test]
    fn test_remove_channel_notifies_peer() {
        let (mut link, now) = connected();
        let id = link.open_channel();
        let msg = json!({"command": "connection:registered", "uuid": id.as_str()}).to_string();
        link.handle_message(now, msg.as_bytes());
        link.take_outgoing();

        assert!(link.remove_channel(&id));
        assert_eq!(
            outgoing(&mut link),
            vec![json!({"command": "connection:close", "uuid": id.as_str()})]
        );
        assert_eq!(link.channel_state(&id), None);
        assert!(!link.remove_channel(&id));
    }

    #[test]
    fn test_send_payload_unknown_channel() {
        let (mut link, _) = connected();
        let id = ChannelId::from("missing");
        assert_eq!(
            link.send_payload(&id, json!(1)),
            Err(ChannelError::UnknownChannel(id))
        );
    }
}
