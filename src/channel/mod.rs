//! Logical channels multiplexed over one physical link.
//!
//! Each channel is one independent conversation identified by a
//! [`ChannelId`]. Channels never touch the socket; they hand frames to the
//! link's [`Wire`] and react to frames the link routes to them by `uuid`.
//!
//! # Architecture
//!
//! ```text
//! PhysicalLink
//!     │  dispatch by "uuid"
//!     ├── Channel (active)   register ──────────▶ peer
//!     │                      ◀────────── registered
//!     │
//!     └── Channel (passive)  ◀────────── register (unknown uuid)
//!                            registered ────────▶ peer
//! ```
//!
//! # Handshake
//!
//! | Frame                   | Effect on receiver                      |
//! |-------------------------|-----------------------------------------|
//! | `connection:register`   | reply `connection:registered`, CONNECTED |
//! | `connection:registered` | CONNECTED                               |
//! | `connection:close`      | reply `connection:closed`, DISCONNECTED |
//! | `connection:closed`     | DISCONNECTED                            |
//! | `send`                  | payload surfaced as [`ChannelEvent::Payload`] |
//!
//! Rust guideline compliant 2025-01

use serde_json::Value;

use crate::frame::{self, Frame};
use crate::link::Wire;

/// Channel identifier, generated locally or received from the peer.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct ChannelId(pub String);

impl ChannelId {
    /// Generate a fresh random identifier.
    pub fn generate() -> Self {
        Self(frame::new_uuid())
    }

    /// The raw identifier string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Truncate to 8 characters; peer ids may be any UTF-8
        match self.0.char_indices().nth(8) {
            Some((end, _)) => write!(f, "{}...", &self.0[..end]),
            None => write!(f, "{}", self.0),
        }
    }
}

impl From<String> for ChannelId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ChannelId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for ChannelId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Connection state of a single channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelState {
    /// Not registered with the peer.
    #[default]
    Disconnected,
    /// `connection:register` sent, waiting for `connection:registered`.
    Connecting,
    /// Registered; payloads flow.
    Connected,
}

/// Who opened the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Opened locally; re-registers whenever the link reconnects.
    Active,
    /// Opened by the peer; waits for the peer to register again.
    Passive,
}

/// Notifications a channel raises to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// The channel became CONNECTED.
    Connected,
    /// The channel dropped to DISCONNECTED.
    Disconnected,
    /// A `send` frame arrived; the payload is opaque at this layer.
    Payload(Value),
}

/// Errors that can occur during channel operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// No channel with this id is registered on the link.
    UnknownChannel(ChannelId),
    /// The channel exists but is not CONNECTED.
    NotConnected(ChannelId),
}

impl std::fmt::Display for ChannelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownChannel(id) => write!(f, "Unknown channel: {id}"),
            Self::NotConnected(id) => write!(f, "Channel not connected: {id}"),
        }
    }
}

impl std::error::Error for ChannelError {}

/// One logical conversation over the physical link.
#[derive(Debug)]
pub struct Channel {
    id: ChannelId,
    origin: Origin,
    state: ChannelState,
}

impl Channel {
    /// A locally opened channel. Starts DISCONNECTED until [`Channel::open`].
    pub fn active(id: ChannelId) -> Self {
        Self {
            id,
            origin: Origin::Active,
            state: ChannelState::Disconnected,
        }
    }

    /// A channel created for a peer-initiated `connection:register`.
    pub fn passive(id: ChannelId) -> Self {
        Self {
            id,
            origin: Origin::Passive,
            state: ChannelState::Disconnected,
        }
    }

    /// Channel identifier.
    pub fn id(&self) -> &ChannelId {
        &self.id
    }

    /// Current state.
    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Whether payloads can be sent.
    pub fn is_connected(&self) -> bool {
        self.state == ChannelState::Connected
    }

    /// Send `connection:register` unless already connecting or connected.
    pub fn open(&mut self, wire: &mut Wire) {
        if self.state != ChannelState::Disconnected || !wire.is_connected() {
            return;
        }
        self.state = ChannelState::Connecting;
        log::debug!("[Channel] Registering {}", self.id);
        wire.send(&self.control(frame::REGISTER));
    }

    /// Ask the peer to close the channel.
    ///
    /// The local state changes only once the peer answers with
    /// `connection:closed`.
    pub fn close(&mut self, wire: &mut Wire) {
        if self.state == ChannelState::Disconnected {
            return;
        }
        log::debug!("[Channel] Closing {}", self.id);
        wire.send(&self.control(frame::CLOSE));
    }

    /// Wrap `payload` in a `send` envelope.
    pub fn send_payload(&self, wire: &mut Wire, payload: Value) -> Result<(), ChannelError> {
        if self.state != ChannelState::Connected {
            return Err(ChannelError::NotConnected(self.id.clone()));
        }
        let frame = self.control(frame::SEND).with("payload", payload);
        wire.send(&frame);
        Ok(())
    }

    /// Process a frame the link routed to this channel.
    pub fn handle_frame(&mut self, wire: &mut Wire, frame: Frame) -> Option<ChannelEvent> {
        match frame.command.as_str() {
            frame::SEND => {
                let payload = frame.fields.get("payload").cloned().unwrap_or(Value::Null);
                Some(ChannelEvent::Payload(payload))
            }
            frame::REGISTER => {
                wire.send(&self.control(frame::REGISTERED));
                self.set_state(ChannelState::Connected)
            }
            frame::REGISTERED => self.set_state(ChannelState::Connected),
            frame::CLOSE => {
                wire.send(&self.control(frame::CLOSED));
                self.set_state(ChannelState::Disconnected)
            }
            frame::CLOSED => self.set_state(ChannelState::Disconnected),
            other => {
                log::trace!("[Channel] {} ignoring command {other}", self.id);
                None
            }
        }
    }

    /// The link connected (or was soft-reset). Active channels re-register.
    pub fn link_connected(&mut self, wire: &mut Wire) {
        if self.origin == Origin::Active {
            self.open(wire);
        }
    }

    /// The link dropped. Every channel falls back to DISCONNECTED.
    pub fn link_disconnected(&mut self) -> Option<ChannelEvent> {
        self.set_state(ChannelState::Disconnected)
    }

    fn set_state(&mut self, state: ChannelState) -> Option<ChannelEvent> {
        if self.state == state {
            return None;
        }
        self.state = state;
        log::debug!("[Channel] {} -> {:?}", self.id, state);
        match state {
            ChannelState::Connected => Some(ChannelEvent::Connected),
            ChannelState::Disconnected => Some(ChannelEvent::Disconnected),
            ChannelState::Connecting => None,
        }
    }

    fn control(&self, command: &str) -> Frame {
        Frame::new(command).with("uuid", self.id.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn connected_wire() -> Wire {
        let mut wire = Wire::default();
        wire.set_connected(true);
        wire
    }

    fn sent(wire: &mut Wire) -> Vec<Value> {
        wire.drain()
            .map(|s| serde_json::from_str(&s).unwrap())
            .collect()
    }

    #[test]
    fn test_channel_id_display_truncates() {
        let id = ChannelId::from("0123456789abcdef");
        assert_eq!(id.to_string(), "01234567...");
        assert_eq!(ChannelId::from("short").to_string(), "short");
        assert_eq!(ChannelId::from("exactly8").to_string(), "exactly8");
    }

    #[test]
    fn test_channel_id_display_non_ascii() {
        // 'é' straddles byte 8
        let id = ChannelId::from("abcdefgééé");
        assert_eq!(id.to_string(), "abcdefgé...");
        assert_eq!(ChannelId::from("ééé").to_string(), "ééé");
        let err = ChannelError::UnknownChannel(id);
        assert_eq!(err.to_string(), "Unknown channel: abcdefgé...");
    }

    #[test]
    fn test_active_open_register_registered_round_trip() {
        let mut wire = connected_wire();
        let mut channel = Channel::active(ChannelId::from("X"));

        channel.open(&mut wire);
        assert_eq!(channel.state(), ChannelState::Connecting);
        assert_eq!(
            sent(&mut wire),
            vec![json!({"command": "connection:register", "uuid": "X"})]
        );

        let event = channel.handle_frame(
            &mut wire,
            Frame::new(frame::REGISTERED).with("uuid", "X"),
        );
        assert_eq!(event, Some(ChannelEvent::Connected));
        assert_eq!(channel.state(), ChannelState::Connected);
        assert!(sent(&mut wire).is_empty());
    }

    #[test]
    fn test_open_is_idempotent_while_connecting() {
        let mut wire = connected_wire();
        let mut channel = Channel::active(ChannelId::from("X"));
        channel.open(&mut wire);
        channel.open(&mut wire);
        assert_eq!(sent(&mut wire).len(), 1);
    }

    #[test]
    fn test_open_without_link_does_nothing() {
        let mut wire = Wire::default();
        let mut channel = Channel::active(ChannelId::from("X"));
        channel.open(&mut wire);
        assert_eq!(channel.state(), ChannelState::Disconnected);
        assert!(sent(&mut wire).is_empty());
    }

    #[test]
    fn test_passive_register_replies_registered() {
        let mut wire = connected_wire();
        let mut channel = Channel::passive(ChannelId::from("P"));
        let event = channel.handle_frame(&mut wire, Frame::new(frame::REGISTER).with("uuid", "P"));
        assert_eq!(event, Some(ChannelEvent::Connected));
        assert_eq!(
            sent(&mut wire),
            vec![json!({"command": "connection:registered", "uuid": "P"})]
        );
    }

    #[test]
    fn test_close_waits_for_closed() {
        let mut wire = connected_wire();
        let mut channel = Channel::active(ChannelId::from("X"));
        channel.open(&mut wire);
        channel.handle_frame(&mut wire, Frame::new(frame::REGISTERED));
        sent(&mut wire);

        channel.close(&mut wire);
        assert_eq!(
            sent(&mut wire),
            vec![json!({"command": "connection:close", "uuid": "X"})]
        );
        assert!(channel.is_connected());

        let event = channel.handle_frame(&mut wire, Frame::new(frame::CLOSED));
        assert_eq!(event, Some(ChannelEvent::Disconnected));
        assert_eq!(channel.state(), ChannelState::Disconnected);
    }

    #[test]
    fn test_peer_close_replies_closed() {
        let mut wire = connected_wire();
        let mut channel = Channel::passive(ChannelId::from("P"));
        channel.handle_frame(&mut wire, Frame::new(frame::REGISTER));
        sent(&mut wire);

        let event = channel.handle_frame(&mut wire, Frame::new(frame::CLOSE));
        assert_eq!(event, Some(ChannelEvent::Disconnected));
        assert_eq!(
            sent(&mut wire),
            vec![json!({"command": "connection:closed", "uuid": "P"})]
        );
    }

    #[test]
    fn test_send_payload_requires_connected() {
        let mut wire = connected_wire();
        let mut channel = Channel::active(ChannelId::from("X"));
        assert_eq!(
            channel.send_payload(&mut wire, json!(1)),
            Err(ChannelError::NotConnected(ChannelId::from("X")))
        );

        channel.open(&mut wire);
        channel.handle_frame(&mut wire, Frame::new(frame::REGISTERED));
        sent(&mut wire);

        channel.send_payload(&mut wire, json!({"hello": true})).unwrap();
        assert_eq!(
            sent(&mut wire),
            vec![json!({"command": "send", "uuid": "X", "payload": {"hello": true}})]
        );
    }

    #[test]
    fn test_inbound_send_surfaces_payload() {
        let mut wire = connected_wire();
        let mut channel = Channel::active(ChannelId::from("X"));
        let event = channel.handle_frame(
            &mut wire,
            Frame::new(frame::SEND).with("payload", json!({"k": "v"})),
        );
        assert_eq!(event, Some(ChannelEvent::Payload(json!({"k": "v"}))));
    }

    #[test]
    fn test_link_reconnect_reopens_active_only() {
        let mut wire = connected_wire();
        let mut active = Channel::active(ChannelId::from("A"));
        let mut passive = Channel::passive(ChannelId::from("P"));
        active.open(&mut wire);
        active.handle_frame(&mut wire, Frame::new(frame::REGISTERED));
        passive.handle_frame(&mut wire, Frame::new(frame::REGISTER));
        sent(&mut wire);

        assert_eq!(active.link_disconnected(), Some(ChannelEvent::Disconnected));
        assert_eq!(passive.link_disconnected(), Some(ChannelEvent::Disconnected));

        active.link_connected(&mut wire);
        passive.link_connected(&mut wire);
        assert_eq!(active.state(), ChannelState::Connecting);
        assert_eq!(passive.state(), ChannelState::Disconnected);
        assert_eq!(
            sent(&mut wire),
            vec![json!({"command": "connection:register", "uuid": "A"})]
        );
    }
}
