//! Synchub - multiplexed resource synchronization over one WebSocket.
//!
//! A single physical link carries many logical channels. Each channel hosts
//! a resource session that attaches to a server-side resource (a list or an
//! object) and keeps a local replica in sync with it.
//!
//! # Architecture
//!
//! ```text
//!  runner (tokio, socket, timers)
//!     │
//!     ▼
//!  Client ── Context { PhysicalLink, AuthState }
//!     │            │
//!     │            └── Channel * N   (connection:register / send / close)
//!     ▼
//!  SyncedResource<H> = ResourceSession + ResourceHandler
//!     ├── SyncList   (synclist:*)
//!     └── SyncObject (object:*)
//! ```
//!
//! The protocol core (`link`, `channel`, `session`, `replica`, `client`) is
//! socket-free: it consumes bytes and instants and produces frames and
//! events. Only [`runner`] and [`ws`] touch the network.
//!
//! # Modules
//!
//! - [`frame`] - JSON control frames
//! - [`link`] - the physical link, keepalive and channel table
//! - [`channel`] - logical channel state machine
//! - [`session`] - attach/detach resource sessions
//! - [`replica`] - list and object replicas
//! - [`client`] - the explicit context tying it together
//! - [`runner`] - async WebSocket driver
//! - [`config`] - configuration loading/saving

// Library modules
pub mod channel;
pub mod client;
pub mod config;
pub mod context;
pub mod frame;
pub mod link;
pub mod replica;
pub mod runner;
pub mod session;
pub mod ws;

// Re-export commonly used types
pub use channel::{ChannelError, ChannelEvent, ChannelId, ChannelState};
pub use client::{Client, ClientEvent, SessionId};
pub use config::Config;
pub use context::{AuthState, Context};
pub use frame::Frame;
pub use link::{LinkEvent, PhysicalLink};
pub use replica::{
    ListChange, ListEvent, ListReplica, ObjectEvent, ObjectReplica, ReplicaItem, SyncList, SyncObject, WriteError,
};
pub use runner::{ClientHandle, RunnerConfig};
pub use session::{ResourceSession, SessionError, SessionState};
