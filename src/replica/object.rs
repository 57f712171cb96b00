//! Keyed object replica (`object`).
//!
//! A flat property map with a per-key metadata sidecar. Remote writes are
//! last-write-wins. Local writes are optimistic: applied immediately, sent,
//! and confirmed (or refused) later by `object:property:set:success` /
//! `object:property:set:failed`, matched by property key only.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::{ResourceHandler, ResourceMessage, SyncedResource};
use crate::context::Context;
use crate::session::{SessionError, SessionState};

/// Command namespace of object resources.
pub const RESOURCE_TYPE: &str = "object";

/// An object resource: session plus object replica.
pub type SyncObject = SyncedResource<ObjectReplica>;

/// Display metadata for one property.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PropertyMeta {
    /// Unit label, e.g. `°C`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    /// Human-readable description.
    #[serde(alias = "desc", skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Icon name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    /// Any other metadata field.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl PropertyMeta {
    fn set_field(&mut self, field: &str, value: Value) {
        let text = match &value {
            Value::String(s) => Some(s.clone()),
            Value::Null => None,
            other => Some(other.to_string()),
        };
        match field {
            "unit" => self.unit = text,
            "description" | "desc" => self.description = text,
            "icon" => self.icon = text,
            _ => {
                self.extra.insert(field.to_string(), value);
            }
        }
    }
}

/// A refused property write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteError {
    /// Server error code.
    pub code: String,
    /// Server error message.
    pub message: String,
}

impl std::fmt::Display for WriteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Write refused ({}): {}", self.code, self.message)
    }
}

impl std::error::Error for WriteError {}

/// Completion callback for a local property write.
pub type WriteCallback = Box<dyn FnOnce(Result<(), WriteError>) + Send>;

/// Notifications raised by an object replica.
#[derive(Debug, Clone, PartialEq)]
pub enum ObjectEvent {
    /// A property value changed, locally or remotely.
    PropertyChanged {
        /// Property key.
        key: String,
        /// New value.
        value: Value,
    },
    /// The server answered a local write.
    WriteResult {
        /// Property key.
        key: String,
        /// Outcome.
        result: Result<(), WriteError>,
    },
    /// Metadata of one property changed.
    MetaChanged {
        /// Property key.
        key: String,
    },
    /// Object-level metadata changed.
    MetadataChanged,
    /// An application event (`object:event`).
    Event(Value),
    /// All properties were discarded.
    Reset,
    /// The replica became (un)usable.
    InitializedChanged(bool),
}

/// Keyed replica of a server object.
#[derive(Default)]
pub struct ObjectReplica {
    values: BTreeMap<String, Value>,
    meta: BTreeMap<String, PropertyMeta>,
    metadata: Map<String, Value>,
    initialized: bool,
    callbacks: HashMap<String, WriteCallback>,
}

impl std::fmt::Debug for ObjectReplica {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectReplica")
            .field("values", &self.values)
            .field("meta", &self.meta)
            .field("metadata", &self.metadata)
            .field("initialized", &self.initialized)
            .field("pending_callbacks", &self.callbacks.len())
            .finish()
    }
}

impl ObjectReplica {
    /// Empty replica.
    pub fn new() -> Self {
        Self::default()
    }

    /// Value of a property.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// All property keys, sorted.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    /// All properties.
    pub fn values(&self) -> &BTreeMap<String, Value> {
        &self.values
    }

    /// Metadata of a property.
    pub fn meta(&self, key: &str) -> Option<&PropertyMeta> {
        self.meta.get(key)
    }

    /// Object-level metadata from the last dump.
    pub fn metadata(&self) -> &Map<String, Value> {
        &self.metadata
    }

    /// Whether the replica has received its dump.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Number of writes awaiting an answer that have a callback.
    pub fn pending_callbacks(&self) -> usize {
        self.callbacks.len()
    }

    /// Apply a local write before the server confirms it.
    pub(crate) fn apply_local(&mut self, key: &str, value: Value, callback: Option<WriteCallback>) -> ObjectEvent {
        if let Some(callback) = callback {
            self.callbacks.insert(key.to_string(), callback);
        }
        self.values.insert(key.to_string(), value.clone());
        ObjectEvent::PropertyChanged {
            key: key.to_string(),
            value,
        }
    }

    fn set_initialized(&mut self, initialized: bool, events: &mut Vec<ObjectEvent>) {
        if self.initialized != initialized {
            self.initialized = initialized;
            events.push(ObjectEvent::InitializedChanged(initialized));
        }
    }

    fn reset(&mut self, events: &mut Vec<ObjectEvent>) {
        if !self.callbacks.is_empty() {
            log::debug!("[SyncObject] Dropping {} pending write callbacks", self.callbacks.len());
            self.callbacks.clear();
        }
        if self.values.is_empty() && self.meta.is_empty() {
            return;
        }
        self.values.clear();
        self.meta.clear();
        events.push(ObjectEvent::Reset);
    }

    fn dump(&mut self, message: &ResourceMessage, events: &mut Vec<ObjectEvent>) {
        self.values.clear();
        self.meta.clear();
        events.push(ObjectEvent::Reset);

        if let Some(metadata) = message.param("metadata").and_then(Value::as_object) {
            self.metadata = metadata.clone();
            events.push(ObjectEvent::MetadataChanged);
        }

        let entries = message.data().and_then(Value::as_object).cloned().unwrap_or_default();
        for (key, entry) in entries {
            // Entries are {data, metadata}; bare values are accepted too
            let (value, meta) = match entry {
                Value::Object(mut map) if map.contains_key("data") => {
                    let value = map.remove("data").unwrap_or(Value::Null);
                    let meta = map
                        .remove("metadata")
                        .and_then(|m| PropertyMeta::deserialize(m).ok());
                    (value, meta)
                }
                other => (other, None),
            };
            if let Some(meta) = meta {
                self.meta.insert(key.clone(), meta);
            }
            self.values.insert(key.clone(), value.clone());
            events.push(ObjectEvent::PropertyChanged { key, value });
        }
        self.set_initialized(true, events);
    }

    fn meta_set(&mut self, message: &ResourceMessage, events: &mut Vec<ObjectEvent>) {
        let Some(parameters) = message.parameters.as_object() else {
            return;
        };
        for (key, fields) in parameters {
            let Some(fields) = fields.as_object() else {
                continue;
            };
            let meta = self.meta.entry(key.clone()).or_default();
            for (field, value) in fields {
                meta.set_field(field, value.clone());
            }
            events.push(ObjectEvent::MetaChanged { key: key.clone() });
        }
    }

    fn write_answered(&mut self, message: &ResourceMessage, success: bool, events: &mut Vec<ObjectEvent>) {
        let key = message.param_str("property").to_string();
        let result = if success {
            Ok(())
        } else {
            Err(WriteError {
                code: message.error_code(),
                message: message.error_string(),
            })
        };
        if let Err(e) = &result {
            log::warn!("[SyncObject] Write to {key} refused: {e}");
        }
        if let Some(callback) = self.callbacks.remove(&key) {
            callback(result.clone());
        }
        events.push(ObjectEvent::WriteResult { key, result });
    }
}

impl ResourceHandler for ObjectReplica {
    type Event = ObjectEvent;

    fn resource_type(&self) -> &'static str {
        RESOURCE_TYPE
    }

    fn on_message(&mut self, message: &ResourceMessage, _requests: &mut Vec<Value>) -> Vec<ObjectEvent> {
        let mut events = Vec::new();
        match message.command.as_str() {
            "object:dump" => self.dump(message, &mut events),
            "object:property:set" => {
                let key = message.param_str("property").to_string();
                let value = message.data().cloned().unwrap_or(Value::Null);
                self.values.insert(key.clone(), value.clone());
                events.push(ObjectEvent::PropertyChanged { key, value });
            }
            "object:property:set:success" => self.write_answered(message, true, &mut events),
            "object:property:set:failed" => self.write_answered(message, false, &mut events),
            "object:meta:set" => self.meta_set(message, &mut events),
            "object:event" => {
                let data = message.data().cloned().unwrap_or(Value::Null);
                events.push(ObjectEvent::Event(data));
            }
            other => log::debug!("[SyncObject] Ignoring {other}"),
        }
        events
    }

    fn on_session_state(&mut self, state: SessionState) -> Vec<ObjectEvent> {
        let mut events = Vec::new();
        if state != SessionState::Connected {
            self.set_initialized(false, &mut events);
        }
        if state == SessionState::Disconnected {
            self.reset(&mut events);
        }
        events
    }

    fn on_descriptor_changed(&mut self) -> Vec<ObjectEvent> {
        let mut events = Vec::new();
        self.set_initialized(false, &mut events);
        self.reset(&mut events);
        events
    }
}

/// Write operations.
impl SyncedResource<ObjectReplica> {
    /// Set a property optimistically.
    pub fn set(&mut self, ctx: &mut Context, key: &str, value: Value) -> Result<ObjectEvent, SessionError> {
        self.set_inner(ctx, key, value, None)
    }

    /// Set a property optimistically and get told when the server answers.
    ///
    /// A later write to the same key replaces the callback.
    pub fn set_with_callback(
        &mut self,
        ctx: &mut Context,
        key: &str,
        value: Value,
        callback: WriteCallback,
    ) -> Result<ObjectEvent, SessionError> {
        self.set_inner(ctx, key, value, Some(callback))
    }

    /// Change one metadata field of a property.
    pub fn set_metadata(&self, ctx: &mut Context, key: &str, field: &str, value: Value) -> Result<(), SessionError> {
        let mut fields = Map::new();
        fields.insert(field.to_string(), value);
        let mut parameters = Map::new();
        parameters.insert(key.to_string(), Value::Object(fields));
        self.send(ctx, json!({"command": "object:meta:set", "parameters": parameters}))
    }

    fn set_inner(
        &mut self,
        ctx: &mut Context,
        key: &str,
        value: Value,
        callback: Option<WriteCallback>,
    ) -> Result<ObjectEvent, SessionError> {
        self.send(
            ctx,
            json!({"command": "object:property:set", "parameters": {"property": key, "data": value}}),
        )?;
        Ok(self.replica_mut().apply_local(key, value, callback))
    }
}
