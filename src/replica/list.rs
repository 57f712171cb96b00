//! Ordered list replica (`synclist`).
//!
//! The replica holds a window of the server's list: the first `len()` items
//! out of `remote_count()`. Items are identified by uuid, never by position;
//! every positional operation from the server is reconciled against the uuid
//! it carries before it is applied.
//!
//! Server messages handled here:
//!
//! | Command                 | Effect                                              |
//! |-------------------------|-----------------------------------------------------|
//! | `synclist:init`         | metadata + count, then request dump or first page   |
//! | `synclist:dump`         | replace window and metadata with the full list      |
//! | `synclist:get`          | append a page to the window                         |
//! | `synclist:append`       | append if the window is complete; count + 1         |
//! | `synclist:appendlist`   | same for many items                                 |
//! | `synclist:insertat`     | insert at index (deduplicated by uuid)              |
//! | `synclist:remove`       | remove reconciled item                              |
//! | `synclist:set`          | replace reconciled item                             |
//! | `synclist:property:set` | set one property of reconciled item                 |
//! | `synclist:clear`        | empty list                                          |
//! | `synclist:delete`       | list deleted                                        |
//! | `synclist:metadata:set` | replace metadata                                    |
//!
//! A mutation with `reply: true` echoes this client's own write and raises
//! [`ListEvent::WriteSucceeded`] instead of [`ListEvent::Changed`]. The local
//! effect is identical.
//!
//! Rust guideline compliant 2025-01

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::{as_i64, ResourceHandler, ResourceMessage, SyncedResource};
use crate::context::Context;
use crate::session::{descriptor, SessionError, SessionState};

/// Command namespace of list resources.
pub const RESOURCE_TYPE: &str = "synclist";

/// A list resource: session plus list replica.
pub type SyncList = SyncedResource<ListReplica>;

/// One replicated list entry.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicaItem {
    /// Permanent identity, independent of position.
    pub uuid: String,
    /// Opaque item data.
    pub payload: Value,
    /// Server timestamp of the last change.
    pub last_update: Option<DateTime<Utc>>,
    /// Id of the user who last changed the item.
    pub author_id: String,
}

/// Wire shape of an item: `{uuid, data, userid, lastupdate}`.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ItemRecord {
    uuid: Value,
    data: Value,
    userid: Value,
    lastupdate: Value,
    timestamp: Value,
}

impl ReplicaItem {
    /// Decode a wire item. Anything that is not an item object becomes a
    /// uuid-less item carrying the raw value.
    pub fn from_wire(value: &Value) -> Self {
        let Ok(record) = ItemRecord::deserialize(value) else {
            return Self {
                uuid: String::new(),
                payload: value.clone(),
                last_update: None,
                author_id: String::new(),
            };
        };
        let stamp = if record.lastupdate.is_null() {
            &record.timestamp
        } else {
            &record.lastupdate
        };
        Self {
            uuid: stringify(&record.uuid),
            payload: record.data,
            last_update: as_i64(stamp).and_then(millis_to_datetime),
            author_id: stringify(&record.userid),
        }
    }
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn millis_to_datetime(millis: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis).single()
}

/// A change to list contents.
#[derive(Debug, Clone, PartialEq)]
pub enum ListChange {
    /// Items were added. `index` is `None` when they landed beyond the
    /// loaded window and only the remote count changed.
    Inserted {
        /// Window position of the first new item.
        index: Option<usize>,
        /// Number of items added.
        count: usize,
    },
    /// An item was removed.
    Removed {
        /// Window position it had.
        index: usize,
        /// Its uuid.
        uuid: String,
    },
    /// An item was replaced.
    Updated {
        /// Window position.
        index: usize,
    },
    /// One property of an item changed.
    PropertyChanged {
        /// Window position.
        index: usize,
        /// Property name.
        property: String,
        /// New value.
        value: Value,
    },
    /// The list was emptied.
    Cleared,
    /// The list was deleted on the server.
    Deleted,
}

/// Notifications raised by a list replica.
#[derive(Debug, Clone, PartialEq)]
pub enum ListEvent {
    /// Someone else changed the list.
    Changed(ListChange),
    /// The server applied a write this client made.
    WriteSucceeded(ListChange),
    /// The window was emptied locally (reset, init or dump).
    Reset,
    /// Items arrived from a dump or page request.
    ItemsLoaded {
        /// Window position of the first loaded item.
        index: usize,
        /// Number of items loaded.
        count: usize,
    },
    /// List metadata changed.
    MetadataChanged,
    /// The server-side item count changed.
    RemoteCountChanged(usize),
    /// The replica became (un)usable.
    InitializedChanged(bool),
}

/// Ordered replica of a server list with lazy pagination.
#[derive(Debug, Clone, Default)]
pub struct ListReplica {
    items: Vec<ReplicaItem>,
    remote_count: usize,
    preload_count: Option<usize>,
    initialized: bool,
    metadata: Map<String, Value>,
}

impl ListReplica {
    /// Empty replica that requests full dumps.
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty replica that loads `preload_count` items per page.
    pub fn with_preload(preload_count: usize) -> Self {
        Self {
            preload_count: Some(preload_count),
            ..Self::default()
        }
    }

    /// Items per page, `None` for full dumps.
    pub fn preload_count(&self) -> Option<usize> {
        self.preload_count
    }

    /// Change the page size.
    pub fn set_preload_count(&mut self, preload_count: Option<usize>) {
        self.preload_count = preload_count;
    }

    /// Loaded items.
    pub fn items(&self) -> &[ReplicaItem] {
        &self.items
    }

    /// Item at a window position.
    pub fn get(&self, index: usize) -> Option<&ReplicaItem> {
        self.items.get(index)
    }

    /// Number of loaded items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether nothing is loaded.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Number of items on the server.
    pub fn remote_count(&self) -> usize {
        self.remote_count
    }

    /// Whether the replica has received its initial contents.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// List metadata.
    pub fn metadata(&self) -> &Map<String, Value> {
        &self.metadata
    }

    /// Uuid at a window position.
    pub fn uuid_at(&self, index: usize) -> Option<&str> {
        self.items.get(index).map(|item| item.uuid.as_str())
    }

    /// Author at a window position.
    pub fn author_at(&self, index: usize) -> Option<&str> {
        self.items.get(index).map(|item| item.author_id.as_str())
    }

    /// Last update at a window position.
    pub fn last_update_at(&self, index: usize) -> Option<DateTime<Utc>> {
        self.items.get(index).and_then(|item| item.last_update)
    }

    /// Window position of `uuid`.
    pub fn index_of(&self, uuid: &str) -> Option<usize> {
        if uuid.is_empty() {
            return None;
        }
        self.items.iter().position(|item| item.uuid == uuid)
    }

    /// Whether more items exist on the server than are loaded.
    pub fn can_fetch_more(&self) -> bool {
        self.remote_count > self.items.len()
    }

    /// Resolve the current position of an item the server addressed by
    /// `hint` and `uuid`.
    ///
    /// An empty uuid trusts the hint. Otherwise the hint is used if the item
    /// there has `uuid`, and the window is scanned if it does not.
    pub fn reconcile_index(&self, hint: Option<i64>, uuid: &str) -> Option<usize> {
        let hint = hint
            .and_then(|h| usize::try_from(h).ok())
            .filter(|&h| h < self.items.len());
        if uuid.is_empty() {
            return hint;
        }
        if let Some(h) = hint {
            if self.items[h].uuid == uuid {
                return Some(h);
            }
        }
        let found = self.index_of(uuid);
        if found.is_none() {
            log::trace!("[SyncList] Reconciliation miss for {uuid}");
        }
        found
    }

    /// Request for the next page, or `None` if everything is loaded.
    pub fn fetch_more_request(&self) -> Option<Value> {
        let missing = self.remote_count.saturating_sub(self.items.len());
        if missing == 0 {
            return None;
        }
        let count = self.preload_count.map_or(missing, |p| p.min(missing));
        if count == 0 {
            return None;
        }
        Some(load_items_request(self.items.len(), count))
    }

    fn set_remote_count(&mut self, count: usize, events: &mut Vec<ListEvent>) {
        let count = count.max(self.items.len());
        if count != self.remote_count {
            self.remote_count = count;
            events.push(ListEvent::RemoteCountChanged(count));
        }
    }

    fn set_initialized(&mut self, initialized: bool, events: &mut Vec<ListEvent>) {
        if self.initialized != initialized {
            self.initialized = initialized;
            events.push(ListEvent::InitializedChanged(initialized));
        }
    }

    fn reset(&mut self, events: &mut Vec<ListEvent>) {
        self.items.clear();
        events.push(ListEvent::Reset);
    }

    fn decode_items(data: Option<&Value>) -> Vec<ReplicaItem> {
        data.and_then(Value::as_array)
            .map(|list| list.iter().map(ReplicaItem::from_wire).collect())
            .unwrap_or_default()
    }

    fn load(&mut self, items: Vec<ReplicaItem>, events: &mut Vec<ListEvent>) {
        let index = self.items.len();
        let count = items.len();
        self.items.extend(items);
        if count > 0 {
            events.push(ListEvent::ItemsLoaded { index, count });
        }
        let remote = self.remote_count;
        self.set_remote_count(remote, events);
    }

    fn apply(&mut self, message: &ResourceMessage, requests: &mut Vec<Value>) -> (Option<ListChange>, Vec<ListEvent>) {
        let mut events = Vec::new();
        let verb = message
            .command
            .strip_prefix(RESOURCE_TYPE)
            .and_then(|rest| rest.strip_prefix(':'))
            .unwrap_or_default();

        let change = match verb {
            "init" => {
                self.metadata = object_or_empty(message.param("metadata"));
                events.push(ListEvent::MetadataChanged);
                let count = message.param_i64("count").unwrap_or(-1);
                self.reset(&mut events);
                self.set_remote_count(usize::try_from(count).unwrap_or(0), &mut events);
                if count < 0 || self.preload_count.is_none() {
                    requests.push(dump_request());
                } else if let Some(request) = self.fetch_more_request() {
                    requests.push(request);
                } else {
                    self.set_initialized(true, &mut events);
                }
                None
            }
            "dump" => {
                let items = Self::decode_items(message.data());
                self.metadata = object_or_empty(message.param("metadata"));
                events.push(ListEvent::MetadataChanged);
                self.reset(&mut events);
                self.remote_count = 0;
                self.set_remote_count(items.len(), &mut events);
                self.load(items, &mut events);
                self.set_initialized(true, &mut events);
                None
            }
            "get" => {
                let items = Self::decode_items(message.data());
                self.load(items, &mut events);
                self.set_initialized(true, &mut events);
                None
            }
            "metadata:set" => {
                self.metadata = object_or_empty(message.param("metadata"));
                events.push(ListEvent::MetadataChanged);
                None
            }
            "delete" => {
                self.metadata.clear();
                events.push(ListEvent::MetadataChanged);
                self.items.clear();
                self.remote_count = 0;
                events.push(ListEvent::RemoteCountChanged(0));
                Some(ListChange::Deleted)
            }
            "clear" => {
                self.items.clear();
                self.remote_count = 0;
                events.push(ListEvent::RemoteCountChanged(0));
                Some(ListChange::Cleared)
            }
            "append" => {
                let item = message.data().map(ReplicaItem::from_wire);
                Some(self.append_items(item.into_iter().collect(), &mut events))
            }
            "appendlist" => {
                let items = Self::decode_items(message.data());
                Some(self.append_items(items, &mut events))
            }
            "insertat" => self.insert_at(message, &mut events),
            "remove" => {
                let uuid = message.param_str("uuid");
                let found = self.reconcile_index(message.param_i64("index"), uuid);
                let remote = self.remote_count.saturating_sub(1);
                let change = found.map(|index| {
                    let item = self.items.remove(index);
                    ListChange::Removed { index, uuid: item.uuid }
                });
                self.set_remote_count(remote, &mut events);
                change
            }
            "set" => {
                let found = self.reconcile_index(message.param_i64("index"), message.param_str("uuid"));
                found.map(|index| {
                    let mut item = message
                        .data()
                        .map(ReplicaItem::from_wire)
                        .unwrap_or_else(|| self.items[index].clone());
                    if item.uuid.is_empty() {
                        item.uuid = self.items[index].uuid.clone();
                    }
                    self.items[index] = item;
                    ListChange::Updated { index }
                })
            }
            "property:set" => {
                let found = self.reconcile_index(message.param_i64("index"), message.param_str("uuid"));
                found.map(|index| {
                    let property = message.param_str("property").to_string();
                    let value = message.data().cloned().unwrap_or(Value::Null);
                    let item = &mut self.items[index];
                    if let Some(stamp) = message.param_i64("lastupdate").and_then(millis_to_datetime) {
                        item.last_update = Some(stamp);
                    }
                    match &mut item.payload {
                        Value::Object(map) => {
                            map.insert(property.clone(), value.clone());
                        }
                        other => {
                            let mut map = Map::new();
                            map.insert(property.clone(), value.clone());
                            *other = Value::Object(map);
                        }
                    }
                    ListChange::PropertyChanged { index, property, value }
                })
            }
            other => {
                log::debug!("[SyncList] Ignoring {RESOURCE_TYPE}:{other}");
                None
            }
        };
        (change, events)
    }

    fn append_items(&mut self, items: Vec<ReplicaItem>, events: &mut Vec<ListEvent>) -> ListChange {
        let count = items.len();
        let index = if self.remote_count == self.items.len() {
            let index = self.items.len();
            self.items.extend(items);
            Some(index)
        } else {
            None
        };
        let remote = self.remote_count + count;
        self.set_remote_count(remote, events);
        ListChange::Inserted { index, count }
    }

    fn insert_at(&mut self, message: &ResourceMessage, events: &mut Vec<ListEvent>) -> Option<ListChange> {
        let Some(index) = message.param_i64("index").and_then(|i| usize::try_from(i).ok()) else {
            log::debug!("[SyncList] insertat without valid index");
            return None;
        };
        let item = message.data().map(ReplicaItem::from_wire)?;

        // Already known: the server is telling us about an item we hold.
        if let Some(existing) = self.index_of(&item.uuid) {
            self.items[existing] = item;
            return Some(ListChange::Updated { index: existing });
        }

        let position = if index <= self.items.len() {
            self.items.insert(index, item);
            Some(index)
        } else if self.items.len() == self.remote_count {
            self.items.push(item);
            Some(self.items.len() - 1)
        } else {
            None
        };
        let remote = self.remote_count + 1;
        self.set_remote_count(remote, events);
        Some(ListChange::Inserted { index: position, count: 1 })
    }
}

fn object_or_empty(value: Option<&Value>) -> Map<String, Value> {
    value.and_then(Value::as_object).cloned().unwrap_or_default()
}

fn dump_request() -> Value {
    json!({"command": "synclist:dump"})
}

fn load_items_request(from: usize, count: usize) -> Value {
    json!({"command": "synclist:get", "parameters": {"from": from, "count": count}})
}

impl ResourceHandler for ListReplica {
    type Event = ListEvent;

    fn resource_type(&self) -> &'static str {
        RESOURCE_TYPE
    }

    fn on_message(&mut self, message: &ResourceMessage, requests: &mut Vec<Value>) -> Vec<ListEvent> {
        let (change, mut events) = self.apply(message, requests);
        if let Some(change) = change {
            if message.is_reply() {
                events.push(ListEvent::WriteSucceeded(change));
            } else {
                events.push(ListEvent::Changed(change));
            }
        }
        events
    }

    fn on_session_state(&mut self, state: SessionState) -> Vec<ListEvent> {
        let mut events = Vec::new();
        if state != SessionState::Connected {
            self.set_initialized(false, &mut events);
        }
        if state == SessionState::Disconnected && (!self.items.is_empty() || self.remote_count > 0) {
            self.reset(&mut events);
            self.remote_count = 0;
            events.push(ListEvent::RemoteCountChanged(0));
        }
        events
    }

    fn on_descriptor_changed(&mut self) -> Vec<ListEvent> {
        let mut events = Vec::new();
        self.set_initialized(false, &mut events);
        self.reset(&mut events);
        if self.remote_count > 0 {
            self.remote_count = 0;
            events.push(ListEvent::RemoteCountChanged(0));
        }
        if !self.metadata.is_empty() {
            self.metadata.clear();
            events.push(ListEvent::MetadataChanged);
        }
        events
    }
}

fn to_value<T: Serialize>(value: &T) -> Result<Value, SessionError> {
    serde_json::to_value(value).map_err(|e| SessionError::Serialize(e.to_string()))
}

/// Write operations. Every write is a request; the replica only changes
/// when the server echoes it back.
impl SyncedResource<ListReplica> {
    /// Append one item.
    pub fn append<T: Serialize>(&self, ctx: &mut Context, item: &T) -> Result<(), SessionError> {
        let data = to_value(item)?;
        self.send(ctx, json!({"command": "synclist:append", "parameters": {"data": data}}))
    }

    /// Append many items.
    pub fn append_list<T: Serialize>(&self, ctx: &mut Context, items: &[T]) -> Result<(), SessionError> {
        let data = to_value(&items)?;
        self.send(ctx, json!({"command": "synclist:appendlist", "parameters": {"data": data}}))
    }

    /// Insert one item at `index`.
    pub fn insert_at<T: Serialize>(&self, ctx: &mut Context, index: usize, item: &T) -> Result<(), SessionError> {
        let data = to_value(item)?;
        self.send(
            ctx,
            json!({"command": "synclist:insertat", "parameters": {"index": index, "data": data}}),
        )
    }

    /// Replace the item at `index`.
    pub fn set<T: Serialize>(&self, ctx: &mut Context, index: usize, item: &T) -> Result<(), SessionError> {
        let data = to_value(item)?;
        let mut parameters = json!({"index": index, "data": data});
        if let Some(uuid) = self.replica().uuid_at(index) {
            parameters["uuid"] = Value::String(uuid.to_string());
        }
        self.send(ctx, json!({"command": "synclist:set", "parameters": parameters}))
    }

    /// Set one property of the item at `index`. Out-of-range indices are ignored.
    pub fn set_property<T: Serialize>(
        &self,
        ctx: &mut Context,
        index: usize,
        property: &str,
        value: &T,
    ) -> Result<(), SessionError> {
        let Some(uuid) = self.replica().uuid_at(index) else {
            return Ok(());
        };
        let data = to_value(value)?;
        self.send(
            ctx,
            json!({
                "command": "synclist:property:set",
                "parameters": {"index": index, "uuid": uuid, "property": property, "data": data}
            }),
        )
    }

    /// Remove the item at `index`. Out-of-range indices are ignored.
    pub fn remove(&self, ctx: &mut Context, index: usize) -> Result<(), SessionError> {
        let Some(uuid) = self.replica().uuid_at(index) else {
            return Ok(());
        };
        self.send(
            ctx,
            json!({"command": "synclist:remove", "parameters": {"index": index, "uuid": uuid}}),
        )
    }

    /// Empty the list.
    pub fn clear(&self, ctx: &mut Context) -> Result<(), SessionError> {
        self.send(ctx, json!({"command": "synclist:clear"}))
    }

    /// Delete the list.
    pub fn delete_list(&self, ctx: &mut Context) -> Result<(), SessionError> {
        self.send(ctx, json!({"command": "synclist:delete"}))
    }

    /// Replace list metadata.
    pub fn set_metadata(&self, ctx: &mut Context, metadata: Map<String, Value>) -> Result<(), SessionError> {
        self.send(
            ctx,
            json!({"command": "synclist:metadata:set", "parameters": {"metadata": metadata}}),
        )
    }

    /// Ask for the complete list.
    pub fn request_dump(&self, ctx: &mut Context) -> Result<(), SessionError> {
        self.send(ctx, dump_request())
    }

    /// Ask for `count` items starting at `from`.
    pub fn load_items(&self, ctx: &mut Context, from: usize, count: usize) -> Result<(), SessionError> {
        self.send(ctx, load_items_request(from, count))
    }

    /// Ask for the next page. Does nothing if everything is loaded.
    pub fn fetch_more(&self, ctx: &mut Context) -> Result<(), SessionError> {
        match self.replica().fetch_more_request() {
            Some(request) => self.send(ctx, request),
            None => Ok(()),
        }
    }

    /// Whether more items exist on the server than are loaded.
    pub fn can_fetch_more(&self) -> bool {
        self.replica().can_fetch_more()
    }

    /// Change the page size.
    pub fn set_preload_count(&mut self, preload_count: Option<usize>) {
        self.replica_mut().set_preload_count(preload_count);
    }

    /// Filter the list. This is a descriptor change: the session detaches,
    /// re-attaches with `<base>:<compact-json>` and the replica reloads.
    pub fn set_filter(&mut self, ctx: &mut Context, filter: &Value) -> Vec<super::ReplicaEvent<ListEvent>> {
        let base = descriptor::base(self.descriptor()).to_string();
        self.set_descriptor(ctx, descriptor::with_filter(&base, filter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(value: Value) -> ResourceMessage {
        ResourceMessage::decode(value).unwrap()
    }

    fn apply(replica: &mut ListReplica, value: Value) -> (Vec<ListEvent>, Vec<Value>) {
        let mut requests = Vec::new();
        let events = replica.on_message(&msg(value), &mut requests);
        (events, requests)
    }

    fn item(uuid: &str, x: i64) -> Value {
        json!({"uuid": uuid, "data": {"x": x}})
    }

    fn uuids(replica: &ListReplica) -> Vec<&str> {
        replica.items().iter().map(|i| i.uuid.as_str()).collect()
    }

    fn dumped(uuids: &[&str]) -> ListReplica {
        let mut replica = ListReplica::new();
        let data: Vec<Value> = uuids.iter().enumerate().map(|(i, u)| item(u, i as i64)).collect();
        apply(&mut replica, json!({"command": "synclist:dump", "parameters": {"data": data}}));
        replica
    }

    #[test]
    fn test_dump_fills_window_and_initializes() {
        let mut replica = ListReplica::new();
        let (events, requests) = apply(
            &mut replica,
            json!({
                "command": "synclist:dump",
                "parameters": {"data": [item("a1", 1), item("a2", 2)]}
            }),
        );
        assert!(requests.is_empty());
        assert_eq!(uuids(&replica), vec!["a1", "a2"]);
        assert_eq!(replica.remote_count(), 2);
        assert!(replica.is_initialized());
        assert_eq!(replica.get(1).unwrap().payload, json!({"x": 2}));
        assert!(events.contains(&ListEvent::ItemsLoaded { index: 0, count: 2 }));
        assert!(events.contains(&ListEvent::InitializedChanged(true)));
    }

    #[test]
    fn test_dump_without_metadata_clears_it() {
        let mut replica = ListReplica::new();
        apply(
            &mut replica,
            json!({"command": "synclist:dump", "parameters": {"data": [item("a", 1)], "metadata": {"k": 1}}}),
        );
        assert_eq!(replica.metadata().get("k"), Some(&json!(1)));

        let (events, _) = apply(
            &mut replica,
            json!({"command": "synclist:dump", "parameters": {"data": [item("b", 2)]}}),
        );
        assert!(replica.metadata().is_empty());
        assert!(events.contains(&ListEvent::MetadataChanged));
        assert_eq!(uuids(&replica), vec!["b"]);
    }

    #[test]
    fn test_item_metadata_decoded() {
        let mut replica = ListReplica::new();
        apply(
            &mut replica,
            json!({
                "command": "synclist:dump",
                "parameters": {"data": [{"uuid": "a", "data": 1, "userid": "u7", "lastupdate": 1_700_000_000_000_i64}]}
            }),
        );
        assert_eq!(replica.author_at(0), Some("u7"));
        assert_eq!(
            replica.last_update_at(0).map(|t| t.timestamp_millis()),
            Some(1_700_000_000_000)
        );
    }

    #[test]
    fn test_reconcile_index() {
        let replica = dumped(&["a", "b", "c"]);
        assert_eq!(replica.reconcile_index(Some(1), "b"), Some(1));
        assert_eq!(replica.reconcile_index(Some(0), "c"), Some(2));
        assert_eq!(replica.reconcile_index(Some(9), "a"), Some(0));
        assert_eq!(replica.reconcile_index(Some(1), "zzz"), None);
        assert_eq!(replica.reconcile_index(Some(1), ""), Some(1));
        assert_eq!(replica.reconcile_index(Some(5), ""), None);
        assert_eq!(replica.reconcile_index(Some(-1), ""), None);
    }

    #[test]
    fn test_remove_reply_raises_write_succeeded() {
        let mut replica = dumped(&["a1", "a2"]);
        let (events, _) = apply(
            &mut replica,
            json!({"command": "synclist:remove", "reply": true, "index": 0, "uuid": "a1"}),
        );
        assert_eq!(uuids(&replica), vec!["a2"]);
        assert_eq!(replica.remote_count(), 1);
        assert!(events.contains(&ListEvent::WriteSucceeded(ListChange::Removed {
            index: 0,
            uuid: "a1".into()
        })));
        assert!(!events.iter().any(|e| matches!(e, ListEvent::Changed(_))));
    }

    #[test]
    fn test_remove_with_drifted_index_scans() {
        let mut replica = dumped(&["a", "b", "c"]);
        let (events, _) = apply(
            &mut replica,
            json!({"command": "synclist:remove", "parameters": {"index": 0, "uuid": "c"}}),
        );
        assert_eq!(uuids(&replica), vec!["a", "b"]);
        assert!(events.contains(&ListEvent::Changed(ListChange::Removed {
            index: 2,
            uuid: "c".into()
        })));
    }

    #[test]
    fn test_remove_unknown_uuid_dropped() {
        let mut replica = dumped(&["a", "b"]);
        let (events, _) = apply(
            &mut replica,
            json!({"command": "synclist:remove", "parameters": {"index": 0, "uuid": "x"}}),
        );
        assert_eq!(uuids(&replica), vec!["a", "b"]);
        assert!(!events.iter().any(|e| matches!(e, ListEvent::Changed(_))));
        assert!(replica.len() <= replica.remote_count());
    }

    #[test]
    fn test_append_only_lands_in_complete_window() {
        let mut replica = dumped(&["a"]);
        let (events, _) = apply(
            &mut replica,
            json!({"command": "synclist:append", "parameters": {"data": item("b", 2)}}),
        );
        assert_eq!(uuids(&replica), vec!["a", "b"]);
        assert!(events.contains(&ListEvent::Changed(ListChange::Inserted {
            index: Some(1),
            count: 1
        })));

        // Partial window: only the count moves
        let mut partial = ListReplica::with_preload(1);
        apply(&mut partial, json!({"command": "synclist:init", "parameters": {"count": 3}}));
        apply(&mut partial, json!({"command": "synclist:get", "parameters": {"data": [item("a", 1)]}}));
        let (events, _) = apply(
            &mut partial,
            json!({"command": "synclist:append", "parameters": {"data": item("z", 9)}}),
        );
        assert_eq!(uuids(&partial), vec!["a"]);
        assert_eq!(partial.remote_count(), 4);
        assert!(events.contains(&ListEvent::Changed(ListChange::Inserted { index: None, count: 1 })));
    }

    #[test]
    fn test_appendlist() {
        let mut replica = dumped(&[]);
        apply(
            &mut replica,
            json!({"command": "synclist:appendlist", "reply": true, "parameters": {"data": [item("a", 1), item("b", 2)]}}),
        );
        assert_eq!(uuids(&replica), vec!["a", "b"]);
        assert_eq!(replica.remote_count(), 2);
    }

    #[test]
    fn test_insertat_places_item_and_shifts() {
        let mut replica = dumped(&["a1", "a2"]);
        apply(
            &mut replica,
            json!({"command": "synclist:insertat", "parameters": {"index": 1, "data": item("b1", 5)}}),
        );
        assert_eq!(uuids(&replica), vec!["a1", "b1", "a2"]);
        assert_eq!(replica.remote_count(), 3);
    }

    #[test]
    fn test_insertat_known_uuid_does_not_duplicate() {
        let mut replica = dumped(&["a1", "b1", "a2"]);
        let (events, _) = apply(
            &mut replica,
            json!({"command": "synclist:insertat", "parameters": {"index": 0, "data": item("b1", 7)}}),
        );
        assert_eq!(uuids(&replica), vec!["a1", "b1", "a2"]);
        assert_eq!(replica.get(1).unwrap().payload, json!({"x": 7}));
        assert_eq!(replica.remote_count(), 3);
        assert!(events.contains(&ListEvent::Changed(ListChange::Updated { index: 1 })));
    }

    #[test]
    fn test_insertat_invalid_index_dropped() {
        let mut replica = dumped(&["a"]);
        let (events, _) = apply(
            &mut replica,
            json!({"command": "synclist:insertat", "parameters": {"index": -1, "data": item("x", 1)}}),
        );
        assert!(events.is_empty());
        let (events, _) = apply(
            &mut replica,
            json!({"command": "synclist:insertat", "parameters": {"data": item("x", 1)}}),
        );
        assert!(events.is_empty());
        assert_eq!(replica.len(), 1);
    }

    #[test]
    fn test_insertat_beyond_window_appends_when_complete() {
        let mut replica = dumped(&["a"]);
        apply(
            &mut replica,
            json!({"command": "synclist:insertat", "parameters": {"index": 10, "data": item("b", 1)}}),
        );
        assert_eq!(uuids(&replica), vec!["a", "b"]);
    }

    #[test]
    fn test_set_replaces_reconciled_item() {
        let mut replica = dumped(&["a", "b"]);
        let (events, _) = apply(
            &mut replica,
            json!({"command": "synclist:set", "parameters": {"index": 0, "uuid": "b", "data": {"uuid": "b", "data": {"x": 42}}}}),
        );
        assert_eq!(replica.get(1).unwrap().payload, json!({"x": 42}));
        assert!(events.contains(&ListEvent::Changed(ListChange::Updated { index: 1 })));
    }

    #[test]
    fn test_property_set_updates_payload_and_timestamp() {
        let mut replica = dumped(&["a"]);
        let (events, _) = apply(
            &mut replica,
            json!({
                "command": "synclist:property:set",
                "reply": true,
                "parameters": {"index": 0, "uuid": "a", "property": "name", "data": "lamp", "lastupdate": 1000}
            }),
        );
        assert_eq!(replica.get(0).unwrap().payload, json!({"x": 0, "name": "lamp"}));
        assert_eq!(replica.last_update_at(0).map(|t| t.timestamp_millis()), Some(1000));
        assert!(events.contains(&ListEvent::WriteSucceeded(ListChange::PropertyChanged {
            index: 0,
            property: "name".into(),
            value: json!("lamp")
        })));
    }

    #[test]
    fn test_property_set_on_scalar_payload_replaces_it() {
        let mut replica = ListReplica::new();
        apply(
            &mut replica,
            json!({"command": "synclist:dump", "parameters": {"data": [{"uuid": "a", "data": 5}]}}),
        );
        apply(
            &mut replica,
            json!({"command": "synclist:property:set", "parameters": {"index": 0, "uuid": "a", "property": "p", "data": 1}}),
        );
        assert_eq!(replica.get(0).unwrap().payload, json!({"p": 1}));
    }

    #[test]
    fn test_clear_and_delete() {
        let mut replica = dumped(&["a", "b"]);
        let (events, _) = apply(&mut replica, json!({"command": "synclist:clear"}));
        assert!(replica.is_empty());
        assert_eq!(replica.remote_count(), 0);
        assert!(events.contains(&ListEvent::Changed(ListChange::Cleared)));

        let mut replica = dumped(&["a"]);
        let (events, _) = apply(&mut replica, json!({"command": "synclist:delete", "reply": true}));
        assert!(replica.is_empty());
        assert!(events.contains(&ListEvent::WriteSucceeded(ListChange::Deleted)));
    }

    #[test]
    fn test_metadata_set() {
        let mut replica = dumped(&[]);
        let (events, _) = apply(
            &mut replica,
            json!({"command": "synclist:metadata:set", "parameters": {"metadata": {"title": "Groceries"}}}),
        );
        assert_eq!(replica.metadata().get("title"), Some(&json!("Groceries")));
        assert_eq!(events, vec![ListEvent::MetadataChanged]);
    }

    #[test]
    fn test_init_without_preload_requests_dump() {
        let mut replica = ListReplica::new();
        let (_, requests) = apply(&mut replica, json!({"command": "synclist:init", "parameters": {"count": 10}}));
        assert_eq!(requests, vec![json!({"command": "synclist:dump"})]);
    }

    #[test]
    fn test_init_with_preload_pages() {
        let mut replica = ListReplica::with_preload(2);
        let (_, requests) = apply(
            &mut replica,
            json!({"command": "synclist:init", "parameters": {"count": 5, "metadata": {"k": 1}}}),
        );
        assert_eq!(
            requests,
            vec![json!({"command": "synclist:get", "parameters": {"from": 0, "count": 2}})]
        );
        assert_eq!(replica.remote_count(), 5);
        assert_eq!(replica.metadata().get("k"), Some(&json!(1)));
        assert!(!replica.is_initialized());

        apply(
            &mut replica,
            json!({"command": "synclist:get", "parameters": {"data": [item("a", 1), item("b", 2)]}}),
        );
        assert!(replica.is_initialized());
        assert!(replica.can_fetch_more());
        assert_eq!(
            replica.fetch_more_request(),
            Some(json!({"command": "synclist:get", "parameters": {"from": 2, "count": 2}}))
        );

        apply(
            &mut replica,
            json!({"command": "synclist:get", "parameters": {"data": [item("c", 3), item("d", 4)]}}),
        );
        assert_eq!(
            replica.fetch_more_request(),
            Some(json!({"command": "synclist:get", "parameters": {"from": 4, "count": 1}}))
        );
        apply(&mut replica, json!({"command": "synclist:get", "parameters": {"data": [item("e", 5)]}}));
        assert!(!replica.can_fetch_more());
        assert_eq!(replica.fetch_more_request(), None);
        assert_eq!(replica.len(), replica.remote_count());
    }

    #[test]
    fn test_init_negative_count_requests_dump() {
        let mut replica = ListReplica::with_preload(10);
        let (_, requests) = apply(&mut replica, json!({"command": "synclist:init", "parameters": {"count": -1}}));
        assert_eq!(requests, vec![json!({"command": "synclist:dump"})]);
    }

    #[test]
    fn test_init_empty_list_with_preload_initializes() {
        let mut replica = ListReplica::with_preload(10);
        let (events, requests) = apply(&mut replica, json!({"command": "synclist:init", "parameters": {"count": 0}}));
        assert!(requests.is_empty());
        assert!(events.contains(&ListEvent::InitializedChanged(true)));
    }

    #[test]
    fn test_session_drop_resets_replica() {
        let mut replica = dumped(&["a", "b"]);
        let events = replica.on_session_state(SessionState::Disconnected);
        assert!(replica.is_empty());
        assert_eq!(replica.remote_count(), 0);
        assert!(!replica.is_initialized());
        assert!(events.contains(&ListEvent::Reset));
        assert!(events.contains(&ListEvent::InitializedChanged(false)));
    }

    #[test]
    fn test_descriptor_change_resets_replica() {
        let mut replica = dumped(&["a"]);
        replica.on_descriptor_changed();
        assert!(replica.is_empty());
        assert!(!replica.is_initialized());
    }

    #[test]
    fn test_window_never_exceeds_remote_count() {
        let mut replica = ListReplica::with_preload(2);
        apply(&mut replica, json!({"command": "synclist:init", "parameters": {"count": 1}}));
        // Server sends more than announced
        apply(
            &mut replica,
            json!({"command": "synclist:get", "parameters": {"data": [item("a", 1), item("b", 2)]}}),
        );
        assert!(replica.len() <= replica.remote_count());
        apply(&mut replica, json!({"command": "synclist:remove", "parameters": {"index": 0, "uuid": "a"}}));
        assert!(replica.len() <= replica.remote_count());
    }
}
