//! The commands this library sends and the responses it expects back.
//!
//! Encoding is owned by the [`Transport`](crate::Transport): these types are
//! the already-parsed view of one request/response exchange.

use std::time::{Duration, SystemTime};

use crate::errors::{CacheError, ErrorKind, ServerError};
use crate::events::PollingResult;
use crate::types::{
    BitSet, CacheResult, CallbackType, DataFilter, EventType, LockAccessType, LockHandle,
    Priority, ServerAddress, NO_CALLBACK,
};

/// View id sent with requests that were rerouted because the distribution
/// map was stale or an owner was unreachable.
pub const FORCED_VIEW_ID: i64 = -5;

/// A serialized value and the flags describing its shape.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WirePayload {
    /// Output of the serializer.
    pub bytes: Vec<u8>,
    /// Shape of `bytes`.
    pub flags: BitSet,
}

/// An item as stored by a server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WireItem {
    /// The serialized value.
    pub payload: WirePayload,
    /// Fixed expiry time.
    pub absolute_expiration: Option<SystemTime>,
    /// Idle expiry window.
    pub sliding_expiration: Option<Duration>,
    /// Eviction priority.
    pub priority: Priority,
    /// Callback fired on update, or [`NO_CALLBACK`](crate::NO_CALLBACK).
    pub update_callback_id: i16,
    /// Callback fired on removal, or [`NO_CALLBACK`](crate::NO_CALLBACK).
    pub remove_callback_id: i16,
    /// Payload attached to update notifications.
    pub update_filter: DataFilter,
    /// Payload attached to remove notifications.
    pub remove_filter: DataFilter,
    /// Push or pull delivery.
    pub callback_type: CallbackType,
    /// Set by the server.
    pub creation_time: Option<SystemTime>,
    /// Set by the server.
    pub last_modified: Option<SystemTime>,
}

impl Default for WireItem {
    fn default() -> Self {
        WireItem {
            payload: WirePayload::default(),
            absolute_expiration: None,
            sliding_expiration: None,
            priority: Priority::default(),
            update_callback_id: NO_CALLBACK,
            remove_callback_id: NO_CALLBACK,
            update_filter: DataFilter::None,
            remove_filter: DataFilter::None,
            callback_type: CallbackType::default(),
            creation_time: None,
            last_modified: None,
        }
    }
}

/// Cache-wide notifications a client subscribes to as a whole.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NotificationKind {
    /// Application-defined notifications raised through `raise_custom_event`.
    CustomEvent,
    /// The cache was stopped.
    CacheStopped,
    /// A server joined the cluster.
    MemberJoined,
    /// A server left the cluster.
    MemberLeft,
    /// Pull-based callbacks have queued notifications.
    PollReady,
}

/// One logical remote operation.
#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    /// Store an item, failing if the key exists.
    Add { key: String, item: WireItem },
    /// Store an item, overwriting any previous one.
    Insert {
        key: String,
        item: WireItem,
        lock_id: Option<String>,
        access: LockAccessType,
    },
    /// Read a value.
    Get {
        key: String,
        lock_id: Option<String>,
        access: LockAccessType,
        lock_timeout: Option<Duration>,
    },
    /// Read a value with its metadata.
    GetCacheItem {
        key: String,
        lock_id: Option<String>,
        access: LockAccessType,
        lock_timeout: Option<Duration>,
    },
    /// Check for a key.
    Contains { key: String },
    /// Remove a key and return its value.
    Remove {
        key: String,
        lock_id: Option<String>,
        access: LockAccessType,
    },
    /// Remove a key without returning its value.
    Delete {
        key: String,
        lock_id: Option<String>,
        access: LockAccessType,
    },
    /// Number of items in the cache.
    Count,
    /// Remove every item.
    Clear,
    /// Take a pessimistic lock.
    Lock { key: String, timeout: Duration },
    /// Release a lock. With `force` it is broken whoever holds it; otherwise
    /// `lock_id` must name the holder.
    Unlock {
        key: String,
        lock_id: Option<String>,
        force: bool,
    },
    /// Query the lock state of a key.
    IsLocked { key: String },
    /// Bulk form of `Add`.
    AddBulk { entries: Vec<(String, WireItem)> },
    /// Bulk form of `Insert`.
    InsertBulk { entries: Vec<(String, WireItem)> },
    /// Bulk form of `Get`.
    GetBulk { keys: Vec<String> },
    /// Bulk form of `GetCacheItem`.
    GetCacheItemBulk { keys: Vec<String> },
    /// Bulk form of `Contains`.
    ContainsBulk { keys: Vec<String> },
    /// Bulk form of `Remove`.
    RemoveBulk { keys: Vec<String> },
    /// Bulk form of `Delete`.
    DeleteBulk { keys: Vec<String> },
    /// Bind item-level callbacks to an existing key.
    RegisterKeyNotification {
        key: String,
        update_callback_id: i16,
        remove_callback_id: i16,
        update_filter: DataFilter,
        remove_filter: DataFilter,
        callback_type: CallbackType,
    },
    /// Unbind item-level callbacks from a key.
    UnregisterKeyNotification {
        key: String,
        update_callback_id: i16,
        remove_callback_id: i16,
    },
    /// Subscribe to a cache-wide item event.
    RegisterGeneralNotification {
        event_type: EventType,
        filter: DataFilter,
        sequence: i16,
    },
    /// Drop a cache-wide item event subscription.
    UnregisterGeneralNotification { event_type: EventType, sequence: i16 },
    /// Subscribe to a cache-wide notification.
    RegisterNotification(NotificationKind),
    /// Drop a cache-wide notification subscription.
    UnregisterNotification(NotificationKind),
    /// Broadcast an application-defined notification.
    RaiseCustomEvent {
        notif_id: WirePayload,
        data: WirePayload,
    },
    /// Collect notifications queued for pull-based callbacks.
    Poll,
}

impl Command {
    /// A short name for logs and mocks.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Add { .. } => "ADD",
            Command::Insert { .. } => "INSERT",
            Command::Get { .. } => "GET",
            Command::GetCacheItem { .. } => "GET_CACHE_ITEM",
            Command::Contains { .. } => "CONTAINS",
            Command::Remove { .. } => "REMOVE",
            Command::Delete { .. } => "DELETE",
            Command::Count => "COUNT",
            Command::Clear => "CLEAR",
            Command::Lock { .. } => "LOCK",
            Command::Unlock { .. } => "UNLOCK",
            Command::IsLocked { .. } => "IS_LOCKED",
            Command::AddBulk { .. } => "ADD_BULK",
            Command::InsertBulk { .. } => "INSERT_BULK",
            Command::GetBulk { .. } => "GET_BULK",
            Command::GetCacheItemBulk { .. } => "GET_CACHE_ITEM_BULK",
            Command::ContainsBulk { .. } => "CONTAINS_BULK",
            Command::RemoveBulk { .. } => "REMOVE_BULK",
            Command::DeleteBulk { .. } => "DELETE_BULK",
            Command::RegisterKeyNotification { .. } => "REGISTER_KEY_NOTIF",
            Command::UnregisterKeyNotification { .. } => "UNREGISTER_KEY_NOTIF",
            Command::RegisterGeneralNotification { .. } => "REGISTER_GENERAL_NOTIF",
            Command::UnregisterGeneralNotification { .. } => "UNREGISTER_GENERAL_NOTIF",
            Command::RegisterNotification(_) => "REGISTER_NOTIF",
            Command::UnregisterNotification(_) => "UNREGISTER_NOTIF",
            Command::RaiseCustomEvent { .. } => "RAISE_CUSTOM_EVENT",
            Command::Poll => "POLL",
        }
    }

    /// Keys carried by the command, in order.
    pub fn keys(&self) -> Vec<&str> {
        match self {
            Command::Add { key, .. }
            | Command::Insert { key, .. }
            | Command::Get { key, .. }
            | Command::GetCacheItem { key, .. }
            | Command::Contains { key }
            | Command::Remove { key, .. }
            | Command::Delete { key, .. }
            | Command::Lock { key, .. }
            | Command::Unlock { key, .. }
            | Command::IsLocked { key }
            | Command::RegisterKeyNotification { key, .. }
            | Command::UnregisterKeyNotification { key, .. } => vec![key.as_str()],
            Command::AddBulk { entries } | Command::InsertBulk { entries } => {
                entries.iter().map(|(key, _)| key.as_str()).collect()
            }
            Command::GetBulk { keys }
            | Command::GetCacheItemBulk { keys }
            | Command::ContainsBulk { keys }
            | Command::RemoveBulk { keys }
            | Command::DeleteBulk { keys } => keys.iter().map(String::as_str).collect(),
            Command::Count
            | Command::Clear
            | Command::RegisterGeneralNotification { .. }
            | Command::UnregisterGeneralNotification { .. }
            | Command::RegisterNotification(_)
            | Command::UnregisterNotification(_)
            | Command::RaiseCustomEvent { .. }
            | Command::Poll => Vec::new(),
        }
    }
}

/// A parsed server response.
#[derive(Clone, Debug, PartialEq)]
pub enum Response {
    /// The command succeeded and returns nothing.
    Done,
    /// Answer to `Contains`.
    Bool(bool),
    /// Answer to `Count`.
    Count(u64),
    /// A value, possibly with the lock taken while reading it.
    Value {
        /// `None` when the key is absent.
        payload: Option<WirePayload>,
        /// Set when the read acquired the lock.
        lock: Option<LockHandle>,
    },
    /// A full item, possibly with the lock taken while reading it.
    Item {
        /// `None` when the key is absent.
        item: Option<WireItem>,
        /// Set when the read acquired the lock.
        lock: Option<LockHandle>,
    },
    /// Outcome of `Lock` or `IsLocked`.
    Lock {
        /// For `IsLocked`, whether the key is locked.
        acquired: bool,
        /// Current holder. Has no id when nobody holds the lock.
        handle: LockHandle,
    },
    /// Keys a bulk write failed for. Absent keys succeeded.
    Failures(Vec<(String, ServerError)>),
    /// Values of the keys that were found.
    Values(Vec<(String, WirePayload)>),
    /// Items of the keys that were found.
    Items(Vec<(String, WireItem)>),
    /// Per-key existence.
    Flags(Vec<(String, bool)>),
    /// Notifications collected for pull-based callbacks.
    Polled(PollingResult),
}

/// Where a command must be executed.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Target {
    /// Any server the transport picks.
    Any,
    /// A specific server.
    Server(ServerAddress),
}

/// One command of a request together with its eventual response.
#[derive(Debug)]
pub struct RequestEntry {
    /// Server the command is meant for.
    pub target: Target,
    /// What to execute.
    pub command: Command,
    /// Distribution view the command was routed with.
    pub view_id: i64,
    /// Filled by the transport.
    pub response: Option<CacheResult<Response>>,
}

/// A batch of commands executed as one round-trip.
///
/// Bulk calls produce one entry per owning server; everything else produces
/// a single entry.
#[derive(Debug)]
pub struct Request {
    entries: Vec<RequestEntry>,
    dedicated: bool,
}

impl Request {
    /// A request any server can serve.
    pub fn new(command: Command) -> Request {
        Request {
            entries: vec![RequestEntry {
                target: Target::Any,
                command,
                view_id: 0,
                response: None,
            }],
            dedicated: false,
        }
    }

    /// A request fanned out to several servers.
    pub fn distributed(parts: Vec<(Target, Command)>, view_id: i64) -> Request {
        Request {
            entries: parts
                .into_iter()
                .map(|(target, command)| RequestEntry {
                    target,
                    command,
                    view_id,
                    response: None,
                })
                .collect(),
            dedicated: false,
        }
    }

    /// Marks the request as a dedicated call, which bypasses distribution
    /// and is served by `target` on behalf of the whole cluster.
    pub fn into_dedicated(mut self, target: Target) -> Request {
        for entry in &mut self.entries {
            entry.target = target.clone();
            entry.view_id = FORCED_VIEW_ID;
        }
        self.dedicated = true;
        self
    }

    /// Returns true for dedicated calls.
    pub fn is_dedicated(&self) -> bool {
        self.dedicated
    }

    /// The commands of this request.
    pub fn entries(&self) -> &[RequestEntry] {
        &self.entries
    }

    /// Mutable access, used by transports to store responses.
    pub fn entries_mut(&mut self) -> &mut [RequestEntry] {
        &mut self.entries
    }

    /// Takes the single response of a non-distributed request.
    pub(crate) fn into_response(self) -> CacheResult<Response> {
        self.into_responses()
            .pop()
            .map(|(_, response)| response)
            .unwrap_or_else(|| Err(missing_response()))
    }

    /// Takes every response, in entry order.
    pub(crate) fn into_responses(self) -> Vec<(RequestEntry, CacheResult<Response>)> {
        self.entries
            .into_iter()
            .map(|mut entry| {
                let response = entry.response.take().unwrap_or_else(|| Err(missing_response()));
                (entry, response)
            })
            .collect()
    }
}

fn missing_response() -> CacheError {
    CacheError::from((ErrorKind::ClientError, "No response received for command"))
}

pub(crate) fn unexpected_response(command: &'static str, response: &Response) -> CacheError {
    CacheError::from((
        ErrorKind::ClientError,
        "Unexpected response type",
        format!("{command} answered with {response:?}"),
    ))
}
