use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::time::{Duration, SystemTime};

use arcstr::ArcStr;
use serde::de::DeserializeOwned;
use serde::Serialize;

pub(crate) use std::collections::HashSet;

use crate::errors::CacheError;
use crate::events::DataCallback;

/// Library generic result type.
pub type CacheResult<T> = Result<T, CacheError>;

/// Address of a cache server, as handed out by the transport.
pub type ServerAddress = ArcStr;

/// Sentinel callback id meaning "no callback bound".
pub const NO_CALLBACK: i16 = -1;

/// Rejects keys the servers cannot store.
pub(crate) fn validate_key(key: &str) -> CacheResult<()> {
    if key.is_empty() {
        fail!(invalid_argument!("Key cannot be empty"));
    }
    Ok(())
}

/// A value held by the cache once it has left the wire.
#[derive(PartialEq, Clone)]
pub enum ItemValue {
    /// A structured value decoded from JSON.
    Json(serde_json::Value),
    /// An opaque byte buffer, stored as-is.
    Binary(Vec<u8>),
}

impl ItemValue {
    /// Builds a structured value from anything serde can serialize.
    pub fn from_serialize<T: Serialize + ?Sized>(value: &T) -> CacheResult<ItemValue> {
        Ok(ItemValue::Json(serde_json::to_value(value)?))
    }

    /// Converts the value into a typed value.
    ///
    /// Binary values are interpreted as JSON text; anything else is a serialization error.
    pub fn into_typed<T: DeserializeOwned>(self) -> CacheResult<T> {
        match self {
            ItemValue::Json(value) => Ok(serde_json::from_value(value)?),
            ItemValue::Binary(bytes) => Ok(serde_json::from_slice(&bytes)?),
        }
    }

    /// Returns the raw bytes if this is a binary value.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            ItemValue::Binary(bytes) => Some(bytes),
            ItemValue::Json(_) => None,
        }
    }
}

impl fmt::Debug for ItemValue {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemValue::Json(value) => write!(fmt, "json({value})"),
            ItemValue::Binary(bytes) => write!(fmt, "binary({} bytes)", bytes.len()),
        }
    }
}

impl From<Vec<u8>> for ItemValue {
    fn from(bytes: Vec<u8>) -> Self {
        ItemValue::Binary(bytes)
    }
}

impl From<serde_json::Value> for ItemValue {
    fn from(value: serde_json::Value) -> Self {
        ItemValue::Json(value)
    }
}

/// A compact set of flags piggybacked on every payload.
///
/// Flags only accumulate when they cross between client and server: merging
/// a response into a caller's set is an OR, never a replacement.
#[derive(PartialEq, Eq, Clone, Copy, Default, Hash)]
pub struct BitSet(u8);

impl BitSet {
    /// The payload is lz4-compressed.
    pub const COMPRESSED: BitSet = BitSet(1 << 0);
    /// The payload is an opaque binary buffer.
    pub const BINARY_DATA: BitSet = BitSet(1 << 1);
    /// The payload is JSON text.
    pub const JSON_DATA: BitSet = BitSet(1 << 2);
    /// The item carries a lock.
    pub const LOCKED_ITEM: BitSet = BitSet(1 << 3);
    /// The write is propagated to the backing store synchronously.
    pub const WRITE_THRU: BitSet = BitSet(1 << 4);
    /// The write is propagated to the backing store asynchronously.
    pub const WRITE_BEHIND: BitSet = BitSet(1 << 5);

    /// An empty set.
    pub const fn new() -> BitSet {
        BitSet(0)
    }

    /// Builds a set from its raw bits.
    pub const fn from_bits(bits: u8) -> BitSet {
        BitSet(bits)
    }

    /// The raw bits.
    pub const fn bits(&self) -> u8 {
        self.0
    }

    /// Sets every flag in `flags`.
    pub fn set(&mut self, flags: BitSet) {
        self.0 |= flags.0;
    }

    /// Clears every flag in `flags`.
    pub fn unset(&mut self, flags: BitSet) {
        self.0 &= !flags.0;
    }

    /// Returns true if every flag in `flags` is set.
    pub fn is_set(&self, flags: BitSet) -> bool {
        flags.0 != 0 && self.0 & flags.0 == flags.0
    }

    /// Returns true if any flag in `flags` is set.
    pub fn is_any_set(&self, flags: BitSet) -> bool {
        self.0 & flags.0 != 0
    }
}

impl BitOr for BitSet {
    type Output = BitSet;

    fn bitor(self, rhs: BitSet) -> BitSet {
        BitSet(self.0 | rhs.0)
    }
}

impl BitOrAssign for BitSet {
    fn bitor_assign(&mut self, rhs: BitSet) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for BitSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(BitSet, &str); 6] = [
            (BitSet::COMPRESSED, "Compressed"),
            (BitSet::BINARY_DATA, "BinaryData"),
            (BitSet::JSON_DATA, "JsonData"),
            (BitSet::LOCKED_ITEM, "LockedItem"),
            (BitSet::WRITE_THRU, "WriteThru"),
            (BitSet::WRITE_BEHIND, "WriteBehind"),
        ];
        f.debug_set()
            .entries(
                NAMES
                    .iter()
                    .filter(|(flag, _)| self.is_set(*flag))
                    .map(|(_, name)| name),
            )
            .finish()
    }
}

/// Relative priority of an item when the server has to evict.
#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Debug, Default, Hash)]
pub enum Priority {
    /// Evicted first.
    Low,
    /// Evicted before normal items.
    BelowNormal,
    /// The default priority.
    #[default]
    Normal,
    /// Evicted after normal items.
    AboveNormal,
    /// Evicted last.
    High,
    /// Never evicted.
    NotRemovable,
}

/// How much of an item a notification carries. Ordered from least to most.
#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Debug, Default, Hash)]
pub enum DataFilter {
    /// Only the key.
    #[default]
    None,
    /// The key and the item's metadata.
    Metadata,
    /// The key, the metadata and the value.
    DataWithMetadata,
}

/// A single kind of item-level event.
#[derive(PartialEq, Eq, Clone, Copy, Debug, Hash, PartialOrd, Ord)]
pub enum EventType {
    /// A key was added.
    ItemAdded,
    /// An existing key was overwritten.
    ItemUpdated,
    /// A key left the cache.
    ItemRemoved,
}

impl EventType {
    pub(crate) const ALL: [EventType; 3] = [
        EventType::ItemAdded,
        EventType::ItemUpdated,
        EventType::ItemRemoved,
    ];

    const fn bit(self) -> u8 {
        match self {
            EventType::ItemAdded => 1,
            EventType::ItemUpdated => 2,
            EventType::ItemRemoved => 4,
        }
    }
}

/// A set of [`EventType`]s a subscription is interested in.
#[derive(PartialEq, Eq, Clone, Copy, Default, Hash)]
pub struct EventTypes(u8);

impl EventTypes {
    /// Only [`EventType::ItemAdded`].
    pub const ADDED: EventTypes = EventTypes(EventType::ItemAdded.bit());
    /// Only [`EventType::ItemUpdated`].
    pub const UPDATED: EventTypes = EventTypes(EventType::ItemUpdated.bit());
    /// Only [`EventType::ItemRemoved`].
    pub const REMOVED: EventTypes = EventTypes(EventType::ItemRemoved.bit());
    /// Every event type.
    pub const ALL: EventTypes = EventTypes(7);

    /// Returns true if `event_type` is part of the set.
    pub fn contains(&self, event_type: EventType) -> bool {
        self.0 & event_type.bit() != 0
    }

    /// Returns true if no event type is selected.
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Iterates the selected event types in a fixed order.
    pub fn iter(&self) -> impl Iterator<Item = EventType> + '_ {
        EventType::ALL.into_iter().filter(|ty| self.contains(*ty))
    }
}

impl From<EventType> for EventTypes {
    fn from(event_type: EventType) -> Self {
        EventTypes(event_type.bit())
    }
}

impl BitOr for EventTypes {
    type Output = EventTypes;

    fn bitor(self, rhs: EventTypes) -> EventTypes {
        EventTypes(self.0 | rhs.0)
    }
}

impl fmt::Debug for EventTypes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// Whether a callback is pushed by the server or collected by polling.
#[derive(PartialEq, Eq, Clone, Copy, Debug, Default, Hash)]
pub enum CallbackType {
    /// The server pushes the notification as soon as it happens.
    #[default]
    PushBasedNotification,
    /// The server queues the notification until the client polls.
    PullBasedCallback,
}

/// Why an item left the cache.
#[derive(PartialEq, Eq, Clone, Copy, Debug, Hash)]
pub enum RemovedReason {
    /// Removed by a client call.
    Removed,
    /// The item expired.
    Expired,
    /// Evicted to make room.
    Underused,
    /// A dependency of the item changed.
    DependencyChanged,
}

/// Proof of ownership for a pessimistic lock.
///
/// A handle without a lock id is what a failed lock attempt hands back.
#[derive(PartialEq, Eq, Clone, Debug, Default)]
pub struct LockHandle {
    /// Opaque id chosen by the server, `None` when no lock is held.
    pub lock_id: Option<String>,
    /// When the lock was taken.
    pub lock_date: Option<SystemTime>,
}

impl LockHandle {
    /// Builds a handle for a lock the caller already knows about.
    pub fn new(lock_id: impl Into<String>, lock_date: Option<SystemTime>) -> LockHandle {
        LockHandle {
            lock_id: Some(lock_id.into()),
            lock_date,
        }
    }

    /// Returns true if the handle names a lock.
    pub fn is_held(&self) -> bool {
        self.lock_id.as_deref().is_some_and(|id| !id.is_empty())
    }
}

/// How an operation should treat an existing lock on its key.
#[derive(PartialEq, Eq, Clone, Copy, Debug, Hash)]
pub enum LockAccessType {
    /// Operate regardless of any lock.
    IgnoreLock,
    /// Honor the lock and release it on success.
    Default,
    /// Honor the lock and release it.
    Release,
    /// Honor the lock and keep holding it.
    DontRelease,
    /// Take the lock while reading.
    Acquire,
    /// Read without taking the lock, but honor an existing one.
    DontAcquire,
}

/// Logical value container written to and read from the cache.
///
/// Creation and modification times are set by the server and only read here.
#[derive(Clone, Debug)]
pub struct CacheItem {
    pub(crate) value: ItemValue,
    pub(crate) absolute_expiration: Option<SystemTime>,
    pub(crate) sliding_expiration: Option<Duration>,
    pub(crate) priority: Priority,
    pub(crate) flags: BitSet,
    pub(crate) creation_time: Option<SystemTime>,
    pub(crate) last_modified: Option<SystemTime>,
    pub(crate) update_callback: Option<DataCallback>,
    pub(crate) update_filter: DataFilter,
    pub(crate) remove_callback: Option<DataCallback>,
    pub(crate) remove_filter: DataFilter,
    pub(crate) callback_type: CallbackType,
}

impl CacheItem {
    /// Creates an item holding `value`.
    pub fn new(value: impl Into<ItemValue>) -> CacheItem {
        CacheItem {
            value: value.into(),
            absolute_expiration: None,
            sliding_expiration: None,
            priority: Priority::default(),
            flags: BitSet::new(),
            creation_time: None,
            last_modified: None,
            update_callback: None,
            update_filter: DataFilter::None,
            remove_callback: None,
            remove_filter: DataFilter::None,
            callback_type: CallbackType::default(),
        }
    }

    /// Creates an item from any serializable value.
    pub fn from_serialize<T: Serialize + ?Sized>(value: &T) -> CacheResult<CacheItem> {
        Ok(CacheItem::new(ItemValue::from_serialize(value)?))
    }

    /// Expire the item at a fixed point in time.
    pub fn with_absolute_expiration(mut self, at: SystemTime) -> CacheItem {
        self.absolute_expiration = Some(at);
        self
    }

    /// Expire the item after it went unused for `idle`.
    pub fn with_sliding_expiration(mut self, idle: Duration) -> CacheItem {
        self.sliding_expiration = Some(idle);
        self
    }

    /// Sets the eviction priority.
    pub fn with_priority(mut self, priority: Priority) -> CacheItem {
        self.priority = priority;
        self
    }

    /// Adds flags, for instance [`BitSet::WRITE_THRU`].
    pub fn with_flags(mut self, flags: BitSet) -> CacheItem {
        self.flags |= flags;
        self
    }

    /// Binds a callback fired when this item is updated.
    pub fn on_update(mut self, callback: DataCallback, filter: DataFilter) -> CacheItem {
        self.update_callback = Some(callback);
        self.update_filter = filter;
        self
    }

    /// Binds a callback fired when this item is removed.
    pub fn on_remove(mut self, callback: DataCallback, filter: DataFilter) -> CacheItem {
        self.remove_callback = Some(callback);
        self.remove_filter = filter;
        self
    }

    /// Selects push or pull delivery for the bound callbacks.
    pub fn with_callback_type(mut self, callback_type: CallbackType) -> CacheItem {
        self.callback_type = callback_type;
        self
    }

    /// The held value.
    pub fn value(&self) -> &ItemValue {
        &self.value
    }

    /// Fixed expiry time, if any.
    pub fn absolute_expiration(&self) -> Option<SystemTime> {
        self.absolute_expiration
    }

    /// Idle expiry window, if any.
    pub fn sliding_expiration(&self) -> Option<Duration> {
        self.sliding_expiration
    }

    /// Eviction priority.
    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Flags attached to the item.
    pub fn flags(&self) -> BitSet {
        self.flags
    }

    /// Set by the server.
    pub fn creation_time(&self) -> Option<SystemTime> {
        self.creation_time
    }

    /// Set by the server.
    pub fn last_modified(&self) -> Option<SystemTime> {
        self.last_modified
    }

    /// Rejects items that ask for both absolute and sliding expiration.
    pub(crate) fn validate_expirations(&self) -> CacheResult<()> {
        if self.absolute_expiration.is_some() && self.sliding_expiration.is_some() {
            fail!(invalid_argument!(
                "You can not set both sliding and absolute expirations on a single item"
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;

    #[test]
    fn test_flags_accumulate() {
        let mut caller = BitSet::WRITE_THRU;
        caller |= BitSet::COMPRESSED;
        assert!(caller.is_set(BitSet::WRITE_THRU));
        assert!(caller.is_set(BitSet::COMPRESSED));
        caller.unset(BitSet::COMPRESSED);
        assert_eq!(caller, BitSet::WRITE_THRU);
    }

    #[test]
    fn test_data_filter_is_ordered() {
        assert!(DataFilter::None < DataFilter::Metadata);
        assert!(DataFilter::Metadata < DataFilter::DataWithMetadata);
    }

    #[test]
    fn test_event_types_iterate_in_order() {
        let types = EventTypes::REMOVED | EventTypes::ADDED;
        assert_eq!(
            types.iter().collect::<Vec<_>>(),
            vec![EventType::ItemAdded, EventType::ItemRemoved]
        );
        assert!(!types.contains(EventType::ItemUpdated));
    }

    #[test]
    fn test_both_expirations_are_rejected() {
        let item = CacheItem::new(vec![1u8])
            .with_absolute_expiration(SystemTime::now() + Duration::from_secs(300))
            .with_sliding_expiration(Duration::from_secs(300));
        let err = item.validate_expirations().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_lock_handle_without_id_is_not_held() {
        assert!(!LockHandle::default().is_held());
        assert!(LockHandle::new("l-1", None).is_held());
    }
}
