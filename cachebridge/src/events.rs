//! Callback types and the arguments handed to them.
//!
//! Callbacks are compared by identity: two [`Listener`]s are equal only when
//! they share the same allocation. Registering a clone of a listener is
//! therefore registering the same subscriber again, which the registry
//! reference-counts instead of allocating a new callback id.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::Deref;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use arcstr::ArcStr;

use crate::types::{
    BitSet, DataFilter, EventType, EventTypes, ItemValue, Priority, RemovedReason, ServerAddress,
};

/// A shared, identity-compared callback.
pub struct Listener<F: ?Sized>(Arc<F>);

impl<F: ?Sized> Listener<F> {
    fn addr(&self) -> *const () {
        Arc::as_ptr(&self.0) as *const ()
    }
}

impl<F: ?Sized> Clone for Listener<F> {
    fn clone(&self) -> Self {
        Listener(self.0.clone())
    }
}

impl<F: ?Sized> PartialEq for Listener<F> {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self.addr(), other.addr())
    }
}

impl<F: ?Sized> Eq for Listener<F> {}

impl<F: ?Sized> Hash for Listener<F> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr().hash(state)
    }
}

impl<F: ?Sized> Deref for Listener<F> {
    type Target = F;

    fn deref(&self) -> &F {
        &self.0
    }
}

impl<F: ?Sized> fmt::Debug for Listener<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Listener({:p})", self.addr())
    }
}

/// Item-level callback: receives the key and the event.
pub type DataCallback = Listener<dyn Fn(&str, &CacheEventArg) + Send + Sync>;
/// Receives the id and payload of a custom notification.
pub type CustomEventCallback = Listener<dyn Fn(&ItemValue, &ItemValue) + Send + Sync>;
/// Invoked when pull-based notifications are ready to be polled.
pub type PollCallback = Listener<dyn Fn() + Send + Sync>;
/// Receives the name of the cache that stopped.
pub type CacheStoppedCallback = Listener<dyn Fn(&str) + Send + Sync>;
/// Receives cluster membership changes.
pub type MemberCallback = Listener<dyn Fn(&MemberEvent) + Send + Sync>;

impl DataCallback {
    /// Wraps a closure.
    pub fn new(f: impl Fn(&str, &CacheEventArg) + Send + Sync + 'static) -> Self {
        Listener(Arc::new(f))
    }
}

impl CustomEventCallback {
    /// Wraps a closure.
    pub fn new(f: impl Fn(&ItemValue, &ItemValue) + Send + Sync + 'static) -> Self {
        Listener(Arc::new(f))
    }
}

impl PollCallback {
    /// Wraps a closure.
    pub fn new(f: impl Fn() + Send + Sync + 'static) -> Self {
        Listener(Arc::new(f))
    }
}

impl CacheStoppedCallback {
    /// Wraps a closure.
    pub fn new(f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        Listener(Arc::new(f))
    }
}

impl MemberCallback {
    /// Wraps a closure.
    pub fn new(f: impl Fn(&MemberEvent) + Send + Sync + 'static) -> Self {
        Listener(Arc::new(f))
    }
}

/// The part of an item a notification carries, shaped by its [`DataFilter`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EventCacheItem {
    /// Present only for [`DataFilter::DataWithMetadata`].
    pub value: Option<ItemValue>,
    /// Eviction priority.
    pub priority: Priority,
    /// Flags stored with the item.
    pub flags: BitSet,
    /// Fixed expiry time.
    pub absolute_expiration: Option<SystemTime>,
    /// Idle expiry window.
    pub sliding_expiration: Option<Duration>,
    /// Set by the server.
    pub creation_time: Option<SystemTime>,
    /// Set by the server.
    pub last_modified: Option<SystemTime>,
}

/// Everything an item-level callback learns about an event.
#[derive(Clone, Debug)]
pub struct CacheEventArg {
    /// The key the event is about.
    pub key: String,
    /// Name of the cache that raised it.
    pub cache_name: ArcStr,
    /// What happened.
    pub event_type: EventType,
    /// The item after the change, subject to the data filter.
    pub item: Option<EventCacheItem>,
    /// The item before an update, subject to the data filter.
    pub old_item: Option<EventCacheItem>,
    /// Set for removals.
    pub reason: Option<RemovedReason>,
    /// Set when the event was delivered through a general registration.
    pub descriptor: Option<EventDescriptor>,
}

/// A cluster membership change.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MemberEvent {
    /// A server joined the cluster.
    Joined(ServerAddress),
    /// A server left the cluster.
    Left(ServerAddress),
}

/// Handle to a general (cache-wide) event registration.
///
/// Keeps what is needed to reissue the registration after a reconnect.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventDescriptor {
    pub(crate) id: u64,
    pub(crate) event_types: EventTypes,
    pub(crate) data_filter: DataFilter,
    pub(crate) sequence: i16,
}

impl EventDescriptor {
    /// Event types this registration listens to.
    pub fn event_types(&self) -> EventTypes {
        self.event_types
    }

    /// The filter the registration asked for.
    pub fn data_filter(&self) -> DataFilter {
        self.data_filter
    }

    /// Registration sequence the server saw when this descriptor was handed out.
    pub fn sequence(&self) -> i16 {
        self.sequence
    }
}

/// The server-side state of one general event type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EventRegistrationInfo {
    /// The registered event type.
    pub event_type: EventType,
    /// Highest filter any live subscriber asked for.
    pub data_filter: DataFilter,
    /// Increments each time the registered filter changes.
    pub sequence: i16,
}

/// A notification queued on the server for a pull-based callback.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PolledEvent {
    /// The key the notification is about.
    pub key: String,
    /// Id the callback was registered under.
    pub callback_id: i16,
    /// What happened to the key.
    pub event_type: EventType,
}

/// Result of a poll round-trip.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PollingResult {
    /// Queued notifications, oldest first.
    pub events: Vec<PolledEvent>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_listeners_compare_by_identity() {
        let first = PollCallback::new(|| {});
        let second = PollCallback::new(|| {});
        assert_eq!(first, first.clone());
        assert_ne!(first, second);

        let set: HashSet<_> = [first.clone(), first.clone(), second].into_iter().collect();
        assert_eq!(set.len(), 2);
    }
}
