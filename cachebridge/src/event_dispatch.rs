//! Turns server pushes into calls of application callbacks.
//!
//! Engines hand every inbound notification to a [`NotificationSink`]. The
//! sink forwards it to the [`EventDispatchBridge`] of the cache it belongs to,
//! which resolves callback ids through the cache's registry, decodes payloads
//! and invokes the subscribers. The bridge only holds a weak reference to the
//! cache: notifications arriving after the last handle is gone are dropped.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::thread;
use std::time::{Duration, SystemTime};

use arc_swap::ArcSwap;
use log::{trace, warn};

use crate::cache::CacheInner;
use crate::callback_registry::SelectiveKind;
use crate::command::WirePayload;
use crate::events::{CacheEventArg, DataCallback, EventCacheItem, EventDescriptor, MemberEvent};
use crate::types::{DataFilter, EventType, Priority, RemovedReason, ServerAddress};

/// An item attached to a notification, as much of it as the registration's
/// [`DataFilter`] asked for.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WireEventItem {
    /// Absent unless the filter is [`DataFilter::DataWithMetadata`].
    pub payload: Option<WirePayload>,
    /// Eviction priority.
    pub priority: Priority,
    /// Fixed expiry time.
    pub absolute_expiration: Option<SystemTime>,
    /// Idle expiry window.
    pub sliding_expiration: Option<Duration>,
    /// Set by the server.
    pub creation_time: Option<SystemTime>,
    /// Set by the server.
    pub last_modified: Option<SystemTime>,
}

/// A notification pushed by a server.
#[derive(Clone, Debug, PartialEq)]
pub enum Notification {
    /// A key was added. Delivered to general subscribers.
    ItemAdded {
        /// The added key.
        key: String,
        /// The new item.
        item: Option<WireEventItem>,
    },
    /// A key was overwritten. Delivered to general subscribers.
    ItemUpdated {
        /// The updated key.
        key: String,
        /// The item after the update.
        item: Option<WireEventItem>,
        /// The item before the update.
        old_item: Option<WireEventItem>,
    },
    /// A key left the cache. Delivered to general subscribers.
    ItemRemoved {
        /// The removed key.
        key: String,
        /// The item that was removed.
        item: Option<WireEventItem>,
        /// Why it was removed.
        reason: RemovedReason,
    },
    /// A key with a bound update callback was overwritten.
    CustomUpdateCallback {
        /// Id of the update callback.
        callback_id: i16,
        /// The updated key.
        key: String,
        /// The item after the update.
        item: Option<WireEventItem>,
        /// The item before the update.
        old_item: Option<WireEventItem>,
    },
    /// A key with a bound remove callback left the cache.
    CustomRemoveCallback {
        /// Id of the remove callback.
        callback_id: i16,
        /// The removed key.
        key: String,
        /// The item that was removed.
        item: Option<WireEventItem>,
        /// Why it was removed.
        reason: RemovedReason,
    },
    /// An application-defined notification.
    CustomNotification {
        /// Serialized notification id.
        notif_id: WirePayload,
        /// Serialized notification data.
        data: WirePayload,
    },
    /// Notifications are queued for a pull-based callback.
    PollNotify {
        /// Id of the pull-based callback.
        callback_id: i16,
        /// Which kind of callback it is.
        event_type: EventType,
    },
    /// A server joined the cluster.
    MemberJoined(ServerAddress),
    /// A server left the cluster.
    MemberLeft(ServerAddress),
    /// The cache was stopped.
    CacheStopped,
    /// The transport re-established its connections; registrations must be
    /// issued again.
    Reconnected,
}

impl Notification {
    fn kind(&self) -> &'static str {
        match self {
            Notification::ItemAdded { .. } => "item added",
            Notification::ItemUpdated { .. } => "item updated",
            Notification::ItemRemoved { .. } => "item removed",
            Notification::CustomUpdateCallback { .. } => "update callback",
            Notification::CustomRemoveCallback { .. } => "remove callback",
            Notification::CustomNotification { .. } => "custom event",
            Notification::PollNotify { .. } => "poll",
            Notification::MemberJoined(_) => "member joined",
            Notification::MemberLeft(_) => "member left",
            Notification::CacheStopped => "cache stopped",
            Notification::Reconnected => "reconnected",
        }
    }
}

/// How a notification is handed to application code.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Delivery {
    /// On the calling thread.
    #[default]
    Sync,
    /// On the cache's event thread, in the order sent, so the caller is
    /// never blocked by callbacks.
    Async,
}

/// Where engines send notifications. Cheap to clone.
#[derive(Clone, Default)]
pub struct NotificationSink {
    bridge: Arc<ArcSwap<Option<Weak<EventDispatchBridge>>>>,
}

impl NotificationSink {
    /// Creates a sink that drops everything until a cache attaches to it.
    pub fn new() -> Self {
        NotificationSink {
            bridge: Arc::from(ArcSwap::from(Arc::from(None))),
        }
    }

    /// Delivers `notification` on the calling thread.
    pub fn send(&self, notification: Notification) {
        self.send_with(notification, Delivery::Sync)
    }

    /// Delivers `notification` as `delivery` asks.
    ///
    /// Once the owning cache is gone the sink detaches itself and drops
    /// everything it receives.
    pub fn send_with(&self, notification: Notification, delivery: Delivery) {
        let guard = self.bridge.load();
        let Some(target) = (**guard).as_ref() else {
            trace!("No cache attached, dropping {} notification", notification.kind());
            return;
        };
        match target.upgrade() {
            Some(bridge) => bridge.dispatch(notification, delivery),
            None => {
                trace!("Cache is gone, dropping {} notification", notification.kind());
                self.bridge.compare_and_swap(guard, Arc::new(None));
            }
        }
    }

    pub(crate) fn replace_bridge(&self, bridge: &Arc<EventDispatchBridge>) {
        self.bridge.store(Arc::new(Some(Arc::downgrade(bridge))));
    }

    /// Returns true if a cache is attached.
    pub fn has_bridge(&self) -> bool {
        self.bridge.load().is_some()
    }

    pub(crate) fn detach(&self) {
        self.bridge.store(Arc::new(None));
    }
}

/// Dispatches notifications for one cache.
pub struct EventDispatchBridge {
    cache: Weak<CacheInner>,
    // Started on the first async notification; exits once the bridge is dropped.
    worker: Mutex<Option<Sender<Notification>>>,
}

impl EventDispatchBridge {
    pub(crate) fn new(cache: Weak<CacheInner>) -> EventDispatchBridge {
        EventDispatchBridge {
            cache,
            worker: Mutex::new(None),
        }
    }

    fn enqueue(&self, notification: Notification) {
        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        let notification = match worker.as_ref() {
            Some(tx) => match tx.send(notification) {
                Ok(()) => return,
                Err(mpsc::SendError(notification)) => notification,
            },
            None => notification,
        };
        let (tx, rx) = mpsc::channel::<Notification>();
        let cache = self.cache.clone();
        let spawned = thread::Builder::new()
            .name("cachebridge-event".into())
            .spawn(move || {
                for notification in rx {
                    let Some(cache) = cache.upgrade() else {
                        trace!("Cache is gone, stopping event thread");
                        return;
                    };
                    deliver(&cache, notification);
                }
            });
        match spawned {
            Ok(_) => {
                if tx.send(notification).is_ok() {
                    *worker = Some(tx);
                }
            }
            Err(err) => warn!("Could not spawn event delivery thread: {err}"),
        }
    }

    pub(crate) fn dispatch(&self, notification: Notification, delivery: Delivery) {
        let Some(cache) = self.cache.upgrade() else {
            trace!("Cache is gone, dropping {} notification", notification.kind());
            return;
        };
        match delivery {
            Delivery::Sync => deliver(&cache, notification),
            Delivery::Async => {
                drop(cache);
                self.enqueue(notification);
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

/// Runs application code, swallowing any panic it raises.
fn isolated(what: &str, callback: impl FnOnce()) {
    if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(callback)) {
        warn!(
            "Ignoring panic raised by {what} callback: {}",
            panic_message(panic.as_ref())
        );
    }
}

fn event_item(
    cache: &CacheInner,
    item: Option<&WireEventItem>,
    filter: DataFilter,
) -> Option<EventCacheItem> {
    if filter == DataFilter::None {
        return None;
    }
    let item = item?;
    let value = match (&item.payload, filter) {
        (Some(payload), DataFilter::DataWithMetadata) => {
            Some(cache.codec.deserialize_lossy(&payload.bytes, payload.flags))
        }
        _ => None,
    };
    Some(EventCacheItem {
        value,
        priority: item.priority,
        flags: item
            .payload
            .as_ref()
            .map(|payload| payload.flags)
            .unwrap_or_default(),
        absolute_expiration: item.absolute_expiration,
        sliding_expiration: item.sliding_expiration,
        creation_time: item.creation_time,
        last_modified: item.last_modified,
    })
}

struct ItemEvent<'a> {
    key: &'a str,
    event_type: EventType,
    item: Option<&'a WireEventItem>,
    old_item: Option<&'a WireEventItem>,
    reason: Option<RemovedReason>,
}

impl ItemEvent<'_> {
    fn invoke(
        &self,
        cache: &CacheInner,
        callback: &DataCallback,
        filter: DataFilter,
        descriptor: Option<EventDescriptor>,
    ) {
        let arg = CacheEventArg {
            key: self.key.to_string(),
            cache_name: cache.name().clone(),
            event_type: self.event_type,
            item: event_item(cache, self.item, filter),
            old_item: event_item(cache, self.old_item, filter),
            reason: self.reason,
            descriptor,
        };
        isolated("item", || (**callback)(self.key, &arg));
    }

    fn to_general(&self, cache: &CacheInner) {
        for (callback, descriptor) in cache.registry.general_subscribers(self.event_type) {
            let filter = descriptor.data_filter;
            self.invoke(cache, &callback, filter, Some(descriptor));
        }
    }

    fn to_selective(
        &self,
        cache: &CacheInner,
        kind: SelectiveKind,
        callback_id: i16,
    ) -> Option<DataCallback> {
        match cache.registry.selective(kind, callback_id) {
            Some((callback, filter)) => {
                self.invoke(cache, &callback, filter, None);
                Some(callback)
            }
            None => {
                trace!("No callback registered under id {callback_id}");
                None
            }
        }
    }
}

fn deliver(cache: &CacheInner, notification: Notification) {
    trace!("Delivering {} notification", notification.kind());
    cache.stats.record_event();
    match &notification {
        Notification::ItemAdded { key, item } => ItemEvent {
            key,
            event_type: EventType::ItemAdded,
            item: item.as_ref(),
            old_item: None,
            reason: None,
        }
        .to_general(cache),
        Notification::ItemUpdated {
            key,
            item,
            old_item,
        } => ItemEvent {
            key,
            event_type: EventType::ItemUpdated,
            item: item.as_ref(),
            old_item: old_item.as_ref(),
            reason: None,
        }
        .to_general(cache),
        Notification::ItemRemoved { key, item, reason } => ItemEvent {
            key,
            event_type: EventType::ItemRemoved,
            item: item.as_ref(),
            old_item: None,
            reason: Some(*reason),
        }
        .to_general(cache),
        Notification::CustomUpdateCallback {
            callback_id,
            key,
            item,
            old_item,
        } => {
            ItemEvent {
                key,
                event_type: EventType::ItemUpdated,
                item: item.as_ref(),
                old_item: old_item.as_ref(),
                reason: None,
            }
            .to_selective(cache, SelectiveKind::Update, *callback_id);
        }
        Notification::CustomRemoveCallback {
            callback_id,
            key,
            item,
            reason,
        } => {
            let fired = ItemEvent {
                key,
                event_type: EventType::ItemRemoved,
                item: item.as_ref(),
                old_item: None,
                reason: Some(*reason),
            }
            .to_selective(cache, SelectiveKind::Remove, *callback_id);
            if let Some(callback) = fired {
                cache.removal_delivered(key, &callback);
            }
        }
        Notification::CustomNotification { notif_id, data } => {
            let notif_id = cache
                .codec
                .deserialize_lossy(&notif_id.bytes, notif_id.flags);
            let data = cache.codec.deserialize_lossy(&data.bytes, data.flags);
            for callback in cache.registry.custom.snapshot() {
                isolated("custom event", || (*callback)(&notif_id, &data));
            }
        }
        Notification::PollNotify {
            callback_id,
            event_type,
        } => {
            let kind = match event_type {
                EventType::ItemUpdated => SelectiveKind::Update,
                EventType::ItemRemoved => SelectiveKind::Remove,
                EventType::ItemAdded => {
                    trace!("Ignoring poll notification for added items");
                    return;
                }
            };
            if cache.registry.selective(kind, *callback_id).is_none() {
                trace!("No pull-based callback registered under id {callback_id}");
                return;
            }
            for callback in cache.registry.poll.snapshot() {
                isolated("poll", || (*callback)());
            }
        }
        Notification::MemberJoined(server) => {
            let event = MemberEvent::Joined(server.clone());
            for callback in cache.registry.member_joined.snapshot() {
                isolated("member joined", || (*callback)(&event));
            }
        }
        Notification::MemberLeft(server) => {
            let event = MemberEvent::Left(server.clone());
            for callback in cache.registry.member_left.snapshot() {
                isolated("member left", || (*callback)(&event));
            }
        }
        Notification::CacheStopped => {
            for callback in cache.registry.cache_stopped.snapshot() {
                isolated("cache stopped", || (*callback)(cache.name().as_str()));
            }
        }
        Notification::Reconnected => {
            if let Err(err) = cache.reissue_registrations() {
                warn!("Could not reissue event registrations after reconnect: {err}");
            }
        }
    }
}
