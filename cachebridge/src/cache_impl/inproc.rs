use std::collections::HashMap;
use std::mem;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant, SystemTime};

use log::{debug, trace};

use crate::bulk::{BulkErrors, BulkRead};
use crate::cache_impl::{CacheImpl, KeyCallbacks, LockedRead, ReadOptions};
use crate::callback_registry::RegistrationChange;
use crate::command::{NotificationKind, WireItem, WirePayload};
use crate::errors::ServerErrorKind;
use crate::event_dispatch::{Notification, NotificationSink, WireEventItem};
use crate::events::{PolledEvent, PollingResult};
use crate::types::{
    CacheResult, CallbackType, DataFilter, EventType, HashSet, LockAccessType, LockHandle,
    NO_CALLBACK, RemovedReason,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn new_lock_id() -> String {
    format!("{:032x}", rand::random::<u128>())
}

struct LockState {
    id: String,
    date: SystemTime,
    expires_at: Instant,
}

impl LockState {
    fn new(timeout: Duration) -> LockState {
        LockState {
            id: new_lock_id(),
            date: SystemTime::now(),
            expires_at: Instant::now() + timeout,
        }
    }

    fn handle(&self) -> LockHandle {
        LockHandle::new(self.id.clone(), Some(self.date))
    }
}

struct Entry {
    item: WireItem,
    lock: Option<LockState>,
}

impl Entry {
    /// The lock, unless it timed out.
    fn live_lock(&mut self) -> Option<&LockState> {
        if self
            .lock
            .as_ref()
            .is_some_and(|lock| lock.expires_at <= Instant::now())
        {
            trace!("lock expired");
            self.lock = None;
        }
        self.lock.as_ref()
    }

    /// Checks that a write presenting `lock_id` may proceed.
    fn check_write(&mut self, lock_id: Option<&str>, access: LockAccessType) -> CacheResult<()> {
        if access == LockAccessType::IgnoreLock {
            return Ok(());
        }
        match (self.live_lock(), lock_id) {
            (None, _) => Ok(()),
            (Some(lock), Some(id)) if lock.id == id => Ok(()),
            (Some(_), Some(_)) => Err(ServerErrorKind::LockMismatch.into()),
            (Some(_), None) => Err(ServerErrorKind::ItemLocked.into()),
        }
    }
}

/// A change to the store, raised as notifications once the store is unlocked.
enum Change {
    Added {
        key: String,
        item: WireItem,
    },
    Updated {
        key: String,
        old: WireItem,
        new: WireItem,
    },
    Removed {
        key: String,
        item: WireItem,
        reason: RemovedReason,
    },
}

#[derive(Default)]
struct Subscriptions {
    general: HashMap<EventType, DataFilter>,
    notifications: HashSet<NotificationKind>,
    polled: Vec<PolledEvent>,
}

fn event_item(item: &WireItem, filter: DataFilter) -> Option<WireEventItem> {
    if filter == DataFilter::None {
        return None;
    }
    Some(WireEventItem {
        payload: (filter == DataFilter::DataWithMetadata).then(|| item.payload.clone()),
        priority: item.priority,
        absolute_expiration: item.absolute_expiration,
        sliding_expiration: item.sliding_expiration,
        creation_time: item.creation_time,
        last_modified: item.last_modified,
    })
}

/// A cache living in the local process.
///
/// Items are kept as they would be on a server, serialized, so that both
/// engines run the same serialization path. Notifications are raised on the
/// thread that caused them, after the store lock is released.
pub(crate) struct InProcCache {
    store: Mutex<HashMap<String, Entry>>,
    subscriptions: Mutex<Subscriptions>,
    sink: NotificationSink,
}

impl InProcCache {
    pub(crate) fn new(sink: NotificationSink) -> InProcCache {
        InProcCache {
            store: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(Subscriptions::default()),
            sink,
        }
    }

    fn raise(&self, changes: Vec<Change>) {
        if changes.is_empty() {
            return;
        }
        let mut notifications = Vec::new();
        {
            let mut subscriptions = lock(&self.subscriptions);
            for change in changes {
                subscriptions.collect(change, &mut notifications);
            }
        }
        for notification in notifications {
            self.sink.send(notification);
        }
    }

    fn write(&self, key: &str, mut item: WireItem, lock_id: Option<&str>, access: LockAccessType, add: bool) -> CacheResult<()> {
        let now = SystemTime::now();
        item.last_modified = Some(now);
        let change = {
            let mut store = lock(&self.store);
            match store.get_mut(key) {
                Some(_) if add => return Err(ServerErrorKind::KeyAlreadyExists.into()),
                Some(entry) => {
                    entry.check_write(lock_id, access)?;
                    let old = mem::take(&mut entry.item);
                    item.creation_time = old.creation_time;
                    if item.update_callback_id == NO_CALLBACK {
                        item.update_callback_id = old.update_callback_id;
                        item.update_filter = old.update_filter;
                    }
                    if item.remove_callback_id == NO_CALLBACK {
                        item.remove_callback_id = old.remove_callback_id;
                        item.remove_filter = old.remove_filter;
                    }
                    entry.item = item.clone();
                    if matches!(access, LockAccessType::Release | LockAccessType::Default) {
                        entry.lock = None;
                    }
                    Change::Updated {
                        key: key.to_string(),
                        old,
                        new: item,
                    }
                }
                None => {
                    item.creation_time = Some(now);
                    store.insert(
                        key.to_string(),
                        Entry {
                            item: item.clone(),
                            lock: None,
                        },
                    );
                    Change::Added {
                        key: key.to_string(),
                        item,
                    }
                }
            }
        };
        self.raise(vec![change]);
        Ok(())
    }

    fn read(&self, key: &str, options: &ReadOptions) -> LockedRead<WireItem> {
        let mut store = lock(&self.store);
        let Some(entry) = store.get_mut(key) else {
            return (None, None);
        };
        match options.access {
            LockAccessType::Acquire => {
                if let Some(holder) = entry.live_lock() {
                    return (None, Some(holder.handle()));
                }
                let state = LockState::new(options.lock_timeout.unwrap_or_default());
                let handle = state.handle();
                entry.lock = Some(state);
                (Some(entry.item.clone()), Some(handle))
            }
            LockAccessType::DontAcquire => {
                let presented = options.lock_id.as_deref();
                match entry.live_lock() {
                    Some(holder) if Some(holder.id.as_str()) != presented => {
                        (None, Some(holder.handle()))
                    }
                    _ => (Some(entry.item.clone()), None),
                }
            }
            _ => (Some(entry.item.clone()), None),
        }
    }

    fn take(&self, key: &str, lock_id: Option<&str>, access: LockAccessType) -> CacheResult<Option<WirePayload>> {
        let removed = {
            let mut store = lock(&self.store);
            match store.get_mut(key) {
                None => return Ok(None),
                Some(entry) => entry.check_write(lock_id, access)?,
            }
            store.remove(key)
        };
        Ok(removed.map(|entry| {
            let payload = entry.item.payload.clone();
            self.raise(vec![Change::Removed {
                key: key.to_string(),
                item: entry.item,
                reason: RemovedReason::Removed,
            }]);
            payload
        }))
    }

    fn bulk_write(&self, entries: Vec<(String, WireItem)>, add: bool) -> BulkErrors {
        let mut errors = BulkErrors::new();
        for (key, item) in entries {
            if let Err(err) = self.write(&key, item, None, LockAccessType::IgnoreLock, add) {
                errors.insert(key, err);
            }
        }
        errors
    }
}

impl Subscriptions {
    fn collect(&mut self, change: Change, out: &mut Vec<Notification>) {
        match change {
            Change::Added { key, item } => {
                if let Some(filter) = self.general.get(&EventType::ItemAdded) {
                    out.push(Notification::ItemAdded {
                        key,
                        item: event_item(&item, *filter),
                    });
                }
            }
            Change::Updated { key, old, new } => {
                if let Some(filter) = self.general.get(&EventType::ItemUpdated) {
                    out.push(Notification::ItemUpdated {
                        key: key.clone(),
                        item: event_item(&new, *filter),
                        old_item: event_item(&old, *filter),
                    });
                }
                if old.update_callback_id != NO_CALLBACK {
                    if old.callback_type == CallbackType::PullBasedCallback {
                        self.queue(key, old.update_callback_id, EventType::ItemUpdated, out);
                    } else {
                        out.push(Notification::CustomUpdateCallback {
                            callback_id: old.update_callback_id,
                            key,
                            item: event_item(&new, old.update_filter),
                            old_item: event_item(&old, old.update_filter),
                        });
                    }
                }
            }
            Change::Removed { key, item, reason } => {
                if let Some(filter) = self.general.get(&EventType::ItemRemoved) {
                    out.push(Notification::ItemRemoved {
                        key: key.clone(),
                        item: event_item(&item, *filter),
                        reason,
                    });
                }
                if item.remove_callback_id != NO_CALLBACK {
                    if item.callback_type == CallbackType::PullBasedCallback {
                        self.queue(key, item.remove_callback_id, EventType::ItemRemoved, out);
                    } else {
                        out.push(Notification::CustomRemoveCallback {
                            callback_id: item.remove_callback_id,
                            key,
                            item: event_item(&item, item.remove_filter),
                            reason,
                        });
                    }
                }
            }
        }
    }

    fn queue(&mut self, key: String, callback_id: i16, event_type: EventType, out: &mut Vec<Notification>) {
        self.polled.push(PolledEvent {
            key,
            callback_id,
            event_type,
        });
        if self.notifications.contains(&NotificationKind::PollReady) {
            out.push(Notification::PollNotify {
                callback_id,
                event_type,
            });
        }
    }
}

impl CacheImpl for InProcCache {
    fn add(&self, key: &str, item: WireItem) -> CacheResult<()> {
        self.write(key, item, None, LockAccessType::IgnoreLock, true)
    }

    fn insert(
        &self,
        key: &str,
        item: WireItem,
        lock_id: Option<String>,
        access: LockAccessType,
    ) -> CacheResult<()> {
        self.write(key, item, lock_id.as_deref(), access, false)
    }

    fn get(&self, key: &str, options: ReadOptions) -> CacheResult<LockedRead<WirePayload>> {
        let (item, handle) = self.read(key, &options);
        Ok((item.map(|item| item.payload), handle))
    }

    fn get_cache_item(
        &self,
        key: &str,
        options: ReadOptions,
    ) -> CacheResult<LockedRead<WireItem>> {
        Ok(self.read(key, &options))
    }

    fn contains(&self, key: &str) -> CacheResult<bool> {
        Ok(lock(&self.store).contains_key(key))
    }

    fn remove(
        &self,
        key: &str,
        lock_id: Option<String>,
        access: LockAccessType,
    ) -> CacheResult<Option<WirePayload>> {
        self.take(key, lock_id.as_deref(), access)
    }

    fn delete(
        &self,
        key: &str,
        lock_id: Option<String>,
        access: LockAccessType,
    ) -> CacheResult<()> {
        self.take(key, lock_id.as_deref(), access).map(|_| ())
    }

    fn count(&self) -> CacheResult<u64> {
        Ok(lock(&self.store).len() as u64)
    }

    fn clear(&self) -> CacheResult<()> {
        let drained: Vec<_> = lock(&self.store).drain().collect();
        debug!("cleared {} items", drained.len());
        self.raise(
            drained
                .into_iter()
                .map(|(key, entry)| Change::Removed {
                    key,
                    item: entry.item,
                    reason: RemovedReason::Removed,
                })
                .collect(),
        );
        Ok(())
    }

    fn lock(&self, key: &str, timeout: Duration) -> CacheResult<(bool, LockHandle)> {
        let mut store = lock(&self.store);
        let Some(entry) = store.get_mut(key) else {
            return Ok((false, LockHandle::default()));
        };
        if let Some(holder) = entry.live_lock() {
            return Ok((false, holder.handle()));
        }
        let state = LockState::new(timeout);
        let handle = state.handle();
        entry.lock = Some(state);
        Ok((true, handle))
    }

    fn unlock(&self, key: &str, lock_id: Option<String>, force: bool) -> CacheResult<()> {
        let mut store = lock(&self.store);
        let Some(entry) = store.get_mut(key) else {
            return Ok(());
        };
        match (entry.live_lock(), lock_id) {
            (None, _) => Ok(()),
            (Some(_), _) if force => {
                entry.lock = None;
                Ok(())
            }
            (Some(holder), Some(id)) if holder.id == id => {
                entry.lock = None;
                Ok(())
            }
            (Some(_), _) => Err(ServerErrorKind::LockMismatch.into()),
        }
    }

    fn is_locked(&self, key: &str) -> CacheResult<(bool, LockHandle)> {
        let mut store = lock(&self.store);
        Ok(match store.get_mut(key).and_then(Entry::live_lock) {
            Some(holder) => (true, holder.handle()),
            None => (false, LockHandle::default()),
        })
    }

    fn add_bulk(&self, entries: Vec<(String, WireItem)>) -> CacheResult<BulkErrors> {
        Ok(self.bulk_write(entries, true))
    }

    fn insert_bulk(&self, entries: Vec<(String, WireItem)>) -> CacheResult<BulkErrors> {
        Ok(self.bulk_write(entries, false))
    }

    fn get_bulk(&self, keys: Vec<String>) -> CacheResult<BulkRead<WirePayload>> {
        let mut read = BulkRead::default();
        for key in keys {
            if let (Some(item), _) = self.read(&key, &ReadOptions::plain()) {
                read.values.insert(key, item.payload);
            }
        }
        Ok(read)
    }

    fn get_cache_item_bulk(&self, keys: Vec<String>) -> CacheResult<BulkRead<WireItem>> {
        let mut read = BulkRead::default();
        for key in keys {
            if let (Some(item), _) = self.read(&key, &ReadOptions::plain()) {
                read.values.insert(key, item);
            }
        }
        Ok(read)
    }

    fn contains_bulk(&self, keys: Vec<String>) -> CacheResult<BulkRead<bool>> {
        let store = lock(&self.store);
        let mut read = BulkRead::default();
        for key in keys {
            let found = store.contains_key(&key);
            read.values.insert(key, found);
        }
        Ok(read)
    }

    fn remove_bulk(&self, keys: Vec<String>) -> CacheResult<BulkRead<WirePayload>> {
        let mut read = BulkRead::default();
        for key in keys {
            match self.take(&key, None, LockAccessType::IgnoreLock) {
                Ok(Some(payload)) => read.values.insert(key, payload),
                Ok(None) => {}
                Err(err) => read.failures.insert(key, err),
            }
        }
        Ok(read)
    }

    fn delete_bulk(&self, keys: Vec<String>) -> CacheResult<BulkErrors> {
        let mut errors = BulkErrors::new();
        for key in keys {
            if let Err(err) = self.take(&key, None, LockAccessType::IgnoreLock) {
                errors.insert(key, err);
            }
        }
        Ok(errors)
    }

    fn register_key_notification(&self, key: &str, callbacks: KeyCallbacks) -> CacheResult<()> {
        let mut store = lock(&self.store);
        let Some(entry) = store.get_mut(key) else {
            trace!("not binding callbacks to missing key {key}");
            return Ok(());
        };
        let item = &mut entry.item;
        if callbacks.update_callback_id != NO_CALLBACK {
            item.update_callback_id = callbacks.update_callback_id;
            item.update_filter = callbacks.update_filter;
        }
        if callbacks.remove_callback_id != NO_CALLBACK {
            item.remove_callback_id = callbacks.remove_callback_id;
            item.remove_filter = callbacks.remove_filter;
        }
        item.callback_type = callbacks.callback_type;
        Ok(())
    }

    fn unregister_key_notification(
        &self,
        key: &str,
        update_callback_id: i16,
        remove_callback_id: i16,
    ) -> CacheResult<()> {
        let mut store = lock(&self.store);
        if let Some(entry) = store.get_mut(key) {
            let item = &mut entry.item;
            if update_callback_id != NO_CALLBACK && item.update_callback_id == update_callback_id {
                item.update_callback_id = NO_CALLBACK;
            }
            if remove_callback_id != NO_CALLBACK && item.remove_callback_id == remove_callback_id {
                item.remove_callback_id = NO_CALLBACK;
            }
        }
        Ok(())
    }

    fn apply_registration(&self, change: RegistrationChange) -> CacheResult<()> {
        let mut subscriptions = lock(&self.subscriptions);
        match change {
            RegistrationChange::Register {
                event_type, filter, ..
            } => {
                subscriptions.general.insert(event_type, filter);
            }
            RegistrationChange::Unregister { event_type, .. } => {
                subscriptions.general.remove(&event_type);
            }
        }
        Ok(())
    }

    fn register_notification(&self, kind: NotificationKind) -> CacheResult<()> {
        lock(&self.subscriptions).notifications.insert(kind);
        Ok(())
    }

    fn unregister_notification(&self, kind: NotificationKind) -> CacheResult<()> {
        lock(&self.subscriptions).notifications.remove(&kind);
        Ok(())
    }

    fn raise_custom_event(&self, notif_id: WirePayload, data: WirePayload) -> CacheResult<()> {
        let subscribed = lock(&self.subscriptions)
            .notifications
            .contains(&NotificationKind::CustomEvent);
        if subscribed {
            self.sink
                .send(Notification::CustomNotification { notif_id, data });
        }
        Ok(())
    }

    fn poll(&self) -> CacheResult<PollingResult> {
        let events = mem::take(&mut lock(&self.subscriptions).polled);
        Ok(PollingResult { events })
    }

    fn dispose(&self) {
        lock(&self.store).clear();
        let stopped = {
            let mut subscriptions = lock(&self.subscriptions);
            let stopped = subscriptions
                .notifications
                .contains(&NotificationKind::CacheStopped);
            *subscriptions = Subscriptions::default();
            stopped
        };
        if stopped {
            self.sink.send(Notification::CacheStopped);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use crate::types::BitSet;

    fn item(bytes: &[u8]) -> WireItem {
        WireItem {
            payload: WirePayload {
                bytes: bytes.to_vec(),
                flags: BitSet::BINARY_DATA,
            },
            update_callback_id: NO_CALLBACK,
            remove_callback_id: NO_CALLBACK,
            ..WireItem::default()
        }
    }

    fn engine() -> InProcCache {
        InProcCache::new(NotificationSink::new())
    }

    #[test]
    fn test_add_rejects_existing_keys() {
        let cache = engine();
        cache.add("a", item(b"1")).unwrap();
        let err = cache.add("a", item(b"2")).unwrap_err();
        assert_eq!(
            err.kind(),
            ErrorKind::ServerError(ServerErrorKind::KeyAlreadyExists)
        );
    }

    #[test]
    fn test_lock_round_trip() {
        let cache = engine();
        cache.add("a", item(b"1")).unwrap();
        let (acquired, handle) = cache.lock("a", Duration::from_secs(10)).unwrap();
        assert!(acquired);

        let (again, holder) = cache.lock("a", Duration::from_secs(10)).unwrap();
        assert!(!again);
        assert_eq!(holder.lock_id, handle.lock_id);

        let err = cache.unlock("a", Some("someone-else".into()), false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ServerError(ServerErrorKind::LockMismatch));
        let err = cache.unlock("a", None, false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ServerError(ServerErrorKind::LockMismatch));
        cache.unlock("a", handle.lock_id.clone(), false).unwrap();
        assert!(!cache.is_locked("a").unwrap().0);
    }

    #[test]
    fn test_expired_locks_are_released() {
        let cache = engine();
        cache.add("a", item(b"1")).unwrap();
        cache.lock("a", Duration::ZERO).unwrap();
        assert!(!cache.is_locked("a").unwrap().0);
    }

    #[test]
    fn test_locked_writes_need_the_lock() {
        let cache = engine();
        cache.add("a", item(b"1")).unwrap();
        let (_, handle) = cache.lock("a", Duration::from_secs(10)).unwrap();

        let err = cache
            .insert("a", item(b"2"), None, LockAccessType::Default)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ServerError(ServerErrorKind::ItemLocked));

        cache
            .insert("a", item(b"2"), handle.lock_id.clone(), LockAccessType::DontRelease)
            .unwrap();
        assert!(cache.is_locked("a").unwrap().0);
        cache
            .insert("a", item(b"3"), handle.lock_id, LockAccessType::Release)
            .unwrap();
        assert!(!cache.is_locked("a").unwrap().0);
    }

    #[test]
    fn test_acquiring_read_reports_holder() {
        let cache = engine();
        cache.add("a", item(b"1")).unwrap();
        let options = ReadOptions {
            lock_id: None,
            access: LockAccessType::Acquire,
            lock_timeout: Some(Duration::from_secs(10)),
        };
        let (value, first) = cache.get("a", options.clone()).unwrap();
        assert!(value.is_some());
        let (value, second) = cache.get("a", options).unwrap();
        assert!(value.is_none());
        assert_eq!(first, second);
    }
}
