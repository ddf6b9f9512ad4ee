//! The cache handle applications talk to.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use arcstr::ArcStr;
use log::{debug, trace};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::bulk::{self, BulkErrors, BulkRead};
use crate::cache_impl::{CacheImpl, InProcCache, KeyCallbacks, ReadOptions, RemoteCache};
use crate::callback_registry::{CallbackRegistry, RegistrationChange, SelectiveKind};
use crate::command::{NotificationKind, WireItem, WirePayload};
use crate::config::{CacheBuilder, CacheConfig, EngineMode};
use crate::errors::CacheError;
use crate::event_dispatch::{EventDispatchBridge, NotificationSink};
use crate::events::{
    CacheStoppedCallback, CustomEventCallback, DataCallback, EventDescriptor,
    EventRegistrationInfo, MemberCallback, PollCallback, PollingResult,
};
use crate::lock::{self, LockCoordinator};
use crate::serialization::{Codec, Serializer};
use crate::types::{
    BitSet, CacheItem, CacheResult, CallbackType, DataFilter, EventType, EventTypes, ItemValue,
    LockAccessType, LockHandle, NO_CALLBACK, validate_key,
};

/// Counters of one cache, shared by all its handles.
#[derive(Debug, Default)]
pub struct CacheStats {
    operations: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    events: AtomicU64,
}

impl CacheStats {
    /// Public operations issued.
    pub fn operations(&self) -> u64 {
        self.operations.load(Ordering::Relaxed)
    }

    /// Reads that found their key.
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Reads that did not find their key.
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Notifications handed to the dispatcher.
    pub fn events_processed(&self) -> u64 {
        self.events.load(Ordering::Relaxed)
    }

    pub(crate) fn record_operation(&self) {
        self.operations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_read(&self, found: bool) {
        if found {
            self.record_reads(1, 0);
        } else {
            self.record_reads(0, 1);
        }
    }

    pub(crate) fn record_reads(&self, hits: u64, misses: u64) {
        self.hits.fetch_add(hits, Ordering::Relaxed);
        self.misses.fetch_add(misses, Ordering::Relaxed);
    }

    pub(crate) fn record_event(&self) {
        self.events.fetch_add(1, Ordering::Relaxed);
    }
}

/// Item-level callbacks a key was last written with.
#[derive(Default)]
struct KeyBinding {
    update: Option<DataCallback>,
    remove: Option<DataCallback>,
}

impl KeyBinding {
    fn of(item: &CacheItem) -> KeyBinding {
        KeyBinding {
            update: item.update_callback.clone(),
            remove: item.remove_callback.clone(),
        }
    }

    fn is_empty(&self) -> bool {
        self.update.is_none() && self.remove.is_none()
    }
}

/// State shared by every handle of one cache.
pub(crate) struct CacheInner {
    config: CacheConfig,
    pub(crate) codec: Codec,
    pub(crate) registry: CallbackRegistry,
    pub(crate) stats: CacheStats,
    engine: RwLock<Option<Arc<dyn CacheImpl>>>,
    bindings: Mutex<HashMap<String, KeyBinding>>,
    handles: Mutex<usize>,
    locks: LockCoordinator,
    bridge: Arc<EventDispatchBridge>,
    sink: NotificationSink,
}

impl CacheInner {
    pub(crate) fn name(&self) -> &ArcStr {
        &self.config.name
    }

    fn engine(&self) -> CacheResult<Arc<dyn CacheImpl>> {
        self.engine
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(CacheError::not_initialized)
    }

    fn bindings(&self) -> std::sync::MutexGuard<'_, HashMap<String, KeyBinding>> {
        self.bindings.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records the callbacks `key` now carries after a successful write,
    /// dropping the references held by the item it replaced. Every key holds
    /// at most one reference per callback kind.
    fn rebind(&self, key: &str, item: &CacheItem) {
        let binding = KeyBinding::of(item);
        let previous = if binding.is_empty() {
            self.bindings().remove(key)
        } else {
            self.bindings().insert(key.to_string(), binding)
        };
        if let Some(previous) = previous {
            self.release_binding(previous);
        }
    }

    /// Drops the update callback of a key that was removed. Its remove
    /// callback stays bound until the removal is delivered.
    fn unbind_updates(&self, key: &str) {
        let update = {
            let mut bindings = self.bindings();
            let Some(binding) = bindings.get_mut(key) else {
                return;
            };
            let update = binding.update.take();
            if binding.is_empty() {
                bindings.remove(key);
            }
            update
        };
        self.release_binding(KeyBinding {
            update,
            remove: None,
        });
    }

    /// Called once the remove callback of `key` fired: the item is gone, so
    /// its callbacks are released.
    pub(crate) fn removal_delivered(&self, key: &str, callback: &DataCallback) {
        let binding = {
            let mut bindings = self.bindings();
            match bindings.get(key) {
                Some(binding) if binding.remove.as_ref() == Some(callback) => bindings.remove(key),
                _ => None,
            }
        };
        if let Some(binding) = binding {
            trace!("Releasing callbacks of removed key {key}");
            self.release_binding(binding);
        }
    }

    fn release_binding(&self, binding: KeyBinding) {
        if let Some(callback) = &binding.update {
            self.registry.unregister_selective(callback, EventTypes::UPDATED);
        }
        if let Some(callback) = &binding.remove {
            self.registry.unregister_selective(callback, EventTypes::REMOVED);
        }
    }

    /// Issues every live registration again, after the transport lost and
    /// re-established its connections.
    pub(crate) fn reissue_registrations(&self) -> CacheResult<()> {
        let engine = self.engine()?;
        let registrations = self.registry.event_registrations();
        debug!("Reissuing {} general registrations", registrations.len());
        for info in registrations {
            engine.apply_registration(RegistrationChange::Register {
                event_type: info.event_type,
                filter: info.data_filter,
                sequence: info.sequence,
            })?;
        }
        let lists = [
            (NotificationKind::CustomEvent, self.registry.custom.is_empty()),
            (NotificationKind::CacheStopped, self.registry.cache_stopped.is_empty()),
            (NotificationKind::MemberJoined, self.registry.member_joined.is_empty()),
            (NotificationKind::MemberLeft, self.registry.member_left.is_empty()),
            (NotificationKind::PollReady, self.registry.poll.is_empty()),
        ];
        for (kind, empty) in lists {
            if !empty {
                engine.register_notification(kind)?;
            }
        }
        Ok(())
    }

    /// Drops one handle, tearing the cache down with the last one.
    fn release(&self) {
        let mut handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
        *handles = handles.saturating_sub(1);
        if *handles > 0 {
            trace!("{} handles left on cache {}", *handles, self.name());
            return;
        }
        let engine = self
            .engine
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(engine) = engine {
            debug!("Last handle released, disposing cache {}", self.name());
            engine.dispose();
            self.sink.detach();
            self.bindings().clear();
            self.registry.clear();
        }
    }
}

/// A handle to one cache.
///
/// Handles are reference-counted: every clone is a handle of its own, and
/// the engine is torn down when the last one is disposed or dropped. A
/// disposed handle answers every operation with
/// [`ErrorKind::NotInitialized`](crate::ErrorKind::NotInitialized).
///
/// All operations block until the engine answered. When the cache was
/// configured with exceptions disabled, failures other than
/// `NotInitialized` are logged and an empty result is returned instead.
pub struct Cache {
    inner: Arc<CacheInner>,
    disposed: AtomicBool,
}

impl Cache {
    /// Creates a [`CacheBuilder`] for the cache called `name`.
    pub fn builder(name: impl Into<String>) -> CacheBuilder {
        CacheBuilder::new(name)
    }

    /// Opens a cache with the given settings.
    ///
    /// For a remote cache this hands the transport the sink notifications
    /// must be delivered to.
    pub fn open(config: CacheConfig) -> CacheResult<Cache> {
        let sink = NotificationSink::new();
        let engine: Arc<dyn CacheImpl> = match &config.mode {
            EngineMode::InProc => Arc::new(InProcCache::new(sink.clone())),
            EngineMode::Remote(transport) => {
                Arc::new(RemoteCache::new(transport.clone(), sink.clone()))
            }
        };
        debug!("Opening cache {} ({:?})", config.name, config.mode);
        let codec = Codec::new(config.format, config.compression_threshold);
        let locks = LockCoordinator::new(config.default_lock_timeout);
        let inner = Arc::new_cyclic(|cache| CacheInner {
            config,
            codec,
            registry: CallbackRegistry::new(),
            stats: CacheStats::default(),
            engine: RwLock::new(Some(engine)),
            bindings: Mutex::new(HashMap::new()),
            handles: Mutex::new(1),
            locks,
            bridge: Arc::new(EventDispatchBridge::new(cache.clone())),
            sink: sink.clone(),
        });
        sink.replace_bridge(&inner.bridge);
        Ok(Cache {
            inner,
            disposed: AtomicBool::new(false),
        })
    }

    /// Name of the cache.
    pub fn name(&self) -> &str {
        self.inner.name()
    }

    /// Settings the cache was opened with.
    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Counters of the cache.
    pub fn stats(&self) -> &CacheStats {
        &self.inner.stats
    }

    /// Releases this handle. Further calls through it fail with
    /// `NotInitialized`; other handles are unaffected until the last one
    /// goes away.
    pub fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::AcqRel) {
            self.inner.release();
        }
    }

    /// Returns true once this handle was disposed.
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    fn engine(&self) -> CacheResult<Arc<dyn CacheImpl>> {
        if self.is_disposed() {
            return Err(CacheError::not_initialized());
        }
        self.inner.engine()
    }

    /// Runs one public operation, applying the exceptions-enabled policy.
    fn run<T: Default>(
        &self,
        operation: &'static str,
        f: impl FnOnce(&dyn CacheImpl) -> CacheResult<T>,
    ) -> CacheResult<T> {
        trace!("{operation} on {}", self.name());
        self.inner.stats.record_operation();
        let result = self.engine().and_then(|engine| f(&*engine));
        match result {
            Err(err) if !self.inner.config.exceptions_enabled && !err.is_not_initialized() => {
                debug!("Suppressing {operation} failure: {err}");
                Ok(T::default())
            }
            result => result,
        }
    }

    fn encode(&self, value: &ItemValue) -> CacheResult<WirePayload> {
        let mut flags = BitSet::new();
        let bytes = self.inner.codec.serialize(value, &mut flags)?;
        Ok(WirePayload { bytes, flags })
    }

    fn decode<T: DeserializeOwned>(&self, payload: &WirePayload) -> CacheResult<T> {
        self.decode_value(payload)?.into_typed()
    }

    fn decode_value(&self, payload: &WirePayload) -> CacheResult<ItemValue> {
        self.inner.codec.deserialize(&payload.bytes, payload.flags)
    }

    /// Serializes `item` for the wire. Callback ids are left unbound.
    fn to_wire(&self, item: &CacheItem, lock: Option<&LockHandle>) -> CacheResult<WireItem> {
        item.validate_expirations()?;
        let mut flags = item.flags;
        let bytes = self.inner.codec.serialize(&item.value, &mut flags)?;
        lock::apply_lock_flag(&mut flags, lock);
        Ok(WireItem {
            payload: WirePayload { bytes, flags },
            absolute_expiration: item.absolute_expiration,
            sliding_expiration: item.sliding_expiration,
            priority: item.priority,
            callback_type: item.callback_type,
            ..WireItem::default()
        })
    }

    fn to_cache_item(&self, wire: WireItem) -> CacheResult<CacheItem> {
        let value = self.decode_value(&wire.payload)?;
        let registry = &self.inner.registry;
        Ok(CacheItem {
            value,
            absolute_expiration: wire.absolute_expiration,
            sliding_expiration: wire.sliding_expiration,
            priority: wire.priority,
            flags: wire.payload.flags,
            creation_time: wire.creation_time,
            last_modified: wire.last_modified,
            update_callback: registry
                .selective(SelectiveKind::Update, wire.update_callback_id)
                .map(|(callback, _)| callback),
            update_filter: wire.update_filter,
            remove_callback: registry
                .selective(SelectiveKind::Remove, wire.remove_callback_id)
                .map(|(callback, _)| callback),
            remove_filter: wire.remove_filter,
            callback_type: wire.callback_type,
        })
    }

    /// Allocates ids for the callbacks `item` carries.
    fn bind_callbacks(&self, item: &CacheItem, wire: &mut WireItem) -> CacheResult<()> {
        let registry = &self.inner.registry;
        if let Some(callback) = &item.update_callback {
            wire.update_callback_id =
                registry.register_selective(callback, EventTypes::UPDATED, item.update_filter)?[0];
            wire.update_filter = item.update_filter;
        }
        if let Some(callback) = &item.remove_callback {
            match registry.register_selective(callback, EventTypes::REMOVED, item.remove_filter) {
                Ok([_, remove_id]) => {
                    wire.remove_callback_id = remove_id;
                    wire.remove_filter = item.remove_filter;
                }
                Err(err) => {
                    if let Some(update) = &item.update_callback {
                        registry.unregister_selective(update, EventTypes::UPDATED);
                    }
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// Undoes [`Cache::bind_callbacks`] after a failed write.
    fn unbind_callbacks(&self, item: &CacheItem) {
        let registry = &self.inner.registry;
        if let Some(callback) = &item.update_callback {
            registry.unregister_selective(callback, EventTypes::UPDATED);
        }
        if let Some(callback) = &item.remove_callback {
            registry.unregister_selective(callback, EventTypes::REMOVED);
        }
    }

    fn write_item(
        &self,
        engine: &dyn CacheImpl,
        key: &str,
        item: &CacheItem,
        write: impl FnOnce(&dyn CacheImpl, WireItem) -> CacheResult<()>,
        lock: Option<&LockHandle>,
    ) -> CacheResult<()> {
        validate_key(key)?;
        let mut wire = self.to_wire(item, lock)?;
        self.bind_callbacks(item, &mut wire)?;
        match write(engine, wire) {
            Ok(()) => {
                self.inner.rebind(key, item);
                Ok(())
            }
            Err(err) => {
                self.unbind_callbacks(item);
                Err(err)
            }
        }
    }

    fn write_bulk(
        &self,
        engine: &dyn CacheImpl,
        items: Vec<(String, CacheItem)>,
        write: impl FnOnce(&dyn CacheImpl, Vec<(String, WireItem)>) -> CacheResult<BulkErrors>,
    ) -> CacheResult<BulkErrors> {
        let mut wires = Vec::with_capacity(items.len());
        for (key, item) in &items {
            wires.push((key.clone(), self.to_wire(item, None)?));
        }
        for (index, ((_, item), (_, wire))) in items.iter().zip(wires.iter_mut()).enumerate() {
            if let Err(err) = self.bind_callbacks(item, wire) {
                for (_, bound) in &items[..index] {
                    self.unbind_callbacks(bound);
                }
                return Err(err);
            }
        }
        let result = write(engine, wires);
        match &result {
            Ok(errors) => {
                for (key, item) in &items {
                    if errors.contains_key(key) {
                        self.unbind_callbacks(item);
                    } else {
                        self.inner.rebind(key, item);
                    }
                }
            }
            Err(_) => items.iter().for_each(|(_, item)| self.unbind_callbacks(item)),
        }
        result
    }

    /// Stores a value under `key`, failing if the key exists.
    pub fn add<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> CacheResult<()> {
        self.run("add", |engine| {
            let item = CacheItem::from_serialize(value)?;
            self.write_item(engine, key, &item, |engine, wire| engine.add(key, wire), None)
        })
    }

    /// Stores `item` under `key`, failing if the key exists.
    pub fn add_item(&self, key: &str, item: &CacheItem) -> CacheResult<()> {
        self.run("add", |engine| {
            self.write_item(engine, key, item, |engine, wire| engine.add(key, wire), None)
        })
    }

    /// Stores a value under `key`, overwriting any previous one.
    pub fn insert<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> CacheResult<()> {
        self.run("insert", |engine| {
            let item = CacheItem::from_serialize(value)?;
            self.write_item(
                engine,
                key,
                &item,
                |engine, wire| engine.insert(key, wire, None, LockAccessType::IgnoreLock),
                None,
            )
        })
    }

    /// Stores `item` under `key`, overwriting any previous one. Locks are
    /// ignored.
    pub fn insert_item(&self, key: &str, item: &CacheItem) -> CacheResult<()> {
        self.insert_with_lock(key, item, None, false)
    }

    /// Stores `item` under `key`, honoring the lock when `lock` is given.
    ///
    /// Without a lock the write ignores locks. With one, the write fails
    /// unless it names the current holder, and `release_lock` decides
    /// whether the lock is let go afterwards.
    pub fn insert_with_lock(
        &self,
        key: &str,
        item: &CacheItem,
        lock: Option<&LockHandle>,
        release_lock: bool,
    ) -> CacheResult<()> {
        let access = lock::insert_access(lock, release_lock);
        self.run("insert", |engine| {
            self.write_item(
                engine,
                key,
                item,
                |engine, wire| engine.insert(key, wire, lock::lock_id(lock), access),
                lock,
            )
        })
    }

    /// Reads and decodes the value under `key`.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> CacheResult<Option<T>> {
        let mut flags = BitSet::new();
        self.get_with_flags(key, &mut flags)
    }

    /// Reads the value under `key` without typing it.
    pub fn get_value(&self, key: &str) -> CacheResult<Option<ItemValue>> {
        self.run("get", |engine| {
            validate_key(key)?;
            let (payload, _) = engine.get(key, ReadOptions::plain())?;
            self.inner.stats.record_read(payload.is_some());
            payload.map(|payload| self.decode_value(&payload)).transpose()
        })
    }

    /// Reads the value under `key`, adding the flags it was stored with to
    /// `flags`.
    pub fn get_with_flags<T: DeserializeOwned>(
        &self,
        key: &str,
        flags: &mut BitSet,
    ) -> CacheResult<Option<T>> {
        self.run("get", |engine| {
            validate_key(key)?;
            let (payload, _) = engine.get(key, ReadOptions::plain())?;
            self.inner.stats.record_read(payload.is_some());
            match payload {
                Some(payload) => {
                    *flags |= payload.flags;
                    self.decode(&payload).map(Some)
                }
                None => Ok(None),
            }
        })
    }

    /// Reads the value under `key` and, with `acquire`, takes its lock.
    ///
    /// When the lock is taken, or the item is locked by someone else,
    /// `handle` is overwritten with the holder. A locked item reads as
    /// `None` unless `handle` names its holder.
    pub fn get_with_lock<T: DeserializeOwned>(
        &self,
        key: &str,
        lock_timeout: Option<Duration>,
        handle: &mut LockHandle,
        acquire: bool,
    ) -> CacheResult<Option<T>> {
        self.run("get_with_lock", |engine| {
            validate_key(key)?;
            let options = ReadOptions {
                lock_id: if acquire { None } else { handle.lock_id.clone() },
                access: lock::get_access(acquire),
                lock_timeout: Some(self.inner.locks.timeout(lock_timeout)),
            };
            let (payload, holder) = engine.get(key, options)?;
            if let Some(holder) = holder {
                *handle = holder;
            }
            self.inner.stats.record_read(payload.is_some());
            payload.map(|payload| self.decode(&payload)).transpose()
        })
    }

    /// Reads the item under `key` with its metadata.
    pub fn get_cache_item(&self, key: &str) -> CacheResult<Option<CacheItem>> {
        self.run("get_cache_item", |engine| {
            validate_key(key)?;
            let (item, _) = engine.get_cache_item(key, ReadOptions::plain())?;
            self.inner.stats.record_read(item.is_some());
            item.map(|item| self.to_cache_item(item)).transpose()
        })
    }

    /// Returns true if `key` is present.
    pub fn contains(&self, key: &str) -> CacheResult<bool> {
        self.run("contains", |engine| {
            validate_key(key)?;
            engine.contains(key)
        })
    }

    /// Removes `key`, returning the value it held.
    pub fn remove<T: DeserializeOwned>(&self, key: &str) -> CacheResult<Option<T>> {
        self.remove_with_lock(key, None)
    }

    /// Removes `key`, honoring and releasing the lock when `lock` is given.
    pub fn remove_with_lock<T: DeserializeOwned>(
        &self,
        key: &str,
        lock: Option<&LockHandle>,
    ) -> CacheResult<Option<T>> {
        self.run("remove", |engine| {
            validate_key(key)?;
            let removed = engine.remove(key, lock::lock_id(lock), lock::remove_access(lock))?;
            self.inner.unbind_updates(key);
            removed.map(|payload| self.decode(&payload)).transpose()
        })
    }

    /// Removes `key` without reading its value.
    pub fn delete(&self, key: &str) -> CacheResult<()> {
        self.delete_with_lock(key, None)
    }

    /// Removes `key` without reading its value, honoring and releasing the
    /// lock when `lock` is given.
    pub fn delete_with_lock(&self, key: &str, lock: Option<&LockHandle>) -> CacheResult<()> {
        self.run("delete", |engine| {
            validate_key(key)?;
            engine.delete(key, lock::lock_id(lock), lock::remove_access(lock))?;
            self.inner.unbind_updates(key);
            Ok(())
        })
    }

    /// Number of items in the cache.
    pub fn count(&self) -> CacheResult<u64> {
        self.run("count", |engine| engine.count())
    }

    /// Removes every item.
    pub fn clear(&self) -> CacheResult<()> {
        self.run("clear", |engine| {
            engine.clear()?;
            let keys: Vec<String> = self.inner.bindings().keys().cloned().collect();
            for key in keys {
                self.inner.unbind_updates(&key);
            }
            Ok(())
        })
    }

    /// Tries to lock `key`. A `None` or zero timeout uses the configured
    /// default.
    ///
    /// Finding the key locked by someone else is not an error: the result
    /// is `false` with a handle that holds no id.
    pub fn lock(&self, key: &str, timeout: Option<Duration>) -> CacheResult<(bool, LockHandle)> {
        self.run("lock", |engine| {
            validate_key(key)?;
            self.inner.locks.lock(engine, key, timeout)
        })
    }

    /// Releases the lock on `key`.
    ///
    /// With a handle, the call fails unless it names the current holder.
    /// Without one, the lock is broken whoever holds it.
    pub fn unlock(&self, key: &str, lock: Option<&LockHandle>) -> CacheResult<()> {
        self.run("unlock", |engine| {
            validate_key(key)?;
            self.inner.locks.unlock(engine, key, lock)
        })
    }

    /// Returns true if `key` is locked, copying the holder into `handle`.
    pub fn is_locked(&self, key: &str, handle: &mut LockHandle) -> CacheResult<bool> {
        self.run("is_locked", |engine| {
            validate_key(key)?;
            self.inner.locks.is_locked(engine, key, handle)
        })
    }

    /// Adds every item whose key is not present yet.
    ///
    /// Returns the keys that could not be added; every other key succeeded.
    pub fn add_bulk<K: AsRef<str>>(&self, items: &[(K, CacheItem)]) -> CacheResult<BulkErrors> {
        self.run("add_bulk", |engine| {
            let items = bulk::prepare_items(items)?;
            self.write_bulk(engine, items, |engine, wires| engine.add_bulk(wires))
        })
    }

    /// Stores every item, overwriting previous ones.
    ///
    /// Returns the keys that could not be written; every other key succeeded.
    pub fn insert_bulk<K: AsRef<str>>(
        &self,
        items: &[(K, CacheItem)],
    ) -> CacheResult<BulkErrors> {
        self.run("insert_bulk", |engine| {
            let items = bulk::prepare_items(items)?;
            self.write_bulk(engine, items, |engine, wires| engine.insert_bulk(wires))
        })
    }

    /// Reads and decodes the values under `keys`. Values that fail to
    /// decode are reported as failures of their key.
    pub fn get_bulk<T: DeserializeOwned, K: AsRef<str>>(
        &self,
        keys: &[K],
    ) -> CacheResult<BulkRead<T>> {
        self.run("get_bulk", |engine| {
            let keys = bulk::prepare_keys(keys)?;
            let requested = keys.len();
            let read = engine.get_bulk(keys)?;
            self.record_bulk_read(requested, read.values.len());
            Ok(read.try_map(|_, payload| self.decode(&payload)))
        })
    }

    /// Reads the items under `keys` with their metadata.
    pub fn get_cache_item_bulk<K: AsRef<str>>(
        &self,
        keys: &[K],
    ) -> CacheResult<BulkRead<CacheItem>> {
        self.run("get_cache_item_bulk", |engine| {
            let keys = bulk::prepare_keys(keys)?;
            let requested = keys.len();
            let read = engine.get_cache_item_bulk(keys)?;
            self.record_bulk_read(requested, read.values.len());
            Ok(read.try_map(|_, item| self.to_cache_item(item)))
        })
    }

    /// Checks which of `keys` are present.
    pub fn contains_bulk<K: AsRef<str>>(&self, keys: &[K]) -> CacheResult<BulkRead<bool>> {
        self.run("contains_bulk", |engine| {
            engine.contains_bulk(bulk::prepare_keys(keys)?)
        })
    }

    /// Removes `keys`, returning the values they held.
    pub fn remove_bulk<T: DeserializeOwned, K: AsRef<str>>(
        &self,
        keys: &[K],
    ) -> CacheResult<BulkRead<T>> {
        self.run("remove_bulk", |engine| {
            let keys = bulk::prepare_keys(keys)?;
            let read = engine.remove_bulk(keys.clone())?;
            self.unbind_removed(&keys, &read.failures);
            Ok(read.try_map(|_, payload| self.decode(&payload)))
        })
    }

    /// Removes `keys` without reading their values.
    pub fn delete_bulk<K: AsRef<str>>(&self, keys: &[K]) -> CacheResult<BulkErrors> {
        self.run("delete_bulk", |engine| {
            let keys = bulk::prepare_keys(keys)?;
            let errors = engine.delete_bulk(keys.clone())?;
            self.unbind_removed(&keys, &errors);
            Ok(errors)
        })
    }

    fn unbind_removed(&self, keys: &[String], failures: &BulkErrors) {
        for key in keys.iter().filter(|key| !failures.contains_key(key)) {
            self.inner.unbind_updates(key);
        }
    }

    fn record_bulk_read(&self, requested: usize, found: usize) {
        let found = found as u64;
        self.inner
            .stats
            .record_reads(found, (requested as u64).saturating_sub(found));
    }

    /// Binds `callback` to the update and/or remove events of an existing
    /// key.
    pub fn register_key_notification(
        &self,
        key: &str,
        callback: &DataCallback,
        events: EventTypes,
        filter: DataFilter,
        callback_type: CallbackType,
    ) -> CacheResult<()> {
        self.run("register_key_notification", |engine| {
            validate_key(key)?;
            let events = selective_events(events)?;
            let registry = &self.inner.registry;
            let [update_callback_id, remove_callback_id] =
                registry.register_selective(callback, events, filter)?;
            let callbacks = KeyCallbacks {
                update_callback_id,
                remove_callback_id,
                update_filter: filter,
                remove_filter: filter,
                callback_type,
            };
            engine
                .register_key_notification(key, callbacks)
                .inspect_err(|_| {
                    registry.unregister_selective(callback, events);
                })
        })
    }

    /// Unbinds `callback` from the update and/or remove events of `key`.
    pub fn unregister_key_notification(
        &self,
        key: &str,
        callback: &DataCallback,
        events: EventTypes,
    ) -> CacheResult<()> {
        self.run("unregister_key_notification", |engine| {
            validate_key(key)?;
            let events = selective_events(events)?;
            let [update_id, remove_id] = self.inner.registry.unregister_selective(callback, events);
            if update_id == NO_CALLBACK && remove_id == NO_CALLBACK {
                trace!("Callback was not bound to {key}");
                return Ok(());
            }
            engine.unregister_key_notification(key, update_id, remove_id)
        })
    }

    /// Subscribes `callback` to `events` across the whole cache.
    ///
    /// The returned descriptor unsubscribes again. Registering the same
    /// callback with the same events and filter returns the same descriptor
    /// and must be undone as many times. `None` is only returned when a
    /// failure was suppressed.
    pub fn register_cache_notification(
        &self,
        callback: &DataCallback,
        events: EventTypes,
        filter: DataFilter,
    ) -> CacheResult<Option<EventDescriptor>> {
        self.run("register_cache_notification", |engine| {
            self.inner
                .registry
                .register_general(callback, events, filter, |change| {
                    engine.apply_registration(change)
                })
                .map(Some)
        })
    }

    /// Drops one reference of a cache-wide subscription. Returns false if
    /// the descriptor is not registered.
    pub fn unregister_cache_notification(&self, descriptor: &EventDescriptor) -> CacheResult<bool> {
        self.run("unregister_cache_notification", |engine| {
            self.inner
                .registry
                .unregister_general(descriptor, |change| engine.apply_registration(change))
        })
    }

    /// Subscribes to application-defined notifications.
    pub fn add_custom_event_listener(&self, callback: &CustomEventCallback) -> CacheResult<()> {
        self.run("add_custom_event_listener", |engine| {
            self.inner.registry.custom.add(callback.clone(), || {
                engine.register_notification(NotificationKind::CustomEvent)
            })
        })
    }

    /// Unsubscribes from application-defined notifications.
    pub fn remove_custom_event_listener(&self, callback: &CustomEventCallback) -> CacheResult<bool> {
        self.run("remove_custom_event_listener", |engine| {
            self.inner.registry.custom.remove(callback, || {
                engine.unregister_notification(NotificationKind::CustomEvent)
            })
        })
    }

    /// Subscribes to the cache being stopped.
    pub fn add_cache_stopped_listener(&self, callback: &CacheStoppedCallback) -> CacheResult<()> {
        self.run("add_cache_stopped_listener", |engine| {
            self.inner.registry.cache_stopped.add(callback.clone(), || {
                engine.register_notification(NotificationKind::CacheStopped)
            })
        })
    }

    /// Unsubscribes from the cache being stopped.
    pub fn remove_cache_stopped_listener(
        &self,
        callback: &CacheStoppedCallback,
    ) -> CacheResult<bool> {
        self.run("remove_cache_stopped_listener", |engine| {
            self.inner.registry.cache_stopped.remove(callback, || {
                engine.unregister_notification(NotificationKind::CacheStopped)
            })
        })
    }

    /// Subscribes to servers joining the cluster.
    pub fn add_member_joined_listener(&self, callback: &MemberCallback) -> CacheResult<()> {
        self.run("add_member_joined_listener", |engine| {
            self.inner.registry.member_joined.add(callback.clone(), || {
                engine.register_notification(NotificationKind::MemberJoined)
            })
        })
    }

    /// Unsubscribes from servers joining the cluster.
    pub fn remove_member_joined_listener(&self, callback: &MemberCallback) -> CacheResult<bool> {
        self.run("remove_member_joined_listener", |engine| {
            self.inner.registry.member_joined.remove(callback, || {
                engine.unregister_notification(NotificationKind::MemberJoined)
            })
        })
    }

    /// Subscribes to servers leaving the cluster.
    pub fn add_member_left_listener(&self, callback: &MemberCallback) -> CacheResult<()> {
        self.run("add_member_left_listener", |engine| {
            self.inner.registry.member_left.add(callback.clone(), || {
                engine.register_notification(NotificationKind::MemberLeft)
            })
        })
    }

    /// Unsubscribes from servers leaving the cluster.
    pub fn remove_member_left_listener(&self, callback: &MemberCallback) -> CacheResult<bool> {
        self.run("remove_member_left_listener", |engine| {
            self.inner.registry.member_left.remove(callback, || {
                engine.unregister_notification(NotificationKind::MemberLeft)
            })
        })
    }

    /// Sets the callback told that pull-based notifications are waiting,
    /// replacing the previous one. `None` removes it.
    pub fn set_poll_listener(&self, callback: Option<&PollCallback>) -> CacheResult<()> {
        self.run("set_poll_listener", |engine| {
            let poll = &self.inner.registry.poll;
            let previous = poll.snapshot();
            if let Some(callback) = callback {
                if previous.contains(callback) {
                    return Ok(());
                }
                poll.add(callback.clone(), || {
                    engine.register_notification(NotificationKind::PollReady)
                })?;
            }
            for old in previous {
                poll.remove(&old, || {
                    engine.unregister_notification(NotificationKind::PollReady)
                })?;
            }
            Ok(())
        })
    }

    /// Collects the notifications queued for pull-based callbacks.
    pub fn poll(&self) -> CacheResult<PollingResult> {
        self.run("poll", |engine| engine.poll())
    }

    /// Sends an application-defined notification to every subscribed
    /// client.
    pub fn raise_custom_event<N, D>(&self, notif_id: &N, data: &D) -> CacheResult<()>
    where
        N: Serialize + ?Sized,
        D: Serialize + ?Sized,
    {
        self.run("raise_custom_event", |engine| {
            let notif_id = self.encode(&ItemValue::from_serialize(notif_id)?)?;
            let data = self.encode(&ItemValue::from_serialize(data)?)?;
            engine.raise_custom_event(notif_id, data)
        })
    }

    /// The server-side state of every live general subscription, as it
    /// would be issued again after a reconnect.
    pub fn event_registrations(&self) -> Vec<EventRegistrationInfo> {
        self.inner.registry.event_registrations()
    }
}

/// Key-level callbacks only exist for updates and removals.
fn selective_events(events: EventTypes) -> CacheResult<EventTypes> {
    let mut selective = EventTypes::default();
    for event_type in events.iter() {
        match event_type {
            EventType::ItemUpdated => selective = selective | EventTypes::UPDATED,
            EventType::ItemRemoved => selective = selective | EventTypes::REMOVED,
            EventType::ItemAdded => {}
        }
    }
    if selective.is_empty() {
        fail!(invalid_argument!(
            "Key notifications need update or remove events"
        ));
    }
    Ok(selective)
}

impl Clone for Cache {
    fn clone(&self) -> Self {
        *self
            .inner
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner) += 1;
        Cache {
            inner: self.inner.clone(),
            disposed: AtomicBool::new(false),
        }
    }
}

impl Drop for Cache {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Debug for Cache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cache")
            .field("name", &self.name())
            .field("mode", &self.inner.config.mode)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use std::sync::atomic::AtomicUsize;

    fn cache() -> Cache {
        Cache::builder("test").open().unwrap()
    }

    #[test]
    fn test_typed_round_trip() {
        let cache = cache();
        cache.insert("answer", &42u32).unwrap();
        assert_eq!(cache.get::<u32>("answer").unwrap(), Some(42));
        assert_eq!(cache.get::<u32>("missing").unwrap(), None);
        assert_eq!(cache.stats().hits(), 1);
        assert_eq!(cache.stats().misses(), 1);
    }

    #[test]
    fn test_disposed_handle_is_not_initialized() {
        let cache = cache();
        let other = cache.clone();
        cache.dispose();
        let err = cache.count().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotInitialized);
        assert_eq!(other.count().unwrap(), 0);
    }

    #[test]
    fn test_suppressed_failures_return_defaults() {
        let cache = Cache::builder("quiet")
            .exceptions_enabled(false)
            .open()
            .unwrap();
        cache.add("k", &1).unwrap();
        cache.add("k", &2).unwrap();
        assert_eq!(cache.get::<i32>("").unwrap(), None);
        assert_eq!(cache.get::<i32>("k").unwrap(), Some(1));
    }

    #[test]
    fn test_not_initialized_is_never_suppressed() {
        let cache = Cache::builder("quiet")
            .exceptions_enabled(false)
            .open()
            .unwrap();
        cache.dispose();
        assert!(cache.clear().unwrap_err().is_not_initialized());
    }

    #[test]
    fn test_item_callbacks_are_released_with_their_key() {
        let cache = cache();
        let fired = Arc::new(AtomicUsize::new(0));
        let seen = fired.clone();
        let callback = DataCallback::new(move |_, _| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        for value in 0..3 {
            let item = CacheItem::from_serialize(&value)
                .unwrap()
                .on_update(callback.clone(), DataFilter::None)
                .on_remove(callback.clone(), DataFilter::None);
            cache.insert_item("k", &item).unwrap();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 2);
        let registry = &cache.inner.registry;
        assert!(registry.selective(SelectiveKind::Update, 9001).is_some());

        cache.delete("k").unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 3);
        assert!(registry.selective(SelectiveKind::Update, 9001).is_none());
        assert!(registry.selective(SelectiveKind::Remove, 8001).is_none());
        assert!(cache.inner.bindings().is_empty());
    }

    #[test]
    fn test_last_handle_tears_down_once() {
        let stopped = Arc::new(AtomicUsize::new(0));
        let cache = cache();
        let counter = stopped.clone();
        let listener = CacheStoppedCallback::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        cache.add_cache_stopped_listener(&listener).unwrap();

        let second = cache.clone();
        drop(cache);
        assert_eq!(stopped.load(Ordering::SeqCst), 0);
        second.dispose();
        second.dispose();
        assert_eq!(stopped.load(Ordering::SeqCst), 1);
    }
}
