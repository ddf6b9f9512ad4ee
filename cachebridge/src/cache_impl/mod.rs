//! The engines a cache handle dispatches to.
//!
//! Both variants share this interface and nothing else: [`InProcCache`] keeps
//! items in the local process, [`RemoteCache`] shapes commands for a
//! [`Transport`](crate::Transport). The variant is chosen once, when the
//! cache is opened.

use std::time::Duration;

use crate::bulk::{BulkErrors, BulkRead};
use crate::callback_registry::RegistrationChange;
use crate::command::{NotificationKind, WireItem, WirePayload};
use crate::events::PollingResult;
use crate::types::{CacheResult, CallbackType, DataFilter, LockAccessType, LockHandle};

mod inproc;
mod remote;

pub(crate) use inproc::InProcCache;
pub(crate) use remote::RemoteCache;

/// How a read treats the key's lock.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct ReadOptions {
    pub(crate) lock_id: Option<String>,
    pub(crate) access: LockAccessType,
    pub(crate) lock_timeout: Option<Duration>,
}

impl ReadOptions {
    pub(crate) fn plain() -> ReadOptions {
        ReadOptions {
            lock_id: None,
            access: LockAccessType::IgnoreLock,
            lock_timeout: None,
        }
    }
}

/// Callback ids bound to a key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct KeyCallbacks {
    pub(crate) update_callback_id: i16,
    pub(crate) remove_callback_id: i16,
    pub(crate) update_filter: DataFilter,
    pub(crate) remove_filter: DataFilter,
    pub(crate) callback_type: CallbackType,
}

/// A read and the lock it took, if any.
pub(crate) type LockedRead<T> = (Option<T>, Option<LockHandle>);

pub(crate) trait CacheImpl: Send + Sync {
    fn add(&self, key: &str, item: WireItem) -> CacheResult<()>;

    fn insert(
        &self,
        key: &str,
        item: WireItem,
        lock_id: Option<String>,
        access: LockAccessType,
    ) -> CacheResult<()>;

    fn get(&self, key: &str, options: ReadOptions) -> CacheResult<LockedRead<WirePayload>>;

    fn get_cache_item(&self, key: &str, options: ReadOptions)
        -> CacheResult<LockedRead<WireItem>>;

    fn contains(&self, key: &str) -> CacheResult<bool>;

    fn remove(
        &self,
        key: &str,
        lock_id: Option<String>,
        access: LockAccessType,
    ) -> CacheResult<Option<WirePayload>>;

    fn delete(&self, key: &str, lock_id: Option<String>, access: LockAccessType)
        -> CacheResult<()>;

    fn count(&self) -> CacheResult<u64>;

    fn clear(&self) -> CacheResult<()>;

    fn lock(&self, key: &str, timeout: Duration) -> CacheResult<(bool, LockHandle)>;

    /// `lock_id` of `None` breaks the lock.
    fn unlock(&self, key: &str, lock_id: Option<String>, force: bool) -> CacheResult<()>;

    fn is_locked(&self, key: &str) -> CacheResult<(bool, LockHandle)>;

    fn add_bulk(&self, entries: Vec<(String, WireItem)>) -> CacheResult<BulkErrors>;

    fn insert_bulk(&self, entries: Vec<(String, WireItem)>) -> CacheResult<BulkErrors>;

    fn get_bulk(&self, keys: Vec<String>) -> CacheResult<BulkRead<WirePayload>>;

    fn get_cache_item_bulk(&self, keys: Vec<String>) -> CacheResult<BulkRead<WireItem>>;

    fn contains_bulk(&self, keys: Vec<String>) -> CacheResult<BulkRead<bool>>;

    fn remove_bulk(&self, keys: Vec<String>) -> CacheResult<BulkRead<WirePayload>>;

    fn delete_bulk(&self, keys: Vec<String>) -> CacheResult<BulkErrors>;

    fn register_key_notification(&self, key: &str, callbacks: KeyCallbacks) -> CacheResult<()>;

    fn unregister_key_notification(
        &self,
        key: &str,
        update_callback_id: i16,
        remove_callback_id: i16,
    ) -> CacheResult<()>;

    fn apply_registration(&self, change: RegistrationChange) -> CacheResult<()>;

    fn register_notification(&self, kind: NotificationKind) -> CacheResult<()>;

    fn unregister_notification(&self, kind: NotificationKind) -> CacheResult<()>;

    fn raise_custom_event(&self, notif_id: WirePayload, data: WirePayload) -> CacheResult<()>;

    fn poll(&self) -> CacheResult<PollingResult>;

    /// Releases everything the engine holds. Called once.
    fn dispose(&self);
}
