//! Pessimistic locking.
//!
//! Ownership is never verified here: servers compare lock ids. This layer
//! only decides which [`LockAccessType`] an operation carries and shapes the
//! lock calls themselves.

use std::time::Duration;

use log::trace;

use crate::cache_impl::CacheImpl;
use crate::types::{BitSet, CacheResult, LockAccessType, LockHandle};

/// Access type of a write that may present a lock.
///
/// No handle means the write ignores locks. A handle means the write honors
/// the lock, and `release` decides whether it is let go afterwards.
pub fn insert_access(lock: Option<&LockHandle>, release: bool) -> LockAccessType {
    match lock {
        None => LockAccessType::IgnoreLock,
        Some(_) if release => LockAccessType::Release,
        Some(_) => LockAccessType::DontRelease,
    }
}

/// Access type of a removal that may present a lock.
pub fn remove_access(lock: Option<&LockHandle>) -> LockAccessType {
    match lock {
        None => LockAccessType::IgnoreLock,
        Some(_) => LockAccessType::Default,
    }
}

/// Access type of a read that may take the lock.
pub fn get_access(acquire: bool) -> LockAccessType {
    if acquire {
        LockAccessType::Acquire
    } else {
        LockAccessType::DontAcquire
    }
}

pub(crate) fn lock_id(lock: Option<&LockHandle>) -> Option<String> {
    lock.and_then(|handle| handle.lock_id.clone())
}

/// Marks written items that carry a lock id.
pub(crate) fn apply_lock_flag(flags: &mut BitSet, lock: Option<&LockHandle>) {
    if lock.is_some_and(LockHandle::is_held) {
        flags.set(BitSet::LOCKED_ITEM);
    } else {
        flags.unset(BitSet::LOCKED_ITEM);
    }
}

/// Issues lock calls on behalf of one cache handle.
#[derive(Debug, Clone)]
pub(crate) struct LockCoordinator {
    default_timeout: Duration,
}

impl LockCoordinator {
    pub(crate) fn new(default_timeout: Duration) -> LockCoordinator {
        LockCoordinator { default_timeout }
    }

    pub(crate) fn timeout(&self, requested: Option<Duration>) -> Duration {
        match requested {
            Some(timeout) if !timeout.is_zero() => timeout,
            _ => self.default_timeout,
        }
    }

    /// Tries to take the lock on `key`.
    ///
    /// Failing to acquire is not an error: the result is `false` with a
    /// handle that holds no id.
    pub(crate) fn lock(
        &self,
        engine: &dyn CacheImpl,
        key: &str,
        timeout: Option<Duration>,
    ) -> CacheResult<(bool, LockHandle)> {
        let timeout = self.timeout(timeout);
        trace!("lock {key} for {timeout:?}");
        let (acquired, handle) = engine.lock(key, timeout)?;
        if acquired {
            Ok((true, handle))
        } else {
            Ok((false, LockHandle::default()))
        }
    }

    /// Releases the lock on `key`. Without a handle the lock is broken
    /// whoever holds it. A handle always asks for a conditional release,
    /// even one that holds no id.
    pub(crate) fn unlock(
        &self,
        engine: &dyn CacheImpl,
        key: &str,
        handle: Option<&LockHandle>,
    ) -> CacheResult<()> {
        let force = handle.is_none();
        if force {
            trace!("force unlock {key}");
        }
        engine.unlock(key, lock_id(handle), force)
    }

    /// Queries the lock state of `key`, copying the holder into `handle`
    /// when it is locked. Never changes the lock itself.
    pub(crate) fn is_locked(
        &self,
        engine: &dyn CacheImpl,
        key: &str,
        handle: &mut LockHandle,
    ) -> CacheResult<bool> {
        let (locked, holder) = engine.is_locked(key)?;
        if locked {
            *handle = holder;
        }
        Ok(locked)
    }
}
