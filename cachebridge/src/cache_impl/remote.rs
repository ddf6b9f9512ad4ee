use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use log::{debug, trace};

use crate::bulk::{self, BulkErrors, BulkRead};
use crate::cache_impl::{CacheImpl, KeyCallbacks, LockedRead, ReadOptions};
use crate::callback_registry::RegistrationChange;
use crate::command::{
    Command, FORCED_VIEW_ID, NotificationKind, Request, Response, Target, WireItem, WirePayload,
    unexpected_response,
};
use crate::errors::RetryMethod;
use crate::event_dispatch::NotificationSink;
use crate::events::PollingResult;
use crate::transport::Transport;
use crate::types::{CacheResult, LockAccessType, LockHandle};

/// How long every request is sent as a dedicated call after a server
/// reported a state transfer.
const DEDICATED_WINDOW: Duration = Duration::from_secs(60);

fn entry_key(entry: &(String, WireItem)) -> &str {
    &entry.0
}

fn needs(request: &Request, method: RetryMethod) -> bool {
    request.entries().iter().any(|entry| {
        matches!(&entry.response, Some(Err(err)) if err.retry_method() == method)
    })
}

/// A cache served by remote servers through a [`Transport`].
pub(crate) struct RemoteCache {
    transport: Arc<dyn Transport>,
    dedicated_until: Mutex<Option<Instant>>,
}

impl RemoteCache {
    pub(crate) fn new(transport: Arc<dyn Transport>, sink: NotificationSink) -> RemoteCache {
        transport.set_notification_sink(sink);
        RemoteCache {
            transport,
            dedicated_until: Mutex::new(None),
        }
    }

    fn is_dedicated(&self) -> bool {
        let mut until = self
            .dedicated_until
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match *until {
            Some(deadline) if deadline > Instant::now() => true,
            Some(_) => {
                debug!("dedicated window closed");
                *until = None;
                false
            }
            None => false,
        }
    }

    fn mark_dedicated(&self) {
        *self
            .dedicated_until
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Instant::now() + DEDICATED_WINDOW);
    }

    fn dedicated_target(&self) -> Target {
        self.transport
            .distribution()
            .and_then(|map| map.load_balanced_address())
            .map_or(Target::Any, Target::Server)
    }

    /// Executes `request`. Commands a state transfer kept from being
    /// served are resent once, as a dedicated call; commands that were
    /// answered keep their response and are never executed twice.
    fn execute(&self, mut request: Request) -> CacheResult<Request> {
        if !request.is_dedicated() && self.is_dedicated() {
            request = request.into_dedicated(self.dedicated_target());
        }
        match self.transport.execute(&mut request) {
            Err(err) if err.retry_method() == RetryMethod::DedicatedCall => {
                if request.is_dedicated() {
                    return Err(err);
                }
            }
            Err(err) => return Err(err),
            Ok(()) if !request.is_dedicated() && needs(&request, RetryMethod::DedicatedCall) => {}
            Ok(()) => return Ok(request),
        }
        debug!("state transfer in progress, retrying as a dedicated call");
        self.mark_dedicated();
        self.resend_dedicated(&mut request);
        Ok(request)
    }

    fn resend_dedicated(&self, request: &mut Request) {
        let pending: Vec<usize> = request
            .entries()
            .iter()
            .enumerate()
            .filter(|(_, entry)| match &entry.response {
                None => true,
                Some(Err(err)) => err.retry_method() == RetryMethod::DedicatedCall,
                Some(Ok(_)) => false,
            })
            .map(|(index, _)| index)
            .collect();
        trace!("resending {} of {} commands", pending.len(), request.entries().len());
        let commands = pending
            .iter()
            .map(|index| (Target::Any, request.entries()[*index].command.clone()))
            .collect();
        let mut retry = Request::distributed(commands, FORCED_VIEW_ID)
            .into_dedicated(self.dedicated_target());

        let entries = request.entries_mut();
        match self.transport.execute(&mut retry) {
            Ok(()) => {
                for (index, (_, response)) in pending.into_iter().zip(retry.into_responses()) {
                    entries[index].response = Some(response);
                }
            }
            Err(err) => {
                for index in pending {
                    entries[index].response = Some(Err(err.clone_mostly("dedicated call failed")));
                }
            }
        }
    }

    fn call(&self, command: Command) -> CacheResult<Response> {
        trace!("dispatching {}", command.name());
        self.execute(Request::new(command))?.into_response()
    }

    fn call_done(&self, command: Command) -> CacheResult<()> {
        let name = command.name();
        match self.call(command)? {
            Response::Done => Ok(()),
            other => Err(unexpected_response(name, &other)),
        }
    }

    fn bulk_write(
        &self,
        entries: Vec<(String, WireItem)>,
        command: fn(Vec<(String, WireItem)>) -> Command,
    ) -> CacheResult<BulkErrors> {
        let map = self.transport.distribution();
        let request = bulk::distribute(entries, entry_key, map.as_deref(), command)?;
        let request = self.execute(request)?;
        Ok(bulk::merge_failures(request.into_responses()))
    }

    /// Fans a read out to the owners of `keys`. If any owner rejects the
    /// distributed form, the whole read is reissued as one request.
    fn bulk_read<T>(
        &self,
        keys: Vec<String>,
        command: fn(Vec<String>) -> Command,
        extract: fn(Response) -> Result<Vec<(String, T)>, Response>,
    ) -> CacheResult<BulkRead<T>> {
        let map = self.transport.distribution();
        let request = bulk::distribute(keys.clone(), String::as_str, map.as_deref(), command)?;
        let mut request = self.execute(request)?;
        if needs(&request, RetryMethod::Reroute) {
            debug!("distributed read rejected, reissuing {} keys as one request", keys.len());
            request = self.execute(Request::new(command(keys)).into_dedicated(self.dedicated_target()))?;
        }
        Ok(bulk::merge_reads(request.into_responses(), extract))
    }
}

impl CacheImpl for RemoteCache {
    fn add(&self, key: &str, item: WireItem) -> CacheResult<()> {
        self.call_done(Command::Add {
            key: key.to_string(),
            item,
        })
    }

    fn insert(
        &self,
        key: &str,
        item: WireItem,
        lock_id: Option<String>,
        access: LockAccessType,
    ) -> CacheResult<()> {
        self.call_done(Command::Insert {
            key: key.to_string(),
            item,
            lock_id,
            access,
        })
    }

    fn get(&self, key: &str, options: ReadOptions) -> CacheResult<LockedRead<WirePayload>> {
        match self.call(Command::Get {
            key: key.to_string(),
            lock_id: options.lock_id,
            access: options.access,
            lock_timeout: options.lock_timeout,
        })? {
            Response::Value { payload, lock } => Ok((payload, lock)),
            other => Err(unexpected_response("GET", &other)),
        }
    }

    fn get_cache_item(
        &self,
        key: &str,
        options: ReadOptions,
    ) -> CacheResult<LockedRead<WireItem>> {
        match self.call(Command::GetCacheItem {
            key: key.to_string(),
            lock_id: options.lock_id,
            access: options.access,
            lock_timeout: options.lock_timeout,
        })? {
            Response::Item { item, lock } => Ok((item, lock)),
            other => Err(unexpected_response("GET_CACHE_ITEM", &other)),
        }
    }

    fn contains(&self, key: &str) -> CacheResult<bool> {
        match self.call(Command::Contains {
            key: key.to_string(),
        })? {
            Response::Bool(found) => Ok(found),
            other => Err(unexpected_response("CONTAINS", &other)),
        }
    }

    fn remove(
        &self,
        key: &str,
        lock_id: Option<String>,
        access: LockAccessType,
    ) -> CacheResult<Option<WirePayload>> {
        match self.call(Command::Remove {
            key: key.to_string(),
            lock_id,
            access,
        })? {
            Response::Value { payload, .. } => Ok(payload),
            other => Err(unexpected_response("REMOVE", &other)),
        }
    }

    fn delete(
        &self,
        key: &str,
        lock_id: Option<String>,
        access: LockAccessType,
    ) -> CacheResult<()> {
        self.call_done(Command::Delete {
            key: key.to_string(),
            lock_id,
            access,
        })
    }

    fn count(&self) -> CacheResult<u64> {
        match self.call(Command::Count)? {
            Response::Count(count) => Ok(count),
            other => Err(unexpected_response("COUNT", &other)),
        }
    }

    fn clear(&self) -> CacheResult<()> {
        self.call_done(Command::Clear)
    }

    fn lock(&self, key: &str, timeout: Duration) -> CacheResult<(bool, LockHandle)> {
        match self.call(Command::Lock {
            key: key.to_string(),
            timeout,
        })? {
            Response::Lock { acquired, handle } => Ok((acquired, handle)),
            other => Err(unexpected_response("LOCK", &other)),
        }
    }

    fn unlock(&self, key: &str, lock_id: Option<String>, force: bool) -> CacheResult<()> {
        self.call_done(Command::Unlock {
            key: key.to_string(),
            lock_id,
            force,
        })
    }

    fn is_locked(&self, key: &str) -> CacheResult<(bool, LockHandle)> {
        match self.call(Command::IsLocked {
            key: key.to_string(),
        })? {
            Response::Lock { acquired, handle } => Ok((acquired, handle)),
            other => Err(unexpected_response("IS_LOCKED", &other)),
        }
    }

    fn add_bulk(&self, entries: Vec<(String, WireItem)>) -> CacheResult<BulkErrors> {
        self.bulk_write(entries, |entries| Command::AddBulk { entries })
    }

    fn insert_bulk(&self, entries: Vec<(String, WireItem)>) -> CacheResult<BulkErrors> {
        self.bulk_write(entries, |entries| Command::InsertBulk { entries })
    }

    fn get_bulk(&self, keys: Vec<String>) -> CacheResult<BulkRead<WirePayload>> {
        self.bulk_read(
            keys,
            |keys| Command::GetBulk { keys },
            |response| match response {
                Response::Values(values) => Ok(values),
                other => Err(other),
            },
        )
    }

    fn get_cache_item_bulk(&self, keys: Vec<String>) -> CacheResult<BulkRead<WireItem>> {
        self.bulk_read(
            keys,
            |keys| Command::GetCacheItemBulk { keys },
            |response| match response {
                Response::Items(items) => Ok(items),
                other => Err(other),
            },
        )
    }

    fn contains_bulk(&self, keys: Vec<String>) -> CacheResult<BulkRead<bool>> {
        self.bulk_read(
            keys,
            |keys| Command::ContainsBulk { keys },
            |response| match response {
                Response::Flags(flags) => Ok(flags),
                other => Err(other),
            },
        )
    }

    fn remove_bulk(&self, keys: Vec<String>) -> CacheResult<BulkRead<WirePayload>> {
        let map = self.transport.distribution();
        let request = bulk::distribute(keys, String::as_str, map.as_deref(), |keys| {
            Command::RemoveBulk { keys }
        })?;
        let request = self.execute(request)?;
        Ok(bulk::merge_reads(request.into_responses(), |response| {
            match response {
                Response::Values(values) => Ok(values),
                other => Err(other),
            }
        }))
    }

    fn delete_bulk(&self, keys: Vec<String>) -> CacheResult<BulkErrors> {
        let map = self.transport.distribution();
        let request = bulk::distribute(keys, String::as_str, map.as_deref(), |keys| {
            Command::DeleteBulk { keys }
        })?;
        let request = self.execute(request)?;
        Ok(bulk::merge_failures(request.into_responses()))
    }

    fn register_key_notification(&self, key: &str, callbacks: KeyCallbacks) -> CacheResult<()> {
        self.call_done(Command::RegisterKeyNotification {
            key: key.to_string(),
            update_callback_id: callbacks.update_callback_id,
            remove_callback_id: callbacks.remove_callback_id,
            update_filter: callbacks.update_filter,
            remove_filter: callbacks.remove_filter,
            callback_type: callbacks.callback_type,
        })
    }

    fn unregister_key_notification(
        &self,
        key: &str,
        update_callback_id: i16,
        remove_callback_id: i16,
    ) -> CacheResult<()> {
        self.call_done(Command::UnregisterKeyNotification {
            key: key.to_string(),
            update_callback_id,
            remove_callback_id,
        })
    }

    fn apply_registration(&self, change: RegistrationChange) -> CacheResult<()> {
        self.call_done(match change {
            RegistrationChange::Register {
                event_type,
                filter,
                sequence,
            } => Command::RegisterGeneralNotification {
                event_type,
                filter,
                sequence,
            },
            RegistrationChange::Unregister {
                event_type,
                sequence,
            } => Command::UnregisterGeneralNotification {
                event_type,
                sequence,
            },
        })
    }

    fn register_notification(&self, kind: NotificationKind) -> CacheResult<()> {
        self.call_done(Command::RegisterNotification(kind))
    }

    fn unregister_notification(&self, kind: NotificationKind) -> CacheResult<()> {
        self.call_done(Command::UnregisterNotification(kind))
    }

    fn raise_custom_event(&self, notif_id: WirePayload, data: WirePayload) -> CacheResult<()> {
        self.call_done(Command::RaiseCustomEvent { notif_id, data })
    }

    fn poll(&self) -> CacheResult<PollingResult> {
        match self.call(Command::Poll)? {
            Response::Polled(result) => Ok(result),
            other => Err(unexpected_response("POLL", &other)),
        }
    }

    fn dispose(&self) {
        debug!("disposing transport");
        self.transport.dispose();
    }
}
