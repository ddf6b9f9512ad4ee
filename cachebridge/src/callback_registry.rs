//! Maps application callbacks to the ids servers know them by.
//!
//! Three kinds of subscriptions are tracked:
//!
//! * selective callbacks, bound to individual keys, identified by a 16-bit id
//!   per kind (update or remove);
//! * general callbacks, listening to an event type across the whole cache,
//!   handed out as [`EventDescriptor`]s;
//! * plain subscriber lists for cache-wide notifications.
//!
//! All of them are reference-counted. Server-side registration only changes
//! when a count crosses zero, so repeated subscribe/unsubscribe pairs from
//! different parts of an application never flap the server state.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use log::{debug, warn};

use crate::errors::{CacheError, ErrorKind};
use crate::events::{
    CacheStoppedCallback, CustomEventCallback, DataCallback, EventDescriptor,
    EventRegistrationInfo, MemberCallback, PollCallback,
};
use crate::types::{CacheResult, DataFilter, EventType, EventTypes, NO_CALLBACK};

/// Last id handed out before the first update callback.
const UPDATE_ID_BASE: i16 = 9000;
/// Last id handed out before the first remove callback.
const REMOVE_ID_BASE: i16 = 8000;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The two pools of selective callback ids.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) enum SelectiveKind {
    Update,
    Remove,
}

struct SelectiveSlot {
    id: i16,
    filter: DataFilter,
    count: usize,
}

struct SelectivePool {
    last_id: i16,
    slots: HashMap<DataCallback, SelectiveSlot>,
    by_id: HashMap<i16, DataCallback>,
}

impl SelectivePool {
    fn new(base: i16) -> SelectivePool {
        SelectivePool {
            last_id: base,
            slots: HashMap::new(),
            by_id: HashMap::new(),
        }
    }

    fn register(&mut self, callback: &DataCallback, filter: DataFilter) -> CacheResult<i16> {
        if let Some(slot) = self.slots.get_mut(callback) {
            slot.count += 1;
            slot.filter = slot.filter.max(filter);
            return Ok(slot.id);
        }
        let id = self.last_id.checked_add(1).ok_or_else(|| {
            CacheError::from((
                ErrorKind::CallbackIdsExhausted,
                "No callback ids left",
                format!("last id handed out was {}", self.last_id),
            ))
        })?;
        self.last_id = id;
        self.slots.insert(
            callback.clone(),
            SelectiveSlot {
                id,
                filter,
                count: 1,
            },
        );
        self.by_id.insert(id, callback.clone());
        Ok(id)
    }

    fn unregister(&mut self, callback: &DataCallback) -> i16 {
        let Some(slot) = self.slots.get_mut(callback) else {
            return NO_CALLBACK;
        };
        let id = slot.id;
        slot.count -= 1;
        if slot.count == 0 {
            self.slots.remove(callback);
            self.by_id.remove(&id);
        }
        id
    }

    fn lookup(&self, id: i16) -> Option<(DataCallback, DataFilter)> {
        let callback = self.by_id.get(&id)?;
        let slot = self.slots.get(callback)?;
        Some((callback.clone(), slot.filter))
    }
}

struct SelectivePools {
    update: SelectivePool,
    remove: SelectivePool,
}

impl SelectivePools {
    fn pool(&mut self, kind: SelectiveKind) -> &mut SelectivePool {
        match kind {
            SelectiveKind::Update => &mut self.update,
            SelectiveKind::Remove => &mut self.remove,
        }
    }
}

/// A change to the server-side registration of one general event type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RegistrationChange {
    Register {
        event_type: EventType,
        filter: DataFilter,
        sequence: i16,
    },
    Unregister {
        event_type: EventType,
        sequence: i16,
    },
}

struct GeneralSubscription {
    descriptor: EventDescriptor,
    callback: DataCallback,
    count: usize,
}

#[derive(Clone, Debug)]
struct GeneralPool {
    members: Vec<(u64, DataFilter)>,
    registered: Option<DataFilter>,
    sequence: i16,
}

impl Default for GeneralPool {
    fn default() -> Self {
        GeneralPool {
            members: Vec::new(),
            registered: None,
            sequence: -1,
        }
    }
}

impl GeneralPool {
    fn wanted_filter(&self) -> Option<DataFilter> {
        self.members.iter().map(|(_, filter)| *filter).max()
    }

    /// Brings the registered filter in line with the members, returning the
    /// server call that does the same.
    fn reconcile(&mut self, event_type: EventType) -> Option<RegistrationChange> {
        match (self.wanted_filter(), self.registered) {
            (None, None) => None,
            (None, Some(_)) => {
                self.registered = None;
                Some(RegistrationChange::Unregister {
                    event_type,
                    sequence: self.sequence,
                })
            }
            (Some(wanted), Some(registered)) if registered == wanted => None,
            (Some(wanted), _) => {
                self.sequence = self.sequence.wrapping_add(1);
                self.registered = Some(wanted);
                Some(RegistrationChange::Register {
                    event_type,
                    filter: wanted,
                    sequence: self.sequence,
                })
            }
        }
    }
}

/// Puts the server back into the state `previous` describes for every event
/// type in `applied`, newest first. Failures are only logged: the caller is
/// already reporting the error that made the revert necessary.
fn revert(
    applied: &[RegistrationChange],
    previous: &HashMap<EventType, GeneralPool>,
    apply: &mut impl FnMut(RegistrationChange) -> CacheResult<()>,
) {
    for change in applied.iter().rev() {
        let (event_type, sequence) = match *change {
            RegistrationChange::Register {
                event_type,
                sequence,
                ..
            }
            | RegistrationChange::Unregister {
                event_type,
                sequence,
            } => (event_type, sequence),
        };
        let before = previous
            .get(&event_type)
            .and_then(|pool| pool.registered.map(|filter| (filter, pool.sequence)));
        let inverse = match before {
            Some((filter, sequence)) => RegistrationChange::Register {
                event_type,
                filter,
                sequence,
            },
            None => RegistrationChange::Unregister {
                event_type,
                sequence,
            },
        };
        debug!("Reverting general notification with {inverse:?}");
        if let Err(err) = apply(inverse) {
            warn!("Could not revert {change:?}: {err}");
        }
    }
}

struct GeneralState {
    next_descriptor: u64,
    subscriptions: BTreeMap<u64, GeneralSubscription>,
    pools: HashMap<EventType, GeneralPool>,
}

/// A subscriber list whose transitions between empty and non-empty trigger a
/// side effect.
///
/// The side effect runs under the list's lock and the list change is undone
/// when it fails, so the list and the server never disagree about whether
/// anyone is subscribed.
pub(crate) struct CountedSubscribers<L> {
    subscribers: Mutex<Vec<L>>,
}

impl<L> Default for CountedSubscribers<L> {
    fn default() -> Self {
        CountedSubscribers {
            subscribers: Mutex::new(Vec::new()),
        }
    }
}

impl<L: Clone + PartialEq> CountedSubscribers<L> {
    pub(crate) fn add(
        &self,
        subscriber: L,
        on_first: impl FnOnce() -> CacheResult<()>,
    ) -> CacheResult<()> {
        let mut subscribers = lock(&self.subscribers);
        subscribers.push(subscriber);
        if subscribers.len() == 1 {
            if let Err(err) = on_first() {
                subscribers.pop();
                return Err(err);
            }
        }
        Ok(())
    }

    /// Removes one occurrence of `subscriber`. Returns false if it was not
    /// subscribed.
    pub(crate) fn remove(
        &self,
        subscriber: &L,
        on_last: impl FnOnce() -> CacheResult<()>,
    ) -> CacheResult<bool> {
        let mut subscribers = lock(&self.subscribers);
        let Some(index) = subscribers.iter().position(|s| s == subscriber) else {
            return Ok(false);
        };
        let removed = subscribers.remove(index);
        if subscribers.is_empty() {
            if let Err(err) = on_last() {
                subscribers.insert(index, removed);
                return Err(err);
            }
        }
        Ok(true)
    }

    /// Subscribers in dispatch order, most recent first.
    pub(crate) fn snapshot(&self) -> Vec<L> {
        lock(&self.subscribers).iter().rev().cloned().collect()
    }

    pub(crate) fn is_empty(&self) -> bool {
        lock(&self.subscribers).is_empty()
    }

    pub(crate) fn clear(&self) {
        lock(&self.subscribers).clear();
    }
}

/// Every callback registered through one cache handle.
pub(crate) struct CallbackRegistry {
    selective: Mutex<SelectivePools>,
    general: Mutex<GeneralState>,
    pub(crate) custom: CountedSubscribers<CustomEventCallback>,
    pub(crate) cache_stopped: CountedSubscribers<CacheStoppedCallback>,
    pub(crate) member_joined: CountedSubscribers<MemberCallback>,
    pub(crate) member_left: CountedSubscribers<MemberCallback>,
    pub(crate) poll: CountedSubscribers<PollCallback>,
}

impl Default for CallbackRegistry {
    fn default() -> Self {
        CallbackRegistry::new()
    }
}

impl CallbackRegistry {
    pub(crate) fn new() -> CallbackRegistry {
        CallbackRegistry {
            selective: Mutex::new(SelectivePools {
                update: SelectivePool::new(UPDATE_ID_BASE),
                remove: SelectivePool::new(REMOVE_ID_BASE),
            }),
            general: Mutex::new(GeneralState {
                next_descriptor: 1,
                subscriptions: BTreeMap::new(),
                pools: HashMap::new(),
            }),
            custom: CountedSubscribers::default(),
            cache_stopped: CountedSubscribers::default(),
            member_joined: CountedSubscribers::default(),
            member_left: CountedSubscribers::default(),
            poll: CountedSubscribers::default(),
        }
    }

    /// Registers `callback` for the update and/or remove events in `events`.
    ///
    /// Returns `[update_id, remove_id]`; a kind not asked for is
    /// [`NO_CALLBACK`]. Both ids are allocated under one lock, and neither is
    /// kept if the other cannot be allocated.
    pub(crate) fn register_selective(
        &self,
        callback: &DataCallback,
        events: EventTypes,
        filter: DataFilter,
    ) -> CacheResult<[i16; 2]> {
        let mut pools = lock(&self.selective);
        let update_id = if events.contains(EventType::ItemUpdated) {
            pools.update.register(callback, filter)?
        } else {
            NO_CALLBACK
        };
        let remove_id = if events.contains(EventType::ItemRemoved) {
            match pools.remove.register(callback, filter) {
                Ok(id) => id,
                Err(err) => {
                    if update_id != NO_CALLBACK {
                        pools.update.unregister(callback);
                    }
                    return Err(err);
                }
            }
        } else {
            NO_CALLBACK
        };
        Ok([update_id, remove_id])
    }

    /// Drops one reference of `callback` for each kind in `events`.
    ///
    /// Returns the ids it was known by, [`NO_CALLBACK`] for kinds it was not
    /// registered for.
    pub(crate) fn unregister_selective(
        &self,
        callback: &DataCallback,
        events: EventTypes,
    ) -> [i16; 2] {
        let mut pools = lock(&self.selective);
        let mut ids = [NO_CALLBACK; 2];
        for (slot, kind) in [SelectiveKind::Update, SelectiveKind::Remove]
            .into_iter()
            .enumerate()
        {
            let event_type = match kind {
                SelectiveKind::Update => EventType::ItemUpdated,
                SelectiveKind::Remove => EventType::ItemRemoved,
            };
            if events.contains(event_type) {
                ids[slot] = pools.pool(kind).unregister(callback);
            }
        }
        ids
    }

    pub(crate) fn selective(
        &self,
        kind: SelectiveKind,
        id: i16,
    ) -> Option<(DataCallback, DataFilter)> {
        lock(&self.selective).pool(kind).lookup(id)
    }

    /// Adds a cache-wide subscription.
    ///
    /// `apply` receives every server-side change the subscription causes:
    /// a first registration, or a re-registration when the requested filter
    /// is richer than the one registered. Registering the same callback with
    /// the same event types and filter again only bumps a count.
    pub(crate) fn register_general(
        &self,
        callback: &DataCallback,
        event_types: EventTypes,
        filter: DataFilter,
        mut apply: impl FnMut(RegistrationChange) -> CacheResult<()>,
    ) -> CacheResult<EventDescriptor> {
        if event_types.is_empty() {
            fail!(invalid_argument!("At least one event type is required"));
        }

        let mut state = lock(&self.general);
        if let Some(existing) = state.subscriptions.values_mut().find(|sub| {
            sub.callback == *callback
                && sub.descriptor.event_types == event_types
                && sub.descriptor.data_filter == filter
        }) {
            existing.count += 1;
            debug!(
                "General subscription {} now referenced {} times",
                existing.descriptor.id, existing.count
            );
            return Ok(existing.descriptor.clone());
        }

        let rollback = state.pools.clone();
        let id = state.next_descriptor;
        let mut sequence = -1;
        let mut applied = Vec::new();
        for event_type in event_types.iter() {
            let pool = state.pools.entry(event_type).or_default();
            pool.members.push((id, filter));
            let change = pool.reconcile(event_type);
            if sequence == -1 {
                sequence = pool.sequence;
            }
            if let Some(change) = change {
                debug!("Registering general notification {change:?}");
                if let Err(err) = apply(change) {
                    revert(&applied, &rollback, &mut apply);
                    state.pools = rollback;
                    return Err(err);
                }
                applied.push(change);
            }
        }

        state.next_descriptor += 1;
        let descriptor = EventDescriptor {
            id,
            event_types,
            data_filter: filter,
            sequence,
        };
        state.subscriptions.insert(
            id,
            GeneralSubscription {
                descriptor: descriptor.clone(),
                callback: callback.clone(),
                count: 1,
            },
        );
        Ok(descriptor)
    }

    /// Drops one reference of a cache-wide subscription.
    ///
    /// Returns false for descriptors that are not registered.
    pub(crate) fn unregister_general(
        &self,
        descriptor: &EventDescriptor,
        mut apply: impl FnMut(RegistrationChange) -> CacheResult<()>,
    ) -> CacheResult<bool> {
        let mut state = lock(&self.general);
        let Some(subscription) = state.subscriptions.get_mut(&descriptor.id) else {
            return Ok(false);
        };
        if subscription.count > 1 {
            subscription.count -= 1;
            return Ok(true);
        }
        let event_types = subscription.descriptor.event_types;

        let rollback = state.pools.clone();
        let mut applied = Vec::new();
        for event_type in event_types.iter() {
            let Some(pool) = state.pools.get_mut(&event_type) else {
                continue;
            };
            pool.members.retain(|(id, _)| *id != descriptor.id);
            if let Some(change) = pool.reconcile(event_type) {
                debug!("Updating general notification {change:?}");
                if let Err(err) = apply(change) {
                    revert(&applied, &rollback, &mut apply);
                    state.pools = rollback;
                    return Err(err);
                }
                applied.push(change);
            }
        }
        state.subscriptions.remove(&descriptor.id);
        Ok(true)
    }

    /// General subscribers of `event_type`, oldest first, with the filter each
    /// asked for.
    pub(crate) fn general_subscribers(
        &self,
        event_type: EventType,
    ) -> Vec<(DataCallback, EventDescriptor)> {
        lock(&self.general)
            .subscriptions
            .values()
            .filter(|sub| sub.descriptor.event_types.contains(event_type))
            .map(|sub| (sub.callback.clone(), sub.descriptor.clone()))
            .collect()
    }

    /// What the server must know to deliver every live general subscription,
    /// used to reissue registrations after a reconnect.
    pub(crate) fn event_registrations(&self) -> Vec<EventRegistrationInfo> {
        let state = lock(&self.general);
        let mut infos: Vec<_> = state
            .pools
            .iter()
            .filter_map(|(event_type, pool)| {
                pool.registered.map(|data_filter| EventRegistrationInfo {
                    event_type: *event_type,
                    data_filter,
                    sequence: pool.sequence,
                })
            })
            .collect();
        infos.sort_by_key(|info| info.event_type);
        infos
    }

    /// Forgets every subscription without telling any server.
    pub(crate) fn clear(&self) {
        {
            let mut pools = lock(&self.selective);
            pools.update = SelectivePool::new(UPDATE_ID_BASE);
            pools.remove = SelectivePool::new(REMOVE_ID_BASE);
        }
        {
            let mut state = lock(&self.general);
            state.subscriptions.clear();
            state.pools.clear();
        }
        self.custom.clear();
        self.cache_stopped.clear();
        self.member_joined.clear();
        self.member_left.clear();
        self.poll.clear();
    }
}
