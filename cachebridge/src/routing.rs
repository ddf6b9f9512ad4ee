//! Key distribution: which server owns which key, and how a bulk call is
//! split across owners.

use std::collections::HashSet;
use std::sync::RwLock;

use log::{debug, trace};
use rand::seq::IndexedRandom;

use crate::command::Target;
use crate::errors::{CacheError, ErrorKind};
use crate::types::{CacheResult, ServerAddress};

/// Number of buckets the key space is divided into.
pub const BUCKET_COUNT: u16 = 1000;

fn bucket(key: &[u8]) -> u16 {
    crc16::State::<crc16::XMODEM>::calculate(key) % BUCKET_COUNT
}

/// Returns the bucket that owns `key`.
pub fn get_bucket(key: &str) -> u16 {
    bucket(key.as_bytes())
}

/// The cluster hashmap: a mapping from key to owning server, maintained by
/// the transport as the cluster changes.
///
/// The map may be stale. Servers reject commands routed with an outdated
/// view, so routing never needs to be exact, only deterministic.
pub trait DistributionMap: Send + Sync {
    /// Server currently owning `key`, if the map knows one.
    fn server_for_key(&self, key: &str) -> Option<ServerAddress>;

    /// Returns true if the transport holds a live connection to `server`.
    fn is_connected(&self, server: &ServerAddress) -> bool;

    /// A connected server able to take requests for keys it does not own.
    fn load_balanced_address(&self) -> Option<ServerAddress>;

    /// Generation of the map, sent with every distributed command.
    fn client_last_view_id(&self) -> i64;
}

#[derive(Debug, Default)]
struct BucketState {
    view_id: i64,
    owners: Vec<ServerAddress>,
    connected: HashSet<ServerAddress>,
}

/// A [`DistributionMap`] assigning [`BUCKET_COUNT`] crc16 buckets to servers.
#[derive(Debug, Default)]
pub struct BucketDistribution {
    state: RwLock<BucketState>,
}

impl BucketDistribution {
    /// An empty map that owns nothing.
    pub fn new() -> BucketDistribution {
        BucketDistribution::default()
    }

    /// Replaces the bucket assignment with the one a server handed out.
    ///
    /// `owners` is indexed by bucket and wraps around if shorter than
    /// [`BUCKET_COUNT`]. Older views are ignored.
    pub fn import_hashmap(&self, view_id: i64, owners: Vec<ServerAddress>) {
        let mut state = self
            .state
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if view_id < state.view_id {
            debug!(
                "Ignoring hashmap view {view_id}, already at {}",
                state.view_id
            );
            return;
        }
        debug!("Imported hashmap view {view_id} with {} owners", owners.len());
        state.view_id = view_id;
        state.owners = owners;
    }

    /// Records whether a connection to `server` is up.
    pub fn set_connected(&self, server: ServerAddress, connected: bool) {
        let mut state = self
            .state
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if connected {
            state.connected.insert(server);
        } else {
            state.connected.remove(&server);
        }
    }
}

impl DistributionMap for BucketDistribution {
    fn server_for_key(&self, key: &str) -> Option<ServerAddress> {
        let state = self
            .state
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if state.owners.is_empty() {
            return None;
        }
        let index = get_bucket(key) as usize % state.owners.len();
        state.owners.get(index).cloned()
    }

    fn is_connected(&self, server: &ServerAddress) -> bool {
        self.state
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .connected
            .contains(server)
    }

    fn load_balanced_address(&self) -> Option<ServerAddress> {
        let state = self
            .state
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let connected: Vec<_> = state.connected.iter().collect();
        connected.choose(&mut rand::rng()).map(|server| (*server).clone())
    }

    fn client_last_view_id(&self) -> i64 {
        self.state
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .view_id
    }
}

/// A bulk call split by owning server.
#[derive(Debug)]
pub struct RoutedBatch<T> {
    /// Set when the entries of a disconnected owner were sent to another
    /// server, whether or not that server had entries of its own. Commands built from such a batch carry
    /// [`FORCED_VIEW_ID`](crate::FORCED_VIEW_ID).
    pub merged_view: bool,
    /// Groups in order of first appearance; entries keep their input order.
    pub groups: Vec<(Target, Vec<T>)>,
}

impl<T> RoutedBatch<T> {
    /// Total number of entries across all groups.
    pub fn len(&self) -> usize {
        self.groups.iter().map(|(_, entries)| entries.len()).sum()
    }

    /// Returns true if there are no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Splits `entries` across their owners.
///
/// Without a map every entry goes into a single [`Target::Any`] group. Keys
/// whose owner is disconnected are sent to a load-balanced server instead.
pub fn route<T>(
    entries: Vec<T>,
    key_of: impl Fn(&T) -> &str,
    map: Option<&dyn DistributionMap>,
) -> CacheResult<RoutedBatch<T>> {
    let Some(map) = map else {
        return Ok(RoutedBatch {
            merged_view: false,
            groups: vec![(Target::Any, entries)],
        });
    };

    let mut by_owner: Vec<(ServerAddress, Vec<T>)> = Vec::new();
    for entry in entries {
        let owner = match map.server_for_key(key_of(&entry)) {
            Some(owner) => owner,
            None => map.load_balanced_address().ok_or_else(|| {
                CacheError::from((
                    ErrorKind::NoServerAvailable,
                    "No server owns the key and none is connected",
                ))
            })?,
        };
        match by_owner.iter_mut().find(|(server, _)| *server == owner) {
            Some((_, group)) => group.push(entry),
            None => by_owner.push((owner, vec![entry])),
        }
    }

    let mut merged_view = false;
    let mut groups: Vec<(Target, Vec<T>)> = Vec::with_capacity(by_owner.len());
    for (owner, group) in by_owner {
        let mut server = owner;
        if !map.is_connected(&server) {
            if let Some(balanced) = map.load_balanced_address() {
                trace!("Owner {server} is disconnected, rerouting to {balanced}");
                server = balanced;
                merged_view = true;
            }
        }
        let target = Target::Server(server);
        match groups.iter_mut().find(|(existing, _)| *existing == target) {
            Some((_, existing)) => {
                existing.extend(group);
                merged_view = true;
            }
            None => groups.push((target, group)),
        }
    }

    Ok(RoutedBatch {
        merged_view,
        groups,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(batch: &RoutedBatch<String>) -> Vec<(Target, Vec<&str>)> {
        batch
            .groups
            .iter()
            .map(|(target, keys)| (target.clone(), keys.iter().map(String::as_str).collect()))
            .collect()
    }

    fn owned(keys: &[&str]) -> Vec<String> {
        keys.iter().map(|key| key.to_string()).collect()
    }

    fn two_servers() -> BucketDistribution {
        let map = BucketDistribution::new();
        map.import_hashmap(3, vec!["s1:9800".into(), "s2:9800".into()]);
        map.set_connected("s1:9800".into(), true);
        map.set_connected("s2:9800".into(), true);
        map
    }

    #[test]
    fn test_no_map_yields_one_group_in_input_order() {
        let batch = route(owned(&["a", "b", "c"]), |key| key.as_str(), None).unwrap();
        assert!(!batch.merged_view);
        assert_eq!(keys(&batch), vec![(Target::Any, vec!["a", "b", "c"])]);
    }

    #[test]
    fn test_keys_are_partitioned_by_owner() {
        let map = two_servers();
        let input: Vec<String> = (0..50).map(|i| format!("key-{i}")).collect();
        let batch = route(input.clone(), |key| key.as_str(), Some(&map)).unwrap();

        assert!(!batch.merged_view);
        assert_eq!(batch.len(), input.len());
        for (target, group) in &batch.groups {
            for key in group {
                assert_eq!(*target, Target::Server(map.server_for_key(key).unwrap()));
            }
        }
    }

    #[test]
    fn test_disconnected_owner_is_merged_into_balanced_server() {
        let map = two_servers();
        map.set_connected("s2:9800".into(), false);
        let input: Vec<String> = (0..50).map(|i| format!("key-{i}")).collect();
        let batch = route(input, |key| key.as_str(), Some(&map)).unwrap();

        assert!(batch.merged_view);
        assert_eq!(batch.groups.len(), 1);
        assert_eq!(batch.groups[0].0, Target::Server("s1:9800".into()));
        assert_eq!(batch.len(), 50);
    }

    #[test]
    fn test_lone_disconnected_owner_still_marks_the_view() {
        let map = two_servers();
        map.set_connected("s2:9800".into(), false);
        let owned_by_s2 = (0..100)
            .map(|i| format!("key-{i}"))
            .find(|key| map.server_for_key(key) == Some("s2:9800".into()))
            .unwrap();
        let batch = route(vec![owned_by_s2], |key| key.as_str(), Some(&map)).unwrap();

        assert!(batch.merged_view);
        assert_eq!(batch.groups.len(), 1);
        assert_eq!(batch.groups[0].0, Target::Server("s1:9800".into()));
    }

    #[test]
    fn test_older_views_are_ignored() {
        let map = two_servers();
        map.import_hashmap(2, vec!["s3:9800".into()]);
        assert_eq!(map.client_last_view_id(), 3);
    }

    #[test]
    fn test_unowned_keys_without_servers_fail() {
        let map = BucketDistribution::new();
        let err = route(owned(&["a"]), |key| key.as_str(), Some(&map)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoServerAvailable);
    }
}
