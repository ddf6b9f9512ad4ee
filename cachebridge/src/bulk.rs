//! Validation, fan-out and fan-in of operations over many keys.

use std::collections::HashMap;
use std::fmt;

use log::{debug, trace};

use crate::command::{Command, Request, RequestEntry, Response, unexpected_response};
use crate::errors::CacheError;
use crate::routing::{DistributionMap, RoutedBatch, route};
use crate::types::{CacheItem, CacheResult, HashSet, validate_key};

/// Per-key results in the order keys were first seen.
#[derive(Clone)]
pub struct KeyedResults<V> {
    entries: Vec<(String, V)>,
    index: HashMap<String, usize>,
}

impl<V> Default for KeyedResults<V> {
    fn default() -> Self {
        KeyedResults {
            entries: Vec::new(),
            index: HashMap::new(),
        }
    }
}

impl<V> KeyedResults<V> {
    /// An empty result set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the result of `key`, replacing an earlier one in place.
    pub fn insert(&mut self, key: String, value: V) {
        match self.index.get(&key) {
            Some(position) => self.entries[*position].1 = value,
            None => {
                self.index.insert(key.clone(), self.entries.len());
                self.entries.push((key, value));
            }
        }
    }

    /// The result of `key`.
    pub fn get(&self, key: &str) -> Option<&V> {
        self.index.get(key).map(|position| &self.entries[*position].1)
    }

    /// Returns true if `key` has a result.
    pub fn contains_key(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    /// Number of keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no key has a result.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Keys in arrival order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(key, _)| key.as_str())
    }

    /// Results in arrival order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &V)> {
        self.entries.iter().map(|(key, value)| (key.as_str(), value))
    }

    /// Converts every result, keeping the order.
    pub fn map<U>(self, mut f: impl FnMut(&str, V) -> U) -> KeyedResults<U> {
        let entries = self
            .entries
            .into_iter()
            .map(|(key, value)| {
                let value = f(&key, value);
                (key, value)
            })
            .collect();
        KeyedResults {
            entries,
            index: self.index,
        }
    }
}

impl<V> IntoIterator for KeyedResults<V> {
    type Item = (String, V);
    type IntoIter = std::vec::IntoIter<(String, V)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl<V> FromIterator<(String, V)> for KeyedResults<V> {
    fn from_iter<I: IntoIterator<Item = (String, V)>>(iter: I) -> Self {
        let mut results = KeyedResults::new();
        for (key, value) in iter {
            results.insert(key, value);
        }
        results
    }
}

impl<V: fmt::Debug> fmt::Debug for KeyedResults<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.entries.iter().map(|(key, value)| (key, value)))
            .finish()
    }
}

/// Keys a bulk write failed for. Keys that succeeded are absent.
pub type BulkErrors = KeyedResults<CacheError>;

/// Outcome of a bulk read. A key is in at most one of the two maps; keys
/// that were not found are in neither.
#[derive(Debug)]
pub struct BulkRead<T> {
    /// Values of the keys that were found.
    pub values: KeyedResults<T>,
    /// Keys whose read failed.
    pub failures: BulkErrors,
}

impl<T> Default for BulkRead<T> {
    fn default() -> Self {
        BulkRead {
            values: KeyedResults::new(),
            failures: KeyedResults::new(),
        }
    }
}

impl<T> BulkRead<T> {
    /// Converts every value, moving the keys whose conversion failed into
    /// `failures`.
    pub(crate) fn try_map<U>(
        self,
        mut f: impl FnMut(&str, T) -> CacheResult<U>,
    ) -> BulkRead<U> {
        let mut values = KeyedResults::new();
        let mut failures = self.failures;
        for (key, value) in self.values {
            match f(&key, value) {
                Ok(value) => values.insert(key, value),
                Err(err) => failures.insert(key, err),
            }
        }
        BulkRead { values, failures }
    }
}

/// Validates and deduplicates the keys of a bulk call.
///
/// Duplicates collapse onto their first occurrence; order is otherwise kept.
pub fn prepare_keys<K: AsRef<str>>(keys: &[K]) -> CacheResult<Vec<String>> {
    if keys.is_empty() {
        fail!(invalid_argument!("Keys collection cannot be empty"));
    }
    let mut seen = HashSet::with_capacity(keys.len());
    let mut unique = Vec::with_capacity(keys.len());
    for key in keys {
        let key = key.as_ref();
        if key.is_empty() {
            fail!(invalid_argument!("Keys collection cannot contain empty keys"));
        }
        if seen.insert(key) {
            unique.push(key.to_string());
        }
    }
    if unique.len() < keys.len() {
        trace!("collapsed {} duplicate keys", keys.len() - unique.len());
    }
    Ok(unique)
}

/// Validates, deduplicates and copies the items of a bulk write.
///
/// Every item is checked before any is copied, so a bad item fails the call
/// before any serialization work. The caller's items are never modified.
pub fn prepare_items<K: AsRef<str>>(items: &[(K, CacheItem)]) -> CacheResult<Vec<(String, CacheItem)>> {
    if items.is_empty() {
        fail!(invalid_argument!("Items collection cannot be empty"));
    }
    for (key, item) in items {
        validate_key(key.as_ref())?;
        item.validate_expirations()?;
    }
    let mut seen = HashSet::with_capacity(items.len());
    Ok(items
        .iter()
        .filter(|(key, _)| seen.insert(key.as_ref()))
        .map(|(key, item)| (key.as_ref().to_string(), item.clone()))
        .collect())
}

/// Builds one request entry per group of a routed batch.
pub(crate) fn fan_out<T>(
    batch: RoutedBatch<T>,
    view_id: i64,
    command: impl Fn(Vec<T>) -> Command,
) -> Request {
    let view_id = if batch.merged_view {
        crate::command::FORCED_VIEW_ID
    } else {
        view_id
    };
    let parts = batch
        .groups
        .into_iter()
        .map(|(target, entries)| (target, command(entries)))
        .collect();
    Request::distributed(parts, view_id)
}

/// Routes `entries` and builds the distributed request for them.
pub(crate) fn distribute<T>(
    entries: Vec<T>,
    key_of: impl Fn(&T) -> &str,
    map: Option<&dyn DistributionMap>,
    command: impl Fn(Vec<T>) -> Command,
) -> CacheResult<Request> {
    let view_id = map.map_or(0, |map| map.client_last_view_id());
    let batch = route(entries, key_of, map)?;
    trace!(
        "fanning {} entries out to {} servers",
        batch.len(),
        batch.groups.len()
    );
    Ok(fan_out(batch, view_id, command))
}

/// Merges the responses of a bulk write. A failed sub-request fails every
/// key it carried and nothing else.
pub(crate) fn merge_failures(responses: Vec<(RequestEntry, CacheResult<Response>)>) -> BulkErrors {
    let mut errors = BulkErrors::new();
    for (entry, response) in responses {
        match response {
            Ok(Response::Failures(failures)) => {
                for (key, err) in failures {
                    errors.insert(key, err.into());
                }
            }
            Ok(Response::Done) => {}
            Ok(other) => fail_keys(&mut errors, &entry, &unexpected_response(entry.command.name(), &other)),
            Err(err) => fail_keys(&mut errors, &entry, &err),
        }
    }
    errors
}

/// Merges the responses of a bulk read.
///
/// `extract` turns one sub-response into per-key values.
pub(crate) fn merge_reads<T>(
    responses: Vec<(RequestEntry, CacheResult<Response>)>,
    mut extract: impl FnMut(Response) -> Result<Vec<(String, T)>, Response>,
) -> BulkRead<T> {
    let mut read = BulkRead::default();
    for (entry, response) in responses {
        match response.map(&mut extract) {
            Ok(Ok(values)) => {
                for (key, value) in values {
                    read.values.insert(key, value);
                }
            }
            Ok(Err(other)) => fail_keys(
                &mut read.failures,
                &entry,
                &unexpected_response(entry.command.name(), &other),
            ),
            Err(err) => fail_keys(&mut read.failures, &entry, &err),
        }
    }
    read
}

fn fail_keys(errors: &mut BulkErrors, entry: &RequestEntry, err: &CacheError) {
    debug!(
        "{} sub-request to {:?} failed: {err}",
        entry.command.name(),
        entry.target
    );
    for key in entry.command.keys() {
        errors.insert(key.to_string(), err.clone_mostly("bulk sub-request failed"));
    }
}
