#![allow(dead_code)]

use std::sync::Arc;

use cachebridge::{
    BitSet, BucketDistribution, Cache, Response, ServerAddress, Target, WireItem, WirePayload,
};
use cachebridge_test::{MockReply, MockTransport};
use serde::Serialize;

pub const SERVER_1: &str = "10.0.0.1:9800";
pub const SERVER_2: &str = "10.0.0.2:9800";

pub fn server(address: &str) -> Target {
    Target::Server(ServerAddress::from(address))
}

/// Opens a cache over `transport`.
pub fn remote(transport: &MockTransport) -> Cache {
    Cache::builder("remote-test")
        .remote(Arc::new(transport.clone()))
        .open()
        .unwrap()
}

pub fn in_proc() -> Cache {
    Cache::builder("inproc-test").open().unwrap()
}

/// The payload a server would hand back for `value`.
pub fn payload<T: Serialize + ?Sized>(value: &T) -> WirePayload {
    WirePayload {
        bytes: serde_json::to_vec(value).unwrap(),
        flags: BitSet::new(),
    }
}

pub fn wire_item<T: Serialize + ?Sized>(value: &T) -> WireItem {
    WireItem {
        payload: payload(value),
        ..WireItem::default()
    }
}

pub fn value_reply<T: Serialize + ?Sized>(value: &T) -> MockReply {
    MockReply::new(
        "GET",
        Response::Value {
            payload: Some(payload(value)),
            lock: None,
        },
    )
}

/// Both servers connected, buckets alternating between them.
pub fn two_servers() -> Arc<BucketDistribution> {
    let map = BucketDistribution::new();
    map.import_hashmap(7, vec![SERVER_1.into(), SERVER_2.into()]);
    map.set_connected(SERVER_1.into(), true);
    map.set_connected(SERVER_2.into(), true);
    Arc::new(map)
}

/// Keys from `candidates` split by the server owning them.
pub fn keys_by_owner(map: &BucketDistribution, candidates: usize) -> (Vec<String>, Vec<String>) {
    use cachebridge::DistributionMap;

    let mut first = Vec::new();
    let mut second = Vec::new();
    for key in (0..candidates).map(|i| format!("key-{i}")) {
        match map.server_for_key(&key) {
            Some(owner) if owner.as_str() == SERVER_1 => first.push(key),
            _ => second.push(key),
        }
    }
    (first, second)
}
