use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use cachebridge::{
    BucketDistribution, Cache, CacheItem, Codec, ItemValue, SerializationFormat, Serializer,
    get_bucket, route,
};

const SERVERS: usize = 4;

fn distribution() -> BucketDistribution {
    let map = BucketDistribution::new();
    let owners: Vec<_> = (0..SERVERS)
        .map(|i| format!("10.0.0.{i}:9800").into())
        .collect();
    for owner in &owners {
        map.set_connected(owner.clone(), true);
    }
    map.import_hashmap(1, owners);
    map
}

fn bench_route(c: &mut Criterion) {
    let map = distribution();
    let mut group = c.benchmark_group("route");

    group.bench_function("bucket", |b| b.iter(|| black_box(get_bucket(black_box("user:42")))));

    for size in [10usize, 100, 1000] {
        let keys: Vec<String> = (0..size).map(|i| format!("key-{i}")).collect();
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::new("keys", size), &keys, |b, keys| {
            b.iter(|| black_box(route(keys.clone(), String::as_str, Some(&map)).unwrap()))
        });
    }
    group.finish();
}

fn bench_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec");
    let value = ItemValue::Binary(vec![7u8; 256 * 1024]);

    for (name, threshold) in [("plain", None), ("compressed", Some(100 * 1024))] {
        let codec = Codec::new(SerializationFormat::Binary, threshold);
        group.bench_function(name, |b| {
            b.iter(|| {
                let mut flags = Default::default();
                let bytes = codec.serialize(&value, &mut flags).unwrap();
                black_box(codec.deserialize(&bytes, flags).unwrap())
            })
        });
    }
    group.finish();
}

fn bench_bulk_in_proc(c: &mut Criterion) {
    let cache = Cache::builder("bench").open().unwrap();
    let items: Vec<_> = (0..100)
        .map(|i| (format!("key-{i}"), CacheItem::from_serialize(&i).unwrap()))
        .collect();
    let keys: Vec<_> = items.iter().map(|(key, _)| key.clone()).collect();

    let mut group = c.benchmark_group("in_proc_bulk");
    group.throughput(Throughput::Elements(items.len() as u64));
    group.bench_function("insert_bulk", |b| {
        b.iter(|| black_box(cache.insert_bulk(&items).unwrap()))
    });
    group.bench_function("get_bulk", |b| {
        b.iter(|| black_box(cache.get_bulk::<i32, _>(&keys).unwrap()))
    });
    group.finish();
}

criterion_group!(bench, bench_route, bench_codec, bench_bulk_in_proc);
criterion_main!(bench);
