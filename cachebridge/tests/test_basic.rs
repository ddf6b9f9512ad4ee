mod support;

mod basic {
    use std::time::{Duration, SystemTime};

    use assert_matches::assert_matches;
    use cachebridge::{
        BitSet, Cache, CacheItem, Codec, ErrorKind, ItemValue, Response, SerializationFormat,
        Serializer, ServerError, ServerErrorKind, Target, WirePayload, route,
    };
    use cachebridge_test::{MockReply, MockTransport};
    use rstest::rstest;
    use serde::{Deserialize, Serialize};

    use crate::support::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Session {
        user: String,
        visits: u32,
    }

    #[test]
    fn test_in_proc_round_trip() {
        let cache = in_proc();
        let session = Session {
            user: "ada".into(),
            visits: 3,
        };
        cache.insert("session:1", &session).unwrap();

        assert_eq!(cache.get::<Session>("session:1").unwrap(), Some(session));
        assert_eq!(cache.count().unwrap(), 1);
        assert!(cache.contains("session:1").unwrap());
        assert_eq!(cache.get::<Session>("session:2").unwrap(), None);
        assert_eq!(cache.stats().hits(), 1);
        assert_eq!(cache.stats().misses(), 1);
    }

    #[test]
    fn test_add_refuses_existing_keys() {
        let cache = in_proc();
        cache.add("k", &1).unwrap();
        let err = cache.add("k", &2).unwrap_err();
        assert_eq!(
            err.kind(),
            ErrorKind::ServerError(ServerErrorKind::KeyAlreadyExists)
        );
        assert_eq!(cache.get::<i32>("k").unwrap(), Some(1));
    }

    #[test]
    fn test_remove_returns_the_old_value() {
        let cache = in_proc();
        cache.insert("k", "v").unwrap();
        assert_eq!(cache.remove::<String>("k").unwrap().as_deref(), Some("v"));
        assert_eq!(cache.remove::<String>("k").unwrap(), None);
        cache.insert("k", "v").unwrap();
        cache.delete("k").unwrap();
        assert!(!cache.contains("k").unwrap());
    }

    #[test]
    fn test_binary_values_survive_large_payloads() {
        let cache = Cache::builder("big").compression_threshold(1024).open().unwrap();
        let raw = vec![42u8; 200 * 1024];
        cache.insert_item("blob", &CacheItem::new(raw.clone())).unwrap();

        let item = cache.get_cache_item("blob").unwrap().unwrap();
        assert!(item.flags().is_set(BitSet::BINARY_DATA));
        assert!(item.flags().is_set(BitSet::COMPRESSED));
        assert_eq!(item.value().as_bytes(), Some(&raw[..]));
    }

    #[rstest]
    #[case::in_proc(false)]
    #[case::remote(true)]
    fn test_both_expirations_are_rejected_before_serializing(#[case] remote_engine: bool) {
        let transport = MockTransport::default();
        let cache = if remote_engine {
            remote(&transport)
        } else {
            in_proc()
        };
        let item = CacheItem::from_serialize("v")
            .unwrap()
            .with_absolute_expiration(SystemTime::now() + Duration::from_secs(300))
            .with_sliding_expiration(Duration::from_secs(300));

        let err = cache.insert_item("k", &item).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        let err = cache.add_bulk(&[("k", item)]).unwrap_err();
        assert!(err.is_validation_error());
        assert!(transport.executed().is_empty());
    }

    #[rstest]
    #[case("")]
    fn test_empty_keys_are_rejected(#[case] key: &str) {
        let cache = in_proc();
        assert_matches!(cache.get::<i32>(key), Err(err) if err.kind() == ErrorKind::InvalidArgument);
        assert_matches!(cache.insert(key, &1), Err(err) if err.is_validation_error());
        assert_matches!(cache.lock(key, None), Err(err) if err.is_validation_error());
    }

    #[test]
    fn test_flags_accumulate_into_the_callers_set() {
        let codec = Codec::new(SerializationFormat::Binary, Some(1));
        let mut stored = BitSet::new();
        let bytes = codec
            .serialize(&ItemValue::from_serialize("hello").unwrap(), &mut stored)
            .unwrap();
        assert_eq!(stored, BitSet::COMPRESSED);

        let transport = MockTransport::new(vec![MockReply::new(
            "GET",
            Response::Value {
                payload: Some(WirePayload {
                    bytes,
                    flags: stored,
                }),
                lock: None,
            },
        )]);
        let cache = remote(&transport);

        let mut flags = BitSet::WRITE_THRU;
        let value: Option<String> = cache.get_with_flags("k", &mut flags).unwrap();

        assert_eq!(value.as_deref(), Some("hello"));
        assert!(flags.is_set(BitSet::WRITE_THRU));
        assert!(flags.is_set(BitSet::COMPRESSED));
        transport.assert_all_replies_consumed();
    }

    #[test]
    fn test_state_transfer_retries_once_as_dedicated_call() {
        let transport = MockTransport::new(vec![
            MockReply::error(
                "CONTAINS",
                ServerError::known(ServerErrorKind::StateTransferInProgress, None),
            ),
            MockReply::new("CONTAINS", Response::Bool(true)),
            MockReply::new("COUNT", Response::Count(9)),
        ]);
        let cache = remote(&transport);

        assert!(cache.contains("k").unwrap());
        let executed = transport.executed();
        assert_eq!(executed.len(), 2);
        assert!(!executed[0].dedicated);
        assert!(executed[1].dedicated);
        assert_eq!(executed[1].target, Target::Any);
        assert_eq!(executed[1].view_id, cachebridge::FORCED_VIEW_ID);

        // Requests keep going out dedicated while the transfer lasts.
        assert_eq!(cache.count().unwrap(), 9);
        assert!(transport.executed()[2].dedicated);
        transport.assert_all_replies_consumed();
    }

    #[test]
    fn test_dedicated_retry_happens_only_once() {
        let transfer = ServerError::known(ServerErrorKind::StateTransferInProgress, None);
        let transport = MockTransport::new(vec![
            MockReply::error("CLEAR", transfer.clone()),
            MockReply::error("CLEAR", transfer),
        ]);
        let cache = remote(&transport);

        let err = cache.clear().unwrap_err();
        assert_eq!(
            err.kind(),
            ErrorKind::ServerError(ServerErrorKind::StateTransferInProgress)
        );
        assert_eq!(transport.count("CLEAR"), 2);
    }

    #[test]
    fn test_dedicated_retry_goes_to_a_connected_server() {
        let transport = MockTransport::new(vec![
            MockReply::error(
                "CLEAR",
                ServerError::known(ServerErrorKind::StateTransferInProgress, None),
            ),
            MockReply::new("CLEAR", Response::Done),
        ]);
        let map = cachebridge::BucketDistribution::new();
        map.set_connected(SERVER_1.into(), true);
        let transport = transport.with_distribution(std::sync::Arc::new(map));
        let cache = remote(&transport);

        cache.clear().unwrap();
        assert_eq!(transport.executed()[1].target, server(SERVER_1));
    }

    #[test]
    fn test_whole_exchange_transfer_failure_is_retried() {
        let transport = MockTransport::new(vec![MockReply::new("COUNT", Response::Count(1))]);
        transport.fail_next_exchange(ServerError::known(
            ServerErrorKind::StateTransferInProgress,
            None,
        ));
        let cache = remote(&transport);

        assert_eq!(cache.count().unwrap(), 1);
        assert!(transport.executed()[0].dedicated);
    }

    #[test]
    fn test_suppressed_failures_return_empty_results() {
        let transport = MockTransport::new(vec![
            MockReply::error("GET", ServerError::known(ServerErrorKind::OperationFailed, None)),
            MockReply::error("COUNT", ServerError::known(ServerErrorKind::OperationFailed, None)),
        ]);
        let cache = Cache::builder("quiet")
            .exceptions_enabled(false)
            .remote(std::sync::Arc::new(transport.clone()))
            .open()
            .unwrap();

        assert_eq!(cache.get::<String>("k").unwrap(), None);
        assert_eq!(cache.count().unwrap(), 0);
        cache.insert("", &1).unwrap();

        cache.dispose();
        assert_matches!(cache.count(), Err(err) if err.is_not_initialized());
    }

    #[test]
    fn test_disposing_the_last_handle_disposes_the_transport() {
        let transport = MockTransport::default();
        let cache = remote(&transport);
        let other = cache.clone();

        cache.dispose();
        assert!(!transport.is_disposed());
        assert!(transport.sink().unwrap().has_bridge());

        drop(other);
        assert!(transport.is_disposed());
        assert!(!transport.sink().unwrap().has_bridge());
        assert_matches!(cache.get::<i32>("k"), Err(err) if err.code() == Some(cachebridge::CACHE_NOT_INIT));
    }

    #[test]
    fn test_unexpected_responses_are_reported() {
        let transport = MockTransport::new(vec![MockReply::new("CONTAINS", Response::Count(1))]);
        let cache = remote(&transport);
        assert_matches!(cache.contains("k"), Err(err) if err.kind() == ErrorKind::ClientError);
    }

    #[test]
    fn test_routing_without_a_map_keeps_one_group() {
        let keys = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let batch = route(keys, String::as_str, None).unwrap();

        assert!(!batch.merged_view);
        assert_eq!(batch.groups.len(), 1);
        let (target, group) = &batch.groups[0];
        assert_eq!(*target, Target::Any);
        assert_eq!(group, &["a", "b", "c"]);
    }
}
