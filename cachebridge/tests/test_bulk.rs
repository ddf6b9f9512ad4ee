mod support;

mod bulk {
    use std::collections::HashSet;
    use std::sync::{Arc, Mutex};

    use assert_matches::assert_matches;
    use cachebridge::{
        CacheItem, Command, ErrorKind, FORCED_VIEW_ID, RequestEntry, Response, ServerError,
        ServerErrorKind, WirePayload,
    };
    use cachebridge_test::{MockReply, MockTransport};
    use rstest::rstest;

    use crate::support::*;

    fn item(value: &str) -> CacheItem {
        CacheItem::from_serialize(value).unwrap()
    }

    /// Answers a bulk read with every key it carries, valued by its name.
    fn echo_values(entry: &RequestEntry) -> Result<Response, ServerError> {
        Ok(Response::Values(
            entry
                .command
                .keys()
                .into_iter()
                .map(|key| (key.to_string(), payload(key)))
                .collect(),
        ))
    }

    fn sorted<'a>(keys: impl Iterator<Item = &'a str>) -> Vec<&'a str> {
        let mut keys: Vec<_> = keys.collect();
        keys.sort_unstable();
        keys
    }

    #[test]
    fn test_duplicate_keys_are_removed_once() {
        let transport = MockTransport::new(vec![MockReply::new(
            "REMOVE_BULK",
            Response::Values(vec![("a".into(), payload(&1)), ("b".into(), payload(&2))]),
        )]);
        let cache = remote(&transport);

        let removed = cache.remove_bulk::<i32, _>(&["a", "a", "b"]).unwrap();

        assert_eq!(transport.count("REMOVE_BULK"), 1);
        assert_matches!(
            &transport.executed()[0].command,
            Command::RemoveBulk { keys } if keys == &["a", "b"]
        );
        assert_eq!(removed.values.get("a"), Some(&1));
        assert_eq!(removed.values.get("b"), Some(&2));
        assert!(removed.failures.is_empty());
    }

    #[test]
    fn test_partial_add_failure_only_reports_failed_keys() {
        let transport = MockTransport::new(vec![
            MockReply::new(
                "ADD_BULK",
                Response::Failures(vec![(
                    "a".into(),
                    ServerError::known(ServerErrorKind::KeyAlreadyExists, None),
                )]),
            ),
            value_reply("two"),
        ]);
        let cache = remote(&transport);

        let errors = cache
            .add_bulk(&[("a", item("one")), ("b", item("two"))])
            .unwrap();

        assert_eq!(errors.len(), 1);
        assert_matches!(
            errors.get("a"),
            Some(err) if err.kind() == ErrorKind::ServerError(ServerErrorKind::KeyAlreadyExists)
        );
        assert!(!errors.contains_key("b"));
        assert_eq!(cache.get::<String>("b").unwrap().as_deref(), Some("two"));
        transport.assert_all_replies_consumed();
    }

    #[test]
    fn test_partial_add_failure_in_proc() {
        let cache = in_proc();
        cache.add("a", "first").unwrap();

        let errors = cache
            .add_bulk(&[("a", item("one")), ("b", item("two"))])
            .unwrap();

        assert_eq!(sorted(errors.keys()), vec!["a"]);
        assert_eq!(cache.get::<String>("a").unwrap().as_deref(), Some("first"));
        assert_eq!(cache.get::<String>("b").unwrap().as_deref(), Some("two"));
    }

    #[test]
    fn test_bulk_writes_fan_out_by_owner() {
        let map = two_servers();
        let (first, second) = keys_by_owner(&map, 20);
        let transport = MockTransport::new(vec![
            MockReply::new("INSERT_BULK", Response::Done).for_target(server(SERVER_1)),
            MockReply::error(
                "INSERT_BULK",
                ServerError::known(ServerErrorKind::OperationFailed, None),
            )
            .for_target(server(SERVER_2)),
        ])
        .with_distribution(map);
        let cache = remote(&transport);

        let items: Vec<_> = first
            .iter()
            .chain(second.iter())
            .map(|key| (key.as_str(), item(key)))
            .collect();
        let errors = cache.insert_bulk(&items).unwrap();

        let executed = transport.executed();
        assert_eq!(executed.len(), 2);
        assert!(executed.iter().all(|executed| executed.view_id == 7));
        for executed in &executed {
            let expected = if executed.target == server(SERVER_1) {
                &first
            } else {
                &second
            };
            assert_eq!(executed.command.keys(), expected.iter().map(String::as_str).collect::<Vec<_>>());
        }
        // A failed sub-request fails exactly the keys it carried.
        assert_eq!(
            sorted(errors.keys()),
            sorted(second.iter().map(String::as_str))
        );
    }

    #[test]
    fn test_state_transfer_resends_only_the_rejected_sub_request() {
        let map = two_servers();
        let (first, second) = keys_by_owner(&map, 20);
        let stored = Arc::new(Mutex::new(HashSet::new()));
        let store = stored.clone();
        let transport = MockTransport::new(vec![
            MockReply::with("ADD_BULK", move |entry| {
                if entry.target == server(SERVER_2) && entry.view_id != FORCED_VIEW_ID {
                    return Err(ServerError::known(
                        ServerErrorKind::StateTransferInProgress,
                        None,
                    ));
                }
                let mut store = store.lock().unwrap();
                let existing: Vec<_> = entry
                    .command
                    .keys()
                    .into_iter()
                    .filter(|key| !store.insert(key.to_string()))
                    .map(|key| {
                        (
                            key.to_string(),
                            ServerError::known(ServerErrorKind::KeyAlreadyExists, None),
                        )
                    })
                    .collect();
                Ok(if existing.is_empty() {
                    Response::Done
                } else {
                    Response::Failures(existing)
                })
            })
            .repeatedly(),
        ])
        .with_distribution(map);
        let cache = remote(&transport);

        let items: Vec<_> = first
            .iter()
            .chain(second.iter())
            .map(|key| (key.as_str(), item(key)))
            .collect();
        let errors = cache.add_bulk(&items).unwrap();

        assert!(errors.is_empty(), "{errors:?}");
        assert_eq!(stored.lock().unwrap().len(), items.len());
        let executed = transport.executed();
        assert_eq!(executed.len(), 3);
        let retry = &executed[2];
        assert!(retry.dedicated);
        assert_eq!(retry.view_id, FORCED_VIEW_ID);
        assert_eq!(
            sorted(retry.command.keys().into_iter()),
            sorted(second.iter().map(String::as_str))
        );
    }

    #[test]
    fn test_disconnected_owner_is_merged_with_forced_view() {
        let map = two_servers();
        map.set_connected(SERVER_2.into(), false);
        let (first, second) = keys_by_owner(&map, 20);
        let transport = MockTransport::new(vec![MockReply::new("DELETE_BULK", Response::Done)])
            .with_distribution(map);
        let cache = remote(&transport);

        let keys: Vec<_> = first.iter().chain(second.iter()).collect();
        let errors = cache.delete_bulk(&keys).unwrap();

        assert!(errors.is_empty());
        let executed = transport.executed();
        assert_eq!(executed.len(), 1);
        assert_eq!(executed[0].target, server(SERVER_1));
        assert_eq!(executed[0].view_id, FORCED_VIEW_ID);
        assert_eq!(executed[0].command.keys().len(), keys.len());
    }

    #[rstest]
    #[case::activity_blocked(ServerErrorKind::ActivityBlocked)]
    #[case::stale_view(ServerErrorKind::StaleView)]
    fn test_rejected_distributed_read_is_reissued_whole(#[case] rejection: ServerErrorKind) {
        let map = two_servers();
        let (first, second) = keys_by_owner(&map, 20);
        let transport = MockTransport::new(vec![
            MockReply::error("GET_BULK", ServerError::known(rejection, None))
                .for_target(server(SERVER_1)),
            MockReply::with("GET_BULK", echo_values).for_target(server(SERVER_2)),
            MockReply::with("GET_BULK", echo_values),
        ])
        .with_distribution(map);
        let cache = remote(&transport);

        let keys = [first[0].as_str(), second[0].as_str()];
        let read = cache.get_bulk::<String, _>(&keys).unwrap();

        assert!(read.failures.is_empty());
        assert_eq!(read.values.get(keys[0]).map(String::as_str), Some(keys[0]));
        assert_eq!(read.values.get(keys[1]).map(String::as_str), Some(keys[1]));

        let executed = transport.executed();
        assert_eq!(executed.len(), 3);
        let retry = &executed[2];
        assert!(retry.dedicated);
        assert_eq!(retry.view_id, FORCED_VIEW_ID);
        assert_eq!(retry.command.keys(), keys);
        transport.assert_all_replies_consumed();
    }

    #[test]
    fn test_undecodable_values_fail_only_their_key() {
        let transport = MockTransport::new(vec![MockReply::new(
            "GET_BULK",
            Response::Values(vec![
                ("good".into(), payload(&5)),
                (
                    "bad".into(),
                    WirePayload {
                        bytes: b"not json".to_vec(),
                        ..WirePayload::default()
                    },
                ),
            ]),
        )]);
        let cache = remote(&transport);

        let read = cache.get_bulk::<i32, _>(&["good", "bad", "missing"]).unwrap();

        assert_eq!(read.values.get("good"), Some(&5));
        assert_matches!(read.failures.get("bad"), Some(err) if err.kind() == ErrorKind::Serialization);
        assert!(!read.values.contains_key("missing"));
        assert!(!read.failures.contains_key("missing"));
        assert_eq!(cache.stats().hits(), 2);
        assert_eq!(cache.stats().misses(), 1);
    }

    #[test]
    fn test_in_proc_bulk_reads() {
        let cache = in_proc();
        let errors = cache
            .insert_bulk(&[("a", item("1")), ("b", item("2")), ("a", item("3"))])
            .unwrap();
        assert!(errors.is_empty());
        // The first occurrence of a duplicated key wins.
        assert_eq!(cache.get::<String>("a").unwrap().as_deref(), Some("1"));

        let present = cache.contains_bulk(&["a", "b", "c"]).unwrap();
        assert_eq!(present.values.get("a"), Some(&true));
        assert_eq!(present.values.get("c"), Some(&false));

        let items = cache.get_cache_item_bulk(&["a", "c"]).unwrap();
        assert_eq!(sorted(items.values.keys()), vec!["a"]);
        assert!(items.values.get("a").unwrap().creation_time().is_some());

        assert!(cache.delete_bulk(&["a", "b"]).unwrap().is_empty());
        assert_eq!(cache.count().unwrap(), 0);
    }

    #[test]
    fn test_empty_bulk_calls_are_rejected() {
        let cache = in_proc();
        let none: [&str; 0] = [];
        assert_matches!(cache.get_bulk::<i32, _>(&none), Err(err) if err.is_validation_error());
        let no_items: [(&str, CacheItem); 0] = [];
        assert_matches!(cache.insert_bulk(&no_items), Err(err) if err.is_validation_error());
    }

    #[test]
    fn test_bulk_calls_need_a_reachable_server() {
        let map = Arc::new(cachebridge::BucketDistribution::new());
        let transport = MockTransport::default().with_distribution(map);
        let cache = remote(&transport);

        assert_matches!(
            cache.delete_bulk(&["a"]),
            Err(err) if err.kind() == ErrorKind::NoServerAvailable
        );
        assert!(transport.executed().is_empty());
    }
}
