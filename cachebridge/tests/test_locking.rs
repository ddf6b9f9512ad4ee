mod support;

mod locking {
    use std::time::{Duration, SystemTime};

    use assert_matches::assert_matches;
    use cachebridge::{
        BitSet, CacheItem, Command, ErrorKind, LockAccessType, LockHandle, Response, ServerError,
        ServerErrorKind,
    };
    use cachebridge_test::{MockReply, MockTransport};

    use crate::support::*;

    const TEN_SECONDS: Option<Duration> = Some(Duration::from_secs(10));

    fn mismatch(err: &cachebridge::CacheError) -> bool {
        err.kind() == ErrorKind::ServerError(ServerErrorKind::LockMismatch)
    }

    #[test]
    fn test_lock_round_trip() {
        let cache = in_proc();
        cache.insert("k", "v").unwrap();

        let (acquired, handle) = cache.lock("k", TEN_SECONDS).unwrap();
        assert!(acquired);
        assert!(handle.is_held());
        cache.unlock("k", Some(&handle)).unwrap();

        let (acquired, handle) = cache.lock("k", TEN_SECONDS).unwrap();
        assert!(acquired);
        let stranger = LockHandle::new("someone-else", None);
        assert_matches!(cache.unlock("k", Some(&stranger)), Err(err) if mismatch(&err));

        let mut holder = LockHandle::default();
        assert!(cache.is_locked("k", &mut holder).unwrap());
        assert_eq!(holder, handle);

        cache.unlock("k", None).unwrap();
        assert!(!cache.is_locked("k", &mut LockHandle::default()).unwrap());
        cache.unlock("k", None).unwrap();
    }

    #[test]
    fn test_second_locker_is_turned_away() {
        let cache = in_proc();
        cache.insert("k", "v").unwrap();

        let (acquired, _) = cache.lock("k", TEN_SECONDS).unwrap();
        assert!(acquired);
        let (acquired, handle) = cache.lock("k", TEN_SECONDS).unwrap();
        assert!(!acquired);
        assert!(!handle.is_held());
    }

    #[test]
    fn test_empty_handle_cannot_break_anothers_lock() {
        let cache = in_proc();
        cache.insert("k", "v").unwrap();
        let (_, owner) = cache.lock("k", TEN_SECONDS).unwrap();
        let (acquired, loser) = cache.lock("k", TEN_SECONDS).unwrap();
        assert!(!acquired);

        assert_matches!(cache.unlock("k", Some(&loser)), Err(err) if mismatch(&err));
        assert_matches!(
            cache.unlock("k", Some(&LockHandle::default())),
            Err(err) if mismatch(&err)
        );
        let mut holder = LockHandle::default();
        assert!(cache.is_locked("k", &mut holder).unwrap());
        assert_eq!(holder, owner);

        cache.unlock("k", Some(&owner)).unwrap();
        assert!(!cache.is_locked("k", &mut LockHandle::default()).unwrap());
    }

    #[test]
    fn test_remote_unlock_with_empty_handle_is_conditional() {
        let transport = MockTransport::new(vec![MockReply::error(
            "UNLOCK",
            ServerError::known(ServerErrorKind::LockMismatch, None),
        )]);
        let cache = remote(&transport);

        assert_matches!(
            cache.unlock("k", Some(&LockHandle::default())),
            Err(err) if mismatch(&err)
        );
        assert_matches!(
            &transport.executed()[0].command,
            Command::Unlock { lock_id: None, force: false, .. }
        );
    }

    #[test]
    fn test_locked_writes_need_the_holder() {
        let cache = in_proc();
        cache.insert("k", &1).unwrap();
        let (_, handle) = cache.lock("k", TEN_SECONDS).unwrap();
        let item = CacheItem::from_serialize(&2).unwrap();

        assert_matches!(
            cache.insert_with_lock("k", &item, Some(&LockHandle::new("other", None)), true),
            Err(err) if mismatch(&err)
        );
        // Lock-ignoring writes go through.
        cache.insert_item("k", &item).unwrap();

        assert!(cache.is_locked("k", &mut LockHandle::default()).unwrap());
        let item = CacheItem::from_serialize(&3).unwrap();
        cache.insert_with_lock("k", &item, Some(&handle), false).unwrap();
        assert!(cache.is_locked("k", &mut LockHandle::default()).unwrap());
        cache.insert_with_lock("k", &item, Some(&handle), true).unwrap();
        assert!(!cache.is_locked("k", &mut LockHandle::default()).unwrap());
        assert_eq!(cache.get::<i32>("k").unwrap(), Some(3));
    }

    #[test]
    fn test_get_with_lock_reports_the_holder() {
        let cache = in_proc();
        cache.insert("k", "v").unwrap();

        let mut first = LockHandle::default();
        let value: Option<String> = cache.get_with_lock("k", TEN_SECONDS, &mut first, true).unwrap();
        assert_eq!(value.as_deref(), Some("v"));
        assert!(first.is_held());

        let mut second = LockHandle::default();
        let value: Option<String> = cache.get_with_lock("k", TEN_SECONDS, &mut second, true).unwrap();
        assert_eq!(value, None);
        assert_eq!(second, first);

        let mut mine = first.clone();
        let value: Option<String> = cache.get_with_lock("k", None, &mut mine, false).unwrap();
        assert_eq!(value.as_deref(), Some("v"));
    }

    #[test]
    fn test_locked_removes_need_the_holder() {
        let cache = in_proc();
        cache.insert("k", "v").unwrap();
        let (_, handle) = cache.lock("k", TEN_SECONDS).unwrap();

        assert_matches!(
            cache.delete_with_lock("k", Some(&LockHandle::new("other", None))),
            Err(err) if mismatch(&err)
        );
        let removed: Option<String> = cache.remove_with_lock("k", Some(&handle)).unwrap();
        assert_eq!(removed.as_deref(), Some("v"));
    }

    #[test]
    fn test_expired_locks_are_released() {
        let cache = in_proc();
        cache.insert("k", "v").unwrap();
        let (acquired, _) = cache.lock("k", Some(Duration::from_millis(1))).unwrap();
        assert!(acquired);
        std::thread::sleep(Duration::from_millis(20));
        assert!(!cache.is_locked("k", &mut LockHandle::default()).unwrap());
    }

    #[test]
    fn test_remote_lock_commands() {
        let granted = LockHandle::new("lock-7", Some(SystemTime::now()));
        let transport = MockTransport::new(vec![
            MockReply::new(
                "LOCK",
                Response::Lock {
                    acquired: true,
                    handle: granted.clone(),
                },
            ),
            MockReply::new("INSERT", Response::Done),
            MockReply::error("UNLOCK", ServerError::known(ServerErrorKind::LockMismatch, None)),
            MockReply::new("UNLOCK", Response::Done),
        ]);
        let cache = remote(&transport);

        let (acquired, handle) = cache.lock("k", None).unwrap();
        assert!(acquired);
        assert_eq!(handle, granted);

        let item = CacheItem::from_serialize("v").unwrap();
        cache.insert_with_lock("k", &item, Some(&handle), false).unwrap();
        assert_matches!(
            cache.unlock("k", Some(&LockHandle::new("other", None))),
            Err(err) if mismatch(&err)
        );
        cache.unlock("k", None).unwrap();

        let executed = transport.executed();
        assert_matches!(
            &executed[0].command,
            Command::Lock { timeout, .. } if *timeout == cachebridge::DEFAULT_LOCK_TIMEOUT
        );
        assert_matches!(
            &executed[1].command,
            Command::Insert { lock_id: Some(id), access: LockAccessType::DontRelease, item, .. }
                if id == "lock-7" && item.payload.flags.is_set(BitSet::LOCKED_ITEM)
        );
        assert_matches!(
            &executed[2].command,
            Command::Unlock { lock_id: Some(id), force: false, .. } if id == "other"
        );
        assert_matches!(
            &executed[3].command,
            Command::Unlock { lock_id: None, force: true, .. }
        );
        transport.assert_all_replies_consumed();
    }

    #[test]
    fn test_remote_refused_lock_yields_an_empty_handle() {
        let transport = MockTransport::new(vec![MockReply::new(
            "LOCK",
            Response::Lock {
                acquired: false,
                handle: LockHandle::new("held-elsewhere", None),
            },
        )]);
        let cache = remote(&transport);

        let (acquired, handle) = cache.lock("k", Some(Duration::ZERO)).unwrap();
        assert!(!acquired);
        assert_eq!(handle, LockHandle::default());
    }
}
