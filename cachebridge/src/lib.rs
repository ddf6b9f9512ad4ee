//! cachebridge is the client side of a partitioned, distributed cache. It
//! shapes cache operations into commands, fans bulk calls out to the servers
//! owning their keys, keeps pessimistic locks honest, and turns server
//! pushes back into calls of application callbacks.
//!
//! The crate is called `cachebridge` and you can depend on it via cargo:
//!
//! ```ini
//! [dependencies.cachebridge]
//! version = "*"
//! ```
//!
//! # Basic Operation
//!
//! A [`Cache`] is opened from a [`CacheBuilder`]. By default the cache lives
//! in the local process, which is handy for tests and single-node setups:
//!
//! ```rust
//! fn do_something() -> cachebridge::CacheResult<()> {
//!     let cache = cachebridge::Cache::builder("demo").open()?;
//!     cache.insert("answer", &42)?;
//!     assert_eq!(cache.get::<i32>("answer")?, Some(42));
//!     Ok(())
//! }
//! # do_something().unwrap();
//! ```
//!
//! ## Remote caches
//!
//! Talking to real servers goes through a [`Transport`], which owns the
//! connections and the wire encoding. The library hands it fully routed
//! [`Request`]s and receives parsed [`Response`]s back. Notifications the
//! transport receives are pushed into the [`NotificationSink`] it was given
//! when the cache was opened.
//!
//! ```rust,no_run
//! # use std::sync::Arc;
//! # fn connect() -> Arc<dyn cachebridge::Transport> { unimplemented!() }
//! fn do_something() -> cachebridge::CacheResult<()> {
//!     let cache = cachebridge::Cache::builder("sessions")
//!         .remote(connect())
//!         .open()?;
//!     let (acquired, handle) = cache.lock("user:1", None)?;
//!     if acquired {
//!         cache.unlock("user:1", Some(&handle))?;
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Events
//!
//! Callbacks are [`Listener`]s, compared by identity. Subscribing the same
//! listener twice is reference-counted: the servers only hear about the
//! first subscription and the last unsubscription.
//!
//! ```rust
//! use cachebridge::{DataCallback, DataFilter, EventTypes};
//!
//! # fn main() -> cachebridge::CacheResult<()> {
//! let cache = cachebridge::Cache::builder("demo").open()?;
//! let on_added = DataCallback::new(|key, _event| println!("added {key}"));
//! let descriptor = cache
//!     .register_cache_notification(&on_added, EventTypes::ADDED, DataFilter::None)?
//!     .expect("exceptions are enabled");
//! cache.insert("k", &"v")?;
//! cache.unregister_cache_notification(&descriptor)?;
//! # Ok(())
//! # }
//! ```

#![deny(non_camel_case_types)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, warn(rustdoc::broken_intra_doc_links))]

// public api
pub use crate::bulk::{BulkErrors, BulkRead, KeyedResults, prepare_items, prepare_keys};
pub use crate::cache::{Cache, CacheStats};
pub use crate::command::{
    Command, FORCED_VIEW_ID, NotificationKind, Request, RequestEntry, Response, Target, WireItem,
    WirePayload,
};
pub use crate::config::{CacheBuilder, CacheConfig, DEFAULT_LOCK_TIMEOUT, EngineMode};
pub use crate::event_dispatch::{Delivery, Notification, NotificationSink, WireEventItem};
pub use crate::events::{
    CacheEventArg, CacheStoppedCallback, CustomEventCallback, DataCallback, EventCacheItem,
    EventDescriptor, EventRegistrationInfo, Listener, MemberCallback, MemberEvent, PollCallback,
    PolledEvent, PollingResult,
};
pub use crate::lock::{get_access, insert_access, remove_access};
pub use crate::routing::{
    BUCKET_COUNT, BucketDistribution, DistributionMap, RoutedBatch, get_bucket, route,
};
pub use crate::serialization::{
    CHUNK_SIZE, Codec, DEFAULT_COMPRESSION_THRESHOLD, SerializationFormat, Serializer,
    UserBinaryObject,
};
pub use crate::transport::Transport;

// preserve grouping and order
#[rustfmt::skip]
pub use crate::types::{
    // result types
    CacheResult,

    // values and items
    ItemValue,
    CacheItem,
    BitSet,
    Priority,

    // events
    DataFilter,
    EventType,
    EventTypes,
    CallbackType,
    RemovedReason,

    // locking
    LockHandle,
    LockAccessType,

    // cluster
    ServerAddress,
    NO_CALLBACK,
};

#[rustfmt::skip]
pub use crate::errors::{
    // error kinds
    ErrorKind,
    ServerErrorKind,
    RetryMethod,

    // error and result types
    CacheError,
    ServerError,

    // utility functions
    make_extension_error,

    // stable codes
    CACHE_NOT_INIT,
};

mod macros;

mod bulk;
mod cache;
mod cache_impl;
mod callback_registry;
mod command;
mod config;
mod errors;
mod event_dispatch;
mod events;
mod lock;
mod routing;
mod serialization;
mod transport;
mod types;
