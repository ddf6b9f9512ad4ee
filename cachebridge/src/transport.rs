use std::sync::Arc;

use crate::command::Request;
use crate::event_dispatch::NotificationSink;
use crate::routing::DistributionMap;
use crate::types::CacheResult;

/// The connection layer a remote cache talks through.
///
/// Implementations own connection pooling and wire encoding. They execute
/// every entry of a request against its target and store one response per
/// entry; a failure of the whole exchange is returned from
/// [`Transport::execute`] instead.
pub trait Transport: Send + Sync {
    /// Executes `request`, filling the response of each entry.
    fn execute(&self, request: &mut Request) -> CacheResult<()>;

    /// The cluster's key distribution, or `None` for caches that are not
    /// partitioned.
    fn distribution(&self) -> Option<Arc<dyn DistributionMap>> {
        None
    }

    /// Where server pushes must be delivered from now on.
    fn set_notification_sink(&self, sink: NotificationSink);

    /// Closes every connection. Called once, when the last cache handle
    /// using the transport is released.
    fn dispose(&self) {}
}
