//! Testing support
//!
//! This crate provides `MockTransport` which implements `Transport` and can be
//! handed to a remote cache in place of a real connection layer. This is useful
//! for writing unit tests without needing cache servers.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use cachebridge::{Cache, Response};
//! use cachebridge_test::{MockReply, MockTransport};
//!
//! let transport = MockTransport::new(vec![MockReply::new("CONTAINS", Response::Bool(true))]);
//! let cache = Cache::builder("demo")
//!     .remote(Arc::new(transport.clone()))
//!     .open()
//!     .unwrap();
//!
//! assert!(cache.contains("foo").unwrap());
//! transport.assert_all_replies_consumed();
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use cachebridge::{
    CacheError, Command, DistributionMap, ErrorKind, Notification, NotificationSink, Request,
    RequestEntry, Response, ServerError, Target, Transport,
};
use log::trace;

type Responder = dyn Fn(&RequestEntry) -> Result<Response, ServerError> + Send + Sync;

/// A canned answer to one command.
#[derive(Clone)]
pub struct MockReply {
    name: &'static str,
    target: Option<Target>,
    responder: Arc<Responder>,
    repeat: bool,
}

impl MockReply {
    /// Answers the next command called `name` (see [`Command::name`]) with
    /// `response`.
    pub fn new(name: &'static str, response: Response) -> Self {
        MockReply::with(name, move |_| Ok(response.clone()))
    }

    /// Fails the next command called `name` with a server error.
    pub fn error(name: &'static str, error: ServerError) -> Self {
        MockReply::with(name, move |_| Err(error.clone()))
    }

    /// Answers the next command called `name` with whatever `responder`
    /// computes from it.
    pub fn with<F>(name: &'static str, responder: F) -> Self
    where
        F: Fn(&RequestEntry) -> Result<Response, ServerError> + Send + Sync + 'static,
    {
        MockReply {
            name,
            target: None,
            responder: Arc::new(responder),
            repeat: false,
        }
    }

    /// Only answers commands sent to `target`.
    pub fn for_target(mut self, target: Target) -> Self {
        self.target = Some(target);
        self
    }

    /// Answers every matching command instead of only the next one.
    pub fn repeatedly(mut self) -> Self {
        self.repeat = true;
        self
    }

    fn matches(&self, entry: &RequestEntry) -> bool {
        self.name == entry.command.name()
            && self
                .target
                .as_ref()
                .is_none_or(|target| *target == entry.target)
    }
}

impl fmt::Debug for MockReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockReply")
            .field("name", &self.name)
            .field("target", &self.target)
            .field("repeat", &self.repeat)
            .finish()
    }
}

/// A command the mock received.
#[derive(Clone, Debug, PartialEq)]
pub struct ExecutedCommand {
    /// Server the command was sent to.
    pub target: Target,
    /// The command itself.
    pub command: Command,
    /// View id the command was routed with.
    pub view_id: i64,
    /// Whether the request was a dedicated call.
    pub dedicated: bool,
}

#[derive(Default)]
struct MockState {
    replies: VecDeque<MockReply>,
    exchange_failures: VecDeque<ServerError>,
    executed: Vec<ExecutedCommand>,
    sink: Option<NotificationSink>,
    distribution: Option<Arc<dyn DistributionMap>>,
    disposed: bool,
}

/// A mock transport for testing without servers. `MockTransport` answers
/// every command with the first queued [`MockReply`] matching it and
/// records what it executed. Commands without a matching reply fail with a
/// client error.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    /// Construct a new mock from the given replies.
    pub fn new<I>(replies: I) -> Self
    where
        I: IntoIterator<Item = MockReply>,
    {
        let transport = MockTransport::default();
        transport.lock().replies.extend(replies);
        transport
    }

    /// Routes bulk calls with `distribution`.
    pub fn with_distribution(self, distribution: Arc<dyn DistributionMap>) -> Self {
        self.lock().distribution = Some(distribution);
        self
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues another reply.
    pub fn push(&self, reply: MockReply) {
        self.lock().replies.push_back(reply);
    }

    /// Fails the next whole exchange with `error`, before any command is
    /// answered.
    pub fn fail_next_exchange(&self, error: ServerError) {
        self.lock().exchange_failures.push_back(error);
    }

    /// Every command executed so far, in order.
    pub fn executed(&self) -> Vec<ExecutedCommand> {
        self.lock().executed.clone()
    }

    /// How many commands called `name` were executed.
    pub fn count(&self, name: &str) -> usize {
        self.lock()
            .executed
            .iter()
            .filter(|executed| executed.command.name() == name)
            .count()
    }

    /// Returns true if every one-shot reply was used.
    pub fn is_empty(&self) -> bool {
        self.lock().replies.iter().all(|reply| reply.repeat)
    }

    /// Panics if a one-shot reply was never used.
    pub fn assert_all_replies_consumed(&self) {
        let state = self.lock();
        let left: Vec<_> = state
            .replies
            .iter()
            .filter(|reply| !reply.repeat)
            .map(|reply| reply.name)
            .collect();
        assert!(left.is_empty(), "replies never used: {left:?}");
    }

    /// The sink the cache handed over, if any.
    pub fn sink(&self) -> Option<NotificationSink> {
        self.lock().sink.clone()
    }

    /// Pushes a notification as if a server sent it.
    ///
    /// Panics if no cache was opened over this transport.
    pub fn notify(&self, notification: Notification) {
        let sink = self.sink().expect("no cache attached to the mock transport");
        sink.send(notification);
    }

    /// Returns true once the cache disposed the transport.
    pub fn is_disposed(&self) -> bool {
        self.lock().disposed
    }
}

impl Transport for MockTransport {
    fn execute(&self, request: &mut Request) -> Result<(), CacheError> {
        let mut state = self.lock();
        if let Some(error) = state.exchange_failures.pop_front() {
            return Err(error.into());
        }
        let dedicated = request.is_dedicated();
        for entry in request.entries_mut() {
            trace!("mock executing {} on {:?}", entry.command.name(), entry.target);
            state.executed.push(ExecutedCommand {
                target: entry.target.clone(),
                command: entry.command.clone(),
                view_id: entry.view_id,
                dedicated,
            });
            let position = state.replies.iter().position(|reply| reply.matches(entry));
            let reply = match position {
                Some(position) if state.replies[position].repeat => {
                    Some(state.replies[position].clone())
                }
                Some(position) => state.replies.remove(position),
                None => None,
            };
            let response = match reply {
                Some(reply) => (reply.responder)(entry).map_err(CacheError::from),
                None => Err(CacheError::from((
                    ErrorKind::ClientError,
                    "TEST",
                    format!("unexpected command: {:?}", entry.command),
                ))),
            };
            entry.response = Some(response);
        }
        Ok(())
    }

    fn distribution(&self) -> Option<Arc<dyn DistributionMap>> {
        self.lock().distribution.clone()
    }

    fn set_notification_sink(&self, sink: NotificationSink) {
        self.lock().sink = Some(sink);
    }

    fn dispose(&self) {
        self.lock().disposed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use cachebridge::ServerErrorKind;

    fn request(command: Command) -> Request {
        Request::new(command)
    }

    #[test]
    fn test_replies_are_matched_by_name() {
        let transport = MockTransport::new(vec![
            MockReply::new("COUNT", Response::Count(3)),
            MockReply::new("CLEAR", Response::Done),
        ]);
        let mut clear = request(Command::Clear);
        transport.execute(&mut clear).unwrap();
        assert_matches!(clear.entries()[0].response, Some(Ok(Response::Done)));

        let mut count = request(Command::Count);
        transport.execute(&mut count).unwrap();
        assert_matches!(count.entries()[0].response, Some(Ok(Response::Count(3))));
        transport.assert_all_replies_consumed();
    }

    #[test]
    fn test_unexpected_commands_fail() {
        let transport = MockTransport::default();
        let mut count = request(Command::Count);
        transport.execute(&mut count).unwrap();
        assert_matches!(
            &count.entries()[0].response,
            Some(Err(err)) if err.kind() == ErrorKind::ClientError
        );
        assert_eq!(transport.count("COUNT"), 1);
    }

    #[test]
    fn test_repeated_replies_stay_queued() {
        let transport =
            MockTransport::new(vec![MockReply::new("CLEAR", Response::Done).repeatedly()]);
        for _ in 0..3 {
            let mut clear = request(Command::Clear);
            transport.execute(&mut clear).unwrap();
        }
        assert_eq!(transport.count("CLEAR"), 3);
        assert!(transport.is_empty());
    }

    #[test]
    fn test_exchange_failures_come_first() {
        let transport = MockTransport::new(vec![MockReply::new("CLEAR", Response::Done)]);
        transport.fail_next_exchange(ServerError::known(ServerErrorKind::OperationFailed, None));
        let err = transport.execute(&mut request(Command::Clear)).unwrap_err();
        assert_eq!(
            err.kind(),
            ErrorKind::ServerError(ServerErrorKind::OperationFailed)
        );
        assert!(transport.executed().is_empty());
    }
}
