//! The substrate shared by both protocol engines: the transport and timer
//! seams, the per-connection FIFO of pending commands, the idle-timeout
//! state machine, and the future type returned by every command.
//!
//! The engines are sans-io. An embedder (e.g. the tokio adapter crate) owns
//! the socket and the clock, and feeds the three inbound edges of
//! [`Session`]; the engine calls back out through [`Transport`] and
//! [`Timer`]. All calls on one connection must be serialized by a single
//! logical executor; there is no internal locking.

use std::{
    collections::VecDeque,
    future::Future,
    io,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use futures::channel::oneshot;
use log::debug;

use crate::error::Error;

/// Keys longer than this are rejected before submission.
pub const MAX_KEY_LENGTH: usize = 250;

/// A byte-oriented duplex transport owned by a single connection.
///
/// Writes may be buffered; the engine never needs to observe completion of
/// an individual write. `close` must be idempotent: the engine calls it on
/// every teardown path, including teardowns triggered by the transport
/// itself reporting a lost connection.
pub trait Transport {
    /// Queue the entire buffer for transmission.
    fn write(&mut self, buf: &[u8]) -> io::Result<()>;

    /// Close the underlying channel.
    fn close(&mut self);
}

/// A monotonic one-shot timer.
///
/// The engine arms at most one timer per connection. When a scheduled timer
/// elapses, the embedder must invoke [`Session::on_timeout`] on the owning
/// connection; cancelled handles must never fire.
pub trait Timer {
    /// Token used to cancel a scheduled callback.
    type Handle;

    /// Schedule a callback `delay` from now.
    fn schedule(&mut self, delay: Duration) -> Self::Handle;

    /// Cancel a previously scheduled callback.
    fn cancel(&mut self, handle: Self::Handle);
}

/// The inbound edges of a protocol engine, fed by the embedder.
///
/// Both `TextConnection` and `BinaryConnection` implement this, which lets a
/// driver loop (socket reads, timer expiry, close notifications) stay
/// generic over the protocol in use.
pub trait Session {
    /// Feed bytes received from the transport. Consumes as many complete
    /// response units as possible; a trailing partial unit is buffered until
    /// the next call.
    ///
    /// An `Err` is a protocol violation by the server and is terminal: the
    /// connection has been torn down and every command that was pending has
    /// failed with [`Error::ConnectionDone`] carrying the same message.
    fn receive(&mut self, data: &[u8]) -> Result<(), Error>;

    /// Invoked by the embedder when the timer armed through [`Timer`] fires.
    fn on_timeout(&mut self);

    /// Invoked by the embedder when the transport is gone, with a
    /// human-readable reason.
    fn connection_lost(&mut self, reason: &str);
}

/// Connection tunables.
#[derive(Debug, Clone)]
pub struct Config {
    idle_timeout: Duration,
}

impl Config {
    /// Create a config with the given idle timeout: the longest the
    /// connection will wait for the next complete response unit while any
    /// command is outstanding.
    pub fn new(idle_timeout: Duration) -> Self {
        Self { idle_timeout }
    }

    /// The configured idle timeout.
    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

/// The future returned by every non-quiet command.
///
/// Resolves with the decoded result once the server's response unit for this
/// command has been consumed, or with an [`Error`] if the command or the
/// connection failed. Argument validation failures resolve the future
/// immediately, before any byte reaches the transport.
#[derive(Debug)]
pub struct Response<T> {
    rx: oneshot::Receiver<Result<T, Error>>,
}

impl<T> Response<T> {
    pub(crate) fn channel() -> (oneshot::Sender<Result<T, Error>>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Response { rx })
    }
}

impl<T> Future for Response<T> {
    type Output = Result<T, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(oneshot::Canceled)) => Poll::Ready(Err(Error::ConnectionDone(
                "Connection dropped without a response".into(),
            ))),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// A queued command that can be failed without being decoded.
pub(crate) trait Pending {
    fn fail(self, err: Error);
}

/// FIFO of in-flight commands plus the timeout and lifecycle state machine.
///
/// Invariants:
/// - a request is written to the transport before its record joins the
///   queue, so a response can never race its own enqueue;
/// - the timer is armed iff the queue is non-empty and the connection is
///   open, and is re-armed from *now* each time a command completes;
/// - once closed, the queue is empty and stays empty.
pub(crate) struct Pipeline<T: Transport, S: Timer, P: Pending> {
    transport: T,
    timer: S,
    idle_timeout: Duration,
    armed: Option<S::Handle>,
    queue: VecDeque<P>,
    open: bool,
}

impl<T: Transport, S: Timer, P: Pending> Pipeline<T, S, P> {
    pub fn new(transport: T, timer: S, config: Config) -> Self {
        Self {
            transport,
            timer,
            idle_timeout: config.idle_timeout,
            armed: None,
            queue: VecDeque::new(),
            open: true,
        }
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Write a request and queue its pending record. Failures (already
    /// closed, write error) fail the record instead of queueing it; a write
    /// error additionally tears the connection down.
    pub fn submit(&mut self, request: &[u8], pending: P) {
        if !self.open {
            pending.fail(Error::Disconnected);
            return;
        }
        if let Err(err) = self.transport.write(request) {
            let cause = Error::ConnectionDone(err.to_string());
            pending.fail(cause.clone());
            self.teardown(cause);
            return;
        }
        self.queue.push_back(pending);
        if self.armed.is_none() {
            self.armed = Some(self.timer.schedule(self.idle_timeout));
        }
    }

    /// Write a request that expects no response: no queue slot, no timer.
    pub fn submit_quiet(&mut self, request: &[u8]) -> Result<(), Error> {
        if !self.open {
            return Err(Error::Disconnected);
        }
        if let Err(err) = self.transport.write(request) {
            let cause = Error::ConnectionDone(err.to_string());
            self.teardown(cause.clone());
            return Err(cause);
        }
        Ok(())
    }

    /// The command the parser is currently decoding the response for.
    pub fn head_mut(&mut self) -> Option<&mut P> {
        self.queue.front_mut()
    }

    /// Dequeue the head command for resolution. Completing a response unit
    /// is the only thing that feeds the idle timeout: the timer restarts
    /// from now, or disarms when nothing is left in flight.
    pub fn complete(&mut self) -> Option<P> {
        let pending = self.queue.pop_front()?;
        if let Some(handle) = self.armed.take() {
            self.timer.cancel(handle);
        }
        if !self.queue.is_empty() {
            self.armed = Some(self.timer.schedule(self.idle_timeout));
        }
        Some(pending)
    }

    pub fn on_timeout(&mut self) {
        // The handle already fired; dropping it here keeps teardown from
        // cancelling a stale handle.
        self.armed = None;
        self.teardown(Error::Timeout);
    }

    /// Close the connection: disarm the timer, fail everything in flight
    /// with `cause`, and close the transport. Idempotent.
    pub fn teardown(&mut self, cause: Error) {
        if !self.open {
            return;
        }
        self.open = false;
        if let Some(handle) = self.armed.take() {
            self.timer.cancel(handle);
        }
        if !self.queue.is_empty() {
            debug!(
                "failing {} outstanding command(s): {}",
                self.queue.len(),
                cause
            );
        }
        for pending in self.queue.drain(..) {
            pending.fail(cause.clone());
        }
        self.transport.close();
    }
}

/// Check a cache key against the protocol rules shared by both engines:
/// non-empty, at most [`MAX_KEY_LENGTH`] bytes, and free of whitespace and
/// control bytes.
pub(crate) fn verify_key(key: &[u8]) -> Result<(), Error> {
    if key.is_empty() {
        return Err(Error::InvalidArgument("Key cannot be empty".into()));
    }
    if key.len() > MAX_KEY_LENGTH {
        return Err(Error::InvalidArgument("Key too long".into()));
    }
    if key
        .iter()
        .any(|b| b.is_ascii_whitespace() || b.is_ascii_control())
    {
        return Err(Error::InvalidArgument(
            "Key contains whitespace or control characters".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{verify_key, Config, Response};
    use crate::error::Error;
    use crate::testutil::poll_once;
    use std::task::Poll;
    use std::time::Duration;

    #[test]
    fn test_default_idle_timeout() {
        assert_eq!(Duration::from_secs(60), Config::default().idle_timeout());
    }

    #[test]
    fn test_verify_key() {
        assert!(verify_key(b"foo").is_ok());
        assert!(verify_key(&[b'a'; 250]).is_ok());
        assert_eq!(
            Err(Error::InvalidArgument("Key too long".into())),
            verify_key(&[b'a'; 251])
        );
        assert_eq!(
            Err(Error::InvalidArgument("Key cannot be empty".into())),
            verify_key(b"")
        );
        assert!(verify_key(b"foo bar").is_err());
        assert!(verify_key(b"foo\r\n").is_err());
        assert!(verify_key(b"foo\0").is_err());
    }

    #[test]
    fn test_response_resolves_once_sent() {
        let (tx, mut response) = Response::channel();
        assert!(matches!(poll_once(&mut response), Poll::Pending));
        tx.send(Ok(42_u64)).unwrap();
        assert_eq!(Poll::Ready(Ok(42)), poll_once(&mut response));
    }

    #[test]
    fn test_response_dropped_sender() {
        let (tx, mut response) = Response::<u64>::channel();
        drop(tx);
        match poll_once(&mut response) {
            Poll::Ready(Err(Error::ConnectionDone(_))) => {}
            other => panic!("unexpected poll result: {:?}", other),
        }
    }
}
