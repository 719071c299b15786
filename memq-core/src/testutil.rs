//! Deterministic transport and clock doubles shared by the engine tests.

use std::{
    cell::RefCell,
    fmt::Debug,
    io,
    pin::Pin,
    rc::Rc,
    task::{Context, Poll},
    time::Duration,
};

use futures::Future;
use futures_util::FutureExt;

use crate::conn::{Response, Timer, Transport};
use crate::error::Error;

/// Records every written byte; cloneable so tests keep an inspection handle
/// while the connection owns the other clone.
#[derive(Clone, Default)]
pub(crate) struct MockTransport {
    inner: Rc<RefCell<TransportState>>,
}

#[derive(Default)]
struct TransportState {
    written: Vec<u8>,
    closed: bool,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn written(&self) -> Vec<u8> {
        self.inner.borrow().written.clone()
    }

    pub fn take_written(&self) -> Vec<u8> {
        std::mem::take(&mut self.inner.borrow_mut().written)
    }

    pub fn closed(&self) -> bool {
        self.inner.borrow().closed
    }
}

impl Transport for MockTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<()> {
        let mut state = self.inner.borrow_mut();
        if state.closed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed"));
        }
        state.written.extend_from_slice(buf);
        Ok(())
    }

    fn close(&mut self) {
        self.inner.borrow_mut().closed = true;
    }
}

/// A manual clock. Holds at most one deadline; scheduling a second timer
/// while one is armed panics, which pins the one-timer-per-connection
/// invariant in every test that advances time.
#[derive(Clone, Default)]
pub(crate) struct MockClock {
    inner: Rc<RefCell<ClockState>>,
}

#[derive(Default)]
struct ClockState {
    now: Duration,
    deadline: Option<(u64, Duration)>,
    next_id: u64,
}

impl MockClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance the clock; returns true when the armed timer reached its
    /// deadline (the caller is then responsible for invoking `on_timeout`,
    /// mirroring the embedder contract).
    pub fn advance(&self, delta: Duration) -> bool {
        let mut state = self.inner.borrow_mut();
        state.now += delta;
        match state.deadline {
            Some((_, at)) if at <= state.now => {
                state.deadline = None;
                true
            }
            _ => false,
        }
    }

    pub fn armed(&self) -> bool {
        self.inner.borrow().deadline.is_some()
    }
}

impl Timer for MockClock {
    type Handle = u64;

    fn schedule(&mut self, delay: Duration) -> u64 {
        let mut state = self.inner.borrow_mut();
        assert!(
            state.deadline.is_none(),
            "a second timer was armed while one was outstanding"
        );
        state.next_id += 1;
        let id = state.next_id;
        let at = state.now + delay;
        state.deadline = Some((id, at));
        id
    }

    fn cancel(&mut self, handle: u64) {
        let mut state = self.inner.borrow_mut();
        if let Some((id, _)) = state.deadline {
            if id == handle {
                state.deadline = None;
            }
        }
    }
}

/// Poll a response once with a no-op waker.
pub(crate) fn poll_once<T>(response: &mut Response<T>) -> Poll<Result<T, Error>> {
    let waker = futures::task::noop_waker();
    let mut cx = Context::from_waker(&waker);
    Pin::new(response).poll(&mut cx)
}

/// Unwrap a response that must already have resolved.
pub(crate) fn resolved<T: Debug>(response: Response<T>) -> Result<T, Error> {
    response
        .now_or_never()
        .expect("response has not resolved yet")
}
