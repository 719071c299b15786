//! The memcached binary protocol engine.
//!
//! Every request and response is a 24-byte header followed by extras, key,
//! and value. Commands pipeline over the shared FIFO exactly like the text
//! engine; the richer part of this protocol is its "quiet" variants, which
//! get no queue slot at all because the server only ever answers them on
//! failure.

mod packet;

pub use packet::{CounterExtras, FlushExtras, SetExtras};
pub(crate) use packet::{Header, Packet, HEADER_LEN};

use std::collections::HashMap;
use std::convert::TryInto;

use bytes::{Buf, BytesMut};
use futures::channel::oneshot;
use log::{trace, warn};

use crate::conn::{Config, Pending, Pipeline, Response, Session, Timer, Transport};
use crate::error::Error;

const MAGIC_REQUEST: u8 = 0x80;
const MAGIC_RESPONSE: u8 = 0x81;

const GET_OPCODE: u8 = 0x00;
const SET_OPCODE: u8 = 0x01;
const ADD_OPCODE: u8 = 0x02;
const REPLACE_OPCODE: u8 = 0x03;
const DELETE_OPCODE: u8 = 0x04;
const INCREMENT_OPCODE: u8 = 0x05;
const DECREMENT_OPCODE: u8 = 0x06;
const QUIT_OPCODE: u8 = 0x07;
const FLUSH_OPCODE: u8 = 0x08;
const NOOP_OPCODE: u8 = 0x09;
const APPEND_OPCODE: u8 = 0x0e;
const PREPEND_OPCODE: u8 = 0x0f;
const STAT_OPCODE: u8 = 0x10;

// Quiet variants add 0x10 to the base opcode, except append/prepend which
// have dedicated values.
const QUIET_OFFSET: u8 = 0x10;
const APPENDQ_OPCODE: u8 = 0x19;
const PREPENDQ_OPCODE: u8 = 0x1a;

// Requests normally carry opaque 0. Quiet requests are tagged with this
// marker so an error response to one of them can never be mistaken for the
// head command's response.
const QUIET_OPAQUE: u32 = 1;

type Completion<T> = oneshot::Sender<Result<T, Error>>;

/// A command awaiting its response frame.
enum BinaryCommand {
    Get(Completion<(u32, Vec<u8>)>),
    Store(Completion<u64>),
    Counter(Completion<(u64, u64)>),
    Simple(Completion<bool>),
    Stats {
        entries: HashMap<Vec<u8>, Vec<u8>>,
        tx: Completion<HashMap<Vec<u8>, Vec<u8>>>,
    },
}

impl Pending for BinaryCommand {
    fn fail(self, err: Error) {
        match self {
            BinaryCommand::Get(tx) => drop(tx.send(Err(err))),
            BinaryCommand::Store(tx) => drop(tx.send(Err(err))),
            BinaryCommand::Counter(tx) => drop(tx.send(Err(err))),
            BinaryCommand::Simple(tx) => drop(tx.send(Err(err))),
            BinaryCommand::Stats { tx, .. } => drop(tx.send(Err(err))),
        }
    }
}

/// Frame reassembly state: waiting for a header, or for the body the last
/// header announced.
#[derive(Clone, Copy)]
enum Frame {
    NeedHeader,
    NeedBody(Header),
}

/// A pipelined client connection speaking the memcached binary protocol.
pub struct BinaryConnection<T: Transport, S: Timer> {
    pipeline: Pipeline<T, S, BinaryCommand>,
    buffer: BytesMut,
    frame: Frame,
}

impl<T: Transport, S: Timer> BinaryConnection<T, S> {
    /// Create a connection over an established transport.
    pub fn new(transport: T, timer: S, config: Config) -> Self {
        Self {
            pipeline: Pipeline::new(transport, timer, config),
            buffer: BytesMut::new(),
            frame: Frame::NeedHeader,
        }
    }

    /// Whether the connection is still usable.
    pub fn is_connected(&self) -> bool {
        self.pipeline.is_open()
    }

    /// Fetch a key, resolving its flags and value. A miss is reported by
    /// the server as a non-zero status and therefore fails the future with
    /// [`Error::Server`].
    pub fn get<K: AsRef<[u8]>>(&mut self, key: K) -> Response<(u32, Vec<u8>)> {
        let (tx, response) = Response::channel();
        self.submit(Packet::get(key.as_ref()), BinaryCommand::Get(tx));
        response
    }

    /// Store a value unconditionally, resolving the new CAS identifier.
    pub fn set<K: AsRef<[u8]>, V: AsRef<[u8]>>(
        &mut self,
        key: K,
        value: V,
        flags: u32,
        expire: u32,
    ) -> Response<u64> {
        let (tx, response) = Response::channel();
        let packet = Packet::set(key.as_ref(), value.as_ref(), SetExtras::new(flags, expire));
        self.submit(packet, BinaryCommand::Store(tx));
        response
    }

    /// Quiet `set`: no response on success.
    pub fn setq<K: AsRef<[u8]>, V: AsRef<[u8]>>(
        &mut self,
        key: K,
        value: V,
        flags: u32,
        expire: u32,
    ) -> Result<(), Error> {
        let packet = Packet::set(key.as_ref(), value.as_ref(), SetExtras::new(flags, expire));
        self.submit_quiet(packet)
    }

    /// Store a value only if the key is not already set.
    pub fn add<K: AsRef<[u8]>, V: AsRef<[u8]>>(
        &mut self,
        key: K,
        value: V,
        flags: u32,
        expire: u32,
    ) -> Response<u64> {
        let (tx, response) = Response::channel();
        let packet = Packet::add(key.as_ref(), value.as_ref(), SetExtras::new(flags, expire));
        self.submit(packet, BinaryCommand::Store(tx));
        response
    }

    /// Quiet `add`.
    pub fn addq<K: AsRef<[u8]>, V: AsRef<[u8]>>(
        &mut self,
        key: K,
        value: V,
        flags: u32,
        expire: u32,
    ) -> Result<(), Error> {
        let packet = Packet::add(key.as_ref(), value.as_ref(), SetExtras::new(flags, expire));
        self.submit_quiet(packet)
    }

    /// Store a value only if the key is already set.
    pub fn replace<K: AsRef<[u8]>, V: AsRef<[u8]>>(
        &mut self,
        key: K,
        value: V,
        flags: u32,
        expire: u32,
    ) -> Response<u64> {
        let (tx, response) = Response::channel();
        let packet = Packet::replace(key.as_ref(), value.as_ref(), SetExtras::new(flags, expire));
        self.submit(packet, BinaryCommand::Store(tx));
        response
    }

    /// Quiet `replace`.
    pub fn replaceq<K: AsRef<[u8]>, V: AsRef<[u8]>>(
        &mut self,
        key: K,
        value: V,
        flags: u32,
        expire: u32,
    ) -> Result<(), Error> {
        let packet = Packet::replace(key.as_ref(), value.as_ref(), SetExtras::new(flags, expire));
        self.submit_quiet(packet)
    }

    /// Delete a key.
    pub fn delete<K: AsRef<[u8]>>(&mut self, key: K) -> Response<bool> {
        let (tx, response) = Response::channel();
        self.submit(Packet::delete(key.as_ref()), BinaryCommand::Simple(tx));
        response
    }

    /// Quiet `delete`.
    pub fn deleteq<K: AsRef<[u8]>>(&mut self, key: K) -> Result<(), Error> {
        self.submit_quiet(Packet::delete(key.as_ref()))
    }

    /// Increment a counter, resolving the new value and its CAS identifier.
    /// When the key does not exist it is created with `initial`.
    pub fn increment<K: AsRef<[u8]>>(
        &mut self,
        key: K,
        delta: u64,
        initial: u64,
        expire: u32,
    ) -> Response<(u64, u64)> {
        let (tx, response) = Response::channel();
        let packet = Packet::increment(key.as_ref(), CounterExtras::new(delta, initial, expire));
        self.submit(packet, BinaryCommand::Counter(tx));
        response
    }

    /// Quiet `increment`.
    pub fn incrementq<K: AsRef<[u8]>>(
        &mut self,
        key: K,
        delta: u64,
        initial: u64,
        expire: u32,
    ) -> Result<(), Error> {
        let packet = Packet::increment(key.as_ref(), CounterExtras::new(delta, initial, expire));
        self.submit_quiet(packet)
    }

    /// Decrement a counter, resolving the new value and its CAS identifier.
    pub fn decrement<K: AsRef<[u8]>>(
        &mut self,
        key: K,
        delta: u64,
        initial: u64,
        expire: u32,
    ) -> Response<(u64, u64)> {
        let (tx, response) = Response::channel();
        let packet = Packet::decrement(key.as_ref(), CounterExtras::new(delta, initial, expire));
        self.submit(packet, BinaryCommand::Counter(tx));
        response
    }

    /// Quiet `decrement`.
    pub fn decrementq<K: AsRef<[u8]>>(
        &mut self,
        key: K,
        delta: u64,
        initial: u64,
        expire: u32,
    ) -> Result<(), Error> {
        let packet = Packet::decrement(key.as_ref(), CounterExtras::new(delta, initial, expire));
        self.submit_quiet(packet)
    }

    /// Expire every key, immediately or `expire` seconds from now.
    pub fn flush(&mut self, expire: u32) -> Response<bool> {
        let (tx, response) = Response::channel();
        self.submit(
            Packet::flush(FlushExtras::new(expire)),
            BinaryCommand::Simple(tx),
        );
        response
    }

    /// Quiet `flush`.
    pub fn flushq(&mut self, expire: u32) -> Result<(), Error> {
        self.submit_quiet(Packet::flush(FlushExtras::new(expire)))
    }

    /// A no-op round trip, useful as a keep-alive probe.
    pub fn noop(&mut self) -> Response<bool> {
        let (tx, response) = Response::channel();
        self.submit(Packet::noop(), BinaryCommand::Simple(tx));
        response
    }

    /// Ask the server to close the connection after responding.
    pub fn quit(&mut self) -> Response<bool> {
        let (tx, response) = Response::channel();
        self.submit(Packet::quit(), BinaryCommand::Simple(tx));
        response
    }

    /// Quiet `quit`: the server closes without responding at all.
    pub fn quitq(&mut self) -> Result<(), Error> {
        self.submit_quiet(Packet::quit())
    }

    /// Append to an existing value.
    pub fn append<K: AsRef<[u8]>, V: AsRef<[u8]>>(&mut self, key: K, value: V) -> Response<bool> {
        let (tx, response) = Response::channel();
        self.submit(
            Packet::append(key.as_ref(), value.as_ref()),
            BinaryCommand::Simple(tx),
        );
        response
    }

    /// Quiet `append`.
    pub fn appendq<K: AsRef<[u8]>, V: AsRef<[u8]>>(&mut self, key: K, value: V) -> Result<(), Error> {
        self.submit_quiet(Packet::append(key.as_ref(), value.as_ref()))
    }

    /// Prepend to an existing value.
    pub fn prepend<K: AsRef<[u8]>, V: AsRef<[u8]>>(&mut self, key: K, value: V) -> Response<bool> {
        let (tx, response) = Response::channel();
        self.submit(
            Packet::prepend(key.as_ref(), value.as_ref()),
            BinaryCommand::Simple(tx),
        );
        response
    }

    /// Quiet `prepend`.
    pub fn prependq<K: AsRef<[u8]>, V: AsRef<[u8]>>(&mut self, key: K, value: V) -> Result<(), Error> {
        self.submit_quiet(Packet::prepend(key.as_ref(), value.as_ref()))
    }

    /// Query server statistics. An empty key asks for the full dump; the
    /// server streams one frame per entry and terminates the sequence with
    /// an empty-key frame.
    pub fn stats(&mut self, key: &[u8]) -> Response<HashMap<Vec<u8>, Vec<u8>>> {
        let (tx, response) = Response::channel();
        self.submit(
            Packet::stat(key),
            BinaryCommand::Stats {
                entries: HashMap::new(),
                tx,
            },
        );
        response
    }

    fn submit(&mut self, packet: Result<Packet, Error>, cmd: BinaryCommand) {
        match packet {
            Ok(packet) => {
                let request: Vec<u8> = packet.into();
                self.pipeline.submit(&request, cmd);
            }
            Err(err) => cmd.fail(err),
        }
    }

    fn submit_quiet(&mut self, packet: Result<Packet, Error>) -> Result<(), Error> {
        let request: Vec<u8> = packet?.quiet().into();
        self.pipeline.submit_quiet(&request)
    }

    fn handle_frame(&mut self, header: &Header, body: &[u8]) -> Result<(), Error> {
        let (extras, key, value) = header.split_body(body)?;
        trace!(
            "<-- opcode {:#04x} status {} ({} byte body)",
            header.opcode,
            header.status,
            body.len()
        );

        // Quiet commands respond only on failure, and their responses are
        // not bound to any queue slot; discard them.
        if header.opaque == QUIET_OPAQUE {
            warn!(
                "dropping response to quiet command (opcode {:#04x}, status {})",
                header.opcode, header.status
            );
            return Ok(());
        }

        if header.status != 0 {
            let cmd = self.take_head()?;
            cmd.fail(Error::Server(String::from_utf8_lossy(value).into_owned()));
            return Ok(());
        }

        // A stats response spans many frames; only the empty-key terminator
        // dequeues the command.
        if let Some(BinaryCommand::Stats { entries, .. }) = self.pipeline.head_mut() {
            if !key.is_empty() {
                entries.insert(key.to_vec(), value.to_vec());
                return Ok(());
            }
        }

        match self.take_head()? {
            BinaryCommand::Get(tx) => {
                let flags = if extras.len() >= 4 {
                    u32::from_be_bytes(extras[..4].try_into().unwrap())
                } else {
                    0
                };
                drop(tx.send(Ok((flags, value.to_vec()))));
            }
            BinaryCommand::Store(tx) => drop(tx.send(Ok(header.cas))),
            BinaryCommand::Counter(tx) => match value.try_into() {
                Ok(raw) => drop(tx.send(Ok((u64::from_be_bytes(raw), header.cas)))),
                Err(_) => {
                    let err = Error::Parse(format!(
                        "Invalid counter response of {} bytes",
                        value.len()
                    ));
                    drop(tx.send(Err(Error::ConnectionDone(err.to_string()))));
                    return Err(err);
                }
            },
            BinaryCommand::Simple(tx) => drop(tx.send(Ok(true))),
            BinaryCommand::Stats { entries, tx } => drop(tx.send(Ok(entries))),
        }
        Ok(())
    }

    fn take_head(&mut self) -> Result<BinaryCommand, Error> {
        self.pipeline
            .complete()
            .ok_or_else(|| Error::Parse("Response frame with no outstanding command".into()))
    }
}

impl<T: Transport, S: Timer> Session for BinaryConnection<T, S> {
    fn receive(&mut self, data: &[u8]) -> Result<(), Error> {
        if !self.pipeline.is_open() {
            return Ok(());
        }
        self.buffer.extend_from_slice(data);
        loop {
            match self.frame {
                Frame::NeedHeader => {
                    if self.buffer.len() < HEADER_LEN {
                        return Ok(());
                    }
                    let header = match Header::parse(&self.buffer[..HEADER_LEN]) {
                        Ok(header) => header,
                        Err(err) => {
                            self.pipeline.teardown(Error::ConnectionDone(err.to_string()));
                            return Err(err);
                        }
                    };
                    self.buffer.advance(HEADER_LEN);
                    self.frame = Frame::NeedBody(header);
                }
                Frame::NeedBody(header) => {
                    if self.buffer.len() < header.body_len as usize {
                        return Ok(());
                    }
                    let body = self.buffer.split_to(header.body_len as usize);
                    self.frame = Frame::NeedHeader;
                    if let Err(err) = self.handle_frame(&header, &body) {
                        self.pipeline.teardown(Error::ConnectionDone(err.to_string()));
                        return Err(err);
                    }
                }
            }
        }
    }

    fn on_timeout(&mut self) {
        self.pipeline.on_timeout();
    }

    fn connection_lost(&mut self, reason: &str) {
        self.pipeline.teardown(Error::ConnectionDone(reason.into()));
    }
}
