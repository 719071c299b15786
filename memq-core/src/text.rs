//! The memcached ASCII protocol engine.
//!
//! Commands are pipelined: every submission writes its request immediately
//! and appends a pending record to the connection's FIFO, and the parser
//! binds each inbound response unit to the record at the front of the
//! queue. The parser alternates between a line-oriented mode and a raw mode
//! that swallows exactly the announced number of value bytes, so value
//! payloads are never interpreted.

use std::collections::HashMap;

use bytes::BytesMut;
use futures::channel::oneshot;
use log::trace;

use crate::conn::{verify_key, Config, Pending, Pipeline, Response, Session, Timer, Transport};
use crate::error::Error;

type Completion<T> = oneshot::Sender<Result<T, Error>>;

/// A value retrieved with [`TextConnection::get`] or
/// [`TextConnection::get_multi`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Value {
    /// The client-supplied flags stored alongside the value.
    pub flags: u32,
    /// The stored payload.
    pub data: Vec<u8>,
}

/// A value retrieved with [`TextConnection::gets`] or
/// [`TextConnection::gets_multi`], carrying the CAS identifier.
///
/// The identifier is an opaque byte token: the server only ever expects it
/// echoed back verbatim in [`TextConnection::check_and_set`], so it is not
/// parsed as an integer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CasValue {
    /// The client-supplied flags stored alongside the value.
    pub flags: u32,
    /// The CAS identifier to echo into `check_and_set`.
    pub cas: Vec<u8>,
    /// The stored payload.
    pub data: Vec<u8>,
}

/// Where a finished retrieval delivers its result. A single queue record
/// covers all four retrieval shapes; the sink decides how the collected
/// values are folded at `END`.
enum GetSink {
    Single(Completion<Option<Value>>),
    SingleCas(Completion<Option<CasValue>>),
    Multi(Completion<HashMap<Vec<u8>, Option<Value>>>),
    MultiCas(Completion<HashMap<Vec<u8>, Option<CasValue>>>),
}

/// One `VALUE` block as received off the wire.
struct Retrieval {
    flags: u32,
    cas: Vec<u8>,
    data: Vec<u8>,
}

/// A command awaiting its response, tagged with everything the parser needs
/// to decode that response.
enum TextCommand {
    Get {
        keys: Vec<Vec<u8>>,
        collected: HashMap<Vec<u8>, Retrieval>,
        sink: GetSink,
    },
    Store(Completion<bool>),
    Delete(Completion<bool>),
    Counter(Completion<u64>),
    Stats {
        entries: HashMap<Vec<u8>, Vec<u8>>,
        tx: Completion<HashMap<Vec<u8>, Vec<u8>>>,
    },
    Version(Completion<Vec<u8>>),
    Flush(Completion<bool>),
    Verbatim(Completion<()>),
}

impl Pending for TextCommand {
    fn fail(self, err: Error) {
        match self {
            TextCommand::Get { sink, .. } => match sink {
                GetSink::Single(tx) => drop(tx.send(Err(err))),
                GetSink::SingleCas(tx) => drop(tx.send(Err(err))),
                GetSink::Multi(tx) => drop(tx.send(Err(err))),
                GetSink::MultiCas(tx) => drop(tx.send(Err(err))),
            },
            TextCommand::Store(tx) | TextCommand::Delete(tx) | TextCommand::Flush(tx) => {
                drop(tx.send(Err(err)))
            }
            TextCommand::Counter(tx) => drop(tx.send(Err(err))),
            TextCommand::Stats { tx, .. } => drop(tx.send(Err(err))),
            TextCommand::Version(tx) => drop(tx.send(Err(err))),
            TextCommand::Verbatim(tx) => drop(tx.send(Err(err))),
        }
    }
}

/// Parser state: consuming `\r\n`-terminated lines, or swallowing the raw
/// body announced by the last `VALUE` line (including its trailing CRLF).
enum Mode {
    Line,
    Raw {
        key: Vec<u8>,
        flags: u32,
        cas: Vec<u8>,
        remaining: usize,
        partial: Vec<u8>,
    },
}

/// A pipelined client connection speaking the memcached text protocol.
///
/// The connection is sans-io: it owns a [`Transport`] for outbound bytes
/// and a [`Timer`] for its idle timeout, and the embedder feeds inbound
/// events through the [`Session`] trait.
pub struct TextConnection<T: Transport, S: Timer> {
    pipeline: Pipeline<T, S, TextCommand>,
    buffer: BytesMut,
    mode: Mode,
}

impl<T: Transport, S: Timer> TextConnection<T, S> {
    /// Create a connection over an established transport.
    pub fn new(transport: T, timer: S, config: Config) -> Self {
        Self {
            pipeline: Pipeline::new(transport, timer, config),
            buffer: BytesMut::new(),
            mode: Mode::Line,
        }
    }

    /// Whether the connection is still usable. Once this returns false,
    /// every submission fails with [`Error::Disconnected`].
    pub fn is_connected(&self) -> bool {
        self.pipeline.is_open()
    }

    /// Fetch a single key. Resolves `None` when the key is not set.
    pub fn get<K: AsRef<[u8]>>(&mut self, key: K) -> Response<Option<Value>> {
        let (tx, response) = Response::channel();
        self.retrieve(&[key.as_ref().to_vec()], false, GetSink::Single(tx));
        response
    }

    /// Fetch a single key along with its CAS identifier.
    pub fn gets<K: AsRef<[u8]>>(&mut self, key: K) -> Response<Option<CasValue>> {
        let (tx, response) = Response::channel();
        self.retrieve(&[key.as_ref().to_vec()], true, GetSink::SingleCas(tx));
        response
    }

    /// Fetch several keys in one round trip. The resulting map has an entry
    /// for every requested key; keys the server did not return are `None`.
    pub fn get_multi<K: AsRef<[u8]>>(
        &mut self,
        keys: &[K],
    ) -> Response<HashMap<Vec<u8>, Option<Value>>> {
        let (tx, response) = Response::channel();
        let keys: Vec<Vec<u8>> = keys.iter().map(|k| k.as_ref().to_vec()).collect();
        self.retrieve(&keys, false, GetSink::Multi(tx));
        response
    }

    /// Fetch several keys with their CAS identifiers in one round trip.
    pub fn gets_multi<K: AsRef<[u8]>>(
        &mut self,
        keys: &[K],
    ) -> Response<HashMap<Vec<u8>, Option<CasValue>>> {
        let (tx, response) = Response::channel();
        let keys: Vec<Vec<u8>> = keys.iter().map(|k| k.as_ref().to_vec()).collect();
        self.retrieve(&keys, true, GetSink::MultiCas(tx));
        response
    }

    /// Store a value unconditionally. Resolves true on `STORED`.
    pub fn set<K: AsRef<[u8]>, V: AsRef<[u8]>>(
        &mut self,
        key: K,
        value: V,
        flags: u32,
        expire: u32,
    ) -> Response<bool> {
        self.store(b"set", key.as_ref(), value.as_ref(), flags, expire, None)
    }

    /// Store a value only if the key is not already set.
    pub fn add<K: AsRef<[u8]>, V: AsRef<[u8]>>(
        &mut self,
        key: K,
        value: V,
        flags: u32,
        expire: u32,
    ) -> Response<bool> {
        self.store(b"add", key.as_ref(), value.as_ref(), flags, expire, None)
    }

    /// Store a value only if the key is already set.
    pub fn replace<K: AsRef<[u8]>, V: AsRef<[u8]>>(
        &mut self,
        key: K,
        value: V,
        flags: u32,
        expire: u32,
    ) -> Response<bool> {
        self.store(b"replace", key.as_ref(), value.as_ref(), flags, expire, None)
    }

    /// Append to an existing value.
    pub fn append<K: AsRef<[u8]>, V: AsRef<[u8]>>(
        &mut self,
        key: K,
        value: V,
        flags: u32,
        expire: u32,
    ) -> Response<bool> {
        self.store(b"append", key.as_ref(), value.as_ref(), flags, expire, None)
    }

    /// Prepend to an existing value.
    pub fn prepend<K: AsRef<[u8]>, V: AsRef<[u8]>>(
        &mut self,
        key: K,
        value: V,
        flags: u32,
        expire: u32,
    ) -> Response<bool> {
        self.store(b"prepend", key.as_ref(), value.as_ref(), flags, expire, None)
    }

    /// Store a value only if it has not changed since the CAS identifier was
    /// handed out by [`TextConnection::gets`]. Resolves true on `STORED`,
    /// false when the server refuses (`EXISTS`, or `NOT FOUND` when the key
    /// has meanwhile disappeared).
    pub fn check_and_set<K: AsRef<[u8]>, V: AsRef<[u8]>, C: AsRef<[u8]>>(
        &mut self,
        key: K,
        value: V,
        cas: C,
        flags: u32,
        expire: u32,
    ) -> Response<bool> {
        self.store(
            b"cas",
            key.as_ref(),
            value.as_ref(),
            flags,
            expire,
            Some(cas.as_ref()),
        )
    }

    /// Delete a key. Resolves true on `DELETED`, false on `NOT FOUND`.
    pub fn delete<K: AsRef<[u8]>>(&mut self, key: K) -> Response<bool> {
        let (tx, response) = Response::channel();
        let cmd = TextCommand::Delete(tx);
        match keyed_request(b"delete", key.as_ref()) {
            Ok(request) => self.pipeline.submit(&request, cmd),
            Err(err) => cmd.fail(err),
        }
        response
    }

    /// Increment a numeric value by `delta`, resolving the new value.
    pub fn increment<K: AsRef<[u8]>>(&mut self, key: K, delta: u64) -> Response<u64> {
        self.counter(b"incr", key.as_ref(), delta)
    }

    /// Decrement a numeric value by `delta`, resolving the new value.
    pub fn decrement<K: AsRef<[u8]>>(&mut self, key: K, delta: u64) -> Response<u64> {
        self.counter(b"decr", key.as_ref(), delta)
    }

    /// Query server statistics, optionally scoped to a named group.
    pub fn stats(&mut self, arg: Option<&[u8]>) -> Response<HashMap<Vec<u8>, Vec<u8>>> {
        let (tx, response) = Response::channel();
        let mut request = b"stats".to_vec();
        if let Some(arg) = arg {
            request.push(b' ');
            request.extend_from_slice(arg);
        }
        request.extend_from_slice(b"\r\n");
        self.pipeline.submit(
            &request,
            TextCommand::Stats {
                entries: HashMap::new(),
                tx,
            },
        );
        response
    }

    /// Query the server version string.
    pub fn version(&mut self) -> Response<Vec<u8>> {
        let (tx, response) = Response::channel();
        self.pipeline
            .submit(b"version\r\n", TextCommand::Version(tx));
        response
    }

    /// Expire every key on the server. Resolves true on `OK`.
    pub fn flush_all(&mut self) -> Response<bool> {
        let (tx, response) = Response::channel();
        self.pipeline
            .submit(b"flush_all\r\n", TextCommand::Flush(tx));
        response
    }

    /// Write pre-formatted bytes, bypassing argument validation and request
    /// formatting. The only response the server can legally give is
    /// `ERROR`, which fails the returned future with
    /// [`Error::NoSuchCommand`]; anything else is a protocol violation and
    /// tears the connection down.
    pub fn send_unchecked(&mut self, request: &[u8]) -> Response<()> {
        let (tx, response) = Response::channel();
        self.pipeline.submit(request, TextCommand::Verbatim(tx));
        response
    }

    fn retrieve(&mut self, keys: &[Vec<u8>], with_cas: bool, sink: GetSink) {
        let verb: &[u8] = if with_cas { b"gets" } else { b"get" };
        let cmd = TextCommand::Get {
            keys: keys.to_vec(),
            collected: HashMap::new(),
            sink,
        };
        match retrieval_request(verb, keys) {
            Ok(request) => self.pipeline.submit(&request, cmd),
            Err(err) => cmd.fail(err),
        }
    }

    fn store(
        &mut self,
        verb: &[u8],
        key: &[u8],
        value: &[u8],
        flags: u32,
        expire: u32,
        cas: Option<&[u8]>,
    ) -> Response<bool> {
        let (tx, response) = Response::channel();
        let cmd = TextCommand::Store(tx);
        match storage_request(verb, key, value, flags, expire, cas) {
            Ok(request) => self.pipeline.submit(&request, cmd),
            Err(err) => cmd.fail(err),
        }
        response
    }

    fn counter(&mut self, verb: &[u8], key: &[u8], delta: u64) -> Response<u64> {
        let (tx, response) = Response::channel();
        let cmd = TextCommand::Counter(tx);
        let request = verify_key(key).map(|()| {
            let mut buf = Vec::with_capacity(verb.len() + key.len() + 24);
            buf.extend_from_slice(verb);
            buf.push(b' ');
            buf.extend_from_slice(key);
            push_int(&mut buf, delta);
            buf.extend_from_slice(b"\r\n");
            buf
        });
        match request {
            Ok(request) => self.pipeline.submit(&request, cmd),
            Err(err) => cmd.fail(err),
        }
        response
    }

    fn consume_line(&mut self) -> Result<bool, Error> {
        let idx = match self.buffer.windows(2).position(|w| w == b"\r\n") {
            Some(idx) => idx,
            None => return Ok(false),
        };
        let line = self.buffer.split_to(idx + 2);
        self.dispatch_line(&line[..idx])?;
        Ok(true)
    }

    fn consume_raw(&mut self) -> Result<bool, Error> {
        if self.buffer.is_empty() {
            return Ok(false);
        }
        let done = match &mut self.mode {
            Mode::Raw {
                remaining, partial, ..
            } => {
                let take = (*remaining).min(self.buffer.len());
                let chunk = self.buffer.split_to(take);
                partial.extend_from_slice(&chunk);
                *remaining -= take;
                *remaining == 0
            }
            Mode::Line => return Ok(false),
        };
        if done {
            self.finish_raw()?;
        }
        Ok(true)
    }

    fn dispatch_line(&mut self, line: &[u8]) -> Result<(), Error> {
        trace!("<-- {}", String::from_utf8_lossy(line));
        match line {
            b"STORED" => self.resolve_store(true, "STORED"),
            b"NOT STORED" => self.resolve_store(false, "NOT STORED"),
            b"EXISTS" => self.resolve_store(false, "EXISTS"),
            b"DELETED" => self.resolve_delete(),
            b"NOT FOUND" => self.resolve_not_found(),
            b"OK" => self.resolve_flush(),
            b"END" => self.resolve_end(),
            b"ERROR" => self.resolve_failure(Error::NoSuchCommand, "ERROR"),
            _ => {
                let (token, rest) = split_token(line);
                match token {
                    b"VALUE" => self.begin_value(rest),
                    b"STAT" => self.append_stat(rest),
                    b"VERSION" => self.resolve_version(rest),
                    b"CLIENT_ERROR" => {
                        self.resolve_failure(Error::Client(lossy(rest)), "CLIENT_ERROR")
                    }
                    b"SERVER_ERROR" => {
                        self.resolve_failure(Error::Server(lossy(rest)), "SERVER_ERROR")
                    }
                    _ => self.resolve_counter(line),
                }
            }
        }
    }

    fn take_head(&mut self, token: &str) -> Result<TextCommand, Error> {
        self.pipeline.complete().ok_or_else(|| {
            Error::Parse(format!(
                "Unexpected {} response with no outstanding command",
                token
            ))
        })
    }

    fn resolve_store(&mut self, stored: bool, token: &str) -> Result<(), Error> {
        match self.take_head(token)? {
            TextCommand::Store(tx) => {
                drop(tx.send(Ok(stored)));
                Ok(())
            }
            other => Err(mismatched(other, token)),
        }
    }

    fn resolve_delete(&mut self) -> Result<(), Error> {
        match self.take_head("DELETED")? {
            TextCommand::Delete(tx) => {
                drop(tx.send(Ok(true)));
                Ok(())
            }
            other => Err(mismatched(other, "DELETED")),
        }
    }

    // NOT FOUND terminates a delete of a missing key, or a cas whose key
    // disappeared; both read as "not done".
    fn resolve_not_found(&mut self) -> Result<(), Error> {
        match self.take_head("NOT FOUND")? {
            TextCommand::Delete(tx) | TextCommand::Store(tx) => {
                drop(tx.send(Ok(false)));
                Ok(())
            }
            other => Err(mismatched(other, "NOT FOUND")),
        }
    }

    fn resolve_flush(&mut self) -> Result<(), Error> {
        match self.take_head("OK")? {
            TextCommand::Flush(tx) => {
                drop(tx.send(Ok(true)));
                Ok(())
            }
            other => Err(mismatched(other, "OK")),
        }
    }

    fn resolve_end(&mut self) -> Result<(), Error> {
        match self.take_head("END")? {
            TextCommand::Get {
                keys,
                collected,
                sink,
            } => {
                finish_get(keys, collected, sink);
                Ok(())
            }
            TextCommand::Stats { entries, tx } => {
                drop(tx.send(Ok(entries)));
                Ok(())
            }
            other => Err(mismatched(other, "END")),
        }
    }

    fn resolve_failure(&mut self, err: Error, token: &str) -> Result<(), Error> {
        self.take_head(token)?.fail(err);
        Ok(())
    }

    fn resolve_version(&mut self, rest: &[u8]) -> Result<(), Error> {
        match self.take_head("VERSION")? {
            TextCommand::Version(tx) => {
                drop(tx.send(Ok(rest.to_vec())));
                Ok(())
            }
            other => Err(mismatched(other, "VERSION")),
        }
    }

    fn resolve_counter(&mut self, line: &[u8]) -> Result<(), Error> {
        let value = match parse_num::<u64>(line) {
            Some(value) => value,
            None => {
                return Err(Error::Parse(format!(
                    "Unexpected line: '{}'",
                    String::from_utf8_lossy(line)
                )))
            }
        };
        match self.take_head("counter")? {
            TextCommand::Counter(tx) => {
                drop(tx.send(Ok(value)));
                Ok(())
            }
            other => Err(mismatched(other, "counter")),
        }
    }

    fn begin_value(&mut self, rest: &[u8]) -> Result<(), Error> {
        let (key, rest) = split_token(rest);
        let (flags_token, rest) = split_token(rest);
        let (length_token, cas_token) = split_token(rest);
        let (flags, length) = match (parse_num::<u32>(flags_token), parse_num::<usize>(length_token))
        {
            (Some(flags), Some(length)) => (flags, length),
            _ => return Err(Error::Parse("Malformed VALUE line".into())),
        };
        match self.pipeline.head_mut() {
            Some(TextCommand::Get { keys, .. }) => {
                if !keys.iter().any(|k| k.as_slice() == key) {
                    return Err(Error::Parse(format!(
                        "Unexpected value for key '{}'",
                        String::from_utf8_lossy(key)
                    )));
                }
            }
            Some(_) => {
                return Err(Error::Parse(
                    "Unexpected VALUE response for the outstanding command".into(),
                ))
            }
            None => {
                return Err(Error::Parse(
                    "Unexpected VALUE response with no outstanding command".into(),
                ))
            }
        }
        // The body is followed by its own CRLF; swallow it in raw mode and
        // strip it when the value completes.
        self.mode = Mode::Raw {
            key: key.to_vec(),
            flags,
            cas: cas_token.to_vec(),
            remaining: length + 2,
            partial: Vec::with_capacity(length + 2),
        };
        Ok(())
    }

    fn append_stat(&mut self, rest: &[u8]) -> Result<(), Error> {
        let (name, value) = split_token(rest);
        match self.pipeline.head_mut() {
            Some(TextCommand::Stats { entries, .. }) => {
                entries.insert(name.to_vec(), value.to_vec());
                Ok(())
            }
            Some(_) => Err(Error::Parse(
                "Unexpected STAT response for the outstanding command".into(),
            )),
            None => Err(Error::Parse(
                "Unexpected STAT response with no outstanding command".into(),
            )),
        }
    }

    fn finish_raw(&mut self) -> Result<(), Error> {
        let mode = std::mem::replace(&mut self.mode, Mode::Line);
        let (key, flags, cas, mut data) = match mode {
            Mode::Raw {
                key,
                flags,
                cas,
                partial,
                ..
            } => (key, flags, cas, partial),
            Mode::Line => return Ok(()),
        };
        data.truncate(data.len().saturating_sub(2));
        match self.pipeline.head_mut() {
            Some(TextCommand::Get { collected, .. }) => {
                collected.insert(key, Retrieval { flags, cas, data });
                Ok(())
            }
            _ => Err(Error::Parse(
                "Value body with no retrieval in flight".into(),
            )),
        }
    }
}

impl<T: Transport, S: Timer> Session for TextConnection<T, S> {
    fn receive(&mut self, data: &[u8]) -> Result<(), Error> {
        if !self.pipeline.is_open() {
            return Ok(());
        }
        self.buffer.extend_from_slice(data);
        loop {
            let step = if matches!(self.mode, Mode::Line) {
                self.consume_line()
            } else {
                self.consume_raw()
            };
            match step {
                Ok(true) => continue,
                Ok(false) => return Ok(()),
                Err(err) => {
                    self.pipeline.teardown(Error::ConnectionDone(err.to_string()));
                    return Err(err);
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

/// Fold the collected `VALUE` blocks into the shape the caller asked for,
/// synthesizing `None` entries for expected keys the server skipped.
fn finish_get(keys: Vec<Vec<u8>>, mut collected: HashMap<Vec<u8>, Retrieval>, sink: GetSink) {
    match sink {
        GetSink::Single(tx) => {
            let value = keys
                .first()
                .and_then(|key| collected.remove(key))
                .map(|r| Value {
                    flags: r.flags,
                    data: r.data,
                });
            drop(tx.send(Ok(value)));
        }
        GetSink::SingleCas(tx) => {
            let value = keys
                .first()
                .and_then(|key| collected.remove(key))
                .map(|r| CasValue {
                    flags: r.flags,
                    cas: r.cas,
                    data: r.data,
                });
            drop(tx.send(Ok(value)));
        }
        GetSink::Multi(tx) => {
            let map = keys
                .into_iter()
                .map(|key| {
                    let value = collected.remove(&key).map(|r| Value {
                        flags: r.flags,
                        data: r.data,
                    });
                    (key, value)
                })
                .collect();
            drop(tx.send(Ok(map)));
        }
        GetSink::MultiCas(tx) => {
            let map = keys
                .into_iter()
                .map(|key| {
                    let value = collected.remove(&key).map(|r| CasValue {
                        flags: r.flags,
                        cas: r.cas,
                        data: r.data,
                    });
                    (key, value)
                })
                .collect();
            drop(tx.send(Ok(map)));
        }
    }
}

/// A popped head whose kind cannot terminate on this token: fail it the
/// same way teardown will fail the rest of the queue, and hand back the
/// fatal parse error.
fn mismatched(cmd: TextCommand, token: &str) -> Error {
    let err = Error::Parse(format!(
        "Unexpected {} response for the outstanding command",
        token
    ));
    cmd.fail(Error::ConnectionDone(err.to_string()));
    err
}

fn retrieval_request(verb: &[u8], keys: &[Vec<u8>]) -> Result<Vec<u8>, Error> {
    let mut buf = Vec::with_capacity(verb.len() + keys.len() * 16 + 2);
    buf.extend_from_slice(verb);
    for key in keys {
        verify_key(key)?;
        buf.push(b' ');
        buf.extend_from_slice(key);
    }
    buf.extend_from_slice(b"\r\n");
    Ok(buf)
}

fn keyed_request(verb: &[u8], key: &[u8]) -> Result<Vec<u8>, Error> {
    verify_key(key)?;
    let mut buf = Vec::with_capacity(verb.len() + key.len() + 3);
    buf.extend_from_slice(verb);
    buf.push(b' ');
    buf.extend_from_slice(key);
    buf.extend_from_slice(b"\r\n");
    Ok(buf)
}

fn storage_request(
    verb: &[u8],
    key: &[u8],
    value: &[u8],
    flags: u32,
    expire: u32,
    cas: Option<&[u8]>,
) -> Result<Vec<u8>, Error> {
    verify_key(key)?;
    let mut buf = Vec::with_capacity(verb.len() + key.len() + value.len() + 40);
    buf.extend_from_slice(verb);
    buf.push(b' ');
    buf.extend_from_slice(key);
    push_int(&mut buf, u64::from(flags));
    push_int(&mut buf, u64::from(expire));
    push_int(&mut buf, value.len() as u64);
    if let Some(cas) = cas {
        buf.push(b' ');
        buf.extend_from_slice(cas);
    }
    buf.extend_from_slice(b"\r\n");
    buf.extend_from_slice(value);
    buf.extend_from_slice(b"\r\n");
    Ok(buf)
}

fn push_int(buf: &mut Vec<u8>, n: u64) {
    buf.push(b' ');
    buf.extend_from_slice(n.to_string().as_bytes());
}

fn split_token(line: &[u8]) -> (&[u8], &[u8]) {
    match line.iter().position(|b| *b == b' ') {
        Some(idx) => (&line[..idx], &line[idx + 1..]),
        None => (line, &[][..]),
    }
}

fn parse_num<N: std::str::FromStr>(token: &[u8]) -> Option<N> {
    std::str::from_utf8(token).ok()?.parse().ok()
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}
