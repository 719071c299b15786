//! Tokio bindings for `memq-core`: TCP connection establishment plus the
//! driver loop that pumps socket reads, writes, and the idle timer into a
//! protocol session. The protocol logic itself lives entirely in the core
//! crate; this crate only supplies the I/O.

use std::{
    collections::HashMap,
    io,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use futures::future;
use log::debug;
use memq_core::{
    binary::BinaryConnection,
    conn::{Session, Timer, Transport},
    text::TextConnection,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    sync::{mpsc, Mutex, Notify},
    time::Instant,
};

pub use memq_core::conn::Config;
pub use memq_core::error::Error;
pub use memq_core::text::{CasValue, Value};

enum Outbound {
    Data(Vec<u8>),
    Close,
}

/// A [`Transport`] that forwards writes to the task owning the socket's
/// write half. Closing sends a final marker that shuts the socket down.
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl Transport for ChannelTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<()> {
        self.tx
            .send(Outbound::Data(buf.to_vec()))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "writer task is gone"))
    }

    fn close(&mut self) {
        let _ = self.tx.send(Outbound::Close);
    }
}

/// A [`Timer`] backed by a shared deadline slot. The session stores its
/// deadline here synchronously; the driver loop sleeps on the slot and
/// feeds [`Session::on_timeout`] back into the session when it elapses.
///
/// The slot holds nanoseconds since `base`, with zero meaning disarmed.
/// The handle is the stored value itself, so a cancel can only clear the
/// deadline it belongs to.
#[derive(Clone)]
pub struct SharedTimer {
    base: Instant,
    deadline: Arc<AtomicU64>,
    changed: Arc<Notify>,
}

impl SharedTimer {
    fn new() -> Self {
        Self {
            base: Instant::now(),
            deadline: Arc::new(AtomicU64::new(0)),
            changed: Arc::new(Notify::new()),
        }
    }
}

impl Timer for SharedTimer {
    type Handle = u64;

    fn schedule(&mut self, delay: Duration) -> u64 {
        let at = (self.base.elapsed() + delay).as_nanos() as u64 | 1;
        self.deadline.store(at, Ordering::SeqCst);
        self.changed.notify_one();
        at
    }

    fn cancel(&mut self, handle: u64) {
        let _ = self
            .deadline
            .compare_exchange(handle, 0, Ordering::SeqCst, Ordering::SeqCst);
        self.changed.notify_one();
    }
}

async fn write_loop(mut wr: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<Outbound>) {
    while let Some(op) = rx.recv().await {
        match op {
            Outbound::Data(data) => {
                // A failed write surfaces as an EOF or error on the read
                // half, which the driver reports to the session.
                if wr.write_all(&data).await.is_err() {
                    break;
                }
            }
            Outbound::Close => break,
        }
    }
    let _ = wr.shutdown().await;
}

/// Pump socket reads and timer expiry into the session until the
/// connection dies.
async fn drive<S>(session: Arc<Mutex<S>>, mut rd: OwnedReadHalf, timer: SharedTimer)
where
    S: Session + Send + 'static,
{
    let mut buf = [0_u8; 4096];
    loop {
        let armed = timer.deadline.load(Ordering::SeqCst);
        let sleep = async {
            match armed {
                0 => future::pending::<()>().await,
                nanos => tokio::time::sleep_until(timer.base + Duration::from_nanos(nanos)).await,
            }
        };
        tokio::select! {
            _ = sleep => {
                // Fire only if this deadline is still the armed one.
                if timer
                    .deadline
                    .compare_exchange(armed, 0, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    debug!("idle timeout fired");
                    session.lock().await.on_timeout();
                    return;
                }
            }
            _ = timer.changed.notified() => {}
            result = rd.read(&mut buf) => match result {
                Ok(0) => {
                    session.lock().await.connection_lost("Connection closed by server");
                    return;
                }
                Ok(n) => {
                    if let Err(err) = session.lock().await.receive(&buf[..n]) {
                        debug!("connection torn down: {}", err);
                        return;
                    }
                }
                Err(err) => {
                    session.lock().await.connection_lost(&err.to_string());
                    return;
                }
            },
        }
    }
}

async fn spawn_session<S, F>(addr: &str, make: F) -> io::Result<Arc<Mutex<S>>>
where
    S: Session + Send + 'static,
    F: FnOnce(ChannelTransport, SharedTimer) -> S,
{
    let stream = TcpStream::connect(addr).await?;
    let (rd, wr) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel();
    let timer = SharedTimer::new();
    let session = Arc::new(Mutex::new(make(ChannelTransport { tx }, timer.clone())));
    tokio::spawn(write_loop(wr, rx));
    tokio::spawn(drive(session.clone(), rd, timer));
    Ok(session)
}

/// An async memcached client speaking the text protocol over TCP.
///
/// Cloning is cheap and clones share the underlying connection, so a set
/// of concurrent callers pipelines naturally: each call holds the
/// connection lock only long enough to submit its request.
///
/// ```ignore
/// use memq_tokio::{Config, TextClient};
///
/// let client = TextClient::connect("localhost:11211", Config::default()).await?;
/// client.set(b"greeting", b"hello", 0, 0).await?;
/// let value = client.get(b"greeting").await?;
/// ```
#[derive(Clone)]
pub struct TextClient {
    conn: Arc<Mutex<TextConnection<ChannelTransport, SharedTimer>>>,
}

impl TextClient {
    /// Connect to a memcached server over TCP.
    pub async fn connect(addr: &str, config: Config) -> io::Result<Self> {
        let conn =
            spawn_session(addr, |transport, timer| {
                TextConnection::new(transport, timer, config)
            })
            .await?;
        Ok(TextClient { conn })
    }

    /// Fetch a single key. Resolves `None` when the key is not set.
    pub async fn get<K: AsRef<[u8]>>(&self, key: K) -> Result<Option<Value>, Error> {
        let response = self.conn.lock().await.get(key);
        response.await
    }

    /// Fetch a single key along with its CAS identifier.
    pub async fn gets<K: AsRef<[u8]>>(&self, key: K) -> Result<Option<CasValue>, Error> {
        let response = self.conn.lock().await.gets(key);
        response.await
    }

    /// Fetch several keys in one round trip.
    pub async fn get_multi<K: AsRef<[u8]>>(
        &self,
        keys: &[K],
    ) -> Result<HashMap<Vec<u8>, Option<Value>>, Error> {
        let response = self.conn.lock().await.get_multi(keys);
        response.await
    }

    /// Fetch several keys with their CAS identifiers in one round trip.
    pub async fn gets_multi<K: AsRef<[u8]>>(
        &self,
        keys: &[K],
    ) -> Result<HashMap<Vec<u8>, Option<CasValue>>, Error> {
        let response = self.conn.lock().await.gets_multi(keys);
        response.await
    }

    /// Store a value unconditionally.
    pub async fn set<K: AsRef<[u8]>, V: AsRef<[u8]>>(
        &self,
        key: K,
        value: V,
        flags: u32,
        expire: u32,
    ) -> Result<bool, Error> {
        let response = self.conn.lock().await.set(key, value, flags, expire);
        response.await
    }

    /// Store a value only if the key is not already set.
    pub async fn add<K: AsRef<[u8]>, V: AsRef<[u8]>>(
        &self,
        key: K,
        value: V,
        flags: u32,
        expire: u32,
    ) -> Result<bool, Error> {
        let response = self.conn.lock().await.add(key, value, flags, expire);
        response.await
    }

    /// Store a value only if the key is already set.
    pub async fn replace<K: AsRef<[u8]>, V: AsRef<[u8]>>(
        &self,
        key: K,
        value: V,
        flags: u32,
        expire: u32,
    ) -> Result<bool, Error> {
        let response = self.conn.lock().await.replace(key, value, flags, expire);
        response.await
    }

    /// Append to an existing value.
    pub async fn append<K: AsRef<[u8]>, V: AsRef<[u8]>>(
        &self,
        key: K,
        value: V,
        flags: u32,
        expire: u32,
    ) -> Result<bool, Error> {
        let response = self.conn.lock().await.append(key, value, flags, expire);
        response.await
    }

    /// Prepend to an existing value.
    pub async fn prepend<K: AsRef<[u8]>, V: AsRef<[u8]>>(
        &self,
        key: K,
        value: V,
        flags: u32,
        expire: u32,
    ) -> Result<bool, Error> {
        let response = self.conn.lock().await.prepend(key, value, flags, expire);
        response.await
    }

    /// Store a value only if it has not changed since `cas` was handed out.
    pub async fn check_and_set<K: AsRef<[u8]>, V: AsRef<[u8]>, C: AsRef<[u8]>>(
        &self,
        key: K,
        value: V,
        cas: C,
        flags: u32,
        expire: u32,
    ) -> Result<bool, Error> {
        let response = self
            .conn
            .lock()
            .await
            .check_and_set(key, value, cas, flags, expire);
        response.await
    }

    /// Delete a key.
    pub async fn delete<K: AsRef<[u8]>>(&self, key: K) -> Result<bool, Error> {
        let response = self.conn.lock().await.delete(key);
        response.await
    }

    /// Increment a numeric value, resolving the new value.
    pub async fn increment<K: AsRef<[u8]>>(&self, key: K, delta: u64) -> Result<u64, Error> {
        let response = self.conn.lock().await.increment(key, delta);
        response.await
    }

    /// Decrement a numeric value, resolving the new value.
    pub async fn decrement<K: AsRef<[u8]>>(&self, key: K, delta: u64) -> Result<u64, Error> {
        let response = self.conn.lock().await.decrement(key, delta);
        response.await
    }

    /// Query server statistics.
    pub async fn stats(&self, arg: Option<&[u8]>) -> Result<HashMap<Vec<u8>, Vec<u8>>, Error> {
        let response = self.conn.lock().await.stats(arg);
        response.await
    }

    /// Query the server version string.
    pub async fn version(&self) -> Result<Vec<u8>, Error> {
        let response = self.conn.lock().await.version();
        response.await
    }

    /// Expire every key on the server.
    pub async fn flush_all(&self) -> Result<bool, Error> {
        let response = self.conn.lock().await.flush_all();
        response.await
    }
}

/// An async memcached client speaking the binary protocol over TCP.
///
/// Quiet methods return as soon as the request is on the wire; the server
/// only answers them on failure, and such responses are discarded.
#[derive(Clone)]
pub struct BinaryClient {
    conn: Arc<Mutex<BinaryConnection<ChannelTransport, SharedTimer>>>,
}

impl BinaryClient {
    /// Connect to a memcached server over TCP.
    pub async fn connect(addr: &str, config: Config) -> io::Result<Self> {
        let conn =
            spawn_session(addr, |transport, timer| {
                BinaryConnection::new(transport, timer, config)
            })
            .await?;
        Ok(BinaryClient { conn })
    }

    /// Fetch a key, resolving its flags and value.
    pub async fn get<K: AsRef<[u8]>>(&self, key: K) -> Result<(u32, Vec<u8>), Error> {
        let response = self.conn.lock().await.get(key);
        response.await
    }

    /// Store a value unconditionally, resolving the new CAS identifier.
    pub async fn set<K: AsRef<[u8]>, V: AsRef<[u8]>>(
        &self,
        key: K,
        value: V,
        flags: u32,
        expire: u32,
    ) -> Result<u64, Error> {
        let response = self.conn.lock().await.set(key, value, flags, expire);
        response.await
    }

    /// Quiet `set`.
    pub async fn setq<K: AsRef<[u8]>, V: AsRef<[u8]>>(
        &self,
        key: K,
        value: V,
        flags: u32,
        expire: u32,
    ) -> Result<(), Error> {
        self.conn.lock().await.setq(key, value, flags, expire)
    }

    /// Store a value only if the key is not already set.
    pub async fn add<K: AsRef<[u8]>, V: AsRef<[u8]>>(
        &self,
        key: K,
        value: V,
        flags: u32,
        expire: u32,
    ) -> Result<u64, Error> {
        let response = self.conn.lock().await.add(key, value, flags, expire);
        response.await
    }

    /// Quiet `add`.
    pub async fn addq<K: AsRef<[u8]>, V: AsRef<[u8]>>(
        &self,
        key: K,
        value: V,
        flags: u32,
        expire: u32,
    ) -> Result<(), Error> {
        self.conn.lock().await.addq(key, value, flags, expire)
    }

    /// Store a value only if the key is already set.
    pub async fn replace<K: AsRef<[u8]>, V: AsRef<[u8]>>(
        &self,
        key: K,
        value: V,
        flags: u32,
        expire: u32,
    ) -> Result<u64, Error> {
        let response = self.conn.lock().await.replace(key, value, flags, expire);
        response.await
    }

    /// Quiet `replace`.
    pub async fn replaceq<K: AsRef<[u8]>, V: AsRef<[u8]>>(
        &self,
        key: K,
        value: V,
        flags: u32,
        expire: u32,
    ) -> Result<(), Error> {
        self.conn.lock().await.replaceq(key, value, flags, expire)
    }

    /// Delete a key.
    pub async fn delete<K: AsRef<[u8]>>(&self, key: K) -> Result<bool, Error> {
        let response = self.conn.lock().await.delete(key);
        response.await
    }

    /// Quiet `delete`.
    pub async fn deleteq<K: AsRef<[u8]>>(&self, key: K) -> Result<(), Error> {
        self.conn.lock().await.deleteq(key)
    }

    /// Increment a counter, resolving the new value and its CAS identifier.
    pub async fn increment<K: AsRef<[u8]>>(
        &self,
        key: K,
        delta: u64,
        initial: u64,
        expire: u32,
    ) -> Result<(u64, u64), Error> {
        let response = self.conn.lock().await.increment(key, delta, initial, expire);
        response.await
    }

    /// Quiet `increment`.
    pub async fn incrementq<K: AsRef<[u8]>>(
        &self,
        key: K,
        delta: u64,
        initial: u64,
        expire: u32,
    ) -> Result<(), Error> {
        self.conn.lock().await.incrementq(key, delta, initial, expire)
    }

    /// Decrement a counter, resolving the new value and its CAS identifier.
    pub async fn decrement<K: AsRef<[u8]>>(
        &self,
        key: K,
        delta: u64,
        initial: u64,
        expire: u32,
    ) -> Result<(u64, u64), Error> {
        let response = self.conn.lock().await.decrement(key, delta, initial, expire);
        response.await
    }

    /// Quiet `decrement`.
    pub async fn decrementq<K: AsRef<[u8]>>(
        &self,
        key: K,
        delta: u64,
        initial: u64,
        expire: u32,
    ) -> Result<(), Error> {
        self.conn.lock().await.decrementq(key, delta, initial, expire)
    }

    /// Expire every key, immediately or `expire` seconds from now.
    pub async fn flush(&self, expire: u32) -> Result<bool, Error> {
        let response = self.conn.lock().await.flush(expire);
        response.await
    }

    /// Quiet `flush`.
    pub async fn flushq(&self, expire: u32) -> Result<(), Error> {
        self.conn.lock().await.flushq(expire)
    }

    /// A no-op round trip, useful as a keep-alive probe.
    pub async fn noop(&self) -> Result<bool, Error> {
        let response = self.conn.lock().await.noop();
        response.await
    }

    /// Ask the server to close the connection after responding.
    pub async fn quit(&self) -> Result<bool, Error> {
        let response = self.conn.lock().await.quit();
        response.await
    }

    /// Quiet `quit`.
    pub async fn quitq(&self) -> Result<(), Error> {
        self.conn.lock().await.quitq()
    }

    /// Append to an existing value.
    pub async fn append<K: AsRef<[u8]>, V: AsRef<[u8]>>(
        &self,
        key: K,
        value: V,
    ) -> Result<bool, Error> {
        let response = self.conn.lock().await.append(key, value);
        response.await
    }

    /// Quiet `append`.
    pub async fn appendq<K: AsRef<[u8]>, V: AsRef<[u8]>>(
        &self,
        key: K,
        value: V,
    ) -> Result<(), Error> {
        self.conn.lock().await.appendq(key, value)
    }

    /// Prepend to an existing value.
    pub async fn prepend<K: AsRef<[u8]>, V: AsRef<[u8]>>(
        &self,
        key: K,
        value: V,
    ) -> Result<bool, Error> {
        let response = self.conn.lock().await.prepend(key, value);
        response.await
    }

    /// Quiet `prepend`.
    pub async fn prependq<K: AsRef<[u8]>, V: AsRef<[u8]>>(
        &self,
        key: K,
        value: V,
    ) -> Result<(), Error> {
        self.conn.lock().await.prependq(key, value)
    }

    /// Query server statistics. An empty key asks for the full dump.
    pub async fn stats(&self, key: &[u8]) -> Result<HashMap<Vec<u8>, Vec<u8>>, Error> {
        let response = self.conn.lock().await.stats(key);
        response.await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    async fn scripted_server(expect: Vec<u8>, reply: Vec<u8>) -> (String, JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let handle = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = vec![0_u8; expect.len()];
            sock.read_exact(&mut buf).await.unwrap();
            assert_eq!(expect, buf);
            sock.write_all(&reply).await.unwrap();
        });
        (addr, handle)
    }

    #[test]
    fn test_text_get() {
        tokio_test::block_on(async {
            let (addr, server) = scripted_server(
                b"get foo\r\n".to_vec(),
                b"VALUE foo 0 3\r\nbar\r\nEND\r\n".to_vec(),
            )
            .await;
            let client = TextClient::connect(&addr, Config::default()).await.unwrap();
            let value = client.get(b"foo").await.unwrap();
            assert_eq!(
                Some(Value {
                    flags: 0,
                    data: b"bar".to_vec()
                }),
                value
            );
            server.await.unwrap();
        });
    }

    #[test]
    fn test_text_pipelining() {
        tokio_test::block_on(async {
            let (addr, server) = scripted_server(
                b"get foo\r\nset bar 0 0 3\r\negg\r\n".to_vec(),
                b"VALUE foo 0 3\r\nbar\r\nEND\r\nSTORED\r\n".to_vec(),
            )
            .await;
            let client = TextClient::connect(&addr, Config::default()).await.unwrap();
            let (get, set) = futures::join!(client.get(b"foo"), client.set(b"bar", b"egg", 0, 0));
            assert_eq!(
                Some(Value {
                    flags: 0,
                    data: b"bar".to_vec()
                }),
                get.unwrap()
            );
            assert_eq!(true, set.unwrap());
            server.await.unwrap();
        });
    }

    #[test]
    fn test_text_timeout() {
        tokio_test::block_on(async {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap().to_string();
            let server = tokio::spawn(async move {
                // Accept and go silent.
                let (_sock, _) = listener.accept().await.unwrap();
                tokio::time::sleep(Duration::from_secs(5)).await;
            });
            let config = Config::new(Duration::from_millis(100));
            let client = TextClient::connect(&addr, config).await.unwrap();
            assert_eq!(Err(Error::Timeout), client.get(b"foo").await);
            // The connection is dead for later submissions.
            assert_eq!(Err(Error::Disconnected), client.get(b"bar").await);
            server.abort();
        });
    }

    #[test]
    fn test_binary_get() {
        tokio_test::block_on(async {
            let (addr, server) = scripted_server(
                b"\x80\x00\x00\x03\x00\x00\x00\x00\x00\x00\x00\x03\
                  \x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00foo"
                    .to_vec(),
                b"\x81\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x03\
                  \x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00bar"
                    .to_vec(),
            )
            .await;
            let client = BinaryClient::connect(&addr, Config::default())
                .await
                .unwrap();
            assert_eq!(Ok((0, b"bar".to_vec())), client.get(b"foo").await);
            server.await.unwrap();
        });
    }

    #[test]
    fn test_binary_quiet_then_get() {
        tokio_test::block_on(async {
            let (addr, server) = scripted_server(
                b"\x80\x11\x00\x03\x08\x00\x00\x00\x00\x00\x00\x0e\x00\x00\x00\x01\
                  \x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\
                  foobar\
                  \x80\x00\x00\x03\x00\x00\x00\x00\x00\x00\x00\x03\
                  \x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00foo"
                    .to_vec(),
                b"\x81\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x03\
                  \x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00bar"
                    .to_vec(),
            )
            .await;
            let client = BinaryClient::connect(&addr, Config::default())
                .await
                .unwrap();
            client.setq(b"foo", b"bar", 0, 0).await.unwrap();
            assert_eq!(Ok((0, b"bar".to_vec())), client.get(b"foo").await);
            server.await.unwrap();
        });
    }

    #[test]
    fn test_server_close_fails_pending() {
        tokio_test::block_on(async {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap().to_string();
            let server = tokio::spawn(async move {
                let (mut sock, _) = listener.accept().await.unwrap();
                let mut buf = vec![0_u8; b"get foo\r\n".len()];
                sock.read_exact(&mut buf).await.unwrap();
                // Close without answering.
            });
            let client = TextClient::connect(&addr, Config::default()).await.unwrap();
            match client.get(b"foo").await {
                Err(Error::ConnectionDone(_)) => {}
                other => panic!("unexpected result: {:?}", other),
            }
            server.await.unwrap();
        });
    }
}
