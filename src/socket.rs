// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The socket: the durable identity of an endpoint (§3).
//!
//! A `Socket` lives exactly once, inside the `Slab` of the worker that owns
//! it (invariant I1). Cross-thread observers (a [`crate::handle::Handle`]
//! held by a consumer on another thread) only ever see [`SocketShared`] —
//! the atomic flags and refcount — never the kind-specific mutable state,
//! which may only be touched from the owning worker's thread.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use rustls::{ClientConnection, ServerConnection};
use slab::Slab;

use crate::error::NetError;
use crate::handle::Handle;
use crate::http::session::Http2Session;

/// A stable identity for a socket: the worker that owns it, plus its key in
/// that worker's slab.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketId {
    worker: usize,
    key: usize,
}

impl SocketId {
    /// Builds an id from a worker index and slab key.
    pub fn new(worker: usize, key: usize) -> Self {
        Self { worker, key }
    }

    /// The owning worker's stable index.
    pub fn worker(&self) -> usize {
        self.worker
    }

    /// The slab key within the owning worker.
    pub fn key(&self) -> usize {
        self.key
    }

    /// The `mio::Token` this socket registers under — the slab key doubles
    /// as the token, as in the teacher's listener.
    pub fn token(&self) -> mio::Token {
        mio::Token(self.key)
    }
}

/// The atomic flags making up a socket's dynamic state (§3). Transitions
/// are monotonic along the close path (I2): `closed ⇒ !listening ∧
/// !connected ∧ !active`.
#[derive(Debug, Default)]
pub struct SocketFlags {
    active: AtomicBool,
    connecting: AtomicBool,
    connected: AtomicBool,
    closing: AtomicBool,
    closed: AtomicBool,
    listening: AtomicBool,
    listen_error: AtomicBool,
    read_paused: AtomicBool,
    accepting: AtomicBool,
}

macro_rules! flag_accessors {
    ($get:ident, $set:ident, $field:ident) => {
        /// Reads the flag.
        pub fn $get(&self) -> bool {
            self.$field.load(Ordering::Acquire)
        }

        /// Sets the flag.
        pub fn $set(&self, value: bool) {
            self.$field.store(value, Ordering::Release);
        }
    };
}

impl SocketFlags {
    fn new_active() -> Self {
        let flags = Self::default();
        flags.active.store(true, Ordering::Release);
        flags
    }

    flag_accessors!(active, set_active, active);
    flag_accessors!(connecting, set_connecting, connecting);
    flag_accessors!(connected, set_connected, connected);
    flag_accessors!(listening, set_listening, listening);
    flag_accessors!(listen_error, set_listen_error, listen_error);
    flag_accessors!(read_paused, set_read_paused, read_paused);
    flag_accessors!(accepting, set_accepting, accepting);

    /// Reads the `closing` flag.
    pub fn closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Reads the `closed` flag.
    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// The idempotent `closing=false -> true` transition (§4.2). Returns
    /// `true` exactly once, for the caller that won the race; every
    /// subsequent call is a no-op returning `false`.
    pub fn begin_close(&self) -> bool {
        self.closing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Completes the close: sets `closed`, and clears `active`/`connected`/
    /// `listening` to preserve I2.
    pub fn finish_close(&self) {
        self.active.store(false, Ordering::Release);
        self.connected.store(false, Ordering::Release);
        self.connecting.store(false, Ordering::Release);
        self.listening.store(false, Ordering::Release);
        self.closed.store(true, Ordering::Release);
    }
}

/// The part of a socket visible to handles on any thread: identity,
/// atomic flags, refcount, and the addresses once known.
#[derive(Debug)]
pub struct SocketShared {
    id: SocketId,
    flags: SocketFlags,
    refcount: AtomicUsize,
    addrs: Mutex<(Option<SocketAddr>, Option<SocketAddr>)>,
    /// §11 supplement: count of accepts refused by quota exhaustion.
    pub accept_failures: AtomicU64,
    /// Consumer-settable before the first `read()`; selects the keepalive
    /// vs idle read timeout (§4.3).
    keepalive: AtomicBool,
}

impl SocketShared {
    /// Creates the shared state for a freshly constructed socket:
    /// `active=true`, refcount `1` (§4.2).
    pub fn new(id: SocketId) -> Self {
        Self {
            id,
            flags: SocketFlags::new_active(),
            refcount: AtomicUsize::new(1),
            addrs: Mutex::new((None, None)),
            accept_failures: AtomicU64::new(0),
            keepalive: AtomicBool::new(false),
        }
    }

    /// The socket's stable identity.
    pub fn id(&self) -> SocketId {
        self.id
    }

    /// The atomic flags.
    pub fn flags(&self) -> &SocketFlags {
        &self.flags
    }

    /// Attaches (bumps the refcount). Invariant I3.
    pub fn attach(&self) -> usize {
        self.refcount.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Detaches (drops the refcount). Panics on underflow, which would
    /// indicate an unbalanced attach/detach pair somewhere in the caller.
    pub fn detach(&self) -> usize {
        let prev = self.refcount.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "socket refcount underflow");
        prev - 1
    }

    /// Current refcount.
    pub fn refcount(&self) -> usize {
        self.refcount.load(Ordering::Acquire)
    }

    /// Whether the socket is eligible for destruction: `closed` and
    /// refcount zero (P1).
    pub fn destroyable(&self) -> bool {
        self.flags.closed() && self.refcount() == 0
    }

    /// Local address, once known.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.addrs.lock().unwrap().0
    }

    /// Peer address, once known.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.addrs.lock().unwrap().1
    }

    /// Records the local/peer addresses once accept/connect resolves them.
    pub fn set_addrs(&self, local: Option<SocketAddr>, peer: Option<SocketAddr>) {
        let mut addrs = self.addrs.lock().unwrap();
        if local.is_some() {
            addrs.0 = local;
        }
        if peer.is_some() {
            addrs.1 = peer;
        }
    }

    /// Whether the keepalive read timeout applies.
    pub fn keepalive(&self) -> bool {
        self.keepalive.load(Ordering::Acquire)
    }

    /// Sets the keepalive flag.
    pub fn set_keepalive(&self, value: bool) {
        self.keepalive.store(value, Ordering::Release);
    }
}

/// Result delivered to a read callback for one inbound delivery (§4.3).
pub enum RecvResult<'a> {
    /// Bytes arrived; consumed within the call (I6).
    Success(&'a [u8]),
    /// The peer closed the stream cleanly.
    Eof,
    /// The read failed.
    Error(NetError),
}

/// Invoked once per accepted connection or handshake completion.
pub type AcceptCb = Box<dyn FnMut(Handle, crate::error::Result<()>) + Send>;
/// Invoked exactly once when a connect attempt resolves.
pub type ConnectCb = Box<dyn FnOnce(Handle, crate::error::Result<()>) + Send>;
/// Invoked once per inbound delivery on a streaming read.
pub type RecvCb = Box<dyn for<'a> FnMut(Handle, RecvResult<'a>) + Send>;
/// Invoked at most once per send, after ciphertext/bytes are handed to the
/// carrier (I8-equivalent for sends: "exactly once" delivery).
pub type SendCb = Box<dyn FnOnce(Handle, crate::error::Result<()>) + Send>;
/// Invoked exactly once with a DoH client response body or failure.
pub type DohClientCb = Box<dyn FnOnce(crate::error::Result<Vec<u8>>) + Send>;
/// Invoked once per DoH request delivered to an endpoint.
pub type DohRecvCb = Box<dyn FnMut(Handle, RecvResult) + Send>;

/// An in-flight I/O request record (§3 Uvreq): read/send bookkeeping plus
/// the handle that anchors the socket for the request's lifetime.
pub struct Uvreq {
    /// The handle attached for the duration of this request.
    pub handle: Handle,
    /// Outbound payload, for sends.
    pub send_region: Option<Vec<u8>>,
    /// The send completion callback, taken (and invoked) exactly once.
    pub send_cb: Option<SendCb>,
}

/// State for a TCP listening socket.
pub struct TcpListenerState {
    pub inner: mio::net::TcpListener,
    pub accept_cb: AcceptCb,
    pub quota: Option<std::sync::Arc<crate::quota::Quota>>,
    pub backlog: i32,
    pub children: Vec<SocketId>,
}

impl std::fmt::Debug for TcpListenerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpListenerState")
            .field("backlog", &self.backlog)
            .field("children", &self.children)
            .finish_non_exhaustive()
    }
}

/// State for a connected, plaintext TCP socket.
pub struct TcpConnState {
    pub stream: mio::net::TcpStream,
    pub recv_cb: Option<RecvCb>,
    pub connect_cb: Option<ConnectCb>,
    pub send_queue: std::collections::VecDeque<Uvreq>,
    pub write_in_flight: bool,
    pub processing: bool,
    pub static_handle: Option<Handle>,
    /// The listener's quota slot this accepted connection holds, released
    /// on close (§4.6).
    pub quota: Option<std::sync::Arc<crate::quota::Quota>>,
}

impl std::fmt::Debug for TcpConnState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpConnState")
            .field("write_in_flight", &self.write_in_flight)
            .field("processing", &self.processing)
            .field("queued_sends", &self.send_queue.len())
            .finish_non_exhaustive()
    }
}

/// TLS handshake/session phase (§4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsState {
    /// Handshake not yet started.
    Init,
    /// Handshake in progress.
    Handshake,
    /// Handshake complete; application data flows.
    Io,
    /// Close initiated.
    Closing,
    /// Fully closed.
    Closed,
    /// A fatal TLS error occurred.
    Error,
}

/// Either side of a TLS connection's `rustls` engine.
pub enum TlsEngine {
    /// Server-side TLS session.
    Server(Box<ServerConnection>),
    /// Client-side TLS session.
    Client(Box<ClientConnection>),
}

impl TlsEngine {
    /// Runs the handshake/IO state machine forward. Returns `Ok(true)` if
    /// application data may now be readable.
    pub fn process_new_packets(&mut self) -> Result<rustls::IoState, rustls::Error> {
        match self {
            TlsEngine::Server(c) => c.process_new_packets(),
            TlsEngine::Client(c) => c.process_new_packets(),
        }
    }

    /// Reads ciphertext off the carrier into the engine.
    pub fn read_tls(&mut self, rd: &mut dyn std::io::Read) -> std::io::Result<usize> {
        match self {
            TlsEngine::Server(c) => c.read_tls(rd),
            TlsEngine::Client(c) => c.read_tls(rd),
        }
    }

    /// Writes pending ciphertext to the carrier.
    pub fn write_tls(&mut self, wr: &mut dyn std::io::Write) -> std::io::Result<usize> {
        match self {
            TlsEngine::Server(c) => c.write_tls(wr),
            TlsEngine::Client(c) => c.write_tls(wr),
        }
    }

    /// Whether the engine wants to read more ciphertext.
    pub fn wants_read(&self) -> bool {
        match self {
            TlsEngine::Server(c) => c.wants_read(),
            TlsEngine::Client(c) => c.wants_read(),
        }
    }

    /// Whether the engine has ciphertext queued to write.
    pub fn wants_write(&self) -> bool {
        match self {
            TlsEngine::Server(c) => c.wants_write(),
            TlsEngine::Client(c) => c.wants_write(),
        }
    }

    /// Whether the handshake has completed.
    pub fn is_handshaking(&self) -> bool {
        match self {
            TlsEngine::Server(c) => c.is_handshaking(),
            TlsEngine::Client(c) => c.is_handshaking(),
        }
    }

    /// Negotiated ALPN protocol, if any.
    pub fn alpn_protocol(&self) -> Option<&[u8]> {
        match self {
            TlsEngine::Server(c) => c.alpn_protocol(),
            TlsEngine::Client(c) => c.alpn_protocol(),
        }
    }

    /// Writer for plaintext application data queued to be encrypted.
    pub fn writer(&mut self) -> rustls::Writer<'_> {
        match self {
            TlsEngine::Server(c) => c.writer(),
            TlsEngine::Client(c) => c.writer(),
        }
    }

    /// Reader for decrypted plaintext.
    pub fn reader(&mut self) -> rustls::Reader<'_> {
        match self {
            TlsEngine::Server(c) => c.reader(),
            TlsEngine::Client(c) => c.reader(),
        }
    }
}

/// State for a TLS-wrapped connection (§4.4): a state machine that owns its
/// raw carrier stream directly and drives a memory-BIO-equivalent `rustls`
/// engine over it.
pub struct TlsConnState {
    pub stream: mio::net::TcpStream,
    pub engine: TlsEngine,
    pub state: TlsState,
    pub recv_cb: Option<RecvCb>,
    pub connect_cb: Option<ConnectCb>,
    pub require_alpn_h2: bool,
    pub static_handle: Option<Handle>,
    /// The listener's quota slot this accepted connection holds, released
    /// on close (§4.6).
    pub quota: Option<std::sync::Arc<crate::quota::Quota>>,
}

impl std::fmt::Debug for TlsConnState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConnState").field("state", &self.state).finish_non_exhaustive()
    }
}

/// State for a TLS listener: a plain TCP listener plus the context used to
/// perform a handshake on each accepted connection (§4.4).
pub struct TlsListenerState {
    pub inner: mio::net::TcpListener,
    pub tls_ctx: std::sync::Arc<rustls::ServerConfig>,
    pub accept_cb: AcceptCb,
    pub quota: Option<std::sync::Arc<crate::quota::Quota>>,
    pub backlog: i32,
    pub children: Vec<SocketId>,
    pub require_alpn_h2: bool,
}

impl std::fmt::Debug for TlsListenerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsListenerState")
            .field("backlog", &self.backlog)
            .field("children", &self.children)
            .finish_non_exhaustive()
    }
}

/// A registered DoH endpoint: a `:path` and the callback invoked with each
/// decoded request.
pub struct DohEndpoint {
    pub path: String,
    pub recv_cb: DohRecvCb,
}

impl std::fmt::Debug for DohEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DohEndpoint").field("path", &self.path).finish_non_exhaustive()
    }
}

/// State for an HTTP/2 DoH listener (§4.5): a plain TCP listener, optionally
/// TLS-wrapped, dispatching accepted sessions' requests to path-keyed
/// endpoints. `tls_ctx` is `None` for an h2c (plaintext) listener.
pub struct HttpListenerState {
    pub inner: mio::net::TcpListener,
    pub tls_ctx: Option<std::sync::Arc<rustls::ServerConfig>>,
    pub endpoints: Vec<DohEndpoint>,
    pub max_concurrent_streams: u32,
    pub quota: Option<std::sync::Arc<crate::quota::Quota>>,
    pub backlog: i32,
    pub children: Vec<SocketId>,
}

impl std::fmt::Debug for HttpListenerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpListenerState")
            .field("backlog", &self.backlog)
            .field("children", &self.children)
            .field("endpoints", &self.endpoints.len())
            .finish_non_exhaustive()
    }
}

/// The raw transport an HTTP/2 session drives directly (§4.5): owned
/// in-line, the same way a [`TlsConnState`] owns its stream, so a
/// readiness notification on this socket's own token always reaches its
/// session without an indirection through a separate carrier socket.
pub enum HttpCarrier {
    /// h2c: no TLS layer.
    Plain(mio::net::TcpStream),
    /// h2 over TLS. Handshake phase is read off `engine.is_handshaking()`
    /// directly, same as [`TlsConnState`].
    Tls { engine: TlsEngine, stream: mio::net::TcpStream },
}

impl std::fmt::Debug for HttpCarrier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HttpCarrier::Plain(_) => f.write_str("HttpCarrier::Plain"),
            HttpCarrier::Tls { .. } => f.write_str("HttpCarrier::Tls"),
        }
    }
}

/// Per-stream bookkeeping while a request or response is still being
/// assembled from HEADERS/DATA frames (§4.5).
#[derive(Debug, Default)]
pub struct DohStreamBuffer {
    pub method: String,
    pub path: String,
    pub status: u16,
    /// The response's `content-type` header value (client-side only);
    /// checked against `application/dns-message` before a response is
    /// handed to its caller (§6).
    pub content_type: String,
    pub body: Vec<u8>,
}

/// State for one HTTP/2 DoH session multiplexed over a directly-owned TCP
/// or TLS carrier (§4.5).
pub struct HttpSocketState {
    pub carrier: HttpCarrier,
    pub session: Http2Session,
    /// Set when this socket is server-side and dispatches into endpoints
    /// owned by the listener at this id.
    pub listener: Option<SocketId>,
    /// Client-side: stream id -> the one-shot callback awaiting that
    /// request's response (I8: removed the instant it is invoked).
    pub client_requests: std::collections::HashMap<u32, DohClientCb>,
    /// Server-side streams whose request finished arriving and await a
    /// response, oldest first. A generic `send()` on this socket's handle
    /// answers the front of this queue.
    pub pending_responses: std::collections::VecDeque<u32>,
    /// In-progress request/response bodies keyed by stream id.
    pub streams: std::collections::HashMap<u32, DohStreamBuffer>,
    /// Bytes the session has produced but not yet handed to the carrier.
    pub outbound: Vec<u8>,
    pub static_handle: Option<Handle>,
    /// The listener's quota slot this accepted connection holds, released
    /// on close (§4.6). `None` for client-initiated DoH sessions.
    pub quota: Option<std::sync::Arc<crate::quota::Quota>>,
}

impl std::fmt::Debug for HttpSocketState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpSocketState")
            .field("carrier", &self.carrier)
            .field("pending_responses", &self.pending_responses.len())
            .finish_non_exhaustive()
    }
}

/// The kind-specific mutable state of a socket. Only ever touched on the
/// owning worker's thread (I1).
#[derive(Debug)]
pub enum SocketKind {
    /// §3 TCP-listener.
    TcpListener(TcpListenerState),
    /// §3 TCP-connected.
    TcpConnected(TcpConnState),
    /// §3 TLS-listener.
    TlsListener(TlsListenerState),
    /// §3 TLS-connected.
    TlsConnected(TlsConnState),
    /// §3 HTTP-listener.
    HttpListener(HttpListenerState),
    /// §3 HTTP-socket.
    HttpSocket(HttpSocketState),
}

/// A socket: shared cross-thread state plus kind-specific mutable state,
/// stored in the owning worker's slab.
#[derive(Debug)]
pub struct Socket {
    pub shared: std::sync::Arc<SocketShared>,
    pub server: Option<SocketId>,
    pub kind: SocketKind,
}

impl Socket {
    /// Builds a socket wrapper, initializing shared state per §4.2.
    pub fn new(id: SocketId, kind: SocketKind) -> Self {
        Self {
            shared: std::sync::Arc::new(SocketShared::new(id)),
            server: None,
            kind,
        }
    }

    /// The socket's id.
    pub fn id(&self) -> SocketId {
        self.shared.id()
    }
}

/// The slab of sockets a single worker owns.
pub type SocketSlab = Slab<Socket>;

/// Registers `source` with `registry`, choosing the interest set the kind
/// currently needs. Listening sockets always register READABLE only.
pub fn register_listener(
    registry: &mio::Registry,
    listener: &mut mio::net::TcpListener,
    token: mio::Token,
) -> std::io::Result<()> {
    registry.register(listener, token, mio::Interest::READABLE)
}

/// Re-derives a listener's `local_addr`, used after `bind_with_fallback`
/// when the caller bound to port 0.
pub fn listener_local_addr(listener: &mio::net::TcpListener) -> Option<SocketAddr> {
    listener.local_addr().ok()
}
