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

//! Net-events: the only way any thread other than a worker's own mutates
//! that worker's sockets (§4.1, I1).
//!
//! A worker drains its entire inbound queue before every `Poll::poll`
//! call, so events enqueued from the same caller thread are applied in
//! order, and a poll never observes a half-applied request.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rustls::{ClientConfig, ServerConfig};

use crate::error::Result;
use crate::handle::Handle;
use crate::quota::Quota;
use crate::socket::{AcceptCb, ConnectCb, DohClientCb, DohRecvCb, RecvCb, SendCb, SocketId};

/// A reply channel used by control-plane operations (`listen_*`,
/// `connect_*`, `stop_listening`) that are synchronous from the caller's
/// point of view: the calling thread blocks on the receiver until the
/// owning worker has applied the request.
pub type Reply<T> = crossbeam_channel::Sender<Result<T>>;

/// Parameters for binding a plaintext TCP listener.
pub struct ListenTcpRequest {
    pub addr: SocketAddr,
    pub backlog: i32,
    pub quota: Option<Arc<Quota>>,
    pub accept_cb: AcceptCb,
    /// Bind with `SO_REUSEPORT` from the outset, for a same-address
    /// per-worker replica (§11) rather than a single shared listener.
    pub reuseport: bool,
    pub reply: Reply<Handle>,
}

/// Parameters for binding a TLS listener.
pub struct ListenTlsRequest {
    pub addr: SocketAddr,
    pub backlog: i32,
    pub quota: Option<Arc<Quota>>,
    pub tls_config: Arc<ServerConfig>,
    pub accept_cb: AcceptCb,
    pub reuseport: bool,
    pub reply: Reply<Handle>,
}

/// Parameters for binding an HTTP/2 DoH listener, layered atop either a
/// plaintext or TLS carrier.
pub struct ListenHttpRequest {
    pub addr: SocketAddr,
    pub backlog: i32,
    pub quota: Option<Arc<Quota>>,
    pub tls_config: Option<Arc<ServerConfig>>,
    pub max_concurrent_streams: u32,
    pub reuseport: bool,
    pub reply: Reply<Handle>,
}

/// Parameters for initiating a plaintext TCP connect.
pub struct ConnectTcpRequest {
    pub addr: SocketAddr,
    /// Source address to bind before connecting, if the caller cares which
    /// local interface originates the connection.
    pub local: Option<SocketAddr>,
    pub timeout: Duration,
    pub connect_cb: ConnectCb,
    pub reply: Reply<Handle>,
}

/// Parameters for initiating a TLS connect.
pub struct ConnectTlsRequest {
    pub addr: SocketAddr,
    pub local: Option<SocketAddr>,
    pub timeout: Duration,
    pub tls_config: Arc<ClientConfig>,
    pub server_name: rustls::pki_types::ServerName<'static>,
    pub connect_cb: ConnectCb,
    pub reply: Reply<Handle>,
}

/// Parameters for a one-shot DoH client request (§4.5).
pub struct DohRequest {
    /// `:authority` pseudo-header value (`host[:port]`), from the target
    /// URL.
    pub authority: String,
    pub path: String,
    pub dns_message: Vec<u8>,
    pub use_post: bool,
    pub cb: DohClientCb,
}

/// Every request a worker can receive from another thread.
pub enum NetEvent {
    /// Bind and register a plaintext TCP listener.
    ListenTcp(ListenTcpRequest),
    /// Bind and register a TLS listener.
    ListenTls(ListenTlsRequest),
    /// Bind and register an HTTP/2 DoH listener.
    ListenHttp(ListenHttpRequest),
    /// Registers an additional DoH endpoint on an existing HTTP listener.
    AddDohEndpoint { listener: SocketId, path: String, recv_cb: DohRecvCb, reply: Reply<()> },
    /// Stops a listener: closes the carrier and all of its children.
    StopListening { socket: SocketId, reply: Reply<()> },
    /// Initiates a plaintext TCP connect.
    ConnectTcp(ConnectTcpRequest),
    /// Initiates a TLS connect.
    ConnectTls(ConnectTlsRequest),
    /// Issues one DoH request over an existing HTTP/2 client session.
    SendDohRequest { socket: SocketId, request: DohRequest },
    /// Starts (or restarts) streaming reads on a connected socket.
    StartRead { socket: SocketId, recv_cb: RecvCb },
    /// Pauses delivery without canceling the read.
    PauseRead { socket: SocketId },
    /// Resumes a paused read.
    ResumeRead { socket: SocketId },
    /// Cancels an outstanding read, dropping its callback without
    /// invoking it again.
    CancelRead { socket: SocketId },
    /// Arms (or disarms, with `None`) the read timeout for a socket.
    SetTimeout { socket: SocketId, timeout: Option<Duration> },
    /// Queues an outbound send.
    Send { socket: SocketId, data: Vec<u8>, cb: Option<SendCb> },
    /// Begins the close sequence for a socket (§4.2).
    Close { socket: SocketId },
    /// Begins a drain-then-close sequence (§11): queued sends are allowed
    /// to finish writing before the socket is torn down, instead of being
    /// canceled immediately as [`NetEvent::Close`] does.
    CloseGracefully { socket: SocketId },
    /// A quota slot freed and this listener's deferred accept should be
    /// retried (§4.6 FIFO wake).
    QuotaRetryAccept { listener: SocketId },
    /// Advisory: a handle's refcount reached zero. The worker re-checks
    /// `destroyable()` before freeing the slab slot.
    MaybeDestroy { socket: SocketId },
    /// Requests an orderly shutdown of this worker's event loop.
    Stop { reply: Reply<()> },
}

/// A worker's inbox sender bundled with the `Waker` that pokes its
/// `Poll::poll` awake — sending alone does not interrupt a blocked poll.
#[derive(Clone)]
pub struct EventSender {
    tx: crossbeam_channel::Sender<NetEvent>,
    waker: Arc<mio::Waker>,
}

impl EventSender {
    /// Pairs a channel sender with the worker's waker.
    pub fn new(tx: crossbeam_channel::Sender<NetEvent>, waker: Arc<mio::Waker>) -> Self {
        Self { tx, waker }
    }

    /// Enqueues `event` and wakes the owning worker's poll loop.
    pub fn send(&self, event: NetEvent) {
        if self.tx.send(event).is_ok() {
            let _ = self.waker.wake();
        }
    }

    /// The raw channel sender, for constructing a fresh [`EventSender`]
    /// elsewhere without re-deriving the waker.
    pub fn raw(&self) -> (crossbeam_channel::Sender<NetEvent>, Arc<mio::Waker>) {
        (self.tx.clone(), self.waker.clone())
    }
}

impl std::fmt::Debug for EventSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSender").finish_non_exhaustive()
    }
}
