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

//! The network manager: process-wide owner of the worker pool and the
//! external control-plane surface (§6).
//!
//! Every `listen_*`/`connect_*` call here blocks the calling thread on a
//! reply channel until the target worker has applied the request (§4.1,
//! §5 "Blocking waits for off-worker originators"); the callbacks the
//! caller supplies (`accept_cb`, `connect_cb`, `recv_cb`, the DoH client
//! callback) fire later, asynchronously, from inside the owning worker.

use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ServerConfig};

use crate::config::NetmgrConfig;
use crate::error::{NetError, Result};
use crate::event::{
    ConnectTcpRequest, ConnectTlsRequest, DohRequest, EventSender, ListenHttpRequest, ListenTcpRequest,
    ListenTlsRequest, NetEvent, Reply,
};
use crate::handle::Handle;
use crate::http::url;
use crate::quota::Quota;
use crate::socket::{AcceptCb, ConnectCb, DohClientCb, DohRecvCb, SocketId};
use crate::worker::Worker;

/// HTTP method for a one-shot DoH client request (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DohMethod {
    Get,
    Post,
}

struct WorkerThread {
    sender: EventSender,
    join: Option<JoinHandle<()>>,
}

/// The process-wide owner of the worker set (§3 "Network manager").
///
/// Created once with [`NetworkManager::new`]; [`NetworkManager::closedown`]
/// begins an orderly shutdown of every socket it owns, and
/// [`NetworkManager::destroy`] blocks until every worker thread has
/// finished and joins them.
pub struct NetworkManager {
    config: Arc<NetmgrConfig>,
    workers: Vec<WorkerThread>,
    next_worker: AtomicUsize,
    replicas: Mutex<HashMap<SocketId, Vec<Handle>>>,
    closing: AtomicBool,
}

fn reply_channel<T>() -> (Reply<T>, crossbeam_channel::Receiver<Result<T>>) {
    crossbeam_channel::bounded(1)
}

fn await_reply<T>(rx: crossbeam_channel::Receiver<Result<T>>) -> Result<T> {
    rx.recv().unwrap_or(Err(NetError::Failure("worker thread dropped its reply channel")))
}

impl NetworkManager {
    /// Spawns the configured worker pool (`NetmgrConfig::resolved_worker_count`
    /// threads, one `Poll` and one socket table each).
    pub fn new(config: NetmgrConfig) -> std::io::Result<Self> {
        let config = Arc::new(config);
        let count = config.resolved_worker_count();
        let mut workers = Vec::with_capacity(count);
        for idx in 0..count {
            let (tx, rx) = crossbeam_channel::unbounded();
            let mut worker = Worker::new(idx, config.clone(), rx, tx)?;
            let sender = worker.event_sender();
            let join = std::thread::Builder::new()
                .name(format!("netmgr-worker-{idx}"))
                .spawn(move || worker.run())?;
            workers.push(WorkerThread { sender, join: Some(join) });
        }
        log::info!("netmgr: started {count} worker thread(s)");
        Ok(Self {
            config,
            workers,
            next_worker: AtomicUsize::new(0),
            replicas: Mutex::new(HashMap::new()),
            closing: AtomicBool::new(false),
        })
    }

    /// Shared configuration.
    pub fn config(&self) -> &Arc<NetmgrConfig> {
        &self.config
    }

    /// Number of running I/O workers.
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Picks a worker to own a new client-initiated socket. §4.1 specifies
    /// a uniform random draw; this crate uses round-robin instead, which
    /// spreads load identically for a stateless dispatch policy without
    /// pulling in a `rand` dependency the rest of the stack has no other
    /// use for (recorded in DESIGN.md).
    fn pick_worker(&self) -> usize {
        self.next_worker.fetch_add(1, Ordering::Relaxed) % self.workers.len()
    }

    fn sender(&self, idx: usize) -> EventSender {
        self.workers[idx].sender.clone()
    }

    /// Binds a plaintext TCP listener on `iface` (§6 `listen_tcp`).
    ///
    /// When [`NetmgrConfig::reuseport`] is set, binds one replica per
    /// worker via `SO_REUSEPORT` (§11) sharing `accept_cb` and `quota`
    /// across all of them, and returns a handle to the first; stopping
    /// that handle cascades to every replica.
    pub fn listen_tcp(
        &self,
        iface: SocketAddr,
        accept_cb: AcceptCb,
        backlog: i32,
        quota: Option<Arc<Quota>>,
    ) -> Result<Handle> {
        if self.config.reuseport && self.workers.len() > 1 {
            return self.listen_tcp_replicas(iface, accept_cb, backlog, quota);
        }
        let idx = self.pick_worker();
        let (reply, rx) = reply_channel();
        self.sender(idx).send(NetEvent::ListenTcp(ListenTcpRequest {
            addr: iface,
            backlog,
            quota,
            accept_cb,
            reuseport: false,
            reply,
        }));
        await_reply(rx)
    }

    fn listen_tcp_replicas(
        &self,
        iface: SocketAddr,
        accept_cb: AcceptCb,
        backlog: i32,
        quota: Option<Arc<Quota>>,
    ) -> Result<Handle> {
        let shared_cb: Arc<Mutex<AcceptCb>> = Arc::new(Mutex::new(accept_cb));
        let mut handles = Vec::with_capacity(self.workers.len());
        for idx in 0..self.workers.len() {
            let cb = shared_cb.clone();
            let wrapped: AcceptCb = Box::new(move |handle, result| {
                if let Ok(mut cb) = cb.lock() {
                    cb(handle, result);
                }
            });
            let (reply, rx) = reply_channel();
            self.sender(idx).send(NetEvent::ListenTcp(ListenTcpRequest {
                addr: iface,
                backlog,
                quota: quota.clone(),
                accept_cb: wrapped,
                reuseport: true,
                reply,
            }));
            match await_reply(rx) {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    close_all(&handles);
                    return Err(e);
                }
            }
        }
        Ok(self.register_replica_group(handles))
    }

    /// Binds a TLS listener on `iface` (§6 `listen_tls`); same replica
    /// semantics as [`Self::listen_tcp`].
    pub fn listen_tls(
        &self,
        iface: SocketAddr,
        accept_cb: AcceptCb,
        backlog: i32,
        quota: Option<Arc<Quota>>,
        tls_ctx: Arc<ServerConfig>,
    ) -> Result<Handle> {
        if self.config.reuseport && self.workers.len() > 1 {
            let shared_cb: Arc<Mutex<AcceptCb>> = Arc::new(Mutex::new(accept_cb));
            let mut handles = Vec::with_capacity(self.workers.len());
            for idx in 0..self.workers.len() {
                let cb = shared_cb.clone();
                let wrapped: AcceptCb = Box::new(move |handle, result| {
                    if let Ok(mut cb) = cb.lock() {
                        cb(handle, result);
                    }
                });
                let (reply, rx) = reply_channel();
                self.sender(idx).send(NetEvent::ListenTls(ListenTlsRequest {
                    addr: iface,
                    backlog,
                    quota: quota.clone(),
                    tls_config: tls_ctx.clone(),
                    accept_cb: wrapped,
                    reuseport: true,
                    reply,
                }));
                match await_reply(rx) {
                    Ok(handle) => handles.push(handle),
                    Err(e) => {
                        close_all(&handles);
                        return Err(e);
                    }
                }
            }
            return Ok(self.register_replica_group(handles));
        }

        let idx = self.pick_worker();
        let (reply, rx) = reply_channel();
        self.sender(idx).send(NetEvent::ListenTls(ListenTlsRequest {
            addr: iface,
            backlog,
            quota,
            tls_config: tls_ctx,
            accept_cb,
            reuseport: false,
            reply,
        }));
        await_reply(rx)
    }

    /// Binds an HTTP/2 DoH listener on `iface` (§6 `listen_http`).
    /// `endpoints` is registered via repeated [`Self::add_doh_endpoint`]
    /// calls once the listener exists.
    pub fn listen_http(
        &self,
        iface: SocketAddr,
        tls_ctx: Option<Arc<ServerConfig>>,
        endpoints: Vec<(String, DohRecvCb)>,
        backlog: i32,
        quota: Option<Arc<Quota>>,
    ) -> Result<Handle> {
        let idx = self.pick_worker();
        let (reply, rx) = reply_channel();
        self.sender(idx).send(NetEvent::ListenHttp(ListenHttpRequest {
            addr: iface,
            backlog,
            quota,
            tls_config: tls_ctx,
            max_concurrent_streams: self.config.http2_max_concurrent_streams,
            reuseport: false,
            reply,
        }));
        let handle = await_reply(rx)?;
        for (path, recv_cb) in endpoints {
            self.add_doh_endpoint(&handle, path, recv_cb)?;
        }
        Ok(handle)
    }

    /// Registers an additional DoH endpoint on an existing HTTP listener
    /// (§6 `add_doh_endpoint`).
    pub fn add_doh_endpoint(&self, listener: &Handle, path: String, recv_cb: DohRecvCb) -> Result<()> {
        let (reply, rx) = reply_channel();
        self.sender(listener.id().worker())
            .send(NetEvent::AddDohEndpoint { listener: listener.id(), path, recv_cb, reply });
        await_reply(rx)
    }

    /// Stops a listener and every connection it spawned (§6
    /// `stop_listening`); idempotent from the caller's point of view.
    /// Cascades to every `SO_REUSEPORT` replica bound alongside `handle`.
    pub fn stop_listening(&self, handle: &Handle) -> Result<()> {
        let id = handle.id();
        let (reply, rx) = reply_channel();
        self.sender(id.worker()).send(NetEvent::StopListening { socket: id, reply });
        let result = await_reply(rx);

        let replicas = self.replicas.lock().unwrap().remove(&id);
        if let Some(replicas) = replicas {
            close_all(&replicas);
        }
        result
    }

    /// Initiates a plaintext TCP connect (§6 `connect_tcp`).
    pub fn connect_tcp(
        &self,
        local: Option<SocketAddr>,
        peer: SocketAddr,
        cb: ConnectCb,
        timeout: Duration,
    ) -> Result<Handle> {
        let idx = self.pick_worker();
        let (reply, rx) = reply_channel();
        self.sender(idx).send(NetEvent::ConnectTcp(ConnectTcpRequest {
            addr: peer,
            local,
            timeout,
            connect_cb: cb,
            reply,
        }));
        await_reply(rx)
    }

    /// Initiates a TLS connect (§6 `connect_tls`). `server_name` drives
    /// SNI and certificate hostname verification.
    pub fn connect_tls(
        &self,
        local: Option<SocketAddr>,
        peer: SocketAddr,
        cb: ConnectCb,
        tls_ctx: Arc<ClientConfig>,
        server_name: ServerName<'static>,
        timeout: Duration,
    ) -> Result<Handle> {
        let idx = self.pick_worker();
        let (reply, rx) = reply_channel();
        self.sender(idx).send(NetEvent::ConnectTls(ConnectTlsRequest {
            addr: peer,
            local,
            timeout,
            tls_config: tls_ctx,
            server_name,
            connect_cb: cb,
            reply,
        }));
        await_reply(rx)
    }

    /// Resolves `host`, connects (TCP or TLS per the URL's scheme), and
    /// issues one DoH request over an HTTP/2 session promoted in place on
    /// the new connection (§6 `http_connect_send_request`, §4.5).
    ///
    /// `host` is resolved with a blocking [`ToSocketAddrs`] lookup — name
    /// resolution is explicitly out of netmgr's own scope (§1 Non-goals);
    /// callers needing async resolution should pass an address instead of
    /// deferring to this convenience path in a latency-sensitive context.
    pub fn http_connect_send_request(
        &self,
        target_url: &str,
        method: DohMethod,
        body: Vec<u8>,
        recv_cb: DohClientCb,
        tls_ctx: Option<Arc<ClientConfig>>,
        timeout: Duration,
    ) -> Result<()> {
        let target = url::parse_url(target_url)?;
        if target.use_tls != tls_ctx.is_some() {
            return Err(NetError::InvalidProto(
                "https url requires a tls_ctx (and http forbids one)",
            ));
        }

        let peer = resolve_one(&target.host, target.port)?;
        let authority = authority_for(&target);
        let request = DohRequest {
            authority,
            path: target.path.clone(),
            dns_message: body,
            use_post: matches!(method, DohMethod::Post),
            cb: recv_cb,
        };

        match tls_ctx {
            Some(tls_ctx) => {
                let server_name = ServerName::try_from(target.host.clone())
                    .map_err(|_| NetError::InvalidProto("doh url host is not a valid tls server name"))?;
                self.connect_then_send(request, move |mgr, cb| {
                    mgr.connect_tls(None, peer, cb, tls_ctx, server_name, timeout)
                })
            }
            None => self.connect_then_send(request, move |mgr, cb| mgr.connect_tcp(None, peer, cb, timeout)),
        }
    }

    fn connect_then_send(
        &self,
        request: DohRequest,
        connect: impl FnOnce(&Self, ConnectCb) -> Result<Handle>,
    ) -> Result<()> {
        let request = Arc::new(Mutex::new(Some(request)));
        let for_cb = request.clone();
        let connect_cb: ConnectCb = Box::new(move |handle, result| match result {
            Ok(()) => {
                if let Some(request) = for_cb.lock().unwrap().take() {
                    handle.send(NetEvent::SendDohRequest { socket: handle.id(), request });
                }
            }
            Err(e) => {
                if let Some(request) = for_cb.lock().unwrap().take() {
                    (request.cb)(Err(e));
                }
            }
        });
        connect(self, connect_cb)?;
        Ok(())
    }

    fn register_replica_group(&self, mut handles: Vec<Handle>) -> Handle {
        let primary = handles.remove(0);
        if !handles.is_empty() {
            self.replicas.lock().unwrap().insert(primary.id(), handles);
        }
        primary
    }

    /// Initiates shutdown of every socket the manager owns (§6
    /// `closedown`). Returns once every worker has applied the stop
    /// request; outstanding sockets finish closing asynchronously as their
    /// workers drain remaining I/O.
    pub fn closedown(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        for worker in &self.workers {
            let (reply, rx) = reply_channel();
            worker.sender.send(NetEvent::Stop { reply });
            let _ = await_reply(rx);
        }
    }

    /// Finalizes the manager after [`Self::closedown`]: joins every worker
    /// thread. Blocks until each worker's event loop has exited.
    pub fn destroy(mut self) {
        if !self.closing.load(Ordering::SeqCst) {
            self.closedown();
        }
        for worker in &mut self.workers {
            if let Some(join) = worker.join.take() {
                let _ = join.join();
            }
        }
    }
}

fn close_all(handles: &[Handle]) {
    for handle in handles {
        handle.send(NetEvent::Close { socket: handle.id() });
    }
}

fn resolve_one(host: &str, port: u16) -> Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()
        .map_err(NetError::Io)?
        .next()
        .ok_or(NetError::InvalidProto("doh url host did not resolve to any address"))
}

fn authority_for(target: &url::DohUrl) -> String {
    let default_port = if target.use_tls { 443 } else { 80 };
    if target.port == default_port {
        target.host.clone()
    } else {
        format!("{}:{}", target.host, target.port)
    }
}

impl Drop for NetworkManager {
    fn drop(&mut self) {
        if !self.closing.load(Ordering::SeqCst) {
            self.closedown();
        }
        for worker in &mut self.workers {
            if let Some(join) = worker.join.take() {
                let _ = join.join();
            }
        }
    }
}
