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

//! HTTP/2 DoH listener and session dispatch (§4.5).
//!
//! A server-side session owns its carrier directly, same as a TLS
//! connection: either a raw `mio::net::TcpStream` (h2c) or a `rustls`
//! engine plus the stream it drives (h2). A client-side session is born by
//! *promoting* an already-connected [`crate::socket::TcpConnState`] or
//! [`crate::socket::TlsConnState`] in place, under its existing slab key
//! and `mio` registration, once the carrier handshake (if any) has already
//! completed: the one-shot client API issues a raw connect first, then
//! converts the result into a multiplexed session before sending its first
//! request.

use std::collections::{HashMap, VecDeque};
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;

use log::warn;
use mio::Interest;
use rustls::ServerConnection;

use crate::error::{NetError, Result};
use crate::event::{DohRequest, ListenHttpRequest, NetEvent};
use crate::handle::Handle;
use crate::http::doh;
use crate::http::session::{Http2Event, Http2Session};
use crate::net::tcp_listener::{bind_with_fallback, TcpListener as _};
use crate::quota::{Attach, Quota};
use crate::socket::{
    DohEndpoint, DohRecvCb, HttpCarrier, HttpListenerState, HttpSocketState, RecvResult, SendCb, Socket,
    SocketId, SocketKind, TlsEngine,
};
use crate::timer::TimerKind;
use crate::worker::Worker;

const READ_CHUNK: usize = 16 * 1024;

/// Binds and registers an HTTP/2 DoH listener. `req.tls_config` selects h2
/// (TLS, ALPN `h2` required) vs h2c (plaintext).
pub fn listen(worker: &mut Worker, req: ListenHttpRequest) {
    let mut listener = match bind_with_fallback(req.addr, req.backlog, req.reuseport) {
        Ok(l) => l,
        Err(e) => {
            let _ = req.reply.send(Err(e));
            return;
        }
    };

    let key = worker.sockets().vacant_entry().key();
    let id = SocketId::new(worker.idx(), key);
    {
        let (_, registry) = worker.sockets_and_registry();
        if let Err(e) = registry.register(&mut listener, id.token(), Interest::READABLE) {
            let _ = req.reply.send(Err(e.into()));
            return;
        }
    }

    let local_addr = listener.local_addr().ok();
    let state = HttpListenerState {
        inner: listener,
        tls_ctx: req.tls_config,
        endpoints: Vec::new(),
        max_concurrent_streams: req.max_concurrent_streams,
        quota: req.quota,
        backlog: req.backlog,
        children: Vec::new(),
    };
    let mut socket = Socket::new(id, SocketKind::HttpListener(state));
    socket.shared.flags().set_listening(true);
    socket.shared.set_addrs(local_addr, None);
    let shared = socket.shared.clone();

    let entry = worker.sockets().vacant_entry();
    debug_assert_eq!(entry.key(), key);
    entry.insert(socket);

    let handle = Handle::from_existing(shared, worker.event_sender());
    let _ = req.reply.send(Ok(handle));
}

/// Registers a path-keyed endpoint on an existing HTTP listener.
pub fn add_endpoint(worker: &mut Worker, listener: SocketId, path: String, recv_cb: DohRecvCb) -> Result<()> {
    match worker.sockets().get_mut(listener.key()) {
        Some(s) => match &mut s.kind {
            SocketKind::HttpListener(l) => {
                l.endpoints.push(DohEndpoint { path, recv_cb });
                Ok(())
            }
            _ => Err(NetError::NotConnected),
        },
        None => Err(NetError::NotConnected),
    }
}

/// Drains ready connections on an HTTP listener, gated by quota exactly as
/// the plaintext and TLS accept loops are (§4.6).
pub fn accept_loop(worker: &mut Worker, id: SocketId) {
    loop {
        let quota = match listener_quota(worker, id) {
            Some(q) => q,
            None => return,
        };

        if let Some(q) = &quota {
            let sender = worker.event_sender();
            let outcome = q.attach_cb(move || sender.send(NetEvent::QuotaRetryAccept { listener: id }));
            if outcome == Attach::Queued {
                pause_listener(worker, id);
                return;
            }
        }

        let accept_result = match worker.sockets().get_mut(id.key()) {
            Some(s) => match &mut s.kind {
                SocketKind::HttpListener(l) => l.inner.accept(),
                _ => return,
            },
            None => return,
        };

        match accept_result {
            Ok((stream, peer_addr)) => spawn_session(worker, id, stream, peer_addr, quota.clone()),
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                if let Some(q) = &quota {
                    q.detach();
                }
                return;
            }
            Err(e) => {
                if let Some(q) = &quota {
                    q.detach();
                }
                record_accept_failure(worker, id);
                warn!("http accept failed: {e}");
                return;
            }
        }
    }
}

/// Re-accepts exactly once using the slot a quota waiter callback already
/// reserved, then resumes the normal accept loop for anything further
/// already queued in the backlog.
pub fn retry_accept(worker: &mut Worker, id: SocketId) {
    resume_listener(worker, id);

    let quota = match listener_quota(worker, id) {
        Some(q) => q,
        None => return,
    };
    let accept_result = match worker.sockets().get_mut(id.key()) {
        Some(s) => match &mut s.kind {
            SocketKind::HttpListener(l) => l.inner.accept(),
            _ => return,
        },
        None => return,
    };
    match accept_result {
        Ok((stream, peer_addr)) => spawn_session(worker, id, stream, peer_addr, quota.clone()),
        Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
            if let Some(q) = &quota {
                q.detach();
            }
        }
        Err(e) => {
            if let Some(q) = &quota {
                q.detach();
            }
            record_accept_failure(worker, id);
            warn!("http retry accept failed: {e}");
        }
    }

    accept_loop(worker, id);
}

fn listener_quota(worker: &mut Worker, id: SocketId) -> Option<Option<Arc<Quota>>> {
    worker.sockets().get(id.key()).map(|s| match &s.kind {
        SocketKind::HttpListener(l) => l.quota.clone(),
        _ => None,
    })
}

fn pause_listener(worker: &mut Worker, id: SocketId) {
    let (sockets, registry) = worker.sockets_and_registry();
    if let Some(socket) = sockets.get_mut(id.key()) {
        if let SocketKind::HttpListener(l) = &mut socket.kind {
            let _ = registry.deregister(&mut l.inner);
        }
    }
}

fn resume_listener(worker: &mut Worker, id: SocketId) {
    let (sockets, registry) = worker.sockets_and_registry();
    if let Some(socket) = sockets.get_mut(id.key()) {
        if let SocketKind::HttpListener(l) = &mut socket.kind {
            let _ = registry.register(&mut l.inner, id.token(), Interest::READABLE);
        }
    }
}

fn record_accept_failure(worker: &mut Worker, id: SocketId) {
    if let Some(socket) = worker.sockets().get(id.key()) {
        socket.shared.accept_failures.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }
}

fn spawn_session(
    worker: &mut Worker,
    listener_id: SocketId,
    mut stream: mio::net::TcpStream,
    peer_addr: SocketAddr,
    quota: Option<Arc<Quota>>,
) {
    let (tls_ctx, max_streams) = match worker.sockets().get(listener_id.key()) {
        Some(s) => match &s.kind {
            SocketKind::HttpListener(l) => (l.tls_ctx.clone(), l.max_concurrent_streams),
            _ => {
                if let Some(q) = &quota {
                    q.detach();
                }
                return;
            }
        },
        None => {
            if let Some(q) = &quota {
                q.detach();
            }
            return;
        }
    };

    let key = worker.sockets().vacant_entry().key();
    let conn_id = SocketId::new(worker.idx(), key);
    {
        let (_, registry) = worker.sockets_and_registry();
        if let Err(e) = registry.register(&mut stream, conn_id.token(), Interest::READABLE | Interest::WRITABLE) {
            warn!("failed to register accepted http connection: {e}");
            if let Some(q) = &quota {
                q.detach();
            }
            return;
        }
    }

    let local_addr = stream.local_addr().ok();
    let is_tls = tls_ctx.is_some();
    let carrier = match tls_ctx {
        Some(ctx) => match ServerConnection::new(ctx) {
            Ok(c) => HttpCarrier::Tls { engine: TlsEngine::Server(Box::new(c)), stream },
            Err(e) => {
                warn!("http tls server connection setup failed: {e}");
                if let Some(q) = &quota {
                    q.detach();
                }
                return;
            }
        },
        None => HttpCarrier::Plain(stream),
    };

    let state = HttpSocketState {
        carrier,
        session: Http2Session::new(true, max_streams),
        listener: Some(listener_id),
        client_requests: HashMap::new(),
        pending_responses: VecDeque::new(),
        streams: HashMap::new(),
        outbound: Vec::new(),
        static_handle: None,
        quota,
    };
    let mut socket = Socket::new(conn_id, SocketKind::HttpSocket(state));
    socket.server = Some(listener_id);
    socket.shared.flags().set_connecting(is_tls);
    socket.shared.flags().set_connected(!is_tls);
    socket.shared.set_addrs(local_addr, Some(peer_addr));

    let entry = worker.sockets().vacant_entry();
    debug_assert_eq!(entry.key(), key);
    entry.insert(socket);

    if let Some(listener_socket) = worker.sockets().get_mut(listener_id.key()) {
        if let SocketKind::HttpListener(l) = &mut listener_socket.kind {
            l.children.push(conn_id);
        }
    }

    if is_tls {
        let timeout = worker.config().connect_timeout();
        worker.timers().arm(conn_id, TimerKind::Connect, timeout);
        process_tls(worker, conn_id);
    } else {
        let timeout = worker.config().read_timeout(false);
        worker.timers().arm(conn_id, TimerKind::Read, timeout);
        prime_session(worker, conn_id);
    }
}

/// Issues one DoH request, promoting an already-connected plaintext or TLS
/// carrier into a client session in place if it is not one already.
pub fn send_request(worker: &mut Worker, id: SocketId, request: DohRequest) {
    let DohRequest { authority, path, dns_message, use_post, cb } = request;

    let already_http =
        worker.sockets().get(id.key()).map(|s| matches!(&s.kind, SocketKind::HttpSocket(_))).unwrap_or(false);
    if !already_http && !promote_to_client_session(worker, id) {
        cb(Err(NetError::NotConnected));
        return;
    }

    let encoded = {
        let Some(socket) = worker.sockets().get_mut(id.key()) else {
            cb(Err(NetError::NotConnected));
            return;
        };
        let SocketKind::HttpSocket(h) = &mut socket.kind else {
            cb(Err(NetError::NotConnected));
            return;
        };
        if use_post {
            h.session.encode_post_request(&authority, &path, &dns_message)
        } else {
            let get_path = doh::get_path(&path, &dns_message);
            h.session.encode_get_request(&authority, &get_path)
        }
    };
    let (stream_id, bytes) = encoded;

    if let Some(socket) = worker.sockets().get_mut(id.key()) {
        if let SocketKind::HttpSocket(h) = &mut socket.kind {
            h.client_requests.insert(stream_id, cb);
            h.outbound.extend_from_slice(&bytes);
        }
    }
    flush_outbound(worker, id);
}

/// Converts an already-connected `TcpConnected`/`TlsConnected` socket into
/// an `HttpSocket` client session under the same slab key and `mio`
/// registration, reusing the carrier stream it already owns.
fn promote_to_client_session(worker: &mut Worker, id: SocketId) -> bool {
    let key = id.key();
    let Some(old) = worker.sockets().try_remove(key) else { return false };
    let shared = old.shared.clone();
    let server = old.server;

    let carrier = match old.kind {
        SocketKind::TcpConnected(c) => HttpCarrier::Plain(c.stream),
        SocketKind::TlsConnected(c) => HttpCarrier::Tls { engine: c.engine, stream: c.stream },
        other => {
            let entry = worker.sockets().vacant_entry();
            debug_assert_eq!(entry.key(), key);
            entry.insert(Socket { shared, server, kind: other });
            return false;
        }
    };

    let max_streams = worker.config().http2_max_concurrent_streams;
    let state = HttpSocketState {
        carrier,
        session: Http2Session::new(false, max_streams),
        listener: None,
        client_requests: HashMap::new(),
        pending_responses: VecDeque::new(),
        streams: HashMap::new(),
        outbound: Vec::new(),
        static_handle: None,
        quota: None,
    };
    let entry = worker.sockets().vacant_entry();
    debug_assert_eq!(entry.key(), key);
    entry.insert(Socket { shared, server, kind: SocketKind::HttpSocket(state) });

    prime_session(worker, id);
    true
}

/// Dispatches a readable wakeup to whichever kind owns `id`.
pub fn on_readable(worker: &mut Worker, id: SocketId) {
    match worker.sockets().get(id.key()).map(|s| matches!(&s.kind, SocketKind::HttpListener(_))) {
        Some(true) => accept_loop(worker, id),
        Some(false) => on_socket_readable(worker, id),
        None => {}
    }
}

fn on_socket_readable(worker: &mut Worker, id: SocketId) {
    let is_tls = worker
        .sockets()
        .get(id.key())
        .map(|s| matches!(&s.kind, SocketKind::HttpSocket(h) if matches!(h.carrier, HttpCarrier::Tls { .. })))
        .unwrap_or(false);
    if is_tls {
        read_tls_carrier(worker, id);
    } else {
        read_plain_carrier(worker, id);
    }
}

enum ReadOutcome {
    Data(Vec<u8>),
    Eof,
    WouldBlock,
    Failed(NetError),
}

fn read_plain_carrier(worker: &mut Worker, id: SocketId) {
    loop {
        let outcome = {
            use std::borrow::BorrowMut;
            let (sockets, recv_buf) = worker.sockets_and_recv_buf();
            let Some(socket) = sockets.get_mut(id.key()) else { return };
            let SocketKind::HttpSocket(h) = &mut socket.kind else { return };
            let HttpCarrier::Plain(stream) = &mut h.carrier else { return };
            let buf = recv_buf.checkout();
            if buf.remaining_mut() < READ_CHUNK {
                buf.reserve(READ_CHUNK);
            }
            let result = std::io::Read::read(stream, buf.borrow_mut());
            let outcome = match result {
                Ok(0) => ReadOutcome::Eof,
                Ok(n) => {
                    buf.mark_written(n);
                    let data: &[u8] = &*buf;
                    let copied = data.to_vec();
                    buf.mark_read(n);
                    ReadOutcome::Data(copied)
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => ReadOutcome::WouldBlock,
                Err(e) => ReadOutcome::Failed(e.into()),
            };
            recv_buf.release();
            outcome
        };

        match outcome {
            ReadOutcome::WouldBlock => return,
            ReadOutcome::Data(bytes) => {
                feed_session(worker, id, &bytes);
                let timeout = worker.config().read_timeout(false);
                worker.timers().arm(id, TimerKind::Read, timeout);
            }
            ReadOutcome::Eof | ReadOutcome::Failed(_) => {
                close_from_peer(worker, id);
                return;
            }
        }
    }
}

enum CipherOutcome {
    Progressed,
    WouldBlock,
    Eof,
    Failed(NetError),
}

fn read_tls_carrier(worker: &mut Worker, id: SocketId) {
    let outcome = {
        let Some(socket) = worker.sockets().get_mut(id.key()) else { return };
        let SocketKind::HttpSocket(h) = &mut socket.kind else { return };
        let HttpCarrier::Tls { engine, stream } = &mut h.carrier else { return };
        match engine.read_tls(stream) {
            Ok(0) => CipherOutcome::Eof,
            Ok(_) => CipherOutcome::Progressed,
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => CipherOutcome::WouldBlock,
            Err(e) => CipherOutcome::Failed(e.into()),
        }
    };

    match outcome {
        CipherOutcome::WouldBlock => {}
        CipherOutcome::Progressed => process_tls(worker, id),
        CipherOutcome::Eof | CipherOutcome::Failed(_) => close_from_peer(worker, id),
    }
}

fn process_tls(worker: &mut Worker, id: SocketId) {
    let (was_handshaking, result) = {
        let Some(socket) = worker.sockets().get_mut(id.key()) else { return };
        let SocketKind::HttpSocket(h) = &mut socket.kind else { return };
        let HttpCarrier::Tls { engine, .. } = &mut h.carrier else { return };
        let was = engine.is_handshaking();
        (was, engine.process_new_packets())
    };

    let io_state = match result {
        Ok(s) => s,
        Err(e) => {
            warn!("http tls record error: {e}");
            close_from_peer(worker, id);
            return;
        }
    };

    flush_ciphertext(worker, id);

    let now_handshaking = worker
        .sockets()
        .get(id.key())
        .map(|s| match &s.kind {
            SocketKind::HttpSocket(h) => match &h.carrier {
                HttpCarrier::Tls { engine, .. } => engine.is_handshaking(),
                HttpCarrier::Plain(_) => false,
            },
            _ => true,
        })
        .unwrap_or(true);

    if was_handshaking && !now_handshaking {
        complete_tls_handshake(worker, id);
    }

    if io_state.plaintext_bytes_to_read() > 0 {
        drain_tls_plaintext(worker, id);
    }
}

fn complete_tls_handshake(worker: &mut Worker, id: SocketId) {
    let alpn_ok = worker
        .sockets()
        .get(id.key())
        .map(|s| match &s.kind {
            SocketKind::HttpSocket(h) => match &h.carrier {
                HttpCarrier::Tls { engine, .. } => engine.alpn_protocol() == Some(b"h2"),
                HttpCarrier::Plain(_) => false,
            },
            _ => false,
        })
        .unwrap_or(false);

    if !alpn_ok {
        warn!("http tls session did not negotiate h2");
        close_from_peer(worker, id);
        return;
    }

    worker.timers().cancel(id, TimerKind::Connect);
    if let Some(socket) = worker.sockets().get(id.key()) {
        socket.shared.flags().set_connecting(false);
        socket.shared.flags().set_connected(true);
    }
    let timeout = worker.config().read_timeout(false);
    worker.timers().arm(id, TimerKind::Read, timeout);
    prime_session(worker, id);
}

enum PlaintextOutcome {
    Data(Vec<u8>),
    Drained,
    Eof,
    Failed(NetError),
}

fn drain_tls_plaintext(worker: &mut Worker, id: SocketId) {
    loop {
        let outcome = {
            use std::borrow::BorrowMut;
            let (sockets, recv_buf) = worker.sockets_and_recv_buf();
            let Some(socket) = sockets.get_mut(id.key()) else { return };
            let SocketKind::HttpSocket(h) = &mut socket.kind else { return };
            let HttpCarrier::Tls { engine, .. } = &mut h.carrier else { return };
            let buf = recv_buf.checkout();
            if buf.remaining_mut() < READ_CHUNK {
                buf.reserve(READ_CHUNK);
            }
            let mut reader = engine.reader();
            let result = std::io::Read::read(&mut reader, buf.borrow_mut());
            let outcome = match result {
                Ok(0) => PlaintextOutcome::Eof,
                Ok(n) => {
                    buf.mark_written(n);
                    let copied: Vec<u8> = (&*buf).to_vec();
                    buf.mark_read(n);
                    PlaintextOutcome::Data(copied)
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => PlaintextOutcome::Drained,
                Err(e) => PlaintextOutcome::Failed(e.into()),
            };
            recv_buf.release();
            outcome
        };

        match outcome {
            PlaintextOutcome::Drained => return,
            PlaintextOutcome::Eof => {
                close_from_peer(worker, id);
                return;
            }
            PlaintextOutcome::Data(bytes) => {
                feed_session(worker, id, &bytes);
                let timeout = worker.config().read_timeout(false);
                worker.timers().arm(id, TimerKind::Read, timeout);
            }
            PlaintextOutcome::Failed(_) => {
                close_from_peer(worker, id);
                return;
            }
        }
    }
}

fn feed_session(worker: &mut Worker, id: SocketId, bytes: &[u8]) {
    let result = {
        let Some(socket) = worker.sockets().get_mut(id.key()) else { return };
        let SocketKind::HttpSocket(h) = &mut socket.kind else { return };
        h.session.receive(bytes)
    };
    match result {
        Ok(events) => {
            for event in events {
                handle_http2_event(worker, id, event);
            }
        }
        Err(e) => {
            warn!("http/2 framing error: {e}");
            close_from_peer(worker, id);
        }
    }
}

fn handle_http2_event(worker: &mut Worker, id: SocketId, event: Http2Event) {
    match event {
        Http2Event::Ready => {}
        Http2Event::Ping => {
            let ack = worker
                .sockets()
                .get(id.key())
                .and_then(|s| match &s.kind {
                    SocketKind::HttpSocket(h) => Some(h.session.encode_ping_ack()),
                    _ => None,
                })
                .unwrap_or_default();
            if let Some(socket) = worker.sockets().get_mut(id.key()) {
                if let SocketKind::HttpSocket(h) = &mut socket.kind {
                    h.outbound.extend_from_slice(&ack);
                }
            }
            flush_outbound(worker, id);
        }
        Http2Event::GoAway => close_from_peer(worker, id),
        Http2Event::StreamReset { stream_id } => {
            let cb = worker.sockets().get_mut(id.key()).and_then(|s| match &mut s.kind {
                SocketKind::HttpSocket(h) => {
                    h.streams.remove(&stream_id);
                    h.pending_responses.retain(|s| *s != stream_id);
                    h.client_requests.remove(&stream_id)
                }
                _ => None,
            });
            if let Some(cb) = cb {
                cb(Err(NetError::Canceled));
            }
        }
        Http2Event::RequestHeaders { stream_id, method, path, end_stream } => {
            if let Some(socket) = worker.sockets().get_mut(id.key()) {
                if let SocketKind::HttpSocket(h) = &mut socket.kind {
                    let entry = h.streams.entry(stream_id).or_default();
                    entry.method = method;
                    entry.path = path;
                }
            }
            if end_stream {
                dispatch_request(worker, id, stream_id);
            }
        }
        Http2Event::ResponseHeaders { stream_id, status, content_type, end_stream } => {
            if let Some(socket) = worker.sockets().get_mut(id.key()) {
                if let SocketKind::HttpSocket(h) = &mut socket.kind {
                    let entry = h.streams.entry(stream_id).or_default();
                    entry.status = status;
                    entry.content_type = content_type;
                }
            }
            if end_stream {
                dispatch_response(worker, id, stream_id);
            }
        }
        Http2Event::StreamRefused { stream_id } => refuse_stream(worker, id, stream_id),
        Http2Event::Data { stream_id, bytes, end_stream } => {
            let is_server = worker
                .sockets()
                .get(id.key())
                .map(|s| match &s.kind {
                    SocketKind::HttpSocket(h) => h.listener.is_some(),
                    _ => false,
                })
                .unwrap_or(false);
            if let Some(socket) = worker.sockets().get_mut(id.key()) {
                if let SocketKind::HttpSocket(h) = &mut socket.kind {
                    h.streams.entry(stream_id).or_default().body.extend_from_slice(&bytes);
                }
            }
            if end_stream {
                if is_server {
                    dispatch_request(worker, id, stream_id);
                } else {
                    dispatch_response(worker, id, stream_id);
                }
            }
        }
    }
}

fn dispatch_request(worker: &mut Worker, id: SocketId, stream_id: u32) {
    let buf = worker.sockets().get_mut(id.key()).and_then(|s| match &mut s.kind {
        SocketKind::HttpSocket(h) => h.streams.remove(&stream_id),
        _ => None,
    });
    let Some(buf) = buf else { return };

    let message = match doh::extract_request_message(&buf.method, &buf.path, &buf.body) {
        Ok(m) => m,
        Err(_) => {
            respond_error(worker, id, stream_id, 400);
            return;
        }
    };

    let base_path = doh::split_path(&buf.path).0.to_string();
    let listener_id = worker.sockets().get(id.key()).and_then(|s| match &s.kind {
        SocketKind::HttpSocket(h) => h.listener,
        _ => None,
    });
    let Some(listener_id) = listener_id else {
        respond_error(worker, id, stream_id, 404);
        return;
    };

    let Some(handle) = worker.new_handle(id) else { return };
    let dispatched = match worker.sockets().get_mut(listener_id.key()) {
        Some(s) => match &mut s.kind {
            SocketKind::HttpListener(l) => match l.endpoints.iter_mut().find(|e| e.path == base_path) {
                Some(endpoint) => {
                    (endpoint.recv_cb)(handle, RecvResult::Success(&message));
                    true
                }
                None => false,
            },
            _ => false,
        },
        None => false,
    };

    if dispatched {
        if let Some(socket) = worker.sockets().get_mut(id.key()) {
            if let SocketKind::HttpSocket(h) = &mut socket.kind {
                h.pending_responses.push_back(stream_id);
            }
        }
    } else {
        respond_error(worker, id, stream_id, 404);
    }
}

fn dispatch_response(worker: &mut Worker, id: SocketId, stream_id: u32) {
    let buf = worker.sockets().get_mut(id.key()).and_then(|s| match &mut s.kind {
        SocketKind::HttpSocket(h) => {
            h.session.close_stream(stream_id);
            h.streams.remove(&stream_id)
        }
        _ => None,
    });
    let Some(buf) = buf else { return };

    let cb = worker.sockets().get_mut(id.key()).and_then(|s| match &mut s.kind {
        SocketKind::HttpSocket(h) => h.client_requests.remove(&stream_id),
        _ => None,
    });
    let Some(cb) = cb else { return };

    if buf.status != 200 {
        cb(Err(NetError::InvalidProto("doh response did not return status 200")));
    } else if buf.content_type != "application/dns-message" {
        cb(Err(NetError::InvalidProto("doh response content-type was not application/dns-message")));
    } else {
        cb(Ok(buf.body));
    }
}

/// Refuses a stream that arrived once `max_concurrent_streams` was already
/// reached (§4.5): RST_STREAM(REFUSED_STREAM), never dispatched.
fn refuse_stream(worker: &mut Worker, id: SocketId, stream_id: u32) {
    let bytes = worker.sockets().get_mut(id.key()).and_then(|s| match &mut s.kind {
        SocketKind::HttpSocket(h) => Some(h.session.encode_refused_stream(stream_id)),
        _ => None,
    });
    let Some(bytes) = bytes else { return };
    if let Some(socket) = worker.sockets().get_mut(id.key()) {
        if let SocketKind::HttpSocket(h) = &mut socket.kind {
            h.outbound.extend_from_slice(&bytes);
        }
    }
    flush_outbound(worker, id);
}

fn respond_error(worker: &mut Worker, id: SocketId, stream_id: u32, status: u16) {
    let bytes = {
        let Some(socket) = worker.sockets().get_mut(id.key()) else { return };
        let SocketKind::HttpSocket(h) = &mut socket.kind else { return };
        h.session.close_stream(stream_id);
        h.session.encode_error_response(stream_id, status)
    };
    if let Some(socket) = worker.sockets().get_mut(id.key()) {
        if let SocketKind::HttpSocket(h) = &mut socket.kind {
            h.outbound.extend_from_slice(&bytes);
        }
    }
    flush_outbound(worker, id);
}

fn prime_session(worker: &mut Worker, id: SocketId) {
    let bytes = {
        let Some(socket) = worker.sockets().get_mut(id.key()) else { return };
        let SocketKind::HttpSocket(h) = &mut socket.kind else { return };
        h.session.initial_bytes()
    };
    if let Some(socket) = worker.sockets().get_mut(id.key()) {
        if let SocketKind::HttpSocket(h) = &mut socket.kind {
            h.outbound.extend_from_slice(&bytes);
        }
    }
    flush_outbound(worker, id);
}

/// Handles a writable wakeup: completes a pending TLS carrier handshake's
/// write side, or flushes queued session output.
pub fn on_writable(worker: &mut Worker, id: SocketId) {
    let is_listener =
        worker.sockets().get(id.key()).map(|s| matches!(&s.kind, SocketKind::HttpListener(_))).unwrap_or(false);
    if is_listener {
        return;
    }

    let connecting = worker.sockets().get(id.key()).map(|s| s.shared.flags().connecting()).unwrap_or(false);
    if connecting {
        let carrier_err = worker.sockets().get_mut(id.key()).and_then(|s| match &mut s.kind {
            SocketKind::HttpSocket(h) => match &mut h.carrier {
                HttpCarrier::Tls { stream, .. } => stream.take_error().ok().flatten(),
                HttpCarrier::Plain(_) => None,
            },
            _ => None,
        });
        if let Some(e) = carrier_err {
            warn!("http carrier connect failed: {e}");
            close_from_peer(worker, id);
            return;
        }
        process_tls(worker, id);
        return;
    }
    flush_outbound(worker, id);
}

/// Queues a DoH response: answers the oldest server-side stream still
/// awaiting one (I8: each pop retires exactly one request).
pub fn queue_send(worker: &mut Worker, id: SocketId, data: Vec<u8>, cb: Option<SendCb>) {
    let stream_id = worker.sockets().get_mut(id.key()).and_then(|s| match &mut s.kind {
        SocketKind::HttpSocket(h) => h.pending_responses.pop_front(),
        _ => None,
    });
    let Some(stream_id) = stream_id else {
        if let Some(cb) = cb {
            if let Some(handle) = worker.new_handle(id) {
                cb(handle, Err(NetError::Failure("no pending doh request to respond to")));
            }
        }
        return;
    };

    let bytes = worker.sockets().get_mut(id.key()).and_then(|s| match &mut s.kind {
        SocketKind::HttpSocket(h) => {
            h.session.close_stream(stream_id);
            Some(h.session.encode_response(stream_id, &data))
        }
        _ => None,
    });
    let Some(bytes) = bytes else { return };

    if let Some(socket) = worker.sockets().get_mut(id.key()) {
        if let SocketKind::HttpSocket(h) = &mut socket.kind {
            h.outbound.extend_from_slice(&bytes);
        }
    }
    if let Some(cb) = cb {
        if let Some(handle) = worker.new_handle(id) {
            cb(handle, Ok(()));
        }
    }
    flush_outbound(worker, id);
}

enum DrainOutcome {
    Idle,
    Partial,
    WouldBlock,
    Failed(NetError),
}

fn flush_outbound(worker: &mut Worker, id: SocketId) {
    loop {
        let outcome = {
            let Some(socket) = worker.sockets().get_mut(id.key()) else { return };
            let SocketKind::HttpSocket(h) = &mut socket.kind else { return };
            if h.outbound.is_empty() {
                DrainOutcome::Idle
            } else {
                match &mut h.carrier {
                    HttpCarrier::Plain(stream) => match std::io::Write::write(stream, &h.outbound) {
                        Ok(n) if n == h.outbound.len() => {
                            h.outbound.clear();
                            DrainOutcome::Idle
                        }
                        Ok(n) => {
                            h.outbound.drain(0..n);
                            DrainOutcome::Partial
                        }
                        Err(ref e) if e.kind() == ErrorKind::WouldBlock => DrainOutcome::WouldBlock,
                        Err(e) => DrainOutcome::Failed(e.into()),
                    },
                    HttpCarrier::Tls { engine, .. } => {
                        let taken = std::mem::take(&mut h.outbound);
                        match std::io::Write::write_all(&mut engine.writer(), &taken) {
                            Ok(()) => DrainOutcome::Idle,
                            Err(e) => DrainOutcome::Failed(e.into()),
                        }
                    }
                }
            }
        };

        match outcome {
            DrainOutcome::Idle | DrainOutcome::WouldBlock => break,
            DrainOutcome::Partial => continue,
            DrainOutcome::Failed(e) => {
                warn!("http carrier write failed: {e}");
                close_from_peer(worker, id);
                return;
            }
        }
    }
    flush_ciphertext(worker, id);
}

enum FlushOutcome {
    Idle,
    Progressed,
    WouldBlock,
    Failed(NetError),
}

fn flush_ciphertext(worker: &mut Worker, id: SocketId) {
    loop {
        let outcome = {
            let Some(socket) = worker.sockets().get_mut(id.key()) else { return };
            let SocketKind::HttpSocket(h) = &mut socket.kind else { return };
            let HttpCarrier::Tls { engine, stream } = &mut h.carrier else { return };
            if !engine.wants_write() {
                FlushOutcome::Idle
            } else {
                match engine.write_tls(stream) {
                    Ok(_) => FlushOutcome::Progressed,
                    Err(ref e) if e.kind() == ErrorKind::WouldBlock => FlushOutcome::WouldBlock,
                    Err(e) => FlushOutcome::Failed(e.into()),
                }
            }
        };

        match outcome {
            FlushOutcome::Idle | FlushOutcome::WouldBlock => return,
            FlushOutcome::Progressed => continue,
            FlushOutcome::Failed(e) => {
                warn!("http tls flush failed: {e}");
                close_from_peer(worker, id);
                return;
            }
        }
    }
}

/// Fires on either a handshake-connect timeout or a read-idle timeout.
pub fn on_timeout(worker: &mut Worker, id: SocketId, _kind: TimerKind) {
    close_from_peer(worker, id);
}

fn close_from_peer(worker: &mut Worker, id: SocketId) {
    let began = worker.sockets().get(id.key()).map(|s| s.shared.flags().begin_close()).unwrap_or(false);
    if !began {
        return;
    }
    close_socket_state(worker, id);
    if let Some(s) = worker.sockets().get(id.key()) {
        s.shared.flags().finish_close();
    }
}

/// Closes a listener or a session, depending on which kind `id` names.
/// Called from the generic close path, which has already run
/// `begin_close` on `id` itself.
pub fn close(worker: &mut Worker, id: SocketId) {
    let is_listener =
        worker.sockets().get(id.key()).map(|s| matches!(&s.kind, SocketKind::HttpListener(_))).unwrap_or(false);
    if is_listener {
        close_listener(worker, id);
    } else {
        close_socket_state(worker, id);
    }
}

fn close_listener(worker: &mut Worker, id: SocketId) {
    let children = match worker.sockets().get_mut(id.key()) {
        Some(s) => match &mut s.kind {
            SocketKind::HttpListener(l) => std::mem::take(&mut l.children),
            _ => return,
        },
        None => return,
    };
    {
        let (sockets, registry) = worker.sockets_and_registry();
        if let Some(socket) = sockets.get_mut(id.key()) {
            if let SocketKind::HttpListener(l) = &mut socket.kind {
                let _ = registry.deregister(&mut l.inner);
            }
        }
    }
    for child in children {
        if worker.sockets().get(child.key()).map(|s| s.shared.flags().begin_close()).unwrap_or(false) {
            close_socket_state(worker, child);
            if let Some(s) = worker.sockets().get(child.key()) {
                s.shared.flags().finish_close();
            }
            worker.maybe_destroy(child);
        }
    }
}

fn close_socket_state(worker: &mut Worker, id: SocketId) {
    {
        let (sockets, registry) = worker.sockets_and_registry();
        if let Some(socket) = sockets.get_mut(id.key()) {
            if let SocketKind::HttpSocket(h) = &mut socket.kind {
                match &mut h.carrier {
                    HttpCarrier::Plain(stream) => {
                        let _ = registry.deregister(stream);
                    }
                    HttpCarrier::Tls { stream, .. } => {
                        let _ = registry.deregister(stream);
                    }
                }
            }
        }
    }

    let (client_requests, quota) = match worker.sockets().get_mut(id.key()) {
        Some(s) => match &mut s.kind {
            SocketKind::HttpSocket(h) => (std::mem::take(&mut h.client_requests), h.quota.take()),
            _ => return,
        },
        None => return,
    };
    if let Some(q) = quota {
        q.detach();
    }
    for (_, cb) in client_requests {
        cb(Err(NetError::Canceled));
    }
}
