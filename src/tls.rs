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

//! TLS: a state machine layered over a directly owned TCP carrier (§4.4).
//!
//! Every TLS-connected socket owns its raw `mio::net::TcpStream` and drives
//! a `rustls` engine over it: ciphertext moves between engine and stream,
//! plaintext moves between engine and the worker's shared receive buffer.
//! INIT -> HANDSHAKE -> IO -> (CLOSING -> CLOSED | ERROR), matching
//! `TlsState`.

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;

use log::warn;
use mio::Interest;
use rustls::{ClientConnection, ServerConnection};

use crate::error::{NetError, Result};
use crate::event::{ConnectTlsRequest, ListenTlsRequest, NetEvent};
use crate::handle::Handle;
use crate::net::tcp_listener::{bind_with_fallback, TcpListener as _};
use crate::quota::{Attach, Quota};
use crate::socket::{
    RecvResult, SendCb, Socket, SocketId, SocketKind, TlsConnState, TlsEngine, TlsListenerState, TlsState,
};
use crate::timer::TimerKind;
use crate::worker::Worker;

const READ_CHUNK: usize = 16 * 1024;

/// Binds and registers a TLS listener.
pub fn listen(worker: &mut Worker, req: ListenTlsRequest) {
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
    let state = TlsListenerState {
        inner: listener,
        tls_ctx: req.tls_config,
        accept_cb: req.accept_cb,
        quota: req.quota,
        backlog: req.backlog,
        children: Vec::new(),
        require_alpn_h2: false,
    };
    let mut socket = Socket::new(id, SocketKind::TlsListener(state));
    socket.shared.flags().set_listening(true);
    socket.shared.set_addrs(local_addr, None);
    let shared = socket.shared.clone();

    let entry = worker.sockets().vacant_entry();
    debug_assert_eq!(entry.key(), key);
    entry.insert(socket);

    let handle = Handle::from_existing(shared, worker.event_sender());
    let _ = req.reply.send(Ok(handle));
}

/// Drains ready connections on a TLS listener, gating admission through its
/// quota exactly as the plaintext accept loop does (§4.6).
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
                SocketKind::TlsListener(l) => l.inner.accept(),
                _ => return,
            },
            None => return,
        };

        match accept_result {
            Ok((stream, peer_addr)) => spawn_server_connection(worker, id, stream, peer_addr, quota.clone()),
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
                warn!("tls accept failed: {e}");
                return;
            }
        }
    }
}

/// Re-accepts exactly once using a quota slot a waiter callback already
/// reserved, then falls through to the normal accept loop.
pub fn retry_accept(worker: &mut Worker, id: SocketId) {
    resume_listener(worker, id);
    accept_loop(worker, id);
}

fn listener_quota(worker: &mut Worker, id: SocketId) -> Option<Option<Arc<Quota>>> {
    worker.sockets().get(id.key()).map(|s| match &s.kind {
        SocketKind::TlsListener(l) => l.quota.clone(),
        _ => None,
    })
}

fn pause_listener(worker: &mut Worker, id: SocketId) {
    let (sockets, registry) = worker.sockets_and_registry();
    if let Some(socket) = sockets.get_mut(id.key()) {
        if let SocketKind::TlsListener(l) = &mut socket.kind {
            let _ = registry.deregister(&mut l.inner);
        }
    }
}

fn resume_listener(worker: &mut Worker, id: SocketId) {
    let (sockets, registry) = worker.sockets_and_registry();
    if let Some(socket) = sockets.get_mut(id.key()) {
        if let SocketKind::TlsListener(l) = &mut socket.kind {
            let _ = registry.register(&mut l.inner, id.token(), Interest::READABLE);
        }
    }
}

fn record_accept_failure(worker: &mut Worker, id: SocketId) {
    if let Some(socket) = worker.sockets().get(id.key()) {
        socket.shared.accept_failures.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }
}

fn spawn_server_connection(
    worker: &mut Worker,
    listener_id: SocketId,
    mut stream: mio::net::TcpStream,
    peer_addr: SocketAddr,
    quota: Option<Arc<Quota>>,
) {
    let (tls_ctx, require_alpn_h2) = match worker.sockets().get(listener_id.key()) {
        Some(s) => match &s.kind {
            SocketKind::TlsListener(l) => (l.tls_ctx.clone(), l.require_alpn_h2),
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

    let engine = match ServerConnection::new(tls_ctx) {
        Ok(c) => TlsEngine::Server(Box::new(c)),
        Err(e) => {
            warn!("tls server connection setup failed: {e}");
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
            warn!("failed to register accepted tls connection: {e}");
            if let Some(q) = &quota {
                q.detach();
            }
            return;
        }
    }

    let local_addr = stream.local_addr().ok();
    let state = TlsConnState {
        stream,
        engine,
        state: TlsState::Handshake,
        recv_cb: None,
        connect_cb: None,
        require_alpn_h2,
        static_handle: None,
        quota,
    };
    let mut socket = Socket::new(conn_id, SocketKind::TlsConnected(state));
    socket.server = Some(listener_id);
    socket.shared.flags().set_connecting(true);
    socket.shared.set_addrs(local_addr, Some(peer_addr));
    let shared = socket.shared.clone();

    let entry = worker.sockets().vacant_entry();
    debug_assert_eq!(entry.key(), key);
    entry.insert(socket);

    let timeout = worker.config().connect_timeout();
    worker.timers().arm(conn_id, TimerKind::Connect, timeout);

    if let Some(listener_socket) = worker.sockets().get_mut(listener_id.key()) {
        if let SocketKind::TlsListener(l) = &mut listener_socket.kind {
            l.children.push(conn_id);
        }
    }

    process(worker, conn_id);
}

/// Initiates a TLS client connect: a TCP connect layered with a client
/// handshake once the carrier is writable.
pub fn connect(worker: &mut Worker, req: ConnectTlsRequest) {
    let mut stream = match crate::net::tcp_stream::connect(req.addr, req.local) {
        Ok(s) => s,
        Err(e) => {
            let _ = req.reply.send(Err(e.into()));
            return;
        }
    };

    let engine = match ClientConnection::new(req.tls_config, req.server_name) {
        Ok(c) => TlsEngine::Client(Box::new(c)),
        Err(e) => {
            let _ = req.reply.send(Err(e.into()));
            return;
        }
    };

    let key = worker.sockets().vacant_entry().key();
    let id = SocketId::new(worker.idx(), key);
    {
        let (_, registry) = worker.sockets_and_registry();
        if let Err(e) = registry.register(&mut stream, id.token(), Interest::READABLE | Interest::WRITABLE) {
            let _ = req.reply.send(Err(e.into()));
            return;
        }
    }

    let state = TlsConnState {
        stream,
        engine,
        state: TlsState::Handshake,
        recv_cb: None,
        connect_cb: Some(req.connect_cb),
        require_alpn_h2: false,
        static_handle: None,
        quota: None,
    };
    let mut socket = Socket::new(id, SocketKind::TlsConnected(state));
    socket.shared.flags().set_connecting(true);
    let shared = socket.shared.clone();

    let entry = worker.sockets().vacant_entry();
    debug_assert_eq!(entry.key(), key);
    entry.insert(socket);

    worker.timers().arm(id, TimerKind::Connect, req.timeout);

    let handle = Handle::from_existing(shared, worker.event_sender());
    let _ = req.reply.send(Ok(handle));

    process(worker, id);
}

/// Handles a readable wakeup: reads ciphertext, then drives the engine.
pub fn on_readable(worker: &mut Worker, id: SocketId) {
    let outcome = {
        let Some(socket) = worker.sockets().get_mut(id.key()) else { return };
        let conn = match &mut socket.kind {
            SocketKind::TlsConnected(c) => c,
            _ => return,
        };
        match conn.engine.read_tls(&mut conn.stream) {
            Ok(0) => CipherOutcome::Eof,
            Ok(_) => CipherOutcome::Progressed,
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => CipherOutcome::WouldBlock,
            Err(e) => CipherOutcome::Failed(e.into()),
        }
    };

    match outcome {
        CipherOutcome::WouldBlock => {}
        CipherOutcome::Progressed => process(worker, id),
        CipherOutcome::Eof => fail_connection(worker, id, None),
        CipherOutcome::Failed(e) => fail_connection(worker, id, Some(e)),
    }
}

/// Handles a writable wakeup: flushes queued ciphertext, then completes a
/// pending connect/handshake if this was the first writable event.
pub fn on_writable(worker: &mut Worker, id: SocketId) {
    let connecting = worker.sockets().get(id.key()).map(|s| s.shared.flags().connecting()).unwrap_or(false);
    if connecting {
        let carrier_err = worker.sockets().get_mut(id.key()).and_then(|s| match &mut s.kind {
            SocketKind::TlsConnected(c) => c.stream.take_error().ok().flatten(),
            _ => None,
        });
        if let Some(e) = carrier_err {
            fail_connection(worker, id, Some(e.into()));
            return;
        }
    }
    flush_ciphertext(worker, id);
    process(worker, id);
}

enum CipherOutcome {
    Progressed,
    WouldBlock,
    Eof,
    Failed(NetError),
}

/// Drives `process_new_packets`, flushes any response ciphertext it
/// produced, resolves handshake completion, and drains decrypted plaintext.
fn process(worker: &mut Worker, id: SocketId) {
    let (was_handshaking, result) = {
        let Some(socket) = worker.sockets().get_mut(id.key()) else { return };
        let conn = match &mut socket.kind {
            SocketKind::TlsConnected(c) => c,
            _ => return,
        };
        let was_handshaking = conn.engine.is_handshaking();
        (was_handshaking, conn.engine.process_new_packets())
    };

    let io_state = match result {
        Ok(s) => s,
        Err(e) => {
            fail_connection(worker, id, Some(e.into()));
            return;
        }
    };

    flush_ciphertext(worker, id);

    let now_handshaking = worker
        .sockets()
        .get(id.key())
        .map(|s| match &s.kind {
            SocketKind::TlsConnected(c) => c.engine.is_handshaking(),
            _ => true,
        })
        .unwrap_or(true);

    if was_handshaking && !now_handshaking {
        complete_handshake(worker, id);
    }

    if io_state.plaintext_bytes_to_read() > 0 {
        drain_plaintext(worker, id);
    }
}

fn complete_handshake(worker: &mut Worker, id: SocketId) {
    let (require_h2, alpn_ok) = match worker.sockets().get(id.key()) {
        Some(s) => match &s.kind {
            SocketKind::TlsConnected(c) => {
                let ok = !c.require_alpn_h2 || c.engine.alpn_protocol() == Some(b"h2");
                (c.require_alpn_h2, ok)
            }
            _ => return,
        },
        None => return,
    };

    if require_h2 && !alpn_ok {
        fail_connection(worker, id, Some(NetError::AlpnError));
        return;
    }

    worker.timers().cancel(id, TimerKind::Connect);
    if let Some(socket) = worker.sockets().get(id.key()) {
        socket.shared.flags().set_connecting(false);
        socket.shared.flags().set_connected(true);
    }

    let is_server = worker
        .sockets()
        .get(id.key())
        .map(|s| matches!(&s.kind, SocketKind::TlsConnected(c) if matches!(c.engine, TlsEngine::Server(_))))
        .unwrap_or(false);

    if is_server {
        let listener_id = worker.sockets().get(id.key()).and_then(|s| s.server);
        if let (Some(handle), Some(listener_id)) = (worker.new_handle(id), listener_id) {
            if let Some(listener_socket) = worker.sockets().get_mut(listener_id.key()) {
                if let SocketKind::TlsListener(l) = &mut listener_socket.kind {
                    (l.accept_cb)(handle, Ok(()));
                }
            }
        }
        let timeout = worker.config().read_timeout(false);
        worker.timers().arm(id, TimerKind::Read, timeout);
    } else {
        let cb = worker.sockets().get_mut(id.key()).and_then(|s| match &mut s.kind {
            SocketKind::TlsConnected(c) => c.connect_cb.take(),
            _ => None,
        });
        if let Some(cb) = cb {
            if let Some(handle) = worker.new_handle(id) {
                cb(handle, Ok(()));
                let timeout = worker.config().read_timeout(false);
                worker.timers().arm(id, TimerKind::Read, timeout);
            }
        }
    }
}

fn drain_plaintext(worker: &mut Worker, id: SocketId) {
    loop {
        let paused = worker.sockets().get(id.key()).map(|s| s.shared.flags().read_paused()).unwrap_or(true);
        if paused {
            return;
        }

        let outcome = {
            use std::borrow::BorrowMut;
            let (sockets, recv_buf) = worker.sockets_and_recv_buf();
            let Some(socket) = sockets.get_mut(id.key()) else { return };
            let conn = match &mut socket.kind {
                SocketKind::TlsConnected(c) => c,
                _ => return,
            };
            let buf = recv_buf.checkout();
            if buf.remaining_mut() < READ_CHUNK {
                buf.reserve(READ_CHUNK);
            }
            let mut reader = conn.engine.reader();
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
                deliver(worker, id, RecvResult::Eof);
                close_gracefully(worker, id);
                return;
            }
            PlaintextOutcome::Data(bytes) => {
                deliver(worker, id, RecvResult::Success(&bytes));
                let timeout = worker.config().read_timeout(false);
                worker.timers().arm(id, TimerKind::Read, timeout);
            }
            PlaintextOutcome::Failed(e) => {
                fail_connection(worker, id, Some(e));
                return;
            }
        }
    }
}

enum PlaintextOutcome {
    Data(Vec<u8>),
    Drained,
    Eof,
    Failed(NetError),
}

fn deliver(worker: &mut Worker, id: SocketId, result: RecvResult) {
    let Some(handle) = worker.new_handle(id) else { return };
    if let Some(socket) = worker.sockets().get_mut(id.key()) {
        if let SocketKind::TlsConnected(c) = &mut socket.kind {
            if let Some(cb) = &mut c.recv_cb {
                cb(handle, result);
            }
        }
    }
}

/// Queues plaintext for send: handed to the engine immediately (rustls
/// buffers it internally), so the completion callback fires as soon as the
/// engine has absorbed it, not when it reaches the kernel socket.
pub fn queue_send(worker: &mut Worker, id: SocketId, data: Vec<u8>, cb: Option<SendCb>) {
    let outcome = {
        let Some(socket) = worker.sockets().get_mut(id.key()) else {
            drop(cb);
            return;
        };
        let conn = match &mut socket.kind {
            SocketKind::TlsConnected(c) => c,
            _ => {
                drop(cb);
                return;
            }
        };
        std::io::Write::write_all(&mut conn.engine.writer(), &data)
    };

    match outcome {
        Ok(()) => {
            if let Some(cb) = cb {
                if let Some(handle) = worker.new_handle(id) {
                    cb(handle, Ok(()));
                }
            }
            flush_ciphertext(worker, id);
        }
        Err(e) => {
            if let Some(cb) = cb {
                if let Some(handle) = worker.new_handle(id) {
                    cb(handle, Err(e.into()));
                }
            }
        }
    }
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
            let conn = match &mut socket.kind {
                SocketKind::TlsConnected(c) => c,
                _ => return,
            };
            if !conn.engine.wants_write() {
                FlushOutcome::Idle
            } else {
                match conn.engine.write_tls(&mut conn.stream) {
                    Ok(_) => FlushOutcome::Progressed,
                    Err(ref e) if e.kind() == ErrorKind::WouldBlock => FlushOutcome::WouldBlock,
                    Err(e) => FlushOutcome::Failed(e.into()),
                }
            }
        };

        match outcome {
            FlushOutcome::Idle => {
                let draining = worker.sockets().get(id.key()).map(|s| s.shared.flags().closing()).unwrap_or(false);
                if draining {
                    finish_drain_close(worker, id);
                }
                return;
            }
            FlushOutcome::WouldBlock => return,
            FlushOutcome::Progressed => continue,
            FlushOutcome::Failed(e) => {
                fail_connection(worker, id, Some(e));
                return;
            }
        }
    }
}

/// Closes a TLS connection once its ciphertext write backlog drains,
/// instead of failing it immediately (§11 graceful close). Plaintext
/// writes absorbed by the engine before this call still reach the wire.
pub fn close_connection_gracefully(worker: &mut Worker, id: SocketId) {
    let Some(socket) = worker.sockets().get(id.key()) else { return };
    if !socket.shared.flags().begin_close() {
        return;
    }
    let pending = match &socket.kind {
        SocketKind::TlsConnected(c) => c.engine.wants_write(),
        _ => false,
    };
    if !pending {
        finish_drain_close(worker, id);
    }
}

fn finish_drain_close(worker: &mut Worker, id: SocketId) {
    close_connection(worker, id);
    if let Some(s) = worker.sockets().get(id.key()) {
        s.shared.flags().finish_close();
    }
    worker.timers().cancel_all(id);
    worker.maybe_destroy(id);
}

fn fail_connection(worker: &mut Worker, id: SocketId, err: Option<NetError>) {
    let began = worker.sockets().get(id.key()).map(|s| s.shared.flags().begin_close()).unwrap_or(false);
    if !began {
        return;
    }

    let connect_cb = worker.sockets().get_mut(id.key()).and_then(|s| match &mut s.kind {
        SocketKind::TlsConnected(c) => c.connect_cb.take(),
        _ => None,
    });
    match connect_cb {
        Some(cb) => {
            if let Some(handle) = worker.new_handle(id) {
                cb(handle, Err(err.unwrap_or(NetError::Eof)));
            }
        }
        None => deliver(worker, id, RecvResult::Error(err.unwrap_or(NetError::Eof))),
    }

    close_connection(worker, id);
    if let Some(s) = worker.sockets().get(id.key()) {
        s.shared.flags().finish_close();
    }
}

/// Closes a connection that shut down cleanly (TLS `close_notify`), without
/// routing through the error-delivery path.
fn close_gracefully(worker: &mut Worker, id: SocketId) {
    let began = worker.sockets().get(id.key()).map(|s| s.shared.flags().begin_close()).unwrap_or(false);
    if !began {
        return;
    }
    close_connection(worker, id);
    if let Some(s) = worker.sockets().get(id.key()) {
        s.shared.flags().finish_close();
    }
}

/// Fires when a TLS connect or handshake exceeds its deadline.
pub fn on_connect_timeout(worker: &mut Worker, id: SocketId) {
    fail_connection(worker, id, Some(NetError::TimedOut));
}

/// Fires when a TLS read has been idle past its deadline.
pub fn on_read_timeout(worker: &mut Worker, id: SocketId) {
    fail_connection(worker, id, Some(NetError::TimedOut));
}

/// Adjusts registered interest for read-pause state.
pub fn refresh_interest(worker: &mut Worker, id: SocketId) {
    let is_tls = matches!(worker.sockets().get(id.key()).map(|s| &s.kind), Some(SocketKind::TlsConnected(_)));
    if !is_tls {
        return;
    }
    let paused = worker.sockets().get(id.key()).map(|s| s.shared.flags().read_paused()).unwrap_or(false);
    let interest = if paused { Interest::WRITABLE } else { Interest::READABLE | Interest::WRITABLE };
    let (sockets, registry) = worker.sockets_and_registry();
    if let Some(socket) = sockets.get_mut(id.key()) {
        if let SocketKind::TlsConnected(c) = &mut socket.kind {
            let _ = registry.reregister(&mut c.stream, id.token(), interest);
        }
    }
}

/// Closes a TLS listener: stops accepting and closes every accepted child.
pub fn close_listener(worker: &mut Worker, id: SocketId) {
    let children = match worker.sockets().get_mut(id.key()) {
        Some(s) => match &mut s.kind {
            SocketKind::TlsListener(l) => std::mem::take(&mut l.children),
            _ => return,
        },
        None => return,
    };
    {
        let (sockets, registry) = worker.sockets_and_registry();
        if let Some(socket) = sockets.get_mut(id.key()) {
            if let SocketKind::TlsListener(l) = &mut socket.kind {
                let _ = registry.deregister(&mut l.inner);
            }
        }
    }
    for child in children {
        if worker.sockets().get(child.key()).map(|s| s.shared.flags().begin_close()).unwrap_or(false) {
            close_connection(worker, child);
            if let Some(s) = worker.sockets().get(child.key()) {
                s.shared.flags().finish_close();
            }
            worker.maybe_destroy(child);
        }
    }
}

/// Closes a TLS connection: deregisters it and fails any in-flight work.
pub fn close_connection(worker: &mut Worker, id: SocketId) {
    {
        let (sockets, registry) = worker.sockets_and_registry();
        if let Some(socket) = sockets.get_mut(id.key()) {
            if let SocketKind::TlsConnected(c) = &mut socket.kind {
                let _ = registry.deregister(&mut c.stream);
            }
        }
    }

    let (recv_cb, connect_cb, quota) = match worker.sockets().get_mut(id.key()) {
        Some(s) => match &mut s.kind {
            SocketKind::TlsConnected(c) => {
                c.state = TlsState::Closed;
                (c.recv_cb.take(), c.connect_cb.take(), c.quota.take())
            }
            _ => return,
        },
        None => return,
    };
    if let Some(q) = quota {
        q.detach();
    }

    if let Some(handle) = worker.new_handle(id) {
        if let Some(mut cb) = recv_cb {
            cb(handle.clone(), RecvResult::Error(NetError::Canceled));
        }
        if let Some(cb) = connect_cb {
            cb(handle, Err(NetError::Canceled));
        }
    }
}
