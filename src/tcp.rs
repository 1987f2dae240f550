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

//! Plaintext TCP: listen, accept (quota-gated), connect, read, write, and
//! timeouts (§4.3). Every function here runs on the owning worker's
//! thread; nothing crosses a thread boundary except through the event
//! queue that got us here.

use std::collections::VecDeque;
use std::io::{ErrorKind, Write};
use std::net::SocketAddr;
use std::sync::Arc;

use log::warn;
use mio::Interest;

use crate::error::{NetError, Result};
use crate::event::{ConnectTcpRequest, ListenTcpRequest, NetEvent};
use crate::handle::Handle;
use crate::net::tcp_listener::{bind_with_fallback, TcpListener as _};
use crate::net::tcp_stream::TcpStream as _;
use crate::quota::{Attach, Quota};
use crate::socket::{RecvResult, SendCb, Socket, SocketId, SocketKind, TcpConnState, TcpListenerState, Uvreq};
use crate::timer::TimerKind;
use crate::worker::Worker;

/// Binds and registers a plaintext TCP listener, replying with a
/// [`Handle`] on success.
pub fn listen(worker: &mut Worker, req: ListenTcpRequest) {
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
    let state = TcpListenerState {
        inner: listener,
        accept_cb: req.accept_cb,
        quota: req.quota,
        backlog: req.backlog,
        children: Vec::new(),
    };
    let mut socket = Socket::new(id, SocketKind::TcpListener(state));
    socket.shared.flags().set_listening(true);
    socket.shared.set_addrs(local_addr, None);
    let shared = socket.shared.clone();

    let entry = worker.sockets().vacant_entry();
    debug_assert_eq!(entry.key(), key);
    entry.insert(socket);

    let handle = Handle::from_existing(shared, worker.event_sender());
    let _ = req.reply.send(Ok(handle));
}

/// Drains every ready connection on a listener, gating admission through
/// its quota before the OS-level `accept()` (§4.6).
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
                SocketKind::TcpListener(l) => l.inner.accept(),
                _ => return,
            },
            None => return,
        };

        match accept_result {
            Ok((stream, peer_addr)) => spawn_connection(worker, id, stream, peer_addr, quota),
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
                warn!("tcp accept failed: {e}");
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
            SocketKind::TcpListener(l) => l.inner.accept(),
            _ => return,
        },
        None => return,
    };
    match accept_result {
        Ok((stream, peer_addr)) => spawn_connection(worker, id, stream, peer_addr, quota),
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
            warn!("tcp retry accept failed: {e}");
        }
    }

    accept_loop(worker, id);
}

fn listener_quota(worker: &mut Worker, id: SocketId) -> Option<Option<Arc<Quota>>> {
    worker.sockets().get(id.key()).map(|s| match &s.kind {
        SocketKind::TcpListener(l) => l.quota.clone(),
        _ => None,
    })
}

fn pause_listener(worker: &mut Worker, id: SocketId) {
    let (sockets, registry) = worker.sockets_and_registry();
    if let Some(socket) = sockets.get_mut(id.key()) {
        if let SocketKind::TcpListener(l) = &mut socket.kind {
            let _ = registry.deregister(&mut l.inner);
        }
    }
}

fn resume_listener(worker: &mut Worker, id: SocketId) {
    let (sockets, registry) = worker.sockets_and_registry();
    if let Some(socket) = sockets.get_mut(id.key()) {
        if let SocketKind::TcpListener(l) = &mut socket.kind {
            let _ = registry.register(&mut l.inner, id.token(), Interest::READABLE);
        }
    }
}

fn record_accept_failure(worker: &mut Worker, id: SocketId) {
    if let Some(socket) = worker.sockets().get(id.key()) {
        socket.shared.accept_failures.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }
}

fn spawn_connection(
    worker: &mut Worker,
    listener_id: SocketId,
    mut stream: mio::net::TcpStream,
    peer_addr: SocketAddr,
    quota: Option<Arc<Quota>>,
) {
    let key = worker.sockets().vacant_entry().key();
    let conn_id = SocketId::new(worker.idx(), key);
    {
        let (_, registry) = worker.sockets_and_registry();
        if let Err(e) = registry.register(&mut stream, conn_id.token(), Interest::READABLE | Interest::WRITABLE) {
            warn!("failed to register accepted connection: {e}");
            if let Some(q) = &quota {
                q.detach();
            }
            return;
        }
    }

    let local_addr = stream.local_addr().ok();
    let state = TcpConnState {
        stream,
        recv_cb: None,
        connect_cb: None,
        send_queue: VecDeque::new(),
        write_in_flight: false,
        processing: false,
        static_handle: None,
        quota: quota.clone(),
    };
    let mut socket = Socket::new(conn_id, SocketKind::TcpConnected(state));
    socket.server = Some(listener_id);
    socket.shared.flags().set_connected(true);
    socket.shared.set_addrs(local_addr, Some(peer_addr));
    let shared = socket.shared.clone();

    let entry = worker.sockets().vacant_entry();
    debug_assert_eq!(entry.key(), key);
    entry.insert(socket);

    let timeout = worker.config().read_timeout(false);
    worker.timers().arm(conn_id, TimerKind::Read, timeout);

    let handle = Handle::from_existing(shared, worker.event_sender());
    if let Some(listener_socket) = worker.sockets().get_mut(listener_id.key()) {
        if let SocketKind::TcpListener(l) = &mut listener_socket.kind {
            (l.accept_cb)(handle, Ok(()));
            l.children.push(conn_id);
        }
    }
}

/// Initiates a non-blocking TCP connect.
pub fn connect(worker: &mut Worker, req: ConnectTcpRequest) {
    let mut stream = match crate::net::tcp_stream::connect(req.addr, req.local) {
        Ok(s) => s,
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

    let state = TcpConnState {
        stream,
        recv_cb: None,
        connect_cb: Some(req.connect_cb),
        send_queue: VecDeque::new(),
        write_in_flight: false,
        processing: false,
        static_handle: None,
        quota: None,
    };
    let mut socket = Socket::new(id, SocketKind::TcpConnected(state));
    socket.shared.flags().set_connecting(true);
    let shared = socket.shared.clone();

    let entry = worker.sockets().vacant_entry();
    debug_assert_eq!(entry.key(), key);
    entry.insert(socket);

    worker.timers().arm(id, TimerKind::Connect, req.timeout);

    let handle = Handle::from_existing(shared, worker.event_sender());
    let _ = req.reply.send(Ok(handle));
}

/// Handles a connect or write wakeup.
pub fn on_writable(worker: &mut Worker, id: SocketId) {
    let connecting = worker
        .sockets()
        .get(id.key())
        .map(|s| s.shared.flags().connecting())
        .unwrap_or(false);

    if connecting {
        complete_connect(worker, id);
        return;
    }
    flush_send_queue(worker, id);
}

fn complete_connect(worker: &mut Worker, id: SocketId) {
    let outcome = match worker.sockets().get_mut(id.key()) {
        Some(s) => match &mut s.kind {
            SocketKind::TcpConnected(c) => c.stream.take_error(),
            _ => return,
        },
        None => return,
    };

    worker.timers().cancel(id, TimerKind::Connect);

    let result = match outcome {
        Ok(None) => Ok(()),
        Ok(Some(e)) => Err(NetError::from(e)),
        Err(e) => Err(NetError::from(e)),
    };

    if let Some(socket) = worker.sockets().get(id.key()) {
        socket.shared.flags().set_connecting(false);
        socket.shared.flags().set_connected(result.is_ok());
    }

    let cb = match worker.sockets().get_mut(id.key()) {
        Some(s) => match &mut s.kind {
            SocketKind::TcpConnected(c) => c.connect_cb.take(),
            _ => None,
        },
        None => None,
    };

    if let Some(cb) = cb {
        if let Some(handle) = worker.new_handle(id) {
            let is_ok = result.is_ok();
            cb(handle, result);
            if is_ok {
                let timeout = worker.config().read_timeout(false);
                worker.timers().arm(id, TimerKind::Read, timeout);
            }
        }
    }
}

/// Queues `data` for send on a connected plaintext socket.
pub fn queue_send(worker: &mut Worker, id: SocketId, data: Vec<u8>, cb: Option<SendCb>) {
    let Some(handle) = worker.new_handle(id) else {
        if let Some(cb) = cb {
            // No socket to attach a handle to; nothing meaningful to call
            // back with, so the send is simply dropped.
            drop(cb);
        }
        return;
    };
    if let Some(socket) = worker.sockets().get_mut(id.key()) {
        if let SocketKind::TcpConnected(c) = &mut socket.kind {
            c.send_queue.push_back(Uvreq { handle, send_region: Some(data), send_cb: cb });
        }
    }
    flush_send_queue(worker, id);
}

enum FlushOutcome {
    Idle,
    WouldBlock,
    Partial,
    Completed,
    Failed(NetError),
}

fn flush_send_queue(worker: &mut Worker, id: SocketId) {
    loop {
        let outcome = {
            let socket = match worker.sockets().get_mut(id.key()) {
                Some(s) => s,
                None => return,
            };
            let conn = match &mut socket.kind {
                SocketKind::TcpConnected(c) => c,
                _ => return,
            };
            match conn.send_queue.front_mut() {
                None => FlushOutcome::Idle,
                Some(req) => {
                    let data = req.send_region.as_mut().expect("queued send always carries data");
                    match conn.stream.write(data) {
                        Ok(n) if n == data.len() => FlushOutcome::Completed,
                        Ok(n) => {
                            data.drain(0..n);
                            FlushOutcome::Partial
                        }
                        Err(ref e) if e.kind() == ErrorKind::WouldBlock => FlushOutcome::WouldBlock,
                        Err(e) => FlushOutcome::Failed(e.into()),
                    }
                }
            }
        };

        match outcome {
            FlushOutcome::Idle | FlushOutcome::WouldBlock => return,
            FlushOutcome::Partial => continue,
            FlushOutcome::Completed => complete_front_send(worker, id, Ok(())),
            FlushOutcome::Failed(e) => {
                complete_front_send(worker, id, Err(e));
                return;
            }
        }
    }
}

fn complete_front_send(worker: &mut Worker, id: SocketId, result: Result<()>) {
    let req = match worker.sockets().get_mut(id.key()) {
        Some(s) => match &mut s.kind {
            SocketKind::TcpConnected(c) => c.send_queue.pop_front(),
            _ => None,
        },
        None => None,
    };
    if let Some(req) = req {
        if let Some(cb) = req.send_cb {
            cb(req.handle, result);
        }
    }

    let drained = worker.sockets().get(id.key()).map(|s| match &s.kind {
        SocketKind::TcpConnected(c) => s.shared.flags().closing() && c.send_queue.is_empty(),
        _ => false,
    }).unwrap_or(false);
    if drained {
        finish_graceful_close(worker, id);
    }
}

/// Closes a connected socket once its queued sends have finished writing,
/// rather than canceling them immediately (§11 `close_gracefully` vs the
/// immediate `shutdown`/`Close` path).
pub fn close_connection_gracefully(worker: &mut Worker, id: SocketId) {
    let Some(socket) = worker.sockets().get(id.key()) else { return };
    if !socket.shared.flags().begin_close() {
        return;
    }
    let pending = match worker.sockets().get(id.key()).map(|s| &s.kind) {
        Some(SocketKind::TcpConnected(c)) => !c.send_queue.is_empty(),
        _ => false,
    };
    if !pending {
        finish_graceful_close(worker, id);
    }
}

fn finish_graceful_close(worker: &mut Worker, id: SocketId) {
    close_connection(worker, id);
    if let Some(s) = worker.sockets().get(id.key()) {
        s.shared.flags().finish_close();
    }
    worker.timers().cancel_all(id);
    worker.maybe_destroy(id);
}

enum ReadOutcome {
    Data(Vec<u8>),
    Eof,
    WouldBlock,
    Failed(NetError),
    NotApplicable,
}

const READ_CHUNK: usize = 16 * 1024;

/// Reads whatever is available, delivering it to the socket's `recv_cb`.
///
/// Bytes are copied out of the worker's single reusable buffer (I6) before
/// the callback runs, so `recv_cb` may hold onto them past the call.
pub fn on_readable(worker: &mut Worker, id: SocketId) {
    let paused = worker.sockets().get(id.key()).map(|s| s.shared.flags().read_paused()).unwrap_or(true);
    if paused {
        return;
    }

    loop {
        let outcome = {
            use std::borrow::BorrowMut;
            let (sockets, recv_buf) = worker.sockets_and_recv_buf();
            let Some(socket) = sockets.get_mut(id.key()) else { return };
            let conn = match &mut socket.kind {
                SocketKind::TcpConnected(c) => c,
                _ => return,
            };
            let buf = recv_buf.checkout();
            if buf.remaining_mut() < READ_CHUNK {
                buf.reserve(READ_CHUNK);
            }
            let result = std::io::Read::read(&mut conn.stream, buf.borrow_mut());
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
            ReadOutcome::NotApplicable | ReadOutcome::WouldBlock => return,
            ReadOutcome::Data(bytes) => {
                let keepalive = worker.sockets().get(id.key()).map(|s| s.shared.keepalive()).unwrap_or(false);
                deliver(worker, id, RecvResult::Success(&bytes));
                let timeout = worker.config().read_timeout(keepalive);
                worker.timers().arm(id, TimerKind::Read, timeout);
            }
            ReadOutcome::Eof => {
                deliver(worker, id, RecvResult::Eof);
                close_from_peer(worker, id);
                return;
            }
            ReadOutcome::Failed(e) => {
                deliver(worker, id, RecvResult::Error(e));
                close_from_peer(worker, id);
                return;
            }
        }
    }
}

fn deliver(worker: &mut Worker, id: SocketId, result: RecvResult) {
    let Some(handle) = worker.new_handle(id) else { return };
    if let Some(socket) = worker.sockets().get_mut(id.key()) {
        if let SocketKind::TcpConnected(c) = &mut socket.kind {
            if let Some(cb) = &mut c.recv_cb {
                cb(handle, result);
            }
        }
    }
}

fn close_from_peer(worker: &mut Worker, id: SocketId) {
    let began = worker.sockets().get(id.key()).map(|s| s.shared.flags().begin_close()).unwrap_or(false);
    if !began {
        return;
    }
    close_connection(worker, id);
    if let Some(s) = worker.sockets().get(id.key()) {
        s.shared.flags().finish_close();
    }
}

/// Fires when a connect attempt exceeds its deadline.
pub fn on_connect_timeout(worker: &mut Worker, id: SocketId) {
    let cb = match worker.sockets().get_mut(id.key()) {
        Some(s) => match &mut s.kind {
            SocketKind::TcpConnected(c) if c.connect_cb.is_some() => c.connect_cb.take(),
            _ => None,
        },
        None => None,
    };
    if let Some(cb) = cb {
        if let Some(handle) = worker.new_handle(id) {
            cb(handle, Err(NetError::TimedOut));
        }
        close_connection(worker, id);
    }
}

/// Fires when a read has been idle/keepalive-idle past its deadline.
pub fn on_read_timeout(worker: &mut Worker, id: SocketId) {
    deliver(worker, id, RecvResult::Error(NetError::TimedOut));
    close_connection(worker, id);
}

/// Adjusts registered interest for read-pause state.
pub fn refresh_interest(worker: &mut Worker, id: SocketId) {
    let is_tcp = matches!(worker.sockets().get(id.key()).map(|s| &s.kind), Some(SocketKind::TcpConnected(_)));
    if !is_tcp {
        return;
    }
    let paused = worker.sockets().get(id.key()).map(|s| s.shared.flags().read_paused()).unwrap_or(false);
    let interest = if paused { Interest::WRITABLE } else { Interest::READABLE | Interest::WRITABLE };
    let (sockets, registry) = worker.sockets_and_registry();
    if let Some(socket) = sockets.get_mut(id.key()) {
        if let SocketKind::TcpConnected(c) = &mut socket.kind {
            let _ = registry.reregister(&mut c.stream, id.token(), interest);
        }
    }
}

/// Closes a listener: stops accepting and closes every child connection.
pub fn close_listener(worker: &mut Worker, id: SocketId) {
    let children = match worker.sockets().get_mut(id.key()) {
        Some(s) => match &mut s.kind {
            SocketKind::TcpListener(l) => std::mem::take(&mut l.children),
            _ => return,
        },
        None => return,
    };
    {
        let (sockets, registry) = worker.sockets_and_registry();
        if let Some(socket) = sockets.get_mut(id.key()) {
            if let SocketKind::TcpListener(l) = &mut socket.kind {
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

/// Closes a connected socket: deregisters it and fails any in-flight work.
pub fn close_connection(worker: &mut Worker, id: SocketId) {
    {
        let (sockets, registry) = worker.sockets_and_registry();
        if let Some(socket) = sockets.get_mut(id.key()) {
            if let SocketKind::TcpConnected(c) = &mut socket.kind {
                let _ = registry.deregister(&mut c.stream);
            }
        }
    }

    let (recv_cb, connect_cb, send_queue, quota) = match worker.sockets().get_mut(id.key()) {
        Some(s) => match &mut s.kind {
            SocketKind::TcpConnected(c) => {
                (c.recv_cb.take(), c.connect_cb.take(), std::mem::take(&mut c.send_queue), c.quota.take())
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
    for req in send_queue {
        if let Some(cb) = req.send_cb {
            cb(req.handle, Err(NetError::Canceled));
        }
    }
}
