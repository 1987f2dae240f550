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

//! A worker: one OS thread, one `mio::Poll`, one `Slab<Socket>` (§4.1, I1).
//!
//! Every socket is created, polled, and destroyed exclusively on its
//! owning worker's thread. Other threads only ever reach a socket by
//! sending a [`NetEvent`] through a [`Handle`](crate::handle::Handle); the
//! worker applies every queued event before each `Poll::poll` call, so a
//! poll never observes a half-applied request.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, TryRecvError};
use log::{debug, trace, warn};
use mio::{Events, Poll, Token, Waker};

use crate::buffer::RecvBuffer;
use crate::config::NetmgrConfig;
use crate::event::{EventSender, NetEvent};
use crate::handle::Handle;
use crate::socket::{Socket, SocketId, SocketSlab};
use crate::timer::{TimerKind, TimerWheel};
use crate::{http, tcp, tls};

/// Reserved token for the cross-thread wakeup mechanism; slab keys never
/// collide with it since `Slab::insert` hands out small, densely packed
/// indices.
pub const WAKE_TOKEN: Token = Token(usize::MAX - 1);

/// One I/O worker: its own event loop, socket table, and timer wheel.
pub struct Worker {
    idx: usize,
    poll: Poll,
    sockets: SocketSlab,
    timers: TimerWheel,
    recv_buf: RecvBuffer,
    inbox: Receiver<NetEvent>,
    event_sender: EventSender,
    config: Arc<NetmgrConfig>,
    shutting_down: bool,
}

impl Worker {
    /// Builds a worker. `inbox` is this worker's event queue; `raw_tx` is
    /// the sending half other threads (and this worker itself) use to
    /// enqueue events, paired here with a freshly created [`Waker`].
    pub fn new(
        idx: usize,
        config: Arc<NetmgrConfig>,
        inbox: Receiver<NetEvent>,
        raw_tx: crossbeam_channel::Sender<NetEvent>,
    ) -> std::io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
        Ok(Self {
            idx,
            poll,
            sockets: SocketSlab::new(),
            timers: TimerWheel::new(),
            recv_buf: RecvBuffer::new(64 * 1024),
            inbox,
            event_sender: EventSender::new(raw_tx, waker),
            config,
            shutting_down: false,
        })
    }

    /// This worker's stable index.
    pub fn idx(&self) -> usize {
        self.idx
    }

    /// The event sender other threads use to reach this worker.
    pub fn event_sender(&self) -> EventSender {
        self.event_sender.clone()
    }

    /// Shared configuration.
    pub fn config(&self) -> &Arc<NetmgrConfig> {
        &self.config
    }

    /// The socket table, for modules that need direct access while driving
    /// a dispatched event.
    pub fn sockets(&mut self) -> &mut SocketSlab {
        &mut self.sockets
    }

    /// Registry for (de)registering interest on raw sources.
    pub fn registry(&self) -> &mio::Registry {
        self.poll.registry()
    }

    /// Borrows the socket table and the registry simultaneously, for
    /// operations that reregister an `mio` source already living in the
    /// slab (a direct-field split the borrow checker can see through
    /// getter methods alone).
    pub fn sockets_and_registry(&mut self) -> (&mut SocketSlab, &mio::Registry) {
        (&mut self.sockets, self.poll.registry())
    }

    /// Borrows the socket table and the receive buffer simultaneously, for
    /// the read path.
    pub fn sockets_and_recv_buf(&mut self) -> (&mut SocketSlab, &mut RecvBuffer) {
        (&mut self.sockets, &mut self.recv_buf)
    }

    /// The timer wheel.
    pub fn timers(&mut self) -> &mut TimerWheel {
        &mut self.timers
    }

    /// The shared receive buffer (I6: singly owned per worker).
    pub fn recv_buf(&mut self) -> &mut RecvBuffer {
        &mut self.recv_buf
    }

    /// Builds a handle attached to `id`, for handing back to a caller or
    /// storing as a socket's own static anchor.
    pub fn new_handle(&self, id: SocketId) -> Option<Handle> {
        self.sockets
            .get(id.key())
            .map(|s| Handle::new(s.shared.clone(), self.event_sender.clone()))
    }

    /// Removes a socket from the slab once it is closed and unreferenced
    /// (P1), canceling any timers it held.
    pub fn maybe_destroy(&mut self, id: SocketId) {
        let destroyable = self.sockets.get(id.key()).is_some_and(|s| s.shared.destroyable());
        if destroyable {
            self.timers.cancel_all(id);
            self.sockets.try_remove(id.key());
            trace!("worker {}: destroyed socket {:?}", self.idx, id);
        }
    }

    /// Runs the event loop until a [`NetEvent::Stop`] is processed.
    pub fn run(&mut self) {
        let mut events = Events::with_capacity(1024);
        while !self.shutting_down {
            self.drain_inbox();
            let timeout = self.timers.next_timeout().or(Some(Duration::from_secs(60)));
            if let Err(err) = self.poll.poll(&mut events, timeout) {
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                warn!("worker {}: poll failed: {err}", self.idx);
                break;
            }

            for event in events.iter() {
                match event.token() {
                    WAKE_TOKEN => {}
                    token => self.dispatch_io(token, event.is_readable(), event.is_writable()),
                }
            }

            self.fire_timers();
        }
    }

    fn drain_inbox(&mut self) {
        loop {
            match self.inbox.try_recv() {
                Ok(event) => self.apply(event),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.shutting_down = true;
                    break;
                }
            }
        }
    }

    fn fire_timers(&mut self) {
        for (socket, kind) in self.timers.drain_expired() {
            let tag = self.sockets.get(socket.key()).map(|s| discriminant_tag(&s.kind));
            match (tag, kind) {
                (Some(Tag::TcpConnected), TimerKind::Connect) => tcp::on_connect_timeout(self, socket),
                (Some(Tag::TcpConnected), TimerKind::Read) => tcp::on_read_timeout(self, socket),
                (Some(Tag::TlsConnected), TimerKind::Connect) => tls::on_connect_timeout(self, socket),
                (Some(Tag::TlsConnected), TimerKind::Read) => tls::on_read_timeout(self, socket),
                (Some(Tag::HttpSocket), _) => http::listener::on_timeout(self, socket, kind),
                _ => {}
            }
        }
    }

    fn dispatch_io(&mut self, token: Token, readable: bool, writable: bool) {
        let id = SocketId::new(self.idx, token.0);
        if !self.sockets.contains(id.key()) {
            return;
        }
        if writable {
            self.drive_writable(id);
        }
        if readable {
            self.drive_readable(id);
        }
        self.maybe_destroy(id);
    }

    fn drive_readable(&mut self, id: SocketId) {
        match self.sockets.get(id.key()).map(|s| discriminant_tag(&s.kind)) {
            Some(Tag::TcpListener) => tcp::accept_loop(self, id),
            Some(Tag::TcpConnected) => tcp::on_readable(self, id),
            Some(Tag::TlsConnected) => tls::on_readable(self, id),
            Some(Tag::TlsListener) => tls::accept_loop(self, id),
            Some(Tag::HttpListener) | Some(Tag::HttpSocket) => http::listener::on_readable(self, id),
            None => {}
        }
    }

    fn drive_writable(&mut self, id: SocketId) {
        match self.sockets.get(id.key()).map(|s| discriminant_tag(&s.kind)) {
            Some(Tag::TcpConnected) => tcp::on_writable(self, id),
            Some(Tag::TlsConnected) => tls::on_writable(self, id),
            Some(Tag::HttpListener) | Some(Tag::HttpSocket) => http::listener::on_writable(self, id),
            _ => {}
        }
    }

    fn apply(&mut self, event: NetEvent) {
        match event {
            NetEvent::ListenTcp(req) => tcp::listen(self, req),
            NetEvent::ListenTls(req) => tls::listen(self, req),
            NetEvent::ListenHttp(req) => http::listener::listen(self, req),
            NetEvent::AddDohEndpoint { listener, path, recv_cb, reply } => {
                let result = http::listener::add_endpoint(self, listener, path, recv_cb);
                let _ = reply.send(result);
            }
            NetEvent::StopListening { socket, reply } => {
                let result = self.stop_listening(socket);
                let _ = reply.send(result);
            }
            NetEvent::ConnectTcp(req) => tcp::connect(self, req),
            NetEvent::ConnectTls(req) => tls::connect(self, req),
            NetEvent::SendDohRequest { socket, request } => http::listener::send_request(self, socket, request),
            NetEvent::StartRead { socket, recv_cb } => self.start_read(socket, recv_cb),
            NetEvent::PauseRead { socket } => self.set_read_paused(socket, true),
            NetEvent::ResumeRead { socket } => self.set_read_paused(socket, false),
            NetEvent::CancelRead { socket } => self.cancel_read(socket),
            NetEvent::SetTimeout { socket, timeout } => self.set_timeout(socket, timeout),
            NetEvent::Send { socket, data, cb } => self.dispatch_send(socket, data, cb),
            NetEvent::Close { socket } => self.close_socket(socket),
            NetEvent::CloseGracefully { socket } => self.close_socket_gracefully(socket),
            NetEvent::QuotaRetryAccept { listener } => {
                match self.sockets.get(listener.key()).map(|s| discriminant_tag(&s.kind)) {
                    Some(Tag::TcpListener) => tcp::retry_accept(self, listener),
                    Some(Tag::TlsListener) => tls::retry_accept(self, listener),
                    Some(Tag::HttpListener) => http::listener::retry_accept(self, listener),
                    _ => {}
                }
            }
            NetEvent::MaybeDestroy { socket } => self.maybe_destroy(socket),
            NetEvent::Stop { reply } => {
                self.shutting_down = true;
                let _ = reply.send(Ok(()));
            }
        }
    }

    fn start_read(&mut self, id: SocketId, recv_cb: crate::socket::RecvCb) {
        use crate::socket::SocketKind::*;
        if let Some(socket) = self.sockets.get_mut(id.key()) {
            match &mut socket.kind {
                TcpConnected(s) => s.recv_cb = Some(recv_cb),
                TlsConnected(s) => s.recv_cb = Some(recv_cb),
                _ => return,
            }
        }
        self.set_read_paused(id, false);
    }

    fn set_read_paused(&mut self, id: SocketId, paused: bool) {
        if let Some(socket) = self.sockets.get(id.key()) {
            socket.shared.flags().set_read_paused(paused);
        }
        tcp::refresh_interest(self, id);
        tls::refresh_interest(self, id);
    }

    fn cancel_read(&mut self, id: SocketId) {
        use crate::socket::SocketKind::*;
        if let Some(socket) = self.sockets.get_mut(id.key()) {
            match &mut socket.kind {
                TcpConnected(s) => s.recv_cb = None,
                TlsConnected(s) => s.recv_cb = None,
                _ => {}
            }
        }
        self.timers.cancel(id, TimerKind::Read);
    }

    fn set_timeout(&mut self, id: SocketId, timeout: Option<Duration>) {
        match timeout {
            Some(d) => self.timers.arm(id, TimerKind::Read, d),
            None => self.timers.cancel(id, TimerKind::Read),
        }
    }

    fn dispatch_send(&mut self, id: SocketId, data: Vec<u8>, cb: Option<crate::socket::SendCb>) {
        match self.sockets.get(id.key()).map(|s| discriminant_tag(&s.kind)) {
            Some(Tag::TcpConnected) => tcp::queue_send(self, id, data, cb),
            Some(Tag::TlsConnected) => tls::queue_send(self, id, data, cb),
            Some(Tag::HttpSocket) => http::listener::queue_send(self, id, data, cb),
            _ => {
                if let Some(cb) = cb {
                    if let Some(handle) = self.new_handle(id) {
                        cb(handle, Err(crate::error::NetError::NotConnected));
                    }
                }
            }
        }
    }

    fn close_socket(&mut self, id: SocketId) {
        let Some(socket) = self.sockets.get(id.key()) else { return };
        if !socket.shared.flags().begin_close() {
            return;
        }
        match discriminant_tag(&socket.kind) {
            Tag::TcpListener => tcp::close_listener(self, id),
            Tag::TcpConnected => tcp::close_connection(self, id),
            Tag::TlsListener => tls::close_listener(self, id),
            Tag::TlsConnected => tls::close_connection(self, id),
            Tag::HttpListener | Tag::HttpSocket => http::listener::close(self, id),
        }
        if let Some(socket) = self.sockets.get(id.key()) {
            socket.shared.flags().finish_close();
        }
        self.timers.cancel_all(id);
        debug!("worker {}: closed socket {:?}", self.idx, id);
        self.maybe_destroy(id);
    }

    /// Stops a listener and every child it spawned (§4.1).
    fn stop_listening(&mut self, id: SocketId) -> crate::error::Result<()> {
        self.close_socket(id);
        Ok(())
    }

    /// Begins a drain-then-close for a connected socket (§11): queued
    /// sends finish writing before teardown. Listeners have no send queue
    /// to drain, so they fall back to the immediate close.
    fn close_socket_gracefully(&mut self, id: SocketId) {
        match self.sockets.get(id.key()).map(|s| discriminant_tag(&s.kind)) {
            Some(Tag::TcpConnected) => tcp::close_connection_gracefully(self, id),
            Some(Tag::TlsConnected) => tls::close_connection_gracefully(self, id),
            Some(_) => self.close_socket(id),
            None => {}
        }
    }
}

/// A type-only tag mirroring [`crate::socket::SocketKind`], used where
/// matching needs to avoid borrowing the kind's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    TcpListener,
    TcpConnected,
    TlsListener,
    TlsConnected,
    HttpListener,
    HttpSocket,
}

pub fn discriminant_tag(kind: &crate::socket::SocketKind) -> Tag {
    use crate::socket::SocketKind::*;
    match kind {
        TcpListener(_) => Tag::TcpListener,
        TcpConnected(_) => Tag::TcpConnected,
        TlsListener(_) => Tag::TlsListener,
        TlsConnected(_) => Tag::TlsConnected,
        HttpListener(_) => Tag::HttpListener,
        HttpSocket(_) => Tag::HttpSocket,
    }
}
