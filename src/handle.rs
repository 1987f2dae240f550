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

//! Handles: the consumer-facing reference to a socket (§3).
//!
//! A `Handle` may be cloned and dropped from any thread. Cloning attaches
//! (bumps the refcount); dropping detaches. It carries no kind-specific
//! state and never reaches into a worker's slab directly — every operation
//! it exposes is expressed as a [`crate::event::NetEvent`] sent to the
//! owning worker.

use std::sync::Arc;
use std::time::Duration;

use crate::event::{EventSender, NetEvent};
use crate::socket::{RecvCb, SendCb, SocketId, SocketShared};

/// A cloneable, thread-safe reference to a socket.
///
/// Dropping the last handle to a socket does not by itself destroy it —
/// destruction additionally requires the `closed` flag (I2, P1) — but it is
/// the signal the owning worker uses to decide a socket has no remaining
/// external interest.
pub struct Handle {
    shared: Arc<SocketShared>,
    sender: EventSender,
}

impl Handle {
    /// Wraps `shared`, attaching a new reference (I3).
    pub fn new(shared: Arc<SocketShared>, sender: EventSender) -> Self {
        shared.attach();
        Self { shared, sender }
    }

    /// Wraps `shared` without attaching — used when the caller already
    /// holds the attach this handle represents (e.g. constructing the
    /// "static handle" anchor stored inside the socket itself).
    pub fn from_existing(shared: Arc<SocketShared>, sender: EventSender) -> Self {
        Self { shared, sender }
    }

    /// The socket's stable identity.
    pub fn id(&self) -> SocketId {
        self.shared.id()
    }

    /// The socket's shared state.
    pub fn shared(&self) -> &Arc<SocketShared> {
        &self.shared
    }

    /// Sends an event to the worker owning this socket. The worker drains
    /// its inbound queue before each `Poll::poll` (§4.1), so ordering
    /// between events sent from the same thread is preserved.
    pub fn send(&self, event: NetEvent) {
        self.sender.send(event);
    }

    /// A clone of the underlying event sender, for constructing events that
    /// need to hand a reply channel back (e.g. a connect completing and
    /// needing to enqueue follow-up events against the same worker).
    pub fn sender(&self) -> EventSender {
        self.sender.clone()
    }

    /// Starts (or restarts) streaming reads, delivering each chunk to
    /// `recv_cb` (§6 `read`).
    pub fn read(&self, recv_cb: RecvCb) {
        self.send(NetEvent::StartRead { socket: self.id(), recv_cb });
    }

    /// Suspends delivery without canceling the read (§6 `pause_read`).
    pub fn pause_read(&self) {
        self.send(NetEvent::PauseRead { socket: self.id() });
    }

    /// Resumes a paused read (§6 `resume_read`).
    pub fn resume_read(&self) {
        self.send(NetEvent::ResumeRead { socket: self.id() });
    }

    /// Cancels an outstanding read; its callback is dropped, never invoked
    /// again (§6 `cancel_read`).
    pub fn cancel_read(&self) {
        self.send(NetEvent::CancelRead { socket: self.id() });
    }

    /// Arms the read timeout. `None` disarms it (§6 `set_timeout`).
    pub fn set_timeout(&self, timeout: Option<Duration>) {
        self.send(NetEvent::SetTimeout { socket: self.id(), timeout });
    }

    /// Marks whether this connection should use the longer keepalive read
    /// timeout rather than the shorter idle one (§4.3). Takes effect on
    /// the next timer arm.
    pub fn set_keepalive(&self, keepalive: bool) {
        self.shared.set_keepalive(keepalive);
    }

    /// Queues `data` for send, invoking `send_cb` once it is handed off
    /// (§6 `send`).
    pub fn send_data(&self, data: Vec<u8>, send_cb: Option<SendCb>) {
        self.send(NetEvent::Send { socket: self.id(), data, cb: send_cb });
    }

    /// Cancels pending work and tears the socket down immediately (§4.2
    /// hard close).
    pub fn shutdown(&self) {
        self.send(NetEvent::Close { socket: self.id() });
    }

    /// Lets queued sends finish writing before tearing the socket down
    /// (§11 graceful close), rather than canceling them immediately.
    pub fn close_gracefully(&self) {
        self.send(NetEvent::CloseGracefully { socket: self.id() });
    }
}

impl Clone for Handle {
    fn clone(&self) -> Self {
        self.shared.attach();
        Self { shared: self.shared.clone(), sender: self.sender.clone() }
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        let remaining = self.shared.detach();
        if remaining == 0 {
            // The owning worker re-checks `destroyable()` before actually
            // freeing the slab slot; this is advisory, not a signal it
            // must act on synchronously.
            self.sender.send(NetEvent::MaybeDestroy { socket: self.shared.id() });
        }
    }
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("id", &self.shared.id())
            .field("refcount", &self.shared.refcount())
            .finish()
    }
}
