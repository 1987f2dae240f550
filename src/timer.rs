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

//! Per-worker timer wheel driving connect timeouts and read timeouts
//! (§4.3 "Timeout semantics").
//!
//! `mio` has no built-in timer facility, so each worker keeps its own
//! `Instant`-keyed queue and computes the next `Poll::poll` timeout from
//! its earliest deadline.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::socket::SocketId;

/// One socket's armed deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// §4.3 connect timeout.
    Connect,
    /// §4.3 read timeout (`keepalive` or `idle`).
    Read,
}

/// A worker's timer queue: one entry per armed timer, keyed by deadline.
#[derive(Debug, Default)]
pub struct TimerWheel {
    queue: BTreeMap<Instant, (SocketId, TimerKind)>,
    // Reverse index so re-arming/canceling a socket's timer can find and
    // remove its old entry without a linear scan.
    by_socket: std::collections::HashMap<(SocketId, TimerKind), Instant>,
}

impl TimerWheel {
    /// Creates an empty timer wheel.
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms (or re-arms) `kind` for `socket`, replacing any existing timer
    /// of the same kind on that socket.
    pub fn arm(&mut self, socket: SocketId, kind: TimerKind, after: Duration) {
        self.cancel(socket, kind);
        let deadline = Instant::now() + after;
        self.queue.insert(deadline, (socket, kind));
        self.by_socket.insert((socket, kind), deadline);
    }

    /// Cancels a previously armed timer, if any. Idempotent.
    pub fn cancel(&mut self, socket: SocketId, kind: TimerKind) {
        if let Some(deadline) = self.by_socket.remove(&(socket, kind)) {
            self.queue.remove(&deadline);
        }
    }

    /// Cancels every timer for `socket`, regardless of kind. Called when a
    /// socket is destroyed.
    pub fn cancel_all(&mut self, socket: SocketId) {
        self.cancel(socket, TimerKind::Connect);
        self.cancel(socket, TimerKind::Read);
    }

    /// Drains every timer whose deadline has passed, in deadline order.
    pub fn drain_expired(&mut self) -> Vec<(SocketId, TimerKind)> {
        let now = Instant::now();
        let expired: Vec<Instant> = self.queue.range(..=now).map(|(k, _)| *k).collect();
        let mut fired = Vec::with_capacity(expired.len());
        for deadline in expired {
            if let Some((socket, kind)) = self.queue.remove(&deadline) {
                self.by_socket.remove(&(socket, kind));
                fired.push((socket, kind));
            }
        }
        fired
    }

    /// How long `Poll::poll` should block: `None` means no timers are
    /// armed (block indefinitely, or until a net-event wakes the loop).
    pub fn next_timeout(&self) -> Option<Duration> {
        self.queue
            .keys()
            .next()
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::SocketId;

    #[test]
    fn rearming_replaces_previous_deadline() {
        let mut wheel = TimerWheel::new();
        let id = SocketId::new(0, 1);
        wheel.arm(id, TimerKind::Read, Duration::from_secs(10));
        wheel.arm(id, TimerKind::Read, Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(5));
        let fired = wheel.drain_expired();
        assert_eq!(fired, vec![(id, TimerKind::Read)]);
        assert!(wheel.next_timeout().is_none());
    }

    #[test]
    fn cancel_prevents_firing() {
        let mut wheel = TimerWheel::new();
        let id = SocketId::new(0, 1);
        wheel.arm(id, TimerKind::Connect, Duration::from_millis(1));
        wheel.cancel(id, TimerKind::Connect);
        std::thread::sleep(Duration::from_millis(5));
        assert!(wheel.drain_expired().is_empty());
    }

    #[test]
    fn independent_kinds_coexist() {
        let mut wheel = TimerWheel::new();
        let id = SocketId::new(0, 1);
        wheel.arm(id, TimerKind::Connect, Duration::from_millis(1));
        wheel.arm(id, TimerKind::Read, Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(5));
        let mut fired = wheel.drain_expired();
        fired.sort_by_key(|(_, k)| matches!(k, TimerKind::Read));
        assert_eq!(fired.len(), 2);
    }
}
