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

//! Quota: a counting semaphore with a soft threshold and a FIFO callback
//! queue (§4.6). Guards admission into accept paths.

use std::collections::VecDeque;
use std::sync::Mutex;

/// Outcome of attaching to a quota.
#[derive(Debug, PartialEq, Eq)]
pub enum Attach {
    /// A slot was available below the soft threshold.
    Attached,
    /// A slot was available, but usage is at or above the soft threshold.
    SoftQuota,
    /// No slot was available; the callback was enqueued and will run when
    /// one frees.
    Queued,
}

struct Inner {
    hard: usize,
    soft: usize,
    in_use: usize,
    waiters: VecDeque<Box<dyn FnOnce() + Send>>,
}

/// A counting semaphore with soft/hard thresholds and a callback queue.
///
/// Attach may succeed immediately, succeed with a soft-quota warning, or
/// suspend by enqueuing a callback invoked when a slot frees (§4.6).
/// Detach that satisfies a waiter transfers the slot atomically — it is
/// never returned to the pool first (tie-break in §4.6).
pub struct Quota {
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for Quota {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().unwrap();
        f.debug_struct("Quota")
            .field("hard", &inner.hard)
            .field("soft", &inner.soft)
            .field("in_use", &inner.in_use)
            .field("waiters", &inner.waiters.len())
            .finish()
    }
}

impl Quota {
    /// Creates a quota with the given hard limit and soft threshold.
    /// `soft` must be `<= hard`.
    pub fn new(hard: usize, soft: usize) -> Self {
        assert!(soft <= hard, "soft threshold must not exceed the hard limit");
        Self {
            inner: Mutex::new(Inner {
                hard,
                soft,
                in_use: 0,
                waiters: VecDeque::new(),
            }),
        }
    }

    /// Current number of attached slots.
    pub fn in_use(&self) -> usize {
        self.inner.lock().unwrap().in_use
    }

    /// The hard limit this quota enforces.
    pub fn hard_limit(&self) -> usize {
        self.inner.lock().unwrap().hard
    }

    /// Attempts to attach a slot. On exhaustion, `cb` is enqueued and run
    /// (with a slot already attached on its behalf) by a later [`detach`].
    ///
    /// [`detach`]: Quota::detach
    pub fn attach_cb<F>(&self, cb: F) -> Attach
    where
        F: FnOnce() + Send + 'static,
    {
        let mut inner = self.inner.lock().unwrap();
        if inner.in_use < inner.hard {
            inner.in_use += 1;
            if inner.in_use >= inner.soft {
                Attach::SoftQuota
            } else {
                Attach::Attached
            }
        } else {
            inner.waiters.push_back(Box::new(cb));
            Attach::Queued
        }
    }

    /// Releases a previously attached slot. If a waiter is queued, the slot
    /// is transferred directly to it (FIFO) instead of returning to the
    /// pool: invariant I7, every accepted connection that consumed a slot
    /// releases it exactly once, and a transfer is still exactly one
    /// release plus one (re)attach on the waiter's behalf.
    pub fn detach(&self) {
        let next = {
            let mut inner = self.inner.lock().unwrap();
            assert!(inner.in_use > 0, "quota detach without a matching attach");
            match inner.waiters.pop_front() {
                Some(cb) => Some(cb),
                None => {
                    inner.in_use -= 1;
                    None
                }
            }
        };

        if let Some(cb) = next {
            cb();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn attach_succeeds_below_soft_threshold() {
        let q = Quota::new(4, 3);
        assert_eq!(q.attach_cb(|| {}), Attach::Attached);
        assert_eq!(q.attach_cb(|| {}), Attach::Attached);
    }

    #[test]
    fn attach_reports_soft_quota_at_threshold() {
        let q = Quota::new(4, 2);
        assert_eq!(q.attach_cb(|| {}), Attach::Attached);
        assert_eq!(q.attach_cb(|| {}), Attach::SoftQuota);
    }

    #[test]
    fn attach_queues_when_exhausted_and_detach_wakes_fifo() {
        let q = Arc::new(Quota::new(1, 1));
        assert_eq!(q.attach_cb(|| {}), Attach::SoftQuota);

        let woke = Arc::new(AtomicUsize::new(0));
        let w1 = woke.clone();
        let w2 = woke.clone();
        assert_eq!(q.attach_cb(move || w1.store(1, Ordering::SeqCst)), Attach::Queued);
        assert_eq!(q.attach_cb(move || w2.store(2, Ordering::SeqCst)), Attach::Queued);

        // First detach wakes the first-queued waiter, not the second.
        q.detach();
        assert_eq!(woke.load(Ordering::SeqCst), 1);

        q.detach();
        assert_eq!(woke.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn quota_balance_across_accepts_and_closes() {
        // P3: quota.in_use == (accepts that returned Attached|SoftQuota) - closes of those.
        let q = Quota::new(2, 2);
        assert_eq!(q.attach_cb(|| {}), Attach::Attached);
        assert_eq!(q.attach_cb(|| {}), Attach::SoftQuota);
        assert_eq!(q.in_use(), 2);
        q.detach();
        assert_eq!(q.in_use(), 1);
        q.detach();
        assert_eq!(q.in_use(), 0);
    }
}
