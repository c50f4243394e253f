/*
 * Copyright (C) 2024 The rlat authors
 *
 * This file is part of rlat.
 *
 * rlat is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * rlat is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with rlat.  If not, see <https://www.gnu.org/licenses/>.
 */

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Marker for a sleep or wait that was interrupted by cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

/// A one-shot cancellation signal shared between the test threads.
/// Sleeping threads park on the condvar so cancellation interrupts them
/// immediately instead of on their next poll.
#[derive(Default)]
pub struct CancelToken {
    cancelled: AtomicBool,
    mu: Mutex<()>,
    cv: Condvar,
}

impl CancelToken {
    pub fn new() -> CancelToken {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        let _guard = self.mu.lock().unwrap();
        self.cancelled.store(true, Ordering::SeqCst);
        self.cv.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Sleeps for d or until cancelled, whichever comes first.
    pub fn wait_timeout(&self, d: Duration) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            return Err(Cancelled);
        }
        let mut guard = self.mu.lock().unwrap();
        let deadline = std::time::Instant::now() + d;
        loop {
            if self.is_cancelled() {
                return Err(Cancelled);
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return Ok(());
            }
            let (g, _timeout) = self.cv.wait_timeout(guard, deadline - now).unwrap();
            guard = g;
        }
    }
}
