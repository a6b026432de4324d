// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Epoch-scoped mutual exclusion.
//!
//! An `EpLock` is never blocked on: it is held only within a single clip
//! invocation, and the schedule guarantees that at most one clip touches the
//! protected resource at a time. Contention therefore indicates a schedule
//! bug, and is fatal.

use std::cell::Cell;

pub struct EpLock {
    label: &'static str,
    held: Cell<bool>,
}

impl EpLock {
    pub const fn new(label: &'static str) -> Self {
        Self {
            label,
            held: Cell::new(false),
        }
    }

    pub fn acquire(&self) {
        assert!(
            !self.held.get(),
            "epoch lock '{}' acquired while already held",
            self.label,
        );
        self.held.set(true);
    }

    pub fn release(&self) {
        assert!(
            self.held.get(),
            "epoch lock '{}' released while not held",
            self.label,
        );
        self.held.set(false);
    }

    pub fn held(&self) -> bool {
        self.held.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_release_cycle() {
        let lock = EpLock::new("test");
        assert!(!lock.held());
        lock.acquire();
        assert!(lock.held());
        lock.release();
        assert!(!lock.held());
    }

    #[test]
    #[should_panic(expected = "already held")]
    fn double_acquire_is_fatal() {
        let lock = EpLock::new("test");
        lock.acquire();
        lock.acquire();
    }

    #[test]
    #[should_panic(expected = "not held")]
    fn stray_release_is_fatal() {
        let lock = EpLock::new("test");
        lock.release();
    }
}
