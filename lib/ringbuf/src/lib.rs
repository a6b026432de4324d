// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Ring buffer for tracing clips and drivers.
//!
//! Each module that wants diagnostics declares a module-local ring buffer of
//! some `Copy` payload type (usually an event enum) with [`ringbuf!`], and
//! records entries with [`ringbuf_entry!`]:
//!
//! ```
//! use ringbuf::{ringbuf, ringbuf_entry};
//!
//! #[derive(Copy, Clone, Debug, PartialEq, Eq)]
//! enum Trace {
//!     Reset,
//!     FctAdvance(u32),
//! }
//!
//! ringbuf!(Trace, 16);
//!
//! ringbuf_entry!(Trace::Reset);
//! ringbuf_entry!(Trace::FctAdvance(3));
//! ```
//!
//! If you use the variant of the macro that leaves the name of the buffer
//! implicit, you can only have one per module; provide a name to lift that
//! constraint.
//!
//! Entries are de-duplicated: recording the same payload as the most recent
//! entry increments that entry's count instead of consuming a new slot, so a
//! busy steady state does not scroll interesting history away.
//!
//! Buffers are ordinary statics; tests inspect them with [`Ringbuf::snapshot`]
//! and reset them between cases with [`Ringbuf::reset`].

use std::sync::Mutex;

/// One recorded entry: source line, wrap generation, de-dup count, payload.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RingbufEntry<T: Copy + PartialEq> {
    pub line: u16,
    pub generation: u16,
    pub count: u32,
    pub payload: T,
}

struct Inner<T: Copy + PartialEq, const N: usize> {
    last: Option<usize>,
    entries: [Option<RingbufEntry<T>>; N],
}

/// A fixed-size trace buffer. Declare with [`ringbuf!`] rather than directly.
pub struct Ringbuf<T: Copy + PartialEq, const N: usize> {
    inner: Mutex<Inner<T, N>>,
}

impl<T: Copy + PartialEq, const N: usize> Ringbuf<T, N> {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                last: None,
                entries: [None; N],
            }),
        }
    }

    // a trace buffer must stay usable even if a recording thread panicked,
    // so poisoning is ignored
    fn lock(&self) -> std::sync::MutexGuard<'_, Inner<T, N>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Records an entry, de-duplicating against the most recent one.
    pub fn entry(&self, line: u16, payload: T) {
        let mut inner = self.lock();

        // bump the count of the previous entry if the payload repeats
        if let Some(last) = inner.last {
            if let Some(ent) = &mut inner.entries[last] {
                if ent.payload == payload {
                    ent.count = ent.count.saturating_add(1);
                    return;
                }
            }
        }

        let (ndx, generation) = match inner.last {
            None => (0, 1),
            Some(last) => {
                let ndx = (last + 1) % N;
                let generation = match &inner.entries[ndx] {
                    None => 1,
                    Some(old) => old.generation.wrapping_add(1),
                };
                (ndx, generation)
            }
        };

        inner.entries[ndx] = Some(RingbufEntry {
            line,
            generation,
            count: 1,
            payload,
        });
        inner.last = Some(ndx);
    }

    /// The most recently recorded payload, if any.
    pub fn last(&self) -> Option<T> {
        let inner = self.lock();
        inner.last.and_then(|i| inner.entries[i].map(|e| e.payload))
    }

    /// All live entries in recording order, oldest first.
    pub fn snapshot(&self) -> Vec<RingbufEntry<T>> {
        let inner = self.lock();
        let mut out = Vec::with_capacity(N);
        if let Some(last) = inner.last {
            // the slot after `last` is the oldest entry (if occupied)
            for off in 1..=N {
                let ndx = (last + off) % N;
                if let Some(ent) = inner.entries[ndx] {
                    out.push(ent);
                }
            }
        }
        out
    }

    /// Discards all entries. Test support.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.last = None;
        inner.entries = [None; N];
    }
}

impl<T: Copy + PartialEq, const N: usize> Default for Ringbuf<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Declares a module-local ring buffer, optionally named.
#[macro_export]
macro_rules! ringbuf {
    ($name:ident, $t:ty, $n:expr) => {
        static $name: $crate::Ringbuf<$t, { $n }> = $crate::Ringbuf::new();
    };
    ($t:ty, $n:expr) => {
        $crate::ringbuf!(__RINGBUF, $t, $n);
    };
}

/// Records an entry in a ring buffer declared with [`ringbuf!`].
#[macro_export]
macro_rules! ringbuf_entry {
    ($name:ident, $payload:expr) => {
        $name.entry(line!() as u16, $payload);
    };
    ($payload:expr) => {
        $crate::ringbuf_entry!(__RINGBUF, $payload);
    };
}
