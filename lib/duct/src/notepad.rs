// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-replica persistent scratch memory.
//!
//! A notepad region survives clip restarts, which is exactly what clip stack
//! state does not do. Each replica's region is double-buffered: every
//! invocation the clip calls [`Notepad::feedforward`], which hands it a
//! fresh region pre-filled from the previous cycle's, along with a validity
//! flag. The note is invalid on the first observation and after a restart;
//! an invalid note has been reset to its default and must be re-initialized
//! by the owner before its contents mean anything.

use std::cell::{RefCell, RefMut};
use std::ops::{Deref, DerefMut};

struct Replica<T> {
    regions: [T; 2],
    current: usize,
    observed: bool,
}

pub struct Notepad<T: Copy + Default> {
    label: &'static str,
    replicas: Vec<RefCell<Replica<T>>>,
}

impl<T: Copy + Default> Notepad<T> {
    pub fn new(label: &'static str, replicas: usize) -> Self {
        assert!(replicas >= 1, "notepad '{label}' must have a replica");
        Self {
            label,
            replicas: (0..replicas)
                .map(|_| {
                    RefCell::new(Replica {
                        regions: [T::default(); 2],
                        current: 0,
                        observed: false,
                    })
                })
                .collect(),
        }
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn replicas(&self) -> usize {
        self.replicas.len()
    }

    /// Copies out the current region without flipping. Observability only;
    /// clips use [`Notepad::feedforward`].
    pub fn peek(&self, replica: usize) -> T {
        let rep = self.replicas[replica].borrow();
        rep.regions[rep.current]
    }

    /// Flips the double buffer for `replica` and returns the new current
    /// region, carried forward from the previous cycle. `restart` is the
    /// scheduler's report for the calling clip; a restarted (or
    /// first-observed) note comes back defaulted and flagged invalid.
    pub fn feedforward(&self, replica: usize, restart: bool) -> FeedForward<'_, T> {
        let mut rep = self.replicas[replica].borrow_mut();
        let valid = rep.observed && !restart;
        let next = 1 - rep.current;
        let carried = if valid {
            rep.regions[rep.current]
        } else {
            T::default()
        };
        rep.regions[next] = carried;
        rep.current = next;
        rep.observed = true;
        FeedForward { rep, valid }
    }
}

/// Mutable access to the current region for one replica, plus validity.
pub struct FeedForward<'a, T: Copy + Default> {
    rep: RefMut<'a, Replica<T>>,
    valid: bool,
}

impl<T: Copy + Default> FeedForward<'_, T> {
    /// False when the previous cycle's contents could not be carried
    /// forward (first run or restart).
    pub fn valid(&self) -> bool {
        self.valid
    }
}

impl<T: Copy + Default> Deref for FeedForward<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        let current = self.rep.current;
        &self.rep.regions[current]
    }
}

impl<T: Copy + Default> DerefMut for FeedForward<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        let current = self.rep.current;
        &mut self.rep.regions[current]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Copy, Clone, Default, PartialEq, Debug)]
    struct Note {
        cycles: u32,
    }

    #[test]
    fn first_observation_is_invalid() {
        let pad: Notepad<Note> = Notepad::new("test", 1);
        let note = pad.feedforward(0, false);
        assert!(!note.valid());
        assert_eq!(note.cycles, 0);
    }

    #[test]
    fn contents_carry_forward() {
        let pad: Notepad<Note> = Notepad::new("test", 1);
        for expected in 0..4 {
            let mut note = pad.feedforward(0, false);
            assert_eq!(note.cycles, expected);
            note.cycles += 1;
        }
    }

    #[test]
    fn restart_resets_and_invalidates() {
        let pad: Notepad<Note> = Notepad::new("test", 1);
        {
            let mut note = pad.feedforward(0, false);
            note.cycles = 17;
        }
        let note = pad.feedforward(0, true);
        assert!(!note.valid());
        assert_eq!(note.cycles, 0);
    }

    #[test]
    fn replicas_are_independent() {
        let pad: Notepad<Note> = Notepad::new("test", 2);
        {
            let mut note = pad.feedforward(0, false);
            note.cycles = 5;
        }
        let note = pad.feedforward(1, false);
        assert_eq!(note.cycles, 0);
    }
}
