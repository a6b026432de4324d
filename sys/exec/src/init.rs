// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Staged initialization.
//!
//! Everything in the system is created during three ordered stages and never
//! destroyed. RAW hooks may assume nothing; READY hooks may assume all RAW
//! hooks ran; CRAFT hooks run last and may wire components together.

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum InitStage {
    Raw,
    Ready,
    Craft,
}

/// Ordered collection of init hooks. Within a stage, hooks run in
/// registration order.
pub struct InitHooks {
    hooks: Vec<(InitStage, Box<dyn FnOnce()>)>,
    ran: bool,
}

impl InitHooks {
    pub fn new() -> Self {
        Self {
            hooks: Vec::new(),
            ran: false,
        }
    }

    pub fn register(&mut self, stage: InitStage, hook: Box<dyn FnOnce()>) {
        assert!(!self.ran, "init hooks registered after initialization");
        self.hooks.push((stage, hook));
    }

    /// Runs every hook, stage by stage. May be called once.
    pub fn run(&mut self) {
        assert!(!self.ran, "initialization may only run once");
        self.ran = true;
        let hooks = std::mem::take(&mut self.hooks);
        let mut staged: Vec<Vec<Box<dyn FnOnce()>>> = vec![Vec::new(), Vec::new(), Vec::new()];
        for (stage, hook) in hooks {
            staged[stage as usize].push(hook);
        }
        for stage_hooks in staged {
            for hook in stage_hooks {
                hook();
            }
        }
    }
}

impl Default for InitHooks {
    fn default() -> Self {
        Self::new()
    }
}
