// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Arena of live conjuries and the active pointer.
//!
//! The stage never performs the switch itself: `enter` updates bookkeeping
//! and hands back the two register blocks, so the caller can release its
//! `RefCell` borrow before control leaves the current stack.

use std::sync::Arc;

use tracing::trace;

use crate::conjury::{Conjury, ConjuryId};
use crate::context::Registers;
use crate::state::{State, StateCell};
use crate::tunnel::Slot;
use crate::wrapper::Body;

#[derive(Debug)]
struct Entry {
    generation: u32,
    conjury: Option<Box<Conjury>>,
}

#[derive(Debug)]
pub(crate) struct Stage {
    entries: Vec<Entry>,
    free: Vec<u32>,
    active: ConjuryId,
    live: usize,
}

impl Stage {
    /// A stage whose only member is the calling thread's main conjury.
    pub fn new() -> Self {
        let mut stage = Self {
            entries: Vec::new(),
            free: Vec::new(),
            active: ConjuryId::new(0, 0),
            live: 0,
        };
        stage.active = stage.manage(Conjury::main());
        stage
    }

    pub fn manage(&mut self, conjury: Conjury) -> ConjuryId {
        self.live += 1;
        let boxed = Some(Box::new(conjury));
        if let Some(index) = self.free.pop() {
            let entry = &mut self.entries[index as usize];
            entry.conjury = boxed;
            return ConjuryId::new(index, entry.generation);
        }
        let index = self.entries.len() as u32;
        self.entries.push(Entry {
            generation: 0,
            conjury: boxed,
        });
        ConjuryId::new(index, 0)
    }

    /// Drop a finished conjury and free its slot. Returns the conjury so
    /// the caller controls when its stack is unmapped.
    pub fn destroy(&mut self, id: ConjuryId) -> Option<Box<Conjury>> {
        if self.get(id)?.state() != State::Finished {
            return None;
        }
        self.remove(id)
    }

    /// Remove regardless of state. Used to discard abandoned generators.
    pub fn remove(&mut self, id: ConjuryId) -> Option<Box<Conjury>> {
        self.get(id)?;
        let entry = &mut self.entries[id.index()];
        let conjury = entry.conjury.take();
        entry.generation = entry.generation.wrapping_add(1);
        self.free.push(id.index() as u32);
        self.live -= 1;
        conjury
    }

    pub fn get(&self, id: ConjuryId) -> Option<&Conjury> {
        let entry = self.entries.get(id.index())?;
        if entry.generation != id.generation() {
            return None;
        }
        entry.conjury.as_deref()
    }

    pub fn get_mut(&mut self, id: ConjuryId) -> Option<&mut Conjury> {
        let entry = self.entries.get_mut(id.index())?;
        if entry.generation != id.generation() {
            return None;
        }
        entry.conjury.as_deref_mut()
    }

    pub fn contains(&self, id: ConjuryId) -> bool {
        self.get(id).is_some()
    }

    pub fn active(&self) -> ConjuryId {
        self.active
    }

    pub fn live(&self) -> usize {
        self.live
    }

    pub fn state(&self, id: ConjuryId) -> Option<State> {
        self.get(id).map(Conjury::state)
    }

    pub fn set_state(&self, id: ConjuryId, state: State) {
        if let Some(c) = self.get(id) {
            c.set_state(state);
        }
    }

    pub fn state_cell(&self, id: ConjuryId) -> Option<Arc<StateCell>> {
        self.get(id).map(|c| c.state.clone())
    }

    pub fn name(&self, id: ConjuryId) -> String {
        match self.get(id) {
            Some(c) if c.name.is_empty() => format!("conjury-{}", id),
            Some(c) => c.name.clone(),
            None => format!("<reaped {}>", id),
        }
    }

    pub fn return_target(&self, id: ConjuryId) -> Option<ConjuryId> {
        self.get(id)?.return_target
    }

    pub fn set_return_target(&mut self, id: ConjuryId, target: Option<ConjuryId>) {
        if let Some(c) = self.get_mut(id) {
            c.return_target = target;
        }
    }

    pub fn wait_target(&self, id: ConjuryId) -> Option<ConjuryId> {
        self.get(id)?.wait_target
    }

    pub fn set_wait_target(&mut self, id: ConjuryId, target: Option<ConjuryId>) {
        if let Some(c) = self.get_mut(id) {
            c.wait_target = target;
        }
    }

    pub fn is_detached(&self, id: ConjuryId) -> bool {
        self.get(id).map_or(false, |c| c.detached)
    }

    pub fn set_detached(&mut self, id: ConjuryId) {
        if let Some(c) = self.get_mut(id) {
            c.detached = true;
        }
    }

    /// Borrow the body out of the arena for the duration of a call.
    pub fn take_body(&mut self, id: ConjuryId) -> Option<Box<dyn Body>> {
        self.get_mut(id)?.body.take()
    }

    pub fn restore_body(&mut self, id: ConjuryId, body: Box<dyn Body>) {
        if let Some(c) = self.get_mut(id) {
            c.body = Some(body);
        }
    }

    pub fn panic_message(&self, id: ConjuryId) -> Option<String> {
        self.get(id)?.body.as_ref()?.panicked().map(str::to_string)
    }

    /// Empty the tunnel of a generator of `G`. `None` if `id` is not one.
    pub fn take_tunnel_slot<G: 'static>(&mut self, id: ConjuryId) -> Option<Slot<G>> {
        Some(self.get_mut(id)?.tunnel_mut::<G>()?.take())
    }

    /// Make `to` the active conjury and leave the caller in `caller_state`
    /// (`None` keeps whatever state the caller already set).
    ///
    /// Returns `(from, to)` register pointers for `context::switch`. They
    /// stay valid while both conjuries are alive, since each conjury is
    /// boxed and never moves.
    pub fn enter(
        &mut self,
        to: ConjuryId,
        caller_state: Option<State>,
    ) -> Option<(*mut Registers, *const Registers)> {
        let from = self.active;
        let to_ptr = {
            let target = self.get_mut(to)?;
            target.set_state(State::Running);
            &target.context as *const Registers
        };
        let from_ptr = {
            let caller = self.get_mut(from)?;
            if let Some(state) = caller_state {
                caller.set_state(state);
            }
            &mut caller.context as *mut Registers
        };
        trace!(%from, %to, "switch");
        self.active = to;
        Some((from_ptr, to_ptr))
    }
}
