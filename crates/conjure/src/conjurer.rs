// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! The conjurer: spawn, wait, yield, suspend, resume and the generator
//! protocol.
//!
//! Every control transfer goes through `Core::switch_unchecked`, which takes
//! the register pointers out of the stage and drops the `RefCell` borrow
//! before the stack changes. No borrow of `stage` or `scheduler` may be
//! alive across a switch.

use std::any::type_name;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::mem::ManuallyDrop;
use std::rc::{Rc, Weak};
use std::thread::{self, Thread};

use tracing::{debug, warn};

use crate::config::Config;
use crate::conjury::{Conjury, ConjuryId};
use crate::context;
use crate::error::{ConjureError, Result};
use crate::handle::{Generator, Handle};
use crate::scheduler::{self, Scheduler, SCHEDULER_STACK_SIZE};
use crate::stage::Stage;
use crate::state::{State, Waker};
use crate::tunnel::Slot;
use crate::wrapper::{take_result, FunctionWrapper};

/// Shared runtime state behind a `Conjurer`.
///
/// The scheduler is declared before the stage so that readiness predicates
/// are dropped while the stacks they may point into are still mapped.
pub(crate) struct Core {
    pub scheduler: RefCell<Scheduler>,
    pub stage: RefCell<Stage>,
    pub scheduler_id: ConjuryId,
    pub main_id: ConjuryId,
    /// Set by the scheduler when it hands control back to main on
    /// starvation. Holds the number of conjuries left suspended.
    pub deadlock: Cell<Option<usize>>,
    /// Thread that owns this conjurer. `Waker`s unpark it.
    pub thread: Thread,
}

extern "C" fn scheduler_entry(arg: usize) -> ! {
    // SAFETY: `arg` is the address of the Core owning this conjury. The
    // scheduler only runs while that Core is alive.
    let core = unsafe { &*(arg as *const Core) };
    scheduler::run(core)
}

extern "C" fn conjury_entry(arg: usize) -> ! {
    // Borrow the caller's Rc without touching the count; the Core is only
    // freed from main, when no conjury is running.
    // SAFETY: `arg` came from `Rc::as_ptr` of the owning Core.
    let conjurer = ManuallyDrop::new(Conjurer {
        core: unsafe { Rc::from_raw(arg as *const Core) },
    });
    let core = &conjurer.core;
    let me = core.active();
    let body = core.stage.borrow_mut().take_body(me);
    if let Some(mut body) = body {
        body.call(&conjurer);
        core.stage.borrow_mut().restore_body(me, body);
    }
    core.end()
}

impl Core {
    pub fn active(&self) -> ConjuryId {
        self.stage.borrow().active()
    }

    pub fn state(&self, id: ConjuryId) -> Option<State> {
        self.stage.borrow().state(id)
    }

    fn name(&self, id: ConjuryId) -> String {
        self.stage.borrow().name(id)
    }

    /// Switch to `to` without checking its state.
    pub fn switch_unchecked(&self, to: ConjuryId, caller_state: Option<State>) {
        let regs = self.stage.borrow_mut().enter(to, caller_state);
        if let Some((from, to)) = regs {
            // SAFETY: both register blocks belong to boxed conjuries owned
            // by the stage, and no RefCell borrow is held.
            unsafe { context::switch(from, to) };
        }
    }

    /// Hand control to `to`, dropping any queued entry it still has.
    fn transfer(&self, to: ConjuryId, caller_state: State) {
        self.scheduler.borrow_mut().forget(to);
        self.switch_unchecked(to, Some(caller_state));
    }

    /// True if `to` finished or is gone (nothing to do) or control went
    /// there and came back; false if `to` cannot run right now.
    fn switch_to(&self, to: ConjuryId, caller_state: State) -> bool {
        match self.state(to) {
            None | Some(State::Finished) => true,
            Some(s) if !s.is_executable() => false,
            Some(_) => {
                self.transfer(to, caller_state);
                true
            }
        }
    }

    fn yield_to_scheduler(&self, caller_state: State) {
        self.switch_unchecked(self.scheduler_id, Some(caller_state));
    }

    fn take_deadlock(&self) -> Option<ConjureError> {
        self.deadlock
            .take()
            .map(|suspended| ConjureError::Deadlock { suspended })
    }

    /// Record `waiter` as the one blocked on `target`.
    fn claim(&self, waiter: ConjuryId, target: ConjuryId) -> Result<()> {
        let mut stage = self.stage.borrow_mut();
        if !stage.contains(target) {
            return Err(ConjureError::UnknownConjury(target));
        }
        let holder = if target == waiter {
            Some(waiter)
        } else {
            stage
                .return_target(target)
                .filter(|h| *h != waiter && stage.wait_target(*h) == Some(target))
        };
        if let Some(holder) = holder {
            let err = ConjureError::InconsistentWait {
                waiter: stage.name(waiter),
                target: stage.name(target),
                holder: stage.name(holder),
            };
            warn!(%err, "rejected wait");
            return Err(err);
        }
        stage.set_return_target(target, Some(waiter));
        stage.set_wait_target(waiter, Some(target));
        Ok(())
    }

    fn release(&self, waiter: ConjuryId, target: ConjuryId) {
        let mut stage = self.stage.borrow_mut();
        stage.set_wait_target(waiter, None);
        if stage.return_target(target) == Some(waiter) {
            stage.set_return_target(target, None);
        }
    }

    /// Conjury blocked in `wait`/`gen_move_next` on `id`, if any.
    fn waiter_of(&self, id: ConjuryId) -> Option<ConjuryId> {
        let stage = self.stage.borrow();
        stage
            .return_target(id)
            .filter(|w| stage.wait_target(*w) == Some(id))
    }

    /// Destroy a finished conjury and surface a panic of its body.
    fn reap(&self, id: ConjuryId) -> Result<Box<Conjury>> {
        let name = self.name(id);
        let panicked = self.stage.borrow().panic_message(id);
        let reaped = self.stage.borrow_mut().destroy(id);
        let conjury = reaped.ok_or(ConjureError::UnknownConjury(id))?;
        debug!(conjury = %name, "reaped");
        match panicked {
            Some(message) => Err(ConjureError::Panicked {
                conjury: name,
                message,
            }),
            None => Ok(conjury),
        }
    }

    /// Block the active conjury on `target` until it finishes or hands
    /// back a value. Returns with the claim still held.
    fn block_on(&self, target: ConjuryId) {
        if !self.switch_to(target, State::Waiting) {
            self.yield_to_scheduler(State::Waiting);
        }
    }

    fn resume(&self, target: ConjuryId) -> bool {
        let me = self.active();
        if target == me {
            return false;
        }
        match self.state(target) {
            Some(s) if s.is_executable() => {}
            _ => return false,
        }
        {
            let mut stage = self.stage.borrow_mut();
            let held = stage
                .return_target(target)
                .map_or(false, |h| h != me && stage.wait_target(h) == Some(target));
            if !held {
                stage.set_return_target(target, Some(me));
            }
        }
        self.scheduler.borrow_mut().register_ready(me);
        self.transfer(target, State::Ready);
        true
    }

    fn yield_now(&self) {
        let me = self.active();
        let back = self
            .stage
            .borrow()
            .return_target(me)
            .filter(|rt| self.state(*rt).map_or(false, State::is_executable));
        if let Some(back) = back {
            // A consumer made ready by `generate` asks for the next value
            // itself; only requeue when nobody is waiting on us.
            if self.stage.borrow().wait_target(back) != Some(me) {
                self.scheduler.borrow_mut().register_ready(me);
            }
            self.transfer(back, State::Ready);
            return;
        }
        self.scheduler.borrow_mut().register_ready(me);
        self.yield_to_scheduler(State::Ready);
    }

    fn suspend(&self, ready_pred: Option<scheduler::ReadyPredicate>) -> Result<()> {
        let me = self.active();
        self.scheduler
            .borrow_mut()
            .register_suspended(me, ready_pred);
        self.yield_to_scheduler(State::Suspended);
        match self.take_deadlock() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Finish the active conjury. Called once its body has returned.
    ///
    /// Only a conjury blocked on this one gets control directly. A resumer
    /// is already on the ready queue and keeps its place there.
    fn end(&self) -> ! {
        let me = self.active();
        debug!(conjury = %self.name(me), "ending");
        if self.stage.borrow().is_detached(me) {
            self.scheduler.borrow_mut().bury(me);
        }
        match self.waiter_of(me) {
            Some(waiter) => self.transfer(waiter, State::Finished),
            None => self.yield_to_scheduler(State::Finished),
        }
        unreachable!("finished conjury was resumed")
    }

    /// Throw away a generator's producer that will never be resumed.
    pub fn discard(&self, id: ConjuryId) {
        match self.state(id) {
            None | Some(State::Running) => return,
            Some(_) => {}
        }
        self.scheduler.borrow_mut().forget(id);
        let removed = self.stage.borrow_mut().remove(id);
        if let Some(conjury) = &removed {
            debug!(conjury = %conjury.name, state = %conjury.state(), "discarded generator");
        }
        drop(removed);
    }
}

/// Owner of a set of conjuries sharing one thread.
///
/// The thread that creates a `Conjurer` becomes its main conjury. Bodies
/// receive `&Conjurer` and use it for every control transfer.
pub struct Conjurer {
    core: Rc<Core>,
}

impl Conjurer {
    pub fn new() -> Self {
        let core = Rc::new_cyclic(|weak: &Weak<Core>| {
            let mut stage = Stage::new();
            let main_id = stage.active();
            let scheduler = Conjury::new(
                Config::named("__scheduler__").stack_size(SCHEDULER_STACK_SIZE),
                scheduler_entry,
                weak.as_ptr() as usize,
            );
            let scheduler_id = stage.manage(scheduler);
            Core {
                scheduler: RefCell::new(Scheduler::new()),
                stage: RefCell::new(stage),
                scheduler_id,
                main_id,
                deadlock: Cell::new(None),
                thread: thread::current(),
            }
        });
        debug!("conjurer started");
        Self { core }
    }

    /// Create a conjury running `f`. It does not start until it is waited
    /// on, resumed, or detached.
    pub fn conjure<T, F>(&self, config: Config, f: F) -> Handle<T>
    where
        T: 'static,
        F: FnOnce(&Conjurer) -> T + 'static,
    {
        let name = config.name.clone();
        let conjury = Conjury::new(config, conjury_entry, Rc::as_ptr(&self.core) as usize)
            .with_body(Box::new(FunctionWrapper::new(f)));
        let id = self.core.stage.borrow_mut().manage(conjury);
        debug!(conjury = %name, %id, "conjured");
        Handle::new(id)
    }

    /// Create a generator conjury producing `G`s through `yield_with` or
    /// `generate`.
    pub fn generator<G, F>(&self, config: Config, f: F) -> Generator<G>
    where
        G: 'static,
        F: FnOnce(&Conjurer) + 'static,
    {
        let name = config.name.clone();
        let conjury = Conjury::new(config, conjury_entry, Rc::as_ptr(&self.core) as usize)
            .with_body(Box::new(FunctionWrapper::new(f)))
            .with_tunnel::<G>();
        let id = self.core.stage.borrow_mut().manage(conjury);
        debug!(conjury = %name, %id, value_type = type_name::<G>(), "conjured generator");
        Generator::new(id, Rc::downgrade(&self.core))
    }

    /// Block until `handle`'s conjury finishes and return its value. The
    /// conjury is destroyed afterwards.
    pub fn wait<T: 'static>(&self, handle: Handle<T>) -> Result<T> {
        let core = &self.core;
        let me = core.active();
        let target = handle.id();
        core.claim(me, target)?;
        core.block_on(target);
        loop {
            if let Some(err) = core.take_deadlock() {
                core.release(me, target);
                return Err(err);
            }
            match core.state(target) {
                None | Some(State::Finished) => break,
                Some(_) => core.yield_to_scheduler(State::Waiting),
            }
        }
        core.release(me, target);

        let name = core.name(target);
        let mut conjury = core.reap(target)?;
        let outcome = conjury
            .body
            .as_mut()
            .and_then(|body| take_result::<T>(&mut **body));
        drop(conjury);
        match outcome {
            Some(Ok(value)) => Ok(value),
            Some(Err(message)) => Err(ConjureError::Panicked {
                conjury: name,
                message,
            }),
            None => Err(ConjureError::UnknownConjury(target)),
        }
    }

    /// Run `handle`'s conjury now; the caller goes back on the ready queue.
    /// False if the conjury is not in a runnable state.
    pub fn resume<T>(&self, handle: Handle<T>) -> bool {
        self.core.resume(handle.id())
    }

    /// Give up the processor. Goes straight back to a runnable return
    /// target if there is one, else through the scheduler.
    pub fn yield_now(&self) {
        self.core.yield_now();
    }

    /// Suspend until woken through `wake` or a `Waker`.
    pub fn suspend(&self) -> Result<()> {
        self.core.suspend(None)
    }

    /// Suspend until `ready` returns true or the conjury is woken.
    ///
    /// `ready` runs on the scheduler's stack between passes. It may read
    /// shared state and query the conjurer, but must not transfer control.
    pub fn suspend_on<P>(&self, ready: P) -> Result<()>
    where
        P: FnMut() -> bool,
    {
        let ready: Box<dyn FnMut() -> bool + '_> = Box::new(ready);
        // SAFETY: the entry is removed from the suspended set before this
        // frame can resume, so the predicate never outlives its borrows
        // while it is still callable.
        let ready: scheduler::ReadyPredicate = unsafe { std::mem::transmute(ready) };
        self.core.suspend(Some(ready))
    }

    /// Return once `ready` holds, suspending as long as it does not.
    pub fn suspend_until<P>(&self, mut ready: P) -> Result<()>
    where
        P: FnMut() -> bool,
    {
        while !ready() {
            self.suspend_on(&mut ready)?;
        }
        Ok(())
    }

    /// Make a suspended conjury ready. A wake that finds it not suspended
    /// is remembered for its next plain `suspend`.
    pub fn wake<T>(&self, handle: Handle<T>) -> bool {
        let cell = self.core.stage.borrow().state_cell(handle.id());
        cell.map_or(false, |c| c.wake())
    }

    /// Cross-thread wake handle for the active conjury.
    pub fn waker(&self) -> Waker {
        let cell = {
            let stage = self.core.stage.borrow();
            stage.state_cell(stage.active())
        };
        let cell = cell.expect("active conjury missing from stage");
        Waker::new(cell, self.core.thread.clone())
    }

    /// Nobody will wait on `handle`. The conjury starts if it has not yet,
    /// and is destroyed by the scheduler once it finishes.
    pub fn detach<T>(&self, handle: Handle<T>) {
        let id = handle.id();
        match self.core.state(id) {
            None => {}
            Some(State::Finished) => {
                let reaped = self.core.stage.borrow_mut().destroy(id);
                drop(reaped);
            }
            Some(state) => {
                self.core.stage.borrow_mut().set_detached(id);
                if state == State::Initial {
                    self.core.scheduler.borrow_mut().register_ready(id);
                }
                debug!(conjury = %self.core.name(id), "detached");
            }
        }
    }

    /// Hand `value` by reference to the consumer blocked in `gen_move_next`
    /// and switch to it. Resumes when the consumer asks for the next value.
    pub fn yield_with<G: 'static>(&self, value: &G) -> Result<()> {
        let core = &self.core;
        let me = core.active();
        let consumer = self.check_producer::<G>(me)?;
        let passed = {
            let mut stage = core.stage.borrow_mut();
            stage
                .get_mut(me)
                .and_then(|c| c.tunnel_mut::<G>())
                .map(|t| t.pass(value))
        };
        if passed != Some(true) {
            return Err(ConjureError::TunnelOccupied {
                conjury: core.name(me),
            });
        }
        core.scheduler.borrow_mut().forget(me);
        core.transfer(consumer, State::Ready);
        Ok(())
    }

    /// Move `value` into the tunnel and make the consumer ready without
    /// switching. The next `yield_now` goes straight to the consumer.
    pub fn generate<G: 'static>(&self, value: G) -> Result<()> {
        let core = &self.core;
        let me = core.active();
        let consumer = self.check_producer::<G>(me)?;
        let passed = {
            let mut stage = core.stage.borrow_mut();
            stage
                .get_mut(me)
                .and_then(|c| c.tunnel_mut::<G>())
                .map(|t| t.pass_owned(value).is_ok())
        };
        if passed != Some(true) {
            return Err(ConjureError::TunnelOccupied {
                conjury: core.name(me),
            });
        }
        core.stage.borrow().set_state(consumer, State::Ready);
        core.scheduler.borrow_mut().register_ready(consumer);
        Ok(())
    }

    /// The active conjury must be a generator of `G` with a consumer
    /// blocked on it. Returns the consumer.
    fn check_producer<G: 'static>(&self, me: ConjuryId) -> Result<ConjuryId> {
        let is_generator = {
            let mut stage = self.core.stage.borrow_mut();
            stage
                .get_mut(me)
                .map_or(false, |c| c.tunnel_mut::<G>().is_some())
        };
        let consumer = self.core.waiter_of(me);
        match consumer {
            Some(consumer) if is_generator => Ok(consumer),
            _ => {
                let err = ConjureError::InvalidYieldContext {
                    conjury: self.core.name(me),
                    value_type: type_name::<G>(),
                };
                warn!(%err, "rejected yield");
                Err(err)
            }
        }
    }

    /// Run the generator until it yields its next value or finishes.
    ///
    /// `Ok(None)` means exhausted; the producer has been destroyed. The
    /// returned reference is valid until the next call on `generator`.
    pub fn gen_move_next<'g, G: 'static>(
        &self,
        generator: &'g mut Generator<G>,
    ) -> Result<Option<&'g G>> {
        generator.current = Slot::Empty;
        if generator.exhausted {
            return Ok(None);
        }
        let target = generator.id();
        if !generator.belongs_to(&self.core) {
            return Err(ConjureError::UnknownConjury(target));
        }
        let core = &self.core;
        let me = core.active();
        core.claim(me, target)?;
        core.block_on(target);

        loop {
            if let Some(err) = core.take_deadlock() {
                core.release(me, target);
                return Err(err);
            }
            let finished = core.state(target) == Some(State::Finished);
            let slot = core.stage.borrow_mut().take_tunnel_slot::<G>(target);
            let Some(slot) = slot else {
                core.release(me, target);
                generator.exhausted = true;
                return Err(ConjureError::UnknownConjury(target));
            };
            if !slot.is_empty() {
                core.release(me, target);
                generator.current = slot;
                // SAFETY: a borrowed value lives in the producer's frame,
                // which stays put until the producer is resumed; that needs
                // `&mut generator` again.
                return Ok(unsafe { generator.current.get() });
            }
            if finished {
                core.release(me, target);
                generator.exhausted = true;
                debug!(conjury = %core.name(target), "generator exhausted");
                let reaped = core.reap(target);
                return reaped.map(|_| None);
            }
            core.yield_to_scheduler(State::Waiting);
        }
    }

    /// `None` once the conjury has been reaped.
    pub fn state<T>(&self, handle: Handle<T>) -> Option<State> {
        self.core.state(handle.id())
    }

    pub fn is_finished<T>(&self, handle: Handle<T>) -> bool {
        self.state(handle) == Some(State::Finished)
    }

    /// Name of the conjury currently running.
    pub fn active_name(&self) -> String {
        let core = &self.core;
        core.name(core.active())
    }

    /// Conjuries created and not yet destroyed, excluding main and the
    /// scheduler.
    pub fn live_conjuries(&self) -> usize {
        self.core.stage.borrow().live() - 2
    }
}

impl Default for Conjurer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Conjurer {
    fn drop(&mut self) {
        // Freeing the core unmaps every stack, including the one we would
        // be running on if this happens inside a body. Keep it alive then.
        let on_main = self.core.active() == self.core.main_id;
        if Rc::strong_count(&self.core) == 1 && !on_main {
            std::mem::forget(Rc::clone(&self.core));
        }
    }
}

impl fmt::Debug for Conjurer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conjurer")
            .field("active", &self.active_name())
            .field("live", &self.live_conjuries())
            .finish()
    }
}
