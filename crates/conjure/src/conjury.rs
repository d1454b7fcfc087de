// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! The coroutine entity.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::config::Config;
use crate::context::{Entry, Registers};
use crate::stack::Stack;
use crate::state::{State, StateCell};
use crate::tunnel::ValueTunnel;
use crate::wrapper::Body;

/// Generational index of a conjury in its stage. A reaped slot gets a new
/// generation, so stale ids never alias a newer conjury.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ConjuryId {
    index: u32,
    generation: u32,
}

impl ConjuryId {
    pub(crate) fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    pub(crate) fn index(self) -> usize {
        self.index as usize
    }

    pub(crate) fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Display for ConjuryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

/// A stackful coroutine.
///
/// `body` holds the wrapped callable and its result slot; generator
/// conjuries additionally carry a `ValueTunnel<G>` behind `tunnel`. The
/// main conjury has neither a stack nor a body.
pub(crate) struct Conjury {
    pub name: String,
    pub state: Arc<StateCell>,
    pub context: Registers,
    pub stack: Option<Stack>,
    /// Conjury blocked in `wait`/`gen_move_next` on this one.
    pub return_target: Option<ConjuryId>,
    /// Conjury this one is blocked on.
    pub wait_target: Option<ConjuryId>,
    /// Nobody will wait; the scheduler reaps it once finished.
    pub detached: bool,
    pub body: Option<Box<dyn Body>>,
    pub tunnel: Option<Box<dyn Any>>,
}

impl Conjury {
    /// The thread's original context. Already running, no stack.
    pub fn main() -> Self {
        Self {
            name: "__main__".to_string(),
            state: StateCell::new(State::Running),
            context: Registers::default(),
            stack: None,
            return_target: None,
            wait_target: None,
            detached: false,
            body: None,
            tunnel: None,
        }
    }

    pub fn new(config: Config, entry: Entry, arg: usize) -> Self {
        let stack = Stack::new(config.stack_size);
        let context = Registers::prepare(&stack, entry, arg);
        Self {
            name: config.name,
            state: StateCell::new(State::Initial),
            context,
            stack: Some(stack),
            return_target: None,
            wait_target: None,
            detached: false,
            body: None,
            tunnel: None,
        }
    }

    pub fn with_body(mut self, body: Box<dyn Body>) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_tunnel<G: 'static>(mut self) -> Self {
        self.tunnel = Some(Box::new(ValueTunnel::<G>::new()));
        self
    }

    pub fn state(&self) -> State {
        self.state.load()
    }

    pub fn set_state(&self, state: State) {
        self.state.store(state);
    }

    pub fn tunnel_mut<G: 'static>(&mut self) -> Option<&mut ValueTunnel<G>> {
        self.tunnel.as_mut()?.downcast_mut::<ValueTunnel<G>>()
    }
}

impl fmt::Debug for Conjury {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conjury")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("return_target", &self.return_target)
            .field("wait_target", &self.wait_target)
            .field("detached", &self.detached)
            .finish()
    }
}
