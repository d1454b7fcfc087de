// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Typed handles to conjuries.

use std::fmt;
use std::marker::PhantomData;
use std::rc::{Rc, Weak};

use tracing::warn;

use crate::conjurer::{Conjurer, Core};
use crate::conjury::ConjuryId;
use crate::tunnel::Slot;

/// Reference to a conjury whose body returns `T`.
///
/// Consumed by `Conjurer::wait` or `Conjurer::detach`. Copies are cheap;
/// once the conjury is reaped every copy goes stale and operations on it
/// report `UnknownConjury` or return false.
pub struct Handle<T> {
    id: ConjuryId,
    _result: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    pub(crate) fn new(id: ConjuryId) -> Self {
        Self {
            id,
            _result: PhantomData,
        }
    }

    pub fn id(&self) -> ConjuryId {
        self.id
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Handle").field(&self.id).finish()
    }
}

/// Consumer side of a generator conjury.
///
/// Dropping a generator that is not exhausted discards its producer: the
/// stack is freed and whatever still lives on it is leaked.
pub struct Generator<G> {
    id: ConjuryId,
    core: Weak<Core>,
    pub(crate) current: Slot<G>,
    pub(crate) exhausted: bool,
}

impl<G> Generator<G> {
    pub(crate) fn new(id: ConjuryId, core: Weak<Core>) -> Self {
        Self {
            id,
            core,
            current: Slot::Empty,
            exhausted: false,
        }
    }

    pub fn id(&self) -> ConjuryId {
        self.id
    }

    /// True once `gen_move_next` has reported the end of the sequence.
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Value produced by the last successful `gen_move_next`.
    pub fn current(&self) -> Option<&G> {
        if self.core.strong_count() == 0 {
            return None;
        }
        // SAFETY: the producer stays parked until the next `gen_move_next`,
        // which needs `&mut self`.
        unsafe { self.current.get() }
    }

    pub(crate) fn belongs_to(&self, core: &Rc<Core>) -> bool {
        self.core.as_ptr() == Rc::as_ptr(core)
    }

    /// Iterate over clones of the remaining values.
    pub fn iter<'a>(&'a mut self, conjurer: &'a Conjurer) -> GenIter<'a, G> {
        GenIter {
            generator: self,
            conjurer,
        }
    }
}

impl<G> Drop for Generator<G> {
    fn drop(&mut self) {
        self.current = Slot::Empty;
        if self.exhausted {
            return;
        }
        if let Some(core) = self.core.upgrade() {
            core.discard(self.id);
        }
    }
}

impl<G> fmt::Debug for Generator<G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Generator")
            .field("id", &self.id)
            .field("exhausted", &self.exhausted)
            .finish()
    }
}

/// Iterator over a generator's values. Errors end the iteration.
pub struct GenIter<'a, G> {
    generator: &'a mut Generator<G>,
    conjurer: &'a Conjurer,
}

impl<G: Clone + 'static> Iterator for GenIter<'_, G> {
    type Item = G;

    fn next(&mut self) -> Option<G> {
        match self.conjurer.gen_move_next(self.generator) {
            Ok(value) => value.cloned(),
            Err(err) => {
                warn!(%err, "generator iteration aborted");
                None
            }
        }
    }
}
