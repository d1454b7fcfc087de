// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! One-slot handoff between a generator and its consumer.

use std::ptr::NonNull;

/// Content of a tunnel or of a generator's current-value slot.
#[derive(Debug)]
pub(crate) enum Slot<G> {
    Empty,
    /// Points into the producer's frame. Valid until the producer resumes.
    Borrowed(NonNull<G>),
    Owned(G),
}

impl<G> Default for Slot<G> {
    fn default() -> Self {
        Slot::Empty
    }
}

impl<G> Slot<G> {
    pub fn is_empty(&self) -> bool {
        matches!(self, Slot::Empty)
    }

    /// # Safety
    /// A `Borrowed` pointer must still be valid.
    pub unsafe fn get(&self) -> Option<&G> {
        match self {
            Slot::Empty => None,
            Slot::Borrowed(p) => Some(p.as_ref()),
            Slot::Owned(v) => Some(v),
        }
    }
}

/// Holds at most one pending value from `yield_with` or `generate`.
#[derive(Debug)]
pub(crate) struct ValueTunnel<G> {
    slot: Slot<G>,
}

impl<G> ValueTunnel<G> {
    pub fn new() -> Self {
        Self { slot: Slot::Empty }
    }

    /// Publish a reference. False if a value is already pending.
    pub fn pass(&mut self, value: &G) -> bool {
        if !self.slot.is_empty() {
            return false;
        }
        self.slot = Slot::Borrowed(NonNull::from(value));
        true
    }

    /// Publish an owned value. Hands it back if the slot is occupied.
    pub fn pass_owned(&mut self, value: G) -> Result<(), G> {
        if !self.slot.is_empty() {
            return Err(value);
        }
        self.slot = Slot::Owned(value);
        Ok(())
    }

    pub fn take(&mut self) -> Slot<G> {
        std::mem::take(&mut self.slot)
    }

    pub fn is_empty(&self) -> bool {
        self.slot.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_pass_fails_while_pending() {
        let a = 1;
        let b = 2;
        let mut tunnel = ValueTunnel::new();
        assert!(tunnel.pass(&a));
        assert!(!tunnel.pass(&b));
        assert_eq!(tunnel.pass_owned(3), Err(3));

        let slot = tunnel.take();
        assert_eq!(unsafe { slot.get() }, Some(&1));
        assert!(tunnel.is_empty());
        assert!(tunnel.pass(&b));
    }

    #[test]
    fn owned_value_moves_through() {
        let mut tunnel = ValueTunnel::new();
        tunnel.pass_owned(String::from("hi")).unwrap();
        match tunnel.take() {
            Slot::Owned(s) => assert_eq!(s, "hi"),
            other => panic!("unexpected slot: {:?}", other),
        }
        assert!(matches!(tunnel.take(), Slot::Empty));
    }
}
