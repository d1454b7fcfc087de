// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Type-erased conjury bodies.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

use crate::conjurer::Conjurer;

/// Outcome of a body: its value, or the panic message.
pub(crate) type Outcome<T> = Result<T, String>;

/// What a conjury runs. Called exactly once, on the conjury's own stack.
pub(crate) trait Body {
    fn call(&mut self, conjurer: &Conjurer);

    /// `&mut Option<Outcome<T>>` behind `Any`, for `take_result::<T>`.
    fn result_store(&mut self) -> &mut dyn Any;

    fn panicked(&self) -> Option<&str>;
}

/// Holds the callable until it runs, then its outcome until it is taken.
pub(crate) struct FunctionWrapper<F, T> {
    f: Option<F>,
    result: Option<Outcome<T>>,
}

impl<F, T> FunctionWrapper<F, T>
where
    F: FnOnce(&Conjurer) -> T,
{
    pub fn new(f: F) -> Self {
        Self {
            f: Some(f),
            result: None,
        }
    }
}

impl<F, T> Body for FunctionWrapper<F, T>
where
    F: FnOnce(&Conjurer) -> T + 'static,
    T: 'static,
{
    fn call(&mut self, conjurer: &Conjurer) {
        let Some(f) = self.f.take() else {
            return;
        };
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| f(conjurer)));
        self.result = Some(outcome.map_err(|payload| panic_message(&*payload)));
    }

    fn result_store(&mut self) -> &mut dyn Any {
        &mut self.result
    }

    fn panicked(&self) -> Option<&str> {
        match &self.result {
            Some(Err(msg)) => Some(msg.as_str()),
            _ => None,
        }
    }
}

/// Pull a typed outcome out of a finished body. `None` if the body has not
/// produced one or `T` is not its result type.
pub(crate) fn take_result<T: 'static>(body: &mut dyn Body) -> Option<Outcome<T>> {
    body.result_store()
        .downcast_mut::<Option<Outcome<T>>>()
        .and_then(Option::take)
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "conjury panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_message_variants() {
        let boxed: Box<dyn Any + Send> = Box::new("static str");
        assert_eq!(panic_message(&*boxed), "static str");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(&*boxed), "owned");
        let boxed: Box<dyn Any + Send> = Box::new(42u32);
        assert_eq!(panic_message(&*boxed), "conjury panicked");
    }

    #[test]
    fn take_result_checks_type() {
        let mut wrapper = FunctionWrapper::new(|_: &Conjurer| 5u32);
        wrapper.result = Some(Ok(5));
        assert!(take_result::<String>(&mut wrapper).is_none());
        assert_eq!(take_result::<u32>(&mut wrapper), Some(Ok(5)));
        assert!(take_result::<u32>(&mut wrapper).is_none());
    }

    #[test]
    fn panicked_reports_message() {
        let mut wrapper = FunctionWrapper::new(|_: &Conjurer| ());
        assert!(wrapper.panicked().is_none());
        wrapper.result = Some(Err("boom".to_string()));
        assert_eq!(wrapper.panicked(), Some("boom"));
    }
}
