//! Single-shot value cells resolved by the event loop.
//!
//! A [`Promise`] hands the result of an asynchronous read or write to user
//! code. It is worker-local (not `Send`): resolution and continuation both
//! happen inline on the owning worker thread. The continuation surface is
//! `then`; a promise transitions from pending to resolved exactly once, no
//! matter how often `resolve` is attempted.

use std::cell::RefCell;
use std::rc::Rc;

struct State<T> {
    value: Option<T>,
    callback: Option<Box<dyn FnOnce(T)>>,
    delivered: bool,
}

/// A shareable handle to a single-shot result cell.
pub struct Promise<T> {
    state: Rc<RefCell<State<T>>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            state: Rc::clone(&self.state),
        }
    }
}

impl<T> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Promise<T> {
    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(State {
                value: None,
                callback: None,
                delivered: false,
            })),
        }
    }

    /// Resolves the promise. The first call wins; the stored continuation,
    /// if any, runs inline. Later calls are ignored.
    pub fn resolve(&self, value: T) {
        let callback = {
            let mut state = self.state.borrow_mut();
            if state.delivered || state.value.is_some() {
                return;
            }
            match state.callback.take() {
                Some(callback) => {
                    state.delivered = true;
                    Some((callback, value))
                }
                None => {
                    state.value = Some(value);
                    None
                }
            }
        };
        // The continuation runs outside the borrow so it may create or
        // resolve further promises.
        if let Some((callback, value)) = callback {
            callback(value);
        }
    }

    /// Attaches the continuation. Runs immediately when the value is
    /// already in; a promise delivers to at most one continuation.
    pub fn then<F>(&self, callback: F)
    where
        F: FnOnce(T) + 'static,
    {
        let ready = {
            let mut state = self.state.borrow_mut();
            if state.delivered {
                return;
            }
            match state.value.take() {
                Some(value) => {
                    state.delivered = true;
                    Some(value)
                }
                None => {
                    state.callback = Some(Box::new(callback));
                    return;
                }
            }
        };
        if let Some(value) = ready {
            callback(value);
        }
    }

    /// Whether the value has been produced (delivered or still waiting for
    /// its continuation).
    pub fn is_resolved(&self) -> bool {
        let state = self.state.borrow();
        state.delivered || state.value.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn continuation_after_resolve_fires_immediately() {
        let promise = Promise::new();
        promise.resolve(7);
        let seen = Rc::new(RefCell::new(None));
        let sink = Rc::clone(&seen);
        promise.then(move |v| *sink.borrow_mut() = Some(v));
        assert_eq!(*seen.borrow(), Some(7));
    }

    #[test]
    fn continuation_before_resolve_fires_on_resolve() {
        let promise = Promise::new();
        let seen = Rc::new(RefCell::new(None));
        let sink = Rc::clone(&seen);
        promise.then(move |v: i32| *sink.borrow_mut() = Some(v));
        assert_eq!(*seen.borrow(), None);
        promise.resolve(42);
        assert_eq!(*seen.borrow(), Some(42));
    }

    #[test]
    fn second_resolve_is_ignored() {
        let promise = Promise::new();
        let hits = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&hits);
        promise.then(move |v: i32| sink.borrow_mut().push(v));
        promise.resolve(1);
        promise.resolve(2);
        assert_eq!(*hits.borrow(), vec![1]);
    }

    #[test]
    fn chained_promise_created_inside_continuation() {
        let outer = Promise::new();
        let inner = Promise::new();
        let seen = Rc::new(RefCell::new(0));
        let sink = Rc::clone(&seen);
        let chained = inner.clone();
        outer.then(move |v: i32| {
            chained.then(move |w: i32| *sink.borrow_mut() = v + w);
        });
        outer.resolve(40);
        inner.resolve(2);
        assert_eq!(*seen.borrow(), 42);
    }
}
