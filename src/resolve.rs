//! Unwrapping of future-like values.
//!
//! Whenever a promise is about to settle with a value that might itself be
//! future-like, the value goes through [`resolve_promise`] first. The
//! candidate is a [`Resolution`], which already tells plain values, native
//! promises and foreign thenables apart, so no value is ever probed for a
//! `then` member unless it was handed over as a thenable.
use crate::{panic_message, promise::Promise, Error};
use log::{debug, trace};
use std::{
    cell::Cell,
    fmt::{self, Debug, Formatter},
    panic::{self, AssertUnwindSafe},
    rc::Rc,
};

/// Success callback handed to a foreign thenable.
pub type OnFulfilled<T, E> = Box<dyn Fn(Resolution<T, E>)>;
/// Failure callback handed to a foreign thenable.
pub type OnRejected<E> = Box<dyn Fn(E)>;

/// The shape of a thenable's `then` member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThenMember<T> {
    Callable,
    /// `then` exists but cannot be invoked. The object is used as this plain
    /// value instead.
    NotCallable(T),
}

/// A foreign future-like object.
///
/// This is the interop surface for promise implementations that do not share
/// a type with [`Promise`]. Implementations are untrusted: they may call both
/// callbacks, call them repeatedly, or fail after calling one. Only the first
/// call has any effect.
///
/// # Examples
///
/// ```
/// use promise_aplus::{Error, OnFulfilled, OnRejected, Promise, Resolution, TaskQueue, Thenable};
///
/// struct Ready(u32);
///
/// impl Thenable<u32, Error> for Ready {
///     fn then(&self, on_fulfilled: OnFulfilled<u32, Error>, _: OnRejected<Error>) -> Result<(), Error> {
///         on_fulfilled(Resolution::Value(self.0));
///         on_fulfilled(Resolution::Value(0));
///         Ok(())
///     }
/// }
///
/// let queue = TaskQueue::new();
/// let deferred = Promise::<u32, Error>::deferred(&queue);
/// deferred.resolve(Resolution::thenable(Ready(7)));
/// assert_eq!(deferred.promise.value(), Some(7));
/// ```
pub trait Thenable<T, E> {
    /// Reads the `then` member. An error here rejects the promise being
    /// resolved and `then` is never invoked.
    fn then_member(&self) -> Result<ThenMember<T>, E> {
        Ok(ThenMember::Callable)
    }

    /// Invokes `then` with `self` as receiver.
    fn then(&self, on_fulfilled: OnFulfilled<T, E>, on_rejected: OnRejected<E>) -> Result<(), E>;

    /// The native promise behind this thenable, if there is one. Such a
    /// thenable is adopted like a [`Resolution::Promise`], identity check
    /// included.
    fn as_promise(&self) -> Option<Promise<T, E>> {
        None
    }
}

/// A candidate settlement value.
pub enum Resolution<T, E> {
    /// A plain value. Null-like payloads such as `None` or `()` live here and
    /// settle as they are.
    Value(T),
    /// A promise of this crate; its outcome is adopted.
    Promise(Promise<T, E>),
    /// A foreign future-like object; its outcome is adopted through `then`.
    Thenable(Rc<dyn Thenable<T, E>>),
}

impl<T, E> Resolution<T, E> {
    pub fn thenable<X>(thenable: X) -> Self
    where
        X: Thenable<T, E> + 'static,
    {
        Resolution::Thenable(Rc::new(thenable))
    }
}

impl<T, E> From<Promise<T, E>> for Resolution<T, E> {
    fn from(promise: Promise<T, E>) -> Self {
        Resolution::Promise(promise)
    }
}

impl<T: Debug, E> Debug for Resolution<T, E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Resolution::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Resolution::Promise(promise) => f.debug_tuple("Promise").field(&promise.status()).finish(),
            Resolution::Thenable(_) => f.debug_tuple("Thenable").field(&"<opaque>").finish(),
        }
    }
}

/// Settles `target` with `x`, unwrapping native promises and thenables
/// recursively until a plain value or a rejection is reached.
///
/// A thenable that keeps resolving with fresh thenables never terminates.
pub(crate) fn resolve_promise<T, E>(target: &Promise<T, E>, x: Resolution<T, E>)
where
    T: Clone + 'static,
    E: Clone + From<Error> + 'static,
{
    match x {
        Resolution::Value(value) => target.fulfill(value),
        Resolution::Promise(promise) => {
            if promise.ptr_eq(target) {
                debug!("promise resolved with itself, rejecting");
                target.reject(E::from(Error::SelfResolution));
                return;
            }
            trace!("adopting the state of a {:?} promise", promise.status());
            let on_value = target.clone();
            let on_reason = target.clone();
            promise.subscribe(
                move |value| resolve_promise(&on_value, Resolution::Value(value)),
                move |reason| on_reason.reject(reason),
            );
        }
        Resolution::Thenable(thenable) => match thenable.as_promise() {
            Some(promise) => resolve_promise(target, Resolution::Promise(promise)),
            None => resolve_thenable(target, thenable),
        },
    }
}

fn resolve_thenable<T, E>(target: &Promise<T, E>, thenable: Rc<dyn Thenable<T, E>>)
where
    T: Clone + 'static,
    E: Clone + From<Error> + 'static,
{
    let member = match guard(|| thenable.then_member()) {
        Ok(member) => member,
        Err(reason) => {
            debug!("reading `then` failed, rejecting");
            target.reject(reason);
            return;
        }
    };
    if let ThenMember::NotCallable(value) = member {
        trace!("`then` is not callable, settling with the object itself");
        target.fulfill(value);
        return;
    }

    let called = Rc::new(Cell::new(false));
    let on_fulfilled: OnFulfilled<T, E> = {
        let called = called.clone();
        let target = target.clone();
        Box::new(move |y| {
            if called.replace(true) {
                trace!("thenable settled more than once, ignoring");
                return;
            }
            resolve_promise(&target, y);
        })
    };
    let on_rejected: OnRejected<E> = {
        let called = called.clone();
        let target = target.clone();
        Box::new(move |reason| {
            if called.replace(true) {
                trace!("thenable settled more than once, ignoring");
                return;
            }
            target.reject(reason);
        })
    };

    if let Err(reason) = guard(|| thenable.then(on_fulfilled, on_rejected)) {
        if called.replace(true) {
            debug!("thenable failed after settling, suppressed");
        } else {
            debug!("thenable failed, rejecting");
            target.reject(reason);
        }
    }
}

/// Runs foreign code, turning a panic into an ordinary failure.
fn guard<R, E>(f: impl FnOnce() -> Result<R, E>) -> Result<R, E>
where
    E: From<Error>,
{
    panic::catch_unwind(AssertUnwindSafe(f))
        .unwrap_or_else(|payload| Err(E::from(Error::ThenablePanicked(panic_message(&*payload)))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Status, TaskQueue};

    struct Scripted {
        reads: Rc<Cell<usize>>,
        member: Result<ThenMember<i32>, Error>,
        script: fn(&OnFulfilled<i32, Error>, &OnRejected<Error>) -> Result<(), Error>,
    }

    impl Thenable<i32, Error> for Scripted {
        fn then_member(&self) -> Result<ThenMember<i32>, Error> {
            self.reads.set(self.reads.get() + 1);
            self.member.clone()
        }

        fn then(&self, on_fulfilled: OnFulfilled<i32, Error>, on_rejected: OnRejected<Error>) -> Result<(), Error> {
            (self.script)(&on_fulfilled, &on_rejected)
        }
    }

    fn scripted(
        script: fn(&OnFulfilled<i32, Error>, &OnRejected<Error>) -> Result<(), Error>,
    ) -> (Resolution<i32, Error>, Rc<Cell<usize>>) {
        let reads = Rc::new(Cell::new(0));
        let thenable = Scripted { reads: reads.clone(), member: Ok(ThenMember::Callable), script };
        (Resolution::thenable(thenable), reads)
    }

    fn settle(x: Resolution<i32, Error>) -> Promise<i32, Error> {
        let queue = TaskQueue::new();
        let deferred = Promise::deferred(&queue);
        resolve_promise(&deferred.promise, x);
        queue.run_until_idle().unwrap();
        deferred.promise
    }

    #[test]
    fn test_plain_value_settles_synchronously() {
        let queue = TaskQueue::new();
        let deferred = Promise::<i32, Error>::deferred(&queue);
        resolve_promise(&deferred.promise, Resolution::Value(3));
        assert_eq!(deferred.promise.value(), Some(3));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_self_resolution_rejects() {
        let queue = TaskQueue::new();
        let deferred = Promise::<i32, Error>::deferred(&queue);
        resolve_promise(&deferred.promise, Resolution::Promise(deferred.promise.clone()));
        assert_eq!(deferred.promise.reason(), Some(Error::SelfResolution));
    }

    #[test]
    fn test_native_promise_behind_thenable_is_checked_for_identity() {
        let queue = TaskQueue::new();
        let deferred = Promise::<i32, Error>::deferred(&queue);
        resolve_promise(&deferred.promise, Resolution::thenable(deferred.promise.clone()));
        assert_eq!(deferred.promise.reason(), Some(Error::SelfResolution));

        let other = Promise::<i32, Error>::deferred(&queue);
        let target = Promise::<i32, Error>::deferred(&queue);
        resolve_promise(&target.promise, Resolution::thenable(other.promise.clone()));
        other.fulfill(4);
        queue.run_until_idle().unwrap();
        assert_eq!(target.promise.value(), Some(4));
    }

    #[test]
    fn test_native_promise_is_adopted_on_a_later_turn() {
        let queue = TaskQueue::new();
        let inner = Promise::<i32, Error>::resolved(&queue, Resolution::Value(5));
        let outer = Promise::<i32, Error>::deferred(&queue);
        resolve_promise(&outer.promise, inner.into());
        assert_eq!(outer.promise.status(), Status::Pending);
        queue.run_until_idle().unwrap();
        assert_eq!(outer.promise.value(), Some(5));
    }

    #[test]
    fn test_first_callback_wins() {
        let (x, reads) = scripted(|on_fulfilled, on_rejected| {
            on_fulfilled(Resolution::Value(1));
            on_rejected(Error::from("late"));
            on_fulfilled(Resolution::Value(2));
            Ok(())
        });
        assert_eq!(settle(x).value(), Some(1));
        assert_eq!(reads.get(), 1);

        let (x, _) = scripted(|on_fulfilled, on_rejected| {
            on_rejected(Error::from("first"));
            on_fulfilled(Resolution::Value(2));
            Ok(())
        });
        assert_eq!(settle(x).reason(), Some(Error::from("first")));
    }

    #[test]
    fn test_failure_after_callback_is_suppressed() {
        let (x, _) = scripted(|on_fulfilled, _| {
            on_fulfilled(Resolution::Value(9));
            Err(Error::from("too late"))
        });
        assert_eq!(settle(x).value(), Some(9));
    }

    #[test]
    fn test_failure_before_callback_rejects() {
        let (x, _) = scripted(|_, _| Err(Error::from("boom")));
        assert_eq!(settle(x).reason(), Some(Error::from("boom")));
    }

    #[test]
    fn test_unreadable_then_rejects_without_invoking() {
        let reads = Rc::new(Cell::new(0));
        let thenable = Scripted {
            reads: reads.clone(),
            member: Err(Error::from("getter threw")),
            script: |_, _| panic!("then must not be invoked"),
        };
        assert_eq!(settle(Resolution::thenable(thenable)).reason(), Some(Error::from("getter threw")));
        assert_eq!(reads.get(), 1);
    }

    #[test]
    fn test_uncallable_then_settles_with_plain_value() {
        let thenable = Scripted {
            reads: Rc::default(),
            member: Ok(ThenMember::NotCallable(11)),
            script: |_, _| panic!("then must not be invoked"),
        };
        assert_eq!(settle(Resolution::thenable(thenable)).value(), Some(11));
    }

    #[test]
    fn test_panicking_thenable_rejects() {
        let (x, _) = scripted(|_, _| panic!("bad thenable"));
        assert_eq!(settle(x).reason(), Some(Error::ThenablePanicked("bad thenable".into())));
    }

    #[test]
    fn test_thenable_resolving_with_thenable_recurses() {
        let (x, _) = scripted(|on_fulfilled, _| {
            let (inner, _) = scripted(|on_fulfilled, _| {
                on_fulfilled(Resolution::Value(42));
                Ok(())
            });
            on_fulfilled(inner);
            Ok(())
        });
        assert_eq!(settle(x).value(), Some(42));
    }

    #[test]
    fn test_resolution_debug() {
        assert_eq!(format!("{:?}", Resolution::<i32, Error>::Value(1)), "Value(1)");
        let (x, _) = scripted(|_, _| Ok(()));
        assert_eq!(format!("{:?}", x), "Thenable(\"<opaque>\")");
    }
}
