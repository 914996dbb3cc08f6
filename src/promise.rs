//! The promise state machine and its chaining operator.
//!
//! A [`Promise`] starts pending and settles at most once. Settlement is
//! synchronous: it moves the promise to its final state and then runs every
//! queued continuation in registration order. Continuations only schedule the
//! user's handler on the promise's [`Schedule`], so handlers always run on a
//! later turn.
use crate::{
    panic_message,
    resolve::{resolve_promise, OnFulfilled, OnRejected, Resolution, Thenable},
    scheduler::Schedule,
    Error,
};
use log::{debug, trace};
use std::{
    cell::{Cell, RefCell},
    fmt::{self, Debug, Formatter},
    future::Future,
    mem,
    panic::{self, AssertUnwindSafe},
    pin::Pin,
    rc::Rc,
    task::{Context, Poll, Waker},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Pending,
    Fulfilled,
    Rejected,
}

type Callback<A> = Box<dyn FnOnce(A)>;
type Handler<A, U, E> = Box<dyn FnOnce(A) -> Result<Resolution<U, E>, E>>;

enum State<T, E> {
    Pending {
        on_fulfilled: Vec<Callback<T>>,
        on_rejected: Vec<Callback<E>>,
        wakers: Vec<Waker>,
    },
    Fulfilled(T),
    Rejected(E),
}

/// What a derived promise does with its parent's outcome.
enum Reaction<A, U, E> {
    /// Run a user handler and resolve with whatever it returns.
    Call(Handler<A, U, E>),
    /// No handler was given: hand the outcome on unchanged.
    Forward(fn(A) -> Result<U, E>),
}

/// The eventual result of an asynchronous operation.
///
/// Cloning a `Promise` clones the handle, not the state: every clone observes
/// the same settlement.
pub struct Promise<T, E = Error> {
    state: Rc<RefCell<State<T, E>>>,
    scheduler: Rc<dyn Schedule>,
}

impl<T, E> Clone for Promise<T, E> {
    fn clone(&self) -> Self {
        Self { state: self.state.clone(), scheduler: self.scheduler.clone() }
    }
}

impl<T, E> Debug for Promise<T, E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise").field("status", &self.status()).finish()
    }
}

impl<T, E> Promise<T, E> {
    pub fn status(&self) -> Status {
        match *self.state.borrow() {
            State::Pending { .. } => Status::Pending,
            State::Fulfilled(_) => Status::Fulfilled,
            State::Rejected(_) => Status::Rejected,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status() == Status::Pending
    }

    pub fn is_settled(&self) -> bool {
        !self.is_pending()
    }

    /// Whether both handles refer to the same promise.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.state, &other.state)
    }

    fn pending(scheduler: Rc<dyn Schedule>) -> Self {
        Self {
            state: Rc::new(RefCell::new(State::Pending {
                on_fulfilled: vec![],
                on_rejected: vec![],
                wakers: vec![],
            })),
            scheduler,
        }
    }
}

impl<T, E> Promise<T, E>
where
    T: Clone + 'static,
    E: Clone + From<Error> + 'static,
{
    /// Creates a promise and runs `executor` on it right away.
    ///
    /// The executor receives the promise's [`Settler`]. Returning `Err` from
    /// the executor rejects the promise, unless the settler was used first.
    /// A panicking executor is not caught.
    ///
    /// # Examples
    ///
    /// ```
    /// use promise_aplus::{Error, Promise, TaskQueue};
    ///
    /// let queue = TaskQueue::new();
    /// let promise = Promise::<&str, Error>::new(&queue, |settler| {
    ///     settler.fulfill("🍓");
    ///     Ok(())
    /// });
    /// assert_eq!(promise.value(), Some("🍓"));
    ///
    /// let failed = Promise::<&str, Error>::new(&queue, |_| Err("💥".into()));
    /// assert_eq!(failed.reason(), Some(Error::Rejected("💥".into())));
    /// ```
    pub fn new<S, X>(scheduler: &S, executor: X) -> Self
    where
        S: Schedule + Clone + 'static,
        X: FnOnce(Settler<T, E>) -> Result<(), E>,
    {
        let deferred = Self::deferred(scheduler);
        if let Err(reason) = executor(deferred.settler.clone()) {
            debug!("executor failed, rejecting");
            deferred.settler.reject(reason);
        }
        deferred.promise
    }

    /// Creates a pending promise together with its settler, for drivers that
    /// settle from outside an executor.
    pub fn deferred<S>(scheduler: &S) -> Deferred<T, E>
    where
        S: Schedule + Clone + 'static,
    {
        let promise = Self::pending(Rc::new(scheduler.clone()));
        let settler = Settler { promise: promise.clone(), used: Rc::default() };
        Deferred { promise, settler }
    }

    pub fn resolved<S>(scheduler: &S, x: Resolution<T, E>) -> Self
    where
        S: Schedule + Clone + 'static,
    {
        Self::new(scheduler, move |settler| {
            settler.resolve(x);
            Ok(())
        })
    }

    pub fn rejected<S>(scheduler: &S, reason: E) -> Self
    where
        S: Schedule + Clone + 'static,
    {
        Self::new(scheduler, move |_| Err(reason))
    }

    /// The fulfillment value, once fulfilled.
    pub fn value(&self) -> Option<T> {
        match &*self.state.borrow() {
            State::Fulfilled(value) => Some(value.clone()),
            _ => None,
        }
    }

    /// The rejection reason, once rejected.
    pub fn reason(&self) -> Option<E> {
        match &*self.state.borrow() {
            State::Rejected(reason) => Some(reason.clone()),
            _ => None,
        }
    }

    /// Derives a promise from this one's outcome.
    ///
    /// Exactly one of the handlers runs, on a later turn of the scheduler.
    /// Its result is unwrapped like any other resolution: returning a promise
    /// or thenable makes the derived promise adopt it. `Err` or a panic rejects
    /// the derived promise.
    ///
    /// # Examples
    ///
    /// ```
    /// use promise_aplus::{Error, Promise, Resolution, TaskQueue};
    ///
    /// let queue = TaskQueue::new();
    /// let failed = Promise::<i32, Error>::rejected(&queue, "no luck".into());
    /// let recovered = failed.then(
    ///     |value| Ok(Resolution::Value(value.to_string())),
    ///     |reason| Ok(Resolution::Value(format!("recovered from {}", reason))),
    /// );
    /// queue.run_until_idle().unwrap();
    /// assert_eq!(recovered.value(), Some("recovered from no luck".to_owned()));
    /// ```
    pub fn then<U, F, R>(&self, on_fulfilled: F, on_rejected: R) -> Promise<U, E>
    where
        U: Clone + 'static,
        F: FnOnce(T) -> Result<Resolution<U, E>, E> + 'static,
        R: FnOnce(E) -> Result<Resolution<U, E>, E> + 'static,
    {
        self.chain(Reaction::Call(Box::new(on_fulfilled)), Reaction::Call(Box::new(on_rejected)))
    }

    /// Like [`then`](Self::then) without a rejection handler: a rejection
    /// propagates to the derived promise unchanged.
    pub fn then_fulfilled<U, F>(&self, on_fulfilled: F) -> Promise<U, E>
    where
        U: Clone + 'static,
        F: FnOnce(T) -> Result<Resolution<U, E>, E> + 'static,
    {
        self.chain(Reaction::Call(Box::new(on_fulfilled)), Reaction::Forward(Err))
    }

    /// Like [`then`](Self::then) without a fulfillment handler: the value
    /// passes through unchanged.
    pub fn catch<R>(&self, on_rejected: R) -> Promise<T, E>
    where
        R: FnOnce(E) -> Result<Resolution<T, E>, E> + 'static,
    {
        self.chain(Reaction::Forward(Ok), Reaction::Call(Box::new(on_rejected)))
    }

    /// `then` with no handlers at all.
    pub fn forward(&self) -> Promise<T, E> {
        self.chain(Reaction::Forward(Ok), Reaction::Forward(Err))
    }

    pub fn map<U, F>(&self, f: F) -> Promise<U, E>
    where
        U: Clone + 'static,
        F: FnOnce(T) -> U + 'static,
    {
        self.then_fulfilled(move |value| Ok(Resolution::Value(f(value))))
    }

    /// Observes the outcome through `then`, discarding the derived promise.
    pub(crate) fn subscribe<F, R>(&self, on_fulfilled: F, on_rejected: R)
    where
        F: FnOnce(T) + 'static,
        R: FnOnce(E) + 'static,
    {
        let _ = self.then(
            move |value| {
                on_fulfilled(value);
                Ok(Resolution::<(), E>::Value(()))
            },
            move |reason| {
                on_rejected(reason);
                Ok(Resolution::Value(()))
            },
        );
    }

    /// Moves a pending promise to `Fulfilled` and drains the fulfillment
    /// queue. No-op once settled.
    pub(crate) fn fulfill(&self, value: T) {
        let (callbacks, wakers) = {
            let mut state = self.state.borrow_mut();
            let drained = match &mut *state {
                State::Pending { on_fulfilled, wakers, .. } => (mem::take(on_fulfilled), mem::take(wakers)),
                _ => {
                    trace!("promise already settled, ignoring fulfillment");
                    return;
                }
            };
            *state = State::Fulfilled(value.clone());
            drained
        };
        trace!("promise fulfilled; running {} continuations", callbacks.len());
        for callback in callbacks {
            callback(value.clone());
        }
        for waker in wakers {
            waker.wake();
        }
    }

    /// Moves a pending promise to `Rejected` and drains the rejection queue.
    /// No-op once settled.
    pub(crate) fn reject(&self, reason: E) {
        let (callbacks, wakers) = {
            let mut state = self.state.borrow_mut();
            let drained = match &mut *state {
                State::Pending { on_rejected, wakers, .. } => (mem::take(on_rejected), mem::take(wakers)),
                _ => {
                    trace!("promise already settled, ignoring rejection");
                    return;
                }
            };
            *state = State::Rejected(reason.clone());
            drained
        };
        trace!("promise rejected; running {} continuations", callbacks.len());
        for callback in callbacks {
            callback(reason.clone());
        }
        for waker in wakers {
            waker.wake();
        }
    }

    fn chain<U>(&self, on_fulfilled: Reaction<T, U, E>, on_rejected: Reaction<E, U, E>) -> Promise<U, E>
    where
        U: Clone + 'static,
    {
        let derived = Promise::<U, E>::pending(self.scheduler.clone());
        let fulfilled: Callback<T> = {
            let scheduler = self.scheduler.clone();
            let derived = derived.clone();
            Box::new(move |value| scheduler.schedule(Box::new(move || react(&derived, on_fulfilled, value))))
        };
        let rejected: Callback<E> = {
            let scheduler = self.scheduler.clone();
            let derived = derived.clone();
            Box::new(move |reason| scheduler.schedule(Box::new(move || react(&derived, on_rejected, reason))))
        };

        // Take the outcome out first: the scheduler may run the reaction
        // right away, and the reaction may chain onto this promise again.
        let settled = match &*self.state.borrow() {
            State::Pending { .. } => None,
            State::Fulfilled(value) => Some(Ok(value.clone())),
            State::Rejected(reason) => Some(Err(reason.clone())),
        };
        match settled {
            Some(Ok(value)) => fulfilled(value),
            Some(Err(reason)) => rejected(reason),
            None => {
                if let State::Pending { on_fulfilled, on_rejected, .. } = &mut *self.state.borrow_mut() {
                    on_fulfilled.push(fulfilled);
                    on_rejected.push(rejected);
                    trace!("continuation queued; {} waiting", on_fulfilled.len());
                }
            }
        }
        derived
    }
}

/// Runs a reaction against the parent's outcome and settles `derived`.
fn react<A, U, E>(derived: &Promise<U, E>, reaction: Reaction<A, U, E>, outcome: A)
where
    U: Clone + 'static,
    E: Clone + From<Error> + 'static,
{
    match reaction {
        Reaction::Forward(forward) => match forward(outcome) {
            Ok(value) => derived.fulfill(value),
            Err(reason) => derived.reject(reason),
        },
        Reaction::Call(handler) => match panic::catch_unwind(AssertUnwindSafe(move || handler(outcome))) {
            Ok(Ok(x)) => resolve_promise(derived, x),
            Ok(Err(reason)) => {
                trace!("handler failed, rejecting derived promise");
                derived.reject(reason);
            }
            Err(payload) => {
                debug!("handler panicked, rejecting derived promise");
                derived.reject(E::from(Error::HandlerPanicked(panic_message(&*payload))));
            }
        },
    }
}

/// Resolves this promise to the settled outcome. Settlement still needs the
/// scheduler to be driven, polling does not do it.
impl<T: Clone, E: Clone> Future for Promise<T, E> {
    type Output = Result<T, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.state.borrow_mut();
        match &mut *state {
            State::Fulfilled(value) => Poll::Ready(Ok(value.clone())),
            State::Rejected(reason) => Poll::Ready(Err(reason.clone())),
            State::Pending { wakers, .. } => {
                if !wakers.iter().any(|waker| waker.will_wake(cx.waker())) {
                    wakers.push(cx.waker().clone());
                }
                Poll::Pending
            }
        }
    }
}

impl<T, E> Thenable<T, E> for Promise<T, E>
where
    T: Clone + 'static,
    E: Clone + From<Error> + 'static,
{
    fn then(&self, on_fulfilled: OnFulfilled<T, E>, on_rejected: OnRejected<E>) -> Result<(), E> {
        self.subscribe(move |value| on_fulfilled(Resolution::Value(value)), move |reason| on_rejected(reason));
        Ok(())
    }

    fn as_promise(&self) -> Option<Promise<T, E>> {
        Some(self.clone())
    }
}

/// The two settlement capabilities of a promise.
///
/// Clones share one guard: whichever call comes first decides the outcome and
/// every later `resolve`, `fulfill` or `reject` is ignored. Resolving with a
/// promise or thenable counts as that first call even though the promise only
/// settles once the adopted value does.
pub struct Settler<T, E = Error> {
    promise: Promise<T, E>,
    used: Rc<Cell<bool>>,
}

impl<T, E> Clone for Settler<T, E> {
    fn clone(&self) -> Self {
        Self { promise: self.promise.clone(), used: self.used.clone() }
    }
}

impl<T, E> Debug for Settler<T, E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settler").field("promise", &self.promise).field("used", &self.used.get()).finish()
    }
}

impl<T, E> Settler<T, E>
where
    T: Clone + 'static,
    E: Clone + From<Error> + 'static,
{
    pub fn resolve(&self, x: Resolution<T, E>) {
        if self.claim() {
            resolve_promise(&self.promise, x);
        }
    }

    pub fn fulfill(&self, value: T) {
        self.resolve(Resolution::Value(value))
    }

    pub fn reject(&self, reason: E) {
        if self.claim() {
            self.promise.reject(reason);
        }
    }

    fn claim(&self) -> bool {
        if self.used.replace(true) {
            trace!("settler already used, ignoring");
            false
        } else {
            true
        }
    }
}

/// A pending promise with its settler, see [`Promise::deferred`].
#[derive(Debug)]
pub struct Deferred<T, E = Error> {
    pub promise: Promise<T, E>,
    pub settler: Settler<T, E>,
}

impl<T, E> Deferred<T, E>
where
    T: Clone + 'static,
    E: Clone + From<Error> + 'static,
{
    pub fn resolve(&self, x: Resolution<T, E>) {
        self.settler.resolve(x)
    }

    pub fn fulfill(&self, value: T) {
        self.settler.fulfill(value)
    }

    pub fn reject(&self, reason: E) {
        self.settler.reject(reason)
    }
}
