//! Promises with Promise/A+ resolution and thenable interop.
//!
//! A [`Promise`] is settled at most once, either directly through its
//! [`Settler`] or by adopting the state of another future-like value. Chained
//! handlers never run on the caller's stack: they are handed to an injected
//! [`Schedule`] implementation, usually a [`TaskQueue`] the host pumps.
//!
//! # Examples
//!
//! ```
//! use promise_aplus::{Error, Promise, TaskQueue};
//!
//! let queue = TaskQueue::new();
//! let deferred = Promise::<i32, Error>::deferred(&queue);
//! let doubled = deferred.promise.map(|v| v * 2);
//!
//! deferred.fulfill(21);
//! assert!(doubled.is_pending());
//!
//! queue.run_until_idle().unwrap();
//! assert_eq!(doubled.value(), Some(42));
//! ```
pub mod promise;
pub mod resolve;
pub mod scheduler;

pub use promise::{Deferred, Promise, Settler, Status};
pub use resolve::{OnFulfilled, OnRejected, Resolution, ThenMember, Thenable};
pub use scheduler::{QueueConfig, Schedule, Task, TaskQueue};

/// Failures the promise machinery reports on its own behalf.
///
/// Custom rejection types plug in through `From<Error>`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("a promise cannot be resolved with itself")]
    SelfResolution,
    #[error("promise handler panicked: {0}")]
    HandlerPanicked(String),
    #[error("thenable panicked: {0}")]
    ThenablePanicked(String),
    #[error("task queue did not go idle within {0} turns")]
    TurnLimitExceeded(usize),
    #[error("{0}")]
    Rejected(String),
}

impl From<&str> for Error {
    fn from(reason: &str) -> Self {
        Error::Rejected(reason.to_owned())
    }
}

impl From<String> for Error {
    fn from(reason: String) -> Self {
        Error::Rejected(reason)
    }
}

/// Extracts a printable message from a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "<opaque>".to_owned()
    }
}
