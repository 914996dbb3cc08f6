//! Deferred execution of promise handlers.
//!
//! Promises never run `then` handlers on the caller's stack. Instead they hand
//! a [`Task`] to whatever [`Schedule`] implementation they were created with.
//! The host owns the loop: a [`TaskQueue`] only runs when it is pumped.
use crate::Error;
use log::trace;
use std::{
    cell::RefCell,
    collections::VecDeque,
    fmt::{self, Debug, Formatter},
    rc::Rc,
};

/// A unit of deferred work.
pub type Task = Box<dyn FnOnce()>;

/// Runs tasks later, in the order they were scheduled.
pub trait Schedule {
    fn schedule(&self, task: Task);
}

/// Configuration for a [`TaskQueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueConfig {
    /// Upper bound on the tasks a single `run_until_idle` call may run.
    pub max_turns: Option<usize>,
}

impl QueueConfig {
    pub const fn new() -> Self {
        Self { max_turns: None }
    }

    /// Stops `run_until_idle` after `turns` tasks.
    pub const fn max_turns(mut self, turns: usize) -> Self {
        self.max_turns = Some(turns);
        self
    }

    pub const fn unbounded(mut self) -> Self {
        self.max_turns = None;
        self
    }
}

/// A manually pumped FIFO task queue.
///
/// Clones share the same queue, so a clone can be handed to promises while
/// the host keeps another one to drive it.
///
/// # Examples
///
/// ```
/// use promise_aplus::{Schedule, TaskQueue};
/// use std::{cell::RefCell, rc::Rc};
///
/// let queue = TaskQueue::new();
/// let seen = Rc::new(RefCell::new(Vec::new()));
/// for i in 0..3 {
///     let seen = seen.clone();
///     queue.schedule(Box::new(move || seen.borrow_mut().push(i)));
/// }
/// assert_eq!(queue.run_until_idle(), Ok(3));
/// assert_eq!(*seen.borrow(), vec![0, 1, 2]);
/// ```
#[derive(Clone, Default)]
pub struct TaskQueue {
    tasks: Rc<RefCell<VecDeque<Task>>>,
    config: QueueConfig,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: QueueConfig) -> Self {
        Self { tasks: Rc::default(), config }
    }

    pub fn config(&self) -> QueueConfig {
        self.config
    }

    pub fn len(&self) -> usize {
        self.tasks.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.borrow().is_empty()
    }

    /// Runs the oldest task, if any. Returns whether a task ran.
    pub fn run_once(&self) -> bool {
        // The borrow must end before the task runs, tasks schedule more tasks.
        let task = self.tasks.borrow_mut().pop_front();
        match task {
            Some(task) => {
                task();
                true
            }
            None => false,
        }
    }

    /// Runs tasks until the queue is empty, including tasks scheduled along
    /// the way. Returns the number of tasks run.
    pub fn run_until_idle(&self) -> Result<usize, Error> {
        let mut turns = 0;
        loop {
            if let Some(max) = self.config.max_turns {
                if turns >= max && !self.is_empty() {
                    trace!("task queue still busy after {} turns, giving up", max);
                    return Err(Error::TurnLimitExceeded(max));
                }
            }
            if !self.run_once() {
                break;
            }
            turns += 1;
        }
        trace!("task queue idle after {} turns", turns);
        Ok(turns)
    }
}

impl Schedule for TaskQueue {
    fn schedule(&self, task: Task) {
        let mut tasks = self.tasks.borrow_mut();
        tasks.push_back(task);
        trace!("task scheduled; {} queued", tasks.len());
    }
}

impl Debug for TaskQueue {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskQueue").field("queued", &self.len()).field("config", &self.config).finish()
    }
}

/// Runs every task immediately on the scheduling stack.
///
/// Test-only: it breaks the guarantee that handlers run after the current
/// call returns, so it is never handed out to callers.
#[cfg(test)]
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Inline;

#[cfg(test)]
impl Schedule for Inline {
    fn schedule(&self, task: Task) {
        task()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_tasks_run_in_schedule_order() {
        let queue = TaskQueue::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        for i in 0..5 {
            let seen = seen.clone();
            queue.schedule(Box::new(move || seen.borrow_mut().push(i)));
        }
        assert_eq!(queue.len(), 5);
        assert_eq!(queue.run_until_idle(), Ok(5));
        assert_eq!(*seen.borrow(), vec![0, 1, 2, 3, 4]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_tasks_scheduled_while_running_go_last() {
        let queue = TaskQueue::new();
        let seen = Rc::new(RefCell::new(Vec::new()));

        let inner_queue = queue.clone();
        let inner_seen = seen.clone();
        queue.schedule(Box::new(move || {
            inner_seen.borrow_mut().push("first");
            let seen = inner_seen.clone();
            inner_queue.schedule(Box::new(move || seen.borrow_mut().push("nested")));
        }));
        let tail = seen.clone();
        queue.schedule(Box::new(move || tail.borrow_mut().push("second")));

        assert!(queue.run_once());
        assert_eq!(*seen.borrow(), vec!["first"]);
        assert_eq!(queue.run_until_idle(), Ok(2));
        assert_eq!(*seen.borrow(), vec!["first", "second", "nested"]);
        assert!(!queue.run_once());
    }

    #[test]
    fn test_turn_limit() {
        let queue = TaskQueue::with_config(QueueConfig::new().max_turns(3));
        let count = Rc::new(Cell::new(0));
        for _ in 0..5 {
            let count = count.clone();
            queue.schedule(Box::new(move || count.set(count.get() + 1)));
        }
        assert_eq!(queue.run_until_idle(), Err(Error::TurnLimitExceeded(3)));
        assert_eq!(count.get(), 3);
        assert_eq!(queue.len(), 2);
        // The limit applies per call.
        assert_eq!(queue.run_until_idle(), Ok(2));
    }

    #[test]
    fn test_turn_limit_reached_exactly_is_ok() {
        let queue = TaskQueue::with_config(QueueConfig::new().max_turns(2));
        queue.schedule(Box::new(|| {}));
        queue.schedule(Box::new(|| {}));
        assert_eq!(queue.run_until_idle(), Ok(2));
    }

    #[test]
    fn test_inline_runs_immediately() {
        let ran = Rc::new(Cell::new(false));
        let flag = ran.clone();
        Inline.schedule(Box::new(move || flag.set(true)));
        assert!(ran.get());
    }

    #[test]
    fn test_config_builders() {
        assert_eq!(QueueConfig::default().max_turns, None);
        assert_eq!(QueueConfig::new().max_turns(7).max_turns, Some(7));
        assert_eq!(QueueConfig::new().max_turns(7).unbounded(), QueueConfig::new());
        assert_eq!(TaskQueue::with_config(QueueConfig::new().max_turns(1)).config().max_turns, Some(1));
    }
}
