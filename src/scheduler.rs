use std::{cell::RefCell, collections::VecDeque, fmt};

type Task = Box<dyn FnOnce()>;

/// A FIFO of deferred work. Renders that must not start before their caller
/// has attached listeners are queued here and run by [`run_pending`].
///
/// [`run_pending`]: Scheduler::run_pending
#[derive(Default)]
pub(crate) struct Scheduler {
    queue: RefCell<VecDeque<Task>>,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("pending", &self.pending())
            .finish()
    }
}

impl Scheduler {
    pub fn defer<F: FnOnce() + 'static>(&self, task: F) {
        self.queue.borrow_mut().push_back(Box::new(task));
    }

    pub fn pending(&self) -> usize {
        self.queue.borrow().len()
    }

    /// Runs queued tasks, including any they queue, until the queue is empty.
    /// Returns how many ran.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0_usize;
        loop {
            let task = self.queue.borrow_mut().pop_front();
            let Some(task) = task else {
                break;
            };
            task();
            ran = ran.saturating_add(1);
        }
        if ran > 0 {
            tracing::trace!(ran, "Ran deferred tasks");
        }
        ran
    }
}
