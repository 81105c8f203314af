use crate::error::{Error, Result};
use crate::evaluation::core::{EvalCore, Outcome};
use futures::task::noop_waker_ref;
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

/// The suspended call chain of one unit of work.
pub(crate) type Work = Pin<Box<dyn Future<Output = Outcome>>>;

/// Key of a context inside the pool arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct ContextId(pub(crate) usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    /// Sitting in the pool, nothing bound.
    Idle,

    /// Bound to an evaluation whose work is not being polled right now; either
    /// not started yet or suspended at a suspension point.
    Suspended,

    /// On the active poll stack.
    Running,
}

/// What happened during one resumption of a context.
#[derive(Debug)]
pub(crate) enum Step {
    /// Work hit a suspension point and is parked in the context.
    Suspended,

    /// Work ran to completion.
    Ready(Outcome),

    /// The evaluation concluded from the outside while its work was running.
    /// The work has been dropped.
    Abandoned,

    /// Work panicked. The work has been dropped.
    Panicked(String),
}

/// A reusable, resumable unit of sequential execution.
///
/// Contexts are created once by the pool and reused across many evaluations.
/// Each binding is one iteration: bind, poll until completion (possibly over
/// many resumptions), hand the outcome back, return to the pool.
pub(crate) struct ExecContext {
    id: ContextId,
    phase: Cell<Phase>,
    work: RefCell<Option<Work>>,
    evaluation: RefCell<Option<Rc<EvalCore>>>,
    iterations: Cell<u64>,
}

impl ExecContext {
    pub(crate) fn new(id: ContextId) -> Self {
        Self {
            id,
            phase: Cell::new(Phase::Idle),
            work: RefCell::new(None),
            evaluation: RefCell::new(None),
            iterations: Cell::new(0),
        }
    }

    pub(crate) fn id(&self) -> ContextId {
        self.id
    }

    pub(crate) fn phase(&self) -> Phase {
        self.phase.get()
    }

    pub(crate) fn iterations(&self) -> u64 {
        self.iterations.get()
    }

    pub(crate) fn evaluation(&self) -> Option<Rc<EvalCore>> {
        self.evaluation.borrow().clone()
    }

    /// Starts a new iteration with `work` on behalf of `evaluation`.
    pub(crate) fn bind(&self, evaluation: Rc<EvalCore>, work: Work) -> Result<()> {
        if self.phase.get() != Phase::Idle {
            return Err(Error::internal(format!(
                "context {:?} bound while {:?}",
                self.id,
                self.phase.get()
            )));
        }

        self.evaluation.replace(Some(evaluation));
        self.work.replace(Some(work));
        self.phase.set(Phase::Suspended);
        self.iterations.set(self.iterations.get() + 1);
        Ok(())
    }

    /// Resumes the bound work until its next suspension point or completion.
    ///
    /// The context stays `Running` after anything but `Step::Suspended`; the
    /// caller stores the outcome and then calls [`ExecContext::finish`].
    pub(crate) fn poll_work(&self) -> Result<Step> {
        let evaluation = self
            .evaluation()
            .ok_or_else(|| Error::internal(format!("context {:?} resumed unbound", self.id)))?;

        match self.phase.get() {
            Phase::Suspended => {}
            phase => {
                return Err(Error::internal(format!(
                    "context {:?} resumed while {:?}",
                    self.id, phase
                )));
            }
        }

        // Take the work out while polling: a nested start or an abandon from
        // inside the work must never find it borrowed.
        let mut work = self
            .work
            .borrow_mut()
            .take()
            .ok_or_else(|| Error::internal(format!("context {:?} lost its work", self.id)))?;

        self.phase.set(Phase::Running);

        let mut cx = Context::from_waker(noop_waker_ref());
        let polled = panic::catch_unwind(AssertUnwindSafe(|| work.as_mut().poll(&mut cx)));

        let step = match polled {
            Ok(Poll::Pending) if !evaluation.is_concluded() => {
                self.work.replace(Some(work));
                self.phase.set(Phase::Suspended);
                Step::Suspended
            }
            Ok(Poll::Pending) => {
                drop(work);
                Step::Abandoned
            }
            Ok(Poll::Ready(outcome)) => Step::Ready(outcome),
            Err(payload) => {
                drop(work);
                Step::Panicked(panic_payload_as_str(&*payload).to_owned())
            }
        };

        Ok(step)
    }

    /// Gives up bound work that is not on the poll stack, without running it
    /// any further. Returns the work so the caller can drop it outside of any
    /// scheduler borrow.
    pub(crate) fn abort(&self) -> Result<Option<Work>> {
        match self.phase.get() {
            Phase::Suspended => {}
            phase => {
                return Err(Error::internal(format!(
                    "context {:?} aborted while {:?}",
                    self.id, phase
                )));
            }
        }

        let work = self.work.borrow_mut().take();
        self.evaluation.replace(None);
        self.phase.set(Phase::Idle);
        Ok(work)
    }

    /// Ends the current iteration after `poll_work` returned a terminal step.
    pub(crate) fn finish(&self) -> Option<Rc<EvalCore>> {
        self.phase.set(Phase::Idle);
        self.evaluation.replace(None)
    }

    /// Strips the context of anything it still holds, at loop teardown.
    pub(crate) fn take_work(&self) -> Option<Work> {
        self.evaluation.replace(None);
        self.phase.set(Phase::Idle);
        self.work.borrow_mut().take()
    }
}

impl fmt::Debug for ExecContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecContext")
            .field("id", &self.id)
            .field("phase", &self.phase.get())
            .field("iterations", &self.iterations.get())
            .finish()
    }
}

fn panic_payload_as_str(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "Box<dyn Any>"
    }
}
