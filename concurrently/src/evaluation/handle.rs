use crate::context;
use crate::error::{DEFAULT_CANCEL_REASON, Error, ProtocolError, Result};
use crate::evaluation::core::{Concluded, EvalCore, Outcome, Signal};
use crate::evaluation::suspend::Suspend;
use crate::evaluation::{AwaitOptions, Id};
use std::any::{Any, type_name};
use std::fmt;
use std::marker::PhantomData;
use std::rc::Rc;

/// Handle to one in-flight or concluded unit of work.
///
/// Returned by [`start`] and [`start_detached`]. The generic parameter is the
/// value the work produces on success:
///
/// ```
/// use concurrently::{runtime, Evaluation};
///
/// let evaluation: Evaluation<u32> = runtime::start(async { Ok(5 + 3) })?;
///
/// assert!(evaluation.is_concluded());
/// assert_eq!(evaluation.try_result().transpose()?, Some(8));
/// # Ok::<(), concurrently::Error>(())
/// ```
///
/// Dropping the handle does not cancel the work; it keeps running and its
/// outcome is lost. Handles are cheap to clone and compare by identity.
///
/// Retrieving the outcome clones it, because every waiter observes the same
/// stored value; wrap large values in an `Rc`.
///
/// [`start`]: crate::runtime::start
/// [`start_detached`]: crate::runtime::start_detached
pub struct Evaluation<T> {
    core: Rc<EvalCore>,
    _marker: PhantomData<fn() -> T>,
}

/// Untyped handle to an evaluation, most notably the one running right now.
#[derive(Clone)]
pub struct EvaluationRef {
    core: Rc<EvalCore>,
}

// Unregisters a waiter however its `await_result` call ends.
struct WaiterGuard<'a> {
    target: &'a EvalCore,
    waiter: Rc<EvalCore>,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.target.remove_waiter(&self.waiter);
    }
}

impl<T> Evaluation<T> {
    pub(crate) fn from_core(core: Rc<EvalCore>) -> Self {
        Self {
            core,
            _marker: PhantomData,
        }
    }

    pub fn id(&self) -> Id {
        self.core.id()
    }

    /// Suspended until an explicit [`resume`](Evaluation::resume).
    pub fn is_waiting(&self) -> bool {
        self.core.is_waiting()
    }

    pub fn is_concluded(&self) -> bool {
        self.core.is_concluded()
    }

    /// Resumes the evaluation, which must be suspended in
    /// [`await_resume`](crate::evaluation::await_resume). The value is handed
    /// to the suspended call as soon as the loop reaches it.
    ///
    /// A timeout pending for that suspension is withdrawn. Fails with
    /// [`ProtocolError::NotWaiting`] if the evaluation is not suspended.
    pub fn resume<V: 'static>(&self, value: V) -> Result<()> {
        resume(&self.core, value)
    }

    /// Cancels with [`DEFAULT_CANCEL_REASON`].
    pub fn cancel(&self) -> Result<()> {
        self.cancel_with(DEFAULT_CANCEL_REASON)
    }

    /// Concludes the evaluation with [`Error::Cancelled`] and abandons its
    /// work.
    ///
    /// Suspended or not yet started work is dropped immediately and never runs
    /// again. Work that is running right now (the evaluation cancels itself, or
    /// one of the evaluations it started in turn cancels it) is dropped at its
    /// next suspension point; if it completes first, its outcome is discarded.
    /// Every waiter observes the cancellation error.
    ///
    /// Fails with [`ProtocolError::AlreadyConcluded`] if the evaluation has
    /// concluded already.
    pub fn cancel_with(&self, reason: impl Into<String>) -> Result<()> {
        cancel(&self.core, reason.into())
    }

    pub fn as_untyped(&self) -> EvaluationRef {
        EvaluationRef {
            core: self.core.clone(),
        }
    }
}

impl<T: 'static> Evaluation<T> {
    /// Concludes the evaluation with `outcome` and abandons its work, exactly
    /// like [`cancel_with`](Evaluation::cancel_with) does. Waiters observe
    /// `outcome`.
    ///
    /// Fails with [`ProtocolError::AlreadyConcluded`] if the evaluation has
    /// concluded already; the first outcome stays.
    pub fn conclude_with(&self, outcome: Result<T>) -> Result<()> {
        let outcome = outcome.map(|v| Rc::new(v) as Rc<dyn Any>);
        context::current().conclude(&self.core, outcome)
    }
}

impl<T: Clone + 'static> Evaluation<T> {
    /// The outcome, if the evaluation has concluded. Never suspends.
    pub fn try_result(&self) -> Option<Result<T>> {
        if let Err(err) = self.core.check_generation() {
            return Some(Err(err));
        }

        self.core.outcome().map(typed)
    }

    /// Waits for the evaluation to conclude and returns its outcome.
    ///
    /// An evaluation that has concluded already yields its outcome without
    /// suspending the caller.
    pub async fn await_result(&self) -> Result<T> {
        self.await_result_opts(AwaitOptions::new()).await
    }

    /// Like [`await_result`](Evaluation::await_result), with a timeout.
    ///
    /// When [`within`](AwaitOptions::within) elapses first, this call yields
    /// the configured [`timeout_result`](AwaitOptions::timeout_result), by
    /// default [`Error::Timeout`]. Only this call times out: the evaluation
    /// keeps running and other waiters keep waiting.
    pub async fn await_result_opts(&self, opts: AwaitOptions<T>) -> Result<T> {
        self.core.check_generation()?;

        if let Some(outcome) = self.core.outcome() {
            return typed(outcome);
        }

        let event_loop = context::current();
        let waiter = event_loop.current_evaluation();

        if Rc::ptr_eq(&waiter, &self.core) {
            return Err(ProtocolError::AwaitOwnResult.into());
        }

        self.core.add_waiter(waiter.clone());
        let _registration = WaiterGuard {
            target: &self.core,
            waiter: waiter.clone(),
        };

        match Suspend::new(&event_loop, waiter, opts.within).await? {
            Signal::Timeout => opts.on_timeout(),
            Signal::Value(value) if value.is::<Concluded>() => {
                let outcome = self.core.outcome().ok_or_else(|| {
                    Error::internal(format!(
                        "evaluation {} announced conclusion without an outcome",
                        self.core.id()
                    ))
                })?;
                typed(outcome)
            }
            // Resumed by hand before the evaluation concluded.
            Signal::Value(value) => value
                .downcast::<T>()
                .map(|value| *value)
                .map_err(|_| unexpected::<T>()),
            Signal::Start => Err(Error::internal(format!(
                "start signal delivered to waiter of evaluation {}",
                self.core.id()
            ))),
        }
    }

    /// Like [`await_result_opts`](Evaluation::await_result_opts), passing
    /// whatever the call yields through `transform`. Both success and error
    /// outcomes go through it, so one call site can retrieve and adapt a
    /// result.
    pub async fn await_result_with<U, F>(&self, opts: AwaitOptions<T>, transform: F) -> Result<U>
    where
        F: FnOnce(Result<T>) -> Result<U>,
    {
        transform(self.await_result_opts(opts).await)
    }
}

impl<T> Clone for Evaluation<T> {
    fn clone(&self) -> Self {
        Self::from_core(self.core.clone())
    }
}

impl<T> PartialEq for Evaluation<T> {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.core, &other.core)
    }
}

impl<T> Eq for Evaluation<T> {}

impl<T> fmt::Debug for Evaluation<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Evaluation")
            .field("id", &self.core.id())
            .field("output", &type_name::<T>())
            .field("waiting", &self.core.is_waiting())
            .field("concluded", &self.core.is_concluded())
            .finish()
    }
}

impl EvaluationRef {
    /// The evaluation presently running on this thread's loop. Outside any
    /// unit of work this is the thread's root evaluation.
    pub fn current() -> Self {
        Self {
            core: context::current().current_evaluation(),
        }
    }

    pub fn id(&self) -> Id {
        self.core.id()
    }

    /// Code running outside any pooled context, for example the future driven
    /// by [`block_on`](crate::runtime::block_on).
    pub fn is_root(&self) -> bool {
        self.core.is_root()
    }

    pub fn is_waiting(&self) -> bool {
        self.core.is_waiting()
    }

    pub fn is_concluded(&self) -> bool {
        self.core.is_concluded()
    }

    /// See [`Evaluation::resume`].
    pub fn resume<V: 'static>(&self, value: V) -> Result<()> {
        resume(&self.core, value)
    }

    /// See [`Evaluation::cancel`].
    pub fn cancel(&self) -> Result<()> {
        self.cancel_with(DEFAULT_CANCEL_REASON)
    }

    /// See [`Evaluation::cancel_with`]. The root evaluation cannot be
    /// cancelled.
    pub fn cancel_with(&self, reason: impl Into<String>) -> Result<()> {
        cancel(&self.core, reason.into())
    }
}

impl<T> From<&Evaluation<T>> for EvaluationRef {
    fn from(evaluation: &Evaluation<T>) -> Self {
        evaluation.as_untyped()
    }
}

impl PartialEq for EvaluationRef {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.core, &other.core)
    }
}

impl Eq for EvaluationRef {}

impl fmt::Debug for EvaluationRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvaluationRef")
            .field("id", &self.core.id())
            .field("root", &self.core.is_root())
            .field("waiting", &self.core.is_waiting())
            .field("concluded", &self.core.is_concluded())
            .finish()
    }
}

fn resume<V: 'static>(core: &Rc<EvalCore>, value: V) -> Result<()> {
    context::current().resume(core, Signal::Value(Box::new(value)))
}

fn cancel(core: &Rc<EvalCore>, reason: String) -> Result<()> {
    context::current().cancel(core, reason)
}

fn typed<T: Clone + 'static>(outcome: Outcome) -> Result<T> {
    outcome?
        .downcast_ref::<T>()
        .cloned()
        .ok_or_else(unexpected::<T>)
}

pub(crate) fn unexpected<T>() -> Error {
    ProtocolError::UnexpectedValue {
        expected: type_name::<T>(),
    }
    .into()
}
