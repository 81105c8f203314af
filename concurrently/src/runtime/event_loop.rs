use crate::context::{self, ExecContext, Phase, Step, Work};
use crate::error::{Error, ProtocolError, Result};
use crate::evaluation::core::{Concluded, EvalCore, Generation, Outcome, Signal};
use crate::evaluation::Evaluation;
use crate::runtime::LoopConfig;
use crate::runtime::run_queue::{Entry, NextDue, RunQueue, Tag};
use futures::task::noop_waker_ref;
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::pin::pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

/// Handle to the event loop of the current thread.
///
/// Cheap to clone; every clone refers to the same loop. A loop lives until it
/// is reinitialized, after which all of its evaluations fail with
/// [`Error::Teardown`].
#[derive(Clone)]
pub struct EventLoop(Rc<Inner>);

/// Non-owning reference held by suspended work, so the work stored in the
/// pool does not keep its own loop alive.
#[derive(Clone)]
pub(crate) struct WeakEventLoop(Weak<Inner>);

struct Inner {
    cfg: LoopConfig,

    generation: Rc<Generation>,

    run_queue: RefCell<RunQueue>,

    pool: RefCell<context::ContextPool>,

    /// Evaluation whose context is being polled. `None` outside any resumption.
    current: RefCell<Option<Rc<EvalCore>>>,

    /// Identity of code running outside any pooled context.
    root: Rc<EvalCore>,

    root_woken: Cell<bool>,

    /// A `block_on` call is in progress.
    driving: Cell<bool>,
}

/// Point-in-time counters of one event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopStats {
    pub generation: u64,
    pub contexts_created: u64,
    pub contexts_live: usize,
    pub contexts_idle: usize,
    pub immediate_entries: usize,
    pub timed_entries: usize,
}

// Sets the current evaluation for the duration of one resumption and
// restores the outer one afterwards, so nested starts unwind correctly.
struct EnterGuard<'a> {
    slot: &'a RefCell<Option<Rc<EvalCore>>>,
    previous: Option<Rc<EvalCore>>,
}

impl Drop for EnterGuard<'_> {
    fn drop(&mut self) {
        let inner = self.slot.replace(self.previous.take());
        drop(inner);
    }
}

struct DrivingGuard<'a>(&'a Cell<bool>);

impl Drop for DrivingGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

impl EventLoop {
    pub(crate) fn new(cfg: LoopConfig) -> Self {
        let generation = Generation::new();

        let mut pool = context::ContextPool::new(cfg.max_idle_contexts);
        pool.prealloc(cfg.prealloc_contexts);

        tracing::debug!(generation = generation.id(), ?cfg, "event loop created");

        EventLoop(Rc::new(Inner {
            root: EvalCore::new_root(generation.clone()),
            generation,
            run_queue: RefCell::new(RunQueue::new()),
            pool: RefCell::new(pool),
            current: RefCell::new(None),
            root_woken: Cell::new(true),
            driving: Cell::new(false),
            cfg,
        }))
    }

    /// The event loop of the current thread, created on first use.
    pub fn current() -> EventLoop {
        context::current()
    }

    /// Fresh loop with the same configuration.
    pub(crate) fn successor(&self) -> EventLoop {
        EventLoop::new(self.0.cfg.clone())
    }

    pub(crate) fn downgrade(&self) -> WeakEventLoop {
        WeakEventLoop(Rc::downgrade(&self.0))
    }

    pub fn ptr_eq(&self, other: &EventLoop) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub fn generation(&self) -> u64 {
        self.0.generation.id()
    }

    pub fn is_torn_down(&self) -> bool {
        self.0.generation.is_torn_down()
    }

    pub fn now(&self) -> Instant {
        self.0.cfg.driver.now()
    }

    pub fn stats(&self) -> LoopStats {
        let pool = self.0.pool.borrow().stats();
        let run_queue = self.0.run_queue.borrow();

        LoopStats {
            generation: self.generation(),
            contexts_created: pool.created,
            contexts_live: pool.live,
            contexts_idle: pool.idle,
            immediate_entries: run_queue.immediate_len(),
            timed_entries: run_queue.timed_len(),
        }
    }

    /// Anything pending, bound or being driven.
    pub(crate) fn is_busy(&self) -> bool {
        let pool = self.0.pool.borrow().stats();

        self.0.driving.get()
            || self.0.current.borrow().is_some()
            || !self.0.run_queue.borrow().is_empty()
            || pool.live > pool.idle
    }

    /// The evaluation presently running, or the root evaluation.
    pub(crate) fn current_evaluation(&self) -> Rc<EvalCore> {
        self.0
            .current
            .borrow()
            .clone()
            .unwrap_or_else(|| self.0.root.clone())
    }

    fn enter(&self, evaluation: Rc<EvalCore>) -> EnterGuard<'_> {
        let previous = self.0.current.replace(Some(evaluation));
        EnterGuard {
            slot: &self.0.current,
            previous,
        }
    }

    /// Binds `work` to a pooled context and runs it right away, until its
    /// first suspension point or completion.
    ///
    /// Work that never suspends has concluded by the time this returns.
    pub fn start<T, F>(&self, work: F) -> Result<Evaluation<T>>
    where
        T: 'static,
        F: Future<Output = Result<T>> + 'static,
    {
        self.0.generation.check()?;

        let res = self.bind(work).and_then(|(evaluation, ctx)| {
            tracing::debug!(evaluation = %evaluation.id(), context = ?ctx.id(), "start");

            evaluation.mark_started();
            self.drive(&evaluation, ctx)?;
            Ok(evaluation)
        });

        self.escalate(res).map(Evaluation::from_core)
    }

    /// Binds `work` to a pooled context and schedules its first run as an
    /// immediate entry. The work does not run before the loop reaches it.
    pub fn start_detached<T, F>(&self, work: F) -> Result<Evaluation<T>>
    where
        T: 'static,
        F: Future<Output = Result<T>> + 'static,
    {
        self.0.generation.check()?;

        let res = self.bind(work).map(|(evaluation, ctx)| {
            tracing::debug!(evaluation = %evaluation.id(), context = ?ctx.id(), "start detached");

            self.0
                .run_queue
                .borrow_mut()
                .schedule_immediately(evaluation.clone(), Signal::Start);
            evaluation
        });

        self.escalate(res).map(Evaluation::from_core)
    }

    fn bind<T, F>(&self, work: F) -> Result<(Rc<EvalCore>, Rc<ExecContext>)>
    where
        T: 'static,
        F: Future<Output = Result<T>> + 'static,
    {
        let evaluation = EvalCore::new(self.0.generation.clone());
        let work: Work = Box::pin(async move { work.await.map(|v| Rc::new(v) as Rc<dyn Any>) });

        let ctx = self.0.pool.borrow_mut().acquire();
        ctx.bind(evaluation.clone(), work)?;
        evaluation.bind(ctx.id());

        Ok((evaluation, ctx))
    }

    /// Runs one step of the loop: every immediate entry present when the step
    /// begins, then the earliest due timed entry. Entries scheduled during
    /// the step run in the next one.
    ///
    /// If nothing ran and only timed entries are pending, parks the driver
    /// until the earliest is due. Returns the number of activations fired.
    pub fn run_once(&self) -> Result<usize> {
        self.0.generation.check()?;

        if self.0.current.borrow().is_some() {
            return Err(ProtocolError::Reentrant.into());
        }

        let res = self.step();
        self.escalate(res)
    }

    fn step(&self) -> Result<usize> {
        let batch = self.0.run_queue.borrow().immediate_len();
        let mut fired = 0;

        // Entries withdrawn during the batch shorten it; the step still
        // fires at most one timed entry.
        for _ in 0..batch {
            let next = self.0.run_queue.borrow_mut().next_immediate();
            let Some(entry) = next else {
                break;
            };

            self.fire(entry)?;
            fired += 1;
        }

        let now = self.now();
        let next = self.0.run_queue.borrow_mut().next_timed(now);

        match next {
            NextDue::Ready(entry) => {
                self.fire(entry)?;
                fired += 1;
            }
            NextDue::Wait(deadline) if fired == 0 => {
                tracing::trace!(?deadline, "parking until next timed entry");
                self.0.cfg.driver.park(deadline)?;
            }
            NextDue::Wait(_) | NextDue::Empty => {}
        }

        Ok(fired)
    }

    /// Drives the loop with `future` as the root evaluation until it
    /// completes.
    ///
    /// Fails with [`Error::Stalled`] if the root future is pending while the
    /// run queue is empty, since nothing could ever wake it.
    pub fn block_on<F: Future>(&self, future: F) -> Result<F::Output> {
        self.0.generation.check()?;

        if self.0.driving.get() || self.0.current.borrow().is_some() {
            return Err(ProtocolError::Reentrant.into());
        }

        let res = self.block_on_inner(future);
        self.escalate(res)
    }

    fn block_on_inner<F: Future>(&self, future: F) -> Result<F::Output> {
        self.0.driving.set(true);
        let _driving = DrivingGuard(&self.0.driving);

        let mut future = pin!(future);
        let mut cx = Context::from_waker(noop_waker_ref());
        self.0.root_woken.set(true);

        loop {
            if self.reset_root_woken() {
                let polled = {
                    let _enter = self.enter(self.0.root.clone());
                    future.as_mut().poll(&mut cx)
                };

                if let Poll::Ready(output) = polled {
                    return Ok(output);
                }

                // Reinitialized from inside the root future.
                self.0.generation.check()?;
            }

            let fired = self.step()?;

            if fired == 0 && !self.0.root_woken.get() && self.0.run_queue.borrow().is_empty() {
                return Err(Error::Stalled);
            }
        }
    }

    fn reset_root_woken(&self) -> bool {
        self.0.root_woken.replace(false)
    }

    /// Delivers an explicit activation to a waiting evaluation.
    pub(crate) fn resume(&self, evaluation: &Rc<EvalCore>, signal: Signal) -> Result<()> {
        evaluation.check_generation()?;

        if !evaluation.is_waiting() {
            return Err(ProtocolError::NotWaiting.into());
        }

        let superseded = {
            let mut run_queue = self.0.run_queue.borrow_mut();
            let superseded = run_queue.cancel(evaluation, Tag::Deferred);
            run_queue.schedule_immediately(evaluation.clone(), signal);
            superseded
        };
        evaluation.set_waiting(false);

        if superseded.is_some() {
            tracing::trace!(evaluation = %evaluation.id(), "pending timeout withdrawn");
        }
        drop(superseded);

        Ok(())
    }

    /// Schedules a timeout activation for the suspension `evaluation` is about
    /// to enter. A `within` too large for the clock never fires.
    pub(crate) fn schedule_timeout(&self, evaluation: &Rc<EvalCore>, within: Duration) {
        let Some(due) = self.now().checked_add(within) else {
            return;
        };

        self.0
            .run_queue
            .borrow_mut()
            .schedule_at(evaluation.clone(), due, Signal::Timeout, Tag::Deferred);
    }

    /// Undoes a suspension that is given up before it was activated.
    pub(crate) fn withdraw(&self, evaluation: &Rc<EvalCore>) {
        let withdrawn = self.0.run_queue.borrow_mut().cancel_all(evaluation);
        evaluation.set_waiting(false);

        let signal = evaluation.take_signal();
        drop((withdrawn, signal));
    }

    /// Concludes `evaluation` with `outcome` from the outside, abandons its
    /// work and resumes every waiter.
    pub(crate) fn conclude(&self, evaluation: &Rc<EvalCore>, outcome: Outcome) -> Result<()> {
        evaluation.check_generation()?;

        if evaluation.is_root() {
            return Err(ProtocolError::RootEvaluation.into());
        }

        evaluation.store_outcome(outcome)?;
        tracing::debug!(evaluation = %evaluation.id(), "concluded from outside");

        let res = self.abandon(evaluation);
        self.notify_waiters(evaluation);
        self.escalate(res)
    }

    pub(crate) fn cancel(&self, evaluation: &Rc<EvalCore>, reason: String) -> Result<()> {
        tracing::debug!(evaluation = %evaluation.id(), %reason, "cancel");
        self.conclude(evaluation, Err(Error::Cancelled(reason)))
    }

    // Withdraws everything pending for a concluded evaluation and drops its
    // work, unless the work is on the poll stack right now; `drive` drops it
    // as soon as that poll returns.
    fn abandon(&self, evaluation: &Rc<EvalCore>) -> Result<()> {
        let withdrawn = self.0.run_queue.borrow_mut().cancel_all(evaluation);
        evaluation.set_waiting(false);
        let signal = evaluation.take_signal();
        drop((withdrawn, signal));

        let Some(id) = evaluation.context() else {
            return Ok(());
        };

        let ctx = self.0.pool.borrow().get(id);
        let ctx = ctx
            .filter(|ctx| {
                ctx.evaluation()
                    .is_some_and(|bound| Rc::ptr_eq(&bound, evaluation))
            })
            .ok_or_else(|| {
                Error::internal(format!(
                    "evaluation {} bound to missing context {:?}",
                    evaluation.id(),
                    id
                ))
            })?;

        match ctx.phase() {
            Phase::Running => Ok(()),
            Phase::Suspended => {
                let work = ctx.abort()?;
                evaluation.unbind();
                self.0.pool.borrow_mut().release(&ctx)?;

                tracing::trace!(evaluation = %evaluation.id(), context = ?ctx.id(), "work abandoned");
                drop(work);
                Ok(())
            }
            Phase::Idle => Err(Error::internal(format!(
                "evaluation {} bound to idle context {:?}",
                evaluation.id(),
                id
            ))),
        }
    }

    fn notify_waiters(&self, evaluation: &Rc<EvalCore>) {
        for waiter in evaluation.take_waiters() {
            if let Err(err) = self.resume(&waiter, Signal::Value(Box::new(Concluded))) {
                tracing::warn!(
                    evaluation = %evaluation.id(),
                    waiter = %waiter.id(),
                    %err,
                    "waiter could not be resumed"
                );
            }
        }
    }

    fn fire(&self, entry: Entry) -> Result<()> {
        let Entry {
            evaluation, signal, ..
        } = entry;

        evaluation.check_generation()?;
        tracing::trace!(evaluation = %evaluation.id(), ?signal, "fire");

        if evaluation.is_concluded() {
            tracing::warn!(evaluation = %evaluation.id(), ?signal, "stale activation skipped");
            return Ok(());
        }

        match signal {
            Signal::Start if evaluation.is_started() => {
                return Err(Error::internal(format!(
                    "evaluation {} started twice",
                    evaluation.id()
                )));
            }
            Signal::Start => evaluation.mark_started(),
            signal => {
                evaluation.set_waiting(false);
                evaluation.deliver(signal)?;
            }
        }

        if evaluation.is_root() {
            self.0.root_woken.set(true);
            return Ok(());
        }

        let ctx = evaluation
            .context()
            .and_then(|id| self.0.pool.borrow().get(id))
            .ok_or_else(|| {
                Error::internal(format!(
                    "evaluation {} activated without a context",
                    evaluation.id()
                ))
            })?;

        self.drive(&evaluation, ctx)
    }

    // Resumes the context bound to `evaluation` with whatever sits in its
    // inbox, then settles the outcome if the work finished.
    fn drive(&self, evaluation: &Rc<EvalCore>, ctx: Rc<ExecContext>) -> Result<()> {
        let step = {
            let _enter = self.enter(evaluation.clone());
            ctx.poll_work()?
        };

        if self.is_torn_down() {
            let work = ctx.take_work();
            drop((work, step));
            return self.0.generation.check();
        }

        let res = match step {
            Step::Suspended => return Ok(()),
            Step::Abandoned => {
                tracing::trace!(evaluation = %evaluation.id(), "work abandoned after poll");
                Ok(())
            }
            Step::Ready(outcome) => self.settle(evaluation, outcome),
            Step::Panicked(msg) => {
                tracing::warn!(evaluation = %evaluation.id(), %msg, "work panicked");
                self.settle(evaluation, Err(Error::Panicked(msg)))
            }
        };

        self.recycle(evaluation, &ctx)?;
        res
    }

    // Stores the outcome produced by the work itself. An evaluation concluded
    // from the outside keeps its first outcome.
    fn settle(&self, evaluation: &Rc<EvalCore>, outcome: Outcome) -> Result<()> {
        if evaluation.is_concluded() {
            tracing::trace!(evaluation = %evaluation.id(), "late outcome discarded");
            drop(outcome);
            return Ok(());
        }

        evaluation.store_outcome(outcome)?;
        tracing::debug!(
            evaluation = %evaluation.id(),
            waiters = evaluation.num_waiters(),
            "concluded"
        );

        let withdrawn = self.0.run_queue.borrow_mut().cancel_all(evaluation);
        drop(withdrawn);

        self.notify_waiters(evaluation);
        Ok(())
    }

    fn recycle(&self, evaluation: &Rc<EvalCore>, ctx: &ExecContext) -> Result<()> {
        let bound = ctx.finish();
        evaluation.unbind();
        drop(bound);

        tracing::trace!(context = ?ctx.id(), iterations = ctx.iterations(), "context recycled");

        self.0.pool.borrow_mut().release(ctx)
    }

    // Internal invariant violations leave the loop in an unknown state: tear
    // it down, install a fresh one, and report the violation as the cause.
    fn escalate<T>(&self, res: Result<T>) -> Result<T> {
        match res {
            Err(err) if err.is_internal() => {
                tracing::error!(generation = self.generation(), %err, "reinitializing event loop");

                context::reinitialize_from(self, Some(err.clone()));
                Err(Error::Teardown {
                    cause: Some(Box::new(err)),
                })
            }
            res => res,
        }
    }

    /// Marks the generation torn down and drops everything the loop holds.
    pub(crate) fn shutdown(&self, cause: Option<Error>) {
        if self.is_torn_down() {
            return;
        }

        tracing::debug!(generation = self.generation(), ?cause, "event loop torn down");
        self.0.generation.tear_down(cause);

        let entries = self.0.run_queue.borrow_mut().drain();
        let contexts = self.0.pool.borrow_mut().drain();

        // Work of contexts on the poll stack is not in its slot; `drive` drops
        // it once the poll returns.
        let works = contexts
            .iter()
            .filter_map(|ctx| ctx.take_work())
            .collect::<Vec<_>>();

        drop(entries);
        drop(works);
        drop(contexts);
    }
}

impl WeakEventLoop {
    pub(crate) fn upgrade(&self) -> Option<EventLoop> {
        self.0.upgrade().map(EventLoop)
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("generation", &self.generation())
            .field("torn_down", &self.is_torn_down())
            .field("driving", &self.0.driving.get())
            .finish()
    }
}
