use crate::context::ContextId;
use crate::error::{Error, ProtocolError, Result};
use crate::evaluation::Id;
use crate::runtime::run_queue::TimerKey;
use bitflags::bitflags;
use smallvec::SmallVec;
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Most evaluations are awaited by one or two others at a time.
const INLINE_WAITERS: usize = 4;

/// Stored outcome of an evaluation. The value is type-erased so that the run
/// queue and the pool never need to know it; the typed `Evaluation<T>` handle
/// downcasts on retrieval.
pub(crate) type Outcome = Result<Rc<dyn Any>>;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub(crate) struct State: u8 {
        /// Evaluation of code running outside any pooled context.
        const ROOT = 1;

        /// The work has been polled at least once.
        const STARTED = 1 << 1;

        /// Suspended until a matching activation is delivered.
        const WAITING = 1 << 2;

        /// Terminal. The outcome is set and never changes again.
        const CONCLUDED = 1 << 3;
    }
}

/// Activation value carried by a run queue entry.
pub(crate) enum Signal {
    /// First run of a detached start.
    Start,

    /// Explicit resume with a value.
    Value(Box<dyn Any>),

    /// A deferred timeout fired before any explicit resume.
    Timeout,
}

impl fmt::Debug for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Signal::Start => f.write_str("Start"),
            Signal::Value(_) => f.debug_tuple("Value").field(&"<value>").finish(),
            Signal::Timeout => f.write_str("Timeout"),
        }
    }
}

/// Marker a concluding evaluation sends to each of its waiters.
pub(crate) struct Concluded;

/// One incarnation of an event loop. Shared by the loop and every evaluation
/// it creates, so an evaluation can tell it outlived its loop.
#[derive(Debug)]
pub(crate) struct Generation {
    id: u64,
    torn_down: Cell<bool>,
    cause: RefCell<Option<Error>>,
}

impl Generation {
    pub(crate) fn new() -> Rc<Self> {
        static COUNTER: AtomicU64 = AtomicU64::new(1);

        Rc::new(Self {
            id: COUNTER.fetch_add(1, Ordering::Relaxed),
            torn_down: Cell::new(false),
            cause: RefCell::new(None),
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn is_torn_down(&self) -> bool {
        self.torn_down.get()
    }

    pub(crate) fn tear_down(&self, cause: Option<Error>) {
        self.torn_down.set(true);
        self.cause.replace(cause);
    }

    pub(crate) fn check(&self) -> Result<()> {
        if self.torn_down.get() {
            let cause = self.cause.borrow().clone().map(Box::new);
            return Err(Error::Teardown { cause });
        }

        Ok(())
    }
}

/// Shared state behind every evaluation handle.
pub(crate) struct EvalCore {
    id: Id,
    generation: Rc<Generation>,
    state: Cell<State>,
    context: Cell<Option<ContextId>>,
    /// Key of the pending deferred entry of the current suspension.
    timer: Cell<Option<TimerKey>>,
    inbox: RefCell<Option<Signal>>,
    outcome: RefCell<Option<Outcome>>,
    waiters: RefCell<SmallVec<[Rc<EvalCore>; INLINE_WAITERS]>>,
}

impl EvalCore {
    pub(crate) fn new(generation: Rc<Generation>) -> Rc<Self> {
        Self::with_state(generation, State::empty())
    }

    pub(crate) fn new_root(generation: Rc<Generation>) -> Rc<Self> {
        Self::with_state(generation, State::ROOT | State::STARTED)
    }

    fn with_state(generation: Rc<Generation>, state: State) -> Rc<Self> {
        Rc::new(Self {
            id: Id::next(),
            generation,
            state: Cell::new(state),
            context: Cell::new(None),
            timer: Cell::new(None),
            inbox: RefCell::new(None),
            outcome: RefCell::new(None),
            waiters: RefCell::new(SmallVec::new()),
        })
    }

    pub(crate) fn id(&self) -> Id {
        self.id
    }

    pub(crate) fn check_generation(&self) -> Result<()> {
        self.generation.check()
    }

    fn has(&self, flag: State) -> bool {
        self.state.get().contains(flag)
    }

    fn set(&self, flag: State, value: bool) {
        let mut state = self.state.get();
        state.set(flag, value);
        self.state.set(state);
    }

    pub(crate) fn is_root(&self) -> bool {
        self.has(State::ROOT)
    }

    pub(crate) fn is_started(&self) -> bool {
        self.has(State::STARTED)
    }

    pub(crate) fn is_waiting(&self) -> bool {
        self.has(State::WAITING)
    }

    pub(crate) fn is_concluded(&self) -> bool {
        self.has(State::CONCLUDED)
    }

    pub(crate) fn mark_started(&self) {
        self.set(State::STARTED, true);
    }

    pub(crate) fn set_waiting(&self, waiting: bool) {
        self.set(State::WAITING, waiting);
    }

    pub(crate) fn context(&self) -> Option<ContextId> {
        self.context.get()
    }

    pub(crate) fn bind(&self, context: ContextId) {
        self.context.set(Some(context));
    }

    pub(crate) fn unbind(&self) -> Option<ContextId> {
        self.context.take()
    }

    pub(crate) fn timer(&self) -> Option<TimerKey> {
        self.timer.get()
    }

    pub(crate) fn set_timer(&self, key: Option<TimerKey>) {
        self.timer.set(key);
    }

    pub(crate) fn take_timer(&self) -> Option<TimerKey> {
        self.timer.take()
    }

    /// Puts the activation into the inbox for the suspended work to pick up.
    /// A second delivery before the first was consumed means the scheduler
    /// fired two activations for one suspension.
    pub(crate) fn deliver(&self, signal: Signal) -> Result<()> {
        let mut inbox = self.inbox.borrow_mut();
        if inbox.is_some() {
            return Err(Error::internal(format!(
                "evaluation {} activated twice for one suspension",
                self.id
            )));
        }

        *inbox = Some(signal);
        Ok(())
    }

    pub(crate) fn take_signal(&self) -> Option<Signal> {
        self.inbox.borrow_mut().take()
    }

    pub(crate) fn outcome(&self) -> Option<Outcome> {
        self.outcome.borrow().clone()
    }

    /// Flips the evaluation to concluded. Fails if it already is, leaving the
    /// first outcome intact.
    pub(crate) fn store_outcome(&self, outcome: Outcome) -> Result<()> {
        if self.is_concluded() {
            return Err(ProtocolError::AlreadyConcluded.into());
        }

        self.outcome.replace(Some(outcome));
        self.set(State::CONCLUDED, true);
        Ok(())
    }

    pub(crate) fn add_waiter(&self, waiter: Rc<EvalCore>) {
        self.waiters.borrow_mut().push(waiter);
    }

    pub(crate) fn remove_waiter(&self, waiter: &Rc<EvalCore>) {
        self.waiters.borrow_mut().retain(|w| !Rc::ptr_eq(w, waiter));
    }

    pub(crate) fn take_waiters(&self) -> SmallVec<[Rc<EvalCore>; INLINE_WAITERS]> {
        std::mem::take(&mut *self.waiters.borrow_mut())
    }

    pub(crate) fn num_waiters(&self) -> usize {
        self.waiters.borrow().len()
    }
}

impl fmt::Debug for EvalCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvalCore")
            .field("id", &self.id)
            .field("generation", &self.generation.id())
            .field("state", &self.state.get())
            .field("context", &self.context.get())
            .finish()
    }
}
