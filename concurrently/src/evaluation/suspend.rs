use crate::error::{Error, ProtocolError, Result};
use crate::evaluation::core::{EvalCore, Signal};
use crate::runtime::{EventLoop, WeakEventLoop};
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};
use std::time::Duration;

/// Suspends `evaluation` until the loop delivers one activation to it.
///
/// The first poll registers the suspension: it marks the evaluation waiting
/// and, with `within`, schedules a deferred timeout. The future resolves once
/// the activation sits in the evaluation's inbox. Dropping it before that
/// withdraws whatever was scheduled on its behalf.
pub(crate) struct Suspend {
    event_loop: WeakEventLoop,
    evaluation: Rc<EvalCore>,
    within: Option<Duration>,
    registered: bool,
    done: bool,
}

impl Suspend {
    pub(crate) fn new(
        event_loop: &EventLoop,
        evaluation: Rc<EvalCore>,
        within: Option<Duration>,
    ) -> Self {
        Self {
            event_loop: event_loop.downgrade(),
            evaluation,
            within,
            registered: false,
            done: false,
        }
    }

    fn register(&mut self) -> Result<()> {
        self.evaluation.check_generation()?;

        // Concluded while running: never resumable again, the loop drops the
        // work once this poll returns.
        if self.evaluation.is_concluded() {
            return Ok(());
        }

        if self.evaluation.is_waiting() {
            return Err(ProtocolError::AlreadyWaiting.into());
        }

        let event_loop = self
            .event_loop
            .upgrade()
            .ok_or_else(|| Error::Teardown { cause: None })?;

        if let Some(within) = self.within {
            event_loop.schedule_timeout(&self.evaluation, within);
        }

        self.evaluation.set_waiting(true);
        self.registered = true;
        Ok(())
    }
}

impl Future for Suspend {
    type Output = Result<Signal>;

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;

        if this.done {
            return Poll::Ready(Err(Error::internal(format!(
                "suspension of evaluation {} polled after completion",
                this.evaluation.id()
            ))));
        }

        if !this.registered {
            this.register()?;
            return Poll::Pending;
        }

        match this.evaluation.take_signal() {
            Some(signal) => {
                this.done = true;
                Poll::Ready(Ok(signal))
            }
            None => Poll::Pending,
        }
    }
}

impl Drop for Suspend {
    fn drop(&mut self) {
        if !self.registered || self.done {
            return;
        }

        match self.event_loop.upgrade() {
            Some(event_loop) => event_loop.withdraw(&self.evaluation),
            None => self.evaluation.set_waiting(false),
        }
    }
}
