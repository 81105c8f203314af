use crate::context;
use crate::error::{Error, Result};
use crate::evaluation::core::Signal;
use crate::evaluation::handle::unexpected;
use crate::evaluation::suspend::Suspend;
use std::fmt;
use std::time::Duration;

/// Options of a suspending call.
///
/// ```
/// use concurrently::AwaitOptions;
/// use std::time::Duration;
///
/// let opts = AwaitOptions::new()
///     .within(Duration::from_millis(50))
///     .timeout_result(Ok("timed out"));
/// # let _ = opts;
/// ```
pub struct AwaitOptions<T> {
    pub(crate) within: Option<Duration>,
    pub(crate) timeout_result: Option<Result<T>>,
}

impl<T> AwaitOptions<T> {
    pub fn new() -> Self {
        Self {
            within: None,
            timeout_result: None,
        }
    }

    /// Gives up waiting once `duration` has elapsed.
    pub fn within(mut self, duration: Duration) -> Self {
        self.within = Some(duration);
        self
    }

    /// What the call yields when it gives up waiting. Defaults to
    /// [`Error::Timeout`]. An `Ok` value turns the timeout into an ordinary
    /// result.
    pub fn timeout_result(mut self, result: Result<T>) -> Self {
        self.timeout_result = Some(result);
        self
    }

    pub(crate) fn on_timeout(self) -> Result<T> {
        let within = self.within.unwrap_or_default();
        self.timeout_result
            .unwrap_or_else(|| Err(Error::Timeout(within)))
    }
}

impl<T> Default for AwaitOptions<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for AwaitOptions<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AwaitOptions")
            .field("within", &self.within)
            .field("timeout_result", &self.timeout_result.is_some())
            .finish()
    }
}

/// Suspends the running evaluation until someone calls
/// [`Evaluation::resume`](crate::Evaluation::resume) on it, and returns the
/// value it was resumed with.
///
/// Fails with [`ProtocolError::AlreadyWaiting`] if the evaluation is
/// suspended already (for instance two `await_resume` calls joined in one
/// unit of work), and with [`ProtocolError::UnexpectedValue`] if it is
/// resumed with a value that is not a `V`.
///
/// [`ProtocolError::AlreadyWaiting`]: crate::ProtocolError::AlreadyWaiting
/// [`ProtocolError::UnexpectedValue`]: crate::ProtocolError::UnexpectedValue
pub async fn await_resume<V: 'static>() -> Result<V> {
    await_resume_with(AwaitOptions::new()).await
}

/// Like [`await_resume`], giving up after [`AwaitOptions::within`].
pub async fn await_resume_with<V: 'static>(opts: AwaitOptions<V>) -> Result<V> {
    let event_loop = context::current();
    let evaluation = event_loop.current_evaluation();

    match Suspend::new(&event_loop, evaluation, opts.within).await? {
        Signal::Value(value) => value
            .downcast::<V>()
            .map(|value| *value)
            .map_err(|_| unexpected::<V>()),
        Signal::Timeout => opts.on_timeout(),
        Signal::Start => Err(Error::internal("start signal delivered to a suspension")),
    }
}

/// Suspends the running evaluation for `duration`. An explicit resume ends
/// the wait early; its value is discarded.
pub async fn wait(duration: Duration) -> Result<()> {
    let event_loop = context::current();
    let evaluation = event_loop.current_evaluation();

    match Suspend::new(&event_loop, evaluation, Some(duration)).await? {
        Signal::Timeout | Signal::Value(_) => Ok(()),
        Signal::Start => Err(Error::internal("start signal delivered to a suspension")),
    }
}
