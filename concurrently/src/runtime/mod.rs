//! The per-thread event loop and the functions that drive it.
//!
//! Every thread owns at most one [`EventLoop`], created with the default
//! configuration the first time it is needed. Use [`Builder`] to configure it
//! explicitly before starting any work.
//!
//! ```
//! use concurrently::evaluation::await_resume;
//! use concurrently::runtime;
//!
//! let evaluation = runtime::start(async {
//!     let n: u32 = await_resume().await?;
//!     Ok(n * 2)
//! })?;
//!
//! evaluation.resume(21_u32)?;
//! runtime::run_once()?;
//!
//! assert_eq!(evaluation.try_result().transpose()?, Some(42));
//! # Ok::<(), concurrently::Error>(())
//! ```
use crate::context;
use crate::error::Result;
use crate::evaluation::Evaluation;

// Public API
pub mod builder;
pub use builder::Builder;

pub mod driver;
pub use driver::{Driver, ParkDriver};

mod event_loop;
pub use event_loop::{EventLoop, LoopStats};

// Exports
pub(crate) use builder::LoopConfig;
pub(crate) use event_loop::WeakEventLoop;

pub(crate) mod run_queue;


/// Starts `work` on the current thread's loop and runs it until its first
/// suspension point or completion.
///
/// See [`EventLoop::start`].
pub fn start<T, F>(work: F) -> Result<Evaluation<T>>
where
    T: 'static,
    F: Future<Output = Result<T>> + 'static,
{
    context::current().start(work)
}

/// Starts `work` on the current thread's loop without running it yet.
///
/// See [`EventLoop::start_detached`].
pub fn start_detached<T, F>(work: F) -> Result<Evaluation<T>>
where
    T: 'static,
    F: Future<Output = Result<T>> + 'static,
{
    context::current().start_detached(work)
}

/// Drives the current thread's loop until `future` completes.
///
/// See [`EventLoop::block_on`].
pub fn block_on<F: Future>(future: F) -> Result<F::Output> {
    context::current().block_on(future)
}

/// Runs one step of the current thread's loop.
///
/// See [`EventLoop::run_once`].
pub fn run_once() -> Result<usize> {
    context::current().run_once()
}

/// Discards the current thread's loop with everything pending on it and
/// installs a fresh one with the same configuration.
///
/// Evaluations started before the call fail every further operation with
/// [`Error::Teardown`](crate::Error::Teardown).
pub fn reinitialize() -> EventLoop {
    context::reinitialize(None)
}
