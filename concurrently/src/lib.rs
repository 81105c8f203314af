//! A single-threaded cooperative scheduler.
//!
//! Units of work are futures started on the thread's [`EventLoop`]. Each one
//! runs in a pooled execution context and suspends only at explicit points
//! ([`await_resume`], [`wait`], [`Evaluation::await_result`]), so there is
//! never more than one unit of work running and no locking is needed between
//! them. The order in which suspended work continues is decided by the run
//! queue: immediate resumptions first-in first-out, timed ones by due time.
//!
//! ```
//! use concurrently::{runtime, AwaitOptions};
//! use concurrently::evaluation::wait;
//! use std::time::Duration;
//!
//! let slow = runtime::start(async {
//!     wait(Duration::from_millis(20)).await?;
//!     Ok("done")
//! })?;
//!
//! let polled = runtime::block_on(async {
//!     slow.await_result_opts(
//!         AwaitOptions::new()
//!             .within(Duration::from_millis(1))
//!             .timeout_result(Ok("still running")),
//!     )
//!     .await
//! })??;
//! assert_eq!(polled, "still running");
//!
//! let done = runtime::block_on(async { slow.await_result().await })??;
//! assert_eq!(done, "done");
//! # Ok::<(), concurrently::Error>(())
//! ```

pub mod error;
pub use error::{Error, ProtocolError, Result};

mod context;

pub mod evaluation;
pub use evaluation::{
    AwaitOptions, Evaluation, EvaluationRef, await_resume, await_resume_with, wait,
};

pub mod runtime;
pub use runtime::{EventLoop, block_on, reinitialize, run_once, start, start_detached};

#[cfg(test)]
mod test_utils;
