//! Evaluations and the protocol to suspend, resume, await and cancel them.
//!
//! An [`Evaluation`] is the handle to one unit of work started on the event
//! loop. Work suspends only at the calls of this module: [`await_resume`],
//! [`wait`] and [`Evaluation::await_result`]. Anything in between runs without
//! interleaving any other unit of work.
//!
//! ```
//! use concurrently::evaluation::{await_resume, EvaluationRef};
//! use concurrently::runtime;
//!
//! runtime::block_on(async {
//!     let echo = runtime::start(async {
//!         let line: String = await_resume().await?;
//!         Ok(line.to_uppercase())
//!     })?;
//!
//!     assert!(echo.is_waiting());
//!     echo.resume(String::from("hello"))?;
//!
//!     assert_eq!(echo.await_result().await?, "HELLO");
//!     assert!(EvaluationRef::current().is_root());
//!     Ok::<(), concurrently::Error>(())
//! })??;
//! # Ok::<(), concurrently::Error>(())
//! ```

pub(crate) mod core;

// Public API
mod handle;
pub use handle::{Evaluation, EvaluationRef};

pub mod id;
pub use id::Id;

mod protocol;
pub use protocol::{AwaitOptions, await_resume, await_resume_with, wait};

// Exports
pub(crate) mod suspend;

#[cfg(test)]
mod tests;
