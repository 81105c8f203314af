use std::fmt;
use std::io;
use std::thread;
use std::time::Instant;

/// Clock and idling primitive the event loop runs on.
///
/// The loop only ever asks for "wake me at `deadline` or sooner". Returning
/// early is always allowed: the loop re-checks its timed entries and parks
/// again if nothing is due yet. A driver that integrates an external readiness
/// source (sockets, pipes, signals) returns as soon as that source fires.
pub trait Driver: fmt::Debug {
    /// Monotonic time used to decide which timed entries are due.
    fn now(&self) -> Instant;

    /// Idles the thread until `deadline`, or until something external happens.
    fn park(&self, deadline: Instant) -> io::Result<()>;
}

/// Default driver: the system monotonic clock and `thread::park_timeout`.
///
/// Another thread can cut a park short with [`Thread::unpark`] on the thread
/// running the loop.
///
/// [`Thread::unpark`]: std::thread::Thread::unpark
#[derive(Debug, Default, Clone, Copy)]
pub struct ParkDriver;

impl Driver for ParkDriver {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn park(&self, deadline: Instant) -> io::Result<()> {
        let timeout = deadline.saturating_duration_since(Instant::now());
        if !timeout.is_zero() {
            thread::park_timeout(timeout);
        }

        Ok(())
    }
}
