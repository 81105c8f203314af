use crate::runtime::{Builder, Driver, EventLoop};
use anyhow::Result;
use std::cell::Cell;
use std::io;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// Virtual clock. Parking jumps straight to the deadline, so timed entries
/// become due without the test ever sleeping.
#[derive(Debug, Clone)]
pub(crate) struct ManualDriver {
    origin: Instant,
    elapsed: Rc<Cell<Duration>>,
    parks: Rc<Cell<usize>>,
}

impl ManualDriver {
    pub(crate) fn new() -> Self {
        Self {
            origin: Instant::now(),
            elapsed: Rc::new(Cell::new(Duration::ZERO)),
            parks: Rc::new(Cell::new(0)),
        }
    }

    pub(crate) fn advance(&self, by: Duration) {
        self.elapsed.set(self.elapsed.get() + by);
    }

    pub(crate) fn elapsed(&self) -> Duration {
        self.elapsed.get()
    }

    /// Number of times the loop parked on this driver.
    pub(crate) fn parks(&self) -> usize {
        self.parks.get()
    }
}

impl Driver for ManualDriver {
    fn now(&self) -> Instant {
        self.origin + self.elapsed.get()
    }

    fn park(&self, deadline: Instant) -> io::Result<()> {
        self.parks.set(self.parks.get() + 1);

        if deadline > self.now() {
            self.elapsed.set(deadline - self.origin);
        }

        Ok(())
    }
}

/// Installs a fresh loop on the calling thread, driven by a virtual clock.
#[must_use]
pub(crate) fn init_event_loop(builder: Option<Builder>) -> Result<(EventLoop, ManualDriver)> {
    let driver = ManualDriver::new();
    let event_loop = builder
        .unwrap_or_default()
        .driver(driver.clone())
        .try_build()?;

    Ok((event_loop, driver))
}
