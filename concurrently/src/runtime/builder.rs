use crate::context;
use crate::runtime::{Driver, EventLoop, ParkDriver};
use anyhow::{Result, anyhow};
use std::convert::TryFrom;
use std::fmt;
use std::rc::Rc;

/// Contexts created before the first unit of work starts.
const PREALLOC_CONTEXTS: usize = 0;

/// Idle contexts kept around for reuse; released contexts beyond this are
/// dropped.
const MAX_IDLE_CONTEXTS: usize = 256;

/// Configures the event loop of the current thread.
///
/// Every thread gets a default loop on first use. Building one explicitly
/// is only required to change the defaults, for example to plug in a
/// [`Driver`] that integrates an external readiness source.
///
/// ```
/// use concurrently::runtime::Builder;
///
/// let event_loop = Builder::new()
///     .prealloc_contexts(4)
///     .max_idle_contexts(16)
///     .try_build()
///     .expect("no work pending on this thread");
///
/// assert_eq!(event_loop.stats().contexts_idle, 4);
/// ```
#[derive(Debug)]
pub struct Builder {
    /// Number of execution contexts created up front.
    prealloc_contexts: usize,

    /// Upper bound on the idle set of the context pool.
    max_idle_contexts: usize,

    /// Clock and idling primitive.
    driver: Rc<dyn Driver>,
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    pub fn new() -> Self {
        Self {
            prealloc_contexts: PREALLOC_CONTEXTS,
            max_idle_contexts: MAX_IDLE_CONTEXTS,
            driver: Rc::new(ParkDriver),
        }
    }

    /// Creates `val` execution contexts when the loop is built, so the first
    /// units of work do not pay for it.
    pub fn prealloc_contexts(mut self, val: usize) -> Self {
        self.prealloc_contexts = val;
        self
    }

    #[track_caller]
    pub fn max_idle_contexts(mut self, val: usize) -> Self {
        assert!(val > 0, "max_idle_contexts must be greater than 0");
        self.max_idle_contexts = val;
        self
    }

    pub fn driver(mut self, driver: impl Driver + 'static) -> Self {
        self.driver = Rc::new(driver);
        self
    }

    /// Creates the loop and installs it as the thread's current loop. The loop
    /// it replaces is torn down.
    ///
    /// Fails if the configuration is inconsistent, or if the current loop is
    /// still running something: pending entries, bound contexts, or a
    /// `block_on` in progress.
    pub fn try_build(self) -> Result<EventLoop> {
        let cfg = LoopConfig::try_from(self)?;

        if let Some(current) = context::try_current()
            && current.is_busy()
        {
            return Err(anyhow!(
                "Cannot replace the event loop of this thread: it still has pending work."
            ));
        }

        let event_loop = EventLoop::new(cfg);
        if let Some(previous) = context::install(event_loop.clone()) {
            previous.shutdown(None);
        }

        tracing::debug!(generation = event_loop.generation(), "event loop built");
        Ok(event_loop)
    }
}

#[derive(Clone)]
pub(crate) struct LoopConfig {
    pub(crate) prealloc_contexts: usize,
    pub(crate) max_idle_contexts: usize,
    pub(crate) driver: Rc<dyn Driver>,
}

impl Default for LoopConfig {
    fn default() -> Self {
        LoopConfig {
            prealloc_contexts: PREALLOC_CONTEXTS,
            max_idle_contexts: MAX_IDLE_CONTEXTS,
            driver: Rc::new(ParkDriver),
        }
    }
}

impl fmt::Debug for LoopConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopConfig")
            .field("prealloc_contexts", &self.prealloc_contexts)
            .field("max_idle_contexts", &self.max_idle_contexts)
            .field("driver", &self.driver)
            .finish()
    }
}

impl LoopConfig {
    fn validate(&self) -> Result<()> {
        if self.prealloc_contexts > self.max_idle_contexts {
            return Err(anyhow!(
                "prealloc_contexts ({}) exceeds max_idle_contexts ({}); the extra contexts \
                 would be dropped on their first release.",
                self.prealloc_contexts,
                self.max_idle_contexts
            ));
        }

        Ok(())
    }
}

impl TryFrom<Builder> for LoopConfig {
    type Error = anyhow::Error;

    fn try_from(builder: Builder) -> Result<Self, Self::Error> {
        let cfg = LoopConfig {
            prealloc_contexts: builder.prealloc_contexts,
            max_idle_contexts: builder.max_idle_contexts,
            driver: builder.driver,
        };

        cfg.validate()?;

        Ok(cfg)
    }
}
