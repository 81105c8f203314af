use crate::error::Error;
use crate::runtime::{EventLoop, LoopConfig};
use std::cell::RefCell;
use std::thread_local;

// Exports
pub(crate) mod exec;
pub(crate) use exec::{ContextId, ExecContext, Phase, Step, Work};

pub(crate) mod pool;
pub(crate) use pool::ContextPool;

// One event loop per thread. The slot only ever hands out clones of the `Rc`
// handle, so no borrow of it outlives the call that reads it; work running
// inside the loop is free to reach back in.
thread_local! {
    static CURRENT: RefCell<Option<EventLoop>> = const { RefCell::new(None) };
}

/// The thread's event loop, created with the default configuration on first use.
pub(crate) fn current() -> EventLoop {
    CURRENT.with(|slot| {
        slot.borrow_mut()
            .get_or_insert_with(|| EventLoop::new(LoopConfig::default()))
            .clone()
    })
}

/// The thread's event loop, if one has been created.
pub(crate) fn try_current() -> Option<EventLoop> {
    CURRENT.with(|slot| slot.borrow().clone())
}

/// Makes `event_loop` the thread's loop and returns the one it replaced.
pub(crate) fn install(event_loop: EventLoop) -> Option<EventLoop> {
    CURRENT.with(|slot| slot.borrow_mut().replace(event_loop))
}

/// Replaces the thread's loop by a fresh one with the same configuration and
/// tears the old one down.
pub(crate) fn reinitialize(cause: Option<Error>) -> EventLoop {
    let previous = CURRENT.with(|slot| slot.borrow_mut().take());

    let fresh = match &previous {
        Some(previous) => previous.successor(),
        None => EventLoop::new(LoopConfig::default()),
    };
    install(fresh.clone());

    // Shutdown drops pending work, which may run arbitrary destructors that
    // look up the current loop; it must already be the fresh one.
    if let Some(previous) = previous {
        previous.shutdown(cause);
    }

    fresh
}

/// Tears `event_loop` down and, if it is the thread's loop, installs its
/// successor.
pub(crate) fn reinitialize_from(event_loop: &EventLoop, cause: Option<Error>) {
    let is_current = try_current().is_some_and(|current| current.ptr_eq(event_loop));

    if is_current {
        reinitialize(cause);
    } else {
        event_loop.shutdown(cause);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_event_loop_is_thread_local() {
        let here = current();
        assert!(here.ptr_eq(&current()));

        let generation = here.generation();
        let other = thread::spawn(move || current().generation())
            .join()
            .expect("thread panicked");

        assert_ne!(generation, other);
    }

    #[test]
    fn test_reinitialize_installs_successor() {
        let before = current();
        let after = reinitialize(None);

        assert!(!before.ptr_eq(&after));
        assert!(after.ptr_eq(&current()));
        assert!(before.is_torn_down());
        assert!(!after.is_torn_down());
    }
}
