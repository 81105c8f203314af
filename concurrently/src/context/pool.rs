use crate::context::exec::{ContextId, ExecContext, Phase};
use crate::error::{Error, Result};
use slab::Slab;
use std::rc::Rc;

/// Arena of execution contexts with an idle set.
///
/// Every context ever created lives in the slab until the pool is dropped or
/// trimmed; the slab key doubles as the `ContextId` stored on the evaluation
/// the context is driving. Idle contexts are reused LIFO to keep the most
/// recently touched one warm.
#[derive(Debug)]
pub(crate) struct ContextPool {
    contexts: Slab<Rc<ExecContext>>,
    idle: Vec<ContextId>,
    max_idle: usize,
    created: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PoolStats {
    pub(crate) created: u64,
    pub(crate) live: usize,
    pub(crate) idle: usize,
}

impl ContextPool {
    pub(crate) fn new(max_idle: usize) -> Self {
        Self {
            contexts: Slab::new(),
            idle: Vec::new(),
            max_idle,
            created: 0,
        }
    }

    /// Creates `n` contexts up front, capped by the idle limit.
    pub(crate) fn prealloc(&mut self, n: usize) {
        let n = n.min(self.max_idle);
        self.contexts.reserve(n);

        while self.idle.len() < n {
            let ctx = self.create();
            self.idle.push(ctx.id());
        }
    }

    /// Hands out an idle context, creating one if none is left.
    pub(crate) fn acquire(&mut self) -> Rc<ExecContext> {
        while let Some(id) = self.idle.pop() {
            if let Some(ctx) = self.contexts.get(id.0) {
                debug_assert_eq!(ctx.phase(), Phase::Idle);
                return ctx.clone();
            }
        }

        self.create()
    }

    fn create(&mut self) -> Rc<ExecContext> {
        let entry = self.contexts.vacant_entry();
        let ctx = Rc::new(ExecContext::new(ContextId(entry.key())));
        entry.insert(ctx.clone());

        self.created += 1;
        tracing::trace!(context = ?ctx.id(), created = self.created, "execution context created");
        ctx
    }

    /// Returns a context whose iteration just ended to the idle set. Beyond
    /// the idle limit the context is removed from the arena instead.
    pub(crate) fn release(&mut self, ctx: &ExecContext) -> Result<()> {
        let id = ctx.id();

        if ctx.phase() != Phase::Idle {
            return Err(Error::internal(format!(
                "context {:?} released while {:?}",
                id,
                ctx.phase()
            )));
        }

        if !self
            .contexts
            .get(id.0)
            .is_some_and(|pooled| std::ptr::eq(&**pooled, ctx))
        {
            // Context of a pool that has been drained in the meantime.
            return Ok(());
        }

        if self.idle.contains(&id) {
            return Err(Error::internal(format!("context {:?} released twice", id)));
        }

        if self.idle.len() >= self.max_idle {
            self.contexts.remove(id.0);
            return Ok(());
        }

        self.idle.push(id);
        Ok(())
    }

    pub(crate) fn get(&self, id: ContextId) -> Option<Rc<ExecContext>> {
        self.contexts.get(id.0).cloned()
    }

    /// Forgets every context. The caller strips and drops them outside of any
    /// borrow of the pool.
    pub(crate) fn drain(&mut self) -> Vec<Rc<ExecContext>> {
        self.idle.clear();
        self.contexts.drain().collect()
    }

    pub(crate) fn stats(&self) -> PoolStats {
        PoolStats {
            created: self.created,
            live: self.contexts.len(),
            idle: self.idle.len(),
        }
    }
}
