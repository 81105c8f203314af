use crate::evaluation::core::{EvalCore, Signal};
use smallvec::SmallVec;
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;
use std::time::Instant;

/// Distinguishes entry classes so a resume can withdraw exactly the timeout
/// it races against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Tag {
    /// Explicit resume or start; always immediate.
    Explicit,

    /// Timed activation that an explicit resume supersedes.
    Deferred,
}

#[derive(Debug)]
pub(crate) struct Entry {
    pub(crate) evaluation: Rc<EvalCore>,
    pub(crate) signal: Signal,
    pub(crate) tag: Tag,
}

impl Entry {
    fn targets(&self, evaluation: &Rc<EvalCore>) -> bool {
        Rc::ptr_eq(&self.evaluation, evaluation)
    }
}

/// Position of a timed entry: due time, then insertion sequence.
pub(crate) type TimerKey = (Instant, u64);

#[derive(Debug)]
pub(crate) enum NextDue {
    Ready(Entry),
    /// Only timed entries are pending; the earliest is due at this instant.
    Wait(Instant),
    Empty,
}

/// Ordered schedule of pending activations.
///
/// Immediate entries run FIFO. Timed entries are keyed by due time and a
/// monotonically increasing insertion sequence, so equal due times fire in
/// insertion order.
#[derive(Debug, Default)]
pub(crate) struct RunQueue {
    immediate: VecDeque<Entry>,
    timed: BTreeMap<TimerKey, Entry>,
    seq: u64,
}

impl RunQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn schedule_immediately(&mut self, evaluation: Rc<EvalCore>, signal: Signal) {
        tracing::trace!(evaluation = %evaluation.id(), ?signal, "scheduled immediately");

        self.immediate.push_back(Entry {
            evaluation,
            signal,
            tag: Tag::Explicit,
        });
    }

    /// Inserts a timed entry. The key of a deferred entry is recorded on the
    /// evaluation, so the resume racing against it withdraws it directly.
    pub(crate) fn schedule_at(
        &mut self,
        evaluation: Rc<EvalCore>,
        due: Instant,
        signal: Signal,
        tag: Tag,
    ) -> TimerKey {
        tracing::trace!(evaluation = %evaluation.id(), ?due, ?signal, ?tag, "scheduled at");

        let key = (due, self.seq);
        self.seq += 1;

        if tag == Tag::Deferred {
            evaluation.set_timer(Some(key));
        }

        self.timed.insert(
            key,
            Entry {
                evaluation,
                signal,
                tag,
            },
        );

        key
    }

    /// Withdraws the pending entry for `evaluation` carrying `tag`: its
    /// deferred entry, or the earliest explicit one. The removed entry is
    /// handed back so its payload is dropped by the caller, outside of any
    /// borrow of the queue.
    pub(crate) fn cancel(&mut self, evaluation: &Rc<EvalCore>, tag: Tag) -> Option<Entry> {
        match tag {
            Tag::Deferred => {
                let key = evaluation.take_timer()?;
                let entry = self.timed.remove(&key)?;
                debug_assert!(entry.targets(evaluation));
                Some(entry)
            }
            Tag::Explicit => {
                let pos = self
                    .immediate
                    .iter()
                    .position(|entry| entry.tag == tag && entry.targets(evaluation))?;

                self.immediate.remove(pos)
            }
        }
    }

    /// Withdraws every pending entry for `evaluation`.
    pub(crate) fn cancel_all(&mut self, evaluation: &Rc<EvalCore>) -> SmallVec<[Entry; 2]> {
        let mut removed = SmallVec::new();

        let keys = self
            .timed
            .iter()
            .filter(|(_, entry)| entry.targets(evaluation))
            .map(|(key, _)| *key)
            .collect::<SmallVec<[_; 2]>>();

        for key in keys {
            removed.extend(self.timed.remove(&key));
        }
        evaluation.set_timer(None);

        let mut i = 0;
        while i < self.immediate.len() {
            if self.immediate[i].targets(evaluation) {
                removed.extend(self.immediate.remove(i));
            } else {
                i += 1;
            }
        }

        removed
    }

    /// Oldest immediate entry. Never falls back to timed entries.
    pub(crate) fn next_immediate(&mut self) -> Option<Entry> {
        self.immediate.pop_front()
    }

    /// Earliest timed entry if it is due at `now`, or when it will be.
    pub(crate) fn next_timed(&mut self, now: Instant) -> NextDue {
        match self.timed.first_key_value() {
            Some((&(due, _), _)) if due <= now => match self.timed.pop_first() {
                Some((key, entry)) => {
                    if entry.evaluation.timer() == Some(key) {
                        entry.evaluation.set_timer(None);
                    }
                    NextDue::Ready(entry)
                }
                None => NextDue::Empty,
            },
            Some((&(due, _), _)) => NextDue::Wait(due),
            None => NextDue::Empty,
        }
    }

    /// Next entry ready to run at `now`: immediate entries first, then the
    /// earliest due timed entry.
    #[allow(unused)]
    pub(crate) fn next_due(&mut self, now: Instant) -> NextDue {
        match self.next_immediate() {
            Some(entry) => NextDue::Ready(entry),
            None => self.next_timed(now),
        }
    }

    pub(crate) fn immediate_len(&self) -> usize {
        self.immediate.len()
    }

    pub(crate) fn timed_len(&self) -> usize {
        self.timed.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.immediate.is_empty() && self.timed.is_empty()
    }

    /// Removes everything, for teardown.
    pub(crate) fn drain(&mut self) -> Vec<Entry> {
        let mut entries = self.immediate.drain(..).collect::<Vec<_>>();
        entries.extend(std::mem::take(&mut self.timed).into_values());
        entries
    }
}
