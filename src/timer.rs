//! Armed timers.
//!
//! An unordered queue in insertion order; the earliest expiry is found with a
//! linear scan. Timer counts stay small in practice, so this beats keeping a
//! heap coherent. Firing order among timers expired in the same step is
//! insertion order.

use slab::Slab;
use std::collections::VecDeque;

use crate::{
    op::{Op, OpKind},
    time::TimeCounter,
};

#[derive(Default)]
pub(crate) struct TimerQueue {
    ids: VecDeque<usize>,
}

impl TimerQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, index: usize) {
        self.ids.push_back(index);
    }

    pub(crate) fn remove(&mut self, index: usize) {
        self.ids.retain(|&i| i != index);
    }

    pub(crate) fn len(&self) -> usize {
        self.ids.len()
    }

    /// The earliest expiration among armed timers.
    pub(crate) fn next_expiry(&self, ops: &Slab<Op>) -> Option<TimeCounter> {
        self.ids
            .iter()
            .filter_map(|&index| expiry(ops, index))
            .min()
    }

    /// Unlink and return every timer due at `now`, in insertion order.
    pub(crate) fn take_expired(&mut self, ops: &Slab<Op>, now: TimeCounter) -> Vec<usize> {
        let mut due = Vec::new();
        self.ids.retain(|&index| {
            let expired = match expiry(ops, index) {
                Some(at) => now.is_later_than_or_equal(at),
                None => false,
            };
            if expired {
                due.push(index);
            }
            !expired
        });
        due
    }
}

fn expiry(ops: &Slab<Op>, index: usize) -> Option<TimeCounter> {
    match ops.get(index).map(|op| &op.kind) {
        Some(OpKind::LoopTimeout(t)) => Some(t.expires_at),
        _ => {
            debug_assert!(false, "non-timer in the timer queue");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::op::LoopTimeout;

    fn timer_op(expires_at: TimeCounter) -> Op {
        Op::new(OpKind::LoopTimeout(LoopTimeout {
            expires_at,
            callback: Box::new(|_, _| {}),
        }))
    }

    #[test]
    fn next_expiry_is_minimum() {
        let base = TimeCounter::now();
        let mut ops = Slab::new();
        let mut timers = TimerQueue::new();
        let far = ops.insert(timer_op(base.offset_by(Duration::from_millis(100))));
        let near = ops.insert(timer_op(base.offset_by(Duration::from_millis(1))));
        timers.push(far);
        timers.push(near);
        assert_eq!(
            timers.next_expiry(&ops),
            Some(base.offset_by(Duration::from_millis(1)))
        );
    }

    #[test]
    fn expired_fire_in_insertion_order() {
        let base = TimeCounter::now();
        let mut ops = Slab::new();
        let mut timers = TimerQueue::new();
        let a = ops.insert(timer_op(base.offset_by(Duration::from_millis(2))));
        let b = ops.insert(timer_op(base.offset_by(Duration::from_millis(1))));
        timers.push(a);
        timers.push(b);
        let due = timers.take_expired(&ops, base.offset_by(Duration::from_millis(5)));
        assert_eq!(due, vec![a, b]);
        assert_eq!(timers.len(), 0);
    }

    #[test]
    fn unexpired_stay_armed() {
        let base = TimeCounter::now();
        let mut ops = Slab::new();
        let mut timers = TimerQueue::new();
        let near = ops.insert(timer_op(base.offset_by(Duration::from_millis(1))));
        let far = ops.insert(timer_op(base.offset_by(Duration::from_millis(50))));
        timers.push(near);
        timers.push(far);
        let due = timers.take_expired(&ops, base.offset_by(Duration::from_millis(1)));
        assert_eq!(due, vec![near]);
        assert_eq!(timers.len(), 1);
        assert_eq!(
            timers.next_expiry(&ops),
            Some(base.offset_by(Duration::from_millis(50)))
        );
    }
}
