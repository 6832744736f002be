//! Ordered set of pending deadlines, keyed by absolute time.
//!
//! A small, leaf data structure with no dependency on the rest of the
//! kernel: a textbook lazy-deletion binary heap. Cancelling a pending
//! deadline does not touch heap position, it just flips a liveness bit on a
//! `slotmap` token, so a stale entry is discarded lazily the next time it
//! would surface.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use slotmap::{new_key_type, SlotMap};

use crate::task::TaskId;

new_key_type! {
    /// A live/stale handle to one pushed deadline. Surviving independent of
    /// heap position is what makes `cancel` O(1).
    pub struct TimerToken;
}

/// What a popped deadline was for — a plain `sleep()` trap, or an overlay
/// timeout-stack frame racing whatever trap the task is actually suspended
/// in.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TimerKind {
    Sleep,
    TimeoutFrame(crate::error::TimeoutFrameId),
}

struct Liveness {
    alive: bool,
    task: TaskId,
    kind: TimerKind,
}

struct HeapEntry {
    deadline: f64,
    seq: u64,
    token: TimerToken,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}
impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    /// Reversed so a `BinaryHeap` (a max-heap) behaves as a min-heap over
    /// `(deadline, seq)`; `seq` is the tie-break that makes ordering stable
    /// on equal deadlines (insertion order).
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .partial_cmp(&self.deadline)
            .unwrap_or(Ordering::Equal)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Min-heap over `(deadline, generation, task)`.
#[derive(Default)]
pub struct TimerHeap {
    heap: BinaryHeap<HeapEntry>,
    tokens: SlotMap<TimerToken, Liveness>,
    seq: u64,
}

impl TimerHeap {
    pub fn new() -> TimerHeap {
        TimerHeap::default()
    }

    /// Push a new deadline for `task`, returning the token `cancel` needs.
    pub fn push(&mut self, task: TaskId, deadline: f64, kind: TimerKind) -> TimerToken {
        let seq = self.seq;
        self.seq += 1;
        let token = self.tokens.insert(Liveness {
            alive: true,
            task,
            kind,
        });
        self.heap.push(HeapEntry {
            deadline,
            seq,
            token,
        });
        token
    }

    /// Bump the token's liveness bit; the heap entry is left in place and
    /// skipped the next time it would be popped. O(1).
    pub fn cancel(&mut self, token: TimerToken) {
        if let Some(entry) = self.tokens.get_mut(token) {
            entry.alive = false;
        }
        self.tokens.remove(token);
    }

    /// Drop stale entries sitting at the head so callers can peek the true
    /// next deadline.
    fn prune_head(&mut self) {
        while let Some(top) = self.heap.peek() {
            if self.tokens.contains_key(top.token) {
                break;
            }
            self.heap.pop();
        }
    }

    /// The nearest live deadline, if any — the run loop's poll bound.
    pub fn next_deadline(&mut self) -> Option<f64> {
        self.prune_head();
        self.heap.peek().map(|e| e.deadline)
    }

    /// Pop every live entry whose deadline has passed, in deadline order
    /// (ties in insertion order).
    pub fn pop_expired(&mut self, now: f64) -> Vec<(TaskId, TimerKind)> {
        let mut expired = Vec::new();
        loop {
            self.prune_head();
            match self.heap.peek() {
                Some(top) if top.deadline <= now => {
                    let entry = self.heap.pop().expect("peeked");
                    if let Some(liveness) = self.tokens.remove(entry.token) {
                        expired.push((liveness.task, liveness.kind));
                    }
                }
                _ => break,
            }
        }
        expired
    }

    pub fn is_empty(&mut self) -> bool {
        self.next_deadline().is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u64) -> TaskId {
        TaskId::from_raw(n)
    }

    #[test]
    fn pops_in_deadline_order() {
        let mut heap = TimerHeap::new();
        heap.push(id(1), 3.0, TimerKind::Sleep);
        heap.push(id(2), 1.0, TimerKind::Sleep);
        heap.push(id(3), 2.0, TimerKind::Sleep);
        let expired = heap.pop_expired(10.0);
        let order: Vec<TaskId> = expired.into_iter().map(|(t, _)| t).collect();
        assert_eq!(order, vec![id(2), id(3), id(1)]);
    }

    #[test]
    fn ties_break_by_insertion_order() {
        let mut heap = TimerHeap::new();
        heap.push(id(1), 1.0, TimerKind::Sleep);
        heap.push(id(2), 1.0, TimerKind::Sleep);
        let expired = heap.pop_expired(1.0);
        let order: Vec<TaskId> = expired.into_iter().map(|(t, _)| t).collect();
        assert_eq!(order, vec![id(1), id(2)]);
    }

    #[test]
    fn cancelled_token_is_skipped() {
        let mut heap = TimerHeap::new();
        let token = heap.push(id(1), 1.0, TimerKind::Sleep);
        heap.push(id(2), 2.0, TimerKind::Sleep);
        heap.cancel(token);
        let expired = heap.pop_expired(5.0);
        assert_eq!(expired, vec![(id(2), TimerKind::Sleep)]);
    }

    #[test]
    fn not_yet_due_entries_stay_pending() {
        let mut heap = TimerHeap::new();
        heap.push(id(1), 5.0, TimerKind::Sleep);
        assert!(heap.pop_expired(1.0).is_empty());
        assert_eq!(heap.next_deadline(), Some(5.0));
    }

    proptest::proptest! {
        /// P3 (timer monotonicity): popping everything with an infinite
        /// horizon always comes back sorted by deadline, with ties broken by
        /// insertion order, matching a stable sort over the same pushes.
        #[test]
        fn p3_pop_expired_is_sorted_by_deadline_then_insertion(
            deadlines in proptest::collection::vec(0.0f64..1000.0, 1..60),
        ) {
            let mut heap = TimerHeap::new();
            for (i, &d) in deadlines.iter().enumerate() {
                heap.push(id(i as u64), d, TimerKind::Sleep);
            }
            let expired = heap.pop_expired(f64::INFINITY);
            let got: Vec<u64> = expired.into_iter().map(|(t, _)| t.as_u64()).collect();

            let mut expected: Vec<usize> = (0..deadlines.len()).collect();
            expected.sort_by(|&a, &b| {
                deadlines[a]
                    .partial_cmp(&deadlines[b])
                    .unwrap()
                    .then(a.cmp(&b))
            });
            let expected: Vec<u64> = expected.into_iter().map(|i| i as u64).collect();

            proptest::prop_assert_eq!(got, expected);
        }

        /// P3 corollary: a cancelled token never appears among the expired
        /// entries, regardless of how many other deadlines share its heap
        /// neighborhood.
        #[test]
        fn p3_cancelled_tokens_never_expire(
            deadlines in proptest::collection::vec(0.0f64..1000.0, 1..60),
            cancel_every_nth in 2usize..5,
        ) {
            let mut heap = TimerHeap::new();
            let mut cancelled_ids = std::collections::HashSet::new();
            for (i, &d) in deadlines.iter().enumerate() {
                let token = heap.push(id(i as u64), d, TimerKind::Sleep);
                if i % cancel_every_nth == 0 {
                    heap.cancel(token);
                    cancelled_ids.insert(i as u64);
                }
            }
            let expired = heap.pop_expired(f64::INFINITY);
            let expired_count = expired.len();
            for (t, _) in expired {
                proptest::prop_assert!(!cancelled_ids.contains(&t.as_u64()));
            }
            proptest::prop_assert_eq!(expired_count, deadlines.len() - cancelled_ids.len());
        }
    }
}
