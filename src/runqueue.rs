// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Per-CPU run queue ordered by virtual runtime.
//!
//! The queue holds runnable tasks that are not on-cpu, keyed by
//! `(vruntime, gtid)` so two tasks with equal vruntime order
//! deterministically. A task's vruntime never changes while it is queued,
//! which keeps the stored key valid for erase.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use log::debug;

use crate::alloc::TaskAllocator;
use crate::task::{Gtid, RunState, Task};

pub struct CfsRq {
    tree: BTreeSet<(u64, Gtid)>,
    tasks: HashMap<Gtid, Arc<Task>>,
    min_vruntime_ns: u64,
    min_granularity_ns: u64,
    latency_ns: u64,
}

impl CfsRq {
    pub fn new(min_granularity_ns: u64, latency_ns: u64) -> Self {
        Self {
            tree: BTreeSet::new(),
            tasks: HashMap::new(),
            min_vruntime_ns: 0,
            min_granularity_ns,
            latency_ns,
        }
    }

    /// Insert a newly runnable task.
    ///
    /// The vruntime is clamped up to `min_vruntime` so a freshly migrated
    /// or newly awoken task cannot carry a stale small vruntime and starve
    /// everyone else while it catches up.
    pub fn enqueue_task(&mut self, task: &Arc<Task>) {
        assert!(task.cpu() >= 0);

        task.set_vruntime_ns(self.min_vruntime_ns.max(task.vruntime_ns()));
        task.run_state.set(task.gtid, RunState::Runnable);
        self.insert(task);
    }

    /// Insert a previously on-cpu task back into the queue. The run state
    /// is left alone.
    pub fn put_prev_task(&mut self, task: &Arc<Task>) {
        assert!(task.cpu() >= 0);

        self.insert(task);
    }

    /// Reconcile the previously running task against whatever its message
    /// handlers did to it while it was on-cpu.
    pub fn reconcile_prev(&mut self, prev: &Arc<Task>, allocator: &TaskAllocator) {
        match prev.run_state.get() {
            RunState::Blocked => {}
            RunState::Done => {
                self.erase(prev.gtid);
                allocator.free_task(prev);
            }
            RunState::Runnable => {
                // A yield: the task went Running -> Runnable off-cpu and
                // needs to be put back on the timeline.
                self.put_prev_task(prev);
            }
            RunState::Running => {
                // Preemption: put it back and demote it.
                self.put_prev_task(prev);
                prev.run_state.set(prev.gtid, RunState::Runnable);
            }
        }
    }

    /// Pick the task to run next.
    ///
    /// If `prev` is still Running and no preemption is pending it keeps the
    /// CPU. Otherwise `prev` is reconciled and the leftmost (smallest
    /// vruntime) task is taken off the timeline, marked Running, and gets a
    /// fresh first-pick runtime snapshot.
    pub fn pick_next_task(
        &mut self,
        prev: Option<&Arc<Task>>,
        allocator: &TaskAllocator,
        preempt_curr: &mut bool,
    ) -> Option<Arc<Task>> {
        if let Some(prev) = prev {
            if prev.run_state.get() == RunState::Running && !*preempt_curr {
                return Some(prev.clone());
            }
        }

        // Past here a new pick happens, so the preemption flag is consumed.
        *preempt_curr = false;

        if let Some(prev) = prev {
            self.reconcile_prev(prev, allocator);
        }

        if self.tree.is_empty() {
            self.update_min_vruntime(prev);
            return None;
        }

        let &(_, gtid) = self.tree.iter().next().unwrap();
        let task = self.tasks.get(&gtid).unwrap().clone();

        task.run_state.set(task.gtid, RunState::Running);
        task.set_runtime_at_first_pick_ns(task.status_word.runtime_ns());
        self.erase(task.gtid);
        self.update_min_vruntime(prev);

        Some(task)
    }

    /// Remove a task if present. Absence is tolerated: departed/dead
    /// messages race with enqueue.
    pub fn erase(&mut self, gtid: Gtid) {
        if let Some(task) = self.tasks.remove(&gtid) {
            self.tree.remove(&(task.vruntime_ns(), gtid));
        } else {
            debug!("[{}] erase: not in rq", gtid);
        }
    }

    /// Raise `min_vruntime` to the smaller of the current task's vruntime
    /// (if it is still in contention) and the leftmost queued vruntime.
    /// Never decreases.
    pub fn update_min_vruntime(&mut self, curr: Option<&Arc<Task>>) {
        let mut vruntime = self.min_vruntime_ns;

        let curr = curr.filter(|t| {
            matches!(t.run_state.get(), RunState::Runnable | RunState::Running)
        });
        if let Some(curr) = curr {
            vruntime = curr.vruntime_ns();
        }

        if let Some(&(leftmost, _)) = self.tree.iter().next() {
            vruntime = match curr {
                Some(_) => vruntime.min(leftmost),
                None => leftmost,
            };
        }

        self.min_vruntime_ns = self.min_vruntime_ns.max(vruntime);
    }

    /// How long the current task may stay on-cpu before a tick flags it
    /// for preemption. With the current task included there are
    /// `size() + 1` tasks sharing this CPU.
    pub fn min_preemption_granularity(&self) -> u64 {
        let tasks = (self.tree.len() + 1) as u64;
        if tasks * self.min_granularity_ns > self.latency_ns {
            // Hitting the latency target would hand out slices below the
            // granularity floor.
            return self.min_granularity_ns;
        }

        // ceil(latency / tasks): plain integer division could round a
        // slice below min_granularity in the edge case.
        self.latency_ns.div_ceil(tasks)
    }

    pub fn contains(&self, gtid: Gtid) -> bool {
        self.tasks.contains_key(&gtid)
    }

    pub fn min_vruntime_ns(&self) -> u64 {
        self.min_vruntime_ns
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    fn insert(&mut self, task: &Arc<Task>) {
        self.tree.insert((task.vruntime_ns(), task.gtid));
        self.tasks.insert(task.gtid, task.clone());
        let &(leftmost, _) = self.tree.iter().next().unwrap();
        self.min_vruntime_ns = self.min_vruntime_ns.max(leftmost);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimStatusWord;

    const MIN_GRANULARITY_NS: u64 = 1_000_000;
    const LATENCY_NS: u64 = 6_000_000;

    fn rq() -> CfsRq {
        CfsRq::new(MIN_GRANULARITY_NS, LATENCY_NS)
    }

    fn placed_task(id: u64, vruntime_ns: u64) -> Arc<Task> {
        let task = Arc::new(Task::new(Gtid(id), Arc::new(SimStatusWord::default())));
        task.set_cpu(0);
        task.set_vruntime_ns(vruntime_ns);
        task
    }

    #[test]
    fn enqueue_clamps_stale_vruntime() {
        let mut rq = rq();
        let old = placed_task(1, 500_000_000);
        rq.enqueue_task(&old);

        let allocator = TaskAllocator::new();
        let mut preempt = false;
        let picked = rq.pick_next_task(None, &allocator, &mut preempt).unwrap();
        assert_eq!(picked.gtid, Gtid(1));
        assert_eq!(rq.min_vruntime_ns(), 500_000_000);

        // A waker with a tiny vruntime cannot undercut the queue.
        let waker = placed_task(2, 1_000_000);
        rq.enqueue_task(&waker);
        assert_eq!(waker.vruntime_ns(), 500_000_000);
        assert!(waker.vruntime_ns() >= rq.min_vruntime_ns());
    }

    #[test]
    fn pick_returns_smallest_vruntime_with_identity_tiebreak() {
        let mut rq = rq();
        let allocator = TaskAllocator::new();

        for (id, vr) in [(3, 2_000), (1, 1_000), (2, 1_000)] {
            rq.enqueue_task(&placed_task(id, vr));
        }

        let mut preempt = false;
        let first = rq.pick_next_task(None, &allocator, &mut preempt).unwrap();
        assert_eq!(first.gtid, Gtid(1));
        assert!(!rq.contains(Gtid(1)));
        assert_eq!(first.run_state.get(), RunState::Running);

        // Reconcile keeps Running prev on-cpu unless preemption is pending.
        let again = rq
            .pick_next_task(Some(&first), &allocator, &mut preempt)
            .unwrap();
        assert_eq!(again.gtid, Gtid(1));

        first.add_vruntime_ns(1_000);
        preempt = true;
        let second = rq
            .pick_next_task(Some(&first), &allocator, &mut preempt)
            .unwrap();
        assert_eq!(second.gtid, Gtid(2));
        assert!(!preempt);
        assert_eq!(first.run_state.get(), RunState::Runnable);
        assert!(rq.contains(Gtid(1)));
    }

    #[test]
    fn min_vruntime_is_monotonic() {
        let mut rq = rq();
        let allocator = TaskAllocator::new();
        let mut observed = vec![rq.min_vruntime_ns()];

        let a = placed_task(1, 0);
        let b = placed_task(2, 0);
        rq.enqueue_task(&a);
        rq.enqueue_task(&b);
        observed.push(rq.min_vruntime_ns());

        let mut preempt = false;
        let first = rq.pick_next_task(None, &allocator, &mut preempt).unwrap();
        observed.push(rq.min_vruntime_ns());

        first.add_vruntime_ns(3_000_000);
        preempt = true;
        let _second = rq
            .pick_next_task(Some(&first), &allocator, &mut preempt)
            .unwrap();
        observed.push(rq.min_vruntime_ns());

        assert!(observed.windows(2).all(|w| w[0] <= w[1]), "{:?}", observed);
    }

    #[test]
    fn granularity_scales_with_queue_size() {
        let mut rq = rq();

        // One on-cpu task, empty queue: full latency.
        assert_eq!(rq.min_preemption_granularity(), LATENCY_NS);

        // One queued + one on-cpu: ceil(6ms / 2) = 3ms.
        rq.enqueue_task(&placed_task(1, 0));
        assert_eq!(rq.min_preemption_granularity(), 3_000_000);

        // Five queued + one on-cpu: 6 * 1ms == latency, ceil(6ms / 6) = 1ms.
        for id in 2..=5 {
            rq.enqueue_task(&placed_task(id, 0));
        }
        assert_eq!(rq.min_preemption_granularity(), 1_000_000);

        // Nine queued + one on-cpu: latency target unreachable, floor wins.
        for id in 6..=9 {
            rq.enqueue_task(&placed_task(id, 0));
        }
        assert_eq!(rq.min_preemption_granularity(), MIN_GRANULARITY_NS);
    }

    #[test]
    fn granularity_rounds_up() {
        let rq = CfsRq::new(1_000_000, 7_000_000);
        // n = 1: 7ms whole.
        assert_eq!(rq.min_preemption_granularity(), 7_000_000);

        let mut rq = CfsRq::new(1_000_000, 7_000_000);
        rq.enqueue_task(&placed_task(1, 0));
        // ceil(7ms / 2) = 3.5ms, not 3.499999ms.
        assert_eq!(rq.min_preemption_granularity(), 3_500_000);
    }

    #[test]
    fn erase_tolerates_absent_task() {
        let mut rq = rq();
        rq.erase(Gtid(42));
        assert!(rq.is_empty());
    }

    #[test]
    fn done_prev_is_freed_on_pick() {
        let mut rq = rq();
        let allocator = TaskAllocator::new();
        let task = allocator.create_task(Gtid(1), Arc::new(SimStatusWord::default()));
        task.set_cpu(0);
        rq.enqueue_task(&task);

        let mut preempt = false;
        let picked = rq.pick_next_task(None, &allocator, &mut preempt).unwrap();
        picked.run_state.set(picked.gtid, RunState::Done);

        let next = rq.pick_next_task(Some(&picked), &allocator, &mut preempt);
        assert!(next.is_none());
        assert!(allocator.is_empty());
    }
}
