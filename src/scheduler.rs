// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! The per-CPU scheduling engine.
//!
//! Each CPU owns a [`CpuState`]: the task currently on-cpu, a preemption
//! flag armed by tick handlers, and the vruntime-ordered run queue, all
//! behind one mutex. Kernel lifecycle messages are decoded and routed to
//! per-message handlers which mutate that state; the commit path then
//! picks the leftmost task and transacts it on-cpu against the agent and
//! target barriers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use log::debug;

use crate::agent::agent_gtid;
use crate::alloc::TaskAllocator;
use crate::enclave::{
    AssociateError, BarrierToken, Channel, Enclave, Message, Payload, RunRequestSpec, StatusWord,
    ALLOW_TASK_ONCPU, COMMIT_AT_TXN_COMMIT, RTLA_ON_IDLE,
};
use crate::runqueue::CfsRq;
use crate::stats::Metrics;
use crate::task::{Gtid, RunState, Task};

/// Mutex-guarded per-CPU scheduling state. `current` is only written by
/// the CPU's own agent, but its task's state transitions can race with
/// handlers running on other CPUs, so it lives under the same lock as the
/// queue.
pub struct CpuRq {
    pub rq: CfsRq,
    pub current: Option<Arc<Task>>,
    pub preempt_curr: bool,
}

pub struct CpuState {
    pub cpu: usize,
    pub channel: Arc<dyn Channel>,
    rq: Mutex<CpuRq>,
    last_msg: Mutex<Option<Message>>,
}

#[derive(Default)]
struct Counters {
    nr_task_new: AtomicU64,
    nr_migrations: AtomicU64,
    nr_switches: AtomicU64,
    nr_commits: AtomicU64,
    nr_commit_failures: AtomicU64,
    nr_preemptions: AtomicU64,
    nr_local_yields: AtomicU64,
    nr_ticks: AtomicU64,
    nr_task_dead: AtomicU64,
}

fn count(c: &AtomicU64) {
    c.fetch_add(1, Ordering::Relaxed);
}

pub struct Scheduler {
    enclave: Arc<dyn Enclave>,
    cpulist: Vec<usize>,
    cpu_states: HashMap<usize, CpuState>,
    allocator: TaskAllocator,
    rr_cursor: AtomicUsize,
    counters: Counters,
}

impl Scheduler {
    pub fn new(
        enclave: Arc<dyn Enclave>,
        cpulist: Vec<usize>,
        min_granularity_ns: u64,
        latency_ns: u64,
    ) -> Self {
        let cpu_states = cpulist
            .iter()
            .map(|&cpu| {
                (
                    cpu,
                    CpuState {
                        cpu,
                        channel: enclave.channel(cpu),
                        rq: Mutex::new(CpuRq {
                            rq: CfsRq::new(min_granularity_ns, latency_ns),
                            current: None,
                            preempt_curr: false,
                        }),
                        last_msg: Mutex::new(None),
                    },
                )
            })
            .collect();

        Self {
            enclave,
            cpulist,
            cpu_states,
            allocator: TaskAllocator::new(),
            rr_cursor: AtomicUsize::new(0),
            counters: Counters::default(),
        }
    }

    pub fn cpus(&self) -> &[usize] {
        &self.cpulist
    }

    fn cpu_state(&self, cpu: usize) -> &CpuState {
        self.cpu_states
            .get(&cpu)
            .unwrap_or_else(|| panic!("cpu {} is not part of the enclave", cpu))
    }

    fn cpu_state_of(&self, task: &Task) -> &CpuState {
        self.cpu_state(task.cpu() as usize)
    }

    /// Associate every agent with its CPU's channel. Only a stale barrier
    /// may be retried.
    pub fn enclave_ready(&self) {
        for (&cpu, cs) in &self.cpu_states {
            let agent_sw = self.enclave.agent_status_word(cpu);
            while let Err(e) = cs.channel.associate_task(agent_gtid(cpu), agent_sw.barrier()) {
                match e {
                    AssociateError::Stale => continue,
                    AssociateError::Fatal(msg) => {
                        panic!("cpu {}: agent association failed: {}", cpu, msg)
                    }
                }
            }
        }
    }

    /// Pick the CPU whose run queue a never-placed task should join.
    /// Plain round-robin; the cursor is atomic so any agent may place.
    fn select_task_rq(&self) -> usize {
        let next = self.rr_cursor.fetch_add(1, Ordering::Relaxed);
        self.cpulist[next % self.cpulist.len()]
    }

    fn migrate(&self, task: &Arc<Task>, cpu: usize, seqnum: BarrierToken) {
        assert_eq!(task.cpu(), -1);

        let cs = self.cpu_state(cpu);
        // The wakeup is the last message for the task until it goes
        // on-cpu, so a stale barrier here resolves itself.
        while let Err(e) = cs.channel.associate_task(task.gtid, seqnum) {
            match e {
                AssociateError::Stale => continue,
                AssociateError::Fatal(msg) => {
                    panic!("[{}] channel association failed: {}", task.gtid, msg)
                }
            }
        }

        debug!("[{}] migrating to cpu {}", task.gtid, cpu);
        task.set_cpu(cpu as i32);

        {
            let mut s = cs.rq.lock().unwrap();
            s.rq.enqueue_task(task);
        }
        count(&self.counters.nr_migrations);

        // Get the agent's attention so it notices the new task.
        self.enclave.ping_cpu(cpu);
    }

    /// Decode one kernel message and route it to its handler. The
    /// message's barrier token is recorded on the task before handling.
    pub fn dispatch_message(&self, msg: &Message) {
        if let Payload::CpuTick { cpu } = msg.payload {
            count(&self.counters.nr_ticks);
            self.check_preempt_tick(cpu);
            return;
        }

        let gtid = msg.payload.gtid().unwrap();
        let task = match msg.payload {
            Payload::TaskNew { .. } => self
                .allocator
                .create_task(gtid, self.enclave.task_status_word(gtid)),
            _ => self
                .allocator
                .get_task(gtid)
                .unwrap_or_else(|| panic!("[{}] message for unknown task", gtid)),
        };
        task.set_seqnum(msg.seqnum);

        match msg.payload {
            Payload::TaskNew { runnable, .. } => self.task_new(&task, runnable, msg.seqnum),
            Payload::TaskRunnable { .. } => self.task_runnable(&task, msg.seqnum),
            Payload::TaskBlocked {
                cpu, from_switchto, ..
            } => self.task_blocked(&task, cpu, from_switchto),
            Payload::TaskYield {
                cpu, from_switchto, ..
            } => self.task_yield(&task, cpu, from_switchto),
            Payload::TaskPreempted {
                cpu, from_switchto, ..
            } => self.task_preempted(&task, cpu, from_switchto),
            Payload::TaskSwitchto { .. } => self.task_switchto(&task),
            Payload::TaskDeparted {
                cpu, from_switchto, ..
            } => self.task_departed(&task, cpu, from_switchto),
            Payload::TaskDead { .. } => self.task_dead(&task),
            Payload::CpuTick { .. } => unreachable!(),
        }
    }

    fn task_new(&self, task: &Arc<Task>, runnable: bool, seqnum: BarrierToken) {
        count(&self.counters.nr_task_new);

        // The task was created Blocked and has no rq yet, so no lock is
        // needed before placement.
        if runnable {
            let cpu = self.select_task_rq();
            self.migrate(task, cpu, seqnum);
        } else {
            // Keep it off any rq until it becomes runnable, to avoid
            // racing the migration against the wakeup showing up on the
            // default channel.
        }
    }

    fn task_runnable(&self, task: &Arc<Task>, seqnum: BarrierToken) {
        if task.cpu() < 0 {
            // There cannot be more messages pending for this task after a
            // wakeup (until it goes on-cpu), so it is safe to migrate.
            let cpu = self.select_task_rq();
            self.migrate(task, cpu, seqnum);
            return;
        }

        let cs = self.cpu_state_of(task);
        let mut s = cs.rq.lock().unwrap();
        if s.current.as_ref().is_some_and(|c| c.gtid == task.gtid) {
            // A wakeup raced with our dispatch; the task never left the
            // CPU.
            task.run_state.set(task.gtid, RunState::Runnable);
        } else {
            s.rq.enqueue_task(task);
        }
    }

    fn task_blocked(&self, task: &Arc<Task>, cpu: usize, from_switchto: bool) {
        let cs = self.cpu_state(cpu);
        {
            let s = cs.rq.lock().unwrap();
            assert!(
                s.current.as_ref().is_some_and(|c| c.gtid == task.gtid),
                "[{}] blocked while not current on cpu {}",
                task.gtid,
                cpu
            );
            task.run_state.set(task.gtid, RunState::Blocked);
        }

        if from_switchto {
            self.enclave.ping_cpu(cpu);
        }
    }

    fn task_yield(&self, task: &Arc<Task>, cpu: usize, from_switchto: bool) {
        let cs = self.cpu_state(cpu);
        {
            let s = cs.rq.lock().unwrap();
            assert!(
                s.current.as_ref().is_some_and(|c| c.gtid == task.gtid),
                "[{}] yield while not current on cpu {}",
                task.gtid,
                cpu
            );
            // Going Runnable off-cpu makes the next pick put it back on
            // the timeline.
            task.run_state.set(task.gtid, RunState::Runnable);
        }

        if from_switchto {
            self.enclave.ping_cpu(cpu);
        }
    }

    fn task_preempted(&self, task: &Arc<Task>, cpu: usize, from_switchto: bool) {
        let cs = self.cpu_state(cpu);
        {
            let s = cs.rq.lock().unwrap();
            assert!(
                s.current.as_ref().is_some_and(|c| c.gtid == task.gtid),
                "[{}] preempted while not current on cpu {}",
                task.gtid,
                cpu
            );
            // The task keeps its state; the preemption by a higher
            // priority class is reflected at commit time.
        }

        if from_switchto {
            self.enclave.ping_cpu(cpu);
        }
    }

    fn task_switchto(&self, task: &Arc<Task>) {
        let cs = self.cpu_state_of(task);
        let _s = cs.rq.lock().unwrap();
        task.run_state.set(task.gtid, RunState::Blocked);
    }

    fn task_departed(&self, task: &Arc<Task>, cpu: usize, from_switchto: bool) {
        self.handle_task_done(task, from_switchto);

        if from_switchto {
            self.enclave.ping_cpu(cpu);
        }
    }

    fn task_dead(&self, task: &Arc<Task>) {
        count(&self.counters.nr_task_dead);
        self.handle_task_done(task, false);
    }

    fn handle_task_done(&self, task: &Arc<Task>, from_switchto: bool) {
        if task.cpu() < 0 {
            // Never placed: not on any rq and cannot be current.
            task.run_state.set(task.gtid, RunState::Done);
            self.allocator.free_task(task);
            return;
        }

        // Pair the state transition with pulling the task off its rq,
        // otherwise a departed racing a wakeup on another CPU could erase
        // the task before the wakeup inserted it.
        let cs = self.cpu_state_of(task);
        let mut s = cs.rq.lock().unwrap();

        let prev_state = task.run_state.get();
        task.run_state.set(task.gtid, RunState::Done);

        if (prev_state == RunState::Running || from_switchto)
            || prev_state == RunState::Runnable
            || prev_state == RunState::Blocked
        {
            let is_current = s.current.as_ref().is_some_and(|c| c.gtid == task.gtid);
            if !is_current {
                let CpuRq { rq, current, .. } = &mut *s;
                rq.erase(task.gtid);
                self.allocator.free_task(task);
                rq.update_min_vruntime(current.as_ref());
            }
            // If it is current, the next pick observes Done and frees it.
        }
    }

    /// Arm the preemption flag if the current task has been on-cpu for
    /// longer than the granularity allows. Honored at the next pick.
    fn check_preempt_tick(&self, cpu: usize) {
        let cs = self.cpu_state(cpu);
        let mut s = cs.rq.lock().unwrap();
        let CpuRq {
            rq,
            current,
            preempt_curr,
        } = &mut *s;

        if let Some(curr) = current {
            let ran = curr
                .status_word
                .runtime_ns()
                .saturating_sub(curr.runtime_at_first_pick_ns());
            if ran > rq.min_preemption_granularity() && !*preempt_curr {
                *preempt_curr = true;
                count(&self.counters.nr_preemptions);
            }
        }
    }

    fn cfs_schedule(&self, cpu: usize, agent_barrier: BarrierToken, prio_boost: bool) {
        let req = self.enclave.run_request(cpu);
        let cs = self.cpu_state(cpu);

        if prio_boost {
            // Kernel CFS ran on this CPU and whatever we wanted on-cpu is
            // not running anymore. Reconcile and park until the CPU goes
            // idle; we re-enter the scheduling loop with no new messages
            // needed.
            {
                let mut s = cs.rq.lock().unwrap();
                if let Some(prev) = s.current.take() {
                    let CpuRq {
                        rq, preempt_curr, ..
                    } = &mut *s;
                    rq.reconcile_prev(&prev, &self.allocator);
                    *preempt_curr = false;
                    rq.update_min_vruntime(None);
                }
            }
            count(&self.counters.nr_local_yields);
            req.local_yield(agent_barrier, RTLA_ON_IDLE);
            return;
        }

        let (prev_gtid, next) = {
            let mut s = cs.rq.lock().unwrap();
            let CpuRq {
                rq,
                current,
                preempt_curr,
            } = &mut *s;
            let prev_gtid = current.as_ref().map(|t| t.gtid);
            let next = rq.pick_next_task(current.as_ref(), &self.allocator, preempt_curr);
            *current = next.clone();
            (prev_gtid, next)
        };

        if let Some(next) = next {
            debug!("[{}] picked on cpu {}", next.gtid, cpu);

            req.open(RunRequestSpec {
                target: next.gtid,
                target_barrier: next.seqnum(),
                agent_barrier,
                commit_flags: COMMIT_AT_TXN_COMMIT | ALLOW_TASK_ONCPU,
            });

            let before_runtime = next.status_word.runtime_ns();
            if req.commit() {
                count(&self.counters.nr_commits);
                if prev_gtid != Some(next.gtid) {
                    count(&self.counters.nr_switches);
                }
                next.add_vruntime_ns(
                    next.status_word.runtime_ns().saturating_sub(before_runtime),
                );
            } else {
                count(&self.counters.nr_commit_failures);
                debug!("cpu {}: commit failed (state = {:?})", cpu, req.state());
                // The agent was stale. Draining the remaining messages
                // brings the view up to date; cs.current can stay as
                // picked because only its last state matters.
            }
        } else {
            count(&self.counters.nr_local_yields);
            req.local_yield(agent_barrier, 0);
        }
    }

    /// One agent wake: drain every ready message on this CPU's channel,
    /// then make a scheduling decision.
    pub fn schedule(&self, cpu: usize, agent_sw: &dyn StatusWord) {
        let agent_barrier = agent_sw.barrier();
        let cs = self.cpu_state(cpu);

        while let Some(msg) = cs.channel.peek() {
            self.dispatch_message(&msg);
            cs.channel.consume(&msg);
            *cs.last_msg.lock().unwrap() = Some(msg);
        }

        self.cfs_schedule(cpu, agent_barrier, agent_sw.boosted_priority());
    }

    pub fn is_empty(&self, cpu: usize) -> bool {
        let s = self.cpu_state(cpu).rq.lock().unwrap();
        s.rq.is_empty() && s.current.is_none()
    }

    /// Every run queue must have drained before teardown.
    pub fn validate_pre_exit_state(&self) {
        for (&cpu, cs) in &self.cpu_states {
            let s = cs.rq.lock().unwrap();
            assert!(
                s.rq.is_empty(),
                "cpu {}: {} task(s) left on the rq at exit",
                cpu,
                s.rq.len()
            );
        }
    }

    // Introspection, used by tests and the stats server.

    pub fn current_gtid(&self, cpu: usize) -> Option<Gtid> {
        self.cpu_state(cpu)
            .rq
            .lock()
            .unwrap()
            .current
            .as_ref()
            .map(|t| t.gtid)
    }

    pub fn rq_len(&self, cpu: usize) -> usize {
        self.cpu_state(cpu).rq.lock().unwrap().rq.len()
    }

    pub fn rq_contains(&self, cpu: usize, gtid: Gtid) -> bool {
        self.cpu_state(cpu).rq.lock().unwrap().rq.contains(gtid)
    }

    pub fn min_vruntime_ns(&self, cpu: usize) -> u64 {
        self.cpu_state(cpu).rq.lock().unwrap().rq.min_vruntime_ns()
    }

    pub fn preempt_curr(&self, cpu: usize) -> bool {
        self.cpu_state(cpu).rq.lock().unwrap().preempt_curr
    }

    pub fn task_vruntime_ns(&self, gtid: Gtid) -> Option<u64> {
        self.allocator.get_task(gtid).map(|t| t.vruntime_ns())
    }

    pub fn task_run_state(&self, gtid: Gtid) -> Option<RunState> {
        self.allocator.get_task(gtid).map(|t| t.run_state.get())
    }

    pub fn nr_tasks(&self) -> usize {
        self.allocator.len()
    }

    /// Debug-format the last message consumed on `cpu`, for the exit
    /// diagnostic.
    pub fn last_msg_str(&self, cpu: usize) -> String {
        match &*self.cpu_state(cpu).last_msg.lock().unwrap() {
            Some(msg) => format!("{:?}", msg),
            None => "none".to_string(),
        }
    }

    pub fn metrics(&self) -> Metrics {
        let c = &self.counters;
        Metrics {
            nr_cpus: self.cpulist.len() as u64,
            nr_tasks: self.allocator.len() as u64,
            nr_task_new: c.nr_task_new.load(Ordering::Relaxed),
            nr_migrations: c.nr_migrations.load(Ordering::Relaxed),
            nr_switches: c.nr_switches.load(Ordering::Relaxed),
            nr_commits: c.nr_commits.load(Ordering::Relaxed),
            nr_commit_failures: c.nr_commit_failures.load(Ordering::Relaxed),
            nr_preemptions: c.nr_preemptions.load(Ordering::Relaxed),
            nr_local_yields: c.nr_local_yields.load(Ordering::Relaxed),
            nr_ticks: c.nr_ticks.load(Ordering::Relaxed),
            nr_task_dead: c.nr_task_dead.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimEnclave;

    fn setup(nr_cpus: usize) -> (SimEnclave, Scheduler) {
        let sim = SimEnclave::new(nr_cpus);
        let scheduler = Scheduler::new(
            Arc::new(sim.clone()),
            (0..nr_cpus).collect(),
            1_000_000,
            6_000_000,
        );
        (sim, scheduler)
    }

    #[test]
    fn new_runnable_tasks_round_robin_across_cpus() {
        let (sim, scheduler) = setup(2);

        for id in 1..=4 {
            let seq = sim.push(
                0,
                Payload::TaskNew {
                    gtid: Gtid(id),
                    runnable: true,
                },
            );
            assert_eq!(seq, 1);
        }
        scheduler.schedule(0, &*sim.agent_status_word(0));

        assert_eq!(scheduler.rq_len(0) + scheduler.rq_len(1), 3);
        assert!(scheduler.rq_contains(1, Gtid(2)) || scheduler.rq_contains(1, Gtid(4)));
        // Migration pings woke the other CPU's agent.
        assert!(sim.nr_pings(1) > 0);
    }

    #[test]
    fn non_runnable_new_task_stays_unplaced() {
        let (sim, scheduler) = setup(1);

        sim.push(
            0,
            Payload::TaskNew {
                gtid: Gtid(1),
                runnable: false,
            },
        );
        scheduler.schedule(0, &*sim.agent_status_word(0));

        assert_eq!(scheduler.nr_tasks(), 1);
        assert_eq!(scheduler.rq_len(0), 0);
        assert_eq!(scheduler.task_run_state(Gtid(1)), Some(RunState::Blocked));
        assert!(sim.associated_cpu(Gtid(1)).is_none());

        // The wakeup places it.
        sim.push(0, Payload::TaskRunnable { gtid: Gtid(1) });
        scheduler.schedule(0, &*sim.agent_status_word(0));
        assert_eq!(scheduler.current_gtid(0), Some(Gtid(1)));
        assert_eq!(sim.associated_cpu(Gtid(1)), Some(0));
    }

    #[test]
    #[should_panic(expected = "message for unknown task")]
    fn message_for_unknown_task_aborts() {
        let (sim, scheduler) = setup(1);
        sim.push(0, Payload::TaskDead { gtid: Gtid(99) });
        scheduler.schedule(0, &*sim.agent_status_word(0));
    }

    #[test]
    fn dead_before_placement_frees_once() {
        let (sim, scheduler) = setup(1);

        sim.push(
            0,
            Payload::TaskNew {
                gtid: Gtid(1),
                runnable: false,
            },
        );
        sim.push(0, Payload::TaskDead { gtid: Gtid(1) });
        scheduler.schedule(0, &*sim.agent_status_word(0));

        assert_eq!(scheduler.nr_tasks(), 0);
        assert!(scheduler.is_empty(0));
    }
}
