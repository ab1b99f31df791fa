// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! In-process implementation of the enclave contract.
//!
//! Stands in for the kernel scheduling-class facility so the engine can be
//! driven end-to-end on any machine: per-CPU channels with barrier
//! bookkeeping, transactional commits validated against the agent and
//! target barriers, ping wakeups, and an optional scripted workload for
//! the demo binary. Tests drive it step by step with `push`,
//! `advance_task_runtime` and `set_commit_runtime`.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use log::debug;

use crate::enclave::{
    AssociateError, BarrierToken, Channel, Enclave, Message, Payload, RunRequest, RunRequestSpec,
    RunRequestState, StatusWord, RTLA_ON_IDLE,
};
use crate::task::Gtid;

/// Status word backed by plain atomics.
#[derive(Default)]
pub struct SimStatusWord {
    runtime_ns: AtomicU64,
    barrier: AtomicU64,
    boosted: AtomicBool,
}

impl SimStatusWord {
    pub fn add_runtime_ns(&self, ns: u64) {
        self.runtime_ns.fetch_add(ns, Ordering::Relaxed);
    }

    fn set_barrier(&self, barrier: BarrierToken) {
        self.barrier.store(barrier, Ordering::Relaxed);
    }

    fn set_boosted(&self, boosted: bool) {
        self.boosted.store(boosted, Ordering::Relaxed);
    }
}

impl StatusWord for SimStatusWord {
    fn runtime_ns(&self) -> u64 {
        self.runtime_ns.load(Ordering::Relaxed)
    }

    fn barrier(&self) -> BarrierToken {
        self.barrier.load(Ordering::Relaxed)
    }

    fn boosted_priority(&self) -> bool {
        self.boosted.load(Ordering::Relaxed)
    }
}

/// Scripted behavior for a demo-workload task: cpu-bound for
/// `total_runtime_ns`, accruing `slice_ns` per commit, optionally yielding
/// every `yield_period` slices.
#[derive(Debug, Clone)]
pub struct TaskProfile {
    pub total_runtime_ns: u64,
    pub slice_ns: u64,
    pub yield_period: Option<u32>,
}

struct SimTask {
    sw: Arc<SimStatusWord>,
    /// Seqnum of the newest message emitted for this task.
    latest_seqnum: BarrierToken,
    /// Channel the task is currently associated with.
    assoc_cpu: Option<usize>,
    profile: Option<TaskProfile>,
    slices_run: u32,
}

struct SimCpu {
    queue: Mutex<VecDeque<Message>>,
    cond: Condvar,
    pinged: AtomicBool,
    nr_pings: AtomicUsize,
    /// Bumped on every message delivered to this CPU.
    agent_barrier: AtomicU64,
    agent_sw: Arc<SimStatusWord>,
    /// Runtime credited to the target of the next commit (manual mode).
    commit_runtime_ns: Mutex<Option<u64>>,
    force_stale: AtomicBool,
    oncpu: Mutex<Option<Gtid>>,
    last_yield: Mutex<Option<u32>>,
}

impl SimCpu {
    fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
            pinged: AtomicBool::new(false),
            nr_pings: AtomicUsize::new(0),
            agent_barrier: AtomicU64::new(0),
            agent_sw: Arc::new(SimStatusWord::default()),
            commit_runtime_ns: Mutex::new(None),
            force_stale: AtomicBool::new(false),
            oncpu: Mutex::new(None),
            last_yield: Mutex::new(None),
        }
    }
}

struct SimInner {
    cpus: Vec<SimCpu>,
    tasks: Mutex<HashMap<Gtid, SimTask>>,
    finished: AtomicBool,
    /// Whether commit/local_yield park the caller until new work arrives.
    blocking: bool,
    alive_tasks: AtomicUsize,
}

impl SimInner {
    fn next_seqnum(&self, payload: &Payload) -> BarrierToken {
        match payload.gtid() {
            Some(gtid) => {
                let mut tasks = self.tasks.lock().unwrap();
                let st = tasks.entry(gtid).or_insert_with(|| SimTask {
                    sw: Arc::new(SimStatusWord::default()),
                    latest_seqnum: 0,
                    assoc_cpu: None,
                    profile: None,
                    slices_run: 0,
                });
                st.latest_seqnum += 1;
                st.latest_seqnum
            }
            // Tick messages carry the agent barrier they will bump to.
            None => 0,
        }
    }

    fn push(&self, cpu: usize, payload: Payload) -> BarrierToken {
        let seqnum = self.next_seqnum(&payload);
        let c = &self.cpus[cpu];

        let mut queue = c.queue.lock().unwrap();
        let barrier = c.agent_barrier.fetch_add(1, Ordering::Relaxed) + 1;
        c.agent_sw.set_barrier(barrier);
        let seqnum = if seqnum != 0 { seqnum } else { barrier };
        queue.push_back(Message { seqnum, payload });
        c.cond.notify_all();

        seqnum
    }

    /// Block until a message, a ping, or shutdown. No-op outside blocking
    /// mode.
    fn park(&self, cpu: usize) {
        if !self.blocking {
            return;
        }

        let c = &self.cpus[cpu];
        let mut queue = c.queue.lock().unwrap();
        loop {
            if !queue.is_empty()
                || self.finished.load(Ordering::Relaxed)
                || c.pinged.swap(false, Ordering::Relaxed)
            {
                return;
            }
            queue = c.cond.wait(queue).unwrap();
        }
    }

    /// Advance the scripted workload of a freshly committed task and emit
    /// the follow-up message its behavior calls for.
    fn profile_step(&self, cpu: usize, gtid: Gtid) {
        let (sw, step_ns, followup) = {
            let mut tasks = self.tasks.lock().unwrap();
            let st = match tasks.get_mut(&gtid) {
                Some(st) => st,
                None => return,
            };
            let profile = match &st.profile {
                Some(p) => p.clone(),
                None => return,
            };

            let remaining = profile.total_runtime_ns.saturating_sub(st.sw.runtime_ns());
            let step_ns = profile.slice_ns.min(remaining);
            st.slices_run += 1;

            let done = st.sw.runtime_ns() + step_ns >= profile.total_runtime_ns;
            let followup = if done {
                Payload::TaskDead { gtid }
            } else if profile
                .yield_period
                .is_some_and(|p| st.slices_run % p == 0)
            {
                Payload::TaskYield {
                    gtid,
                    cpu,
                    from_switchto: false,
                }
            } else {
                Payload::CpuTick { cpu }
            };

            (st.sw.clone(), step_ns, followup)
        };

        sw.add_runtime_ns(step_ns);
        if matches!(followup, Payload::TaskDead { .. }) {
            self.alive_tasks.fetch_sub(1, Ordering::Relaxed);
        }
        self.push(cpu, followup);
    }
}

/// Handle to the simulated enclave. Cheap to clone.
#[derive(Clone)]
pub struct SimEnclave {
    inner: Arc<SimInner>,
}

impl SimEnclave {
    /// Manual-stepping enclave: commits never block, runtime only moves
    /// when the caller advances it.
    pub fn new(nr_cpus: usize) -> Self {
        Self::build(nr_cpus, false)
    }

    /// Blocking enclave for threaded runs: commit and local-yield park the
    /// agent until new work arrives, and committed tasks advance their
    /// scripted workload.
    pub fn new_blocking(nr_cpus: usize) -> Self {
        Self::build(nr_cpus, true)
    }

    fn build(nr_cpus: usize, blocking: bool) -> Self {
        Self {
            inner: Arc::new(SimInner {
                cpus: (0..nr_cpus).map(|_| SimCpu::new()).collect(),
                tasks: Mutex::new(HashMap::new()),
                finished: AtomicBool::new(false),
                blocking,
                alive_tasks: AtomicUsize::new(0),
            }),
        }
    }

    pub fn nr_cpus(&self) -> usize {
        self.inner.cpus.len()
    }

    /// Deliver a message to a CPU's channel. Returns the barrier seqnum
    /// assigned to it.
    pub fn push(&self, cpu: usize, payload: Payload) -> BarrierToken {
        self.inner.push(cpu, payload)
    }

    /// Register a scripted task and announce it on the default channel
    /// (CPU 0).
    pub fn spawn_task(&self, gtid: Gtid, profile: TaskProfile) {
        {
            let mut tasks = self.inner.tasks.lock().unwrap();
            let prev = tasks.insert(
                gtid,
                SimTask {
                    sw: Arc::new(SimStatusWord::default()),
                    latest_seqnum: 0,
                    assoc_cpu: None,
                    profile: Some(profile),
                    slices_run: 0,
                },
            );
            assert!(prev.is_none(), "[{}] spawned twice", gtid);
        }
        self.inner.alive_tasks.fetch_add(1, Ordering::Relaxed);
        self.inner.push(
            0,
            Payload::TaskNew {
                gtid,
                runnable: true,
            },
        );
    }

    pub fn tasks_remaining(&self) -> usize {
        self.inner.alive_tasks.load(Ordering::Relaxed)
    }

    pub fn finish(&self) {
        self.inner.finished.store(true, Ordering::Relaxed);
        for cpu in 0..self.nr_cpus() {
            self.ping_cpu(cpu);
        }
    }

    // Test control surface.

    pub fn advance_task_runtime(&self, gtid: Gtid, ns: u64) {
        let sw = self.task_sim_status_word(gtid);
        sw.add_runtime_ns(ns);
    }

    /// Credit `ns` of on-cpu time to the target of the next commit on
    /// `cpu`, consumed once.
    pub fn set_commit_runtime(&self, cpu: usize, ns: u64) {
        *self.inner.cpus[cpu].commit_runtime_ns.lock().unwrap() = Some(ns);
    }

    /// Fail the next commit on `cpu` as if the agent barrier went stale.
    pub fn force_commit_stale(&self, cpu: usize) {
        self.inner.cpus[cpu].force_stale.store(true, Ordering::Relaxed);
    }

    pub fn set_prio_boost(&self, cpu: usize, boosted: bool) {
        self.inner.cpus[cpu].agent_sw.set_boosted(boosted);
    }

    pub fn oncpu(&self, cpu: usize) -> Option<Gtid> {
        *self.inner.cpus[cpu].oncpu.lock().unwrap()
    }

    pub fn last_yield(&self, cpu: usize) -> Option<u32> {
        *self.inner.cpus[cpu].last_yield.lock().unwrap()
    }

    pub fn nr_pings(&self, cpu: usize) -> usize {
        self.inner.cpus[cpu].nr_pings.load(Ordering::Relaxed)
    }

    pub fn associated_cpu(&self, gtid: Gtid) -> Option<usize> {
        self.inner
            .tasks
            .lock()
            .unwrap()
            .get(&gtid)
            .and_then(|st| st.assoc_cpu)
    }

    pub fn latest_seqnum(&self, gtid: Gtid) -> BarrierToken {
        self.inner
            .tasks
            .lock()
            .unwrap()
            .get(&gtid)
            .map(|st| st.latest_seqnum)
            .unwrap_or(0)
    }

    fn task_sim_status_word(&self, gtid: Gtid) -> Arc<SimStatusWord> {
        let mut tasks = self.inner.tasks.lock().unwrap();
        tasks
            .entry(gtid)
            .or_insert_with(|| SimTask {
                sw: Arc::new(SimStatusWord::default()),
                latest_seqnum: 0,
                assoc_cpu: None,
                profile: None,
                slices_run: 0,
            })
            .sw
            .clone()
    }
}

impl Enclave for SimEnclave {
    fn channel(&self, cpu: usize) -> Arc<dyn Channel> {
        Arc::new(SimChannel {
            inner: self.inner.clone(),
            cpu,
        })
    }

    fn run_request(&self, cpu: usize) -> Arc<dyn RunRequest> {
        Arc::new(SimRunRequest {
            inner: self.inner.clone(),
            cpu,
            spec: Mutex::new(None),
            state: Mutex::new(RunRequestState::Idle),
        })
    }

    fn agent_status_word(&self, cpu: usize) -> Arc<dyn StatusWord> {
        self.inner.cpus[cpu].agent_sw.clone()
    }

    fn task_status_word(&self, gtid: Gtid) -> Arc<dyn StatusWord> {
        self.task_sim_status_word(gtid)
    }

    fn ping_cpu(&self, cpu: usize) {
        let c = &self.inner.cpus[cpu];
        let _queue = c.queue.lock().unwrap();
        c.pinged.store(true, Ordering::Relaxed);
        c.nr_pings.fetch_add(1, Ordering::Relaxed);
        c.cond.notify_all();
    }

    fn finished(&self) -> bool {
        self.inner.finished.load(Ordering::Relaxed)
    }
}

struct SimChannel {
    inner: Arc<SimInner>,
    cpu: usize,
}

impl Channel for SimChannel {
    fn associate_task(&self, gtid: Gtid, barrier: BarrierToken) -> Result<(), AssociateError> {
        let mut tasks = self.inner.tasks.lock().unwrap();
        let st = tasks.entry(gtid).or_insert_with(|| SimTask {
            sw: Arc::new(SimStatusWord::default()),
            latest_seqnum: barrier,
            assoc_cpu: None,
            profile: None,
            slices_run: 0,
        });

        if st.latest_seqnum != barrier {
            return Err(AssociateError::Stale);
        }

        st.assoc_cpu = Some(self.cpu);
        Ok(())
    }

    fn peek(&self) -> Option<Message> {
        self.inner.cpus[self.cpu]
            .queue
            .lock()
            .unwrap()
            .front()
            .cloned()
    }

    fn consume(&self, msg: &Message) {
        let popped = self.inner.cpus[self.cpu].queue.lock().unwrap().pop_front();
        assert_eq!(popped.as_ref(), Some(msg), "consume out of order");
    }
}

struct SimRunRequest {
    inner: Arc<SimInner>,
    cpu: usize,
    spec: Mutex<Option<RunRequestSpec>>,
    state: Mutex<RunRequestState>,
}

impl RunRequest for SimRunRequest {
    fn open(&self, spec: RunRequestSpec) {
        *self.spec.lock().unwrap() = Some(spec);
        *self.state.lock().unwrap() = RunRequestState::Open;
    }

    fn commit(&self) -> bool {
        let spec = self
            .spec
            .lock()
            .unwrap()
            .take()
            .expect("commit without open");
        let c = &self.inner.cpus[self.cpu];

        let stale = c.force_stale.swap(false, Ordering::Relaxed)
            || spec.agent_barrier != c.agent_barrier.load(Ordering::Relaxed)
            || {
                let tasks = self.inner.tasks.lock().unwrap();
                tasks
                    .get(&spec.target)
                    .map_or(true, |st| st.latest_seqnum != spec.target_barrier)
            };

        if stale {
            debug!("cpu {}: stale commit for {}", self.cpu, spec.target);
            *self.state.lock().unwrap() = RunRequestState::Failed;
            return false;
        }

        *c.oncpu.lock().unwrap() = Some(spec.target);
        *self.state.lock().unwrap() = RunRequestState::Committed;

        // The target occupies the CPU for its slice before control comes
        // back to the agent.
        if let Some(ns) = c.commit_runtime_ns.lock().unwrap().take() {
            let sw = {
                let tasks = self.inner.tasks.lock().unwrap();
                tasks.get(&spec.target).map(|st| st.sw.clone())
            };
            if let Some(sw) = sw {
                sw.add_runtime_ns(ns);
            }
        }
        if self.inner.blocking {
            self.inner.profile_step(self.cpu, spec.target);
            self.inner.park(self.cpu);
        }

        true
    }

    fn local_yield(&self, _agent_barrier: BarrierToken, flags: u32) {
        let c = &self.inner.cpus[self.cpu];
        *c.last_yield.lock().unwrap() = Some(flags);
        *c.oncpu.lock().unwrap() = None;

        if flags & RTLA_ON_IDLE != 0 {
            // The CPU went idle under us; the boost window is over by the
            // time the agent runs again.
            c.agent_sw.set_boosted(false);
        }

        self.inner.park(self.cpu);
    }

    fn state(&self) -> RunRequestState {
        *self.state.lock().unwrap()
    }
}
