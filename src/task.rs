// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Task identity and the per-task run-state machine.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicI32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use log::error;

use crate::enclave::{BarrierToken, StatusWord};

/// Global task id, stable for the task's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Gtid(pub u64);

impl fmt::Display for Gtid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RunState {
    Blocked = 0,
    Runnable = 1,
    Running = 2,
    Done = 3,
}

impl RunState {
    fn from_u8(v: u8) -> RunState {
        match v {
            0 => RunState::Blocked,
            1 => RunState::Runnable,
            2 => RunState::Running,
            3 => RunState::Done,
            _ => unreachable!("corrupt run state {}", v),
        }
    }

    const fn bit(self) -> u8 {
        1 << self as u8
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunState::Blocked => "Blocked",
            RunState::Runnable => "Runnable",
            RunState::Running => "Running",
            RunState::Done => "Done",
        };
        write!(f, "{}", s)
    }
}

// Legal predecessor states, indexed by target state. Done is terminal.
const LEGAL_FROM: [u8; 4] = [
    RunState::Runnable.bit() | RunState::Running.bit(), // -> Blocked
    RunState::Blocked.bit() | RunState::Running.bit(),  // -> Runnable
    RunState::Runnable.bit(),                           // -> Running
    RunState::Blocked.bit() | RunState::Runnable.bit() | RunState::Running.bit(), // -> Done
];

const JOURNAL_LEN: usize = 16;

#[derive(Debug, Clone, Copy)]
pub struct Transition {
    pub from: RunState,
    pub to: RunState,
    pub applied: bool,
}

/// Run state plus a bounded journal of attempted transitions.
///
/// Transitions are validated against the legal-predecessor table. Debug
/// builds abort on an illegal transition with the journal dumped; release
/// builds refuse the transition and keep going.
pub struct StateCell {
    state: AtomicU8,
    journal: Mutex<VecDeque<Transition>>,
}

impl StateCell {
    pub fn new(initial: RunState) -> Self {
        Self {
            state: AtomicU8::new(initial as u8),
            journal: Mutex::new(VecDeque::with_capacity(JOURNAL_LEN)),
        }
    }

    pub fn get(&self) -> RunState {
        RunState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set(&self, gtid: Gtid, next: RunState) {
        let cur = self.get();
        let legal = LEGAL_FROM[next as usize] & cur.bit() != 0;

        {
            let mut journal = self.journal.lock().unwrap();
            if journal.len() == JOURNAL_LEN {
                journal.pop_front();
            }
            journal.push_back(Transition {
                from: cur,
                to: next,
                applied: legal,
            });
        }

        if !legal {
            if cfg!(debug_assertions) {
                panic!(
                    "[{}] illegal transition {} -> {}, trace: {}",
                    gtid,
                    cur,
                    next,
                    self.trace()
                );
            }
            error!("[{}] illegal transition {} -> {}, ignored", gtid, cur, next);
            return;
        }

        self.state.store(next as u8, Ordering::Release);
    }

    /// Journaled transitions, oldest first.
    pub fn journal(&self) -> Vec<Transition> {
        self.journal.lock().unwrap().iter().copied().collect()
    }

    fn trace(&self) -> String {
        self.journal()
            .iter()
            .map(|t| {
                format!(
                    "{} -> {}{}",
                    t.from,
                    t.to,
                    if t.applied { "" } else { " (refused)" }
                )
            })
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// One scheduled entity.
///
/// Mutable fields are atomics for cross-thread visibility, but every
/// logical read-modify-write happens with the owning CPU's rq mutex held.
pub struct Task {
    pub gtid: Gtid,
    pub run_state: StateCell,
    pub status_word: Arc<dyn StatusWord>,
    cpu: AtomicI32,
    seqnum: AtomicU64,
    vruntime_ns: AtomicU64,
    runtime_at_first_pick_ns: AtomicU64,
}

impl Task {
    pub fn new(gtid: Gtid, status_word: Arc<dyn StatusWord>) -> Self {
        Self {
            gtid,
            run_state: StateCell::new(RunState::Blocked),
            status_word,
            cpu: AtomicI32::new(-1),
            seqnum: AtomicU64::new(0),
            vruntime_ns: AtomicU64::new(0),
            runtime_at_first_pick_ns: AtomicU64::new(0),
        }
    }

    /// Owning CPU id, or -1 while the task has never been migrated.
    pub fn cpu(&self) -> i32 {
        self.cpu.load(Ordering::Relaxed)
    }

    pub fn set_cpu(&self, cpu: i32) {
        self.cpu.store(cpu, Ordering::Relaxed);
    }

    /// Barrier token of the last message consumed for this task.
    pub fn seqnum(&self) -> BarrierToken {
        self.seqnum.load(Ordering::Relaxed)
    }

    pub fn set_seqnum(&self, seqnum: BarrierToken) {
        self.seqnum.store(seqnum, Ordering::Relaxed);
    }

    pub fn vruntime_ns(&self) -> u64 {
        self.vruntime_ns.load(Ordering::Relaxed)
    }

    pub fn set_vruntime_ns(&self, ns: u64) {
        self.vruntime_ns.store(ns, Ordering::Relaxed);
    }

    pub fn add_vruntime_ns(&self, delta: u64) {
        self.vruntime_ns.fetch_add(delta, Ordering::Relaxed);
    }

    /// Kernel-reported runtime when the task last went on-cpu.
    pub fn runtime_at_first_pick_ns(&self) -> u64 {
        self.runtime_at_first_pick_ns.load(Ordering::Relaxed)
    }

    pub fn set_runtime_at_first_pick_ns(&self, ns: u64) {
        self.runtime_at_first_pick_ns.store(ns, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimStatusWord;

    fn task() -> Task {
        Task::new(Gtid(1), Arc::new(SimStatusWord::default()))
    }

    #[test]
    fn new_task_starts_blocked_unplaced() {
        let t = task();
        assert_eq!(t.run_state.get(), RunState::Blocked);
        assert_eq!(t.cpu(), -1);
        assert_eq!(t.vruntime_ns(), 0);
    }

    #[test]
    fn full_lifecycle_transitions() {
        let t = task();
        t.run_state.set(t.gtid, RunState::Runnable);
        t.run_state.set(t.gtid, RunState::Running);
        t.run_state.set(t.gtid, RunState::Blocked);
        t.run_state.set(t.gtid, RunState::Runnable);
        t.run_state.set(t.gtid, RunState::Running);
        t.run_state.set(t.gtid, RunState::Done);
        assert_eq!(t.run_state.get(), RunState::Done);

        let journal = t.run_state.journal();
        assert_eq!(journal.len(), 6);
        assert!(journal.iter().all(|tr| tr.applied));
    }

    #[test]
    #[should_panic(expected = "illegal transition")]
    fn blocked_to_running_aborts() {
        let t = task();
        t.run_state.set(t.gtid, RunState::Running);
    }

    #[test]
    #[should_panic(expected = "illegal transition")]
    fn done_is_terminal() {
        let t = task();
        t.run_state.set(t.gtid, RunState::Done);
        t.run_state.set(t.gtid, RunState::Runnable);
    }

    #[test]
    fn journal_is_bounded() {
        let t = task();
        for _ in 0..20 {
            t.run_state.set(t.gtid, RunState::Runnable);
            t.run_state.set(t.gtid, RunState::Blocked);
        }
        assert_eq!(t.run_state.journal().len(), 16);
    }
}
