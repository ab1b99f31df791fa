// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Contract between the scheduling engine and the kernel scheduling-class
//! facility: per-CPU message channels, transactional run-requests, and the
//! shared-memory status words exported for agents and tasks.
//!
//! The engine only ever talks to these traits. The in-process
//! implementation lives in [`crate::sim`].

use std::fmt;
use std::sync::Arc;

use crate::task::Gtid;

/// Monotonically increasing token attached to messages, used to detect
/// stale views during transactional commits.
pub type BarrierToken = u64;

// RunRequest commit flags.
pub const COMMIT_AT_TXN_COMMIT: u32 = 1 << 0;
pub const ALLOW_TASK_ONCPU: u32 = 1 << 1;

// LocalYield flags.
pub const RTLA_ON_IDLE: u32 = 1 << 0;

/// Task lifecycle message payloads, decoded from the kernel wire format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    TaskNew { gtid: Gtid, runnable: bool },
    TaskRunnable { gtid: Gtid },
    TaskBlocked { gtid: Gtid, cpu: usize, from_switchto: bool },
    TaskYield { gtid: Gtid, cpu: usize, from_switchto: bool },
    TaskPreempted { gtid: Gtid, cpu: usize, from_switchto: bool },
    TaskSwitchto { gtid: Gtid },
    TaskDeparted { gtid: Gtid, cpu: usize, from_switchto: bool },
    TaskDead { gtid: Gtid },
    CpuTick { cpu: usize },
}

impl Payload {
    /// The task this message is about, if any.
    pub fn gtid(&self) -> Option<Gtid> {
        match *self {
            Payload::TaskNew { gtid, .. }
            | Payload::TaskRunnable { gtid }
            | Payload::TaskBlocked { gtid, .. }
            | Payload::TaskYield { gtid, .. }
            | Payload::TaskPreempted { gtid, .. }
            | Payload::TaskSwitchto { gtid }
            | Payload::TaskDeparted { gtid, .. }
            | Payload::TaskDead { gtid } => Some(gtid),
            Payload::CpuTick { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub seqnum: BarrierToken,
    pub payload: Payload,
}

#[derive(Debug)]
pub enum AssociateError {
    /// The barrier is stale: a newer message exists for the task. Retry.
    Stale,
    /// Anything else is a broken kernel contract.
    Fatal(String),
}

impl fmt::Display for AssociateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssociateError::Stale => write!(f, "stale barrier"),
            AssociateError::Fatal(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for AssociateError {}

/// Shared-memory view of kernel-exported runtime counters. Single writer
/// (the kernel), many readers.
pub trait StatusWord: Send + Sync {
    /// Accumulated on-cpu time in nanoseconds.
    fn runtime_ns(&self) -> u64;
    fn barrier(&self) -> BarrierToken;
    /// True while the agent runs at elevated priority over kernel CFS and
    /// its view of the CPU may be stale.
    fn boosted_priority(&self) -> bool;
}

/// Per-CPU kernel message queue.
pub trait Channel: Send + Sync {
    /// Bind a task's message stream to this channel. `barrier` must match
    /// the latest message consumed for the task.
    fn associate_task(&self, gtid: Gtid, barrier: BarrierToken) -> Result<(), AssociateError>;
    fn peek(&self) -> Option<Message>;
    fn consume(&self, msg: &Message);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunRequestSpec {
    pub target: Gtid,
    pub target_barrier: BarrierToken,
    pub agent_barrier: BarrierToken,
    pub commit_flags: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunRequestState {
    Idle,
    Open,
    Committed,
    Failed,
}

/// Per-CPU transaction used to place a task on-cpu atomically against the
/// agent and target barriers.
pub trait RunRequest: Send + Sync {
    fn open(&self, spec: RunRequestSpec);
    /// Commit the open transaction. Returns false if either barrier went
    /// stale; the caller reconciles by draining messages.
    fn commit(&self) -> bool;
    /// Return the CPU to the kernel until the agent is needed again.
    fn local_yield(&self, agent_barrier: BarrierToken, flags: u32);
    fn state(&self) -> RunRequestState;
}

/// The kernel-side grouping of CPUs delegated to user-space scheduling.
pub trait Enclave: Send + Sync {
    fn channel(&self, cpu: usize) -> Arc<dyn Channel>;
    fn run_request(&self, cpu: usize) -> Arc<dyn RunRequest>;
    fn agent_status_word(&self, cpu: usize) -> Arc<dyn StatusWord>;
    fn task_status_word(&self, gtid: Gtid) -> Arc<dyn StatusWord>;
    /// Wake the agent on `cpu` out of idle.
    fn ping_cpu(&self, cpu: usize);
    fn finished(&self) -> bool;
}
