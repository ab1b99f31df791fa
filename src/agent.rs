// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Per-CPU agent threads: one pinned thread per enclave CPU, each
//! draining its channel and committing scheduling decisions until the
//! enclave is finished and its run queue has drained.

use std::sync::{Arc, Barrier};
use std::thread::{self, JoinHandle};

use anyhow::{bail, Result};
use log::{debug, info};

use crate::enclave::Enclave;
use crate::scheduler::Scheduler;
use crate::task::Gtid;

// Synthetic identity space for the agents themselves, far above any task.
const AGENT_GTID_BASE: u64 = 1 << 48;

pub fn agent_gtid(cpu: usize) -> Gtid {
    Gtid(AGENT_GTID_BASE + cpu as u64)
}

fn pin_to_cpu(cpu: usize) {
    if cpu >= libc::CPU_SETSIZE as usize {
        debug!("cpu {}: beyond CPU_SETSIZE, not pinned", cpu);
        return;
    }
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_SET(cpu, &mut set);
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            debug!("cpu {}: sched_setaffinity failed, not pinned", cpu);
        }
    }
}

pub struct AgentManager {
    scheduler: Arc<Scheduler>,
    handles: Vec<(usize, JoinHandle<()>)>,
}

impl AgentManager {
    /// Spawn one agent per enclave CPU. Agents signal ready, the enclave
    /// association runs, and only then do the scheduling loops start.
    pub fn start(scheduler: Arc<Scheduler>, enclave: Arc<dyn Enclave>) -> Self {
        let cpus = scheduler.cpus().to_vec();
        let ready = Arc::new(Barrier::new(cpus.len() + 1));

        let handles = cpus
            .iter()
            .map(|&cpu| {
                let scheduler = scheduler.clone();
                let enclave = enclave.clone();
                let ready = ready.clone();
                let handle = thread::Builder::new()
                    .name(format!("agent-{}", cpu))
                    .spawn(move || {
                        pin_to_cpu(cpu);
                        ready.wait();
                        agent_loop(cpu, &scheduler, &enclave);
                    })
                    .expect("failed to spawn agent thread");
                (cpu, handle)
            })
            .collect();

        scheduler.enclave_ready();
        ready.wait();
        info!("{} agent(s) running", cpus.len());

        Self { scheduler, handles }
    }

    /// Wait for every agent to drain and exit, then validate that no run
    /// queue still holds tasks.
    pub fn join(self) -> Result<()> {
        let mut aborted = false;
        for (cpu, handle) in self.handles {
            if handle.join().is_err() {
                aborted = true;
                eprintln!(
                    "agent for cpu {} aborted; last message: {}",
                    cpu,
                    self.scheduler.last_msg_str(cpu)
                );
            }
        }
        if aborted {
            bail!("one or more agent threads aborted");
        }

        self.scheduler.validate_pre_exit_state();
        Ok(())
    }
}

fn agent_loop(cpu: usize, scheduler: &Scheduler, enclave: &Arc<dyn Enclave>) {
    let agent_sw = enclave.agent_status_word(cpu);

    while !(enclave.finished() && scheduler.is_empty(cpu)) {
        scheduler.schedule(cpu, &*agent_sw);
    }

    debug!("cpu {}: agent drained, exiting", cpu);
}
