// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

// End-to-end scheduling scenarios against the in-process enclave, driven
// message by message so every decision is deterministic.

use std::sync::Arc;

use fairland::agent::AgentManager;
use fairland::enclave::{Enclave, Payload, RTLA_ON_IDLE};
use fairland::scheduler::Scheduler;
use fairland::sim::{SimEnclave, TaskProfile};
use fairland::task::{Gtid, RunState};

const MIN_GRANULARITY_NS: u64 = 1_000_000;
const LATENCY_NS: u64 = 6_000_000;

const T1: Gtid = Gtid(1);
const T2: Gtid = Gtid(2);
const T3: Gtid = Gtid(3);

fn setup(nr_cpus: usize) -> (SimEnclave, Scheduler) {
    let sim = SimEnclave::new(nr_cpus);
    let scheduler = Scheduler::new(
        Arc::new(sim.clone()),
        (0..nr_cpus).collect(),
        MIN_GRANULARITY_NS,
        LATENCY_NS,
    );
    (sim, scheduler)
}

fn schedule(sim: &SimEnclave, scheduler: &Scheduler, cpu: usize) {
    let sw = sim.agent_status_word(cpu);
    scheduler.schedule(cpu, &*sw);
}

fn new_task(sim: &SimEnclave, gtid: Gtid) {
    sim.push(
        0,
        Payload::TaskNew {
            gtid,
            runnable: true,
        },
    );
}

#[test]
fn single_task_steady_run() {
    let (sim, scheduler) = setup(1);

    new_task(&sim, T1);
    schedule(&sim, &scheduler, 0);

    // Placed with vruntime 0, picked, committed against its barrier.
    assert_eq!(scheduler.current_gtid(0), Some(T1));
    assert_eq!(scheduler.task_vruntime_ns(T1), Some(0));
    assert_eq!(scheduler.rq_len(0), 0);
    assert_eq!(sim.oncpu(0), Some(T1));
    assert_eq!(sim.latest_seqnum(T1), 1);
    assert_eq!(scheduler.metrics().nr_commits, 1);

    // A tick well below the preemption granularity changes nothing. With
    // an otherwise empty queue the granularity is the full latency
    // target.
    sim.advance_task_runtime(T1, 500_000);
    sim.push(0, Payload::CpuTick { cpu: 0 });
    schedule(&sim, &scheduler, 0);
    assert!(!scheduler.preempt_curr(0));
    assert_eq!(scheduler.current_gtid(0), Some(T1));

    // Crossing the granularity arms the preemption flag.
    sim.advance_task_runtime(T1, LATENCY_NS);
    sim.push(0, Payload::CpuTick { cpu: 0 });
    schedule(&sim, &scheduler, 0);
    // The pick demoted, re-enqueued, and re-picked the only task, with a
    // fresh first-pick snapshot and the flag consumed.
    assert!(!scheduler.preempt_curr(0));
    assert_eq!(scheduler.current_gtid(0), Some(T1));
    assert_eq!(scheduler.task_run_state(T1), Some(RunState::Running));

    // A short tick against the new snapshot stays below the granularity.
    sim.advance_task_runtime(T1, 500_000);
    sim.push(0, Payload::CpuTick { cpu: 0 });
    schedule(&sim, &scheduler, 0);
    assert!(!scheduler.preempt_curr(0));
}

#[test]
fn two_tasks_alternate_with_scaled_granularity() {
    let (sim, scheduler) = setup(1);

    new_task(&sim, T1);
    new_task(&sim, T2);

    // T1 wins the first pick on the identity tiebreak and runs a full
    // scaled slice: with one task queued the granularity is
    // ceil(6ms / 2) = 3ms.
    sim.set_commit_runtime(0, 3_100_000);
    schedule(&sim, &scheduler, 0);
    assert_eq!(scheduler.current_gtid(0), Some(T1));
    assert!(!scheduler.rq_contains(0, T1));
    assert!(scheduler.rq_contains(0, T2));
    assert_eq!(scheduler.task_vruntime_ns(T1), Some(3_100_000));

    // The tick sees 3.1ms on-cpu > 3ms and flags preemption; the next
    // pick prefers T2 at vruntime 0.
    sim.push(0, Payload::CpuTick { cpu: 0 });
    sim.set_commit_runtime(0, 3_100_000);
    schedule(&sim, &scheduler, 0);
    assert_eq!(scheduler.current_gtid(0), Some(T2));
    assert!(scheduler.rq_contains(0, T1));
    assert_eq!(scheduler.task_run_state(T1), Some(RunState::Runnable));
    assert_eq!(scheduler.task_vruntime_ns(T2), Some(3_100_000));

    // Alternation continues on the tiebreak once vruntimes level out,
    // and both vruntimes only ever grow.
    sim.push(0, Payload::CpuTick { cpu: 0 });
    sim.set_commit_runtime(0, 3_100_000);
    schedule(&sim, &scheduler, 0);
    assert_eq!(scheduler.current_gtid(0), Some(T1));
    assert!(scheduler.task_vruntime_ns(T1) >= Some(3_100_000));
    assert!(scheduler.task_vruntime_ns(T2) >= Some(3_100_000));
}

#[test]
fn late_wakeup_clamps_vruntime() {
    let (sim, scheduler) = setup(1);

    // T1 runs briefly and blocks at vruntime 1ms.
    new_task(&sim, T1);
    sim.set_commit_runtime(0, 1_000_000);
    schedule(&sim, &scheduler, 0);
    assert_eq!(scheduler.task_vruntime_ns(T1), Some(1_000_000));

    sim.push(
        0,
        Payload::TaskBlocked {
            gtid: T1,
            cpu: 0,
            from_switchto: false,
        },
    );
    new_task(&sim, T2);
    sim.set_commit_runtime(0, 500_000_000);
    schedule(&sim, &scheduler, 0);
    assert_eq!(scheduler.current_gtid(0), Some(T2));
    assert_eq!(scheduler.task_vruntime_ns(T2), Some(500_000_000));

    // A yield cycles T2 through the queue, pulling min_vruntime up to
    // its accumulated 500ms.
    sim.push(
        0,
        Payload::TaskYield {
            gtid: T2,
            cpu: 0,
            from_switchto: false,
        },
    );
    schedule(&sim, &scheduler, 0);
    assert_eq!(scheduler.min_vruntime_ns(0), 500_000_000);

    // T1 wakes up far in the past; the enqueue clamp keeps it from
    // monopolizing the CPU.
    sim.push(0, Payload::TaskRunnable { gtid: T1 });
    schedule(&sim, &scheduler, 0);
    assert_eq!(scheduler.task_vruntime_ns(T1), Some(500_000_000));
    assert!(scheduler.task_vruntime_ns(T1).unwrap() >= scheduler.min_vruntime_ns(0));
}

#[test]
fn wakeup_racing_dispatch_keeps_task_current() {
    let (sim, scheduler) = setup(1);

    new_task(&sim, T1);
    schedule(&sim, &scheduler, 0);
    assert_eq!(scheduler.current_gtid(0), Some(T1));

    // Block and wake again before the next pick: the wakeup observes the
    // task still current and only flips its state back to Runnable.
    sim.push(
        0,
        Payload::TaskBlocked {
            gtid: T1,
            cpu: 0,
            from_switchto: false,
        },
    );
    sim.push(0, Payload::TaskRunnable { gtid: T1 });
    schedule(&sim, &scheduler, 0);

    assert_eq!(scheduler.current_gtid(0), Some(T1));
    assert_eq!(scheduler.task_run_state(T1), Some(RunState::Running));
    assert!(!scheduler.rq_contains(0, T1));
}

#[test]
fn stale_commit_keeps_current_and_reconciles() {
    let (sim, scheduler) = setup(1);

    new_task(&sim, T1);
    schedule(&sim, &scheduler, 0);
    assert_eq!(scheduler.metrics().nr_commits, 1);

    // The agent's view goes stale between pick and commit.
    sim.push(
        0,
        Payload::TaskYield {
            gtid: T1,
            cpu: 0,
            from_switchto: false,
        },
    );
    sim.force_commit_stale(0);
    schedule(&sim, &scheduler, 0);

    // The failed commit leaves cs.current as picked; nothing is leaked.
    assert_eq!(scheduler.metrics().nr_commit_failures, 1);
    assert_eq!(scheduler.current_gtid(0), Some(T1));
    assert_eq!(scheduler.nr_tasks(), 1);

    // The next pass re-commits without any new message.
    schedule(&sim, &scheduler, 0);
    assert_eq!(scheduler.metrics().nr_commits, 2);
    assert_eq!(scheduler.current_gtid(0), Some(T1));
}

#[test]
fn prio_boost_reconciles_and_parks_on_idle() {
    let (sim, scheduler) = setup(1);

    new_task(&sim, T1);
    schedule(&sim, &scheduler, 0);
    assert_eq!(scheduler.current_gtid(0), Some(T1));

    // Kernel CFS ran on this CPU: the agent reconciles its view and
    // parks until idle instead of committing.
    sim.set_prio_boost(0, true);
    schedule(&sim, &scheduler, 0);

    assert_eq!(scheduler.current_gtid(0), None);
    assert!(scheduler.rq_contains(0, T1));
    assert_eq!(scheduler.task_run_state(T1), Some(RunState::Runnable));
    assert_eq!(sim.last_yield(0), Some(RTLA_ON_IDLE));

    // Back at normal priority the engine re-picks the task.
    schedule(&sim, &scheduler, 0);
    assert_eq!(scheduler.current_gtid(0), Some(T1));
    assert_eq!(sim.oncpu(0), Some(T1));
}

#[test]
fn preempted_by_other_class_changes_no_state() {
    let (sim, scheduler) = setup(1);

    new_task(&sim, T1);
    schedule(&sim, &scheduler, 0);

    // A higher-priority kernel class took the CPU; the message itself
    // changes nothing, reconciliation happens at commit time.
    sim.push(
        0,
        Payload::TaskPreempted {
            gtid: T1,
            cpu: 0,
            from_switchto: false,
        },
    );
    schedule(&sim, &scheduler, 0);

    assert_eq!(scheduler.current_gtid(0), Some(T1));
    assert_eq!(scheduler.task_run_state(T1), Some(RunState::Running));
}

#[test]
fn lifecycle_frees_task_exactly_once() {
    let (sim, scheduler) = setup(1);

    new_task(&sim, T1);
    schedule(&sim, &scheduler, 0);

    sim.push(
        0,
        Payload::TaskBlocked {
            gtid: T1,
            cpu: 0,
            from_switchto: false,
        },
    );
    sim.push(0, Payload::TaskRunnable { gtid: T1 });
    sim.push(0, Payload::TaskDead { gtid: T1 });
    schedule(&sim, &scheduler, 0);

    assert_eq!(scheduler.nr_tasks(), 0);
    assert!(scheduler.is_empty(0));
    assert_eq!(scheduler.metrics().nr_task_dead, 1);
    scheduler.validate_pre_exit_state();
}

#[test]
fn switchto_chain_blocks_task_off_queue() {
    let (sim, scheduler) = setup(1);

    new_task(&sim, T1);
    schedule(&sim, &scheduler, 0);

    // The task left via an in-kernel switchto chain.
    sim.push(0, Payload::TaskSwitchto { gtid: T1 });
    schedule(&sim, &scheduler, 0);
    assert_eq!(scheduler.task_run_state(T1), Some(RunState::Blocked));
    assert_eq!(scheduler.current_gtid(0), None);
    assert!(!scheduler.rq_contains(0, T1));

    // A departed message out of the chain pings the origin CPU.
    let pings = sim.nr_pings(0);
    sim.push(
        0,
        Payload::TaskDeparted {
            gtid: T1,
            cpu: 0,
            from_switchto: true,
        },
    );
    schedule(&sim, &scheduler, 0);
    assert_eq!(scheduler.nr_tasks(), 0);
    assert!(sim.nr_pings(0) > pings);
}

#[test]
fn clean_shutdown_drains_all_queues() {
    let (sim, scheduler) = setup(2);

    // Three tasks land 2 + 1 over the two CPUs via round-robin.
    new_task(&sim, T1);
    new_task(&sim, T2);
    new_task(&sim, T3);
    schedule(&sim, &scheduler, 0);
    schedule(&sim, &scheduler, 1);
    assert_eq!(scheduler.current_gtid(0), Some(T1));
    assert_eq!(scheduler.current_gtid(1), Some(T2));
    assert!(scheduler.rq_contains(0, T3));

    // Deaths arrive in arbitrary order on the owning CPUs.
    sim.push(0, Payload::TaskDead { gtid: T3 });
    sim.push(1, Payload::TaskDead { gtid: T2 });
    sim.push(0, Payload::TaskDead { gtid: T1 });
    schedule(&sim, &scheduler, 0);
    schedule(&sim, &scheduler, 1);

    assert!(scheduler.is_empty(0));
    assert!(scheduler.is_empty(1));
    assert_eq!(scheduler.nr_tasks(), 0);
    scheduler.validate_pre_exit_state();
}

#[test]
fn threaded_agents_run_workload_to_clean_drain() {
    let sim = SimEnclave::new_blocking(2);
    let enclave: Arc<dyn Enclave> = Arc::new(sim.clone());
    let scheduler = Arc::new(Scheduler::new(
        enclave.clone(),
        vec![0, 1],
        MIN_GRANULARITY_NS,
        LATENCY_NS,
    ));

    let agents = AgentManager::start(scheduler.clone(), enclave);

    for id in 1..=6 {
        sim.spawn_task(
            Gtid(id),
            TaskProfile {
                total_runtime_ns: 5_000_000,
                slice_ns: 1_000_000,
                yield_period: Some(3),
            },
        );
    }

    while sim.tasks_remaining() > 0 {
        std::thread::sleep(std::time::Duration::from_millis(1));
    }
    sim.finish();
    agents.join().unwrap();

    let metrics = scheduler.metrics();
    assert_eq!(metrics.nr_task_dead, 6);
    assert_eq!(metrics.nr_task_new, 6);
    assert_eq!(scheduler.nr_tasks(), 0);
    assert!(metrics.nr_commits >= 6 * 5);
}
