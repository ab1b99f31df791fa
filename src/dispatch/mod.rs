// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Dispatch orchestrator: a load generator feeding request batches to a
//! pool of workers over a shared table of per-worker slots.
//!
//! The generator repeatedly gathers idle workers, hands each a batch from
//! the ingress queue, and marks it runnable. A worker is idle only when
//! its `num_requests` is zero AND (on the priority-table path) its table
//! entry says idle. The double check closes the race with a worker that
//! has cleared `num_requests` but has not yet marked itself idle:
//! re-arming it in that window would let its own late idle-mark put it to
//! sleep holding a full batch.

pub mod prio_table;
pub mod thread_wait;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::ValueEnum;
use crossbeam::channel::{self, Receiver, Sender};
use log::{debug, info};

use self::prio_table::{PrioTable, WorkClass, WORK_CLASS_ONESHOT};
use self::thread_wait::ThreadWait;

/// SID 0 is reserved for the load generator, which is not scheduled by
/// the custom class; workers then index the table directly by SID.
pub const LOAD_GENERATOR_SID: u32 = 0;

const WORK_CLASS_ID: u32 = 0;

/// Deadline written with each assignment, used only by EDF variants.
const ASSIGNMENT_DEADLINE_NS: u64 = 100_000;

/// Bound on the ingress queue: a full queue pushes back on the producer
/// instead of piling up requests the pool cannot keep up with.
const INGRESS_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum WaitType {
    /// Runnable state lives in the shared priority table.
    PrioTable,
    /// One futex word per worker.
    Futex,
}

#[derive(Debug, Clone)]
pub struct DispatchOpts {
    pub num_workers: usize,
    pub batch: usize,
    pub load_generator_cpu: usize,
    pub wait_type: WaitType,
    pub qos: u32,
}

impl Default for DispatchOpts {
    fn default() -> Self {
        Self {
            num_workers: 4,
            batch: 8,
            load_generator_cpu: 0,
            wait_type: WaitType::PrioTable,
            qos: 2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Request {
    pub id: u64,
    pub work_ns: u64,
    pub assigned: Option<Instant>,
    pub started: Option<Instant>,
    pub finished: Option<Instant>,
}

impl Request {
    pub fn new(id: u64, work_ns: u64) -> Self {
        Self {
            id,
            work_ns,
            assigned: None,
            started: None,
            finished: None,
        }
    }
}

/// Per-worker slot. `num_requests` is the synchronization point between
/// the generator and the worker: the batch is written only while it is
/// zero and read only after observing it non-zero.
pub struct WorkerWork {
    pub num_requests: AtomicUsize,
    pub requests: Mutex<Vec<Request>>,
}

fn monotonic_now_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

fn pin_to_cpu(cpu: usize) {
    if cpu >= libc::CPU_SETSIZE as usize {
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

pub struct Orchestrator {
    opts: DispatchOpts,
    /// Indexed by SID; slot 0 (the load generator) stays empty.
    worker_work: Vec<Arc<WorkerWork>>,
    prio_table: Option<PrioTable>,
    thread_wait: Option<ThreadWait>,
    ingress: Receiver<Request>,
    exit: Vec<AtomicBool>,
    num_exited: AtomicUsize,
    results: Vec<Mutex<Vec<Request>>>,
}

impl Orchestrator {
    pub fn new(opts: DispatchOpts, ingress: Receiver<Request>) -> Self {
        let total_threads = opts.num_workers + 1;

        let (prio_table, thread_wait) = match opts.wait_type {
            WaitType::PrioTable => {
                let mut table = PrioTable::new(total_threads);
                table.set_work_class(WorkClass {
                    id: WORK_CLASS_ID,
                    flags: WORK_CLASS_ONESHOT,
                    qos: opts.qos,
                    exectime: 100,
                    period: 0,
                });
                for sid in 1..total_threads as u32 {
                    table.init_sched_item(sid, WORK_CLASS_ID, sid as u64);
                }
                (Some(table), None)
            }
            WaitType::Futex => (None, Some(ThreadWait::new(total_threads))),
        };

        Self {
            opts,
            worker_work: (0..total_threads)
                .map(|_| {
                    Arc::new(WorkerWork {
                        num_requests: AtomicUsize::new(0),
                        requests: Mutex::new(Vec::new()),
                    })
                })
                .collect(),
            prio_table,
            thread_wait,
            ingress,
            exit: (0..total_threads).map(|_| AtomicBool::new(false)).collect(),
            num_exited: AtomicUsize::new(0),
            results: (0..total_threads).map(|_| Mutex::new(Vec::new())).collect(),
        }
    }

    pub fn opts(&self) -> &DispatchOpts {
        &self.opts
    }

    pub fn worker_work(&self, sid: u32) -> &Arc<WorkerWork> {
        &self.worker_work[sid as usize]
    }

    pub fn prio_table(&self) -> Option<&PrioTable> {
        self.prio_table.as_ref()
    }

    pub fn thread_wait(&self) -> Option<&ThreadWait> {
        self.thread_wait.as_ref()
    }

    fn uses_prio_table(&self) -> bool {
        self.prio_table.is_some()
    }

    fn total_threads(&self) -> usize {
        self.opts.num_workers + 1
    }

    /// A worker with no pending requests may still be about to mark
    /// itself idle; reassigning it in that window would lose it.
    pub fn skip_idle_worker(&self, sid: u32) -> bool {
        match &self.prio_table {
            Some(table) => !table.is_idle(sid),
            // The futex wake cannot be lost, no double check needed.
            None => false,
        }
    }

    pub fn get_idle_worker_sids(&self) -> Vec<u32> {
        let mut idle_sids = Vec::new();
        for i in 0..self.opts.num_workers {
            // Skip the load generator at SID 0.
            let sid = i as u32 + 1;
            if self.worker_work[sid as usize]
                .num_requests
                .load(Ordering::Acquire)
                == 0
                && !self.skip_idle_worker(sid)
            {
                idle_sids.push(sid);
            }
        }
        idle_sids
    }

    /// One generator iteration: hand a batch to every idle worker until
    /// the ingress queue runs dry. Returns whether anything was assigned.
    pub fn load_generator_pass(&self) -> bool {
        let mut assigned = false;

        for sid in self.get_idle_worker_sids() {
            let work = &self.worker_work[sid as usize];
            debug_assert_eq!(work.num_requests.load(Ordering::Relaxed), 0);

            let mut requests = work.requests.lock().unwrap();
            requests.clear();
            while requests.len() < self.opts.batch {
                match self.ingress.try_recv() {
                    Ok(mut req) => {
                        req.assigned = Some(Instant::now());
                        requests.push(req);
                    }
                    // Ingress drained; give the worker what we have.
                    Err(_) => break,
                }
            }
            let num_requests = requests.len();
            drop(requests);

            if num_requests == 0 {
                // Nothing waiting in the ingress queue.
                break;
            }

            work.num_requests.store(num_requests, Ordering::Release);
            assigned = true;

            match &self.prio_table {
                Some(table) => {
                    // Re-arming a non-idle worker would leak it for good.
                    assert!(
                        table.is_idle(sid),
                        "worker {} armed while not idle",
                        sid
                    );
                    table.set_deadline(sid, monotonic_now_ns() + ASSIGNMENT_DEADLINE_NS);
                    table.mark_runnable(sid);
                }
                None => self.thread_wait.as_ref().unwrap().mark_runnable(sid),
            }
        }

        assigned
    }

    fn load_generator_loop(&self) {
        pin_to_cpu(self.opts.load_generator_cpu);
        debug!(
            "load generator (SID {}) on cpu {}",
            LOAD_GENERATOR_SID, self.opts.load_generator_cpu
        );

        while !self.exit[LOAD_GENERATOR_SID as usize].load(Ordering::Acquire) {
            if !self.load_generator_pass() {
                thread::yield_now();
            }
        }
        self.num_exited.fetch_add(1, Ordering::Release);
    }

    fn handle_request(&self, req: &Request) {
        let end = Instant::now() + Duration::from_nanos(req.work_ns);
        while Instant::now() < end {
            std::hint::spin_loop();
        }
    }

    fn worker_loop(&self, sid: u32) {
        let work = &self.worker_work[sid as usize];

        if !self.uses_prio_table() {
            self.thread_wait.as_ref().unwrap().wait_until_runnable(sid);
        }

        loop {
            let num_requests = work.num_requests.load(Ordering::Acquire);
            if num_requests > 0 {
                assert!(num_requests <= self.opts.batch);
                let mut requests = work.requests.lock().unwrap();
                assert_eq!(num_requests, requests.len());

                for req in requests.iter_mut() {
                    req.started = Some(Instant::now());
                    self.handle_request(req);
                    req.finished = Some(Instant::now());
                }
                self.results[sid as usize]
                    .lock()
                    .unwrap()
                    .extend(requests.drain(..));
            }

            match &self.prio_table {
                Some(table) => {
                    // Clear num_requests first: the moment the idle mark
                    // lands we can be descheduled, and the generator
                    // checks num_requests before the idle bit.
                    work.num_requests.store(0, Ordering::Release);
                    table.mark_idle(sid);
                }
                None => {
                    // Mark idle first: done the other way around, the
                    // generator could assign and wake in the gap and the
                    // late idle-mark would sleep us holding a full batch.
                    let tw = self.thread_wait.as_ref().unwrap();
                    tw.mark_idle(sid);
                    work.num_requests.store(0, Ordering::Release);
                }
            }

            if self.exit[sid as usize].load(Ordering::Acquire) {
                break;
            }

            match &self.prio_table {
                Some(table) => table.wait_until_runnable(sid),
                None => self.thread_wait.as_ref().unwrap().wait_until_runnable(sid),
            }
        }

        self.num_exited.fetch_add(1, Ordering::Release);
    }

    /// Spawn the load generator and the worker pool.
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(self.total_threads());

        {
            let orch = self.clone();
            handles.push(
                thread::Builder::new()
                    .name("load-generator".to_string())
                    .spawn(move || orch.load_generator_loop())
                    .expect("failed to spawn load generator"),
            );
        }

        for i in 0..self.opts.num_workers {
            let sid = i as u32 + 1;
            let orch = self.clone();
            handles.push(
                thread::Builder::new()
                    .name(format!("worker-{}", sid))
                    .spawn(move || orch.worker_loop(sid))
                    .expect("failed to spawn worker"),
            );
        }

        handles
    }

    /// True once the ingress queue is empty and every worker has finished
    /// and parked.
    pub fn drained(&self) -> bool {
        self.ingress.is_empty()
            && (1..self.total_threads() as u32).all(|sid| {
                self.worker_work[sid as usize]
                    .num_requests
                    .load(Ordering::Acquire)
                    == 0
                    && match &self.prio_table {
                        Some(table) => table.is_idle(sid),
                        None => self.thread_wait.as_ref().unwrap().is_idle(sid),
                    }
            })
    }

    /// Cooperative shutdown. The load generator exits first: a worker
    /// exiting earlier would trip the generator's idle-table check. The
    /// workers are then nudged runnable until all of them observe the
    /// exit flag.
    pub fn terminate(&self, handles: Vec<JoinHandle<()>>) {
        self.exit[LOAD_GENERATOR_SID as usize].store(true, Ordering::Release);
        while self.num_exited.load(Ordering::Acquire) < 1 {
            thread::yield_now();
        }

        for sid in 1..self.total_threads() {
            self.exit[sid].store(true, Ordering::Release);
        }
        while self.num_exited.load(Ordering::Acquire) < self.total_threads() {
            for i in 0..self.opts.num_workers {
                let sid = i as u32 + 1;
                match &self.prio_table {
                    Some(table) => table.mark_runnable(sid),
                    None => self.thread_wait.as_ref().unwrap().mark_runnable(sid),
                }
            }
            thread::yield_now();
        }

        for handle in handles {
            handle.join().expect("orchestrator thread panicked");
        }
    }

    pub fn results(&self) -> Vec<Request> {
        let mut all = Vec::new();
        for per_sid in &self.results {
            all.extend(per_sid.lock().unwrap().iter().cloned());
        }
        all
    }

    pub fn print_results(&self, runtime: Duration) {
        let results = self.results();
        if results.is_empty() {
            println!("no requests processed in {:.2}s", runtime.as_secs_f64());
            return;
        }

        let micros = |d: Duration| d.as_secs_f64() * 1e6;
        let mut waits: Vec<f64> = results
            .iter()
            .map(|r| micros(r.started.unwrap() - r.assigned.unwrap()))
            .collect();
        let mut services: Vec<f64> = results
            .iter()
            .map(|r| micros(r.finished.unwrap() - r.started.unwrap()))
            .collect();
        waits.sort_by(|a, b| a.total_cmp(b));
        services.sort_by(|a, b| a.total_cmp(b));

        let mean = |v: &[f64]| v.iter().sum::<f64>() / v.len() as f64;
        let p99 = |v: &[f64]| v[(v.len() - 1) * 99 / 100];

        println!(
            "{} requests in {:.2}s ({:.0} req/s)",
            results.len(),
            runtime.as_secs_f64(),
            results.len() as f64 / runtime.as_secs_f64()
        );
        println!(
            "assignment -> start: mean {:.1}us p99 {:.1}us",
            mean(&waits),
            p99(&waits)
        );
        println!(
            "start -> finish:     mean {:.1}us p99 {:.1}us",
            mean(&services),
            p99(&services)
        );
    }
}

pub fn ingress_channel(capacity: usize) -> (Sender<Request>, Receiver<Request>) {
    channel::bounded(capacity)
}

/// Closed-loop benchmark: fill the ingress queue, run the pool dry, shut
/// down, report latencies.
pub fn run_bench(opts: DispatchOpts, nr_requests: u64, request_work_ns: u64) -> Result<()> {
    let (tx, rx) = ingress_channel(INGRESS_CAPACITY);
    let orchestrator = Arc::new(Orchestrator::new(opts, rx));

    info!(
        "dispatching {} requests ({}ns each) to {} workers, batch {}",
        nr_requests,
        request_work_ns,
        orchestrator.opts().num_workers,
        orchestrator.opts().batch
    );

    let start = Instant::now();
    let handles = orchestrator.start();

    for id in 0..nr_requests {
        tx.send(Request::new(id, request_work_ns))?;
    }

    while !orchestrator.drained() {
        thread::sleep(Duration::from_micros(50));
    }
    orchestrator.terminate(handles);
    orchestrator.print_results(start.elapsed());

    Ok(())
}
