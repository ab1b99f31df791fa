// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::io::Write;
use std::thread::sleep;
use std::time::Duration;

use anyhow::Result;
use log::info;
use scx_stats::prelude::*;
use scx_stats_derive::stat_doc;
use scx_stats_derive::Stats;
use serde::Deserialize;
use serde::Serialize;

#[stat_doc]
#[derive(Clone, Debug, Default, Serialize, Deserialize, Stats)]
#[stat(top)]
pub struct Metrics {
    #[stat(desc = "Number of CPUs in the enclave")]
    pub nr_cpus: u64,
    #[stat(desc = "Amount of tasks currently known to the scheduler")]
    pub nr_tasks: u64,
    #[stat(desc = "Number of new-task messages handled")]
    pub nr_task_new: u64,
    #[stat(desc = "Number of tasks placed on a CPU's run queue")]
    pub nr_migrations: u64,
    #[stat(desc = "Number of commits that changed the on-cpu task")]
    pub nr_switches: u64,
    #[stat(desc = "Number of successful run-request commits")]
    pub nr_commits: u64,
    #[stat(desc = "Number of commits dropped on a stale agent barrier")]
    pub nr_commit_failures: u64,
    #[stat(desc = "Number of granularity-driven preemption flags armed")]
    pub nr_preemptions: u64,
    #[stat(desc = "Number of local yields back to the kernel")]
    pub nr_local_yields: u64,
    #[stat(desc = "Number of CPU tick messages handled")]
    pub nr_ticks: u64,
    #[stat(desc = "Number of dead-task messages handled")]
    pub nr_task_dead: u64,
}

impl Metrics {
    fn format<W: Write>(&self, w: &mut W) -> Result<()> {
        writeln!(
            w,
            "[fairland] tasks -> {:>3}/{:<2} | commit -> ok: {:<5} stale: {:<5} sw: {:<5} | preempt: {:<5} yield: {:<5} tick: {:<5}",
            self.nr_tasks,
            self.nr_cpus,
            self.nr_commits,
            self.nr_commit_failures,
            self.nr_switches,
            self.nr_preemptions,
            self.nr_local_yields,
            self.nr_ticks,
        )?;
        Ok(())
    }

    fn delta(&self, rhs: &Self) -> Self {
        Self {
            nr_task_new: self.nr_task_new - rhs.nr_task_new,
            nr_migrations: self.nr_migrations - rhs.nr_migrations,
            nr_switches: self.nr_switches - rhs.nr_switches,
            nr_commits: self.nr_commits - rhs.nr_commits,
            nr_commit_failures: self.nr_commit_failures - rhs.nr_commit_failures,
            nr_preemptions: self.nr_preemptions - rhs.nr_preemptions,
            nr_local_yields: self.nr_local_yields - rhs.nr_local_yields,
            nr_ticks: self.nr_ticks - rhs.nr_ticks,
            nr_task_dead: self.nr_task_dead - rhs.nr_task_dead,
            ..self.clone()
        }
    }
}

pub fn server_data() -> StatsServerData<(), Metrics> {
    let open: Box<dyn StatsOpener<(), Metrics>> = Box::new(move |(req_ch, res_ch)| {
        req_ch.send(())?;
        let mut prev = res_ch.recv()?;

        let read: Box<dyn StatsReader<(), Metrics>> = Box::new(move |_args, (req_ch, res_ch)| {
            req_ch.send(())?;
            let cur = res_ch.recv()?;
            let delta = cur.delta(&prev);
            prev = cur;
            delta.to_json()
        });

        Ok(read)
    });

    StatsServerData::new()
        .add_meta(Metrics::meta())
        .add_ops("top", StatsOps { open, close: None })
}

/// Poll the stats server and print one formatted line per interval.
pub fn monitor(intv: Duration) -> Result<()> {
    loop {
        let mut client = match StatsClient::new().connect(None) {
            Ok(client) => client,
            Err(_) => {
                info!("stats server not available, retrying...");
                sleep(Duration::from_secs(1));
                continue;
            }
        };

        loop {
            match client.request::<Metrics>("stats", vec![]) {
                Ok(metrics) => {
                    metrics.format(&mut std::io::stdout())?;
                    sleep(intv);
                }
                Err(_) => {
                    sleep(Duration::from_secs(1));
                    break;
                }
            }
        }
    }
}
