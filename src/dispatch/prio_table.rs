// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Shared priority table: the coordinator communicates runnable state to
//! the scheduling side through `sched_item` entries, one per thread, plus
//! a table of work classes.
//!
//! Write order is part of the contract: payload fields (deadline) are
//! stored before the RUNNABLE flag is set with release ordering, so a
//! reader that observes the flag sees a fully-populated item.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use super::thread_wait::{futex_wait, futex_wake};

pub const WORK_CLASS_ONESHOT: u32 = 1 << 0;
pub const SCHED_ITEM_RUNNABLE: u32 = 1 << 0;

#[derive(Debug, Clone, Copy)]
pub struct WorkClass {
    pub id: u32,
    pub flags: u32,
    pub qos: u32,
    /// Nominal execution time, only meaningful to EDF variants.
    pub exectime: u64,
    /// Zero: every item in this class is a one-shot.
    pub period: u64,
}

pub struct SchedItem {
    pub sid: u32,
    pub wcid: u32,
    pub gpid: u64,
    flags: AtomicU32,
    /// Raw monotonic deadline, only meaningful to EDF variants.
    deadline: AtomicU64,
}

pub struct PrioTable {
    items: Vec<SchedItem>,
    work_classes: Vec<WorkClass>,
}

impl PrioTable {
    pub fn new(num_sched_items: usize) -> Self {
        Self {
            items: (0..num_sched_items)
                .map(|sid| SchedItem {
                    sid: sid as u32,
                    wcid: 0,
                    gpid: 0,
                    flags: AtomicU32::new(0),
                    deadline: AtomicU64::new(0),
                })
                .collect(),
            work_classes: Vec::new(),
        }
    }

    pub fn set_work_class(&mut self, wc: WorkClass) {
        self.work_classes.push(wc);
    }

    pub fn work_class(&self, id: u32) -> &WorkClass {
        &self.work_classes[id as usize]
    }

    pub fn init_sched_item(&mut self, sid: u32, wcid: u32, gpid: u64) {
        let item = &mut self.items[sid as usize];
        item.wcid = wcid;
        item.gpid = gpid;
        item.flags = AtomicU32::new(0);
        item.deadline = AtomicU64::new(0);
    }

    pub fn sched_item(&self, sid: u32) -> &SchedItem {
        &self.items[sid as usize]
    }

    /// Payload write; must precede `mark_runnable` for the same item.
    pub fn set_deadline(&self, sid: u32, deadline: u64) {
        self.items[sid as usize]
            .deadline
            .store(deadline, Ordering::Relaxed);
    }

    pub fn deadline(&self, sid: u32) -> u64 {
        self.items[sid as usize].deadline.load(Ordering::Relaxed)
    }

    pub fn mark_runnable(&self, sid: u32) {
        let flags = &self.items[sid as usize].flags;
        flags.fetch_or(SCHED_ITEM_RUNNABLE, Ordering::Release);
        futex_wake(flags, 1);
    }

    pub fn mark_idle(&self, sid: u32) {
        self.items[sid as usize]
            .flags
            .fetch_and(!SCHED_ITEM_RUNNABLE, Ordering::Release);
    }

    pub fn is_idle(&self, sid: u32) -> bool {
        self.items[sid as usize].flags.load(Ordering::Acquire) & SCHED_ITEM_RUNNABLE == 0
    }

    pub fn wait_until_runnable(&self, sid: u32) {
        let flags = &self.items[sid as usize].flags;
        loop {
            let val = flags.load(Ordering::Acquire);
            if val & SCHED_ITEM_RUNNABLE != 0 {
                return;
            }
            futex_wait(flags, val);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn items_start_idle() {
        let table = PrioTable::new(3);
        for sid in 0..3 {
            assert!(table.is_idle(sid));
        }
    }

    #[test]
    fn runnable_flag_round_trip() {
        let mut table = PrioTable::new(2);
        table.set_work_class(WorkClass {
            id: 0,
            flags: WORK_CLASS_ONESHOT,
            qos: 2,
            exectime: 100,
            period: 0,
        });
        table.init_sched_item(1, 0, 41);

        table.set_deadline(1, 12_345);
        table.mark_runnable(1);
        assert!(!table.is_idle(1));
        // A reader that saw the flag sees the payload.
        assert_eq!(table.deadline(1), 12_345);
        assert_eq!(table.sched_item(1).gpid, 41);

        table.mark_idle(1);
        assert!(table.is_idle(1));
    }
}
