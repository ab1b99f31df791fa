// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Futex-per-worker wait: one 32-bit word per thread, 0 = idle,
//! 1 = runnable. The futex linearizes arm/wake, so the dispatcher needs no
//! idle double-check on this path.

use std::sync::atomic::{AtomicU32, Ordering};

pub(crate) fn futex_wait(addr: &AtomicU32, val: u32) {
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            addr.as_ptr(),
            libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
            val,
            std::ptr::null::<libc::timespec>(),
        );
    }
}

pub(crate) fn futex_wake(addr: &AtomicU32, nr: i32) {
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            addr.as_ptr(),
            libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
            nr,
        );
    }
}

pub struct ThreadWait {
    runnable: Vec<AtomicU32>,
}

impl ThreadWait {
    pub fn new(num_threads: usize) -> Self {
        Self {
            runnable: (0..num_threads).map(|_| AtomicU32::new(0)).collect(),
        }
    }

    pub fn mark_runnable(&self, sid: u32) {
        let word = &self.runnable[sid as usize];
        word.store(1, Ordering::Release);
        futex_wake(word, 1);
    }

    /// Does not block; only `wait_until_runnable` does.
    pub fn mark_idle(&self, sid: u32) {
        self.runnable[sid as usize].store(0, Ordering::Release);
    }

    pub fn is_idle(&self, sid: u32) -> bool {
        self.runnable[sid as usize].load(Ordering::Acquire) == 0
    }

    pub fn wait_until_runnable(&self, sid: u32) {
        let word = &self.runnable[sid as usize];
        loop {
            let val = word.load(Ordering::Acquire);
            if val == 1 {
                return;
            }
            futex_wait(word, val);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn starts_idle() {
        let tw = ThreadWait::new(2);
        assert!(tw.is_idle(0));
        assert!(tw.is_idle(1));
    }

    #[test]
    fn wake_crosses_threads() {
        let tw = Arc::new(ThreadWait::new(2));
        let waiter = {
            let tw = tw.clone();
            thread::spawn(move || tw.wait_until_runnable(1))
        };
        tw.mark_runnable(1);
        waiter.join().unwrap();
        assert!(!tw.is_idle(1));

        tw.mark_idle(1);
        assert!(tw.is_idle(1));
    }
}
