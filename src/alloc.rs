// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Thread-safe task arena. Tasks are created when the kernel announces
//! them and freed exactly once when their Done state has been handled.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::enclave::StatusWord;
use crate::task::{Gtid, Task};

#[derive(Default)]
pub struct TaskAllocator {
    tasks: Mutex<HashMap<Gtid, Arc<Task>>>,
}

impl TaskAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the record for a task first seen via TaskNew.
    pub fn create_task(&self, gtid: Gtid, status_word: Arc<dyn StatusWord>) -> Arc<Task> {
        let task = Arc::new(Task::new(gtid, status_word));
        let prev = self.tasks.lock().unwrap().insert(gtid, task.clone());
        assert!(prev.is_none(), "[{}] created twice", gtid);
        task
    }

    pub fn get_task(&self, gtid: Gtid) -> Option<Arc<Task>> {
        self.tasks.lock().unwrap().get(&gtid).cloned()
    }

    /// Return the slot to the arena. Freeing a task that was never
    /// allocated (or already freed) is a bug.
    pub fn free_task(&self, task: &Arc<Task>) {
        let prev = self.tasks.lock().unwrap().remove(&task.gtid);
        assert!(prev.is_some(), "[{}] freed twice", task.gtid);
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.lock().unwrap().is_empty()
    }
}
