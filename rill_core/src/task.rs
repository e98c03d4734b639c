use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    Pending = 0,
    Running = 1,
    Completed = 2,
}

/// Synchronisation record behind a Future value. The spawning side moves the
/// task Pending -> Running with a compare-and-swap, publishes the result
/// under the mutex and signals the condvar; awaiters block on the condvar
/// until Completed.
#[derive(Debug)]
pub struct Task {
    state: AtomicU8,
    result: Mutex<Option<Value>>,
    done: Condvar,
}

pub type TaskRef = Arc<Task>;

impl Task {
    pub fn new() -> TaskRef {
        Arc::new(Task {
            state: AtomicU8::new(TaskState::Pending as u8),
            result: Mutex::new(None),
            done: Condvar::new(),
        })
    }

    pub fn state(&self) -> TaskState {
        match self.state.load(Ordering::Acquire) {
            0 => TaskState::Pending,
            1 => TaskState::Running,
            _ => TaskState::Completed,
        }
    }

    /// Claim the task for execution. Returns false if another runner already
    /// started it; a second attempt is a no-op.
    pub fn try_start(&self) -> bool {
        self.state
            .compare_exchange(
                TaskState::Pending as u8,
                TaskState::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub fn complete(&self, value: Value) {
        let mut result = self.result.lock();
        *result = Some(value);
        self.state
            .store(TaskState::Completed as u8, Ordering::Release);
        self.done.notify_all();
    }

    pub fn is_completed(&self) -> bool {
        self.state() == TaskState::Completed
    }

    /// Block until the task completes and return its result.
    pub fn wait(&self) -> Value {
        let mut result = self.result.lock();
        while self.state.load(Ordering::Acquire) != TaskState::Completed as u8 {
            self.done.wait(&mut result);
        }
        result.clone().unwrap_or(Value::Null)
    }
}
