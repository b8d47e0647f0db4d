//! Tick-based task scheduling.
//!
//! [`TaskScheduler`] is the host's deferred-work facility. [`TickScheduler`] implements it on
//! top of a tick counter driven by whoever owns the main loop: every call to
//! [`TickScheduler::tick`] decrements pending delays and runs what is due, on the calling thread.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::error;

/// One-shot job.
pub type Task = Box<dyn FnOnce() + Send>;

/// Repeating job. Returning [`TaskControl::Stop`] cancels it.
pub type RepeatingTask = Box<dyn FnMut() -> TaskControl + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskControl {
    Continue,
    Stop,
}

/// Cancel handle for a scheduled task.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    id: u64,
    cancelled: Arc<AtomicBool>,
}

impl TaskHandle {
    fn new(id: u64) -> Self {
        Self {
            id,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

impl PartialEq for TaskHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TaskHandle {}

pub trait TaskScheduler: Send + Sync {
    /// Run once after `delay_ticks` (0 = next tick).
    fn run_later(&self, delay_ticks: u64, task: Task) -> TaskHandle;

    /// Run after `delay_ticks`, then every `period_ticks` until stopped or cancelled.
    fn run_repeating(&self, delay_ticks: u64, period_ticks: u64, task: RepeatingTask) -> TaskHandle;

    /// Run on the main (tick) thread as soon as possible.
    fn run_on_main(&self, task: Task) -> TaskHandle {
        self.run_later(0, task)
    }
}

enum Job {
    Once(Task),
    Repeating(RepeatingTask),
}

struct ScheduledTask {
    handle: TaskHandle,
    remaining_ticks: u64,
    /// `None` = one-shot, `Some(n)` = repeating every `n` ticks.
    interval: Option<u64>,
    job: Job,
}

/// In-process [`TaskScheduler`] driven by [`tick`](TickScheduler::tick).
#[derive(Default)]
pub struct TickScheduler {
    tasks: Mutex<Vec<ScheduledTask>>,
    next_id: AtomicU64,
    current_tick: AtomicU64,
}

impl TickScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current_tick(&self) -> u64 {
        self.current_tick.load(Ordering::Relaxed)
    }

    /// Pending (not yet cancelled) tasks.
    pub fn pending(&self) -> usize {
        self.tasks
            .lock()
            .map(|t| t.iter().filter(|t| !t.handle.is_cancelled()).count())
            .unwrap_or(0)
    }

    fn schedule(&self, delay_ticks: u64, interval: Option<u64>, job: Job) -> TaskHandle {
        let handle = TaskHandle::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let task = ScheduledTask {
            handle: handle.clone(),
            remaining_ticks: delay_ticks,
            interval,
            job,
        };
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.push(task);
        }
        handle
    }

    /// Advance one tick and run every task that became due.
    pub fn tick(&self) {
        self.current_tick.fetch_add(1, Ordering::Relaxed);

        // Collect due tasks first; jobs may schedule new work.
        let due: Vec<ScheduledTask> = {
            let Ok(mut tasks) = self.tasks.lock() else {
                return;
            };
            let mut due = Vec::new();
            for mut task in std::mem::take(&mut *tasks) {
                if task.handle.is_cancelled() {
                    continue;
                }
                if task.remaining_ticks > 0 {
                    task.remaining_ticks -= 1;
                }
                if task.remaining_ticks == 0 {
                    due.push(task);
                } else {
                    tasks.push(task);
                }
            }
            due
        };

        for task in due {
            let ScheduledTask {
                handle,
                interval,
                job,
                ..
            } = task;
            if handle.is_cancelled() {
                continue;
            }
            match job {
                Job::Once(job) => {
                    if catch_unwind(AssertUnwindSafe(job)).is_err() {
                        error!("Scheduled task {} panicked", handle.id);
                    }
                }
                Job::Repeating(mut job) => {
                    let control = match catch_unwind(AssertUnwindSafe(&mut job)) {
                        Ok(control) => control,
                        Err(_) => {
                            error!("Repeating task {} panicked, cancelling", handle.id);
                            TaskControl::Stop
                        }
                    };
                    if control == TaskControl::Continue && !handle.is_cancelled() {
                        let task = ScheduledTask {
                            handle,
                            remaining_ticks: interval.unwrap_or(1).max(1),
                            interval,
                            job: Job::Repeating(job),
                        };
                        if let Ok(mut tasks) = self.tasks.lock() {
                            tasks.push(task);
                        }
                    }
                }
            }
        }
    }
}

impl TaskScheduler for TickScheduler {
    fn run_later(&self, delay_ticks: u64, task: Task) -> TaskHandle {
        self.schedule(delay_ticks, None, Job::Once(task))
    }

    fn run_repeating(&self, delay_ticks: u64, period_ticks: u64, task: RepeatingTask) -> TaskHandle {
        self.schedule(delay_ticks, Some(period_ticks), Job::Repeating(task))
    }
}
