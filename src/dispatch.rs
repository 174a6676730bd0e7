// Copyright 2022 Matthew Ingwersen.
//
// Licensed under the Apache License, Version 2.0 (the "License"); you
// may not use this file except in compliance with the License. You may
// obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or
// implied. See the License for the specific language governing
// permissions and limitations under the License.

//! The maintenance work queue.
//!
//! Several database clean-up operations cannot run on the caller's
//! thread without violating the lock acquisition order (for example,
//! pruning a chain of newly empty tree nodes whose lock shards differ
//! from the caller's). The [`Dispatcher`] provides a place to put such
//! work: a bounded queue drained by one permanent worker thread.
//! [`Dispatcher::schedule`] returns immediately; the scheduled task
//! runs later, on the worker.
//!
//! Tasks must be idempotent and tolerant of the world having changed by
//! the time they run — the queue provides no cancellation, and the
//! database retries or abandons work that has become moot.

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use log::{debug, error};

/// A unit of deferred maintenance work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// The default capacity of a [`Dispatcher`]'s queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

////////////////////////////////////////////////////////////////////////
// DISPATCHER                                                         //
////////////////////////////////////////////////////////////////////////

/// A bounded work queue drained by a single permanent worker thread.
///
/// Dropping the `Dispatcher` initiates shutdown: already-queued tasks
/// are drained, new submissions are refused, and the worker thread is
/// joined.
pub struct Dispatcher {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

struct Shared {
    records: Mutex<Records>,

    /// Wakes the worker when a task is queued and when shutdown is
    /// initiated. Used with the `records` mutex.
    task_wakeup: Condvar,
}

struct Records {
    queue: VecDeque<Task>,
    capacity: usize,
    shutting_down: bool,
}

impl Dispatcher {
    /// Creates a new `Dispatcher` with the default queue capacity and
    /// starts its worker thread.
    pub fn new() -> Result<Self, Error> {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    /// Creates a new `Dispatcher` whose queue holds at most `capacity`
    /// tasks and starts its worker thread.
    pub fn with_capacity(capacity: usize) -> Result<Self, Error> {
        let shared = Arc::new(Shared {
            records: Mutex::new(Records {
                queue: VecDeque::new(),
                capacity,
                shutting_down: false,
            }),
            task_wakeup: Condvar::new(),
        });
        let worker_shared = shared.clone();
        let worker = thread::Builder::new()
            .name("maintenance worker".to_owned())
            .spawn(move || worker_loop(worker_shared))?;
        Ok(Self {
            shared,
            worker: Some(worker),
        })
    }

    /// Queues `task` for execution on the worker thread and returns
    /// immediately.
    ///
    /// This fails if the queue is full or the `Dispatcher` is shutting
    /// down; callers are expected to fall back to performing the
    /// maintenance synchronously (or to abandon it, if it will be
    /// retried anyway).
    pub fn schedule<F>(&self, task: F) -> Result<(), Error>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut records = self.shared.records.lock().unwrap();
        if records.shutting_down {
            Err(Error::ShuttingDown)
        } else if records.queue.len() >= records.capacity {
            Err(Error::QueueFull)
        } else {
            records.queue.push_back(Box::new(task));
            self.shared.task_wakeup.notify_one();
            Ok(())
        }
    }

    /// Returns the number of tasks currently queued.
    pub fn backlog(&self) -> usize {
        self.shared.records.lock().unwrap().queue.len()
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        {
            let mut records = self.shared.records.lock().unwrap();
            records.shutting_down = true;
            self.shared.task_wakeup.notify_all();
        }
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("maintenance worker panicked");
            }
        }
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("backlog", &self.backlog())
            .finish()
    }
}

/// The get task/run task loop for the worker thread. Shutdown drains
/// the queue before exiting, so no scheduled maintenance is lost.
fn worker_loop(shared: Arc<Shared>) {
    debug!("maintenance worker started");
    loop {
        let mut records = shared.records.lock().unwrap();
        let task = loop {
            if let Some(task) = records.queue.pop_front() {
                break task;
            } else if records.shutting_down {
                debug!("maintenance worker exiting");
                return;
            }
            records = shared.task_wakeup.wait(records).unwrap();
        };
        drop(records);
        task();
    }
}

////////////////////////////////////////////////////////////////////////
// ERRORS                                                             //
////////////////////////////////////////////////////////////////////////

/// An error type for [`Dispatcher`] operations.
#[derive(Debug)]
pub enum Error {
    /// An OS-level error occurred during the creation of the worker
    /// thread.
    Io(io::Error),

    /// The queue is at capacity.
    QueueFull,

    /// The [`Dispatcher`] is shutting down.
    ShuttingDown,
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Io(err) => err.fmt(f),
            Self::QueueFull => f.write_str("the maintenance queue is full"),
            Self::ShuttingDown => f.write_str("the dispatcher is shutting down"),
        }
    }
}

impl std::error::Error for Error {}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Condvar, Mutex};
    use std::time::Duration;

    use super::*;

    #[test]
    fn scheduled_tasks_run() {
        let ran = Arc::new((Mutex::new(0), Condvar::new()));
        let dispatcher = Dispatcher::new().unwrap();
        for _ in 0..4 {
            let ran = ran.clone();
            dispatcher
                .schedule(move || {
                    let (count, wakeup) = &*ran;
                    *count.lock().unwrap() += 1;
                    wakeup.notify_all();
                })
                .unwrap();
        }
        let (count, wakeup) = &*ran;
        let guard = count.lock().unwrap();
        let (guard, result) = wakeup
            .wait_timeout_while(guard, Duration::from_secs(10), |n| *n < 4)
            .unwrap();
        assert!(!result.timed_out());
        assert_eq!(*guard, 4);
    }

    #[test]
    fn shutdown_drains_the_queue() {
        let ran = Arc::new(AtomicUsize::new(0));
        let dispatcher = Dispatcher::new().unwrap();
        for _ in 0..16 {
            let ran = ran.clone();
            dispatcher
                .schedule(move || {
                    ran.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }
        drop(dispatcher);
        assert_eq!(ran.load(Ordering::SeqCst), 16);
    }

    #[test]
    fn full_queue_refuses_tasks() {
        let dispatcher = Dispatcher::with_capacity(1).unwrap();
        let gate = Arc::new((Mutex::new(false), Condvar::new()));

        // Park the worker on the first task so the queue stays full.
        let parked = gate.clone();
        dispatcher
            .schedule(move || {
                let (open, wakeup) = &*parked;
                let guard = open.lock().unwrap();
                let _guard = wakeup
                    .wait_timeout_while(guard, Duration::from_secs(10), |open| !*open)
                    .unwrap();
            })
            .unwrap();

        // One task fits in the queue; the next must be refused.
        let mut refused = false;
        for _ in 0..2 {
            if matches!(dispatcher.schedule(|| ()), Err(Error::QueueFull)) {
                refused = true;
                break;
            }
        }
        assert!(refused);

        let (open, wakeup) = &*gate;
        *open.lock().unwrap() = true;
        wakeup.notify_all();
    }
}
