//! Fixed-size worker pool for callback dispatch.
//!
//! Tasks run in FIFO order on at most `size` threads. Workers are spawned
//! lazily as work arrives and none is idle.

use std::collections::VecDeque;
use std::io;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, warn};

use crate::error::{Error, Result};

type Task = Box<dyn FnOnce() + Send + 'static>;

type WorkerBody = Box<dyn FnOnce() + Send + 'static>;

type Spawner = Box<dyn Fn(String, WorkerBody) -> io::Result<JoinHandle<()>> + Send + Sync>;

#[derive(Default)]
struct PoolState {
    queue: VecDeque<Task>,
    idle: usize,
    spawned: usize,
    accepting: bool,
}

struct Shared {
    state: Mutex<PoolState>,
    available: Condvar,
}

/// A bounded pool of worker threads.
pub struct TaskPool {
    name: String,
    size: usize,
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    spawner: Spawner,
}

impl std::fmt::Debug for TaskPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("TaskPool")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("spawned", &state.spawned)
            .field("queued", &state.queue.len())
            .finish()
    }
}

impl TaskPool {
    /// Create a pool that runs at most `size` tasks at once.
    pub fn new(name: impl Into<String>, size: usize) -> Self {
        Self::with_spawner(
            name,
            size,
            Box::new(|name: String, body: WorkerBody| {
                thread::Builder::new().name(name).spawn(body)
            }),
        )
    }

    pub(crate) fn with_spawner(name: impl Into<String>, size: usize, spawner: Spawner) -> Self {
        Self {
            name: name.into(),
            size: size.max(1),
            shared: Arc::new(Shared {
                state: Mutex::new(PoolState {
                    accepting: true,
                    ..Default::default()
                }),
                available: Condvar::new(),
            }),
            workers: Mutex::new(Vec::new()),
            spawner,
        }
    }

    /// Queue a task.
    ///
    /// Returns an error, and gives up on the task, if the pool is shut
    /// down or no worker exists and none could be spawned.
    pub fn submit(&self, task: impl FnOnce() + Send + 'static) -> Result<()> {
        let mut state = self.shared.state.lock();
        if !state.accepting {
            return Err(Error::TaskPool(format!("{} is shut down", self.name)));
        }
        state.queue.push_back(Box::new(task));

        if state.idle == 0 && state.spawned < self.size {
            let index = state.spawned;
            let shared = Arc::clone(&self.shared);
            match (self.spawner)(
                format!("{}-{}", self.name, index),
                Box::new(move || worker_loop(shared)),
            ) {
                Ok(handle) => {
                    state.spawned += 1;
                    self.workers.lock().push(handle);
                    debug!("{} spawned worker {}", self.name, index);
                }
                Err(e) if state.spawned == 0 => {
                    state.queue.pop_back();
                    return Err(Error::TaskPool(format!(
                        "{} could not spawn a worker: {}",
                        self.name, e
                    )));
                }
                Err(e) => {
                    warn!(
                        "{} could not grow past {} workers: {}",
                        self.name, state.spawned, e
                    );
                }
            }
        }

        self.shared.available.notify_one();
        Ok(())
    }

    /// Stop accepting work, drop queued tasks and join every worker.
    ///
    /// Returns the number of tasks that were dropped without running.
    /// A worker calling this does not wait for itself.
    pub fn shutdown(&self) -> usize {
        let discarded = {
            let mut state = self.shared.state.lock();
            state.accepting = false;
            let n = state.queue.len();
            state.queue.clear();
            n
        };
        self.shared.available.notify_all();

        let handles = std::mem::take(&mut *self.workers.lock());
        let me = thread::current().id();
        for handle in handles {
            if handle.thread().id() == me {
                continue;
            }
            if handle.join().is_err() {
                error!("{} worker exited with a panic", self.name);
            }
        }
        if discarded > 0 {
            debug!("{} discarded {} queued tasks", self.name, discarded);
        }
        discarded
    }

    /// Whether new work is accepted.
    pub fn is_accepting(&self) -> bool {
        self.shared.state.lock().accepting
    }

    /// Number of worker threads spawned so far.
    pub fn worker_count(&self) -> usize {
        self.shared.state.lock().spawned
    }

    /// Maximum number of workers.
    pub fn size(&self) -> usize {
        self.size
    }
}

fn worker_loop(shared: Arc<Shared>) {
    let mut state = shared.state.lock();
    loop {
        if let Some(task) = state.queue.pop_front() {
            drop(state);
            if catch_unwind(AssertUnwindSafe(task)).is_err() {
                error!("Task panicked on {:?}", thread::current().name());
            }
            state = shared.state.lock();
        } else if !state.accepting {
            break;
        } else {
            state.idle += 1;
            shared.available.wait(&mut state);
            state.idle -= 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_runs_tasks_in_order_on_one_worker() {
        let pool = TaskPool::new("test-pool", 1);
        let (tx, rx) = mpsc::channel();
        for i in 0..5 {
            let tx = tx.clone();
            pool.submit(move || tx.send(i).unwrap()).unwrap();
        }
        let got: Vec<i32> = (0..5)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        assert_eq!(got, vec![0, 1, 2, 3, 4]);
        assert_eq!(pool.worker_count(), 1);
        pool.shutdown();
    }

    #[test]
    fn test_never_exceeds_size() {
        let pool = TaskPool::new("bounded", 2);
        let (tx, rx) = mpsc::channel();
        for _ in 0..10 {
            let tx = tx.clone();
            pool.submit(move || {
                thread::sleep(Duration::from_millis(5));
                tx.send(()).unwrap();
            })
            .unwrap();
        }
        for _ in 0..10 {
            rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        assert!(pool.worker_count() <= 2);
        pool.shutdown();
    }

    #[test]
    fn test_shutdown_discards_unstarted_tasks() {
        let pool = TaskPool::new("discard", 1);
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let ran = Arc::new(AtomicUsize::new(0));

        pool.submit(move || {
            started_tx.send(()).unwrap();
            let _ = release_rx.recv();
        })
        .unwrap();
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        for _ in 0..3 {
            let ran = Arc::clone(&ran);
            pool.submit(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            release_tx.send(()).unwrap();
        });
        assert_eq!(pool.shutdown(), 3);
        releaser.join().unwrap();

        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert!(!pool.is_accepting());
        assert!(pool.submit(|| {}).is_err());
        // idempotent
        assert_eq!(pool.shutdown(), 0);
    }

    #[test]
    fn test_spawn_failure_without_workers_is_reported() {
        let pool = TaskPool::with_spawner(
            "broken",
            2,
            Box::new(|_: String, _: WorkerBody| -> io::Result<JoinHandle<()>> {
                Err(io::Error::other("no threads"))
            }),
        );
        let err = pool.submit(|| {}).unwrap_err();
        assert!(err.to_string().contains("could not spawn"));
        assert_eq!(pool.worker_count(), 0);
    }

    #[test]
    fn test_spawn_failure_with_worker_keeps_task() {
        let spawned = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&spawned);
        let pool = TaskPool::with_spawner(
            "flaky",
            4,
            Box::new(move |name: String, body: WorkerBody| {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    thread::Builder::new().name(name).spawn(body)
                } else {
                    Err(io::Error::other("no more threads"))
                }
            }),
        );

        let (tx, rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        pool.submit(move || {
            let _ = release_rx.recv();
        })
        .unwrap();
        // the only worker is busy, growing fails, the task waits its turn
        pool.submit(move || tx.send(()).unwrap()).unwrap();
        release_tx.send(()).unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(pool.worker_count(), 1);
        pool.shutdown();
    }

    #[test]
    fn test_panicking_task_does_not_kill_worker() {
        let pool = TaskPool::new("panicky", 1);
        let (tx, rx) = mpsc::channel();
        pool.submit(|| panic!("boom")).unwrap();
        pool.submit(move || tx.send(()).unwrap()).unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        pool.shutdown();
    }
}
