//! A fixed-size worker pool executing range-partitioned tasks.
//!
//! Every task `t` occupies a contiguous range of *work items* in a single,
//! global numbering. Workers claim work items one at a time with an atomic
//! cursor and translate each claimed item back to a chunk of the owning task:
//!
//! ```text
//!   start = (item - t.item_start) * t.granularity
//!   end   = min(start + t.granularity, t.size)
//! ```
//!
//! A worker that claims an item past the end of every queued task keeps the
//! claim and goes to sleep. The claim stays valid when more tasks are appended
//! because new tasks occupy the item numbers that follow. When a worker moves
//! past a task, it decrements the task's counter of remaining workers; the
//! worker that brings it to zero runs the task's completion callback.
//!
//! [`ThreadPool::barrier`] waits until every worker has moved past every task
//! and then rewinds the numbering.
use std::{
    cmp::min,
    ops::Range,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Condvar, Mutex, MutexGuard,
    },
    thread::JoinHandle,
};

use crate::error::RenderError;

/// A unit of parallel work.
pub trait Task: Send + Sync + 'static {
    /// Process the elements in `range`. `worker` is the index of the calling
    /// worker thread, which is less than [`ThreadPool::num_threads`].
    fn run(&self, range: Range<usize>, worker: usize);

    /// Called exactly once after all elements were processed if the task was
    /// started with `notify_finish = true`. Follow-up tasks can be enqueued
    /// through `spawner`.
    fn finished(&self, _spawner: &Spawner<'_>) {}
}

pub struct ThreadPool {
    shared: Arc<Shared>,
    threads: Vec<JoinHandle<()>>,
}

/// Enqueues tasks. Available to completion callbacks.
pub struct Spawner<'a> {
    shared: &'a Shared,
}

struct Shared {
    queue: Mutex<Queue>,
    cond: Condvar,
    /// The next work item to be claimed.
    cursor: AtomicUsize,
    max_tasks: usize,
}

struct Queue {
    tasks: Vec<TaskInfo>,
    /// The total number of work items of all tasks in `tasks`.
    num_items: usize,
    workers: Vec<WorkerState>,
    exit: bool,
}

struct TaskInfo {
    task: Arc<dyn Task>,
    /// The number of workers that haven't passed this task yet. Only
    /// meaningful if the task requested a completion callback.
    workers_left: usize,
    notify_finish: bool,
    items: Range<usize>,
    size: usize,
    granularity: usize,
}

#[derive(Debug, Clone, Copy)]
struct WorkerState {
    /// The index of the first task in `Queue::tasks` this worker hasn't passed.
    next_task: usize,
    /// Set by `barrier`. The worker must claim a new work item because the
    /// numbering was rewound.
    reset: bool,
    paused: bool,
}

impl Default for WorkerState {
    fn default() -> Self {
        Self {
            next_task: 0,
            // The first claim happens under the lock
            reset: true,
            paused: false,
        }
    }
}

/// A claimed task, held by a worker while it's processing the task.
struct Current {
    task: Arc<dyn Task>,
    items: Range<usize>,
    size: usize,
    granularity: usize,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl ThreadPool {
    /// Spawn `num_threads` worker threads.
    pub fn new(num_threads: usize, max_tasks: usize) -> Result<Self, RenderError> {
        assert!(num_threads > 0);

        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue {
                tasks: Vec::new(),
                num_items: 0,
                workers: vec![WorkerState::default(); num_threads],
                exit: false,
            }),
            cond: Condvar::new(),
            cursor: AtomicUsize::new(0),
            max_tasks,
        });

        let mut this = Self {
            shared,
            threads: Vec::with_capacity(num_threads),
        };

        for i in 0..num_threads {
            let shared = Arc::clone(&this.shared);
            let handle = std::thread::Builder::new()
                .name(format!("simdrast worker {}", i))
                .spawn(move || worker_main(&shared, i))
                .map_err(|e| RenderError::WorkerSpawn(e.to_string()))?;
            // If this fails, `Drop` stops the threads spawned so far
            this.threads.push(handle);
        }

        log::debug!("Started {} worker thread(s)", num_threads);

        Ok(this)
    }

    pub fn num_threads(&self) -> usize {
        self.threads.len()
    }

    /// Get a `Spawner` for enqueueing tasks.
    pub fn spawner(&self) -> Spawner<'_> {
        Spawner {
            shared: &self.shared,
        }
    }

    /// Enqueue a task. See [`Spawner::start_task`].
    pub fn start_task(
        &self,
        task: Arc<dyn Task>,
        size: usize,
        granularity: usize,
        notify_finish: bool,
    ) -> Result<(), RenderError> {
        self.spawner()
            .start_task(task, size, granularity, notify_finish)
    }

    /// Wait until all tasks, including the ones enqueued by completion
    /// callbacks, are complete, and then clear the task queue.
    ///
    /// All references to the tasks held by the pool are released when this
    /// method returns.
    pub fn barrier(&self) {
        drop(self.barrier_locked());
    }

    fn barrier_locked(&self) -> MutexGuard<'_, Queue> {
        let shared = &*self.shared;
        let mut q = lock(&shared.queue);
        while q.has_work_left() {
            q = shared.cond.wait(q).unwrap_or_else(|e| e.into_inner());
        }
        q.tasks.clear();
        q.num_items = 0;
        shared.cursor.store(0, Ordering::Relaxed);
        for w in q.workers.iter_mut() {
            w.next_task = 0;
            w.reset = true;
        }
        q
    }

    /// Wait for the completion of all tasks and pause every worker but the
    /// first one.
    pub fn single_threaded(&self) {
        // Pause them before they get a chance to claim a work item
        let mut q = self.barrier_locked();
        for w in q.workers.iter_mut().skip(1) {
            w.paused = true;
        }
    }

    /// Wait for the completion of all tasks and resume all workers.
    pub fn multi_threaded(&self) {
        let mut q = self.barrier_locked();
        for w in q.workers.iter_mut() {
            w.paused = false;
        }
        drop(q);
        self.shared.cond.notify_all();
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        lock(&self.shared.queue).exit = true;
        self.shared.cond.notify_all();
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
        log::debug!("Stopped the worker threads");
    }
}

impl Spawner<'_> {
    /// Enqueue a task processing `size` elements in chunks of `granularity`
    /// elements. If `notify_finish` is `true`, [`Task::finished`] is called
    /// once all chunks were processed.
    pub fn start_task(
        &self,
        task: Arc<dyn Task>,
        size: usize,
        granularity: usize,
        notify_finish: bool,
    ) -> Result<(), RenderError> {
        if granularity == 0 {
            return Err(RenderError::InvalidGranularity);
        }

        let shared = self.shared;
        let mut q = lock(&shared.queue);
        if q.tasks.len() >= shared.max_tasks {
            return Err(RenderError::TooManyTasks(shared.max_tasks));
        }

        let num_items = (size + granularity - 1) / granularity;
        let items = q.num_items..q.num_items + num_items;
        let workers_left = q.workers.iter().filter(|w| !w.paused).count();

        log::trace!(
            "Starting task #{}: {} element(s) in {} item(s)",
            q.tasks.len(),
            size,
            num_items
        );

        q.num_items = items.end;
        q.tasks.push(TaskInfo {
            task,
            workers_left,
            notify_finish,
            items,
            size,
            granularity,
        });
        drop(q);

        shared.cond.notify_all();
        Ok(())
    }
}

impl Queue {
    fn has_work_left(&self) -> bool {
        let num_tasks = self.tasks.len();
        self.workers
            .iter()
            .any(|w| !w.paused && w.next_task < num_tasks)
    }
}

fn worker_main(shared: &Shared, worker: usize) {
    let mut item = 0;
    let mut current: Option<Current> = None;

    loop {
        if let Some(cur) = &current {
            if cur.items.contains(&item) {
                let start = (item - cur.items.start) * cur.granularity;
                let end = min(start + cur.granularity, cur.size);
                cur.task.run(start..end, worker);
                item = shared.cursor.fetch_add(1, Ordering::Relaxed);
                continue;
            }
        }

        // Release the task before going idle so that `barrier` leaves no
        // references behind
        current = None;

        let mut q = lock(&shared.queue);
        let mut notify = true;
        loop {
            if q.exit {
                return;
            }

            if !q.workers[worker].paused {
                if q.workers[worker].reset {
                    q.workers[worker].reset = false;
                    item = shared.cursor.fetch_add(1, Ordering::Relaxed);
                }

                let next_task = q.workers[worker].next_task;
                if notify || next_task < q.tasks.len() {
                    q = pass_tasks(shared, q, worker, item);

                    let next_task = q.workers[worker].next_task;
                    if let Some(info) = q.tasks.get(next_task) {
                        current = Some(Current {
                            task: Arc::clone(&info.task),
                            items: info.items.clone(),
                            size: info.size,
                            granularity: info.granularity,
                        });
                        break;
                    }

                    // This worker has nothing to do. Wake up `barrier`.
                    shared.cond.notify_all();
                    notify = false;
                }
            }

            q = shared.cond.wait(q).unwrap_or_else(|e| e.into_inner());
        }
    }
}

/// Move `worker` past every task ending at or before `item`, running
/// completion callbacks as needed.
fn pass_tasks<'a>(
    shared: &'a Shared,
    mut q: MutexGuard<'a, Queue>,
    worker: usize,
    item: usize,
) -> MutexGuard<'a, Queue> {
    loop {
        let next_task = q.workers[worker].next_task;
        let info = match q.tasks.get_mut(next_task) {
            Some(info) if item >= info.items.end => info,
            _ => return q,
        };

        let mut finished = None;
        if info.notify_finish {
            info.workers_left -= 1;
            if info.workers_left == 0 {
                finished = Some(Arc::clone(&info.task));
            }
        }

        if let Some(task) = finished {
            // `barrier` can't complete while `next_task` of this worker
            // points to this task, so `tasks` is preserved while unlocked
            drop(q);
            task.finished(&Spawner { shared });
            drop(task);
            q = lock(&shared.queue);
        }

        q.workers[worker].next_task += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::TestResult;
    use quickcheck_macros::quickcheck;
    use std::sync::atomic::AtomicU8;

    /// Counts how many times each element was visited.
    struct CoverTask {
        visits: Vec<AtomicU8>,
        num_threads: usize,
        finished: AtomicUsize,
    }

    impl Task for CoverTask {
        fn run(&self, range: Range<usize>, worker: usize) {
            assert!(worker < self.num_threads);
            for i in range {
                self.visits[i].fetch_add(1, Ordering::Relaxed);
            }
        }

        fn finished(&self, _: &Spawner<'_>) {
            self.finished.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn cover_task(size: usize, num_threads: usize) -> Arc<CoverTask> {
        Arc::new(CoverTask {
            visits: (0..size).map(|_| AtomicU8::new(0)).collect(),
            num_threads,
            finished: AtomicUsize::new(0),
        })
    }

    #[quickcheck]
    fn each_element_exactly_once(
        num_threads: u8,
        sizes: Vec<(u16, u8)>,
        notify_finish: bool,
    ) -> TestResult {
        let _ = env_logger::builder().is_test(true).try_init();

        let num_threads = (num_threads % 8) as usize + 1;
        if sizes.len() > 16 {
            return TestResult::discard();
        }

        let pool = ThreadPool::new(num_threads, 1024).unwrap();

        let tasks: Vec<_> = sizes
            .iter()
            .map(|&(size, granularity)| {
                let size = size as usize % 4000;
                let task = cover_task(size, num_threads);
                pool.start_task(
                    task.clone(),
                    size,
                    granularity as usize + 1,
                    notify_finish,
                )
                .unwrap();
                task
            })
            .collect();

        pool.barrier();

        let ok = tasks.iter().all(|task| {
            task.visits.iter().all(|v| v.load(Ordering::Relaxed) == 1)
                && task.finished.load(Ordering::Relaxed) == notify_finish as usize
        });
        TestResult::from_bool(ok)
    }

    #[test]
    fn reuse_after_barrier() {
        let _ = env_logger::builder().is_test(true).try_init();
        let pool = ThreadPool::new(3, 16).unwrap();

        for round in 0..50 {
            let task = cover_task(100 + round, 3);
            pool.start_task(task.clone(), 100 + round, 7, true).unwrap();
            pool.barrier();
            assert!(task.visits.iter().all(|v| v.load(Ordering::Relaxed) == 1));
            assert_eq!(task.finished.load(Ordering::Relaxed), 1);
            // The pool must not hold references after `barrier`
            assert_eq!(Arc::strong_count(&task), 1);
        }
    }

    /// Spawns a follow-up task from its completion callback.
    struct ChainTask {
        depth: usize,
        log: Arc<Mutex<Vec<usize>>>,
    }

    impl Task for ChainTask {
        fn run(&self, range: Range<usize>, _: usize) {
            let mut log = lock(&self.log);
            log.extend(range.map(|_| self.depth));
        }

        fn finished(&self, spawner: &Spawner<'_>) {
            if self.depth < 4 {
                let next = Arc::new(ChainTask {
                    depth: self.depth + 1,
                    log: Arc::clone(&self.log),
                });
                spawner.start_task(next, 10, 3, true).unwrap();
            }
        }
    }

    #[test]
    fn completion_callback_spawns_follow_up() {
        let _ = env_logger::builder().is_test(true).try_init();
        let pool = ThreadPool::new(4, 16).unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));

        pool.start_task(
            Arc::new(ChainTask {
                depth: 0,
                log: Arc::clone(&log),
            }),
            10,
            3,
            true,
        )
        .unwrap();
        pool.barrier();

        let log = lock(&log);
        assert_eq!(log.len(), 50);
        // Each depth runs strictly after the previous one completed
        assert!(log.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn too_many_tasks() {
        let pool = ThreadPool::new(2, 4).unwrap();
        let task = cover_task(0, 2);
        // Empty tasks still occupy queue slots until `barrier`
        for _ in 0..4 {
            pool.start_task(task.clone(), 0, 1, false).unwrap();
        }
        assert_eq!(
            pool.start_task(task.clone(), 0, 1, false),
            Err(RenderError::TooManyTasks(4))
        );
        pool.barrier();
        pool.start_task(task, 0, 1, false).unwrap();
        pool.barrier();
    }

    #[test]
    fn zero_granularity() {
        let pool = ThreadPool::new(1, 4).unwrap();
        assert_eq!(
            pool.start_task(cover_task(1, 1), 1, 0, false),
            Err(RenderError::InvalidGranularity)
        );
    }

    #[test]
    fn single_threaded_mode() {
        let pool = ThreadPool::new(4, 16).unwrap();
        pool.single_threaded();

        struct WorkerCheck(AtomicUsize);
        impl Task for WorkerCheck {
            fn run(&self, range: Range<usize>, worker: usize) {
                assert_eq!(worker, 0);
                self.0.fetch_add(range.len(), Ordering::Relaxed);
            }
        }

        let task = Arc::new(WorkerCheck(AtomicUsize::new(0)));
        pool.start_task(task.clone(), 1000, 10, true).unwrap();
        pool.barrier();
        assert_eq!(task.0.load(Ordering::Relaxed), 1000);

        pool.multi_threaded();
        let task = cover_task(1000, 4);
        pool.start_task(task.clone(), 1000, 10, true).unwrap();
        pool.barrier();
        assert_eq!(task.finished.load(Ordering::Relaxed), 1);
    }
}
