//! Fixed-size worker pool and task groups.
//!
//! A task group is N sub-tasks pulled by workers through a shared counter.
//! `abort` stops new sub-tasks from being handed out and lets in-flight ones
//! drain; the finisher runs exactly once and only on non-aborted groups.
//! Worker panics are captured per group and re-raised on `wait`.

// std
use std::any::Any;
use std::cell::Cell;
use std::collections::VecDeque;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

type TaskFunc = Box<dyn Fn(u32, u32, u32) + Send + Sync>;
type Finisher = Box<dyn FnOnce() + Send>;

thread_local! {
    static WORKER_ID: Cell<Option<u32>> = Cell::new(None);
}

pub struct TaskGroup {
    func: TaskFunc,
    finisher: Mutex<Option<Finisher>>,
    panic_payload: Mutex<Option<Box<dyn Any + Send>>>,
    started_sub_tasks: AtomicU32,
    finished_sub_tasks: AtomicU32,
    num_sub_tasks: u32,
    done: Mutex<bool>,
    done_cond: Condvar,
    abort: AtomicBool,
}

impl TaskGroup {
    fn new(func: TaskFunc, finisher: Option<Finisher>, num_sub_tasks: u32) -> Self {
        TaskGroup {
            func,
            finisher: Mutex::new(finisher),
            panic_payload: Mutex::new(None),
            started_sub_tasks: AtomicU32::new(0),
            finished_sub_tasks: AtomicU32::new(0),
            num_sub_tasks,
            done: Mutex::new(false),
            done_cond: Condvar::new(),
            abort: AtomicBool::new(false),
        }
    }

    fn finish(&self) {
        if !self.is_aborting() {
            if let Some(finisher) = self.finisher.lock().unwrap().take() {
                let result = catch_unwind(AssertUnwindSafe(finisher));
                if let Err(payload) = result {
                    *self.panic_payload.lock().unwrap() = Some(payload);
                }
            }
        }
        let mut done = self.done.lock().unwrap();
        *done = true;
        self.done_cond.notify_all();
    }

    pub fn run(&self, thread_id: u32, task_id: u32) {
        let result = catch_unwind(AssertUnwindSafe(|| {
            (self.func)(task_id, self.num_sub_tasks, thread_id)
        }));
        if let Err(payload) = result {
            *self.panic_payload.lock().unwrap() = Some(payload);
        }

        let num = self.finished_sub_tasks.fetch_add(1, Ordering::AcqRel) + 1;
        if num == self.num_sub_tasks
            || (self.is_aborting() && num == self.started_sub_tasks.load(Ordering::Acquire))
        {
            self.finish();
        }
    }

    /// Block until every sub-task completed or was drained by an abort.
    /// Re-raises the first worker panic, if any.
    pub fn wait(&self) {
        let mut done = self.done.lock().unwrap();
        while !*done {
            done = self.done_cond.wait(done).unwrap();
        }
        drop(done);
        if let Some(payload) = self.panic_payload.lock().unwrap().take() {
            resume_unwind(payload);
        }
    }

    /// Stop handing out new sub-tasks; in-flight ones finish. The
    /// completion callback is suppressed.
    pub fn abort(&self) {
        let mut done = self.done.lock().unwrap();
        self.abort.store(true, Ordering::Release);
        if self.started_sub_tasks.load(Ordering::Acquire)
            == self.finished_sub_tasks.load(Ordering::Acquire)
        {
            *done = true;
        }
        self.done_cond.notify_all();
    }

    pub fn is_aborting(&self) -> bool {
        self.abort.load(Ordering::Acquire)
    }

    pub fn is_done(&self) -> bool {
        *self.done.lock().unwrap()
    }

    fn start_sub_task(&self) -> u32 {
        self.started_sub_tasks.fetch_add(1, Ordering::AcqRel)
    }

    pub fn num_sub_tasks(&self) -> u32 {
        self.num_sub_tasks
    }
}

struct PoolShared {
    tasks: Mutex<VecDeque<Arc<TaskGroup>>>,
    task_cond: Condvar,
    terminate: AtomicBool,
}

impl PoolShared {
    /// Blocking acquire used by workers.
    fn acquire_task(&self) -> Option<(Arc<TaskGroup>, u32)> {
        let mut tasks = self.tasks.lock().unwrap();
        loop {
            if self.terminate.load(Ordering::Acquire) {
                return None;
            }
            match self.pop_sub_task(&mut tasks) {
                Acquired::Task(task, sub) => return Some((task, sub)),
                Acquired::Retry => continue,
                Acquired::Empty => {
                    tasks = self.task_cond.wait(tasks).unwrap();
                }
            }
        }
    }

    /// Non-blocking acquire used by `yield_group`.
    fn try_acquire_task(&self) -> Option<(Arc<TaskGroup>, u32)> {
        let mut tasks = self.tasks.lock().unwrap();
        loop {
            match self.pop_sub_task(&mut tasks) {
                Acquired::Task(task, sub) => return Some((task, sub)),
                Acquired::Retry => continue,
                Acquired::Empty => return None,
            }
        }
    }

    fn pop_sub_task(&self, tasks: &mut VecDeque<Arc<TaskGroup>>) -> Acquired {
        let task = match tasks.front() {
            Some(task) => task.clone(),
            None => return Acquired::Empty,
        };
        if task.is_aborting() {
            tasks.pop_front();
            return Acquired::Retry;
        }
        let sub_task_id = task.start_sub_task();
        if sub_task_id >= task.num_sub_tasks() {
            // raced past the end; drop the group and retry
            tasks.pop_front();
            return Acquired::Retry;
        }
        if sub_task_id == task.num_sub_tasks() - 1 {
            tasks.pop_front();
        }
        Acquired::Task(task, sub_task_id)
    }
}

enum Acquired {
    Task(Arc<TaskGroup>, u32),
    Retry,
    Empty,
}

pub struct ThreadPool {
    thread_count: u32,
    shared: Arc<PoolShared>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

pub fn ideal_thread_count() -> u32 {
    thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(4)
}

impl ThreadPool {
    pub fn new(thread_count: u32) -> Self {
        let thread_count = thread_count.max(1);
        let shared = Arc::new(PoolShared {
            tasks: Mutex::new(VecDeque::new()),
            task_cond: Condvar::new(),
            terminate: AtomicBool::new(false),
        });
        let mut workers = Vec::new();
        for id in 0..thread_count {
            let shared = shared.clone();
            workers.push(thread::spawn(move || {
                WORKER_ID.with(|cell| cell.set(Some(id)));
                while let Some((task, sub_task_id)) = shared.acquire_task() {
                    task.run(id, sub_task_id);
                }
            }));
        }
        ThreadPool {
            thread_count,
            shared,
            workers: Mutex::new(workers),
        }
    }

    pub fn thread_count(&self) -> u32 {
        self.thread_count
    }

    pub fn enqueue(
        &self,
        func: TaskFunc,
        num_sub_tasks: u32,
        finisher: Option<Finisher>,
    ) -> Arc<TaskGroup> {
        let task = Arc::new(TaskGroup::new(func, finisher, num_sub_tasks.max(1)));
        {
            let mut tasks = self.shared.tasks.lock().unwrap();
            tasks.push_back(task.clone());
            if num_sub_tasks <= 1 {
                self.shared.task_cond.notify_one();
            } else {
                self.shared.task_cond.notify_all();
            }
        }
        task
    }

    /// Work on queued sub-tasks (of any group) until `group` completes.
    /// Lets recursive builds fork to the pool without deadlocking it.
    pub fn yield_group(&self, group: &TaskGroup) {
        let worker_id = WORKER_ID.with(|cell| cell.get()).unwrap_or(self.thread_count);
        loop {
            if group.is_done() {
                return;
            }
            match self.shared.try_acquire_task() {
                Some((task, sub_task_id)) => task.run(worker_id, sub_task_id),
                None => {
                    group.wait();
                    return;
                }
            }
        }
    }

    pub fn stop(&self) {
        self.shared.terminate.store(true, Ordering::Release);
        {
            let _tasks = self.shared.tasks.lock().unwrap();
            self.shared.task_cond.notify_all();
        }
        let mut workers = self.workers.lock().unwrap();
        for worker in workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Split `[start, end)` into `partitions` contiguous spans run on the pool.
pub fn parallel_for<F>(pool: &ThreadPool, start: u32, end: u32, partitions: u32, func: F)
where
    F: Fn(u32) + Send + Sync + 'static,
{
    if end <= start {
        return;
    }
    if partitions <= 1 {
        for i in start..end {
            func(i);
        }
        return;
    }
    let task = pool.enqueue(
        Box::new(move |idx, num, _thread| {
            let span = (end - start + num - 1) / num;
            let i_start = start + span * idx;
            let i_end = (i_start + span).min(end);
            for i in i_start..i_end {
                func(i);
            }
        }),
        partitions,
        None,
    );
    pool.yield_group(&task);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn all_sub_tasks_run_and_finisher_fires_once() {
        let pool = ThreadPool::new(4);
        let counter = Arc::new(AtomicUsize::new(0));
        let finish_count = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        let f = finish_count.clone();
        let group = pool.enqueue(
            Box::new(move |_, _, _| {
                c.fetch_add(1, Ordering::SeqCst);
            }),
            64,
            Some(Box::new(move || {
                f.fetch_add(1, Ordering::SeqCst);
            })),
        );
        group.wait();
        assert_eq!(counter.load(Ordering::SeqCst), 64);
        assert_eq!(finish_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn abort_drops_pending_and_suppresses_finisher() {
        let pool = ThreadPool::new(2);
        let ran = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));
        let r = ran.clone();
        let f = finished.clone();
        let group = pool.enqueue(
            Box::new(move |_, _, _| {
                thread::sleep(Duration::from_millis(5));
                r.fetch_add(1, Ordering::SeqCst);
            }),
            1000,
            Some(Box::new(move || {
                f.fetch_add(1, Ordering::SeqCst);
            })),
        );
        thread::sleep(Duration::from_millis(20));
        group.abort();
        group.wait();
        assert!(ran.load(Ordering::SeqCst) < 1000);
        assert_eq!(finished.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn worker_panic_is_reraised_on_wait() {
        let pool = ThreadPool::new(2);
        let group = pool.enqueue(
            Box::new(|task_id, _, _| {
                if task_id == 3 {
                    panic!("boom");
                }
            }),
            8,
            None,
        );
        let result = catch_unwind(AssertUnwindSafe(|| group.wait()));
        assert!(result.is_err());
    }

    #[test]
    fn yield_runs_nested_groups() {
        let pool = Arc::new(ThreadPool::new(2));
        let inner_count = Arc::new(AtomicUsize::new(0));
        let pool2 = pool.clone();
        let ic = inner_count.clone();
        let outer = pool.enqueue(
            Box::new(move |_, _, _| {
                let ic = ic.clone();
                let inner = pool2.enqueue(
                    Box::new(move |_, _, _| {
                        ic.fetch_add(1, Ordering::SeqCst);
                    }),
                    16,
                    None,
                );
                pool2.yield_group(&inner);
            }),
            1,
            None,
        );
        outer.wait();
        assert_eq!(inner_count.load(Ordering::SeqCst), 16);
    }
}
