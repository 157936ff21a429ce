//! The worker pool driving the multichannel block processor.
//!
//! Each block, the audio callback walks its node lists in a fixed order
//! and hands every list to the pool: items are partitioned round-robin
//! over the workers, each worker is signalled through its own start
//! channel, and the callback blocks on the shared done channel until the
//! whole list has been processed. Lists are therefore strictly ordered
//! while items within one list run concurrently in any order.

use crate::denormal::FlushToZeroGuard;
use crossbeam_channel::{bounded, Receiver, Sender};
use std::thread::JoinHandle;

/// A unit of work: call `run` on the partition of `count` items that
/// belongs to worker `worker` out of `stride` workers.
#[derive(Clone, Copy)]
struct Task {
    data: *const (),
    run: unsafe fn(*const (), usize, usize, usize),
    count: usize,
    worker: usize,
    stride: usize,
}

// The raw pointer refers to a closure that outlives the dispatch call;
// `dispatch` blocks until every worker has reported done, so the
// reference never escapes its borrow.
unsafe impl Send for Task {}

unsafe fn run_partition<F: Fn(usize) + Sync>(
    data: *const (),
    count: usize,
    worker: usize,
    stride: usize,
) {
    let f = unsafe { &*(data as *const F) };
    let mut index = worker;
    while index < count {
        f(index);
        index += stride;
    }
}

/// Pool of worker threads processing list partitions.
///
/// Workers exist only while the engine is active; dropping the pool
/// closes the start channels, which the workers observe as the shutdown
/// signal, and joins them.
pub struct WorkerPool {
    threads: usize,
    starts: Vec<Sender<Task>>,
    done: Receiver<()>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `threads` workers (at least one).
    pub fn new(threads: usize) -> Self {
        let threads = threads.max(1);
        let (done_tx, done) = bounded::<()>(threads);
        let mut starts = Vec::with_capacity(threads);
        let mut handles = Vec::with_capacity(threads);

        for worker in 0..threads {
            let (start_tx, start_rx) = bounded::<Task>(1);
            starts.push(start_tx);
            let done_tx = done_tx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("sf-worker-{worker}"))
                .spawn(move || {
                    let _ftz = FlushToZeroGuard::new();
                    while let Ok(task) = start_rx.recv() {
                        unsafe { (task.run)(task.data, task.count, task.worker, task.stride) };
                        if done_tx.send(()).is_err() {
                            break;
                        }
                    }
                })
                .expect("failed to spawn worker thread");
            handles.push(handle);
        }

        Self {
            threads,
            starts,
            done,
            handles,
        }
    }

    /// Number of workers, T.
    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Process one list: `f(i)` is called exactly once for every
    /// `i < count`, partitioned round-robin over the workers. Blocks
    /// until the whole list is done.
    ///
    /// `f` is invoked concurrently for distinct indices; any interior
    /// mutation behind it must keep those index partitions disjoint.
    pub fn dispatch<F: Fn(usize) + Sync>(&self, count: usize, f: &F) {
        if count == 0 {
            return;
        }
        let data = f as *const F as *const ();
        for (worker, start) in self.starts.iter().enumerate() {
            let task = Task {
                data,
                run: run_partition::<F>,
                count,
                worker,
                stride: self.threads,
            };
            if start.send(task).is_err() {
                return;
            }
        }
        for _ in 0..self.threads {
            if self.done.recv().is_err() {
                return;
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.starts.clear();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

/// Default worker count: the machine's available parallelism.
pub fn default_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
