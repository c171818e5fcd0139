//! Per-handle command ordering.
//!
//! Commands naming the same handle run one at a time in arrival order.
//! Commands for different handles, and handle-less commands, run
//! concurrently on the pool.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::pool::{Job, Spawner};

pub struct Sequencer {
    spawner: Spawner,
    /// A handle has an entry while one of its jobs is on the pool; the
    /// queue holds the jobs waiting behind it.
    queues: Mutex<HashMap<u64, VecDeque<Job>>>,
}

impl Sequencer {
    pub fn new(spawner: Spawner) -> Arc<Self> {
        Arc::new(Self {
            spawner,
            queues: Mutex::new(HashMap::new()),
        })
    }

    pub fn submit(self: &Arc<Self>, handle: u64, job: Job) {
        {
            let mut queues = self.queues.lock();
            if let Some(waiting) = queues.get_mut(&handle) {
                waiting.push_back(job);
                return;
            }
            queues.insert(handle, VecDeque::new());
        }
        self.dispatch(handle, job);
    }

    fn dispatch(self: &Arc<Self>, handle: u64, job: Job) {
        let this = Arc::clone(self);
        let queued = self.spawner.spawn(move || {
            job();
            this.finish(handle);
        });
        if !queued {
            tracing::warn!("Command pool is gone; dropping work for handle {handle}");
            self.queues.lock().remove(&handle);
        }
    }

    /// The next job is handed to the pool before this one counts as done,
    /// so `WorkerPool::wait_idle` never sees a gap.
    fn finish(self: &Arc<Self>, handle: u64) {
        let next = {
            let mut queues = self.queues.lock();
            let next = queues.get_mut(&handle).and_then(VecDeque::pop_front);
            if next.is_none() {
                queues.remove(&handle);
            }
            next
        };
        if let Some(job) = next {
            self.dispatch(handle, job);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::WorkerPool;
    use std::time::Duration;

    #[test]
    fn test_same_handle_runs_in_order() {
        let (fatal, _fatal_rx) = crossbeam_channel::unbounded();
        let pool = WorkerPool::new(4, &fatal).unwrap();
        let sequencer = Sequencer::new(pool.spawner());
        let seen = Arc::new(Mutex::new(Vec::new()));

        for i in 0..20u64 {
            let seen = Arc::clone(&seen);
            sequencer.submit(
                7,
                Box::new(move || {
                    // Early jobs sleep longest; order must still hold.
                    std::thread::sleep(Duration::from_millis(20u64.saturating_sub(i)));
                    seen.lock().push(i);
                }),
            );
        }
        pool.wait_idle();
        assert_eq!(*seen.lock(), (0..20).collect::<Vec<_>>());
        assert!(sequencer.queues.lock().is_empty());

        drop(sequencer);
        pool.shutdown();
    }

    #[test]
    fn test_handles_do_not_block_each_other() {
        let (fatal, _fatal_rx) = crossbeam_channel::unbounded();
        let pool = WorkerPool::new(2, &fatal).unwrap();
        let sequencer = Sequencer::new(pool.spawner());
        let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(0);
        let (done_tx, done_rx) = crossbeam_channel::unbounded();

        sequencer.submit(
            1,
            Box::new(move || {
                release_rx.recv().unwrap();
            }),
        );
        sequencer.submit(
            2,
            Box::new(move || {
                done_tx.send(2).unwrap();
            }),
        );

        // Handle 2 finishes while handle 1 is still blocked.
        assert_eq!(done_rx.recv_timeout(Duration::from_secs(5)).unwrap(), 2);
        release_tx.send(()).unwrap();
        pool.wait_idle();

        drop(sequencer);
        pool.shutdown();
    }
}
