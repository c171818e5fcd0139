//! Command worker pool.
//!
//! A fixed set of threads pulls boxed jobs from one `crossbeam-channel`
//! queue. Blocking operations (scans, loads, offline renders) run here so
//! the reader keeps accepting requests.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Condvar, Mutex};

pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Count of queued plus running jobs
#[derive(Default)]
struct InFlight {
    count: Mutex<usize>,
    idle: Condvar,
}

impl InFlight {
    fn begin(&self) {
        *self.count.lock() += 1;
    }

    fn end(&self) {
        let mut count = self.count.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.idle.notify_all();
        }
    }

    fn wait(&self) {
        let mut count = self.count.lock();
        while *count > 0 {
            self.idle.wait(&mut count);
        }
    }
}

/// Cloneable submission side of the pool.
#[derive(Clone)]
pub struct Spawner {
    jobs: Sender<Job>,
    in_flight: Arc<InFlight>,
}

impl Spawner {
    /// Queue a job. Returns `false` if the pool is gone.
    pub fn spawn(&self, job: impl FnOnce() + Send + 'static) -> bool {
        self.in_flight.begin();
        if self.jobs.send(Box::new(job)).is_err() {
            self.in_flight.end();
            return false;
        }
        true
    }
}

pub struct WorkerPool {
    spawner: Spawner,
    threads: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Start `size` workers. A panicking job is a host fault: it is
    /// reported on `fatal`.
    pub fn new(size: usize, fatal: &Sender<String>) -> std::io::Result<Self> {
        let (jobs, queue) = crossbeam_channel::unbounded::<Job>();
        let in_flight = Arc::new(InFlight::default());

        let threads = (0..size.max(1))
            .map(|i| {
                let queue = queue.clone();
                let in_flight = Arc::clone(&in_flight);
                let fatal = fatal.clone();
                thread::Builder::new()
                    .name(format!("command-{i}"))
                    .spawn(move || work(&queue, &in_flight, &fatal))
            })
            .collect::<std::io::Result<Vec<_>>>()?;

        tracing::debug!("Command pool started with {} thread(s)", threads.len());
        Ok(Self {
            spawner: Spawner { jobs, in_flight },
            threads,
        })
    }

    pub fn spawner(&self) -> Spawner {
        self.spawner.clone()
    }

    /// Block until every queued and running job has finished, including
    /// jobs those jobs queued.
    pub fn wait_idle(&self) {
        self.spawner.in_flight.wait();
    }

    /// Stop accepting work and join the threads. Every other [`Spawner`]
    /// must be dropped first.
    pub fn shutdown(self) {
        let Self { spawner, threads } = self;
        drop(spawner);
        for thread in threads {
            let _ = thread.join();
        }
    }
}

fn work(queue: &Receiver<Job>, in_flight: &InFlight, fatal: &Sender<String>) {
    for job in queue {
        if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(job)) {
            let message = panic
                .downcast_ref::<&str>()
                .map(ToString::to_string)
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            tracing::error!("Command job panicked: {message}");
            let _ = fatal.send(format!("command job panicked: {message}"));
        }
        in_flight.end();
    }
}
