//! Shared worker pool for block compression and decompression.
//!
//! The pool is created explicitly and passed to each handle that wants
//! multi-threaded operation, so several readers and writers can share one
//! set of worker threads. Workers pull boxed jobs from a single injector
//! channel and exit when the pool is dropped.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Sender};

type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct ThreadPool {
    injector: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    /// Spins up a pool with `num_threads` workers. Zero selects the number
    /// of available CPUs.
    #[must_use]
    pub fn new(num_threads: usize) -> Arc<Self> {
        let num_threads = if num_threads == 0 {
            num_cpus::get()
        } else {
            num_threads
        };
        let (injector, feed) = unbounded::<Job>();
        let workers = (0..num_threads)
            .map(|_| {
                let feed = feed.clone();
                thread::spawn(move || {
                    while let Ok(job) = feed.recv() {
                        job();
                    }
                })
            })
            .collect();
        Arc::new(Self {
            injector: Some(injector),
            workers,
        })
    }

    /// Number of worker threads.
    #[must_use]
    pub fn num_threads(&self) -> usize {
        self.workers.len()
    }

    /// Queues a job for execution on some worker.
    pub fn spawn<F: FnOnce() + Send + 'static>(&self, job: F) {
        if let Some(injector) = &self.injector {
            // Delivery only fails once every worker has exited, which
            // cannot happen while the pool is alive.
            let _ = injector.send(Box::new(job));
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        // Closing the injector lets each worker drain and exit.
        drop(self.injector.take());
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}
