use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread;

use crossbeam::channel::{self, Receiver, Sender};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Named pool of worker threads fed from one queue.
///
/// Jobs run in submission order per worker; a pool built with a single
/// worker therefore runs every job strictly in order. A worker whose job
/// panics is replaced. Dropping the pool lets the workers drain the queue
/// and exit.
pub struct ThreadPool {
    sender: Sender<Job>,
    name: &'static str,
    workers: usize,
}

pub struct Worker {
    receiver: Receiver<Job>,
    name: &'static str,
    closed: Arc<AtomicBool>,
}

impl ThreadPool {
    pub fn new(name: &'static str) -> Self {
        Self::with_workers(name, num_cpus::get())
    }

    pub fn with_workers(name: &'static str, workers: usize) -> Self {
        let workers = workers.max(1);
        let (sender, receiver) = channel::unbounded();
        for _ in 0..workers {
            Worker::new(receiver.clone(), name);
        }
        Self {
            sender,
            name,
            workers,
        }
    }

    pub fn spawn<F>(&self, func: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let _ = self.sender.send(Box::new(func));
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn workers(&self) -> usize {
        self.workers
    }
}

impl Worker {
    pub fn new(receiver: Receiver<Job>, name: &'static str) {
        let _ = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let worker = Worker {
                    receiver,
                    name,
                    closed: Arc::new(AtomicBool::new(false)),
                };
                worker.run();
            });
    }

    pub fn run(&self) {
        // the queue is closed once every sender is gone
        while let Ok(job) = self.receiver.recv() {
            job();
        }
        self.closed.store(true, Ordering::SeqCst);
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if self.closed.load(Ordering::SeqCst) || !thread::panicking() {
            return;
        }
        println!("{} worker dropped while panicking, respawning", self.name);
        Worker::new(self.receiver.clone(), self.name);
    }
}
