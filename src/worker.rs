//! Single-owner resource workers.
//!
//! A `Worker<R>` moves a resource onto its own thread and runs submitted
//! jobs against it one at a time. Callers wait for the result with a bound.
//! A job whose caller timed out before it started is skipped; one already
//! running completes on the worker thread and its result is dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::error::HeadcountError;

struct Job<R> {
    abandoned: Arc<AtomicBool>,
    run: Box<dyn FnOnce(&mut R) + Send>,
}

pub struct Worker<R> {
    name: &'static str,
    jobs: Option<Sender<Job<R>>>,
    thread: Option<JoinHandle<()>>,
}

impl<R: Send + 'static> Worker<R> {
    pub fn spawn(name: &'static str, mut resource: R) -> std::io::Result<Self> {
        let (tx, rx) = mpsc::channel::<Job<R>>();
        let thread = std::thread::Builder::new()
            .name(format!("{name}-worker"))
            .spawn(move || {
                while let Ok(job) = rx.recv() {
                    if job.abandoned.load(Ordering::SeqCst) {
                        log::debug!("{name} worker skipping abandoned job");
                        continue;
                    }
                    (job.run)(&mut resource);
                }
                log::debug!("{name} worker stopped");
            })?;
        Ok(Self {
            name,
            jobs: Some(tx),
            thread: Some(thread),
        })
    }

    /// Run `job` against the resource and wait at most `timeout` for it.
    pub fn run<T, F>(&self, timeout: Duration, job: F) -> Result<T, HeadcountError>
    where
        T: Send + 'static,
        F: FnOnce(&mut R) -> T + Send + 'static,
    {
        let (reply_tx, reply_rx) = mpsc::sync_channel(1);
        let abandoned = Arc::new(AtomicBool::new(false));
        let jobs = self.jobs.as_ref().ok_or_else(|| self.gone())?;
        jobs.send(Job {
            abandoned: Arc::clone(&abandoned),
            run: Box::new(move |resource: &mut R| {
                let _ = reply_tx.send(job(resource));
            }),
        })
        .map_err(|_| self.gone())?;

        match reply_rx.recv_timeout(timeout) {
            Ok(value) => Ok(value),
            Err(RecvTimeoutError::Timeout) => {
                abandoned.store(true, Ordering::SeqCst);
                log::warn!("{} job timed out after {:?}", self.name, timeout);
                Err(HeadcountError::Timeout {
                    stage: self.name,
                    after: timeout,
                })
            }
            Err(RecvTimeoutError::Disconnected) => Err(self.gone()),
        }
    }

    fn gone(&self) -> HeadcountError {
        HeadcountError::Startup(format!("{} worker is not running", self.name))
    }
}

impl<R> Drop for Worker<R> {
    fn drop(&mut self) {
        // Closing the channel ends the worker loop once queued jobs finish.
        self.jobs.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
