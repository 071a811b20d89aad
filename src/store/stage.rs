//! store/stage — the store's single worker thread.
//!
//! Jobs run one at a time in submission order. Each submission hands back a
//! `Pending<T>` that receives the job's result.

use anyhow::{anyhow, Result};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::Mutex;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::error::TreeError;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Result of work submitted to a stage.
#[derive(Debug)]
pub struct Pending<T> {
    rx: Receiver<Result<T>>,
}

impl<T> Pending<T> {
    /// Already-completed result.
    pub fn ready(result: Result<T>) -> Self {
        let (tx, rx) = mpsc::channel();
        let _ = tx.send(result);
        Self { rx }
    }

    /// Block until the job finished.
    pub fn wait(self) -> Result<T> {
        self.rx
            .recv()
            .map_err(|_| anyhow!("stage stopped before the job completed"))?
    }

    /// `None` if the job is still running after `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<T>> {
        match self.rx.recv_timeout(timeout) {
            Ok(r) => Some(r),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => {
                Some(Err(anyhow!("result already taken or stage stopped")))
            }
        }
    }

    /// Non-blocking poll.
    pub fn try_take(&self) -> Option<Result<T>> {
        match self.rx.try_recv() {
            Ok(r) => Some(r),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                Some(Err(anyhow!("result already taken or stage stopped")))
            }
        }
    }
}

pub(crate) struct Stage {
    name: String,
    tx: Mutex<Option<Sender<Job>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Stage {
    pub(crate) fn start(name: &str) -> Result<Stage> {
        let (tx, rx) = mpsc::channel::<Job>();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                for job in rx {
                    job();
                }
            })
            .map_err(|e| anyhow!("spawn stage {}: {}", name, e))?;
        log::debug!("stage {} started", name);
        Ok(Stage {
            name: name.to_string(),
            tx: Mutex::new(Some(tx)),
            handle: Mutex::new(Some(handle)),
        })
    }

    pub(crate) fn submit<T, F>(&self, job: F) -> Pending<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let (done_tx, done_rx) = mpsc::channel();
        let wrapped: Job = Box::new(move || {
            let _ = done_tx.send(job());
        });
        let sent = match self.tx.lock() {
            Ok(guard) => match guard.as_ref() {
                Some(tx) => tx.send(wrapped).is_ok(),
                None => false,
            },
            Err(_) => false,
        };
        if !sent {
            return Pending::ready(Err(TreeError::State(format!("stage {} is stopped", self.name)).into()));
        }
        Pending { rx: done_rx }
    }

    /// Stop accepting jobs, drain the queue and join the thread.
    pub(crate) fn shutdown(&self) {
        if let Ok(mut tx) = self.tx.lock() {
            tx.take();
        }
        let handle = match self.handle.lock() {
            Ok(mut h) => h.take(),
            Err(_) => None,
        };
        if let Some(h) = handle {
            if h.thread().id() == thread::current().id() {
                return;
            }
            if h.join().is_err() {
                log::warn!("stage {} panicked", self.name);
            }
            log::debug!("stage {} stopped", self.name);
        }
    }
}

impl Drop for Stage {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn jobs_complete_in_submission_order() -> Result<()> {
        let stage = Stage::start("test-stage")?;
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut pending = Vec::new();
        for i in 0..10 {
            let log = log.clone();
            pending.push(stage.submit(move || {
                log.lock().unwrap().push(i);
                Ok(i * 2)
            }));
        }
        let results: Vec<i32> = pending.into_iter().map(|p| p.wait()).collect::<Result<_>>()?;
        assert_eq!(results, (0..10).map(|i| i * 2).collect::<Vec<_>>());
        assert_eq!(*log.lock().unwrap(), (0..10).collect::<Vec<_>>());

        stage.shutdown();
        let late = stage.submit(|| Ok(1));
        assert!(late.wait().is_err());
        Ok(())
    }

    #[test]
    fn poll_and_timeout() -> Result<()> {
        let stage = Stage::start("test-poll")?;
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let p = stage.submit(move || {
            let _ = gate_rx.recv();
            Ok("done")
        });
        assert!(p.try_take().is_none());
        assert!(p.wait_timeout(Duration::from_millis(10)).is_none());
        gate_tx.send(()).unwrap();
        assert_eq!(p.wait_timeout(Duration::from_secs(5)).unwrap()?, "done");
        Ok(())
    }
}
