use std::thread;

use tracing::debug;

use crate::error::{Error, Result};
use crate::event_loop::{EventLoop, LoopHandle};

/// A dedicated thread running one event loop.
///
/// The loop is constructed on the spawned thread (the loop's owning thread
/// is its construction thread) and its handle is passed back over a channel
/// before the reactor cycle begins. Dropping the LoopThread quits the loop
/// and joins the thread.
pub struct LoopThread {
    handle: LoopHandle,
    join: Option<thread::JoinHandle<Result<()>>>,
}

impl LoopThread {
    pub fn spawn(name: &str) -> Result<LoopThread> {
        let (tx, rx) = crossbeam_channel::bounded::<Result<LoopHandle>>(1);
        let join = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || -> Result<()> {
                let lp = match EventLoop::new() {
                    Ok(lp) => {
                        let _ = tx.send(Ok(lp.handle()));
                        lp
                    }
                    Err(e) => {
                        let _ = tx.send(Err(e));
                        return Ok(());
                    }
                };
                lp.start()
            })
            .map_err(Error::Io)?;

        let handle = match rx.recv() {
            Ok(result) => result?,
            Err(_) => {
                return Err(Error::WorkerStartup(
                    "loop thread exited before handing back its handle".to_string(),
                ));
            }
        };
        Ok(LoopThread {
            handle,
            join: Some(join),
        })
    }

    pub fn handle(&self) -> &LoopHandle {
        &self.handle
    }

    /// Quit the loop and wait for the thread. Returns the loop's exit
    /// status; joining twice is a no-op.
    pub fn join(&mut self) -> Result<()> {
        let join = match self.join.take() {
            Some(join) => join,
            None => return Ok(()),
        };
        self.handle.quit();
        match join.join() {
            Ok(result) => result,
            Err(_) => Err(Error::WorkerStartup("loop thread panicked".to_string())),
        }
    }
}

impl Drop for LoopThread {
    fn drop(&mut self) {
        if let Err(e) = self.join() {
            debug!(error = %e, "loop thread exited with error");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    #[test]
    fn spawns_and_runs_tasks() {
        let mut lt = LoopThread::spawn("spindle-test").unwrap();
        assert!(!lt.handle().is_loop_thread());

        let counter = Arc::new(AtomicUsize::new(0));
        {
            let counter = counter.clone();
            lt.handle().run_in_loop(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        let deadline = Instant::now() + Duration::from_secs(2);
        while counter.load(Ordering::SeqCst) == 0 {
            assert!(Instant::now() < deadline, "task did not run");
            thread::sleep(Duration::from_millis(5));
        }
        lt.join().unwrap();
    }
}
