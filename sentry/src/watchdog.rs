//! Watchdog for stuck tasks.
//!
//! Periodically samples task states and logs (or panics, depending on the
//! configured action) when a task has been stuck in the same syscall past
//! the timeout. Stopped across checkpoint, rebuilt on restore.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Condvar, Mutex,
    },
    thread,
    time::Duration,
};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum WatchdogAction {
    LogWarning,
    Panic,
}

#[derive(Debug, Copy, Clone)]
pub struct WatchdogOpts {
    pub task_timeout: Duration,
    pub period: Duration,
    pub action: WatchdogAction,
}

impl Default for WatchdogOpts {
    fn default() -> Self {
        WatchdogOpts {
            task_timeout: Duration::from_secs(3 * 60),
            period: Duration::from_secs(60),
            action: WatchdogAction::LogWarning,
        }
    }
}

/// A probe the watchdog polls: returns descriptions of tasks stuck past
/// the timeout.
pub trait StuckTaskSource: Send + Sync {
    fn stuck_tasks(&self, timeout: Duration) -> Vec<String>;
}

pub struct Watchdog {
    opts: WatchdogOpts,
    stopping: Arc<(Mutex<bool>, Condvar)>,
    paused: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Watchdog {
    pub fn new(source: Arc<dyn StuckTaskSource>, opts: WatchdogOpts) -> Watchdog {
        let stopping = Arc::new((Mutex::new(false), Condvar::new()));
        let paused = Arc::new(AtomicBool::new(false));
        let thread = {
            let stopping = Arc::clone(&stopping);
            let paused = Arc::clone(&paused);
            thread::spawn(move || {
                let (lock, cvar) = &*stopping;
                let mut stop = lock.lock().unwrap();
                loop {
                    let (guard, timeout) = cvar.wait_timeout(stop, opts.period).unwrap();
                    stop = guard;
                    if *stop {
                        return;
                    }
                    if !timeout.timed_out() || paused.load(Ordering::Acquire) {
                        continue;
                    }
                    let stuck = source.stuck_tasks(opts.task_timeout);
                    if stuck.is_empty() {
                        continue;
                    }
                    match opts.action {
                        WatchdogAction::LogWarning => {
                            for desc in &stuck {
                                log::warn!("watchdog: task stuck: {}", desc);
                            }
                        }
                        WatchdogAction::Panic => {
                            panic!("watchdog: tasks stuck: {:?}", stuck)
                        }
                    }
                }
            })
        };
        Watchdog {
            opts,
            stopping,
            paused,
            thread: Some(thread),
        }
    }

    pub fn opts(&self) -> WatchdogOpts {
        self.opts
    }

    /// Suspends stuck-task checks; used while the kernel is intentionally
    /// frozen for checkpoint.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
    }

    pub fn stop(&mut self) {
        {
            let (lock, cvar) = &*self.stopping;
            *lock.lock().unwrap() = true;
            cvar.notify_all();
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoStuck;

    impl StuckTaskSource for NoStuck {
        fn stuck_tasks(&self, _timeout: Duration) -> Vec<String> {
            Vec::new()
        }
    }

    #[test]
    fn stop_joins_promptly() {
        let opts = WatchdogOpts {
            period: Duration::from_secs(60),
            ..Default::default()
        };
        let mut dog = Watchdog::new(Arc::new(NoStuck), opts);
        dog.pause();
        dog.resume();
        dog.stop();
    }
}
