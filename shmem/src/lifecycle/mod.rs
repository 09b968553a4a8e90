//! Process lifecycle: a cooperative shutdown token, the signal thread that
//! triggers it, and fixed-size pools of long-lived worker threads.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{error, info, warn};
use signal_hook::consts::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};
use signal_hook::iterator::{Handle, Signals};

use crate::errors::{Result, ShmemLibError};

type Hook = Box<dyn Fn() + Send>;

struct ShutdownState {
    triggered: bool,
    hooks: Vec<Hook>,
}

struct ShutdownInner {
    triggered: AtomicBool,
    state: Mutex<ShutdownState>,
    cond: Condvar,
}

/// Set once, observed by every worker loop between units of work.
#[derive(Clone)]
pub struct Shutdown {
    inner: Arc<ShutdownInner>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Shutdown::new()
    }
}

impl Shutdown {
    pub fn new() -> Shutdown {
        Shutdown {
            inner: Arc::new(ShutdownInner {
                triggered: AtomicBool::new(false),
                state: Mutex::new(ShutdownState {
                    triggered: false,
                    hooks: Vec::new(),
                }),
                cond: Condvar::new(),
            }),
        }
    }

    #[inline]
    pub fn is_triggered(&self) -> bool {
        self.inner.triggered.load(Ordering::Relaxed)
    }

    /// Registers a wake-up hook, run once on trigger. Runs immediately if the
    /// token is already triggered.
    pub fn on_trigger<F>(&self, hook: F)
    where
        F: Fn() + Send + 'static,
    {
        let mut state = self.lock_state();
        if state.triggered {
            drop(state);
            hook();
        } else {
            state.hooks.push(Box::new(hook));
        }
    }

    /// Returns true for the call that actually triggered.
    pub fn trigger(&self) -> bool {
        let hooks = {
            let mut state = self.lock_state();
            if state.triggered {
                return false;
            }
            state.triggered = true;
            self.inner.triggered.store(true, Ordering::SeqCst);
            std::mem::take(&mut state.hooks)
        };
        self.inner.cond.notify_all();
        for hook in hooks.iter() {
            hook();
        }
        true
    }

    /// Blocks until triggered.
    pub fn wait(&self) {
        let mut state = self.lock_state();
        while !state.triggered {
            state = self
                .inner
                .cond
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Sleeps up to `timeout`, returning early (true) if triggered.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let state = self.lock_state();
        let (state, _) = self
            .inner
            .cond
            .wait_timeout_while(state, timeout, |state| !state.triggered)
            .unwrap_or_else(PoisonError::into_inner);
        state.triggered
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, ShutdownState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawns the thread that turns SIGINT, SIGTERM, SIGHUP and SIGQUIT into
    /// a trigger. Repeated signals are ignored.
    pub fn listen_for_signals(&self) -> Result<SignalListener> {
        let mut signals =
            Signals::new([SIGHUP, SIGINT, SIGQUIT, SIGTERM]).map_err(ShmemLibError::SignalHook)?;
        let handle = signals.handle();
        let shutdown = self.clone();
        let thread = thread::Builder::new()
            .name("signals".into())
            .spawn(move || {
                for signal in signals.forever() {
                    if shutdown.trigger() {
                        info!("Received signal {}, shutting down", signal);
                    } else {
                        info!("Received signal {} while already shutting down", signal);
                    }
                }
            })?;
        Ok(SignalListener {
            handle,
            thread: Some(thread),
        })
    }
}

pub struct SignalListener {
    handle: Handle,
    thread: Option<JoinHandle<()>>,
}

impl Drop for SignalListener {
    fn drop(&mut self) {
        self.handle.close();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Named long-lived threads, each running `work(index)` until it returns.
pub struct WorkerPool {
    name: String,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn<F>(name: &str, count: usize, work: F) -> Result<WorkerPool>
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        let work = Arc::new(work);
        let mut handles = Vec::with_capacity(count);
        for index in 0..count {
            let work = Arc::clone(&work);
            let handle = thread::Builder::new()
                .name(format!("{}-{}", name, index))
                .spawn(move || work(index))?;
            handles.push(handle);
        }
        info!("Started {} {} workers", count, name);
        Ok(WorkerPool {
            name: name.to_string(),
            handles,
        })
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Waits up to `grace` for every worker to return and joins those that
    /// did. Returns how many were still running at the deadline; they are
    /// left detached.
    pub fn join_with_grace(self, grace: Duration) -> usize {
        let deadline = Instant::now() + grace;
        while Instant::now() < deadline && !self.handles.iter().all(|h| h.is_finished()) {
            thread::sleep(Duration::from_millis(10));
        }
        let mut stuck = 0;
        for handle in self.handles {
            if !handle.is_finished() {
                stuck += 1;
                continue;
            }
            if handle.join().is_err() {
                error!("A {} worker panicked", self.name);
            }
        }
        if stuck > 0 {
            warn!("{} {} workers still busy after {:?}", stuck, self.name, grace);
        }
        stuck
    }
}
