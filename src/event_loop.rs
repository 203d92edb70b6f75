// ABOUTME: Event-loop collaborator traits plus a small default single-threaded driver so the
// ABOUTME: crate is runnable standalone without pulling in a host reactor

use std::collections::BTreeMap;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// A running single-shot timer. `cancel` is a no-op if the timer has already
/// fired or was already cancelled.
pub trait TimerHandle: Send {
    fn cancel(&self);
}

/// The three capabilities the connection core consumes from its host event
/// loop: deferred invocation, a readable-fd hook, and a single-shot timer.
/// Modeled as a trait rather than owning a concrete reactor so a host
/// application can adapt its own event loop.
pub trait EventLoopHandle: Clone + Send + Sync + 'static {
    /// Run `task` on the event-loop thread at the next opportunity, after
    /// the current callback (if any) returns.
    fn defer(&self, task: Box<dyn FnOnce() + Send>);

    /// Arrange for `task` to run once, `after` from now, unless cancelled.
    fn timer(&self, after: Duration, task: Box<dyn FnOnce() + Send>) -> Box<dyn TimerHandle>;

    /// Arrange for `callback` to run on the event-loop thread whenever `fd`
    /// may have bytes or descriptors available.
    fn on_readable(&self, fd: RawFd, callback: Arc<dyn Fn() + Send + Sync>);
}

/// Injected capability object a connection notifies on teardown and on
/// liveness changes, in place of the subclassing a C++ event-loop peer would
/// use. `die` is required since a connection must always notify something on
/// teardown; the two liveness hooks default to no-ops.
pub trait ConnectionHooks: Send + Sync {
    /// Called exactly once, when the connection finishes tearing down.
    fn die(&self);

    /// Called when the responsiveness timer fires with no intervening
    /// inbound traffic.
    fn may_have_become_unresponsive(&self) {}

    /// Called when inbound bytes are observed, stopping the responsiveness
    /// timer.
    fn did_become_responsive(&self) {}
}

struct TimerEntry {
    fire_at: Instant,
    task: Option<Box<dyn FnOnce() + Send>>,
}

struct LoopInner {
    deferred: Vec<Box<dyn FnOnce() + Send>>,
    timers: BTreeMap<u64, TimerEntry>,
    readable_hooks: Vec<(RawFd, Arc<dyn Fn() + Send + Sync>)>,
    stopped: bool,
}

/// Default, minimal `EventLoopHandle`: one dedicated thread running
/// `run_until_closed`, backed by a single `poll(2)` call per tick. Suitable
/// for a small IPC peer process; large host applications should adapt their
/// own reactor instead, so the whole process shares one I/O loop.
#[derive(Clone)]
pub struct LocalEventLoop {
    inner: Arc<Mutex<LoopInner>>,
    condvar: Arc<Condvar>,
    next_timer_id: Arc<AtomicU64>,
}

impl LocalEventLoop {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(LoopInner {
                deferred: Vec::new(),
                timers: BTreeMap::new(),
                readable_hooks: Vec::new(),
                stopped: false,
            })),
            condvar: Arc::new(Condvar::new()),
            next_timer_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Ask the loop to stop after its current tick. Used by tests and by a
    /// host process shutting down cleanly.
    pub fn stop(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.stopped = true;
        self.condvar.notify_all();
    }

    /// Run the loop on the calling thread until `stop` is called. Each tick:
    /// drain deferred tasks, fire any expired timers, then `poll` registered
    /// fds for readability (bounded by the next timer deadline, if any).
    pub fn run_until_closed(&self) {
        loop {
            let deferred = {
                let mut inner = self.inner.lock().unwrap();
                if inner.stopped {
                    return;
                }
                std::mem::take(&mut inner.deferred)
            };
            for task in deferred {
                task();
            }

            let fired = {
                let mut inner = self.inner.lock().unwrap();
                let now = Instant::now();
                let due: Vec<u64> = inner
                    .timers
                    .iter()
                    .filter(|(_, entry)| entry.fire_at <= now)
                    .map(|(id, _)| *id)
                    .collect();
                due.into_iter()
                    .filter_map(|id| inner.timers.remove(&id).and_then(|entry| entry.task))
                    .collect::<Vec<_>>()
            };
            for task in fired {
                task();
            }

            let (fds, timeout_ms) = {
                let inner = self.inner.lock().unwrap();
                if inner.stopped {
                    return;
                }
                let timeout = inner
                    .timers
                    .values()
                    .map(|entry| entry.fire_at.saturating_duration_since(Instant::now()))
                    .min()
                    .map(|d| d.as_millis().min(i32::MAX as u128) as i32)
                    .unwrap_or(50);
                (inner.readable_hooks.clone(), timeout.max(1))
            };

            if fds.is_empty() {
                std::thread::sleep(Duration::from_millis(timeout_ms as u64));
                continue;
            }

            let mut pollfds: Vec<libc::pollfd> =
                fds.iter().map(|(fd, _)| libc::pollfd { fd: *fd, events: libc::POLLIN, revents: 0 }).collect();
            // SAFETY: `pollfds` is a correctly sized, live `Vec` for the duration of the call.
            let rc = unsafe { libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, timeout_ms) };
            if rc > 0 {
                for (pollfd, (_, callback)) in pollfds.iter().zip(fds.iter()) {
                    if pollfd.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0 {
                        callback();
                    }
                }
            }
        }
    }
}

impl Default for LocalEventLoop {
    fn default() -> Self {
        Self::new()
    }
}

struct LocalTimerHandle {
    id: u64,
    inner: Arc<Mutex<LoopInner>>,
}

impl TimerHandle for LocalTimerHandle {
    fn cancel(&self) {
        self.inner.lock().unwrap().timers.remove(&self.id);
    }
}

impl EventLoopHandle for LocalEventLoop {
    fn defer(&self, task: Box<dyn FnOnce() + Send>) {
        let mut inner = self.inner.lock().unwrap();
        inner.deferred.push(task);
        self.condvar.notify_all();
    }

    fn timer(&self, after: Duration, task: Box<dyn FnOnce() + Send>) -> Box<dyn TimerHandle> {
        let id = self.next_timer_id.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock().unwrap();
        inner.timers.insert(id, TimerEntry { fire_at: Instant::now() + after, task: Some(task) });
        Box::new(LocalTimerHandle { id, inner: self.inner.clone() })
    }

    fn on_readable(&self, fd: RawFd, callback: Arc<dyn Fn() + Send + Sync>) {
        let mut inner = self.inner.lock().unwrap();
        inner.readable_hooks.push((fd, callback));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn deferred_task_runs_on_next_tick() {
        let event_loop = LocalEventLoop::new();
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        event_loop.defer(Box::new(move || ran2.store(true, Ordering::SeqCst)));

        let driver = event_loop.clone();
        let handle = std::thread::spawn(move || driver.run_until_closed());
        std::thread::sleep(Duration::from_millis(50));
        event_loop.stop();
        handle.join().unwrap();

        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn timer_cancel_prevents_fire() {
        let event_loop = LocalEventLoop::new();
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        let handle = event_loop.timer(Duration::from_millis(20), Box::new(move || fired2.store(true, Ordering::SeqCst)));
        handle.cancel();

        let driver = event_loop.clone();
        let runner = std::thread::spawn(move || driver.run_until_closed());
        std::thread::sleep(Duration::from_millis(80));
        event_loop.stop();
        runner.join().unwrap();

        assert!(!fired.load(Ordering::SeqCst));
    }
}
