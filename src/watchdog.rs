// ABOUTME: Liveness watchdog: a single-shot timer armed on outbound traffic and disarmed on
// ABOUTME: any inbound bytes, firing the `may_have_become_unresponsive` hook

use std::sync::{Arc, Mutex};

use crate::event_loop::{ConnectionHooks, EventLoopHandle, TimerHandle};

/// Arms a single-shot timer of period `R` on every `post_message`
/// (`start`) and disarms it whenever inbound bytes are observed (`stop`).
/// On fire, invokes `ConnectionHooks::may_have_become_unresponsive`.
pub struct ResponsivenessTimer<E: EventLoopHandle> {
    event_loop: E,
    period: std::time::Duration,
    hooks: Arc<dyn ConnectionHooks>,
    armed: Mutex<Option<Box<dyn TimerHandle>>>,
}

impl<E: EventLoopHandle> ResponsivenessTimer<E> {
    pub fn new(event_loop: E, period: std::time::Duration, hooks: Arc<dyn ConnectionHooks>) -> Self {
        Self { event_loop, period, hooks, armed: Mutex::new(None) }
    }

    /// (Re-)arm the timer. Called on every `post_message`.
    pub fn start(&self) {
        let hooks = self.hooks.clone();
        let new_timer = self.event_loop.timer(self.period, Box::new(move || hooks.may_have_become_unresponsive()));
        let mut armed = self.armed.lock().unwrap();
        if let Some(previous) = armed.replace(new_timer) {
            previous.cancel();
        }
    }

    /// Disarm the timer. Called whenever any inbound bytes are observed.
    pub fn stop(&self) {
        if let Some(timer) = self.armed.lock().unwrap().take() {
            timer.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::LocalEventLoop;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingHooks {
        unresponsive: AtomicUsize,
        responsive: AtomicUsize,
    }

    impl ConnectionHooks for CountingHooks {
        fn die(&self) {}
        fn may_have_become_unresponsive(&self) {
            self.unresponsive.fetch_add(1, Ordering::SeqCst);
        }
        fn did_become_responsive(&self) {
            self.responsive.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn fires_once_after_period_elapses() {
        let event_loop = LocalEventLoop::new();
        let hooks = Arc::new(CountingHooks { unresponsive: AtomicUsize::new(0), responsive: AtomicUsize::new(0) });
        let watchdog = ResponsivenessTimer::new(event_loop.clone(), Duration::from_millis(30), hooks.clone());

        let driver = event_loop.clone();
        let runner = std::thread::spawn(move || driver.run_until_closed());
        watchdog.start();
        std::thread::sleep(Duration::from_millis(100));
        event_loop.stop();
        runner.join().unwrap();

        assert_eq!(hooks.unresponsive.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stop_before_fire_prevents_the_callback() {
        let event_loop = LocalEventLoop::new();
        let hooks = Arc::new(CountingHooks { unresponsive: AtomicUsize::new(0), responsive: AtomicUsize::new(0) });
        let watchdog = ResponsivenessTimer::new(event_loop.clone(), Duration::from_millis(30), hooks.clone());

        let driver = event_loop.clone();
        let runner = std::thread::spawn(move || driver.run_until_closed());
        watchdog.start();
        watchdog.stop();
        std::thread::sleep(Duration::from_millis(100));
        event_loop.stop();
        runner.join().unwrap();

        assert_eq!(hooks.unresponsive.load(Ordering::SeqCst), 0);
    }
}
