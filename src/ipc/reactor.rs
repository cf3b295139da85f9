//! Poll loop over registered message channels.
//!
//! The reactor runs on a dedicated thread (the control task).  Channels and
//! timers register through an internal queue, so registration never contends
//! with dispatch and a handler may register further channels from inside the
//! loop.  A channel handler returns `false` to deregister itself, which is
//! also how closed channels are reaped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Select, Sender};

/// Called when a channel has traffic; `false` removes the registration.
pub type ChannelHandler = Box<dyn FnMut() -> bool + Send>;

/// Called when a timer fires.
pub type TimerHandler = Box<dyn FnMut() + Send>;

enum Registration {
    Channel(Receiver<String>, ChannelHandler),
    Timer(Duration, TimerHandler),
}

// Upper bound on one poll interval, so `stop` is honoured promptly even
// when no timer is due.
const POLL_CAP: Duration = Duration::from_millis(100);

/// A set of channels and timers dispatched from one thread.
pub struct IpcReactor {
    reg_tx: Sender<Registration>,
    reg_rx: Receiver<Registration>,
    running: AtomicBool,
}

impl Default for IpcReactor {
    fn default() -> Self {
        Self::new()
    }
}

impl IpcReactor {
    pub fn new() -> Self {
        let (reg_tx, reg_rx) = unbounded();
        IpcReactor {
            reg_tx,
            reg_rx,
            running: AtomicBool::new(false),
        }
    }

    /// Register a channel receiver with its handler.  May be called before
    /// `run` or from inside a handler.
    pub fn register_channel(&self, rx: Receiver<String>, handler: ChannelHandler) {
        let _ = self.reg_tx.send(Registration::Channel(rx, handler));
    }

    /// Register a periodic timer.
    pub fn register_timer(&self, period: Duration, handler: TimerHandler) {
        let _ = self.reg_tx.send(Registration::Timer(period, handler));
    }

    /// Ask the loop to exit; returns once the flag is set (the loop notices
    /// within one poll interval).
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Run the dispatch loop on the calling thread until [`stop`](Self::stop).
    pub fn run(&self) {
        self.running.store(true, Ordering::SeqCst);
        let mut channels: Vec<(Receiver<String>, ChannelHandler)> = Vec::new();
        let mut timers: Vec<(Duration, Instant, TimerHandler)> = Vec::new();

        while self.running.load(Ordering::SeqCst) {
            // Fold in registrations that arrived since the last pass.
            for reg in self.reg_rx.try_iter() {
                match reg {
                    Registration::Channel(rx, h) => channels.push((rx, h)),
                    Registration::Timer(period, h) => {
                        timers.push((period, Instant::now() + period, h))
                    }
                }
            }

            let now = Instant::now();
            let next_deadline = timers.iter().map(|(_, at, _)| *at).min();
            let timeout = next_deadline
                .map(|at| at.saturating_duration_since(now))
                .unwrap_or(POLL_CAP)
                .min(POLL_CAP);

            if channels.is_empty() {
                std::thread::sleep(timeout);
            } else {
                let mut select = Select::new();
                for (rx, _) in &channels {
                    select.recv(rx);
                }
                if let Ok(index) = select.ready_timeout(timeout) {
                    let keep = (channels[index].1)();
                    if !keep {
                        channels.swap_remove(index);
                    }
                }
            }

            let now = Instant::now();
            for (period, deadline, handler) in &mut timers {
                if now >= *deadline {
                    handler();
                    *deadline = now + *period;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn dispatches_registered_channel() {
        let reactor = Arc::new(IpcReactor::new());
        let (tx, rx) = unbounded();
        let hits = Arc::new(AtomicUsize::new(0));

        let h = Arc::clone(&hits);
        let poll = rx.clone();
        reactor.register_channel(
            rx,
            Box::new(move || {
                while poll.try_recv().is_ok() {
                    h.fetch_add(1, Ordering::SeqCst);
                }
                true
            }),
        );

        let r = Arc::clone(&reactor);
        let thread = std::thread::spawn(move || r.run());
        tx.send("one".into()).unwrap();
        tx.send("two".into()).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while hits.load(Ordering::SeqCst) < 2 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        reactor.stop();
        thread.join().unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn handler_returning_false_deregisters() {
        let reactor = Arc::new(IpcReactor::new());
        let (tx, rx) = unbounded();
        let hits = Arc::new(AtomicUsize::new(0));

        let h = Arc::clone(&hits);
        let poll = rx.clone();
        reactor.register_channel(
            rx,
            Box::new(move || {
                let _ = poll.try_recv();
                h.fetch_add(1, Ordering::SeqCst);
                false
            }),
        );

        let r = Arc::clone(&reactor);
        let thread = std::thread::spawn(move || r.run());
        tx.send("a".into()).unwrap();
        tx.send("b".into()).unwrap();
        std::thread::sleep(Duration::from_millis(300));
        reactor.stop();
        thread.join().unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1, "removed after first call");
    }

    #[test]
    fn timers_fire_periodically() {
        let reactor = Arc::new(IpcReactor::new());
        let ticks = Arc::new(AtomicUsize::new(0));
        let t = Arc::clone(&ticks);
        reactor.register_timer(
            Duration::from_millis(20),
            Box::new(move || {
                t.fetch_add(1, Ordering::SeqCst);
            }),
        );
        let r = Arc::clone(&reactor);
        let thread = std::thread::spawn(move || r.run());
        std::thread::sleep(Duration::from_millis(150));
        reactor.stop();
        thread.join().unwrap();
        assert!(ticks.load(Ordering::SeqCst) >= 3);
    }
}
