//! Tick-driven sleep queue.
//!
//! `sleep` suspends the caller until the monotonic tick counter has advanced
//! by the requested amount. Sleepers sit in one list ordered by wake time;
//! the tick handler pops and signals from the front and stops at the first
//! sleeper that is not yet due, so a tick touches only the sleepers it wakes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use spin::Mutex;

use crate::sync::Semaphore;

struct Sleeper {
    wake: u64,
    sema: Semaphore,
}

pub struct Timer {
    ticks: AtomicU64,
    /// Ordered by `wake` ascending; ties keep insertion order so wake-ups
    /// with the same deadline are delivered in tick order.
    sleepers: Mutex<Vec<Arc<Sleeper>>>,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            ticks: AtomicU64::new(0),
            sleepers: Mutex::new(Vec::new()),
        }
    }

    /// Ticks since boot.
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::SeqCst)
    }

    /// Suspends the caller for at least `ticks` timer ticks.
    pub fn sleep(&self, ticks: u64) {
        if ticks == 0 {
            return;
        }
        let sleeper = Arc::new(Sleeper {
            wake: self.ticks() + ticks,
            sema: Semaphore::new(0),
        });

        let mut sleepers = self.sleepers.lock();
        let at = sleepers
            .iter()
            .position(|s| s.wake > sleeper.wake)
            .unwrap_or(sleepers.len());
        sleepers.insert(at, Arc::clone(&sleeper));
        drop(sleepers);

        sleeper.sema.wait();
    }

    /// Advances the tick counter and wakes every sleeper that is due.
    pub fn tick(&self) {
        let now = self.ticks.fetch_add(1, Ordering::SeqCst) + 1;
        let mut sleepers = self.sleepers.lock();
        while let Some(first) = sleepers.first() {
            if first.wake > now {
                // The list is ordered, so nobody further down is due either.
                break;
            }
            let sleeper = sleepers.remove(0);
            sleeper.sema.signal();
        }
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn wakes_in_deadline_order() {
        let timer = Arc::new(Timer::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for &(name, ticks) in &[("a", 30u64), ("b", 10), ("c", 20)] {
            let timer = Arc::clone(&timer);
            let order = Arc::clone(&order);
            handles.push(thread::spawn(move || {
                timer.sleep(ticks);
                order.lock().push(name);
            }));
        }

        // Let all three park before time advances.
        while timer.sleepers.lock().len() < 3 {
            thread::yield_now();
        }
        for _ in 0..30 {
            timer.tick();
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*order.lock(), vec!["b", "c", "a"]);
    }

    #[test]
    fn sleeper_not_woken_early() {
        let timer = Arc::new(Timer::new());
        let other = Arc::clone(&timer);
        let handle = thread::spawn(move || {
            other.sleep(5);
            other.ticks()
        });
        while timer.sleepers.lock().is_empty() {
            thread::yield_now();
        }
        for _ in 0..5 {
            timer.tick();
        }
        assert!(handle.join().unwrap() >= 5);
    }
}
