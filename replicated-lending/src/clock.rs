//! Lamport logical clock shared by every actor in the process.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct LamportClock {
    counter: AtomicU64,
}

impl LamportClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advances the clock for a local event and returns the new value.
    pub fn tick(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Merges a timestamp received from another actor: `max(local, remote) + 1`.
    pub fn observe(&self, remote: u64) -> u64 {
        let mut current = self.counter.load(Ordering::Acquire);
        loop {
            let next = current.max(remote).saturating_add(1);
            match self.counter.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }

    /// Stamps an inbound message, merging its timestamp when it carries one.
    pub fn stamp(&self, remote: Option<u64>) -> u64 {
        match remote {
            Some(remote) => self.observe(remote),
            None => self.tick(),
        }
    }

    pub fn current(&self) -> u64 {
        self.counter.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn tick_is_strictly_increasing() {
        let clock = LamportClock::new();
        assert_eq!(clock.tick(), 1);
        assert_eq!(clock.tick(), 2);
        assert_eq!(clock.current(), 2);
    }

    #[test]
    fn observe_jumps_past_remote() {
        let clock = LamportClock::new();
        clock.tick();
        assert_eq!(clock.observe(10), 11);
        // An older remote timestamp still advances the clock.
        assert_eq!(clock.observe(3), 12);
    }

    #[test]
    fn stamp_uses_remote_when_present() {
        let clock = LamportClock::new();
        assert_eq!(clock.stamp(None), 1);
        assert_eq!(clock.stamp(Some(41)), 42);
    }

    #[test]
    fn concurrent_ticks_never_lose_updates() {
        let clock = Arc::new(LamportClock::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let clock = Arc::clone(&clock);
                thread::spawn(move || {
                    for i in 0..1_000 {
                        if i % 10 == 0 {
                            clock.observe(i);
                        } else {
                            clock.tick();
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(clock.current() >= 8_000);
    }
}
