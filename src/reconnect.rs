//! Reconnection with exponential backoff
//!
//! Outbound persistent peers are re-dialled after any disconnect: delays grow
//! from `initial_delay` by `multiplier` up to `max_delay`, each with ±`jitter`
//! applied, and reset to the initial delay after a successful handshake.
//! Reconnection always uses the configured address string so hostnames are
//! re-resolved by DNS on every attempt.
//!
//! Each address has one record with one outstanding timer; pause, resume,
//! and cancel act on that record explicitly rather than relying on drop
//! order.

use crate::config::ReconnectConfig;
use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

/// Backoff schedule for a single address.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: ReconnectConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: ReconnectConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Delay before the next attempt, or `None` once `max_attempts` is
    /// exhausted (0 means unlimited).
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.attempt = self.attempt.saturating_add(1);
        if self.config.max_attempts != 0 && self.attempt > self.config.max_attempts {
            return None;
        }

        let base = self.config.initial_delay.as_secs_f64()
            * self.config.multiplier.powi(self.attempt as i32 - 1);
        let capped = base.min(self.config.max_delay.as_secs_f64());

        let jittered = if self.config.jitter > 0.0 {
            let spread = rand::thread_rng().gen_range(-self.config.jitter..=self.config.jitter);
            (capped * (1.0 + spread)).max(0.0)
        } else {
            capped
        };
        Some(Duration::from_secs_f64(jittered))
    }

    /// Reset after a successful handshake.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

#[derive(Default)]
struct AddressState {
    paused: bool,
    cancelled: bool,
}

struct AddressEntry {
    state: Mutex<AddressState>,
    changed: Notify,
}

/// Per-address reconnect control shared between the agent and its dial
/// loops.
#[derive(Default)]
pub struct Reconnector {
    addresses: Mutex<HashMap<String, Arc<AddressEntry>>>,
}

impl Reconnector {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, address: &str) -> Arc<AddressEntry> {
        let mut addresses = self.addresses.lock().expect("addresses lock");
        addresses
            .entry(address.to_string())
            .or_insert_with(|| {
                Arc::new(AddressEntry { state: Mutex::new(AddressState::default()), changed: Notify::new() })
            })
            .clone()
    }

    /// Stop scheduling new attempts for this address until resumed.
    pub fn pause(&self, address: &str) {
        let entry = self.entry(address);
        entry.state.lock().expect("state lock").paused = true;
        entry.changed.notify_waiters();
        log::debug!("[reconnect] paused {}", address);
    }

    pub fn resume(&self, address: &str) {
        let entry = self.entry(address);
        entry.state.lock().expect("state lock").paused = false;
        entry.changed.notify_waiters();
        log::debug!("[reconnect] resumed {}", address);
    }

    /// Cancel reconnection permanently (peer removed or agent shutting
    /// down). The dial loop exits at its next check.
    pub fn cancel(&self, address: &str) {
        let entry = self.entry(address);
        entry.state.lock().expect("state lock").cancelled = true;
        entry.changed.notify_waiters();
        log::debug!("[reconnect] cancelled {}", address);
    }

    pub fn is_cancelled(&self, address: &str) -> bool {
        self.entry(address).state.lock().expect("state lock").cancelled
    }

    /// Block while the address is paused; returns `false` if it was
    /// cancelled instead.
    pub async fn wait_ready(&self, address: &str) -> bool {
        let entry = self.entry(address);
        loop {
            let notified = entry.changed.notified();
            {
                let state = entry.state.lock().expect("state lock");
                if state.cancelled {
                    return false;
                }
                if !state.paused {
                    return true;
                }
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(jitter: f64) -> ReconnectConfig {
        ReconnectConfig {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter,
            max_attempts: 0,
        }
    }

    #[test]
    fn test_backoff_doubles_to_cap_without_jitter() {
        let mut backoff = Backoff::new(config(0.0));
        let delays: Vec<u64> = (0..8).map(|_| backoff.next_delay().unwrap().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 60, 60]);
    }

    #[test]
    fn test_backoff_jitter_stays_within_band() {
        let mut backoff = Backoff::new(config(0.2));
        for expected in [1.0_f64, 2.0, 4.0, 8.0] {
            let delay = backoff.next_delay().unwrap().as_secs_f64();
            assert!(delay >= expected * 0.8 - 1e-9, "{} below band for base {}", delay, expected);
            assert!(delay <= expected * 1.2 + 1e-9, "{} above band for base {}", delay, expected);
        }
    }

    #[test]
    fn test_backoff_resets_on_success() {
        let mut backoff = Backoff::new(config(0.0));
        backoff.next_delay();
        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.attempt(), 3);
        backoff.reset();
        assert_eq!(backoff.next_delay().unwrap(), Duration::from_secs(1));
    }

    #[test]
    fn test_backoff_exhausts_max_attempts() {
        let mut limited = Backoff::new(ReconnectConfig { max_attempts: 2, ..config(0.0) });
        assert!(limited.next_delay().is_some());
        assert!(limited.next_delay().is_some());
        assert!(limited.next_delay().is_none());
    }

    #[tokio::test]
    async fn test_pause_resume_cancel() {
        let reconnector = Arc::new(Reconnector::new());
        assert!(reconnector.wait_ready("a:1").await);

        reconnector.pause("a:1");
        let waiting = {
            let reconnector = Arc::clone(&reconnector);
            tokio::spawn(async move { reconnector.wait_ready("a:1").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiting.is_finished());
        reconnector.resume("a:1");
        assert!(waiting.await.unwrap());

        reconnector.cancel("a:1");
        assert!(!reconnector.wait_ready("a:1").await);
        assert!(reconnector.is_cancelled("a:1"));
    }
}
