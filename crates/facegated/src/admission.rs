//! Per-client sliding-window admission control.
//!
//! No client key gets more than `limit` admitted requests in any trailing
//! window of length `window`. Rejected requests are not recorded.

use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

type Window = Arc<Mutex<VecDeque<Instant>>>;

pub struct AdmissionController {
    limit: usize,
    window: Duration,
    max_clients: usize,
    /// The map lock is only held to look up or insert a key; each key's
    /// window has its own mutex, so distinct clients never contend.
    clients: RwLock<HashMap<String, Window>>,
}

impl AdmissionController {
    pub fn new(limit: usize, window: Duration, max_clients: usize) -> Self {
        Self {
            limit,
            window,
            max_clients,
            clients: RwLock::new(HashMap::new()),
        }
    }

    /// Admit or reject one request from `client_key`.
    pub fn check(&self, client_key: &str) -> bool {
        self.check_at(client_key, Instant::now())
    }

    pub(crate) fn check_at(&self, client_key: &str, now: Instant) -> bool {
        let window = self.window_for(client_key, now);
        let mut stamps = window.lock();
        prune(&mut stamps, now, self.window);

        if stamps.len() >= self.limit {
            tracing::debug!(client = client_key, limit = self.limit, "request rejected by rate limit");
            return false;
        }
        stamps.push_back(now);
        true
    }

    fn window_for(&self, client_key: &str, now: Instant) -> Window {
        if let Some(window) = self.clients.read().get(client_key) {
            return Arc::clone(window);
        }

        if self.tracked_clients() >= self.max_clients {
            self.sweep_at(now);
        }

        let mut clients = self.clients.write();
        Arc::clone(clients.entry(client_key.to_string()).or_default())
    }

    /// Drop clients with no requests inside the current window.
    /// Returns the number of keys removed.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    pub(crate) fn sweep_at(&self, now: Instant) -> usize {
        let mut clients = self.clients.write();
        let before = clients.len();
        clients.retain(|_, window| {
            let mut stamps = window.lock();
            prune(&mut stamps, now, self.window);
            // A caller may hold a clone of this window; keep it so its
            // pending push is not lost.
            !stamps.is_empty() || Arc::strong_count(window) > 1
        });
        let removed = before - clients.len();
        if removed > 0 {
            tracing::debug!(removed, remaining = clients.len(), "rate limit windows swept");
        }
        removed
    }

    pub fn tracked_clients(&self) -> usize {
        self.clients.read().len()
    }
}

fn prune(stamps: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(&oldest) = stamps.front() {
        if now.saturating_duration_since(oldest) >= window {
            stamps.pop_front();
        } else {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const SECOND: Duration = Duration::from_secs(1);

    #[test]
    fn test_limit_within_window() {
        let ac = AdmissionController::new(5, SECOND, 100);
        let t0 = Instant::now();
        for i in 0..5 {
            assert!(ac.check_at("10.0.0.1", t0 + Duration::from_millis(i * 100)));
        }
        assert!(!ac.check_at("10.0.0.1", t0 + Duration::from_millis(900)));
        // Window fully elapsed since the first admit.
        assert!(ac.check_at("10.0.0.1", t0 + Duration::from_millis(1000)));
    }

    #[test]
    fn test_rejections_are_not_recorded() {
        let ac = AdmissionController::new(2, SECOND, 100);
        let t0 = Instant::now();
        assert!(ac.check_at("k", t0));
        assert!(ac.check_at("k", t0));
        for i in 1..10 {
            assert!(!ac.check_at("k", t0 + Duration::from_millis(i * 10)));
        }
        // Only the two admits count, so both slots reopen at t0 + 1s.
        assert!(ac.check_at("k", t0 + SECOND));
        assert!(ac.check_at("k", t0 + SECOND));
        assert!(!ac.check_at("k", t0 + SECOND));
    }

    #[test]
    fn test_window_slides() {
        let ac = AdmissionController::new(2, SECOND, 100);
        let t0 = Instant::now();
        assert!(ac.check_at("k", t0));
        assert!(ac.check_at("k", t0 + Duration::from_millis(600)));
        assert!(!ac.check_at("k", t0 + Duration::from_millis(900)));
        // First stamp expired; second still inside.
        assert!(ac.check_at("k", t0 + Duration::from_millis(1100)));
        assert!(!ac.check_at("k", t0 + Duration::from_millis(1500)));
    }

    #[test]
    fn test_keys_are_independent() {
        let ac = AdmissionController::new(1, SECOND, 100);
        let t0 = Instant::now();
        assert!(ac.check_at("alice", t0));
        assert!(!ac.check_at("alice", t0));
        assert!(ac.check_at("bob", t0));
    }

    #[test]
    fn test_real_clock() {
        let ac = AdmissionController::new(5, Duration::from_millis(200), 100);
        for _ in 0..5 {
            assert!(ac.check(":1.42"));
        }
        assert!(!ac.check(":1.42"));
        std::thread::sleep(Duration::from_millis(250));
        assert!(ac.check(":1.42"));
    }

    #[test]
    fn test_concurrent_same_key_never_over_admits() {
        let ac = Arc::new(AdmissionController::new(5, Duration::from_secs(60), 100));
        let admitted = Arc::new(AtomicUsize::new(0));
        let threads: Vec<_> = (0..16)
            .map(|_| {
                let ac = Arc::clone(&ac);
                let admitted = Arc::clone(&admitted);
                std::thread::spawn(move || {
                    for _ in 0..20 {
                        if ac.check("shared") {
                            admitted.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(admitted.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_sweep_drops_idle_clients() {
        let ac = AdmissionController::new(5, SECOND, 100);
        let t0 = Instant::now();
        ac.check_at("old", t0);
        ac.check_at("fresh", t0 + Duration::from_millis(800));

        assert_eq!(ac.sweep_at(t0 + Duration::from_millis(1200)), 1);
        assert_eq!(ac.tracked_clients(), 1);
        assert!(ac.clients.read().contains_key("fresh"));
    }

    #[test]
    fn test_client_cap_triggers_sweep() {
        let ac = AdmissionController::new(5, SECOND, 3);
        let t0 = Instant::now();
        for key in ["a", "b", "c"] {
            assert!(ac.check_at(key, t0));
        }
        // All three windows are stale by now; the fourth key forces a sweep.
        assert!(ac.check_at("d", t0 + Duration::from_secs(2)));
        assert_eq!(ac.tracked_clients(), 1);
    }
}
