//! Per-client Cooldown Rate Limiter
//!
//! Back-pressure at the relay boundary. Every client identifier owns a window
//! of slots; a slot is taken when a request is admitted and stays taken until
//! one cooldown period after the request completed, whatever the outcome.
//!
//! # Accounting
//!
//! ```text
//! admitted ──► in_flight ──(permit completed/dropped)──► release at t + cooldown ──► free
//! ```
//!
//! A request is admitted only while `in_flight + live releases < max_requests`.
//! Rejections are immediate and take no slot. There are no timers: expired
//! releases are pruned lazily on admission and by [`CooldownLimiter::sweep`],
//! which the daemon runs on an interval.
//!
//! Every time-dependent operation has an `_at` twin taking an explicit
//! [`Instant`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use thiserror::Error;
use tracing::debug;

/// Default number of requests per client per window
pub const DEFAULT_MAX_REQUESTS: u32 = 15;

/// Default cooldown window
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(60);

// ============================================================================
// Configuration
// ============================================================================

/// Rate limiter settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Admit everything when false
    pub enabled: bool,
    /// Slots per client
    pub max_requests: u32,
    /// How long a slot stays taken after its request completed
    pub cooldown: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_requests: DEFAULT_MAX_REQUESTS,
            cooldown: DEFAULT_COOLDOWN,
        }
    }
}

/// A rejected admission
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[error("Rate limit exceeded: {limit} requests per window, retry after {}s", retry_after.as_secs())]
pub struct RateLimited {
    /// Time until a slot frees up
    pub retry_after: Duration,
    /// Configured slots per client
    pub limit: u32,
}

// ============================================================================
// Limiter
// ============================================================================

/// Slot usage of one client
#[derive(Debug, Default)]
struct ClientWindow {
    /// Admitted requests that have not completed
    in_flight: u32,
    /// Instants at which cooldown slots free up
    releases: Vec<Instant>,
}

impl ClientWindow {
    fn prune(&mut self, now: Instant) {
        self.releases.retain(|release| *release > now);
    }

    fn used(&self) -> u32 {
        self.in_flight
            .saturating_add(u32::try_from(self.releases.len()).unwrap_or(u32::MAX))
    }

    fn is_idle(&self) -> bool {
        self.in_flight == 0 && self.releases.is_empty()
    }

    /// Whole seconds until the next slot frees, at least one
    fn retry_after(&self, now: Instant, cooldown: Duration) -> Duration {
        let Some(earliest) = self.releases.iter().min() else {
            return cooldown.max(Duration::from_secs(1));
        };
        let wait = earliest.saturating_duration_since(now);
        let secs = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
        Duration::from_secs(secs.max(1))
    }
}

#[derive(Debug)]
struct LimiterInner {
    config: RateLimitConfig,
    clients: DashMap<String, ClientWindow>,
}

/// Concurrency-safe per-client limiter
///
/// Cheap to clone; clones share the same store.
#[derive(Clone, Debug)]
pub struct CooldownLimiter {
    inner: Arc<LimiterInner>,
}

impl Default for CooldownLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}

impl CooldownLimiter {
    /// Create a limiter with the given settings
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            inner: Arc::new(LimiterInner {
                config,
                clients: DashMap::new(),
            }),
        }
    }

    /// Active settings
    #[must_use]
    pub fn config(&self) -> &RateLimitConfig {
        &self.inner.config
    }

    /// Try to admit a request for `client` now
    ///
    /// # Errors
    ///
    /// Returns [`RateLimited`] when every slot of the client is taken.
    pub fn try_acquire(&self, client: &str) -> Result<RatePermit, RateLimited> {
        self.try_acquire_at(client, Instant::now())
    }

    /// Try to admit a request for `client` at `now`
    ///
    /// # Errors
    ///
    /// Returns [`RateLimited`] when every slot of the client is taken.
    pub fn try_acquire_at(&self, client: &str, now: Instant) -> Result<RatePermit, RateLimited> {
        let config = &self.inner.config;
        if !config.enabled {
            return Ok(RatePermit::untracked(client));
        }

        let mut window = self.inner.clients.entry(client.to_string()).or_default();
        window.prune(now);

        if window.used() >= config.max_requests {
            return Err(RateLimited {
                retry_after: window.retry_after(now, config.cooldown),
                limit: config.max_requests,
            });
        }

        window.in_flight += 1;
        Ok(RatePermit {
            limiter: Some(self.clone()),
            client: client.to_string(),
        })
    }

    /// Slots `client` could still take at `now`
    #[must_use]
    pub fn remaining_at(&self, client: &str, now: Instant) -> u32 {
        let max = self.inner.config.max_requests;
        match self.inner.clients.get(client) {
            Some(window) => {
                let live = window.releases.iter().filter(|r| **r > now).count();
                let used = window
                    .in_flight
                    .saturating_add(u32::try_from(live).unwrap_or(u32::MAX));
                max.saturating_sub(used)
            }
            None => max,
        }
    }

    /// Number of clients currently tracked
    #[must_use]
    pub fn tracked_clients(&self) -> usize {
        self.inner.clients.len()
    }

    /// Drop expired releases and idle clients
    ///
    /// Returns the number of clients removed.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    /// Drop releases expired at `now` and idle clients
    pub fn sweep_at(&self, now: Instant) -> usize {
        let mut removed = 0;
        self.inner.clients.retain(|_, window| {
            window.prune(now);
            let keep = !window.is_idle();
            if !keep {
                removed += 1;
            }
            keep
        });
        if removed > 0 {
            debug!(removed, "Swept idle rate-limit entries");
        }
        removed
    }

    fn complete_at(&self, client: &str, now: Instant) {
        let release = now + self.inner.config.cooldown;
        let mut window = self.inner.clients.entry(client.to_string()).or_default();
        window.in_flight = window.in_flight.saturating_sub(1);
        window.releases.push(release);
    }
}

// ============================================================================
// Permit
// ============================================================================

/// Proof of admission
///
/// Completing or dropping the permit starts the cooldown of its slot. This
/// happens exactly once.
#[derive(Debug)]
#[must_use]
pub struct RatePermit {
    limiter: Option<CooldownLimiter>,
    client: String,
}

impl RatePermit {
    fn untracked(client: &str) -> Self {
        Self {
            limiter: None,
            client: client.to_string(),
        }
    }

    /// Client identifier the permit was issued to
    #[must_use]
    pub fn client(&self) -> &str {
        &self.client
    }

    /// Mark the request completed now
    pub fn complete(self) {
        self.complete_at(Instant::now());
    }

    /// Mark the request completed at `now`
    pub fn complete_at(mut self, now: Instant) {
        if let Some(limiter) = self.limiter.take() {
            limiter.complete_at(&self.client, now);
        }
    }
}

impl Drop for RatePermit {
    fn drop(&mut self) {
        if let Some(limiter) = self.limiter.take() {
            limiter.complete_at(&self.client, Instant::now());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn limiter(max_requests: u32, cooldown_secs: u64) -> CooldownLimiter {
        CooldownLimiter::new(RateLimitConfig {
            enabled: true,
            max_requests,
            cooldown: Duration::from_secs(cooldown_secs),
        })
    }

    #[test]
    fn test_boundary_n_accepted_n_plus_one_rejected() {
        let limiter = CooldownLimiter::default();
        let now = Instant::now();

        let permits: Vec<_> = (0..DEFAULT_MAX_REQUESTS)
            .map(|_| limiter.try_acquire_at("10.0.0.1", now).unwrap())
            .collect();
        assert_eq!(permits.len(), 15);

        let rejected = limiter.try_acquire_at("10.0.0.1", now).unwrap_err();
        assert_eq!(rejected.limit, 15);
        assert_eq!(rejected.retry_after, DEFAULT_COOLDOWN);
    }

    #[test]
    fn test_clients_are_isolated() {
        let limiter = limiter(1, 60);
        let now = Instant::now();

        let _a = limiter.try_acquire_at("a", now).unwrap();
        assert!(limiter.try_acquire_at("a", now).is_err());
        assert!(limiter.try_acquire_at("b", now).is_ok());
    }

    #[test]
    fn test_rejection_takes_no_slot() {
        let limiter = limiter(2, 60);
        let start = Instant::now();

        limiter.try_acquire_at("c", start).unwrap().complete_at(start);
        limiter.try_acquire_at("c", start).unwrap().complete_at(start);
        for _ in 0..5 {
            assert!(limiter.try_acquire_at("c", start).is_err());
        }

        // Both releases expire together; rejections added nothing
        let later = start + Duration::from_secs(61);
        assert_eq!(limiter.remaining_at("c", later), 2);
        assert!(limiter.try_acquire_at("c", later).is_ok());
    }

    #[test]
    fn test_cooldown_measured_from_completion() {
        let limiter = limiter(1, 60);
        let start = Instant::now();

        let permit = limiter.try_acquire_at("d", start).unwrap();
        // A long request keeps its slot until it completes
        let finished = start + Duration::from_secs(100);
        assert!(limiter.try_acquire_at("d", finished).is_err());
        permit.complete_at(finished);

        let rejected = limiter
            .try_acquire_at("d", finished + Duration::from_secs(30))
            .unwrap_err();
        assert_eq!(rejected.retry_after, Duration::from_secs(30));

        assert!(limiter
            .try_acquire_at("d", finished + Duration::from_millis(59_999))
            .is_err());
        assert!(limiter
            .try_acquire_at("d", finished + Duration::from_secs(60))
            .is_ok());
    }

    #[test]
    fn test_retry_after_rounds_up_to_whole_seconds() {
        let limiter = limiter(1, 60);
        let start = Instant::now();
        limiter.try_acquire_at("e", start).unwrap().complete_at(start);

        let rejected = limiter
            .try_acquire_at("e", start + Duration::from_millis(59_500))
            .unwrap_err();
        assert_eq!(rejected.retry_after, Duration::from_secs(1));

        let rejected = limiter
            .try_acquire_at("e", start + Duration::from_millis(10_200))
            .unwrap_err();
        assert_eq!(rejected.retry_after, Duration::from_secs(50));
    }

    #[test]
    fn test_drop_completes_exactly_once() {
        let limiter = limiter(3, 60);
        let now = Instant::now();

        let permit = limiter.try_acquire_at("f", now).unwrap();
        assert_eq!(limiter.remaining_at("f", now), 2);
        drop(permit);
        // Slot moved from in-flight to cooldown, not freed and not doubled
        assert_eq!(limiter.remaining_at("f", now), 2);

        let permit = limiter.try_acquire_at("f", now).unwrap();
        permit.complete_at(now);
        assert_eq!(limiter.remaining_at("f", now), 1);
    }

    #[test]
    fn test_sweep_removes_idle_clients() {
        let limiter = limiter(2, 60);
        let start = Instant::now();

        limiter.try_acquire_at("g", start).unwrap().complete_at(start);
        let _held = limiter.try_acquire_at("h", start).unwrap();
        assert_eq!(limiter.tracked_clients(), 2);

        assert_eq!(limiter.sweep_at(start + Duration::from_secs(30)), 0);
        assert_eq!(limiter.sweep_at(start + Duration::from_secs(61)), 1);
        // In-flight client stays tracked
        assert_eq!(limiter.tracked_clients(), 1);
    }

    #[test]
    fn test_disabled_admits_everything() {
        let limiter = CooldownLimiter::new(RateLimitConfig {
            enabled: false,
            max_requests: 1,
            cooldown: DEFAULT_COOLDOWN,
        });
        let now = Instant::now();
        let permits: Vec<_> = (0..10)
            .map(|_| limiter.try_acquire_at("i", now).unwrap())
            .collect();
        assert_eq!(permits.len(), 10);
        drop(permits);
        assert_eq!(limiter.tracked_clients(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_admission_respects_ceiling() {
        let limiter = limiter(15, 60);
        let mut handles = Vec::new();
        for _ in 0..64 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move { limiter.try_acquire("shared") }));
        }

        let mut admitted = Vec::new();
        let mut rejected = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(permit) => admitted.push(permit),
                Err(_) => rejected += 1,
            }
        }

        assert_eq!(admitted.len(), 15);
        assert_eq!(rejected, 49);
    }
}
