//! Per-source circuit breaker

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

const NO_TRIAL: u64 = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    /// Cooldown elapsed; one trial call is allowed through
    HalfOpen,
}

/// Opens after `failure_threshold` consecutive failures, stays open for
/// `cooldown`, then admits a single trial call. A successful trial closes the
/// breaker; a failed one restarts the cooldown.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    cooldown: Duration,
    consecutive_failures: AtomicU32,
    open: AtomicBool,
    /// Milliseconds since `epoch`
    opened_at: AtomicU64,
    trial_started: AtomicU64,
    epoch: Instant,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            name: name.into(),
            failure_threshold: failure_threshold.max(1),
            cooldown,
            consecutive_failures: AtomicU32::new(0),
            open: AtomicBool::new(false),
            opened_at: AtomicU64::new(0),
            trial_started: AtomicU64::new(NO_TRIAL),
            epoch: Instant::now(),
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn cooldown_ms(&self) -> u64 {
        self.cooldown.as_millis() as u64
    }

    pub fn state(&self) -> BreakerState {
        if !self.open.load(Ordering::SeqCst) {
            return BreakerState::Closed;
        }
        let opened_at = self.opened_at.load(Ordering::SeqCst);
        if self.now_ms().saturating_sub(opened_at) >= self.cooldown_ms() {
            BreakerState::HalfOpen
        } else {
            BreakerState::Open
        }
    }

    /// Whether a call may proceed. In half-open state only one caller per
    /// cooldown window gets `true`.
    pub fn allow(&self) -> bool {
        match self.state() {
            BreakerState::Closed => true,
            BreakerState::Open => false,
            BreakerState::HalfOpen => {
                let now = self.now_ms();
                let started = self.trial_started.load(Ordering::SeqCst);
                // A trial that never reported back (e.g. aborted) expires after one cooldown
                if started != NO_TRIAL && now.saturating_sub(started) < self.cooldown_ms() {
                    return false;
                }
                let claimed = self
                    .trial_started
                    .compare_exchange(started, now, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok();
                if claimed {
                    info!(provider = %self.name, "Circuit half-open, allowing trial call");
                }
                claimed
            }
        }
    }

    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
        self.trial_started.store(NO_TRIAL, Ordering::SeqCst);
        if self.open.swap(false, Ordering::SeqCst) {
            info!(provider = %self.name, "Circuit closed");
        }
    }

    pub fn record_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst).saturating_add(1);

        if self.trial_started.swap(NO_TRIAL, Ordering::SeqCst) != NO_TRIAL {
            self.opened_at.store(self.now_ms(), Ordering::SeqCst);
            self.open.store(true, Ordering::SeqCst);
            warn!(provider = %self.name, "Trial call failed, circuit re-opened");
            return;
        }

        if failures >= self.failure_threshold && !self.open.swap(true, Ordering::SeqCst) {
            self.opened_at.store(self.now_ms(), Ordering::SeqCst);
            warn!(
                provider = %self.name,
                failures,
                cooldown_secs = self.cooldown.as_secs(),
                "Circuit opened after consecutive failures"
            );
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}
