// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Sliding-window rate limiting per client key.
//!
//! Every admitted request records its timestamp under the caller's
//! [`ClientKey`]. On each check the timestamps older than the window are
//! dropped, and the request is admitted only if fewer than `max_requests`
//! remain. A rejected request is **not** recorded: a caller that keeps
//! hammering a full bucket is let back in as soon as its oldest admitted
//! request ages out, not later.
//!
//! The limiter is an owned value. The server shares one instance through
//! `Arc<dyn Limiter>`, and tests build their own with a [`ManualClock`].
//! A deployment with several gateway processes needs a shared store behind
//! the same [`Limiter::admit`] contract.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::client_id::ClientKey;
use crate::locks::resilient_lock;

/// Default window length: 10 minutes.
pub const DEFAULT_WINDOW_MS: u64 = 600_000;

/// Default number of requests admitted per window.
pub const DEFAULT_MAX_REQUESTS: usize = 60;

/// Default chance that a single `admit` call also sweeps idle keys.
pub const DEFAULT_SWEEP_PROBABILITY: f64 = 0.1;

// ============================================================================
// CLOCK
// ============================================================================

/// Source of "now" in milliseconds since the Unix epoch.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default()
    }
}

/// Manually driven clock for deterministic tests.
///
/// Clones share the same time value, so a test can hand one clone to the
/// limiter and keep another to advance time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(start_ms)),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set(&self, now_ms: u64) {
        self.now.store(now_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

// ============================================================================
// SETTINGS
// ============================================================================

/// Rate-limit configuration section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    /// Window length in milliseconds.
    pub window_ms: u64,
    /// Requests admitted per client within one window.
    pub max_requests: usize,
    /// Probability in `[0, 1]` that an `admit` call sweeps idle keys.
    pub sweep_probability: f64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            window_ms: DEFAULT_WINDOW_MS,
            max_requests: DEFAULT_MAX_REQUESTS,
            sweep_probability: DEFAULT_SWEEP_PROBABILITY,
        }
    }
}

// ============================================================================
// LIMITER
// ============================================================================

/// Admission contract shared by every rate-limit backend.
pub trait Limiter: Send + Sync {
    /// Returns `true` and records the request if `key` is under its limit.
    /// Never fails; an unknown key has made zero requests.
    fn admit(&self, key: &ClientKey) -> bool;

    /// Length of the sliding window.
    fn window(&self) -> Duration;
}

/// In-process sliding-window limiter.
///
/// The whole read-filter-append sequence runs under a single mutex, so two
/// concurrent requests from the same key can never both observe
/// `max_requests - 1` and both get in.
#[derive(Debug)]
pub struct SlidingWindowLimiter<C: Clock = SystemClock> {
    windows: Mutex<HashMap<String, Vec<u64>>>,
    window_ms: u64,
    max_requests: usize,
    sweep_probability: f64,
    clock: C,
}

impl SlidingWindowLimiter<SystemClock> {
    /// Create a limiter on the wall clock.
    pub fn new(window: Duration, max_requests: usize) -> Self {
        Self::with_clock(window, max_requests, SystemClock)
    }

    pub fn from_settings(settings: &RateLimitSettings) -> Self {
        Self::new(Duration::from_millis(settings.window_ms), settings.max_requests)
            .with_sweep_probability(settings.sweep_probability)
    }
}

impl<C: Clock> SlidingWindowLimiter<C> {
    /// Create a limiter reading time from `clock`.
    pub fn with_clock(window: Duration, max_requests: usize, clock: C) -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            window_ms: window.as_millis() as u64,
            max_requests,
            sweep_probability: DEFAULT_SWEEP_PROBABILITY,
            clock,
        }
    }

    /// Set the per-call sweep probability, clamped to `[0, 1]`.
    /// `0.0` disables opportunistic sweeping.
    pub fn with_sweep_probability(mut self, probability: f64) -> Self {
        self.sweep_probability = if probability.is_nan() {
            0.0
        } else {
            probability.clamp(0.0, 1.0)
        };
        self
    }

    pub fn max_requests(&self) -> usize {
        self.max_requests
    }

    /// Number of keys currently holding a timestamp list.
    pub fn tracked_clients(&self) -> usize {
        resilient_lock(&self.windows).len()
    }

    /// Requests from `key` that still count against its limit right now.
    pub fn current_count(&self, key: &ClientKey) -> usize {
        let now = self.clock.now_ms();
        resilient_lock(&self.windows)
            .get(key.as_str())
            .map(|stamps| stamps.iter().filter(|&&ts| self.in_window(now, ts)).count())
            .unwrap_or(0)
    }

    /// Drop every key whose timestamps have all aged out.
    ///
    /// Housekeeping only: admission correctness never depends on a sweep
    /// having run.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now_ms();
        let mut windows = resilient_lock(&self.windows);
        self.sweep_locked(&mut windows, now)
    }

    fn sweep_locked(&self, windows: &mut HashMap<String, Vec<u64>>, now: u64) -> usize {
        let before = windows.len();
        windows.retain(|_, stamps| {
            stamps.retain(|&ts| self.in_window(now, ts));
            !stamps.is_empty()
        });
        let evicted = before - windows.len();
        if evicted > 0 {
            tracing::debug!(evicted, remaining = windows.len(), "Swept idle rate-limit keys");
        }
        evicted
    }

    fn in_window(&self, now: u64, ts: u64) -> bool {
        now.saturating_sub(ts) < self.window_ms
    }

    fn should_sweep(&self) -> bool {
        self.sweep_probability > 0.0 && rand::thread_rng().gen_bool(self.sweep_probability)
    }
}

impl<C: Clock> Limiter for SlidingWindowLimiter<C> {
    fn admit(&self, key: &ClientKey) -> bool {
        let now = self.clock.now_ms();
        let mut windows = resilient_lock(&self.windows);

        let mut stamps = windows.remove(key.as_str()).unwrap_or_default();
        stamps.retain(|&ts| self.in_window(now, ts));

        let admitted = stamps.len() < self.max_requests;
        if admitted {
            stamps.push(now);
        }
        let count = stamps.len();
        if !stamps.is_empty() {
            windows.insert(key.as_str().to_string(), stamps);
        }

        if self.should_sweep() {
            self.sweep_locked(&mut windows, now);
        }
        drop(windows);

        if admitted {
            tracing::debug!(client = %key, count, limit = self.max_requests, "Request admitted");
        } else {
            tracing::warn!(client = %key, limit = self.max_requests, "Rate limit exceeded");
        }
        admitted
    }

    fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}
