// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Race Detection Tests for askgate
//!
//! These tests hammer the shared admission state from many threads and tasks
//! at once. The invariant under test is simple: however requests interleave,
//! a client never gets more than `max_requests` admissions per window.
//!
//! # Running with ThreadSanitizer
//!
//! ```bash
//! RUSTFLAGS="-Z sanitizer=thread" cargo +nightly test --target x86_64-unknown-linux-gnu --test race_detection_test
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use askgate::client_id::ClientKey;
use askgate::guardrail::{AdmissionGuardrail, SubjectProfile};
use askgate::orchestrator::{CompletionOrchestrator, GatewayError, Reply};
use askgate::prompt::PromptBuilder;
use askgate::ratelimit::{Limiter, ManualClock, SlidingWindowLimiter};
use askgate::upstream::{CompletionBackend, CompletionPayload, CompletionRequest, UpstreamError};
use axum::http::{HeaderMap, HeaderValue};
use tokio::time::timeout;

// Test configuration
const CONCURRENCY_LEVEL: usize = 100;
const MAX_REQUESTS: usize = 60;
const TEST_TIMEOUT_SECS: u64 = 30;

fn limiter(max: usize) -> Arc<SlidingWindowLimiter<ManualClock>> {
    Arc::new(
        SlidingWindowLimiter::with_clock(Duration::from_secs(600), max, ManualClock::new(0))
            .with_sweep_probability(1.0),
    )
}

// =============================================================================
// LIMITER UNDER OS THREADS
// =============================================================================

#[test]
fn test_concurrent_admits_never_exceed_ceiling_threads() {
    let limiter = limiter(MAX_REQUESTS);
    let admitted = Arc::new(AtomicUsize::new(0));
    let key = ClientKey::new("203.0.113.1");

    let handles: Vec<_> = (0..CONCURRENCY_LEVEL)
        .map(|_| {
            let limiter = Arc::clone(&limiter);
            let admitted = Arc::clone(&admitted);
            let key = key.clone();
            thread::spawn(move || {
                if limiter.admit(&key) {
                    admitted.fetch_add(1, Ordering::SeqCst);
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("admit must not panic");
    }

    assert_eq!(admitted.load(Ordering::SeqCst), MAX_REQUESTS);
    assert_eq!(limiter.current_count(&key), MAX_REQUESTS);
}

#[test]
fn test_concurrent_keys_are_independent() {
    let limiter = limiter(5);
    let per_key: Vec<Arc<AtomicUsize>> = (0..10).map(|_| Arc::new(AtomicUsize::new(0))).collect();

    let handles: Vec<_> = (0..CONCURRENCY_LEVEL)
        .map(|i| {
            let limiter = Arc::clone(&limiter);
            let counter = Arc::clone(&per_key[i % 10]);
            thread::spawn(move || {
                let key = ClientKey::new(format!("10.0.0.{}", i % 10));
                if limiter.admit(&key) {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("admit must not panic");
    }

    // 10 attempts per key, 5 admitted each.
    for counter in &per_key {
        assert_eq!(counter.load(Ordering::SeqCst), 5);
    }
    assert_eq!(limiter.tracked_clients(), 10);
}

#[test]
fn test_sweep_races_with_admit() {
    let limiter = limiter(MAX_REQUESTS);
    let sweeper = {
        let limiter = Arc::clone(&limiter);
        thread::spawn(move || {
            for _ in 0..1_000 {
                limiter.sweep();
            }
        })
    };

    let admitted: usize = (0..4)
        .map(|_| {
            let limiter = Arc::clone(&limiter);
            thread::spawn(move || (0..50).filter(|_| limiter.admit(&ClientKey::new("shared"))).count())
        })
        .collect::<Vec<_>>()
        .into_iter()
        .map(|h| h.join().expect("admit must not panic"))
        .sum();

    sweeper.join().expect("sweep must not panic");
    assert_eq!(admitted, MAX_REQUESTS);
}

// =============================================================================
// ORCHESTRATOR UNDER TOKIO TASKS
// =============================================================================

struct CountingBackend {
    calls: AtomicUsize,
}

impl CompletionBackend for CountingBackend {
    async fn complete(&self, _request: &CompletionRequest) -> Result<CompletionPayload, UpstreamError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        Ok(CompletionPayload::with_answer("ok"))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_through_orchestrator() {
    let limiter: Arc<dyn Limiter> = limiter(MAX_REQUESTS);
    let guardrail = AdmissionGuardrail::new(&SubjectProfile::default()).unwrap();
    let orchestrator = Arc::new(CompletionOrchestrator::new(
        CountingBackend { calls: AtomicUsize::new(0) },
        limiter,
        guardrail,
        PromptBuilder::new("SYS", "BG"),
    ));

    let tasks: Vec<_> = (0..CONCURRENCY_LEVEL)
        .map(|_| {
            let orchestrator = Arc::clone(&orchestrator);
            tokio::spawn(async move {
                let mut headers = HeaderMap::new();
                headers.insert("x-forwarded-for", HeaderValue::from_static("198.51.100.9"));
                orchestrator.handle(&headers, br#"{"question":"Tell me about Shrihari"}"#).await
            })
        })
        .collect();

    let results = timeout(Duration::from_secs(TEST_TIMEOUT_SECS), async {
        let mut out = Vec::with_capacity(tasks.len());
        for task in tasks {
            out.push(task.await.expect("task must not panic"));
        }
        out
    })
    .await
    .expect("requests must finish before the test timeout");

    let answered = results.iter().filter(|r| matches!(r, Ok(Reply::Answered { .. }))).count();
    let limited = results
        .iter()
        .filter(|r| matches!(r, Err(GatewayError::RateLimited { .. })))
        .count();

    assert_eq!(answered, MAX_REQUESTS);
    assert_eq!(limited, CONCURRENCY_LEVEL - MAX_REQUESTS);
    assert_eq!(orchestrator.backend().calls.load(Ordering::SeqCst), MAX_REQUESTS);
}
