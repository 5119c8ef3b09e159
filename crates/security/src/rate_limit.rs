//! Abuse control: global, per-method and per-client throttles with
//! escalation to temporary client blocks.
//!
//! Per client the state machine is `Unthrottled -> Throttled -> Blocked`,
//! returning to `Unthrottled` once the block elapses. Every call passes four
//! independent gates in order:
//!
//! 1. active block window for the client,
//! 2. global token bucket shared by all clients and methods,
//! 3. token bucket for the (client, method) pair, if the method is limited,
//! 4. per-client request counter over a fixed window.
//!
//! Rejections at gates 3 and 4 count as violations; reaching the violation
//! threshold blocks the client.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::{MethodLimit, RateLimitConfig};
use crate::error::{Result, SecurityError};
use crate::task::BackgroundTask;

#[derive(Debug, Clone)]
struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: u32, refill_rate: f64, now: Instant) -> Self {
        Self {
            capacity: capacity as f64,
            tokens: capacity as f64,
            refill_rate: refill_rate.max(0.0),
            last_refill: now,
        }
    }

    fn try_consume(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn refill(&mut self, now: Instant) {
        self.tokens = self.available(now);
        self.last_refill = now;
    }

    fn available(&self, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        (self.tokens + elapsed * self.refill_rate).min(self.capacity)
    }
}

#[derive(Debug)]
struct ClientState {
    requests_in_window: u32,
    window_start: Instant,
    last_access: Instant,
    total_requests: u64,
    violations: u32,
    blocked_until: Option<Instant>,
    method_buckets: HashMap<String, TokenBucket>,
}

impl ClientState {
    fn new(now: Instant) -> Self {
        Self {
            requests_in_window: 0,
            window_start: now,
            last_access: now,
            total_requests: 0,
            violations: 0,
            blocked_until: None,
            method_buckets: HashMap::new(),
        }
    }

    fn is_blocked_at(&self, now: Instant) -> bool {
        self.blocked_until.map(|until| now < until).unwrap_or(false)
    }

    /// Clear throttling state after a block elapses.
    fn unblock(&mut self, now: Instant) {
        self.blocked_until = None;
        self.violations = 0;
        self.requests_in_window = 0;
        self.window_start = now;
        self.method_buckets.clear();
    }
}

#[derive(Debug)]
struct MethodCounters {
    limit: MethodLimit,
    allowed: u64,
    rejected: u64,
}

#[derive(Debug)]
struct LimiterState {
    clients: HashMap<String, ClientState>,
    methods: HashMap<String, MethodCounters>,
    global: TokenBucket,
    total_requests: u64,
    total_rejected: u64,
    total_blocks: u64,
}

/// Per-client statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientStats {
    pub client_id: String,
    pub requests_in_window: u32,
    pub total_requests: u64,
    pub violations: u32,
    pub blocked: bool,
    pub block_remaining: Option<Duration>,
    pub idle: Duration,
}

/// Per-method statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodStats {
    pub method: String,
    pub requests_per_second: f64,
    pub burst: u32,
    pub allowed: u64,
    pub rejected: u64,
}

/// Controller-wide statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalStats {
    pub total_requests: u64,
    pub total_rejected: u64,
    pub total_blocks: u64,
    pub tracked_clients: usize,
    pub blocked_clients: usize,
    pub global_tokens_available: f64,
}

/// Abuse controller shared by all request handlers.
pub struct AbuseController {
    state: Arc<RwLock<LimiterState>>,
    config: RateLimitConfig,
    sweeper: BackgroundTask,
}

impl AbuseController {
    /// Create a controller and start its cleanup sweep.
    pub fn new(config: RateLimitConfig) -> Self {
        let now = Instant::now();
        let methods = config
            .method_limits
            .iter()
            .map(|(method, limit)| {
                (
                    method.clone(),
                    MethodCounters {
                        limit: *limit,
                        allowed: 0,
                        rejected: 0,
                    },
                )
            })
            .collect();

        let state = Arc::new(RwLock::new(LimiterState {
            clients: HashMap::new(),
            methods,
            global: TokenBucket::new(config.global_burst, config.global_requests_per_second, now),
            total_requests: 0,
            total_rejected: 0,
            total_blocks: 0,
        }));

        let sweep_state = state.clone();
        let max_age = config.max_client_age;
        let sweeper =
            BackgroundTask::spawn_periodic("rate-limit-cleanup", config.cleanup_interval, move || {
                let state = sweep_state.clone();
                async move {
                    let removed = cleanup_clients(&mut *state.write().await, max_age);
                    if removed > 0 {
                        debug!(removed, "Inactive rate limit clients removed");
                    }
                }
            });

        Self {
            state,
            config,
            sweeper,
        }
    }

    /// Admit or reject one call of `method` by `client_id`.
    pub async fn check(&self, method: &str, client_id: &str) -> Result<()> {
        let now = Instant::now();
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        state.total_requests += 1;

        let client = state
            .clients
            .entry(client_id.to_string())
            .or_insert_with(|| ClientState::new(now));
        client.last_access = now;
        client.total_requests += 1;

        // Gate 1: active block.
        if let Some(until) = client.blocked_until {
            if now < until {
                state.total_rejected += 1;
                debug!(client_id = %client_id, method = %method, "Blocked client rejected");
                return Err(SecurityError::ClientBlocked {
                    client_id: client_id.to_string(),
                });
            }
            client.unblock(now);
            info!(client_id = %client_id, "Client block expired");
        }

        // Gate 2: global admission.
        if !state.global.try_consume(now) {
            state.total_rejected += 1;
            warn!(client_id = %client_id, method = %method, "Global rate limit exceeded");
            return Err(SecurityError::RateLimitExceeded("global".to_string()));
        }

        // Gate 3: per (client, method) bucket.
        if let Some(counters) = state.methods.get_mut(method) {
            let limit = counters.limit;
            let bucket = client
                .method_buckets
                .entry(method.to_string())
                .or_insert_with(|| TokenBucket::new(limit.burst, limit.requests_per_second, now));

            if !bucket.try_consume(now) {
                counters.rejected += 1;
                state.total_rejected += 1;
                return Err(self.record_violation(
                    client,
                    client_id,
                    &format!("method {}", method),
                    now,
                    &mut state.total_blocks,
                ));
            }
        }

        // Gate 4: per-client window.
        if now.saturating_duration_since(client.window_start) >= self.config.window {
            client.requests_in_window = 0;
            client.window_start = now;
        }
        if client.requests_in_window >= self.config.requests_per_window {
            if let Some(counters) = state.methods.get_mut(method) {
                counters.rejected += 1;
            }
            state.total_rejected += 1;
            return Err(self.record_violation(
                client,
                client_id,
                "client window",
                now,
                &mut state.total_blocks,
            ));
        }
        client.requests_in_window += 1;

        if let Some(counters) = state.methods.get_mut(method) {
            counters.allowed += 1;
        }

        Ok(())
    }

    fn record_violation(
        &self,
        client: &mut ClientState,
        client_id: &str,
        gate: &str,
        now: Instant,
        total_blocks: &mut u64,
    ) -> SecurityError {
        client.violations += 1;

        if client.violations >= self.config.violation_threshold {
            client.blocked_until = Some(now + self.config.block_duration);
            *total_blocks += 1;
            warn!(
                client_id = %client_id,
                violations = client.violations,
                block_secs = self.config.block_duration.as_secs(),
                "Client blocked after repeated rate limit violations"
            );
            return SecurityError::ClientBlocked {
                client_id: client_id.to_string(),
            };
        }

        warn!(
            client_id = %client_id,
            gate = %gate,
            violations = client.violations,
            "Rate limit exceeded"
        );
        SecurityError::RateLimitExceeded(gate.to_string())
    }

    /// Set or replace the token bucket for a method.
    ///
    /// Existing per-client buckets for the method are discarded so the new
    /// limit applies immediately.
    pub async fn set_method_limit(&self, method: &str, requests_per_second: f64, burst: u32) {
        let limit = MethodLimit::new(requests_per_second, burst);
        let mut state = self.state.write().await;

        state
            .methods
            .entry(method.to_string())
            .and_modify(|c| c.limit = limit)
            .or_insert(MethodCounters {
                limit,
                allowed: 0,
                rejected: 0,
            });
        for client in state.clients.values_mut() {
            client.method_buckets.remove(method);
        }

        info!(method = %method, requests_per_second, burst, "Method rate limit set");
    }

    /// Forget all state for a client, including any block.
    pub async fn reset(&self, client_id: &str) -> bool {
        let removed = self.state.write().await.clients.remove(client_id).is_some();
        if removed {
            info!(client_id = %client_id, "Client rate limit state reset");
        }
        removed
    }

    /// Check if a client is inside an active block window.
    pub async fn is_blocked(&self, client_id: &str) -> bool {
        let now = Instant::now();
        self.state
            .read()
            .await
            .clients
            .get(client_id)
            .map(|c| c.is_blocked_at(now))
            .unwrap_or(false)
    }

    pub async fn client_stats(&self, client_id: &str) -> Option<ClientStats> {
        let now = Instant::now();
        let state = self.state.read().await;
        state.clients.get(client_id).map(|c| ClientStats {
            client_id: client_id.to_string(),
            requests_in_window: c.requests_in_window,
            total_requests: c.total_requests,
            violations: c.violations,
            blocked: c.is_blocked_at(now),
            block_remaining: c
                .blocked_until
                .map(|until| until.saturating_duration_since(now))
                .filter(|d| !d.is_zero()),
            idle: now.saturating_duration_since(c.last_access),
        })
    }

    pub async fn method_stats(&self, method: &str) -> Option<MethodStats> {
        let state = self.state.read().await;
        state.methods.get(method).map(|c| MethodStats {
            method: method.to_string(),
            requests_per_second: c.limit.requests_per_second,
            burst: c.limit.burst,
            allowed: c.allowed,
            rejected: c.rejected,
        })
    }

    pub async fn global_stats(&self) -> GlobalStats {
        let now = Instant::now();
        let state = self.state.read().await;
        GlobalStats {
            total_requests: state.total_requests,
            total_rejected: state.total_rejected,
            total_blocks: state.total_blocks,
            tracked_clients: state.clients.len(),
            blocked_clients: state
                .clients
                .values()
                .filter(|c| c.is_blocked_at(now))
                .count(),
            global_tokens_available: state.global.available(now),
        }
    }

    /// Drop state for clients idle longer than `max_age`. Blocked clients
    /// are kept until their block elapses.
    pub async fn cleanup(&self, max_age: Duration) -> usize {
        cleanup_clients(&mut *self.state.write().await, max_age)
    }

    /// Stop the background cleanup sweep.
    pub async fn stop(&self, deadline: Duration) -> Result<()> {
        self.sweeper.stop(deadline).await
    }
}

fn cleanup_clients(state: &mut LimiterState, max_age: Duration) -> usize {
    let now = Instant::now();
    let before = state.clients.len();
    state.clients.retain(|_, c| {
        c.is_blocked_at(now) || now.saturating_duration_since(c.last_access) <= max_age
    });
    before - state.clients.len()
}
