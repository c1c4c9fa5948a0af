// ABOUTME: Execution guard bounding aggregate sandbox execution pressure
// ABOUTME: Global concurrency ceiling plus per-scope sliding-window rate limiting

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;

use crate::config::GuardConfig;
use crate::error::{AppError, ErrorKind};

#[derive(Debug, Default, Clone, Serialize)]
pub struct ScopeCounters {
    pub total: u64,
    pub allowed: u64,
    pub rejected_rate: u64,
    pub rejected_concurrency: u64,
    pub failed: u64,
}

#[derive(Debug, Serialize)]
pub struct ScopeSnapshot {
    pub scope: String,
    #[serde(flatten)]
    pub counters: ScopeCounters,
}

#[derive(Debug, Serialize)]
pub struct GuardSnapshot {
    pub active_executions: i64,
    pub limits: GuardLimits,
    pub scopes: Vec<ScopeSnapshot>,
}

#[derive(Debug, Serialize)]
pub struct GuardLimits {
    pub max_concurrency: usize,
    pub max_calls_per_window: usize,
    pub window_ms: u64,
}

struct ScopeState {
    history: Mutex<VecDeque<Instant>>,
    counters: Mutex<ScopeCounters>,
}

/// Bounds the aggregate execution pressure across all tool invocations
/// (spec section 4.4). Rate limiting is per-scope; concurrency is global.
pub struct ExecutionGuard {
    config: GuardConfig,
    active: AtomicI64,
    scopes: DashMap<String, Arc<ScopeState>>,
}

impl ExecutionGuard {
    #[must_use]
    pub fn new(config: GuardConfig) -> Self {
        Self {
            config,
            active: AtomicI64::new(0),
            scopes: DashMap::new(),
        }
    }

    fn scope_state(&self, scope: &str) -> Arc<ScopeState> {
        self.scopes
            .entry(scope.to_owned())
            .or_insert_with(|| {
                Arc::new(ScopeState {
                    history: Mutex::new(VecDeque::new()),
                    counters: Mutex::new(ScopeCounters::default()),
                })
            })
            .clone()
    }

    /// Runs `work` under the guard's concurrency and rate policy. `work`
    /// returns a `Result`; an `Err` outcome increments the scope's `failed`
    /// counter before being rethrown to the caller (spec section 4.4 step 6).
    ///
    /// Ordering (spec section 4.4/5): the rate check happens before the
    /// concurrency check; counters are incremented deterministically for
    /// every outcome.
    pub async fn run<F, T, E>(&self, scope: &str, work: F) -> Result<Result<T, E>, AppError>
    where
        F: Future<Output = Result<T, E>>,
    {
        let state = self.scope_state(scope);
        {
            let mut counters = state.counters.lock();
            counters.total += 1;
        }

        let now = Instant::now();
        let window = Duration::from_millis(self.config.window_ms);
        {
            let mut history = state.history.lock();
            while let Some(front) = history.front() {
                if now.duration_since(*front) > window {
                    history.pop_front();
                } else {
                    break;
                }
            }
            if history.len() >= self.config.max_calls_per_window {
                let mut counters = state.counters.lock();
                counters.rejected_rate += 1;
                return Err(AppError::new(
                    ErrorKind::GuardRate,
                    format!("rate limit exceeded for scope '{scope}'"),
                ));
            }
            history.push_back(now);
        }

        if self.active.load(Ordering::SeqCst) >= self.config.max_concurrency as i64 {
            let mut counters = state.counters.lock();
            counters.rejected_concurrency += 1;
            return Err(AppError::new(
                ErrorKind::GuardConcurrency,
                format!("concurrency limit exceeded for scope '{scope}'"),
            ));
        }

        self.active.fetch_add(1, Ordering::SeqCst);
        {
            let mut counters = state.counters.lock();
            counters.allowed += 1;
        }

        let result = work.await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        if result.is_err() {
            let mut counters = state.counters.lock();
            counters.failed += 1;
        }
        Ok(result)
    }

    #[must_use]
    pub fn snapshot(&self) -> GuardSnapshot {
        let mut scopes: Vec<ScopeSnapshot> = self
            .scopes
            .iter()
            .map(|entry| ScopeSnapshot {
                scope: entry.key().clone(),
                counters: entry.value().counters.lock().clone(),
            })
            .collect();
        scopes.sort_by(|a, b| a.scope.cmp(&b.scope));
        GuardSnapshot {
            active_executions: self.active.load(Ordering::SeqCst),
            limits: GuardLimits {
                max_concurrency: self.config.max_concurrency,
                max_calls_per_window: self.config.max_calls_per_window,
                window_ms: self.config.window_ms,
            },
            scopes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(max_concurrency: usize, max_calls_per_window: usize, window_ms: u64) -> GuardConfig {
        GuardConfig {
            max_concurrency,
            max_calls_per_window,
            window_ms,
        }
    }

    #[tokio::test]
    async fn second_call_within_window_is_rate_limited() {
        let guard = ExecutionGuard::new(cfg(8, 1, 60_000));
        let first = guard.run("s", async { Ok::<_, ()>(1) }).await;
        assert!(first.is_ok());
        let second = guard.run("s", async { Ok::<_, ()>(1) }).await;
        assert_eq!(second.unwrap_err().kind, ErrorKind::GuardRate);
        let snap = guard.snapshot();
        let scope = snap.scopes.iter().find(|s| s.scope == "s").unwrap();
        assert_eq!(scope.counters.allowed, 1);
        assert_eq!(scope.counters.rejected_rate, 1);
    }

    #[tokio::test]
    async fn concurrency_ceiling_is_global_across_scopes() {
        let guard = Arc::new(ExecutionGuard::new(cfg(1, 100, 60_000)));
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let g1 = guard.clone();
        let blocking = tokio::spawn(async move {
            g1.run("a", async move {
                let _ = rx.await;
                Ok::<_, ()>(())
            })
            .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        let rejected = guard.run("b", async { Ok::<_, ()>(1) }).await;
        assert_eq!(rejected.unwrap_err().kind, ErrorKind::GuardConcurrency);
        let _ = tx.send(());
        blocking.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn failure_increments_failed_counter_and_rethrows() {
        let guard = ExecutionGuard::new(cfg(8, 8, 60_000));
        let outcome = guard.run("s", async { Err::<(), _>("boom") }).await.unwrap();
        assert_eq!(outcome, Err("boom"));
        let snap = guard.snapshot();
        let scope = snap.scopes.iter().find(|s| s.scope == "s").unwrap();
        assert_eq!(scope.counters.failed, 1);
    }
}
