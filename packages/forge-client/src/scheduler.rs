//! Single-threaded cooperative scheduler in front of the upstream API: one
//! `tokio::sync::Semaphore` permit per priority tier guards concurrency, and
//! a `tokio::sync::Mutex`-held look at the shared rate-limit state decides
//! whether this call must wait before it's allowed through.

use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Semaphore, SemaphorePermit};

use crate::error::{ForgeError, Result};
use crate::models::{Priority, RateLimit};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Conservative,
    Aggressive,
    Adaptive,
}

impl std::str::FromStr for Strategy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "conservative" => Ok(Strategy::Conservative),
            "aggressive" => Ok(Strategy::Aggressive),
            "adaptive" => Ok(Strategy::Adaptive),
            other => anyhow::bail!("unknown forge strategy {other}"),
        }
    }
}

/// `base − minutes_waiting`: lower is more urgent, so aging pulls a
/// long-waiting request's effective priority down over time.
fn effective_priority(priority: Priority, waiting_since: Instant) -> i64 {
    let base = match priority {
        Priority::Critical => 0,
        Priority::High => 1,
        Priority::Normal => 2,
        Priority::Low => 3,
    };
    let minutes_waiting = waiting_since.elapsed().as_secs() as i64 / 60;
    base - minutes_waiting
}

fn tier_index(priority: Priority) -> usize {
    match priority {
        Priority::Low => 0,
        Priority::Normal => 1,
        Priority::High => 2,
        Priority::Critical => 3,
    }
}

pub struct SchedulerPermit<'a> {
    _permit: SemaphorePermit<'a>,
}

pub struct Scheduler {
    kv: ConnectionManager,
    rate_limit_key: String,
    strategy: Strategy,
    tier_gates: [Semaphore; 4],
    state_lock: Mutex<()>,
}

impl Scheduler {
    pub fn new(kv: ConnectionManager, rate_limit_key: impl Into<String>, strategy: Strategy) -> Self {
        Self {
            kv,
            rate_limit_key: rate_limit_key.into(),
            strategy,
            tier_gates: [Semaphore::new(1), Semaphore::new(1), Semaphore::new(1), Semaphore::new(1)],
            state_lock: Mutex::new(()),
        }
    }

    pub async fn load_state(&self) -> Result<RateLimit> {
        let mut kv = self.kv.clone();
        let raw: Option<String> =
            kv.get(&self.rate_limit_key).await.map_err(|e| ForgeError::Upstream(e.to_string()))?;
        match raw {
            Some(json) => serde_json::from_str(&json).map_err(|e| ForgeError::Upstream(e.to_string())),
            None => Ok(RateLimit::fresh(5000)),
        }
    }

    pub async fn save_state(&self, state: RateLimit) -> Result<()> {
        let mut kv = self.kv.clone();
        let json = serde_json::to_string(&state).map_err(|e| ForgeError::Upstream(e.to_string()))?;
        let ttl_secs = (state.reset_at - Utc::now()).num_seconds().max(1) as u64;
        kv.set_ex::<_, _, ()>(&self.rate_limit_key, json, ttl_secs)
            .await
            .map_err(|e| ForgeError::Upstream(e.to_string()))?;
        Ok(())
    }

    /// Blocks until this call's tier is free and the strategy's delay (if
    /// any) has elapsed, then returns a guard that releases the tier slot
    /// on drop.
    pub async fn admit(&self, priority: Priority, waiting_since: Instant) -> Result<SchedulerPermit<'_>> {
        let permit = self.tier_gates[tier_index(priority)]
            .acquire()
            .await
            .expect("tier gate semaphore is never closed");

        let _state_guard = self.state_lock.lock().await;
        let state = self.load_state().await.unwrap_or_else(|_| RateLimit::fresh(5000));

        if let Some(delay) = self.strategy_delay(&state, priority, waiting_since) {
            tokio::time::sleep(delay).await;
        }

        Ok(SchedulerPermit { _permit: permit })
    }

    /// Waits out a 403-with-rate-limit-marker response until `reset_at`.
    pub async fn wait_for_reset(&self, reset_at: chrono::DateTime<Utc>) {
        let wait = (reset_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }

    fn strategy_delay(&self, state: &RateLimit, priority: Priority, waiting_since: Instant) -> Option<Duration> {
        let should_delay = match self.strategy {
            Strategy::Conservative => state.fraction_remaining() < 0.20,
            Strategy::Aggressive => state.remaining < 50,
            Strategy::Adaptive => {
                let window_secs = (state.reset_at - Utc::now()).num_seconds().max(1) as f64;
                let elapsed_secs = (3600.0 - window_secs).max(1.0);
                let rate_per_sec = state.used as f64 / elapsed_secs;
                let projected_usage = rate_per_sec * window_secs;
                projected_usage > state.remaining as f64 * 0.9
            }
        };

        if !should_delay {
            return None;
        }

        // Graduated 0.1-5s delay scaled by how depleted the budget is.
        let depletion = (1.0 - state.fraction_remaining()).clamp(0.0, 1.0);
        let graduated = Duration::from_millis(100 + (depletion * 4900.0) as u64);

        let aged = effective_priority(priority, waiting_since);
        if aged >= 0 {
            return Some(graduated);
        }
        let reduction_ms = (aged.unsigned_abs() * 1000).min(graduated.as_millis() as u64 - 100);
        Some(graduated - Duration::from_millis(reduction_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn critical_ages_below_low_after_enough_waiting() {
        let waiting_since = Instant::now() - Duration::from_secs(180);
        assert!(effective_priority(Priority::Critical, waiting_since) < effective_priority(Priority::Low, Instant::now()));
    }

    #[test]
    fn strategy_from_str_accepts_known_names() {
        assert_eq!("conservative".parse::<Strategy>().unwrap(), Strategy::Conservative);
        assert_eq!("ADAPTIVE".parse::<Strategy>().unwrap(), Strategy::Adaptive);
        assert!("unknown".parse::<Strategy>().is_err());
    }

    #[test]
    fn tier_index_is_stable_and_distinct() {
        let mut indices = [
            tier_index(Priority::Low),
            tier_index(Priority::Normal),
            tier_index(Priority::High),
            tier_index(Priority::Critical),
        ];
        indices.sort_unstable();
        assert_eq!(indices, [0, 1, 2, 3]);
    }
}
