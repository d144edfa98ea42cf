//! One control-loop tick every 30s, per pool. The decision order is fixed:
//! in-flight guard, cooldown guard, queue-depth scale-up, utilization
//! scale-up, avg-wait scale-up, scale-down, maintain. A rolling hour of
//! decisions backs the trend/prediction API.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::warn;

use crate::config::ScalerConfig;
use crate::error::Result;
use crate::pool::PoolManager;
use crate::storage::StorageGateway;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScaleAction {
    ScaleUp(u32),
    ScaleDown(u32),
    Maintain,
}

#[derive(Debug, Clone, Copy)]
pub struct ScalerInputs {
    pub utilization: f64,
    pub queue_depth: i64,
    pub avg_wait: Duration,
    pub active_jobs: i64,
    pub runner_count: u32,
    pub min_runners: u32,
    pub max_runners: u32,
}

#[derive(Debug, Clone, Copy)]
struct Decision {
    at: Instant,
    utilization: f64,
    runner_count: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct Prediction {
    pub predicted_utilization: f64,
    pub recommended_runners: u32,
    pub confidence: f64,
}

struct PoolHistory {
    last_scaled_at: Option<Instant>,
    in_flight: bool,
    decisions: Vec<Decision>,
}

impl Default for PoolHistory {
    fn default() -> Self {
        Self { last_scaled_at: None, in_flight: false, decisions: Vec::new() }
    }
}

const HISTORY_WINDOW: Duration = Duration::from_secs(3600);
/// Midpoint of the scale-up/scale-down band; the utilization the
/// prediction API sizes a recommended runner count around.
const TARGET_UTILIZATION: f64 = 0.5;

/// The seven-step decision order, as a pure function of config and the
/// current pool state. Kept free of storage/pool access so it can be
/// exercised directly in tests.
fn decide_action(
    config: &ScalerConfig,
    in_flight: bool,
    last_scaled_at: Option<Instant>,
    inputs: &ScalerInputs,
) -> ScaleAction {
    // 1. in-flight-action guard: a previous scale action for this pool
    // hasn't finished applying yet.
    if in_flight {
        return ScaleAction::Maintain;
    }

    // 2. cooldown guard
    if let Some(last) = last_scaled_at {
        if last.elapsed() < config.cooldown_period {
            return ScaleAction::Maintain;
        }
    }

    let room_to_grow = inputs.runner_count < inputs.max_runners;

    // 3. queue-depth scale-up
    if inputs.queue_depth >= config.queue_depth_threshold && room_to_grow {
        let by = config.scale_up_increment.min(inputs.max_runners - inputs.runner_count);
        return ScaleAction::ScaleUp(by);
    }

    // 4. utilization scale-up
    if inputs.utilization >= config.scale_up_threshold && room_to_grow {
        let by = config.scale_up_increment.min(inputs.max_runners - inputs.runner_count);
        return ScaleAction::ScaleUp(by);
    }

    // 5. avg-wait scale-up
    if inputs.avg_wait >= config.avg_wait_time_threshold && room_to_grow {
        let by = config.scale_up_increment.min(inputs.max_runners - inputs.runner_count);
        return ScaleAction::ScaleUp(by);
    }

    // 6. scale-down: quiet pool with no queue and no active jobs.
    if inputs.utilization <= config.scale_down_threshold
        && inputs.queue_depth == 0
        && inputs.active_jobs == 0
        && inputs.runner_count > inputs.min_runners
    {
        let by = config.scale_down_increment.min(inputs.runner_count - inputs.min_runners);
        return ScaleAction::ScaleDown(by);
    }

    // 7. maintain
    ScaleAction::Maintain
}

pub struct AutoScaler {
    storage: Arc<StorageGateway>,
    pools: Arc<PoolManager>,
    config: ScalerConfig,
    history: Mutex<HashMap<String, PoolHistory>>,
}

impl AutoScaler {
    pub fn new(storage: Arc<StorageGateway>, pools: Arc<PoolManager>, config: ScalerConfig) -> Self {
        Self { storage, pools, config, history: Mutex::new(HashMap::new()) }
    }

    pub async fn run_tick_loop(self: Arc<Self>, repositories: Vec<String>) {
        loop {
            for repo in &repositories {
                if let Err(e) = self.tick(repo).await {
                    warn!(repository = %repo, error = %e, "autoscaler tick failed");
                }
            }
            tokio::time::sleep(self.config.tick_interval).await;
        }
    }

    async fn gather_inputs(&self, repository: &str) -> Result<ScalerInputs> {
        let pool = self.storage.get_or_create_pool(repository).await?;
        let metrics = self.pools.get_pool_metrics(repository).await?;
        let queue_depth = self.storage.queue_depth(repository).await?;
        let avg_wait_secs = self.storage.avg_wait_seconds(repository).await?;
        let active_jobs = self.storage.active_jobs_count(repository).await?;
        Ok(ScalerInputs {
            utilization: metrics.utilization,
            queue_depth,
            avg_wait: Duration::from_secs_f64(avg_wait_secs.max(0.0)),
            active_jobs,
            runner_count: metrics.total,
            min_runners: pool.min_runners.max(0) as u32,
            max_runners: pool.max_runners.max(0) as u32,
        })
    }

    /// The regular 30s control-loop entry point.
    pub async fn tick(&self, repository: &str) -> Result<ScaleAction> {
        let inputs = self.gather_inputs(repository).await?;
        self.evaluate(repository, inputs).await
    }

    /// Runs the same decision function on demand (an operator-triggered
    /// evaluation). A `Maintain` outcome here leaves `last_scaled_at`
    /// untouched, same as a tick's `Maintain` would — only a fired scale
    /// action ever resets the cooldown clock.
    pub async fn evaluate_now(&self, repository: &str) -> Result<ScaleAction> {
        let inputs = self.gather_inputs(repository).await?;
        self.evaluate(repository, inputs).await
    }

    async fn evaluate(&self, repository: &str, inputs: ScalerInputs) -> Result<ScaleAction> {
        let action = self.decide(repository, &inputs).await;

        if !matches!(action, ScaleAction::Maintain) {
            self.apply(repository, action).await?;
        }

        self.record(repository, &inputs).await;
        Ok(action)
    }

    async fn decide(&self, repository: &str, inputs: &ScalerInputs) -> ScaleAction {
        let history = self.history.lock().await;
        let entry = history.get(repository);
        let in_flight = entry.map(|e| e.in_flight).unwrap_or(false);
        let last_scaled_at = entry.and_then(|e| e.last_scaled_at);
        drop(history);

        decide_action(&self.config, in_flight, last_scaled_at, inputs)
    }

    async fn apply(&self, repository: &str, action: ScaleAction) -> Result<()> {
        {
            let mut history = self.history.lock().await;
            history.entry(repository.to_string()).or_default().in_flight = true;
        }

        let result = match action {
            ScaleAction::ScaleUp(n) => self.pools.scale_up(repository, n, "autoscaler").await,
            ScaleAction::ScaleDown(n) => self.pools.scale_down(repository, n, "autoscaler").await,
            ScaleAction::Maintain => Ok(()),
        };

        let mut history = self.history.lock().await;
        let entry = history.entry(repository.to_string()).or_default();
        entry.in_flight = false;
        if result.is_ok() && !matches!(action, ScaleAction::Maintain) {
            entry.last_scaled_at = Some(Instant::now());
        }
        result
    }

    async fn record(&self, repository: &str, inputs: &ScalerInputs) {
        let mut history = self.history.lock().await;
        let entry = history.entry(repository.to_string()).or_default();
        entry.decisions.push(Decision {
            at: Instant::now(),
            utilization: inputs.utilization,
            runner_count: inputs.runner_count,
        });

        let cutoff = Instant::now().checked_sub(HISTORY_WINDOW);
        if let Some(cutoff) = cutoff {
            entry.decisions.retain(|d| d.at >= cutoff);
        }
    }

    /// Half-window linear trend over the recorded utilization series:
    /// splits the window in two, extrapolates one more step from the
    /// delta between halves, and reports `1 - stddev` as confidence.
    pub async fn predict(&self, repository: &str) -> Option<Prediction> {
        let history = self.history.lock().await;
        let decisions = &history.get(repository)?.decisions;
        if decisions.len() < 4 {
            return None;
        }

        let mid = decisions.len() / 2;
        let (first_half, second_half) = decisions.split_at(mid);
        let avg = |xs: &[Decision]| xs.iter().map(|d| d.utilization).sum::<f64>() / xs.len() as f64;
        let first_avg = avg(first_half);
        let second_avg = avg(second_half);

        let slope = second_avg - first_avg;
        let predicted_utilization = (second_avg + slope).clamp(0.0, 1.0);

        let mean = decisions.iter().map(|d| d.utilization).sum::<f64>() / decisions.len() as f64;
        let variance =
            decisions.iter().map(|d| (d.utilization - mean).powi(2)).sum::<f64>() / decisions.len() as f64;
        let confidence = (1.0 - variance.sqrt()).clamp(0.0, 1.0);

        let current_runners = decisions.last().map(|d| d.runner_count).unwrap_or(0).max(1);
        let recommended_runners = ((current_runners as f64 * predicted_utilization / TARGET_UTILIZATION).ceil()
            as u32)
            .max(1);

        Some(Prediction { predicted_utilization, recommended_runners, confidence })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs(utilization: f64, queue_depth: i64, avg_wait_secs: u64, active_jobs: i64, runner_count: u32) -> ScalerInputs {
        ScalerInputs {
            utilization,
            queue_depth,
            avg_wait: Duration::from_secs(avg_wait_secs),
            active_jobs,
            runner_count,
            min_runners: 1,
            max_runners: 10,
        }
    }

    fn predict_from(decisions: &[Decision]) -> Option<Prediction> {
        if decisions.len() < 4 {
            return None;
        }

        let mid = decisions.len() / 2;
        let (first_half, second_half) = decisions.split_at(mid);
        let avg = |xs: &[Decision]| xs.iter().map(|d| d.utilization).sum::<f64>() / xs.len() as f64;
        let slope = avg(second_half) - avg(first_half);
        let predicted_utilization = (avg(second_half) + slope).clamp(0.0, 1.0);

        let mean = decisions.iter().map(|d| d.utilization).sum::<f64>() / decisions.len() as f64;
        let variance =
            decisions.iter().map(|d| (d.utilization - mean).powi(2)).sum::<f64>() / decisions.len() as f64;
        let confidence = (1.0 - variance.sqrt()).clamp(0.0, 1.0);

        let current_runners = decisions.last().map(|d| d.runner_count).unwrap_or(0).max(1);
        let recommended_runners = ((current_runners as f64 * predicted_utilization / TARGET_UTILIZATION).ceil()
            as u32)
            .max(1);

        Some(Prediction { predicted_utilization, recommended_runners, confidence })
    }

    #[test]
    fn queue_depth_above_threshold_scales_up_before_utilization_is_checked() {
        let config = ScalerConfig::default();
        let action = decide_action(&config, false, None, &inputs(0.1, 10, 0, 0, 2));
        assert_eq!(action, ScaleAction::ScaleUp(config.scale_up_increment));
    }

    #[test]
    fn quiet_pool_scales_down() {
        let config = ScalerConfig::default();
        let action = decide_action(&config, false, None, &inputs(0.0, 0, 0, 0, 3));
        assert_eq!(action, ScaleAction::ScaleDown(config.scale_down_increment));
    }

    #[test]
    fn in_flight_guard_forces_maintain() {
        let config = ScalerConfig::default();
        let action = decide_action(&config, true, None, &inputs(0.95, 50, 999, 5, 1));
        assert_eq!(action, ScaleAction::Maintain);
    }

    #[test]
    fn cooldown_guard_forces_maintain_even_under_pressure() {
        let config = ScalerConfig::default();
        let action = decide_action(&config, false, Some(Instant::now()), &inputs(0.95, 50, 999, 5, 1));
        assert_eq!(action, ScaleAction::Maintain);
    }

    #[test]
    fn moderate_load_with_no_trigger_maintains() {
        let config = ScalerConfig::default();
        let action = decide_action(&config, false, None, &inputs(0.5, 1, 5, 1, 3));
        assert_eq!(action, ScaleAction::Maintain);
    }

    #[test]
    fn zero_runners_never_scale_down_further() {
        let config = ScalerConfig::default();
        let action = decide_action(&config, false, None, &inputs(0.0, 0, 0, 0, 0));
        assert_eq!(action, ScaleAction::Maintain);
    }

    #[test]
    fn scale_up_is_capped_at_max_runners() {
        let config = ScalerConfig::default();
        let mut i = inputs(0.95, 50, 999, 5, 8);
        i.max_runners = 10;
        let action = decide_action(&config, false, None, &i);
        assert_eq!(action, ScaleAction::ScaleUp(2));
    }

    #[test]
    fn already_at_max_runners_maintains_instead_of_scaling_up() {
        let config = ScalerConfig::default();
        let mut i = inputs(0.95, 50, 999, 5, 10);
        i.max_runners = 10;
        let action = decide_action(&config, false, None, &i);
        assert_eq!(action, ScaleAction::Maintain);
    }

    #[test]
    fn scale_down_never_drops_below_min_runners() {
        let config = ScalerConfig::default();
        let mut i = inputs(0.0, 0, 0, 0, 2);
        i.min_runners = 2;
        let action = decide_action(&config, false, None, &i);
        assert_eq!(action, ScaleAction::Maintain);
    }

    #[test]
    fn predict_needs_at_least_four_samples() {
        let decisions = vec![Decision { at: Instant::now(), utilization: 0.5, runner_count: 2 }];
        assert!(predict_from(&decisions).is_none());
    }

    #[test]
    fn predict_extrapolates_a_rising_trend() {
        let decisions: Vec<Decision> = [0.2, 0.3, 0.6, 0.7]
            .into_iter()
            .map(|u| Decision { at: Instant::now(), utilization: u, runner_count: 4 })
            .collect();
        let p = predict_from(&decisions).unwrap();
        assert!(p.predicted_utilization > 0.65);
        assert!(p.confidence >= 0.0 && p.confidence <= 1.0);
    }
}
