//! Forge Client: a typed wrapper over the upstream API's runner/workflow
//! endpoints, extracted into its own crate the way the teacher extracts its
//! third-party API clients (an options struct plus a service struct holding
//! a `reqwest::Client`).

use chrono::Utc;
use redis::aio::ConnectionManager;
use reqwest::{Client, StatusCode};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::cache::{ResponseCache, TtlClass};
use crate::error::{ForgeError, Result};
use crate::models::{Priority, RateLimit, RunnerInfo, RunnerToken, WorkflowJobSummary, WorkflowRunSummary};
use crate::scheduler::{Scheduler, Strategy};

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_RETRIES: u32 = 5;

#[derive(Debug, Clone)]
pub struct ForgeOptions {
    pub base_url: String,
    pub token: String,
    pub organization: String,
    pub rate_limit_key: String,
    pub strategy: Strategy,
}

pub struct ForgeClient {
    options: ForgeOptions,
    http: Client,
    scheduler: Scheduler,
    cache: ResponseCache,
}

impl ForgeClient {
    pub fn new(options: ForgeOptions, kv: ConnectionManager) -> Self {
        let http = Client::builder().timeout(HTTP_TIMEOUT).build().expect("reqwest client builds with static config");
        let scheduler = Scheduler::new(kv, options.rate_limit_key.clone(), options.strategy);
        Self { options, http, scheduler, cache: ResponseCache::new() }
    }

    fn repo_tag(repository: &str) -> String {
        format!("repo:{repository}")
    }

    fn org_tag(&self) -> String {
        format!("org:{}", self.options.organization)
    }

    /// Runs `request` under the scheduler's admission gate, retrying
    /// retryable statuses with capped exponential backoff and honoring a
    /// 403-rate-limit-marker by waiting for the shared reset.
    async fn call<T, F, Fut>(&self, priority: Priority, request: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = reqwest::Result<reqwest::Response>>,
        T: serde::de::DeserializeOwned,
    {
        let waiting_since = Instant::now();
        let mut attempt = 0u32;

        loop {
            let _permit = self.scheduler.admit(priority, waiting_since).await?;

            let response = request().await.map_err(|e| {
                if e.is_timeout() {
                    ForgeError::Timeout
                } else {
                    ForgeError::Upstream(e.to_string())
                }
            })?;

            self.record_rate_limit_headers(&response).await;

            let status = response.status();
            if status.is_success() {
                let body = response.text().await.map_err(|e| ForgeError::Upstream(e.to_string()))?;
                return serde_json::from_str(&body).map_err(|e| ForgeError::Upstream(e.to_string()));
            }

            if status == StatusCode::FORBIDDEN && self.looks_rate_limited(&response) {
                let state = self.scheduler.load_state().await.unwrap_or_else(|_| RateLimit::fresh(5000));
                warn!(reset_at = %state.reset_at, "forge rate limit exhausted, waiting for reset");
                self.scheduler.wait_for_reset(state.reset_at).await;
                continue;
            }

            let body = response.text().await.unwrap_or_default();
            let err = ForgeError::from_status(status.as_u16(), &body);

            if err.is_retryable() && attempt < MAX_RETRIES {
                let backoff = Duration::from_secs(2u64.saturating_pow(attempt).min(30));
                debug!(attempt, ?backoff, "retrying forge call");
                tokio::time::sleep(backoff).await;
                attempt += 1;
                continue;
            }

            return Err(err);
        }
    }

    /// Same admission/retry path as [`Self::call`], for endpoints that
    /// return no body worth deserializing (GitHub's runner-removal DELETE
    /// responds 204 with an empty body).
    async fn call_empty<F, Fut>(&self, priority: Priority, request: F) -> Result<()>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = reqwest::Result<reqwest::Response>>,
    {
        let waiting_since = Instant::now();
        let mut attempt = 0u32;

        loop {
            let _permit = self.scheduler.admit(priority, waiting_since).await?;

            let response = request().await.map_err(|e| {
                if e.is_timeout() {
                    ForgeError::Timeout
                } else {
                    ForgeError::Upstream(e.to_string())
                }
            })?;

            self.record_rate_limit_headers(&response).await;

            let status = response.status();
            if status.is_success() {
                return Ok(());
            }

            if status == StatusCode::FORBIDDEN && self.looks_rate_limited(&response) {
                let state = self.scheduler.load_state().await.unwrap_or_else(|_| RateLimit::fresh(5000));
                warn!(reset_at = %state.reset_at, "forge rate limit exhausted, waiting for reset");
                self.scheduler.wait_for_reset(state.reset_at).await;
                continue;
            }

            let body = response.text().await.unwrap_or_default();
            let err = ForgeError::from_status(status.as_u16(), &body);

            if err.is_retryable() && attempt < MAX_RETRIES {
                let backoff = Duration::from_secs(2u64.saturating_pow(attempt).min(30));
                debug!(attempt, ?backoff, "retrying forge call");
                tokio::time::sleep(backoff).await;
                attempt += 1;
                continue;
            }

            return Err(err);
        }
    }

    fn looks_rate_limited(&self, response: &reqwest::Response) -> bool {
        response.headers().get("x-ratelimit-remaining").and_then(|v| v.to_str().ok()) == Some("0")
    }

    async fn record_rate_limit_headers(&self, response: &reqwest::Response) {
        let headers = response.headers();
        let parse = |name: &str| headers.get(name).and_then(|v| v.to_str().ok()).and_then(|v| v.parse::<i64>().ok());

        let (Some(remaining), Some(limit), Some(reset_epoch)) =
            (parse("x-ratelimit-remaining"), parse("x-ratelimit-limit"), parse("x-ratelimit-reset"))
        else {
            return;
        };

        let reset_at = chrono::DateTime::from_timestamp(reset_epoch, 0).unwrap_or_else(Utc::now);
        let state = RateLimit {
            remaining: remaining.max(0) as u32,
            limit: limit.max(0) as u32,
            used: (limit - remaining).max(0) as u32,
            reset_at,
        };
        if let Err(e) = self.scheduler.save_state(state).await {
            warn!(error = %e, "failed to persist forge rate limit state");
        }
    }

    pub async fn generate_runner_token(&self, repository: &str) -> Result<RunnerToken> {
        let url = format!("{}/repos/{}/actions/runners/registration-token", self.options.base_url, repository);
        let token = self.options.token.clone();
        self.call(Priority::Critical, move || {
            self.http.post(&url).bearer_auth(&token).send()
        })
        .await
    }

    pub async fn list_runners(&self, repository: &str) -> Result<Vec<RunnerInfo>> {
        let cache_key = format!("runners:{repository}");
        if let Some(cached) = self.cache.get(&cache_key).await {
            if let Ok(runners) = serde_json::from_value(cached) {
                return Ok(runners);
            }
        }

        let url = format!("{}/repos/{}/actions/runners", self.options.base_url, repository);
        let token = self.options.token.clone();
        let runners: Vec<RunnerInfo> =
            self.call(Priority::Normal, move || self.http.get(&url).bearer_auth(&token).send()).await?;

        self.cache
            .set(
                cache_key,
                serde_json::to_value(&runners).unwrap_or_default(),
                TtlClass::Dynamic.duration(),
                vec![Self::repo_tag(repository), self.org_tag(), "type:runners".to_string()],
            )
            .await;
        Ok(runners)
    }

    pub async fn remove_runner(&self, repository: &str, runner_id: i64) -> Result<()> {
        let url = format!("{}/repos/{}/actions/runners/{runner_id}", self.options.base_url, repository);
        let token = self.options.token.clone();
        self.call_empty(Priority::High, move || self.http.delete(&url).bearer_auth(&token).send()).await?;

        self.cache.invalidate_tag(&Self::repo_tag(repository)).await;
        Ok(())
    }

    pub async fn get_workflow_runs(&self, repository: &str) -> Result<Vec<WorkflowRunSummary>> {
        let cache_key = format!("workflow_runs:{repository}");
        if let Some(cached) = self.cache.get(&cache_key).await {
            if let Ok(runs) = serde_json::from_value(cached) {
                return Ok(runs);
            }
        }

        let url = format!("{}/repos/{}/actions/runs", self.options.base_url, repository);
        let token = self.options.token.clone();
        let runs: Vec<WorkflowRunSummary> =
            self.call(Priority::Normal, move || self.http.get(&url).bearer_auth(&token).send()).await?;

        self.cache
            .set(
                cache_key,
                serde_json::to_value(&runs).unwrap_or_default(),
                TtlClass::Realtime.duration(),
                vec![Self::repo_tag(repository), "type:workflow_runs".to_string()],
            )
            .await;
        Ok(runs)
    }

    pub async fn get_workflow_jobs(&self, repository: &str, run_id: i64) -> Result<Vec<WorkflowJobSummary>> {
        let cache_key = format!("workflow_jobs:{repository}:{run_id}");
        if let Some(cached) = self.cache.get(&cache_key).await {
            if let Ok(jobs) = serde_json::from_value(cached) {
                return Ok(jobs);
            }
        }

        let url = format!("{}/repos/{}/actions/runs/{run_id}/jobs", self.options.base_url, repository);
        let token = self.options.token.clone();
        let jobs: Vec<WorkflowJobSummary> =
            self.call(Priority::Normal, move || self.http.get(&url).bearer_auth(&token).send()).await?;

        self.cache
            .set(
                cache_key,
                serde_json::to_value(&jobs).unwrap_or_default(),
                TtlClass::Realtime.duration(),
                vec![Self::repo_tag(repository), "type:workflow_jobs".to_string()],
            )
            .await;
        Ok(jobs)
    }

    pub async fn rate_limit(&self) -> Result<RateLimit> {
        self.scheduler.load_state().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repo_tag_matches_the_documented_shape() {
        assert_eq!(ForgeClient::repo_tag("acme/widgets"), "repo:acme/widgets");
    }
}
