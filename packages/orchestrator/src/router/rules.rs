//! Loads enabled routing rules and refreshes a label -> rule-id inverted
//! index every 60s for fast candidate lookup.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::matcher::{branch_from_ref, rule_matches, JobContext};
use crate::error::Result;
use crate::storage::models::{Runner, RoutingRule};
use crate::storage::StorageGateway;

pub const REFRESH_INTERVAL: Duration = Duration::from_secs(60);

pub struct RoutingDecisionResult {
    pub rule_id: Option<Uuid>,
    pub target_runners: Vec<Runner>,
}

struct RuleCache {
    rules: Vec<RoutingRule>,
    by_label: HashMap<String, Vec<usize>>,
    unconditioned: Vec<usize>,
}

impl RuleCache {
    fn build(rules: Vec<RoutingRule>) -> Self {
        let mut by_label: HashMap<String, Vec<usize>> = HashMap::new();
        let mut unconditioned = Vec::new();

        for (idx, rule) in rules.iter().enumerate() {
            if rule.conditions.labels.is_empty() {
                unconditioned.push(idx);
            } else {
                for label in &rule.conditions.labels {
                    by_label.entry(label.clone()).or_default().push(idx);
                }
            }
        }

        Self { rules, by_label, unconditioned }
    }

    fn candidates(&self, labels: &[String]) -> Vec<&RoutingRule> {
        let mut indices: Vec<usize> = labels
            .iter()
            .filter_map(|l| self.by_label.get(l))
            .flatten()
            .copied()
            .chain(self.unconditioned.iter().copied())
            .collect();
        indices.sort_unstable();
        indices.dedup();
        indices.into_iter().map(|i| &self.rules[i]).collect()
    }
}

pub struct JobRouter {
    storage: Arc<StorageGateway>,
    cache: RwLock<RuleCache>,
}

impl JobRouter {
    pub async fn new(storage: Arc<StorageGateway>) -> Result<Self> {
        let rules = storage.list_enabled_routing_rules().await?;
        Ok(Self { storage, cache: RwLock::new(RuleCache::build(rules)) })
    }

    pub async fn refresh(&self) -> Result<()> {
        let rules = self.storage.list_enabled_routing_rules().await?;
        *self.cache.write().await = RuleCache::build(rules);
        Ok(())
    }

    pub async fn run_refresh_loop(&self) {
        loop {
            tokio::time::sleep(REFRESH_INTERVAL).await;
            if let Err(e) = self.refresh().await {
                tracing::warn!(error = %e, "routing rule refresh failed");
            }
        }
    }

    /// Resolves a job's labels/metadata to target runners: rules already
    /// sorted by `(priority desc, created_at asc)` by the storage query, so
    /// the first match in `candidates` is the winner.
    pub async fn route_job(
        &self,
        repository: &str,
        workflow: &str,
        git_ref: &str,
        event: &str,
        labels: &[String],
    ) -> Result<RoutingDecisionResult> {
        let ctx = JobContext {
            repository,
            workflow,
            branch: branch_from_ref(git_ref),
            event,
            labels,
        };

        let cache = self.cache.read().await;
        let winner = cache.candidates(labels).into_iter().find(|r| rule_matches(r, &ctx));

        let (pool_repo, rule_id, required_labels, exclusive) = match winner {
            Some(rule) => (
                rule.targets.pool_override.clone().unwrap_or_else(|| repository.to_string()),
                Some(rule.id),
                rule.targets.runner_labels.clone(),
                rule.targets.exclusive,
            ),
            None => (repository.to_string(), None, vec![], false),
        };
        drop(cache);

        let runners = self.storage.get_active_runners(&pool_repo).await?;

        let target_runners: Vec<Runner> = if rule_id.is_some() {
            runners
                .into_iter()
                .filter(|r| {
                    let runner_labels = r.labels_vec();
                    if exclusive {
                        let mut a: Vec<&String> = runner_labels.iter().collect();
                        let mut b: Vec<&String> = required_labels.iter().collect();
                        a.sort();
                        b.sort();
                        a == b
                    } else {
                        required_labels.iter().all(|l| runner_labels.contains(l))
                    }
                })
                .collect()
        } else {
            // Default routing: prefer runners whose labels intersect the
            // job's labels; fall back to every active runner.
            let intersecting: Vec<Runner> = runners
                .iter()
                .filter(|r| r.labels_vec().iter().any(|l| labels.contains(l)))
                .cloned()
                .collect();
            if intersecting.is_empty() {
                runners
            } else {
                intersecting
            }
        };

        Ok(RoutingDecisionResult { rule_id, target_runners })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use crate::storage::models::{RoutingConditions, RoutingTargets};

    fn make_rule(priority: i32, labels: Vec<&str>, runner_labels: Vec<&str>) -> RoutingRule {
        RoutingRule {
            id: Uuid::new_v4(),
            name: format!("rule-{priority}"),
            priority,
            conditions: RoutingConditions {
                labels: labels.into_iter().map(String::from).collect(),
                repository: None,
                workflow: None,
                branch: None,
                event: None,
            },
            targets: RoutingTargets {
                runner_labels: runner_labels.into_iter().map(String::from).collect(),
                pool_override: None,
                exclusive: false,
            },
            enabled: true,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn cache_indexes_rules_by_label_and_finds_highest_priority_first() {
        let rule_a = make_rule(100, vec!["gpu"], vec!["gpu", "linux"]);
        let rule_b = make_rule(50, vec!["gpu"], vec!["gpu"]);
        let cache = RuleCache::build(vec![rule_a, rule_b]);

        let candidates = cache.candidates(&["gpu".to_string(), "linux".to_string()]);
        assert_eq!(candidates.len(), 2);
        // Candidates preserve original (priority-sorted) order via index order.
        assert_eq!(candidates[0].priority, 100);
    }

    #[test]
    fn unconditioned_rules_are_always_candidates() {
        let rule = make_rule(10, vec![], vec![]);
        let cache = RuleCache::build(vec![rule]);
        assert_eq!(cache.candidates(&["anything".to_string()]).len(), 1);
    }
}
