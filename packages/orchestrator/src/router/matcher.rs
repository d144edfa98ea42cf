//! Condition matching for a single routing rule against a job.

use crate::common::pattern;
use crate::storage::models::{RoutingConditions, RoutingRule};

pub struct JobContext<'a> {
    pub repository: &'a str,
    pub workflow: &'a str,
    pub branch: &'a str,
    pub event: &'a str,
    pub labels: &'a [String],
}

fn matches_optional(field: &Option<String>, value: &str) -> bool {
    match field {
        None => true,
        Some(pat) => pattern::matches(value, pat),
    }
}

pub fn conditions_match(conditions: &RoutingConditions, ctx: &JobContext) -> bool {
    if !conditions.labels.is_empty() && !conditions.labels.iter().all(|l| ctx.labels.contains(l)) {
        return false;
    }

    if !matches_optional(&conditions.repository, ctx.repository) {
        return false;
    }
    if !matches_optional(&conditions.workflow, ctx.workflow) {
        return false;
    }
    if !matches_optional(&conditions.branch, ctx.branch) {
        return false;
    }

    match &conditions.event {
        Some(e) if e != ctx.event => return false,
        _ => {}
    }

    true
}

pub fn rule_matches(rule: &RoutingRule, ctx: &JobContext) -> bool {
    rule.enabled && conditions_match(&rule.conditions, ctx)
}

/// Strips a leading `refs/heads/` from a ref, matching the derivation the
/// design specifies for the branch condition.
pub fn branch_from_ref(git_ref: &str) -> &str {
    git_ref.strip_prefix("refs/heads/").unwrap_or(git_ref)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn rule(conditions: RoutingConditions, priority: i32) -> RoutingRule {
        RoutingRule {
            id: Uuid::new_v4(),
            name: "r".into(),
            priority,
            conditions,
            targets: crate::storage::models::RoutingTargets {
                runner_labels: vec![],
                pool_override: None,
                exclusive: false,
            },
            enabled: true,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn label_subset_condition_passes_when_job_has_extra_labels() {
        let conditions = RoutingConditions {
            labels: vec!["gpu".into()],
            repository: None,
            workflow: None,
            branch: None,
            event: None,
        };
        let ctx = JobContext {
            repository: "o/r",
            workflow: "ci",
            branch: "main",
            event: "workflow_job",
            labels: &["gpu".to_string(), "linux".to_string()],
        };
        assert!(conditions_match(&conditions, &ctx));
    }

    #[test]
    fn wildcard_repository_condition() {
        let conditions = RoutingConditions {
            labels: vec![],
            repository: Some("org/*".into()),
            workflow: None,
            branch: None,
            event: None,
        };
        let ctx = JobContext {
            repository: "org/repo",
            workflow: "ci",
            branch: "main",
            event: "workflow_job",
            labels: &[],
        };
        assert!(conditions_match(&conditions, &ctx));
    }

    #[test]
    fn disabled_rule_never_matches() {
        let mut r = rule(
            RoutingConditions { labels: vec![], repository: None, workflow: None, branch: None, event: None },
            100,
        );
        r.enabled = false;
        let ctx = JobContext { repository: "o/r", workflow: "ci", branch: "main", event: "workflow_job", labels: &[] };
        assert!(!rule_matches(&r, &ctx));
    }

    #[test]
    fn branch_ref_prefix_is_stripped() {
        assert_eq!(branch_from_ref("refs/heads/main"), "main");
        assert_eq!(branch_from_ref("main"), "main");
    }
}
