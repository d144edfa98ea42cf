//! Dedup-key hashing for inbound webhook deliveries.

use sha2::{Digest, Sha256};

/// Hashes the event-identifying tuple used to collapse duplicate deliveries.
/// `None` fields are represented by an empty segment so the key stays a pure
/// function of its inputs, not of which fields happened to be present.
pub fn dedup_key(
    event_type: &str,
    delivery_id: &str,
    action: Option<&str>,
    repository: &str,
    workflow_job_id: Option<i64>,
    workflow_run_id: Option<i64>,
    pull_request_id: Option<i64>,
    issue_id: Option<i64>,
) -> String {
    let joined = format!(
        "{event_type}|{delivery_id}|{}|{repository}|{}|{}|{}|{}",
        action.unwrap_or(""),
        workflow_job_id.map(|v| v.to_string()).unwrap_or_default(),
        workflow_run_id.map(|v| v.to_string()).unwrap_or_default(),
        pull_request_id.map(|v| v.to_string()).unwrap_or_default(),
        issue_id.map(|v| v.to_string()).unwrap_or_default(),
    );

    let mut hasher = Sha256::new();
    hasher.update(joined.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_inputs_produce_same_key() {
        let a = dedup_key("workflow_job", "d1", Some("queued"), "o/r", Some(1), Some(2), None, None);
        let b = dedup_key("workflow_job", "d1", Some("queued"), "o/r", Some(1), Some(2), None, None);
        assert_eq!(a, b);
    }

    #[test]
    fn differing_action_produces_different_key() {
        let a = dedup_key("workflow_job", "d1", Some("queued"), "o/r", Some(1), None, None, None);
        let b = dedup_key("workflow_job", "d1", Some("completed"), "o/r", Some(1), None, None, None);
        assert_ne!(a, b);
    }
}
