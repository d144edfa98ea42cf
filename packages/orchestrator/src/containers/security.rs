//! Mandatory security defaults and resource-limit translation applied to
//! every container this system creates.

use bollard::container::Config;
use bollard::models::HostConfig;
use std::collections::HashMap;

use crate::config::ResourceLimits;

pub const MANAGED_LABEL: &str = "managed";
const CPU_QUOTA_PERIOD_US: i64 = 100_000;

pub fn security_host_config(limits: &ResourceLimits) -> HostConfig {
    HostConfig {
        security_opt: Some(vec!["no-new-privileges".to_string()]),
        cap_drop: Some(vec!["ALL".to_string()]),
        cap_add: Some(vec![]),
        tmpfs: Some(HashMap::from([(
            "/tmp".to_string(),
            "rw,noexec,nosuid,size=1g".to_string(),
        )])),
        restart_policy: None,
        cpu_shares: Some(limits.cpu_shares),
        cpu_period: Some(CPU_QUOTA_PERIOD_US),
        cpu_quota: Some(limits.cpu_shares * CPU_QUOTA_PERIOD_US / 1024),
        memory: Some(limits.memory_mb * 1024 * 1024),
        memory_swap: Some(limits.memory_mb * 1024 * 1024),
        pids_limit: limits.pids,
        ..Default::default()
    }
}

pub fn apply_security_defaults<'a>(config: Config<&'a str>, limits: &ResourceLimits) -> Config<&'a str> {
    Config {
        working_dir: Some("/home/runner/work"),
        host_config: Some(security_host_config(limits)),
        labels: Some(HashMap::from([(MANAGED_LABEL.to_string(), "true".to_string())])),
        ..config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> ResourceLimits {
        ResourceLimits { cpu_shares: 1024, memory_mb: 2048, pids: Some(512) }
    }

    #[test]
    fn cap_drop_is_all() {
        let hc = security_host_config(&limits());
        assert_eq!(hc.cap_drop, Some(vec!["ALL".to_string()]));
    }

    #[test]
    fn no_restart_policy_by_default() {
        let hc = security_host_config(&limits());
        assert!(hc.restart_policy.is_none());
    }

    #[test]
    fn memory_swap_equals_memory_no_extra_swap() {
        let hc = security_host_config(&limits());
        assert_eq!(hc.memory, hc.memory_swap);
    }

    #[test]
    fn tmp_is_noexec_nosuid() {
        let hc = security_host_config(&limits());
        let tmp = &hc.tmpfs.unwrap()["/tmp"];
        assert!(tmp.contains("noexec"));
        assert!(tmp.contains("nosuid"));
    }
}
