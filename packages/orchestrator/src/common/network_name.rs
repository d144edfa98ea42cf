//! Derives a stable, daemon-legal network name for a repository.

const PREFIX: &str = "runners";

/// Lowercases and replaces every non `[a-z0-9-]` run with a single `-`.
/// Idempotent: `sanitize(sanitize(r)) == sanitize(r)`.
pub fn sanitize(repository: &str) -> String {
    let lower = repository.to_ascii_lowercase();
    let mut out = String::with_capacity(lower.len());
    let mut last_was_dash = false;

    for c in lower.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c);
            last_was_dash = false;
        } else if !last_was_dash {
            out.push('-');
            last_was_dash = true;
        }
    }

    out.trim_matches('-').to_string()
}

pub fn network_name(repository: &str) -> String {
    format!("{PREFIX}-{}", sanitize(repository))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replaces_slash_and_lowercases() {
        assert_eq!(sanitize("Owner/Repo"), "owner-repo");
    }

    #[test]
    fn collapses_runs_of_separators() {
        assert_eq!(sanitize("a//b__c"), "a-b-c");
    }

    #[test]
    fn is_a_fixed_point() {
        for input in ["Owner/Repo", "a//b__c", "already-clean", "weird!!chars??"] {
            let once = sanitize(input);
            let twice = sanitize(&once);
            assert_eq!(once, twice, "not idempotent for {input}");
        }
    }

    #[test]
    fn only_lowercase_alphanumeric_and_dash_remain() {
        let s = sanitize("Some.Weird@Repo Name!!");
        assert!(s.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'));
    }

    #[test]
    fn builds_prefixed_network_name() {
        assert_eq!(network_name("o/r"), "runners-o-r");
    }
}
