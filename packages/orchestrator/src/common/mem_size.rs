//! Parsing and rendering of container memory-limit strings of form
//! `<integer><b|k|m|g>`, case-insensitive.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MemSizeError {
    #[error("malformed memory size: {0}")]
    Malformed(String),
}

const UNITS: [(char, u64); 4] = [('b', 1), ('k', 1024), ('m', 1024 * 1024), ('g', 1024 * 1024 * 1024)];

/// Parses `"512m"`, `"2G"`, `"4096b"` etc. into a byte count.
pub fn parse(input: &str) -> Result<u64, MemSizeError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(MemSizeError::Malformed(input.to_string()));
    }

    let last = trimmed.chars().last().unwrap();
    let lower = last.to_ascii_lowercase();

    let (digits, multiplier) = match UNITS.iter().find(|(u, _)| *u == lower) {
        Some((_, m)) => (&trimmed[..trimmed.len() - 1], *m),
        None => (trimmed, 1),
    };

    let value: u64 = digits
        .parse()
        .map_err(|_| MemSizeError::Malformed(input.to_string()))?;

    value
        .checked_mul(multiplier)
        .ok_or_else(|| MemSizeError::Malformed(input.to_string()))
}

/// Renders a byte count back to the largest unit that divides it evenly,
/// falling back to bytes. Not unique for every input but `parse(render(n)) == n`.
pub fn render(bytes: u64) -> String {
    for (unit, multiplier) in UNITS.iter().rev() {
        if *multiplier > 1 && bytes % multiplier == 0 {
            return format!("{}{}", bytes / multiplier, unit);
        }
    }
    format!("{bytes}b")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_each_unit() {
        assert_eq!(parse("512b").unwrap(), 512);
        assert_eq!(parse("2k").unwrap(), 2048);
        assert_eq!(parse("4M").unwrap(), 4 * 1024 * 1024);
        assert_eq!(parse("1G").unwrap(), 1024 * 1024 * 1024);
    }

    #[test]
    fn bare_integer_is_bytes() {
        assert_eq!(parse("100").unwrap(), 100);
    }

    #[test]
    fn rejects_malformed() {
        assert!(parse("").is_err());
        assert!(parse("m").is_err());
        assert!(parse("12x").is_err());
        assert!(parse("-5m").is_err());
    }

    #[test]
    fn round_trips_through_render() {
        for n in [0u64, 1, 512, 4096, 1024 * 1024, 3 * 1024 * 1024 * 1024, 123_456_789] {
            let rendered = render(n);
            assert_eq!(parse(&rendered).unwrap(), n, "round trip failed for {n}");
        }
    }
}
