//! Constraint checks run after binding.
//!
//! Validation collects every violation instead of stopping at the first one,
//! so a broken configuration file can be fixed in a single pass.

use std::fmt::Display;

/// A bound configuration value that can check its own constraints.
pub trait Validate {
    /// Push one `"<path> <message>"` line per violation onto `violations`.
    /// `path` is the dotted location of `self` within the document (empty at
    /// the root).
    fn validate_at(&self, path: &str, violations: &mut Vec<String>);

    /// All violations, sorted for stable output.
    fn validate(&self) -> Vec<String> {
        let mut violations = Vec::new();
        self.validate_at("", &mut violations);
        violations.sort();
        violations
    }
}

/// Join a parent path and a field name.
pub fn join(parent: &str, field: &str) -> String {
    if parent.is_empty() {
        field.to_owned()
    } else {
        format!("{parent}.{field}")
    }
}

/// A port must be 0 (pick any free port) or within `min..=max`.
pub fn port_range(
    path: &str,
    value: u32,
    min: u32,
    max: u32,
    violations: &mut Vec<String>,
) {
    if value != 0 && !(min..=max).contains(&value) {
        violations.push(format!("{path} must be between {min} and {max} (was {value})"));
    }
}

/// `value` must be at least `min`.
pub fn at_least<T: PartialOrd + Display>(
    path: &str,
    value: T,
    min: T,
    violations: &mut Vec<String>,
) {
    if value < min {
        violations.push(format!("{path} must be greater than or equal to {min} (was {value})"));
    }
}

/// `value` must not be blank.
pub fn not_empty(path: &str, value: &str, violations: &mut Vec<String>) {
    if value.trim().is_empty() {
        violations.push(format!("{path} may not be empty"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_zero_is_always_allowed() {
        let mut v = Vec::new();
        port_range("otherPort", 0, 10000, 15000, &mut v);
        assert!(v.is_empty());
    }

    #[test]
    fn port_outside_range_reports_bounds() {
        let mut v = Vec::new();
        port_range("otherPort", 8080, 10000, 15000, &mut v);
        assert_eq!(v, vec!["otherPort must be between 10000 and 15000 (was 8080)"]);
    }

    #[test]
    fn join_handles_root() {
        assert_eq!(join("", "server"), "server");
        assert_eq!(join("server", "max_threads"), "server.max_threads");
    }

    #[test]
    fn at_least_and_not_empty() {
        let mut v = Vec::new();
        at_least("server.min_threads", 0usize, 1, &mut v);
        not_empty("app.template", "  ", &mut v);
        not_empty("app.name", "x", &mut v);
        assert_eq!(
            v,
            vec![
                "server.min_threads must be greater than or equal to 1 (was 0)",
                "app.template may not be empty",
            ]
        );
    }
}
