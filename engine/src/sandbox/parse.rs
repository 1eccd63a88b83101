//! Test runner output parsing

use regex::Regex;
use std::sync::OnceLock;

/// Counts read from a runner summary
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub total: u32,
    pub passed: u32,
    pub failed: u32,
    pub failed_tests: Vec<String>,
}

fn pytest_count() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(\d+)\s+(passed|failed|errors?|skipped|xfailed|xpassed)\b")
            .expect("Invalid pytest count pattern")
    })
}

fn pytest_failed_test() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?:FAILED|ERROR)\s+(\S+)").expect("Invalid pytest failed test pattern")
    })
}

fn node_count() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[#ℹ]\s*(tests|pass|fail)\s+(\d+)").expect("Invalid node count pattern")
    })
}

fn node_failed_test() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s*not ok \d+ - (.+)$").expect("Invalid node failed test pattern")
    })
}

/// Parse pytest `-q` output such as `2 failed, 1 passed in 0.05s`
pub fn parse_pytest(output: &str) -> RunSummary {
    let mut summary = RunSummary::default();

    for line in output.lines() {
        if let Some(caps) = pytest_failed_test().captures(line.trim()) {
            summary.failed_tests.push(caps[1].to_string());
        }
    }

    let Some(summary_line) = output.lines().rev().find(|line| {
        let line = line.trim().trim_matches('=').trim();
        line.contains(" in ")
            && (line.contains("passed") || line.contains("failed") || line.contains("error"))
    }) else {
        return summary;
    };

    let summary_line = summary_line.trim().trim_matches('=').trim();
    for part in summary_line.split(',') {
        let Some(caps) = pytest_count().captures(part.trim()) else {
            continue;
        };
        let count: u32 = caps[1].parse().unwrap_or(0);
        match &caps[2] {
            "passed" => summary.passed += count,
            "failed" | "error" | "errors" => summary.failed += count,
            _ => {}
        }
    }
    summary.total = summary.passed + summary.failed;
    summary
}

/// Parse the TAP-style totals printed by `node --test`
pub fn parse_node(output: &str) -> RunSummary {
    let mut summary = RunSummary::default();

    for line in output.lines() {
        let trimmed = line.trim();
        if let Some(caps) = node_count().captures(trimmed) {
            let count: u32 = caps[2].parse().unwrap_or(0);
            match &caps[1] {
                "tests" => summary.total = count,
                "pass" => summary.passed = count,
                "fail" => summary.failed = count,
                _ => {}
            }
        } else if let Some(caps) = node_failed_test().captures(line) {
            summary.failed_tests.push(caps[1].trim().to_string());
        }
    }
    summary
}

/// pytest assertion detail lines (`E   ...`), joined
pub fn pytest_error_lines(output: &str) -> Option<String> {
    let lines: Vec<&str> = output
        .lines()
        .filter_map(|line| line.strip_prefix("E "))
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();

    if lines.is_empty() {
        None
    } else {
        Some(lines.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pytest_summary_counts() {
        let output = "\
..F
=================================== FAILURES ===================================
___________________________________ test_add ___________________________________
E       assert 3 == 4
=========================== short test summary info ============================
FAILED test_app.py::test_add - assert 3 == 4
1 failed, 2 passed in 0.05s
";
        let summary = parse_pytest(output);
        assert_eq!(summary.total, 3);
        assert_eq!(summary.passed, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.failed_tests, vec!["test_app.py::test_add"]);
        assert_eq!(pytest_error_lines(output).as_deref(), Some("assert 3 == 4"));
    }

    #[test]
    fn test_pytest_decorated_summary() {
        let summary = parse_pytest("========= 4 passed in 0.01s =========\n");
        assert_eq!(summary.total, 4);
        assert_eq!(summary.passed, 4);
        assert!(summary.failed_tests.is_empty());
    }

    #[test]
    fn test_pytest_collection_error() {
        let summary = parse_pytest("ERROR test_app.py\n1 error in 0.10s\n");
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.failed_tests, vec!["test_app.py"]);
    }

    #[test]
    fn test_node_tap_totals() {
        let output = "\
TAP version 13
not ok 2 - adds numbers
# tests 3
# pass 2
# fail 1
";
        let summary = parse_node(output);
        assert_eq!(summary.total, 3);
        assert_eq!(summary.passed, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.failed_tests, vec!["adds numbers"]);
    }

    #[test]
    fn test_unrecognized_output() {
        assert_eq!(parse_pytest("segfault"), RunSummary::default());
        assert_eq!(parse_node(""), RunSummary::default());
    }
}
