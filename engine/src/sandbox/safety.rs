//! Static safety scan of generated Python
//!
//! A line-oriented regex scan run on every Python file before it reaches the
//! workspace. Findings come in two grades:
//!
//! - **issues** refuse the write: dynamic code execution (`eval`, `exec`,
//!   `compile`, `__import__`) and `open()` on an absolute path outside the
//!   workspace.
//! - **notices** are logged and let the write through: network and subprocess
//!   calls, and imports of modules that reach outside the process.
//!
//! Comment lines are skipped. String contents are not parsed, so a call
//! spelled inside a string literal on a code line still counts.

use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;

/// Calls that execute arbitrary code
pub const BLOCKED_CALLS: &[&str] = &["eval", "exec", "compile", "__import__"];

/// Modules whose import is reported as a notice
pub const NOTICE_MODULES: &[&str] = &["os", "subprocess", "pickle", "marshal"];

/// Findings of one scan
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SafetyReport {
    pub issues: Vec<String>,
    pub notices: Vec<String>,
}

impl SafetyReport {
    pub fn is_safe(&self) -> bool {
        self.issues.is_empty()
    }
}

fn blocked_call() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(&format!(r"(?:^|[^\w.])({})\s*\(", BLOCKED_CALLS.join("|")))
            .expect("Invalid blocked call pattern")
    })
}

fn notice_call() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?:^|[^\w.])(requests\.(?:get|post|put|delete)|urllib\.request\.urlopen|socket\.connect|subprocess\.(?:run|Popen|call))\s*\(",
        )
        .expect("Invalid notice call pattern")
    })
}

fn absolute_open() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?:^|[^\w.])open\s*\(\s*[rRbBuU]{0,2}(?:'(/[^']*)'|"(/[^"]*)")"#)
            .expect("Invalid open path pattern")
    })
}

fn import_stmt() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^import\s+(.+)$").expect("Invalid import pattern"))
}

fn from_import_stmt() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^from\s+([\w.]+)\s+import\b").expect("Invalid from-import pattern")
    })
}

/// Whether a line defines a function rather than calling one
fn is_definition(line: &str) -> bool {
    line.starts_with("def ") || line.starts_with("async def ")
}

/// Scan `code` for unsafe constructs
///
/// `workspace` is the only absolute location `open()` may name. Without one,
/// every absolute literal path is an issue.
pub fn check_code(code: &str, workspace: Option<&Path>) -> SafetyReport {
    let mut report = SafetyReport::default();

    for (index, raw) in code.lines().enumerate() {
        let line = raw.trim();
        let number = index + 1;
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if !is_definition(line) {
            for caps in blocked_call().captures_iter(line) {
                report
                    .issues
                    .push(format!("line {}: blocked operation {}()", number, &caps[1]));
            }
        }

        for caps in notice_call().captures_iter(line) {
            report.notices.push(format!(
                "line {}: network or subprocess call {}()",
                number, &caps[1]
            ));
        }

        for caps in absolute_open().captures_iter(line) {
            let Some(path) = caps.get(1).or_else(|| caps.get(2)) else {
                continue;
            };
            let inside = workspace.is_some_and(|root| Path::new(path.as_str()).starts_with(root));
            if !inside {
                report.issues.push(format!(
                    "line {}: file operation outside the workspace: {}",
                    number,
                    path.as_str()
                ));
            }
        }

        if let Some(caps) = import_stmt().captures(line) {
            for module in caps[1].split(',') {
                let name = module.split_whitespace().next().unwrap_or("");
                if NOTICE_MODULES.iter().any(|m| *m == name) {
                    report
                        .notices
                        .push(format!("line {}: import of {}", number, name));
                }
            }
        } else if let Some(caps) = from_import_stmt().captures(line) {
            if NOTICE_MODULES.iter().any(|m| *m == &caps[1]) {
                report
                    .notices
                    .push(format!("line {}: import from {}", number, &caps[1]));
            }
        }
    }

    report
}
