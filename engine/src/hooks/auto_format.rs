//! Post-write auto formatter
//!
//! Normalizes files the coder writes: source files lose trailing whitespace and
//! end with a newline, JSON files are re-serialized with two-space indentation.
//! The hook only reports `Modify` when the content actually changed.

use std::path::Path;

use super::{ExecutionHook, HookContext, HookError, HookOperation, HookPhase, HookResponse};

const TEXT_EXTENSIONS: &[&str] = &["py", "js", "mjs", "cjs", "jsx", "ts", "tsx"];
const JSON_EXTENSIONS: &[&str] = &["json"];

/// Formats written source and data files
pub struct AutoFormatHook;

impl AutoFormatHook {
    pub fn new() -> Self {
        Self
    }

    fn extension(target: &str) -> Option<String> {
        Path::new(target)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
    }

    /// Formatted content, or `None` when the file type is not handled
    pub fn format(target: &str, content: &str) -> Option<String> {
        let ext = Self::extension(target)?;
        if TEXT_EXTENSIONS.contains(&ext.as_str()) {
            Some(format_text(content))
        } else if JSON_EXTENSIONS.contains(&ext.as_str()) {
            Some(format_json(content))
        } else {
            None
        }
    }
}

impl Default for AutoFormatHook {
    fn default() -> Self {
        Self::new()
    }
}

fn format_text(content: &str) -> String {
    let mut formatted = content
        .split('\n')
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n");
    if !formatted.ends_with('\n') {
        formatted.push('\n');
    }
    formatted
}

/// Unparseable JSON is returned unchanged
fn format_json(content: &str) -> String {
    match serde_json::from_str::<serde_json::Value>(content)
        .ok()
        .and_then(|value| serde_json::to_string_pretty(&value).ok())
    {
        Some(pretty) => pretty + "\n",
        None => content.to_string(),
    }
}

impl ExecutionHook for AutoFormatHook {
    fn name(&self) -> &str {
        "auto_formatter"
    }

    fn phase(&self) -> HookPhase {
        HookPhase::Post
    }

    fn priority(&self) -> i32 {
        80
    }

    fn should_run(&self, context: &HookContext) -> bool {
        context.operation == HookOperation::WriteFile
            && context
                .target
                .as_deref()
                .and_then(Self::extension)
                .map(|ext| {
                    TEXT_EXTENSIONS.contains(&ext.as_str()) || JSON_EXTENSIONS.contains(&ext.as_str())
                })
                .unwrap_or(false)
    }

    fn execute(&mut self, context: &HookContext) -> Result<HookResponse, HookError> {
        let (Some(target), Some(content)) = (context.target.as_deref(), context.content.as_deref())
        else {
            return Ok(HookResponse::allow());
        };

        match Self::format(target, content) {
            Some(formatted) if formatted != content => Ok(HookResponse::modify(
                formatted,
                format!("Formatted {}", target),
            )),
            _ => Ok(HookResponse::allow()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::HookResult;

    fn write_ctx(target: &str, content: &str) -> HookContext {
        HookContext::new(HookOperation::WriteFile, "coder", 1)
            .with_target(target)
            .with_content(content)
    }

    #[test]
    fn test_strips_trailing_whitespace_and_adds_newline() {
        let mut hook = AutoFormatHook::new();
        let response = hook
            .execute(&write_ctx("app.py", "def f():  \n    return 1\t"))
            .unwrap();
        assert_eq!(response.result, HookResult::Modify);
        assert_eq!(
            response.modified_content.as_deref(),
            Some("def f():\n    return 1\n")
        );
    }

    #[test]
    fn test_clean_file_is_allowed() {
        let mut hook = AutoFormatHook::new();
        let response = hook
            .execute(&write_ctx("app.js", "const a = 1;\n"))
            .unwrap();
        assert_eq!(response.result, HookResult::Allow);
        assert!(response.modified_content.is_none());
    }

    #[test]
    fn test_json_reindented() {
        let mut hook = AutoFormatHook::new();
        let response = hook
            .execute(&write_ctx("package.json", r#"{"name":"app","version":"1.0.0"}"#))
            .unwrap();
        assert_eq!(response.result, HookResult::Modify);
        assert_eq!(
            response.modified_content.as_deref(),
            Some("{\n  \"name\": \"app\",\n  \"version\": \"1.0.0\"\n}\n")
        );
    }

    #[test]
    fn test_invalid_json_left_alone() {
        let mut hook = AutoFormatHook::new();
        let response = hook.execute(&write_ctx("data.json", "{not json")).unwrap();
        assert_eq!(response.result, HookResult::Allow);
    }

    #[test]
    fn test_unrecognized_extension_skipped() {
        let hook = AutoFormatHook::new();
        assert!(!hook.should_run(&write_ctx("README.md", "x  ")));
        assert!(hook.should_run(&write_ctx("src/App.TSX", "x  ")));
        let exec = HookContext::new(HookOperation::ExecuteCommand, "tester", 1).with_target("a.py");
        assert!(!hook.should_run(&exec));
    }
}
