//! Built-in filesystem tools: read_file, write_file, edit_file.

use std::fs;
use std::path::Path;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::sandbox::resolve_safe_path;
use super::traits::{required_str, ToolDefinition, ToolExecutor, ToolResult};

// ─── read_file ───────────────────────────────────────────────────────────────

pub fn read_file_definition() -> ToolDefinition {
    ToolDefinition::new(
        "read_file",
        "Read the contents of a file. Returns lines with line numbers.",
        json!({
            "type": "object",
            "properties": {
                "file_path": {
                    "type": "string",
                    "description": "Path to the file to read (relative to workspace)."
                },
                "offset": {
                    "type": "integer",
                    "description": "Line number to start reading from (1-based). Defaults to 1."
                },
                "limit": {
                    "type": "integer",
                    "description": "Maximum number of lines to return. Defaults to all."
                }
            },
            "required": ["file_path"]
        }),
    )
}

pub struct ReadFileTool;

#[async_trait]
impl ToolExecutor for ReadFileTool {
    async fn execute(&self, arguments: &Value, workspace: &Path) -> Result<ToolResult, String> {
        let rel = required_str(arguments, "file_path")?;
        let target = match resolve_safe_path(workspace, rel) {
            Ok(path) => path,
            Err(reason) => return Ok(ToolResult::failure(reason)),
        };
        if !target.is_file() {
            return Ok(ToolResult::failure(format!("file not found: {rel}")));
        }

        let text = match fs::read(&target) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(error) => return Ok(ToolResult::failure(error.to_string())),
        };

        let offset = arguments
            .get("offset")
            .and_then(Value::as_u64)
            .map(|n| n.max(1) as usize)
            .unwrap_or(1);
        let limit = arguments.get("limit").and_then(Value::as_u64).map(|n| n as usize);

        let mut numbered = String::new();
        let start = offset - 1;
        for (i, line) in text.lines().enumerate().skip(start) {
            if let Some(limit) = limit {
                if i >= start + limit {
                    break;
                }
            }
            numbered.push_str(&format!("{:>6}\t{line}\n", i + 1));
        }

        Ok(ToolResult::ok(numbered))
    }
}

// ─── write_file ──────────────────────────────────────────────────────────────

pub fn write_file_definition() -> ToolDefinition {
    ToolDefinition::new(
        "write_file",
        "Write content to a file. Creates parent directories if needed.",
        json!({
            "type": "object",
            "properties": {
                "file_path": {
                    "type": "string",
                    "description": "Path to the file to write (relative to workspace)."
                },
                "content": {
                    "type": "string",
                    "description": "Content to write to the file."
                }
            },
            "required": ["file_path", "content"]
        }),
    )
}

pub struct WriteFileTool;

#[async_trait]
impl ToolExecutor for WriteFileTool {
    async fn execute(&self, arguments: &Value, workspace: &Path) -> Result<ToolResult, String> {
        let rel = required_str(arguments, "file_path")?;
        let content = required_str(arguments, "content")?;
        let target = match resolve_safe_path(workspace, rel) {
            Ok(path) => path,
            Err(reason) => return Ok(ToolResult::failure(reason)),
        };

        if let Some(parent) = target.parent() {
            if let Err(error) = fs::create_dir_all(parent) {
                return Ok(ToolResult::failure(error.to_string()));
            }
        }
        if let Err(error) = fs::write(&target, content) {
            return Ok(ToolResult::failure(error.to_string()));
        }

        Ok(ToolResult::ok(format!("wrote {} bytes to {rel}", content.len())))
    }
}

// ─── edit_file ───────────────────────────────────────────────────────────────

pub fn edit_file_definition() -> ToolDefinition {
    ToolDefinition::new(
        "edit_file",
        "Edit a file by replacing an exact occurrence of old_text with new_text. \
         The old_text must appear exactly once in the file.",
        json!({
            "type": "object",
            "properties": {
                "file_path": {
                    "type": "string",
                    "description": "Path to the file to edit (relative to workspace)."
                },
                "old_text": {
                    "type": "string",
                    "description": "Exact text to find and replace (must occur exactly once)."
                },
                "new_text": {
                    "type": "string",
                    "description": "Replacement text."
                }
            },
            "required": ["file_path", "old_text", "new_text"]
        }),
    )
}

pub struct EditFileTool;

#[async_trait]
impl ToolExecutor for EditFileTool {
    async fn execute(&self, arguments: &Value, workspace: &Path) -> Result<ToolResult, String> {
        let rel = required_str(arguments, "file_path")?;
        let old_text = required_str(arguments, "old_text")?;
        let new_text = required_str(arguments, "new_text")?;

        let target = match resolve_safe_path(workspace, rel) {
            Ok(path) => path,
            Err(reason) => return Ok(ToolResult::failure(reason)),
        };
        if !target.is_file() {
            return Ok(ToolResult::failure(format!("file not found: {rel}")));
        }

        let content = match fs::read_to_string(&target) {
            Ok(content) => content,
            Err(error) => return Ok(ToolResult::failure(error.to_string())),
        };

        let count = content.matches(old_text).count();
        if count == 0 {
            return Ok(ToolResult::failure("old_text not found in file"));
        }
        if count > 1 {
            return Ok(ToolResult::failure(format!(
                "old_text found {count} times (must be unique)"
            )));
        }

        let updated = content.replacen(old_text, new_text, 1);
        if let Err(error) = fs::write(&target, updated) {
            return Ok(ToolResult::failure(error.to_string()));
        }

        let old_lines = old_text.matches('\n').count() + 1;
        let new_lines = new_text.matches('\n').count() + 1;
        Ok(ToolResult::ok(format!(
            "replaced {old_lines} line(s) with {new_lines} line(s) in {rel}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn workspace() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    #[tokio::test]
    async fn read_numbers_lines() {
        let ws = workspace();
        fs::write(ws.path().join("a.txt"), "alpha\nbeta\n").unwrap();

        let result = ReadFileTool
            .execute(&json!({"file_path": "a.txt"}), ws.path())
            .await
            .unwrap();
        assert!(result.success);
        assert!(result.output.contains("     1\talpha"));
        assert!(result.output.contains("     2\tbeta"));
    }

    #[tokio::test]
    async fn read_respects_offset_and_limit() {
        let ws = workspace();
        fs::write(ws.path().join("a.txt"), "one\ntwo\nthree\nfour\n").unwrap();

        let result = ReadFileTool
            .execute(&json!({"file_path": "a.txt", "offset": 2, "limit": 2}), ws.path())
            .await
            .unwrap();
        assert!(result.output.contains("two"));
        assert!(result.output.contains("three"));
        assert!(!result.output.contains("one"));
        assert!(!result.output.contains("four"));
    }

    #[tokio::test]
    async fn read_missing_file_fails() {
        let ws = workspace();
        let result = ReadFileTool
            .execute(&json!({"file_path": "nope.txt"}), ws.path())
            .await
            .unwrap();
        assert!(!result.success);
        assert!(result.error.contains("file not found"));
    }

    #[tokio::test]
    async fn read_blocks_traversal() {
        let ws = workspace();
        let result = ReadFileTool
            .execute(&json!({"file_path": "../../../etc/passwd"}), ws.path())
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.error, "path traversal blocked");
    }

    #[tokio::test]
    async fn write_creates_parents() {
        let ws = workspace();
        let result = WriteFileTool
            .execute(&json!({"file_path": "deep/dir/file.txt", "content": "data"}), ws.path())
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(
            fs::read_to_string(ws.path().join("deep/dir/file.txt")).unwrap(),
            "data"
        );
    }

    #[tokio::test]
    async fn write_missing_content_is_executor_error() {
        let ws = workspace();
        let result = WriteFileTool
            .execute(&json!({"file_path": "f.txt"}), ws.path())
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn edit_replaces_unique_occurrence() {
        let ws = workspace();
        fs::write(ws.path().join("a.txt"), "fn old() {}\nfn other() {}\n").unwrap();

        let result = EditFileTool
            .execute(
                &json!({"file_path": "a.txt", "old_text": "fn old()", "new_text": "fn new()"}),
                ws.path(),
            )
            .await
            .unwrap();
        assert!(result.success, "{}", result.error);
        assert!(fs::read_to_string(ws.path().join("a.txt")).unwrap().contains("fn new()"));
    }

    #[tokio::test]
    async fn edit_rejects_ambiguous_match() {
        let ws = workspace();
        fs::write(ws.path().join("a.txt"), "x\nx\n").unwrap();

        let result = EditFileTool
            .execute(
                &json!({"file_path": "a.txt", "old_text": "x", "new_text": "y"}),
                ws.path(),
            )
            .await
            .unwrap();
        assert!(!result.success);
        assert!(result.error.contains("must be unique"));
    }

    #[tokio::test]
    async fn edit_rejects_missing_text() {
        let ws = workspace();
        fs::write(ws.path().join("a.txt"), "content\n").unwrap();

        let result = EditFileTool
            .execute(
                &json!({"file_path": "a.txt", "old_text": "absent", "new_text": "y"}),
                ws.path(),
            )
            .await
            .unwrap();
        assert!(!result.success);
        assert!(result.error.contains("not found"));
    }
}
