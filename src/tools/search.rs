//! Built-in workspace search tools: search_files, glob_files, list_directory.

use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use globset::Glob;
use ignore::WalkBuilder;
use regex::Regex;
use serde_json::{json, Value};

use super::sandbox::resolve_safe_path;
use super::traits::{optional_str, required_str, ToolDefinition, ToolExecutor, ToolResult};

const MAX_SEARCH_MATCHES: usize = 100;
const MAX_GLOB_RESULTS: usize = 500;
const MAX_DIR_ENTRIES: usize = 500;
const MAX_LIST_DEPTH: usize = 3;

// ─── search_files ────────────────────────────────────────────────────────────

pub fn search_files_definition() -> ToolDefinition {
    ToolDefinition::new(
        "search_files",
        "Search file contents using a regex pattern. Returns matching lines with \
         file paths and line numbers.",
        json!({
            "type": "object",
            "properties": {
                "pattern": {
                    "type": "string",
                    "description": "Regular expression pattern to search for."
                },
                "path": {
                    "type": "string",
                    "description": "Subdirectory to search in (relative to workspace). Defaults to entire workspace."
                },
                "include": {
                    "type": "string",
                    "description": "Glob pattern to filter files (e.g. '*.rs')."
                }
            },
            "required": ["pattern"]
        }),
    )
}

pub struct SearchFilesTool;

#[async_trait]
impl ToolExecutor for SearchFilesTool {
    async fn execute(&self, arguments: &Value, workspace: &Path) -> Result<ToolResult, String> {
        let pattern = required_str(arguments, "pattern")?.to_string();
        let sub_path = optional_str(arguments, "path", ".").to_string();
        let include = optional_str(arguments, "include", "").to_string();

        let root = match resolve_safe_path(workspace, &sub_path) {
            Ok(path) => path,
            Err(reason) => return Ok(ToolResult::failure(reason)),
        };
        let workspace = workspace.to_path_buf();

        let result = tokio::task::spawn_blocking(move || search_blocking(&pattern, &root, &workspace, &include))
            .await
            .map_err(|e| format!("search task panicked: {e}"))?;
        Ok(result)
    }
}

fn search_blocking(pattern: &str, root: &Path, workspace: &Path, include: &str) -> ToolResult {
    let regex = match Regex::new(pattern) {
        Ok(regex) => regex,
        Err(error) => return ToolResult::failure(format!("invalid pattern: {error}")),
    };
    let include_glob = if include.is_empty() {
        None
    } else {
        match Glob::new(include) {
            Ok(glob) => Some(glob.compile_matcher()),
            Err(error) => return ToolResult::failure(format!("invalid include glob: {error}")),
        }
    };

    let mut matches: Vec<String> = Vec::new();
    let mut truncated = false;

    'walk: for entry in WalkBuilder::new(root).build().flatten() {
        if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            continue;
        }
        if let Some(matcher) = &include_glob {
            let name = entry.file_name().to_string_lossy();
            if !matcher.is_match(name.as_ref()) {
                continue;
            }
        }
        let Ok(content) = fs::read_to_string(entry.path()) else {
            continue;
        };
        let rel = entry
            .path()
            .strip_prefix(workspace)
            .unwrap_or(entry.path())
            .display()
            .to_string();
        for (lineno, line) in content.lines().enumerate() {
            if regex.is_match(line) {
                if matches.len() >= MAX_SEARCH_MATCHES {
                    truncated = true;
                    break 'walk;
                }
                matches.push(format!("{rel}:{}:{line}", lineno + 1));
            }
        }
    }

    if matches.is_empty() {
        return ToolResult::ok("no matches found");
    }
    let mut output = matches.join("\n");
    if truncated {
        output.push_str(&format!("\n\n... truncated to {MAX_SEARCH_MATCHES} matches"));
    }
    ToolResult::ok(output)
}

// ─── glob_files ──────────────────────────────────────────────────────────────

pub fn glob_files_definition() -> ToolDefinition {
    ToolDefinition::new(
        "glob_files",
        "Find files matching a glob pattern. Returns a sorted list of relative file paths.",
        json!({
            "type": "object",
            "properties": {
                "pattern": {
                    "type": "string",
                    "description": "Glob pattern (e.g. '**/*.rs', 'src/**/*.ts')."
                }
            },
            "required": ["pattern"]
        }),
    )
}

pub struct GlobFilesTool;

#[async_trait]
impl ToolExecutor for GlobFilesTool {
    async fn execute(&self, arguments: &Value, workspace: &Path) -> Result<ToolResult, String> {
        let pattern = required_str(arguments, "pattern")?.to_string();
        let workspace = workspace.to_path_buf();

        let result = tokio::task::spawn_blocking(move || glob_blocking(&pattern, &workspace))
            .await
            .map_err(|e| format!("glob task panicked: {e}"))?;
        Ok(result)
    }
}

fn glob_blocking(pattern: &str, workspace: &Path) -> ToolResult {
    let matcher = match Glob::new(pattern) {
        Ok(glob) => glob.compile_matcher(),
        Err(error) => return ToolResult::failure(format!("invalid pattern: {error}")),
    };

    let mut rel_paths: Vec<String> = Vec::new();
    for entry in WalkBuilder::new(workspace).build().flatten() {
        if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            continue;
        }
        let Ok(rel) = entry.path().strip_prefix(workspace) else {
            continue;
        };
        if matcher.is_match(rel) {
            rel_paths.push(rel.display().to_string());
        }
    }
    rel_paths.sort();

    if rel_paths.is_empty() {
        return ToolResult::ok("no matches found");
    }

    let truncated = rel_paths.len() > MAX_GLOB_RESULTS;
    rel_paths.truncate(MAX_GLOB_RESULTS);
    let mut output = rel_paths.join("\n");
    if truncated {
        output.push_str(&format!("\n\n... truncated to {MAX_GLOB_RESULTS} results"));
    }
    ToolResult::ok(output)
}

// ─── list_directory ──────────────────────────────────────────────────────────

pub fn list_directory_definition() -> ToolDefinition {
    ToolDefinition::new(
        "list_directory",
        "List contents of a directory with [DIR] and [FILE] prefixes.",
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Directory path relative to workspace (defaults to '.')."
                },
                "recursive": {
                    "type": "boolean",
                    "description": "List recursively up to depth 3 (default false)."
                }
            }
        }),
    )
}

pub struct ListDirectoryTool;

#[async_trait]
impl ToolExecutor for ListDirectoryTool {
    async fn execute(&self, arguments: &Value, workspace: &Path) -> Result<ToolResult, String> {
        let rel = optional_str(arguments, "path", ".");
        let recursive = arguments
            .get("recursive")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let target = match resolve_safe_path(workspace, rel) {
            Ok(path) => path,
            Err(reason) => return Ok(ToolResult::failure(reason)),
        };
        if !target.is_dir() {
            return Ok(ToolResult::failure(format!("not a directory: {rel}")));
        }

        let mut entries = Vec::new();
        collect_entries(&target, workspace, recursive, 0, &mut entries);

        if entries.is_empty() {
            return Ok(ToolResult::ok("(empty directory)"));
        }

        let truncated = entries.len() > MAX_DIR_ENTRIES;
        entries.truncate(MAX_DIR_ENTRIES);
        let mut output = entries.join("\n");
        if truncated {
            output.push_str(&format!("\n\n... truncated to {MAX_DIR_ENTRIES} entries"));
        }
        Ok(ToolResult::ok(output))
    }
}

fn collect_entries(base: &Path, workspace: &Path, recursive: bool, depth: usize, out: &mut Vec<String>) {
    let Ok(read_dir) = fs::read_dir(base) else {
        return;
    };
    let mut children: Vec<PathBuf> = read_dir.flatten().map(|e| e.path()).collect();
    // Directories first, then by name.
    children.sort_by_key(|p| (!p.is_dir(), p.file_name().map(|n| n.to_os_string())));

    for child in children {
        if out.len() > MAX_DIR_ENTRIES {
            return;
        }
        let rel = child.strip_prefix(workspace).unwrap_or(&child).display().to_string();
        if child.is_dir() {
            out.push(format!("[DIR]  {rel}"));
            if recursive && depth < MAX_LIST_DEPTH && out.len() <= MAX_DIR_ENTRIES {
                collect_entries(&child, workspace, recursive, depth + 1, out);
            }
        } else {
            out.push(format!("[FILE] {rel}"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn workspace() -> tempfile::TempDir {
        let ws = tempfile::tempdir().unwrap();
        fs::create_dir(ws.path().join("src")).unwrap();
        fs::write(ws.path().join("src/main.rs"), "fn main() {\n    run();\n}\n").unwrap();
        fs::write(ws.path().join("src/lib.rs"), "pub fn run() {}\n").unwrap();
        fs::write(ws.path().join("README.md"), "# readme\n").unwrap();
        ws
    }

    #[tokio::test]
    async fn search_finds_matching_lines() {
        let ws = workspace();
        let result = SearchFilesTool
            .execute(&json!({"pattern": "fn run"}), ws.path())
            .await
            .unwrap();
        assert!(result.success);
        assert!(result.output.contains("src/lib.rs:1:pub fn run() {}"));
    }

    #[tokio::test]
    async fn search_respects_include_glob() {
        let ws = workspace();
        let result = SearchFilesTool
            .execute(&json!({"pattern": "readme", "include": "*.rs"}), ws.path())
            .await
            .unwrap();
        assert_eq!(result.output, "no matches found");
    }

    #[tokio::test]
    async fn search_invalid_regex_fails() {
        let ws = workspace();
        let result = SearchFilesTool
            .execute(&json!({"pattern": "[unclosed"}), ws.path())
            .await
            .unwrap();
        assert!(!result.success);
        assert!(result.error.contains("invalid pattern"));
    }

    #[tokio::test]
    async fn glob_lists_sorted_relative_paths() {
        let ws = workspace();
        let result = GlobFilesTool
            .execute(&json!({"pattern": "**/*.rs"}), ws.path())
            .await
            .unwrap();
        assert_eq!(result.output, "src/lib.rs\nsrc/main.rs");
    }

    #[tokio::test]
    async fn glob_no_matches() {
        let ws = workspace();
        let result = GlobFilesTool
            .execute(&json!({"pattern": "**/*.go"}), ws.path())
            .await
            .unwrap();
        assert_eq!(result.output, "no matches found");
    }

    #[tokio::test]
    async fn list_directory_marks_kinds() {
        let ws = workspace();
        let result = ListDirectoryTool.execute(&json!({}), ws.path()).await.unwrap();
        assert!(result.output.contains("[DIR]  src"));
        assert!(result.output.contains("[FILE] README.md"));
        // Non-recursive: nested files are hidden.
        assert!(!result.output.contains("main.rs"));
    }

    #[tokio::test]
    async fn list_directory_recursive() {
        let ws = workspace();
        let result = ListDirectoryTool
            .execute(&json!({"recursive": true}), ws.path())
            .await
            .unwrap();
        assert!(result.output.contains("[FILE] src/main.rs"));
    }

    #[tokio::test]
    async fn list_directory_blocks_traversal() {
        let ws = workspace();
        let result = ListDirectoryTool
            .execute(&json!({"path": "../.."}), ws.path())
            .await
            .unwrap();
        assert!(!result.success);
    }

    #[tokio::test]
    async fn empty_directory_reported() {
        let ws = tempfile::tempdir().unwrap();
        let result = ListDirectoryTool.execute(&json!({}), ws.path()).await.unwrap();
        assert_eq!(result.output, "(empty directory)");
    }
}
