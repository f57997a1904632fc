//! Shared tree-sitter plumbing for the context-assembly subsystems.
//!
//! Language detection, per-language definition/import node types, workspace
//! file collection, and symbol-name extraction used by the repo map, the
//! retrieval chunker, and the code graph builder.

use std::path::{Path, PathBuf};

use ignore::WalkBuilder;
use tree_sitter::{Language, Node, Parser, Tree};

/// Directories never descended into during workspace walks.
pub const SKIP_DIRS: &[&str] = &[
    ".git",
    "node_modules",
    "vendor",
    "__pycache__",
    "dist",
    "build",
    "target",
    ".venv",
    ".tox",
    ".mypy_cache",
    ".ruff_cache",
    ".pytest_cache",
];

/// Maximum file size considered for parsing (100 KB).
pub const MAX_FILE_SIZE: u64 = 100 * 1024;

/// Maximum number of files collected per workspace.
pub const MAX_FILES: usize = 2000;

/// Map a file extension to its language name.
pub fn language_for_extension(ext: &str) -> Option<&'static str> {
    match ext {
        "rs" => Some("rust"),
        "py" => Some("python"),
        "go" => Some("go"),
        "js" | "jsx" => Some("javascript"),
        "ts" => Some("typescript"),
        "tsx" => Some("tsx"),
        _ => None,
    }
}

fn grammar_for(language: &str) -> Option<Language> {
    match language {
        "rust" => Some(tree_sitter_rust::LANGUAGE.into()),
        "python" => Some(tree_sitter_python::LANGUAGE.into()),
        "go" => Some(tree_sitter_go::LANGUAGE.into()),
        "javascript" => Some(tree_sitter_javascript::LANGUAGE.into()),
        "typescript" => Some(tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into()),
        "tsx" => Some(tree_sitter_typescript::LANGUAGE_TSX.into()),
        _ => None,
    }
}

/// AST node types that declare symbols, per language.
pub fn def_node_types(language: &str) -> &'static [&'static str] {
    match language {
        "rust" => &[
            "function_item",
            "struct_item",
            "enum_item",
            "impl_item",
            "trait_item",
        ],
        "python" => &["function_definition", "class_definition", "assignment"],
        "go" => &[
            "function_declaration",
            "method_declaration",
            "type_declaration",
            "const_declaration",
            "var_declaration",
        ],
        "javascript" => &[
            "function_declaration",
            "class_declaration",
            "lexical_declaration",
            "method_definition",
        ],
        "typescript" | "tsx" => &[
            "function_declaration",
            "class_declaration",
            "lexical_declaration",
            "method_definition",
            "interface_declaration",
            "type_alias_declaration",
        ],
        _ => &[],
    }
}

/// AST node types that introduce imports, per language.
pub fn import_node_types(language: &str) -> &'static [&'static str] {
    match language {
        "python" => &["import_statement", "import_from_statement"],
        "go" => &["import_declaration"],
        "javascript" | "typescript" | "tsx" => &["import_statement"],
        _ => &[],
    }
}

/// Container node types recursed into when hunting nested definitions
/// (class bodies, impl blocks, interfaces).
pub const BODY_NODE_TYPES: &[&str] = &[
    "class_definition",
    "class_declaration",
    "class_body",
    "impl_item",
    "declaration_list",
    "interface_declaration",
    "interface_body",
];

/// Simplified kind for a definition node type.
pub fn kind_for_node(node_type: &str) -> &'static str {
    match node_type {
        "function_declaration" | "function_definition" | "function_item" => "function",
        "method_declaration" | "method_definition" => "method",
        "class_declaration" | "class_definition" | "struct_item" | "enum_item" | "impl_item"
        | "trait_item" | "type_declaration" | "type_alias_declaration" | "interface_declaration" => {
            "class"
        }
        _ => "function",
    }
}

/// Parse `source` as `language`. Returns `None` for unknown languages or
/// parser failures.
pub fn parse_source(language: &str, source: &[u8]) -> Option<Tree> {
    let grammar = grammar_for(language)?;
    let mut parser = Parser::new();
    parser.set_language(&grammar).ok()?;
    parser.parse(source, None)
}

/// Collect the direct children of a node.
pub fn children_of<'a>(node: Node<'a>) -> Vec<Node<'a>> {
    let mut cursor = node.walk();
    node.children(&mut cursor).collect()
}

/// Text of a node, empty on decode failure.
pub fn node_text(node: Node<'_>, source: &[u8]) -> String {
    node.utf8_text(source).unwrap_or_default().to_string()
}

/// Extract the symbol name from a definition node: the `name` field where the
/// grammar has one, with per-language fallbacks for declaration wrappers.
pub fn extract_def_name(node: Node<'_>, source: &[u8]) -> String {
    if let Some(name) = node.child_by_field_name("name") {
        return node_text(name, source);
    }

    match node.kind() {
        // Go: type_declaration -> type_spec -> name
        "type_declaration" => {
            for child in children_of(node) {
                if child.kind() == "type_spec" {
                    if let Some(name) = child.child_by_field_name("name") {
                        return node_text(name, source);
                    }
                }
            }
        }
        // Go: const/var declarations -> spec -> name
        "const_declaration" | "var_declaration" => {
            for child in children_of(node) {
                if child.kind() == "const_spec" || child.kind() == "var_spec" {
                    if let Some(name) = child.child_by_field_name("name") {
                        return node_text(name, source);
                    }
                }
            }
        }
        // TS/JS: lexical_declaration -> variable_declarator -> name
        "lexical_declaration" => {
            for child in children_of(node) {
                if child.kind() == "variable_declarator" {
                    if let Some(name) = child.child_by_field_name("name") {
                        return node_text(name, source);
                    }
                }
            }
        }
        // Python: assignment -> left identifier
        "assignment" => {
            if let Some(left) = node.child_by_field_name("left") {
                if left.kind() == "identifier" {
                    return node_text(left, source);
                }
            }
        }
        // Rust: impl blocks carry their type in the `type` field.
        "impl_item" => {
            if let Some(ty) = node.child_by_field_name("type") {
                return node_text(ty, source);
            }
        }
        _ => {}
    }
    String::new()
}

/// Extract imported module/package names from an import node.
pub fn extract_import_names(node: Node<'_>, source: &[u8], language: &str) -> Vec<String> {
    match language {
        "python" => extract_python_imports(node, source),
        "go" => extract_go_imports(node, source),
        "javascript" | "typescript" | "tsx" => node
            .child_by_field_name("source")
            .map(|s| vec![node_text(s, source).trim_matches(&['\'', '"'][..]).to_string()])
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}

fn extract_python_imports(node: Node<'_>, source: &[u8]) -> Vec<String> {
    let mut names = Vec::new();
    if node.kind() == "import_from_statement" {
        if let Some(module) = node.child_by_field_name("module_name") {
            names.push(node_text(module, source));
        }
        return names;
    }
    for child in children_of(node) {
        match child.kind() {
            "dotted_name" => names.push(node_text(child, source)),
            "aliased_import" => {
                if let Some(name) = child.child_by_field_name("name") {
                    names.push(node_text(name, source));
                }
            }
            _ => {}
        }
    }
    names
}

fn extract_go_imports(node: Node<'_>, source: &[u8]) -> Vec<String> {
    let mut names = Vec::new();
    for child in children_of(node) {
        match child.kind() {
            "import_spec_list" => {
                for spec in children_of(child) {
                    if spec.kind() == "import_spec" {
                        if let Some(path) = spec.child_by_field_name("path") {
                            names.push(node_text(path, source).trim_matches('"').to_string());
                        }
                    }
                }
            }
            "import_spec" => {
                if let Some(path) = child.child_by_field_name("path") {
                    names.push(node_text(path, source).trim_matches('"').to_string());
                }
            }
            _ => {}
        }
    }
    names
}

/// A source file discovered in a workspace walk.
#[derive(Debug, Clone)]
pub struct SourceFile {
    pub abs_path: PathBuf,
    pub rel_path: String,
    pub language: &'static str,
}

/// Recursively collect parseable source files, skipping ignored directories
/// and oversized files, capped at [`MAX_FILES`].
pub fn collect_files(workspace: &Path) -> Vec<SourceFile> {
    let mut collected = Vec::new();

    let walker = WalkBuilder::new(workspace)
        .standard_filters(false)
        .sort_by_file_name(std::ffi::OsStr::cmp)
        .filter_entry(|entry| {
            let name = entry.file_name().to_string_lossy();
            !(entry.file_type().map(|t| t.is_dir()).unwrap_or(false)
                && SKIP_DIRS.contains(&name.as_ref()))
        })
        .build();

    for entry in walker.flatten() {
        if collected.len() >= MAX_FILES {
            break;
        }
        if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            continue;
        }
        let path = entry.path();
        let Some(language) = path
            .extension()
            .and_then(|e| e.to_str())
            .and_then(language_for_extension)
        else {
            continue;
        };
        match entry.metadata() {
            Ok(metadata) if metadata.len() <= MAX_FILE_SIZE => {}
            _ => continue,
        }
        let Ok(rel) = path.strip_prefix(workspace) else {
            continue;
        };
        collected.push(SourceFile {
            abs_path: path.to_path_buf(),
            rel_path: rel.display().to_string(),
            language,
        });
    }

    collected
}
