//! Structural validation of proposed files.
//!
//! [`validate`] is a pure function over one file: syntax-level problems
//! (unbalanced brackets, unterminated literals, malformed imports, invalid
//! JSON). [`validate_change_set`] adds the rules that need the whole
//! change set: path hygiene, duplicate paths, missing content, and relative
//! imports that resolve to no file.

mod imports;
mod scan;

use std::collections::{BTreeSet, HashSet};

use serde::{Deserialize, Serialize};

use crate::model::{ChangeSet, FileAction};
use scan::Rules;

/// One problem in one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<usize>,
    pub message: String,
}

impl Issue {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            line: None,
            message: message.into(),
        }
    }

    pub fn at(line: usize, message: impl Into<String>) -> Self {
        Self {
            line: Some(line),
            message: message.into(),
        }
    }
}

/// An [`Issue`] attributed to a path, as reported back to the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileIssue {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<usize>,
    pub message: String,
}

impl FileIssue {
    fn from_issue(path: &str, issue: Issue) -> Self {
        Self {
            path: path.to_string(),
            line: issue.line,
            message: issue.message,
        }
    }

    fn new(path: &str, message: impl Into<String>) -> Self {
        Self {
            path: path.to_string(),
            line: None,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for FileIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.line {
            Some(line) => write!(f, "{}:{}: {}", self.path, line, self.message),
            None => write!(f, "{}: {}", self.path, self.message),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Language {
    JavaScript,
    Jsx,
    TypeScript,
    Tsx,
    Json,
    Css,
    Html,
    Python,
    Other,
}

impl Language {
    /// Resolve an explicit language label, falling back to the extension.
    pub fn resolve(path: &str, label: Option<&str>) -> Self {
        label
            .and_then(Self::from_label)
            .unwrap_or_else(|| Self::from_path(path))
    }

    pub fn from_label(label: &str) -> Option<Self> {
        let language = match label.to_ascii_lowercase().as_str() {
            "javascript" | "js" => Language::JavaScript,
            "jsx" | "javascriptreact" => Language::Jsx,
            "typescript" | "ts" => Language::TypeScript,
            "tsx" | "typescriptreact" => Language::Tsx,
            "json" => Language::Json,
            "css" => Language::Css,
            "html" => Language::Html,
            "python" | "py" => Language::Python,
            _ => return None,
        };
        Some(language)
    }

    pub fn from_path(path: &str) -> Self {
        let ext = path.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase());
        match ext.as_deref() {
            Some("js") => Language::JavaScript,
            Some("mjs") | Some("cjs") => Language::JavaScript,
            Some("jsx") => Language::Jsx,
            Some("ts") | Some("mts") | Some("cts") => Language::TypeScript,
            Some("tsx") => Language::Tsx,
            Some("json") => Language::Json,
            Some("css") => Language::Css,
            Some("html") | Some("htm") => Language::Html,
            Some("py") => Language::Python,
            _ => Language::Other,
        }
    }

    pub fn is_script(self) -> bool {
        matches!(
            self,
            Language::JavaScript | Language::Jsx | Language::TypeScript | Language::Tsx
        )
    }
}

/// Validate one file. An empty result means the file is acceptable.
pub fn validate(path: &str, content: &str, language: Option<&str>) -> Vec<Issue> {
    let language = Language::resolve(path, language);
    match language {
        // Plain .js files routinely carry JSX, so they get the lenient rules.
        Language::JavaScript | Language::Jsx | Language::Tsx => {
            let mut issues = scan::check_balance(content, Rules::JSX);
            issues.extend(imports::check_statements(content));
            issues
        }
        Language::TypeScript => {
            let mut issues = scan::check_balance(content, Rules::SCRIPT);
            issues.extend(imports::check_statements(content));
            issues
        }
        Language::Css => scan::check_balance(content, Rules::CSS),
        Language::Python => scan::check_balance(content, Rules::PYTHON),
        Language::Json => match serde_json::from_str::<serde_json::Value>(content) {
            Ok(_) => Vec::new(),
            Err(e) => vec![Issue::at(e.line(), format!("invalid JSON: {e}"))],
        },
        Language::Html => check_html(content),
        Language::Other => Vec::new(),
    }
}

fn check_html(content: &str) -> Vec<Issue> {
    let lower = content.to_ascii_lowercase();
    ["script", "style"]
        .into_iter()
        .filter_map(|tag| {
            let opened = lower.matches(&format!("<{tag}")).count();
            let closed = lower.matches(&format!("</{tag}>")).count();
            (opened != closed).then(|| {
                Issue::new(format!(
                    "{opened} <{tag}> tag(s) opened but {closed} closed"
                ))
            })
        })
        .collect()
}

/// Validate a whole change set against the project's existing paths.
///
/// Every create/modify entry is run through [`validate`]; set-level rules
/// are applied on top. Issues are ordered by change-set position.
pub fn validate_change_set(changes: &ChangeSet, existing: &HashSet<String>) -> Vec<FileIssue> {
    let mut issues = Vec::new();
    let mut seen: HashSet<&str> = HashSet::new();

    if changes.files.is_empty() {
        issues.push(FileIssue::new("", "change set contains no files"));
    }

    // Paths visible once the change set is applied, for import resolution.
    let mut visible: BTreeSet<String> = existing.iter().cloned().collect();
    for file in &changes.files {
        match file.action {
            FileAction::Create | FileAction::Modify => {
                visible.insert(file.path.clone());
            }
            FileAction::Delete => {
                visible.remove(&file.path);
            }
        }
    }

    for file in &changes.files {
        if let Some(problem) = path_problem(&file.path) {
            issues.push(FileIssue::new(&file.path, problem));
            continue;
        }
        if !seen.insert(file.path.as_str()) {
            issues.push(FileIssue::new(
                &file.path,
                "duplicate path: each file may appear only once per change set",
            ));
            continue;
        }
        if file.action == FileAction::Delete {
            continue;
        }
        let content = match file.content.as_deref() {
            Some(content) if !content.trim().is_empty() => content,
            _ => {
                issues.push(FileIssue::new(
                    &file.path,
                    "content is required for create and modify",
                ));
                continue;
            }
        };

        issues.extend(
            validate(&file.path, content, file.language.as_deref())
                .into_iter()
                .map(|issue| FileIssue::from_issue(&file.path, issue)),
        );

        if Language::resolve(&file.path, file.language.as_deref()).is_script() {
            for (line, specifier) in imports::specifiers(content) {
                if !imports::resolves(&file.path, &specifier, &visible) {
                    issues.push(FileIssue {
                        path: file.path.clone(),
                        line: Some(line),
                        message: format!("cannot resolve import '{specifier}'"),
                    });
                }
            }
        }
    }
    issues
}

fn path_problem(path: &str) -> Option<&'static str> {
    if path.trim().is_empty() {
        return Some("path must not be empty");
    }
    if path.starts_with('/') || path.starts_with('\\') || path.contains(':') {
        return Some("path must be relative to the project root");
    }
    if path.split(['/', '\\']).any(|segment| segment == "..") {
        return Some("path must not traverse outside the project");
    }
    None
}

/// Render issues as the tool-result text shown to the model.
pub fn render_issues(issues: &[FileIssue]) -> String {
    let mut out = String::from("Validation failed. No files were written. Fix these problems and call apply_changes again with the complete change set:\n");
    for issue in issues {
        out.push_str("- ");
        out.push_str(&issue.to_string());
        out.push('\n');
    }
    out
}
