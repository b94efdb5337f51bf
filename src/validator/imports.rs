//! Import statement checks for JavaScript and TypeScript.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;

use super::Issue;

static FROM_CLAUSE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"\bfrom\s*['"][^'"\n]+['"]"#).expect("valid regex"));
static BARE_IMPORT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"^import\s*['"][^'"\n]+['"]"#).expect("valid regex"));
static TS_REQUIRE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"=\s*require\(\s*['"][^'"\n]+['"]\s*\)"#).expect("valid regex"));

static FROM_SPECIFIER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?m)^(?:import|export)\b[^;]*?\bfrom\s*['"]([^'"\n]+)['"]"#).expect("valid regex")
});
static BARE_SPECIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?m)^import\s*['"]([^'"\n]+)['"]"#).expect("valid regex"));
static CALL_SPECIFIER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\b(?:require|import)\(\s*['"]([^'"\n]+)['"]\s*\)"#).expect("valid regex")
});

const EXTENSIONS: &[&str] = &["js", "jsx", "ts", "tsx", "mjs", "cjs", "json", "css"];

/// Longest multi-line import statement we follow before giving up.
const MAX_STATEMENT_LINES: usize = 40;

/// Flag top-level `import` statements that never name a quoted module.
pub(crate) fn check_statements(content: &str) -> Vec<Issue> {
    let lines: Vec<&str> = content.lines().collect();
    let mut issues = Vec::new();
    let mut idx = 0;

    while idx < lines.len() {
        let line = lines[idx];
        if !is_static_import(line) {
            idx += 1;
            continue;
        }

        let start = idx;
        let mut statement = String::new();
        loop {
            statement.push_str(lines[idx]);
            statement.push('\n');
            let done = FROM_CLAUSE.is_match(&statement)
                || BARE_IMPORT.is_match(&statement)
                || TS_REQUIRE.is_match(&statement)
                || lines[idx].trim_end().ends_with(';')
                || idx + 1 >= lines.len()
                || idx - start + 1 >= MAX_STATEMENT_LINES
                || is_static_import(lines[idx + 1]);
            if done {
                break;
            }
            idx += 1;
        }

        let well_formed = FROM_CLAUSE.is_match(&statement)
            || BARE_IMPORT.is_match(&statement)
            || TS_REQUIRE.is_match(&statement);
        if !well_formed {
            issues.push(Issue::at(
                start + 1,
                "import statement is missing a quoted module specifier",
            ));
        }
        idx += 1;
    }
    issues
}

/// A column-zero `import` keyword that is not `import(` or `import.meta`.
fn is_static_import(line: &str) -> bool {
    let Some(rest) = line.strip_prefix("import") else {
        return false;
    };
    matches!(
        rest.chars().next(),
        Some(c) if c.is_whitespace() || c == '{' || c == '*' || c == '\'' || c == '"'
    )
}

/// Module specifiers with the 1-based line they appear on.
pub(crate) fn specifiers(content: &str) -> Vec<(usize, String)> {
    let mut found: Vec<(usize, String)> = [&*FROM_SPECIFIER, &*BARE_SPECIFIER, &*CALL_SPECIFIER]
        .into_iter()
        .flat_map(|re| re.captures_iter(content))
        .filter_map(|caps| caps.get(1))
        .map(|m| (line_of(content, m.start()), m.as_str().to_string()))
        .collect();
    found.sort();
    found.dedup();
    found
}

fn line_of(content: &str, offset: usize) -> usize {
    content[..offset].matches('\n').count() + 1
}

/// Whether a relative specifier resolves to a visible file. Package and
/// alias specifiers are always accepted.
pub(crate) fn resolves(from: &str, specifier: &str, visible: &BTreeSet<String>) -> bool {
    if !specifier.starts_with("./") && !specifier.starts_with("../") {
        return true;
    }
    let specifier = specifier.split(['?', '#']).next().unwrap_or(specifier);

    let mut segments: Vec<&str> = from.split('/').collect();
    segments.pop();
    for part in specifier.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                if segments.pop().is_none() {
                    return false;
                }
            }
            other => segments.push(other),
        }
    }
    let target = segments.join("/");

    if visible.contains(&target) {
        return true;
    }
    EXTENSIONS.iter().any(|ext| {
        visible.contains(&format!("{target}.{ext}"))
            || visible.contains(&format!("{target}/index.{ext}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn visible(paths: &[&str]) -> BTreeSet<String> {
        paths.iter().map(|p| p.to_string()).collect()
    }

    #[test]
    fn accepts_common_import_forms() {
        let src = "import React from 'react';\nimport {\n  a,\n  b,\n} from \"./lib\";\nimport './styles.css';\nimport * as z from 'z'\n";
        assert!(check_statements(src).is_empty());
    }

    #[test]
    fn flags_import_without_specifier() {
        let src = "import React from;\nconst a = 1;\n";
        let issues = check_statements(src);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].line, Some(1));
    }

    #[test]
    fn collects_specifiers_with_lines() {
        let src = "import a from './a';\nconst b = require('../b');\nexport { c } from './c';\n";
        let found = specifiers(src);
        assert_eq!(
            found,
            vec![
                (1, "./a".to_string()),
                (2, "../b".to_string()),
                (3, "./c".to_string())
            ]
        );
    }

    #[test]
    fn resolves_extensions_and_index() {
        let files = visible(&["src/App.jsx", "src/lib/index.ts", "src/logo.svg"]);
        assert!(resolves("src/main.jsx", "./App", &files));
        assert!(resolves("src/main.jsx", "./lib", &files));
        assert!(resolves("src/pages/Home.jsx", "../logo.svg", &files));
        assert!(resolves("src/main.jsx", "react", &files));
        assert!(!resolves("src/main.jsx", "./Missing", &files));
        assert!(!resolves("main.js", "../../outside", &files));
    }
}
