//! Bracket and literal scanner shared by the curly-brace languages and Python.

use super::Issue;

/// Lexical rules for one language family.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Rules {
    pub line_comment: Option<&'static str>,
    pub block_comment: Option<(&'static str, &'static str)>,
    pub template_literals: bool,
    pub regex_literals: bool,
    pub triple_quotes: bool,
    /// JSX text may contain bare apostrophes; an unterminated quote at end
    /// of line is treated as text rather than an error.
    pub lenient_quotes: bool,
}

impl Rules {
    pub const SCRIPT: Rules = Rules {
        line_comment: Some("//"),
        block_comment: Some(("/*", "*/")),
        template_literals: true,
        regex_literals: true,
        triple_quotes: false,
        lenient_quotes: false,
    };

    pub const JSX: Rules = Rules {
        lenient_quotes: true,
        ..Rules::SCRIPT
    };

    pub const CSS: Rules = Rules {
        line_comment: None,
        block_comment: Some(("/*", "*/")),
        template_literals: false,
        regex_literals: false,
        triple_quotes: false,
        lenient_quotes: false,
    };

    pub const PYTHON: Rules = Rules {
        line_comment: Some("#"),
        block_comment: None,
        template_literals: false,
        regex_literals: false,
        triple_quotes: true,
        lenient_quotes: false,
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Code,
    Template,
}

/// An open bracket; `$` marks a `${` template substitution.
#[derive(Debug, Clone, Copy)]
struct Open {
    ch: char,
    line: usize,
}

fn closer_for(open: char) -> char {
    match open {
        '(' => ')',
        '[' => ']',
        _ => '}',
    }
}

/// Check that brackets balance and literals terminate.
pub(crate) fn check_balance(content: &str, rules: Rules) -> Vec<Issue> {
    let chars: Vec<char> = content.chars().collect();
    let mut issues = Vec::new();
    let mut stack: Vec<Open> = Vec::new();
    let mut modes = vec![Mode::Code];
    let mut line = 1;
    let mut i = 0;
    // Last non-whitespace code character, for the regex-literal heuristic.
    let mut prev_significant: Option<char> = None;

    let starts_with = |at: usize, pat: &str| {
        let mut k = at;
        for p in pat.chars() {
            if chars.get(k) != Some(&p) {
                return false;
            }
            k += 1;
        }
        true
    };

    while i < chars.len() {
        let c = chars[i];
        let mode = modes.last().copied().unwrap_or(Mode::Code);

        if mode == Mode::Template {
            match c {
                '\\' => i += 1,
                '`' => {
                    modes.pop();
                    prev_significant = Some('`');
                }
                '$' if chars.get(i + 1) == Some(&'{') => {
                    stack.push(Open { ch: '$', line });
                    modes.push(Mode::Code);
                    prev_significant = Some('{');
                    i += 1;
                }
                '\n' => line += 1,
                _ => {}
            }
            i += 1;
            continue;
        }

        if c == '\n' {
            line += 1;
            i += 1;
            continue;
        }
        if c.is_whitespace() {
            i += 1;
            continue;
        }

        if let Some(marker) = rules.line_comment {
            if starts_with(i, marker) {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
                continue;
            }
        }

        if let Some((open, close)) = rules.block_comment {
            if starts_with(i, open) {
                let start_line = line;
                i += open.chars().count();
                let mut closed = false;
                while i < chars.len() {
                    if starts_with(i, close) {
                        i += close.chars().count();
                        closed = true;
                        break;
                    }
                    if chars[i] == '\n' {
                        line += 1;
                    }
                    i += 1;
                }
                if !closed {
                    issues.push(Issue::at(start_line, "unterminated block comment"));
                }
                continue;
            }
        }

        match c {
            '"' | '\'' => {
                if rules.triple_quotes && starts_with(i, &c.to_string().repeat(3)) {
                    let delim = c.to_string().repeat(3);
                    let start_line = line;
                    i += 3;
                    let mut closed = false;
                    while i < chars.len() {
                        if chars[i] == '\\' {
                            i += 2;
                            continue;
                        }
                        if starts_with(i, &delim) {
                            i += 3;
                            closed = true;
                            break;
                        }
                        if chars[i] == '\n' {
                            line += 1;
                        }
                        i += 1;
                    }
                    if !closed {
                        issues.push(Issue::at(start_line, "unterminated triple-quoted string"));
                    }
                    prev_significant = Some(c);
                    continue;
                }

                let start = i;
                i += 1;
                let mut closed = false;
                while i < chars.len() && chars[i] != '\n' {
                    if chars[i] == '\\' {
                        if chars.get(i + 1) == Some(&'\n') {
                            line += 1;
                        }
                        i += 2;
                        continue;
                    }
                    if chars[i] == c {
                        closed = true;
                        break;
                    }
                    i += 1;
                }
                if closed {
                    i += 1;
                    prev_significant = Some(c);
                } else if rules.lenient_quotes {
                    // Treat the quote as text and keep scanning after it.
                    i = start + 1;
                } else {
                    issues.push(Issue::at(line, "unterminated string literal"));
                }
                continue;
            }
            '`' if rules.template_literals => {
                modes.push(Mode::Template);
                i += 1;
                continue;
            }
            '/' if rules.regex_literals && regex_allowed_after(prev_significant) => {
                if let Some(end) = scan_regex(&chars, i) {
                    i = end;
                    prev_significant = Some('/');
                    continue;
                }
            }
            '(' | '[' | '{' => stack.push(Open { ch: c, line }),
            ')' | ']' | '}' => match stack.last().copied() {
                Some(open) if open.ch == '$' && c == '}' => {
                    stack.pop();
                    modes.pop();
                    prev_significant = Some('$');
                    i += 1;
                    continue;
                }
                Some(open) if closer_for(open.ch) == c && open.ch != '$' => {
                    stack.pop();
                }
                Some(open) => {
                    issues.push(Issue::at(
                        line,
                        format!(
                            "unexpected '{c}', expected '{}' to close '{}' from line {}",
                            closer_for(open.ch),
                            if open.ch == '$' { '{' } else { open.ch },
                            open.line
                        ),
                    ));
                    return issues;
                }
                None => {
                    issues.push(Issue::at(line, format!("unexpected closing '{c}'")));
                    return issues;
                }
            },
            _ => {}
        }
        prev_significant = Some(c);
        i += 1;
    }

    if modes.last() == Some(&Mode::Template) {
        issues.push(Issue::at(line, "unterminated template literal"));
    }
    for open in stack.iter().rev() {
        let shown = if open.ch == '$' { '{' } else { open.ch };
        issues.push(Issue::at(open.line, format!("unclosed '{shown}'")));
    }
    issues
}

fn regex_allowed_after(prev: Option<char>) -> bool {
    match prev {
        None => true,
        Some(p) => matches!(
            p,
            '(' | ',' | '=' | ':' | '[' | '!' | '&' | '|' | '?' | '{' | '}' | ';' | '+' | '-'
                | '*' | '%' | '~' | '^'
        ),
    }
}

/// Return the index just past a regex literal starting at `start`, or
/// `None` if the slash does not begin one on this line.
fn scan_regex(chars: &[char], start: usize) -> Option<usize> {
    match chars.get(start + 1) {
        Some('/') | Some('*') | None => return None,
        _ => {}
    }
    let mut i = start + 1;
    let mut in_class = false;
    while i < chars.len() {
        match chars[i] {
            '\n' => return None,
            '\\' => i += 1,
            '[' => in_class = true,
            ']' => in_class = false,
            '/' if !in_class => {
                i += 1;
                while i < chars.len() && chars[i].is_ascii_alphabetic() {
                    i += 1;
                }
                return Some(i);
            }
            _ => {}
        }
        i += 1;
    }
    None
}
