//! Instructions sent to the model.

use crate::model::ProjectFile;

const BASE: &str = "You are the build engine of an application builder. \
You change a web project's source files to satisfy the user's latest request.

Work in this order:
1. Call read_files for any existing file you need to see before changing it.
2. Call apply_changes exactly once with the complete set of files to create, modify or delete. \
Always send full file contents, never diffs or placeholders.

Every file you propose is validated before anything is written. If validation fails you \
receive the errors; fix all of them and call apply_changes again with the whole corrected \
change set. Each path may appear only once per change set. Relative imports must point at \
files that exist after your changes are applied.

List any environment variables the app needs in env_vars_needed instead of hard-coding secrets.";

/// Nudge sent when the model answers without calling a tool.
pub const NUDGE: &str = "You have not proposed any changes yet. If the request requires \
changes, call apply_changes now with the complete change set. If you need to see files \
first, call read_files.";

/// System prompt with the project's current file listing.
pub fn system_prompt(files: &[ProjectFile]) -> String {
    let mut prompt = String::from(BASE);
    prompt.push_str("\n\nCurrent project files:\n");
    if files.is_empty() {
        prompt.push_str("(none yet: this is a new project)\n");
    }
    for file in files {
        prompt.push_str("- ");
        prompt.push_str(&file.path);
        prompt.push_str(&format!(" ({} bytes)\n", file.content.len()));
    }
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lists_files() {
        let prompt = system_prompt(&[ProjectFile {
            path: "src/App.jsx".into(),
            content: "abc".into(),
            language: None,
        }]);
        assert!(prompt.contains("- src/App.jsx (3 bytes)"));
        assert!(system_prompt(&[]).contains("new project"));
    }
}
