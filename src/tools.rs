//! The two tools the agent exposes to the model, and their per-provider
//! schema rendering.
//!
//! Providers disagree on how a tool definition is shaped: Anthropic takes a
//! flat object with `input_schema`, OpenAI nests the definition under
//! `function`. [`ToolCatalog::render`] picks a formatter from a table keyed
//! by [`Provider`]; callers render once and reuse the result every turn.

use std::collections::BTreeSet;

use serde::Deserialize;
use serde_json::{Value, json};

use crate::llm::{Provider, ToolCall};
use crate::model::{ChangeSet, FileChange};

pub const READ_FILES: &str = "read_files";
pub const APPLY_CHANGES: &str = "apply_changes";

/// Provider-neutral description of one tool.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolSpec {
    pub name: &'static str,
    pub description: &'static str,
    /// JSON Schema for the arguments object.
    pub parameters: Value,
}

type Formatter = fn(&ToolSpec) -> Value;

const FORMATTERS: &[(Provider, Formatter)] = &[
    (Provider::Anthropic, anthropic_format),
    (Provider::OpenAi, openai_format),
];

fn anthropic_format(spec: &ToolSpec) -> Value {
    json!({
        "name": spec.name,
        "description": spec.description,
        "input_schema": spec.parameters,
    })
}

fn openai_format(spec: &ToolSpec) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": spec.name,
            "description": spec.description,
            "parameters": spec.parameters,
        },
    })
}

/// A parsed, typed tool call.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolInvocation {
    ReadFiles { paths: Vec<String> },
    ApplyChanges(ChangeSet),
}

#[derive(Deserialize)]
struct ReadFilesArgs {
    paths: Vec<String>,
}

#[derive(Deserialize)]
struct ApplyChangesArgs {
    files: Vec<FileChange>,
    #[serde(default)]
    summary: String,
    #[serde(default)]
    env_vars_needed: BTreeSet<String>,
}

#[derive(Debug, Clone)]
pub struct ToolCatalog {
    tools: Vec<ToolSpec>,
}

impl ToolCatalog {
    /// `read_files` and `apply_changes`.
    pub fn standard() -> Self {
        Self {
            tools: vec![
                ToolSpec {
                    name: READ_FILES,
                    description: "Read the current contents of project files. \
                        Paths that do not exist are reported as not found.",
                    parameters: json!({
                        "type": "object",
                        "properties": {
                            "paths": {
                                "type": "array",
                                "items": {"type": "string"},
                                "description": "Project-relative paths, at most 10 per call.",
                            },
                        },
                        "required": ["paths"],
                    }),
                },
                ToolSpec {
                    name: APPLY_CHANGES,
                    description: "Propose the complete set of file changes for this request. \
                        Every file is validated; if any file fails, nothing is written and \
                        the errors are returned so you can fix them and call again.",
                    parameters: json!({
                        "type": "object",
                        "properties": {
                            "files": {
                                "type": "array",
                                "items": {
                                    "type": "object",
                                    "properties": {
                                        "path": {"type": "string"},
                                        "action": {
                                            "type": "string",
                                            "enum": ["create", "modify", "delete"],
                                        },
                                        "content": {
                                            "type": "string",
                                            "description": "Full file content. Required unless action is delete.",
                                        },
                                        "language": {"type": "string"},
                                    },
                                    "required": ["path", "action"],
                                },
                            },
                            "summary": {
                                "type": "string",
                                "description": "One or two sentences describing the change for the user.",
                            },
                            "env_vars_needed": {
                                "type": "array",
                                "items": {"type": "string"},
                            },
                        },
                        "required": ["files", "summary"],
                    }),
                },
            ],
        }
    }

    pub fn specs(&self) -> &[ToolSpec] {
        &self.tools
    }

    /// Tool definitions in `provider`'s wire shape.
    pub fn render(&self, provider: Provider) -> Vec<Value> {
        let format = FORMATTERS
            .iter()
            .find(|(p, _)| *p == provider)
            .map(|(_, f)| *f)
            .unwrap_or(anthropic_format);
        self.tools.iter().map(format).collect()
    }

    /// Decode a tool call. The error string is returned to the model as the
    /// tool result.
    pub fn parse(&self, call: &ToolCall) -> std::result::Result<ToolInvocation, String> {
        // Some providers hand back arguments as a JSON-encoded string.
        let arguments = match &call.arguments {
            Value::String(raw) => serde_json::from_str(raw)
                .map_err(|e| format!("arguments for {} are not valid JSON: {e}", call.name))?,
            other => other.clone(),
        };

        match call.name.as_str() {
            READ_FILES => {
                let args: ReadFilesArgs = serde_json::from_value(arguments)
                    .map_err(|e| format!("invalid arguments for {READ_FILES}: {e}"))?;
                Ok(ToolInvocation::ReadFiles { paths: args.paths })
            }
            APPLY_CHANGES => {
                let args: ApplyChangesArgs = serde_json::from_value(arguments)
                    .map_err(|e| format!("invalid arguments for {APPLY_CHANGES}: {e}"))?;
                let mut changes = ChangeSet::new(args.files, args.summary);
                changes.env_vars_needed = args.env_vars_needed;
                Ok(ToolInvocation::ApplyChanges(changes))
            }
            other => Err(format!(
                "unknown tool '{other}'; available tools are {READ_FILES} and {APPLY_CHANGES}"
            )),
        }
    }
}

impl Default for ToolCatalog {
    fn default() -> Self {
        Self::standard()
    }
}
