//! The tool-calling iteration agent.
//!
//! One [`IterationAgent::run`] drives a bounded conversation with the model
//! for a single build attempt. Each turn sends the conversation and the tool
//! catalog, executes any tool calls the model makes and feeds the results
//! back. The run ends in `Finalizing` once an `apply_changes` change set
//! validates and is committed as a new version, or in `Aborted` with one of
//! the agent errors.
//!
//! States: `Gathering` → `AwaitingModel` ⇄ `ExecutingTools` → `Finalizing`
//! | `Aborted`.

pub mod prompt;

use std::collections::HashSet;
use std::ops::Range;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, warn};

use crate::error::{Error, Result};
use crate::llm::{Message, ModelClient, ModelRequest, ModelResponse, ToolCall, ToolResult};
use crate::model::{ChangeSet, ConversationMessage, Role, Version};
use crate::progress::ProgressReporter;
use crate::store::VersionWriter;
use crate::telemetry::{genai, metrics};
use crate::tools::{APPLY_CHANGES, READ_FILES, ToolCatalog, ToolInvocation};
use crate::validator::{FileIssue, render_issues, validate_change_set};

/// Marker returned for a requested path that does not exist.
pub const NOT_FOUND: &str = "[not found]";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Gathering,
    AwaitingModel,
    ExecutingTools,
    Finalizing,
    Aborted,
}

impl AgentState {
    /// Progress stage name.
    pub fn as_str(self) -> &'static str {
        match self {
            AgentState::Gathering => "gathering",
            AgentState::AwaitingModel => "awaiting_model",
            AgentState::ExecutingTools => "executing_tools",
            AgentState::Finalizing => "finalizing",
            AgentState::Aborted => "aborted",
        }
    }
}

/// What to do when the turn budget runs out after validation failures.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustionPolicy {
    /// Fail with `ValidationExhausted`.
    #[default]
    FailHard,
    /// Commit the largest subset of proposed files that validated on its
    /// own, if there is one.
    BestEffort,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConfig {
    pub max_turns: u32,
    /// "Are you done" prompts sent when the model answers without tools.
    pub max_nudges: u32,
    pub max_read_files: usize,
    /// Soft limit on one model call. Expiry is a retryable `ModelUnavailable`.
    pub turn_timeout: Duration,
    pub max_tokens: u32,
    pub exhaustion: ExhaustionPolicy,
    /// Slice of overall build progress reserved for the agent loop.
    pub progress_range: Range<u8>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_turns: 6,
            max_nudges: 1,
            max_read_files: 10,
            turn_timeout: Duration::from_secs(90),
            max_tokens: 16_000,
            exhaustion: ExhaustionPolicy::FailHard,
            progress_range: 10..85,
        }
    }
}

/// Input to one agent run.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub project_id: String,
    /// Conversation up to and including the message that triggered the build.
    pub messages: Vec<ConversationMessage>,
    /// Model override for this run.
    pub model: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AgentOutcome {
    pub change_set: ChangeSet,
    pub summary: String,
    pub version: Version,
    pub turns: u32,
    /// True when a best-effort subset was committed after exhaustion.
    pub partial: bool,
}

/// Mutable state of one run.
struct Run<'a> {
    request: &'a AgentRequest,
    state: AgentState,
    conversation: Vec<Message>,
    existing: HashSet<String>,
    turn: u32,
    nudges: u32,
    tool_calls_seen: bool,
    apply_attempted: bool,
    last_errors: Vec<FileIssue>,
    best_partial: Option<ChangeSet>,
    last_text: Option<String>,
}

impl Run<'_> {
    fn enter(&mut self, state: AgentState) {
        debug!(
            project_id = %self.request.project_id,
            turn = self.turn,
            from = self.state.as_str(),
            to = state.as_str(),
            "agent state"
        );
        self.state = state;
    }
}

pub struct IterationAgent {
    model: Arc<dyn ModelClient>,
    catalog: ToolCatalog,
    /// Catalog rendered once for the model's provider.
    tools: Vec<serde_json::Value>,
    writer: Arc<VersionWriter>,
    config: AgentConfig,
}

impl IterationAgent {
    pub fn new(model: Arc<dyn ModelClient>, writer: Arc<VersionWriter>, config: AgentConfig) -> Self {
        let catalog = ToolCatalog::standard();
        let tools = catalog.render(model.provider());
        Self {
            model,
            catalog,
            tools,
            writer,
            config,
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Run the loop to a committed version or an agent error.
    pub async fn run(
        &self,
        request: &AgentRequest,
        reporter: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<AgentOutcome> {
        let mut run = Run {
            request,
            state: AgentState::Gathering,
            conversation: Vec::new(),
            existing: HashSet::new(),
            turn: 0,
            nudges: 0,
            tool_calls_seen: false,
            apply_attempted: false,
            last_errors: Vec::new(),
            best_partial: None,
            last_text: None,
        };

        let result = self.drive(&mut run, reporter, cancel).await;
        if let Err(e) = &result {
            run.enter(AgentState::Aborted);
            warn!(project_id = %request.project_id, turns = run.turn, error = %e, "agent aborted");
        }
        result
    }

    async fn drive(
        &self,
        run: &mut Run<'_>,
        reporter: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<AgentOutcome> {
        let range = &self.config.progress_range;
        let request = run.request;
        let project_id = request.project_id.as_str();
        reporter.progress(AgentState::Gathering.as_str(), range.start, "Reading project files");

        let files = self.writer.files().list_files(project_id).await?;
        run.existing = files.iter().map(|f| f.path.clone()).collect();
        let system = prompt::system_prompt(&files);
        run.conversation = run
            .request
            .messages
            .iter()
            .map(|m| match m.role {
                Role::User => Message::user(&m.content),
                Role::Assistant => Message::assistant(&m.content),
            })
            .collect();
        if !matches!(run.conversation.last(), Some(Message::User { .. })) {
            return Err(Error::Other(format!(
                "conversation for project {project_id} has no pending user message"
            )));
        }

        let model = run
            .request
            .model
            .clone()
            .unwrap_or_else(|| self.model.default_model().to_string());
        // Two progress steps per turn: the model call and the tool execution.
        let steps = self.config.max_turns * 2;

        while run.turn < self.config.max_turns {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            run.turn += 1;
            run.enter(AgentState::AwaitingModel);
            reporter.scaled(
                AgentState::AwaitingModel.as_str(),
                range,
                (run.turn - 1) * 2,
                steps,
                &format!("Turn {}: waiting for the model", run.turn),
            );

            let response = self
                .call_model(&model, &system, &run.conversation, run.turn)
                .await?;
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if response.text.is_some() {
                run.last_text = response.text.clone();
            }
            run.conversation.push(Message::Assistant {
                text: response.text.clone(),
                tool_calls: response.tool_calls.clone(),
            });

            if response.tool_calls.is_empty() {
                metrics::agent_turns().add(1, &[KeyValue::new("outcome", "text")]);
                if run.nudges < self.config.max_nudges {
                    run.nudges += 1;
                    debug!(project_id, turn = run.turn, "no tool call, nudging");
                    run.conversation.push(Message::user(prompt::NUDGE));
                    continue;
                }
                return self.exhausted(run, reporter, cancel, true).await;
            }
            metrics::agent_turns().add(1, &[KeyValue::new("outcome", "tools")]);
            run.tool_calls_seen = true;

            run.enter(AgentState::ExecutingTools);
            reporter.scaled(
                AgentState::ExecutingTools.as_str(),
                range,
                (run.turn - 1) * 2 + 1,
                steps,
                &describe_calls(&response.tool_calls),
            );
            let (results, accepted) = self.execute_tools(run, &response.tool_calls).await?;
            run.conversation.push(Message::ToolResults { results });

            if let Some(changes) = accepted {
                return self.finalize(run, changes, reporter, cancel, false).await;
            }
        }

        self.exhausted(run, reporter, cancel, false).await
    }

    async fn call_model(
        &self,
        model: &str,
        system: &str,
        conversation: &[Message],
        turn: u32,
    ) -> Result<ModelResponse> {
        let provider = self.model.provider();
        let request = ModelRequest {
            model: model.to_string(),
            system: system.to_string(),
            messages: conversation.to_vec(),
            tools: self.tools.clone(),
            max_tokens: self.config.max_tokens,
        };

        let span = genai::start_chat_span(model, provider.as_str(), turn);
        let started = Instant::now();
        let result = tokio::time::timeout(self.config.turn_timeout, self.model.send(&request))
            .instrument(span.clone())
            .await;
        metrics::operation_duration_ms().record(
            started.elapsed().as_secs_f64() * 1000.0,
            &[KeyValue::new("operation", "model.send")],
        );

        match result {
            Err(_) => {
                metrics::agent_turns().add(1, &[KeyValue::new("outcome", "timeout")]);
                Err(Error::ModelUnavailable(format!(
                    "no response within {:?} on turn {turn}",
                    self.config.turn_timeout
                )))
            }
            Ok(Err(e)) => {
                metrics::agent_turns().add(1, &[KeyValue::new("outcome", "error")]);
                Err(e)
            }
            Ok(Ok(response)) => {
                genai::record_token_usage(&span, response.usage.input_tokens, response.usage.output_tokens);
                genai::record_tool_calls(&span, response.tool_calls.len());
                for (direction, tokens) in [
                    ("input", response.usage.input_tokens),
                    ("output", response.usage.output_tokens),
                ] {
                    metrics::llm_tokens().add(
                        tokens,
                        &[
                            KeyValue::new("model", model.to_string()),
                            KeyValue::new("provider", provider.as_str()),
                            KeyValue::new("direction", direction),
                        ],
                    );
                }
                Ok(response)
            }
        }
    }

    /// Run one response's tool calls. Results come back in call order. All
    /// `apply_changes` calls of the response form one change set; it is
    /// returned when it validates.
    async fn execute_tools(
        &self,
        run: &mut Run<'_>,
        calls: &[ToolCall],
    ) -> Result<(Vec<ToolResult>, Option<ChangeSet>)> {
        let request = run.request;
        let project_id = request.project_id.as_str();
        let parsed: Vec<std::result::Result<ToolInvocation, String>> =
            calls.iter().map(|call| self.catalog.parse(call)).collect();

        let reads = parsed.iter().map(|p| async move {
            match p {
                Ok(ToolInvocation::ReadFiles { paths }) => {
                    Some(self.read_files(project_id, paths).await)
                }
                _ => None,
            }
        });
        let mut read_outputs = join_all(reads).await;

        // A malformed apply_changes call rejects the whole response's change set.
        let mut merged = ChangeSet::default();
        let mut apply_calls = 0;
        let mut parse_error: Option<String> = None;
        for (call, p) in calls.iter().zip(&parsed) {
            match p {
                Ok(ToolInvocation::ApplyChanges(changes)) => {
                    apply_calls += 1;
                    merged.extend(changes.clone());
                }
                Err(message) if call.name == APPLY_CHANGES => {
                    apply_calls += 1;
                    parse_error.get_or_insert_with(|| message.clone());
                }
                _ => {}
            }
        }

        let mut verdict: std::result::Result<Option<ChangeSet>, String> = Ok(None);
        if apply_calls > 0 {
            run.apply_attempted = true;
            verdict = match parse_error {
                Some(message) => {
                    run.last_errors = vec![FileIssue {
                        path: String::new(),
                        line: None,
                        message: message.clone(),
                    }];
                    Err(format!(
                        "No files were written. {message}. Call apply_changes again with valid arguments."
                    ))
                }
                None => {
                    let issues = validate_change_set(&merged, &run.existing);
                    if issues.is_empty() {
                        Ok(Some(merged))
                    } else {
                        info!(
                            project_id,
                            turn = run.turn,
                            issues = issues.len(),
                            "change set rejected by validation"
                        );
                        if let Some(subset) = valid_subset(&merged, &issues, &run.existing) {
                            run.best_partial = Some(subset);
                        }
                        let rendered = render_issues(&issues);
                        run.last_errors = issues;
                        Err(rendered)
                    }
                }
            };
        }

        let mut results = Vec::with_capacity(calls.len());
        for (idx, (call, p)) in calls.iter().zip(&parsed).enumerate() {
            let (content, is_error, label) = if call.name == APPLY_CHANGES {
                match &verdict {
                    Ok(Some(changes)) => (
                        format!(
                            "Accepted {} file(s): {}",
                            changes.files.len(),
                            changes.diff_summary()
                        ),
                        false,
                        "ok",
                    ),
                    Ok(None) => (String::new(), true, "invalid"),
                    Err(message) => (message.clone(), true, "rejected"),
                }
            } else {
                match (p, read_outputs[idx].take()) {
                    (Ok(ToolInvocation::ReadFiles { .. }), Some(output)) => (output?, false, "ok"),
                    (Err(message), _) => (message.clone(), true, "invalid"),
                    _ => (format!("{} could not be executed", call.name), true, "invalid"),
                }
            };
            metrics::tool_calls().add(
                1,
                &[
                    KeyValue::new("tool", call.name.clone()),
                    KeyValue::new("result", label),
                ],
            );
            results.push(ToolResult {
                call_id: call.id.clone(),
                content,
                is_error,
            });
        }

        Ok((results, verdict.ok().flatten()))
    }

    /// Resolve paths concurrently, keeping request order. Missing files get
    /// a marker instead of failing the call.
    async fn read_files(&self, project_id: &str, paths: &[String]) -> Result<String> {
        let cap = self.config.max_read_files;
        let store = self.writer.files();
        let lookups = paths
            .iter()
            .take(cap)
            .map(|path| async move { (path, store.read_file(project_id, path).await) });

        let mut out = String::new();
        for (path, file) in join_all(lookups).await {
            out.push_str(&format!("=== {path} ===\n"));
            match file? {
                Some(file) => out.push_str(&file.content),
                None => out.push_str(NOT_FOUND),
            }
            if !out.ends_with('\n') {
                out.push('\n');
            }
        }
        if paths.len() > cap {
            out.push_str(&format!(
                "Only the first {cap} of {} paths were read; request the rest in another call.\n",
                paths.len()
            ));
        }
        Ok(out)
    }

    async fn exhausted(
        &self,
        run: &mut Run<'_>,
        reporter: &ProgressReporter,
        cancel: &CancellationToken,
        stopped_calling_tools: bool,
    ) -> Result<AgentOutcome> {
        if self.config.exhaustion == ExhaustionPolicy::BestEffort {
            if let Some(partial) = run.best_partial.take() {
                warn!(
                    project_id = %run.request.project_id,
                    files = partial.files.len(),
                    "turn budget exhausted, committing best partial change set"
                );
                return self.finalize(run, partial, reporter, cancel, true).await;
            }
        }
        if run.apply_attempted {
            return Err(Error::ValidationExhausted {
                errors: std::mem::take(&mut run.last_errors),
            });
        }
        if stopped_calling_tools || !run.tool_calls_seen {
            return Err(Error::NoChangesProduced);
        }
        Err(Error::MaxTurnsExceeded {
            max_turns: self.config.max_turns,
        })
    }

    async fn finalize(
        &self,
        run: &mut Run<'_>,
        changes: ChangeSet,
        reporter: &ProgressReporter,
        cancel: &CancellationToken,
        partial: bool,
    ) -> Result<AgentOutcome> {
        run.enter(AgentState::Finalizing);
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        reporter.progress(
            AgentState::Finalizing.as_str(),
            self.config.progress_range.end,
            &format!("Saving {} file(s)", changes.files.len()),
        );

        let prompt_summary = run
            .request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| truncate(&m.content, 200))
            .unwrap_or_default();
        let version = self
            .writer
            .commit(&run.request.project_id, &changes, &prompt_summary)
            .await?;

        let summary = if !changes.summary.trim().is_empty() {
            changes.summary.clone()
        } else if let Some(text) = run.last_text.as_deref() {
            text.to_string()
        } else {
            changes.diff_summary()
        };
        info!(
            project_id = %run.request.project_id,
            version = version.version_number,
            turns = run.turn,
            partial,
            "agent finished"
        );
        Ok(AgentOutcome {
            change_set: changes,
            summary,
            version,
            turns: run.turn,
            partial,
        })
    }
}

/// Files whose own path drew no issue, if that subset validates by itself.
fn valid_subset(
    changes: &ChangeSet,
    issues: &[FileIssue],
    existing: &HashSet<String>,
) -> Option<ChangeSet> {
    let flagged: HashSet<&str> = issues.iter().map(|i| i.path.as_str()).collect();
    let files: Vec<_> = changes
        .files
        .iter()
        .filter(|f| !flagged.contains(f.path.as_str()))
        .cloned()
        .collect();
    if files.is_empty() {
        return None;
    }
    let mut subset = ChangeSet::new(files, changes.summary.clone());
    subset.env_vars_needed = changes.env_vars_needed.clone();
    validate_change_set(&subset, existing).is_empty().then_some(subset)
}

fn describe_calls(calls: &[ToolCall]) -> String {
    let reads = calls.iter().filter(|c| c.name == READ_FILES).count();
    let applies = calls.iter().filter(|c| c.name == APPLY_CHANGES).count();
    match (reads, applies) {
        (0, 0) => "Running tools".to_string(),
        (_, 0) => "Reading files".to_string(),
        (0, _) => "Validating changes".to_string(),
        _ => "Reading files and validating changes".to_string(),
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let mut out: String = text.chars().take(max_chars).collect();
        out.push('…');
        out
    }
}
