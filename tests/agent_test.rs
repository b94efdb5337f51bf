//! Iteration agent scenarios against a scripted model and in-memory stores.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use shipwright::agent::{AgentConfig, AgentRequest, ExhaustionPolicy, IterationAgent, NOT_FOUND};
use shipwright::error::Error;
use shipwright::llm::{Message, ModelClient, ModelResponse, Provider, ScriptedModel, ToolCall};
use shipwright::model::{ConversationMessage, ProjectFile, Role};
use shipwright::progress::{ProgressBus, ProgressReporter, Subscription};
use shipwright::store::{FileStore, MemoryFileStore, VersionWriter};
use shipwright::tools::{APPLY_CHANGES, READ_FILES};
use tokio_util::sync::CancellationToken;

struct Harness {
    model: Arc<ScriptedModel>,
    files: Arc<MemoryFileStore>,
    agent: IterationAgent,
    bus: ProgressBus,
}

fn harness(model: ScriptedModel, config: AgentConfig) -> Harness {
    let model = Arc::new(model);
    let files = Arc::new(MemoryFileStore::new());
    let writer = Arc::new(VersionWriter::new(files.clone()));
    let agent = IterationAgent::new(model.clone() as Arc<dyn ModelClient>, writer, config);
    Harness {
        model,
        files,
        agent,
        bus: ProgressBus::new(),
    }
}

impl Harness {
    async fn run(&self, prompt: &str) -> Result<shipwright::agent::AgentOutcome, Error> {
        let reporter = ProgressReporter::new(self.bus.clone(), "p1");
        self.agent
            .run(&request(prompt), &reporter, &CancellationToken::new())
            .await
    }
}

fn request(prompt: &str) -> AgentRequest {
    AgentRequest {
        project_id: "p1".to_string(),
        messages: vec![ConversationMessage {
            id: "m1".to_string(),
            role: Role::User,
            content: prompt.to_string(),
        }],
        model: None,
    }
}

fn apply(id: &str, files: Value) -> ToolCall {
    ToolCall {
        id: id.to_string(),
        name: APPLY_CHANGES.to_string(),
        arguments: json!({ "files": files, "summary": "Add the counter app" }),
    }
}

fn read(id: &str, paths: &[&str]) -> ToolCall {
    ToolCall {
        id: id.to_string(),
        name: READ_FILES.to_string(),
        arguments: json!({ "paths": paths }),
    }
}

fn drain(sub: &mut Subscription) -> Vec<shipwright::progress::ProgressEvent> {
    std::iter::from_fn(|| sub.try_recv()).collect()
}

/// Tool results the model saw in the given request.
fn tool_results(message: &Message) -> Vec<(String, bool)> {
    match message {
        Message::ToolResults { results } => results
            .iter()
            .map(|r| (r.content.clone(), r.is_error))
            .collect(),
        _ => Vec::new(),
    }
}

#[tokio::test]
async fn invalid_then_valid_change_set_commits_one_version() {
    let model = ScriptedModel::new(Provider::Anthropic)
        .respond(ModelResponse::tool_calls(vec![apply(
            "t1",
            json!([{ "path": "app.js", "action": "create", "content": "function count() {\n  return 1;\n" }]),
        )]))
        .respond(ModelResponse::tool_calls(vec![apply(
            "t2",
            json!([{ "path": "app.js", "action": "create", "content": "function count() {\n  return 1;\n}\n" }]),
        )]));
    let h = harness(model, AgentConfig::default());
    let mut sub = h.bus.subscribe("p1");

    let outcome = h.run("build a counter").await.unwrap();

    assert_eq!(outcome.version.version_number, 1);
    assert_eq!(outcome.turns, 2);
    assert!(!outcome.partial);
    assert_eq!(outcome.summary, "Add the counter app");
    assert!(outcome.version.snapshot.contains_key("app.js"));
    assert_eq!(h.files.versions("p1").len(), 1);

    let events = drain(&mut sub);
    let executing = events.iter().filter(|e| e.stage == "executing_tools").count();
    assert_eq!(executing, 2);
    let percents: Vec<u8> = events.iter().map(|e| e.percent).collect();
    assert!(percents.windows(2).all(|w| w[0] <= w[1]), "{percents:?}");

    // The rejection went back to the model as an error result.
    let second = &h.model.requests()[1];
    let results = tool_results(second.messages.last().unwrap());
    assert_eq!(results.len(), 1);
    assert!(results[0].1);
    assert!(results[0].0.contains("Validation failed"));
    assert!(results[0].0.contains("app.js"));
}

#[tokio::test]
async fn text_only_model_produces_no_changes() {
    let mut model = ScriptedModel::new(Provider::Anthropic);
    for _ in 0..6 {
        model = model.respond(ModelResponse::text("Sure, here is how you could do it."));
    }
    let config = AgentConfig {
        max_nudges: 5,
        ..AgentConfig::default()
    };
    let h = harness(model, config);

    let err = h.run("build a counter").await.unwrap_err();

    assert!(matches!(err, Error::NoChangesProduced));
    assert!(!err.is_retryable());
    assert_eq!(h.model.calls(), 6);
    assert!(h.files.versions("p1").is_empty());
}

#[tokio::test]
async fn single_nudge_by_default() {
    let h = harness(
        ScriptedModel::new(Provider::Anthropic)
            .respond(ModelResponse::text("What should it look like?"))
            .respond(ModelResponse::text("Still thinking.")),
        AgentConfig::default(),
    );

    let err = h.run("build a counter").await.unwrap_err();

    assert!(matches!(err, Error::NoChangesProduced));
    assert_eq!(h.model.calls(), 2);
    // The nudge follows the first text-only answer.
    let second = &h.model.requests()[1];
    assert!(matches!(second.messages.last(), Some(Message::User { .. })));
}

#[tokio::test]
async fn duplicate_paths_across_apply_calls_are_rejected_before_persisting() {
    let h = harness(
        ScriptedModel::new(Provider::Anthropic).respond(ModelResponse::tool_calls(vec![
            apply("t1", json!([{ "path": "a.js", "action": "create", "content": "export const a = 1;\n" }])),
            apply("t2", json!([{ "path": "a.js", "action": "create", "content": "export const a = 2;\n" }])),
        ])),
        AgentConfig::default(),
    );

    let err = h.run("add a").await.unwrap_err();

    match err {
        Error::ValidationExhausted { errors } => {
            assert!(errors.iter().any(|e| e.path == "a.js" && e.message.contains("duplicate path")));
        }
        other => panic!("expected ValidationExhausted, got {other:?}"),
    }
    assert!(h.files.versions("p1").is_empty());
    assert!(h.files.list_files("p1").await.unwrap().is_empty());
}

#[tokio::test]
async fn missing_paths_come_back_marked_not_found() {
    let model = ScriptedModel::new(Provider::Anthropic)
        .respond(ModelResponse::tool_calls(vec![read("r1", &["index.html", "missing.js"])]))
        .respond(ModelResponse::tool_calls(vec![apply(
            "t1",
            json!([{ "path": "index.html", "action": "modify", "content": "<h1>Counter</h1>\n" }]),
        )]));
    let h = harness(model, AgentConfig::default());
    h.files.seed(
        "p1",
        [ProjectFile {
            path: "index.html".to_string(),
            content: "<h1>Hello</h1>\n".to_string(),
            language: None,
        }],
    );

    let outcome = h.run("rename the heading").await.unwrap();
    assert_eq!(outcome.version.version_number, 1);

    let second = &h.model.requests()[1];
    let results = tool_results(second.messages.last().unwrap());
    let (content, is_error) = &results[0];
    assert!(!is_error);
    assert!(content.contains("=== index.html ===\n<h1>Hello</h1>"));
    assert!(content.contains(&format!("=== missing.js ===\n{NOT_FOUND}")));
}

#[tokio::test]
async fn read_requests_are_capped() {
    let paths: Vec<String> = (0..12).map(|i| format!("f{i}.js")).collect();
    let path_refs: Vec<&str> = paths.iter().map(String::as_str).collect();
    let h = harness(
        ScriptedModel::new(Provider::Anthropic)
            .respond(ModelResponse::tool_calls(vec![read("r1", &path_refs)])),
        AgentConfig::default(),
    );

    let _ = h.run("look around").await;

    let second = &h.model.requests()[1];
    let results = tool_results(second.messages.last().unwrap());
    assert!(results[0].0.contains("Only the first 10 of 12 paths were read"));
    assert!(!results[0].0.contains("=== f10.js ==="));
}

fn half_valid_model() -> ScriptedModel {
    ScriptedModel::new(Provider::Anthropic).respond(ModelResponse::tool_calls(vec![apply(
        "t1",
        json!([
            { "path": "ok.js", "action": "create", "content": "export const ok = true;\n" },
            { "path": "bad.js", "action": "create", "content": "export function bad( {\n" }
        ]),
    )]))
}

#[tokio::test]
async fn exhaustion_fails_hard_by_default() {
    let h = harness(half_valid_model(), AgentConfig::default());

    let err = h.run("add two modules").await.unwrap_err();

    match err {
        Error::ValidationExhausted { errors } => {
            assert!(errors.iter().all(|e| e.path == "bad.js"));
            assert!(!errors.is_empty());
        }
        other => panic!("expected ValidationExhausted, got {other:?}"),
    }
    assert!(h.files.versions("p1").is_empty());
}

#[tokio::test]
async fn best_effort_commits_the_valid_subset() {
    let config = AgentConfig {
        exhaustion: ExhaustionPolicy::BestEffort,
        ..AgentConfig::default()
    };
    let h = harness(half_valid_model(), config);

    let outcome = h.run("add two modules").await.unwrap();

    assert!(outcome.partial);
    let paths: Vec<&str> = outcome.change_set.files.iter().map(|f| f.path.as_str()).collect();
    assert_eq!(paths, vec!["ok.js"]);
    assert!(!outcome.version.snapshot.contains_key("bad.js"));
}

#[tokio::test]
async fn endless_reading_exceeds_the_turn_budget() {
    let config = AgentConfig {
        max_turns: 2,
        ..AgentConfig::default()
    };
    let h = harness(
        ScriptedModel::new(Provider::Anthropic)
            .respond(ModelResponse::tool_calls(vec![read("r1", &["a.js"])]))
            .respond(ModelResponse::tool_calls(vec![read("r2", &["b.js"])])),
        config,
    );

    let err = h.run("explore").await.unwrap_err();

    assert!(matches!(err, Error::MaxTurnsExceeded { max_turns: 2 }));
    assert_eq!(h.model.calls(), 2);
}

#[tokio::test]
async fn cancelled_run_never_calls_the_model() {
    let h = harness(half_valid_model(), AgentConfig::default());
    let token = CancellationToken::new();
    token.cancel();
    let reporter = ProgressReporter::new(h.bus.clone(), "p1").with_cancel(token.clone());

    let err = h.agent.run(&request("anything"), &reporter, &token).await.unwrap_err();

    assert!(matches!(err, Error::Cancelled));
    assert_eq!(h.model.calls(), 0);
    assert!(h.files.versions("p1").is_empty());
}

#[tokio::test(start_paused = true)]
async fn slow_model_turn_is_retryable_unavailability() {
    let config = AgentConfig {
        turn_timeout: Duration::from_secs(1),
        ..AgentConfig::default()
    };
    let h = harness(
        ScriptedModel::new(Provider::Anthropic)
            .stall(Duration::from_secs(5), ModelResponse::text("late")),
        config,
    );

    let err = h.run("hello").await.unwrap_err();

    assert!(matches!(err, Error::ModelUnavailable(_)));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn provider_failure_surfaces_as_model_unavailable() {
    let h = harness(
        ScriptedModel::new(Provider::OpenAi).fail("503 from upstream"),
        AgentConfig::default(),
    );

    let err = h.run("hello").await.unwrap_err();
    assert!(matches!(err, Error::ModelUnavailable(msg) if msg.contains("503")));
}

#[tokio::test]
async fn tools_are_rendered_for_the_client_provider() {
    let h = harness(
        ScriptedModel::new(Provider::OpenAi).respond(ModelResponse::tool_calls(vec![ToolCall {
            id: "call_1".to_string(),
            name: APPLY_CHANGES.to_string(),
            // OpenAI hands arguments back as a JSON string.
            arguments: Value::String(
                json!({
                    "files": [{ "path": "main.py", "action": "create", "content": "print('hi')\n" }],
                    "summary": "Say hi",
                })
                .to_string(),
            ),
        }])),
        AgentConfig::default(),
    );

    let outcome = h.run("say hi").await.unwrap();
    assert_eq!(outcome.summary, "Say hi");

    let first = &h.model.requests()[0];
    assert_eq!(first.tools.len(), 2);
    assert_eq!(first.tools[0]["type"], "function");
    assert_eq!(first.tools[0]["function"]["name"], READ_FILES);
    assert_eq!(first.model, "scripted");
}

#[tokio::test]
async fn conversation_must_end_with_a_user_message() {
    let h = harness(ScriptedModel::new(Provider::Anthropic), AgentConfig::default());
    let mut req = request("hi");
    req.messages.push(ConversationMessage {
        id: "m2".to_string(),
        role: Role::Assistant,
        content: "done".to_string(),
    });
    let reporter = ProgressReporter::new(h.bus.clone(), "p1");

    let err = h.agent.run(&req, &reporter, &CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, Error::Other(_)));
    assert_eq!(h.model.calls(), 0);
}
