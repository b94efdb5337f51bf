//! Spans for model calls, named after the OpenTelemetry GenAI conventions
//! so trace backends can group them with other LLM traffic.

use tracing::Span;
use tracing::field::Empty;

/// Span around one agent turn's model call. Usage and the number of
/// returned tool calls are filled in once the response arrives.
pub fn start_chat_span(model: &str, provider: &str, turn: u32) -> Span {
    tracing::info_span!(
        "gen_ai.chat",
        "gen_ai.operation.name" = "chat",
        "gen_ai.provider.name" = provider,
        "gen_ai.request.model" = model,
        "shipwright.agent.turn" = turn,
        "shipwright.agent.tool_calls" = Empty,
        "gen_ai.usage.input_tokens" = Empty,
        "gen_ai.usage.output_tokens" = Empty,
    )
}

pub fn record_token_usage(span: &Span, input: u64, output: u64) {
    span.record("gen_ai.usage.input_tokens", input);
    span.record("gen_ai.usage.output_tokens", output);
}

pub fn record_tool_calls(span: &Span, count: usize) {
    span.record("shipwright.agent.tool_calls", count);
}
