use serde_json::json;
use sha2::{Digest, Sha256};

use maestro_provider::{
    ChatRequest, ContentPart, Message, MessageContent, Provider, Role, Usage,
};

use crate::errors::{classify_provider_error, ErrorKind};
use crate::tools::{ToolContext, ToolRegistry};

/// Upper bound on tool calls honored from a single assistant turn.
const MAX_TOOL_CALLS_PER_TURN: usize = 16;

/// Consecutive identical (tool, args) tuples tolerated before the loop is
/// declared stuck. The fourth repetition aborts.
const MAX_IDENTICAL_REPEATS: u32 = 3;

#[derive(Debug, Clone, Copy)]
pub struct LoopBudget {
    pub max_iterations: u32,
    pub deadline: Option<tokio::time::Instant>,
    pub max_tokens: Option<u32>,
}

impl Default for LoopBudget {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            deadline: None,
            max_tokens: None,
        }
    }
}

/// Loop state machine. Terminal states carry the exit class; everything else
/// is bookkeeping for tracing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopPhase {
    Idle,
    AwaitingResponse,
    ExecutingTools,
    Done,
    BudgetExhausted,
    Cancelled,
    Error,
}

impl LoopPhase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            LoopPhase::Done | LoopPhase::BudgetExhausted | LoopPhase::Cancelled | LoopPhase::Error
        )
    }
}

#[derive(Debug, Clone)]
pub struct ToolInvocation {
    pub name: String,
    pub arguments: serde_json::Value,
    pub ok: bool,
    pub output: String,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone)]
pub struct LoopOutcome {
    pub final_text: String,
    pub invocations: Vec<ToolInvocation>,
    pub phase: LoopPhase,
    pub error_kind: Option<ErrorKind>,
    pub iterations: u32,
    pub usage: Usage,
}

impl LoopOutcome {
    /// Terminal response reached within budget.
    pub fn completed(&self) -> bool {
        self.phase == LoopPhase::Done
    }

    fn terminal(phase: LoopPhase, error_kind: Option<ErrorKind>, state: LoopState) -> Self {
        Self {
            final_text: state.final_text,
            invocations: state.invocations,
            phase,
            error_kind,
            iterations: state.iterations,
            usage: state.usage,
        }
    }
}

#[derive(Default)]
struct LoopState {
    final_text: String,
    invocations: Vec<ToolInvocation>,
    iterations: u32,
    usage: Usage,
}

/// Drive one LLM through a bounded tool-calling conversation until it returns
/// a terminal response or the budget runs out. Tool calls from one turn run
/// strictly in declared order; they may touch overlapping files.
#[allow(clippy::too_many_arguments)]
pub async fn run_loop(
    provider: &dyn Provider,
    model: &str,
    system_prompt: &str,
    user_message: &str,
    registry: &ToolRegistry,
    allowed_tools: &[&str],
    ctx: &ToolContext,
    budget: LoopBudget,
) -> LoopOutcome {
    let mut state = LoopState::default();
    let mut phase = LoopPhase::Idle;
    tracing::trace!(?phase, model, "agent loop starting");

    let tool_defs = registry.definitions_for(allowed_tools);
    let mut messages = vec![Message::user(user_message)];

    let mut last_call_hash: Option<[u8; 32]> = None;
    let mut repeat_count: u32 = 0;

    loop {
        if ctx.cancel.is_cancelled() {
            return LoopOutcome::terminal(LoopPhase::Cancelled, Some(ErrorKind::Cancelled), state);
        }
        if let Some(deadline) = budget.deadline {
            if tokio::time::Instant::now() >= deadline {
                tracing::debug!(iterations = state.iterations, "agent loop hit deadline");
                return LoopOutcome::terminal(LoopPhase::BudgetExhausted, None, state);
            }
        }
        if state.iterations >= budget.max_iterations {
            tracing::debug!(iterations = state.iterations, "agent loop out of iterations");
            return LoopOutcome::terminal(LoopPhase::BudgetExhausted, None, state);
        }

        phase = LoopPhase::AwaitingResponse;
        tracing::trace!(?phase, iteration = state.iterations, "submitting to provider");

        let request = ChatRequest {
            model: model.to_string(),
            messages: messages.clone(),
            tools: tool_defs.clone(),
            max_tokens: budget.max_tokens,
            temperature: None,
            system: Some(system_prompt.to_string()),
            json_mode: false,
            timeout: budget
                .deadline
                .map(|d| d.saturating_duration_since(tokio::time::Instant::now())),
        };

        let response = tokio::select! {
            _ = ctx.cancel.cancelled() => {
                return LoopOutcome::terminal(
                    LoopPhase::Cancelled,
                    Some(ErrorKind::Cancelled),
                    state,
                );
            }
            result = provider.chat(&request) => result,
        };

        let response = match response {
            Ok(r) => r,
            Err(err) => {
                let kind = classify_provider_error(&err);
                tracing::debug!(%err, %kind, "provider call failed");
                return LoopOutcome::terminal(LoopPhase::Error, Some(kind), state);
            }
        };

        if let Some(usage) = response.usage {
            state.usage.input_tokens += usage.input_tokens;
            state.usage.output_tokens += usage.output_tokens;
        }
        state.iterations += 1;

        if response.tool_calls.is_empty() {
            state.final_text = response.message.content.as_text().to_string();
            return LoopOutcome::terminal(LoopPhase::Done, None, state);
        }

        phase = LoopPhase::ExecutingTools;
        tracing::trace!(?phase, count = response.tool_calls.len(), "executing tool calls");

        let mut tool_use_parts = Vec::new();
        let mut tool_result_parts = Vec::new();

        for (i, call) in response.tool_calls.iter().enumerate() {
            tool_use_parts.push(ContentPart::ToolUse {
                id: call.id.clone(),
                name: call.name.clone(),
                input: call.arguments.clone(),
            });

            if i >= MAX_TOOL_CALLS_PER_TURN {
                tool_result_parts.push(ContentPart::ToolResult {
                    tool_use_id: call.id.clone(),
                    content: json!({"error": "too many tool calls in one turn"}).to_string(),
                });
                continue;
            }

            // Unknown or disallowed names get a synthetic error result; the
            // conversation continues so the model can correct itself.
            let known = allowed_tools.contains(&call.name.as_str())
                && registry.get(&call.name).is_some();
            if !known {
                let content =
                    json!({"error": format!("tool not available: {}", call.name)}).to_string();
                state.invocations.push(ToolInvocation {
                    name: call.name.clone(),
                    arguments: call.arguments.clone(),
                    ok: false,
                    output: content.clone(),
                    elapsed_ms: 0,
                });
                tool_result_parts.push(ContentPart::ToolResult {
                    tool_use_id: call.id.clone(),
                    content,
                });
                continue;
            }

            let hash = call_hash(&call.name, &call.arguments);
            if last_call_hash == Some(hash) {
                repeat_count += 1;
            } else {
                last_call_hash = Some(hash);
                repeat_count = 1;
            }
            if repeat_count > MAX_IDENTICAL_REPEATS {
                tracing::warn!(tool = %call.name, "identical tool call repeated, aborting");
                return LoopOutcome::terminal(
                    LoopPhase::Error,
                    Some(ErrorKind::LoopStuck),
                    state,
                );
            }

            let start = std::time::Instant::now();
            let outcome = match registry.execute(&call.name, call.arguments.clone(), ctx).await {
                Ok(outcome) => outcome,
                Err(e) => crate::tools::ToolOutcome::failure(format!("tool error: {e}")),
            };
            let elapsed_ms = start.elapsed().as_millis() as u64;

            state.invocations.push(ToolInvocation {
                name: call.name.clone(),
                arguments: call.arguments.clone(),
                ok: outcome.ok,
                output: outcome.content.clone(),
                elapsed_ms,
            });

            // A cancel that landed mid-execution: the tool ran to completion
            // for filesystem consistency, but its result is discarded and no
            // further provider call is issued.
            if ctx.cancel.is_cancelled() {
                return LoopOutcome::terminal(
                    LoopPhase::Cancelled,
                    Some(ErrorKind::Cancelled),
                    state,
                );
            }

            tool_result_parts.push(ContentPart::ToolResult {
                tool_use_id: call.id.clone(),
                content: outcome.content,
            });
        }

        messages.push(Message {
            role: Role::Assistant,
            content: MessageContent::Parts(tool_use_parts),
        });
        messages.push(Message {
            role: Role::User,
            content: MessageContent::Parts(tool_result_parts),
        });
    }
}

fn call_hash(name: &str, args: &serde_json::Value) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.update(args.to_string().as_bytes());
    hasher.finalize().into()
}
