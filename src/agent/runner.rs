use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use super::tools::{ToolExecutor, TASK_COMPLETE};
use super::truncate;
use crate::config::{AgentSettings, PricingConfig};
use crate::llm::{ProviderTurn, ToolCallingProvider};
use crate::sandbox::render;
use crate::types::{AgentIteration, SkillResult};

/// Tools that change state. `task_complete` is refused until one has run.
const MUTATING_TOOLS: &[&str] = &[
    "write_file",
    "run_command",
    "run_code",
    "clone_repo",
    "create_branch",
    "create_pr",
    "kubectl_apply",
    "Write",
    "Edit",
    "Bash",
];

const COMPLETE_TOO_EARLY: &str = "[error] You have not called any mutating tools yet \
    (e.g. write_file, run_command, kubectl_apply). Reading state is NOT enough. \
    Make the required changes before calling task_complete.";

const TRUNCATED_TOOL_CALL: &str = "[truncated] Your previous response was cut off. \
    Please call the tool again with the complete input.";

const TRUNCATED_TEXT: &str = "Your response was truncated. Please call the required tools now.";

/// Receives iterations as they happen.
#[async_trait]
pub(crate) trait IterationSink: Send + Sync {
    /// Returns `false` once nobody is listening; the loop stops.
    async fn emit(&self, call_id: &str, iteration: AgentIteration) -> bool;
}

/// Why the loop stopped.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Termination {
    /// `task_complete` was accepted, or the model answered without tools.
    Completed,
    MaxIterations,
    ProviderFailed(String),
    /// The event consumer went away.
    Cancelled,
}

/// Everything a finished loop produced.
#[derive(Debug, Clone)]
pub(crate) struct LoopOutcome {
    pub termination: Termination,
    /// `task_complete` arguments, or `{summary}`.
    pub output: Map<String, Value>,
    pub iterations: Vec<AgentIteration>,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost_usd: f64,
    pub model: String,
}

impl LoopOutcome {
    pub fn succeeded(&self) -> bool {
        matches!(self.termination, Termination::Completed | Termination::MaxIterations)
    }

    /// Shapes the outcome as a `SkillResult`.
    ///
    /// Success keeps the final output plus `iterations_count` and the last
    /// ten iterations; failure keeps `error`, `iterations_completed`, and
    /// the last five.
    pub fn into_result(self, skill_name: &str, context_for_next: Map<String, Value>) -> SkillResult {
        let count = self.iterations.len();
        let mut output = Map::new();
        let success = self.succeeded();
        match &self.termination {
            Termination::Completed | Termination::MaxIterations => {
                output.extend(self.output);
                if self.termination == Termination::MaxIterations {
                    output.insert("max_iterations_reached".to_string(), Value::Bool(true));
                }
                output.insert("iterations_count".to_string(), count.into());
                output.insert("iterations".to_string(), tail(&self.iterations, 10));
            }
            Termination::ProviderFailed(error) => {
                output.insert("error".to_string(), Value::String(error.clone()));
                output.insert("iterations_completed".to_string(), count.into());
                output.insert("iterations".to_string(), tail(&self.iterations, 5));
            }
            Termination::Cancelled => {
                output.insert("error".to_string(), "execution cancelled".into());
                output.insert("iterations_completed".to_string(), count.into());
            }
        }
        SkillResult {
            skill_name: skill_name.to_string(),
            success,
            output,
            reasoning_trace: vec![format!("Agent loop: {count} iterations")],
            model_used: self.model,
            cost_usd: self.cost_usd,
            latency_ms: 0.0,
            context_for_next,
        }
    }
}

fn tail(iterations: &[AgentIteration], n: usize) -> Value {
    let start = iterations.len().saturating_sub(n);
    serde_json::to_value(&iterations[start..]).unwrap_or(Value::Array(Vec::new()))
}

/// Drives one conversation to a terminal state.
pub(crate) struct AgentLoop<'a> {
    max_turns: u32,
    settings: &'a AgentSettings,
    pricing: &'a PricingConfig,
}

impl<'a> AgentLoop<'a> {
    pub fn new(max_turns: u32, settings: &'a AgentSettings, pricing: &'a PricingConfig) -> Self {
        Self {
            max_turns,
            settings,
            pricing,
        }
    }

    /// Runs the loop: seeds the conversation with `prompt`, then alternates
    /// model turns and sequential tool dispatch.
    pub async fn run(
        &self,
        provider: &mut dyn ToolCallingProvider,
        tools: &dyn ToolExecutor,
        prompt: &str,
        sink: &dyn IterationSink,
    ) -> LoopOutcome {
        let definitions = tools.definitions();
        let mut state = LoopState::default();
        provider.add_user_message(prompt);

        let termination = 'turns: {
            for turn in 1..=self.max_turns {
                let reply = match provider.call(&definitions).await {
                    Ok(reply) => reply,
                    Err(e) => {
                        warn!(provider = provider.name(), error = %e, "model call failed");
                        break 'turns Termination::ProviderFailed(e.to_string());
                    }
                };
                state.account(self.pricing, provider.model(), &reply);
                debug!(turn, tool_calls = reply.tool_calls.len(), "model turn");

                if reply.truncated {
                    warn!(turn, tokens_out = reply.tokens_out, "response truncated, continuing");
                    if reply.tool_calls.is_empty() {
                        provider.add_user_message(TRUNCATED_TEXT);
                    } else {
                        let results: Vec<(String, String)> = reply
                            .tool_calls
                            .iter()
                            .map(|call| (call.id.clone(), TRUNCATED_TOOL_CALL.to_string()))
                            .collect();
                        provider.add_tool_results(&results);
                    }
                    continue;
                }

                if !reply.wants_more_tools || reply.tool_calls.is_empty() {
                    state.output.insert("summary".to_string(), Value::String(reply.text));
                    break 'turns Termination::Completed;
                }

                let mut results = Vec::with_capacity(reply.tool_calls.len());
                let mut completed = false;
                for call in &reply.tool_calls {
                    let output = if call.name == TASK_COMPLETE {
                        if state.mutated {
                            completed = true;
                            serde_json::to_string(&call.arguments).unwrap_or_default()
                        } else {
                            COMPLETE_TOO_EARLY.to_string()
                        }
                    } else {
                        if MUTATING_TOOLS.contains(&call.name.as_str()) {
                            state.mutated = true;
                        }
                        render(tools.execute(&call.name, &call.arguments).await)
                    };

                    let iteration = AgentIteration {
                        iteration: turn,
                        tool_name: call.name.clone(),
                        tool_input: call.arguments.clone(),
                        tool_output: truncate(&output, self.settings.iteration_output_limit)
                            .to_string(),
                        timestamp: chrono::Utc::now().to_rfc3339(),
                    };
                    state.iterations.push(iteration.clone());
                    if !sink.emit(&call.id, iteration).await {
                        break 'turns Termination::Cancelled;
                    }
                    results.push((
                        call.id.clone(),
                        truncate(&output, self.settings.conversation_output_limit).to_string(),
                    ));

                    if completed {
                        state.output.clone_from(&call.arguments);
                        break;
                    }
                }
                provider.add_tool_results(&results);
                if completed {
                    break 'turns Termination::Completed;
                }
                if !reply.text.is_empty() {
                    state.last_text = reply.text;
                }
            }
            state.output.insert(
                "summary".to_string(),
                Value::String(std::mem::take(&mut state.last_text)),
            );
            Termination::MaxIterations
        };

        info!(
            event = "agent_loop_finished",
            termination = ?termination,
            iterations = state.iterations.len(),
            tokens_in = state.tokens_in,
            tokens_out = state.tokens_out,
        );
        LoopOutcome {
            termination,
            output: state.output,
            iterations: state.iterations,
            tokens_in: state.tokens_in,
            tokens_out: state.tokens_out,
            cost_usd: state.cost_usd,
            model: provider.model().to_string(),
        }
    }
}

#[derive(Default)]
struct LoopState {
    output: Map<String, Value>,
    iterations: Vec<AgentIteration>,
    mutated: bool,
    last_text: String,
    tokens_in: u64,
    tokens_out: u64,
    cost_usd: f64,
}

impl LoopState {
    fn account(&mut self, pricing: &PricingConfig, model: &str, reply: &ProviderTurn) {
        self.tokens_in += reply.tokens_in;
        self.tokens_out += reply.tokens_out;
        self.cost_usd += pricing.cost(model, reply.tokens_in, reply.tokens_out);
    }
}
