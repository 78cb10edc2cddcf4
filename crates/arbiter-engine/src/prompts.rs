//! Prompt construction for the reasoning stages and novel-action
//! decomposition.
//!
//! Each prompt is the rendered context, the outputs of earlier stages, a
//! stage instruction, and the JSON shape the reply must take.

use std::fmt::Write as _;

use arbiter_core::{ActionSpec, DecisionType, ExecutorKind, ReasoningStage, ReasoningStep};

use crate::context::DecisionContext;

const PREAMBLE: &str = "You are the reasoning step of an autonomous decision engine. \
Reply with exactly one JSON object and nothing else.";

fn stage_instruction(stage: ReasoningStage) -> &'static str {
    match stage {
        ReasoningStage::Observe => {
            "Stage 1 of 5: OBSERVE. Summarize the raw facts of the observation(s). \
             Judge how significant they are. `confidence_delta` (-0.1 to 0.2) reflects \
             how clear the facts are."
        }
        ReasoningStage::Categorize => {
            "Stage 2 of 5: CATEGORIZE. Determine the intent behind the event, its domain, \
             and whether action is plausibly required. `confidence_delta` is -0.1 to 0.15."
        }
        ReasoningStage::MatchPattern => {
            "Stage 3 of 5: MATCH PATTERN. Compare with past decisions and the worked \
             examples. Say which apply and where this situation deviates. Deviation is \
             allowed when your reasoning justifies it. `confidence_delta` is -0.1 to 0.2."
        }
        ReasoningStage::Evaluate => {
            "Stage 4 of 5: EVALUATE. Consider ACT, WAIT, INVESTIGATE and ESCALATE as \
             options, each with success likelihood, risk and cost. `confidence_delta` is \
             -0.1 to 0.15."
        }
        ReasoningStage::Decide => "Stage 5 of 5: DECIDE.",
    }
}

fn stage_schema(stage: ReasoningStage) -> &'static str {
    match stage {
        ReasoningStage::Observe => {
            r#"{"summary": string, "significance": "low" | "normal" | "high" | "critical", "confidence_delta": number}"#
        }
        ReasoningStage::Categorize => {
            r#"{"intent": string, "domain": string, "action_required": boolean, "confidence_delta": number}"#
        }
        ReasoningStage::MatchPattern => {
            r#"{"matches": [string], "deviation": string, "confidence_delta": number}"#
        }
        ReasoningStage::Evaluate => {
            r#"{"options": [{"decision_type": "ACT" | "WAIT" | "INVESTIGATE" | "ESCALATE", "success_likelihood": number, "risk": string, "cost": string}], "recommended": string, "confidence_delta": number}"#
        }
        ReasoningStage::Decide => "",
    }
}

fn decide_schema(selected: DecisionType) -> &'static str {
    match selected {
        DecisionType::Act => {
            r#"{"reasoning": string, "action": {"type": string, "description": string, "details": object, "executor": "script" | "task" | "swarm" | "internal" | "http" | "custom", "priority": 0-100}}"#
        }
        DecisionType::Wait => {
            r#"{"reasoning": string, "resume_conditions": [string], "timeout_secs": number}"#
        }
        DecisionType::Investigate => r#"{"reasoning": string, "queries": [string]}"#,
        DecisionType::Escalate => {
            r#"{"reasoning": string, "reason": string, "priority": 0-100}"#
        }
    }
}

/// Prompt for stages 1–4.
pub fn stage_prompt(stage: ReasoningStage, context: &str, prior: &[ReasoningStep]) -> String {
    let mut prompt = format!("{PREAMBLE}\n\n{context}");
    push_prior(&mut prompt, prior);
    let _ = write!(
        prompt,
        "\n## Task\n\n{}\n\nReply shape:\n{}\n",
        stage_instruction(stage),
        stage_schema(stage)
    );
    prompt
}

/// Prompt for the decide stage. The decision type has already been fixed by
/// the confidence thresholds; the oracle supplies the payload.
pub fn decide_prompt(
    context: &str,
    prior: &[ReasoningStep],
    selected: DecisionType,
    confidence: f64,
) -> String {
    let mut prompt = format!("{PREAMBLE}\n\n{context}");
    push_prior(&mut prompt, prior);
    let _ = write!(
        prompt,
        "\n## Task\n\n{} Accumulated confidence is {confidence:.2}, which selects \
         **{selected}**. Provide the {selected} payload and a short justification.",
        stage_instruction(ReasoningStage::Decide)
    );
    if selected == DecisionType::Act {
        prompt.push_str(
            " The action `type` may be any snake_case name, including one no example \
             uses; choose the executor that fits, or \"custom\" for a multi-step action.",
        );
    }
    let _ = write!(prompt, "\n\nReply shape:\n{}\n", decide_schema(selected));
    prompt
}

/// Appended when a reply failed to parse or validate.
pub fn retry_suffix(problem: &str) -> String {
    format!(
        "\n## Correction\n\nYour previous reply could not be used ({problem}). \
         Reply again with one JSON object of the shape above and no other text.\n"
    )
}

/// Prompt asking for a novel action to be broken into primitive steps.
pub fn decompose_prompt(action: &ActionSpec, available: &[ExecutorKind], max_steps: usize) -> String {
    let executors: Vec<&str> = available.iter().map(ExecutorKind::as_str).collect();
    let action_json = serde_json::to_string_pretty(action).unwrap_or_default();
    format!(
        "{PREAMBLE}\n\n## Action\n\n```json\n{action_json}\n```\n\n## Task\n\n\
         Break this action into at most {max_steps} ordered steps. Each step runs on one \
         of these executors: {}. Steps run in order and the sequence stops at the first \
         failure. For `script`, put the shell command in `details.command`; for `http`, \
         put `url`, `method` and optional `body` in `details`.\n\nReply shape:\n\
         {{\"steps\": [{{\"executor\": string, \"description\": string, \"details\": object}}]}}\n",
        executors.join(", ")
    )
}

fn push_prior(prompt: &mut String, prior: &[ReasoningStep]) {
    if prior.is_empty() {
        return;
    }
    prompt.push_str("\n## Earlier stages\n\n");
    for step in prior {
        let _ = writeln!(
            prompt,
            "- {} (confidence now {:.2}): {}",
            step.stage, step.confidence_after, step.output
        );
    }
}

/// Render the context as Markdown sections. Empty slices are left out.
pub fn render_context(ctx: &DecisionContext) -> String {
    let mut out = String::from("## Observations\n\n");
    for obs in &ctx.observations {
        let _ = writeln!(
            out,
            "- [{}] {} ({}, {}) at {}: {}",
            obs.urgency.as_str(),
            obs.observation_type,
            obs.category,
            obs.source,
            obs.timestamp.to_rfc3339(),
            obs.description
        );
        if !obs.metadata.is_empty() {
            let _ = writeln!(out, "  metadata: {}", serde_json::Value::Object(obs.metadata.clone()));
        }
    }

    if let Some(content) = &ctx.file_content {
        let note = if ctx.truncated { " (truncated)" } else { "" };
        let _ = write!(out, "\n## File content{note}\n\n```\n{content}\n```\n");
    }

    if !ctx.related_paths.is_empty() {
        out.push_str("\n## Related files\n\n");
        for path in &ctx.related_paths {
            let _ = writeln!(out, "- {path}");
        }
    }

    if !ctx.similar_observations.is_empty() {
        out.push_str("\n## Similar past observations\n\n");
        for obs in &ctx.similar_observations {
            let _ = writeln!(out, "- {}: {}", obs.timestamp.to_rfc3339(), obs.description);
        }
    }

    if !ctx.past_decisions.is_empty() {
        out.push_str("\n## Past decisions in this category\n\n");
        for d in &ctx.past_decisions {
            let outcome = match d.outcome_success {
                Some(true) => "succeeded",
                Some(false) => "failed",
                None => "no outcome",
            };
            let _ = writeln!(
                out,
                "- {} {} (confidence {:.2}, {outcome}): {}",
                d.decision_type,
                d.action_type.as_deref().unwrap_or("-"),
                d.confidence,
                d.reasoning
            );
        }
    }

    if !ctx.active_tasks.is_empty() || !ctx.active_goals.is_empty() {
        out.push_str("\n## Active tasks and goals\n\n");
        for item in ctx.active_goals.iter().chain(&ctx.active_tasks) {
            let _ = writeln!(out, "- {item}");
        }
    }

    out.push_str("\n## Executor capacity\n\n");
    for (kind, usage) in &ctx.resources.slots {
        let _ = writeln!(out, "- {kind}: {}/{} slots free", usage.capacity.saturating_sub(usage.in_use), usage.capacity);
    }
    let _ = writeln!(
        out,
        "- memory: {} MB, budget: {:.2}",
        ctx.resources.memory_available_mb, ctx.resources.cost_available
    );

    if !ctx.templates.is_empty() {
        out.push_str(
            "\n## Worked examples\n\nThese are examples of past handling, not rules. \
             Follow them only where they fit; a different or new action is fine.\n\n",
        );
        for t in &ctx.templates {
            let action = serde_json::to_string(&t.example_action).unwrap_or_default();
            let _ = writeln!(
                out,
                "- {} (used {} times, success {:.0}%)\n  when: {}\n  reasoning: {}\n  action: {}\n  outcome: {}",
                t.name,
                t.usage_count,
                t.success_rate * 100.0,
                t.trigger,
                t.example_reasoning,
                action,
                t.example_outcome
            );
        }
    }

    if !ctx.omissions.is_empty() {
        out.push_str("\n## Unavailable context\n\n");
        for o in &ctx.omissions {
            let _ = writeln!(out, "- {o}");
        }
    }

    out
}
