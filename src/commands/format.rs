//! Terminal rendering for streamed executions.
//!
//! Pure functions returning strings; printing is the caller's business.

use colored::Colorize;
use serde_json::Value;
use std::fmt::Write;

use crate::agent::truncate;
use crate::types::{AgentIteration, SkillContext, SkillResult};

const PREVIEW_CHARS: usize = 160;

/// Startup banner for `run`.
pub(crate) fn format_banner(ctx: &SkillContext, route: &str) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "\n{}", "━".repeat(50).dimmed());
    let _ = writeln!(out, "  Skill:   {}", ctx.skill_name.cyan().bold());
    let _ = writeln!(out, "  Model:   {}", ctx.model.cyan());
    let _ = writeln!(out, "  Route:   {}", route.cyan());
    let _ = writeln!(out, "  Turns:   {}", ctx.sandbox().max_iterations.to_string().cyan());
    let _ = write!(out, "{}", "━".repeat(50).dimmed());
    out
}

/// One streamed tool call: header line plus a short output preview.
pub(crate) fn format_iteration(iteration: &AgentIteration) -> String {
    let input = Value::Object(iteration.tool_input.clone()).to_string();
    let mut out = format!(
        "{} {} {}",
        format!("[{}]", iteration.iteration).dimmed(),
        iteration.tool_name.yellow().bold(),
        preview(&input).dimmed()
    );
    let output = preview(&iteration.tool_output);
    if !output.is_empty() {
        let styled = if output.starts_with("[error]") {
            output.red()
        } else {
            output.normal()
        };
        let _ = write!(out, "\n    {styled}");
    }
    out
}

/// Closing line once the result arrives.
pub(crate) fn format_outcome(result: &SkillResult) -> String {
    let status = if result.success {
        "✅ succeeded".green().bold()
    } else {
        "❌ failed".red().bold()
    };
    let mut out = format!(
        "\n{status} in {:.1}s, ${:.4}",
        result.latency_ms / 1000.0,
        result.cost_usd
    );
    if let Some(error) = result.error() {
        let _ = write!(out, "\n  {}", error.red());
    }
    out
}

/// First line of `text`, capped for one-line display.
fn preview(text: &str) -> String {
    let line = text.lines().next().unwrap_or_default();
    let short = truncate(line, PREVIEW_CHARS);
    if short.len() < line.len() || text.lines().nth(1).is_some() {
        format!("{short}…")
    } else {
        short.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Removes ANSI escape sequences so assertions hold with or without color.
    fn strip_ansi_codes(s: &str) -> String {
        let mut result = String::new();
        let mut chars = s.chars().peekable();
        while let Some(ch) = chars.next() {
            if ch == '\x1b' && chars.peek() == Some(&'[') {
                chars.next();
                for c in chars.by_ref() {
                    if c.is_ascii_alphabetic() {
                        break;
                    }
                }
            } else {
                result.push(ch);
            }
        }
        result
    }

    fn iteration(output: &str) -> AgentIteration {
        AgentIteration {
            iteration: 3,
            tool_name: "run_command".to_string(),
            tool_input: json!({"command": "ls"}).as_object().cloned().unwrap(),
            tool_output: output.to_string(),
            timestamp: "2025-01-01T00:00:00Z".to_string(),
        }
    }

    #[test]
    fn test_format_iteration() {
        let text = strip_ansi_codes(&format_iteration(&iteration("a.txt\nb.txt")));
        assert_eq!(text, "[3] run_command {\"command\":\"ls\"}\n    a.txt…");

        let quiet = strip_ansi_codes(&format_iteration(&iteration("")));
        assert_eq!(quiet, "[3] run_command {\"command\":\"ls\"}");
    }

    #[test]
    fn test_preview_caps_long_lines() {
        let long = "x".repeat(500);
        let shown = preview(&long);
        assert_eq!(shown.chars().count(), PREVIEW_CHARS + 1);
        assert!(shown.ends_with('…'));
        assert_eq!(preview("short"), "short");
    }

    #[test]
    fn test_format_outcome() {
        let mut result = SkillResult::failure("deploy", "m", "Sandbox x not ready within 30s");
        result.latency_ms = 1500.0;
        let text = strip_ansi_codes(&format_outcome(&result));
        assert!(text.contains("❌ failed in 1.5s, $0.0000"));
        assert!(text.contains("Sandbox x not ready within 30s"));

        result.success = true;
        result.output.clear();
        result.cost_usd = 0.0123;
        let text = strip_ansi_codes(&format_outcome(&result));
        assert_eq!(text, "\n✅ succeeded in 1.5s, $0.0123");
    }

    #[test]
    fn test_format_banner() {
        let ctx: SkillContext =
            serde_json::from_value(json!({"skill_name": "deploy", "model": "m"})).unwrap();
        let text = strip_ansi_codes(&format_banner(&ctx, "local/docker"));
        assert!(text.contains("Skill:   deploy"));
        assert!(text.contains("Route:   local/docker"));
        assert!(text.contains("Turns:   20"));
    }
}
