//! `tollgate policy` -- inspect agent policies and dry-run tool calls.
//!
//! `check` runs the same Policy Evaluator the proxy uses, against the
//! agents and policies in the config file, without contacting any model.
//!
//! # Examples
//!
//! ```text
//! tollgate policy list --agent assistant
//! tollgate policy check --agent assistant --tool send_email \
//!     --args '{"to": "bob@external.com"}'
//! ```

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Args;
use comfy_table::{Table, presets};

use tollgate_core::{InMemoryStore, PolicyEvaluator, Refusal, RetryConfig, ToolStore};
use tollgate_types::config::Config;
use tollgate_types::{PolicyAction, ToolCall};

/// Exit code for a blocked call, so scripts can tell it apart from errors.
const EXIT_BLOCKED: u8 = 2;

/// Arguments for `tollgate policy check`.
#[derive(Args)]
pub struct CheckArgs {
    /// Agent whose policies apply.
    #[arg(long)]
    pub agent: String,

    /// Tool name of the call.
    #[arg(long)]
    pub tool: String,

    /// Call arguments as a JSON object.
    #[arg(long, default_value = "{}")]
    pub args: String,

    /// Evaluate as if the context were trusted.
    #[arg(long)]
    pub trusted: bool,
}

/// Outcome of a dry run.
#[derive(Debug)]
enum Verdict {
    Allow,
    Block(Refusal),
}

async fn evaluate_call(config: &Config, args: &CheckArgs) -> anyhow::Result<Verdict> {
    let arguments: serde_json::Value =
        serde_json::from_str(&args.args).context("--args is not valid JSON")?;
    if !arguments.is_object() {
        anyhow::bail!("--args must be a JSON object");
    }

    let store = Arc::new(InMemoryStore::from_config(config));
    if store.find_agent_by_id(&args.agent).await?.is_none() {
        anyhow::bail!("unknown agent '{}'", args.agent);
    }

    let assigned = store.find_assigned_tools(&args.agent).await?;
    if !assigned.iter().any(|t| t.name == args.tool) {
        tracing::debug!(tool = %args.tool, "tool is not assigned to the agent");
    }

    let call = ToolCall::new("cli-check", &args.tool, arguments.to_string());
    let evaluator = PolicyEvaluator::new(store, RetryConfig::none());
    let refusal = evaluator
        .evaluate_policies(std::slice::from_ref(&call), &args.agent, args.trusted)
        .await?;

    Ok(match refusal {
        Some(refusal) => Verdict::Block(refusal),
        None => Verdict::Allow,
    })
}

/// Evaluate one tool call and print the verdict.
///
/// Prints `ALLOW`, or `BLOCK` followed by the refusal the model would see.
pub async fn policy_check(config: &Config, args: CheckArgs) -> anyhow::Result<ExitCode> {
    match evaluate_call(config, &args).await? {
        Verdict::Allow => {
            println!("ALLOW");
            Ok(ExitCode::SUCCESS)
        }
        Verdict::Block(refusal) => {
            println!("BLOCK: {}", refusal.internal_reason);
            println!();
            println!("{}", refusal.user_message);
            Ok(ExitCode::from(EXIT_BLOCKED))
        }
    }
}

fn action_label(action: PolicyAction) -> &'static str {
    match action {
        PolicyAction::Allow => "allow",
        PolicyAction::Block => "block",
    }
}

/// Print an agent's assigned tools and its ordered policies.
pub async fn policy_list(config: &Config, agent_id: &str) -> anyhow::Result<()> {
    let agent = config
        .agents
        .iter()
        .find(|a| a.id == agent_id)
        .with_context(|| format!("unknown agent '{agent_id}'"))?;

    let mut tools = Table::new();
    tools.load_preset(presets::UTF8_FULL_CONDENSED);
    tools.set_header(["TOOL", "TRUSTED", "MCP SERVER"]);
    for tool in &agent.tools {
        let trusted = if tool.trusted { "yes" } else { "no" };
        let server = tool.mcp_server.as_deref().unwrap_or("(client)");
        tools.add_row([tool.name.as_str(), trusted, server]);
    }
    println!("{tools}");
    println!();

    let mut policies = Table::new();
    policies.load_preset(presets::UTF8_FULL_CONDENSED);
    policies.set_header(["#", "TOOL", "ATTRIBUTE", "OPERATOR", "VALUE", "ACTION"]);
    for (i, policy) in agent.policies.iter().enumerate() {
        policies.add_row([
            (i + 1).to_string(),
            policy.tool_name.clone(),
            policy.attribute_path.clone(),
            policy.operator.to_string(),
            policy.value.clone(),
            action_label(policy.action).to_owned(),
        ]);
    }
    println!("{policies}");
    println!();
    println!(
        "Total: {} tool(s), {} policy(ies)",
        agent.tools.len(),
        agent.policies.len()
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        serde_json::from_str(
            r#"{
                "agents": [{
                    "id": "assistant",
                    "tools": [{"name": "send_email"}],
                    "policies": [{
                        "toolName": "send_email",
                        "attributePath": "to",
                        "operator": "endsWith",
                        "value": "@external.com",
                        "action": "block",
                        "blockMessage": "no external mail"
                    }]
                }]
            }"#,
        )
        .unwrap()
    }

    fn args(to: &str, trusted: bool) -> CheckArgs {
        CheckArgs {
            agent: "assistant".into(),
            tool: "send_email".into(),
            args: serde_json::json!({ "to": to }).to_string(),
            trusted,
        }
    }

    #[tokio::test]
    async fn blocks_matching_call() {
        let verdict = evaluate_call(&config(), &args("eve@external.com", false))
            .await
            .unwrap();
        match verdict {
            Verdict::Block(refusal) => {
                assert_eq!(
                    refusal.internal_reason,
                    "tool invocation blocked: no external mail"
                );
            }
            Verdict::Allow => panic!("expected block"),
        }
    }

    #[tokio::test]
    async fn allows_non_matching_call() {
        let verdict = evaluate_call(&config(), &args("bob@internal.com", false))
            .await
            .unwrap();
        assert!(matches!(verdict, Verdict::Allow));
    }

    #[tokio::test]
    async fn trusted_context_skips_policies() {
        let verdict = evaluate_call(&config(), &args("eve@external.com", true))
            .await
            .unwrap();
        assert!(matches!(verdict, Verdict::Allow));
    }

    #[tokio::test]
    async fn unknown_agent_is_an_error() {
        let mut a = args("bob@internal.com", false);
        a.agent = "ghost".into();
        let err = evaluate_call(&config(), &a).await.unwrap_err();
        assert!(err.to_string().contains("unknown agent 'ghost'"));
    }

    #[tokio::test]
    async fn non_object_args_rejected() {
        let mut a = args("x", false);
        a.args = "[1, 2]".into();
        let err = evaluate_call(&config(), &a).await.unwrap_err();
        assert!(err.to_string().contains("JSON object"));
    }

    #[tokio::test]
    async fn list_unknown_agent_fails() {
        assert!(policy_list(&config(), "ghost").await.is_err());
    }
}
