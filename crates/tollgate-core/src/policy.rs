//! Policy Evaluator.
//!
//! Decides whether a batch of tool calls may proceed. Policies are only
//! consulted when the context is untrusted; under a trusted verdict every
//! call passes, allow-list policies included.
//!
//! Per call, the policies naming that tool are tried in order and the first
//! match decides: `allow` passes the call, `block` refuses the whole batch.
//! A call no policy matches is allowed.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};

use tollgate_types::{Policy, PolicyAction, PolicyOperator, ToolCall};

use crate::error::StoreError;
use crate::retry::{RetryConfig, with_retry};
use crate::store::PolicyStore;

/// A blocked batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Refusal {
    /// `"tool invocation blocked: {reason}"`, for logs and audit.
    pub internal_reason: String,
    /// Assistant text shown to the user in place of the tool calls.
    pub user_message: String,
}

impl Refusal {
    /// Build the refusal for `call` blocked by `policy`.
    pub fn new(call: &ToolCall, policy: &Policy) -> Self {
        let reason = policy.reason();
        let arguments = serialized_arguments(call);
        let name = &call.name;
        let user_message = format!(
            "<tollgate-tool-name>{name}</tollgate-tool-name>\n\
             <tollgate-tool-arguments>{arguments}</tollgate-tool-arguments>\n\
             <tollgate-tool-reason>{reason}</tollgate-tool-reason>\n\
             \n\
             I tried to invoke the {name} tool with the following arguments: {arguments}.\n\
             \n\
             However, I was denied by a tool invocation policy:\n\
             \n\
             {reason}"
        );
        Self {
            internal_reason: format!("tool invocation blocked: {reason}"),
            user_message,
        }
    }
}

fn serialized_arguments(call: &ToolCall) -> String {
    match call.parsed_arguments() {
        Value::String(raw) => raw,
        other => other.to_string(),
    }
}

/// Resolve a dotted attribute path against parsed arguments.
///
/// A leading `arguments.` segment is stripped. Numeric segments index
/// arrays.
pub fn resolve_attribute<'a>(arguments: &'a Value, path: &str) -> Option<&'a Value> {
    let path = path.strip_prefix("arguments.").unwrap_or(path);
    if path.is_empty() || path == "arguments" {
        return Some(arguments);
    }
    path.split('.').try_fold(arguments, |value, segment| match value {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Does `policy` match `call`? A missing attribute never matches.
pub fn policy_matches(policy: &Policy, call: &ToolCall) -> bool {
    if policy.tool_name != call.name {
        return false;
    }
    let arguments = call.parsed_arguments();
    let Some(attribute) = resolve_attribute(&arguments, &policy.attribute_path) else {
        return false;
    };
    let actual = stringify(attribute);
    let expected = policy.value.as_str();

    match policy.operator {
        PolicyOperator::Equal => actual == expected,
        PolicyOperator::NotEqual => actual != expected,
        PolicyOperator::Contains => actual.contains(expected),
        PolicyOperator::StartsWith => actual.starts_with(expected),
        PolicyOperator::EndsWith => actual.ends_with(expected),
        PolicyOperator::Regex => match regex::Regex::new(expected) {
            Ok(re) => re.is_match(&actual),
            Err(e) => {
                warn!(tool = %call.name, pattern = expected, error = %e, "invalid policy regex, skipping");
                false
            }
        },
    }
}

/// Evaluate `calls` against an agent's ordered policy list.
///
/// Returns `None` when every call is allowed.
pub fn evaluate(calls: &[ToolCall], policies: &[Policy], context_is_trusted: bool) -> Option<Refusal> {
    if context_is_trusted {
        return None;
    }
    for call in calls {
        let decision = policies.iter().find(|p| policy_matches(p, call));
        match decision {
            Some(policy) if policy.action == PolicyAction::Block => {
                let refusal = Refusal::new(call, policy);
                info!(tool = %call.name, reason = %refusal.internal_reason, "tool call refused");
                return Some(refusal);
            }
            Some(_) => debug!(tool = %call.name, "tool call allowed by policy"),
            None => debug!(tool = %call.name, "no policy matched tool call"),
        }
    }
    None
}

/// Policy Evaluator bound to a policy store.
#[derive(Clone)]
pub struct PolicyEvaluator {
    store: Arc<dyn PolicyStore>,
    retry: RetryConfig,
}

impl PolicyEvaluator {
    /// Create an evaluator reading from `store`.
    pub fn new(store: Arc<dyn PolicyStore>, retry: RetryConfig) -> Self {
        Self { store, retry }
    }

    /// Fetch the agent's policies and evaluate the batch.
    ///
    /// A trusted context short-circuits before the store is read.
    pub async fn evaluate_policies(
        &self,
        calls: &[ToolCall],
        agent_id: &str,
        context_is_trusted: bool,
    ) -> Result<Option<Refusal>, StoreError> {
        if context_is_trusted || calls.is_empty() {
            return Ok(None);
        }
        let policies = with_retry(&self.retry, "policies", || {
            self.store.get_tool_invocation_policies(agent_id)
        })
        .await?;
        Ok(evaluate(calls, &policies, context_is_trusted))
    }
}

impl std::fmt::Debug for PolicyEvaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyEvaluator").finish_non_exhaustive()
    }
}
