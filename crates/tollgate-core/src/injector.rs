//! Tool Injector.
//!
//! Merges tools declared in the request with the agent's assigned tools.
//! The merge is an ordered map keyed by tool name:
//!
//! 1. request tools are inserted in order; a repeated name replaces the
//!    earlier entry in place (last write wins, first position kept)
//! 2. assigned tools are overlaid by name, replacing any request entry
//!    wholesale; assigned tools not already present are appended
//!
//! A client that declares two tools with the same name silently loses the
//! first one. That is intended.

use std::collections::HashMap;

use tracing::debug;

use tollgate_types::ToolDefinition;

/// Name-keyed map that keeps first-insertion order.
#[derive(Debug, Default)]
struct OrderedTools {
    tools: Vec<ToolDefinition>,
    positions: HashMap<String, usize>,
}

impl OrderedTools {
    fn set(&mut self, tool: ToolDefinition) -> bool {
        match self.positions.get(&tool.name) {
            Some(&pos) => {
                self.tools[pos] = tool;
                true
            }
            None => {
                self.positions.insert(tool.name.clone(), self.tools.len());
                self.tools.push(tool);
                false
            }
        }
    }
}

/// Merge request-declared tools with assigned tools.
///
/// Assigned definitions are authoritative: a request tool with the same
/// name is replaced entirely, never merged field by field.
pub fn inject_tools(request_tools: &[ToolDefinition], assigned: &[ToolDefinition]) -> Vec<ToolDefinition> {
    let mut merged = OrderedTools::default();
    for tool in request_tools {
        merged.set(tool.clone());
    }
    for tool in assigned {
        if merged.set(tool.clone()) {
            debug!(tool = %tool.name, "assigned tool overrides request tool");
        }
    }
    merged.tools
}
