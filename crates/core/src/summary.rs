//! Aggregate counters for a completed run.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::provider::Usage;

/// What one run did, written once when the run terminates.
///
/// Sub-agent runs produce their own summary, which the parent merges in via
/// [`ExecutionSummary::record_sub_agent`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSummary {
    /// Model calls made, including the forced final call.
    pub llm_calls: u32,
    /// Tool executions, counting each sub-invocation of a batch.
    pub tool_calls: u32,
    /// Sub-agent delegations, including nested ones.
    pub sub_agent_calls: u32,
    /// Wall-clock duration of the run.
    pub execution_time: Duration,
    /// Distinct tool names in first-use order.
    #[serde(default)]
    pub used_tools: Vec<String>,
    /// Distinct sub-agent names in first-use order.
    #[serde(default)]
    pub used_sub_agents: Vec<String>,
    /// Token usage summed over all model calls.
    #[serde(default)]
    pub usage: Usage,
}

impl ExecutionSummary {
    pub fn record_llm_call(&mut self, usage: Option<&Usage>) {
        self.llm_calls += 1;
        if let Some(usage) = usage {
            self.usage.add(usage);
        }
    }

    pub fn record_tool(&mut self, name: &str) {
        self.tool_calls += 1;
        push_unique(&mut self.used_tools, name);
    }

    /// Count a delegation and fold the nested run's counters into this one.
    pub fn record_sub_agent(&mut self, name: &str, nested: &ExecutionSummary) {
        self.sub_agent_calls += 1 + nested.sub_agent_calls;
        self.llm_calls += nested.llm_calls;
        self.tool_calls += nested.tool_calls;
        self.usage.add(&nested.usage);
        push_unique(&mut self.used_sub_agents, name);
        for child in &nested.used_sub_agents {
            push_unique(&mut self.used_sub_agents, child);
        }
    }
}

fn push_unique(list: &mut Vec<String>, name: &str) {
    if !list.iter().any(|n| n == name) {
        list.push(name.to_string());
    }
}
