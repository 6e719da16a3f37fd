//! # Graph Inspection
//!
//! Read-only, serializable snapshot of the state graph for diagram and
//! inspection tooling. No mutation path is exposed here; tooling renders
//! from the snapshot or walks the live transition list.

use serde::Serialize;

/// One transition row in a [`MachineGraph`].
#[derive(Debug, Clone, Serialize)]
pub struct TransitionInfo {
    pub name: String,
    /// Source state names; `["*"]` for a global transition.
    pub from: Vec<String>,
    pub to: String,
    pub automatic: bool,
}

/// Snapshot of a machine's states and transitions.
#[derive(Debug, Clone, Serialize)]
pub struct MachineGraph {
    /// Name of the designated initial state, if set.
    pub initial: Option<String>,
    /// State names in order of first appearance across the transitions.
    pub states: Vec<String>,
    /// Transitions in registration order.
    pub transitions: Vec<TransitionInfo>,
}

impl MachineGraph {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
