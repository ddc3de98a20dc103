//! The structured result a pipeline run hands back.

use crate::error::PipelineError;
use std::time::Duration;

/// Terminal state of one node for the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeOutcome {
    Completed,
    Failed,
    /// Not executed because an upstream producer failed or the run aborted.
    Skipped,
}

/// Per-phase wall times for one node.
#[derive(Debug, Clone, Copy, Default)]
pub struct NodeTiming {
    /// Blocked on upstream producers.
    pub wait: Duration,
    /// Input verification and context setup.
    pub init: Duration,
    /// The work unit itself.
    pub execute: Duration,
    /// Output checksums and the COMPLETE transition.
    pub handoff: Duration,
    pub total: Duration,
}

#[derive(Debug, Clone)]
pub struct NodeReport {
    pub id: String,
    pub outcome: NodeOutcome,
    pub timing: NodeTiming,
    pub error: Option<PipelineError>,
}

/// Whole-run report, nodes in topological order.
#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub success: bool,
    pub nodes: Vec<NodeReport>,
    pub total: Duration,
}

impl PipelineReport {
    fn ids_with(&self, outcome: NodeOutcome) -> Vec<&str> {
        self.nodes
            .iter()
            .filter(|n| n.outcome == outcome)
            .map(|n| n.id.as_str())
            .collect()
    }

    pub fn completed(&self) -> Vec<&str> {
        self.ids_with(NodeOutcome::Completed)
    }

    pub fn failed(&self) -> Vec<&str> {
        self.ids_with(NodeOutcome::Failed)
    }

    pub fn skipped(&self) -> Vec<&str> {
        self.ids_with(NodeOutcome::Skipped)
    }

    /// The first recorded error in topological order.
    pub fn first_error(&self) -> Option<&PipelineError> {
        self.nodes.iter().find_map(|n| n.error.as_ref())
    }

    /// Every recorded error, topological order.
    pub fn errors(&self) -> Vec<&PipelineError> {
        self.nodes.iter().filter_map(|n| n.error.as_ref()).collect()
    }

    pub fn node(&self, id: &str) -> Option<&NodeReport> {
        self.nodes.iter().find(|n| n.id == id)
    }
}
