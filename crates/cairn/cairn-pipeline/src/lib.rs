//! `cairn-pipeline`: multi-stage pipelines over the shared bus.
//!
//! A pipeline is a DAG of named nodes, each declaring the `bus://` blocks
//! it consumes and produces. The orchestrator allocates every block (plus a
//! signal-cell status region and an optional checksum region) inside one
//! segment, runs the nodes in dependency order, coordinates each
//! producer→consumer handoff through the signal table, and verifies block
//! integrity at every handoff boundary. The result is a structured report:
//! per-node state, per-phase timings, and every recorded error.

mod error;
mod node;
mod orchestrator;
mod report;
mod resource;

pub use error::{PipelineError, WorkError};
pub use node::{NodeCtx, PipelineNode, WorkUnit};
pub use orchestrator::{FailurePolicy, Orchestrator};
pub use report::{NodeOutcome, NodeReport, NodeTiming, PipelineReport};
pub use resource::{AllocatedBlock, BUS_SCHEME, ElementType, OffsetMap, ResourceSpec};
