//! Trigger graph construction, locking discipline and pipeline runtime.
//!
//! The flow is: projects and the platform catalog go through the
//! [`GraphBuilder`](graph::GraphBuilder), which asks the
//! [`PipelineAssembler`](assembler::PipelineAssembler) for the action list of
//! every build target; the resulting [`TriggerGraph`](graph::TriggerGraph) is
//! executed by the [`PipelineRuntime`](runtime::PipelineRuntime) under the
//! [`LockManager`](locks::LockManager).

pub mod assembler;
pub mod debounce;
pub mod executor;
pub mod graph;
pub mod locks;
pub mod nightly;
pub mod runtime;
pub mod sinks;
pub mod staleness;
pub mod store;

pub use assembler::PipelineAssembler;
pub use graph::{GraphBuilder, GraphError, TriggerGraph};
pub use locks::LockManager;
pub use runtime::{FiringReport, PipelineRuntime};
pub use debounce::{ChangeDispatcher, ChangeFiring, poll_changes};
pub use executor::DryRunExecutor;
pub use nightly::NightlyRecorder;
pub use sinks::{FanoutSink, RecordingSink, TracingSink};
pub use store::{FileStateStore, MemoryStateStore};
