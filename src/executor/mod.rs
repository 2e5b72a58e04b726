//! Task Execution Module
//!
//! Everything needed to run a task on *this* process, shared by the caller-side
//! fallback path and the node-side server.
//!
//! ## Submodules
//! - **`types`**: Task, TaskExecution and the state machine they move through.
//! - **`registry`**: Maps task types (e.g., "echo") to executable Rust closures.
//! - **`builtin`**: Handlers every process registers at startup.
//! - **`local`**: Bounded in-process executor with timeout and cancellation.

pub mod builtin;
pub mod local;
pub mod registry;
pub mod types;
