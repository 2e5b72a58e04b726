//! Distributed Task Dispatch Library
//!
//! Decides, for every submitted task, whether to run it on a remote worker node or
//! locally, and tracks it to a single terminal result. Callers see the same
//! `TaskExecution` either way.
//!
//! ## Architecture Modules
//! - **`node`**: Worker node identity, health probing, the node registry with its
//!   snapshot cache, and the placement policy that scores nodes by load.
//! - **`executor`**: Task types, the handler registry shared by every execution path,
//!   built-in handlers, and the bounded local executor used for fallback.
//! - **`remote`**: The HTTP/JSON wire protocol: the client that submits and polls,
//!   and the server each worker node runs.
//! - **`dispatch`**: The orchestrator: placement, one remote attempt, one local fallback.
//! - **`config`** / **`error`**: Configuration loading and the error taxonomy.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod executor;
pub mod node;
pub mod remote;
