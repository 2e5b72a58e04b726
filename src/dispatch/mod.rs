//! Dispatch Module
//!
//! Ties the node registry, placement, remote client and local executor together
//! behind a single `submit` call. Callers never learn whether a task ran remotely
//! unless they look at the execution's `target` or `attempts`.

pub mod dispatcher;
