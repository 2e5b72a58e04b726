//! Remote Execution Module
//!
//! Both ends of the HTTP/JSON protocol that moves a task from a dispatcher onto a
//! worker node and its result back.
//!
//! ## Submodules
//! - **`protocol`**: Endpoint paths and the request/response bodies.
//! - **`client`**: Caller side; submit, poll, classify failures.
//! - **`server`**: Node side; bounded worker slots behind the same handler registry.
//! - **`handlers`**: Axum handlers exposing the server.
//! - **`system`**: Host CPU/memory sampling for `/health`.

pub mod client;
pub mod handlers;
pub mod protocol;
pub mod server;
pub mod system;

#[cfg(test)]
mod tests;
