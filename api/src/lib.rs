//! TestOps Copilot API Module
//!
//! REST + SSE surface over the stores, the progress bus and the
//! directly-invokable agents.

pub mod handlers;
pub mod models;
pub mod server;

pub use handlers::ApiState;
pub use server::ApiServer;
