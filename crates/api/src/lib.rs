//! HTTP API: the run trigger and enqueue endpoints over the report job queue.

pub mod app;
pub mod middleware;
