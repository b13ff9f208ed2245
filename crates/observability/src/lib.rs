//! Process-wide logging setup shared by the API and worker binaries.

pub mod tracing;

pub use crate::tracing::{init, DEFAULT_DIRECTIVES};
