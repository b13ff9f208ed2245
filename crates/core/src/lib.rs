//! `playreport-core` — identifiers and error primitives shared by every crate.
//!
//! This crate is storage- and runtime-agnostic.

pub mod error;
pub mod id;

pub use error::{DomainError, DomainResult};
pub use id::{JobId, SessionId};
