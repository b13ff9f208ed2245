//! `playreport-ai`
//!
//! **Responsibility:** the report-generation boundary.
//!
//! - Takes [`SessionFacts`] in, returns [`ReportContent`] or a [`GenerateError`].
//! - Knows nothing about the job queue or persistence; callers decide what a
//!   failure means for the job that triggered it.

pub mod facts;
pub mod generator;
pub mod openai;
pub mod result;

pub use facts::SessionFacts;
pub use generator::{ReportGenerator, ScriptedReportGenerator};
pub use openai::{OpenAiConfig, OpenAiReportGenerator};
pub use result::{GenerateError, ReportContent, ReportStats};
