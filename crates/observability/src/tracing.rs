//! Tracing/logging initialization.
//!
//! JSON lines on stdout, filtered by `RUST_LOG`. Without `RUST_LOG` the job
//! pipeline logs at `info` and sqlx statement logging is kept to warnings.

use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is unset or unparseable.
pub const DEFAULT_DIRECTIVES: &str = "info,sqlx=warn";

/// Initialize tracing for the process, tagging the first event with `service`.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init(service: &str) {
    let installed = tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .json()
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false)
        .with_current_span(true)
        .try_init()
        .is_ok();

    if installed {
        ::tracing::info!(service, "tracing initialized");
    }
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_directives_parse() {
        assert!(EnvFilter::try_new(DEFAULT_DIRECTIVES).is_ok());
    }

    #[test]
    fn repeated_init_is_harmless() {
        init("test");
        init("test");
    }
}
