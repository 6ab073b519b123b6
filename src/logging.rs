//! Tracing setup.
//!
//! Log lines go to stderr so command output on stdout stays clean. The
//! filter comes from `VRAG_LOG` (e.g. `VRAG_LOG=vault_rag_core=debug`),
//! falling back to `info`, or `debug` with `--verbose`.

use std::sync::Once;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub const LOG_ENV: &str = "VRAG_LOG";

static INIT: Once = Once::new();

pub fn default_directive(verbose: bool) -> &'static str {
    if verbose {
        "vault_rag=debug,vault_rag_core=debug,info"
    } else {
        "info"
    }
}

/// Install the global subscriber. Later calls are no-ops.
pub fn init(verbose: bool) {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_env(LOG_ENV)
            .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)));

        tracing_subscriber::registry()
            .with(fmt::layer().with_writer(std::io::stderr).with_target(true))
            .with(filter)
            .init();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directives_parse() {
        for verbose in [false, true] {
            assert!(default_directive(verbose).parse::<EnvFilter>().is_ok());
        }
    }

    #[test]
    fn test_init_is_idempotent() {
        init(false);
        init(true);
    }
}
