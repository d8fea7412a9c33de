//! Process-wide `tracing` subscriber setup.
//!
//! `RUST_LOG` wins when set; otherwise `verbose` picks between `debug` and
//! `info` for toolweave crates.

use tracing_subscriber::EnvFilter;

fn default_filter(verbose: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if verbose {
            "toolweave=debug,info"
        } else {
            "toolweave=info,warn"
        })
    })
}

/// Install the global fmt subscriber. Panics if one is already installed.
pub fn init_logging(verbose: bool) {
    tracing_subscriber::fmt()
        .with_env_filter(default_filter(verbose))
        .with_target(false)
        .init();
}

/// Like [`init_logging`], but returns `false` instead of panicking when a
/// subscriber is already installed (tests, embedding applications).
pub fn try_init_logging(verbose: bool) -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(default_filter(verbose))
        .with_target(false)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_is_rejected_quietly() {
        let _ = try_init_logging(true);
        assert!(!try_init_logging(false));
    }
}
