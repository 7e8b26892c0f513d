//! Tracing subscriber setup.
//!
//! Levels: ERROR unrecoverable, WARN recoverable or unexpected, INFO session and
//! file boundaries, DEBUG per-frame decisions, TRACE wire detail.

use tracing_subscriber::EnvFilter;

/// Default filter for `-v` count: none = info, `-v` = debug, `-vv` and up = trace.
pub fn default_level(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}

/// Install the global subscriber. `RUST_LOG` wins over `verbosity`;
/// `SKIFF_LOG_FORMAT=json` switches to JSON lines. Logs go to stderr.
pub fn init(verbosity: u8) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level(verbosity)));
    let json = std::env::var("SKIFF_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Subscriber for tests. Safe to call more than once.
#[cfg(test)]
pub fn init_for_tests() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_levels() {
        assert_eq!(default_level(0), "info");
        assert_eq!(default_level(1), "debug");
        assert_eq!(default_level(5), "trace");
    }
}
