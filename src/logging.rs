use std::sync::Once;

use env_logger::Env;
use log::LevelFilter;

static LOG_ONCE: Once = Once::new();

fn env_level() -> LevelFilter {
    std::env::var("MULTISENSOR_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .ok()
        .as_deref()
        .and_then(parse_level)
        .unwrap_or(LevelFilter::Info)
}

fn parse_level(input: &str) -> Option<LevelFilter> {
    input.trim().parse::<LevelFilter>().ok()
}

/// Initialize stderr logging based on `MULTISENSOR_LOG`/`RUST_LOG`.
///
/// `verbosity` (from repeated `-v` flags) raises the level above the
/// environment default. Safe to call more than once.
pub fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => env_level(),
        1 => env_level().max(LevelFilter::Debug),
        _ => LevelFilter::Trace,
    };
    LOG_ONCE.call_once(|| {
        let env = Env::default().default_filter_or(level.as_str());
        let result = env_logger::Builder::from_env(env)
            .format_timestamp_millis()
            .format_module_path(true)
            .format_target(false)
            .try_init();
        if let Err(e) = result {
            eprintln!("logger already installed: {e}");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_names_parse_case_insensitively() {
        assert_eq!(parse_level("WARN"), Some(LevelFilter::Warn));
        assert_eq!(parse_level(LevelFilter::Trace.as_str()), Some(LevelFilter::Trace));
        assert_eq!(parse_level(" debug "), Some(LevelFilter::Debug));
        assert_eq!(parse_level("loud"), None);
    }

    #[test]
    fn repeated_initialization_is_harmless() {
        init_logging(1);
        init_logging(2);
        assert!(LOG_ONCE.is_completed());
        log::debug!("logger installed once");
    }
}
