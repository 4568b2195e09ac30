use protokit::LoggingConfig;
use tracing_subscriber::EnvFilter;

/// Filter directive for the given `-v` count; `0` keeps the configured level.
pub fn directive(config: &LoggingConfig, verbose: u8) -> &str {
    match verbose {
        0 => &config.level,
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

/// Installs the global subscriber. `RUST_LOG` takes precedence over config and flags.
pub fn init_logging(config: &LoggingConfig, verbose: u8) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(directive(config, verbose)));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);
    let result = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if let Err(e) = result {
        eprintln!("logging already initialized: {e}");
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn verbosity_overrides_configured_level() {
        let config = LoggingConfig {
            level: "warn".to_owned(),
            json: false,
        };
        assert_eq!(directive(&config, 0), "warn");
        assert_eq!(directive(&config, 1), "info");
        assert_eq!(directive(&config, 2), "debug");
        assert_eq!(directive(&config, 7), "trace");
    }
}
