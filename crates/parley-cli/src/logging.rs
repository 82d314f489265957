//! Tracing subscriber setup.

use parley_core::config::LoggingConfig;
use tracing_subscriber::EnvFilter;

/// Filter from config: `--verbose` wins over `logging.level`, then per-crate directives.
fn build_filter(config: Option<&LoggingConfig>, verbose: bool) -> anyhow::Result<EnvFilter> {
    let level = if verbose {
        "debug".to_string()
    } else {
        config
            .and_then(|c| c.level.clone())
            .unwrap_or_else(|| "info".into())
    };

    let mut filter = EnvFilter::try_new(&level)?;
    for directive in config.map(|c| c.filters.as_slice()).unwrap_or_default() {
        filter = filter.add_directive(directive.parse()?);
    }
    Ok(filter)
}

/// Install the global subscriber. `RUST_LOG` overrides the configured filter.
pub fn init(config: Option<&LoggingConfig>, verbose: bool) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => build_filter(config, verbose)?,
    };
    let json = config.is_some_and(|c| c.format == "json");
    let stdout = config.is_some_and(|c| c.output == "stdout");

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match (json, stdout) {
        (true, true) => builder.json().with_writer(std::io::stdout).try_init(),
        (true, false) => builder.json().with_writer(std::io::stderr).try_init(),
        (false, true) => builder.with_writer(std::io::stdout).try_init(),
        (false, false) => builder.with_writer(std::io::stderr).try_init(),
    }
    .map_err(|e| anyhow::anyhow!("failed to initialise logging: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_from_config() {
        let config = LoggingConfig {
            format: "plain".into(),
            level: Some("warn".into()),
            filters: vec!["parley_session=trace".into()],
            output: "stderr".into(),
        };
        let filter = build_filter(Some(&config), false).unwrap().to_string();
        assert!(filter.contains("warn"));
        assert!(filter.contains("parley_session=trace"));

        let verbose = build_filter(Some(&config), true).unwrap().to_string();
        assert!(verbose.contains("debug"));
    }

    #[test]
    fn test_bad_directive_is_an_error() {
        let config = LoggingConfig {
            filters: vec!["parley_session=loud".into()],
            ..Default::default()
        };
        assert!(build_filter(Some(&config), false).is_err());
    }
}
