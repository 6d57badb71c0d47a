use anyhow::Result;
use stagecoach_config::LoggingConfig;
use tracing_subscriber::EnvFilter;

/// Initialize logging from configuration, `override_level` wins when given
pub fn init_logging_from_config(config: &LoggingConfig, override_level: Option<&str>) -> Result<()> {
    let level = override_level
        .map(str::to_string)
        .unwrap_or_else(|| config.level.to_string());
    init_simple_tracing(&level)
}

/// Initialize simple tracing for basic console output
pub fn init_simple_tracing(log_level: &str) -> Result<()> {
    let env_filter = build_filter(log_level);

    // Use try_init to avoid panic if global subscriber already set
    if tracing_subscriber::fmt().with_env_filter(env_filter).try_init().is_err() {
        tracing::debug!("Global tracing subscriber already initialized, skipping");
    }

    Ok(())
}

/// Initialize tracing for a worker process, writing to stderr
pub fn init_worker_tracing(log_level: &str) -> Result<()> {
    let env_filter = build_filter(log_level);

    if tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
        .is_err()
    {
        tracing::debug!("Global tracing subscriber already initialized, skipping");
    }

    Ok(())
}

fn build_filter(log_level: &str) -> EnvFilter {
    EnvFilter::try_new(log_level)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"))
}
