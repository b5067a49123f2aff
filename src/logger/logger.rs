use anyhow::{Result, anyhow};
use tracing_subscriber::{
    EnvFilter, Registry, fmt, layer::SubscriberExt, reload, util::SubscriberInitExt,
};

const BOOTSTRAP_FILTER: &str = "info";

pub struct LogConfig {
    pub filter: String,
}

/// Process-wide tracing subscriber whose filter can be swapped once the
/// settings file has been read. `RUST_LOG`, when set, overrides both.
pub struct Logger {
    reload_handle: reload::Handle<EnvFilter, Registry>,
    env_override: bool,
}

impl Logger {
    pub fn new_bootstrap() -> Self {
        let (filter, env_override) = match EnvFilter::try_from_default_env() {
            Ok(filter) => (filter, true),
            Err(_) => (EnvFilter::new(BOOTSTRAP_FILTER), false),
        };
        let (filter, reload_handle) = reload::Layer::new(filter);

        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();

        Self {
            reload_handle,
            env_override,
        }
    }

    pub fn reload_from_config(&self, config: &LogConfig) -> Result<()> {
        let filter = parse_filter(&config.filter)?;
        if self.env_override {
            tracing::debug!(filter = %config.filter, "RUST_LOG set, ignoring configured filter");
            return Ok(());
        }
        self.reload_handle.reload(filter).map_err(|e| anyhow!(e))?;
        Ok(())
    }
}

fn parse_filter(directives: &str) -> Result<EnvFilter> {
    if directives.trim().is_empty() {
        return Err(anyhow!("empty log filter"));
    }
    EnvFilter::try_new(directives).map_err(|e| anyhow!("invalid log filter {:?}: {}", directives, e))
}
