use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry};

/// Settings for the operational log: the crate's own diagnostics about
/// swallowed write failures, latched stores and schema upgrades.
///
/// **Fields**
/// - `filter`: directive used when `RUST_LOG` is unset, e.g. `"logshelf=info"`.
/// - `with_target`: print the emitting module next to each event.
#[derive(Clone, Debug)]
pub struct OperationalLogConfig {
    pub filter: String,
    pub with_target: bool,
}

impl Default for OperationalLogConfig {
    fn default() -> Self {
        Self {
            filter: "warn,logshelf=info".to_string(),
            with_target: true,
        }
    }
}

/// Install a global `tracing` subscriber that writes to stderr.
///
/// **Returns**
/// - `true` if the subscriber was installed.
/// - `false` if another global subscriber was already set, in which case
///   nothing changes.
pub fn init_tracing_with_config(config: OperationalLogConfig) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.filter));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(config.with_target)
        .with_writer(std::io::stderr);

    let subscriber = Registry::default().with(filter).with(fmt_layer);
    tracing::subscriber::set_global_default(subscriber).is_ok()
}

/// Equivalent to [`init_tracing_with_config`] with
/// [`OperationalLogConfig::default`].
pub fn init_tracing() -> bool {
    init_tracing_with_config(OperationalLogConfig::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_install_is_refused() {
        // Silent, since this subscriber stays installed for the whole test binary.
        let _ = init_tracing_with_config(OperationalLogConfig {
            filter: "off".to_string(),
            with_target: false,
        });
        assert!(!init_tracing_with_config(OperationalLogConfig {
            filter: "debug".to_string(),
            with_target: false,
        }));
    }
}
