use std::sync::OnceLock;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;
use tracing_subscriber::EnvFilter;

static INIT: OnceLock<()> = OnceLock::new();

/// Filter from the config value, then `RUST_LOG`, then `info`.
fn resolve_env_filter(configured: Option<&str>) -> EnvFilter {
    if let Some(filter) = configured.and_then(|f| EnvFilter::try_new(f).ok()) {
        return filter;
    }
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber once per process.
///
/// Logs go to stderr: stdout belongs to the frame transport.
pub fn init_logging(configured: Option<&str>) {
    INIT.get_or_init(|| {
        let console_layer = tracing_subscriber::fmt::layer()
            .compact()
            .with_target(false)
            .with_writer(std::io::stderr);
        let _ = tracing_subscriber::registry()
            .with(resolve_env_filter(configured))
            .with(console_layer)
            .try_init();
    });
}
