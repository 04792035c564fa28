use tracing_subscriber::{fmt, EnvFilter};

/// Initialize tracing for embedders that do not bring their own subscriber.
/// Honors `RUST_LOG`; defaults to `info`.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).try_init();
}
