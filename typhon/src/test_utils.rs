use std::sync::Once;

static INIT: Once = Once::new();

/// Installs a tracing subscriber honoring `RUST_LOG`, once per test
/// binary.
pub(crate) fn setup_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}
