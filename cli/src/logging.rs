use std::sync::Once;

use tracing_error::ErrorLayer;
use tracing_subscriber::{self, Layer, layer::SubscriberExt, util::SubscriberInitExt};

static INIT_TRACING: Once = Once::new();

/// Stderr logging with the usual `RUST_LOG` filter; defaults to info for
/// the wiretap crates so flows are visible without drowning the terminal.
pub fn initialize_logging() {
    INIT_TRACING.call_once(|| {
        let filter = tracing_subscriber::filter::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| {
                tracing_subscriber::filter::EnvFilter::new(
                    "wiretap_proxy=info,wiretap_shared=info,wiretap_cli=info",
                )
            });

        let stderr_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_filter(filter);

        tracing_subscriber::registry()
            .with(stderr_layer)
            .with(ErrorLayer::default())
            .init();
    });
}
