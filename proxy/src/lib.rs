#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

pub mod buffer;
pub mod config;
pub mod connection;
pub mod error;
pub mod http1;
pub mod intercept;
pub mod server;
pub mod service;
pub mod stream;
pub mod tls;
pub mod tunnel;
pub mod ws;

use once_cell::sync::OnceCell;
use tracing_subscriber::EnvFilter;

static TEST_INIT_LOGGER: OnceCell<()> = OnceCell::new();

#[allow(clippy::expect_used)]
pub fn init_test_logging() {
    TEST_INIT_LOGGER.get_or_init(|| {
        tracing_subscriber::fmt()
            .without_time()
            .with_line_number(true)
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .init();
    });
}
