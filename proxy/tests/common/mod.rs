use std::net::SocketAddr;

use tempfile::TempDir;
use wiretap_proxy::{
    config::Options, intercept::InterceptorRegistry, server::ProxyServer,
};

/// Proxy on an ephemeral port with an isolated certificate store.
pub async fn start_proxy(
    mutate: impl FnOnce(&mut Options),
    interceptors: InterceptorRegistry,
) -> (ProxyServer, SocketAddr, TempDir) {
    wiretap_proxy::init_test_logging();
    let store_dir = TempDir::new().expect("store dir");

    let mut options = Options {
        port: 0,
        ssl_certificate_dir: Some(store_dir.path().to_path_buf()),
        ssl_verify: false,
        ..Options::default()
    };
    mutate(&mut options);

    let server = ProxyServer::start(options, interceptors)
        .await
        .expect("proxy start");
    let addr = server.local_addr();
    (server, addr, store_dir)
}
