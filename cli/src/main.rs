mod logging;

use std::{path::PathBuf, process::ExitCode, time::Duration};

use clap::Parser;
use tracing::{error, info};
use wiretap_proxy::{
    config::{Options, default_threads},
    intercept::InterceptorRegistry,
    server::ProxyServer,
};
use wiretap_shared::tls::SslMethod;

/// TLS-intercepting man-in-the-middle proxy.
#[derive(Debug, Parser)]
#[command(name = "wiretap", version, about)]
struct Args {
    /// Port to listen on.
    #[arg(long, default_value_t = 3000)]
    port: u16,

    /// Listen on a dual-stack IPv6 socket.
    #[arg(long)]
    ipv6: bool,

    /// Worker threads for the runtime (default: twice the CPU count).
    #[arg(long)]
    threads: Option<usize>,

    /// Listen backlog.
    #[arg(long, default_value_t = 1024)]
    connection_limit: u32,

    /// Concurrently serviced connections; the rest wait FIFO.
    #[arg(long, default_value_t = 512)]
    connection_service_limit: usize,

    /// Read/write/connect deadline in seconds.
    #[arg(long, default_value_t = 120)]
    timeout: u64,

    /// Deadline for tunnelled traffic in seconds.
    #[arg(long, default_value_t = 30)]
    tunnel_timeout: u64,

    /// Largest accepted message body in bytes (must exceed 4096).
    #[arg(long, default_value_t = 50_000_000)]
    body_size_limit: usize,

    /// Tunnel every CONNECT without interception.
    #[arg(long)]
    ssl_passthrough_strict: bool,

    /// Tunnel CONNECTs unless an interceptor marked the flow.
    #[arg(long)]
    ssl_passthrough: bool,

    /// TLS method for the client-facing side (sslv23, tlsv1.2, tlsv1.3).
    #[arg(long, default_value = "sslv23")]
    ssl_client_method: String,

    /// TLS method for the upstream side (sslv23, tlsv1.2, tlsv1.3).
    #[arg(long, default_value = "sslv23")]
    ssl_server_method: String,

    /// Verify upstream certificates.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    ssl_verify: bool,

    /// Let the TLS library pick cipher suites instead of mirroring the
    /// client's offer.
    #[arg(long)]
    ssl_negotiate_ciphers: bool,

    /// Let the TLS library pick ALPN instead of mirroring the client's
    /// offer.
    #[arg(long)]
    ssl_negotiate_alpn: bool,

    /// Present the upstream's certificate chain to the client.
    #[arg(long)]
    ssl_supply_server_chain: bool,

    /// Certificate properties file (default CN/O/C/validity).
    #[arg(long)]
    ssl_certificate_properties: Option<PathBuf>,

    /// Certificate store directory.
    #[arg(long)]
    ssl_certificate_dir: Option<PathBuf>,

    /// Diffie-Hellman parameters file.
    #[arg(long)]
    ssl_dhparam_file: Option<PathBuf>,

    /// Trusted-CA PEM bundle for upstream verification.
    #[arg(long)]
    upstream_trusted_ca_file: Option<PathBuf>,

    /// Persist the leaf serial counter across restarts.
    #[arg(long)]
    strong_serial_numbers: bool,

    /// Tunnel every WebSocket upgrade without interception.
    #[arg(long)]
    ws_passthrough_strict: bool,

    /// Tunnel WebSocket upgrades unless an interceptor marked the flow.
    #[arg(long)]
    ws_passthrough: bool,

    /// Intercept WebSocket messages by default.
    #[arg(long)]
    ws_intercept_default: bool,
}

impl Args {
    fn into_options(self) -> Result<Options, String> {
        let ssl_client_method = SslMethod::parse(&self.ssl_client_method)
            .map_err(|raw| format!("invalid ssl-client-method: {raw}"))?;
        let ssl_server_method = SslMethod::parse(&self.ssl_server_method)
            .map_err(|raw| format!("invalid ssl-server-method: {raw}"))?;

        Ok(Options {
            port: self.port,
            ipv6: self.ipv6,
            threads: self.threads.unwrap_or_else(default_threads),
            connection_limit: self.connection_limit,
            connection_service_limit: self.connection_service_limit,
            timeout: Duration::from_secs(self.timeout),
            tunnel_timeout: Duration::from_secs(self.tunnel_timeout),
            body_size_limit: self.body_size_limit,
            ssl_passthrough_strict: self.ssl_passthrough_strict,
            ssl_passthrough: self.ssl_passthrough,
            ssl_client_method,
            ssl_server_method,
            ssl_verify: self.ssl_verify,
            ssl_negotiate_ciphers: self.ssl_negotiate_ciphers,
            ssl_negotiate_alpn: self.ssl_negotiate_alpn,
            ssl_supply_server_chain: self.ssl_supply_server_chain,
            ssl_certificate_properties: self.ssl_certificate_properties,
            ssl_certificate_dir: self.ssl_certificate_dir,
            ssl_dhparam_file: self.ssl_dhparam_file,
            upstream_trusted_ca_file: self.upstream_trusted_ca_file,
            strong_serial_numbers: self.strong_serial_numbers,
            ws_passthrough_strict: self.ws_passthrough_strict,
            ws_passthrough: self.ws_passthrough,
            ws_intercept_default: self.ws_intercept_default,
        })
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    logging::initialize_logging();

    let options = match args.into_options() {
        Ok(options) => options,
        Err(message) => {
            error!("{message}");
            return ExitCode::from(1);
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(options.threads)
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            error!("could not start runtime: {err}");
            return ExitCode::from(1);
        }
    };

    runtime.block_on(run(options))
}

async fn run(options: Options) -> ExitCode {
    let mut server = match ProxyServer::start(options, InterceptorRegistry::new()).await {
        Ok(server) => server,
        Err(err) => {
            error!("startup failed: {err}");
            return ExitCode::from(1);
        }
    };

    tokio::select! {
        joined = server.join() => {
            match joined {
                Ok(()) => ExitCode::SUCCESS,
                Err(err) => {
                    error!("{err}");
                    ExitCode::from(1)
                }
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            server.stop();
            ExitCode::SUCCESS
        }
    }
}
