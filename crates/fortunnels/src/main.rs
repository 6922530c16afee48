mod fortunnels;

use clap::Parser;

#[tokio::main]
async fn main() -> std::process::ExitCode {
    // The dependency graph can enable more than one rustls crypto provider;
    // pin one process-wide before any TLS configuration is built.
    let _ = rustls::crypto::ring::default_provider().install_default();

    // Build-time override of the default relay, for static builds pointed at
    // a private deployment. Must happen before any parsing or I/O.
    if let Some(url) = option_env!("FORTUNNELS_DEFAULT_SERVER_URL") {
        fortunnels::config::set_default_server_url(url);
    }
    let cli = fortunnels::config::Cli::parse();
    fortunnels::run(cli).await
}
