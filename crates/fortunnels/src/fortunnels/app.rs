use std::process::ExitCode;

use tokio::sync::watch;

use crate::fortunnels::{
    auth,
    config::{self, Cli, Config},
    control::{api, watch as ctrl_watch},
    dataplane::{quic, strategy::UdpStrategy, tcp, transport::DialOptions},
    logging,
};

pub async fn run(cli: Cli) -> ExitCode {
    let cfg = match config::resolve(cli) {
        Ok(cfg) => cfg,
        Err(err) => return config_failure(&err),
    };
    if let Err(err) = config::validate(&cfg) {
        return config_failure(&err);
    }

    let _logging = match logging::init(&cfg.logging) {
        Ok(rt) => rt,
        Err(err) => {
            eprintln!("error: {err:#}");
            return ExitCode::from(2);
        }
    };

    match run_workflow(&cfg).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(1)
        }
    }
}

fn config_failure(err: &config::ConfigError) -> ExitCode {
    eprintln!("error: {}", err.message);
    if !err.hint.is_empty() {
        eprintln!("  {}", err.hint);
    }
    ExitCode::from(2)
}

async fn run_workflow(cfg: &Config) -> anyhow::Result<()> {
    println!("Creating tunnel for {}://{}", cfg.protocol, cfg.target_addr);
    println!("Connecting to server: {}", cfg.server_url);

    let client = api::ControlClient::new(&cfg.server_url, &cfg.token)?;
    if cfg.token.trim().is_empty() && !cfg.login.trim().is_empty() && !cfg.password.is_empty() {
        client
            .login_local(cfg.login.trim(), &cfg.password)
            .await
            .map_err(|e| anyhow::anyhow!("authentication failed: {e}"))?;
    }

    let tunnel = match client
        .create_tunnel(&cfg.target_addr, &cfg.protocol, &cfg.user_id)
        .await
    {
        Ok(t) => t,
        Err(err) => {
            if api::is_server_unreachable(&err) {
                anyhow::bail!(
                    "unable to connect to server: {}\n  make sure the server is running",
                    cfg.server_url
                );
            }
            anyhow::bail!("failed to create tunnel: {err:#}");
        }
    };
    api::print_tunnel_info(&tunnel);

    let runtime = cfg.runtime_settings();
    let enc = cfg.encryption_settings();
    let auth_token =
        auth::compute_data_plane_auth(&tunnel.id, &cfg.dp_auth_token, &cfg.dp_auth_secret);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received; shutting down");
            let _ = shutdown_tx.send(true);
        }
    });

    match cfg.protocol.as_str() {
        "http" | "https" => serve_http(cfg, &tunnel, runtime, shutdown_rx).await?,
        "tcp" => serve_tcp(cfg, &tunnel, &auth_token, runtime, enc, shutdown_rx).await?,
        "udp" => serve_udp_modes(cfg, &tunnel, &auth_token, runtime, enc).await?,
        other => anyhow::bail!("unsupported protocol: {other}"),
    }

    if cfg.watch_ws {
        println!("Connecting to WebSocket for real-time updates...");
        ctrl_watch::connect_websocket(&cfg.server_url, &tunnel.id, &cfg.runtime_settings()).await;
    }
    Ok(())
}

/// HTTP(S) tunnels: public traffic arrives as inbound streams; serve them in
/// the background and wait for an interrupt.
async fn serve_http(
    cfg: &Config,
    tunnel: &api::TunnelHandle,
    runtime: config::RuntimeSettings,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    api::print_http_hints(&cfg.server_url, tunnel);
    println!("Serving HTTP over data-plane. Press Ctrl+C to stop.");

    let server_url = cfg.server_url.clone();
    let tunnel_id = tunnel.id.clone();
    let incoming_shutdown = shutdown.clone();
    let mut incoming = tokio::spawn(async move {
        tcp::serve_incoming(&server_url, &tunnel_id, runtime, incoming_shutdown).await
    });

    tokio::select! {
        _ = shutdown.changed() => Ok(()),
        res = &mut incoming => res?,
    }
}

async fn serve_tcp(
    cfg: &Config,
    tunnel: &api::TunnelHandle,
    auth_token: &str,
    runtime: config::RuntimeSettings,
    enc: config::EncryptionSettings,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    if !cfg.listen.is_empty() {
        println!(
            "Listening on {}; forwarding over the data plane to {} ...",
            cfg.listen, cfg.dst
        );
        return tcp::serve_listen(
            &cfg.server_url,
            &tunnel.id,
            &cfg.dst,
            &cfg.listen,
            cfg.backoff_initial,
            cfg.backoff_max,
            runtime,
            enc,
            shutdown,
        )
        .await;
    }

    if cfg.data_plane == "quic" {
        println!("Establishing QUIC data-plane for TCP test to {}...", cfg.dst);
        let opts = DialOptions {
            tunnel_id: tunnel.id.clone(),
            settings: runtime,
        };
        quic::run_quic_echo(
            &cfg.server_url,
            &tunnel.id,
            auth_token,
            &cfg.dst,
            cfg.parallel,
            &opts,
        )
        .await?;
        println!("TCP test (QUIC) completed");
        return Ok(());
    }

    if cfg.parallel <= 1 {
        println!("Establishing data-plane for TCP test to {}...", cfg.dst);
    } else {
        println!(
            "Establishing data-plane with {} parallel streams to {}...",
            cfg.parallel, cfg.dst
        );
    }
    tcp::run_echo(
        &cfg.server_url,
        &tunnel.id,
        &cfg.dst,
        cfg.parallel,
        runtime,
        enc,
    )
    .await?;
    println!("TCP test completed");
    Ok(())
}

async fn serve_udp_modes(
    cfg: &Config,
    tunnel: &api::TunnelHandle,
    auth_token: &str,
    runtime: config::RuntimeSettings,
    enc: config::EncryptionSettings,
) -> anyhow::Result<()> {
    let strategy = UdpStrategy::from_tag(&cfg.data_plane);
    println!("{}", strategy.description(&cfg.udp_listen, &cfg.udp_dst));
    println!("UDP tunnel running. Press Ctrl+C to stop.");

    let result = strategy
        .run(cfg, &tunnel.id, auth_token, runtime, enc)
        .await;
    match result {
        Ok(()) => {
            println!("UDP tunnel stopped.");
            Ok(())
        }
        Err(err) => Err(err.context(strategy.err_label())),
    }
}
