use std::sync::Arc;

use anyhow::Context;
use tokio::net::UdpSocket;

use crate::fortunnels::config::normalize_bind_addr;
use crate::fortunnels::dataplane::{
    preface::{write_preface, Preface},
    transport::{dtls::DtlsTransport, DialOptions, Transport, TransportSession},
    udp::run_udp_forwarder,
};

/// UDP over DTLS: after the handshake the first message is the preface;
/// from then on the DTLS connection is a reliable byte stream carrying the
/// same length-prefixed frames as the WebSocket path.
pub async fn run_dtls_udp(
    server_url: &str,
    tunnel_id: &str,
    auth_token: &str,
    udp_dst: &str,
    udp_listen: &str,
    opts: &DialOptions,
) -> anyhow::Result<()> {
    let bind_addr = normalize_bind_addr(udp_listen);
    let socket = Arc::new(
        UdpSocket::bind(&bind_addr)
            .await
            .with_context(|| format!("listen udp {udp_listen}"))?,
    );

    let transport = DtlsTransport::new();
    let sess = transport.dial(server_url, opts).await.context("dtls dial")?;
    tracing::info!(listen = %udp_listen, dst = %udp_dst, "dataplane: udp forwarding over dtls");

    let preface = Preface {
        auth: auth_token.to_string(),
        tunnel_id: tunnel_id.to_string(),
        dst: udp_dst.to_string(),
        ..Preface::default()
    };

    let result = async {
        let mut stream = sess.open_stream().await.context("open stream")?;
        write_preface(&mut stream, &preface)
            .await
            .context("write preface")?;
        run_udp_forwarder(stream, socket).await
    }
    .await;

    sess.close().await;
    result
}
