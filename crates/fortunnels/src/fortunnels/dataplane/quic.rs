use std::{collections::HashMap, net::SocketAddr, sync::Arc};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::UdpSocket,
};

use crate::fortunnels::config::normalize_bind_addr;
use crate::fortunnels::dataplane::{
    preface::{encode_preface, Preface},
    transport::{quic::QuicTransport, DialOptions, Transport, TransportSession},
    ECHO_BUFFER_SIZE, QUIC_ECHO_TIMEOUT,
};

/// Largest UDP payload that fits a single QUIC datagram wrapper.
const MAX_DATAGRAM_PAYLOAD: usize = 65507;

/// Per-packet wrapper carried in QUIC datagrams. The payload travels as
/// base64 so the JSON stays wire-compatible with the relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatagramFrame {
    #[serde(default)]
    pub tunnel_id: String,
    #[serde(default)]
    pub flow_id: String,
    #[serde(default)]
    pub protocol: String,
    #[serde(default, with = "base64_bytes")]
    pub data: Vec<u8>,
    #[serde(default)]
    pub dst: String,
    #[serde(default)]
    pub auth: String,
}

mod base64_bytes {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&base64::engine::general_purpose::STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(d)?;
        base64::engine::general_purpose::STANDARD
            .decode(text)
            .map_err(serde::de::Error::custom)
    }
}

/// TCP test over QUIC streams: each stream carries the JSON preface, the
/// destination line, one greeting, then a half-close; the echo is read
/// under a short deadline where end-of-stream is not an error.
pub async fn run_quic_echo(
    server_url: &str,
    tunnel_id: &str,
    auth_token: &str,
    dst: &str,
    parallel: usize,
    opts: &DialOptions,
) -> anyhow::Result<()> {
    let transport = QuicTransport::new(false);
    let sess = transport.dial(server_url, opts).await.context("quic dial")?;
    let result = if parallel <= 1 {
        run_single_quic_stream(&sess, tunnel_id, auth_token, dst, None).await
    } else {
        run_parallel_quic_streams(&sess, tunnel_id, auth_token, dst, parallel).await
    };
    sess.close().await;
    result
}

async fn run_single_quic_stream(
    sess: &Arc<dyn TransportSession>,
    tunnel_id: &str,
    auth_token: &str,
    dst: &str,
    stream_index: Option<usize>,
) -> anyhow::Result<()> {
    let mut st = sess.open_stream().await.context("open stream")?;

    let preface = Preface {
        auth: auth_token.to_string(),
        tunnel_id: tunnel_id.to_string(),
        ..Preface::default()
    };
    st.write_all(&encode_preface(&preface)?)
        .await
        .context("write preface")?;
    st.write_all(format!("{dst}\n").as_bytes())
        .await
        .context("write destination")?;

    let greeting = match stream_index {
        Some(i) => format!("hello stream {i}\n"),
        None => "hello\n".to_string(),
    };
    st.write_all(greeting.as_bytes())
        .await
        .context("write greeting")?;
    st.flush().await.context("flush")?;
    st.shutdown().await.context("half-close")?;

    let mut buf = vec![0u8; ECHO_BUFFER_SIZE];
    match tokio::time::timeout(QUIC_ECHO_TIMEOUT, st.read(&mut buf)).await {
        Ok(Ok(n)) => {
            if n > 0 {
                match stream_index {
                    Some(i) => {
                        println!("quic echo[{i}]: {}", String::from_utf8_lossy(&buf[..n]).trim_end())
                    }
                    None => println!("quic echo: {}", String::from_utf8_lossy(&buf[..n]).trim_end()),
                }
            }
            Ok(())
        }
        // End of stream before any payload is fine; the server half-closed.
        Ok(Err(err)) => Err(err).context("read echo"),
        Err(_) => anyhow::bail!("read echo: deadline exceeded"),
    }
}

async fn run_parallel_quic_streams(
    sess: &Arc<dyn TransportSession>,
    tunnel_id: &str,
    auth_token: &str,
    dst: &str,
    parallel: usize,
) -> anyhow::Result<()> {
    let mut tasks = tokio::task::JoinSet::new();
    for i in 0..parallel {
        let sess = sess.clone();
        let tunnel_id = tunnel_id.to_string();
        let auth_token = auth_token.to_string();
        let dst = dst.to_string();
        tasks.spawn(async move {
            run_single_quic_stream(&sess, &tunnel_id, &auth_token, &dst, Some(i)).await
        });
    }
    while let Some(joined) = tasks.join_next().await {
        joined.context("quic echo task")??;
    }
    Ok(())
}

/// UDP over QUIC datagrams: local packets become JSON-wrapped datagrams
/// keyed by the sender's address; replies are routed back through the flow
/// table. The sender loop's first error ends the forwarder.
pub async fn run_quic_udp(
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

    let transport = QuicTransport::new(true);
    let sess = transport.dial(server_url, opts).await.context("quic dial")?;
    tracing::info!(listen = %udp_listen, dst = %udp_dst, "dataplane: udp forwarding over quic datagrams");

    let flows: Arc<tokio::sync::Mutex<HashMap<String, SocketAddr>>> =
        Arc::new(tokio::sync::Mutex::new(HashMap::new()));

    let receiver = {
        let sess = sess.clone();
        let socket = socket.clone();
        let flows = flows.clone();
        tokio::spawn(async move {
            loop {
                let Ok(datagram) = sess.recv_datagram().await else {
                    return;
                };
                let Ok(frame) = serde_json::from_slice::<DatagramFrame>(&datagram) else {
                    continue;
                };
                if frame.protocol != "udp" || frame.data.is_empty() {
                    continue;
                }
                let dst = { flows.lock().await.get(&frame.flow_id).copied() };
                if let Some(addr) = dst {
                    let _ = socket.send_to(&frame.data, addr).await;
                }
            }
        })
    };

    let result = async {
        let mut buf = vec![0u8; MAX_DATAGRAM_PAYLOAD];
        loop {
            let (n, peer) = socket.recv_from(&mut buf).await?;
            let flow_id = peer.to_string();
            flows.lock().await.insert(flow_id.clone(), peer);

            let frame = DatagramFrame {
                tunnel_id: tunnel_id.to_string(),
                flow_id,
                protocol: "udp".to_string(),
                data: buf[..n].to_vec(),
                dst: udp_dst.to_string(),
                auth: auth_token.to_string(),
            };
            let encoded = serde_json::to_vec(&frame)?;
            sess.send_datagram(encoded.into()).await?;
        }
        #[allow(unreachable_code)]
        Ok::<(), anyhow::Error>(())
    }
    .await;

    receiver.abort();
    sess.close().await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine;

    #[test]
    fn datagram_frame_serializes_payload_as_base64() {
        let frame = DatagramFrame {
            tunnel_id: "tun-1".into(),
            flow_id: "127.0.0.1:4242".into(),
            protocol: "udp".into(),
            data: b"ping".to_vec(),
            dst: "127.0.0.1:53".into(),
            auth: "".into(),
        };
        let text = serde_json::to_string(&frame).unwrap();
        let b64 = base64::engine::general_purpose::STANDARD.encode(b"ping");
        assert!(text.contains(&format!("\"data\":\"{b64}\"")));
        // All keys are present even when empty, matching the relay contract.
        assert!(text.contains("\"auth\":\"\""));

        let back: DatagramFrame = serde_json::from_str(&text).unwrap();
        assert_eq!(back.data, b"ping");
        assert_eq!(back.flow_id, "127.0.0.1:4242");
    }

    #[test]
    fn datagram_frame_tolerates_missing_fields() {
        let back: DatagramFrame =
            serde_json::from_str("{\"protocol\":\"udp\",\"flow_id\":\"f\",\"data\":\"cGluZw==\"}")
                .unwrap();
        assert_eq!(back.data, b"ping");
        assert_eq!(back.tunnel_id, "");
    }
}
