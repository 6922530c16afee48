use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::UdpSocket,
    sync::{mpsc, RwLock},
};

use crate::fortunnels::config::{normalize_bind_addr, EncryptionSettings, RuntimeSettings};
use crate::fortunnels::dataplane::{
    crypto,
    datagram::{read_udp_packet, write_udp_packet, MAX_UDP_PACKET},
    preface::{write_preface, Preface},
    session::Manager,
    transport::{transport_by_name, TransportSession},
};

/// Forward between a local UDP socket and a UDP-framed reliable stream.
///
/// Two loops share the address of the most recent local sender: packets from
/// the stream go back to that address, packets from any local peer go up the
/// stream. The first error reported by either loop is the forwarder's
/// result; the caller closes both sides.
pub async fn run_udp_forwarder<S>(stream: S, socket: Arc<UdpSocket>) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (rd, wr) = tokio::io::split(stream);
    let last_src: Arc<RwLock<Option<SocketAddr>>> = Arc::new(RwLock::new(None));
    let (err_tx, mut err_rx) = mpsc::channel::<anyhow::Error>(2);

    start_local_to_stream(wr, socket.clone(), last_src.clone(), err_tx.clone());
    start_stream_to_local(rd, socket, last_src, err_tx);

    match err_rx.recv().await {
        Some(err) => Err(err),
        None => anyhow::bail!("udp forwarder stopped"),
    }
}

fn start_local_to_stream<W>(
    mut wr: W,
    socket: Arc<UdpSocket>,
    last_src: Arc<RwLock<Option<SocketAddr>>>,
    err_tx: mpsc::Sender<anyhow::Error>,
) where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        use tokio::io::AsyncWriteExt;
        let mut buf = vec![0u8; MAX_UDP_PACKET];
        loop {
            let (n, src) = match socket.recv_from(&mut buf).await {
                Ok(v) => v,
                Err(err) => {
                    let _ = err_tx.send(err.into()).await;
                    return;
                }
            };
            if n == 0 {
                continue;
            }

            *last_src.write().await = Some(src);

            if let Err(err) = write_udp_packet(&mut wr, &buf[..n]).await {
                let _ = err_tx.send(err.into()).await;
                return;
            }
            if let Err(err) = wr.flush().await {
                let _ = err_tx.send(err.into()).await;
                return;
            }
        }
    });
}

fn start_stream_to_local<R>(
    mut rd: R,
    socket: Arc<UdpSocket>,
    last_src: Arc<RwLock<Option<SocketAddr>>>,
    err_tx: mpsc::Sender<anyhow::Error>,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            let packet = match read_udp_packet(&mut rd).await {
                Ok(p) => p,
                Err(err) => {
                    let _ = err_tx.send(err.into()).await;
                    return;
                }
            };
            let dst = *last_src.read().await;
            let Some(dst) = dst else {
                // Nobody has talked to us yet; drop the packet.
                continue;
            };
            if let Err(err) = socket.send_to(&packet, dst).await {
                let _ = err_tx.send(err.into()).await;
                return;
            }
        }
    });
}

/// `udp_forward` mode over the WebSocket multiplexer: one stream with a
/// `proto:"udp"` preface carries all frames for the local UDP socket.
pub async fn serve_udp(
    server_url: &str,
    tunnel_id: &str,
    dst: &str,
    listen_addr: &str,
    runtime: RuntimeSettings,
    enc: EncryptionSettings,
) -> anyhow::Result<()> {
    let transport = transport_by_name("ws")?;
    let mgr = Manager::new(
        transport,
        server_url,
        tunnel_id,
        Duration::from_secs(1),
        Duration::from_secs(30),
        runtime,
    );

    let result = async {
        let sess = mgr
            .ensure()
            .await
            .map_err(|e| anyhow::anyhow!("ensure session: {e}"))?;
        let mut stream = sess.open_stream().await.context("open stream")?;
        write_preface(&mut stream, &Preface::udp(dst, tunnel_id))
            .await
            .context("write preface")?;
        let wrapped = crypto::wrap_client_stream(stream, tunnel_id, &enc);

        let bind_addr = normalize_bind_addr(listen_addr);
        let socket = UdpSocket::bind(&bind_addr)
            .await
            .with_context(|| format!("listen udp {listen_addr}"))?;
        tracing::info!(listen = %listen_addr, dst = %dst, "dataplane: udp forwarding over ws");

        run_udp_forwarder(wrapped, Arc::new(socket)).await
    }
    .await;

    mgr.close().await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// E3-style round trip: a local emitter's packet is framed onto the
    /// stream; the frame echoed back is delivered to the emitter's address.
    #[tokio::test]
    async fn udp_packets_roundtrip_through_stream() {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let local_addr = socket.local_addr().unwrap();

        let (stream, mut remote) = tokio::io::duplex(64 * 1024);
        let forwarder = tokio::spawn(run_udp_forwarder(stream, socket));

        let emitter = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        emitter.send_to(b"ping", local_addr).await.unwrap();

        // The remote end of the stream sees the length-prefixed frame.
        let mut frame = [0u8; 6];
        remote.read_exact(&mut frame).await.unwrap();
        assert_eq!(frame, [0x00, 0x04, b'p', b'i', b'n', b'g']);

        // Echo the same frame back; it must reach the emitter.
        remote.write_all(&frame).await.unwrap();
        let mut buf = [0u8; 16];
        let (n, from) = tokio::time::timeout(
            Duration::from_secs(2),
            emitter.recv_from(&mut buf),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(&buf[..n], b"ping");
        assert_eq!(from, local_addr);

        // Stream close surfaces as the forwarder's error.
        drop(remote);
        let err = tokio::time::timeout(Duration::from_secs(2), forwarder)
            .await
            .unwrap()
            .unwrap();
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn frames_before_any_local_sender_are_dropped() {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let local_addr = socket.local_addr().unwrap();

        let (stream, mut remote) = tokio::io::duplex(64 * 1024);
        let _forwarder = tokio::spawn(run_udp_forwarder(stream, socket));

        // No local peer yet: this frame has nowhere to go and is dropped.
        remote.write_all(&[0x00, 0x02, b'h', b'i']).await.unwrap();

        // The forwarder must still be healthy afterwards.
        let emitter = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        emitter.send_to(b"later", local_addr).await.unwrap();
        let mut frame = [0u8; 7];
        tokio::time::timeout(Duration::from_secs(2), remote.read_exact(&mut frame))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&frame[..2], &[0x00, 0x05]);
        assert_eq!(&frame[2..], b"later");
    }
}
