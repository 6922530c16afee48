use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use async_trait::async_trait;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::UdpSocket,
};
use url::Url;
use webrtc_dtls::config::{Config as DtlsConfig, ExtendedMasterSecretType};
use webrtc_dtls::conn::DTLSConn;
use webrtc_util::Conn;

use crate::fortunnels::dataplane::transport::{
    web_root_store, BoxedStream, DialOptions, Transport, TransportSession,
};

pub const DTLS_PORT: u16 = 4444;

/// DTLS data plane: a single encrypted channel over UDP, exposed as one
/// reliable byte stream. Record boundaries are pumped into an in-process
/// duplex pipe so the datagram forwarder can treat the connection as a
/// stream.
pub struct DtlsTransport;

impl DtlsTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for DtlsTransport {
    fn name(&self) -> &'static str {
        "dtls"
    }

    async fn dial(
        &self,
        server_url: &str,
        _opts: &DialOptions,
    ) -> anyhow::Result<Arc<dyn TransportSession>> {
        let u = Url::parse(server_url)?;
        let host = u
            .host_str()
            .ok_or_else(|| anyhow::anyhow!("invalid server url"))?
            .to_string();

        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect((host.as_str(), DTLS_PORT)).await?;
        let udp: Arc<dyn Conn + Send + Sync> = Arc::new(socket);

        // Verification is against the same public web roots the QUIC path
        // uses; the default store is empty and would reject everything.
        let cfg = DtlsConfig {
            server_name: host,
            extended_master_secret: ExtendedMasterSecretType::Require,
            insecure_skip_verify: false,
            roots_cas: web_root_store(),
            ..DtlsConfig::default()
        };
        let conn = DTLSConn::new(udp, cfg, true, None)
            .await
            .map_err(|e| anyhow::anyhow!("dtls handshake: {e}"))?;
        Ok(Arc::new(DtlsSession::new(Arc::new(conn))))
    }
}

struct DtlsSession {
    conn: Arc<DTLSConn>,
    stream: tokio::sync::Mutex<Option<tokio::io::DuplexStream>>,
    closed: Arc<AtomicBool>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl DtlsSession {
    fn new(conn: Arc<DTLSConn>) -> Self {
        let (local, remote) = tokio::io::duplex(64 * 1024);
        let (mut rd, mut wr) = tokio::io::split(remote);
        let closed = Arc::new(AtomicBool::new(false));

        let recv_conn = conn.clone();
        let recv_closed = closed.clone();
        let recv_task = tokio::spawn(async move {
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                match recv_conn.recv(&mut buf).await {
                    Ok(0) => continue,
                    Ok(n) => {
                        if wr.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
            recv_closed.store(true, Ordering::SeqCst);
        });

        let send_conn = conn.clone();
        let send_closed = closed.clone();
        let send_task = tokio::spawn(async move {
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                match rd.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if send_conn.send(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
            send_closed.store(true, Ordering::SeqCst);
        });

        Self {
            conn,
            stream: tokio::sync::Mutex::new(Some(local)),
            closed,
            tasks: vec![recv_task, send_task],
        }
    }
}

#[async_trait]
impl TransportSession for DtlsSession {
    async fn open_stream(&self) -> anyhow::Result<BoxedStream> {
        let mut slot = self.stream.lock().await;
        let st = slot
            .take()
            .ok_or_else(|| anyhow::anyhow!("dtls: stream already taken"))?;
        Ok(Box::new(st))
    }

    async fn accept_stream(&self) -> anyhow::Result<BoxedStream> {
        anyhow::bail!("dtls: no inbound streams")
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        let _ = self.conn.close().await;
        for t in &self.tasks {
            t.abort();
        }
        self.closed.store(true, Ordering::SeqCst);
    }
}
