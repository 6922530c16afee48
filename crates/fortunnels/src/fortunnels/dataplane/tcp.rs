use std::{sync::Arc, time::Duration};

use anyhow::Context;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    sync::watch,
};

use crate::fortunnels::config::{normalize_bind_addr, EncryptionSettings, RuntimeSettings};
use crate::fortunnels::dataplane::{
    bridge::{is_benign_copy_error, pipe_streams},
    crypto,
    preface::{read_stream_destination, write_preface, Preface},
    session::{Manager, SessionError},
    transport::{transport_by_name, TransportSession},
    ECHO_BUFFER_SIZE, RECONNECT_RETRY_DELAY, TCP_ECHO_TIMEOUT,
};

/// `echo_test` over the WebSocket multiplexer: open one stream (or
/// `parallel` streams concurrently), send a greeting, expect it echoed back
/// within the echo deadline.
pub async fn run_echo(
    server_url: &str,
    tunnel_id: &str,
    dst: &str,
    parallel: usize,
    runtime: RuntimeSettings,
    enc: EncryptionSettings,
) -> anyhow::Result<()> {
    let transport = transport_by_name("ws")?;
    let opts = crate::fortunnels::dataplane::transport::DialOptions {
        tunnel_id: tunnel_id.to_string(),
        settings: runtime,
    };
    let sess = transport.dial(server_url, &opts).await.context("ws dial")?;
    let result = run_echo_streams(&sess, tunnel_id, dst, parallel, &enc).await;
    sess.close().await;
    result
}

/// Drive the echo exchange on an established session. Split out so tests
/// can run it against an in-process relay.
pub async fn run_echo_streams(
    sess: &Arc<dyn TransportSession>,
    tunnel_id: &str,
    dst: &str,
    parallel: usize,
    enc: &EncryptionSettings,
) -> anyhow::Result<()> {
    if parallel <= 1 {
        let echoed = echo_once(sess, tunnel_id, dst, b"hello over smux tcp\n", enc).await?;
        println!("echo: {}", String::from_utf8_lossy(&echoed).trim_end());
        return Ok(());
    }

    let mut tasks = tokio::task::JoinSet::new();
    for i in 0..parallel {
        let sess = sess.clone();
        let tunnel_id = tunnel_id.to_string();
        let dst = dst.to_string();
        let enc = enc.clone();
        tasks.spawn(async move {
            let greeting = format!("hello stream {i}\n");
            let echoed = echo_once(&sess, &tunnel_id, &dst, greeting.as_bytes(), &enc).await?;
            println!("echo[{i}]: {}", String::from_utf8_lossy(&echoed).trim_end());
            Ok::<(), anyhow::Error>(())
        });
    }
    while let Some(joined) = tasks.join_next().await {
        joined.context("echo task")??;
    }
    Ok(())
}

async fn echo_once(
    sess: &Arc<dyn TransportSession>,
    tunnel_id: &str,
    dst: &str,
    greeting: &[u8],
    enc: &EncryptionSettings,
) -> anyhow::Result<Vec<u8>> {
    let mut stream = sess.open_stream().await.context("open stream")?;
    write_preface(&mut stream, &Preface::tcp(dst))
        .await
        .context("write preface")?;
    let mut wrapped = crypto::wrap_client_stream(stream, tunnel_id, enc);

    wrapped.write_all(greeting).await.context("write payload")?;
    wrapped.flush().await.context("write payload")?;

    let mut buf = vec![0u8; ECHO_BUFFER_SIZE];
    let n = tokio::time::timeout(TCP_ECHO_TIMEOUT, wrapped.read(&mut buf))
        .await
        .context("read echo: deadline exceeded")?
        .context("read echo")?;
    buf.truncate(n);
    Ok(buf)
}

/// `serve_listen` mode: accept local TCP connections forever and proxy each
/// over its own multiplexed stream, reconnecting the session as needed.
pub async fn serve_listen(
    server_url: &str,
    tunnel_id: &str,
    dst: &str,
    listen_addr: &str,
    bo_init: Duration,
    bo_max: Duration,
    runtime: RuntimeSettings,
    enc: EncryptionSettings,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let transport = transport_by_name("ws")?;
    let mgr = Arc::new(Manager::new(
        transport, server_url, tunnel_id, bo_init, bo_max, runtime,
    ));

    let bind_addr = normalize_bind_addr(listen_addr);
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("listen {listen_addr}"))?;
    tracing::info!(listen = %listen_addr, dst = %dst, "dataplane: tcp listening");

    let result = loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break Ok(());
                }
            }
            accepted = listener.accept() => {
                let (conn, peer) = match accepted {
                    Ok(v) => v,
                    Err(err) => break Err(anyhow::Error::from(err).context("accept")),
                };
                let mgr = mgr.clone();
                let tunnel_id = tunnel_id.to_string();
                let dst = dst.to_string();
                let enc = enc.clone();
                tokio::spawn(async move {
                    if let Err(err) = proxy_accepted_conn(&mgr, conn, &tunnel_id, &dst, &enc).await {
                        tracing::debug!(peer = %peer, err = %err, "dataplane: proxied connection ended");
                    }
                });
            }
        }
    };

    mgr.close().await;
    result
}

async fn proxy_accepted_conn(
    mgr: &Manager,
    conn: TcpStream,
    tunnel_id: &str,
    dst: &str,
    enc: &EncryptionSettings,
) -> anyhow::Result<()> {
    let sess = mgr
        .ensure()
        .await
        .map_err(|e| anyhow::anyhow!("ensure session: {e}"))?;
    let mut stream = sess.open_stream().await.context("open stream")?;
    write_preface(&mut stream, &Preface::tcp(dst))
        .await
        .context("write preface")?;
    let wrapped = crypto::wrap_client_stream(stream, tunnel_id, enc);
    pipe_streams(conn, wrapped).await;
    Ok(())
}

/// `serve_incoming` mode: accept streams opened by the relay, read the
/// preface, dial the destination locally and bridge. Used for HTTP(S)
/// tunnels where traffic originates on the public side.
pub async fn serve_incoming(
    server_url: &str,
    tunnel_id: &str,
    runtime: RuntimeSettings,
    shutdown: watch::Receiver<bool>,
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
    let result = serve_incoming_with_manager(&mgr, shutdown).await;
    mgr.close().await;
    result
}

pub async fn serve_incoming_with_manager(
    mgr: &Manager,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    loop {
        if *shutdown.borrow() {
            return Ok(());
        }
        let sess = match mgr.ensure().await {
            Ok(s) => s,
            Err(SessionError::Stopped) => return Ok(()),
        };

        let stream = tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return Ok(());
                }
                continue;
            }
            st = sess.accept_stream() => st,
        };
        match stream {
            Ok(st) => {
                tokio::spawn(async move {
                    if let Err(err) = serve_incoming_stream(st).await {
                        tracing::warn!(err = %err, "dataplane: incoming stream error");
                    }
                });
            }
            Err(_) => {
                // Session likely closed; the manager reopens it on the next
                // pass.
                tokio::time::sleep(RECONNECT_RETRY_DELAY).await;
            }
        }
    }
}

async fn serve_incoming_stream(
    stream: crate::fortunnels::dataplane::transport::BoxedStream,
) -> anyhow::Result<()> {
    let mut rd = BufReader::with_capacity(8 * 1024, stream);
    let dst = match read_stream_destination(&mut rd).await {
        Ok(d) => d,
        Err(err) => {
            tracing::debug!(err = %err, "dataplane: bad preface on incoming stream");
            return Ok(());
        }
    };
    if dst.is_empty() {
        return Ok(());
    }

    let backend = match TcpStream::connect(&dst).await {
        Ok(c) => c,
        Err(err) => {
            if !is_benign_copy_error(&err) {
                tracing::warn!(dst = %dst, err = %err, "dataplane: dial destination failed");
            }
            return Ok(());
        }
    };

    // Any bytes the relay pipelined behind the preface sit in the reader's
    // buffer; bridging the buffered reader keeps them.
    pipe_streams(backend, rd).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tokio_yamux::Config as YamuxConfig;

    use crate::fortunnels::dataplane::transport::{
        ws::MuxSession, BoxedStream, DialOptions, Transport,
    };

    fn no_enc() -> EncryptionSettings {
        EncryptionSettings {
            enabled: false,
            psk: String::new(),
        }
    }

    fn enc(psk: &str) -> EncryptionSettings {
        EncryptionSettings {
            enabled: true,
            psk: psk.to_string(),
        }
    }

    fn settings() -> RuntimeSettings {
        RuntimeSettings {
            ping_interval: Duration::from_secs(30),
            ping_timeout: Duration::from_secs(10),
            mux_keepalive_interval: Duration::from_secs(25),
            mux_keepalive_timeout: Duration::from_secs(60),
            watch_interval: Duration::from_secs(10),
        }
    }

    /// In-process relay: accepts mux streams, checks the preface and echoes
    /// every byte that follows.
    fn spawn_echo_relay(server: MuxSession, expect_proto: &'static str) {
        tokio::spawn(async move {
            loop {
                let Ok(st) = server.accept_stream().await else {
                    return;
                };
                tokio::spawn(async move {
                    let mut rd = BufReader::new(st);
                    let pre = crate::fortunnels::dataplane::preface::read_preface(&mut rd)
                        .await
                        .expect("relay: preface");
                    assert_eq!(pre.proto, expect_proto);
                    let mut buf = [0u8; 1024];
                    loop {
                        match rd.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => {
                                if rd.write_all(&buf[..n]).await.is_err() {
                                    return;
                                }
                                let _ = rd.flush().await;
                            }
                        }
                    }
                });
            }
        });
    }

    fn mux_pair() -> (Arc<dyn TransportSession>, MuxSession) {
        let (a, b) = tokio::io::duplex(256 * 1024);
        let client = MuxSession::client(a, YamuxConfig::default());
        let server = MuxSession::server(b, YamuxConfig::default());
        (Arc::new(client), server)
    }

    #[tokio::test]
    async fn echo_single_stream() {
        let (client, server) = mux_pair();
        spawn_echo_relay(server, "tcp");
        run_echo_streams(&client, "tun-1", "127.0.0.1:3333", 1, &no_enc())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn echo_four_parallel_streams() {
        let (client, server) = mux_pair();
        spawn_echo_relay(server, "tcp");
        run_echo_streams(&client, "tun-1", "127.0.0.1:3333", 4, &no_enc())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn echo_roundtrips_through_aead_wrapped_relay() {
        const PSK: &str = "a-demo-pre-shared-key-of-32-chars!";
        let (client, server) = mux_pair();

        // Relay side: read the plaintext preface, then speak AEAD with the
        // same derived key and echo the decrypted payload.
        tokio::spawn(async move {
            let st = server.accept_stream().await.unwrap();
            let mut rd = BufReader::new(st);
            let pre = crate::fortunnels::dataplane::preface::read_preface(&mut rd)
                .await
                .unwrap();
            assert_eq!(pre.proto, "tcp");
            let key = crypto::derive_key(PSK.as_bytes(), "tun-1");
            // Keep the buffered reader: bytes pipelined behind the preface
            // may already sit in its buffer.
            let mut wrapped = crypto::AeadStream::new(rd, &key);
            let mut buf = [0u8; 1024];
            loop {
                match wrapped.read(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => {
                        wrapped.write_all(&buf[..n]).await.unwrap();
                        wrapped.flush().await.unwrap();
                    }
                }
            }
        });

        run_echo_streams(&client, "tun-1", "127.0.0.1:3333", 1, &enc(PSK))
            .await
            .unwrap();
    }

    struct QueueTransport {
        sessions: tokio::sync::Mutex<Vec<Arc<dyn TransportSession>>>,
    }

    #[async_trait]
    impl Transport for QueueTransport {
        fn name(&self) -> &'static str {
            "test"
        }
        async fn dial(
            &self,
            _server_url: &str,
            _opts: &DialOptions,
        ) -> anyhow::Result<Arc<dyn TransportSession>> {
            self.sessions
                .lock()
                .await
                .pop()
                .ok_or_else(|| anyhow::anyhow!("no more sessions"))
        }
    }

    fn manager_for(sess: Arc<dyn TransportSession>) -> Manager {
        Manager::new(
            Arc::new(QueueTransport {
                sessions: tokio::sync::Mutex::new(vec![sess]),
            }),
            "http://127.0.0.1:1",
            "tun-1",
            Duration::from_millis(20),
            Duration::from_millis(80),
            settings(),
        )
    }

    async fn open_relay_stream(server: &MuxSession, preface_line: &[u8]) -> BoxedStream {
        let mut st = server.open_stream().await.unwrap();
        st.write_all(preface_line).await.unwrap();
        st.flush().await.unwrap();
        st
    }

    #[tokio::test]
    async fn serve_incoming_dials_destination_and_bridges() {
        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = backend.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut c, _) = backend.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let n = c.read(&mut buf).await.unwrap();
            c.write_all(&buf[..n]).await.unwrap();
        });

        let (client, server) = mux_pair();
        let mgr = manager_for(client);
        let (_stop_tx, stop_rx) = watch::channel(false);
        let driver = tokio::spawn(async move {
            let _ = serve_incoming_with_manager(&mgr, stop_rx).await;
        });

        let line = format!("{{\"dst\":\"{backend_addr}\"}}\n");
        let mut st = open_relay_stream(&server, line.as_bytes()).await;
        st.write_all(b"through the tunnel").await.unwrap();
        st.flush().await.unwrap();

        let mut buf = [0u8; 64];
        let n = tokio::time::timeout(Duration::from_secs(2), st.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"through the tunnel");
        driver.abort();
    }

    /// E6: a stream whose first line is not JSON is closed without dialing
    /// anything.
    #[tokio::test]
    async fn serve_incoming_rejects_invalid_preface() {
        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();

        let (client, server) = mux_pair();
        let mgr = manager_for(client);
        let (_stop_tx, stop_rx) = watch::channel(false);
        let driver = tokio::spawn(async move {
            let _ = serve_incoming_with_manager(&mgr, stop_rx).await;
        });

        let mut st = open_relay_stream(&server, b"invalid\n").await;

        // The handler closes the stream: our read sees EOF.
        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(2), st.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);

        // And nothing connected to the local listener.
        let accepted = tokio::time::timeout(Duration::from_millis(200), backend.accept()).await;
        assert!(accepted.is_err(), "no dial may happen on a bad preface");
        driver.abort();
    }

    #[tokio::test]
    async fn serve_listen_proxies_local_connections() {
        let (client, server) = mux_pair();
        spawn_echo_relay(server, "tcp");

        let (_stop_tx, stop_rx) = watch::channel(false);
        let transport = Arc::new(QueueTransport {
            sessions: tokio::sync::Mutex::new(vec![client]),
        });
        let mgr = Arc::new(Manager::new(
            transport,
            "http://127.0.0.1:1",
            "tun-1",
            Duration::from_millis(20),
            Duration::from_millis(80),
            settings(),
        ));

        // Run the accept loop body by hand against an ephemeral listener.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mgr2 = mgr.clone();
        let mut stop_rx2 = stop_rx.clone();
        let driver = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop_rx2.changed() => return,
                    accepted = listener.accept() => {
                        let (conn, _) = accepted.unwrap();
                        let mgr = mgr2.clone();
                        tokio::spawn(async move {
                            let _ = proxy_accepted_conn(&mgr, conn, "tun-1", "127.0.0.1:3333", &no_enc()).await;
                        });
                    }
                }
            }
        });

        let mut local = TcpStream::connect(addr).await.unwrap();
        local.write_all(b"proxy me").await.unwrap();
        let mut buf = [0u8; 64];
        let n = tokio::time::timeout(Duration::from_secs(2), local.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"proxy me");
        driver.abort();
    }
}
