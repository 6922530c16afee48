use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::fortunnels::config::RuntimeSettings;

/// A bidirectional async byte stream.
///
/// Rust trait objects can only have a single non-auto "principal" trait, so
/// we wrap `AsyncRead + AsyncWrite` into a single trait.
pub trait AsyncStream: tokio::io::AsyncRead + tokio::io::AsyncWrite {}
impl<T> AsyncStream for T where T: tokio::io::AsyncRead + tokio::io::AsyncWrite + ?Sized {}

pub type BoxedStream = Box<dyn AsyncStream + Unpin + Send>;

/// Options shared by all dialers; individual transports pick what they need.
#[derive(Debug, Clone)]
pub struct DialOptions {
    pub tunnel_id: String,
    pub settings: RuntimeSettings,
}

/// A way to reach the relay's data plane.
#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;
    async fn dial(
        &self,
        server_url: &str,
        opts: &DialOptions,
    ) -> anyhow::Result<Arc<dyn TransportSession>>;
}

/// One established data-plane connection. All transports expose the same
/// capability surface; a transport that cannot provide a capability fails
/// the call.
#[async_trait]
pub trait TransportSession: Send + Sync {
    async fn open_stream(&self) -> anyhow::Result<BoxedStream>;
    async fn accept_stream(&self) -> anyhow::Result<BoxedStream>;
    async fn send_datagram(&self, _payload: Bytes) -> anyhow::Result<()> {
        anyhow::bail!("transport: datagrams unsupported")
    }
    async fn recv_datagram(&self) -> anyhow::Result<Bytes> {
        anyhow::bail!("transport: datagrams unsupported")
    }
    fn is_closed(&self) -> bool;
    async fn close(&self);
}

/// Trust anchors for validating the relay's certificate, shared by the
/// TLS-backed transports (QUIC and DTLS).
pub(crate) fn web_root_store() -> rustls::RootCertStore {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    roots
}

pub fn parse_transport(name: &str) -> anyhow::Result<String> {
    let mut n = name.trim().to_ascii_lowercase();
    if n.is_empty() {
        n = "ws".into();
    }
    match n.as_str() {
        "ws" | "quic" | "dtls" => Ok(n),
        _ => anyhow::bail!("transport: unknown transport {name:?} (expected ws|quic|dtls)"),
    }
}

pub mod dtls;
pub mod quic;
pub mod ws;

pub fn transport_by_name(name: &str) -> anyhow::Result<Arc<dyn Transport>> {
    let n = parse_transport(name)?;
    match n.as_str() {
        "ws" => Ok(Arc::new(ws::WsTransport::new())),
        "quic" => Ok(Arc::new(quic::QuicTransport::new(false))),
        "dtls" => Ok(Arc::new(dtls::DtlsTransport::new())),
        _ => unreachable!(),
    }
}

#[cfg(test)]
mod tests {
    use super::parse_transport;

    #[test]
    fn parse_transport_defaults_to_ws() {
        assert_eq!(parse_transport("").unwrap(), "ws");
        assert_eq!(parse_transport("  QUIC ").unwrap(), "quic");
        assert_eq!(parse_transport("dtls").unwrap(), "dtls");
        assert!(parse_transport("kcp").is_err());
    }
}
