use crate::fortunnels::config::{Config, EncryptionSettings, RuntimeSettings};
use crate::fortunnels::dataplane::{dtls, quic, transport::DialOptions, udp};

/// The UDP data-plane modes, selected by the runtime transport tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UdpStrategy {
    Ws,
    Quic,
    Dtls,
}

impl UdpStrategy {
    pub fn from_tag(tag: &str) -> Self {
        match tag.trim().to_ascii_lowercase().as_str() {
            "quic" => Self::Quic,
            "dtls" => Self::Dtls,
            _ => Self::Ws,
        }
    }

    pub fn description(&self, listen: &str, dst: &str) -> String {
        match self {
            Self::Quic => format!(
                "UDP over QUIC: listening on {listen} and forwarding to {dst} via QUIC datagrams"
            ),
            Self::Dtls => {
                format!("UDP over DTLS: listening on {listen} and forwarding to {dst} via DTLS")
            }
            Self::Ws => format!(
                "UDP mode: listening on {listen} and forwarding to {dst} over the multiplexed WebSocket"
            ),
        }
    }

    pub fn err_label(&self) -> &'static str {
        match self {
            Self::Quic => "udp quic mode error",
            Self::Dtls => "udp dtls mode error",
            Self::Ws => "udp mode error",
        }
    }

    pub async fn run(
        self,
        cfg: &Config,
        tunnel_id: &str,
        auth_token: &str,
        runtime: RuntimeSettings,
        enc: EncryptionSettings,
    ) -> anyhow::Result<()> {
        let opts = DialOptions {
            tunnel_id: tunnel_id.to_string(),
            settings: runtime.clone(),
        };
        match self {
            Self::Quic => {
                quic::run_quic_udp(
                    &cfg.server_url,
                    tunnel_id,
                    auth_token,
                    &cfg.udp_dst,
                    &cfg.udp_listen,
                    &opts,
                )
                .await
            }
            Self::Dtls => {
                dtls::run_dtls_udp(
                    &cfg.server_url,
                    tunnel_id,
                    auth_token,
                    &cfg.udp_dst,
                    &cfg.udp_listen,
                    &opts,
                )
                .await
            }
            Self::Ws => {
                udp::serve_udp(
                    &cfg.server_url,
                    tunnel_id,
                    &cfg.udp_dst,
                    &cfg.udp_listen,
                    runtime,
                    enc,
                )
                .await
            }
        }
    }
}
