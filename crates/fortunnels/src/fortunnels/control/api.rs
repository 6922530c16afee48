use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Tunnel record returned by the relay when a tunnel is created.
#[derive(Debug, Clone, Deserialize)]
pub struct TunnelHandle {
    pub id: String,
    #[serde(default)]
    pub user_id: i64,
    #[serde(default)]
    pub protocol: String,
    #[serde(default)]
    pub target_addr: String,
    #[serde(default)]
    pub public_url: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub last_active: String,
    #[serde(default)]
    pub connections: i64,
    #[serde(default)]
    pub is_guest: bool,
    #[serde(default)]
    pub bytes_used: i64,
    #[serde(default)]
    pub expires_at: String,
}

#[derive(Debug, Serialize)]
struct CreateTunnelRequest<'a> {
    target_addr: &'a str,
    protocol: &'a str,
    user_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    tls_insecure_skip_verify: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tls_server_name: Option<&'a str>,
}

/// Control-plane REST client. Carries either a bearer token or a session
/// cookie obtained from `login_local`.
pub struct ControlClient {
    http: reqwest::Client,
    server_url: String,
    bearer: String,
}

impl ControlClient {
    pub fn new(server_url: &str, bearer: &str) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .cookie_store(true)
            .build()
            .context("control: build http client")?;
        Ok(Self {
            http,
            server_url: server_url.trim_end_matches('/').to_string(),
            bearer: bearer.trim().to_string(),
        })
    }

    /// `POST /auth/login-local`; the session cookie lands in the client's
    /// cookie store.
    pub async fn login_local(&self, login: &str, password: &str) -> anyhow::Result<()> {
        let resp = self
            .http
            .post(format!("{}/auth/login-local", self.server_url))
            .json(&serde_json::json!({ "login": login, "password": password }))
            .send()
            .await?;
        if resp.status() != reqwest::StatusCode::OK {
            anyhow::bail!("login failed: HTTP {}", resp.status().as_u16());
        }
        Ok(())
    }

    /// `POST /api/tunnels`; only `201 Created` is success. For HTTPS targets
    /// on localhost, self-signed upstreams are allowed and the SNI pinned,
    /// matching local development setups.
    pub async fn create_tunnel(
        &self,
        target_addr: &str,
        protocol: &str,
        user_id: &str,
    ) -> anyhow::Result<TunnelHandle> {
        let local_https = protocol.eq_ignore_ascii_case("https")
            && matches!(
                target_addr.rsplit_once(':').map(|(h, _)| h),
                Some("localhost") | Some("127.0.0.1")
            );
        let body = CreateTunnelRequest {
            target_addr,
            protocol,
            user_id,
            tls_insecure_skip_verify: local_https.then_some(true),
            tls_server_name: local_https.then_some("localhost"),
        };

        let mut req = self
            .http
            .post(format!("{}/api/tunnels", self.server_url))
            .json(&body);
        if !self.bearer.is_empty() {
            req = req.bearer_auth(&self.bearer);
        }

        let resp = req.send().await?;
        let status = resp.status();
        if status != reqwest::StatusCode::CREATED {
            let text = resp.text().await.unwrap_or_default();
            let text = text.trim();
            if text.is_empty() {
                anyhow::bail!("server returned status {}", status.as_u16());
            }
            anyhow::bail!("server returned status {}: {}", status.as_u16(), text);
        }
        Ok(resp.json::<TunnelHandle>().await?)
    }

    /// `GET /api/tunnels?id=...`, used by the watch fallback poller. Returns
    /// true when the server reports the tunnel gone.
    pub async fn tunnel_deleted(&self, tunnel_id: &str) -> bool {
        #[derive(Deserialize)]
        struct Existence {
            #[serde(default)]
            exists: Option<bool>,
        }
        let url = format!("{}/api/tunnels?id={}", self.server_url, tunnel_id);
        let Ok(resp) = self
            .http
            .get(url)
            .timeout(Duration::from_secs(2))
            .send()
            .await
        else {
            return false;
        };
        match resp.json::<Existence>().await {
            Ok(payload) => payload.exists == Some(false),
            Err(_) => false,
        }
    }
}

/// True for connection-refused / dial-timeout failures, which get a short
/// actionable startup message instead of the raw error chain.
pub fn is_server_unreachable(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        if let Some(re) = cause.downcast_ref::<reqwest::Error>() {
            return re.is_connect() || re.is_timeout();
        }
        let msg = cause.to_string().to_ascii_lowercase();
        msg.contains("connection refused") || msg.contains("timed out")
    })
}

pub fn print_tunnel_info(tunnel: &TunnelHandle) {
    println!("Tunnel created successfully");
    println!("  public url: {}", tunnel.public_url);
    println!("  tunnel id:  {}", tunnel.id);
    println!("  status:     {}", tunnel.status);
    if tunnel.is_guest {
        println!(
            "  guest tunnel: expires {}, traffic capped at 1 GB",
            tunnel.expires_at
        );
    }
}

pub fn print_http_hints(server_url: &str, tunnel: &TunnelHandle) {
    println!("Usage hints (HTTP):");
    println!("  path-based (dev): {}/t/{}", server_url, tunnel.id);
    println!("  host-based:       {} (use Host header)", tunnel.public_url);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tunnel_handle_parses_partial_record() {
        let record: TunnelHandle = serde_json::from_str(
            "{\"id\":\"tun-1\",\"public_url\":\"https://tun-1.relay.example\",\"status\":\"active\"}",
        )
        .unwrap();
        assert_eq!(record.id, "tun-1");
        assert_eq!(record.status, "active");
        assert!(!record.is_guest);
    }

    #[test]
    fn create_request_adds_tls_fields_only_for_local_https() {
        let body = CreateTunnelRequest {
            target_addr: "localhost:8443",
            protocol: "https",
            user_id: "default",
            tls_insecure_skip_verify: Some(true),
            tls_server_name: Some("localhost"),
        };
        let text = serde_json::to_string(&body).unwrap();
        assert!(text.contains("tls_insecure_skip_verify"));

        let body = CreateTunnelRequest {
            target_addr: "localhost:8000",
            protocol: "http",
            user_id: "default",
            tls_insecure_skip_verify: None,
            tls_server_name: None,
        };
        let text = serde_json::to_string(&body).unwrap();
        assert!(!text.contains("tls_insecure_skip_verify"));
    }

    #[test]
    fn unreachable_is_detected_from_message_chain() {
        let err = anyhow::anyhow!("connection refused (os error 111)");
        assert!(is_server_unreachable(&err));
        let err = anyhow::anyhow!("server returned status 403");
        assert!(!is_server_unreachable(&err));
    }
}
