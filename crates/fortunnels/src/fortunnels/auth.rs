use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Compute the data-plane authentication token.
///
/// A precomputed token wins; otherwise, when a secret is configured, the
/// token is the lower-case hex of HMAC-SHA256(secret, tunnel_id). An empty
/// result means no data-plane auth is configured.
pub fn compute_data_plane_auth(tunnel_id: &str, token_flag: &str, secret_flag: &str) -> String {
    if !token_flag.is_empty() {
        return token_flag.to_string();
    }
    if !secret_flag.trim().is_empty() {
        return compute_hmac(secret_flag, tunnel_id);
    }
    String::new()
}

fn compute_hmac(secret: &str, message: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(message.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}
