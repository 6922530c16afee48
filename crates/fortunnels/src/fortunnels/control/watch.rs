use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

use crate::fortunnels::config::RuntimeSettings;
use crate::fortunnels::control::api::ControlClient;

#[derive(Debug, Deserialize)]
struct WatchMessage {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    payload: serde_json::Value,
}

fn build_watch_url(server_url: &str, tunnel_id: &str) -> anyhow::Result<String> {
    let mut u = Url::parse(server_url)?;
    let ws_scheme = match u.scheme() {
        "http" => "ws",
        "https" => "wss",
        other => anyhow::bail!("unsupported server scheme: {other}"),
    };
    u.set_scheme(ws_scheme)
        .map_err(|_| anyhow::anyhow!("invalid server url"))?;
    u.set_path("/ws");
    u.query_pairs_mut().clear().append_pair("watch", tunnel_id);
    Ok(u.to_string())
}

/// Watch the tunnel over the control-plane WebSocket until it is closed on
/// the server or the connection ends.
///
/// Pings go out every ping interval under the ping-timeout write deadline.
/// Until the server acks the subscription, a fallback HTTP poll checks for
/// deletion every second; after the ack it drops to the configured watch
/// interval.
pub async fn connect_websocket(server_url: &str, tunnel_id: &str, runtime: &RuntimeSettings) {
    let ws_url = match build_watch_url(server_url, tunnel_id) {
        Ok(u) => u,
        Err(err) => {
            tracing::warn!(err = %err, "watch: bad server url");
            return;
        }
    };

    let (socket, _response) = match connect_async(&ws_url).await {
        Ok(v) => v,
        Err(err) => {
            tracing::warn!(err = %err, "watch: websocket connect failed");
            return;
        }
    };
    println!("watch: websocket connected");
    let (mut sink, mut stream) = socket.split();

    let poller = match ControlClient::new(server_url, "") {
        Ok(c) => c,
        Err(err) => {
            tracing::warn!(err = %err, "watch: poller client");
            return;
        }
    };

    let mut ping_tick = tokio::time::interval_at(
        tokio::time::Instant::now() + runtime.ping_interval,
        runtime.ping_interval,
    );
    let mut poll_tick = tokio::time::interval(Duration::from_secs(1));
    poll_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut subscribed = false;
    let ack_warning = tokio::time::sleep(Duration::from_secs(5));
    tokio::pin!(ack_warning);
    let mut ack_warned = false;

    loop {
        tokio::select! {
            _ = &mut ack_warning, if !subscribed && !ack_warned => {
                ack_warned = true;
                println!("watch: no 'subscribed' ack from server; relying on fallback monitoring");
            }
            _ = ping_tick.tick() => {
                let write = sink.send(Message::Ping(Vec::new()));
                match tokio::time::timeout(runtime.ping_timeout, write).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        tracing::info!(err = %err, "watch: ping loop ending");
                        return;
                    }
                    Err(_) => {
                        tracing::info!("watch: ping write deadline exceeded");
                        return;
                    }
                }
            }
            _ = poll_tick.tick() => {
                if poller.tunnel_deleted(tunnel_id).await {
                    println!("watch: tunnel deleted on server");
                    return;
                }
            }
            msg = stream.next() => {
                let Some(msg) = msg else {
                    tracing::info!("watch: websocket ended");
                    return;
                };
                match msg {
                    Ok(Message::Text(text)) => {
                        let Ok(parsed) = serde_json::from_str::<WatchMessage>(&text) else {
                            continue;
                        };
                        if handle_watch_message(&parsed) {
                            return;
                        }
                        if parsed.kind == "subscribed" && !subscribed {
                            subscribed = true;
                            poll_tick = tokio::time::interval(runtime.watch_interval);
                            poll_tick
                                .set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                            poll_tick.reset();
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        let reason = frame
                            .map(|f| f.reason.to_string())
                            .unwrap_or_else(|| "server closed connection".into());
                        println!("watch: closed by server ({reason})");
                        return;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        tracing::info!(err = %err, "watch: websocket ended");
                        return;
                    }
                }
            }
        }
    }
}

/// Returns true when the watch should end.
fn handle_watch_message(msg: &WatchMessage) -> bool {
    match msg.kind.as_str() {
        "pong" => {
            println!("watch: pong received");
            false
        }
        "tunnel_closed" => {
            let reason = msg
                .payload
                .get("reason")
                .and_then(|r| r.as_str())
                .filter(|r| !r.is_empty())
                .unwrap_or("unknown");
            println!("watch: tunnel closed on server (reason: {reason})");
            true
        }
        "subscribed" => {
            println!("watch: subscribed");
            false
        }
        "error" => {
            if let Some(message) = msg.payload.get("message").and_then(|m| m.as_str()) {
                println!("watch: error: {message}");
            }
            false
        }
        other => {
            println!("watch: message: {other}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watch_url_uses_ws_scheme_and_watch_query() {
        let u = build_watch_url("https://relay.example.com", "tun-1").unwrap();
        assert_eq!(u, "wss://relay.example.com/ws?watch=tun-1");
        let u = build_watch_url("http://127.0.0.1:8080", "t").unwrap();
        assert_eq!(u, "ws://127.0.0.1:8080/ws?watch=t");
    }

    #[test]
    fn tunnel_closed_message_ends_watch() {
        let msg: WatchMessage = serde_json::from_str(
            "{\"type\":\"tunnel_closed\",\"payload\":{\"reason\":\"expired\"}}",
        )
        .unwrap();
        assert!(handle_watch_message(&msg));

        let msg: WatchMessage = serde_json::from_str("{\"type\":\"pong\"}").unwrap();
        assert!(!handle_watch_message(&msg));
    }
}
