use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::remote::types::FsChangeEvent;

/// What a decoded Engine.IO/Socket.IO text frame asks us to do.
#[derive(Debug, PartialEq)]
pub(crate) enum FrameAction {
    /// `0{...}`: Engine.IO open; answer with the Socket.IO connect frame.
    Open,
    /// `2`: Engine.IO ping; answer with pong.
    Ping,
    /// `40`: Socket.IO connected to the default namespace.
    Connected,
    /// `42["fs_change", {...}]`: a filesystem change notification.
    Change(FsChangeEvent),
    /// Anything else (acks, other events, binary markers).
    Ignore,
}

pub(crate) fn decode_frame(text: &str) -> FrameAction {
    if text.starts_with('0') {
        return FrameAction::Open;
    }
    if text == "2" {
        return FrameAction::Ping;
    }
    if text == "40" || text.starts_with("40{") {
        return FrameAction::Connected;
    }
    if let Some(payload) = text.strip_prefix("42") {
        let arr: serde_json::Value = match serde_json::from_str(payload) {
            Ok(v) => v,
            Err(e) => {
                warn!("Malformed Socket.IO event frame: {}", e);
                return FrameAction::Ignore;
            }
        };
        if arr.get(0).and_then(|v| v.as_str()) == Some("fs_change") {
            if let Some(body) = arr.get(1) {
                match serde_json::from_value::<FsChangeEvent>(body.clone()) {
                    Ok(ev) => return FrameAction::Change(ev),
                    Err(e) => warn!("Undecodable fs_change payload: {}", e),
                }
            }
        }
    }
    FrameAction::Ignore
}

fn websocket_url(base_url: &str) -> String {
    let ws_base = if let Some(rest) = base_url.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base_url.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        format!("ws://{}", base_url)
    };
    format!(
        "{}/socket.io/?EIO=4&transport=websocket",
        ws_base.trim_end_matches('/')
    )
}

fn reconnect_delay(attempt: u32) -> Duration {
    let secs = match attempt {
        0 => 1,
        1 => 2,
        2 => 4,
        3 => 8,
        4 => 16,
        _ => 30,
    };
    Duration::from_secs(secs)
}

/// Long-lived subscription to the server's `fs_change` push channel.
///
/// Each decoded event is handed to `on_event`. On transport failure the
/// connection is re-established with exponential backoff; no resync is
/// attempted after an outage; the cache TTLs bound staleness until fresh
/// notifications flow again.
pub async fn run_subscriber<F>(base_url: String, on_event: F)
where
    F: Fn(FsChangeEvent) + Send + Sync + 'static,
{
    let url = websocket_url(&base_url);
    let mut attempt: u32 = 0;

    loop {
        match connect_async(url.as_str()).await {
            Ok((ws, _)) => {
                info!("Push channel connected: {}", url);
                attempt = 0;
                let (mut write, mut read) = ws.split();

                while let Some(msg) = read.next().await {
                    match msg {
                        Ok(Message::Text(text)) => match decode_frame(&text) {
                            FrameAction::Open => {
                                if let Err(e) = write.send(Message::Text("40".into())).await {
                                    warn!("Push channel connect frame failed: {}", e);
                                    break;
                                }
                            }
                            FrameAction::Ping => {
                                if let Err(e) = write.send(Message::Text("3".into())).await {
                                    warn!("Push channel pong failed: {}", e);
                                    break;
                                }
                            }
                            FrameAction::Connected => {
                                debug!("Push channel joined default namespace");
                            }
                            FrameAction::Change(ev) => {
                                debug!("fs_change: {} {:?}", ev.op, ev.rel_path);
                                on_event(ev);
                            }
                            FrameAction::Ignore => {}
                        },
                        Ok(Message::Close(_)) => {
                            info!("Push channel closed by server");
                            break;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!("Push channel error: {}", e);
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                warn!("Push channel connect failed: {}", e);
            }
        }

        let delay = reconnect_delay(attempt);
        attempt = attempt.saturating_add(1);
        debug!("Reconnecting push channel in {:?}", delay);
        tokio::time::sleep(delay).await;
    }
}
