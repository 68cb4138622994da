//! Private user stream driver.
//!
//! Authenticates with the HMAC payload and forwards order acks, fills,
//! cancel acks and rejects into the core queue. Private events are the
//! source of truth for fills, so they are never dropped: the send awaits
//! queue space. Reconnects with exponential backoff capped at 30 s.

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde::Deserialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{info, warn};

use arb_common::Side;

use crate::auth::{redact_payload, user_subscribe_payload, ApiCredentials};
use crate::types::{EngineEvent, FillRecord, UserEvent};

const MAX_BACKOFF_SECS: u64 = 30;

#[derive(Debug, Clone)]
pub struct UserStreamConfig {
    pub ws_url: String,
    pub creds: ApiCredentials,
    pub chain_id: u64,
}

#[derive(Debug, Deserialize)]
struct WireUserMessage {
    event: String,
    #[serde(default)]
    market: String,
    #[serde(default)]
    asset_id: String,
    #[serde(default)]
    client_order_id: String,
    #[serde(default)]
    order_id: Option<String>,
    #[serde(default)]
    side: Option<String>,
    #[serde(default)]
    price: Option<Decimal>,
    #[serde(default)]
    size: Option<Decimal>,
    #[serde(default)]
    fee: Option<Decimal>,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    rate_limited: bool,
}

fn parse_user_message(text: &str) -> Option<UserEvent> {
    let message: WireUserMessage = serde_json::from_str(text).ok()?;
    let at = Utc::now();
    match message.event.to_lowercase().as_str() {
        "order_ack" => Some(UserEvent::OrderAck {
            client_order_id: message.client_order_id,
            venue_order_id: message.order_id,
            at,
        }),
        "fill" => {
            let side = match message.side.as_deref().map(str::to_lowercase).as_deref() {
                Some("buy") => Side::Buy,
                Some("sell") => Side::Sell,
                _ => return None,
            };
            Some(UserEvent::Fill(FillRecord {
                ts: at,
                market_id: message.market,
                token_id: message.asset_id,
                side,
                price: message.price?,
                size: message.size?,
                fee: message.fee.unwrap_or(Decimal::ZERO),
                venue_order_id: message.order_id,
                client_order_id: if message.client_order_id.is_empty() {
                    None
                } else {
                    Some(message.client_order_id)
                },
            }))
        }
        "cancel_ack" => Some(UserEvent::CancelAck {
            client_order_id: if message.client_order_id.is_empty() {
                message.order_id.unwrap_or_default()
            } else {
                message.client_order_id
            },
            at,
        }),
        "reject" => Some(UserEvent::Reject {
            client_order_id: message.client_order_id,
            reason: message.reason.unwrap_or_else(|| "venue reject".to_string()),
            rate_limited: message.rate_limited,
            at,
        }),
        _ => None,
    }
}

/// Run the private stream until shutdown flips.
pub fn spawn_user_stream(
    cfg: UserStreamConfig,
    events: mpsc::Sender<EngineEvent>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut backoff = 1u64;
        loop {
            if *shutdown.borrow() {
                return;
            }
            let connection = tokio::select! {
                biased;
                _ = shutdown.changed() => return,
                result = connect_async(cfg.ws_url.as_str()) => result,
            };
            let (mut ws, _) = match connection {
                Ok(ok) => ok,
                Err(err) => {
                    warn!(component = "user_ws", error = %err, "connect failed");
                    tokio::time::sleep(std::time::Duration::from_secs(backoff)).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF_SECS);
                    continue;
                }
            };
            backoff = 1;

            let payload = user_subscribe_payload(&cfg.creds, cfg.chain_id, Utc::now());
            info!(
                component = "user_ws",
                payload = %redact_payload(&payload),
                "subscribing to user channel"
            );
            if let Err(err) = ws.send(Message::Text(payload.to_string().into())).await {
                warn!(component = "user_ws", error = %err, "subscribe failed");
                continue;
            }

            loop {
                let message = tokio::select! {
                    biased;
                    _ = shutdown.changed() => return,
                    message = ws.next() => message,
                };
                let text = match message {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Binary(_) | Message::Frame(_))) => {
                        continue
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        warn!(component = "user_ws", "stream closed; reconnecting");
                        break;
                    }
                    Some(Err(err)) => {
                        warn!(component = "user_ws", error = %err, "stream error; reconnecting");
                        break;
                    }
                };
                if let Some(event) = parse_user_message(&text) {
                    // Private events are authoritative: block, never drop.
                    if events.send(EngineEvent::User(event)).await.is_err() {
                        return;
                    }
                }
            }
        }
    })
}
