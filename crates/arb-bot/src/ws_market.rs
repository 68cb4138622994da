//! Public market stream driver.
//!
//! Connects, subscribes to the configured markets and forwards parsed
//! snapshot/update messages into the core queue. Reconnects with
//! exponential backoff capped at 30 s; every (re)connect triggers a resync
//! for all subscribed tokens, since any number of deltas may have been
//! missed. On a full core queue a book update is dropped and replaced by a
//! resync request, so the sequence machinery heals the hole instead of the
//! queue silently lying.

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{info, warn};

use arb_common::{PriceLevel, Side};

use crate::rest::ResyncRequest;
use crate::types::{BookDelta, BookSnapshot, EngineEvent, LevelChange, MarketEvent};

const MAX_BACKOFF_SECS: u64 = 30;

#[derive(Debug, Clone)]
pub struct MarketStreamConfig {
    pub ws_url: String,
    /// (market_id, token_id) pairs to subscribe and resync.
    pub tokens: Vec<(String, String)>,
}

#[derive(Debug, Deserialize)]
struct WireLevel {
    price: Decimal,
    size: Decimal,
}

#[derive(Debug, Deserialize)]
struct WireChange {
    side: String,
    price: Decimal,
    size: Decimal,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireMessage {
    Snapshot {
        market: String,
        token: String,
        #[serde(default)]
        bids: Vec<WireLevel>,
        #[serde(default)]
        asks: Vec<WireLevel>,
        seq: u64,
    },
    Update {
        market: String,
        token: String,
        #[serde(default)]
        changes: Vec<WireChange>,
        seq: u64,
    },
}

fn parse_message(text: &str) -> Option<MarketEvent> {
    let message: WireMessage = serde_json::from_str(text).ok()?;
    let captured_at = Utc::now();
    match message {
        WireMessage::Snapshot {
            market,
            token,
            bids,
            asks,
            seq,
        } => Some(MarketEvent::Snapshot(BookSnapshot {
            market_id: market,
            token_id: token,
            bids: bids
                .into_iter()
                .map(|l| PriceLevel::new(l.price, l.size))
                .collect(),
            asks: asks
                .into_iter()
                .map(|l| PriceLevel::new(l.price, l.size))
                .collect(),
            sequence: seq,
            captured_at,
        })),
        WireMessage::Update {
            market,
            token,
            changes,
            seq,
        } => {
            let changes = changes
                .into_iter()
                .filter_map(|c| {
                    let side = match c.side.to_lowercase().as_str() {
                        "buy" | "bid" => Side::Buy,
                        "sell" | "ask" => Side::Sell,
                        _ => return None,
                    };
                    Some(LevelChange {
                        side,
                        price: c.price,
                        size: c.size,
                    })
                })
                .collect();
            Some(MarketEvent::Delta(BookDelta {
                market_id: market,
                token_id: token,
                changes,
                sequence: seq,
                captured_at,
            }))
        }
    }
}

/// Run the market stream until shutdown flips.
pub fn spawn_market_stream(
    cfg: MarketStreamConfig,
    events: mpsc::Sender<EngineEvent>,
    resync: mpsc::Sender<ResyncRequest>,
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
                    warn!(component = "market_ws", error = %err, "connect failed");
                    tokio::time::sleep(std::time::Duration::from_secs(backoff)).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF_SECS);
                    continue;
                }
            };
            info!(component = "market_ws", "connected");
            backoff = 1;

            // Missed deltas are unknowable across a reconnect: resync all.
            for (market_id, token_id) in &cfg.tokens {
                let _ = resync
                    .send(ResyncRequest {
                        market_id: market_id.clone(),
                        token_id: token_id.clone(),
                    })
                    .await;
            }

            let markets: Vec<&str> = cfg.tokens.iter().map(|(m, _)| m.as_str()).collect();
            let subscribe = json!({
                "type": "subscribe",
                "channel": "market",
                "markets": markets,
            });
            if let Err(err) = ws.send(Message::Text(subscribe.to_string().into())).await {
                warn!(component = "market_ws", error = %err, "subscribe failed");
                continue;
            }

            loop {
                let message = tokio::select! {
                    biased;
                    _ = shutdown.changed() => return,
                    message = ws.next() => message,
                };
                let message = match message {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Binary(_) | Message::Frame(_))) => {
                        continue
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        warn!(component = "market_ws", "stream closed; reconnecting");
                        break;
                    }
                    Some(Err(err)) => {
                        warn!(component = "market_ws", error = %err, "stream error; reconnecting");
                        break;
                    }
                };
                let Some(event) = parse_message(&message) else {
                    continue;
                };
                let market_id = event.market_id().to_string();
                let token_id = event.token_id().to_string();
                // Book updates are droppable under backpressure; the resync
                // request repairs the resulting gap.
                if events.try_send(EngineEvent::Market(event)).is_err() {
                    warn!(
                        component = "market_ws",
                        market_id = %market_id,
                        token_id = %token_id,
                        "core queue full; dropping book update"
                    );
                    let _ = resync
                        .send(ResyncRequest {
                            market_id: market_id.clone(),
                            token_id: token_id.clone(),
                        })
                        .await;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_parse_snapshot() {
        let text = r#"{
            "type": "snapshot",
            "market": "m1",
            "token": "tok-y",
            "bids": [{"price": "0.47", "size": "50"}],
            "asks": [{"price": "0.48", "size": "100"}],
            "seq": 12
        }"#;
        let event = parse_message(text).unwrap();
        let MarketEvent::Snapshot(snapshot) = event else {
            panic!("expected snapshot");
        };
        assert_eq!(snapshot.market_id, "m1");
        assert_eq!(snapshot.sequence, 12);
        assert_eq!(snapshot.asks[0].price, dec!(0.48));
    }

    #[test]
    fn test_parse_update_with_sides() {
        let text = r#"{
            "type": "update",
            "market": "m1",
            "token": "tok-y",
            "changes": [
                {"side": "bid", "price": "0.47", "size": "0"},
                {"side": "ask", "price": "0.49", "size": "25"},
                {"side": "???", "price": "0.1", "size": "1"}
            ],
            "seq": 13
        }"#;
        let event = parse_message(text).unwrap();
        let MarketEvent::Delta(delta) = event else {
            panic!("expected delta");
        };
        assert_eq!(delta.sequence, 13);
        assert_eq!(delta.changes.len(), 2);
        assert_eq!(delta.changes[0].side, Side::Buy);
        assert_eq!(delta.changes[1].side, Side::Sell);
    }

    #[test]
    fn test_garbage_ignored() {
        assert!(parse_message("not json").is_none());
        assert!(parse_message(r#"{"type": "heartbeat"}"#).is_none());
    }
}
