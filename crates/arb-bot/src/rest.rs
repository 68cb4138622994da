//! REST drivers: book snapshots for resync and fill backfill.
//!
//! Transient network errors are retried locally with backoff and never
//! surfaced to the core beyond a counter; a successful snapshot is fed back
//! through the normal event queue so book mutations stay on the
//! single-writer task.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use arb_common::{PriceLevel, Side};

use crate::types::{BookSnapshot, EngineEvent, FillRecord, MarketEvent};

#[derive(Debug, Error)]
pub enum VenueError {
    #[error("http error: {0}")]
    Http(String),
    #[error("venue returned status {0}")]
    Status(u16),
    #[error("malformed payload: {0}")]
    Malformed(String),
}

/// A token the core wants resynced from REST.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResyncRequest {
    pub market_id: String,
    pub token_id: String,
}

#[derive(Debug, Deserialize)]
struct RawLevel {
    price: serde_json::Value,
    size: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct RawBook {
    #[serde(default)]
    bids: Vec<RawLevel>,
    #[serde(default)]
    asks: Vec<RawLevel>,
    #[serde(default, alias = "sequence")]
    seq: u64,
}

#[derive(Debug, Deserialize)]
struct RawFill {
    #[serde(default)]
    market: String,
    #[serde(default)]
    asset_id: String,
    #[serde(default)]
    side: String,
    price: serde_json::Value,
    size: serde_json::Value,
    #[serde(default)]
    fee: Option<serde_json::Value>,
    #[serde(default)]
    order_id: Option<String>,
    #[serde(default)]
    client_order_id: Option<String>,
    #[serde(default)]
    timestamp_ms: i64,
}

fn parse_decimal(value: &serde_json::Value) -> Option<Decimal> {
    match value {
        serde_json::Value::String(s) => s.parse().ok(),
        serde_json::Value::Number(n) => n.to_string().parse().ok(),
        _ => None,
    }
}

/// Sanitise raw levels: drop unparsable, out-of-range or empty entries.
fn parse_levels(raw: &[RawLevel], descending: bool) -> Vec<PriceLevel> {
    let mut levels: Vec<PriceLevel> = raw
        .iter()
        .filter_map(|level| {
            let price = parse_decimal(&level.price)?;
            let size = parse_decimal(&level.size)?;
            if price < Decimal::ZERO || price > Decimal::ONE {
                warn!(component = "rest", %price, "dropping out-of-range price level");
                return None;
            }
            if size <= Decimal::ZERO {
                return None;
            }
            Some(PriceLevel::new(price, size))
        })
        .collect();
    if descending {
        levels.sort_by(|a, b| b.price.cmp(&a.price));
    } else {
        levels.sort_by(|a, b| a.price.cmp(&b.price));
    }
    levels
}

pub struct RestClient {
    http: reqwest::Client,
    base_url: String,
}

impl RestClient {
    pub fn new(base_url: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url,
        }
    }

    /// `GET /book?token_id=...` -> a full snapshot.
    pub async fn fetch_book(
        &self,
        market_id: &str,
        token_id: &str,
    ) -> Result<BookSnapshot, VenueError> {
        let response = self
            .http
            .get(format!("{}/book", self.base_url))
            .query(&[("token_id", token_id)])
            .send()
            .await
            .map_err(|e| VenueError::Http(e.to_string()))?;
        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            return Err(VenueError::Status(status));
        }
        let raw: RawBook = response
            .json()
            .await
            .map_err(|e| VenueError::Malformed(e.to_string()))?;
        Ok(BookSnapshot {
            market_id: market_id.to_string(),
            token_id: token_id.to_string(),
            bids: parse_levels(&raw.bids, true),
            asks: parse_levels(&raw.asks, false),
            sequence: raw.seq,
            captured_at: Utc::now(),
        })
    }

    /// `GET /fills?since=...` -> backfill of private fills.
    pub async fn fetch_fills(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<FillRecord>, VenueError> {
        let response = self
            .http
            .get(format!("{}/fills", self.base_url))
            .query(&[("since", since.timestamp_millis().to_string())])
            .send()
            .await
            .map_err(|e| VenueError::Http(e.to_string()))?;
        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            return Err(VenueError::Status(status));
        }
        let raw: Vec<RawFill> = response
            .json()
            .await
            .map_err(|e| VenueError::Malformed(e.to_string()))?;
        Ok(raw
            .iter()
            .filter_map(|fill| {
                let side = match fill.side.to_lowercase().as_str() {
                    "buy" => Side::Buy,
                    "sell" => Side::Sell,
                    _ => return None,
                };
                Some(FillRecord {
                    ts: DateTime::from_timestamp_millis(fill.timestamp_ms)
                        .unwrap_or_else(Utc::now),
                    market_id: fill.market.clone(),
                    token_id: fill.asset_id.clone(),
                    side,
                    price: parse_decimal(&fill.price)?,
                    size: parse_decimal(&fill.size)?,
                    fee: fill.fee.as_ref().and_then(parse_decimal).unwrap_or(Decimal::ZERO),
                    venue_order_id: fill.order_id.clone(),
                    client_order_id: fill.client_order_id.clone(),
                })
            })
            .collect())
    }
}

/// Worker that serves resync requests: fetch with bounded retries and feed
/// the snapshot back through the core queue.
pub fn spawn_resync_worker(
    client: RestClient,
    mut requests: mpsc::Receiver<ResyncRequest>,
    events: mpsc::Sender<EngineEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(request) = requests.recv().await {
            let mut backoff_ms = 250u64;
            loop {
                match client
                    .fetch_book(&request.market_id, &request.token_id)
                    .await
                {
                    Ok(snapshot) => {
                        if events
                            .send(EngineEvent::Market(MarketEvent::Snapshot(snapshot)))
                            .await
                            .is_err()
                        {
                            return;
                        }
                        break;
                    }
                    Err(err) => {
                        warn!(
                            component = "rest",
                            market_id = %request.market_id,
                            token_id = %request.token_id,
                            error = %err,
                            "resync fetch failed; retrying"
                        );
                        tokio::time::sleep(std::time::Duration::from_millis(backoff_ms)).await;
                        backoff_ms = (backoff_ms * 2).min(8000);
                    }
                }
            }
        }
        info!(component = "rest", "resync worker stopped");
    })
}
