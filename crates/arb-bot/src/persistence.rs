//! Append-only SQLite store behind a dedicated writer thread.
//!
//! The core records through a bounded channel; the writer batches rows
//! into transactions. A full queue blocks the producer only up to the
//! configured deadline, after which the record is dropped with a counter
//! bump and an alert log. The schema is identical in live and backtest;
//! the backtest opens the store read-only.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use rust_decimal::Decimal;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::config::PersistenceConfig;
use crate::types::{ManagedOrder, Position};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ts_ms INTEGER NOT NULL,
    event_type TEXT NOT NULL,
    market_id TEXT,
    token_id TEXT,
    correlation_id TEXT,
    payload_json TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_events_ts ON events(ts_ms);
CREATE TABLE IF NOT EXISTS order_intents (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ts_ms INTEGER NOT NULL,
    market_id TEXT NOT NULL,
    token_id TEXT NOT NULL,
    intent_type TEXT NOT NULL,
    payload_json TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS orders (
    client_order_id TEXT PRIMARY KEY,
    venue_order_id TEXT,
    market_id TEXT NOT NULL,
    token_id TEXT NOT NULL,
    side TEXT NOT NULL,
    price TEXT NOT NULL,
    size TEXT NOT NULL,
    remaining_size TEXT NOT NULL,
    status TEXT NOT NULL,
    created_ts_ms INTEGER NOT NULL,
    last_update_ts_ms INTEGER NOT NULL,
    ttl_ms INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS fills (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ts_ms INTEGER NOT NULL,
    market_id TEXT NOT NULL,
    token_id TEXT NOT NULL,
    side TEXT NOT NULL,
    price TEXT NOT NULL,
    size TEXT NOT NULL,
    fee TEXT NOT NULL,
    venue_order_id TEXT,
    client_order_id TEXT
);
CREATE TABLE IF NOT EXISTS positions (
    key TEXT PRIMARY KEY,
    market_id TEXT NOT NULL,
    token_id TEXT NOT NULL,
    qty TEXT NOT NULL,
    avg_price TEXT NOT NULL,
    updated_ts_ms INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS pnl_snapshots (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ts_ms INTEGER NOT NULL,
    equity TEXT NOT NULL,
    drawdown TEXT NOT NULL,
    hourly_pnl TEXT NOT NULL,
    daily_pnl TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS latency_metrics (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ts_ms INTEGER NOT NULL,
    metric_key TEXT NOT NULL,
    p50 REAL NOT NULL,
    p95 REAL NOT NULL,
    p99 REAL NOT NULL,
    mean REAL NOT NULL
);
CREATE TABLE IF NOT EXISTS errors (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ts_ms INTEGER NOT NULL,
    component TEXT NOT NULL,
    error_kind TEXT NOT NULL,
    message TEXT NOT NULL,
    payload_json TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS book_snapshots (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ts_ms INTEGER NOT NULL,
    market_id TEXT NOT NULL,
    token_id TEXT NOT NULL,
    bids_json TEXT NOT NULL,
    asks_json TEXT NOT NULL
);
"#;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),
}

/// One row-to-be, shipped to the writer thread.
#[derive(Debug)]
pub enum PersistMessage {
    Event {
        ts: DateTime<Utc>,
        event_type: String,
        market_id: Option<String>,
        token_id: Option<String>,
        correlation_id: Option<String>,
        payload: Value,
    },
    Intent {
        ts: DateTime<Utc>,
        market_id: String,
        token_id: String,
        intent_type: String,
        payload: Value,
    },
    Order(Box<ManagedOrder>),
    Fill {
        ts: DateTime<Utc>,
        market_id: String,
        token_id: String,
        side: String,
        price: Decimal,
        size: Decimal,
        fee: Decimal,
        venue_order_id: Option<String>,
        client_order_id: Option<String>,
    },
    Position {
        ts: DateTime<Utc>,
        position: Position,
    },
    PnlSnapshot {
        ts: DateTime<Utc>,
        equity: Decimal,
        drawdown: Decimal,
        hourly_pnl: Decimal,
        daily_pnl: Decimal,
    },
    LatencyMetric {
        ts: DateTime<Utc>,
        metric_key: String,
        p50: f64,
        p95: f64,
        p99: f64,
        mean: f64,
    },
    BookSnapshot {
        ts: DateTime<Utc>,
        market_id: String,
        token_id: String,
        bids_json: String,
        asks_json: String,
    },
    Error {
        ts: DateTime<Utc>,
        component: String,
        error_kind: String,
        message: String,
        payload: Value,
    },
    Shutdown,
}

/// Producer-side handle. Cheap to clone; all methods are bounded-time.
#[derive(Clone)]
pub struct PersistenceHandle {
    tx: mpsc::Sender<PersistMessage>,
    deadline: std::time::Duration,
    dropped: Arc<AtomicU64>,
}

impl PersistenceHandle {
    /// Enqueue with the bounded-block-then-drop policy.
    pub async fn record(&self, message: PersistMessage) {
        match tokio::time::timeout(self.deadline, self.tx.send(message)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                warn!(component = "persistence", "writer gone; record dropped");
            }
            Err(_) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                error!(
                    component = "persistence",
                    error_kind = "persistence_backpressure",
                    dropped,
                    "store queue full past deadline; record dropped"
                );
            }
        }
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Flush and stop the writer. Await the join handle afterwards.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(PersistMessage::Shutdown).await;
    }
}

/// Open the store and spawn the writer thread.
pub fn spawn_writer(
    cfg: &PersistenceConfig,
) -> Result<(PersistenceHandle, std::thread::JoinHandle<()>), PersistenceError> {
    if let Some(parent) = Path::new(&cfg.db_path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let conn = Connection::open(&cfg.db_path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.execute_batch(SCHEMA)?;

    let (tx, rx) = mpsc::channel(cfg.queue_capacity.max(1));
    let handle = PersistenceHandle {
        tx,
        deadline: std::time::Duration::from_millis(cfg.enqueue_deadline_ms),
        dropped: Arc::new(AtomicU64::new(0)),
    };
    let join = std::thread::spawn(move || writer_loop(conn, rx));
    Ok((handle, join))
}

fn writer_loop(mut conn: Connection, mut rx: mpsc::Receiver<PersistMessage>) {
    loop {
        let Some(first) = rx.blocking_recv() else {
            break;
        };
        let mut batch = vec![first];
        while let Ok(next) = rx.try_recv() {
            batch.push(next);
            if batch.len() >= 512 {
                break;
            }
        }
        let stop = batch.iter().any(|m| matches!(m, PersistMessage::Shutdown));
        if let Err(err) = write_batch(&mut conn, batch) {
            error!(component = "persistence", error = %err, "batch write failed");
        }
        if stop {
            break;
        }
    }
    info!(component = "persistence", "writer stopped");
}

fn write_batch(
    conn: &mut Connection,
    batch: Vec<PersistMessage>,
) -> Result<(), PersistenceError> {
    let tx = conn.transaction()?;
    for message in batch {
        match message {
            PersistMessage::Event {
                ts,
                event_type,
                market_id,
                token_id,
                correlation_id,
                payload,
            } => {
                tx.execute(
                    "INSERT INTO events(ts_ms,event_type,market_id,token_id,correlation_id,payload_json) \
                     VALUES(?1,?2,?3,?4,?5,?6)",
                    params![
                        ts.timestamp_millis(),
                        event_type,
                        market_id,
                        token_id,
                        correlation_id,
                        payload.to_string()
                    ],
                )?;
            }
            PersistMessage::Intent {
                ts,
                market_id,
                token_id,
                intent_type,
                payload,
            } => {
                tx.execute(
                    "INSERT INTO order_intents(ts_ms,market_id,token_id,intent_type,payload_json) \
                     VALUES(?1,?2,?3,?4,?5)",
                    params![
                        ts.timestamp_millis(),
                        market_id,
                        token_id,
                        intent_type,
                        payload.to_string()
                    ],
                )?;
            }
            PersistMessage::Order(order) => {
                tx.execute(
                    "INSERT INTO orders(client_order_id,venue_order_id,market_id,token_id,side,price,size,\
                     remaining_size,status,created_ts_ms,last_update_ts_ms,ttl_ms) \
                     VALUES(?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12) \
                     ON CONFLICT(client_order_id) DO UPDATE SET \
                       venue_order_id=excluded.venue_order_id, \
                       remaining_size=excluded.remaining_size, \
                       status=excluded.status, \
                       last_update_ts_ms=excluded.last_update_ts_ms",
                    params![
                        order.client_order_id,
                        order.venue_order_id,
                        order.market_id,
                        order.token_id,
                        order.side.to_string(),
                        order.price.to_string(),
                        order.size.to_string(),
                        order.remaining_size.to_string(),
                        order.status.to_string(),
                        order.created_at.timestamp_millis(),
                        order.last_update_at.timestamp_millis(),
                        order.ttl_ms
                    ],
                )?;
            }
            PersistMessage::Fill {
                ts,
                market_id,
                token_id,
                side,
                price,
                size,
                fee,
                venue_order_id,
                client_order_id,
            } => {
                tx.execute(
                    "INSERT INTO fills(ts_ms,market_id,token_id,side,price,size,fee,venue_order_id,client_order_id) \
                     VALUES(?1,?2,?3,?4,?5,?6,?7,?8,?9)",
                    params![
                        ts.timestamp_millis(),
                        market_id,
                        token_id,
                        side,
                        price.to_string(),
                        size.to_string(),
                        fee.to_string(),
                        venue_order_id,
                        client_order_id
                    ],
                )?;
            }
            PersistMessage::Position { ts, position } => {
                tx.execute(
                    "INSERT INTO positions(key,market_id,token_id,qty,avg_price,updated_ts_ms) \
                     VALUES(?1,?2,?3,?4,?5,?6) \
                     ON CONFLICT(key) DO UPDATE SET \
                       qty=excluded.qty, avg_price=excluded.avg_price, \
                       updated_ts_ms=excluded.updated_ts_ms",
                    params![
                        format!("{}:{}", position.market_id, position.token_id),
                        position.market_id,
                        position.token_id,
                        position.qty.to_string(),
                        position.avg_price.to_string(),
                        ts.timestamp_millis()
                    ],
                )?;
            }
            PersistMessage::PnlSnapshot {
                ts,
                equity,
                drawdown,
                hourly_pnl,
                daily_pnl,
            } => {
                tx.execute(
                    "INSERT INTO pnl_snapshots(ts_ms,equity,drawdown,hourly_pnl,daily_pnl) \
                     VALUES(?1,?2,?3,?4,?5)",
                    params![
                        ts.timestamp_millis(),
                        equity.to_string(),
                        drawdown.to_string(),
                        hourly_pnl.to_string(),
                        daily_pnl.to_string()
                    ],
                )?;
            }
            PersistMessage::LatencyMetric {
                ts,
                metric_key,
                p50,
                p95,
                p99,
                mean,
            } => {
                tx.execute(
                    "INSERT INTO latency_metrics(ts_ms,metric_key,p50,p95,p99,mean) \
                     VALUES(?1,?2,?3,?4,?5,?6)",
                    params![ts.timestamp_millis(), metric_key, p50, p95, p99, mean],
                )?;
            }
            PersistMessage::BookSnapshot {
                ts,
                market_id,
                token_id,
                bids_json,
                asks_json,
            } => {
                tx.execute(
                    "INSERT INTO book_snapshots(ts_ms,market_id,token_id,bids_json,asks_json) \
                     VALUES(?1,?2,?3,?4,?5)",
                    params![
                        ts.timestamp_millis(),
                        market_id,
                        token_id,
                        bids_json,
                        asks_json
                    ],
                )?;
            }
            PersistMessage::Error {
                ts,
                component,
                error_kind,
                message,
                payload,
            } => {
                tx.execute(
                    "INSERT INTO errors(ts_ms,component,error_kind,message,payload_json) \
                     VALUES(?1,?2,?3,?4,?5)",
                    params![
                        ts.timestamp_millis(),
                        component,
                        error_kind,
                        message,
                        payload.to_string()
                    ],
                )?;
            }
            PersistMessage::Shutdown => {}
        }
    }
    tx.commit()?;
    Ok(())
}

/// An event row loaded back for replay.
#[derive(Debug, Clone)]
pub struct StoredEvent {
    pub ts: DateTime<Utc>,
    pub event_type: String,
    pub market_id: Option<String>,
    pub token_id: Option<String>,
    pub correlation_id: Option<String>,
    pub payload: Value,
}

/// Load the event log in ascending timestamp order (backtest input). The
/// store is opened read-only.
pub fn load_events_for_replay(
    db_path: &str,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
) -> Result<Vec<StoredEvent>, PersistenceError> {
    let conn = Connection::open_with_flags(
        db_path,
        rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY,
    )?;
    let mut sql = String::from(
        "SELECT ts_ms,event_type,market_id,token_id,correlation_id,payload_json \
         FROM events WHERE 1=1",
    );
    let mut bounds: Vec<i64> = Vec::new();
    if let Some(start) = start {
        sql.push_str(" AND ts_ms >= ?");
        bounds.push(start.timestamp_millis());
    }
    if let Some(end) = end {
        sql.push_str(" AND ts_ms <= ?");
        bounds.push(end.timestamp_millis());
    }
    sql.push_str(" ORDER BY ts_ms ASC, id ASC");

    let mut statement = conn.prepare(&sql)?;
    let rows = statement.query_map(rusqlite::params_from_iter(bounds), |row| {
        let ts_ms: i64 = row.get(0)?;
        let payload_json: String = row.get(5)?;
        Ok(StoredEvent {
            ts: DateTime::from_timestamp_millis(ts_ms).unwrap_or(DateTime::<Utc>::MIN_UTC),
            event_type: row.get(1)?,
            market_id: row.get(2)?,
            token_id: row.get(3)?,
            correlation_id: row.get(4)?,
            payload: serde_json::from_str(&payload_json).unwrap_or(Value::Null),
        })
    })?;
    let mut events = Vec::new();
    for row in rows {
        events.push(row?);
    }
    Ok(events)
}
