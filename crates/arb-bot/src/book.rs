//! Order book state per token: sorted top-N levels, strictly monotone venue
//! sequences, and gap-driven resync.
//!
//! A sequence gap puts the token into a resyncing state: deltas are buffered,
//! top-of-book reads return nothing, and a REST snapshot is requested. Once a
//! snapshot covering the gap arrives, buffered deltas at or below its
//! sequence are discarded and the rest are replayed in order.

use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use thiserror::Error;
use tracing::warn;

use arb_common::{PriceLevel, Side};

use crate::types::{BookDelta, BookSnapshot};

/// Upper bound on deltas buffered while waiting for a resync snapshot.
const RESYNC_BUFFER_CAP: usize = 4096;

#[derive(Debug, Error)]
pub enum BookError {
    #[error("crossed book for {token_id}: bid {bid} >= ask {ask}")]
    Crossed {
        token_id: String,
        bid: Decimal,
        ask: Decimal,
    },
    #[error("negative size in book update for {token_id}")]
    NegativeSize { token_id: String },
}

/// What applying an event did to the book.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Delta applied in sequence, or snapshot installed.
    Applied,
    /// Event at or below the stored sequence; dropped.
    Stale,
    /// A gap was detected; the token is now resyncing and wants a snapshot.
    ResyncStarted,
    /// Token is already resyncing; the delta was buffered.
    Buffered,
}

/// VWAP quote for a requested size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepthQuote {
    /// Size-weighted average price over the consumed levels.
    pub vwap: Decimal,
    /// Price of the deepest level consumed; a limit at this price is
    /// marketable for the whole fillable quantity.
    pub limit_price: Decimal,
    /// How much of the requested size the book can absorb.
    pub fillable: Decimal,
}

#[derive(Debug)]
enum SyncState {
    Synced,
    Resyncing {
        /// Sequence of the first delta observed past the hole.
        boundary: u64,
        buffered: VecDeque<BookDelta>,
    },
}

/// Book state for a single token.
#[derive(Debug)]
pub struct TokenBook {
    pub market_id: String,
    pub token_id: String,
    bids: Vec<PriceLevel>,
    asks: Vec<PriceLevel>,
    sequence: u64,
    updated_at: DateTime<Utc>,
    depth: usize,
    sync: SyncState,
}

impl TokenBook {
    fn new(market_id: String, token_id: String, depth: usize) -> Self {
        Self {
            market_id,
            token_id,
            bids: Vec::new(),
            asks: Vec::new(),
            sequence: 0,
            updated_at: DateTime::<Utc>::MIN_UTC,
            depth,
            sync: SyncState::Resyncing {
                boundary: 0,
                buffered: VecDeque::new(),
            },
        }
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn is_resyncing(&self) -> bool {
        matches!(self.sync, SyncState::Resyncing { .. })
    }

    /// Current bid levels, best first. Empty while resyncing.
    pub fn bids(&self) -> &[PriceLevel] {
        if self.is_resyncing() {
            return &[];
        }
        &self.bids
    }

    /// Current ask levels, best first. Empty while resyncing.
    pub fn asks(&self) -> &[PriceLevel] {
        if self.is_resyncing() {
            return &[];
        }
        &self.asks
    }

    /// Best bid, unavailable while resyncing.
    pub fn best_bid(&self) -> Option<&PriceLevel> {
        if self.is_resyncing() {
            return None;
        }
        self.bids.first()
    }

    /// Best ask, unavailable while resyncing.
    pub fn best_ask(&self) -> Option<&PriceLevel> {
        if self.is_resyncing() {
            return None;
        }
        self.asks.first()
    }

    /// Walk the book to quote a size. `side` is the taker side: a buy
    /// consumes asks, a sell consumes bids.
    pub fn depth_for_size(&self, side: Side, size: Decimal) -> Option<DepthQuote> {
        if self.is_resyncing() || size <= Decimal::ZERO {
            return None;
        }
        let levels = match side {
            Side::Buy => &self.asks,
            Side::Sell => &self.bids,
        };
        if levels.is_empty() {
            return None;
        }
        let mut remaining = size;
        let mut notional = Decimal::ZERO;
        let mut filled = Decimal::ZERO;
        let mut limit_price = levels[0].price;
        for level in levels {
            let take = level.size.min(remaining);
            notional += take * level.price;
            filled += take;
            remaining -= take;
            limit_price = level.price;
            if remaining <= Decimal::ZERO {
                break;
            }
        }
        if filled <= Decimal::ZERO {
            return None;
        }
        Some(DepthQuote {
            vwap: notional / filled,
            limit_price,
            fillable: filled,
        })
    }

    fn install(&mut self, snapshot: &BookSnapshot) -> Result<(), BookError> {
        let mut bids = snapshot.bids.clone();
        let mut asks = snapshot.asks.clone();
        for level in bids.iter().chain(asks.iter()) {
            if level.size < Decimal::ZERO {
                return Err(BookError::NegativeSize {
                    token_id: self.token_id.clone(),
                });
            }
        }
        bids.retain(|l| l.size > Decimal::ZERO);
        asks.retain(|l| l.size > Decimal::ZERO);
        bids.sort_by(|a, b| b.price.cmp(&a.price));
        asks.sort_by(|a, b| a.price.cmp(&b.price));
        bids.truncate(self.depth);
        asks.truncate(self.depth);
        if let (Some(bid), Some(ask)) = (bids.first(), asks.first()) {
            if bid.price >= ask.price {
                return Err(BookError::Crossed {
                    token_id: self.token_id.clone(),
                    bid: bid.price,
                    ask: ask.price,
                });
            }
        }
        self.bids = bids;
        self.asks = asks;
        self.sequence = snapshot.sequence;
        self.updated_at = snapshot.captured_at;
        Ok(())
    }

    fn apply_changes(&mut self, delta: &BookDelta) -> Result<(), BookError> {
        for change in &delta.changes {
            if change.size < Decimal::ZERO {
                return Err(BookError::NegativeSize {
                    token_id: self.token_id.clone(),
                });
            }
            let (levels, descending) = match change.side {
                Side::Buy => (&mut self.bids, true),
                Side::Sell => (&mut self.asks, false),
            };
            match levels.iter().position(|l| l.price == change.price) {
                Some(idx) => {
                    if change.size == Decimal::ZERO {
                        levels.remove(idx);
                    } else {
                        levels[idx].size = change.size;
                    }
                }
                None if change.size > Decimal::ZERO => {
                    let idx = levels
                        .iter()
                        .position(|l| {
                            if descending {
                                l.price < change.price
                            } else {
                                l.price > change.price
                            }
                        })
                        .unwrap_or(levels.len());
                    levels.insert(idx, PriceLevel::new(change.price, change.size));
                    levels.truncate(self.depth);
                }
                None => {}
            }
        }
        if let (Some(bid), Some(ask)) = (self.bids.first(), self.asks.first()) {
            if bid.price >= ask.price {
                return Err(BookError::Crossed {
                    token_id: self.token_id.clone(),
                    bid: bid.price,
                    ask: ask.price,
                });
            }
        }
        self.sequence = delta.sequence;
        self.updated_at = delta.captured_at;
        Ok(())
    }

    fn enter_resync(&mut self, boundary: u64) {
        self.sync = SyncState::Resyncing {
            boundary,
            buffered: VecDeque::new(),
        };
    }

    fn apply_snapshot(&mut self, snapshot: &BookSnapshot, seq_tolerance: u64) -> Result<ApplyOutcome, BookError> {
        let drained = match &mut self.sync {
            SyncState::Resyncing { boundary, buffered } => {
                // The snapshot must reach the gap boundary before reads
                // are allowed again.
                if snapshot.sequence + 1 < *boundary {
                    return Ok(ApplyOutcome::Stale);
                }
                Some(std::mem::take(buffered))
            }
            SyncState::Synced => None,
        };
        match drained {
            Some(buffered) => {
                let mut pending: Vec<BookDelta> = buffered
                    .into_iter()
                    .filter(|d| d.sequence > snapshot.sequence)
                    .collect();
                pending.sort_by_key(|d| d.sequence);
                self.install(snapshot)?;
                self.sync = SyncState::Synced;
                for delta in pending {
                    if delta.sequence <= self.sequence {
                        continue;
                    }
                    if delta.sequence != self.sequence + 1 {
                        // Hole inside the buffered run; resync again.
                        self.enter_resync(delta.sequence);
                        return Ok(ApplyOutcome::ResyncStarted);
                    }
                    self.apply_changes(&delta)?;
                }
                Ok(ApplyOutcome::Applied)
            }
            None => {
                if snapshot.sequence <= self.sequence {
                    // Periodic snapshots only override on real divergence.
                    if self.sequence - snapshot.sequence > seq_tolerance {
                        self.install(snapshot)?;
                        return Ok(ApplyOutcome::Applied);
                    }
                    return Ok(ApplyOutcome::Stale);
                }
                self.install(snapshot)?;
                Ok(ApplyOutcome::Applied)
            }
        }
    }

    fn apply_delta(&mut self, delta: BookDelta) -> Result<ApplyOutcome, BookError> {
        if let SyncState::Resyncing { buffered, .. } = &mut self.sync {
            if buffered.len() >= RESYNC_BUFFER_CAP {
                buffered.pop_front();
            }
            buffered.push_back(delta);
            return Ok(ApplyOutcome::Buffered);
        }
        if delta.sequence <= self.sequence {
            return Ok(ApplyOutcome::Stale);
        }
        if delta.sequence != self.sequence + 1 {
            self.enter_resync(delta.sequence);
            return Ok(ApplyOutcome::ResyncStarted);
        }
        self.apply_changes(&delta)?;
        Ok(ApplyOutcome::Applied)
    }
}

/// All token books, keyed by (market, token).
#[derive(Debug)]
pub struct BookStore {
    books: BTreeMap<(String, String), TokenBook>,
    depth: usize,
    seq_tolerance: u64,
}

impl BookStore {
    pub fn new(depth: usize, seq_tolerance: u64) -> Self {
        Self {
            books: BTreeMap::new(),
            depth,
            seq_tolerance,
        }
    }

    pub fn get(&self, market_id: &str, token_id: &str) -> Option<&TokenBook> {
        self.books
            .get(&(market_id.to_string(), token_id.to_string()))
    }

    fn entry(&mut self, market_id: &str, token_id: &str) -> &mut TokenBook {
        self.books
            .entry((market_id.to_string(), token_id.to_string()))
            .or_insert_with(|| {
                TokenBook::new(market_id.to_string(), token_id.to_string(), self.depth)
            })
    }

    /// Apply a full snapshot. Anomalies (crossed/negative) degrade to a
    /// fresh resync rather than poisoning reads.
    pub fn apply_snapshot(&mut self, snapshot: &BookSnapshot) -> ApplyOutcome {
        let tolerance = self.seq_tolerance;
        let book = self.entry(&snapshot.market_id, &snapshot.token_id);
        match book.apply_snapshot(snapshot, tolerance) {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(
                    component = "book",
                    market_id = %snapshot.market_id,
                    token_id = %snapshot.token_id,
                    error = %err,
                    "snapshot anomaly; resyncing"
                );
                book.enter_resync(snapshot.sequence + 1);
                ApplyOutcome::ResyncStarted
            }
        }
    }

    /// Apply a delta. Returns `ResyncStarted` when the caller must schedule
    /// a REST snapshot for this token.
    pub fn apply_delta(&mut self, delta: BookDelta) -> ApplyOutcome {
        let market_id = delta.market_id.clone();
        let token_id = delta.token_id.clone();
        let sequence = delta.sequence;
        let book = self.entry(&market_id, &token_id);
        match book.apply_delta(delta) {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(
                    component = "book",
                    market_id = %market_id,
                    token_id = %token_id,
                    error = %err,
                    "delta anomaly; resyncing"
                );
                book.enter_resync(sequence + 1);
                ApplyOutcome::ResyncStarted
            }
        }
    }

    /// Force a token into the resyncing state (reconnects, startup).
    pub fn mark_resyncing(&mut self, market_id: &str, token_id: &str) {
        let book = self.entry(market_id, token_id);
        let boundary = book.sequence + 1;
        book.enter_resync(boundary);
    }

    pub fn tokens(&self) -> impl Iterator<Item = (&str, &str)> {
        self.books
            .keys()
            .map(|(market, token)| (market.as_str(), token.as_str()))
    }
}
