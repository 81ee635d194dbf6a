//! Per-instrument position and PnL tracking
//!
//! One `InstrRisks` per (user, instrument). A fill first updates the
//! instrument's own position/PnL state, then routes the implied asset
//! movements to the two leg ledgers: the base leg receives the signed
//! quantity, the quote leg the signed notional with opposite sign.
//!
//! Average entry price is volume-weighted across extensions only; a fill
//! that flips the position through zero starts the new position fresh at
//! the fill price rather than blending across the flat point.

use crate::asset::AssetRisks;
use crate::error::RiskError;
use peregrine_common::{Px, Qty, Side, Symbol, Ts, UserId};
use std::cell::RefCell;
use std::rc::Rc;
use tracing::debug;

/// Per-fill notification emitted to the owner. Carries the fill itself
/// and what it changed, so a consumer can reconcile executions without
/// diffing cumulative state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TradeUpdate {
    pub user: UserId,
    pub instrument: Symbol,
    pub trade_id: u64,
    pub side: Side,
    pub px: Px,
    pub qty: Qty,
    /// Position before this fill was applied
    pub prev_position: f64,
    /// This fill's realized PnL, fee included, in quote-native units
    pub realized_delta_native: f64,
    /// The same delta frozen at `valuation_rate`; NaN when no rate exists
    pub realized_delta_reporting: f64,
    /// Quote-leg valuation rate used for the conversion; NaN when
    /// unestablished
    pub valuation_rate: f64,
    pub ts: Ts,
}

/// Position, entry price, and PnL for one (user, instrument) pair
pub struct InstrRisks {
    user: UserId,
    instrument: Symbol,
    base: Rc<RefCell<AssetRisks>>,
    quote: Rc<RefCell<AssetRisks>>,
    /// Signed position in base units (+long, -short)
    position: f64,
    /// Volume-weighted entry price of the open position
    avg_entry_px: f64,
    /// Realized PnL in quote-native units, fees included
    realized_native: f64,
    /// Realized PnL converted at the quote rate in force at fill time
    realized_reporting: f64,
    /// Mark of the open position against the last fill price
    unrealized_native: f64,
    /// Quote notional of resting orders not yet filled
    outstanding_notional: f64,
    trade_count: u64,
    traded_volume: f64,
    update_cb: Option<Box<dyn FnMut(&TradeUpdate)>>,
}

impl std::fmt::Debug for InstrRisks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstrRisks")
            .field("user", &self.user)
            .field("instrument", &self.instrument)
            .field("position", &self.position)
            .field("avg_entry_px", &self.avg_entry_px)
            .field("realized_native", &self.realized_native)
            .field("unrealized_native", &self.unrealized_native)
            .field("outstanding_notional", &self.outstanding_notional)
            .field("trade_count", &self.trade_count)
            .finish_non_exhaustive()
    }
}

impl InstrRisks {
    #[must_use]
    pub fn new(
        user: UserId,
        instrument: Symbol,
        base: Rc<RefCell<AssetRisks>>,
        quote: Rc<RefCell<AssetRisks>>,
    ) -> Self {
        Self {
            user,
            instrument,
            base,
            quote,
            position: 0.0,
            avg_entry_px: 0.0,
            realized_native: 0.0,
            realized_reporting: 0.0,
            unrealized_native: 0.0,
            outstanding_notional: 0.0,
            trade_count: 0,
            traded_volume: 0.0,
            update_cb: None,
        }
    }

    pub fn set_update_callback(&mut self, cb: Box<dyn FnMut(&TradeUpdate)>) {
        self.update_cb = Some(cb);
    }

    #[must_use]
    pub fn instrument(&self) -> Symbol {
        self.instrument
    }

    #[must_use]
    pub fn position(&self) -> f64 {
        self.position
    }

    #[must_use]
    pub fn avg_entry_px(&self) -> f64 {
        self.avg_entry_px
    }

    #[must_use]
    pub fn realized_native(&self) -> f64 {
        self.realized_native
    }

    #[must_use]
    pub fn realized_reporting(&self) -> f64 {
        self.realized_reporting
    }

    #[must_use]
    pub fn unrealized_native(&self) -> f64 {
        self.unrealized_native
    }

    /// Unrealized PnL re-marked at the quote leg's current valuation
    /// rate (unlike realized, which freezes the rate at fill time).
    /// `NaN` when no quote rate has been established yet.
    #[must_use]
    pub fn unrealized_reporting(&self) -> f64 {
        let rate = self.quote.borrow().last_rate();
        if crate::rates::is_valid_rate(rate) {
            self.unrealized_native * rate
        } else {
            f64::NAN
        }
    }

    #[must_use]
    pub fn outstanding_notional(&self) -> f64 {
        self.outstanding_notional
    }

    #[must_use]
    pub fn trade_count(&self) -> u64 {
        self.trade_count
    }

    #[must_use]
    pub fn traded_volume(&self) -> f64 {
        self.traded_volume
    }

    /// A new resting order adds its quote notional to the outstanding
    /// exposure.
    pub fn on_order_open(&mut self, px: Px, qty: Qty) {
        self.outstanding_notional += px.as_f64() * qty.as_f64();
    }

    /// A cancel (or reject) releases the remaining notional. Clamped at
    /// zero since cancel-after-partial-fill reports can overlap.
    pub fn on_order_cancel(&mut self, px: Px, qty: Qty) {
        self.outstanding_notional =
            (self.outstanding_notional - px.as_f64() * qty.as_f64()).max(0.0);
    }

    /// Apply a fill and return its notional converted to the reporting
    /// currency (NaN until the quote leg has a valuation rate).
    ///
    /// Decomposes the fill into a reducing part (up to the opposing open
    /// position) and an extending part. The reducing part realizes
    /// `(px − avg_entry) × reduced` with the sign of the closed position;
    /// the extending part blends the entry price. The fee is always
    /// charged against realized PnL regardless of the split.
    pub fn on_trade(
        &mut self,
        trade_id: u64,
        side: Side,
        px: Px,
        qty: Qty,
        fee_native: f64,
        ts: Ts,
    ) -> f64 {
        let px_f = px.as_f64();
        let qty_f = qty.as_f64();
        #[allow(clippy::cast_precision_loss)]
        let signed = side.sign() as f64 * qty_f;
        let prev_position = self.position;

        let mut realized = -fee_native;
        let opposing = self.position * signed < 0.0;
        let reducing = if opposing { qty_f.min(self.position.abs()) } else { 0.0 };
        let extending = qty_f - reducing;

        if reducing > 0.0 {
            realized += (px_f - self.avg_entry_px) * reducing * self.position.signum();
        }

        let new_position = self.position + signed;
        if extending > 0.0 {
            let prior = self.position.abs() - reducing;
            if prior == 0.0 {
                // flat or flipped through zero: the new position opens at
                // the fill price, no blending across the flat point
                self.avg_entry_px = px_f;
            } else {
                self.avg_entry_px =
                    (self.avg_entry_px * prior + px_f * extending) / (prior + extending);
            }
        }
        self.position = new_position;

        self.realized_native += realized;
        // Conversion frozen at the rate in force when the PnL realizes,
        // not re-marked on later rate moves.
        let quote_rate = self.quote.borrow().last_rate();
        let rate_valid = crate::rates::is_valid_rate(quote_rate);
        let realized_reporting = if rate_valid { realized * quote_rate } else { f64::NAN };
        if rate_valid {
            self.realized_reporting += realized_reporting;
        }

        self.unrealized_native = if self.position == 0.0 {
            self.avg_entry_px = 0.0;
            0.0
        } else {
            (px_f - self.avg_entry_px) * self.position
        };

        self.outstanding_notional = (self.outstanding_notional - px_f * qty_f).max(0.0);
        self.trade_count += 1;
        self.traded_volume += qty_f;

        // Leg routing: the fill moves `signed` base units against
        // `-signed × px` quote units.
        self.base.borrow_mut().on_trade_delta(signed, ts);
        self.quote.borrow_mut().on_trade_delta(-signed * px_f, ts);

        debug!(
            user = %self.user,
            instrument = %self.instrument,
            trade_id,
            position = self.position,
            avg_px = self.avg_entry_px,
            realized = self.realized_native,
            "fill applied"
        );

        let update = TradeUpdate {
            user: self.user,
            instrument: self.instrument,
            trade_id,
            side,
            px,
            qty,
            prev_position,
            realized_delta_native: realized,
            realized_delta_reporting: realized_reporting,
            valuation_rate: if rate_valid { quote_rate } else { f64::NAN },
            ts,
        };
        if let Some(cb) = &mut self.update_cb {
            cb(&update);
        }

        if rate_valid {
            px_f * qty_f * quote_rate
        } else {
            f64::NAN
        }
    }

    /// Clear session-transient state while keeping the open position.
    /// Used on reconnect when resting orders are known to be gone.
    pub fn reset_transient(&mut self) {
        self.outstanding_notional = 0.0;
    }

    /// Flat position must carry no entry price and no unrealized mark.
    pub fn validate(&self) -> Result<(), RiskError> {
        if self.position == 0.0 && (self.avg_entry_px != 0.0 || self.unrealized_native != 0.0) {
            return Err(RiskError::Invariant(format!(
                "flat {} carries avg_px={} unrealized={}",
                self.instrument, self.avg_entry_px, self.unrealized_native
            )));
        }
        if self.outstanding_notional < 0.0 {
            return Err(RiskError::Invariant(format!(
                "negative outstanding notional on {}",
                self.instrument
            )));
        }
        Ok(())
    }
}
