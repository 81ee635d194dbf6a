//! Per-asset ledger and valuation-rate bookkeeping
//!
//! One `AssetRisks` per (user, asset symbol, settlement date). Every
//! balance bucket is carried twice: in asset-native units and in
//! reporting-currency (RC) units, plus an appreciation accumulator that
//! isolates the part of the RC value caused purely by rate drift. On a
//! rate change the RC values are rebuilt from `native × new_rate`, while
//! appreciation is incremented by `native × (new_rate − old_rate)` —
//! this is what lets reporting separate trading gains from currency
//! revaluation without replaying history.

use crate::error::RiskError;
use crate::rates::{is_valid_rate, BookDirectory, Valuator};
use peregrine_common::{SettlDate, Symbol, Ts, UserId};
use tracing::debug;

/// One balance bucket in native and reporting units
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Bucket {
    /// Asset-native units
    pub native: f64,
    /// Reporting-currency value (`native × last applied rate`)
    pub reporting: f64,
    /// RC value attributable purely to rate drift since first applied
    pub appreciation: f64,
}

impl Bucket {
    fn add(&mut self, delta: f64, rate: f64) {
        self.native += delta;
        if is_valid_rate(rate) {
            self.reporting += delta * rate;
        }
    }

    /// Apply a rate change: appreciation integrates the drift, the RC
    /// value is rebuilt from scratch, never incrementally adjusted.
    fn revalue(&mut self, old_rate: f64, new_rate: f64) {
        if is_valid_rate(old_rate) {
            self.appreciation += self.native * (new_rate - old_rate);
        }
        self.reporting = self.native * new_rate;
    }

    fn is_zero(&self) -> bool {
        self.native == 0.0 && self.reporting == 0.0 && self.appreciation == 0.0
    }
}

/// Classification of a balance report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalanceKind {
    /// Opening balance at epoch
    Initial,
    /// Internal transfer between accounts
    Transfer,
    /// External deposit or withdrawal
    Deposit,
    /// Borrowed funds
    Debt,
}

/// Per-(user, asset, settlement date) risk ledger
#[derive(Debug)]
pub struct AssetRisks {
    /// `None` marks the empty, unbound record
    identity: Option<(UserId, Symbol, SettlDate)>,
    is_reporting: bool,
    valuator: Valuator,
    pub initial: Bucket,
    pub trade_delta: Bucket,
    pub transfers: Bucket,
    pub deposits: Bucket,
    pub debt: Bucket,
    last_rate: f64,
    last_update: Ts,
    /// First-balance-seen timestamp
    epoch: Option<Ts>,
}

impl Default for AssetRisks {
    /// The empty record: unbound, all accumulators zero, rate invalid.
    fn default() -> Self {
        Self {
            identity: None,
            is_reporting: false,
            valuator: Valuator::Trivial,
            initial: Bucket::default(),
            trade_delta: Bucket::default(),
            transfers: Bucket::default(),
            deposits: Bucket::default(),
            debt: Bucket::default(),
            last_rate: f64::NAN,
            last_update: Ts::from_nanos(0),
            epoch: None,
        }
    }
}

impl AssetRisks {
    #[must_use]
    pub fn new(user: UserId, asset: Symbol, settl: SettlDate, is_reporting: bool) -> Self {
        Self {
            identity: Some((user, asset, settl)),
            is_reporting,
            // the reporting currency values at par from birth
            last_rate: if is_reporting { 1.0 } else { f64::NAN },
            ..Self::default()
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.identity.is_none()
    }

    #[must_use]
    pub fn asset(&self) -> Option<Symbol> {
        self.identity.map(|(_, a, _)| a)
    }

    #[must_use]
    pub fn settl_date(&self) -> Option<SettlDate> {
        self.identity.map(|(_, _, s)| s)
    }

    #[must_use]
    pub fn last_rate(&self) -> f64 {
        self.last_rate
    }

    #[must_use]
    pub fn last_update(&self) -> Ts {
        self.last_update
    }

    #[must_use]
    pub fn epoch(&self) -> Option<Ts> {
        self.epoch
    }

    #[must_use]
    pub fn valuator(&self) -> &Valuator {
        &self.valuator
    }

    /// Install (or replace) the valuator configuration.
    pub fn install_valuator(&mut self, valuator: Valuator) -> Result<(), RiskError> {
        if self.is_empty() {
            return Err(RiskError::EmptyRecord);
        }
        self.valuator = valuator;
        Ok(())
    }

    /// An unbound record must carry no state at all; checked, not
    /// assumed. (A bound record may still be numerically zero — it simply
    /// has not seen traffic yet.)
    pub fn validate_emptiness(&self) -> Result<(), RiskError> {
        let numerically_empty = self.initial.is_zero()
            && self.trade_delta.is_zero()
            && self.transfers.is_zero()
            && self.deposits.is_zero()
            && self.debt.is_zero()
            && self.last_rate.is_nan()
            && self.epoch.is_none();
        if self.is_empty() && !numerically_empty {
            return Err(RiskError::Invariant(
                "unbound asset record carries nonzero state".to_owned(),
            ));
        }
        Ok(())
    }

    /// Valuation rate of this asset against the reporting currency.
    ///
    /// The common hot path returns the cached rate; `full_recalc` forces
    /// recomputation from the configured source. When fresh computation
    /// fails, the last-known-good rate is returned even under
    /// `full_recalc` — a stale rate beats no rate for reporting — but this
    /// function never persists what it returns; that is the caller's
    /// decision, keeping "just computed" distinct from "remembered".
    #[must_use]
    pub fn get_valuation_rate(
        &self,
        now: Ts,
        full_recalc: bool,
        books: &dyn BookDirectory,
    ) -> Option<f64> {
        if !full_recalc && is_valid_rate(self.last_rate) {
            return Some(self.last_rate);
        }
        if self.is_reporting {
            return Some(1.0);
        }
        let computed = match &self.valuator {
            Valuator::Fixed(rate) => Some(*rate),
            Valuator::Trivial => None,
            Valuator::Books(v) => v.rate(now, books),
        };
        match computed {
            Some(rate) if is_valid_rate(rate) => Some(rate),
            _ => is_valid_rate(self.last_rate).then_some(self.last_rate),
        }
    }

    /// A reference book configured as this asset's valuator updated:
    /// recompute the rate and, if it moved, revalue every RC bucket.
    pub fn on_valuator_tick(&mut self, now: Ts, books: &dyn BookDirectory) {
        let Some(new_rate) = self.get_valuation_rate(now, true, books) else {
            debug!(asset = ?self.asset(), "no valuation rate available yet");
            return;
        };
        let old_rate = self.last_rate;
        if !is_valid_rate(old_rate) || new_rate != old_rate {
            self.initial.revalue(old_rate, new_rate);
            self.trade_delta.revalue(old_rate, new_rate);
            self.transfers.revalue(old_rate, new_rate);
            self.deposits.revalue(old_rate, new_rate);
            self.debt.revalue(old_rate, new_rate);
        }
        self.last_rate = new_rate;
        self.last_update = now;
    }

    /// Apply a balance report. The first sighting establishes the epoch.
    pub fn on_balance_update(&mut self, kind: BalanceKind, delta_native: f64, now: Ts) {
        if self.epoch.is_none() {
            self.epoch = Some(now);
        }
        let rate = self.last_rate;
        match kind {
            BalanceKind::Initial => self.initial.add(delta_native, rate),
            BalanceKind::Transfer => self.transfers.add(delta_native, rate),
            BalanceKind::Deposit => self.deposits.add(delta_native, rate),
            BalanceKind::Debt => self.debt.add(delta_native, rate),
        }
        self.last_update = now;
    }

    /// Trade routing: a fill moved `delta_native` units of this asset.
    pub fn on_trade_delta(&mut self, delta_native: f64, now: Ts) {
        if self.epoch.is_none() {
            self.epoch = Some(now);
        }
        self.trade_delta.add(delta_native, self.last_rate);
        self.last_update = now;
    }
}
