//! Risk manager: registries and event routing
//!
//! `RiskMgr` owns every asset ledger and instrument record and routes
//! engine events to them. Asset records are created lazily on first
//! sighting; valuators are keyed by (asset, settlement date) so every
//! user's ledger for the same asset shares one rate configuration.
//!
//! Data-validation failures (non-positive price, zero quantity) are
//! logged and the event skipped. Structural problems — fills for an
//! instrument nobody registered — are hard errors.

use crate::asset::{AssetRisks, BalanceKind};
use crate::error::RiskError;
use crate::instr::{InstrRisks, TradeUpdate};
use crate::rates::{BookDirectory, Valuator};
use peregrine_common::{Px, Qty, SettlDate, Side, Symbol, Ts, UserId};
use rustc_hash::FxHashMap;
use std::cell::RefCell;
use std::rc::Rc;
use tracing::{info, warn};

type AssetKey = (Symbol, SettlDate);
type AssetMap = FxHashMap<AssetKey, Rc<RefCell<AssetRisks>>>;

/// Instrument definition supplied at registration
#[derive(Debug, Clone, Copy)]
pub struct InstrSpec {
    pub instrument: Symbol,
    pub base_asset: Symbol,
    pub quote_asset: Symbol,
    pub settl: SettlDate,
}

pub struct RiskMgr {
    /// Asset in which all reporting values are denominated
    reporting_asset: Symbol,
    assets: FxHashMap<UserId, AssetMap>,
    instruments: FxHashMap<UserId, FxHashMap<Symbol, InstrRisks>>,
    /// One valuator per (asset, settl); shared by every user's ledger
    valuators: FxHashMap<AssetKey, Valuator>,
}

impl RiskMgr {
    #[must_use]
    pub fn new(reporting_asset: Symbol) -> Self {
        Self {
            reporting_asset,
            assets: FxHashMap::default(),
            instruments: FxHashMap::default(),
            valuators: FxHashMap::default(),
        }
    }

    #[must_use]
    pub fn reporting_asset(&self) -> Symbol {
        self.reporting_asset
    }

    /// Fetch-or-create the ledger for (user, asset, settl). A new record
    /// picks up the shared valuator for its key if one is installed.
    pub fn asset(&mut self, user: UserId, asset: Symbol, settl: SettlDate) -> Rc<RefCell<AssetRisks>> {
        let reporting = asset == self.reporting_asset;
        let valuators = &self.valuators;
        let entry = self
            .assets
            .entry(user)
            .or_default()
            .entry((asset, settl))
            .or_insert_with(|| {
                let mut record = AssetRisks::new(user, asset, settl, reporting);
                if let Some(v) = valuators.get(&(asset, settl)) {
                    // a bound record never rejects installation
                    let _ = record.install_valuator(*v);
                }
                info!(%user, %asset, %settl, "asset ledger created");
                Rc::new(RefCell::new(record))
            });
        Rc::clone(entry)
    }

    /// Register an instrument for a user, wiring its base and quote legs
    /// to the shared asset ledgers. Re-registration replaces the record.
    pub fn register_instrument(&mut self, user: UserId, spec: InstrSpec) {
        let base = self.asset(user, spec.base_asset, spec.settl);
        let quote = self.asset(user, spec.quote_asset, spec.settl);
        let record = InstrRisks::new(user, spec.instrument, base, quote);
        self.instruments
            .entry(user)
            .or_default()
            .insert(spec.instrument, record);
        info!(%user, instrument = %spec.instrument, "instrument registered");
    }

    /// Attach a post-fill callback to one (user, instrument) record.
    pub fn set_update_callback(
        &mut self,
        user: UserId,
        instrument: Symbol,
        cb: Box<dyn FnMut(&TradeUpdate)>,
    ) -> Result<(), RiskError> {
        self.instr_mut(user, instrument)?.set_update_callback(cb);
        Ok(())
    }

    /// Install a valuator for every current and future ledger keyed by
    /// (asset, settl). Rejects a configuration whose identity does not
    /// match an already-bound record for that key.
    pub fn install_valuator(
        &mut self,
        asset: Symbol,
        settl: SettlDate,
        valuator: Valuator,
    ) -> Result<(), RiskError> {
        for per_user in self.assets.values() {
            if let Some(record) = per_user.get(&(asset, settl)) {
                let record = record.borrow();
                match (record.asset(), record.settl_date()) {
                    (Some(a), Some(s)) if a == asset && s == settl => {}
                    (Some(a), Some(s)) => {
                        return Err(RiskError::ShapeMismatch {
                            expected_asset: asset,
                            expected_settl: settl,
                            got_asset: a,
                            got_settl: s,
                        });
                    }
                    _ => return Err(RiskError::EmptyRecord),
                }
            }
        }
        self.valuators.insert((asset, settl), valuator);
        for per_user in self.assets.values_mut() {
            if let Some(record) = per_user.get(&(asset, settl)) {
                record.borrow_mut().install_valuator(valuator)?;
            }
        }
        info!(%asset, %settl, "valuator installed");
        Ok(())
    }

    /// Route a fill and return its reporting-currency size. Bad fill data
    /// is logged and skipped (size 0.0); an unregistered instrument is a
    /// hard error.
    #[allow(clippy::too_many_arguments)]
    pub fn on_trade(
        &mut self,
        trade_id: u64,
        user: UserId,
        instrument: Symbol,
        side: Side,
        px: Px,
        qty: Qty,
        fee_native: f64,
        ts: Ts,
    ) -> Result<f64, RiskError> {
        if px.as_i64() <= 0 || qty.is_zero() {
            warn!(%user, %instrument, %px, %qty, "dropping fill with invalid price/quantity");
            return Ok(0.0);
        }
        Ok(self
            .instr_mut(user, instrument)?
            .on_trade(trade_id, side, px, qty, fee_native, ts))
    }

    pub fn on_order_open(
        &mut self,
        user: UserId,
        instrument: Symbol,
        px: Px,
        qty: Qty,
    ) -> Result<(), RiskError> {
        if px.as_i64() <= 0 || qty.is_zero() {
            warn!(%user, %instrument, %px, %qty, "dropping order-open with invalid price/quantity");
            return Ok(());
        }
        self.instr_mut(user, instrument)?.on_order_open(px, qty);
        Ok(())
    }

    pub fn on_order_cancel(
        &mut self,
        user: UserId,
        instrument: Symbol,
        px: Px,
        qty: Qty,
    ) -> Result<(), RiskError> {
        self.instr_mut(user, instrument)?.on_order_cancel(px, qty);
        Ok(())
    }

    /// Route a balance report, creating the ledger on first sighting.
    pub fn on_balance_update(
        &mut self,
        user: UserId,
        asset: Symbol,
        settl: SettlDate,
        kind: BalanceKind,
        delta_native: f64,
        ts: Ts,
    ) {
        if !delta_native.is_finite() {
            warn!(%user, %asset, "dropping non-finite balance delta");
            return;
        }
        self.asset(user, asset, settl)
            .borrow_mut()
            .on_balance_update(kind, delta_native, ts);
    }

    /// A reference book ticked: revalue every ledger whose valuator
    /// sources it.
    pub fn on_order_book_tick(&mut self, book: Symbol, now: Ts, books: &dyn BookDirectory) {
        for per_user in self.assets.values_mut() {
            for record in per_user.values_mut() {
                let sourced = record.borrow().valuator().sources(book);
                if sourced {
                    record.borrow_mut().on_valuator_tick(now, books);
                }
            }
        }
    }

    /// Clear session-transient state (outstanding notionals) across all
    /// users after a connection loss.
    pub fn reset_transient(&mut self) {
        for per_user in self.instruments.values_mut() {
            for record in per_user.values_mut() {
                record.reset_transient();
            }
        }
    }

    #[must_use]
    pub fn instr(&self, user: UserId, instrument: Symbol) -> Option<&InstrRisks> {
        self.instruments.get(&user)?.get(&instrument)
    }

    fn instr_mut(&mut self, user: UserId, instrument: Symbol) -> Result<&mut InstrRisks, RiskError> {
        self.instruments
            .get_mut(&user)
            .and_then(|m| m.get_mut(&instrument))
            .ok_or(RiskError::UnknownInstrument { user, instrument })
    }
}
