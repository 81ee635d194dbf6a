//! Risk and position accounting
//!
//! Three layers, all driven synchronously from the reactor thread:
//!
//! - [`asset::AssetRisks`] — one ledger per (user, asset, settlement
//!   date): balance accumulators in native and reporting-currency units
//!   plus the valuation-rate engine that converts between them.
//! - [`instr::InstrRisks`] — one record per (user, instrument): position,
//!   volume-weighted entry price, realized/unrealized PnL, outstanding
//!   order notional.
//! - [`manager::RiskMgr`] — the owning registries, event routing, and
//!   valuator installation.
//!
//! Ledger arithmetic is `f64` internally; fixed-point `Px`/`Qty` appear
//! only at the API edge. Data-validation failures are logged and the
//! update skipped — a live ledger with one stale entry beats a dead one —
//! while broken internal invariants surface as hard errors.

pub mod asset;
pub mod error;
pub mod instr;
pub mod manager;
pub mod rates;

pub use asset::{AssetRisks, BalanceKind, Bucket};
pub use error::RiskError;
pub use instr::{InstrRisks, TradeUpdate};
pub use manager::{InstrSpec, RiskMgr};
pub use rates::{is_valid_rate, BookDirectory, BookValuator, RateSource, Valuator};
