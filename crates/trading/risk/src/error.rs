//! Risk core errors
//!
//! Only logic errors live here. Bad input data (non-positive price, zero
//! quantity, mismatched instrument legs) is logged and skipped by the
//! manager rather than raised, so one malformed report cannot take the
//! ledger down.

use peregrine_common::{SettlDate, Symbol, UserId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RiskError {
    /// Method called on an unbound (empty) record
    #[error("operation on empty asset record")]
    EmptyRecord,

    /// Valuator sharing requested across records of different shape
    #[error("valuator shape mismatch: expected ({expected_asset}, {expected_settl}), got ({got_asset}, {got_settl})")]
    ShapeMismatch {
        expected_asset: Symbol,
        expected_settl: SettlDate,
        got_asset: Symbol,
        got_settl: SettlDate,
    },

    /// No such instrument registered for this user
    #[error("instrument {instrument} not registered for user {user}")]
    UnknownInstrument { user: UserId, instrument: Symbol },

    /// A broken internal invariant; indicates a bug, not bad input
    #[error("invariant violation: {0}")]
    Invariant(String),
}
