//! Valuation-rate sources
//!
//! Assets are valued against the reporting currency through a `Valuator`:
//! an administratively fixed rate, or a rate derived from one or two
//! reference order books seen through the narrow [`RateSource`] view. The
//! book mid is the geometric mean of best bid and ask because it is
//! invariant under price inversion — which matters since the quoting
//! direction (asset/reporting vs reporting/asset) depends on which side
//! of the pair is the base asset.

use peregrine_common::{Symbol, Ts};

/// A rate must be finite and strictly positive to be usable.
#[must_use]
pub fn is_valid_rate(rate: f64) -> bool {
    rate.is_finite() && rate > 0.0
}

/// Best bid/ask view of a reference order book. The depth structure
/// itself lives in the market-data subsystem; valuation needs only the
/// touch.
pub trait RateSource {
    fn best_bid(&self) -> Option<f64>;
    fn best_ask(&self) -> Option<f64>;
}

/// Lookup from book symbol to its live [`RateSource`].
pub trait BookDirectory {
    fn book(&self, symbol: Symbol) -> Option<&dyn RateSource>;
}

/// Order-book-derived rate configuration
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BookValuator {
    /// Book consulted before the rollover instant (or always, without one)
    pub primary: Symbol,
    /// Book consulted from the rollover instant onward
    pub secondary: Option<Symbol>,
    /// Intra-day switch instant between primary and secondary, e.g. a
    /// settlement cutoff separating today/tomorrow funding rates
    pub rollover: Option<Ts>,
    /// Additive adjustment applied to the best bid
    pub bid_adjust: f64,
    /// Additive adjustment applied to the best ask
    pub ask_adjust: f64,
    /// Book quotes reporting/asset instead of asset/reporting
    pub inverse: bool,
}

impl BookValuator {
    #[must_use]
    pub fn direct(book: Symbol) -> Self {
        Self {
            primary: book,
            secondary: None,
            rollover: None,
            bid_adjust: 0.0,
            ask_adjust: 0.0,
            inverse: false,
        }
    }

    /// True if `symbol` is one of this valuator's source books.
    #[must_use]
    pub fn sources(&self, symbol: Symbol) -> bool {
        self.primary == symbol || self.secondary == Some(symbol)
    }

    /// Book active at `now`, honoring the rollover instant.
    #[must_use]
    pub fn active_book(&self, now: Ts) -> Symbol {
        match (self.secondary, self.rollover) {
            (Some(secondary), Some(rollover)) if now.as_nanos() >= rollover.as_nanos() => secondary,
            _ => self.primary,
        }
    }

    /// Compute the rate from the active book, or `None` when the book is
    /// missing a side (or the book itself).
    #[must_use]
    pub fn rate(&self, now: Ts, books: &dyn BookDirectory) -> Option<f64> {
        let book = books.book(self.active_book(now))?;
        let bid = book.best_bid()? + self.bid_adjust;
        let ask = book.best_ask()? + self.ask_adjust;
        if bid <= 0.0 || ask <= 0.0 {
            return None;
        }
        let mid = (bid * ask).sqrt();
        let rate = if self.inverse { 1.0 / mid } else { mid };
        is_valid_rate(rate).then_some(rate)
    }
}

/// How an asset converts to the reporting currency
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Valuator {
    /// No market source configured; only last-known-good rates apply
    Trivial,
    /// Administratively fixed rate; takes precedence over market sources
    Fixed(f64),
    /// One or two reference order books
    Books(BookValuator),
}

impl Valuator {
    /// True if `symbol` feeds this valuator.
    #[must_use]
    pub fn sources(&self, symbol: Symbol) -> bool {
        match self {
            Self::Books(v) => v.sources(symbol),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubBook {
        bid: Option<f64>,
        ask: Option<f64>,
    }

    impl RateSource for StubBook {
        fn best_bid(&self) -> Option<f64> {
            self.bid
        }
        fn best_ask(&self) -> Option<f64> {
            self.ask
        }
    }

    struct OneBook(Symbol, StubBook);

    impl BookDirectory for OneBook {
        fn book(&self, symbol: Symbol) -> Option<&dyn RateSource> {
            (symbol == self.0).then_some(&self.1 as &dyn RateSource)
        }
    }

    const BOOK: Symbol = Symbol(7);

    #[test]
    fn geometric_mid_is_inversion_invariant() {
        let direct = OneBook(BOOK, StubBook { bid: Some(40_000.0), ask: Some(40_100.0) });
        let inverted = OneBook(
            BOOK,
            StubBook {
                bid: Some(1.0 / 40_100.0),
                ask: Some(1.0 / 40_000.0),
            },
        );
        let v_direct = BookValuator::direct(BOOK);
        let v_inverse = BookValuator {
            inverse: true,
            ..BookValuator::direct(BOOK)
        };
        let a = v_direct.rate(Ts::from_nanos(0), &direct).expect("direct");
        let b = v_inverse.rate(Ts::from_nanos(0), &inverted).expect("inverse");
        assert!((a - b).abs() / a < 1e-12, "{a} vs {b}");
    }

    #[test]
    fn missing_side_yields_none() {
        let dir = OneBook(BOOK, StubBook { bid: Some(100.0), ask: None });
        assert!(BookValuator::direct(BOOK).rate(Ts::from_nanos(0), &dir).is_none());
    }

    #[test]
    fn rollover_switches_books() {
        let v = BookValuator {
            primary: Symbol(1),
            secondary: Some(Symbol(2)),
            rollover: Some(Ts::from_secs(100)),
            ..BookValuator::direct(Symbol(1))
        };
        assert_eq!(v.active_book(Ts::from_secs(99)), Symbol(1));
        assert_eq!(v.active_book(Ts::from_secs(100)), Symbol(2));
        assert!(v.sources(Symbol(1)));
        assert!(v.sources(Symbol(2)));
        assert!(!v.sources(Symbol(3)));
    }

    #[test]
    fn adjustments_apply_before_mid() {
        let dir = OneBook(BOOK, StubBook { bid: Some(99.0), ask: Some(101.0) });
        let v = BookValuator {
            bid_adjust: 1.0,
            ask_adjust: -1.0,
            ..BookValuator::direct(BOOK)
        };
        let rate = v.rate(Ts::from_nanos(0), &dir).expect("rate");
        assert!((rate - 100.0).abs() < 1e-9);
    }

    #[test]
    fn negative_adjusted_side_is_rejected() {
        let dir = OneBook(BOOK, StubBook { bid: Some(0.5), ask: Some(1.0) });
        let v = BookValuator {
            bid_adjust: -1.0,
            ..BookValuator::direct(BOOK)
        };
        assert!(v.rate(Ts::from_nanos(0), &dir).is_none());
    }
}
