//! Symbol reference data consulted before any provider call.

use std::collections::HashMap;
use std::sync::RwLock;

use time::Date;

use crate::{AssetClass, Symbol, SymbolMeta};

pub trait ReferenceData: Send + Sync {
    /// Whether bars may be ingested for `symbol` as of `date`.
    fn is_valid_symbol(&self, symbol: &Symbol, date: Date) -> bool;
}

/// Accepts every well-formed symbol.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAllSymbols;

impl ReferenceData for AllowAllSymbols {
    fn is_valid_symbol(&self, _symbol: &Symbol, _date: Date) -> bool {
        true
    }
}

/// In-memory catalog of known symbols.
#[derive(Debug, Default)]
pub struct SymbolCatalog {
    entries: RwLock<HashMap<Symbol, SymbolMeta>>,
}

impl SymbolCatalog {
    pub fn new(entries: impl IntoIterator<Item = SymbolMeta>) -> Self {
        let catalog = Self::default();
        for meta in entries {
            catalog.upsert(meta);
        }
        catalog
    }

    pub fn upsert(&self, meta: SymbolMeta) {
        self.entries
            .write()
            .expect("symbol catalog should not be poisoned")
            .insert(meta.symbol.clone(), meta);
    }

    pub fn get(&self, symbol: &Symbol) -> Option<SymbolMeta> {
        self.entries
            .read()
            .expect("symbol catalog should not be poisoned")
            .get(symbol)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .expect("symbol catalog should not be poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sorted symbols matching every given filter. `None` matches anything.
    pub fn symbols(
        &self,
        asset_class: Option<AssetClass>,
        exchange: Option<&str>,
        active_only: bool,
    ) -> Vec<Symbol> {
        let entries = self
            .entries
            .read()
            .expect("symbol catalog should not be poisoned");
        let mut symbols = entries
            .values()
            .filter(|meta| asset_class.map_or(true, |class| meta.asset_class == class))
            .filter(|meta| {
                exchange.map_or(true, |wanted| {
                    meta.exchange
                        .as_deref()
                        .is_some_and(|listed| listed.eq_ignore_ascii_case(wanted))
                })
            })
            .filter(|meta| !active_only || meta.is_active)
            .map(|meta| meta.symbol.clone())
            .collect::<Vec<_>>();
        symbols.sort();
        symbols
    }
}

impl ReferenceData for SymbolCatalog {
    fn is_valid_symbol(&self, symbol: &Symbol, date: Date) -> bool {
        self.entries
            .read()
            .expect("symbol catalog should not be poisoned")
            .get(symbol)
            .is_some_and(|meta| meta.is_active && meta.is_listed_on(date))
    }
}

#[cfg(test)]
mod tests {
    use time::macros::date;

    use super::*;

    fn meta(symbol: &str) -> SymbolMeta {
        SymbolMeta::new(
            Symbol::parse(symbol).expect("symbol"),
            symbol,
            AssetClass::Equity,
            "USD",
        )
        .expect("meta")
    }

    #[test]
    fn catalog_rejects_unknown_inactive_and_unlisted() {
        let mut inactive = meta("OLD");
        inactive.is_active = false;
        let mut ipo = meta("NEW");
        ipo.listed_on = Some(date!(2024 - 06 - 01));
        let catalog = SymbolCatalog::new([meta("AAPL"), inactive, ipo]);
        let today = date!(2024 - 03 - 01);

        assert!(catalog.is_valid_symbol(&Symbol::parse("AAPL").expect("aapl"), today));
        assert!(!catalog.is_valid_symbol(&Symbol::parse("OLD").expect("old"), today));
        assert!(!catalog.is_valid_symbol(&Symbol::parse("NEW").expect("new"), today));
        assert!(!catalog.is_valid_symbol(&Symbol::parse("ZZZZ").expect("zzzz"), today));
        assert_eq!(catalog.len(), 3);
    }

    #[test]
    fn symbols_filter_by_class_exchange_and_activity_in_order() {
        let mut msft = meta("MSFT");
        msft.exchange = Some(String::from("NASDAQ"));
        let mut aapl = meta("AAPL");
        aapl.exchange = Some(String::from("NASDAQ"));
        let mut ibm = meta("IBM");
        ibm.exchange = Some(String::from("NYSE"));
        let mut spy = meta("SPY");
        spy.asset_class = AssetClass::Etf;
        spy.exchange = Some(String::from("NYSE"));
        let mut dead = meta("DEAD");
        dead.exchange = Some(String::from("NASDAQ"));
        dead.is_active = false;
        let catalog = SymbolCatalog::new([msft, aapl, ibm, spy, dead]);
        let names = |symbols: Vec<Symbol>| {
            symbols
                .iter()
                .map(|symbol| symbol.as_str().to_owned())
                .collect::<Vec<_>>()
        };

        assert_eq!(
            names(catalog.symbols(None, None, false)),
            ["AAPL", "DEAD", "IBM", "MSFT", "SPY"]
        );
        assert_eq!(
            names(catalog.symbols(Some(AssetClass::Equity), Some("nasdaq"), true)),
            ["AAPL", "MSFT"]
        );
        assert_eq!(
            names(catalog.symbols(Some(AssetClass::Etf), None, true)),
            ["SPY"]
        );
        assert!(catalog
            .symbols(Some(AssetClass::Crypto), None, false)
            .is_empty());
    }

    #[test]
    fn allow_all_accepts_anything_parsed() {
        assert!(AllowAllSymbols.is_valid_symbol(
            &Symbol::parse("ANY").expect("symbol"),
            date!(2024 - 01 - 01)
        ));
    }
}
