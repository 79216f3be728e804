//! Provider adapter implementations.

mod alpaca;
mod fixture;
mod yahoo;

pub use alpaca::AlpacaAdapter;
pub use fixture::{synthetic_series, FixtureAdapter};
pub use yahoo::YahooAdapter;
