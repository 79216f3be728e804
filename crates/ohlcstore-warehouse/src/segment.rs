//! Columnar encoding of compressed chunk segments.
//!
//! A segment holds every bar of one `(chunk, symbol, timeframe)` ordered by
//! time descending. Timestamps are stored as the newest value followed by
//! positive deltas; the provider tag is dictionary-encoded.

use serde::{Deserialize, Serialize};

use crate::models::BarRow;
use crate::WarehouseError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentPayload {
    first_ts_us: i64,
    ts_deltas: Vec<i64>,
    open: Vec<f64>,
    high: Vec<f64>,
    low: Vec<f64>,
    close: Vec<f64>,
    volume: Vec<i64>,
    trade_count: Vec<Option<i64>>,
    vwap: Vec<Option<f64>>,
    sources: Vec<String>,
    source_index: Vec<u16>,
}

impl SegmentPayload {
    /// Build a payload from the bars of one segment, in any order.
    ///
    /// # Errors
    /// Returns an error when `rows` is empty or holds more than `u16::MAX`
    /// distinct sources.
    pub fn encode(rows: &[BarRow]) -> Result<Self, WarehouseError> {
        let mut ordered: Vec<&BarRow> = rows.iter().collect();
        ordered.sort_by(|left, right| right.ts_us.cmp(&left.ts_us));

        let Some(first) = ordered.first() else {
            return Err(WarehouseError::InvalidInput(String::from(
                "cannot encode an empty segment",
            )));
        };

        let mut payload = Self {
            first_ts_us: first.ts_us,
            ts_deltas: Vec::with_capacity(ordered.len().saturating_sub(1)),
            open: Vec::with_capacity(ordered.len()),
            high: Vec::with_capacity(ordered.len()),
            low: Vec::with_capacity(ordered.len()),
            close: Vec::with_capacity(ordered.len()),
            volume: Vec::with_capacity(ordered.len()),
            trade_count: Vec::with_capacity(ordered.len()),
            vwap: Vec::with_capacity(ordered.len()),
            sources: Vec::new(),
            source_index: Vec::with_capacity(ordered.len()),
        };

        let mut previous_ts = first.ts_us;
        for (position, row) in ordered.iter().enumerate() {
            if position > 0 {
                payload.ts_deltas.push(previous_ts - row.ts_us);
                previous_ts = row.ts_us;
            }
            payload.open.push(row.open);
            payload.high.push(row.high);
            payload.low.push(row.low);
            payload.close.push(row.close);
            payload.volume.push(row.volume);
            payload.trade_count.push(row.trade_count);
            payload.vwap.push(row.vwap);

            let index = match payload.sources.iter().position(|source| *source == row.source) {
                Some(index) => index,
                None => {
                    payload.sources.push(row.source.clone());
                    payload.sources.len() - 1
                }
            };
            let index = u16::try_from(index).map_err(|_| {
                WarehouseError::InvalidInput(String::from("too many distinct sources in segment"))
            })?;
            payload.source_index.push(index);
        }

        Ok(payload)
    }

    /// Number of bars in the segment.
    #[must_use]
    pub fn len(&self) -> usize {
        self.open.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.open.is_empty()
    }

    /// Newest timestamp in the segment.
    #[must_use]
    pub fn max_ts_us(&self) -> i64 {
        self.first_ts_us
    }

    /// Oldest timestamp in the segment.
    #[must_use]
    pub fn min_ts_us(&self) -> i64 {
        self.first_ts_us - self.ts_deltas.iter().sum::<i64>()
    }

    /// Expand back into rows, newest first.
    ///
    /// # Errors
    /// Returns an error when the column lengths disagree.
    pub fn decode(&self, symbol: &str, timeframe: &str) -> Result<Vec<BarRow>, WarehouseError> {
        let len = self.len();
        let consistent = self.ts_deltas.len() + 1 == len
            && self.high.len() == len
            && self.low.len() == len
            && self.close.len() == len
            && self.volume.len() == len
            && self.trade_count.len() == len
            && self.vwap.len() == len
            && self.source_index.len() == len;
        if !consistent {
            return Err(WarehouseError::CorruptSegment(format!(
                "column lengths disagree for {symbol}/{timeframe}"
            )));
        }

        let mut rows = Vec::with_capacity(len);
        let mut ts_us = self.first_ts_us;
        for index in 0..len {
            if index > 0 {
                ts_us -= self.ts_deltas[index - 1];
            }
            let source = self
                .sources
                .get(usize::from(self.source_index[index]))
                .ok_or_else(|| {
                    WarehouseError::CorruptSegment(format!(
                        "source index out of range for {symbol}/{timeframe}"
                    ))
                })?;
            rows.push(BarRow {
                symbol: symbol.to_string(),
                timeframe: timeframe.to_string(),
                ts_us,
                open: self.open[index],
                high: self.high[index],
                low: self.low[index],
                close: self.close[index],
                volume: self.volume[index],
                trade_count: self.trade_count[index],
                vwap: self.vwap[index],
                source: source.clone(),
            });
        }

        Ok(rows)
    }

    /// Serialize for the `payload` BLOB column.
    ///
    /// # Errors
    /// Returns an error if serialization fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, WarehouseError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse a `payload` BLOB.
    ///
    /// # Errors
    /// Returns an error if the bytes are not a valid payload.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WarehouseError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(ts_us: i64, close: f64, source: &str) -> BarRow {
        BarRow {
            symbol: String::from("AAPL"),
            timeframe: String::from("1m"),
            ts_us,
            open: close - 0.5,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 1_000,
            trade_count: if ts_us % 2 == 0 { Some(12) } else { None },
            vwap: Some(close - 0.123_456),
            source: source.to_string(),
        }
    }

    #[test]
    fn encode_orders_newest_first_and_decodes_exactly() {
        let rows = vec![
            row(60_000_000, 101.25, "yahoo"),
            row(180_000_000, 99.000_001, "alpaca"),
            row(120_000_000, 100.5, "yahoo"),
        ];

        let payload = SegmentPayload::encode(&rows).expect("encode");
        assert_eq!(payload.max_ts_us(), 180_000_000);
        assert_eq!(payload.min_ts_us(), 60_000_000);
        assert_eq!(payload.sources.len(), 2);

        let bytes = payload.to_bytes().expect("bytes");
        let decoded = SegmentPayload::from_bytes(&bytes)
            .expect("parse")
            .decode("AAPL", "1m")
            .expect("decode");

        let mut expected = rows;
        expected.sort_by(|left, right| right.ts_us.cmp(&left.ts_us));
        assert_eq!(decoded, expected);
    }

    #[test]
    fn empty_segment_is_rejected() {
        let error = SegmentPayload::encode(&[]).expect_err("empty must fail");
        assert!(matches!(error, WarehouseError::InvalidInput(_)));
    }

    #[test]
    fn truncated_columns_are_reported_as_corrupt() {
        let mut payload =
            SegmentPayload::encode(&[row(60_000_000, 10.0, "yahoo"), row(0, 11.0, "yahoo")])
                .expect("encode");
        payload.volume.pop();

        let error = payload.decode("AAPL", "1m").expect_err("corrupt");
        assert!(matches!(error, WarehouseError::CorruptSegment(_)));
    }
}
