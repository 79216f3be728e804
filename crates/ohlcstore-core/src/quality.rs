//! Quality Monitor: gap, near-duplicate, outlier and zero-volume checks.

use ohlcstore_warehouse::QualityRow;

use crate::config::QualitySettings;
use crate::error::CoreError;
use crate::store::BarStore;
use crate::{
    Bar, OutlierMetric, QualityIssue, QualityRecord, Symbol, Timeframe, UtcDateTime,
    ValidationError,
};

/// Fewest prior bars an outlier check will judge against.
const MIN_OUTLIER_HISTORY: usize = 5;

#[derive(Clone)]
pub struct QualityMonitor {
    store: BarStore,
    settings: QualitySettings,
}

impl QualityMonitor {
    pub fn new(store: BarStore, settings: QualitySettings) -> Self {
        Self { store, settings }
    }

    pub fn settings(&self) -> &QualitySettings {
        &self.settings
    }

    /// Scan `[start, end)` and persist the record under today's date.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError`] for an empty range or a storage failure.
    pub async fn scan(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        start: UtcDateTime,
        end: UtcDateTime,
    ) -> Result<QualityRecord, CoreError> {
        self.scan_as_of(symbol, timeframe, start, end, UtcDateTime::now())
            .await
    }

    /// Like [`QualityMonitor::scan`], recorded under the date of `as_of`.
    /// A later scan with the same date supersedes this one.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError`] for an empty range or a storage failure.
    pub async fn scan_as_of(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        start: UtcDateTime,
        end: UtcDateTime,
        as_of: UtcDateTime,
    ) -> Result<QualityRecord, CoreError> {
        if start >= end {
            return Err(ValidationError::EmptyRange.into());
        }
        let bars = self.store.query(symbol, timeframe, start, end).await?;
        let record = assess(
            symbol,
            timeframe,
            start,
            end,
            &bars,
            &self.settings,
            as_of.date_string(),
        );

        let row = record_to_row(&record)?;
        self.store
            .run_blocking(move |warehouse| warehouse.upsert_quality(&row))
            .await?;

        tracing::info!(
            symbol = %symbol,
            timeframe = %timeframe,
            total_bars = record.total_bars,
            missing = record.missing_count,
            duplicates = record.duplicate_count,
            outliers = record.outlier_count,
            zero_volume = record.zero_volume_count,
            score = record.score,
            "quality scan finished"
        );
        Ok(record)
    }

    /// Scan several symbols; one failure does not stop the rest.
    pub async fn scan_all(
        &self,
        symbols: &[Symbol],
        timeframe: Timeframe,
        start: UtcDateTime,
        end: UtcDateTime,
    ) -> Vec<(Symbol, Result<QualityRecord, CoreError>)> {
        let mut results = Vec::with_capacity(symbols.len());
        for symbol in symbols {
            let result = self.scan(symbol, timeframe, start, end).await;
            if let Err(error) = &result {
                tracing::warn!(symbol = %symbol, %error, "quality scan failed");
            }
            results.push((symbol.clone(), result));
        }
        results
    }

    /// Most recent stored record of a series.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError`] if the read fails or the row cannot be decoded.
    pub async fn latest_record(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
    ) -> Result<Option<QualityRecord>, CoreError> {
        let symbol_key = symbol.as_str().to_owned();
        let row = self
            .store
            .run_blocking(move |warehouse| {
                warehouse.latest_quality(&symbol_key, timeframe.as_str())
            })
            .await?;
        row.map(row_to_record).transpose()
    }
}

/// Compute the quality record of ascending `bars`.
pub fn assess(
    symbol: &Symbol,
    timeframe: Timeframe,
    start: UtcDateTime,
    end: UtcDateTime,
    bars: &[Bar],
    settings: &QualitySettings,
    check_date: String,
) -> QualityRecord {
    let interval = timeframe.duration_us();
    let gap_threshold = interval as f64 * settings.gap_tolerance;
    let mut issues = Vec::new();
    let mut missing_count = 0;
    let mut duplicate_count = 0;

    for pair in bars.windows(2) {
        let (previous, current) = (&pair[0], &pair[1]);
        let elapsed = current.time.unix_micros() - previous.time.unix_micros();
        if elapsed > 0 && elapsed < interval {
            duplicate_count += 1;
            issues.push(QualityIssue::NearDuplicate {
                first: previous.time,
                second: current.time,
            });
        } else if elapsed as f64 > gap_threshold {
            let intervals = (elapsed as f64 / interval as f64).round() as usize;
            let missing = intervals.saturating_sub(1).max(1);
            missing_count += missing;
            issues.push(QualityIssue::Gap {
                after: previous.time,
                before: current.time,
                missing,
            });
        }
    }

    let outlier_count = flag_outliers(bars, settings, &mut issues);

    let mut zero_volume_count = 0;
    for bar in bars.iter().filter(|bar| bar.volume == 0) {
        zero_volume_count += 1;
        issues.push(QualityIssue::ZeroVolume { time: bar.time });
    }

    let total_bars = bars.len();
    let score = if total_bars == 0 {
        0.0
    } else {
        let expected = (total_bars + missing_count) as f64;
        let defects = (missing_count + duplicate_count + outlier_count) as f64;
        (1.0 - defects / expected).clamp(0.0, 1.0)
    };

    QualityRecord {
        symbol: symbol.clone(),
        timeframe,
        check_date,
        range_start: start,
        range_end: end,
        total_bars,
        missing_count,
        duplicate_count,
        outlier_count,
        zero_volume_count,
        score,
        issues,
    }
}

/// Flag bars far outside the trailing window or jumping too far from the
/// previous close; returns bars flagged.
fn flag_outliers(bars: &[Bar], settings: &QualitySettings, issues: &mut Vec<QualityIssue>) -> usize {
    let window = settings.outlier_window.max(2);
    let min_history = window.min(MIN_OUTLIER_HISTORY);
    let mut flagged = 0;

    for (index, bar) in bars.iter().enumerate() {
        let mut findings = Vec::new();

        if let Some(change) = index
            .checked_sub(1)
            .and_then(|previous| close_change(bars[previous].close, bar.close))
            .filter(|change| change.abs() > settings.max_price_change)
        {
            findings.push((OutlierMetric::PriceJump, change));
        }

        let history = &bars[index.saturating_sub(window)..index];
        if history.len() >= min_history {
            let range_score = z_score(
                bar.high - bar.low,
                history.iter().map(|prior| prior.high - prior.low),
            );
            let volume_score = z_score(
                bar.volume as f64,
                history.iter().map(|prior| prior.volume as f64),
            );
            for (metric, score) in [
                (OutlierMetric::Range, range_score),
                (OutlierMetric::Volume, volume_score),
            ] {
                if let Some(z_score) = score.filter(|z| z.abs() > settings.outlier_threshold) {
                    findings.push((metric, z_score));
                }
            }
        }

        if !findings.is_empty() {
            flagged += 1;
        }
        issues.extend(findings.into_iter().map(|(metric, z_score)| QualityIssue::Outlier {
            time: bar.time,
            metric,
            z_score,
        }));
    }
    flagged
}

/// Signed fractional move from `previous` to `current`.
fn close_change(previous: f64, current: f64) -> Option<f64> {
    (previous > 0.0).then(|| current / previous - 1.0)
}

/// Standard score against the sample; `None` when the sample is flat.
fn z_score(value: f64, sample: impl Iterator<Item = f64> + Clone) -> Option<f64> {
    let count = sample.clone().count();
    if count < 2 {
        return None;
    }
    let n = count as f64;
    let mean = sample.clone().sum::<f64>() / n;
    let variance = sample.map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1.0);
    let deviation = variance.sqrt();
    (deviation > f64::EPSILON).then(|| (value - mean) / deviation)
}

fn record_to_row(record: &QualityRecord) -> Result<QualityRow, CoreError> {
    let count = |value: usize| i64::try_from(value).unwrap_or(i64::MAX);
    Ok(QualityRow {
        symbol: record.symbol.as_str().to_owned(),
        timeframe: record.timeframe.as_str().to_owned(),
        check_date: record.check_date.clone(),
        range_start_us: record.range_start.unix_micros(),
        range_end_us: record.range_end.unix_micros(),
        total_bars: count(record.total_bars),
        missing_count: count(record.missing_count),
        duplicate_count: count(record.duplicate_count),
        outlier_count: count(record.outlier_count),
        zero_volume_count: count(record.zero_volume_count),
        score: record.score,
        issues: serde_json::to_string(&record.issues)?,
    })
}

fn row_to_record(row: QualityRow) -> Result<QualityRecord, CoreError> {
    let count = |value: i64| usize::try_from(value).unwrap_or_default();
    Ok(QualityRecord {
        symbol: Symbol::parse(&row.symbol)?,
        timeframe: row.timeframe.parse()?,
        range_start: UtcDateTime::from_unix_micros(row.range_start_us)?,
        range_end: UtcDateTime::from_unix_micros(row.range_end_us)?,
        total_bars: count(row.total_bars),
        missing_count: count(row.missing_count),
        duplicate_count: count(row.duplicate_count),
        outlier_count: count(row.outlier_count),
        zero_volume_count: count(row.zero_volume_count),
        score: row.score,
        issues: serde_json::from_str(&row.issues)?,
        check_date: row.check_date,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ProviderId;

    const HOUR_US: i64 = 3_600_000_000;

    fn hourly(hours: &[i64]) -> Vec<Bar> {
        hours
            .iter()
            .map(|hour| {
                Bar::new(
                    UtcDateTime::from_unix_micros(1_700_000_000_000_000 / HOUR_US * HOUR_US + hour * HOUR_US)
                        .expect("time"),
                    Symbol::parse("SPY").expect("symbol"),
                    Timeframe::OneHour,
                    100.0,
                    101.0,
                    99.0,
                    100.5,
                    1_000,
                    ProviderId::Fixture,
                )
                .expect("bar")
            })
            .collect()
    }

    fn run(bars: &[Bar], settings: &QualitySettings) -> QualityRecord {
        let start = bars.first().map_or_else(UtcDateTime::now, |bar| bar.time);
        assess(
            &Symbol::parse("SPY").expect("symbol"),
            Timeframe::OneHour,
            start,
            start.saturating_add(time::Duration::days(30)),
            bars,
            settings,
            String::from("2024-01-01"),
        )
    }

    #[test]
    fn counts_missing_bars_inside_gaps() {
        let record = run(&hourly(&[0, 1, 5, 6]), &QualitySettings::default());

        assert_eq!(record.missing_count, 3);
        assert_eq!(record.total_expected_bars(), 7);
        assert!((record.score - (1.0 - 3.0 / 7.0)).abs() < 1e-12);
    }

    #[test]
    fn wider_tolerance_ignores_short_gaps() {
        let settings = QualitySettings {
            gap_tolerance: 3.0,
            ..QualitySettings::default()
        };
        let record = run(&hourly(&[0, 1, 3, 4, 10]), &settings);

        assert_eq!(record.missing_count, 5);
        assert_eq!(record.issues.len(), 1);
    }

    #[test]
    fn flags_near_duplicates_and_zero_volume() {
        let mut bars = hourly(&[0, 1, 2]);
        bars[2].time = bars[1].time.saturating_add(time::Duration::minutes(10));
        bars[0].volume = 0;

        let record = run(&bars, &QualitySettings::default());

        assert_eq!(record.duplicate_count, 1);
        assert_eq!(record.zero_volume_count, 1);
        assert!(record
            .issues
            .iter()
            .any(|issue| matches!(issue, QualityIssue::NearDuplicate { .. })));
    }

    #[test]
    fn flags_volume_spike_against_trailing_window() {
        let mut bars = hourly(&(0..12).collect::<Vec<_>>());
        for (index, bar) in bars.iter_mut().enumerate() {
            bar.volume = 1_000 + (index as i64 % 3) * 10;
        }
        bars[11].volume = 50_000;

        let record = run(&bars, &QualitySettings::default());

        assert_eq!(record.outlier_count, 1);
        assert!(record.issues.iter().any(|issue| matches!(
            issue,
            QualityIssue::Outlier {
                metric: OutlierMetric::Volume,
                ..
            }
        )));
    }

    #[test]
    fn flags_close_to_close_jump_once_per_bar() {
        let mut bars = hourly(&[0, 1, 2, 3]);
        bars[2].open = 160.0;
        bars[2].high = 161.5;
        bars[2].low = 159.0;
        bars[2].close = 160.8;
        bars[3].close = 160.0;
        bars[3].high = 161.0;

        let record = run(&bars, &QualitySettings::default());

        assert_eq!(record.outlier_count, 1);
        let jumps: Vec<_> = record
            .issues
            .iter()
            .filter_map(|issue| match issue {
                QualityIssue::Outlier {
                    time,
                    metric: OutlierMetric::PriceJump,
                    z_score,
                } => Some((*time, *z_score)),
                _ => None,
            })
            .collect();
        assert_eq!(jumps.len(), 1);
        assert_eq!(jumps[0].0, bars[2].time);
        assert!((jumps[0].1 - 0.6).abs() < 1e-9);
    }

    #[test]
    fn empty_series_scores_zero() {
        let record = run(&[], &QualitySettings::default());
        assert_eq!(record.total_bars, 0);
        assert_eq!(record.score, 0.0);
    }
}
