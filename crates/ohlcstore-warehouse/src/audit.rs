//! Ingestion job audit trail and quality records.

use ::duckdb::ToSql;

use crate::models::{JobRow, QualityRow};
use crate::{count_to_i64, AccessMode, Warehouse, WarehouseError};

const JOB_COLUMNS: &str = "job_id, symbol, timeframe, provider, epoch_us(range_start), \
     epoch_us(range_end), rows_inserted, rows_updated, rows_rejected, retries, status, \
     error_detail, duration_ms, epoch_us(started_at)";

const QUALITY_COLUMNS: &str = "symbol, timeframe, CAST(check_date AS VARCHAR), \
     epoch_us(range_start), epoch_us(range_end), total_bars, missing_count, duplicate_count, \
     outlier_count, zero_volume_count, score, issues";

impl Warehouse {
    /// Append one ingestion job record.
    ///
    /// # Errors
    /// Returns an error if the insert fails, including a duplicate `job_id`.
    pub fn insert_job(&self, job: &JobRow) -> Result<(), WarehouseError> {
        let connection = self.acquire(AccessMode::ReadWrite)?;
        let params: [&dyn ToSql; 14] = [
            &job.job_id,
            &job.symbol,
            &job.timeframe,
            &job.provider,
            &job.range_start_us,
            &job.range_end_us,
            &job.rows_inserted,
            &job.rows_updated,
            &job.rows_rejected,
            &job.retries,
            &job.status,
            &job.error_detail,
            &job.duration_ms,
            &job.started_at_us,
        ];
        connection.execute(
            "INSERT INTO ingestion_jobs \
             (job_id, symbol, timeframe, provider, range_start, range_end, rows_inserted, \
              rows_updated, rows_rejected, retries, status, error_detail, duration_ms, started_at) \
             VALUES (?, ?, ?, ?, make_timestamp(?::BIGINT), make_timestamp(?::BIGINT), ?, ?, ?, ?, \
              ?, ?, ?, make_timestamp(?::BIGINT))",
            params.as_slice(),
        )?;
        Ok(())
    }

    /// Look up a job by id.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub fn get_job(&self, job_id: &str) -> Result<Option<JobRow>, WarehouseError> {
        let connection = self.acquire(AccessMode::ReadOnly)?;
        let sql = format!("SELECT {JOB_COLUMNS} FROM ingestion_jobs WHERE job_id = ?");
        let mut statement = connection.prepare(sql.as_str())?;
        let mut rows = statement.query([job_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(read_job_row(row)?)),
            None => Ok(None),
        }
    }

    /// Most recent jobs for a series, newest first.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub fn recent_jobs(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: usize,
    ) -> Result<Vec<JobRow>, WarehouseError> {
        let connection = self.acquire(AccessMode::ReadOnly)?;
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM ingestion_jobs \
             WHERE symbol = ? AND timeframe = ? \
             ORDER BY started_at DESC, recorded_at DESC LIMIT ?"
        );
        let limit = count_to_i64(limit);
        let params: [&dyn ToSql; 3] = [&symbol, &timeframe, &limit];
        let mut statement = connection.prepare(sql.as_str())?;
        let jobs = statement
            .query_map(params.as_slice(), read_job_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(jobs)
    }

    /// Store a quality record, superseding any record with the same
    /// symbol, timeframe and check date.
    ///
    /// # Errors
    /// Returns an error if the write fails.
    pub fn upsert_quality(&self, record: &QualityRow) -> Result<(), WarehouseError> {
        let connection = self.acquire(AccessMode::ReadWrite)?;
        let params: [&dyn ToSql; 12] = [
            &record.symbol,
            &record.timeframe,
            &record.check_date,
            &record.range_start_us,
            &record.range_end_us,
            &record.total_bars,
            &record.missing_count,
            &record.duplicate_count,
            &record.outlier_count,
            &record.zero_volume_count,
            &record.score,
            &record.issues,
        ];
        connection.execute(
            "INSERT INTO quality_records \
             (symbol, timeframe, check_date, range_start, range_end, total_bars, missing_count, \
              duplicate_count, outlier_count, zero_volume_count, score, issues, checked_at) \
             VALUES (?, ?, CAST(? AS DATE), make_timestamp(?::BIGINT), make_timestamp(?::BIGINT), \
              ?, ?, ?, ?, ?, ?, ?, CURRENT_TIMESTAMP) \
             ON CONFLICT (symbol, timeframe, check_date) DO UPDATE SET \
             range_start = excluded.range_start, range_end = excluded.range_end, \
             total_bars = excluded.total_bars, missing_count = excluded.missing_count, \
             duplicate_count = excluded.duplicate_count, outlier_count = excluded.outlier_count, \
             zero_volume_count = excluded.zero_volume_count, score = excluded.score, \
             issues = excluded.issues, checked_at = now()",
            params.as_slice(),
        )?;
        Ok(())
    }

    /// The most recent quality record of a series.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub fn latest_quality(
        &self,
        symbol: &str,
        timeframe: &str,
    ) -> Result<Option<QualityRow>, WarehouseError> {
        let connection = self.acquire(AccessMode::ReadOnly)?;
        let sql = format!(
            "SELECT {QUALITY_COLUMNS} FROM quality_records \
             WHERE symbol = ? AND timeframe = ? \
             ORDER BY check_date DESC, checked_at DESC LIMIT 1"
        );
        let params: [&dyn ToSql; 2] = [&symbol, &timeframe];
        let mut statement = connection.prepare(sql.as_str())?;
        let mut rows = statement.query(params.as_slice())?;
        match rows.next()? {
            Some(row) => Ok(Some(read_quality_row(row)?)),
            None => Ok(None),
        }
    }
}

fn read_job_row(row: &::duckdb::Row<'_>) -> Result<JobRow, ::duckdb::Error> {
    Ok(JobRow {
        job_id: row.get(0)?,
        symbol: row.get(1)?,
        timeframe: row.get(2)?,
        provider: row.get(3)?,
        range_start_us: row.get(4)?,
        range_end_us: row.get(5)?,
        rows_inserted: row.get(6)?,
        rows_updated: row.get(7)?,
        rows_rejected: row.get(8)?,
        retries: row.get(9)?,
        status: row.get(10)?,
        error_detail: row.get(11)?,
        duration_ms: row.get(12)?,
        started_at_us: row.get(13)?,
    })
}

fn read_quality_row(row: &::duckdb::Row<'_>) -> Result<QualityRow, ::duckdb::Error> {
    Ok(QualityRow {
        symbol: row.get(0)?,
        timeframe: row.get(1)?,
        check_date: row.get(2)?,
        range_start_us: row.get(3)?,
        range_end_us: row.get(4)?,
        total_bars: row.get(5)?,
        missing_count: row.get(6)?,
        duplicate_count: row.get(7)?,
        outlier_count: row.get(8)?,
        zero_volume_count: row.get(9)?,
        score: row.get(10)?,
        issues: row.get(11)?,
    })
}
