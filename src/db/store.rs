//! SQLite database store implementation.

use crate::device::DeviceStatus;

use chrono::{DateTime, NaiveDateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, Connection, Result as SqlResult, Row};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

use super::models::*;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f";

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
}

/// Thread-safe database store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<(), DbError> {
        let conn = self.conn.lock();
        conn.execute_batch(include_str!("../../migrations/000001_init.up.sql"))
            .map_err(|e| DbError::Migration(format!("Migration 1 failed: {}", e)))?;
        Ok(())
    }

    // --- History ---

    /// Append history records in one transaction.
    pub fn append_history(&self, records: &[HistoryRecord]) -> Result<(), DbError> {
        if records.is_empty() {
            return Ok(());
        }

        let conn = self.conn.lock();
        let tx = conn.unchecked_transaction()?;

        {
            let mut stmt = tx.prepare(
                "INSERT INTO history (label, address, timestamp, status) VALUES (?1, ?2, ?3, ?4)",
            )?;

            for r in records {
                stmt.execute(params![
                    r.label,
                    r.address,
                    format_db_time(r.time),
                    r.status.as_str(),
                ])?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// Read history in chronological order.
    pub fn query_history(&self, query: &HistoryQuery) -> Result<Vec<HistoryRecord>, DbError> {
        let (where_clause, mut args) = filter_clause(query);
        let mut sql = format!(
            "SELECT id, label, address, timestamp, status FROM history{} ORDER BY timestamp ASC, id ASC",
            where_clause
        );
        if let Some(limit) = query.limit {
            sql.push_str(" LIMIT ?");
            args.push(Value::Integer(i64::from(limit)));
        }

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let records = stmt
            .query_map(params_from_iter(args), history_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(records)
    }

    pub fn count_history(&self) -> Result<i64, DbError> {
        let conn = self.conn.lock();
        Ok(conn.query_row("SELECT COUNT(*) FROM history", [], |r| r.get(0))?)
    }

    /// Per-device online/offline counts over the records matching `query`.
    ///
    /// The address filter and limit are ignored; a report always covers every
    /// device in the period.
    pub fn activity_report(&self, query: &HistoryQuery) -> Result<ActivityReport, DbError> {
        let period = HistoryQuery {
            start: query.start,
            end: query.end,
            ..Default::default()
        };
        let (where_clause, args) = filter_clause(&period);

        let conn = self.conn.lock();

        let (first, last, total): (Option<String>, Option<String>, i64) = conn.query_row(
            &format!("SELECT MIN(timestamp), MAX(timestamp), COUNT(*) FROM history{}", where_clause),
            params_from_iter(args.iter()),
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;

        let mut stmt = conn.prepare(&format!(
            "SELECT label, address,
                    SUM(CASE WHEN status = 'Online' THEN 1 ELSE 0 END),
                    SUM(CASE WHEN status = 'Offline' THEN 1 ELSE 0 END)
             FROM history{}
             GROUP BY address, label
             ORDER BY label ASC, address ASC",
            where_clause
        ))?;

        let devices = stmt
            .query_map(params_from_iter(args.iter()), |row| {
                Ok(DeviceActivity {
                    label: row.get(0)?,
                    address: row.get(1)?,
                    online_count: row.get(2)?,
                    offline_count: row.get(3)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(ActivityReport {
            period_start: first.as_deref().and_then(parse_db_time),
            period_end: last.as_deref().and_then(parse_db_time),
            total_records: total,
            devices,
        })
    }
}

fn filter_clause(query: &HistoryQuery) -> (String, Vec<Value>) {
    let mut conditions = Vec::new();
    let mut args = Vec::new();

    if let Some(address) = &query.address {
        conditions.push("address = ?");
        args.push(Value::Text(address.trim().to_ascii_lowercase()));
    }
    if let Some(start) = query.start {
        conditions.push("timestamp >= ?");
        args.push(Value::Text(format_db_time(start)));
    }
    if let Some(end) = query.end {
        conditions.push("timestamp < ?");
        args.push(Value::Text(format_db_time(end)));
    }

    if conditions.is_empty() {
        (String::new(), args)
    } else {
        (format!(" WHERE {}", conditions.join(" AND ")), args)
    }
}

fn history_from_row(row: &Row<'_>) -> SqlResult<HistoryRecord> {
    let time_str: String = row.get(3)?;
    let status_str: String = row.get(4)?;
    let status = status_str
        .parse::<DeviceStatus>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(4, Type::Text, e.into()))?;

    Ok(HistoryRecord {
        id: row.get(0)?,
        label: row.get(1)?,
        address: row.get(2)?,
        time: parse_db_time(&time_str).unwrap_or_else(Utc::now),
        status,
    })
}

/// Fixed-width UTC timestamp, so string order is time order.
fn format_db_time(time: DateTime<Utc>) -> String {
    time.format(TIME_FORMAT).to_string()
}

/// Parse a datetime string from the database.
fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [TIME_FORMAT, "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use tempfile::NamedTempFile;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap() + ChronoDuration::seconds(secs)
    }

    fn seed(store: &Store) {
        store
            .append_history(&[
                HistoryRecord::new("Router", "10.0.0.1", at(0), DeviceStatus::Offline),
                HistoryRecord::new("NAS", "10.0.0.2", at(1), DeviceStatus::Online),
                HistoryRecord::new("Router", "10.0.0.1", at(6), DeviceStatus::Online),
                HistoryRecord::new("Router", "10.0.0.1", at(60), DeviceStatus::Offline),
            ])
            .unwrap();
    }

    #[test]
    fn test_append_and_query() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        seed(&store);

        assert_eq!(store.count_history().unwrap(), 4);

        let all = store.query_history(&HistoryQuery::default()).unwrap();
        assert_eq!(all.len(), 4);
        assert!(all.windows(2).all(|w| w[0].time <= w[1].time));
        assert!(all.iter().all(|r| r.id > 0));
        assert_eq!(all[0].time, at(0));
        assert_eq!(all[0].status, DeviceStatus::Offline);
    }

    #[test]
    fn test_query_filters() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        seed(&store);

        let router = store
            .query_history(&HistoryQuery {
                address: Some("10.0.0.1".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(router.len(), 3);

        let window = store
            .query_history(&HistoryQuery {
                address: Some("10.0.0.1".to_string()),
                start: Some(at(1)),
                end: Some(at(60)),
                limit: None,
            })
            .unwrap();
        assert_eq!(window.len(), 1);
        assert_eq!(window[0].status, DeviceStatus::Online);

        let limited = store
            .query_history(&HistoryQuery {
                limit: Some(2),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(limited.len(), 2);
    }

    #[test]
    fn test_activity_report() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        seed(&store);

        let report = store.activity_report(&HistoryQuery::default()).unwrap();
        assert_eq!(report.total_records, 4);
        assert_eq!(report.period_start, Some(at(0)));
        assert_eq!(report.period_end, Some(at(60)));
        assert_eq!(
            report.devices,
            vec![
                DeviceActivity {
                    label: "NAS".to_string(),
                    address: "10.0.0.2".to_string(),
                    online_count: 1,
                    offline_count: 0,
                },
                DeviceActivity {
                    label: "Router".to_string(),
                    address: "10.0.0.1".to_string(),
                    online_count: 1,
                    offline_count: 2,
                },
            ]
        );
    }

    #[test]
    fn test_empty_report() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();

        let report = store.activity_report(&HistoryQuery::default()).unwrap();
        assert_eq!(report.total_records, 0);
        assert!(report.period_start.is_none());
        assert!(report.devices.is_empty());
    }

    #[test]
    fn test_reopen_keeps_history() {
        let tmp = NamedTempFile::new().unwrap();
        {
            let store = Store::new(tmp.path()).unwrap();
            seed(&store);
        }
        let store = Store::new(tmp.path()).unwrap();
        assert_eq!(store.count_history().unwrap(), 4);
    }
}
