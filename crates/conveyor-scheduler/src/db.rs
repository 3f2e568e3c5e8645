use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;

use crate::error::Result;

/// Initialise the job schema in `conn`.
///
/// Creates the `jobs` table (idempotent) and the index backing the claim
/// query: per tenant and status, highest priority first, then insertion order.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS jobs (
            seq                  INTEGER PRIMARY KEY AUTOINCREMENT, -- FIFO tie-break
            id                   TEXT    NOT NULL UNIQUE,
            tenant               TEXT    NOT NULL,
            job_type             TEXT    NOT NULL,
            parameters           TEXT    NOT NULL,   -- JSON array of {name, value}
            priority             INTEGER NOT NULL DEFAULT 0,
            status               TEXT    NOT NULL,
            percent_completed    INTEGER NOT NULL DEFAULT 0,
            estimated_completion TEXT,
            last_heartbeat       TEXT,
            expiration_date      TEXT,
            trigger_date         TEXT,
            start_date           TEXT,
            stop_date            TEXT,
            result               TEXT,               -- JSON, succeeded only
            error_detail         TEXT,               -- failed only
            cancel_requested     INTEGER NOT NULL DEFAULT 0,
            created_at           TEXT    NOT NULL,
            updated_at           TEXT    NOT NULL
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_jobs_claim
            ON jobs (tenant, status, priority DESC, seq);
        CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs (status);
        ",
    )?;
    Ok(())
}

/// Fixed-width RFC 3339 (`2026-01-02T03:04:05.000006Z`) so that string
/// comparison in SQL matches chronological order.
pub fn to_sql_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn from_sql_ts(s: &str) -> std::result::Result<DateTime<Utc>, chrono::ParseError> {
    Ok(DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn init_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        init_db(&conn).unwrap();
    }

    #[test]
    fn timestamps_sort_lexically() {
        let whole = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
        let later = whole + chrono::Duration::microseconds(6);
        assert_eq!(to_sql_ts(whole), "2026-01-02T03:04:05.000000Z");
        assert!(to_sql_ts(whole) < to_sql_ts(later));
        assert_eq!(from_sql_ts(&to_sql_ts(later)).unwrap(), later);
    }
}
